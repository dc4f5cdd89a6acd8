use std::error::Error;

use localshare::Node;
use tokio::time::{sleep, Duration};

use super::spinner;

pub async fn run(node: &Node, wait: u64) -> Result<(), Box<dyn Error>> {
    let spinner = spinner("Listening for peers");
    sleep(Duration::from_secs(wait)).await;
    spinner.finish_and_clear();

    let mut peers = node.list_peers();
    if peers.is_empty() {
        println!("No peers found");
        return Ok(());
    }

    peers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    for peer in peers {
        println!("{}  {:<24} {}", peer.id.short(), peer.display_name, peer.address);
    }
    Ok(())
}
