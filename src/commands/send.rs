use std::error::Error;
use std::path::PathBuf;

use localshare::Node;

use super::{follow, report, spinner, wait_for_peer, DISCOVERY_WAIT};

pub enum Outgoing {
    Text(String),
    File(PathBuf),
}

/// Find `target` on the LAN, offer it the payload and follow the transfer.
pub async fn run(node: &Node, target: &str, payload: Outgoing) -> Result<(), Box<dyn Error>> {
    if let Outgoing::File(path) = &payload {
        if !path.is_file() {
            return Err(format!("Not a file: {}", path.display()).into());
        }
    }

    let spinner = spinner(format!("Looking for {target}"));
    let peer = wait_for_peer(node, target, DISCOVERY_WAIT).await;
    spinner.finish_and_clear();
    let peer = peer?;

    let job_id = match payload {
        Outgoing::Text(message) => node.send_text(peer.id, message).await?,
        Outgoing::File(path) => node.send_file(peer.id, path).await?,
    };
    println!(
        "Offering job {} to {} ({}), waiting for them to accept",
        job_id.short(),
        peer.display_name,
        peer.address
    );

    let snapshot = follow(node, job_id).await?;
    report(&snapshot)
}
