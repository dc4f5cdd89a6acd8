use std::error::Error;
use std::io::{self, Write};

use localshare::networking::local_ip;
use localshare::{Destination, Error as LocalshareError, IncomingOffer, JobState, Node, PayloadKind};

use super::follow;

/// Wait for offers until Ctrl-C, accepting each one into its default
/// destination. Offers are handled one at a time.
pub async fn run(node: &Node, yes: bool) -> Result<(), Box<dyn Error>> {
    println!(
        "Receiving as {} ({}) on port {}",
        node.config().display_name,
        node.peer_id().short(),
        node.listen_addr().port()
    );
    if let Some(ip) = local_ip() {
        println!("LAN address: {ip}");
    }
    println!("Files are saved to {}", node.config().download_dir.display());

    let offers = node.receive_offers();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            offer = offers.next() => match offer {
                Some(offer) => handle(node, offer, yes).await?,
                None => break,
            },
        }
    }
    Ok(())
}

async fn handle(node: &Node, offer: IncomingOffer, yes: bool) -> Result<(), Box<dyn Error>> {
    let from = offer.peer_name.clone().unwrap_or_else(|| offer.peer.short());
    match offer.kind {
        PayloadKind::Text => println!("{} wants to send you a message", from),
        PayloadKind::File => println!(
            "{} wants to send you {} ({} bytes)",
            from, offer.name, offer.total_size
        ),
    }

    if !yes && !confirm().await? {
        node.cancel_job(offer.job_id).await?;
        println!("Declined");
        return Ok(());
    }

    match node.accept_job(offer.job_id, offer.default_destination.clone()) {
        Ok(()) => {}
        Err(e @ LocalshareError::DestinationBusy(_)) => {
            node.cancel_job(offer.job_id).await?;
            println!("Declined: {e}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let snapshot = follow(node, offer.job_id).await?;
    match snapshot.state {
        JobState::Completed => match (&snapshot.text, &offer.default_destination) {
            (Some(text), _) => println!("{text}"),
            (None, Destination::File(path)) => println!("Saved to {}", path.display()),
            (None, Destination::Memory) => {}
        },
        JobState::Paused => println!(
            "Paused at {} of {} chunks; it continues when {} reconnects",
            snapshot.completed_chunks, snapshot.total_chunks, from
        ),
        _ => println!(
            "Failed: {}",
            snapshot.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

async fn confirm() -> io::Result<bool> {
    print!("Accept? [y/N] ");
    io::stdout().flush()?;
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
