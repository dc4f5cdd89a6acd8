use std::error::Error;

use localshare::{JobId, Node};

use super::{follow, report, spinner, wait_for_peer, DISCOVERY_WAIT};

/// Continue a PAUSED send. The peer's current address is preferred; the
/// address the job last used is the fallback.
pub async fn run(node: &Node, job: &str) -> Result<(), Box<dyn Error>> {
    let job_id: JobId = job.parse()?;
    let snapshot = node.job_status(job_id)?;

    let spinner = spinner(format!("Looking for {}", snapshot.peer.short()));
    let found = wait_for_peer(node, &snapshot.peer.to_string(), DISCOVERY_WAIT).await;
    spinner.finish_and_clear();
    if found.is_err() {
        println!("Peer not announcing, trying its last known address");
    }

    let mut status = node.watch_job(job_id)?;
    let _ = status.borrow_and_update();
    node.resume_job(job_id)?;
    println!(
        "Resuming {} at {} of {} chunks",
        snapshot.name, snapshot.completed_chunks, snapshot.total_chunks
    );

    // The next snapshot is either IN_PROGRESS or the outcome of a failed dial.
    let _ = status.changed().await;

    let snapshot = follow(node, job_id).await?;
    report(&snapshot)
}
