//! Subcommands of the `localshare` binary. Each one drives a started
//! [`Node`] and reports progress on the terminal.

pub mod jobs;
pub mod peers;
pub mod receive;
pub mod resume;
pub mod send;

use std::error::Error;

use indicatif::{ProgressBar, ProgressStyle};
use localshare::discovery::Peer;
use localshare::{JobId, JobSnapshot, JobState, Node};
use tokio::time::{sleep, Duration, Instant};

/// How long `send` and `resume` listen for the target's announcements.
pub const DISCOVERY_WAIT: Duration = Duration::from_secs(5);

/// Poll the registry until `query` resolves to one peer.
pub async fn wait_for_peer(node: &Node, query: &str, wait: Duration) -> localshare::Result<Peer> {
    let deadline = Instant::now() + wait;
    loop {
        match node.resolve_peer(query) {
            Ok(peer) => return Ok(peer),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(_) => sleep(Duration::from_millis(200)).await,
        }
    }
}

pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message.into());
    spinner
}

/// Draw a progress bar for the job until it settles.
pub async fn follow(node: &Node, job_id: JobId) -> localshare::Result<JobSnapshot> {
    let mut status = node.watch_job(job_id)?;
    let total = status.borrow().total_size;

    let bar = ProgressBar::new(total.div_ceil(1024));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.black}] {pos}/{len} KB ({eta}) {msg}")
    {
        bar.set_style(style.progress_chars("=>-"));
    }

    loop {
        let snapshot = status.borrow_and_update().clone();
        bar.set_position(snapshot.bytes_done.div_ceil(1024));
        if matches!(snapshot.state, JobState::Completed | JobState::Failed | JobState::Paused) {
            bar.finish_with_message(snapshot.state.to_string());
            return Ok(snapshot);
        }
        bar.set_message(snapshot.state.to_string());
        if status.changed().await.is_err() {
            let snapshot = node.job_status(job_id)?;
            bar.finish_with_message(snapshot.state.to_string());
            return Ok(snapshot);
        }
    }
}

/// Turn a settled snapshot into the command's exit status.
pub fn report(snapshot: &JobSnapshot) -> Result<(), Box<dyn Error>> {
    match snapshot.state {
        JobState::Completed => Ok(()),
        JobState::Paused => Err(format!(
            "transfer paused after {} of {} chunks: {}\nresume with `localshare resume {}`",
            snapshot.completed_chunks,
            snapshot.total_chunks,
            snapshot.error_message.as_deref().unwrap_or("connection lost"),
            snapshot.job_id
        )
        .into()),
        _ => Err(format!(
            "transfer failed: {}",
            snapshot.error_message.as_deref().unwrap_or("unknown error")
        )
        .into()),
    }
}
