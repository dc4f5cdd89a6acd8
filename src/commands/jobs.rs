use std::error::Error;

use localshare::{JobId, Node};

pub fn list(node: &Node) -> Result<(), Box<dyn Error>> {
    let mut jobs = node.jobs();
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }

    jobs.sort_by(|a, b| a.name.cmp(&b.name));
    for job in jobs {
        println!(
            "{}  {:?} {:<5} {:<11} {}/{} chunks  peer {}  {}",
            job.job_id,
            job.direction,
            job.kind.to_string(),
            job.state.to_string(),
            job.completed_chunks,
            job.total_chunks,
            job.peer.short(),
            job.name
        );
    }
    Ok(())
}

pub async fn discard(node: &Node, job: &str) -> Result<(), Box<dyn Error>> {
    let job_id: JobId = job.parse()?;
    node.discard_job(job_id).await?;
    println!("Discarded {}", job_id.short());
    Ok(())
}
