//! # Transfer engine
//!
//! Moves one payload across one established session.
//!
//! Sender:
//! - seals the `Offer`, waits for `Accept` (which lists chunks the receiver
//!   already holds) and only sends what is missing
//! - keeps at most `window` chunk frames unacknowledged; every sealed frame
//!   stays in an outbox until a cumulative `Ack` covers it
//! - on `Retransmit { from_seq }` or when the retry deadline passes, resends
//!   the stored frames byte for byte (go-back-N)
//!
//! Receiver:
//! - applies frames strictly in sequence, writes each chunk at its offset
//!   and acknowledges it
//! - keeps its recent sealed frames so the sender can ask for a replay when
//!   one of them fails to open
//! - gives up once the sender has been silent for the idle timeout
//! - on `Complete`, recomputes the content hash from the written output and
//!   sends `Hashing` keep-alives while it runs
//!
//! On either side a frame that fails authentication is dropped and a single
//! `Retransmit` is requested for the awaited sequence number; stale
//! duplicates are ignored or acknowledged again.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::job::{JobSnapshot, JobState, PayloadKind, RetryDecision, RetryState, TransferJob};
use super::messages::{TransferHeader, TransferMessage};
use super::payload::{Payload, Sink};
use super::store::{JobStore, PersistedJob};
use crate::config::Config;
use crate::error::{AuthenticationError, Error, IntegrityError, Result, TimeoutError, TransportError};
use crate::session::{Inbound, Session, SessionReader, SessionWriter, DEFAULT_REPLAY_FRAMES};

/// Receiver persists its bitmap after this many newly written chunks.
const CHECKPOINT_EVERY: u32 = 32;


/// Shortest interval between `Hashing` keep-alives.
const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub window: usize,
    pub chunk_timeout: Duration,
    pub max_retries: u32,
    pub offer_timeout: Duration,
}

impl TransferSettings {
    /// How long a receiver waits for the next frame: as long as the sender
    /// keeps retrying before it gives up.
    pub fn idle_timeout(&self) -> Duration {
        self.chunk_timeout * (self.max_retries + 1)
    }

    fn replay_frames(&self) -> usize {
        (self.window * 8).max(DEFAULT_REPLAY_FRAMES)
    }

    fn keepalive(&self) -> Duration {
        (self.chunk_timeout / 2).max(MIN_KEEPALIVE)
    }
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            window: config.window,
            chunk_timeout: config.chunk_timeout,
            max_retries: config.max_retries,
            offer_timeout: config.offer_timeout,
        }
    }
}

/// Writes a job's resumable state to the [`JobStore`].
#[derive(Clone)]
pub struct Checkpoint {
    pub store: Arc<JobStore>,
    pub address: Option<SocketAddr>,
    /// Source (send) or destination (receive) path.
    pub path: PathBuf,
}

impl Checkpoint {
    /// Save the job, or drop its record once it has completed.
    pub async fn save(&self, job: &TransferJob) {
        let saved = if job.state == JobState::Completed {
            self.store.remove(&job.id()).await
        } else {
            self.store
                .save(&PersistedJob::from_job(job, self.address, self.path.clone()))
                .await
        };
        if let Err(e) = saved {
            warn!("Failed to persist job {}: {}", job.id().short(), e);
        }
    }
}

/// Everything an engine invocation needs besides the session and the job.
pub struct TransferContext {
    pub settings: TransferSettings,
    pub cancel: CancellationToken,
    pub status: watch::Sender<JobSnapshot>,
    pub checkpoint: Option<Checkpoint>,
}

impl TransferContext {
    fn publish(&self, job: &TransferJob) {
        self.status.send_replace(job.snapshot());
    }

    async fn checkpoint(&self, job: &TransferJob) {
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.save(job).await;
        }
    }
}

/// Record the outcome of a run on the job exactly once.
pub(crate) async fn conclude(job: &mut TransferJob, result: Result<()>, ctx: &TransferContext) -> Result<()> {
    if let Err(e) = &result {
        job.record_failure(e);
    }
    ctx.checkpoint(job).await;
    ctx.publish(job);

    let id = job.id().short();
    match job.state {
        JobState::Completed => info!(
            "Job {} COMPLETED: {} bytes {:?}",
            id, job.header.total_size, job.direction
        ),
        JobState::Paused => warn!(
            "Job {} PAUSED at chunk {:?}: {}",
            id,
            job.completed.first_missing(),
            result.as_ref().err().map(ToString::to_string).unwrap_or_default()
        ),
        _ => info!(
            "Job {} FAILED: {}",
            id,
            result.as_ref().err().map(ToString::to_string).unwrap_or_default()
        ),
    }
    result
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A frame from the receiver, as the read task hands it over.
enum Received {
    Message(TransferMessage),
    /// The frame did not open. `expected` is the sequence still awaited.
    Dropped { expected: u64, error: AuthenticationError },
}

/// Forward opened frames to the sender loop so it can wait on messages and
/// timers together without losing a partially read frame.
async fn read_loop<R>(mut reader: SessionReader<R>, tx: mpsc::Sender<Result<Received>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let forwarded = match reader.recv::<TransferMessage>().await {
            Ok(Inbound::Message { message, .. }) => Ok(Received::Message(message)),
            Ok(Inbound::Rejected(error)) => Ok(Received::Dropped {
                expected: reader.expected_sequence(),
                error,
            }),
            Ok(Inbound::Closed) => Err(TransportError::Closed.into()),
            Err(e) => Err(e.into()),
        };
        let last = forwarded.is_err();
        if tx.send(forwarded).await.is_err() || last {
            break;
        }
    }
}

/// Unwrap a forwarded frame. A dropped frame yields `None` after asking the
/// receiver to replay from the awaited sequence, once per sequence. The
/// request itself goes into `outbox` so it can be sent again too.
async fn next_message<W>(
    item: Option<Result<Received>>,
    writer: &mut SessionWriter<W>,
    outbox: &mut BTreeMap<u64, Outgoing>,
    requested: &mut Option<u64>,
) -> Result<Option<TransferMessage>>
where
    W: AsyncWrite + Unpin,
{
    match item {
        Some(Ok(Received::Message(message))) => Ok(Some(message)),
        Some(Ok(Received::Dropped { expected, error })) => {
            let stale = matches!(error, AuthenticationError::UnexpectedSequence { got, .. } if got < expected);
            if !stale && *requested != Some(expected) {
                debug!("Dropped frame from receiver ({}), requesting replay from {}", error, expected);
                let (seq, frame) = writer.seal(&TransferMessage::Retransmit { from_seq: expected })?;
                writer.write_sealed(&frame).await?;
                outbox.insert(seq, Outgoing { frame, index: None });
                *requested = Some(expected);
            }
            Ok(None)
        }
        Some(Err(e)) => Err(e),
        None => Err(TransportError::Closed.into()),
    }
}

fn unexpected(message: &TransferMessage) -> Error {
    TransportError::Codec(format!("unexpected {} message", message.name())).into()
}

/// A sealed frame kept for retransmission until acknowledged.
struct Outgoing {
    frame: Vec<u8>,
    index: Option<u32>,
}

/// Send `payload` for `job` over `session`.
///
/// The job must be PENDING (first attempt) or PAUSED (resume). On return it
/// is COMPLETED, PAUSED or FAILED and a final snapshot has been published.
pub async fn send<S>(session: Session<S>, job: &mut TransferJob, payload: &Payload, ctx: &TransferContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let result = run_send(session, job, payload, ctx).await;
    conclude(job, result, ctx).await
}

async fn run_send<S>(session: Session<S>, job: &mut TransferJob, payload: &Payload, ctx: &TransferContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (info, reader, mut writer) = session.into_split();
    let (tx, mut inbound) = mpsc::channel(64);
    let _reader = AbortOnDrop(tokio::spawn(read_loop(reader, tx)));
    let header = job.header.clone();
    job.retry = RetryState::new(ctx.settings.chunk_timeout, ctx.settings.max_retries);
    let mut requested: Option<u64> = None;

    let mut outbox: BTreeMap<u64, Outgoing> = BTreeMap::new();
    let (offer_seq, frame) = writer.seal(&TransferMessage::Offer(header.clone()))?;
    writer.write_sealed(&frame).await?;
    outbox.insert(offer_seq, Outgoing { frame, index: None });
    debug!("Job {} offered in session {}", job.id().short(), info.short_id());

    let deadline = Instant::now() + ctx.settings.offer_timeout;
    let completed = loop {
        let item = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = writer.send(&TransferMessage::Cancel).await;
                return Err(Error::Cancelled);
            }
            _ = sleep_until(deadline) => {
                return Err(TimeoutError::Offer(ctx.settings.offer_timeout).into());
            }
            item = inbound.recv() => item,
        };
        let Some(message) = next_message(item, &mut writer, &mut outbox, &mut requested).await? else {
            continue;
        };
        match message {
            TransferMessage::Accept { completed } => break completed,
            TransferMessage::Reject { reason } => return Err(Error::Rejected(reason)),
            TransferMessage::Busy => return Err(TransportError::Busy.into()),
            TransferMessage::Retransmit { from_seq } => {
                job.retransmissions += resend(&mut writer, &outbox, from_seq).await?;
            }
            TransferMessage::Cancel => return Err(Error::Cancelled),
            other => return Err(unexpected(&other)),
        }
    };

    if !completed.same_shape(&job.completed) {
        return Err(TransportError::Codec("accepted bitmap does not match the offer".into()).into());
    }
    outbox.remove(&offer_seq);
    job.completed = completed;
    job.transition(JobState::InProgress)?;
    job.retry.disarm();
    ctx.checkpoint(job).await;
    ctx.publish(job);

    let mut pending: VecDeque<u32> = job.completed.missing().collect();
    debug!(
        "Job {}: {} of {} chunks to send",
        job.id().short(),
        pending.len(),
        header.total_chunks()
    );
    let mut source = payload.reader().await?;
    let mut in_flight = 0usize;
    let mut completing = false;

    loop {
        while in_flight < ctx.settings.window {
            let Some(index) = pending.pop_front() else { break };
            let data = source.read_chunk(&header, index).await?;
            let (seq, frame) = writer.seal(&TransferMessage::Chunk { index, data })?;
            writer.write_sealed(&frame).await?;
            outbox.insert(seq, Outgoing { frame, index: Some(index) });
            in_flight += 1;
            job.chunks_sent += 1;
            job.retry.arm(Instant::now());
        }

        if !completing && pending.is_empty() && in_flight == 0 {
            let (seq, frame) = writer.seal(&TransferMessage::Complete)?;
            writer.write_sealed(&frame).await?;
            outbox.insert(seq, Outgoing { frame, index: None });
            job.retry.progress(Instant::now());
            completing = true;
        }

        let deadline = job
            .retry
            .deadline
            .unwrap_or_else(|| Instant::now() + ctx.settings.chunk_timeout);
        let item = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = writer.send(&TransferMessage::Cancel).await;
                writer.shutdown().await;
                return Err(Error::Cancelled);
            }
            _ = sleep_until(deadline) => {
                match job.retry.expire(Instant::now()) {
                    RetryDecision::Retry { attempt } => {
                        debug!("Job {}: ack timeout, retry {}", job.id().short(), attempt);
                        let first = outbox.keys().next().copied().unwrap_or(0);
                        job.retransmissions += resend(&mut writer, &outbox, first).await?;
                        // A lost replay may be asked for again.
                        requested = None;
                        ctx.publish(job);
                        continue;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        let index = job.completed.first_missing().unwrap_or(header.total_chunks());
                        return Err(TimeoutError::Acknowledgment { index, attempts }.into());
                    }
                }
            }
            item = inbound.recv() => item,
        };

        let Some(message) = next_message(item, &mut writer, &mut outbox, &mut requested).await? else {
            continue;
        };
        match message {
            TransferMessage::Ack { seq, .. } => {
                let acked: Vec<u64> = outbox.range(..=seq).map(|(s, _)| *s).collect();
                for s in &acked {
                    if let Some(Outgoing { index: Some(i), .. }) = outbox.remove(s) {
                        job.completed.insert(i);
                        in_flight -= 1;
                    }
                }
                if !acked.is_empty() {
                    job.retry.progress(Instant::now());
                }
                if in_flight == 0 && !completing {
                    job.retry.disarm();
                }
                ctx.publish(job);
            }
            TransferMessage::Retransmit { from_seq } => {
                debug!("Job {}: receiver requested resend from {}", job.id().short(), from_seq);
                job.retransmissions += resend(&mut writer, &outbox, from_seq).await?;
            }
            TransferMessage::Hashing if completing => job.retry.progress(Instant::now()),
            TransferMessage::Verified if completing => {
                job.transition(JobState::Completed)?;
                writer.shutdown().await;
                return Ok(());
            }
            TransferMessage::Failed { reason } => {
                return Err(Error::Rejected(format!("receiver failed the transfer: {reason}")))
            }
            TransferMessage::Cancel => return Err(Error::Cancelled),
            other => return Err(unexpected(&other)),
        }
    }
}

async fn resend<W>(
    writer: &mut SessionWriter<W>,
    outbox: &BTreeMap<u64, Outgoing>,
    from_seq: u64,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut count = 0;
    for outgoing in outbox.range(from_seq..).map(|(_, o)| o) {
        writer.write_sealed(&outgoing.frame).await?;
        count += 1;
    }
    Ok(count)
}

/// Wait for the sender's `Offer`, the first message of every session.
pub async fn read_offer<S>(session: &mut Session<S>, timeout: Duration) -> Result<TransferHeader>
where
    S: AsyncRead + AsyncWrite,
{
    let wait = async {
        let mut requested = None;
        loop {
            match session.recv::<TransferMessage>().await? {
                Inbound::Message { message: TransferMessage::Offer(header), .. } => return Ok(header),
                Inbound::Message {
                    message: TransferMessage::Retransmit { from_seq },
                    ..
                } => {
                    session.replay(from_seq).await?;
                }
                Inbound::Message { message, .. } => return Err(unexpected(&message)),
                Inbound::Rejected(_) => {
                    let expected = session.expected_sequence();
                    if requested != Some(expected) {
                        session.send(&TransferMessage::Retransmit { from_seq: expected }).await?;
                        requested = Some(expected);
                    }
                }
                Inbound::Closed => return Err(TransportError::Closed.into()),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| Error::from(TimeoutError::Offer(timeout)))?
}

/// Turn an offer down and end the session.
pub async fn reject<S>(mut session: Session<S>, reason: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    session
        .send(&TransferMessage::Reject {
            reason: reason.to_string(),
        })
        .await?;
    session.close().await;
    Ok(())
}

/// Tell the sender this job is still running here and end the session.
pub async fn defer<S>(mut session: Session<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    session.send(&TransferMessage::Busy).await?;
    session.close().await;
    Ok(())
}

/// Receive the payload for an accepted `job` into `sink`.
///
/// `job.completed` is sent back to the sender as the set of chunks already
/// held. On success the output is committed and `sink` is emptied. TEXT
/// output is dropped on cancellation; FILE partials stay on disk.
pub async fn receive<S>(session: Session<S>, job: &mut TransferJob, sink: &mut Option<Sink>, ctx: &TransferContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let result = run_receive(session, job, sink, ctx).await;
    match &result {
        Err(Error::Cancelled) if job.header.kind == PayloadKind::Text => {
            if let Some(sink) = sink.take() {
                let _ = sink.discard().await;
            }
        }
        Err(Error::Integrity(_)) => {
            // Leave the partial file in place, never under the final name.
            sink.take();
        }
        Err(_) => {
            // The bitmap about to be saved must not run ahead of the disk.
            if let Some(output) = sink.as_mut() {
                if let Err(e) = output.sync().await {
                    warn!("Failed to sync output of job {}: {}", job.id().short(), e);
                }
            }
        }
        Ok(()) => {}
    }
    conclude(job, result, ctx).await
}

async fn run_receive<S>(
    mut session: Session<S>,
    job: &mut TransferJob,
    sink: &mut Option<Sink>,
    ctx: &TransferContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let header = job.header.clone();
    let Some(output) = sink.as_mut() else {
        return Err(Error::InvalidState(job.id()));
    };
    let idle = ctx.settings.idle_timeout();
    session.keep_sent(ctx.settings.replay_frames());

    session
        .send(&TransferMessage::Accept {
            completed: job.completed.clone(),
        })
        .await?;
    job.transition(JobState::InProgress)?;
    ctx.checkpoint(job).await;
    ctx.publish(job);

    let mut requested: Option<u64> = None;
    let mut last_index: Option<u32> = None;
    let mut unsynced = 0u32;

    loop {
        let inbound = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = session.send(&TransferMessage::Cancel).await;
                session.close().await;
                return Err(Error::Cancelled);
            }
            _ = sleep(idle) => {
                session.close().await;
                return Err(TimeoutError::Idle(idle).into());
            }
            inbound = session.recv::<TransferMessage>() => inbound?,
        };

        let (sequence, message) = match inbound {
            Inbound::Message { sequence, message } => (sequence, message),
            Inbound::Rejected(AuthenticationError::UnexpectedSequence { expected, got }) if got < expected => {
                // Go-back-N duplicate of something already applied.
                if let Some(index) = last_index {
                    session
                        .send(&TransferMessage::Ack {
                            seq: expected - 1,
                            index,
                        })
                        .await?;
                }
                continue;
            }
            Inbound::Rejected(e) => {
                let expected = session.expected_sequence();
                if requested != Some(expected) {
                    debug!("Job {}: dropped frame ({}), requesting resend", job.id().short(), e);
                    session.send(&TransferMessage::Retransmit { from_seq: expected }).await?;
                    requested = Some(expected);
                }
                continue;
            }
            Inbound::Closed => return Err(TransportError::Closed.into()),
        };

        match message {
            TransferMessage::Chunk { index, data } => {
                if index >= header.total_chunks() || data.len() != header.chunk_len(index) {
                    let reason = format!("malformed chunk {index}");
                    let _ = session.send(&TransferMessage::Failed { reason: reason.clone() }).await;
                    return Err(TransportError::Codec(reason).into());
                }
                if !job.completed.contains(index) {
                    output.write_chunk(header.offset(index), &data).await?;
                    job.completed.insert(index);
                    unsynced += 1;
                }
                session.send(&TransferMessage::Ack { seq: sequence, index }).await?;
                last_index = Some(index);

                if unsynced >= CHECKPOINT_EVERY {
                    output.sync().await?;
                    ctx.checkpoint(job).await;
                    unsynced = 0;
                }
                ctx.publish(job);
            }
            TransferMessage::Retransmit { from_seq } => {
                let replayed = session.replay(from_seq).await?;
                debug!("Job {}: replayed {} frames from {}", job.id().short(), replayed, from_seq);
            }
            TransferMessage::Complete => {
                output.sync().await?;
                let actual = {
                    let digest = output.digest();
                    tokio::pin!(digest);
                    let mut keepalive = tokio::time::interval(ctx.settings.keepalive());
                    keepalive.tick().await;
                    loop {
                        tokio::select! {
                            actual = &mut digest => break actual?,
                            _ = keepalive.tick() => {
                                session.send(&TransferMessage::Hashing).await?;
                            }
                        }
                    }
                };
                if !job.completed.is_complete() || actual != header.content_hash {
                    let error = IntegrityError {
                        expected: hex::encode(header.content_hash),
                        actual: hex::encode(actual),
                    };
                    let _ = session
                        .send(&TransferMessage::Failed {
                            reason: error.to_string(),
                        })
                        .await;
                    return Err(error.into());
                }

                if let Some(output) = sink.take() {
                    job.text = output.commit().await?;
                }
                job.transition(JobState::Completed)?;
                session.send(&TransferMessage::Verified).await?;
                linger(&mut session, idle).await;
                session.close().await;
                return Ok(());
            }
            TransferMessage::Cancel => return Err(Error::Cancelled),
            TransferMessage::Failed { reason } => return Err(Error::Rejected(reason)),
            other => return Err(unexpected(&other)),
        }
    }
}

/// Answer replay requests until the sender hangs up, so a damaged `Verified`
/// still reaches it.
async fn linger<S>(session: &mut Session<S>, idle: Duration)
where
    S: AsyncRead + AsyncWrite,
{
    loop {
        match tokio::time::timeout(idle, session.recv::<TransferMessage>()).await {
            Ok(Ok(Inbound::Message {
                message: TransferMessage::Retransmit { from_seq },
                ..
            })) => {
                if session.replay(from_seq).await.is_err() {
                    break;
                }
            }
            Ok(Ok(Inbound::Message { .. } | Inbound::Rejected(_))) => {}
            _ => break,
        }
    }
}
