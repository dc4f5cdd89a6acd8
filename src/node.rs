//! # Node
//!
//! The entry points a CLI or UI calls. A running node owns:
//! - discovery (announce, listen and sweep tasks)
//! - a TCP accept loop; every connection is handled in its own task
//! - the job table, one entry per send or receive, observed through
//!   [`JobSnapshot`]s
//! - destination claims, so two live jobs never write the same path
//!
//! Incoming offers wait for [`Node::accept_job`] or [`Node::cancel_job`];
//! an offer nobody answers within `offer_timeout` is rejected.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::discovery::{Discovery, Peer};
use crate::error::{Error, Result, TimeoutError};
use crate::identity::{Identity, PeerId};
use crate::networking::bind_listener;
use crate::session::{self, Session};
use crate::transfer::engine::{self, conclude, Checkpoint, TransferContext, TransferSettings};
use crate::transfer::job::{Direction, JobId, JobSnapshot, JobState, PayloadKind, RetryState, TransferJob};
use crate::transfer::messages::TransferHeader;
use crate::transfer::payload::{part_path, remove_if_exists, Destination, Payload, Sink};
use crate::transfer::store::JobStore;

const OFFER_QUEUE: usize = 32;
const IDENTITY_FILE: &str = "identity.key";

/// An offer waiting for a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub job_id: JobId,
    pub peer: PeerId,
    /// Display name, when the sender is in the peer registry.
    pub peer_name: Option<String>,
    pub kind: PayloadKind,
    /// File name for FILE payloads, empty for TEXT.
    pub name: String,
    pub total_size: u64,
    /// Where the payload goes when the caller has no preference.
    pub default_destination: Destination,
}

/// Incoming offers in arrival order. Clones share one queue, so each offer
/// is handed out once.
#[derive(Clone)]
pub struct Offers {
    rx: Arc<AsyncMutex<mpsc::Receiver<IncomingOffer>>>,
}

impl Offers {
    pub async fn next(&self) -> Option<IncomingOffer> {
        self.rx.lock().await.recv().await
    }
}

/// What a job that is not running needs to run again.
enum Parked {
    Send {
        payload: Payload,
        address: SocketAddr,
    },
    Receive {
        destination: Destination,
        /// Open output of a PAUSED receive. FILE output can be reopened from
        /// disk when this is gone; TEXT output cannot.
        sink: Option<Sink>,
    },
}

struct ParkedJob {
    job: TransferJob,
    resume: Parked,
    status: watch::Sender<JobSnapshot>,
}

struct JobEntry {
    status: watch::Receiver<JobSnapshot>,
    cancel: CancellationToken,
    /// Set while an offer waits for accept or cancel.
    decision: Option<oneshot::Sender<Destination>>,
    /// Present whenever no task owns the job.
    parked: Option<ParkedJob>,
}

/// A receive that is about to run on an accepted session.
struct ReceiveWork {
    job: TransferJob,
    destination: Destination,
    sink: Option<Sink>,
    status: watch::Sender<JobSnapshot>,
    cancel: CancellationToken,
}

enum Known {
    Unknown,
    Resume(ReceiveWork),
    /// An earlier session of the same receive is still running here.
    Busy,
    Refused(&'static str),
}

struct NodeInner {
    config: Config,
    identity: Identity,
    discovery: Discovery,
    listen_addr: SocketAddr,
    store: Arc<JobStore>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    /// Destination path -> job writing it.
    claims: Mutex<HashMap<PathBuf, JobId>>,
    offers: mpsc::Sender<IncomingOffer>,
    offers_rx: Arc<AsyncMutex<mpsc::Receiver<IncomingOffer>>>,
    cancel: CancellationToken,
}

pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Load (or create) the identity under `state_dir`, restore persisted
    /// jobs as PAUSED, start discovery and begin accepting sessions.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let identity = Identity::load_or_create(&config.state_dir.join(IDENTITY_FILE))?;
        let store = Arc::new(JobStore::open(&config.state_dir).await?);

        let listener = bind_listener(config.transfer_addr)?;
        let listen_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let discovery = Discovery::start(&config, identity.peer_id(), listen_addr.port(), &cancel).await?;
        let (offers, offers_rx) = mpsc::channel(OFFER_QUEUE);

        let inner = Arc::new(NodeInner {
            config,
            identity,
            discovery,
            listen_addr,
            store,
            jobs: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            offers,
            offers_rx: Arc::new(AsyncMutex::new(offers_rx)),
            cancel,
        });
        inner.restore().await?;
        tokio::spawn(accept_loop(inner.clone(), listener));

        info!(
            "Node {} ({}) accepting sessions on {}",
            inner.identity.peer_id().short(),
            inner.config.display_name,
            listen_addr
        );
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.inner.discovery.local_addr()
    }

    /// Announce now instead of waiting for the next interval.
    pub fn announce(&self) {
        self.inner.discovery.announce();
    }

    /// ACTIVE peers.
    pub fn list_peers(&self) -> Vec<Peer> {
        self.inner.discovery.snapshot()
    }

    /// The single ACTIVE peer whose id starts with `query` or whose display
    /// name equals it.
    pub fn resolve_peer(&self, query: &str) -> Result<Peer> {
        let mut matches = self.inner.discovery.registry().resolve(query);
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::UnknownPeer(query.to_string())),
            n => Err(Error::UnknownPeer(format!("{query} matches {n} peers"))),
        }
    }

    pub async fn send_text(&self, peer: PeerId, text: impl Into<String>) -> Result<JobId> {
        self.send_payload(peer, Payload::text(text)).await
    }

    pub async fn send_file(&self, peer: PeerId, path: impl AsRef<Path>) -> Result<JobId> {
        self.send_payload(peer, Payload::File(path.as_ref().to_path_buf())).await
    }

    async fn send_payload(&self, peer: PeerId, payload: Payload) -> Result<JobId> {
        let target = self
            .list_peers()
            .into_iter()
            .find(|p| p.id == peer)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;

        let header = payload
            .describe(JobId::generate(), self.inner.config.chunk_size)
            .await?;
        header.validate()?;

        let job = TransferJob::new(header, Direction::Send, peer, self.inner.retry());
        let job_id = job.id();
        let (status, status_rx) = watch::channel(job.snapshot());
        let cancel = CancellationToken::new();
        self.inner.jobs().insert(
            job_id,
            JobEntry {
                status: status_rx,
                cancel: cancel.clone(),
                decision: None,
                parked: None,
            },
        );

        info!(
            "Job {}: sending {} ({} bytes) to {} at {}",
            job_id.short(),
            job.header.kind,
            job.header.total_size,
            target.display_name,
            target.address
        );
        tokio::spawn(run_send(self.inner.clone(), job, payload, target.address, status, cancel));
        Ok(job_id)
    }

    /// Offers as they arrive. Every offer must be accepted or cancelled
    /// before `offer_timeout`, or it is rejected.
    pub fn receive_offers(&self) -> Offers {
        Offers {
            rx: self.inner.offers_rx.clone(),
        }
    }

    /// Accept a pending offer into `destination`.
    ///
    /// FILE destinations are claimed for the life of the job; a second
    /// live job naming the same path fails with `DestinationBusy`.
    pub fn accept_job(&self, job_id: JobId, destination: Destination) -> Result<()> {
        let mut jobs = self.inner.jobs();
        let entry = jobs.get(&job_id).ok_or(Error::UnknownJob(job_id))?;
        let kind = entry.status.borrow().kind;
        destination.check(kind)?;
        if entry.decision.is_none() {
            return Err(Error::InvalidState(job_id));
        }
        if let Some(path) = destination.path() {
            self.inner.claim(path, job_id, &jobs)?;
        }

        let claimed = destination.path().map(Path::to_path_buf);
        let sent = jobs
            .get_mut(&job_id)
            .and_then(|entry| entry.decision.take())
            .map(|decide| decide.send(destination).is_ok())
            .unwrap_or(false);
        if !sent {
            if let Some(path) = claimed {
                self.inner.release(&path, job_id);
            }
            return Err(Error::InvalidState(job_id));
        }
        Ok(())
    }

    /// Cancel a job in any non-terminal state.
    ///
    /// A pending offer is rejected. A running job tells its peer and fails.
    /// A PAUSED job fails in place. TEXT output is dropped, FILE partials
    /// stay on disk until [`Node::discard_job`].
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let (checkpoint, job) = {
            let mut jobs = self.inner.jobs();
            let entry = jobs.get_mut(&job_id).ok_or(Error::UnknownJob(job_id))?;

            if entry.decision.take().is_some() {
                // The offer task sees the dropped sender and rejects.
                return Ok(());
            }

            let Some(parked) = entry.parked.as_mut() else {
                entry.cancel.cancel();
                return Ok(());
            };
            if parked.job.state.is_terminal() {
                return Err(Error::InvalidState(job_id));
            }

            parked.job.record_failure(&Error::Cancelled);
            let persisted = match &mut parked.resume {
                Parked::Send {
                    payload: Payload::File(path),
                    address,
                } => Some((path.clone(), Some(*address))),
                Parked::Send { .. } => None,
                Parked::Receive { destination, sink } => {
                    if destination.path().is_none() {
                        sink.take();
                    }
                    destination.path().map(|path| (path.to_path_buf(), None))
                }
            };
            if let Some((path, _)) = &persisted {
                if parked.job.direction == Direction::Receive {
                    self.inner.release(path, job_id);
                }
            }
            parked.status.send_replace(parked.job.snapshot());
            let checkpoint = persisted.map(|(path, address)| Checkpoint {
                store: self.inner.store.clone(),
                address,
                path,
            });
            (checkpoint, parked.job.clone())
        };

        if let Some(checkpoint) = checkpoint {
            checkpoint.save(&job).await;
        }
        info!("Job {} FAILED: {}", job_id.short(), Error::Cancelled);
        Ok(())
    }

    /// Continue a PAUSED outgoing job on a new session.
    pub fn resume_job(&self, job_id: JobId) -> Result<()> {
        let mut jobs = self.inner.jobs();
        let entry = jobs.get_mut(&job_id).ok_or(Error::UnknownJob(job_id))?;

        match entry.parked.take() {
            Some(ParkedJob {
                job,
                resume: Parked::Send { payload, address },
                status,
            }) if job.state == JobState::Paused => {
                let address = self
                    .inner
                    .discovery
                    .registry()
                    .get(&job.peer)
                    .map(|peer| peer.address)
                    .unwrap_or(address);
                entry.cancel = CancellationToken::new();
                let cancel = entry.cancel.clone();
                drop(jobs);

                info!(
                    "Job {}: resuming at chunk {:?} via {}",
                    job_id.short(),
                    job.completed.first_missing(),
                    address
                );
                tokio::spawn(run_send(self.inner.clone(), job, payload, address, status, cancel));
                Ok(())
            }
            other => {
                entry.parked = other;
                Err(Error::InvalidState(job_id))
            }
        }
    }

    /// Forget a job that is not running: its persisted state and, for an
    /// unfinished receive, the partial output.
    pub async fn discard_job(&self, job_id: JobId) -> Result<()> {
        let removed = {
            let mut jobs = self.inner.jobs();
            match jobs.entry(job_id) {
                Entry::Vacant(_) => return Err(Error::UnknownJob(job_id)),
                Entry::Occupied(entry) if entry.get().parked.is_none() => {
                    return Err(Error::InvalidState(job_id))
                }
                Entry::Occupied(entry) => entry.remove(),
            }
        };

        if let Some(ParkedJob {
            job,
            resume: Parked::Receive { destination, sink },
            ..
        }) = removed.parked
        {
            if let Some(path) = destination.path() {
                if job.state != JobState::Completed {
                    match sink {
                        Some(sink) => sink.discard().await?,
                        None => remove_if_exists(&part_path(path)).await?,
                    }
                }
                self.inner.release(path, job_id);
            }
        }
        self.inner.store.remove(&job_id).await?;
        debug!("Job {} discarded", job_id.short());
        Ok(())
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobSnapshot> {
        self.inner
            .jobs()
            .get(&job_id)
            .map(|entry| entry.status.borrow().clone())
            .ok_or(Error::UnknownJob(job_id))
    }

    /// Every known job, in no particular order.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.inner
            .jobs()
            .values()
            .map(|entry| entry.status.borrow().clone())
            .collect()
    }

    /// Follow a job's snapshots as they change.
    pub fn watch_job(&self, job_id: JobId) -> Result<watch::Receiver<JobSnapshot>> {
        self.inner
            .jobs()
            .get(&job_id)
            .map(|entry| entry.status.clone())
            .ok_or(Error::UnknownJob(job_id))
    }

    /// Wait until the job is COMPLETED, FAILED or PAUSED.
    pub async fn wait_for_job(&self, job_id: JobId) -> Result<JobSnapshot> {
        let mut status = self.watch_job(job_id)?;
        let snapshot = status
            .wait_for(|s| matches!(s.state, JobState::Completed | JobState::Failed | JobState::Paused))
            .await
            .map_err(|_| Error::UnknownJob(job_id))?
            .clone();
        Ok(snapshot)
    }

    /// Stop discovery and the accept loop. Running jobs keep their last
    /// checkpoint and come back PAUSED on the next start.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl NodeInner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<PathBuf, JobId>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `path` for `job_id`. A claim whose owner already reached a
    /// terminal state is free, even before that job was parked.
    fn claim(&self, path: &Path, job_id: JobId, jobs: &HashMap<JobId, JobEntry>) -> Result<()> {
        let key = claim_key(path);
        let mut claims = self.claims();
        if let Some(owner) = claims.get(&key) {
            let free = *owner == job_id
                || jobs
                    .get(owner)
                    .map_or(true, |entry| entry.status.borrow().state.is_terminal());
            if !free {
                return Err(Error::DestinationBusy(key));
            }
        }
        claims.insert(key, job_id);
        Ok(())
    }

    fn release(&self, path: &Path, job_id: JobId) {
        let key = claim_key(path);
        let mut claims = self.claims();
        if claims.get(&key) == Some(&job_id) {
            claims.remove(&key);
        }
    }

    fn retry(&self) -> RetryState {
        RetryState::new(self.config.chunk_timeout, self.config.max_retries)
    }

    fn context(&self, status: watch::Sender<JobSnapshot>, cancel: CancellationToken, checkpoint: Option<Checkpoint>) -> TransferContext {
        TransferContext {
            settings: TransferSettings::from(&self.config),
            cancel,
            status,
            checkpoint,
        }
    }

    fn checkpoint(&self, address: Option<SocketAddr>, path: Option<&Path>) -> Option<Checkpoint> {
        path.map(|path| Checkpoint {
            store: self.store.clone(),
            address,
            path: path.to_path_buf(),
        })
    }

    /// Hand a finished or paused job back to the table.
    fn park(&self, job: TransferJob, resume: Parked, status: watch::Sender<JobSnapshot>) {
        let resume = match resume {
            Parked::Receive { destination, sink } => {
                if job.state.is_terminal() {
                    if let Some(path) = destination.path() {
                        self.release(path, job.id());
                    }
                }
                let sink = if job.state == JobState::Paused { sink } else { None };
                Parked::Receive { destination, sink }
            }
            send => send,
        };
        if let Some(entry) = self.jobs().get_mut(&job.id()) {
            entry.parked = Some(ParkedJob { job, resume, status });
        }
    }

    /// Reload persisted FILE jobs. Unfinished ones come back PAUSED and
    /// their destinations are claimed again.
    async fn restore(&self) -> Result<()> {
        for record in self.store.load_all().await? {
            let job_id = record.job_id();
            let address = record.address;
            let path = record.path.clone();
            let Some(job) = record.into_job(self.retry()) else {
                warn!("Skipping job {} with a malformed chunk bitmap", job_id.short());
                continue;
            };

            let resume = match (job.direction, address) {
                (Direction::Send, Some(address)) => Parked::Send {
                    payload: Payload::File(path),
                    address,
                },
                (Direction::Send, None) => {
                    warn!("Skipping outgoing job {} with no peer address", job_id.short());
                    continue;
                }
                (Direction::Receive, _) => {
                    if !job.state.is_terminal() {
                        if let Err(e) = self.claim(&path, job_id, &self.jobs()) {
                            warn!("Skipping job {}: {}", job_id.short(), e);
                            continue;
                        }
                    }
                    Parked::Receive {
                        destination: Destination::File(path),
                        sink: None,
                    }
                }
            };

            info!(
                "Restored job {} {:?} {} at {}/{} chunks",
                job_id.short(),
                job.direction,
                job.state,
                job.completed.count(),
                job.completed.len()
            );
            let (status, status_rx) = watch::channel(job.snapshot());
            self.jobs().insert(
                job_id,
                JobEntry {
                    status: status_rx,
                    cancel: CancellationToken::new(),
                    decision: None,
                    parked: Some(ParkedJob { job, resume, status }),
                },
            );
        }
        Ok(())
    }

    /// Decide what an offer for `header` from `peer` means to this node.
    fn lookup(&self, header: &TransferHeader, peer: PeerId) -> Known {
        let mut jobs = self.jobs();
        let Some(entry) = jobs.get_mut(&header.job_id) else {
            return Known::Unknown;
        };

        match entry.parked.take() {
            Some(ParkedJob {
                job,
                resume: Parked::Receive { destination, sink },
                status,
            }) if job.state == JobState::Paused && job.peer == peer && &job.header == header => {
                entry.cancel = CancellationToken::new();
                Known::Resume(ReceiveWork {
                    job,
                    destination,
                    sink,
                    status,
                    cancel: entry.cancel.clone(),
                })
            }
            None => {
                let running = entry.status.borrow();
                if running.direction == Direction::Receive && running.peer == peer && !running.state.is_terminal() {
                    Known::Busy
                } else {
                    Known::Refused("job already known")
                }
            }
            other => {
                entry.parked = other;
                Known::Refused("job already known")
            }
        }
    }

    /// A new offer: queue it for the caller and wait for a decision.
    async fn offer(&self, session: Session<TcpStream>, header: TransferHeader) {
        let peer = session.remote();
        let job = TransferJob::new(header.clone(), Direction::Receive, peer, self.retry());
        let job_id = job.id();
        let (status, status_rx) = watch::channel(job.snapshot());
        let (decide, decision) = oneshot::channel();
        let cancel = CancellationToken::new();

        let inserted = match self.jobs().entry(job_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(JobEntry {
                    status: status_rx,
                    cancel: cancel.clone(),
                    decision: Some(decide),
                    parked: None,
                });
                true
            }
        };
        if !inserted {
            let _ = engine::reject(session, "job already known").await;
            return;
        }

        let default_destination = Destination::default_for(&header, &self.config.download_dir);
        let offer = IncomingOffer {
            job_id,
            peer,
            peer_name: self.discovery.registry().get(&peer).map(|p| p.display_name),
            kind: header.kind,
            name: header.name.clone(),
            total_size: header.total_size,
            default_destination: default_destination.clone(),
        };
        info!(
            "Job {}: {} offers {} ({} bytes)",
            job_id.short(),
            peer.short(),
            header.kind,
            header.total_size
        );

        let wait = async {
            self.offers.send(offer).await.map_err(|_| Error::Cancelled)?;
            decision.await.map_err(|_| Error::Cancelled)
        };
        let decided = match tokio::time::timeout(self.config.offer_timeout, wait).await {
            Ok(decided) => decided,
            Err(_) => Err(TimeoutError::Offer(self.config.offer_timeout).into()),
        };

        let mut job = job;
        let ctx = self.context(status, cancel, None);
        let destination = match decided {
            Ok(destination) => destination,
            Err(e) => {
                if let Some(entry) = self.jobs().get_mut(&job_id) {
                    entry.decision = None;
                }
                let reason = match &e {
                    Error::Cancelled => "declined",
                    _ => "not answered in time",
                };
                let _ = engine::reject(session, reason).await;
                let _ = conclude(&mut job, Err(e), &ctx).await;
                self.park(
                    job,
                    Parked::Receive {
                        destination: default_destination,
                        sink: None,
                    },
                    ctx.status,
                );
                return;
            }
        };

        job.destination = destination.path().map(Path::to_path_buf);
        let sink = match Sink::create(&destination, &header).await {
            Ok(sink) => sink,
            Err(e) => {
                let _ = engine::reject(session, "destination is not writable").await;
                let _ = conclude(&mut job, Err(e), &ctx).await;
                self.park(job, Parked::Receive { destination, sink: None }, ctx.status);
                return;
            }
        };

        let TransferContext { status, cancel, .. } = ctx;
        self.receive(
            session,
            ReceiveWork {
                job,
                destination,
                sink: Some(sink),
                status,
                cancel,
            },
        )
        .await;
    }

    /// Pick a PAUSED receive back up on a new session.
    async fn resume(&self, session: Session<TcpStream>, mut work: ReceiveWork) {
        info!(
            "Job {}: peer resumed at chunk {:?}",
            work.job.id().short(),
            work.job.completed.first_missing()
        );
        if work.sink.is_none() {
            match reopen_sink(&work.destination, &mut work.job).await {
                Ok(sink) => work.sink = Some(sink),
                Err(e) => {
                    let _ = engine::reject(session, "partial output is unavailable").await;
                    let ctx = self.context(work.status, work.cancel, None);
                    let _ = conclude(&mut work.job, Err(e), &ctx).await;
                    self.park(
                        work.job,
                        Parked::Receive {
                            destination: work.destination,
                            sink: None,
                        },
                        ctx.status,
                    );
                    return;
                }
            }
        }
        self.receive(session, work).await;
    }

    async fn receive(&self, session: Session<TcpStream>, work: ReceiveWork) {
        let ReceiveWork {
            mut job,
            destination,
            mut sink,
            status,
            cancel,
        } = work;
        let ctx = self.context(status, cancel, self.checkpoint(None, destination.path()));
        let _ = engine::receive(session, &mut job, &mut sink, &ctx).await;
        self.park(job, Parked::Receive { destination, sink }, ctx.status);
    }

    /// Dial a peer, retrying transient failures with doubling backoff.
    async fn dial(&self, address: SocketAddr, peer: PeerId, cancel: &CancellationToken) -> Result<Session<TcpStream>> {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                connected = session::connect(address, &self.identity, &self.config, Some(peer)) => connected,
            };
            let error = match connected {
                Ok(session) => return Ok(session),
                Err(e) => Error::from(e),
            };
            if !error.is_retryable() || attempt >= self.config.max_retries {
                return Err(error);
            }
            debug!("Connecting to {} failed ({}), retry {} in {:?}", address, error, attempt, backoff);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff *= 2;
        }
    }
}

fn claim_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Reopen FILE output left by an earlier session, or start over when the
/// partial file is gone.
async fn reopen_sink(destination: &Destination, job: &mut TransferJob) -> Result<Sink> {
    if let Some(sink) = Sink::reopen(destination, &job.header).await? {
        return Ok(sink);
    }
    if job.header.kind == PayloadKind::Text {
        return Err(Error::InvalidState(job.id()));
    }
    debug!("Partial output for job {} is gone, starting over", job.id().short());
    job.completed.clear();
    Sink::create(destination, &job.header).await
}

async fn run_send(
    inner: Arc<NodeInner>,
    mut job: TransferJob,
    payload: Payload,
    address: SocketAddr,
    status: watch::Sender<JobSnapshot>,
    cancel: CancellationToken,
) {
    let source = match &payload {
        Payload::File(path) => Some(path.as_path()),
        Payload::Text(_) => None,
    };
    let ctx = inner.context(status, cancel, inner.checkpoint(Some(address), source));

    match inner.dial(address, job.peer, &ctx.cancel).await {
        Ok(session) => {
            let _ = engine::send(session, &mut job, &payload, &ctx).await;
        }
        Err(e) => {
            let _ = conclude(&mut job, Err(e), &ctx).await;
        }
    }
    inner.park(job, Parked::Send { payload, address }, ctx.status);
}

async fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!("Connection from {}", addr);
                tokio::spawn(handle_connection(inner.clone(), stream, addr));
            }
            Err(e) => warn!("Accept failed: {}", e),
        }
    }
    debug!("Accept loop stopped");
}

async fn handle_connection(inner: Arc<NodeInner>, stream: TcpStream, addr: SocketAddr) {
    let mut session = match session::accept(stream, &inner.identity, &inner.config).await {
        Ok(session) => session,
        Err(e) => {
            warn!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let header = match engine::read_offer(&mut session, inner.config.offer_timeout).await {
        Ok(header) => header,
        Err(e) => {
            debug!("No offer from {}: {}", addr, e);
            return;
        }
    };
    if let Err(e) = header.validate() {
        warn!("Rejecting offer from {}: {}", addr, e);
        let _ = engine::reject(session, &e.to_string()).await;
        return;
    }

    match inner.lookup(&header, session.remote()) {
        Known::Unknown => inner.offer(session, header).await,
        Known::Resume(work) => inner.resume(session, work).await,
        Known::Busy => {
            debug!("Job {} from {} is still running, deferring", header.job_id.short(), addr);
            let _ = engine::defer(session).await;
        }
        Known::Refused(reason) => {
            debug!("Refusing offer for job {} from {}: {}", header.job_id.short(), addr, reason);
            let _ = engine::reject(session, reason).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Announcement;
    use crate::ErrorKind;
    use std::time::Duration;

    async fn node(dir: &Path, name: &str) -> Node {
        let mut config = Config::for_testing(dir.join(name));
        config.display_name = name.to_string();
        Node::start(config).await.unwrap()
    }

    /// Make `receiver` known to `sender` with a direct announcement.
    async fn introduce(sender: &Node, receiver: &Node) {
        let announcement = Announcement::new(receiver.peer_id(), "receiver", receiver.listen_addr().port());
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&announcement.encode(), sender.discovery_addr())
            .await
            .unwrap();
        for _ in 0..50 {
            if sender.list_peers().iter().any(|p| p.id == receiver.peer_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("receiver never appeared in the sender's registry");
    }

    #[tokio::test]
    async fn test_text_offer_accept_complete() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = node(dir.path(), "alpha").await;
        let bravo = node(dir.path(), "bravo").await;
        introduce(&alpha, &bravo).await;

        let job_id = alpha.send_text(bravo.peer_id(), "hi there").await.unwrap();
        let offer = bravo.receive_offers().next().await.unwrap();
        assert_eq!(offer.job_id, job_id);
        assert_eq!(offer.kind, PayloadKind::Text);
        assert_eq!(offer.total_size, 8);
        assert_eq!(offer.peer, alpha.peer_id());
        assert_eq!(offer.default_destination, Destination::Memory);
        assert_eq!(bravo.job_status(job_id).unwrap().state, JobState::Pending);

        bravo.accept_job(job_id, Destination::Memory).unwrap();
        let received = bravo.wait_for_job(job_id).await.unwrap();
        assert_eq!(received.state, JobState::Completed);
        assert_eq!(received.text.as_deref(), Some("hi there"));

        let sent = alpha.wait_for_job(job_id).await.unwrap();
        assert_eq!(sent.state, JobState::Completed);
        assert_eq!(sent.direction, Direction::Send);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = node(dir.path(), "alpha").await;
        let stranger = Identity::generate().peer_id();
        let result = alpha.send_text(stranger, "hello").await;
        assert!(matches!(result, Err(Error::UnknownPeer(_))));
        assert!(alpha.resolve_peer("nobody").is_err());
    }

    #[tokio::test]
    async fn test_cancelled_offer_fails_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = node(dir.path(), "alpha").await;
        let bravo = node(dir.path(), "bravo").await;
        introduce(&alpha, &bravo).await;

        let job_id = alpha.send_text(bravo.peer_id(), "unwanted").await.unwrap();
        let offer = bravo.receive_offers().next().await.unwrap();
        bravo.cancel_job(offer.job_id).await.unwrap();

        let received = bravo.wait_for_job(job_id).await.unwrap();
        assert_eq!(received.state, JobState::Failed);
        assert_eq!(received.last_error, Some(ErrorKind::Cancelled));

        let sent = alpha.wait_for_job(job_id).await.unwrap();
        assert_eq!(sent.state, JobState::Failed);
        assert_eq!(sent.last_error, Some(ErrorKind::Rejected));

        assert!(matches!(bravo.cancel_job(job_id).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_destination_claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = node(dir.path(), "alpha").await;
        let bravo = node(dir.path(), "bravo").await;
        introduce(&alpha, &bravo).await;

        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        std::fs::write(&first, b"first payload").unwrap();
        std::fs::write(&second, b"second payload").unwrap();

        let one = alpha.send_file(bravo.peer_id(), &first).await.unwrap();
        let two = alpha.send_file(bravo.peer_id(), &second).await.unwrap();
        let offers = bravo.receive_offers();
        let a = offers.next().await.unwrap();
        let b = offers.next().await.unwrap();
        assert!(a.job_id == one || a.job_id == two);
        assert!(b.job_id == one || b.job_id == two);

        let target = dir.path().join("out").join("shared.txt");
        bravo
            .accept_job(a.job_id, Destination::File(target.clone()))
            .unwrap();
        assert!(matches!(
            bravo.accept_job(b.job_id, Destination::File(target.clone())),
            Err(Error::DestinationBusy(_))
        ));
        assert!(matches!(
            bravo.accept_job(b.job_id, Destination::Memory),
            Err(Error::InvalidDestination(_))
        ));

        assert_eq!(bravo.wait_for_job(a.job_id).await.unwrap().state, JobState::Completed);

        // Released once the first job finished.
        bravo.accept_job(b.job_id, Destination::File(target.clone())).unwrap();
        assert_eq!(bravo.wait_for_job(b.job_id).await.unwrap().state, JobState::Completed);
        let written = std::fs::read(&target).unwrap();
        assert!(written == b"first payload" || written == b"second payload");
    }

    #[tokio::test]
    async fn test_unanswered_offer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = node(dir.path(), "alpha").await;
        let mut config = Config::for_testing(dir.path().join("bravo"));
        config.offer_timeout = Duration::from_millis(200);
        let bravo = Node::start(config).await.unwrap();
        introduce(&alpha, &bravo).await;

        let job_id = alpha.send_text(bravo.peer_id(), "anyone?").await.unwrap();
        let sent = alpha.wait_for_job(job_id).await.unwrap();
        assert_eq!(sent.state, JobState::Failed);
        assert_eq!(sent.last_error, Some(ErrorKind::Rejected));

        let received = bravo.wait_for_job(job_id).await.unwrap();
        assert_eq!(received.last_error, Some(ErrorKind::Timeout));
        assert!(matches!(
            bravo.accept_job(job_id, Destination::Memory),
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_persisted_jobs_restore_paused_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_testing(dir.path().join("alpha"));
        let store = JobStore::open(&config.state_dir).await.unwrap();

        let source = dir.path().join("big.bin");
        std::fs::write(&source, vec![7u8; 4096]).unwrap();
        let header = Payload::File(source.clone())
            .describe(JobId::generate(), 1024)
            .await
            .unwrap();
        let mut job = TransferJob::new(
            header,
            Direction::Receive,
            Identity::generate().peer_id(),
            RetryState::new(Duration::from_secs(1), 3),
        );
        job.transition(JobState::InProgress).unwrap();
        job.completed.insert(0);
        let destination = dir.path().join("downloads").join("big.bin");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(part_path(&destination), vec![0u8; 4096]).unwrap();
        store
            .save(&crate::transfer::store::PersistedJob::from_job(&job, None, destination.clone()))
            .await
            .unwrap();

        let alpha = Node::start(config).await.unwrap();
        let restored = alpha.job_status(job.id()).unwrap();
        assert_eq!(restored.state, JobState::Paused);
        assert_eq!(restored.completed_chunks, 1);
        assert_eq!(restored.destination, Some(destination.clone()));

        // Receive jobs resume when the sender comes back, not on request.
        assert!(matches!(alpha.resume_job(job.id()), Err(Error::InvalidState(_))));

        alpha.discard_job(job.id()).await.unwrap();
        assert!(!part_path(&destination).exists());
        assert!(matches!(alpha.job_status(job.id()), Err(Error::UnknownJob(_))));
        assert!(store.load(&job.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_session_of_running_receive_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let alpha = node(dir.path(), "alpha").await;
        let sender = Identity::generate().peer_id();
        let header = Payload::text("still running")
            .describe(JobId::generate(), 1024)
            .await
            .unwrap();
        let mut job = TransferJob::new(
            header.clone(),
            Direction::Receive,
            sender,
            RetryState::new(Duration::from_secs(1), 3),
        );
        job.transition(JobState::InProgress).unwrap();
        let (status, status_rx) = watch::channel(job.snapshot());
        alpha.inner.jobs().insert(
            job.id(),
            JobEntry {
                status: status_rx,
                cancel: CancellationToken::new(),
                decision: None,
                parked: None,
            },
        );

        assert!(matches!(alpha.inner.lookup(&header, sender), Known::Busy));
        let stranger = Identity::generate().peer_id();
        assert!(matches!(alpha.inner.lookup(&header, stranger), Known::Refused(_)));

        job.transition(JobState::Paused).unwrap();
        job.transition(JobState::Failed).unwrap();
        status.send_replace(job.snapshot());
        assert!(matches!(alpha.inner.lookup(&header, sender), Known::Refused(_)));
    }
}
