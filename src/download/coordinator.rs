use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::announce::{announce_loop, AnnounceRound};
use super::config::DownloadConfig;
use super::context::{PeerCommand, SwarmContext, SwarmEvent};
use super::error::DownloadError;
use super::session::{self, SessionReport};
use super::status::{DownloadOutcome, Progress};
use crate::peer::{Bitfield, CloseReason};
use crate::storage::PieceWriter;
use crate::torrent::TorrentDescriptor;
use crate::tracker::TrackerEvent;

/// Downloads one torrent to completion or failure.
///
/// # Examples
///
/// ```no_run
/// use bitleech::download::{Download, DownloadConfig, DownloadOutcome};
/// use bitleech::storage::FileWriter;
/// use bitleech::torrent::{InfoHash, TorrentDescriptor};
/// use std::sync::Arc;
///
/// # async fn example(hashes: Vec<[u8; 20]>) -> Result<(), Box<dyn std::error::Error>> {
/// let descriptor = TorrentDescriptor::new(
///     InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567")?,
///     1 << 20,
///     1 << 18,
///     hashes,
///     vec!["udp://tracker.example.com:6969/announce".into()],
/// )?;
/// let writer = Arc::new(FileWriter::create("./out.bin", &descriptor)?);
///
/// let download = Download::new(descriptor, writer, DownloadConfig::default())?;
/// let handle = download.handle();
///
/// tokio::spawn(async move {
///     let mut progress = handle.subscribe();
///     while progress.changed().await.is_ok() {
///         let p = progress.borrow().clone();
///         println!("{}/{} pieces", p.pieces_completed, p.pieces_total);
///     }
/// });
///
/// match download.run().await {
///     DownloadOutcome::Completed => println!("done"),
///     DownloadOutcome::Failed(e) => eprintln!("failed: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Download {
    descriptor: TorrentDescriptor,
    writer: Arc<dyn PieceWriter>,
    config: DownloadConfig,
    peers: Vec<SocketAddr>,
    verified: Option<Bitfield>,
    progress: watch::Sender<Progress>,
    stop: Arc<watch::Sender<bool>>,
}

/// Observes and stops a [`Download`] from another task.
#[derive(Clone)]
pub struct DownloadHandle {
    progress: watch::Receiver<Progress>,
    stop: Arc<watch::Sender<bool>>,
}

impl DownloadHandle {
    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// A receiver that is notified whenever progress changes.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Asks the download to shut down; `run` then returns
    /// `Failed(Stopped)`.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

impl Download {
    pub fn new(
        descriptor: TorrentDescriptor,
        writer: Arc<dyn PieceWriter>,
        config: DownloadConfig,
    ) -> Result<Self, DownloadError> {
        config.validate()?;

        let initial = Progress {
            pieces_total: descriptor.piece_count(),
            bytes_total: descriptor.total_length(),
            ..Progress::default()
        };
        let (progress, _) = watch::channel(initial);
        let (stop, _) = watch::channel(false);

        Ok(Self {
            descriptor,
            writer,
            config,
            peers: Vec::new(),
            verified: None,
            progress,
            stop: Arc::new(stop),
        })
    }

    /// Adds peers to dial without asking a tracker.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.peers.extend(peers);
        self
    }

    /// Seeds pieces the writer already holds. They are trusted as is.
    pub fn with_verified(mut self, verified: Bitfield) -> Result<Self, DownloadError> {
        if verified.len() != self.descriptor.piece_count() {
            return Err(DownloadError::InvalidConfig(format!(
                "verified bitfield covers {} pieces, torrent has {}",
                verified.len(),
                self.descriptor.piece_count()
            )));
        }
        self.verified = Some(verified);
        Ok(self)
    }

    pub fn handle(&self) -> DownloadHandle {
        DownloadHandle {
            progress: self.progress.subscribe(),
            stop: Arc::clone(&self.stop),
        }
    }

    pub async fn run(self) -> DownloadOutcome {
        let Download {
            descriptor,
            writer,
            config,
            peers,
            verified,
            progress,
            stop,
        } = self;

        let (events_tx, events) = mpsc::unbounded_channel();
        let urls = descriptor.announce_urls().to_vec();
        let ctx = Arc::new(SwarmContext::new(descriptor, config, writer, events_tx));
        if let Some(verified) = &verified {
            ctx.mark_verified(verified);
        }

        let mut coordinator = Coordinator {
            ctx,
            progress,
            sessions: JoinSet::new(),
            candidates: VecDeque::new(),
            known: HashSet::new(),
            active: HashSet::new(),
            banned: HashSet::new(),
            strikes: HashMap::new(),
            trackers: if urls.is_empty() {
                TrackerStatus::None
            } else {
                TrackerStatus::Pending
            },
        };
        coordinator.learn(peers);
        coordinator.publish();

        if coordinator.ctx.is_complete() {
            info!("all pieces already present");
            return DownloadOutcome::Completed;
        }

        let (rounds_tx, rounds) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();
        let announcer = if urls.is_empty() {
            drop(rounds_tx);
            None
        } else {
            Some(tokio::spawn(announce_loop(
                Arc::clone(&coordinator.ctx),
                urls,
                rounds_tx,
                control,
            )))
        };

        let outcome = coordinator.drive(events, rounds, stop.subscribe()).await;

        coordinator.sessions.shutdown().await;
        coordinator.publish();

        if let Some(mut announcer) = announcer {
            let event = match outcome {
                DownloadOutcome::Completed => TrackerEvent::Completed,
                DownloadOutcome::Failed(_) => TrackerEvent::Stopped,
            };
            let _ = control_tx.send(event);
            let grace = coordinator.ctx.config.final_announce_timeout * 2;
            if timeout(grace, &mut announcer).await.is_err() {
                debug!("announcer did not finish in {:?}", grace);
                announcer.abort();
            }
        }

        match &outcome {
            DownloadOutcome::Completed => info!("download complete"),
            DownloadOutcome::Failed(e) => warn!("download failed: {}", e),
        }
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerStatus {
    /// No announce URLs.
    None,
    /// No round has finished yet.
    Pending,
    Reachable,
    /// The latest round failed on every URL.
    Exhausted,
}

/// One sweep over every known peer.
struct Pass {
    started: Instant,
    /// Downloaded bytes when the pass began.
    downloaded: u64,
    /// Consecutive passes that downloaded nothing.
    idle: u32,
}

struct Coordinator {
    ctx: Arc<SwarmContext>,
    progress: watch::Sender<Progress>,
    sessions: JoinSet<SessionReport>,
    /// Waiting to be dialed in the current pass.
    candidates: VecDeque<SocketAddr>,
    /// Every peer ever learned, banned ones included.
    known: HashSet<SocketAddr>,
    /// Sessions in flight, dialing included.
    active: HashSet<SocketAddr>,
    banned: HashSet<SocketAddr>,
    strikes: HashMap<SocketAddr, u32>,
    trackers: TrackerStatus,
}

impl Coordinator {
    async fn drive(
        &mut self,
        mut events: mpsc::UnboundedReceiver<SwarmEvent>,
        mut rounds: mpsc::UnboundedReceiver<AnnounceRound>,
        mut stop: watch::Receiver<bool>,
    ) -> DownloadOutcome {
        let mut tick = interval(self.ctx.config.housekeeping_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pass = Pass {
            started: Instant::now(),
            downloaded: self.ctx.downloaded(),
            idle: 0,
        };

        loop {
            if *stop.borrow_and_update() {
                return DownloadOutcome::Failed(DownloadError::Stopped);
            }
            self.fill_pool();

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return DownloadOutcome::Failed(DownloadError::Stopped);
                    }
                }
                Some(event) = events.recv() => {
                    if let Some(outcome) = self.on_event(event) {
                        return outcome;
                    }
                }
                Some(joined) = self.sessions.join_next() => {
                    match joined {
                        Ok(report) => self.on_session_end(report),
                        Err(e) => warn!("peer session panicked: {}", e),
                    }
                    self.publish();
                }
                Some(round) = rounds.recv() => match round {
                    AnnounceRound::Peers(peers) => {
                        self.trackers = TrackerStatus::Reachable;
                        self.learn(peers);
                    }
                    AnnounceRound::Failed => self.trackers = TrackerStatus::Exhausted,
                },
                _ = tick.tick() => {
                    self.publish();
                    if let Some(outcome) = self.check_pass(&mut pass) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Closes the current pass once every known peer has been tried and
    /// either all sessions ended or the stall timeout ran out with some
    /// still open. Fails with `Exhausted` after enough passes without a
    /// downloaded byte while no tracker can supply more peers.
    fn check_pass(&mut self, pass: &mut Pass) -> Option<DownloadOutcome> {
        if !self.candidates.is_empty() {
            return None;
        }
        let stalled = pass.started.elapsed() >= self.ctx.config.stall_timeout;
        if !self.active.is_empty() && !stalled {
            return None;
        }

        let downloaded = self.ctx.downloaded();
        if downloaded > pass.downloaded {
            pass.idle = 0;
        } else {
            pass.idle += 1;
        }
        pass.downloaded = downloaded;
        pass.started = Instant::now();

        let trackers_usable = matches!(
            self.trackers,
            TrackerStatus::Pending | TrackerStatus::Reachable
        );
        if pass.idle >= self.ctx.config.max_idle_passes && !trackers_usable {
            debug!(
                "{} passes without progress, {} sessions still open",
                pass.idle,
                self.active.len()
            );
            return Some(DownloadOutcome::Failed(DownloadError::Exhausted));
        }

        debug!(
            "starting pass {} over {} known peers",
            pass.idle + 1,
            self.known.len()
        );
        let (banned, active) = (&self.banned, &self.active);
        self.candidates.extend(
            self.known
                .iter()
                .filter(|a| !banned.contains(a) && !active.contains(a))
                .copied(),
        );
        None
    }

    fn on_event(&mut self, event: SwarmEvent) -> Option<DownloadOutcome> {
        match event {
            SwarmEvent::PieceCompleted(index) => {
                self.publish();
                debug!("piece {} done", index);
                if self.ctx.is_complete() {
                    return Some(DownloadOutcome::Completed);
                }
            }
            SwarmEvent::HashMismatch { index, peers } => {
                for peer in peers {
                    self.strike(peer, index);
                }
            }
            SwarmEvent::WriterFailed { index, error } => {
                return Some(DownloadOutcome::Failed(DownloadError::WriterFailure {
                    piece: index,
                    source: error,
                }));
            }
        }
        None
    }

    fn strike(&mut self, peer: SocketAddr, index: u32) {
        let strikes = self.strikes.entry(peer).or_insert(0);
        *strikes += 1;

        let Some(threshold) = self.ctx.config.ban_after_hash_failures else {
            return;
        };
        if *strikes >= threshold && self.banned.insert(peer) {
            warn!(
                "banning {} after {} bad pieces (last: {})",
                peer, strikes, index
            );
            self.candidates.retain(|a| *a != peer);
            self.ctx.send_to(peer, PeerCommand::Close(CloseReason::Banned));
        }
    }

    fn on_session_end(&mut self, report: SessionReport) {
        self.active.remove(&report.addr);
        if report.connected {
            debug!("{}: disconnected ({})", report.addr, report.reason);
        } else {
            debug!("{}: unreachable ({})", report.addr, report.reason);
        }
    }

    /// Queues peers not seen before.
    fn learn(&mut self, peers: impl IntoIterator<Item = SocketAddr>) {
        for peer in peers {
            if self.known.insert(peer) {
                self.candidates.push_back(peer);
            }
        }
    }

    fn fill_pool(&mut self) {
        while self.active.len() < self.ctx.config.max_peers {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            if self.banned.contains(&addr) || !self.active.insert(addr) {
                continue;
            }
            self.sessions.spawn(session::run(Arc::clone(&self.ctx), addr));
        }
    }

    fn publish(&self) {
        self.progress.send_replace(self.ctx.progress());
    }
}
