//! Host side of the isolation boundary
//!
//! The `ProcessManager` owns the workers, knows which socket belongs to
//! which game and batches inbound frames per worker between host flushes.
//! Worker output arrives on one merged event channel that `run_manager`
//! drains; outbound frames and closes go to the transport via `SocketSink`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, GameConfig, ServerConfig};
use crate::game::constants::net::MAX_FRAMES_PER_BATCH;
use crate::game::constants::tick::STALLED_KEEP_ALIVES;
use crate::metrics::Metrics;
use crate::net::ipc::{
    self, EnvelopeReceiver, EnvelopeSender, HostMsg, SocketFrame, WorkerMsg, WorkerMsgKind,
};
use crate::net::worker::{spawn_worker, WorkerConfig};

/// Whatever owns the real sockets
pub trait SocketSink: Send + Sync {
    fn send(&self, socket_id: &str, data: Vec<u8>);
    fn close(&self, socket_id: &str);
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("All {0} workers are busy")]
    NoCapacity(usize),
    #[error("Unknown game: {0}")]
    UnknownGame(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One worker message, or `None` once the worker's channel closed
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: usize,
    pub msg: Option<WorkerMsg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    /// Create sent, waiting for Created
    Creating,
    Live,
}

struct GameEntry {
    worker: usize,
    state: GameState,
    is_private: bool,
    max_players: usize,
    sockets: HashSet<String>,
}

struct WorkerSlot {
    tx: EnvelopeSender,
    game: Option<String>,
    pending: Vec<SocketFrame>,
    last_seen: Instant,
    task: JoinHandle<()>,
}

pub struct ProcessManager {
    config: ServerConfig,
    worker_config: WorkerConfig,
    workers: HashMap<usize, WorkerSlot>,
    next_worker_id: usize,
    games: HashMap<String, GameEntry>,
    sockets: HashMap<String, String>,
    sink: Arc<dyn SocketSink>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    metrics: Arc<Metrics>,
}

/// Decode a worker's envelopes onto the shared event channel
fn spawn_forwarder(
    worker: usize,
    mut rx: EnvelopeReceiver,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let msg = match ipc::decode::<WorkerMsg>(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Worker {}: dropping malformed message: {}", worker, e);
                    continue;
                }
            };
            if events.send(WorkerEvent { worker, msg: Some(msg) }).is_err() {
                return;
            }
        }
        let _ = events.send(WorkerEvent { worker, msg: None });
    });
}

impl ProcessManager {
    pub fn new(
        config: ServerConfig,
        sink: Arc<dyn SocketSink>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            worker_config: WorkerConfig::from(&config),
            config,
            workers: HashMap::new(),
            next_worker_id: 0,
            games: HashMap::new(),
            sockets: HashMap::new(),
            sink,
            events_tx,
            metrics,
        };
        (manager, events_rx)
    }

    fn idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .filter(|(_, slot)| slot.game.is_none())
            .map(|(&id, _)| id)
            .min()
    }

    fn spawn_worker(&mut self) -> usize {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let handle = spawn_worker(id, self.worker_config, self.metrics.clone());
        spawn_forwarder(id, handle.rx, self.events_tx.clone());
        self.workers.insert(
            id,
            WorkerSlot {
                tx: handle.tx,
                game: None,
                pending: Vec::new(),
                last_seen: Instant::now(),
                task: handle.task,
            },
        );
        self.metrics.workers.fetch_add(1, Ordering::Relaxed);
        info!("Spawned worker {} ({} total)", id, self.workers.len());
        id
    }

    /// Start a new game on an idle (or newly spawned) worker
    pub fn create_game(&mut self, config: GameConfig) -> Result<String, ManagerError> {
        config.validate()?;
        let blob = config.to_blob()?;

        let worker = match self.idle_worker() {
            Some(id) => id,
            None if self.workers.len() < self.config.worker_count => self.spawn_worker(),
            None => return Err(ManagerError::NoCapacity(self.workers.len())),
        };

        let game_id = Uuid::new_v4().to_string();
        let create = HostMsg::Create {
            game_id: game_id.clone(),
            config: blob,
        };
        if !self.send_to_worker(worker, &create) {
            self.worker_died(worker);
            return Err(ManagerError::NoCapacity(self.workers.len()));
        }

        if let Some(slot) = self.workers.get_mut(&worker) {
            slot.game = Some(game_id.clone());
        }
        self.games.insert(
            game_id.clone(),
            GameEntry {
                worker,
                state: GameState::Creating,
                is_private: false,
                max_players: config.max_players,
                sockets: HashSet::new(),
            },
        );
        info!("Game {} assigned to worker {}", game_id, worker);
        Ok(game_id)
    }

    /// A public game with room for one more socket, creating one if needed
    pub fn find_or_create_game(&mut self) -> Result<String, ManagerError> {
        let open = self
            .games
            .iter()
            .filter(|(_, g)| !g.is_private && g.sockets.len() < g.max_players)
            .min_by_key(|(_, g)| (g.state != GameState::Live, g.worker))
            .map(|(id, _)| id.clone());
        match open {
            Some(id) => Ok(id),
            None => self.create_game(self.config.default_game_config()),
        }
    }

    /// Route a socket's traffic to `game_id`
    pub fn attach_socket(&mut self, socket_id: &str, game_id: &str) -> Result<(), ManagerError> {
        let game = self
            .games
            .get_mut(game_id)
            .ok_or_else(|| ManagerError::UnknownGame(game_id.to_owned()))?;
        game.sockets.insert(socket_id.to_owned());
        self.sockets.insert(socket_id.to_owned(), game_id.to_owned());
        debug!("Socket {} attached to game {}", socket_id, game_id);
        Ok(())
    }

    fn worker_for_socket(&self, socket_id: &str) -> Option<usize> {
        let game_id = self.sockets.get(socket_id)?;
        self.games.get(game_id).map(|g| g.worker)
    }

    /// Queue an inbound frame for the next host flush
    pub fn on_socket_data(&mut self, socket_id: &str, ip: &str, data: Vec<u8>) {
        let slot = self
            .worker_for_socket(socket_id)
            .and_then(|worker| self.workers.get_mut(&worker));
        match slot {
            Some(slot) => {
                self.metrics.record_frames_in(1, data.len() as u64);
                slot.pending.push(SocketFrame::new(socket_id, ip, data));
            }
            None => {
                debug!("Dropping frame from unmapped socket {}", socket_id);
                self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The transport lost this socket
    pub fn on_socket_close(&mut self, socket_id: &str) {
        let Some(game_id) = self.sockets.remove(socket_id) else {
            return;
        };
        let Some(game) = self.games.get_mut(&game_id) else {
            return;
        };
        game.sockets.remove(socket_id);
        let worker = game.worker;

        // Frames already queued for this socket must arrive before the close
        self.flush_worker(worker);
        let msg = HostMsg::SocketClose {
            socket_id: socket_id.to_owned(),
        };
        if !self.send_to_worker(worker, &msg) {
            self.worker_died(worker);
        }
    }

    /// Forward join tokens right away
    pub fn add_join_tokens(
        &mut self,
        game_id: &str,
        tokens: Vec<String>,
        is_private: bool,
    ) -> Result<(), ManagerError> {
        let game = self
            .games
            .get_mut(game_id)
            .ok_or_else(|| ManagerError::UnknownGame(game_id.to_owned()))?;
        if is_private {
            game.is_private = true;
        }
        let worker = game.worker;
        let msg = HostMsg::AddJoinToken { tokens, is_private };
        if !self.send_to_worker(worker, &msg) {
            self.worker_died(worker);
        }
        Ok(())
    }

    fn send_to_worker(&self, worker: usize, msg: &HostMsg) -> bool {
        self.workers
            .get(&worker)
            .map(|slot| ipc::send_envelope(&slot.tx, msg))
            .unwrap_or(false)
    }

    fn flush_worker(&mut self, worker: usize) {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return;
        };
        if slot.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut slot.pending);
        let mut ok = true;
        let mut frames = pending.into_iter().peekable();
        while ok && frames.peek().is_some() {
            let batch: Vec<SocketFrame> = frames.by_ref().take(MAX_FRAMES_PER_BATCH).collect();
            ok = ipc::send_envelope(&slot.tx, &HostMsg::SocketMsg(batch));
        }
        if !ok {
            self.worker_died(worker);
        }
    }

    /// Send every worker its queued inbound frames as one batch
    pub fn flush_pending(&mut self) {
        let busy: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, slot)| !slot.pending.is_empty())
            .map(|(&id, _)| id)
            .collect();
        for worker in busy {
            self.flush_worker(worker);
        }
    }

    pub fn handle_worker_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { worker, msg } = event;
        let Some(msg) = msg else {
            if self.workers.contains_key(&worker) {
                self.worker_died(worker);
            }
            return;
        };
        let Some(slot) = self.workers.get_mut(&worker) else {
            return;
        };
        slot.last_seen = Instant::now();
        let game_id = slot.game.clone();

        match msg.kind {
            WorkerMsgKind::Created => {
                if let Some(game) = game_id.as_ref().and_then(|id| self.games.get_mut(id)) {
                    if game.state == GameState::Creating {
                        game.state = GameState::Live;
                        self.metrics.games_active.fetch_add(1, Ordering::Relaxed);
                        info!("Game {} live on worker {}", game_id.as_deref().unwrap_or(""), worker);
                    }
                }
            }
            WorkerMsgKind::SocketMsg(frames) => {
                for frame in frames {
                    self.sink.send(&frame.socket_id, frame.data);
                }
            }
            WorkerMsgKind::SocketClose { socket_id } => {
                if let Some(game_id) = self.sockets.remove(&socket_id) {
                    if let Some(game) = self.games.get_mut(&game_id) {
                        game.sockets.remove(&socket_id);
                    }
                }
                self.sink.close(&socket_id);
            }
            WorkerMsgKind::KeepAlive => {
                debug!("Worker {} idle", worker);
            }
        }

        if msg.stopped {
            self.release_game(worker);
        }
    }

    /// Forget the worker's game and close whatever sockets it still had
    fn release_game(&mut self, worker: usize) {
        let Some(slot) = self.workers.get_mut(&worker) else {
            return;
        };
        slot.pending.clear();
        let Some(game_id) = slot.game.take() else {
            return;
        };
        let Some(game) = self.games.remove(&game_id) else {
            return;
        };
        if game.state == GameState::Live {
            let _ = self.metrics.games_active.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |v| Some(v.saturating_sub(1)),
            );
        }
        for socket_id in &game.sockets {
            self.sockets.remove(socket_id);
            self.sink.close(socket_id);
        }
        info!(
            "Game {} released from worker {} ({} sockets closed)",
            game_id,
            worker,
            game.sockets.len()
        );
    }

    fn worker_died(&mut self, worker: usize) {
        warn!("Worker {} is gone, releasing its game", worker);
        self.metrics.worker_failures.fetch_add(1, Ordering::Relaxed);
        self.release_game(worker);
        if let Some(slot) = self.workers.remove(&worker) {
            slot.task.abort();
            self.metrics.workers.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Drop every worker channel; workers exit on their own
    pub fn shutdown(&mut self) {
        let workers: Vec<usize> = self.workers.keys().copied().collect();
        for worker in workers {
            self.release_game(worker);
        }
        let count = self.workers.len() as u64;
        self.workers.clear();
        self.metrics.workers.fetch_sub(count, Ordering::Relaxed);
        info!("Process manager shut down");
    }

    pub fn game_state(&self, game_id: &str) -> Option<GameState> {
        self.games.get(game_id).map(|g| g.state)
    }

    pub fn socket_game(&self, socket_id: &str) -> Option<&str> {
        self.sockets.get(socket_id).map(String::as_str)
    }

    pub fn game_count(&self) -> usize {
        self.games.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Idle workers keep-alive on a fixed schedule; one that has missed
    /// `STALLED_KEEP_ALIVES` of them is treated as dead. Workers running a
    /// game are quiet whenever they have nothing to send and are skipped.
    pub fn reap_stalled_workers(&mut self) -> usize {
        let limit = self.worker_config.keep_alive_interval * STALLED_KEEP_ALIVES;
        let stalled: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, slot)| slot.game.is_none() && slot.last_seen.elapsed() > limit)
            .map(|(&id, _)| id)
            .collect();
        for &worker in &stalled {
            warn!("Worker {} missed {} keep-alives", worker, STALLED_KEEP_ALIVES);
            self.worker_died(worker);
        }
        stalled.len()
    }
}

/// Drain worker events and run the host flush schedule
pub async fn run_manager(
    manager: Arc<RwLock<ProcessManager>>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    host_flush: Duration,
) {
    let mut flush = interval(host_flush);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let keep_alive = manager.read().await.worker_config.keep_alive_interval;
    let mut reap = interval(keep_alive);
    reap.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => manager.write().await.handle_worker_event(event),
                None => break,
            },
            _ = flush.tick() => manager.write().await.flush_pending(),
            _ = reap.tick() => {
                manager.write().await.reap_stalled_workers();
            }
        }
    }
}
