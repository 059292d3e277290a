//! Execution unit: one task owning at most one `GameInstance`
//!
//! The host talks to a worker only through two channels of bincode
//! envelopes. Inbound `HostMsg`s, the tick timer and the flush timer are all serviced by the
//! same `select!` loop, so a tick never interleaves with message handling
//! and a flush always sees every tick before it. Instance code runs under
//! `catch_unwind`: a panicking game is dropped and reported as stopped
//! while the worker keeps serving.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{GameConfig, ServerConfig};
use crate::game::constants::net::MAX_FRAMES_PER_BATCH;
use crate::game::instance::{GameInstance, SyncOutput};
use crate::metrics::Metrics;
use crate::net::ipc::{
    self, EnvelopeReceiver, EnvelopeSender, HostMsg, SocketFrame, WorkerMsg, WorkerMsgKind,
};

/// Worker schedules
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub tick_interval: Duration,
    pub flush_interval: Duration,
    pub keep_alive_interval: Duration,
}

impl From<&ServerConfig> for WorkerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            flush_interval: config.flush_interval(),
            keep_alive_interval: config.keep_alive_interval(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Host side of a spawned worker. `tx` carries encoded `HostMsg`s, `rx`
/// encoded `WorkerMsg`s.
pub struct WorkerHandle {
    pub id: usize,
    pub tx: EnvelopeSender,
    pub rx: EnvelopeReceiver,
    pub task: JoinHandle<()>,
}

/// Spawn a worker task on the current runtime
pub fn spawn_worker(id: usize, config: WorkerConfig, metrics: Arc<Metrics>) -> WorkerHandle {
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let worker = Worker::new(id, config, host_rx, worker_tx, metrics);
    let task = tokio::spawn(worker.run());
    WorkerHandle {
        id,
        tx: host_tx,
        rx: worker_rx,
        task,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

pub struct Worker {
    id: usize,
    config: WorkerConfig,
    instance: Option<GameInstance>,
    inbox: EnvelopeReceiver,
    outbox: EnvelopeSender,
    metrics: Arc<Metrics>,
    host_gone: bool,
    // This worker's share of the shared entity gauges
    reported_decals: u64,
    reported_smokes: u64,
}

impl Worker {
    pub fn new(
        id: usize,
        config: WorkerConfig,
        inbox: EnvelopeReceiver,
        outbox: EnvelopeSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            config,
            instance: None,
            inbox,
            outbox,
            metrics,
            host_gone: false,
            reported_decals: 0,
            reported_smokes: 0,
        }
    }

    pub async fn run(mut self) {
        let mut tick = interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut keep_alive = interval(self.config.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("Worker {} started", self.id);

        while !self.host_gone {
            tokio::select! {
                // Tick before flush when both are due
                biased;
                _ = tick.tick() => self.tick(),
                _ = flush.tick() => self.flush(),
                bytes = self.inbox.recv() => match bytes {
                    Some(bytes) => self.receive(&bytes),
                    None => break,
                },
                _ = keep_alive.tick() => self.keep_alive(),
            }
        }

        self.drop_instance();
        debug!("Worker {} exiting", self.id);
    }

    fn send(&mut self, msg: WorkerMsg) {
        if !ipc::send_envelope(&self.outbox, &msg) {
            self.host_gone = true;
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        match ipc::decode::<HostMsg>(bytes) {
            Ok(msg) => self.handle(msg),
            Err(e) => warn!("Worker {}: dropping malformed host message: {}", self.id, e),
        }
    }

    /// Run `f` against the live instance, converting a panic into a stop
    fn guarded<T>(&mut self, op: &str, f: impl FnOnce(&mut GameInstance) -> T) -> Option<T> {
        let instance = self.instance.as_mut()?;
        match catch_unwind(AssertUnwindSafe(|| f(instance))) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.fail(op, payload.as_ref());
                None
            }
        }
    }

    fn fail(&mut self, op: &str, payload: &(dyn Any + Send)) {
        let game_id = self
            .instance
            .as_ref()
            .map(|i| i.game_id().to_owned())
            .unwrap_or_default();
        error!(
            "Worker {}: game {} panicked in {}: {}",
            self.id,
            game_id,
            op,
            panic_message(payload)
        );
        self.metrics.worker_failures.fetch_add(1, Ordering::Relaxed);
        self.drop_instance();
        self.send(WorkerMsg::stopped(WorkerMsgKind::SocketMsg(Vec::new())));
    }

    fn drop_instance(&mut self) {
        if self.instance.take().is_some() {
            self.metrics.instances_stopped.fetch_add(1, Ordering::Relaxed);
        }
        self.report_entities(0, 0);
    }

    fn report_entities(&mut self, decals: u64, smokes: u64) {
        Metrics::shift_gauge(&self.metrics.decals, self.reported_decals, decals);
        Metrics::shift_gauge(&self.metrics.smokes, self.reported_smokes, smokes);
        self.reported_decals = decals;
        self.reported_smokes = smokes;
    }

    fn handle(&mut self, msg: HostMsg) {
        match msg {
            HostMsg::Create { game_id, config } => self.create(game_id, &config),
            HostMsg::SocketMsg(frames) => {
                if self.instance.is_none() {
                    debug!("Worker {}: no game, dropping {} frames", self.id, frames.len());
                    self.metrics
                        .frames_dropped
                        .fetch_add(frames.len() as u64, Ordering::Relaxed);
                    return;
                }
                for frame in frames {
                    let handled = self.guarded("socket message", |game| {
                        game.handle_socket_msg(&frame.socket_id, &frame.ip, &frame.data)
                    });
                    if handled.is_none() {
                        break;
                    }
                }
            }
            HostMsg::SocketClose { socket_id } => {
                self.guarded("socket close", |game| game.handle_socket_close(&socket_id));
            }
            HostMsg::AddJoinToken { tokens, is_private } => {
                self.guarded("join tokens", |game| game.add_join_tokens(tokens, is_private));
            }
        }
    }

    fn create(&mut self, game_id: String, blob: &[u8]) {
        if let Some(existing) = &self.instance {
            if existing.game_id() == game_id {
                debug!("Worker {}: duplicate create for game {}", self.id, game_id);
            } else {
                warn!(
                    "Worker {}: create for game {} while game {} is live, ignoring",
                    self.id,
                    game_id,
                    existing.game_id()
                );
            }
            return;
        }

        let config = match GameConfig::from_blob(blob) {
            Ok(config) => config,
            Err(e) => {
                warn!("Worker {}: cannot create game {}: {}", self.id, game_id, e);
                self.send(WorkerMsg::stopped(WorkerMsgKind::SocketMsg(Vec::new())));
                return;
            }
        };

        let built = catch_unwind(AssertUnwindSafe(|| {
            let mut instance = GameInstance::new(game_id.clone(), config);
            instance.init();
            instance
        }));
        match built {
            Ok(instance) => {
                info!("Worker {}: game {} created", self.id, game_id);
                self.instance = Some(instance);
                self.send(WorkerMsg::new(WorkerMsgKind::Created));
            }
            Err(payload) => self.fail("create", payload.as_ref()),
        }
    }

    fn tick(&mut self) {
        let dt = self.config.tick_interval.as_secs_f32();
        let start = Instant::now();
        let counts = self.guarded("tick", |game| {
            if game.is_running() {
                game.update(dt);
            }
            (game.decals().len() as u64, game.smokes().len() as u64)
        });
        if let Some((decals, smokes)) = counts {
            self.metrics.record_tick_time(start.elapsed());
            self.report_entities(decals, smokes);
        }
    }

    fn flush(&mut self) {
        let Some(out) = self.guarded("flush", GameInstance::net_sync) else {
            return;
        };
        if out.is_empty() {
            return;
        }
        let stopped = out.stopped;
        self.forward(out);
        if stopped {
            if let Some(game) = &self.instance {
                info!("Worker {}: game {} finished", self.id, game.game_id());
            }
            self.drop_instance();
        }
    }

    /// Send one flush upstream; the last message carries the stop flag
    fn forward(&mut self, out: SyncOutput) {
        let SyncOutput {
            frames,
            closes,
            stopped,
        } = out;

        let bytes: usize = frames.iter().map(|f| f.data.len()).sum();
        self.metrics
            .record_frames_out(frames.len() as u64, bytes as u64);

        let mut batches: Vec<WorkerMsgKind> = Vec::new();
        let mut frames = frames.into_iter().peekable();
        while frames.peek().is_some() {
            let batch: Vec<SocketFrame> = frames.by_ref().take(MAX_FRAMES_PER_BATCH).collect();
            batches.push(WorkerMsgKind::SocketMsg(batch));
        }
        batches.extend(
            closes
                .into_iter()
                .map(|socket_id| WorkerMsgKind::SocketClose { socket_id }),
        );
        if batches.is_empty() {
            batches.push(WorkerMsgKind::SocketMsg(Vec::new()));
        }

        let last = batches.len() - 1;
        for (i, kind) in batches.into_iter().enumerate() {
            let msg = WorkerMsg {
                kind,
                stopped: stopped && i == last,
            };
            self.send(msg);
        }
    }

    fn keep_alive(&mut self) {
        if self.instance.is_none() {
            self.metrics.keep_alives.fetch_add(1, Ordering::Relaxed);
            self.send(WorkerMsg::new(WorkerMsgKind::KeepAlive));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::net::PROTOCOL_VERSION;
    use crate::net::protocol::{ClientMsg, JoinMsg, ServerMsg};
    use crate::net::stream::{decode, encode};
    use tokio::time::timeout;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            tick_interval: Duration::from_millis(5),
            flush_interval: Duration::from_millis(5),
            keep_alive_interval: Duration::from_millis(20),
        }
    }

    fn create_msg(game_id: &str, config: GameConfig) -> HostMsg {
        HostMsg::Create {
            game_id: game_id.into(),
            config: config.to_blob().unwrap(),
        }
    }

    fn join_frame(socket_id: &str) -> SocketFrame {
        let data = encode(&ClientMsg::Join(JoinMsg {
            protocol: PROTOCOL_VERSION,
            name: socket_id.into(),
            ..Default::default()
        }))
        .unwrap();
        SocketFrame::new(socket_id, "127.0.0.1", data)
    }

    fn send(handle: &WorkerHandle, msg: HostMsg) {
        handle.tx.send(ipc::encode(&msg).unwrap()).unwrap();
    }

    fn open(bytes: Vec<u8>) -> WorkerMsg {
        ipc::decode(&bytes).unwrap()
    }

    /// Everything the worker sends within `window`
    async fn collect(rx: &mut EnvelopeReceiver, window: Duration) -> Vec<WorkerMsg> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(bytes)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            out.push(open(bytes));
        }
        out
    }

    /// Wait for the first message matching `pred`
    async fn wait_for(
        rx: &mut EnvelopeReceiver,
        pred: impl Fn(&WorkerMsg) -> bool,
    ) -> WorkerMsg {
        timeout(Duration::from_secs(2), async {
            loop {
                let msg = open(rx.recv().await.expect("worker channel closed"));
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for worker message")
    }

    #[tokio::test]
    async fn test_create_acknowledged_once() {
        let mut handle = spawn_worker(0, fast_config(), Arc::new(Metrics::new()));
        send(&handle, create_msg("A", GameConfig::default()));
        send(&handle, create_msg("A", GameConfig::default()));
        // A different id while A is live is rejected
        send(&handle, create_msg("B", GameConfig::default()));

        let msgs = collect(&mut handle.rx, Duration::from_millis(150)).await;
        let created = msgs
            .iter()
            .filter(|m| m.kind == WorkerMsgKind::Created)
            .count();
        assert_eq!(created, 1);
        assert!(msgs.iter().all(|m| !m.stopped));

        // No keep-alives once a game is live
        let after_created: Vec<_> = msgs
            .iter()
            .skip_while(|m| m.kind != WorkerMsgKind::Created)
            .collect();
        assert!(after_created
            .iter()
            .all(|m| m.kind != WorkerMsgKind::KeepAlive));
    }

    #[tokio::test]
    async fn test_socket_batch_order_preserved() {
        let mut handle = spawn_worker(0, fast_config(), Arc::new(Metrics::new()));
        let config = GameConfig {
            max_players: 3,
            ..GameConfig::default()
        };
        send(&handle, create_msg("A", config));
        wait_for(&mut handle.rx, |m| m.kind == WorkerMsgKind::Created).await;

        // Fill the game, then three more joins that will all be turned away
        send(
            &handle,
            HostMsg::SocketMsg(vec![join_frame("p1"), join_frame("p2"), join_frame("p3")]),
        );
        send(
            &handle,
            HostMsg::SocketMsg(vec![join_frame("x"), join_frame("y"), join_frame("z")]),
        );

        let mut closes = Vec::new();
        let mut rejected = Vec::new();
        timeout(Duration::from_secs(2), async {
            while closes.len() < 3 {
                let msg = open(handle.rx.recv().await.unwrap());
                match msg.kind {
                    WorkerMsgKind::SocketMsg(frames) => {
                        for frame in frames {
                            if let Ok(ServerMsg::Disconnect(_)) = decode::<ServerMsg>(&frame.data) {
                                rejected.push(frame.socket_id);
                            }
                        }
                    }
                    WorkerMsgKind::SocketClose { socket_id } => closes.push(socket_id),
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(rejected, vec!["x", "y", "z"]);
        assert_eq!(closes, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_keep_alive_only_when_idle() {
        let metrics = Arc::new(Metrics::new());
        let mut handle = spawn_worker(0, fast_config(), metrics.clone());

        let idle = collect(&mut handle.rx, Duration::from_millis(70)).await;
        let keep_alives = idle
            .iter()
            .filter(|m| m.kind == WorkerMsgKind::KeepAlive)
            .count();
        assert!(keep_alives >= 2, "got {} keep-alives", keep_alives);
        assert!(metrics.keep_alives.load(Ordering::Relaxed) >= 2);

        send(&handle, create_msg("A", GameConfig::default()));
        wait_for(&mut handle.rx, |m| m.kind == WorkerMsgKind::Created).await;
        let busy = collect(&mut handle.rx, Duration::from_millis(70)).await;
        assert!(busy.iter().all(|m| m.kind != WorkerMsgKind::KeepAlive));
    }

    #[tokio::test]
    async fn test_stopped_reported_once_then_worker_reusable() {
        let metrics = Arc::new(Metrics::new());
        let mut handle = spawn_worker(0, fast_config(), metrics.clone());
        let short = GameConfig {
            max_duration_secs: 0.02,
            ..GameConfig::default()
        };
        send(&handle, create_msg("A", short));

        let msgs = collect(&mut handle.rx, Duration::from_millis(150)).await;
        assert_eq!(msgs.iter().filter(|m| m.stopped).count(), 1);
        let stop_at = msgs.iter().position(|m| m.stopped).unwrap();
        assert!(msgs[..stop_at]
            .iter()
            .any(|m| m.kind == WorkerMsgKind::Created));
        // Idle again afterwards
        assert!(msgs[stop_at..]
            .iter()
            .any(|m| m.kind == WorkerMsgKind::KeepAlive));
        assert_eq!(metrics.instances_stopped.load(Ordering::Relaxed), 1);

        send(&handle, create_msg("B", GameConfig::default()));
        wait_for(&mut handle.rx, |m| m.kind == WorkerMsgKind::Created).await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_players_in_final_flush() {
        let mut handle = spawn_worker(0, fast_config(), Arc::new(Metrics::new()));
        let short = GameConfig {
            max_duration_secs: 0.1,
            ..GameConfig::default()
        };
        send(&handle, create_msg("A", short));
        wait_for(&mut handle.rx, |m| m.kind == WorkerMsgKind::Created).await;
        send(&handle, HostMsg::SocketMsg(vec![join_frame("p1")]));

        let last = wait_for(&mut handle.rx, |m| m.stopped).await;
        assert_eq!(
            last.kind,
            WorkerMsgKind::SocketClose {
                socket_id: "p1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_bad_config_reports_stopped_without_created() {
        let mut handle = spawn_worker(0, fast_config(), Arc::new(Metrics::new()));
        send(
            &handle,
            HostMsg::Create {
                game_id: "A".into(),
                config: b"{broken".to_vec(),
            },
        );

        let msg = wait_for(&mut handle.rx, |m| m.kind != WorkerMsgKind::KeepAlive).await;
        assert!(msg.stopped);
        assert_eq!(msg.kind, WorkerMsgKind::SocketMsg(Vec::new()));
    }

    #[tokio::test]
    async fn test_frames_without_game_are_dropped() {
        let metrics = Arc::new(Metrics::new());
        let mut handle = spawn_worker(0, fast_config(), metrics.clone());
        send(&handle, HostMsg::SocketMsg(vec![join_frame("p1"), join_frame("p2")]));
        send(
            &handle,
            HostMsg::SocketClose {
                socket_id: "p1".into(),
            },
        );

        let msgs = collect(&mut handle.rx, Duration::from_millis(50)).await;
        assert!(msgs.iter().all(|m| m.kind == WorkerMsgKind::KeepAlive));
        assert_eq!(metrics.frames_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_worker_exits_when_host_drops() {
        let handle = spawn_worker(0, fast_config(), Arc::new(Metrics::new()));
        let WorkerHandle { tx, rx, task, .. } = handle;
        drop(tx);
        drop(rx);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_envelope_dropped() {
        let mut handle = spawn_worker(0, fast_config(), Arc::new(Metrics::new()));
        handle.tx.send(vec![0xff, 0xff, 0xff, 0xff, 0x01]).unwrap();
        send(&handle, create_msg("A", GameConfig::default()));

        let msg = wait_for(&mut handle.rx, |m| m.kind != WorkerMsgKind::KeepAlive).await;
        assert_eq!(msg, WorkerMsg::new(WorkerMsgKind::Created));
    }

    #[tokio::test]
    async fn test_panicking_game_is_dropped_and_worker_recovers() {
        let metrics = Arc::new(Metrics::new());
        let (_host_tx, host_rx) = mpsc::unbounded_channel();
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let mut worker = Worker::new(0, fast_config(), host_rx, worker_tx, metrics.clone());

        worker.create("A".into(), &GameConfig::default().to_blob().unwrap());
        assert_eq!(open(worker_rx.try_recv().unwrap()).kind, WorkerMsgKind::Created);
        assert!(worker.instance.is_some());

        let out: Option<()> = worker.guarded("tick", |_| panic!("boom"));
        assert!(out.is_none());
        assert!(worker.instance.is_none());
        assert_eq!(
            open(worker_rx.try_recv().unwrap()),
            WorkerMsg::stopped(WorkerMsgKind::SocketMsg(Vec::new()))
        );
        assert_eq!(metrics.worker_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.instances_stopped.load(Ordering::Relaxed), 1);

        worker.handle(create_msg("B", GameConfig::default()));
        assert_eq!(open(worker_rx.try_recv().unwrap()).kind, WorkerMsgKind::Created);
        assert_eq!(worker.instance.as_ref().map(|g| g.game_id()), Some("B"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
