//! One game session: entities, joined sockets and the tick / flush cycle
//!
//! `GameInstance` is driven from a single task. `update` advances the
//! simulation by one step, `net_sync` turns everything that changed since
//! the previous flush into outbound frames, and the `handle_*` methods apply
//! inbound traffic. Nothing here blocks or awaits.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashSet;
use tracing::{debug, info, trace, warn};

use crate::config::GameConfig;
use crate::game::constants::net::{MAX_NAME_LEN, MAX_OBJECTS_PER_FRAME, PROTOCOL_VERSION};
use crate::game::constants::tick::TICK_RATE;
use crate::game::decal::{Decal, DecalBarn, SpawnError};
use crate::game::entity::{EntityId, EntityType, GameEntity};
use crate::game::registry::{EntityRegistry, RegistryChanges};
use crate::game::smoke::{Smoke, SmokeBarn};
use crate::net::connection::{ConnectionTable, PlayerConnection};
use crate::net::ipc::SocketFrame;
use crate::net::join_tokens::JoinTokenStore;
use crate::net::protocol::{
    ClientMsg, DisconnectMsg, FullObject, JoinMsg, JoinedMsg, ObjectPart, ObjectSnapshot,
    PartObject, PongMsg, ServerMsg, UpdateMsg,
};
use crate::net::stream::{decode, encode, DecodeError};
use crate::util::vec2::Vec2;

/// Disconnect reasons sent to clients
pub mod reason {
    pub const GAME_OVER: &str = "game_over";
    pub const INVALID_PROTOCOL: &str = "invalid_protocol";
    pub const GAME_FULL: &str = "game_full";
    pub const INVALID_JOIN_TOKEN: &str = "invalid_join_token";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Uninitialized,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called
    Shutdown,
    /// Everyone left and nobody came back in time
    EmptyTimeout,
    /// Hit the simulated-time cap
    MaxDuration,
}

/// Everything one flush produced
#[derive(Debug, Default)]
pub struct SyncOutput {
    /// Outbound frames; frames for one socket keep their queue order
    pub frames: Vec<SocketFrame>,
    /// Sockets to close once `frames` went out
    pub closes: Vec<String>,
    /// Set on exactly one flush: the first one after the instance stopped
    pub stopped: bool,
}

impl SyncOutput {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.closes.is_empty() && !self.stopped
    }
}

pub struct GameInstance {
    game_id: String,
    config: GameConfig,
    status: InstanceStatus,
    stop_reason: Option<StopReason>,
    stop_reported: bool,
    registry: EntityRegistry,
    decals: DecalBarn,
    smokes: SmokeBarn,
    connections: ConnectionTable,
    join_tokens: JoinTokenStore,
    /// Frames for sockets without a connection (rejected joins)
    loose_frames: Vec<SocketFrame>,
    pending_closes: Vec<String>,
    rng: StdRng,
    /// Simulated seconds since init
    now: f64,
    ticks: u64,
    had_players: bool,
    empty_since: Option<f64>,
    is_private: bool,
}

fn encode_server(msg: &ServerMsg) -> Option<Vec<u8>> {
    match encode(msg) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode server message: {}", e);
            None
        }
    }
}

/// Trim, strip control characters and cap at `MAX_NAME_LEN` bytes
fn sanitize_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len().min(MAX_NAME_LEN));
    for ch in raw.trim().chars().filter(|c| !c.is_control()) {
        if name.len() + ch.len_utf8() > MAX_NAME_LEN {
            break;
        }
        name.push(ch);
    }
    if name.is_empty() {
        "Player".to_owned()
    } else {
        name
    }
}

/// Pack objects into update messages of at most `MAX_OBJECTS_PER_FRAME`
/// entries each, keeping deletions ahead of creations
fn split_update(
    deleted: Vec<EntityId>,
    full: Vec<FullObject>,
    part: Vec<PartObject>,
) -> Vec<UpdateMsg> {
    let mut msgs = Vec::new();
    let mut current = UpdateMsg::default();
    let mut used = 0;

    macro_rules! push_into {
        ($items:expr, $field:ident) => {
            for item in $items {
                if used == MAX_OBJECTS_PER_FRAME {
                    msgs.push(std::mem::take(&mut current));
                    used = 0;
                }
                current.$field.push(item);
                used += 1;
            }
        };
    }
    push_into!(deleted, deleted_ids);
    push_into!(full, full_objects);
    push_into!(part, part_objects);

    if used > 0 {
        msgs.push(current);
    }
    msgs
}

fn encode_updates(msgs: Vec<UpdateMsg>) -> Vec<Vec<u8>> {
    msgs.into_iter()
        .filter_map(|msg| encode_server(&ServerMsg::Update(msg)))
        .collect()
}

fn decal_object(decal: &Decal) -> FullObject {
    FullObject {
        id: decal.id(),
        snapshot: ObjectSnapshot::Decal {
            part: decal.part_data(),
            full: decal.full_data(),
        },
    }
}

fn smoke_object(smoke: &Smoke) -> FullObject {
    FullObject {
        id: smoke.id(),
        snapshot: ObjectSnapshot::Smoke {
            part: smoke.part_data(),
            full: smoke.full_data(),
        },
    }
}

impl GameInstance {
    pub fn new(game_id: impl Into<String>, config: GameConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            game_id: game_id.into(),
            config,
            status: InstanceStatus::Uninitialized,
            stop_reason: None,
            stop_reported: false,
            registry: EntityRegistry::new(),
            decals: DecalBarn::default(),
            smokes: SmokeBarn::new(),
            connections: ConnectionTable::new(),
            join_tokens: JoinTokenStore::new(),
            loose_frames: Vec::new(),
            pending_closes: Vec::new(),
            rng,
            now: 0.0,
            ticks: 0,
            had_players: false,
            empty_since: None,
            is_private: false,
        }
    }

    /// One-time setup; moves the instance to `Running`
    pub fn init(&mut self) {
        if self.status != InstanceStatus::Uninitialized {
            warn!(
                "Game {}: init while {:?}, ignoring",
                self.game_id, self.status
            );
            return;
        }
        self.status = InstanceStatus::Running;
        info!(
            "Game {} running (map={}, max_players={})",
            self.game_id, self.config.map_name, self.config.max_players
        );
    }

    fn ensure_running(&self, op: &str) -> bool {
        if self.status == InstanceStatus::Running {
            return true;
        }
        warn!(
            "Game {}: {} while {:?}, ignoring",
            self.game_id, op, self.status
        );
        false
    }

    /// Advance the simulation by `dt` seconds
    pub fn update(&mut self, dt: f32) {
        if !self.ensure_running("update") {
            return;
        }
        if !dt.is_finite() || dt <= 0.0 {
            debug!("Game {}: skipping update with dt={}", self.game_id, dt);
            return;
        }

        self.now += dt as f64;
        self.ticks += 1;

        self.decals.update(dt, &mut self.registry);
        self.smokes.update(dt, &mut self.registry);
        self.join_tokens.purge_expired(self.now);

        if let Some(reason) = self.exhaustion() {
            self.stop_with(reason);
        }
    }

    fn exhaustion(&self) -> Option<StopReason> {
        if self.now >= self.config.max_duration_secs as f64 {
            return Some(StopReason::MaxDuration);
        }
        match self.empty_since {
            Some(since)
                if self.had_players
                    && self.now - since >= self.config.empty_timeout_secs as f64 =>
            {
                Some(StopReason::EmptyTimeout)
            }
            _ => None,
        }
    }

    /// Stop the instance; reported by the next `net_sync`
    pub fn stop(&mut self) {
        if self.status == InstanceStatus::Stopped {
            warn!("Game {}: stop while already stopped, ignoring", self.game_id);
            return;
        }
        self.stop_with(StopReason::Shutdown);
    }

    fn stop_with(&mut self, reason: StopReason) {
        self.status = InstanceStatus::Stopped;
        self.stop_reason = Some(reason);

        let farewell = encode_server(&ServerMsg::Disconnect(DisconnectMsg {
            reason: reason::GAME_OVER.into(),
        }));
        for conn in self.connections.iter_mut() {
            if let Some(frame) = &farewell {
                conn.queue(frame.clone());
            }
            self.pending_closes.push(conn.socket_id.clone());
        }

        info!(
            "Game {} stopped ({:?}) after {} ticks, {:.1}s, {} players connected",
            self.game_id,
            reason,
            self.ticks,
            self.now,
            self.connections.len()
        );
    }

    /// Serialize everything that changed since the previous flush
    pub fn net_sync(&mut self) -> SyncOutput {
        match self.status {
            InstanceStatus::Uninitialized => {
                warn!("Game {}: net_sync before init, ignoring", self.game_id);
                return SyncOutput::default();
            }
            InstanceStatus::Stopped if self.stop_reported => {
                warn!("Game {}: net_sync after stop, ignoring", self.game_id);
                return SyncOutput::default();
            }
            _ => {}
        }

        let stopping = self.status == InstanceStatus::Stopped;
        let changes = self.registry.take_changes();

        let (mut delta, mut snapshot) = (Vec::new(), Vec::new());
        if !stopping {
            if self.connections.iter().any(|c| !c.needs_full) && !changes.is_empty() {
                delta = self.delta_frames(&changes);
            }
            if self.connections.iter().any(|c| c.needs_full) {
                snapshot = self.snapshot_frames();
            }
        }

        let mut out = SyncOutput::default();
        for conn in self.connections.iter_mut() {
            let mut frames: Vec<Vec<u8>> = conn.take_pending().into_vec();
            if !stopping {
                if conn.needs_full {
                    conn.needs_full = false;
                    frames.extend(snapshot.iter().cloned());
                } else {
                    frames.extend(delta.iter().cloned());
                }
            }
            for data in frames {
                conn.record_sent(data.len());
                out.frames
                    .push(SocketFrame::new(conn.socket_id.clone(), conn.ip.clone(), data));
            }
        }
        out.frames.append(&mut self.loose_frames);
        out.closes.append(&mut self.pending_closes);

        if stopping {
            self.connections.drain().for_each(drop);
            self.stop_reported = true;
            out.stopped = true;
        }
        out
    }

    fn delta_frames(&self, changes: &RegistryChanges) -> Vec<Vec<u8>> {
        let full_ids: FxHashSet<EntityId> = changes
            .created
            .iter()
            .chain(&changes.full_dirty)
            .copied()
            .collect();
        let part_ids: FxHashSet<EntityId> = changes.part_dirty.iter().copied().collect();

        let mut full = Vec::with_capacity(full_ids.len());
        let mut part = Vec::with_capacity(part_ids.len());
        if !full_ids.is_empty() {
            full.extend(
                self.decals
                    .iter()
                    .filter(|d| full_ids.contains(&d.id()))
                    .map(decal_object),
            );
            full.extend(
                self.smokes
                    .iter()
                    .filter(|s| full_ids.contains(&s.id()))
                    .map(smoke_object),
            );
        }
        if !part_ids.is_empty() {
            part.extend(
                self.smokes
                    .iter()
                    .filter(|s| part_ids.contains(&s.id()))
                    .map(|s| PartObject {
                        id: s.id(),
                        part: ObjectPart::Smoke(s.part_data()),
                    }),
            );
            part.extend(
                self.decals
                    .iter()
                    .filter(|d| part_ids.contains(&d.id()))
                    .map(|d| PartObject {
                        id: d.id(),
                        part: ObjectPart::Decal(d.part_data()),
                    }),
            );
        }

        encode_updates(split_update(changes.deleted.clone(), full, part))
    }

    /// Every live entity; always at least one (possibly empty) update
    fn snapshot_frames(&self) -> Vec<Vec<u8>> {
        let full: Vec<FullObject> = self
            .decals
            .iter()
            .map(decal_object)
            .chain(self.smokes.iter().map(smoke_object))
            .collect();
        let mut msgs = split_update(Vec::new(), full, Vec::new());
        if msgs.is_empty() {
            msgs.push(UpdateMsg::default());
        }
        encode_updates(msgs)
    }

    /// Apply one inbound frame from `socket_id`
    pub fn handle_socket_msg(&mut self, socket_id: &str, ip: &str, data: &[u8]) {
        if !self.ensure_running("handle_socket_msg") {
            return;
        }
        let msg = match decode::<ClientMsg>(data) {
            Ok(msg) => msg,
            Err(DecodeError::UnknownMessageType(tag)) => {
                trace!("Game {}: ignoring message type {} from {}", self.game_id, tag, socket_id);
                return;
            }
            Err(e) => {
                warn!(
                    "Game {}: dropping malformed frame from {}: {}",
                    self.game_id, socket_id, e
                );
                return;
            }
        };

        let now = self.now;
        if let Some(conn) = self.connections.get_mut(socket_id) {
            conn.record_received(data.len(), now);
        }

        match msg {
            ClientMsg::Join(join) => self.handle_join(socket_id, ip, join),
            ClientMsg::Input(input) => match self.connections.get_mut(socket_id) {
                Some(conn) => conn.apply_input(input),
                None => debug!("Game {}: input from unjoined socket {}", self.game_id, socket_id),
            },
            ClientMsg::Ping(ping) => match self.connections.get_mut(socket_id) {
                Some(conn) => {
                    if let Some(frame) = encode_server(&ServerMsg::Pong(PongMsg {
                        timestamp: ping.timestamp,
                    })) {
                        conn.queue(frame);
                    }
                }
                None => debug!("Game {}: ping from unjoined socket {}", self.game_id, socket_id),
            },
        }
    }

    fn handle_join(&mut self, socket_id: &str, ip: &str, join: JoinMsg) {
        if self.connections.contains(socket_id) {
            warn!("Game {}: duplicate join on socket {}", self.game_id, socket_id);
            return;
        }
        if let Err(why) = self.admit(&join) {
            self.reject(socket_id, ip, why);
            return;
        }

        let name = sanitize_name(&join.name);
        let mut conn =
            PlayerConnection::new(socket_id.into(), ip.into(), name, join.is_mobile, self.now);
        if let Some(frame) = encode_server(&ServerMsg::Joined(JoinedMsg {
            team_mode: self.config.team_mode,
            map_name: self.config.map_name.clone(),
            tick_rate: TICK_RATE as u8,
        })) {
            conn.queue(frame);
        }

        info!(
            "Game {}: '{}' joined on {} ({}/{})",
            self.game_id,
            conn.name,
            socket_id,
            self.connections.len() + 1,
            self.config.max_players
        );
        self.connections.insert(conn);
        self.had_players = true;
        self.empty_since = None;
    }

    fn admit(&mut self, join: &JoinMsg) -> Result<(), &'static str> {
        if join.protocol != PROTOCOL_VERSION {
            return Err(reason::INVALID_PROTOCOL);
        }
        if self.connections.len() >= self.config.max_players {
            return Err(reason::GAME_FULL);
        }
        let token_ok = self.join_tokens.consume(&join.join_token, self.now);
        if !token_ok && (self.config.require_join_token || self.is_private) {
            return Err(reason::INVALID_JOIN_TOKEN);
        }
        Ok(())
    }

    fn reject(&mut self, socket_id: &str, ip: &str, why: &str) {
        warn!(
            "Game {}: rejecting join on {} ({})",
            self.game_id, socket_id, why
        );
        if let Some(frame) = encode_server(&ServerMsg::Disconnect(DisconnectMsg {
            reason: why.into(),
        })) {
            self.loose_frames.push(SocketFrame::new(socket_id, ip, frame));
        }
        if !self.pending_closes.iter().any(|s| s == socket_id) {
            self.pending_closes.push(socket_id.to_owned());
        }
    }

    /// Release a socket; closing an unknown or already closed socket is a no-op
    pub fn handle_socket_close(&mut self, socket_id: &str) {
        if self.status == InstanceStatus::Uninitialized {
            warn!("Game {}: socket close before init, ignoring", self.game_id);
            return;
        }
        self.loose_frames.retain(|f| f.socket_id != socket_id);
        self.pending_closes.retain(|s| s != socket_id);

        match self.connections.remove(socket_id) {
            Some(conn) => {
                info!(
                    "Game {}: '{}' left ({} remaining)",
                    self.game_id,
                    conn.name,
                    self.connections.len()
                );
                if self.connections.is_empty() {
                    self.empty_since = Some(self.now);
                }
            }
            None => debug!("Game {}: close for unknown socket {}", self.game_id, socket_id),
        }
    }

    /// Provision join tokens; `is_private` closes the game to tokenless joins
    pub fn add_join_tokens(&mut self, tokens: Vec<String>, is_private: bool) {
        if !self.ensure_running("add_join_tokens") {
            return;
        }
        debug!(
            "Game {}: {} join tokens (private={})",
            self.game_id,
            tokens.len(),
            is_private
        );
        self.join_tokens.add(tokens, self.now);
        if is_private {
            self.is_private = true;
        }
    }

    pub fn spawn_decal(
        &mut self,
        kind: &str,
        pos: Vec2,
        layer: u8,
        ori: Option<u8>,
        scale: Option<f32>,
    ) -> Result<EntityId, SpawnError> {
        if self.status != InstanceStatus::Running {
            return Err(SpawnError::NotRunning);
        }
        self.decals
            .add_decal(kind, pos, layer, ori, scale, &mut self.registry, &mut self.rng)
            .map(|decal| decal.id())
    }

    pub fn spawn_smoke(
        &mut self,
        pos: Vec2,
        layer: u8,
        interior: bool,
    ) -> Result<EntityId, SpawnError> {
        if self.status != InstanceStatus::Running {
            return Err(SpawnError::NotRunning);
        }
        self.smokes
            .add_smoke(pos, layer, interior, &mut self.registry)
            .map(|smoke| smoke.id())
    }

    /// Destroy any live entity by id
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        match self.registry.get(id) {
            Some(EntityType::Decal) => self.decals.remove(id, &mut self.registry),
            Some(EntityType::Smoke) => self.smokes.remove(id, &mut self.registry),
            _ => false,
        }
    }

    /// Current replicated state of a live entity
    pub fn entity(&self, id: EntityId) -> Option<FullObject> {
        match self.registry.get(id)? {
            EntityType::Decal => self.decals.get(id).map(decal_object),
            EntityType::Smoke => self.smokes.get(id).map(smoke_object),
            EntityType::Invalid => None,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn player_count(&self) -> usize {
        self.connections.len()
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn decals(&self) -> &DecalBarn {
        &self.decals
    }

    pub fn smokes(&self) -> &SmokeBarn {
        &self.smokes
    }
}
