use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::net::protocol::InputMsg;
use crate::util::vec2::Vec2;

/// Frames queued for one socket until the next flush
pub type PendingFrames = SmallVec<[Vec<u8>; 4]>;

/// A joined player's socket inside one game instance
#[derive(Debug)]
pub struct PlayerConnection {
    pub socket_id: String,
    pub ip: String,
    pub name: String,
    pub is_mobile: bool,
    /// Needs a full snapshot instead of the shared delta on the next flush
    pub needs_full: bool,
    pub last_input_seq: u8,
    pub input: InputMsg,
    /// Game time of the join, in seconds
    pub joined_at: f64,
    /// Game time of the last inbound frame, in seconds
    pub last_activity: f64,
    pub pending: PendingFrames,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

impl PlayerConnection {
    pub fn new(socket_id: String, ip: String, name: String, is_mobile: bool, now: f64) -> Self {
        Self {
            socket_id,
            ip,
            name,
            is_mobile,
            needs_full: true,
            last_input_seq: 0,
            input: InputMsg::default(),
            joined_at: now,
            last_activity: now,
            pending: PendingFrames::new(),
            bytes_sent: 0,
            bytes_received: 0,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    /// Record an inbound frame
    pub fn record_received(&mut self, bytes: usize, now: f64) {
        self.bytes_received += bytes as u64;
        self.frames_received += 1;
        self.last_activity = now;
    }

    /// Record an outbound frame
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.frames_sent += 1;
    }

    /// Apply client input. Sequence numbers wrap at 256.
    pub fn apply_input(&mut self, input: InputMsg) {
        self.last_input_seq = input.seq;
        if input.aim.is_finite() && input.aim != Vec2::ZERO {
            self.input.aim = input.aim.normalize();
        }
        self.input = InputMsg {
            aim: self.input.aim,
            ..input
        };
    }

    pub fn queue(&mut self, frame: Vec<u8>) {
        self.pending.push(frame);
    }

    pub fn take_pending(&mut self) -> PendingFrames {
        std::mem::take(&mut self.pending)
    }
}

/// Joined connections keyed by socket id
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<String, PlayerConnection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection; refuses to replace an existing one
    pub fn insert(&mut self, conn: PlayerConnection) -> bool {
        if self.connections.contains_key(&conn.socket_id) {
            return false;
        }
        self.connections.insert(conn.socket_id.clone(), conn);
        true
    }

    pub fn get(&self, socket_id: &str) -> Option<&PlayerConnection> {
        self.connections.get(socket_id)
    }

    pub fn get_mut(&mut self, socket_id: &str) -> Option<&mut PlayerConnection> {
        self.connections.get_mut(socket_id)
    }

    pub fn contains(&self, socket_id: &str) -> bool {
        self.connections.contains_key(socket_id)
    }

    /// Remove a connection; removing an unknown socket is a no-op
    pub fn remove(&mut self, socket_id: &str) -> Option<PlayerConnection> {
        self.connections.remove(socket_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerConnection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerConnection> {
        self.connections.values_mut()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PlayerConnection> + '_ {
        self.connections.drain().map(|(_, conn)| conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(socket_id: &str) -> PlayerConnection {
        PlayerConnection::new(socket_id.into(), "127.0.0.1".into(), "player".into(), false, 1.5)
    }

    #[test]
    fn test_connection_new() {
        let c = conn("a");
        assert!(c.needs_full);
        assert_eq!(c.joined_at, 1.5);
        assert!(c.pending.is_empty());
    }

    #[test]
    fn test_connection_stats() {
        let mut c = conn("a");
        c.record_received(10, 2.0);
        c.record_received(5, 3.0);
        c.record_sent(100);
        assert_eq!(c.bytes_received, 15);
        assert_eq!(c.frames_received, 2);
        assert_eq!(c.last_activity, 3.0);
        assert_eq!(c.bytes_sent, 100);
        assert_eq!(c.frames_sent, 1);
    }

    #[test]
    fn test_apply_input_keeps_last_valid_aim() {
        let mut c = conn("a");
        c.apply_input(InputMsg {
            seq: 4,
            aim: Vec2::new(0.0, 3.0),
            shoot: true,
            ..Default::default()
        });
        assert_eq!(c.last_input_seq, 4);
        assert!(c.input.aim.approx_eq(Vec2::new(0.0, 1.0), 1e-6));
        assert!(c.input.shoot);

        c.apply_input(InputMsg {
            seq: 5,
            aim: Vec2::new(f32::NAN, 0.0),
            ..Default::default()
        });
        assert_eq!(c.last_input_seq, 5);
        assert!(c.input.aim.approx_eq(Vec2::new(0.0, 1.0), 1e-6));
        assert!(!c.input.shoot);
    }

    #[test]
    fn test_pending_frames() {
        let mut c = conn("a");
        c.queue(vec![1]);
        c.queue(vec![2, 3]);
        let frames = c.take_pending();
        assert_eq!(frames.as_slice(), &[vec![1], vec![2, 3]]);
        assert!(c.pending.is_empty());
    }

    #[test]
    fn test_table_insert_remove() {
        let mut table = ConnectionTable::new();
        assert!(table.insert(conn("a")));
        assert!(!table.insert(conn("a")));
        assert!(table.insert(conn("b")));
        assert_eq!(table.len(), 2);

        assert!(table.remove("a").is_some());
        assert!(table.remove("a").is_none());
        assert!(!table.contains("a"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_drain() {
        let mut table = ConnectionTable::new();
        table.insert(conn("a"));
        table.insert(conn("b"));
        let mut ids: Vec<_> = table.drain().map(|c| c.socket_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(table.is_empty());
    }
}
