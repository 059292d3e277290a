//! Host <-> worker message protocol
//!
//! Both directions of the worker boundary carry bincode envelopes, so a
//! worker shares nothing with the host but bytes and could move behind a
//! real process boundary without changing its shape.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// One direction of the worker boundary
pub type EnvelopeSender = mpsc::UnboundedSender<Vec<u8>>;
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// One raw socket frame, inbound or outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketFrame {
    pub socket_id: String,
    /// Source address for inbound frames, peer address for outbound ones
    pub ip: String,
    pub data: Vec<u8>,
}

impl SocketFrame {
    pub fn new(socket_id: impl Into<String>, ip: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            socket_id: socket_id.into(),
            ip: ip.into(),
            data,
        }
    }
}

/// Host -> worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostMsg {
    /// Construct and init the instance; `config` is a `GameConfig` JSON blob
    Create { game_id: String, config: Vec<u8> },
    /// Inbound frames, in arrival order
    SocketMsg(Vec<SocketFrame>),
    /// The host closed or lost this socket
    SocketClose { socket_id: String },
    AddJoinToken { tokens: Vec<String>, is_private: bool },
}

/// Payload of a worker -> host message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMsgKind {
    Created,
    /// Outbound frames for the transport
    SocketMsg(Vec<SocketFrame>),
    /// The instance wants this socket closed
    SocketClose { socket_id: String },
    /// Liveness while no instance is live
    KeepAlive,
}

/// Worker -> host. `stopped` marks the instance as terminated; the host
/// drops its reference on the first message that carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMsg {
    pub kind: WorkerMsgKind,
    pub stopped: bool,
}

impl WorkerMsg {
    pub fn new(kind: WorkerMsgKind) -> Self {
        Self {
            kind,
            stopped: false,
        }
    }

    pub fn stopped(kind: WorkerMsgKind) -> Self {
        Self {
            kind,
            stopped: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Encode an envelope with bincode (legacy config: fixed-width integers)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| IpcError::Encode(e.to_string()))
}

/// Decode an envelope; the whole slice must be consumed
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, IpcError> {
    let (msg, read) = bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map_err(|e| IpcError::Decode(e.to_string()))?;
    if read != data.len() {
        return Err(IpcError::TrailingBytes(data.len() - read));
    }
    Ok(msg)
}

/// Encode `message` and push it onto `tx`.
///
/// Returns `false` only when the receiving side is gone. A message that
/// fails to encode is dropped with a warning.
pub fn send_envelope<T: Serialize>(tx: &EnvelopeSender, message: &T) -> bool {
    match encode(message) {
        Ok(bytes) => tx.send(bytes).is_ok(),
        Err(e) => {
            warn!("Dropping unencodable envelope: {}", e);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_msg_round_trip() {
        let messages = vec![
            HostMsg::Create {
                game_id: "A".into(),
                config: br#"{"max_players":4}"#.to_vec(),
            },
            HostMsg::SocketMsg(vec![
                SocketFrame::new("s1", "10.0.0.1", vec![6, 1, 0, 0, 0]),
                SocketFrame::new("s2", "", Vec::new()),
            ]),
            HostMsg::SocketMsg(Vec::new()),
            HostMsg::SocketClose {
                socket_id: "s1".into(),
            },
            HostMsg::AddJoinToken {
                tokens: vec!["t1".into(), String::new()],
                is_private: true,
            },
        ];
        for msg in messages {
            let bytes = encode(&msg).unwrap();
            assert_eq!(decode::<HostMsg>(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_worker_msg_round_trip() {
        let messages = vec![
            WorkerMsg::new(WorkerMsgKind::Created),
            WorkerMsg::new(WorkerMsgKind::KeepAlive),
            WorkerMsg::stopped(WorkerMsgKind::SocketMsg(vec![SocketFrame::new(
                "s9",
                "::1",
                vec![u8::MAX; 3],
            )])),
            WorkerMsg::new(WorkerMsgKind::SocketClose {
                socket_id: "s9".into(),
            }),
        ];
        for msg in messages {
            let bytes = encode(&msg).unwrap();
            assert_eq!(decode::<WorkerMsg>(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode::<HostMsg>(&[0xff, 0xff, 0xff, 0xff]),
            Err(IpcError::Decode(_))
        ));

        let mut bytes = encode(&WorkerMsg::new(WorkerMsgKind::KeepAlive)).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode::<WorkerMsg>(&bytes),
            Err(IpcError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_send_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg = HostMsg::SocketClose {
            socket_id: "s1".into(),
        };
        assert!(send_envelope(&tx, &msg));
        let bytes = rx.try_recv().unwrap();
        assert_eq!(decode::<HostMsg>(&bytes).unwrap(), msg);

        drop(rx);
        assert!(!send_envelope(&tx, &msg));
    }
}
