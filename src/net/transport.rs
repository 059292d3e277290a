//! TCP transport
//!
//! Owns the real sockets. Each accepted connection gets a uuid socket id and
//! is attached to an open game; inbound frames go to the process manager and
//! outbound frames come back through `SocketSink`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::net::framing::{read_message, write_message, FramingError};
use crate::net::process_manager::{ProcessManager, SocketSink};

/// Pause after a failed accept (fd exhaustion, aborted handshake)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

pub struct TcpTransport {
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<Outbound>>>,
    metrics: Arc<Metrics>,
}

impl TcpTransport {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn socket_count(&self) -> usize {
        self.writers.lock().len()
    }

    /// Accept connections forever; failed accepts are logged and retried
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        manager: Arc<RwLock<ProcessManager>>,
    ) -> anyhow::Result<()> {
        info!("TCP transport listening on {}", listener.local_addr()?);
        self.accept_loop(|| listener.accept(), manager).await;
        Ok(())
    }

    async fn accept_loop<F, Fut>(self: Arc<Self>, mut accept: F, manager: Arc<RwLock<ProcessManager>>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    {
        loop {
            let (stream, peer) = match accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let transport = self.clone();
            let manager = manager.clone();
            tokio::spawn(async move {
                transport.handle_connection(stream, peer, manager).await;
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        manager: Arc<RwLock<ProcessManager>>,
    ) {
        let _ = stream.set_nodelay(true);
        let socket_id = Uuid::new_v4().to_string();
        let ip = peer.ip().to_string();

        let attached = {
            let mut manager = manager.write().await;
            manager
                .find_or_create_game()
                .and_then(|game_id| manager.attach_socket(&socket_id, &game_id))
        };
        if let Err(e) = attached {
            warn!("Refusing connection from {}: {}", peer, e);
            return;
        }

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.writers.lock().insert(socket_id.clone(), tx);
        self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!("Socket {} connected from {}", socket_id, peer);

        let mut write_task = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Frame(data) => {
                        if let Err(e) = write_message(&mut writer, &data).await {
                            debug!("Write failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        loop {
            tokio::select! {
                read = read_message(&mut reader) => match read {
                    Ok(data) => manager.write().await.on_socket_data(&socket_id, &ip, data),
                    Err(FramingError::ConnectionClosed) => break,
                    Err(e) => {
                        warn!("Socket {} read error: {}", socket_id, e);
                        break;
                    }
                },
                _ = &mut write_task => break,
            }
        }

        self.writers.lock().remove(&socket_id);
        manager.write().await.on_socket_close(&socket_id);
        self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
        debug!("Socket {} disconnected", socket_id);
    }
}

impl SocketSink for TcpTransport {
    fn send(&self, socket_id: &str, data: Vec<u8>) {
        if let Some(tx) = self.writers.lock().get(socket_id) {
            let _ = tx.send(Outbound::Frame(data));
        }
    }

    fn close(&self, socket_id: &str) {
        if let Some(tx) = self.writers.lock().remove(socket_id) {
            let _ = tx.send(Outbound::Close);
        }
    }
}
