//! Prometheus-compatible metrics endpoint
//!
//! One `Metrics` value is shared by the host and every worker. Counters
//! only ever grow; gauges that several workers contribute to are moved by
//! deltas (`shift_gauge`) so each worker only accounts for its own share.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const TICK_HISTORY: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    // Host
    pub games_active: AtomicU64,
    pub workers: AtomicU64,
    pub connections_active: AtomicU64,

    // Entity counts, summed over workers
    pub decals: AtomicU64,
    pub smokes: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Traffic
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub frames_dropped: AtomicU64,

    // Lifecycle
    pub keep_alives: AtomicU64,
    pub instances_stopped: AtomicU64,
    pub worker_failures: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            games_active: AtomicU64::new(0),
            workers: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            decals: AtomicU64::new(0),
            smokes: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            keep_alives: AtomicU64::new(0),
            instances_stopped: AtomicU64::new(0),
            worker_failures: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let last = sorted.len() - 1;
            let p95_idx = ((sorted.len() as f32 * 0.95) as usize).min(last);
            let p99_idx = ((sorted.len() as f32 * 0.99) as usize).min(last);

            self.tick_time_p95_us.store(sorted[p95_idx], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted[last], Ordering::Relaxed);
        }
    }

    pub fn record_frames_in(&self, frames: u64, bytes: u64) {
        self.frames_in.fetch_add(frames, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_frames_out(&self, frames: u64, bytes: u64) {
        self.frames_out.fetch_add(frames, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Move a shared gauge from this contributor's `prev` value to `next`
    pub fn shift_gauge(gauge: &AtomicU64, prev: u64, next: u64) {
        if next >= prev {
            gauge.fetch_add(next - prev, Ordering::Relaxed);
        } else {
            let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(prev - next))
            });
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("arena_games_active", "Live game instances", "gauge",
            self.games_active.load(Ordering::Relaxed));
        metric!("arena_workers", "Spawned execution units", "gauge",
            self.workers.load(Ordering::Relaxed));
        metric!("arena_connections_active", "Open client sockets", "gauge",
            self.connections_active.load(Ordering::Relaxed));

        metric!("arena_decals", "Live decals across all games", "gauge",
            self.decals.load(Ordering::Relaxed));
        metric!("arena_smokes", "Live smoke clouds across all games", "gauge",
            self.smokes.load(Ordering::Relaxed));

        metric!("arena_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("arena_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("arena_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("arena_tick_time_max_microseconds", "Maximum tick time in the window", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("arena_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("arena_frames_in_total", "Inbound socket frames", "counter",
            self.frames_in.load(Ordering::Relaxed));
        metric!("arena_frames_out_total", "Outbound socket frames", "counter",
            self.frames_out.load(Ordering::Relaxed));
        metric!("arena_bytes_in_total", "Inbound payload bytes", "counter",
            self.bytes_in.load(Ordering::Relaxed));
        metric!("arena_bytes_out_total", "Outbound payload bytes", "counter",
            self.bytes_out.load(Ordering::Relaxed));
        metric!("arena_frames_dropped_total", "Inbound frames with no live game", "counter",
            self.frames_dropped.load(Ordering::Relaxed));

        metric!("arena_keep_alives_total", "Idle worker keep-alives", "counter",
            self.keep_alives.load(Ordering::Relaxed));
        metric!("arena_instances_stopped_total", "Game instances that stopped", "counter",
            self.instances_stopped.load(Ordering::Relaxed));
        metric!("arena_worker_failures_total", "Instance panics and dead workers", "counter",
            self.worker_failures.load(Ordering::Relaxed));
        metric!("arena_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON view of the same numbers
    pub fn to_json(&self) -> String {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        serde_json::json!({
            "games": {
                "active": load(&self.games_active),
                "stopped": load(&self.instances_stopped),
                "workers": load(&self.workers),
                "worker_failures": load(&self.worker_failures),
                "keep_alives": load(&self.keep_alives),
            },
            "entities": {
                "decals": load(&self.decals),
                "smokes": load(&self.smokes),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
            },
            "network": {
                "connections": load(&self.connections_active),
                "frames_in": load(&self.frames_in),
                "frames_out": load(&self.frames_out),
                "bytes_in": load(&self.bytes_in),
                "bytes_out": load(&self.bytes_out),
                "frames_dropped": load(&self.frames_dropped),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    // Longest prefix first
                    let response = if request.starts_with("GET /metrics/json") {
                        http_response("application/json", &metrics.to_json())
                    } else if request.starts_with("GET /metrics") {
                        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
                    } else if request.starts_with("GET /health") {
                        http_response("text/plain", "OK")
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
