//! Prometheus-compatible metrics and debug endpoint
//!
//! Served on the debug port:
//! - `/metrics` Prometheus text format
//! - `/metrics/json` the same counters as JSON
//! - `/debug` read-only snapshot of the lobby registries
//! - `/health`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::lobby::manager::LobbyManager;

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the server
#[derive(Debug)]
pub struct Metrics {
    // Sessions
    pub sessions_active: AtomicU64,
    pub sessions_waiting: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_completed: AtomicU64,
    pub sessions_aborted: AtomicU64,
    pub creation_failures: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,
    pub resets: AtomicU64,

    // Actions
    pub actions_queued: AtomicU64,
    pub actions_dropped: AtomicU64,

    // Network
    pub connections_active: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_received: AtomicU64,

    start_time: Instant,

    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_active: AtomicU64::new(0),
            sessions_waiting: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_aborted: AtomicU64::new(0),
            creation_failures: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            actions_queued: AtomicU64::new(0),
            actions_dropped: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles. Ticks from every session
    /// share one window.
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

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us
                .store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement for gauges
    pub fn decr(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("session_relay_sessions_active", "Sessions currently ticking", "gauge",
            self.sessions_active.load(Ordering::Relaxed));
        metric!("session_relay_sessions_waiting", "Sessions waiting for participants", "gauge",
            self.sessions_waiting.load(Ordering::Relaxed));
        metric!("session_relay_sessions_created_total", "Sessions created", "counter",
            self.sessions_created.load(Ordering::Relaxed));
        metric!("session_relay_sessions_completed_total", "Sessions that ended DONE", "counter",
            self.sessions_completed.load(Ordering::Relaxed));
        metric!("session_relay_sessions_aborted_total", "Sessions that ended INACTIVE", "counter",
            self.sessions_aborted.load(Ordering::Relaxed));
        metric!("session_relay_creation_failures_total", "Rejected create requests", "counter",
            self.creation_failures.load(Ordering::Relaxed));

        metric!("session_relay_tick_time_microseconds", "Last tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("session_relay_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("session_relay_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("session_relay_tick_time_max_microseconds", "Maximum tick time in window", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("session_relay_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("session_relay_resets_total", "Internal session resets", "counter",
            self.resets.load(Ordering::Relaxed));

        metric!("session_relay_actions_queued_total", "Actions accepted into slot queues", "counter",
            self.actions_queued.load(Ordering::Relaxed));
        metric!("session_relay_actions_dropped_total", "Actions dropped on full queues", "counter",
            self.actions_dropped.load(Ordering::Relaxed));

        metric!("session_relay_connections_active", "Open client connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("session_relay_messages_sent_total", "Frames sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("session_relay_messages_dropped_total", "Frames dropped on full outbound queues", "counter",
            self.messages_dropped.load(Ordering::Relaxed));
        metric!("session_relay_messages_received_total", "Frames received", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("session_relay_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON view of the same counters
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        serde_json::json!({
            "sessions": {
                "active": load(&self.sessions_active),
                "waiting": load(&self.sessions_waiting),
                "created": load(&self.sessions_created),
                "completed": load(&self.sessions_completed),
                "aborted": load(&self.sessions_aborted),
                "creation_failures": load(&self.creation_failures),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
                "resets": load(&self.resets),
            },
            "actions": {
                "queued": load(&self.actions_queued),
                "dropped": load(&self.actions_dropped),
            },
            "network": {
                "connections": load(&self.connections_active),
                "messages_sent": load(&self.messages_sent),
                "messages_dropped": load(&self.messages_dropped),
                "messages_received": load(&self.messages_received),
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

/// Resolve a request line to `(status line, content type, body)`
fn route(request: &str, metrics: &Metrics, manager: &LobbyManager) -> (&'static str, &'static str, String) {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("");

    match path {
        "/metrics" => ("200 OK", "text/plain; version=0.0.4", metrics.to_prometheus()),
        "/metrics/json" => ("200 OK", "application/json", metrics.to_json()),
        "/debug" => {
            let body = serde_json::to_string(&manager.debug_snapshot())
                .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
            ("200 OK", "application/json", body)
        }
        "/health" | "/" => ("200 OK", "text/plain", "OK".to_string()),
        _ => ("404 Not Found", "text/plain", String::new()),
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(
    metrics: Arc<Metrics>,
    manager: Arc<LobbyManager>,
    bind_address: &str,
    port: u16,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = Arc::clone(&metrics);
        let manager = Arc::clone(&manager);

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    // The debug snapshot takes session locks
                    let (status, content_type, body) =
                        tokio::task::block_in_place(|| route(&request, &metrics, &manager));
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        content_type,
                        body.len(),
                        body
                    );

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
