//! Prometheus-compatible metrics endpoint
//!
//! Exposes replication server metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::net::sequencer::DropReason;

const TICK_HISTORY: usize = 1000;

/// Metrics registry for the replication server
#[derive(Debug)]
pub struct Metrics {
    // World
    pub entity_count: AtomicU64,
    pub npc_count: AtomicU64,
    pub server_tick: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_kicked: AtomicU64,
    pub connections_timed_out: AtomicU64,

    // Traffic
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub inbound_overflow: AtomicU64,

    // Input sequencing
    pub inputs_accepted: AtomicU64,
    pub inputs_dropped_late: AtomicU64,
    pub inputs_dropped_early: AtomicU64,
    pub inputs_dropped_duplicate: AtomicU64,
    pub tick_adjustments: AtomicU64,

    // Replication
    pub entity_updates: AtomicU64,
    pub aoi_enters: AtomicU64,
    pub aoi_leaves: AtomicU64,
    pub chunks_streamed: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            entity_count: AtomicU64::new(0),
            npc_count: AtomicU64::new(0),
            server_tick: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_kicked: AtomicU64::new(0),
            connections_timed_out: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            inbound_overflow: AtomicU64::new(0),
            inputs_accepted: AtomicU64::new(0),
            inputs_dropped_late: AtomicU64::new(0),
            inputs_dropped_early: AtomicU64::new(0),
            inputs_dropped_duplicate: AtomicU64::new(0),
            tick_adjustments: AtomicU64::new(0),
            entity_updates: AtomicU64::new(0),
            aoi_enters: AtomicU64::new(0),
            aoi_leaves: AtomicU64::new(0),
            chunks_streamed: AtomicU64::new(0),
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

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Late => &self.inputs_dropped_late,
            DropReason::Early => &self.inputs_dropped_early,
            DropReason::Duplicate => &self.inputs_dropped_duplicate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inputs_dropped(&self) -> u64 {
        self.inputs_dropped_late.load(Ordering::Relaxed)
            + self.inputs_dropped_early.load(Ordering::Relaxed)
            + self.inputs_dropped_duplicate.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds
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

        metric!("tilerealm_entities", "Live entities in the world", "gauge",
            self.entity_count.load(Ordering::Relaxed));
        metric!("tilerealm_npcs", "Live non-player entities", "gauge",
            self.npc_count.load(Ordering::Relaxed));
        metric!("tilerealm_server_tick", "Last completed simulation tick", "gauge",
            self.server_tick.load(Ordering::Relaxed));

        metric!("tilerealm_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("tilerealm_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("tilerealm_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("tilerealm_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("tilerealm_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));

        metric!("tilerealm_connections_active", "Connected clients", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("tilerealm_connections_total", "Accepted connections", "counter",
            self.connections_total.load(Ordering::Relaxed));
        metric!("tilerealm_connections_kicked_total", "Connections closed by the server", "counter",
            self.connections_kicked.load(Ordering::Relaxed));
        metric!("tilerealm_connections_timed_out_total", "Connections dropped for silence", "counter",
            self.connections_timed_out.load(Ordering::Relaxed));

        metric!("tilerealm_messages_sent_total", "Total messages sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("tilerealm_messages_received_total", "Total messages received", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("tilerealm_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("tilerealm_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("tilerealm_inbound_overflow_total", "Events dropped on a full inbound queue", "counter",
            self.inbound_overflow.load(Ordering::Relaxed));

        metric!("tilerealm_inputs_accepted_total", "Inputs admitted by the sequencer", "counter",
            self.inputs_accepted.load(Ordering::Relaxed));
        output.push_str(
            "# HELP tilerealm_inputs_dropped_total Inputs dropped by the sequencer\n# TYPE tilerealm_inputs_dropped_total counter\n",
        );
        for (reason, counter) in [
            ("late", &self.inputs_dropped_late),
            ("early", &self.inputs_dropped_early),
            ("duplicate", &self.inputs_dropped_duplicate),
        ] {
            output.push_str(&format!(
                "tilerealm_inputs_dropped_total{{reason=\"{}\"}} {}\n",
                reason,
                counter.load(Ordering::Relaxed)
            ));
        }
        metric!("tilerealm_tick_adjustments_total", "Tick adjustments issued to clients", "counter",
            self.tick_adjustments.load(Ordering::Relaxed));

        metric!("tilerealm_entity_updates_total", "Entity updates sent", "counter",
            self.entity_updates.load(Ordering::Relaxed));
        metric!("tilerealm_aoi_enters_total", "Entities entering an area of interest", "counter",
            self.aoi_enters.load(Ordering::Relaxed));
        metric!("tilerealm_aoi_leaves_total", "Entities leaving an area of interest", "counter",
            self.aoi_leaves.load(Ordering::Relaxed));
        metric!("tilerealm_chunks_streamed_total", "Map chunks streamed", "counter",
            self.chunks_streamed.load(Ordering::Relaxed));

        metric!("tilerealm_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "world": {{
    "entities": {},
    "npcs": {},
    "tick": {}
  }},
  "performance": {{
    "tick_time_us": {},
    "tick_time_p95_us": {},
    "tick_time_p99_us": {},
    "tick_time_max_us": {},
    "tick_count": {}
  }},
  "network": {{
    "connections": {},
    "messages_sent": {},
    "messages_received": {},
    "bytes_sent": {},
    "bytes_received": {}
  }},
  "inputs": {{
    "accepted": {},
    "dropped": {},
    "adjustments": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.entity_count.load(Ordering::Relaxed),
            self.npc_count.load(Ordering::Relaxed),
            self.server_tick.load(Ordering::Relaxed),
            self.tick_time_us.load(Ordering::Relaxed),
            self.tick_time_p95_us.load(Ordering::Relaxed),
            self.tick_time_p99_us.load(Ordering::Relaxed),
            self.tick_time_max_us.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.connections_active.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.inputs_accepted.load(Ordering::Relaxed),
            self.inputs_dropped(),
            self.tick_adjustments.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
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
                    let response = respond(&metrics, &request);
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

/// Build the HTTP response for one request
fn respond(metrics: &Metrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    let (content_type, body) = match path {
        Some("/metrics") => ("text/plain; version=0.0.4", metrics.to_prometheus()),
        Some("/metrics/json") | Some("/json") => ("application/json", metrics.to_json()),
        Some("/health") | Some("/") => ("text/plain", "OK".to_string()),
        _ => {
            return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string()
        }
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) >= 1000);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.connections_active.store(5, Ordering::Relaxed);
        metrics.record_drop(DropReason::Early);
        metrics.record_drop(DropReason::Early);

        let output = metrics.to_prometheus();

        assert!(output.contains("tilerealm_connections_active 5"));
        assert!(output.contains("tilerealm_inputs_dropped_total{reason=\"early\"} 2"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.entity_count.store(100, Ordering::Relaxed);
        metrics.record_drop(DropReason::Late);

        let output = metrics.to_json();

        assert!(output.contains("\"entities\": 100"));
        assert!(output.contains("\"dropped\": 1"));
    }

    #[test]
    fn test_respond_routes() {
        let metrics = Metrics::new();
        assert!(respond(&metrics, "GET /metrics HTTP/1.1\r\n").contains("tilerealm_uptime_seconds"));
        assert!(respond(&metrics, "GET /metrics/json HTTP/1.1\r\n").contains("application/json"));
        assert!(respond(&metrics, "GET /health HTTP/1.1\r\n").ends_with("OK"));
        assert!(respond(&metrics, "GET /nope HTTP/1.1\r\n").starts_with("HTTP/1.1 404"));
    }
}
