//! Telemetry sinks.
//!
//! The multiplexer hands every persisted [`crate::types::Measurement`] to a
//! [`TelemetrySink`] through a bounded queue; a sink write failing affects
//! that one measurement only. Three implementations:
//!
//! | Sink | Purpose |
//! |---|---|
//! | [`InfluxSink`] | InfluxDB v2 line-protocol writes over HTTP |
//! | [`LogSink`] | debug-logs every write; default when Influx is unconfigured |
//! | [`MemorySink`] | records writes in memory; used by the test suite |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("http: {0}")]
    Http(String),
    #[error("server rejected write: status {0}")]
    Rejected(u16),
    #[error("sink is closed")]
    Closed,
}

/// Asynchronous destination for decoded measurements.
///
/// `write_data` persists one scalar under `measurement.field`; failures are
/// per-write and transient from the caller's point of view. `close` is called
/// once at teardown after the last write has been attempted.
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    async fn write_data(&self, measurement: &str, field: &str, value: f64)
        -> Result<(), SinkError>;

    async fn close(&self);
}

// ── InfluxDB ─────────────────────────────────────────────────────────────────

/// Connection settings for [`InfluxSink`], usually taken from the
/// environment.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub org: String,
    pub bucket: String,
    /// API token; sent as `Authorization: Token …` when non-empty.
    pub token: String,
}

impl InfluxConfig {
    /// Read `INFLUX_URL`, `INFLUX_ORG`, `INFLUX_BUCKET` and `INFLUX_TOKEN`.
    /// Returns `None` when `INFLUX_URL` is unset, which the binaries treat as
    /// "log writes instead of persisting them".
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("INFLUX_URL").ok()?;
        Some(Self {
            url,
            org: std::env::var("INFLUX_ORG").unwrap_or_default(),
            bucket: std::env::var("INFLUX_BUCKET").unwrap_or_default(),
            token: std::env::var("INFLUX_TOKEN").unwrap_or_default(),
        })
    }
}

/// Writes measurements to the InfluxDB v2 `/api/v2/write` endpoint, one line
/// of line protocol per measurement.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    health_url: String,
    token: String,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> Self {
        let base = config.url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            write_url: format!(
                "{base}/api/v2/write?org={}&bucket={}&precision=ms",
                config.org, config.bucket
            ),
            health_url: format!("{base}/health"),
            token: config.token,
        }
    }

    /// Probe the server's `/health` endpoint and return its reported status
    /// string (`"pass"` on a healthy instance).
    pub async fn health(&self) -> Result<String, SinkError> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        Ok(body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string())
    }
}

#[async_trait]
impl TelemetrySink for InfluxSink {
    async fn write_data(
        &self,
        measurement: &str,
        field: &str,
        value: f64,
    ) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(&self.write_url)
            .body(line_protocol(measurement, field, value));
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.token));
        }
        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected(status.as_u16()))
        }
    }

    async fn close(&self) {
        debug!("influx sink closed");
    }
}

/// One line of InfluxDB line protocol, with the characters the protocol
/// treats as separators escaped.
fn line_protocol(measurement: &str, field: &str, value: f64) -> String {
    fn escape(s: &str) -> String {
        s.replace('\\', "\\\\")
            .replace(',', "\\,")
            .replace(' ', "\\ ")
            .replace('=', "\\=")
    }
    format!("{} {}={}", escape(measurement), escape(field), value)
}

// ── Log-only sink ────────────────────────────────────────────────────────────

/// Sink that logs every write at debug level and persists nothing.
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn write_data(
        &self,
        measurement: &str,
        field: &str,
        value: f64,
    ) -> Result<(), SinkError> {
        debug!("write {measurement} {field}={value}");
        Ok(())
    }

    async fn close(&self) {}
}

// ── Capture sink ─────────────────────────────────────────────────────────────

/// Records every write in memory. Meant for tests; `set_failing` injects
/// write failures to exercise the isolation path.
#[derive(Default)]
pub struct MemorySink {
    writes: Mutex<Vec<(String, String, f64)>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<(String, String, f64)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write_data(
        &self,
        measurement: &str,
        field: &str,
        value: f64,
    ) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Http("injected failure".into()));
        }
        if self.is_closed() {
            warn!("write after close: {measurement} {field}={value}");
            return Err(SinkError::Closed);
        }
        self.writes
            .lock()
            .unwrap()
            .push((measurement.to_string(), field.to_string(), value));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
