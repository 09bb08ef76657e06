//! # straplink
//!
//! Async Rust library, CLI and terminal UI for streaming heart-rate, ECG and
//! accelerometer data from a Bluetooth Low Energy chest strap and forwarding
//! the decoded samples to a time-series database.
//!
//! The library is the orchestration layer between a device backend and a
//! telemetry sink:
//!
//! * a **session manager** owning the connection lifecycle to one strap at a
//!   time (connect, disconnect, auto-connect, scan), with a strict
//!   `Disconnected → Connecting → Connected` state machine;
//! * a **stream multiplexer** running at most one live subscription per
//!   sensor kind, each independently toggled, forwarding every decoded sample
//!   to the sink through a bounded queue;
//! * pluggable **transports** (real BLE via btleplug, or a fully simulated
//!   strap) and **sinks** (InfluxDB over HTTP, log-only, in-memory capture).
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use straplink::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//!     let transport = Arc::new(SimTransport::new(SimConfig::default()));
//!     let mut session = SessionManager::new(transport, events_tx);
//!     let mut streams = session.stream_multiplexer(Arc::new(LogSink));
//!
//!     session.connect("SIM00001").await?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             CoreEvent::Connected { id } => {
//!                 println!("connected: {id}");
//!                 streams.start(StreamKind::HeartRate, None).await?;
//!             }
//!             CoreEvent::Disconnected { .. } => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`session`] | Connection lifecycle state machine and scan/auto-connect |
//! | [`mux`] | Per-kind stream subscriptions and sample forwarding |
//! | [`sink`] | Telemetry sinks: InfluxDB, log-only, in-memory |
//! | [`transport`] | The device-backend trait plus BLE and simulated backends |
//! | [`types`] | States, stream kinds, samples, measurements, notifications |
//! | [`cancel`] | Cancellation tokens with parent → child cascade |
//! | [`error`] | The call-boundary error taxonomy |

pub mod cancel;
pub mod error;
pub mod mux;
pub mod session;
pub mod sink;
pub mod transport;
pub mod types;

/// Convenience re-exports covering the common wiring: build a transport and a
/// sink, create a session, toggle streams, consume notifications.
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::error::CoreError;
    pub use crate::mux::StreamMultiplexer;
    pub use crate::session::SessionManager;
    pub use crate::sink::{InfluxConfig, InfluxSink, LogSink, MemorySink, TelemetrySink};
    pub use crate::transport::ble::BleTransport;
    pub use crate::transport::sim::{SimConfig, SimTransport};
    pub use crate::transport::{Transport, TransportError, TransportEvent};
    pub use crate::types::{
        ConnectionState, CoreEvent, Discovered, Measurement, SampleBatch, StopReason,
        StreamConfig, StreamKind,
    };
}
