//! The seam between the orchestration core and the BLE stack.
//!
//! Everything the session manager and multiplexer need from a device backend
//! is expressed by the [`Transport`] trait: connect/disconnect one peripheral
//! by identity, produce a discovery stream, open decoded sample streams, and
//! surface unsolicited lifecycle events on a broadcast channel.
//!
//! Two implementations ship with the crate:
//!
//! | Module | Backend | Streams |
//! |---|---|---|
//! | [`ble`] | btleplug, standard Heart Rate profile | HR only |
//! | [`sim`] | in-process simulated strap | HR, ECG, ACC |
//!
//! The real transport deliberately does not speak the strap vendor's
//! proprietary measurement service, so ECG and accelerometer streams are only
//! available from the simulator.

pub mod ble;
pub mod gatt;
pub mod sim;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{Discovered, SampleBatch, StreamConfig, StreamKind};

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("no link to device {0}")]
    NoLink(String),
    #[error("{kind} streaming is not supported by this transport: {detail}")]
    Unsupported { kind: StreamKind, detail: String },
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("{0}")]
    Io(String),
}

/// Optional capabilities a transport announces per device once a link is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    HeartRate,
    OnlineStreaming,
    BatteryInfo,
    DeviceInfo,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::HeartRate => write!(f, "heart-rate"),
            Feature::OnlineStreaming => write!(f, "online-streaming"),
            Feature::BatteryInfo => write!(f, "battery-info"),
            Feature::DeviceInfo => write!(f, "device-info"),
        }
    }
}

/// Unsolicited lifecycle events a transport pushes to whoever subscribes via
/// [`Transport::events`].
///
/// These are the typed replacement for the vendor SDK's single monolithic
/// callback object: each variant is one callback.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The adapter was powered on or off.
    PowerStateChanged(bool),
    /// The link to a connected device dropped without a local `disconnect`.
    LinkLost { id: String },
    /// A capability became usable on the device.
    FeatureReady { id: String, feature: Feature },
    /// One Device Information Service string (manufacturer, model, firmware…).
    DeviceInfo {
        id: String,
        key: String,
        value: String,
    },
    /// Battery state of charge in percent.
    BatteryLevel { id: String, percent: u8 },
}

/// A device backend. Implementations must be cheap to share (`Arc`) and all
/// methods safe to call from any task.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a link to the device. Resolves when the link is usable;
    /// errors are terminal for this attempt (the caller decides about
    /// retries).
    async fn connect(&self, id: &str) -> Result<(), TransportError>;

    /// Tear down the link. Best effort; must be idempotent.
    async fn disconnect(&self, id: &str) -> Result<(), TransportError>;

    /// Start discovery and return a lazy, unbounded stream of sightings.
    /// Dropping the stream stops the underlying scan. Each call yields a
    /// fresh stream.
    async fn scan(&self) -> Result<BoxStream<'static, Discovered>, TransportError>;

    /// Open one decoded sample stream on a connected device. The stream ends
    /// on link loss or device-side completion; mid-stream failures surface as
    /// `Err` items. Dropping the stream releases the subscription.
    async fn start_stream(
        &self,
        id: &str,
        kind: StreamKind,
        config: Option<StreamConfig>,
    ) -> Result<BoxStream<'static, Result<SampleBatch, TransportError>>, TransportError>;

    /// Subscribe to unsolicited lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
