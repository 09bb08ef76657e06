use std::fmt;

/// Connection lifecycle state of the single managed device session.
///
/// Exactly one value at any time, owned by
/// [`crate::session::SessionManager`] and published through a
/// `tokio::sync::watch` channel. The only legal transitions:
///
/// ```text
/// Disconnected --connect--> Connecting --(ok)-->   Connected
/// Connecting   --(fail)-->  Disconnected
/// Connecting   --disconnect--> Disconnected   (cancels the attempt)
/// Connected    --disconnect--> Disconnected
/// ```
///
/// There is no terminal state; the machine is reusable indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// The three sensor streams a chest strap exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    HeartRate,
    Ecg,
    Accelerometer,
}

impl StreamKind {
    /// All kinds, in display order.
    pub const ALL: [StreamKind; 3] = [
        StreamKind::HeartRate,
        StreamKind::Ecg,
        StreamKind::Accelerometer,
    ];

    /// Short uppercase label used in log lines and the command surfaces.
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::HeartRate => "HR",
            StreamKind::Ecg => "ECG",
            StreamKind::Accelerometer => "ACC",
        }
    }

    /// The fixed default configuration for this kind.
    ///
    /// | Kind | Sample rate | Resolution | Range |
    /// |---|---|---|---|
    /// | HeartRate | — | — | — |
    /// | Ecg | 130 Hz | 14-bit | — |
    /// | Accelerometer | 200 Hz | 16-bit | ±8 g |
    ///
    /// Heart rate has no configuration schema; `start` passes `None` through
    /// to the transport.
    pub fn default_config(&self) -> Option<StreamConfig> {
        match self {
            StreamKind::HeartRate => None,
            StreamKind::Ecg => Some(StreamConfig {
                sample_rate_hz: 130,
                resolution_bits: 14,
                range_g: None,
            }),
            StreamKind::Accelerometer => Some(StreamConfig {
                sample_rate_hz: 200,
                resolution_bits: 16,
                range_g: Some(8),
            }),
        }
    }

    /// Whether decoded measurements of this kind are enqueued to the
    /// telemetry sink. Accelerometer samples are decoded and logged but not
    /// persisted.
    pub fn persisted(&self) -> bool {
        !matches!(self, StreamKind::Accelerometer)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sensor stream settings handed to the transport when a stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate_hz: u32,
    pub resolution_bits: u8,
    /// Dynamic range in g. Accelerometer only.
    pub range_g: Option<u8>,
}

/// One decoded heart-rate sample.
#[derive(Debug, Clone)]
pub struct HrSample {
    /// Beats per minute.
    pub bpm: u16,
    /// Skin-contact bit, meaningful only when `contact_supported` is set.
    pub contact_detected: bool,
    pub contact_supported: bool,
    /// Set when the strap included inter-beat intervals in this sample.
    pub rr_available: bool,
    /// Inter-beat (RR) intervals in milliseconds. Empty unless `rr_available`.
    pub rrs_ms: Vec<u16>,
}

/// One decoded ECG sample: a single voltage reading in microvolts.
#[derive(Debug, Clone, Copy)]
pub struct EcgSample {
    pub voltage_uv: i32,
}

/// One decoded accelerometer sample in milli-g, with the strap's own
/// nanosecond timestamp.
#[derive(Debug, Clone, Copy)]
pub struct AccSample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub timestamp_ns: u64,
}

/// One decoded notification's worth of samples from the transport.
///
/// A batch always carries the samples of exactly one [`StreamKind`]; the
/// multiplexer fans each batch out into per-sample [`Measurement`]s in
/// batch-then-sample order.
#[derive(Debug, Clone)]
pub enum SampleBatch {
    Hr(Vec<HrSample>),
    Ecg(Vec<EcgSample>),
    Acc(Vec<AccSample>),
}

impl SampleBatch {
    pub fn kind(&self) -> StreamKind {
        match self {
            SampleBatch::Hr(_) => StreamKind::HeartRate,
            SampleBatch::Ecg(_) => StreamKind::Ecg,
            SampleBatch::Acc(_) => StreamKind::Accelerometer,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SampleBatch::Hr(s) => s.len(),
            SampleBatch::Ecg(s) => s.len(),
            SampleBatch::Acc(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone)]
pub struct Discovered {
    /// Opaque device identity, usable with `connect`.
    pub id: String,
    /// Platform address string (MAC on Linux, UUID elsewhere).
    pub address: String,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Advertised local name, when present.
    pub name: Option<String>,
    pub connectable: bool,
    /// Advertised service UUIDs; auto-connect filters on these.
    pub services: Vec<uuid::Uuid>,
}

/// One scalar destined for the telemetry sink.
///
/// Ephemeral: produced by the multiplexer's decode step, consumed by the sink
/// worker, never retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub measurement: &'static str,
    pub field: &'static str,
    pub value: f64,
}

/// Why a stream subscription stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop(kind)` was called.
    Requested,
    /// The session disconnected and cancellation cascaded.
    SessionClosed,
    /// The underlying stream completed on its own.
    StreamEnded,
    /// The underlying stream reported an error.
    StreamError(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::SessionClosed => write!(f, "session closed"),
            StopReason::StreamEnded => write!(f, "stream ended"),
            StopReason::StreamError(e) => write!(f, "stream error: {e}"),
        }
    }
}

/// Observer notifications emitted by the session manager and the stream
/// multiplexer.
///
/// Consumers receive these through the `mpsc::UnboundedReceiver` paired with
/// the sender handed to [`crate::session::SessionManager::new`]. For a given
/// session, state-change notifications are delivered in the order the
/// transitions occurred, and a kind's `StreamStopped` is delivered before the
/// `Disconnected` it cascaded from.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The BLE adapter's power state changed.
    PowerStateChanged(bool),
    Connecting {
        id: String,
    },
    Connected {
        id: String,
    },
    Disconnected {
        id: String,
    },
    /// A connect attempt failed; the session is `Disconnected` again.
    /// Reported exactly once per failed attempt.
    ConnectFailed {
        id: String,
        reason: String,
    },
    /// Auto-connect finished its search phase. `matched` is the device it
    /// went on to connect to, or `None` when the scan ended without a match.
    AutoConnectEnded {
        matched: Option<String>,
        error: Option<String>,
    },
    DeviceDiscovered(Discovered),
    /// A scan terminated on its own (stream end or error). Not emitted for
    /// explicit cancellation.
    ScanEnded {
        error: Option<String>,
    },
    StreamStarted {
        kind: StreamKind,
    },
    StreamStopped {
        kind: StreamKind,
        reason: StopReason,
    },
    FeatureReady {
        id: String,
        feature: crate::transport::Feature,
    },
    DeviceInfo {
        id: String,
        key: String,
        value: String,
    },
    BatteryLevel {
        id: String,
        percent: u8,
    },
}
