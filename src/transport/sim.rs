//! In-process simulated chest strap.
//!
//! Lets the demo binaries and tests exercise the whole stack — discovery,
//! connect, all three sensor streams, link loss — without hardware. Signal
//! generation is a deterministic phase accumulator, so runs are repeatable.

use std::collections::HashSet;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{Feature, Transport, TransportError, TransportEvent};
use crate::types::{
    AccSample, Discovered, EcgSample, HrSample, SampleBatch, StreamConfig, StreamKind,
};

/// Tuning knobs for the simulated strap.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub device_id: String,
    pub device_name: String,
    /// Artificial latency before a connect resolves.
    pub connect_delay: Duration,
    /// When set, every connect attempt fails. Useful for demoing the
    /// failure/revert path.
    pub fail_connect: bool,
    pub battery_percent: u8,
    /// How often the scan stream reports a sighting.
    pub discovery_interval: Duration,
    pub rssi: i16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_id: "SIM00001".into(),
            device_name: "SimStrap SIM00001".into(),
            connect_delay: Duration::from_millis(300),
            fail_connect: false,
            battery_percent: 87,
            discovery_interval: Duration::from_millis(700),
            rssi: -55,
        }
    }
}

/// Simulated transport: one virtual strap, streams of synthetic vitals.
pub struct SimTransport {
    config: SimConfig,
    events_tx: broadcast::Sender<TransportEvent>,
    connected: Arc<Mutex<HashSet<String>>>,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            config,
            events_tx,
            connected: Arc::default(),
        }
    }

    /// Announce an adapter power-state change to subscribers.
    pub fn set_powered(&self, on: bool) {
        let _ = self
            .events_tx
            .send(TransportEvent::PowerStateChanged(on));
    }

    /// Simulate the strap dropping off the air (battery pulled, out of
    /// range). Emits `LinkLost` exactly like the real adapter watcher.
    pub fn drop_link(&self) {
        let mut connected = self.connected.lock().unwrap();
        if connected.remove(&self.config.device_id) {
            let _ = self.events_tx.send(TransportEvent::LinkLost {
                id: self.config.device_id.clone(),
            });
        }
    }

    fn is_connected(&self, id: &str) -> bool {
        self.connected.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        tokio::time::sleep(self.config.connect_delay).await;
        if self.config.fail_connect {
            return Err(TransportError::ConnectFailed("simulated failure".into()));
        }
        if id != self.config.device_id {
            return Err(TransportError::DeviceNotFound(id.to_string()));
        }
        self.connected.lock().unwrap().insert(id.to_string());

        for feature in [
            Feature::HeartRate,
            Feature::OnlineStreaming,
            Feature::BatteryInfo,
            Feature::DeviceInfo,
        ] {
            let _ = self.events_tx.send(TransportEvent::FeatureReady {
                id: id.to_string(),
                feature,
            });
        }
        for (key, value) in [
            ("manufacturer", "Straplink Labs"),
            ("model", "SimStrap"),
            ("firmware", "1.0.0"),
        ] {
            let _ = self.events_tx.send(TransportEvent::DeviceInfo {
                id: id.to_string(),
                key: key.into(),
                value: value.into(),
            });
        }
        let _ = self.events_tx.send(TransportEvent::BatteryLevel {
            id: id.to_string(),
            percent: self.config.battery_percent,
        });
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        self.connected.lock().unwrap().remove(id);
        Ok(())
    }

    async fn scan(&self) -> Result<BoxStream<'static, Discovered>, TransportError> {
        let config = self.config.clone();
        Ok(futures::stream::unfold(0u32, move |tick| {
            let config = config.clone();
            async move {
                tokio::time::sleep(config.discovery_interval).await;
                let sighting = Discovered {
                    id: config.device_id.clone(),
                    address: "00:22:D0:00:00:01".into(),
                    // Small deterministic wiggle so the list looks alive.
                    rssi: config.rssi + (tick % 7) as i16 - 3,
                    name: Some(config.device_name.clone()),
                    connectable: true,
                    services: vec![super::gatt::HEART_RATE_SERVICE],
                };
                Some((sighting, tick + 1))
            }
        })
        .boxed())
    }

    async fn start_stream(
        &self,
        id: &str,
        kind: StreamKind,
        config: Option<StreamConfig>,
    ) -> Result<BoxStream<'static, Result<SampleBatch, TransportError>>, TransportError> {
        if !self.is_connected(id) {
            return Err(TransportError::NoLink(id.to_string()));
        }

        let config = config.or_else(|| kind.default_config());
        let connected = Arc::clone(&self.connected);
        let id = id.to_string();

        // One batch roughly every 100 ms for the high-rate kinds, one per
        // second for heart rate, the cadence a real strap notifies at.
        let (period, samples_per_batch) = match kind {
            StreamKind::HeartRate => (Duration::from_millis(1000), 1usize),
            _ => {
                let rate = config.map(|c| c.sample_rate_hz).unwrap_or(100).max(10);
                (Duration::from_millis(100), (rate as usize) / 10)
            }
        };

        let stream = futures::stream::unfold(0u64, move |index| {
            let connected = Arc::clone(&connected);
            let id = id.clone();
            async move {
                tokio::time::sleep(period).await;
                if !connected.lock().unwrap().contains(&id) {
                    // Link went away: end the stream like a real notification
                    // pipe closing.
                    return None;
                }
                let batch = match kind {
                    StreamKind::HeartRate => hr_batch(index),
                    StreamKind::Ecg => ecg_batch(index, samples_per_batch),
                    StreamKind::Accelerometer => acc_batch(index, samples_per_batch),
                };
                Some((Ok(batch), index + 1))
            }
        });

        Ok(stream.boxed())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

// ── Signal generators ────────────────────────────────────────────────────────

/// Resting heart rate drifting slowly between ~58 and ~74 bpm, with two RR
/// intervals per sample derived from the rate.
fn hr_batch(tick: u64) -> SampleBatch {
    let bpm = (66.0 + 8.0 * (tick as f64 / 19.0).sin()).round() as u16;
    let rr = (60_000 / bpm.max(1)) as u16;
    SampleBatch::Hr(vec![HrSample {
        bpm,
        contact_detected: true,
        contact_supported: true,
        rr_available: true,
        rrs_ms: vec![rr, rr.saturating_add((tick % 5) as u16 * 3)],
    }])
}

/// A crude ECG shape: baseline sine plus a sharp QRS-like spike once per
/// simulated beat.
fn ecg_batch(batch: u64, samples: usize) -> SampleBatch {
    let out = (0..samples)
        .map(|i| {
            let n = batch as usize * samples + i;
            let phase = n as f64 / 130.0;
            let baseline = 120.0 * (TAU * 1.1 * phase).sin();
            let beat = phase.fract();
            let spike = if beat < 0.04 { 1600.0 } else { 0.0 };
            EcgSample {
                voltage_uv: (baseline + spike) as i32,
            }
        })
        .collect();
    SampleBatch::Ecg(out)
}

/// Gravity on Z with a gentle sway on X/Y, timestamped at the nominal sample
/// spacing.
fn acc_batch(batch: u64, samples: usize) -> SampleBatch {
    const SAMPLE_NS: u64 = 5_000_000; // 200 Hz
    let out = (0..samples)
        .map(|i| {
            let n = batch * samples as u64 + i as u64;
            let phase = n as f64 / 200.0;
            AccSample {
                x: (90.0 * (TAU * 0.4 * phase).sin()) as i16,
                y: (60.0 * (TAU * 0.3 * phase).cos()) as i16,
                z: 1000 + (25.0 * (TAU * 0.7 * phase).sin()) as i16,
                timestamp_ns: n * SAMPLE_NS,
            }
        })
        .collect();
    SampleBatch::Acc(out)
}
