//! btleplug-backed transport for standard-profile chest straps.
//!
//! Covers scanning, connecting, battery / device-information reads, and the
//! Heart Rate Measurement notification stream. The strap vendor's private
//! measurement service (ECG, accelerometer) is intentionally not spoken here;
//! requesting those kinds returns [`TransportError::Unsupported`]. Use
//! [`crate::transport::sim::SimTransport`] when all three streams are needed
//! without hardware.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};

use super::gatt::{
    parse_heart_rate, BATTERY_LEVEL, DIS_STRINGS, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
};
use super::{Feature, Transport, TransportError, TransportEvent};
use crate::types::{Discovered, SampleBatch, StreamConfig, StreamKind};

/// How long to scan for a peripheral that matches a connect target.
const FIND_TIMEOUT: Duration = Duration::from_secs(15);
/// Hard timeout on the platform connect call. BlueZ's Connect can block
/// forever when the device is out of range or the stack is in a bad state.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// Real BLE transport. Cheap to clone behind an `Arc`; one adapter, any
/// number of sequential links.
pub struct BleTransport {
    adapter: Adapter,
    events_tx: broadcast::Sender<TransportEvent>,
    /// Device identity → connected peripheral. Shared with the link watcher
    /// so adapter-level disconnects map back to identities.
    links: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleTransport {
    /// Grab the first Bluetooth adapter and start the link watcher.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterUnavailable)?;

        // macOS: CBCentralManager starts in an "unknown" state and silently
        // ignores scan requests until it reports PoweredOn.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => break,
                    Ok(_) if tokio::time::Instant::now() >= deadline => {
                        warn!("adapter not powered on after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let (events_tx, _) = broadcast::channel(64);
        let links: Arc<Mutex<HashMap<String, Peripheral>>> = Arc::default();

        // Link watcher: adapter disconnect events fire reliably when a strap
        // powers off or walks out of range, usually before the notification
        // stream closes.
        let watcher_adapter = adapter.clone();
        let watcher_links = Arc::clone(&links);
        let watcher_tx = events_tx.clone();
        tokio::spawn(async move {
            // Deferred to the task so that subscribers registered right after
            // construction still see the initial power state.
            let _ = watcher_tx.send(TransportEvent::PowerStateChanged(true));
            let mut events = match watcher_adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("link watcher: could not subscribe to adapter events: {e}");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(pid) = event {
                    let lost = {
                        let mut links = watcher_links.lock().await;
                        let lost = links
                            .iter()
                            .find(|(_, p)| p.id() == pid)
                            .map(|(id, _)| id.clone());
                        if let Some(id) = &lost {
                            links.remove(id);
                        }
                        lost
                    };
                    if let Some(id) = lost {
                        info!("link lost: {id}");
                        let _ = watcher_tx.send(TransportEvent::LinkLost { id });
                    }
                }
            }
        });

        Ok(Self {
            adapter,
            events_tx,
            links,
        })
    }

    /// Poll the adapter until a peripheral matching `id` shows up. Connect
    /// targets are straps, so the scan is narrowed to the heart-rate service.
    async fn find_peripheral(&self, id: &str) -> Result<Peripheral, TransportError> {
        self.adapter
            .start_scan(heart_rate_scan_filter())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let result = tokio::time::timeout(FIND_TIMEOUT, async {
            loop {
                for p in self.adapter.peripherals().await.unwrap_or_default() {
                    if let Ok(Some(props)) = p.properties().await {
                        if identity_matches(id, &p.id(), &props) {
                            return p;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        self.adapter.stop_scan().await.ok();
        result.map_err(|_| TransportError::DeviceNotFound(id.to_string()))
    }

    /// Post-connect reads: battery level and the device-information strings,
    /// surfaced as transport events the way the vendor SDK fires its
    /// `batteryLevelReceived` / `disInformationReceived` callbacks.
    async fn announce_device(&self, id: &str, peripheral: &Peripheral) {
        let chars = peripheral.characteristics();
        let find = |uuid: uuid::Uuid| chars.iter().find(|c| c.uuid == uuid);

        if find(HEART_RATE_MEASUREMENT).is_some() {
            let _ = self.events_tx.send(TransportEvent::FeatureReady {
                id: id.to_string(),
                feature: Feature::HeartRate,
            });
            let _ = self.events_tx.send(TransportEvent::FeatureReady {
                id: id.to_string(),
                feature: Feature::OnlineStreaming,
            });
        }

        if let Some(c) = find(BATTERY_LEVEL) {
            match peripheral.read(c).await {
                Ok(value) if !value.is_empty() => {
                    let _ = self.events_tx.send(TransportEvent::FeatureReady {
                        id: id.to_string(),
                        feature: Feature::BatteryInfo,
                    });
                    let _ = self.events_tx.send(TransportEvent::BatteryLevel {
                        id: id.to_string(),
                        percent: value[0].min(100),
                    });
                }
                Ok(_) => {}
                Err(e) => debug!("battery read failed: {e}"),
            }
        }

        let mut any_dis = false;
        for (uuid, key) in DIS_STRINGS {
            if let Some(c) = find(uuid) {
                if let Ok(value) = peripheral.read(c).await {
                    any_dis = true;
                    let _ = self.events_tx.send(TransportEvent::DeviceInfo {
                        id: id.to_string(),
                        key: key.to_string(),
                        value: String::from_utf8_lossy(&value).trim().to_string(),
                    });
                }
            }
        }
        if any_dis {
            let _ = self.events_tx.send(TransportEvent::FeatureReady {
                id: id.to_string(),
                feature: Feature::DeviceInfo,
            });
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        if self.links.lock().await.contains_key(id) {
            return Ok(());
        }

        let peripheral = self.find_peripheral(id).await?;

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| TransportError::ConnectFailed("connect timed out".into()))?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        // BlueZ signals connection completion before the remote GATT cache is
        // populated; discovering too early yields an empty characteristic set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::ConnectFailed("service discovery timed out".into()))?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        info!("connected and services discovered: {id}");
        self.announce_device(id, &peripheral).await;
        self.links.lock().await.insert(id.to_string(), peripheral);
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        let peripheral = self.links.lock().await.remove(id);
        if let Some(p) = peripheral {
            p.disconnect()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn scan(&self) -> Result<BoxStream<'static, Discovered>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Discovered>(32);
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            // Peripherals the adapter already knows about never fire a fresh
            // DeviceDiscovered event, so report them up front.
            for p in adapter.peripherals().await.unwrap_or_default() {
                if let Ok(Some(props)) = p.properties().await {
                    if tx.send(discovered_from(&p.id(), &props)).await.is_err() {
                        adapter.stop_scan().await.ok();
                        return;
                    }
                }
            }

            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDiscovered(pid) = event {
                    let Ok(p) = adapter.peripheral(&pid).await else {
                        continue;
                    };
                    let Ok(Some(props)) = p.properties().await else {
                        continue;
                    };
                    if tx.send(discovered_from(&pid, &props)).await.is_err() {
                        break;
                    }
                }
            }
            adapter.stop_scan().await.ok();
            debug!("scan pump finished");
        });

        Ok(channel_stream(rx))
    }

    async fn start_stream(
        &self,
        id: &str,
        kind: StreamKind,
        _config: Option<StreamConfig>,
    ) -> Result<BoxStream<'static, Result<SampleBatch, TransportError>>, TransportError> {
        if kind != StreamKind::HeartRate {
            return Err(TransportError::Unsupported {
                kind,
                detail: "vendor measurement service not implemented, use the simulated transport"
                    .into(),
            });
        }

        let peripheral = self
            .links
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::NoLink(id.to_string()))?;

        let hrm = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == HEART_RATE_MEASUREMENT)
            .ok_or_else(|| TransportError::Unsupported {
                kind,
                detail: "device has no heart-rate measurement characteristic".into(),
            })?;

        peripheral
            .subscribe(&hrm)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Result<SampleBatch, TransportError>>(64);
        tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid != HEART_RATE_MEASUREMENT {
                    continue;
                }
                let item = match parse_heart_rate(&n.value) {
                    Some(sample) => Ok(SampleBatch::Hr(vec![sample])),
                    None => {
                        debug!("unparseable heart-rate payload: {:02x?}", n.value);
                        continue;
                    }
                };
                if tx.send(item).await.is_err() {
                    // Subscriber went away: release the GATT subscription.
                    peripheral.unsubscribe(&hrm).await.ok();
                    return;
                }
            }
            // Notification stream closed, usually link loss. Closing the
            // channel ends the sample stream.
        });

        Ok(channel_stream(rx))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

/// Whether a peripheral answers to the given device identity: the advertised
/// name ends with it (chest straps advertise `"<model> <id>"`), or it equals
/// the platform id or address outright.
fn identity_matches(id: &str, pid: &PeripheralId, props: &PeripheralProperties) -> bool {
    if let Some(name) = &props.local_name {
        let name = name.to_ascii_uppercase();
        if name == id.to_ascii_uppercase() || name.ends_with(&id.to_ascii_uppercase()) {
            return true;
        }
    }
    pid.to_string() == id || props.address.to_string().eq_ignore_ascii_case(id)
}

fn discovered_from(pid: &PeripheralId, props: &PeripheralProperties) -> Discovered {
    // Straps embed the device id as the last token of the advertised name;
    // fall back to the platform id when there is no such token.
    let id = props
        .local_name
        .as_deref()
        .and_then(|name| name.split_whitespace().last())
        .filter(|tail| tail.len() >= 4 && tail.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_string)
        .unwrap_or_else(|| pid.to_string());

    Discovered {
        id,
        address: props.address.to_string(),
        rssi: props.rssi.unwrap_or(i16::MIN),
        name: props.local_name.clone(),
        connectable: true,
        services: props.services.clone(),
    }
}

/// Adapt an mpsc receiver into a stream; ends when the sender side is
/// dropped.
fn channel_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

/// Scan filter that only surfaces heart-rate-capable peripherals. Used when
/// locating a connect target; the discovery scan deliberately lists
/// everything.
pub fn heart_rate_scan_filter() -> ScanFilter {
    ScanFilter {
        services: vec![HEART_RATE_SERVICE],
    }
}
