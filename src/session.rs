//! Device session manager: the connection lifecycle state machine.
//!
//! One [`SessionManager`] owns the single logical connection to one device
//! identity. Public operations are meant to be driven from one control task
//! (`&mut self` makes concurrent external callers a compile error); the
//! asynchronous completions of connect attempts, scans and transport events
//! run on spawned tasks and commit their transitions through a shared
//! transition lock, so observers always see notifications in the order the
//! transitions occurred.
//!
//! The manager owns `ConnectionState` and the device identity exclusively.
//! The multiplexer created by [`SessionManager::stream_multiplexer`] only
//! reads the state (through a `watch` receiver) and shares the subscription
//! table so that disconnecting — explicitly or through link loss — stops
//! every live subscription *before* the `Disconnected` transition becomes
//! observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::mux::{shutdown_streams, StreamMultiplexer, Subscription};
use crate::sink::TelemetrySink;
use crate::transport::{Transport, TransportEvent};
use crate::types::{ConnectionState, CoreEvent, StopReason, StreamKind};

/// State shared between the session manager, the multiplexer and the spawned
/// tasks.
pub(crate) struct Shared {
    /// Serializes every state transition together with its notification.
    ctl: Mutex<Ctl>,
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) subs: Mutex<HashMap<StreamKind, Subscription>>,
    pub(crate) next_sub_id: AtomicU64,
    events: mpsc::UnboundedSender<CoreEvent>,
}

struct Ctl {
    /// Identity of the connected device; kept across disconnects so the
    /// command surface can offer a reconnect target.
    identity: Option<String>,
    /// Target of an in-flight connect attempt.
    pending: Option<String>,
    /// Cancel token of the current connect attempt / connection. Present
    /// while `Connecting` or `Connected`; subscriptions derive child tokens
    /// from it.
    link: Option<CancelToken>,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn current_identity(&self) -> Option<String> {
        self.ctl.lock().unwrap().identity.clone()
    }

    pub(crate) fn link_token(&self) -> Option<CancelToken> {
        self.ctl.lock().unwrap().link.clone()
    }

    /// Disconnected → Connecting. Fails fast without mutating anything when
    /// the machine is not at `Disconnected`.
    fn begin_connecting(&self, id: &str, op: &'static str) -> Result<CancelToken, CoreError> {
        let mut ctl = self.ctl.lock().unwrap();
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(CoreError::InvalidState { op, state });
        }
        let token = CancelToken::new();
        ctl.pending = Some(id.to_string());
        ctl.link = Some(token.clone());
        self.state_tx.send_replace(ConnectionState::Connecting);
        self.emit(CoreEvent::Connecting { id: id.to_string() });
        Ok(token)
    }

    /// Connecting → Connected, unless the attempt was cancelled in the
    /// meantime. Returns whether the transition happened.
    fn commit_connected(&self, id: &str, token: &CancelToken) -> bool {
        let mut ctl = self.ctl.lock().unwrap();
        if token.is_cancelled() {
            return false;
        }
        ctl.identity = Some(id.to_string());
        ctl.pending = None;
        self.state_tx.send_replace(ConnectionState::Connected);
        self.emit(CoreEvent::Connected { id: id.to_string() });
        true
    }

    /// Connecting → Disconnected after a transport failure. A cancelled
    /// token means `disconnect()` already owned the transition.
    fn fail_connect(&self, id: &str, reason: String, token: &CancelToken) {
        let mut ctl = self.ctl.lock().unwrap();
        if token.is_cancelled() {
            return;
        }
        ctl.pending = None;
        ctl.link = None;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.emit(CoreEvent::ConnectFailed {
            id: id.to_string(),
            reason,
        });
    }

    /// Any state → Disconnected. Returns the link target for transport
    /// cleanup, or `None` when the machine was already disconnected (a
    /// concurrent path won the race; nothing is emitted twice).
    fn finish_disconnect(&self) -> Option<String> {
        let mut ctl = self.ctl.lock().unwrap();
        if self.state() == ConnectionState::Disconnected {
            return None;
        }
        if let Some(link) = ctl.link.take() {
            link.cancel();
        }
        let id = ctl.pending.take().or_else(|| ctl.identity.clone());
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.emit(CoreEvent::Disconnected {
            id: id.clone().unwrap_or_default(),
        });
        id
    }

    fn is_current(&self, id: &str) -> bool {
        let ctl = self.ctl.lock().unwrap();
        ctl.identity.as_deref() == Some(id) || ctl.pending.as_deref() == Some(id)
    }
}

/// A device id is opaque but not arbitrary: printable, no whitespace, only
/// the characters that show up in strap ids, platform ids and addresses.
fn validate_identity(id: &str) -> Result<(), CoreError> {
    let well_formed = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_'));
    if well_formed {
        Ok(())
    } else {
        Err(CoreError::InvalidIdentity(id.to_string()))
    }
}

/// Owns the connection lifecycle to exactly one device at a time.
pub struct SessionManager<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    connect_task: Option<JoinHandle<()>>,
    auto_task: Option<(CancelToken, JoinHandle<()>)>,
    scan_task: Option<(CancelToken, JoinHandle<()>)>,
    watcher: JoinHandle<()>,
}

impl<T: Transport> SessionManager<T> {
    /// Create a manager over `transport`, delivering observer notifications
    /// to `events`. Spawns the transport-event watcher immediately.
    pub fn new(transport: Arc<T>, events: mpsc::UnboundedSender<CoreEvent>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            ctl: Mutex::new(Ctl {
                identity: None,
                pending: None,
                link: None,
            }),
            state_tx,
            subs: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            events,
        });

        // Subscribe before spawning so no early transport event slips past.
        let transport_events = transport.events();
        let watcher = tokio::spawn(watch_transport(transport_events, Arc::clone(&shared)));

        Self {
            transport,
            shared,
            state_rx,
            connect_task: None,
            auto_task: None,
            scan_task: None,
            watcher,
        }
    }

    /// Build the stream multiplexer bound to this session.
    pub fn stream_multiplexer(&self, sink: Arc<dyn TelemetrySink>) -> StreamMultiplexer<T> {
        StreamMultiplexer::new(Arc::clone(&self.transport), Arc::clone(&self.shared), sink)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A `watch` receiver over the connection state, for anything that wants
    /// to observe without consuming the event stream.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The identity of the connected (or last connected) device.
    pub fn identity(&self) -> Option<String> {
        self.shared.current_identity()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task
            .as_ref()
            .map_or(false, |(_, task)| !task.is_finished())
    }

    pub fn is_auto_connecting(&self) -> bool {
        self.auto_task
            .as_ref()
            .map_or(false, |(_, task)| !task.is_finished())
    }

    /// Start a connect attempt. Legal only while `Disconnected`; transitions
    /// to `Connecting` before returning. The returned token cancels the
    /// attempt (equivalent to `disconnect()` while `Connecting`).
    pub async fn connect(&mut self, id: &str) -> Result<CancelToken, CoreError> {
        validate_identity(id)?;
        let token = self.shared.begin_connecting(id, "connect")?;
        info!("connecting: {id}");

        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let id = id.to_string();
        let task_token = token.clone();
        self.connect_task = Some(tokio::spawn(async move {
            run_attempt(transport, shared, id, task_token).await;
        }));
        Ok(token)
    }

    /// Tear the session down: stops every live stream subscription (their
    /// `StreamStopped` notifications are delivered first), cancels an
    /// in-flight connect attempt, then transitions to `Disconnected`.
    pub async fn disconnect(&mut self) -> Result<(), CoreError> {
        let state = self.state();
        if state == ConnectionState::Disconnected {
            return Err(CoreError::InvalidState {
                op: "disconnect",
                state,
            });
        }

        shutdown_streams(&self.shared, StopReason::SessionClosed).await;

        if let Some(id) = self.shared.finish_disconnect() {
            if let Err(e) = self.transport.disconnect(&id).await {
                warn!("transport disconnect for {id}: {e}");
            }
            info!("disconnected: {id}");
        }
        if let Some(task) = self.connect_task.take() {
            task.await.ok();
        }
        Ok(())
    }

    /// Scan for the first sufficiently strong, connectable device advertising
    /// `service_filter` (when given) and connect to it. Ends on the first
    /// success, on a terminal failure, or when cancelled; it never retries by
    /// itself. A still-running previous search is cancelled first.
    pub async fn auto_connect(
        &mut self,
        rssi_threshold: i16,
        service_filter: Option<Uuid>,
    ) -> Result<CancelToken, CoreError> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(CoreError::InvalidState {
                op: "auto-connect",
                state,
            });
        }
        self.cancel_auto_connect().await;

        let token = CancelToken::new();
        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            run_auto_connect(transport, shared, rssi_threshold, service_filter, task_token).await;
        });
        self.auto_task = Some((token.clone(), task));
        Ok(token)
    }

    /// Cancel a running auto-connect search, if any, and wait for it to wind
    /// down. Idempotent. A search that already began connecting is past
    /// cancellation of the *search*; cancel the attempt via `disconnect()`.
    pub async fn cancel_auto_connect(&mut self) {
        if let Some((token, task)) = self.auto_task.take() {
            token.cancel();
            task.await.ok();
        }
    }

    /// Start a device scan, delivering `DeviceDiscovered` notifications until
    /// cancelled. At most one scan runs at a time: a previous scan is
    /// cancelled and *awaited* before the new one starts, since scan
    /// cancellation is asynchronous at the adapter level.
    pub async fn scan(&mut self) -> Result<CancelToken, CoreError> {
        self.stop_scan().await;

        let token = CancelToken::new();
        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let mut stream = match transport.scan().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("scan failed to start: {e}");
                    shared.emit(CoreEvent::ScanEnded {
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };
            use futures::StreamExt;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    sighting = stream.next() => match sighting {
                        Some(device) => shared.emit(CoreEvent::DeviceDiscovered(device)),
                        None => {
                            shared.emit(CoreEvent::ScanEnded { error: None });
                            break;
                        }
                    },
                }
            }
        });
        self.scan_task = Some((token.clone(), task));
        Ok(token)
    }

    /// Cancel the active scan and wait for its confirmation. Idempotent.
    pub async fn stop_scan(&mut self) {
        if let Some((token, task)) = self.scan_task.take() {
            token.cancel();
            task.await.ok();
        }
    }
}

impl<T: Transport> Drop for SessionManager<T> {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Some(task) = &self.connect_task {
            task.abort();
        }
        if let Some((token, task)) = &self.auto_task {
            token.cancel();
            task.abort();
        }
        if let Some((token, task)) = &self.scan_task {
            token.cancel();
            task.abort();
        }
    }
}

/// One connect attempt: races the transport call against cancellation and
/// commits the resulting transition.
async fn run_attempt<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Shared>,
    id: String,
    token: CancelToken,
) {
    tokio::select! {
        _ = token.cancelled() => {
            // Make sure a half-open platform link does not linger, then
            // revert the state unless disconnect() already owned that
            // transition (finish_disconnect no-ops when already down).
            transport.disconnect(&id).await.ok();
            shared.finish_disconnect();
        }
        result = transport.connect(&id) => match result {
            Ok(()) if shared.commit_connected(&id, &token) => {}
            Ok(()) => {
                // Cancelled while the transport was completing.
                transport.disconnect(&id).await.ok();
                shared.finish_disconnect();
            }
            Err(e) => {
                warn!("connect {id} failed: {e}");
                shared.fail_connect(&id, e.to_string(), &token);
                if token.is_cancelled() {
                    shared.finish_disconnect();
                }
            }
        },
    }
}

/// The auto-connect search-then-connect sequence.
async fn run_auto_connect<T: Transport>(
    transport: Arc<T>,
    shared: Arc<Shared>,
    rssi_threshold: i16,
    service_filter: Option<Uuid>,
    token: CancelToken,
) {
    use futures::StreamExt;

    let mut stream = match transport.scan().await {
        Ok(stream) => stream,
        Err(e) => {
            shared.emit(CoreEvent::AutoConnectEnded {
                matched: None,
                error: Some(e.to_string()),
            });
            return;
        }
    };

    let target = loop {
        tokio::select! {
            _ = token.cancelled() => return,
            sighting = stream.next() => match sighting {
                Some(device) => {
                    let service_ok = service_filter
                        .map_or(true, |service| device.services.contains(&service));
                    if device.connectable && device.rssi >= rssi_threshold && service_ok {
                        break device;
                    }
                }
                None => {
                    shared.emit(CoreEvent::AutoConnectEnded {
                        matched: None,
                        error: None,
                    });
                    return;
                }
            },
        }
    };
    drop(stream);

    info!(
        "auto-connect matched {} (rssi {})",
        target.id, target.rssi
    );
    shared.emit(CoreEvent::AutoConnectEnded {
        matched: Some(target.id.clone()),
        error: None,
    });

    // Someone may have connected manually while we were searching.
    let Ok(link_token) = shared.begin_connecting(&target.id, "auto-connect") else {
        return;
    };
    // Cancelling the search also cancels the attempt it spawned; the link
    // token stays independently cancellable by disconnect().
    token.adopt(&link_token);
    run_attempt(transport, shared, target.id, link_token).await;
}

/// Maps unsolicited transport events to observer notifications and performs
/// the link-loss cascade: subscriptions stopped first, `Disconnected` last —
/// exactly the `disconnect()` ordering.
async fn watch_transport(
    mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    shared: Arc<Shared>,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!("transport event watcher lagged, {missed} events missed");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            TransportEvent::PowerStateChanged(on) => {
                shared.emit(CoreEvent::PowerStateChanged(on));
            }
            TransportEvent::LinkLost { id } => {
                if !shared.is_current(&id) || shared.state() == ConnectionState::Disconnected {
                    continue;
                }
                info!("link lost: {id}");
                shutdown_streams(&shared, StopReason::SessionClosed).await;
                shared.finish_disconnect();
            }
            TransportEvent::FeatureReady { id, feature } => {
                shared.emit(CoreEvent::FeatureReady { id, feature });
            }
            TransportEvent::DeviceInfo { id, key, value } => {
                shared.emit(CoreEvent::DeviceInfo { id, key, value });
            }
            TransportEvent::BatteryLevel { id, percent } => {
                shared.emit(CoreEvent::BatteryLevel { id, percent });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("C621D624").is_ok());
        assert!(validate_identity("AA:BB:CC:DD:EE:FF").is_ok());
        assert!(validate_identity("sim-strap_1").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("has space").is_err());
        assert!(validate_identity("käse").is_err());
        assert!(validate_identity(&"x".repeat(65)).is_err());
    }
}
