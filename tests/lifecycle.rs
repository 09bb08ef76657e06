//! End-to-end lifecycle tests over a scripted transport: every observable
//! property of the session state machine, the stream multiplexer and the
//! sink forwarding path, without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};

use straplink::prelude::*;
use straplink::transport::gatt::HEART_RATE_SERVICE;
use straplink::types::{EcgSample, HrSample};

// ── Scripted transport ───────────────────────────────────────────────────────

type FeedSender = mpsc::UnboundedSender<Result<SampleBatch, TransportError>>;

/// Transport whose behavior the test drives directly: queued connect
/// results, hand-fed sample streams and discovery sightings, and injectable
/// lifecycle events.
struct ScriptedTransport {
    connect_delay: Duration,
    connect_results: Mutex<VecDeque<Result<(), TransportError>>>,
    /// Every start_stream call, with the config the core passed down.
    started: Mutex<Vec<(String, StreamKind, Option<StreamConfig>)>>,
    feeds: Mutex<HashMap<StreamKind, FeedSender>>,
    scan_feed: Mutex<Option<mpsc::UnboundedSender<Discovered>>>,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl ScriptedTransport {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            connect_delay: Duration::from_millis(5),
            connect_results: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            feeds: Mutex::new(HashMap::new()),
            scan_feed: Mutex::new(None),
            events_tx,
        }
    }

    fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    fn queue_connect_result(&self, result: Result<(), TransportError>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    fn feed(&self, kind: StreamKind, batch: SampleBatch) {
        self.feeds.lock().unwrap()[&kind].send(Ok(batch)).unwrap();
    }

    fn fail_stream(&self, kind: StreamKind, message: &str) {
        self.feeds.lock().unwrap()[&kind]
            .send(Err(TransportError::Io(message.into())))
            .unwrap();
    }

    fn end_stream(&self, kind: StreamKind) {
        self.feeds.lock().unwrap().remove(&kind);
    }

    /// Deliver a discovery sighting. The scan task registers its feed only
    /// once it runs, so retry until a live feed accepts the sighting.
    async fn sight(&self, device: Discovered) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let feed = self.scan_feed.lock().unwrap();
                if let Some(tx) = feed.as_ref() {
                    if tx.send(device.clone()).is_ok() {
                        return;
                    }
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no scan feed accepted the sighting"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn lose_link(&self, id: &str) {
        self.events_tx
            .send(TransportEvent::LinkLost { id: id.into() })
            .unwrap();
    }

    fn started_streams(&self) -> Vec<(String, StreamKind, Option<StreamConfig>)> {
        self.started.lock().unwrap().clone()
    }
}

fn unbounded_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _id: &str) -> Result<(), TransportError> {
        tokio::time::sleep(self.connect_delay).await;
        self.connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn disconnect(&self, _id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn scan(&self) -> Result<BoxStream<'static, Discovered>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.scan_feed.lock().unwrap() = Some(tx);
        Ok(unbounded_stream(rx))
    }

    async fn start_stream(
        &self,
        id: &str,
        kind: StreamKind,
        config: Option<StreamConfig>,
    ) -> Result<BoxStream<'static, Result<SampleBatch, TransportError>>, TransportError> {
        self.started
            .lock()
            .unwrap()
            .push((id.to_string(), kind, config));
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(kind, tx);
        Ok(unbounded_stream(rx))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    transport: Arc<ScriptedTransport>,
    session: SessionManager<ScriptedTransport>,
    streams: StreamMultiplexer<ScriptedTransport>,
    events: mpsc::UnboundedReceiver<CoreEvent>,
    sink: Arc<MemorySink>,
}

fn harness() -> Harness {
    harness_with(ScriptedTransport::new())
}

fn harness_with(transport: ScriptedTransport) -> Harness {
    let transport = Arc::new(transport);
    let (events_tx, events) = mpsc::unbounded_channel();
    let session = SessionManager::new(Arc::clone(&transport), events_tx);
    let sink = Arc::new(MemorySink::new());
    let streams = session.stream_multiplexer(sink.clone());
    Harness {
        transport,
        session,
        streams,
        events,
        sink,
    }
}

impl Harness {
    async fn next_event(&mut self) -> CoreEvent {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    /// Drain events until `pred` matches, returning everything received
    /// including the match.
    async fn events_until(&mut self, pred: impl Fn(&CoreEvent) -> bool) -> Vec<CoreEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Connect and wait for the `Connected` notification.
    async fn connect_ok(&mut self, id: &str) {
        self.session.connect(id).await.expect("connect rejected");
        self.events_until(|e| matches!(e, CoreEvent::Connected { .. }))
            .await;
        assert_eq!(self.session.state(), ConnectionState::Connected);
    }

    async fn assert_no_event_for(&mut self, window: Duration) {
        if let Ok(event) = tokio::time::timeout(window, self.events.recv()).await {
            panic!("unexpected event: {:?}", event.unwrap());
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn hr_batch(samples: usize, rrs_per_sample: usize) -> SampleBatch {
    SampleBatch::Hr(
        (0..samples)
            .map(|i| HrSample {
                bpm: 60 + i as u16,
                contact_detected: true,
                contact_supported: true,
                rr_available: rrs_per_sample > 0,
                rrs_ms: (0..rrs_per_sample).map(|r| 900 + r as u16).collect(),
            })
            .collect(),
    )
}

// ── Session state machine ────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_walks_connecting_then_connected() {
    let mut h = harness();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);

    h.session.connect("ABC123").await.unwrap();
    assert_eq!(h.session.state(), ConnectionState::Connecting);
    assert!(matches!(h.next_event().await, CoreEvent::Connecting { id } if id == "ABC123"));
    assert!(matches!(h.next_event().await, CoreEvent::Connected { id } if id == "ABC123"));
    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(h.session.identity().as_deref(), Some("ABC123"));
}

#[tokio::test]
async fn test_connect_rejected_unless_disconnected() {
    let mut h = harness_with(ScriptedTransport::new().with_connect_delay(Duration::from_millis(200)));
    h.session.connect("ABC123").await.unwrap();

    // Connecting: a second connect fails fast without touching the state.
    let err = h.session.connect("ABC123").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    assert_eq!(h.session.state(), ConnectionState::Connecting);

    h.events_until(|e| matches!(e, CoreEvent::Connected { .. })).await;
    let err = h.session.connect("ABC123").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_malformed_identity_rejected_without_state_change() {
    let mut h = harness();
    for bad in ["", "has space", "ümlaut"] {
        let err = h.session.connect(bad).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidIdentity(_)));
    }
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    h.assert_no_event_for(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_connect_failure_reverts_and_reports_once() {
    let mut h = harness();
    h.transport
        .queue_connect_result(Err(TransportError::ConnectFailed("strap off".into())));

    h.session.connect("ABC123").await.unwrap();
    assert!(matches!(h.next_event().await, CoreEvent::Connecting { .. }));
    assert!(
        matches!(h.next_event().await, CoreEvent::ConnectFailed { id, .. } if id == "ABC123")
    );
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    // Exactly once: nothing else shows up.
    h.assert_no_event_for(Duration::from_millis(100)).await;

    // The machine is reusable: the next attempt succeeds.
    h.connect_ok("ABC123").await;
}

#[tokio::test]
async fn test_disconnect_while_connecting_cancels_attempt() {
    let mut h = harness_with(ScriptedTransport::new().with_connect_delay(Duration::from_millis(300)));
    h.session.connect("ABC123").await.unwrap();
    assert!(matches!(h.next_event().await, CoreEvent::Connecting { .. }));

    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert!(matches!(h.next_event().await, CoreEvent::Disconnected { .. }));
    // The cancelled attempt never produces a late Connected.
    h.assert_no_event_for(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn test_disconnect_rejected_while_disconnected() {
    let mut h = harness();
    let err = h.session.disconnect().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    h.assert_no_event_for(Duration::from_millis(50)).await;
}

// ── Stream gating and toggling ───────────────────────────────────────────────

#[tokio::test]
async fn test_start_requires_connected_session() {
    let mut h = harness();
    let err = h.streams.start(StreamKind::HeartRate, None).await.unwrap_err();
    assert!(matches!(err, CoreError::NotConnected));
    assert!(!h.streams.is_live(StreamKind::HeartRate));
    assert!(h.transport.started_streams().is_empty());
    h.assert_no_event_for(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_redundant_start_never_duplicates_subscription() {
    let mut h = harness();
    h.connect_ok("ABC123").await;

    h.streams.start(StreamKind::HeartRate, None).await.unwrap();
    assert!(h.streams.is_live(StreamKind::HeartRate));

    let err = h.streams.start(StreamKind::HeartRate, None).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
    assert_eq!(h.transport.started_streams().len(), 1);
    assert!(h.streams.is_live(StreamKind::HeartRate));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let mut h = harness();
    h.streams.stop(StreamKind::Ecg).await.unwrap();

    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::Ecg, None).await.unwrap();
    h.streams.stop(StreamKind::Ecg).await.unwrap();
    h.streams.stop(StreamKind::Ecg).await.unwrap();
    assert!(!h.streams.is_live(StreamKind::Ecg));

    let stopped: Vec<_> = h
        .events_until(|e| matches!(e, CoreEvent::StreamStopped { .. }))
        .await;
    // Only one stop notification despite three stop calls.
    assert_eq!(
        stopped
            .iter()
            .filter(|e| matches!(e, CoreEvent::StreamStopped { .. }))
            .count(),
        1
    );
    h.assert_no_event_for(Duration::from_millis(50)).await;
}

// ── Forwarding scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_hr_batches_forward_bpm_and_rr_intervals() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::HeartRate, None).await.unwrap();

    for _ in 0..3 {
        h.transport.feed(StreamKind::HeartRate, hr_batch(2, 2));
    }

    let sink = h.sink.clone();
    wait_until(|| sink.writes().len() == 18).await;

    let writes = h.sink.writes();
    let hr: Vec<_> = writes.iter().filter(|w| w.0 == "hr").collect();
    let rrs: Vec<_> = writes.iter().filter(|w| w.0 == "rrs").collect();
    assert_eq!(hr.len(), 6);
    assert_eq!(rrs.len(), 12);

    // Batch-then-sample order: each bpm write is followed by its intervals.
    let names: Vec<&str> = writes.iter().map(|w| w.0.as_str()).collect();
    assert_eq!(
        &names[..6],
        &["hr", "rrs", "rrs", "hr", "rrs", "rrs"],
        "first batch out of order: {names:?}"
    );
}

#[tokio::test]
async fn test_ecg_uses_default_config_and_forwards_each_voltage() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::Ecg, None).await.unwrap();

    let started = h.transport.started_streams();
    assert_eq!(started.len(), 1);
    let config = started[0].2.expect("ECG must get its default config");
    assert_eq!(config.sample_rate_hz, 130);
    assert_eq!(config.resolution_bits, 14);
    assert_eq!(config.range_g, None);

    h.transport.feed(
        StreamKind::Ecg,
        SampleBatch::Ecg((0..5).map(|i| EcgSample { voltage_uv: 100 + i }).collect()),
    );

    let sink = h.sink.clone();
    wait_until(|| sink.writes().len() == 5).await;
    let writes = h.sink.writes();
    assert!(writes.iter().all(|w| w.0 == "ecg" && w.1 == "voltage"));
    assert_eq!(writes[0].2, 100.0);
    assert_eq!(writes[4].2, 104.0);
}

#[tokio::test]
async fn test_accelerometer_config_default_and_no_persistence() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams
        .start(StreamKind::Accelerometer, None)
        .await
        .unwrap();

    let config = h.transport.started_streams()[0]
        .2
        .expect("ACC must get its default config");
    assert_eq!(config.sample_rate_hz, 200);
    assert_eq!(config.resolution_bits, 16);
    assert_eq!(config.range_g, Some(8));

    h.transport.feed(
        StreamKind::Accelerometer,
        SampleBatch::Acc(vec![straplink::types::AccSample {
            x: 10,
            y: -4,
            z: 1001,
            timestamp_ns: 42,
        }]),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.sink.writes().is_empty(), "ACC is observation-only");
}

#[tokio::test]
async fn test_sink_failures_never_stop_the_stream() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::HeartRate, None).await.unwrap();

    h.sink.set_failing(true);
    h.transport.feed(StreamKind::HeartRate, hr_batch(1, 0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.streams.is_live(StreamKind::HeartRate));

    h.sink.set_failing(false);
    h.transport.feed(StreamKind::HeartRate, hr_batch(1, 0));
    let sink = h.sink.clone();
    wait_until(|| sink.writes().len() == 1).await;
}

// ── Termination and cascades ─────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_error_stops_subscription_not_session() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::HeartRate, None).await.unwrap();
    assert!(matches!(h.next_event().await, CoreEvent::StreamStarted { .. }));

    h.transport.fail_stream(StreamKind::HeartRate, "gatt timeout");
    let event = h.next_event().await;
    assert!(matches!(
        event,
        CoreEvent::StreamStopped {
            kind: StreamKind::HeartRate,
            reason: StopReason::StreamError(_),
        }
    ));
    assert!(!h.streams.is_live(StreamKind::HeartRate));
    assert_eq!(h.session.state(), ConnectionState::Connected);

    // No auto-restart: the transport saw exactly one start.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.started_streams().len(), 1);
}

#[tokio::test]
async fn test_natural_stream_end_reports_stream_ended() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::Ecg, None).await.unwrap();
    assert!(matches!(h.next_event().await, CoreEvent::StreamStarted { .. }));

    h.transport.end_stream(StreamKind::Ecg);
    assert!(matches!(
        h.next_event().await,
        CoreEvent::StreamStopped {
            kind: StreamKind::Ecg,
            reason: StopReason::StreamEnded,
        }
    ));
}

#[tokio::test]
async fn test_disconnect_stops_all_streams_before_disconnected() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::HeartRate, None).await.unwrap();
    h.streams.start(StreamKind::Ecg, None).await.unwrap();

    h.session.disconnect().await.unwrap();
    assert_eq!(h.session.state(), ConnectionState::Disconnected);

    let seen = h
        .events_until(|e| matches!(e, CoreEvent::Disconnected { .. }))
        .await;
    let stopped: Vec<StreamKind> = seen
        .iter()
        .filter_map(|e| match e {
            CoreEvent::StreamStopped {
                kind,
                reason: StopReason::SessionClosed,
            } => Some(*kind),
            _ => None,
        })
        .collect();
    assert_eq!(stopped, vec![StreamKind::HeartRate, StreamKind::Ecg]);
    // Both stop notifications precede Disconnected (it terminated the drain).
    assert!(matches!(seen.last(), Some(CoreEvent::Disconnected { .. })));
    assert!(!h.streams.is_live(StreamKind::HeartRate));
    assert!(!h.streams.is_live(StreamKind::Ecg));
}

#[tokio::test]
async fn test_link_loss_cascades_like_disconnect() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::HeartRate, None).await.unwrap();
    assert!(matches!(h.next_event().await, CoreEvent::StreamStarted { .. }));

    h.transport.lose_link("ABC123");
    assert!(matches!(
        h.next_event().await,
        CoreEvent::StreamStopped {
            kind: StreamKind::HeartRate,
            reason: StopReason::SessionClosed,
        }
    ));
    assert!(matches!(h.next_event().await, CoreEvent::Disconnected { .. }));
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_cancelling_subscription_leaves_session_alone() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    let token = h.streams.start(StreamKind::HeartRate, None).await.unwrap();

    token.cancel();
    token.cancel();
    let streams = &h.streams;
    wait_until(|| !streams.is_live(StreamKind::HeartRate)).await;
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

// ── Scan and auto-connect ────────────────────────────────────────────────────

fn sighting(id: &str, rssi: i16, with_service: bool) -> Discovered {
    Discovered {
        id: id.into(),
        address: "AA:BB:CC:DD:EE:FF".into(),
        rssi,
        name: Some(format!("Strap {id}")),
        connectable: true,
        services: if with_service {
            vec![HEART_RATE_SERVICE]
        } else {
            vec![]
        },
    }
}

#[tokio::test]
async fn test_scan_reports_sightings_and_restarts_cleanly() {
    let mut h = harness();
    h.session.scan().await.unwrap();
    assert!(h.session.is_scanning());

    h.transport.sight(sighting("ABC123", -50, true)).await;
    assert!(
        matches!(h.next_event().await, CoreEvent::DeviceDiscovered(d) if d.id == "ABC123")
    );

    // A second scan cancels and awaits the first before starting over.
    h.session.scan().await.unwrap();
    assert!(h.session.is_scanning());
    h.transport.sight(sighting("DEF456", -40, true)).await;
    assert!(
        matches!(h.next_event().await, CoreEvent::DeviceDiscovered(d) if d.id == "DEF456")
    );

    h.session.stop_scan().await;
    assert!(!h.session.is_scanning());
    h.assert_no_event_for(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_auto_connect_filters_on_rssi_and_service() {
    let mut h = harness();
    h.session
        .auto_connect(-60, Some(HEART_RATE_SERVICE))
        .await
        .unwrap();
    assert!(h.session.is_auto_connecting());

    // Too weak, then wrong service: both skipped.
    h.transport.sight(sighting("WEAK01", -80, true)).await;
    h.transport.sight(sighting("NOHR01", -40, false)).await;
    // First acceptable match wins.
    h.transport.sight(sighting("ABC123", -50, true)).await;

    let seen = h
        .events_until(|e| matches!(e, CoreEvent::Connected { .. }))
        .await;
    assert!(seen.iter().any(
        |e| matches!(e, CoreEvent::AutoConnectEnded { matched: Some(id), .. } if id == "ABC123")
    ));
    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(h.session.identity().as_deref(), Some("ABC123"));
}

#[tokio::test]
async fn test_auto_connect_rejected_while_connected() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    let err = h
        .session
        .auto_connect(-60, Some(HEART_RATE_SERVICE))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidState { .. }));
}

// ── Teardown ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_flushes_queue_and_closes_sink() {
    let mut h = harness();
    h.connect_ok("ABC123").await;
    h.streams.start(StreamKind::HeartRate, None).await.unwrap();
    h.transport.feed(StreamKind::HeartRate, hr_batch(2, 0));
    let sink = h.sink.clone();
    wait_until(|| sink.writes().len() == 2).await;

    h.session.disconnect().await.unwrap();
    h.streams.shutdown().await;
    assert!(h.sink.is_closed());
    assert_eq!(h.sink.writes().len(), 2);
}
