//! Sensor stream multiplexer.
//!
//! Manages at most one live subscription per [`StreamKind`], gated by the
//! session's `Connected` state. Each subscription runs a forward task that
//! decodes transport batches into per-sample [`Measurement`]s and hands the
//! persisted ones to the sink worker through a bounded queue, so a slow or
//! failing sink never blocks sample delivery or cancellation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::session::Shared;
use crate::sink::TelemetrySink;
use crate::transport::{Transport, TransportError};
use crate::types::{
    ConnectionState, CoreEvent, Measurement, SampleBatch, StopReason, StreamConfig, StreamKind,
};

/// Measurements buffered between the forward tasks and the sink worker.
/// When the queue is full the incoming measurement is dropped and counted
/// rather than blocking the stream callback.
const SINK_QUEUE_CAPACITY: usize = 1024;
/// Log one warning per this many dropped measurements.
const DROP_WARN_EVERY: u64 = 256;

/// A live per-kind subscription, owned by the shared table so the session's
/// disconnect cascade can reach it.
pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) cancel: CancelToken,
    /// Set right after the forward task is spawned. `None` only for the
    /// instant between table insertion and spawn.
    pub(crate) task: Option<JoinHandle<()>>,
}

/// Per-kind start/stop of sensor streams, bound to one session.
///
/// Created via [`crate::session::SessionManager::stream_multiplexer`]. Public
/// operations are driven from the same control task as the session's.
pub struct StreamMultiplexer<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    queue: Option<mpsc::Sender<Measurement>>,
    worker: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl<T: Transport> StreamMultiplexer<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        shared: Arc<Shared>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_CAPACITY);
        let worker = tokio::spawn(sink_worker(rx, sink));
        Self {
            transport,
            shared,
            queue: Some(tx),
            worker: Some(worker),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `kind` currently has a live subscription.
    pub fn is_live(&self, kind: StreamKind) -> bool {
        self.shared
            .subs
            .lock()
            .unwrap()
            .get(&kind)
            .map_or(false, |sub| {
                sub.task.as_ref().map_or(true, |task| !task.is_finished())
            })
    }

    /// Measurements dropped because the sink queue was full.
    pub fn dropped_measurements(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start streaming `kind`. Fails with `NotConnected` unless the session
    /// is `Connected`, and rejects a kind that is already live — the command
    /// surface maps "start while live" to a stop, the multiplexer never
    /// toggles. `None` config selects the kind's default.
    pub async fn start(
        &mut self,
        kind: StreamKind,
        config: Option<StreamConfig>,
    ) -> Result<CancelToken, CoreError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }
        if self.is_live(kind) {
            let op = match kind {
                StreamKind::HeartRate => "start HR (already live)",
                StreamKind::Ecg => "start ECG (already live)",
                StreamKind::Accelerometer => "start ACC (already live)",
            };
            return Err(CoreError::InvalidState {
                op,
                state: ConnectionState::Connected,
            });
        }

        let id = self.shared.current_identity().ok_or(CoreError::NotConnected)?;
        let link = self.shared.link_token().ok_or(CoreError::NotConnected)?;
        let config = config.or_else(|| kind.default_config());

        let stream = self.transport.start_stream(&id, kind, config).await?;
        if link.is_cancelled() {
            // The session went away while the transport was setting up.
            return Err(CoreError::NotConnected);
        }

        let sub_id = self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let cancel = link.child();
        {
            let mut subs = self.shared.subs.lock().unwrap();
            subs.insert(
                kind,
                Subscription {
                    id: sub_id,
                    cancel: cancel.clone(),
                    task: None,
                },
            );
            self.shared.emit(CoreEvent::StreamStarted { kind });
        }
        info!("{kind} stream started on {id}");

        let task = tokio::spawn(forward(
            kind,
            sub_id,
            stream,
            cancel.clone(),
            self.queue.clone(),
            Arc::clone(&self.dropped),
            Arc::clone(&self.shared),
        ));
        {
            let mut subs = self.shared.subs.lock().unwrap();
            if let Some(sub) = subs.get_mut(&kind) {
                if sub.id == sub_id {
                    sub.task = Some(task);
                }
            }
            // Otherwise a cascade already took the entry; the task exits on
            // its cancelled token.
        }

        Ok(cancel)
    }

    /// Stop streaming `kind`. Idempotent: stopping a kind that is not live
    /// is a no-op and emits nothing.
    pub async fn stop(&mut self, kind: StreamKind) -> Result<(), CoreError> {
        let taken = self.shared.subs.lock().unwrap().remove(&kind);
        let Some(sub) = taken else {
            return Ok(());
        };
        sub.cancel.cancel();
        if let Some(task) = sub.task {
            task.await.ok();
        }
        info!("{kind} stream stopped");
        self.shared.emit(CoreEvent::StreamStopped {
            kind,
            reason: StopReason::Requested,
        });
        Ok(())
    }

    /// Drain and close: stops any still-live subscriptions, drops the queue,
    /// then waits for the worker to flush the remaining measurements and
    /// close the sink.
    pub async fn shutdown(&mut self) {
        shutdown_streams(&self.shared, StopReason::Requested).await;
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            worker.await.ok();
        }
    }
}

/// Stop every live subscription, emitting `StreamStopped` with the given
/// reason for each, and wait for the forward tasks to finish. The session
/// calls this (with `SessionClosed`) before it makes a `Disconnected`
/// transition observable.
pub(crate) async fn shutdown_streams(shared: &Arc<Shared>, reason: StopReason) {
    for kind in StreamKind::ALL {
        let taken = shared.subs.lock().unwrap().remove(&kind);
        let Some(sub) = taken else {
            continue;
        };
        sub.cancel.cancel();
        if let Some(task) = sub.task {
            task.await.ok();
        }
        info!("{kind} stream stopped ({reason})");
        shared.emit(CoreEvent::StreamStopped {
            kind,
            reason: reason.clone(),
        });
    }
}

/// The per-subscription forward loop: decode each batch and enqueue its
/// persisted measurements, until cancellation or stream termination.
async fn forward(
    kind: StreamKind,
    sub_id: u64,
    mut stream: BoxStream<'static, Result<SampleBatch, TransportError>>,
    cancel: CancelToken,
    queue: Option<mpsc::Sender<Measurement>>,
    dropped: Arc<AtomicU64>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            // Whoever cancelled owns the table entry and the stop event.
            _ = cancel.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(batch)) => forward_batch(kind, &batch, queue.as_ref(), &dropped),
                Some(Err(e)) => {
                    warn!("{kind} stream failed: {e}");
                    finish(&shared, kind, sub_id, StopReason::StreamError(e.to_string()));
                    return;
                }
                None => {
                    finish(&shared, kind, sub_id, StopReason::StreamEnded);
                    return;
                }
            },
        }
    }
}

/// Natural termination: remove our own table entry and report the reason —
/// unless a stop/cascade already took ownership, in which case it reports.
fn finish(shared: &Arc<Shared>, kind: StreamKind, sub_id: u64, reason: StopReason) {
    let mut subs = shared.subs.lock().unwrap();
    let mine = subs.get(&kind).map_or(false, |sub| sub.id == sub_id);
    if !mine {
        return;
    }
    subs.remove(&kind);
    shared.emit(CoreEvent::StreamStopped { kind, reason });
}

fn forward_batch(
    kind: StreamKind,
    batch: &SampleBatch,
    queue: Option<&mpsc::Sender<Measurement>>,
    dropped: &AtomicU64,
) {
    match batch {
        SampleBatch::Hr(samples) => {
            for s in samples {
                debug!(
                    "HR  bpm: {} rrs: {:?} rrAvailable: {} contactStatus: {}",
                    s.bpm, s.rrs_ms, s.rr_available, s.contact_detected
                );
            }
        }
        SampleBatch::Acc(samples) => {
            for s in samples {
                debug!(
                    "ACC x: {} y: {} z: {} timestamp: {}",
                    s.x, s.y, s.z, s.timestamp_ns
                );
            }
        }
        SampleBatch::Ecg(_) => {}
    }

    if !kind.persisted() {
        return;
    }
    let Some(queue) = queue else {
        return;
    };
    for m in decode_batch(batch) {
        match queue.try_send(m) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(m)) => {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % DROP_WARN_EVERY == 1 {
                    warn!(
                        "sink queue full, dropped {} {}={} ({total} dropped so far)",
                        m.measurement, m.field, m.value
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Fan a batch out into per-sample measurements, in batch-then-sample order.
///
/// | Kind | Measurements per sample |
/// |---|---|
/// | HeartRate | one `hr bpm`, plus one `rrs ms` per interval when available |
/// | Ecg | one `ecg voltage` |
/// | Accelerometer | `acc x`, `acc y`, `acc z` (observation only) |
pub fn decode_batch(batch: &SampleBatch) -> Vec<Measurement> {
    let mut out = Vec::with_capacity(batch.len());
    match batch {
        SampleBatch::Hr(samples) => {
            for s in samples {
                out.push(Measurement {
                    measurement: "hr",
                    field: "bpm",
                    value: s.bpm as f64,
                });
                if s.rr_available {
                    for &rr in &s.rrs_ms {
                        out.push(Measurement {
                            measurement: "rrs",
                            field: "ms",
                            value: rr as f64,
                        });
                    }
                }
            }
        }
        SampleBatch::Ecg(samples) => {
            for s in samples {
                out.push(Measurement {
                    measurement: "ecg",
                    field: "voltage",
                    value: s.voltage_uv as f64,
                });
            }
        }
        SampleBatch::Acc(samples) => {
            for s in samples {
                for (field, value) in [("x", s.x), ("y", s.y), ("z", s.z)] {
                    out.push(Measurement {
                        measurement: "acc",
                        field,
                        value: value as f64,
                    });
                }
            }
        }
    }
    out
}

/// Drains the bounded queue into the sink. Write failures are logged and
/// isolated to the failing measurement; when the queue closes, the remaining
/// measurements are flushed and the sink closed.
async fn sink_worker(mut rx: mpsc::Receiver<Measurement>, sink: Arc<dyn TelemetrySink>) {
    while let Some(m) = rx.recv().await {
        if let Err(e) = sink.write_data(m.measurement, m.field, m.value).await {
            warn!("sink write {} {}={} failed: {e}", m.measurement, m.field, m.value);
        }
    }
    sink.close().await;
    debug!("sink worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccSample, EcgSample, HrSample};

    fn hr_sample(bpm: u16, rrs: Vec<u16>) -> HrSample {
        HrSample {
            bpm,
            contact_detected: true,
            contact_supported: true,
            rr_available: !rrs.is_empty(),
            rrs_ms: rrs,
        }
    }

    #[test]
    fn test_hr_batch_decodes_bpm_then_intervals() {
        let batch = SampleBatch::Hr(vec![
            hr_sample(62, vec![950, 980]),
            hr_sample(63, vec![940, 960]),
        ]);
        let out = decode_batch(&batch);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0].measurement, "hr");
        assert_eq!(out[0].value, 62.0);
        assert_eq!(out[1].measurement, "rrs");
        assert_eq!(out[1].value, 950.0);
        assert_eq!(out[2].value, 980.0);
        assert_eq!(out[3].measurement, "hr");
        assert_eq!(out[3].value, 63.0);
    }

    #[test]
    fn test_hr_without_rr_yields_bpm_only() {
        let batch = SampleBatch::Hr(vec![hr_sample(70, vec![])]);
        let out = decode_batch(&batch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].measurement, "hr");
    }

    #[test]
    fn test_ecg_batch_one_voltage_per_sample() {
        let batch = SampleBatch::Ecg((0..5).map(|i| EcgSample { voltage_uv: i * 10 }).collect());
        let out = decode_batch(&batch);
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|m| m.measurement == "ecg" && m.field == "voltage"));
        assert_eq!(out[4].value, 40.0);
    }

    #[test]
    fn test_acc_batch_three_axes_per_sample() {
        let batch = SampleBatch::Acc(vec![AccSample {
            x: 1,
            y: 2,
            z: 3,
            timestamp_ns: 0,
        }]);
        let out = decode_batch(&batch);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].field, "x");
        assert_eq!(out[2].field, "z");
        assert!(!StreamKind::Accelerometer.persisted());
    }
}
