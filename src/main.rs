use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};

use straplink::prelude::*;
use straplink::transport::gatt::HEART_RATE_SERVICE;

/// RSSI floor for auto-connect, matching a strap worn in the same room.
const AUTO_CONNECT_RSSI: i16 = -60;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=straplink=debug for per-sample output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let simulate = std::env::args().any(|arg| arg == "--simulate");
    let device_id = std::env::var("STRAP_DEVICE_ID")
        .unwrap_or_else(|_| if simulate { "SIM00001" } else { "C621D624" }.to_string());

    // ── Telemetry sink ────────────────────────────────────────────────────────
    let sink: Arc<dyn TelemetrySink> = match InfluxConfig::from_env() {
        Some(config) => {
            let sink = InfluxSink::new(config);
            match sink.health().await {
                Ok(status) => info!("influx health: {status}"),
                Err(e) => warn!("influx health probe failed: {e} (writes may be dropped)"),
            }
            Arc::new(sink)
        }
        None => {
            info!("INFLUX_URL not set, measurements are logged instead of persisted");
            Arc::new(LogSink)
        }
    };

    if simulate {
        info!("using the simulated strap (--simulate)");
        let transport = Arc::new(SimTransport::new(SimConfig::default()));
        run(transport, sink, device_id).await
    } else {
        let transport = Arc::new(BleTransport::new().await?);
        run(transport, sink, device_id).await
    }
}

async fn run<T: Transport>(
    transport: Arc<T>,
    sink: Arc<dyn TelemetrySink>,
    device_id: String,
) -> Result<()> {
    let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let mut session = SessionManager::new(transport, events_tx);
    let mut streams = session.stream_multiplexer(sink);

    info!("Commands (type + Enter):");
    info!("  c  – connect / disconnect {device_id}");
    info!("  a  – start / stop auto-connect");
    info!("  s  – start / stop device scan");
    info!("  h  – start / stop heart-rate stream");
    info!("  e  – start / stop ECG stream");
    info!("  g  – start / stop accelerometer stream");
    info!("  i  – show toggle states");
    info!("  q  – quit\n");

    // Read stdin on a dedicated OS thread to avoid holding a non-Send
    // StdinLock across await points, then relay lines to the control loop.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Control loop ──────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                match line.as_str() {
                    "q" => break,
                    "c" => {
                        if session.state() == ConnectionState::Disconnected {
                            let target = session.identity().unwrap_or_else(|| device_id.clone());
                            if let Err(e) = session.connect(&target).await {
                                error!("connect: {e}");
                            }
                        } else if let Err(e) = session.disconnect().await {
                            error!("disconnect: {e}");
                        }
                    }
                    "a" => {
                        if session.is_auto_connecting() {
                            session.cancel_auto_connect().await;
                            info!("auto-connect cancelled");
                        } else if let Err(e) =
                            session.auto_connect(AUTO_CONNECT_RSSI, Some(HEART_RATE_SERVICE)).await
                        {
                            error!("auto-connect: {e}");
                        }
                    }
                    "s" => {
                        if session.is_scanning() {
                            session.stop_scan().await;
                            info!("scan stopped");
                        } else if let Err(e) = session.scan().await {
                            error!("scan: {e}");
                        }
                    }
                    "h" => toggle_stream(&mut streams, StreamKind::HeartRate).await,
                    "e" => toggle_stream(&mut streams, StreamKind::Ecg).await,
                    "g" => toggle_stream(&mut streams, StreamKind::Accelerometer).await,
                    "i" => print_status(&session, &streams, &device_id),
                    other => warn!("unknown command '{other}' (try i)"),
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    if session.state() != ConnectionState::Disconnected {
        session.disconnect().await.ok();
    }
    session.stop_scan().await;
    session.cancel_auto_connect().await;
    streams.shutdown().await;
    info!("bye");
    Ok(())
}

async fn toggle_stream<T: Transport>(streams: &mut StreamMultiplexer<T>, kind: StreamKind) {
    if streams.is_live(kind) {
        if let Err(e) = streams.stop(kind).await {
            error!("stop {kind}: {e}");
        }
    } else if let Err(e) = streams.start(kind, None).await {
        error!("start {kind}: {e}");
    }
}

/// One line per toggle, the way the demo app labels its buttons.
fn print_status<T: Transport>(
    session: &SessionManager<T>,
    streams: &StreamMultiplexer<T>,
    device_id: &str,
) {
    let id = session.identity().unwrap_or_else(|| device_id.to_string());
    let connect = match session.state() {
        ConnectionState::Disconnected => format!("Connect {id}"),
        ConnectionState::Connecting => format!("Connecting {id}…"),
        ConnectionState::Connected => format!("Disconnect {id}"),
    };
    println!("[c] {connect}");
    println!(
        "[a] {}",
        if session.is_auto_connecting() { "Stop auto-connect" } else { "Auto-connect" }
    );
    println!(
        "[s] {}",
        if session.is_scanning() { "Stop scanning" } else { "Scan devices" }
    );
    for (key, kind) in [
        ("h", StreamKind::HeartRate),
        ("e", StreamKind::Ecg),
        ("g", StreamKind::Accelerometer),
    ] {
        let verb = if streams.is_live(kind) { "Stop" } else { "Start" };
        println!("[{key}] {verb} {kind} stream");
    }
    let dropped = streams.dropped_measurements();
    if dropped > 0 {
        println!("    ({dropped} measurements dropped by the sink queue)");
    }
}

fn print_event(event: &CoreEvent) {
    match event {
        CoreEvent::PowerStateChanged(on) => info!("BLE power: {on}"),
        CoreEvent::Connecting { id } => info!("CONNECTING: {id}"),
        CoreEvent::Connected { id } => info!("CONNECTED: {id}"),
        CoreEvent::Disconnected { id } => info!("DISCONNECTED: {id}"),
        CoreEvent::ConnectFailed { id, reason } => error!("connect to {id} failed: {reason}"),
        CoreEvent::AutoConnectEnded { matched, error } => match (matched, error) {
            (Some(id), _) => info!("auto-connect search complete: {id}"),
            (None, Some(e)) => error!("auto-connect failed: {e}"),
            (None, None) => info!("auto-connect search complete, no match"),
        },
        CoreEvent::DeviceDiscovered(d) => info!(
            "device found id: {} address: {} rssi: {} name: {} connectable: {}",
            d.id,
            d.address,
            d.rssi,
            d.name.as_deref().unwrap_or("?"),
            d.connectable
        ),
        CoreEvent::ScanEnded { error } => match error {
            Some(e) => error!("device scan failed: {e}"),
            None => info!("device scan complete"),
        },
        CoreEvent::StreamStarted { kind } => info!("{kind} stream started"),
        CoreEvent::StreamStopped { kind, reason } => info!("{kind} stream stopped: {reason}"),
        CoreEvent::FeatureReady { id, feature } => info!("feature ready on {id}: {feature}"),
        CoreEvent::DeviceInfo { id, key, value } => info!("DIS {id} {key}: {value}"),
        CoreEvent::BatteryLevel { id, percent } => info!("BATTERY LEVEL {id}: {percent}"),
    }
}
