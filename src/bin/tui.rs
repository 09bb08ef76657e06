//! Terminal dashboard for a BLE chest strap.
//!
//! Usage:
//!   cargo run --bin tui               # real BLE adapter
//!   cargo run --bin tui -- --simulate # built-in simulated strap, no hardware
//!
//! Keys
//! ----
//!   c        connect / disconnect
//!   a        start / stop auto-connect
//!   s        start / stop device scan
//!   h        start / stop heart-rate stream
//!   e        start / stop ECG stream
//!   g        start / stop accelerometer stream
//!   q / Esc  quit

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};
use tokio::sync::mpsc;

use straplink::prelude::*;
use straplink::sink::SinkError;
use straplink::transport::gatt::HEART_RATE_SERVICE;

const LOG_LINES: usize = 200;
const AUTO_CONNECT_RSSI: i16 = -60;

/// Sink tee: remembers the latest value per measurement for the dashboard
/// and forwards every write to the real sink.
struct TeeSink {
    latest: Mutex<HashMap<String, f64>>,
    inner: Arc<dyn TelemetrySink>,
}

impl TeeSink {
    fn new(inner: Arc<dyn TelemetrySink>) -> Self {
        Self {
            latest: Mutex::new(HashMap::new()),
            inner,
        }
    }

    fn latest(&self, measurement: &str) -> Option<f64> {
        self.latest.lock().unwrap().get(measurement).copied()
    }
}

#[async_trait]
impl TelemetrySink for TeeSink {
    async fn write_data(
        &self,
        measurement: &str,
        field: &str,
        value: f64,
    ) -> Result<(), SinkError> {
        self.latest
            .lock()
            .unwrap()
            .insert(measurement.to_string(), value);
        self.inner.write_data(measurement, field, value).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct App {
    device_id: String,
    battery: Option<u8>,
    device_info: Vec<(String, String)>,
    discovered: VecDeque<Discovered>,
    log: VecDeque<String>,
}

impl App {
    fn new(device_id: String) -> Self {
        Self {
            device_id,
            battery: None,
            device_info: Vec::new(),
            discovered: VecDeque::new(),
            log: VecDeque::new(),
        }
    }

    fn push_log(&mut self, line: String) {
        if self.log.len() == LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }

    fn apply(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::BatteryLevel { percent, .. } => self.battery = Some(*percent),
            CoreEvent::DeviceInfo { key, value, .. } => {
                self.device_info.push((key.clone(), value.clone()));
            }
            CoreEvent::DeviceDiscovered(d) => {
                self.discovered.retain(|known| known.id != d.id);
                self.discovered.push_front(d.clone());
                self.discovered.truncate(8);
            }
            CoreEvent::Disconnected { .. } => {
                self.battery = None;
                self.device_info.clear();
            }
            _ => {}
        }
        self.push_log(format!("{event:?}"));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let simulate = std::env::args().any(|arg| arg == "--simulate");
    let device_id = std::env::var("STRAP_DEVICE_ID")
        .unwrap_or_else(|_| if simulate { "SIM00001" } else { "C621D624" }.to_string());

    let inner: Arc<dyn TelemetrySink> = match InfluxConfig::from_env() {
        Some(config) => Arc::new(InfluxSink::new(config)),
        None => Arc::new(LogSink),
    };
    let tee = Arc::new(TeeSink::new(inner));

    if simulate {
        let transport = Arc::new(SimTransport::new(SimConfig::default()));
        run(transport, tee, device_id).await
    } else {
        let transport = Arc::new(BleTransport::new().await?);
        run(transport, tee, device_id).await
    }
}

async fn run<T: Transport>(transport: Arc<T>, tee: Arc<TeeSink>, device_id: String) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut session = SessionManager::new(transport, events_tx);
    let mut streams = session.stream_multiplexer(tee.clone());

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    // Keyboard on a dedicated thread: crossterm's poll/read are blocking.
    let (key_tx, mut key_rx) = mpsc::unbounded_channel::<KeyCode>();
    std::thread::spawn(move || loop {
        if event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(Event::Key(key)) = event::read() {
                // Windows delivers release events too; only react to presses.
                if key.kind == event::KeyEventKind::Press && key_tx.send(key.code).is_err() {
                    return;
                }
            }
        }
    });

    let mut app = App::new(device_id);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            event = events.recv() => {
                if let Some(event) = event {
                    app.apply(&event);
                }
            }
            key = key_rx.recv() => {
                let Some(key) = key else { break Ok(()) };
                match key {
                    KeyCode::Char('q') | KeyCode::Esc => break Ok(()),
                    KeyCode::Char('c') => {
                        if session.state() == ConnectionState::Disconnected {
                            let target = session
                                .identity()
                                .unwrap_or_else(|| app.device_id.clone());
                            if let Err(e) = session.connect(&target).await {
                                app.push_log(format!("connect: {e}"));
                            }
                        } else if let Err(e) = session.disconnect().await {
                            app.push_log(format!("disconnect: {e}"));
                        }
                    }
                    KeyCode::Char('a') => {
                        if session.is_auto_connecting() {
                            session.cancel_auto_connect().await;
                        } else if let Err(e) = session
                            .auto_connect(AUTO_CONNECT_RSSI, Some(HEART_RATE_SERVICE))
                            .await
                        {
                            app.push_log(format!("auto-connect: {e}"));
                        }
                    }
                    KeyCode::Char('s') => {
                        if session.is_scanning() {
                            session.stop_scan().await;
                        } else if let Err(e) = session.scan().await {
                            app.push_log(format!("scan: {e}"));
                        }
                    }
                    KeyCode::Char('h') => toggle(&mut streams, StreamKind::HeartRate, &mut app).await,
                    KeyCode::Char('e') => toggle(&mut streams, StreamKind::Ecg, &mut app).await,
                    KeyCode::Char('g') => {
                        toggle(&mut streams, StreamKind::Accelerometer, &mut app).await
                    }
                    _ => {}
                }
            }
        }
        if let Err(e) = terminal.draw(|f| draw(f, &app, &session, &streams, &tee)) {
            break Err(e.into());
        }
    };

    // ── Teardown ──────────────────────────────────────────────────────────────
    if session.state() != ConnectionState::Disconnected {
        session.disconnect().await.ok();
    }
    session.stop_scan().await;
    session.cancel_auto_connect().await;
    streams.shutdown().await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

async fn toggle<T: Transport>(streams: &mut StreamMultiplexer<T>, kind: StreamKind, app: &mut App) {
    let result = if streams.is_live(kind) {
        streams.stop(kind).await
    } else {
        streams.start(kind, None).await.map(|_| ())
    };
    if let Err(e) = result {
        app.push_log(format!("{kind}: {e}"));
    }
}

fn draw<T: Transport>(
    f: &mut Frame,
    app: &App,
    session: &SessionManager<T>,
    streams: &StreamMultiplexer<T>,
    tee: &TeeSink,
) {
    let rows = Layout::vertical([
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Min(4),
    ])
    .split(f.size());
    let top = Layout::horizontal([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[0]);

    // ── Toggles ───────────────────────────────────────────────────────────────
    let id = session.identity().unwrap_or_else(|| app.device_id.clone());
    let connect_label = match session.state() {
        ConnectionState::Disconnected => format!("Connect {id}"),
        ConnectionState::Connecting => format!("Connecting {id}…"),
        ConnectionState::Connected => format!("Disconnect {id}"),
    };
    let toggles = [
        ('c', session.state() != ConnectionState::Disconnected, connect_label),
        ('a', session.is_auto_connecting(), "Auto-connect".into()),
        ('s', session.is_scanning(), "Scan devices".into()),
        ('h', streams.is_live(StreamKind::HeartRate), "Heart-rate stream".into()),
        ('e', streams.is_live(StreamKind::Ecg), "ECG stream".into()),
        ('g', streams.is_live(StreamKind::Accelerometer), "Accelerometer stream".into()),
    ];
    let items: Vec<ListItem> = toggles
        .iter()
        .map(|(key, active, label)| {
            let marker = if *active {
                Span::styled(" ON  ", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
            } else {
                Span::styled(" off ", Style::default().fg(Color::DarkGray))
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!(" {key} "), Style::default().fg(Color::Yellow)),
                marker,
                Span::raw(label.clone()),
            ]))
        })
        .collect();
    f.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(" straplink ")),
        top[0],
    );

    // ── Vitals ────────────────────────────────────────────────────────────────
    let fmt = |m: &str, unit: &str| {
        tee.latest(m)
            .map(|v| format!("{v:.0} {unit}"))
            .unwrap_or_else(|| "—".into())
    };
    let mut vitals = vec![
        Line::from(format!("heart rate : {}", fmt("hr", "bpm"))),
        Line::from(format!("rr interval: {}", fmt("rrs", "ms"))),
        Line::from(format!("ecg voltage: {}", fmt("ecg", "µV"))),
        Line::from(format!(
            "battery    : {}",
            app.battery.map(|p| format!("{p}%")).unwrap_or_else(|| "—".into())
        )),
    ];
    if !app.device_info.is_empty() {
        let info: Vec<String> = app
            .device_info
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        vitals.push(Line::from(info.join("  ")));
    }
    let dropped = streams.dropped_measurements();
    if dropped > 0 {
        vitals.push(Line::styled(
            format!("{dropped} measurements dropped"),
            Style::default().fg(Color::Red),
        ));
    }
    f.render_widget(
        Paragraph::new(vitals).block(Block::default().borders(Borders::ALL).title(" vitals ")),
        top[1],
    );

    // ── Nearby devices ────────────────────────────────────────────────────────
    let nearby: Vec<ListItem> = app
        .discovered
        .iter()
        .map(|d| {
            ListItem::new(format!(
                "{}  rssi {}  {}",
                d.id,
                d.rssi,
                d.name.as_deref().unwrap_or("?")
            ))
        })
        .collect();
    f.render_widget(
        List::new(nearby).block(Block::default().borders(Borders::ALL).title(" nearby ")),
        rows[1],
    );

    // ── Event log ─────────────────────────────────────────────────────────────
    let visible = rows[2].height.saturating_sub(2) as usize;
    let log: Vec<ListItem> = app
        .log
        .iter()
        .rev()
        .take(visible)
        .rev()
        .map(|line| ListItem::new(line.clone()))
        .collect();
    f.render_widget(
        List::new(log).block(Block::default().borders(Borders::ALL).title(" events ")),
        rows[2],
    );
}
