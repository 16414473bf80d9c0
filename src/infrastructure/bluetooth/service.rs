//! Session Coordinator
//!
//! Owns one [`DeviceSession`] per role and is the only place their state, the
//! sample filter and the last commanded color are touched. Commands from the
//! presentation layer and events from the adapter are both funnelled into
//! [`SessionCoordinator::run`], which handles them one at a time.

use crate::domain::color;
use crate::domain::error::SessionError;
use crate::domain::filter::SampleFilter;
use crate::domain::models::{
    AppEvent, Color, ConnectionStatus, MessageSeverity, Role, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventReceiver, AdapterEventSender, BleAdapter,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::{DeviceSession, SessionOutput, SessionState};
use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Requests accepted by the coordinator loop
#[derive(Debug)]
pub enum Command {
    /// Connect, or disconnect if already connected
    Connect(Role),
    Disconnect(Role),
    SetColor(Color),
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    Shutdown,
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub bracelet: SessionState,
    pub sensor: SessionState,
    pub color: Color,
}

/// Cloneable front end used by the presentation layer
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub fn connect(&self, role: Role) -> Result<()> {
        self.send(Command::Connect(role))
    }

    pub fn disconnect(&self, role: Role) -> Result<()> {
        self.send(Command::Disconnect(role))
    }

    pub fn set_color(&self, color: Color) -> Result<()> {
        self.send(Command::SetColor(color))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        Ok(rx.await?)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Session coordinator has stopped"))
    }
}

pub struct SessionCoordinator<A: BleAdapter> {
    adapter: A,
    bracelet: DeviceSession,
    sensor: DeviceSession,
    filter: SampleFilter,
    last_color: Color,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    adapter_events: AdapterEventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<A: BleAdapter> SessionCoordinator<A> {
    /// Build the coordinator. `make_adapter` receives the sender the adapter
    /// must report its events on.
    pub fn new<F>(
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        make_adapter: F,
    ) -> Result<(Self, CoordinatorHandle)>
    where
        F: FnOnce(AdapterEventSender) -> A,
    {
        let (adapter_tx, adapter_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        let bracelet = DeviceSession::new(settings.session_profile(Role::Bracelet)?, adapter_tx.clone());
        let sensor = DeviceSession::new(settings.session_profile(Role::Sensor)?, adapter_tx.clone());
        let adapter = make_adapter(adapter_tx);

        let coordinator = Self {
            adapter,
            bracelet,
            sensor,
            filter: SampleFilter::new(),
            last_color: Color::new(0, 0, 0, settings.initial_brightness),
            event_sender,
            adapter_events,
            commands,
        };
        Ok((coordinator, CoordinatorHandle { commands: command_tx }))
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn session(&self, role: Role) -> &DeviceSession {
        match role {
            Role::Bracelet => &self.bracelet,
            Role::Sensor => &self.sensor,
        }
    }

    pub fn last_color(&self) -> Color {
        self.last_color
    }

    pub fn filter(&self) -> &SampleFilter {
        &self.filter
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            bracelet: self.bracelet.state(),
            sensor: self.sensor.state(),
            color: self.last_color,
        }
    }

    /// Process commands and adapter events until shut down or every
    /// handle is dropped.
    pub async fn run(mut self) {
        info!("Session coordinator started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.adapter_events.recv() => self.handle_adapter_event(event),
            }
        }
        info!("Session coordinator stopped");
    }

    /// Wait for the next adapter event and handle it
    pub async fn process_next(&mut self) -> bool {
        match self.adapter_events.recv().await {
            Some(event) => {
                self.handle_adapter_event(event);
                true
            }
            None => false,
        }
    }

    /// Handle every adapter event already queued; returns how many ran
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.adapter_events.try_recv() {
            self.handle_adapter_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(role) => self.connect(role),
            Command::Disconnect(role) => self.disconnect(role),
            Command::SetColor(color) => {
                if let Err(e) = self.set_color(color.red, color.green, color.blue, color.brightness) {
                    self.send_log(&e.to_string(), MessageSeverity::Warning);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    /// Connect `role`; while connecting this is a no-op and once connected
    /// it disconnects instead.
    pub fn connect(&mut self, role: Role) {
        let outputs = match self.session(role).state() {
            SessionState::Ready => {
                let (session, adapter) = self.session_mut(role);
                session.disconnect(adapter)
            }
            state if state.is_pending() => {
                debug!("{} connect ignored while {}", role, state);
                Vec::new()
            }
            _ => {
                let (session, adapter) = self.session_mut(role);
                session.start_connect(adapter)
            }
        };
        self.apply(role, outputs);
    }

    pub fn disconnect(&mut self, role: Role) {
        let (session, adapter) = self.session_mut(role);
        let outputs = session.disconnect(adapter);
        self.apply(role, outputs);
    }

    /// Manual color. Bypasses the sensor pipeline and writes straight to the
    /// bracelet.
    pub fn set_color(&mut self, r: u8, g: u8, b: u8, brightness: u8) -> Result<(), SessionError> {
        if !self.bracelet.is_ready() {
            return Err(SessionError::NotReady {
                role: Role::Bracelet,
            });
        }
        self.last_color = Color::new(r, g, b, brightness);
        debug!("Sending color {}", self.last_color);
        self.write_color(self.last_color);
        Ok(())
    }

    /// Sensor pipeline: filter, map to a hue, keep the commanded brightness
    /// and forward to the bracelet if it is ready.
    pub fn on_sensor_reading(&mut self, raw_value: u8) {
        let raw = raw_value as i32;
        let output = self.filter.ingest(raw);
        let color = color::map(output.filtered, output.range, raw)
            .with_brightness(self.last_color.brightness);

        self.emit(AppEvent::SensorReading {
            raw: raw_value,
            filtered: output.filtered,
            color,
        });

        if !self.bracelet.is_ready() {
            debug!("Bracelet not ready, dropping sensor reading {}", raw_value);
            return;
        }
        self.last_color = color;
        debug!("Sending breathing color {}", color);
        self.write_color(color);
    }

    pub fn handle_adapter_event(&mut self, event: AdapterEvent) {
        let AdapterEvent { role, kind } = event;
        let (session, adapter) = self.session_mut(role);
        let outputs = session.handle(kind, adapter);
        self.apply(role, outputs);
    }

    /// Stop scanning and drop both links
    pub fn shutdown(&mut self) {
        info!("Shutting down bracelet controller sessions");
        for role in Role::ALL {
            self.disconnect(role);
        }
    }

    fn write_color(&self, color: Color) {
        let payload = protocol::encode_color(&color);
        if let Err(e) = self.bracelet.write(&self.adapter, &payload) {
            // Next color supersedes this one.
            warn!("Dropping color {}: {}", color, e);
        }
    }

    fn apply(&mut self, role: Role, outputs: Vec<SessionOutput>) {
        for output in outputs {
            match output {
                SessionOutput::Status(status) => {
                    if status == ConnectionStatus::Connected {
                        self.send_log(&format!("{} connected", role), MessageSeverity::Success);
                    }
                    self.emit(AppEvent::ConnectionStatus { role, status });
                }
                SessionOutput::Found(device) => self.emit(AppEvent::DeviceFound { role, device }),
                SessionOutput::Rssi(rssi) => self.emit(AppEvent::SignalStrength { role, rssi }),
                SessionOutput::Reading(value) => {
                    if role == Role::Sensor {
                        self.on_sensor_reading(value);
                    }
                }
                SessionOutput::Failed(e) => {
                    let severity = match e {
                        SessionError::ScanTimeout | SessionError::UnexpectedDisconnect => {
                            MessageSeverity::Warning
                        }
                        _ => MessageSeverity::Error,
                    };
                    self.send_log(&format!("{}: {}", role, e), severity);
                }
            }
        }
    }

    fn session_mut(&mut self, role: Role) -> (&mut DeviceSession, &A) {
        match role {
            Role::Bracelet => (&mut self.bracelet, &self.adapter),
            Role::Sensor => (&mut self.sensor, &self.adapter),
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::loopback::{LoopbackAdapter, VirtualPeripheral};
    use crate::infrastructure::bluetooth::protocol::{SEND_CHARACTERISTIC, WriteType};
    use std::time::Duration;

    type Coordinator = SessionCoordinator<LoopbackAdapter>;

    fn coordinator() -> (Coordinator, CoordinatorHandle, mpsc::UnboundedReceiver<AppEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (coordinator, handle) =
            SessionCoordinator::new(&Settings::default(), event_tx, LoopbackAdapter::new).unwrap();
        (coordinator, handle, event_rx)
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<AppEvent>, role: Role) -> Vec<ConnectionStatus> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ConnectionStatus { role: r, status } = event {
                if r == role {
                    out.push(status);
                }
            }
        }
        out
    }

    fn connected(role: Role) -> (Coordinator, CoordinatorHandle, mpsc::UnboundedReceiver<AppEvent>) {
        let (mut coordinator, handle, mut rx) = coordinator();
        coordinator
            .adapter()
            .add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        coordinator
            .adapter()
            .add_peripheral(VirtualPeripheral::mantra("AA:BB"));
        coordinator.connect(role);
        coordinator.process_pending();
        assert!(coordinator.session(role).is_ready());
        statuses(&mut rx, role);
        (coordinator, handle, rx)
    }

    #[tokio::test]
    async fn test_connect_reports_connecting_then_connected() {
        let (mut coordinator, _handle, mut rx) = coordinator();
        coordinator
            .adapter()
            .add_peripheral(VirtualPeripheral::bracelet("CC:DD"));

        coordinator.connect(Role::Bracelet);
        coordinator.process_pending();

        assert_eq!(
            statuses(&mut rx, Role::Bracelet),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(coordinator.session(Role::Sensor).state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_toggles() {
        let (mut coordinator, _handle, mut rx) = connected(Role::Bracelet);

        coordinator.connect(Role::Bracelet);
        assert_eq!(coordinator.session(Role::Bracelet).state(), SessionState::Idle);
        assert_eq!(
            statuses(&mut rx, Role::Bracelet),
            vec![ConnectionStatus::Disconnecting, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_connect_while_scanning_is_noop() {
        let (mut coordinator, _handle, mut rx) = coordinator();
        coordinator.connect(Role::Sensor);
        coordinator.connect(Role::Sensor);

        assert_eq!(coordinator.session(Role::Sensor).state(), SessionState::Scanning);
        assert_eq!(coordinator.adapter().scan_requests(Role::Sensor), 1);
        assert_eq!(statuses(&mut rx, Role::Sensor), vec![ConnectionStatus::Connecting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_scan_timeout_emits_disconnected_once() {
        let (mut coordinator, _handle, mut rx) = coordinator();
        coordinator.connect(Role::Sensor);

        tokio::time::timeout(Duration::from_secs(21), coordinator.process_next())
            .await
            .expect("scan should time out within 20s");

        assert_eq!(coordinator.session(Role::Sensor).state(), SessionState::Idle);
        assert_eq!(
            statuses(&mut rx, Role::Sensor),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );

        // No second timer is left behind.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(coordinator.process_pending(), 0);
    }

    #[tokio::test]
    async fn test_set_color_writes_four_bytes_without_response() {
        let (mut coordinator, _handle, _rx) = connected(Role::Bracelet);

        coordinator.set_color(10, 20, 30, 40).unwrap();

        let adapter = coordinator.adapter();
        assert_eq!(adapter.writes(Role::Bracelet), vec![vec![10, 20, 30, 40]]);
        assert_eq!(adapter.write_types(Role::Bracelet), vec![WriteType::WithoutResponse]);
        assert_eq!(coordinator.last_color(), Color::new(10, 20, 30, 40));
    }

    #[tokio::test]
    async fn test_set_color_round_trips_through_loopback() {
        let (mut coordinator, _handle, _rx) = connected(Role::Bracelet);
        coordinator.set_color(1, 2, 3, 4).unwrap();

        let read_back = coordinator
            .session(Role::Bracelet)
            .read(coordinator.adapter())
            .unwrap();
        assert_eq!(read_back, vec![1, 2, 3, 4]);
        assert_eq!(
            coordinator
                .adapter()
                .read_characteristic(Role::Bracelet, SEND_CHARACTERISTIC)
                .unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn test_set_color_requires_ready_bracelet() {
        let (mut coordinator, _handle, _rx) = coordinator();
        assert_eq!(
            coordinator.set_color(1, 2, 3, 4),
            Err(SessionError::NotReady {
                role: Role::Bracelet
            })
        );
        assert_eq!(coordinator.last_color(), Color::new(0, 0, 0, 100));
    }

    #[tokio::test]
    async fn test_last_value_wins_one_write_per_event() {
        let (mut coordinator, _handle, _rx) = connected(Role::Bracelet);
        coordinator.connect(Role::Sensor);
        coordinator.process_pending();
        assert!(coordinator.session(Role::Sensor).is_ready());

        coordinator.set_color(10, 20, 30, 40).unwrap();
        assert!(coordinator.adapter().notify(Role::Sensor, 180));
        coordinator.process_pending();

        let writes = coordinator.adapter().writes(Role::Bracelet);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], vec![10, 20, 30, 40]);
        // Range not yet valid -> hue 0 (red), brightness carried over
        assert_eq!(writes[1], vec![255, 0, 0, 40]);
        assert_eq!(coordinator.last_color(), Color::new(255, 0, 0, 40));
    }

    #[tokio::test]
    async fn test_zero_reading_sends_black_with_brightness() {
        let (mut coordinator, _handle, _rx) = connected(Role::Bracelet);
        coordinator.set_color(9, 9, 9, 55).unwrap();
        coordinator.on_sensor_reading(0);

        let writes = coordinator.adapter().writes(Role::Bracelet);
        assert_eq!(writes.last().unwrap(), &vec![0, 0, 0, 55]);
    }

    #[tokio::test]
    async fn test_readings_dropped_without_bracelet_but_filtered() {
        let (mut coordinator, _handle, mut rx) = connected(Role::Sensor);
        for v in 1..=20u8 {
            assert!(coordinator.adapter().notify(Role::Sensor, v));
        }
        coordinator.process_pending();

        assert!(coordinator.adapter().writes(Role::Bracelet).is_empty());
        assert_eq!(coordinator.filter().sample_count(), 20);
        let readings = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, AppEvent::SensorReading { .. }))
            .count();
        assert_eq!(readings, 20);
    }

    #[tokio::test]
    async fn test_unexpected_drop_is_reported() {
        let (mut coordinator, _handle, mut rx) = connected(Role::Bracelet);
        coordinator.adapter().drop_link(Role::Bracelet);
        coordinator.process_pending();

        assert_eq!(coordinator.session(Role::Bracelet).state(), SessionState::Idle);
        assert_eq!(
            statuses(&mut rx, Role::Bracelet),
            vec![ConnectionStatus::Disconnected]
        );
        // No reconnect attempt by the core
        assert_eq!(coordinator.adapter().scan_requests(Role::Bracelet), 1);
    }

    #[tokio::test]
    async fn test_found_device_and_signal_strength_are_reported() {
        let (mut coordinator, _handle, mut rx) = coordinator();
        coordinator
            .adapter()
            .add_peripheral(VirtualPeripheral::mantra("AA:BB"));
        coordinator.connect(Role::Sensor);
        coordinator.process_pending();
        assert!(coordinator.session(Role::Sensor).is_ready());

        coordinator.adapter().report_rssi(Role::Sensor, -42);
        coordinator.process_pending();

        let mut found = Vec::new();
        let mut rssi = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                AppEvent::DeviceFound { role, device } => found.push((role, device.address)),
                AppEvent::SignalStrength { role, rssi: value } => rssi.push((role, value)),
                _ => {}
            }
        }
        assert_eq!(found, vec![(Role::Sensor, "AA:BB".to_string())]);
        // Advertised strength first, then the link's own report
        assert_eq!(rssi, vec![(Role::Sensor, -60), (Role::Sensor, -42)]);
    }

    #[tokio::test]
    async fn test_run_loop_processes_handle_commands() {
        let (coordinator, handle, mut rx) = coordinator();
        coordinator
            .adapter()
            .add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        let adapter = coordinator.adapter().clone();
        let task = tokio::spawn(coordinator.run());

        handle.connect(Role::Bracelet).unwrap();
        loop {
            match rx.recv().await.unwrap() {
                AppEvent::ConnectionStatus {
                    status: ConnectionStatus::Connected,
                    ..
                } => break,
                _ => continue,
            }
        }

        handle.set_color(Color::new(5, 6, 7, 8)).unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.bracelet, SessionState::Ready);
        assert_eq!(snapshot.color, Color::new(5, 6, 7, 8));
        assert_eq!(adapter.writes(Role::Bracelet), vec![vec![5, 6, 7, 8]]);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(!adapter.is_linked(Role::Bracelet));
        assert!(handle.connect(Role::Sensor).is_err());
    }
}
