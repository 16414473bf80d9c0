//! Device Session
//!
//! Per-peripheral connection state machine. A session is driven by two kinds
//! of input: requests from the coordinator (`start_connect`, `disconnect`,
//! `write`) and [`SessionEvent`]s reported by the adapter. Each returns the
//! [`SessionOutput`]s the coordinator has to act on.

use crate::domain::error::SessionError;
use crate::domain::models::{ConnectionStatus, Role, ScannedDevice};
use crate::domain::settings::SessionProfile;
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventSender, BleAdapter, GattService, SessionEvent,
};
use crate::infrastructure::bluetooth::protocol::{WriteType, ENABLE_NOTIFICATION_VALUE};
use std::fmt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnected,
}

impl SessionState {
    /// Resting states from which a new connection may be started
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Disconnected)
    }

    /// A connection attempt is underway
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SessionState::Scanning | SessionState::Connecting | SessionState::DiscoveringServices
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::DiscoveringServices => "discovering services",
            SessionState::Ready => "ready",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// What the coordinator must do after a session step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Status(ConnectionStatus),
    Found(ScannedDevice),
    Reading(u8),
    Rssi(i16),
    Failed(SessionError),
}

/// Characteristics confirmed present during service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedHandles {
    pub service: Uuid,
    pub write_char: Option<Uuid>,
    pub read_char: Option<Uuid>,
    pub notify_config: Option<Uuid>,
}

pub struct DeviceSession {
    profile: SessionProfile,
    state: SessionState,
    peripheral: Option<ScannedDevice>,
    handles: Option<ResolvedHandles>,
    attempt: u64,
    scan_timer: Option<JoinHandle<()>>,
    timer_sender: AdapterEventSender,
}

impl DeviceSession {
    /// `timer_sender` is the channel scan timeouts are posted to; it must
    /// feed the same loop that delivers adapter events to [`Self::handle`].
    pub fn new(profile: SessionProfile, timer_sender: AdapterEventSender) -> Self {
        Self {
            profile,
            state: SessionState::Idle,
            peripheral: None,
            handles: None,
            attempt: 0,
            scan_timer: None,
            timer_sender,
        }
    }

    pub fn role(&self) -> Role {
        self.profile.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    pub fn peripheral(&self) -> Option<&ScannedDevice> {
        self.peripheral.as_ref()
    }

    pub fn handles(&self) -> Option<&ResolvedHandles> {
        self.handles.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Begin scanning for this role's peripheral. A no-op unless the
    /// session is idle (or resting after a failure).
    pub fn start_connect(&mut self, adapter: &dyn BleAdapter) -> Vec<SessionOutput> {
        if !self.state.is_terminal() {
            debug!(
                "{} session already {}, ignoring connect request",
                self.role(),
                self.state
            );
            return Vec::new();
        }

        info!(
            "Scanning for {} device named '{}'",
            self.role(),
            self.profile.device_name
        );
        if let Err(e) = adapter.start_scan(self.role(), &self.profile.device_name) {
            error!("Failed to start {} scan: {}", self.role(), e);
            self.set_state(SessionState::Idle);
            return vec![
                SessionOutput::Failed(e.into()),
                SessionOutput::Status(ConnectionStatus::Disconnected),
            ];
        }

        self.set_state(SessionState::Scanning);
        self.arm_scan_timer();
        vec![SessionOutput::Status(ConnectionStatus::Connecting)]
    }

    /// Tear down whatever stage the session is in and return to idle.
    pub fn disconnect(&mut self, adapter: &dyn BleAdapter) -> Vec<SessionOutput> {
        match self.state {
            SessionState::Idle => Vec::new(),
            SessionState::Disconnected => {
                // Disconnected was already reported when we got here.
                self.set_state(SessionState::Idle);
                Vec::new()
            }
            SessionState::Scanning => {
                info!("Cancelling {} scan", self.role());
                self.cancel_scan_timer();
                if let Err(e) = adapter.stop_scan(self.role()) {
                    warn!("Failed to stop {} scan: {}", self.role(), e);
                }
                self.finish_disconnect();
                vec![SessionOutput::Status(ConnectionStatus::Disconnected)]
            }
            SessionState::Connecting | SessionState::DiscoveringServices => {
                info!("Aborting {} connection attempt", self.role());
                self.release_link(adapter);
                self.finish_disconnect();
                vec![SessionOutput::Status(ConnectionStatus::Disconnected)]
            }
            SessionState::Ready => {
                info!("Disconnecting from {}", self.role());
                let mut outputs = vec![SessionOutput::Status(ConnectionStatus::Disconnecting)];
                self.release_link(adapter);
                self.finish_disconnect();
                outputs.push(SessionOutput::Status(ConnectionStatus::Disconnected));
                outputs
            }
        }
    }

    /// Fire-and-forget write to the role's write characteristic.
    pub fn write(&self, adapter: &dyn BleAdapter, bytes: &[u8]) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady { role: self.role() });
        }
        let characteristic = self
            .handles
            .and_then(|h| h.write_char)
            .ok_or(SessionError::NoWriteCharacteristic { role: self.role() })?;

        trace!("{} write {:02X?}", self.role(), bytes);
        adapter
            .write_characteristic(self.role(), characteristic, bytes, WriteType::WithoutResponse)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Read back the role's primary characteristic (write for the
    /// bracelet, receive for the sensor).
    pub fn read(&self, adapter: &dyn BleAdapter) -> Result<Vec<u8>, SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady { role: self.role() });
        }
        let characteristic = self
            .handles
            .and_then(|h| h.write_char.or(h.read_char))
            .ok_or(SessionError::NotReady { role: self.role() })?;
        Ok(adapter.read_characteristic(self.role(), characteristic)?)
    }

    /// Single transition function for adapter-reported events
    pub fn handle(&mut self, event: SessionEvent, adapter: &dyn BleAdapter) -> Vec<SessionOutput> {
        if let Some(attempt) = event.attempt() {
            if attempt != self.attempt {
                trace!(
                    "{} ignoring {:?} from attempt {} (current {})",
                    self.role(),
                    event,
                    attempt,
                    self.attempt
                );
                return Vec::new();
            }
        }

        match (self.state, event) {
            (SessionState::Scanning, SessionEvent::Found(device)) => {
                self.on_found(device, adapter)
            }
            (SessionState::Scanning, SessionEvent::TimedOut { .. }) => self.on_scan_timeout(adapter),
            (SessionState::Connecting, SessionEvent::Connected { .. }) => {
                info!("Connected to {}, starting service discovery", self.role());
                self.set_state(SessionState::DiscoveringServices);
                match adapter.discover_services(self.role()) {
                    Ok(()) => Vec::new(),
                    Err(e) => self.fail(e.into(), adapter),
                }
            }
            (SessionState::Connecting, SessionEvent::ConnectFailed { reason, .. }) => {
                error!("Connection to {} failed: {}", self.role(), reason);
                self.fail(
                    SessionError::Adapter(crate::domain::error::AdapterError::Platform(reason)),
                    adapter,
                )
            }
            (SessionState::DiscoveringServices, SessionEvent::ServicesReady { services, .. }) => {
                self.on_services(&services, adapter)
            }
            (SessionState::DiscoveringServices, SessionEvent::ServiceDiscoveryFailed { reason, .. }) => {
                self.fail(
                    SessionError::ProtocolMismatch(format!("service discovery failed: {}", reason)),
                    adapter,
                )
            }
            (SessionState::Ready, SessionEvent::Notified { value, .. }) => {
                if self.role() == Role::Sensor {
                    trace!("Characteristic changed: {}", value);
                    vec![SessionOutput::Reading(value)]
                } else {
                    debug!("Ignoring notification from {}: {}", self.role(), value);
                    Vec::new()
                }
            }
            (state, SessionEvent::Rssi { rssi, .. }) if !state.is_terminal() => {
                debug!("{} reported RSSI: {}", self.role(), rssi);
                vec![SessionOutput::Rssi(rssi)]
            }
            (
                SessionState::Connecting | SessionState::DiscoveringServices | SessionState::Ready,
                SessionEvent::Disconnected { .. },
            ) => {
                warn!("Link to {} dropped while {}", self.role(), self.state);
                self.release_link(adapter);
                self.finish_disconnect();
                vec![
                    SessionOutput::Failed(SessionError::UnexpectedDisconnect),
                    SessionOutput::Status(ConnectionStatus::Disconnected),
                ]
            }
            (state, event) => {
                trace!("{} ignoring {:?} while {}", self.role(), event, state);
                Vec::new()
            }
        }
    }

    fn on_found(&mut self, device: ScannedDevice, adapter: &dyn BleAdapter) -> Vec<SessionOutput> {
        if !self.profile.matches_name(&device.name) {
            trace!("{} ignoring advertisement from '{}'", self.role(), device.name);
            return Vec::new();
        }

        info!(
            "Found {} device '{}' at {}, connecting",
            self.role(),
            device.name,
            device.address
        );
        self.cancel_scan_timer();
        if let Err(e) = adapter.stop_scan(self.role()) {
            warn!("Failed to stop {} scan: {}", self.role(), e);
        }

        self.set_state(SessionState::Connecting);
        self.peripheral = Some(device.clone());

        let mut outputs = vec![SessionOutput::Found(device.clone())];
        if let Some(rssi) = device.signal_strength {
            outputs.push(SessionOutput::Rssi(rssi));
        }
        if let Err(e) =
            adapter.connect(self.role(), &device, self.profile.auto_reconnect, self.attempt)
        {
            outputs.extend(self.fail(e.into(), adapter));
        }
        outputs
    }

    fn on_scan_timeout(&mut self, adapter: &dyn BleAdapter) -> Vec<SessionOutput> {
        info!("{} scanning timed out, stopping the scan", self.role());
        self.scan_timer = None;
        if let Err(e) = adapter.stop_scan(self.role()) {
            warn!("Failed to stop {} scan: {}", self.role(), e);
        }
        self.set_state(SessionState::Idle);
        vec![
            SessionOutput::Failed(SessionError::ScanTimeout),
            SessionOutput::Status(ConnectionStatus::Disconnected),
        ]
    }

    fn on_services(
        &mut self,
        services: &[GattService],
        adapter: &dyn BleAdapter,
    ) -> Vec<SessionOutput> {
        let handles = match self.resolve(services) {
            Ok(handles) => handles,
            Err(e) => return self.fail(e, adapter),
        };

        if let (Some(read_char), Some(config)) = (handles.read_char, handles.notify_config) {
            let enabled = adapter
                .set_notify(self.role(), read_char, true)
                .and_then(|_| {
                    adapter.write_descriptor(
                        self.role(),
                        read_char,
                        config,
                        &ENABLE_NOTIFICATION_VALUE,
                    )
                });
            if let Err(e) = enabled {
                error!("Could not enable {} notifications: {}", self.role(), e);
                return self.fail(e.into(), adapter);
            }
        }

        self.handles = Some(handles);
        self.set_state(SessionState::Ready);
        info!("{} ready", self.role());
        vec![SessionOutput::Status(ConnectionStatus::Connected)]
    }

    /// Check the discovered layout against this role's fixed contract
    fn resolve(&self, services: &[GattService]) -> Result<ResolvedHandles, SessionError> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.profile.service)
            .ok_or_else(|| {
                SessionError::ProtocolMismatch(format!(
                    "{} service {} not found",
                    self.role(),
                    self.profile.service
                ))
            })?;

        let find = |uuid: Uuid| {
            service.characteristic(uuid).ok_or_else(|| {
                SessionError::ProtocolMismatch(format!(
                    "{} characteristic {} not found",
                    self.role(),
                    uuid
                ))
            })
        };

        if let Some(write_char) = self.profile.write_char {
            find(write_char)?;
        }

        if let Some(read_char) = self.profile.read_char {
            let characteristic = find(read_char)?;
            if let Some(config) = self.profile.notify_config {
                if !characteristic.descriptors.contains(&config) {
                    return Err(SessionError::ProtocolMismatch(format!(
                        "{} receive config descriptor {} not found",
                        self.role(),
                        config
                    )));
                }
            }
        }

        Ok(ResolvedHandles {
            service: service.uuid,
            write_char: self.profile.write_char,
            read_char: self.profile.read_char,
            notify_config: self.profile.notify_config,
        })
    }

    /// Abandon the current attempt; the session rests in `Disconnected`.
    fn fail(&mut self, err: SessionError, adapter: &dyn BleAdapter) -> Vec<SessionOutput> {
        match &err {
            SessionError::ProtocolMismatch(_) => error!("{}: {}", self.role(), err),
            _ => warn!("{}: {}", self.role(), err),
        }
        self.cancel_scan_timer();
        self.release_link(adapter);
        self.handles = None;
        self.set_state(SessionState::Disconnected);
        vec![
            SessionOutput::Failed(err),
            SessionOutput::Status(ConnectionStatus::Disconnected),
        ]
    }

    fn release_link(&mut self, adapter: &dyn BleAdapter) {
        if let Err(e) = adapter.disconnect(self.role()) {
            debug!("{} link teardown: {}", self.role(), e);
        }
        self.handles = None;
    }

    fn finish_disconnect(&mut self) {
        self.set_state(SessionState::Disconnected);
        self.peripheral = None;
        self.set_state(SessionState::Idle);
    }

    fn arm_scan_timer(&mut self) {
        self.cancel_scan_timer();
        self.attempt += 1;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, {} scan will not time out", self.role());
            return;
        };

        let attempt = self.attempt;
        let role = self.role();
        let timeout = self.profile.scan_timeout;
        let sender = self.timer_sender.clone();
        self.scan_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = sender.send(AdapterEvent::new(role, SessionEvent::TimedOut { attempt }));
        }));
    }

    fn cancel_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("{} session: {} -> {}", self.role(), self.state, state);
            self.state = state;
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.cancel_scan_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::adapter::{AdapterEventReceiver, GattCharacteristic};
    use crate::infrastructure::bluetooth::loopback::{LoopbackAdapter, VirtualPeripheral};
    use crate::infrastructure::bluetooth::protocol::{
        CLIENT_CONFIG_DESCRIPTOR, RECEIVE_CHARACTERISTIC, SERVICE,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn session(role: Role) -> (DeviceSession, LoopbackAdapter, AdapterEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let profile = Settings::default().session_profile(role).unwrap();
        let adapter = LoopbackAdapter::new(tx.clone());
        (DeviceSession::new(profile, tx), adapter, rx)
    }

    /// Feed every queued adapter event into the session
    fn pump(
        session: &mut DeviceSession,
        adapter: &LoopbackAdapter,
        rx: &mut AdapterEventReceiver,
    ) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.role == session.role() {
                outputs.extend(session.handle(event.kind, adapter));
            }
        }
        outputs
    }

    #[tokio::test]
    async fn test_sensor_reaches_ready_and_enables_notifications() {
        let (mut session, adapter, mut rx) = session(Role::Sensor);
        adapter.add_peripheral(VirtualPeripheral::mantra("AA:BB"));

        let outputs = session.start_connect(&adapter);
        assert_eq!(outputs, vec![SessionOutput::Status(ConnectionStatus::Connecting)]);
        assert_eq!(session.state(), SessionState::Scanning);

        let outputs = pump(&mut session, &adapter, &mut rx);
        assert_eq!(session.state(), SessionState::Ready);
        assert!(outputs.contains(&SessionOutput::Status(ConnectionStatus::Connected)));
        assert_eq!(
            adapter.descriptor_value(Role::Sensor, RECEIVE_CHARACTERISTIC, CLIENT_CONFIG_DESCRIPTOR),
            Some(ENABLE_NOTIFICATION_VALUE.to_vec())
        );
        assert_eq!(session.peripheral().unwrap().address, "AA:BB");
    }

    #[tokio::test]
    async fn test_second_start_connect_is_noop() {
        let (mut session, adapter, _rx) = session(Role::Bracelet);
        session.start_connect(&adapter);
        let scans = adapter.scan_requests(Role::Bracelet);

        assert!(session.start_connect(&adapter).is_empty());
        assert_eq!(session.state(), SessionState::Scanning);
        assert_eq!(adapter.scan_requests(Role::Bracelet), scans);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_times_out_to_idle() {
        let (mut session, adapter, mut rx) = session(Role::Sensor);
        session.start_connect(&adapter);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, SessionEvent::TimedOut { attempt: 1 });
        let outputs = session.handle(event.kind, &adapter);
        assert_eq!(
            outputs,
            vec![
                SessionOutput::Failed(SessionError::ScanTimeout),
                SessionOutput::Status(ConnectionStatus::Disconnected),
            ]
        );
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!adapter.is_scanning(Role::Sensor));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_is_ignored() {
        let (mut session, adapter, _rx) = session(Role::Sensor);
        session.start_connect(&adapter);
        session.disconnect(&adapter);
        session.start_connect(&adapter);

        let outputs = session.handle(SessionEvent::TimedOut { attempt: 1 }, &adapter);
        assert!(outputs.is_empty());
        assert_eq!(session.state(), SessionState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_scanning_cancels_timer() {
        let (mut session, adapter, mut rx) = session(Role::Sensor);
        session.start_connect(&adapter);

        let outputs = session.disconnect(&adapter);
        assert_eq!(outputs, vec![SessionOutput::Status(ConnectionStatus::Disconnected)]);
        assert_eq!(session.state(), SessionState::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_protocol_mismatch() {
        let (mut session, adapter, mut rx) = session(Role::Sensor);
        let mut mantra = VirtualPeripheral::mantra("AA:BB");
        mantra.services = vec![GattService {
            uuid: SERVICE,
            characteristics: vec![GattCharacteristic::new(RECEIVE_CHARACTERISTIC)],
        }];
        adapter.add_peripheral(mantra);

        session.start_connect(&adapter);
        let outputs = pump(&mut session, &adapter, &mut rx);

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SessionOutput::Failed(SessionError::ProtocolMismatch(_)))));
        assert!(!adapter.is_linked(Role::Sensor));

        // Not retried, but a new attempt may be started.
        assert_eq!(adapter.scan_requests(Role::Sensor), 1);
        session.start_connect(&adapter);
        assert_eq!(session.state(), SessionState::Scanning);
    }

    #[tokio::test]
    async fn test_bracelet_without_service_is_protocol_mismatch() {
        let (mut session, adapter, mut rx) = session(Role::Bracelet);
        let mut bracelet = VirtualPeripheral::bracelet("CC:DD");
        bracelet.services.clear();
        adapter.add_peripheral(bracelet);

        session.start_connect(&adapter);
        pump(&mut session, &adapter, &mut rx);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.handles().is_none());
    }

    #[tokio::test]
    async fn test_unexpected_drop_returns_to_idle() {
        let (mut session, adapter, mut rx) = session(Role::Bracelet);
        adapter.add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        session.start_connect(&adapter);
        pump(&mut session, &adapter, &mut rx);
        assert!(session.is_ready());

        adapter.drop_link(Role::Bracelet);
        let outputs = pump(&mut session, &adapter, &mut rx);
        assert_eq!(
            outputs,
            vec![
                SessionOutput::Failed(SessionError::UnexpectedDisconnect),
                SessionOutput::Status(ConnectionStatus::Disconnected),
            ]
        );
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_write_requires_ready() {
        let (session, adapter, _rx) = session(Role::Bracelet);
        assert_eq!(
            session.write(&adapter, &[1, 2, 3, 4]),
            Err(SessionError::NotReady {
                role: Role::Bracelet
            })
        );
        assert!(adapter.writes(Role::Bracelet).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let (mut session, adapter, _rx) = session(Role::Bracelet);
        assert!(session.disconnect(&adapter).is_empty());
        assert!(session.disconnect(&adapter).is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_from_ready() {
        let (mut session, adapter, mut rx) = session(Role::Bracelet);
        adapter.add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        session.start_connect(&adapter);
        pump(&mut session, &adapter, &mut rx);

        let outputs = session.disconnect(&adapter);
        assert_eq!(
            outputs,
            vec![
                SessionOutput::Status(ConnectionStatus::Disconnecting),
                SessionOutput::Status(ConnectionStatus::Disconnected),
            ]
        );
        // The adapter's own disconnect report arrives after we are idle.
        assert!(pump(&mut session, &adapter, &mut rx).is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }
    #[tokio::test]
    async fn test_sensor_write_has_no_characteristic() {
        let (mut session, adapter, mut rx) = session(Role::Sensor);
        adapter.add_peripheral(VirtualPeripheral::mantra("AA:BB"));
        session.start_connect(&adapter);
        pump(&mut session, &adapter, &mut rx);
        assert!(session.is_ready());

        let err = session.write(&adapter, &[1, 2, 3, 4]).unwrap_err();
        assert_eq!(err, SessionError::NoWriteCharacteristic { role: Role::Sensor });
        assert_eq!(err.to_string(), "The sensor peripheral has no writable characteristic");
    }

    /// Drive a fresh session up to `state` by handing it one event at a time
    fn step_to(
        state: SessionState,
        session: &mut DeviceSession,
        adapter: &LoopbackAdapter,
        rx: &mut AdapterEventReceiver,
    ) {
        session.start_connect(adapter);
        while session.state() != state {
            let event = rx.try_recv().unwrap();
            session.handle(event.kind, adapter);
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_discards_link() {
        let (mut session, adapter, mut rx) = session(Role::Bracelet);
        adapter.add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        step_to(SessionState::Connecting, &mut session, &adapter, &mut rx);
        assert!(adapter.is_linked(Role::Bracelet));

        let outputs = session.disconnect(&adapter);
        assert_eq!(outputs, vec![SessionOutput::Status(ConnectionStatus::Disconnected)]);
        assert!(session.handles().is_none());
        assert!(session.peripheral().is_none());
        assert!(!adapter.is_linked(Role::Bracelet));

        // The queued Connected and the teardown report both arrive late.
        assert!(pump(&mut session, &adapter, &mut rx).is_empty());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_while_discovering_discards_link() {
        let (mut session, adapter, mut rx) = session(Role::Sensor);
        adapter.add_peripheral(VirtualPeripheral::mantra("AA:BB"));
        step_to(SessionState::DiscoveringServices, &mut session, &adapter, &mut rx);

        let outputs = session.disconnect(&adapter);
        assert_eq!(outputs, vec![SessionOutput::Status(ConnectionStatus::Disconnected)]);
        assert!(session.handles().is_none());
        assert!(!adapter.is_linked(Role::Sensor));

        // ServicesReady for the abandoned link must not resurrect it.
        assert!(pump(&mut session, &adapter, &mut rx).is_empty());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            adapter.descriptor_value(Role::Sensor, RECEIVE_CHARACTERISTIC, CLIENT_CONFIG_DESCRIPTOR),
            None
        );
    }

    #[tokio::test]
    async fn test_old_link_reports_do_not_touch_new_attempt() {
        let (mut session, adapter, mut rx) = session(Role::Bracelet);
        adapter.add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        session.start_connect(&adapter);
        pump(&mut session, &adapter, &mut rx);
        assert!(session.is_ready());

        session.disconnect(&adapter);
        let teardown = rx.try_recv().unwrap();
        assert_eq!(teardown.kind, SessionEvent::Disconnected { attempt: 1 });

        // Reconnect before the old link's report is handled.
        step_to(SessionState::Connecting, &mut session, &adapter, &mut rx);
        assert!(session.handle(teardown.kind.clone(), &adapter).is_empty());
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(adapter.is_linked(Role::Bracelet));

        pump(&mut session, &adapter, &mut rx);
        assert!(session.is_ready());

        // Late reports from the first link are still ignored once ready.
        assert!(session.handle(teardown.kind, &adapter).is_empty());
        let late_services = SessionEvent::ServicesReady {
            attempt: 1,
            services: Vec::new(),
        };
        assert!(session.handle(late_services, &adapter).is_empty());
        assert!(session.is_ready());
        assert!(adapter.is_linked(Role::Bracelet));
    }

    #[tokio::test]
    async fn test_found_reports_advertised_rssi() {
        let (mut session, adapter, mut rx) = session(Role::Bracelet);
        adapter.add_peripheral(VirtualPeripheral::bracelet("CC:DD"));
        session.start_connect(&adapter);

        let found = rx.try_recv().unwrap();
        let outputs = session.handle(found.kind, &adapter);
        assert!(matches!(outputs[0], SessionOutput::Found(ref d) if d.address == "CC:DD"));
        assert_eq!(outputs[1], SessionOutput::Rssi(-60));
    }
}
