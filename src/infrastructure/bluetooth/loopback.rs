//! Loopback Adapter
//!
//! In-memory [`BleAdapter`] hosting virtual peripherals. Requests are answered
//! immediately on the event channel, written values are kept so they can be
//! read back, and every request is recorded for inspection. Used by the tests
//! and by the binary's simulation mode.

use crate::domain::error::AdapterError;
use crate::domain::models::{Role, ScannedDevice};
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventSender, BleAdapter, GattCharacteristic, GattService, SessionEvent,
};
use crate::infrastructure::bluetooth::protocol::{
    self, WriteType, CLIENT_CONFIG_DESCRIPTOR, ENABLE_NOTIFICATION_VALUE, RECEIVE_CHARACTERISTIC,
    SEND_CHARACTERISTIC, SERVICE,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// A peripheral the loopback adapter can "discover"
#[derive(Debug, Clone)]
pub struct VirtualPeripheral {
    pub device: ScannedDevice,
    pub services: Vec<GattService>,
}

impl VirtualPeripheral {
    pub fn new(name: &str, address: &str, services: Vec<GattService>) -> Self {
        Self {
            device: ScannedDevice {
                name: name.to_string(),
                address: address.to_string(),
                signal_strength: Some(-60),
            },
            services,
        }
    }

    /// A Bracelet exposing the send characteristic
    pub fn bracelet(address: &str) -> Self {
        Self::new(
            "Bracelet",
            address,
            vec![GattService {
                uuid: SERVICE,
                characteristics: vec![
                    GattCharacteristic::new(SEND_CHARACTERISTIC),
                    GattCharacteristic::new(RECEIVE_CHARACTERISTIC)
                        .with_descriptor(CLIENT_CONFIG_DESCRIPTOR),
                ],
            }],
        )
    }

    /// A Mantra breathing sensor exposing the receive characteristic
    pub fn mantra(address: &str) -> Self {
        let mut peripheral = Self::bracelet(address);
        peripheral.device.name = "Mantra".to_string();
        peripheral
    }
}

#[derive(Debug, Default)]
struct Link {
    address: String,
    attempt: u64,
    values: HashMap<Uuid, Vec<u8>>,
    descriptors: HashMap<(Uuid, Uuid), Vec<u8>>,
    notifying: HashSet<Uuid>,
    writes: Vec<(Vec<u8>, WriteType)>,
}

impl Link {
    /// Notifications flow once routing is on and the peer has been told to send
    fn notifies(&self, characteristic: Uuid) -> bool {
        self.notifying.contains(&characteristic)
            && self
                .descriptors
                .get(&(characteristic, CLIENT_CONFIG_DESCRIPTOR))
                .is_some_and(|v| v.as_slice() == ENABLE_NOTIFICATION_VALUE)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    peripherals: Vec<VirtualPeripheral>,
    scanning: HashMap<Role, String>,
    scan_requests: HashMap<Role, usize>,
    links: HashMap<Role, Link>,
}

#[derive(Clone)]
pub struct LoopbackAdapter {
    state: Arc<Mutex<LoopbackState>>,
    events: AdapterEventSender,
}

impl LoopbackAdapter {
    pub fn new(events: AdapterEventSender) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            events,
        }
    }

    /// Make a peripheral discoverable. Roles already scanning for its name
    /// see it right away.
    pub fn add_peripheral(&self, peripheral: VirtualPeripheral) {
        let mut state = self.lock();
        for (role, name) in &state.scanning {
            if peripheral.device.name.eq_ignore_ascii_case(name) {
                self.post(*role, SessionEvent::Found(peripheral.device.clone()));
            }
        }
        state.peripherals.push(peripheral);
    }

    /// Deliver a sensor reading if the role's link is notifying
    pub fn notify(&self, role: Role, value: u8) -> bool {
        let mut state = self.lock();
        let Some(link) = state.links.get_mut(&role) else {
            return false;
        };
        if !link.notifies(RECEIVE_CHARACTERISTIC) {
            return false;
        }
        link.values.insert(RECEIVE_CHARACTERISTIC, vec![value]);
        let attempt = link.attempt;
        self.post(role, SessionEvent::Notified { attempt, value });
        true
    }

    /// Simulate the peer going away without being asked to
    pub fn drop_link(&self, role: Role) {
        if let Some(link) = self.lock().links.remove(&role) {
            self.post(role, SessionEvent::Disconnected { attempt: link.attempt });
        }
    }

    /// Report the signal strength of the role's link, if any
    pub fn report_rssi(&self, role: Role, rssi: i16) {
        if let Some(attempt) = self.lock().links.get(&role).map(|link| link.attempt) {
            self.post(role, SessionEvent::Rssi { attempt, rssi });
        }
    }

    pub fn is_scanning(&self, role: Role) -> bool {
        self.lock().scanning.contains_key(&role)
    }

    pub fn is_linked(&self, role: Role) -> bool {
        self.lock().links.contains_key(&role)
    }

    pub fn scan_requests(&self, role: Role) -> usize {
        self.lock().scan_requests.get(&role).copied().unwrap_or(0)
    }

    /// Every payload written on the role's link, oldest first
    pub fn writes(&self, role: Role) -> Vec<Vec<u8>> {
        self.lock()
            .links
            .get(&role)
            .map(|link| link.writes.iter().map(|(bytes, _)| bytes.clone()).collect())
            .unwrap_or_default()
    }

    pub fn write_types(&self, role: Role) -> Vec<WriteType> {
        self.lock()
            .links
            .get(&role)
            .map(|link| link.writes.iter().map(|(_, t)| *t).collect())
            .unwrap_or_default()
    }

    pub fn descriptor_value(
        &self,
        role: Role,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Option<Vec<u8>> {
        self.lock()
            .links
            .get(&role)
            .and_then(|link| link.descriptors.get(&(characteristic, descriptor)).cloned())
    }

    /// Feed a slow synthetic breathing waveform to the sensor link.
    pub fn spawn_breathing(&self, interval: Duration) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut step: u32 = 0;
            loop {
                ticker.tick().await;
                let value = breathing_sample(step);
                if adapter.notify(Role::Sensor, value) {
                    trace!("Simulated breath sample {}", value);
                }
                step = step.wrapping_add(1);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        // State is plain data; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn post(&self, role: Role, kind: SessionEvent) {
        let _ = self.events.send(AdapterEvent::new(role, kind));
    }
}

/// One sample of a ~4 s breath cycle at 20 Hz, in 30..=230
fn breathing_sample(step: u32) -> u8 {
    const SAMPLES_PER_BREATH: f64 = 80.0;
    let phase = (step as f64 / SAMPLES_PER_BREATH) * std::f64::consts::TAU;
    (130.0 + 100.0 * phase.sin()).round() as u8
}

impl BleAdapter for LoopbackAdapter {
    fn start_scan(&self, role: Role, name: &str) -> Result<(), AdapterError> {
        let mut state = self.lock();
        *state.scan_requests.entry(role).or_default() += 1;
        state.scanning.insert(role, name.to_string());

        if let Some(found) = state
            .peripherals
            .iter()
            .find(|p| !p.device.name.is_empty() && p.device.name.eq_ignore_ascii_case(name))
        {
            self.post(role, SessionEvent::Found(found.device.clone()));
        }
        Ok(())
    }

    fn stop_scan(&self, role: Role) -> Result<(), AdapterError> {
        self.lock().scanning.remove(&role);
        Ok(())
    }

    fn connect(
        &self,
        role: Role,
        device: &ScannedDevice,
        auto_reconnect: bool,
        attempt: u64,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        if !state
            .peripherals
            .iter()
            .any(|p| p.device.address == device.address)
        {
            return Err(AdapterError::UnknownPeripheral(device.address.clone()));
        }
        debug!(
            "Loopback connect {} -> {} (attempt {}, auto reconnect: {})",
            role, device.address, attempt, auto_reconnect
        );
        state.links.insert(
            role,
            Link {
                address: device.address.clone(),
                attempt,
                ..Link::default()
            },
        );
        self.post(role, SessionEvent::Connected { attempt });
        Ok(())
    }

    fn discover_services(&self, role: Role) -> Result<(), AdapterError> {
        let state = self.lock();
        let link = state.links.get(&role).ok_or(AdapterError::NotConnected)?;
        let services = state
            .peripherals
            .iter()
            .find(|p| p.device.address == link.address)
            .map(|p| p.services.clone())
            .unwrap_or_default();
        self.post(
            role,
            SessionEvent::ServicesReady {
                attempt: link.attempt,
                services,
            },
        );
        Ok(())
    }

    fn set_notify(
        &self,
        role: Role,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        let link = state.links.get_mut(&role).ok_or(AdapterError::NotConnected)?;
        if enabled {
            link.notifying.insert(characteristic);
        } else {
            link.notifying.remove(&characteristic);
        }
        Ok(())
    }

    fn write_descriptor(
        &self,
        role: Role,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        let link = state.links.get_mut(&role).ok_or(AdapterError::NotConnected)?;
        link.descriptors
            .insert((characteristic, descriptor), value.to_vec());
        Ok(())
    }

    fn write_characteristic(
        &self,
        role: Role,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), AdapterError> {
        let mut state = self.lock();
        let link = state.links.get_mut(&role).ok_or(AdapterError::NotConnected)?;
        if characteristic == SEND_CHARACTERISTIC {
            if let Ok(color) = protocol::decode_color(value) {
                trace!("Loopback {} shows {}", role, color);
            }
        }
        link.values.insert(characteristic, value.to_vec());
        link.writes.push((value.to_vec(), write_type));
        Ok(())
    }

    fn read_characteristic(
        &self,
        role: Role,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, AdapterError> {
        let state = self.lock();
        let link = state.links.get(&role).ok_or(AdapterError::NotConnected)?;
        link.values
            .get(&characteristic)
            .cloned()
            .ok_or(AdapterError::CharacteristicNotFound(characteristic))
    }

    fn disconnect(&self, role: Role) -> Result<(), AdapterError> {
        self.lock().scanning.remove(&role);
        match self.lock().links.remove(&role) {
            Some(link) => {
                self.post(role, SessionEvent::Disconnected { attempt: link.attempt });
                Ok(())
            }
            None => Err(AdapterError::NotConnected),
        }
    }
}
