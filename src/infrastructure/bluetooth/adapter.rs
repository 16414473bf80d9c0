//! Platform BLE Adapter
//!
//! The core never owns the platform Bluetooth stack. It talks to an injected
//! [`BleAdapter`] whose requests return immediately; their outcomes come back
//! later as [`AdapterEvent`]s on the channel the adapter was built with.

use crate::domain::error::AdapterError;
use crate::domain::models::{Role, ScannedDevice};
use crate::infrastructure::bluetooth::protocol::WriteType;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A characteristic and the descriptors attached to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A discovered GATT service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Everything that can happen to one peripheral link.
///
/// Link-scoped events carry the `attempt` that was passed to
/// [`BleAdapter::connect`], so reports from a link that has since been torn
/// down can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A named advertisement matched the scan filter
    Found(ScannedDevice),
    Connected {
        attempt: u64,
    },
    ConnectFailed {
        attempt: u64,
        reason: String,
    },
    ServicesReady {
        attempt: u64,
        services: Vec<GattService>,
    },
    ServiceDiscoveryFailed {
        attempt: u64,
        reason: String,
    },
    /// Raw 1-byte reading from the receive characteristic
    Notified {
        attempt: u64,
        value: u8,
    },
    Rssi {
        attempt: u64,
        rssi: i16,
    },
    Disconnected {
        attempt: u64,
    },
    /// Scan timer for the given attempt fired
    TimedOut {
        attempt: u64,
    },
}

impl SessionEvent {
    /// Attempt the event belongs to; `None` for scan results
    pub fn attempt(&self) -> Option<u64> {
        match self {
            SessionEvent::Found(_) => None,
            SessionEvent::Connected { attempt }
            | SessionEvent::ConnectFailed { attempt, .. }
            | SessionEvent::ServicesReady { attempt, .. }
            | SessionEvent::ServiceDiscoveryFailed { attempt, .. }
            | SessionEvent::Notified { attempt, .. }
            | SessionEvent::Rssi { attempt, .. }
            | SessionEvent::Disconnected { attempt }
            | SessionEvent::TimedOut { attempt } => Some(*attempt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEvent {
    pub role: Role,
    pub kind: SessionEvent,
}

impl AdapterEvent {
    pub fn new(role: Role, kind: SessionEvent) -> Self {
        Self { role, kind }
    }
}

pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;
pub type AdapterEventReceiver = mpsc::UnboundedReceiver<AdapterEvent>;

/// Platform BLE capability. One link per role at most.
///
/// Long-running requests (`start_scan`, `connect`, `discover_services`)
/// report their outcome asynchronously; an `Err` return only means the
/// request could not be issued at all.
pub trait BleAdapter: Send + Sync {
    /// Start discovery, reporting advertisements whose name equals `name`
    /// (case-insensitive). Nameless devices are never reported.
    fn start_scan(&self, role: Role, name: &str) -> Result<(), AdapterError>;

    fn stop_scan(&self, role: Role) -> Result<(), AdapterError>;

    /// Open a link to `device`. Every event the link reports is tagged
    /// with `attempt` until it is replaced or disconnected.
    fn connect(
        &self,
        role: Role,
        device: &ScannedDevice,
        auto_reconnect: bool,
        attempt: u64,
    ) -> Result<(), AdapterError>;

    fn discover_services(&self, role: Role) -> Result<(), AdapterError>;

    /// Route notifications of `characteristic` to the event channel
    fn set_notify(&self, role: Role, characteristic: Uuid, enabled: bool)
        -> Result<(), AdapterError>;

    fn write_descriptor(
        &self,
        role: Role,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), AdapterError>;

    fn write_characteristic(
        &self,
        role: Role,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), AdapterError>;

    /// Last value the platform holds for `characteristic`
    fn read_characteristic(&self, role: Role, characteristic: Uuid)
        -> Result<Vec<u8>, AdapterError>;

    fn disconnect(&self, role: Role) -> Result<(), AdapterError>;
}
