//! Error types for the bracelet controller.

use crate::domain::models::Role;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a platform BLE adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("Unknown peripheral '{0}'")]
    UnknownPeripheral(String),

    #[error("Peripheral is not connected")]
    NotConnected,

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Failures of a device session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No matching device advertised before the scan timed out")]
    ScanTimeout,

    #[error("Peripheral does not expose the expected GATT layout: {0}")]
    ProtocolMismatch(String),

    #[error("Write rejected by the link: {0}")]
    WriteFailed(String),

    #[error("Link dropped unexpectedly")]
    UnexpectedDisconnect,

    #[error("The {role} session is not ready")]
    NotReady { role: Role },

    #[error("The {role} peripheral has no writable characteristic")]
    NoWriteCharacteristic { role: Role },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}
