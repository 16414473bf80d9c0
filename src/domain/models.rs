use serde::{Deserialize, Serialize};
use std::fmt;

/// The two peripheral roles the controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// RGB + brightness LED actuator
    Bracelet,
    /// Breathing sensor ("Mantra")
    Sensor,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Bracelet, Role::Sensor];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Bracelet => write!(f, "bracelet"),
            Role::Sensor => write!(f, "sensor"),
        }
    }
}

/// Color commanded to the bracelet. Brightness is a percentage (0..=100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub brightness: u8,
}

impl Color {
    /// "No color": black with no brightness.
    pub const OFF: Color = Color {
        red: 0,
        green: 0,
        blue: 0,
        brightness: 0,
    };

    pub const MAX_BRIGHTNESS: u8 = 100;

    pub fn new(red: u8, green: u8, blue: u8, brightness: u8) -> Self {
        Self {
            red,
            green,
            blue,
            brightness: brightness.min(Self::MAX_BRIGHTNESS),
        }
    }

    /// Same hue, different brightness
    pub fn with_brightness(self, brightness: u8) -> Self {
        Self::new(self.red, self.green, self.blue, brightness)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R:{} G:{} B:{} @{}%",
            self.red, self.green, self.blue, self.brightness
        )
    }
}

/// Observed sensor range over the sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorRange {
    pub min: i32,
    pub max: i32,
}

impl SensorRange {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// No spread between min and max
    pub fn is_flat(&self) -> bool {
        self.min == self.max
    }
}

/// Role-scoped connection state reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A peripheral seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    /// Platform identifier (MAC address or WinRT address in hex)
    pub address: String,
    pub signal_strength: Option<i16>,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus {
        role: Role,
        status: ConnectionStatus,
    },
    DeviceFound {
        role: Role,
        device: ScannedDevice,
    },
    SignalStrength {
        role: Role,
        rssi: i16,
    },
    SensorReading {
        raw: u8,
        filtered: i32,
        color: Color,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
