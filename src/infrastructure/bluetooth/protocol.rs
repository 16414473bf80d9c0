//! Bracelet / Mantra Protocol
//!
//! Both peripherals expose the same RFduino-style service. The UUIDs were
//! found empirically and are not resolved from GATT metadata at runtime.

use crate::domain::models::Color;
use anyhow::Result;
use tracing::trace;
use uuid::Uuid;

/// Service shared by the Bracelet and the Mantra sensor
pub const SERVICE_UUID: &str = "00002220-0000-1000-8000-00805f9b34fb";

/// Receive Characteristic - sensor readings are notified here
pub const RECEIVE_CHAR_UUID: &str = "00002221-0000-1000-8000-00805f9b34fb";

/// Send Characteristic - colors are written here
pub const SEND_CHAR_UUID: &str = "00002222-0000-1000-8000-00805f9b34fb";

/// Client Characteristic Configuration descriptor
pub const CLIENT_CONFIG_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

pub const SERVICE: Uuid = Uuid::from_u128(0x00002220_0000_1000_8000_00805f9b34fb);
pub const RECEIVE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002221_0000_1000_8000_00805f9b34fb);
pub const SEND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002222_0000_1000_8000_00805f9b34fb);
pub const CLIENT_CONFIG_DESCRIPTOR: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Standard "enable notification" value for the client config descriptor
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// How a characteristic write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    /// Fire-and-forget
    WithoutResponse,
}

/// Encode a color as the 4-byte Send payload
///
/// ```text
/// [0] : Red
/// [1] : Green
/// [2] : Blue
/// [3] : Brightness (0-100)
/// ```
pub fn encode_color(color: &Color) -> [u8; 4] {
    [color.red, color.green, color.blue, color.brightness]
}

/// Decode a Send payload. Older firmware accepts 3 bytes with no brightness;
/// those decode with brightness 0.
pub fn decode_color(bytes: &[u8]) -> Result<Color> {
    match bytes {
        [r, g, b] => Ok(Color::new(*r, *g, *b, 0)),
        [r, g, b, a] => Ok(Color::new(*r, *g, *b, *a)),
        _ => Err(anyhow::anyhow!("Invalid color payload size: {}", bytes.len())),
    }
}

/// Decode a Receive notification: one unsigned byte
pub fn decode_sensor_value(bytes: &[u8]) -> Result<u8> {
    #[cfg(debug_assertions)]
    trace!("Raw notification: {:02X?}", bytes);

    bytes
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Empty sensor notification"))
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format '{}': {}", uuid_str, e))
}
