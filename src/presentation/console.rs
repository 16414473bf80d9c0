//! Line-oriented control shell.
//!
//! Stands in for the connect buttons and color sliders: each stdin line is
//! parsed into a [`ConsoleCommand`] and coordinator events are rendered back
//! as single lines.

use crate::domain::models::{AppEvent, Color, ConnectionStatus, MessageSeverity, Role};
use crate::infrastructure::bluetooth::service::CoordinatorSnapshot;
use anyhow::{bail, Context, Result};

pub const HELP: &str = "\
commands:
  bracelet                 connect / disconnect the bracelet
  mantra | sensor          connect / disconnect the breathing sensor
  color R G B [BRIGHTNESS] send a color (0-255, brightness 0-100)
  status                   show session states
  help                     show this text
  quit                     disconnect everything and exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Toggle(Role),
    /// Brightness `None` keeps the last commanded brightness
    Color {
        red: u8,
        green: u8,
        blue: u8,
        brightness: Option<u8>,
    },
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Resolve into the color to send given the last commanded one
    pub fn color_with(&self, last: Color) -> Option<Color> {
        match *self {
            ConsoleCommand::Color {
                red,
                green,
                blue,
                brightness,
            } => Some(Color::new(
                red,
                green,
                blue,
                brightness.unwrap_or(last.brightness),
            )),
            _ => None,
        }
    }
}

fn channel(token: Option<&str>, name: &str, max: u8) -> Result<u8> {
    let token = token.with_context(|| format!("missing {}", name))?;
    let value: u8 = token
        .parse()
        .with_context(|| format!("{} must be a number 0-{}, got '{}'", name, max, token))?;
    if value > max {
        bail!("{} must be at most {}, got {}", name, max, value);
    }
    Ok(value)
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };

    let command = match word.to_lowercase().as_str() {
        "bracelet" => ConsoleCommand::Toggle(Role::Bracelet),
        "mantra" | "sensor" => ConsoleCommand::Toggle(Role::Sensor),
        "color" | "colour" => {
            let red = channel(words.next(), "red", u8::MAX)?;
            let green = channel(words.next(), "green", u8::MAX)?;
            let blue = channel(words.next(), "blue", u8::MAX)?;
            let brightness = match words.next() {
                Some(token) => Some(channel(Some(token), "brightness", Color::MAX_BRIGHTNESS)?),
                None => None,
            };
            ConsoleCommand::Color {
                red,
                green,
                blue,
                brightness,
            }
        }
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("unknown command '{}' (try 'help')", other),
    };

    if let Some(extra) = words.next() {
        bail!("unexpected argument '{}'", extra);
    }
    Ok(Some(command))
}

/// One-line rendering of an event; sensor readings are too chatty to print.
pub fn render_event(event: &AppEvent) -> Option<String> {
    match event {
        AppEvent::ConnectionStatus { role, status } => {
            let text = match status {
                ConnectionStatus::Disconnected => "disconnected",
                ConnectionStatus::Connecting => "connecting...",
                ConnectionStatus::Connected => "connected",
                ConnectionStatus::Disconnecting => "disconnecting...",
            };
            Some(format!("[{}] {}", role, text))
        }
        AppEvent::DeviceFound { role, device } => Some(format!(
            "[{}] found '{}' ({})",
            role, device.name, device.address
        )),
        AppEvent::SignalStrength { role, rssi } => Some(format!("[{}] RSSI {} dBm", role, rssi)),
        AppEvent::SensorReading { .. } => None,
        AppEvent::LogMessage(msg) => {
            let tag = match msg.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => "ok",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "error",
            };
            Some(format!("{}: {}", tag, msg.message))
        }
    }
}

pub fn render_snapshot(snapshot: &CoordinatorSnapshot) -> String {
    format!(
        "bracelet: {}\nsensor:   {}\ncolor:    {}",
        snapshot.bracelet, snapshot.sensor, snapshot.color
    )
}
