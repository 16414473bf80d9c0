//! Bluetooth Module
//!
//! Connection management for the Bracelet actuator and the Mantra sensor.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   SessionCoordinator                     │
//! │  (single owner of both sessions, filter and last color)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Session  │  │  Session   │  │ Protocol │
//! │ (Bracelet)│  │  (Sensor)  │  │          │
//! │           │  │            │  │ - UUIDs  │
//! │ - write   │  │ - notify   │  │ - Payload│
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       └──────┬───────┘
//!              ▼
//!       ┌─────────────┐
//!       │ BleAdapter  │  loopback / WinRT
//!       └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs and payload encoding
//! - [`adapter`] - the injected platform capability and its events
//! - [`session`] - per-peripheral state machine
//! - [`service`] - the coordinator and its command handle
//! - [`loopback`] - in-memory adapter for tests and simulation
//! - [`write_slot`] - latest-value write hand-off for link tasks
//! - `winrt` - Windows adapter (Windows only)

pub mod adapter;
pub mod loopback;
pub mod protocol;
pub mod service;
pub mod session;
pub mod write_slot;

#[cfg(windows)]
pub mod connection;
#[cfg(windows)]
pub mod scanner;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::{CoordinatorHandle, SessionCoordinator};
