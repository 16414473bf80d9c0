//! BLE Scanner Module
//!
//! Advertisement watcher that reports peripherals by local name.

use crate::domain::models::{Role, ScannedDevice};
use crate::infrastructure::bluetooth::adapter::{AdapterEvent, AdapterEventSender, SessionEvent};
use anyhow::Result;
use tracing::{debug, info};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Format a WinRT Bluetooth address the way it is carried in [`ScannedDevice`]
pub fn format_address(address: u64) -> String {
    format!("{:012X}", address)
}

pub fn parse_address(address: &str) -> Option<u64> {
    u64::from_str_radix(&address.replace(':', ""), 16).ok()
}

/// One running scan for one role
pub struct AdvertisementScanner {
    role: Role,
    watcher: BluetoothLEAdvertisementWatcher,
}

impl AdvertisementScanner {
    /// Start an active scan reporting advertisements named `name`
    /// (case-insensitive). Nameless advertisements are skipped.
    pub fn start(role: Role, name: &str, sender: AdapterEventSender) -> Result<Self> {
        info!("Starting BLE scan for {} ('{}')", role, name);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let wanted = name.to_string();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let local_name = args.Advertisement()?.LocalName()?.to_string();
                    if local_name.is_empty() || !local_name.eq_ignore_ascii_case(&wanted) {
                        return Ok(());
                    }

                    let device = ScannedDevice {
                        name: local_name,
                        address: format_address(args.BluetoothAddress()?),
                        signal_strength: args.RawSignalStrengthInDBm().ok(),
                    };
                    debug!("Advertisement from '{}' at {}", device.name, device.address);
                    let _ = sender.send(AdapterEvent::new(role, SessionEvent::Found(device)));
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        Ok(Self { role, watcher })
    }

    pub fn stop(&self) -> Result<()> {
        info!("Stopping {} BLE scan", self.role);
        self.watcher.Stop()?;
        Ok(())
    }
}

impl Drop for AdvertisementScanner {
    fn drop(&mut self) {
        let _ = self.watcher.Stop();
    }
}
