//! BLE Connection Module
//!
//! One open GATT link: device handle, session keep-alive, discovered
//! characteristics and notification subscriptions.

use crate::domain::models::Role;
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventSender, GattCharacteristic, GattService, SessionEvent,
};
use crate::infrastructure::bluetooth::protocol::{self, WriteType, ENABLE_NOTIFICATION_VALUE};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;
use windows::core::{IInspectable, Ref, GUID};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic as WinCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// Last value seen per characteristic, shared with [`super::winrt::WinRtAdapter`]
pub type ValueCache = Arc<Mutex<HashMap<(Role, Uuid), Vec<u8>>>>;

fn from_guid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

pub struct PeripheralLink {
    role: Role,
    attempt: u64,
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    characteristics: HashMap<Uuid, WinCharacteristic>,
    subscriptions: HashMap<Uuid, i64>,
    status_token: i64,
    sender: AdapterEventSender,
    cache: ValueCache,
}

impl PeripheralLink {
    /// Open the device and keep its GATT session alive. With
    /// `auto_reconnect` the platform re-establishes a dropped link on its own.
    /// Events raised by the link are tagged with `attempt`.
    pub async fn open(
        role: Role,
        attempt: u64,
        address: u64,
        auto_reconnect: bool,
        sender: AdapterEventSender,
        cache: ValueCache,
    ) -> Result<Self> {
        info!("Connecting to {} at {:#X}", role, address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?
            .await
            .context("device not reachable")?;

        let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
            Ok(session) => {
                session.SetMaintainConnection(auto_reconnect)?;
                Some(session)
            }
            Err(e) => {
                warn!("No GattSession for {}: {}", role, e);
                None
            }
        };

        let status_sender = sender.clone();
        let status_token = device.ConnectionStatusChanged(&TypedEventHandler::new(
            move |device: Ref<BluetoothLEDevice>, _: Ref<IInspectable>| {
                if let Some(device) = device.as_ref() {
                    if device.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = status_sender
                            .send(AdapterEvent::new(role, SessionEvent::Disconnected { attempt }));
                    }
                }
                Ok(())
            },
        ))?;

        Ok(Self {
            role,
            attempt,
            device,
            session,
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
            status_token,
            sender,
            cache,
        })
    }

    /// Walk every service, characteristic and descriptor on the device
    pub async fn discover(&mut self) -> Result<Vec<GattService>> {
        let result = self.device.GetGattServicesAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            bail!("GetGattServices returned {:?}", result.Status()?);
        }

        let mut services = Vec::new();
        for service in result.Services()? {
            let chars = service.GetCharacteristicsAsync()?.await?;
            if chars.Status()? != GattCommunicationStatus::Success {
                warn!(
                    "{}: skipping service {:?} ({:?})",
                    self.role,
                    service.Uuid()?,
                    chars.Status()?
                );
                continue;
            }

            let mut characteristics = Vec::new();
            for characteristic in chars.Characteristics()? {
                let uuid = from_guid(characteristic.Uuid()?);
                let mut entry = GattCharacteristic::new(uuid);
                let descriptors = characteristic.GetDescriptorsAsync()?.await?;
                if descriptors.Status()? == GattCommunicationStatus::Success {
                    for descriptor in descriptors.Descriptors()? {
                        entry = entry.with_descriptor(from_guid(descriptor.Uuid()?));
                    }
                }
                characteristics.push(entry);
                self.characteristics.insert(uuid, characteristic);
            }

            services.push(GattService {
                uuid: from_guid(service.Uuid()?),
                characteristics,
            });
        }

        info!("{}: discovered {} services", self.role, services.len());
        Ok(services)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&WinCharacteristic> {
        self.characteristics
            .get(&uuid)
            .with_context(|| format!("characteristic {} not discovered", uuid))
    }

    /// Route value changes of `uuid` into the event channel
    pub fn subscribe(&mut self, uuid: Uuid, enabled: bool) -> Result<()> {
        let characteristic = self.characteristic(uuid)?.clone();

        if let Some(token) = self.subscriptions.remove(&uuid) {
            characteristic.RemoveValueChanged(token)?;
        }
        if !enabled {
            return Ok(());
        }

        let role = self.role;
        let attempt = self.attempt;
        let sender = self.sender.clone();
        let cache = self.cache.clone();
        let token = characteristic.ValueChanged(&TypedEventHandler::new(
            move |_: Ref<WinCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;

                    if let Ok(value) = protocol::decode_sensor_value(&bytes) {
                        if let Ok(mut cache) = cache.lock() {
                            cache.insert((role, uuid), bytes);
                        }
                        let _ = sender.send(AdapterEvent::new(
                            role,
                            SessionEvent::Notified { attempt, value },
                        ));
                    }
                }
                Ok(())
            },
        ))?;
        self.subscriptions.insert(uuid, token);
        Ok(())
    }

    /// Write the client configuration descriptor of `uuid`
    pub async fn write_config(&self, uuid: Uuid, value: &[u8]) -> Result<()> {
        let config = if value == ENABLE_NOTIFICATION_VALUE {
            GattClientCharacteristicConfigurationDescriptorValue::Notify
        } else {
            GattClientCharacteristicConfigurationDescriptorValue::None
        };
        let status = self
            .characteristic(uuid)?
            .WriteClientCharacteristicConfigurationDescriptorAsync(config)?
            .await?;
        if status != GattCommunicationStatus::Success {
            bail!("config descriptor write returned {:?}", status);
        }
        Ok(())
    }

    pub async fn write(&self, uuid: Uuid, value: &[u8], write_type: WriteType) -> Result<()> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(value)?;
        let buffer = writer.DetachBuffer()?;

        let option = match write_type {
            WriteType::WithResponse => GattWriteOption::WriteWithResponse,
            WriteType::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };
        let status = self
            .characteristic(uuid)?
            .WriteValueWithOptionAsync(&buffer, option)?
            .await?;
        if status != GattCommunicationStatus::Success {
            bail!("write to {} returned {:?}", uuid, status);
        }
        Ok(())
    }

    pub fn close(self) {
        info!("Closing {} link", self.role);
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        for (uuid, token) in &self.subscriptions {
            if let Some(characteristic) = self.characteristics.get(uuid) {
                let _ = characteristic.RemoveValueChanged(*token);
            }
        }
        if let Some(session) = &self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}
