//! Windows [`BleAdapter`]
//!
//! Each connected role gets its own task owning a [`PeripheralLink`].
//! Setup requests are queued to it in call order so that e.g. `set_notify`
//! and the descriptor write that follows are applied in sequence.
//! Characteristic writes go through a [`WriteSlot`] instead: a slow link
//! skips stale colors and always sends the newest one.

use crate::domain::error::AdapterError;
use crate::domain::models::{Role, ScannedDevice};
use crate::infrastructure::bluetooth::adapter::{
    AdapterEvent, AdapterEventSender, BleAdapter, SessionEvent,
};
use crate::infrastructure::bluetooth::connection::{PeripheralLink, ValueCache};
use crate::infrastructure::bluetooth::protocol::WriteType;
use crate::infrastructure::bluetooth::scanner::{parse_address, AdvertisementScanner};
use crate::infrastructure::bluetooth::write_slot::{
    write_slot, PendingWrite, WriteSlot, WriteSlotReceiver,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug)]
enum LinkRequest {
    Discover,
    Notify {
        characteristic: Uuid,
        enabled: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Close,
}

struct LinkHandle {
    requests: mpsc::UnboundedSender<LinkRequest>,
    writes: WriteSlot,
}

/// Everything a link task needs besides its inboxes
struct LinkParams {
    role: Role,
    attempt: u64,
    address: u64,
    auto_reconnect: bool,
    events: AdapterEventSender,
    cache: ValueCache,
}

pub struct WinRtAdapter {
    runtime: Handle,
    events: AdapterEventSender,
    scanners: Mutex<HashMap<Role, AdvertisementScanner>>,
    links: Mutex<HashMap<Role, LinkHandle>>,
    cache: ValueCache,
}

fn platform<E: std::fmt::Display>(e: E) -> AdapterError {
    AdapterError::Platform(e.to_string())
}

impl WinRtAdapter {
    /// Link tasks are spawned on `runtime`
    pub fn new(runtime: Handle, events: AdapterEventSender) -> Self {
        Self {
            runtime,
            events,
            scanners: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            cache: ValueCache::default(),
        }
    }

    fn scanners(&self) -> Result<MutexGuard<'_, HashMap<Role, AdvertisementScanner>>, AdapterError> {
        self.scanners.lock().map_err(platform)
    }

    fn links(&self) -> Result<MutexGuard<'_, HashMap<Role, LinkHandle>>, AdapterError> {
        self.links.lock().map_err(platform)
    }

    fn request(&self, role: Role, request: LinkRequest) -> Result<(), AdapterError> {
        let links = self.links()?;
        let link = links.get(&role).ok_or(AdapterError::NotConnected)?;
        link.requests
            .send(request)
            .map_err(|_| AdapterError::NotConnected)
    }
}

async fn run_link(
    params: LinkParams,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    mut writes: WriteSlotReceiver,
) {
    let LinkParams {
        role,
        attempt,
        address,
        auto_reconnect,
        events,
        cache,
    } = params;
    let send = |kind: SessionEvent| {
        let _ = events.send(AdapterEvent::new(role, kind));
    };

    let mut link = match PeripheralLink::open(
        role,
        attempt,
        address,
        auto_reconnect,
        events.clone(),
        cache.clone(),
    )
    .await
    {
        Ok(link) => {
            send(SessionEvent::Connected { attempt });
            link
        }
        Err(e) => {
            error!("{} connect failed: {:#}", role, e);
            send(SessionEvent::ConnectFailed {
                attempt,
                reason: format!("{:#}", e),
            });
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            request = requests.recv() => match request {
                Some(LinkRequest::Discover) => match link.discover().await {
                    Ok(services) => send(SessionEvent::ServicesReady { attempt, services }),
                    Err(e) => send(SessionEvent::ServiceDiscoveryFailed {
                        attempt,
                        reason: format!("{:#}", e),
                    }),
                },
                Some(LinkRequest::Notify { characteristic, enabled }) => {
                    if let Err(e) = link.subscribe(characteristic, enabled) {
                        warn!("{} subscribe to {} failed: {:#}", role, characteristic, e);
                    }
                }
                Some(LinkRequest::WriteDescriptor { characteristic, value }) => {
                    if let Err(e) = link.write_config(characteristic, &value).await {
                        warn!("{} descriptor write failed: {:#}", role, e);
                    }
                }
                Some(LinkRequest::Close) | None => break,
            },
            Some(write) = writes.next() => {
                let PendingWrite { characteristic, value, write_type } = write;
                match link.write(characteristic, &value, write_type).await {
                    Ok(()) => {
                        if let Ok(mut cache) = cache.lock() {
                            cache.insert((role, characteristic), value);
                        }
                    }
                    Err(e) => warn!("{} write failed: {:#}", role, e),
                }
            }
        }
    }

    link.close();
    send(SessionEvent::Disconnected { attempt });
}

impl BleAdapter for WinRtAdapter {
    fn start_scan(&self, role: Role, name: &str) -> Result<(), AdapterError> {
        let scanner =
            AdvertisementScanner::start(role, name, self.events.clone()).map_err(platform)?;
        if let Some(previous) = self.scanners()?.insert(role, scanner) {
            let _ = previous.stop();
        }
        Ok(())
    }

    fn stop_scan(&self, role: Role) -> Result<(), AdapterError> {
        match self.scanners()?.remove(&role) {
            Some(scanner) => scanner.stop().map_err(platform),
            None => Ok(()),
        }
    }

    fn connect(
        &self,
        role: Role,
        device: &ScannedDevice,
        auto_reconnect: bool,
        attempt: u64,
    ) -> Result<(), AdapterError> {
        let address = parse_address(&device.address)
            .ok_or_else(|| AdapterError::UnknownPeripheral(device.address.clone()))?;

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (writes, writes_rx) = write_slot();
        if let Some(previous) = self.links()?.insert(role, LinkHandle { requests, writes }) {
            let _ = previous.requests.send(LinkRequest::Close);
        }
        let params = LinkParams {
            role,
            attempt,
            address,
            auto_reconnect,
            events: self.events.clone(),
            cache: self.cache.clone(),
        };
        self.runtime.spawn(run_link(params, requests_rx, writes_rx));
        Ok(())
    }

    fn discover_services(&self, role: Role) -> Result<(), AdapterError> {
        self.request(role, LinkRequest::Discover)
    }

    fn set_notify(
        &self,
        role: Role,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), AdapterError> {
        self.request(
            role,
            LinkRequest::Notify {
                characteristic,
                enabled,
            },
        )
    }

    fn write_descriptor(
        &self,
        role: Role,
        characteristic: Uuid,
        _descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), AdapterError> {
        self.request(
            role,
            LinkRequest::WriteDescriptor {
                characteristic,
                value: value.to_vec(),
            },
        )
    }

    fn write_characteristic(
        &self,
        role: Role,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), AdapterError> {
        let links = self.links()?;
        let link = links.get(&role).ok_or(AdapterError::NotConnected)?;
        let queued = link.writes.put(PendingWrite {
            characteristic,
            value: value.to_vec(),
            write_type,
        });
        if queued {
            Ok(())
        } else {
            Err(AdapterError::NotConnected)
        }
    }

    fn read_characteristic(&self, role: Role, characteristic: Uuid) -> Result<Vec<u8>, AdapterError> {
        let cache = self.cache.lock().map_err(platform)?;
        cache
            .get(&(role, characteristic))
            .cloned()
            .ok_or(AdapterError::CharacteristicNotFound(characteristic))
    }

    fn disconnect(&self, role: Role) -> Result<(), AdapterError> {
        let link = self.links()?.remove(&role).ok_or(AdapterError::NotConnected)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.retain(|(r, _), _| *r != role);
        }
        link.requests
            .send(LinkRequest::Close)
            .map_err(|_| AdapterError::NotConnected)
    }
}
