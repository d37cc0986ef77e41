use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::device::transport::Transport;
use crate::device::types::{
    ConnectionHandle, LinkState, PeripheralAddress, ScanEvent, ScanEventSender, ServiceInfo,
    TargetCharacteristic, TransportEvent, TransportEventSender,
};
use crate::error::DeviceError;

struct BtleConnection {
    events: TransportEventSender,
    // filled in once the address has been resolved to a platform peripheral
    peripheral: Option<Peripheral>,
}

type Connections = Arc<Mutex<HashMap<ConnectionHandle, BtleConnection>>>;

/// [`Transport`] on top of the platform's bluetooth stack, through btleplug.
pub struct BtleTransport {
    runtime: Handle,
    adapter: Adapter,
    connections: Connections,
    next_handle: AtomicU64,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

async fn find_peripheral(adapter: &Adapter, address: &PeripheralAddress) -> Result<Option<Peripheral>, DeviceError> {
    for peripheral in adapter.peripherals().await? {
        match peripheral.properties().await {
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
            },
            Ok(None) => {
                debug!("Peripheral has no properties");
            },
            Ok(Some(properties)) => {
                if PeripheralAddress::new(&properties.address.to_string()) == *address {
                    return Ok(Some(peripheral));
                }
            },
        }
    }

    Ok(None)
}

fn find_characteristic(peripheral: &Peripheral, target: &TargetCharacteristic) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.service_uuid == target.service && characteristic.uuid == target.characteristic)
}

/// Returns false if the connection was closed and the event dropped.
fn post(connections: &Mutex<HashMap<ConnectionHandle, BtleConnection>>, handle: ConnectionHandle, event: TransportEvent) -> bool {
    let connections = connections.lock().expect("Failed to lock btle connections");
    match connections.get(&handle) {
        Some(connection) => {
            let _ = connection.events.unbounded_send(event);
            true
        },
        None => {
            debug!("Dropping {:?} for closed connection {:?}", event, handle);
            false
        },
    }
}

/// Remembers the name each peripheral was last reported with. Advertisements keep coming in as
/// updates, and the name often only arrives with a later scan response.
struct Sightings<K> {
    names: HashMap<K, Option<String>>,
}

impl<K: Hash + Eq> Sightings<K> {
    fn new() -> Self {
        Sightings { names: HashMap::new() }
    }

    /// Whether this sighting is worth reporting: the peripheral is new or its name changed.
    fn is_news(&mut self, id: K, name: &Option<String>) -> bool {
        match self.names.get(&id) {
            Some(known) if known == name || name.is_none() => false,
            _ => {
                self.names.insert(id, name.clone());
                true
            },
        }
    }
}

impl BtleTransport {
    /// Uses the first bluetooth adapter of the platform.
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or(DeviceError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        Ok(BtleTransport {
            runtime: Handle::current(),
            adapter,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(1),
            scan_cancel: Mutex::new(None),
        })
    }

    fn peripheral(&self, handle: ConnectionHandle) -> Result<Peripheral, DeviceError> {
        let connections = self.connections.lock().expect("Failed to lock btle connections");
        let connection = connections.get(&handle).ok_or(DeviceError::UnknownHandle)?;
        connection.peripheral.clone().ok_or(DeviceError::InvalidState("peripheral not resolved yet"))
    }
}

impl Transport for BtleTransport {
    fn start_scan(&self, events: ScanEventSender) -> Result<(), DeviceError> {
        let mut scan_cancel = self.scan_cancel.lock().expect("Failed to lock btle scan");
        if scan_cancel.is_some() {
            return Err(DeviceError::InvalidState("already scanning"));
        }

        let cancel = CancellationToken::new();
        *scan_cancel = Some(cancel.clone());
        let adapter = self.adapter.clone();

        self.runtime.spawn(async move {
            let mut central_events = match adapter.events().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to subscribe to adapter events: {:?}", err);
                    return;
                },
            };

            if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Failed to start scanning: {:?}", err);
                return;
            }

            let mut sightings = Sightings::new();

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    Some(event) = central_events.next() => {
                        let id = match event {
                            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                            _ => continue,
                        };

                        let properties = match adapter.peripheral(&id).await {
                            Ok(peripheral) => peripheral.properties().await,
                            Err(err) => {
                                warn!("Failed to look up discovered peripheral: {:?}", err);
                                continue;
                            },
                        };

                        if let Ok(Some(properties)) = properties {
                            if !sightings.is_news(id, &properties.local_name) {
                                continue;
                            }

                            let event = ScanEvent::Found {
                                name: properties.local_name,
                                address: PeripheralAddress::new(&properties.address.to_string()),
                            };
                            if events.unbounded_send(event).is_err() {
                                break 'mainloop;
                            }
                        }
                    },
                }
            }

            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scanning: {:?}", err);
            }
        });

        Ok(())
    }

    fn stop_scan(&self) -> Result<(), DeviceError> {
        match self.scan_cancel.lock().expect("Failed to lock btle scan").take() {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            },
            None => Err(DeviceError::InvalidState("not scanning")),
        }
    }

    fn connect(&self, address: &PeripheralAddress, events: TransportEventSender) -> Result<ConnectionHandle, DeviceError> {
        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.connections.lock().expect("Failed to lock btle connections")
            .insert(handle, BtleConnection { events, peripheral: None });

        let adapter = self.adapter.clone();
        let connections = self.connections.clone();
        let address = address.clone();

        self.runtime.spawn(async move {
            let peripheral = match find_peripheral(&adapter, &address).await {
                Ok(Some(peripheral)) => peripheral,
                Ok(None) => {
                    post(&connections, handle, TransportEvent::ConnectionStateChanged(Err(format!("no peripheral at {}", address))));
                    return;
                },
                Err(err) => {
                    post(&connections, handle, TransportEvent::ConnectionStateChanged(Err(err.to_string())));
                    return;
                },
            };

            match connections.lock().expect("Failed to lock btle connections").get_mut(&handle) {
                Some(connection) => connection.peripheral = Some(peripheral.clone()),
                // closed while we were looking
                None => return,
            }

            match peripheral.connect().await {
                Ok(()) => {
                    let event = TransportEvent::ConnectionStateChanged(Ok(LinkState::Connected));
                    if !post(&connections, handle, event) {
                        // the operation gave up while the link was coming up
                        info!("Connected after the connection was closed; disconnecting");
                        if let Err(err) = peripheral.disconnect().await {
                            warn!("Failed to disconnect: {:?}", err);
                        }
                    }
                },
                Err(err) => {
                    post(&connections, handle, TransportEvent::ConnectionStateChanged(Err(err.to_string())));
                },
            }
        });

        Ok(handle)
    }

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(handle)?;
        let connections = self.connections.clone();

        self.runtime.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral.services().into_iter()
                        .map(|service| ServiceInfo {
                            uuid: service.uuid,
                            characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
                        })
                        .collect();
                    TransportEvent::ServicesDiscovered(Ok(services))
                },
                Err(err) => TransportEvent::ServicesDiscovered(Err(err.to_string())),
            };
            post(&connections, handle, event);
        });

        Ok(())
    }

    fn write_characteristic(&self, handle: ConnectionHandle, target: &TargetCharacteristic, payload: Vec<u8>) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(handle)?;
        let characteristic = find_characteristic(&peripheral, target).ok_or(DeviceError::MissingCharacteristic)?;
        let connections = self.connections.clone();

        self.runtime.spawn(async move {
            let event = match peripheral.write(&characteristic, &payload, WriteType::WithResponse).await {
                Ok(()) => TransportEvent::CharacteristicWritten(Ok(characteristic.uuid)),
                Err(err) => TransportEvent::CharacteristicWritten(Err(err.to_string())),
            };
            post(&connections, handle, event);
        });

        Ok(())
    }

    fn read_characteristic(&self, handle: ConnectionHandle, target: &TargetCharacteristic) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(handle)?;
        let characteristic = find_characteristic(&peripheral, target).ok_or(DeviceError::MissingCharacteristic)?;
        let connections = self.connections.clone();

        self.runtime.spawn(async move {
            let event = match peripheral.read(&characteristic).await {
                Ok(value) => TransportEvent::CharacteristicRead(Ok((characteristic.uuid, value))),
                Err(err) => TransportEvent::CharacteristicRead(Err(err.to_string())),
            };
            post(&connections, handle, event);
        });

        Ok(())
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        let Ok(peripheral) = self.peripheral(handle) else {
            return;
        };

        self.runtime.spawn(async move {
            if let Err(err) = peripheral.disconnect().await {
                warn!("Failed to disconnect: {:?}", err);
            }
        });
    }

    fn close(&self, handle: ConnectionHandle) {
        self.connections.lock().expect("Failed to lock btle connections").remove(&handle);
    }
}
