use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::{debug, info};
use tokio::spawn;
use tokio::time::sleep;
use uuid::Uuid;

use crate::device::constants::{CONFIG_SERVICE_UUID, CONFIG_VALUE_CHARACTERISTIC_UUID, SIMULATED_LATENCY};
use crate::device::transport::Transport;
use crate::device::types::{
    ConnectionHandle, LinkState, PeripheralAddress, ScanEvent, ScanEventSender, ServiceInfo, Stage,
    TargetCharacteristic, TransportEvent, TransportEventSender,
};
use crate::error::DeviceError;

const GENERIC_ACCESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
const DEVICE_NAME_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// A request kind the simulated peripheral can be told to never complete, or to refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedStage {
    Scan,
    Connect,
    Discovery,
    Write,
    Read,
}

impl From<SimulatedStage> for Stage {
    fn from(stage: SimulatedStage) -> Self {
        match stage {
            SimulatedStage::Scan => Stage::Scanning,
            SimulatedStage::Connect => Stage::Connecting,
            SimulatedStage::Discovery => Stage::DiscoveringServices,
            SimulatedStage::Write => Stage::Writing,
            SimulatedStage::Read => Stage::Reading,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    pub name: Option<String>,
    pub address: PeripheralAddress,
}

struct Connection {
    events: TransportEventSender,
    connected: bool,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    connections: HashMap<ConnectionHandle, Connection>,
    issued_handles: Vec<ConnectionHandle>,
    scanning: bool,
    // None while scanning means the stream was closed under the scanner
    scan: Option<ScanEventSender>,
    connect_failures_left: usize,
    discovery_failures_left: usize,
    write_failures_left: usize,
    read_failures_left: usize,
    value: u8,
    written: Vec<u8>,
}

pub struct SimulatedPeripheralBuilder {
    name: String,
    address: PeripheralAddress,
    decoys: Vec<AdvertisedDevice>,
    has_target: bool,
    connect_failures: usize,
    discovery_failures: usize,
    write_failures: usize,
    read_failures: usize,
    stall: Option<SimulatedStage>,
    reject: Option<SimulatedStage>,
    scan_aborts: bool,
    corrupt_reads: Vec<usize>,
    latency: Duration,
}

impl SimulatedPeripheralBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn address(mut self, address: &str) -> Self {
        self.address = PeripheralAddress::new(address);
        self
    }

    /// Another device that shows up while scanning but cannot be connected to.
    pub fn decoy(mut self, name: Option<&str>, address: &str) -> Self {
        self.decoys.push(AdvertisedDevice {
            name: name.map(String::from),
            address: PeripheralAddress::new(address),
        });
        self
    }

    pub fn without_target_characteristic(mut self) -> Self {
        self.has_target = false;
        self
    }

    /// Report this many failed connection attempts before the successful one.
    pub fn connect_failures(mut self, count: usize) -> Self {
        self.connect_failures = count;
        self
    }

    /// The first service discovery reports this many failures before the services.
    pub fn discovery_failures(mut self, count: usize) -> Self {
        self.discovery_failures = count;
        self
    }

    /// The first write reports this many failures before it succeeds.
    pub fn write_failures(mut self, count: usize) -> Self {
        self.write_failures = count;
        self
    }

    /// The first read reports this many failures before the value.
    pub fn read_failures(mut self, count: usize) -> Self {
        self.read_failures = count;
        self
    }

    pub fn stall_at(mut self, stage: SimulatedStage) -> Self {
        self.stall = Some(stage);
        self
    }

    /// Refuse every request of this kind up front, without posting anything.
    pub fn reject_at(mut self, stage: SimulatedStage) -> Self {
        self.reject = Some(stage);
        self
    }

    /// Accept scans but close the scan stream right away, like an adapter that fails after
    /// starting.
    pub fn scan_aborts(mut self) -> Self {
        self.scan_aborts = true;
        self
    }

    /// Read back a wrong value after the write at `step` (0 is the first byte this peripheral ever receives).
    pub fn corrupt_read_at(mut self, step: usize) -> Self {
        self.corrupt_reads.push(step);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn build(self) -> SimulatedPeripheral {
        let inner = Inner {
            connect_failures_left: self.connect_failures,
            discovery_failures_left: self.discovery_failures,
            write_failures_left: self.write_failures,
            read_failures_left: self.read_failures,
            ..Inner::default()
        };

        SimulatedPeripheral {
            name: self.name,
            address: self.address,
            decoys: self.decoys,
            has_target: self.has_target,
            connect_failures: self.connect_failures,
            stall: self.stall,
            reject: self.reject,
            scan_aborts: self.scan_aborts,
            corrupt_reads: self.corrupt_reads,
            latency: self.latency,
            inner: Arc::new(Mutex::new(inner)),
        }
    }
}

/// An in-process peripheral that completes requests the way a cooperative device would.
/// It records every byte written to the configuration characteristic and every connection
/// handle that is still open.
pub struct SimulatedPeripheral {
    name: String,
    address: PeripheralAddress,
    decoys: Vec<AdvertisedDevice>,
    has_target: bool,
    connect_failures: usize,
    stall: Option<SimulatedStage>,
    reject: Option<SimulatedStage>,
    scan_aborts: bool,
    corrupt_reads: Vec<usize>,
    latency: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedPeripheral {
    pub fn builder() -> SimulatedPeripheralBuilder {
        SimulatedPeripheralBuilder {
            name: String::from("SensorTag"),
            address: PeripheralAddress::new("34:B1:F7:D1:35:03"),
            decoys: Vec::new(),
            has_target: true,
            connect_failures: 0,
            discovery_failures: 0,
            write_failures: 0,
            read_failures: 0,
            stall: None,
            reject: None,
            scan_aborts: false,
            corrupt_reads: Vec::new(),
            latency: Duration::from_millis(SIMULATED_LATENCY),
        }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every byte written so far, in order.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().expect("Failed to lock SimulatedPeripheral inner").written.clone()
    }

    pub fn open_handles(&self) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
        let mut handles: Vec<ConnectionHandle> = inner.connections.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn issued_handles(&self) -> Vec<ConnectionHandle> {
        self.inner.lock().expect("Failed to lock SimulatedPeripheral inner").issued_handles.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().expect("Failed to lock SimulatedPeripheral inner").scanning
    }

    fn advertised(&self) -> Vec<AdvertisedDevice> {
        let mut devices = self.decoys.clone();
        devices.push(AdvertisedDevice {
            name: Some(self.name.clone()),
            address: self.address.clone(),
        });
        devices
    }

    fn services(&self) -> Vec<ServiceInfo> {
        let characteristic = if self.has_target {
            CONFIG_VALUE_CHARACTERISTIC_UUID
        } else {
            Uuid::from_u128(CONFIG_VALUE_CHARACTERISTIC_UUID.as_u128() + 1)
        };

        vec![
            ServiceInfo {
                uuid: GENERIC_ACCESS_SERVICE_UUID,
                characteristics: vec![DEVICE_NAME_CHARACTERISTIC_UUID],
            },
            ServiceInfo {
                uuid: CONFIG_SERVICE_UUID,
                characteristics: vec![characteristic],
            },
        ]
    }

    fn check_rejected(&self, stage: SimulatedStage) -> Result<(), DeviceError> {
        if self.reject == Some(stage) {
            return Err(DeviceError::TransportFailure {
                stage: stage.into(),
                reason: String::from("request refused by simulated peripheral"),
            });
        }
        Ok(())
    }

    /// Failures to report before the completion of this request. Only the first request of a
    /// kind fails, unless the budget is reset.
    fn take_failures(&self, budget: impl FnOnce(&mut Inner) -> &mut usize) -> usize {
        let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
        std::mem::take(budget(&mut *inner))
    }

    fn stalls(&self, stage: SimulatedStage) -> bool {
        if self.stall == Some(stage) {
            debug!("Simulated peripheral never completes {:?}", stage);
            return true;
        }
        false
    }

    /// Delivers `events` in order to the connection, unless it is closed by then.
    fn post(&self, handle: ConnectionHandle, events: Vec<TransportEvent>) {
        let inner = self.inner.clone();
        let deliver = move || {
            let mut guard = inner.lock().expect("Failed to lock SimulatedPeripheral inner");
            let Some(connection) = guard.connections.get_mut(&handle) else {
                debug!("Dropping events for closed connection {:?}", handle);
                return;
            };

            for event in events {
                if let TransportEvent::ConnectionStateChanged(Ok(state)) = &event {
                    connection.connected = *state == LinkState::Connected;
                }
                // the receiving session may already be gone, which is fine
                let _ = connection.events.unbounded_send(event);
            }
        };

        if self.latency.is_zero() {
            deliver();
        } else {
            let latency = self.latency;
            spawn(async move {
                sleep(latency).await;
                deliver();
            });
        }
    }

    fn check_connected(&self, handle: ConnectionHandle) -> Result<(), DeviceError> {
        let inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
        match inner.connections.get(&handle) {
            None => Err(DeviceError::UnknownHandle),
            Some(connection) if !connection.connected => Err(DeviceError::InvalidState("not connected")),
            Some(_) => Ok(()),
        }
    }

    fn check_target(&self, target: &TargetCharacteristic) -> Option<TransportEvent> {
        if self.has_target && target.characteristic == CONFIG_VALUE_CHARACTERISTIC_UUID {
            return None;
        }
        Some(TransportEvent::CharacteristicWritten(Err(format!("no characteristic {}", target.characteristic))))
    }
}

impl Transport for SimulatedPeripheral {
    fn start_scan(&self, events: ScanEventSender) -> Result<(), DeviceError> {
        self.check_rejected(SimulatedStage::Scan)?;

        {
            let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
            if inner.scanning {
                return Err(DeviceError::InvalidState("already scanning"));
            }
            inner.scanning = true;

            if self.scan_aborts {
                debug!("Simulated scan stream closes right away");
                return Ok(());
            }
            inner.scan = Some(events);
        }

        if self.stalls(SimulatedStage::Scan) {
            return Ok(());
        }

        let inner = self.inner.clone();
        let devices = self.advertised();
        let latency = self.latency;
        spawn(async move {
            for device in devices {
                sleep(latency).await;
                let guard = inner.lock().expect("Failed to lock SimulatedPeripheral inner");
                match &guard.scan {
                    Some(scan) => {
                        let _ = scan.unbounded_send(ScanEvent::Found { name: device.name, address: device.address });
                    },
                    None => break,
                }
            }
        });

        Ok(())
    }

    fn stop_scan(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
        if !inner.scanning {
            return Err(DeviceError::InvalidState("not scanning"));
        }
        inner.scanning = false;
        inner.scan = None;
        Ok(())
    }

    fn connect(&self, address: &PeripheralAddress, events: TransportEventSender) -> Result<ConnectionHandle, DeviceError> {
        self.check_rejected(SimulatedStage::Connect)?;

        let handle = {
            let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
            inner.next_handle += 1;
            let handle = ConnectionHandle(inner.next_handle);
            inner.connections.insert(handle, Connection { events, connected: false });
            inner.issued_handles.push(handle);
            handle
        };
        info!("Simulated connect to {} as {:?}", address, handle);

        if *address != self.address {
            self.post(handle, vec![TransportEvent::ConnectionStateChanged(Err(format!("no peripheral at {}", address)))]);
            return Ok(handle);
        }

        if self.stalls(SimulatedStage::Connect) {
            return Ok(handle);
        }

        let failures = self.take_failures(|inner| &mut inner.connect_failures_left);

        let mut events: Vec<TransportEvent> = (0..failures)
            .map(|_| TransportEvent::ConnectionStateChanged(Err(String::from("status 133"))))
            .collect();
        events.push(TransportEvent::ConnectionStateChanged(Ok(LinkState::Connected)));
        self.post(handle, events);

        Ok(handle)
    }

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), DeviceError> {
        self.check_rejected(SimulatedStage::Discovery)?;
        self.check_connected(handle)?;

        if self.stalls(SimulatedStage::Discovery) {
            return Ok(());
        }

        let failures = self.take_failures(|inner| &mut inner.discovery_failures_left);
        let mut events: Vec<TransportEvent> = (0..failures)
            .map(|_| TransportEvent::ServicesDiscovered(Err(String::from("status 129"))))
            .collect();
        events.push(TransportEvent::ServicesDiscovered(Ok(self.services())));
        self.post(handle, events);
        Ok(())
    }

    fn write_characteristic(&self, handle: ConnectionHandle, target: &TargetCharacteristic, payload: Vec<u8>) -> Result<(), DeviceError> {
        self.check_rejected(SimulatedStage::Write)?;
        self.check_connected(handle)?;

        if let Some(failure) = self.check_target(target) {
            self.post(handle, vec![failure]);
            return Ok(());
        }

        if self.stalls(SimulatedStage::Write) {
            return Ok(());
        }

        {
            let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
            if let Some(last) = payload.last() {
                inner.value = *last;
            }
            inner.written.extend_from_slice(&payload);
        }

        let failures = self.take_failures(|inner| &mut inner.write_failures_left);
        let mut events: Vec<TransportEvent> = (0..failures)
            .map(|_| TransportEvent::CharacteristicWritten(Err(String::from("status 133"))))
            .collect();
        events.push(TransportEvent::CharacteristicWritten(Ok(target.characteristic)));
        self.post(handle, events);
        Ok(())
    }

    fn read_characteristic(&self, handle: ConnectionHandle, target: &TargetCharacteristic) -> Result<(), DeviceError> {
        self.check_rejected(SimulatedStage::Read)?;
        self.check_connected(handle)?;

        if self.check_target(target).is_some() {
            self.post(handle, vec![TransportEvent::CharacteristicRead(Err(format!("no characteristic {}", target.characteristic)))]);
            return Ok(());
        }

        if self.stalls(SimulatedStage::Read) {
            return Ok(());
        }

        let value = {
            let inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
            let step = inner.written.len().saturating_sub(1);
            if self.corrupt_reads.contains(&step) {
                inner.value.wrapping_add(1)
            } else {
                inner.value
            }
        };
        let failures = self.take_failures(|inner| &mut inner.read_failures_left);
        let mut events: Vec<TransportEvent> = (0..failures)
            .map(|_| TransportEvent::CharacteristicRead(Err(String::from("status 133"))))
            .collect();
        events.push(TransportEvent::CharacteristicRead(Ok((target.characteristic, vec![value]))));
        self.post(handle, events);
        Ok(())
    }

    fn disconnect(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
        if let Some(connection) = inner.connections.get_mut(&handle) {
            connection.connected = false;
        }
    }

    fn close(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().expect("Failed to lock SimulatedPeripheral inner");
        inner.connections.remove(&handle);
        // the next connection starts a fresh failure budget, like a device that was power cycled
        inner.connect_failures_left = self.connect_failures;
    }
}
