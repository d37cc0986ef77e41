use std::fmt;
use std::str::FromStr;
use futures::channel::mpsc::UnboundedSender;
use tokio::time::Instant;
use uuid::Uuid;

use crate::device::constants::{CONFIG_SERVICE_UUID, CONFIG_VALUE_CHARACTERISTIC_UUID};

/// The step of an operation that is waiting for the transport. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Scanning,
    Connecting,
    DiscoveringServices,
    Writing,
    Reading,
    Settling,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            Stage::Scanning => "scanning",
            Stage::Connecting => "connecting",
            Stage::DiscoveringServices => "discovering services",
            Stage::Writing => "writing",
            Stage::Reading => "reading",
            Stage::Settling => "settling",
        };

        write!(f, "{}", result)
    }
}

/// Hardware address of a peripheral, e.g. `34:B1:F7:D1:35:03`. Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    pub fn new(address: &str) -> Self {
        PeripheralAddress(address.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeripheralAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeripheralAddress::new(s))
    }
}

/// Opaque transport-level handle of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// The characteristic configuration values are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetCharacteristic {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl TargetCharacteristic {
    /// Linear scan of discovered services. UUIDs are compared as values, so the textual case the
    /// peripheral reports them in does not matter.
    pub fn find_in(&self, services: &[ServiceInfo]) -> Option<TargetCharacteristic> {
        services
            .iter()
            .filter(|service| service.uuid == self.service)
            .flat_map(|service| service.characteristics.iter())
            .find(|characteristic| **characteristic == self.characteristic)
            .map(|_| *self)
    }
}

impl Default for TargetCharacteristic {
    fn default() -> Self {
        TargetCharacteristic {
            service: CONFIG_SERVICE_UUID,
            characteristic: CONFIG_VALUE_CHARACTERISTIC_UUID,
        }
    }
}

/// Completion of a request previously issued to a [`crate::device::transport::Transport`].
/// `Err` carries the transport's description of a non-success status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged(Result<LinkState, String>),
    ServicesDiscovered(Result<Vec<ServiceInfo>, String>),
    CharacteristicWritten(Result<Uuid, String>),
    CharacteristicRead(Result<(Uuid, Vec<u8>), String>),
}

pub type TransportEventSender = UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Found {
        name: Option<String>,
        address: PeripheralAddress,
    },
}

pub type ScanEventSender = UnboundedSender<ScanEvent>;

/// Identity a scan is looking for. Matches either the advertised `"<name> <address>"` string
/// or the bare address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget(String);

impl ScanTarget {
    pub fn new(target: &str) -> Self {
        ScanTarget(target.trim().to_string())
    }

    pub fn matches(&self, name: Option<&str>, address: &PeripheralAddress) -> bool {
        if self.0.eq_ignore_ascii_case(address.as_str()) {
            return true;
        }

        match name {
            Some(name) => {
                let identity = format!("{} {}", name, address);
                identity.eq_ignore_ascii_case(&self.0)
            },
            None => false,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanState {
    pub scanning: bool,
    pub matched_address: Option<PeripheralAddress>,
}

/// Mutable state of the operation in flight. Owned by the operation task and dropped with it.
#[derive(Debug, Clone)]
pub struct SequenceState {
    pub handle: Option<ConnectionHandle>,
    pub connected: bool,
    pub discovered: bool,
    pub written: bool,
    pub read: bool,
    pub last_byte_read: Option<u8>,
    pub start_time: Instant,
}

impl SequenceState {
    pub fn new(start_time: Instant) -> Self {
        SequenceState {
            handle: None,
            connected: false,
            discovered: false,
            written: false,
            read: false,
            last_byte_read: None,
            start_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub step: usize,
    pub written: u8,
    pub read: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub steps: usize,
    pub mismatches: Vec<Mismatch>,
}
