use crate::device::types::{
    ConnectionHandle, PeripheralAddress, ScanEventSender, TargetCharacteristic, TransportEventSender,
};
use crate::error::DeviceError;

/// Radio capability the protocol runs on.
///
/// Requests never block: an `Ok` return only means the request was accepted. Every accepted
/// request later posts its completion to the scan channel for scanning, and to the channel given
/// to [`Transport::connect`] for everything else on that connection. A completion may carry a
/// non-success status and be followed by a later success for the same request. An `Err` return
/// means no completion event will follow.
pub trait Transport: Send + Sync + 'static {
    fn start_scan(&self, events: ScanEventSender) -> Result<(), DeviceError>;

    fn stop_scan(&self) -> Result<(), DeviceError>;

    /// Allocates a handle for the connection before anything is sent over the air, so that the
    /// caller can release it on every exit path, including a connect that never completes.
    fn connect(&self, address: &PeripheralAddress, events: TransportEventSender) -> Result<ConnectionHandle, DeviceError>;

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), DeviceError>;

    fn write_characteristic(&self, handle: ConnectionHandle, target: &TargetCharacteristic, payload: Vec<u8>) -> Result<(), DeviceError>;

    fn read_characteristic(&self, handle: ConnectionHandle, target: &TargetCharacteristic) -> Result<(), DeviceError>;

    /// Tears down the link. Does not post a completion event.
    fn disconnect(&self, handle: ConnectionHandle);

    /// Forgets the handle. Any completion still in flight for it is dropped.
    fn close(&self, handle: ConnectionHandle);
}
