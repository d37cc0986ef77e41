use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use log::{debug, info};

use crate::device::deadline::Deadline;
use crate::device::transport::Transport;
use crate::device::types::{
    ConnectionHandle, PeripheralAddress, SequenceState, Stage, TargetCharacteristic, TransportEvent,
    TransportEventSender,
};
use crate::error::DeviceError;

/// Everything one operation owns while it talks to a peripheral: the event channel of its
/// connection, its deadline and its [`SequenceState`].
pub struct Session<'a, T: Transport + ?Sized> {
    pub transport: &'a T,
    pub target: TargetCharacteristic,
    pub deadline: Deadline,
    pub state: SequenceState,
    // kept so the channel stays open while the session is alive, even if the transport drops
    // its sender after rejecting a request
    events_tx: TransportEventSender,
    events: UnboundedReceiver<TransportEvent>,
}

impl<'a, T: Transport + ?Sized> Session<'a, T> {
    pub fn new(transport: &'a T, target: TargetCharacteristic, deadline: Deadline) -> Self {
        let (events_tx, events) = unbounded();
        let state = SequenceState::new(deadline.started_at());

        Session {
            transport,
            target,
            deadline,
            state,
            events_tx,
            events,
        }
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.state.handle
    }

    pub(crate) fn connect(&mut self, address: &PeripheralAddress) -> Result<ConnectionHandle, DeviceError> {
        let handle = self.transport.connect(address, self.events_tx.clone())?;
        self.state.handle = Some(handle);
        Ok(handle)
    }

    /// Consumes completion events in order until `accept` returns a value. Events it does not
    /// accept are dropped, it is up to `accept` to log them.
    pub(crate) async fn wait_for<R>(&mut self, stage: Stage, mut accept: impl FnMut(TransportEvent) -> Option<R>) -> Result<R, DeviceError> {
        loop {
            let event = self.deadline.next_event(&mut self.events, stage).await?;
            if let Some(result) = accept(event) {
                return Ok(result);
            }
        }
    }

    /// Disconnects and closes the connection handle, if one was allocated. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(handle) = self.state.handle.take() {
            info!("Releasing connection {:?}", handle);
            self.transport.disconnect(handle);
            self.transport.close(handle);
        } else {
            debug!("No connection to release");
        }

        self.state.connected = false;
        self.state.discovered = false;
    }
}
