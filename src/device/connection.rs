use log::{debug, info, warn};

use crate::device::session::Session;
use crate::device::transport::Transport;
use crate::device::types::{
    ConnectionHandle, LinkState, PeripheralAddress, Stage, TargetCharacteristic, TransportEvent,
};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    DiscoveringServices,
    CharacteristicResolved {
        characteristic: TargetCharacteristic,
    },
}

/// A connected peripheral with its configuration characteristic resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub handle: ConnectionHandle,
    pub characteristic: TargetCharacteristic,
}

async fn advance_state<T: Transport + ?Sized>(state: ConnectionState, session: &mut Session<'_, T>, address: &PeripheralAddress) -> Result<ConnectionState, DeviceError> {
    match state {
        ConnectionState::Idle => {
            info!("Connecting to peripheral {}...", address);
            if let Err(err) = session.connect(address) {
                // nothing will complete this attempt; the deadline ends the operation
                warn!("Connect request was rejected: {}", err);
            }
            Ok(ConnectionState::Connecting)
        },
        ConnectionState::Connecting => {
            session.wait_for(Stage::Connecting, |event| match event {
                TransportEvent::ConnectionStateChanged(Ok(LinkState::Connected)) => Some(()),
                TransportEvent::ConnectionStateChanged(Ok(LinkState::Disconnected)) => {
                    info!("Peripheral reported disconnected; still waiting for a connection");
                    None
                },
                TransportEvent::ConnectionStateChanged(Err(reason)) => {
                    warn!("Connecting failed: {}", reason);
                    None
                },
                other => {
                    debug!("Ignoring {:?} while connecting", other);
                    None
                },
            }).await?;

            session.state.connected = true;
            Ok(ConnectionState::Connected)
        },
        ConnectionState::Connected => {
            info!("Connected; Discovering services...");
            let handle = session.handle().ok_or(DeviceError::InvalidState("connected without a connection handle"))?;
            if let Err(err) = session.transport.discover_services(handle) {
                warn!("Service discovery request was rejected: {}", err);
            }
            Ok(ConnectionState::DiscoveringServices)
        },
        ConnectionState::DiscoveringServices => {
            let services = session.wait_for(Stage::DiscoveringServices, |event| match event {
                TransportEvent::ServicesDiscovered(Ok(services)) => Some(services),
                TransportEvent::ServicesDiscovered(Err(reason)) => {
                    warn!("Service discovery failed: {}", reason);
                    None
                },
                TransportEvent::ConnectionStateChanged(Ok(LinkState::Disconnected)) => {
                    warn!("Connection lost during service discovery");
                    None
                },
                other => {
                    debug!("Ignoring {:?} while discovering services", other);
                    None
                },
            }).await?;

            session.state.discovered = true;
            debug!("Discovered {} services", services.len());

            match session.target.find_in(&services) {
                Some(characteristic) => Ok(ConnectionState::CharacteristicResolved { characteristic }),
                None => {
                    warn!("Service {} with characteristic {} not found on peripheral", session.target.service, session.target.characteristic);
                    Err(DeviceError::MissingCharacteristic)
                },
            }
        },
        ConnectionState::CharacteristicResolved { .. } => Ok(state),
    }
}

/// Drives the peripheral from idle to a resolved configuration characteristic.
///
/// Non-success statuses from the transport keep the state machine where it is; only the
/// session's deadline, cancellation, or a missing characteristic end it early.
pub async fn establish<T: Transport + ?Sized>(session: &mut Session<'_, T>, address: &PeripheralAddress) -> Result<Link, DeviceError> {
    let mut state = ConnectionState::Idle;

    loop {
        let new_state = advance_state(state, session, address).await?;
        debug!("Connection state: {:?}", new_state);

        if let ConnectionState::CharacteristicResolved { characteristic } = new_state {
            let handle = session.handle().ok_or(DeviceError::InvalidState("resolved without a connection handle"))?;
            info!("Peripheral ready");
            return Ok(Link { handle, characteristic });
        }

        state = new_state;
    }
}
