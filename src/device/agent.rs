use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use futures::channel::oneshot;
use log::{info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::{ConfigValue, ProtocolConfig};
use crate::device::connection::establish;
use crate::device::deadline::Deadline;
use crate::device::scanner::PeripheralScanner;
use crate::device::session::Session;
use crate::device::transport::Transport;
use crate::device::types::{PeripheralAddress, VerifyReport};
use crate::device::write_verify::write_verify;
use crate::error::DeviceError;

pub type Completion = Box<dyn FnOnce(bool) + Send + 'static>;

struct ActiveOperation {
    id: u64,
    cancel: CancellationToken,
    // dropping the handle detaches the task, it still runs its cleanup
    _task: JoinHandle<()>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveOperation>>>;

/// Converts percentages to the single-byte payloads the peripheral expects.
pub fn payload_bytes(values: &[ConfigValue]) -> Result<Vec<u8>, DeviceError> {
    values
        .iter()
        .enumerate()
        .map(|(index, config_value)| {
            u8::try_from(config_value.value).map_err(|_| DeviceError::ValueOutOfRange { index, value: config_value.value })
        })
        .collect()
}

async fn run_sequence<T: Transport + ?Sized>(session: &mut Session<'_, T>, address: &PeripheralAddress, protocol: &ProtocolConfig, payload: &[u8]) -> Result<VerifyReport, DeviceError> {
    let link = establish(session, address).await?;
    write_verify(session, &link, protocol.priming_byte, payload, protocol.settle_delay()).await
}

struct OperationRequest {
    id: u64,
    address: PeripheralAddress,
    payload: Vec<u8>,
    cancel: CancellationToken,
    callback: Completion,
}

async fn run_operation<T: Transport + ?Sized>(transport: Arc<T>, protocol: ProtocolConfig, active: ActiveSlot, request: OperationRequest) {
    let OperationRequest { id, address, payload, cancel, callback } = request;
    let deadline = Deadline::new(protocol.operation_timeout(), cancel);
    let mut session = Session::new(&*transport, protocol.target(), deadline);

    let success = match run_sequence(&mut session, &address, &protocol, &payload).await {
        Ok(report) => {
            info!("Configuration written to {} ({} steps, {} mismatches)", address, report.steps, report.mismatches.len());
            true
        },
        Err(err) => {
            warn!("Writing configuration to {} failed: {}", address, err);
            false
        },
    };

    // release the connection and the slot before anyone hears about the result
    session.release();
    drop(session);

    {
        let mut active = active.lock().expect("Failed to lock active operation");
        if active.as_ref().map(|operation| operation.id) == Some(id) {
            *active = None;
        }
    }

    callback(success);
}

/// Runs configuration writes against one transport, at most one at a time.
pub struct ConfigAgent<T: Transport + ?Sized> {
    transport: Arc<T>,
    protocol: ProtocolConfig,
    runtime: Handle,
    active: ActiveSlot,
    next_id: AtomicU64,
    scanner: PeripheralScanner<T>,
}

impl<T: Transport + ?Sized> ConfigAgent<T> {
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn new(transport: Arc<T>) -> Self {
        ConfigAgent::with_config(transport, ProtocolConfig::default())
    }

    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn with_config(transport: Arc<T>, protocol: ProtocolConfig) -> Self {
        ConfigAgent {
            scanner: PeripheralScanner::new(transport.clone()),
            transport,
            protocol,
            runtime: Handle::current(),
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn scanner(&self) -> &PeripheralScanner<T> {
        &self.scanner
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().expect("Failed to lock active operation").is_some()
    }

    /// Starts writing `values` to the peripheral at `address` in the background and returns
    /// immediately. `callback` is called exactly once, after the connection has been released.
    ///
    /// The values are expected to be validated already; they are only checked to fit in a byte.
    pub fn submit<F>(&self, values: &[ConfigValue], address: PeripheralAddress, callback: F) -> Result<(), DeviceError>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let payload = payload_bytes(values)?;

        let mut active = self.active.lock().expect("Failed to lock active operation");
        if active.is_some() {
            return Err(DeviceError::InvalidState("attempt to submit while an operation is active"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        info!("Starting operation {}: writing {:?} to {}", id, payload, address);

        let request = OperationRequest {
            id,
            address,
            payload,
            cancel: cancel.clone(),
            callback: Box::new(callback),
        };
        let task = self.runtime.spawn(run_operation(self.transport.clone(), self.protocol.clone(), self.active.clone(), request));

        *active = Some(ActiveOperation { id, cancel, _task: task });
        Ok(())
    }

    /// Submits and waits for the result.
    pub async fn write_configuration(&self, values: &[ConfigValue], address: PeripheralAddress) -> Result<bool, DeviceError> {
        let (tx, rx) = oneshot::channel::<bool>();
        self.submit(values, address, move |success| {
            let _ = tx.send(success);
        })?;

        Ok(rx.await.unwrap_or(false))
    }

    /// Asks the active operation, if any, to clean up and report failure. Returns whether there
    /// was an operation to cancel.
    pub fn cancel_active_operation(&self) -> bool {
        let active = self.active.lock().expect("Failed to lock active operation");
        match active.as_ref() {
            Some(operation) => {
                info!("Cancelling operation {}", operation.id);
                operation.cancel.cancel();
                true
            },
            None => false,
        }
    }
}

impl<T: Transport + ?Sized> Drop for ConfigAgent<T> {
    fn drop(&mut self) {
        if let Ok(active) = self.active.lock() {
            if let Some(operation) = active.as_ref() {
                operation.cancel.cancel();
            }
        }
    }
}
