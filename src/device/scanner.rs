use std::sync::{Arc, Mutex};
use futures::StreamExt;
use futures::channel::mpsc::unbounded;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::device::transport::Transport;
use crate::device::types::{PeripheralAddress, ScanEvent, ScanState, ScanTarget};
use crate::error::DeviceError;

/// Marks the scan as stopped and stops the transport's scan, unless someone else already did.
fn finish_scan<T: Transport + ?Sized>(transport: &T, state: &watch::Sender<ScanState>, matched: Option<PeripheralAddress>) -> bool {
    let stopped = state.send_if_modified(|state| {
        if !state.scanning {
            return false;
        }
        state.scanning = false;
        if matched.is_some() {
            state.matched_address = matched.clone();
        }
        true
    });

    if stopped {
        if let Err(err) = transport.stop_scan() {
            warn!("Failed to stop scanning: {}", err);
        }
    }

    stopped
}

/// Scans for peripherals, reporting every discovery and stopping by itself once the target
/// (if any) shows up.
pub struct PeripheralScanner<T: Transport + ?Sized> {
    transport: Arc<T>,
    runtime: Handle,
    state: Arc<watch::Sender<ScanState>>,
    pump_cancel: Mutex<Option<CancellationToken>>,
}

impl<T: Transport + ?Sized> PeripheralScanner<T> {
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn new(transport: Arc<T>) -> Self {
        let (state, _) = watch::channel(ScanState::default());

        PeripheralScanner {
            transport,
            runtime: Handle::current(),
            state: Arc::new(state),
            pump_cancel: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state.borrow().clone()
    }

    /// Starts scanning. Returns `Ok(false)` if the transport refused to start a scan, and an
    /// `InvalidState` error if this scanner is already scanning.
    pub fn start_scan<F>(&self, target: Option<ScanTarget>, on_each_found: F) -> Result<bool, DeviceError>
    where
        F: Fn(Option<&str>, &PeripheralAddress) + Send + 'static,
    {
        let started = self.state.send_if_modified(|state| {
            if state.scanning {
                return false;
            }
            *state = ScanState { scanning: true, matched_address: None };
            true
        });

        if !started {
            return Err(DeviceError::InvalidState("attempt to scan while already scanning"));
        }

        let (tx, mut rx) = unbounded::<ScanEvent>();
        if let Err(err) = self.transport.start_scan(tx) {
            warn!("Failed to start scanning: {}", err);
            self.state.send_modify(|state| state.scanning = false);
            return Ok(false);
        }

        info!("Scanning{}...", target.as_ref().map(|t| format!(" for {}", t)).unwrap_or_default());

        let cancel = CancellationToken::new();
        let previous = self.pump_cancel.lock().expect("Failed to lock scanner pump").replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let transport = self.transport.clone();
        let state = self.state.clone();

        self.runtime.spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    // a stopped scan must not touch the state of the next one
                    biased;

                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = rx.next() => match event {
                        Some(ScanEvent::Found { name, address }) => {
                            debug!("Found {} {}", name.as_deref().unwrap_or("NONE"), address);
                            on_each_found(name.as_deref(), &address);

                            let is_match = target.as_ref()
                                .map(|target| target.matches(name.as_deref(), &address))
                                .unwrap_or(false);

                            if is_match {
                                info!("Found target peripheral {}", address);
                                finish_scan(&*transport, &state, Some(address));
                                break 'mainloop;
                            }
                        },
                        None => {
                            warn!("Scan event stream ended");
                            finish_scan(&*transport, &state, None);
                            break 'mainloop;
                        },
                    },
                }
            }
        });

        Ok(true)
    }

    pub fn stop_scan(&self) -> Result<(), DeviceError> {
        if !finish_scan(&*self.transport, &self.state, None) {
            return Err(DeviceError::InvalidState("attempt to stop scanning while not scanning"));
        }

        if let Some(cancel) = self.pump_cancel.lock().expect("Failed to lock scanner pump").take() {
            cancel.cancel();
        }

        info!("Stopped scanning");
        Ok(())
    }

    /// Resolves once the current scan has stopped, with the matched address if it stopped
    /// because the target was found.
    pub async fn wait_for_match(&self) -> Option<PeripheralAddress> {
        let mut receiver = self.state.subscribe();
        let state = receiver.wait_for(|state| !state.scanning).await.ok()?;
        state.matched_address.clone()
    }
}

impl<T: Transport + ?Sized> Drop for PeripheralScanner<T> {
    fn drop(&mut self) {
        if let Ok(mut pump_cancel) = self.pump_cancel.lock() {
            if let Some(cancel) = pump_cancel.take() {
                cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::sim::peripheral_sim::SimulatedPeripheral;

    fn simulated() -> Arc<SimulatedPeripheral> {
        Arc::new(SimulatedPeripheral::builder()
            .decoy(Some("Keyboard"), "AA:BB:CC:DD:EE:FF")
            .decoy(None, "11:22:33:44:55:66")
            .build())
    }

    #[tokio::test]
    async fn scanning_twice_is_rejected() {
        let scanner = PeripheralScanner::new(simulated());

        assert!(scanner.start_scan(None, |_, _| {}).unwrap());
        assert!(matches!(scanner.start_scan(None, |_, _| {}), Err(DeviceError::InvalidState(_))));
        assert!(scanner.state().scanning);
    }

    #[tokio::test]
    async fn stopping_while_idle_is_rejected() {
        let sim = simulated();
        let scanner = PeripheralScanner::new(sim.clone());

        assert!(matches!(scanner.stop_scan(), Err(DeviceError::InvalidState(_))));

        scanner.start_scan(None, |_, _| {}).unwrap();
        scanner.stop_scan().unwrap();
        assert!(!sim.is_scanning());
        assert!(matches!(scanner.stop_scan(), Err(DeviceError::InvalidState(_))));
    }

    #[tokio::test]
    async fn stops_on_target_match_and_hands_over_the_address() {
        let sim = simulated();
        let scanner = PeripheralScanner::new(sim.clone());
        let found = Arc::new(Mutex::new(Vec::new()));
        let found2 = found.clone();

        let target = ScanTarget::new("SensorTag 34:B1:F7:D1:35:03");
        scanner.start_scan(Some(target), move |name, address| {
            found2.lock().unwrap().push((name.map(String::from), address.clone()));
        }).unwrap();

        let matched = timeout(Duration::from_secs(5), scanner.wait_for_match()).await.unwrap();

        assert_eq!(matched, Some(PeripheralAddress::new("34:B1:F7:D1:35:03")));
        assert_eq!(found.lock().unwrap().len(), 3);
        assert!(!scanner.state().scanning);
        assert!(!sim.is_scanning());
        // the scan already stopped itself
        assert!(matches!(scanner.stop_scan(), Err(DeviceError::InvalidState(_))));
    }

    #[tokio::test]
    async fn scan_without_match_keeps_running_until_stopped() {
        let sim = simulated();
        let scanner = PeripheralScanner::new(sim.clone());

        scanner.start_scan(Some(ScanTarget::new("Nothing 00:00:00:00:00:00")), |_, _| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(scanner.state().scanning);
        assert!(sim.is_scanning());
        scanner.stop_scan().unwrap();
        assert_eq!(scanner.wait_for_match().await, None);
    }

    #[tokio::test]
    async fn scan_stream_ending_stops_the_scan() {
        let sim = Arc::new(SimulatedPeripheral::builder().scan_aborts().build());
        let scanner = PeripheralScanner::new(sim.clone());

        assert!(scanner.start_scan(Some(ScanTarget::new("SensorTag 34:B1:F7:D1:35:03")), |_, _| {}).unwrap());
        let matched = timeout(Duration::from_secs(5), scanner.wait_for_match()).await.unwrap();

        assert_eq!(matched, None);
        assert!(!scanner.state().scanning);
        assert!(!sim.is_scanning());
        // a new scan can be started right away
        assert!(scanner.start_scan(None, |_, _| {}).unwrap());
    }

    #[tokio::test]
    async fn refused_scan_reports_not_started() {
        let sim = simulated();
        let other = PeripheralScanner::new(sim.clone());
        other.start_scan(None, |_, _| {}).unwrap();

        // the transport only supports one scan at a time
        let scanner = PeripheralScanner::new(sim);
        assert!(!scanner.start_scan(None, |_, _| {}).unwrap());
        assert!(!scanner.state().scanning);
    }
}
