use std::iter;
use std::time::Duration;
use log::{debug, info, warn};

use crate::device::connection::Link;
use crate::device::session::Session;
use crate::device::transport::Transport;
use crate::device::types::{Mismatch, Stage, TransportEvent, VerifyReport};
use crate::error::DeviceError;

async fn write_step<T: Transport + ?Sized>(session: &mut Session<'_, T>, link: &Link, byte: u8) -> Result<(), DeviceError> {
    session.state.written = false;
    if let Err(err) = session.transport.write_characteristic(link.handle, &link.characteristic, vec![byte]) {
        warn!("Write request was rejected: {}", err);
    }

    let expected = link.characteristic.characteristic;
    session.wait_for(Stage::Writing, |event| match event {
        TransportEvent::CharacteristicWritten(Ok(uuid)) if uuid == expected => Some(()),
        TransportEvent::CharacteristicWritten(Err(reason)) => {
            warn!("Write failed: {}", reason);
            None
        },
        other => {
            debug!("Ignoring {:?} while writing", other);
            None
        },
    }).await?;

    session.state.written = true;
    Ok(())
}

async fn read_step<T: Transport + ?Sized>(session: &mut Session<'_, T>, link: &Link) -> Result<Option<u8>, DeviceError> {
    session.state.read = false;
    if let Err(err) = session.transport.read_characteristic(link.handle, &link.characteristic) {
        warn!("Read request was rejected: {}", err);
    }

    let expected = link.characteristic.characteristic;
    let value = session.wait_for(Stage::Reading, |event| match event {
        TransportEvent::CharacteristicRead(Ok((uuid, value))) if uuid == expected => Some(value),
        TransportEvent::CharacteristicRead(Err(reason)) => {
            warn!("Read failed: {}", reason);
            None
        },
        other => {
            debug!("Ignoring {:?} while reading", other);
            None
        },
    }).await?;

    session.state.read = true;
    session.state.last_byte_read = value.first().copied();
    Ok(session.state.last_byte_read)
}

/// Writes the priming byte followed by `values` to the characteristic of `link`, one byte per
/// write, reading every byte back before moving on and pausing `settle` between steps.
///
/// A byte that reads back differently is logged and recorded in the report but does not stop
/// the sequence. Any step that does not complete before the session's deadline aborts the rest.
pub async fn write_verify<T: Transport + ?Sized>(session: &mut Session<'_, T>, link: &Link, priming: u8, values: &[u8], settle: Duration) -> Result<VerifyReport, DeviceError> {
    let steps: Vec<u8> = iter::once(priming).chain(values.iter().copied()).collect();
    let mut report = VerifyReport::default();

    for (step, &byte) in steps.iter().enumerate() {
        debug!("Step {}/{}: writing {}", step + 1, steps.len(), byte);
        write_step(session, link, byte).await?;
        let read = read_step(session, link).await?;

        if read != Some(byte) {
            warn!("Read back {:?} after writing {} (step {})", read, byte, step + 1);
            report.mismatches.push(Mismatch { step, written: byte, read });
        }
        report.steps += 1;

        if step + 1 < steps.len() {
            session.deadline.settle(settle).await?;
        }
    }

    info!("Wrote {} values ({} mismatched)", report.steps, report.mismatches.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::device::connection::establish;
    use crate::device::constants::PRIMING_BYTE;
    use crate::device::deadline::Deadline;
    use crate::device::types::{PeripheralAddress, TargetCharacteristic};
    use crate::sim::peripheral_sim::{SimulatedPeripheral, SimulatedStage};

    const ADDRESS: &str = "34:B1:F7:D1:35:03";

    async fn connected(sim: &SimulatedPeripheral, timeout: Duration) -> (Session<'_, SimulatedPeripheral>, Link) {
        let deadline = Deadline::new(timeout, CancellationToken::new());
        let mut session = Session::new(sim, TargetCharacteristic::default(), deadline);
        let link = establish(&mut session, &PeripheralAddress::new(ADDRESS)).await.unwrap();
        (session, link)
    }

    #[tokio::test(start_paused = true)]
    async fn writes_priming_byte_then_values_in_order() {
        let sim = SimulatedPeripheral::builder().build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;

        let report = write_verify(&mut session, &link, PRIMING_BYTE, &[20, 30, 50, 0], Duration::from_millis(150)).await.unwrap();

        assert_eq!(report.steps, 5);
        assert!(report.mismatches.is_empty());
        assert_eq!(sim.written(), vec![101, 20, 30, 50, 0]);
        assert_eq!(session.state.last_byte_read, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_separated_by_the_settle_delay() {
        let sim = SimulatedPeripheral::builder().latency(Duration::ZERO).build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;
        let started = Instant::now();

        write_verify(&mut session, &link, PRIMING_BYTE, &[40, 60], Duration::from_millis(150)).await.unwrap();

        // three steps, two pauses
        assert!(Instant::now() - started >= Duration::from_millis(300));
        assert!(Instant::now() - started < Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_is_recorded_and_sequence_continues() {
        let sim = SimulatedPeripheral::builder().corrupt_read_at(2).build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;

        let report = write_verify(&mut session, &link, PRIMING_BYTE, &[20, 30, 50], Duration::from_millis(150)).await.unwrap();

        assert_eq!(report.steps, 4);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].step, 2);
        assert_eq!(report.mismatches[0].written, 30);
        assert_ne!(report.mismatches[0].read, Some(30));
        assert_eq!(sim.written(), vec![101, 20, 30, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_status_is_followed_by_a_late_success() {
        let sim = SimulatedPeripheral::builder().write_failures(2).build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;

        let report = write_verify(&mut session, &link, PRIMING_BYTE, &[20, 80], Duration::from_millis(150)).await.unwrap();

        assert_eq!(report.steps, 3);
        assert!(report.mismatches.is_empty());
        assert_eq!(sim.written(), vec![101, 20, 80]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_read_status_is_followed_by_a_late_success() {
        let sim = SimulatedPeripheral::builder().read_failures(3).build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;

        let report = write_verify(&mut session, &link, PRIMING_BYTE, &[100], Duration::from_millis(150)).await.unwrap();

        assert_eq!(report.steps, 2);
        assert!(report.mismatches.is_empty());
        assert_eq!(session.state.last_byte_read, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_write_runs_into_the_deadline() {
        let sim = SimulatedPeripheral::builder().reject_at(SimulatedStage::Write).build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;

        let result = write_verify(&mut session, &link, PRIMING_BYTE, &[20, 30, 50], Duration::from_millis(150)).await;

        assert!(matches!(result, Err(DeviceError::Timeout { stage: Stage::Writing })));
        assert!(session.deadline.is_expired());
        assert!(sim.written().is_empty());
        session.release();
        assert!(sim.open_handles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_read_aborts_remaining_values() {
        let sim = SimulatedPeripheral::builder().stall_at(SimulatedStage::Read).build();
        let (mut session, link) = connected(&sim, Duration::from_secs(70)).await;

        let result = write_verify(&mut session, &link, PRIMING_BYTE, &[20, 30, 50], Duration::from_millis(150)).await;

        assert!(matches!(result, Err(DeviceError::Timeout { stage: Stage::Reading })));
        assert_eq!(sim.written(), vec![101]);
    }
}
