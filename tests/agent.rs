use std::sync::Arc;
use std::time::Duration;
use futures::channel::oneshot;
use tokio::time::Instant;

use embre_agent::config::types::{pad_values, validate_values, ConfigValue};
use embre_agent::device::agent::ConfigAgent;
use embre_agent::device::types::{ConnectionHandle, PeripheralAddress};
use embre_agent::error::DeviceError;
use embre_agent::sim::peripheral_sim::{SimulatedPeripheral, SimulatedStage};

const ADDRESS: &str = "34:B1:F7:D1:35:03";

fn values(percentages: &[i32]) -> Vec<ConfigValue> {
    let labels = ["A", "B", "C", "D", "E", "F"];
    percentages.iter().zip(labels.iter())
        .map(|(value, label)| ConfigValue::new(label, *value))
        .collect()
}

/// Submits and resolves with the result and the instant the callback ran.
fn submit(agent: &ConfigAgent<SimulatedPeripheral>, values: &[ConfigValue]) -> oneshot::Receiver<(bool, Instant)> {
    let (tx, rx) = oneshot::channel();
    agent.submit(values, PeripheralAddress::new(ADDRESS), move |success| {
        let _ = tx.send((success, Instant::now()));
    }).unwrap();
    rx
}

#[tokio::test(start_paused = true)]
async fn writes_padded_values_after_the_priming_byte() {
    let sim = Arc::new(SimulatedPeripheral::builder().build());
    let agent = ConfigAgent::new(sim.clone());
    let values = pad_values(values(&[20, 30, 50]), 4);
    assert_eq!(validate_values(&values), Ok(()));

    let success = agent.write_configuration(&values, PeripheralAddress::new(ADDRESS)).await.unwrap();

    assert!(success);
    assert_eq!(sim.written(), vec![101, 20, 30, 50, 0]);
    assert!(sim.open_handles().is_empty());
    assert!(!agent.is_busy());
}

#[tokio::test(start_paused = true)]
async fn every_valid_list_is_transmitted_in_order() {
    let lists: [&[i32]; 5] = [&[100], &[0, 100], &[25, 25, 25, 25], &[1, 2, 3, 94], &[0, 0, 0, 0, 0, 100]];

    for percentages in lists {
        let sim = Arc::new(SimulatedPeripheral::builder().build());
        let agent = ConfigAgent::new(sim.clone());
        let values = values(percentages);
        assert_eq!(validate_values(&values), Ok(()));

        assert!(agent.write_configuration(&values, PeripheralAddress::new(ADDRESS)).await.unwrap());

        let mut expected = vec![101u8];
        expected.extend(percentages.iter().map(|value| *value as u8));
        assert_eq!(sim.written(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_step_fails_at_the_deadline_and_releases_the_connection() {
    let sim = Arc::new(SimulatedPeripheral::builder().stall_at(SimulatedStage::Write).build());
    let agent = ConfigAgent::new(sim.clone());
    let values = values(&[20, 30, 50]);

    let started = Instant::now();
    let (success, finished) = submit(&agent, &values).await.unwrap();

    assert!(!success);
    let elapsed = finished - started;
    assert!(elapsed >= Duration::from_millis(70_000), "failed early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(70_010), "failed late: {:?}", elapsed);
    assert!(sim.open_handles().is_empty());
    assert!(!agent.is_busy());

    // a new submission gets a new connection
    let (success, _) = submit(&agent, &values).await.unwrap();
    assert!(!success);
    assert_eq!(sim.issued_handles(), vec![ConnectionHandle(1), ConnectionHandle(2)]);
    assert!(sim.open_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_fails_at_the_deadline() {
    let sim = Arc::new(SimulatedPeripheral::builder().stall_at(SimulatedStage::Connect).build());
    let agent = ConfigAgent::new(sim.clone());

    let started = Instant::now();
    let (success, finished) = submit(&agent, &values(&[100])).await.unwrap();

    assert!(!success);
    assert!(finished - started >= Duration::from_millis(70_000));
    assert!(sim.written().is_empty());
    assert!(sim.open_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_submission_is_rejected_without_disturbing_the_first() {
    let sim = Arc::new(SimulatedPeripheral::builder().build());
    let agent = ConfigAgent::new(sim.clone());

    let first = submit(&agent, &values(&[20, 30, 50]));
    assert!(agent.is_busy());

    let second = agent.submit(&values(&[100]), PeripheralAddress::new(ADDRESS), |_| {});
    assert!(matches!(second, Err(DeviceError::InvalidState(_))));

    let (success, _) = first.await.unwrap();
    assert!(success);
    assert_eq!(sim.written(), vec![101, 20, 30, 50]);
    assert_eq!(sim.issued_handles().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn mismatched_read_back_does_not_fail_the_operation() {
    let sim = Arc::new(SimulatedPeripheral::builder().corrupt_read_at(1).build());
    let agent = ConfigAgent::new(sim.clone());

    let success = agent.write_configuration(&values(&[20, 30, 50]), PeripheralAddress::new(ADDRESS)).await.unwrap();

    assert!(success);
    assert_eq!(sim.written(), vec![101, 20, 30, 50]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_reports_failure_and_releases_the_connection() {
    let sim = Arc::new(SimulatedPeripheral::builder().stall_at(SimulatedStage::Read).build());
    let agent = ConfigAgent::new(sim.clone());
    assert!(!agent.cancel_active_operation());

    let started = Instant::now();
    let result = submit(&agent, &values(&[20, 30, 50]));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(agent.cancel_active_operation());
    let (success, finished) = result.await.unwrap();

    assert!(!success);
    assert!(finished - started < Duration::from_secs(2));
    assert!(sim.open_handles().is_empty());
    assert!(!agent.is_busy());
    assert!(!agent.cancel_active_operation());
}

#[tokio::test(start_paused = true)]
async fn missing_characteristic_fails_without_waiting_for_the_deadline() {
    let sim = Arc::new(SimulatedPeripheral::builder().without_target_characteristic().build());
    let agent = ConfigAgent::new(sim.clone());

    let started = Instant::now();
    let (success, finished) = submit(&agent, &values(&[100])).await.unwrap();

    assert!(!success);
    assert!(finished - started < Duration::from_secs(1));
    assert!(sim.written().is_empty());
    assert!(sim.open_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connection_is_released_before_the_callback_runs() {
    let sim = Arc::new(SimulatedPeripheral::builder().build());
    let agent = Arc::new(ConfigAgent::new(sim.clone()));
    let (tx, rx) = oneshot::channel();

    let sim2 = sim.clone();
    let agent2 = agent.clone();
    agent.submit(&values(&[100]), PeripheralAddress::new(ADDRESS), move |success| {
        let _ = tx.send((success, sim2.open_handles().len(), agent2.is_busy()));
    }).unwrap();

    assert_eq!(rx.await.unwrap(), (true, 0, false));
}

#[tokio::test(start_paused = true)]
async fn failed_connection_statuses_are_retried_until_success() {
    let sim = Arc::new(SimulatedPeripheral::builder().connect_failures(2).build());
    let agent = ConfigAgent::new(sim.clone());

    let success = agent.write_configuration(&values(&[60, 40]), PeripheralAddress::new(ADDRESS)).await.unwrap();

    assert!(success);
    assert_eq!(sim.written(), vec![101, 60, 40]);
}

#[tokio::test(start_paused = true)]
async fn refused_read_fails_at_the_deadline_and_releases_the_connection() {
    let sim = Arc::new(SimulatedPeripheral::builder().reject_at(SimulatedStage::Read).build());
    let agent = ConfigAgent::new(sim.clone());

    let started = Instant::now();
    let (success, finished) = submit(&agent, &values(&[20, 30, 50])).await.unwrap();

    assert!(!success);
    assert!(finished - started >= Duration::from_millis(70_000));
    assert_eq!(sim.written(), vec![101]);
    assert!(sim.open_handles().is_empty());
    assert!(!agent.is_busy());
}

#[tokio::test(start_paused = true)]
async fn failed_statuses_at_every_step_still_succeed() {
    let sim = Arc::new(SimulatedPeripheral::builder()
        .connect_failures(1)
        .discovery_failures(1)
        .write_failures(1)
        .read_failures(1)
        .build());
    let agent = ConfigAgent::new(sim.clone());

    let success = agent.write_configuration(&values(&[20, 30, 50]), PeripheralAddress::new(ADDRESS)).await.unwrap();

    assert!(success);
    assert_eq!(sim.written(), vec![101, 20, 30, 50]);
    assert!(sim.open_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn values_that_do_not_fit_a_byte_are_rejected_up_front() {
    let sim = Arc::new(SimulatedPeripheral::builder().build());
    let agent = ConfigAgent::new(sim.clone());

    let result = agent.write_configuration(&values(&[300]), PeripheralAddress::new(ADDRESS)).await;

    assert!(matches!(result, Err(DeviceError::ValueOutOfRange { index: 0, value: 300 })));
    assert!(!agent.is_busy());
    assert!(sim.issued_handles().is_empty());
}
