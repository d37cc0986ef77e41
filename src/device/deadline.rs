use std::time::Duration;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use log::warn;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::types::{Stage, TransportEvent};
use crate::error::DeviceError;

/// A single absolute deadline for a whole operation, armed once when the operation starts.
/// Every suspension point goes through it, so that expiry or cancellation is observed no matter
/// which step the operation is waiting on.
#[derive(Debug, Clone)]
pub struct Deadline {
    started_at: Instant,
    expires_at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        let started_at = Instant::now();
        Deadline {
            started_at,
            expires_at: started_at + timeout,
            cancel,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Waits for the next completion event of the connection.
    pub async fn next_event(&self, events: &mut UnboundedReceiver<TransportEvent>, stage: Stage) -> Result<TransportEvent, DeviceError> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                Err(DeviceError::Cancelled { stage })
            },
            _ = sleep_until(self.expires_at) => {
                warn!("Deadline expired after {:?} while {}", self.expires_at - self.started_at, stage);
                Err(DeviceError::Timeout { stage })
            },
            event = events.next() => match event {
                Some(event) => Ok(event),
                None => Err(DeviceError::EventChannelClosed { stage }),
            },
        }
    }

    /// Sleeps for `delay`, unless the deadline expires or the operation is cancelled first.
    pub async fn settle(&self, delay: Duration) -> Result<(), DeviceError> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                Err(DeviceError::Cancelled { stage: Stage::Settling })
            },
            _ = sleep_until(self.expires_at) => {
                warn!("Deadline expired after {:?} while {}", self.expires_at - self.started_at, Stage::Settling);
                Err(DeviceError::Timeout { stage: Stage::Settling })
            },
            _ = sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::unbounded;
    use crate::device::types::LinkState;

    #[tokio::test(start_paused = true)]
    async fn next_event_times_out_exactly_at_the_deadline() {
        let deadline = Deadline::new(Duration::from_millis(70_000), CancellationToken::new());
        let (_tx, mut rx) = unbounded::<TransportEvent>();

        let result = deadline.next_event(&mut rx, Stage::Connecting).await;

        assert!(matches!(result, Err(DeviceError::Timeout { stage: Stage::Connecting })));
        assert_eq!(Instant::now() - deadline.started_at(), Duration::from_millis(70_000));
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn next_event_returns_queued_events_in_order() {
        let deadline = Deadline::new(Duration::from_secs(1), CancellationToken::new());
        let (tx, mut rx) = unbounded();
        tx.unbounded_send(TransportEvent::ConnectionStateChanged(Err("busy".to_string()))).unwrap();
        tx.unbounded_send(TransportEvent::ConnectionStateChanged(Ok(LinkState::Connected))).unwrap();

        assert_eq!(
            deadline.next_event(&mut rx, Stage::Connecting).await.unwrap(),
            TransportEvent::ConnectionStateChanged(Err("busy".to_string())),
        );
        assert_eq!(
            deadline.next_event(&mut rx, Stage::Connecting).await.unwrap(),
            TransportEvent::ConnectionStateChanged(Ok(LinkState::Connected)),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_pending_events() {
        let cancel = CancellationToken::new();
        let deadline = Deadline::new(Duration::from_secs(1), cancel.clone());
        let (tx, mut rx) = unbounded();
        tx.unbounded_send(TransportEvent::CharacteristicWritten(Err("nope".to_string()))).unwrap();
        cancel.cancel();

        let result = deadline.next_event(&mut rx, Stage::Writing).await;
        assert!(matches!(result, Err(DeviceError::Cancelled { stage: Stage::Writing })));
    }

    #[tokio::test(start_paused = true)]
    async fn settle_is_cut_short_by_the_deadline() {
        let deadline = Deadline::new(Duration::from_millis(100), CancellationToken::new());

        let result = deadline.settle(Duration::from_millis(150)).await;

        assert!(matches!(result, Err(DeviceError::Timeout { stage: Stage::Settling })));
        assert_eq!(Instant::now() - deadline.started_at(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let deadline = Deadline::new(Duration::from_secs(1), CancellationToken::new());
        let (tx, mut rx) = unbounded::<TransportEvent>();
        drop(tx);

        let result = deadline.next_event(&mut rx, Stage::Reading).await;
        assert!(matches!(result, Err(DeviceError::EventChannelClosed { stage: Stage::Reading })));
    }
}
