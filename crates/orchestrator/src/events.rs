//! Event fan-out to observers
//!
//! Built on a tokio broadcast channel: emitting never waits on an observer,
//! and one that falls behind sees `RecvError::Lagged` instead of holding up
//! the run or the other observers.

use playdeck_common::RunEvent;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to every current observer. Having none is fine.
    pub fn emit(&self, event: RunEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!("No observers for event on run {}", event.run_id());
        }
    }

    /// Observe events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
