use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use urgent_contracts::UrgentEvent;

/// Write side handed to the lifecycle engine. Publishing never blocks a request.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<UrgentEvent>,
}

impl EventPublisher {
    pub fn publish(&self, event: UrgentEvent) {
        let name = event.name();
        let id = event.incident_id();
        if self.tx.send(event).is_err() {
            tracing::warn!(event = name, id, "notifier stopped; realtime event dropped");
        }
    }
}

/// Fans every published event out to all connected observers, in publication order.
#[derive(Clone)]
pub struct Notifier {
    fanout: broadcast::Sender<UrgentEvent>,
}

impl Notifier {
    /// Spawns the forwarding task. `buffer` bounds how far an observer may fall behind
    /// before it starts losing events.
    pub fn start(buffer: usize) -> (EventPublisher, Notifier, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (fanout, _) = broadcast::channel(buffer.max(1));
        let handle = tokio::spawn(forward(rx, fanout.clone()));

        (EventPublisher { tx }, Notifier { fanout }, handle)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UrgentEvent> {
        self.fanout.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.fanout.receiver_count()
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<UrgentEvent>,
    fanout: broadcast::Sender<UrgentEvent>,
) {
    while let Some(event) = rx.recv().await {
        let name = event.name();
        let id = event.incident_id();
        crate::metrics::observe_broadcast(name);

        match fanout.send(event) {
            Ok(observers) => tracing::debug!(event = name, id, observers, "event broadcast"),
            Err(_) => tracing::debug!(event = name, id, "event broadcast with no observers"),
        }
    }

    tracing::debug!("event channel closed; notifier stopping");
}
