//! An in-process broadcast broker. Connector resource events fan out to a
//! listener that collapses bursts before reconfiguring the engines.

use futures::StreamExt;
use registry_bridge_core::ProviderId;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const TOPIC_CAPACITY: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Topic {
    ConnectorUpdate,
    MeshConfigUpdated,
    ServiceUpdate,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectorUpdate => "connector-update",
            Self::MeshConfigUpdated => "mesh-config-updated",
            Self::ServiceUpdate => "service-update",
        };
        s.fmt(f)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventOp {
    Added,
    Updated,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub provider: ProviderId,
    pub name: String,
    pub op: EventOp,
}

pub struct Broker {
    connector: broadcast::Sender<Event>,
    mesh_config: broadcast::Sender<Event>,
    service: broadcast::Sender<Event>,
}

// === impl Broker ===

impl Broker {
    pub fn new() -> Self {
        let (connector, _) = broadcast::channel(TOPIC_CAPACITY);
        let (mesh_config, _) = broadcast::channel(TOPIC_CAPACITY);
        let (service, _) = broadcast::channel(TOPIC_CAPACITY);
        Self {
            connector,
            mesh_config,
            service,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::ConnectorUpdate => &self.connector,
            Topic::MeshConfigUpdated => &self.mesh_config,
            Topic::ServiceUpdate => &self.service,
        }
    }

    /// Publishes to a topic. Events are dropped when no subscriber exists,
    /// which is fine: a late subscriber reconfirms on its first round.
    pub fn publish(&self, topic: Topic, event: Event) {
        if let Err(error) = self.sender(topic).send(event) {
            tracing::trace!(%topic, %error, "no subscribers");
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.sender(topic).subscribe()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapses bursts of reconfiguration events: a reconcile fires only once
/// a full quiet period has elapsed since the last event, followed by one
/// reconfirm round to catch writes racing the pass itself.
pub struct BroadcastListener {
    events: futures::stream::SelectAll<BroadcastStream<Event>>,
    period: Duration,
}

// === impl BroadcastListener ===

impl BroadcastListener {
    /// Subscribes to every topic that should trigger a reconcile.
    pub fn new(broker: &Broker, period: Duration) -> Self {
        let events = futures::stream::select_all(
            [
                Topic::ConnectorUpdate,
                Topic::MeshConfigUpdated,
                Topic::ServiceUpdate,
            ]
            .into_iter()
            .map(|topic| BroadcastStream::new(broker.subscribe(topic))),
        );
        Self { events, period }
    }

    /// Runs until every topic sender is dropped or `reconcile` fails.
    /// A lagged receiver counts as an event: something changed.
    pub async fn run<F, Fut>(mut self, mut reconcile: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        loop {
            // Park until the first event of a burst.
            if self.events.next().await.is_none() {
                return Ok(());
            }

            // Sliding window: every further event restarts the quiet period.
            loop {
                match tokio::time::timeout(self.period, self.events.next()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
            reconcile().await?;

            tokio::time::sleep(self.period).await;
            reconcile().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(op: EventOp) -> Event {
        Event {
            provider: ProviderId::Consul,
            name: "c1".to_string(),
            op,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_burst_collapses_to_one_pass_plus_a_reconfirm() {
        let broker = Broker::new();
        let listener = BroadcastListener::new(&broker, Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn({
            let fired = fired.clone();
            async move {
                listener
                    .run(|| {
                        fired.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await
            }
        });

        broker.publish(Topic::ConnectorUpdate, event(EventOp::Added));
        broker.publish(Topic::ConnectorUpdate, event(EventOp::Updated));
        broker.publish(Topic::MeshConfigUpdated, event(EventOp::Updated));
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        drop(broker);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn events_inside_the_window_slide_the_timer() {
        let broker = Broker::new();
        let listener = BroadcastListener::new(&broker, Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        tokio::spawn({
            let fired = fired.clone();
            async move {
                listener
                    .run(|| {
                        fired.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await
            }
        });

        broker.publish(Topic::ConnectorUpdate, event(EventOp::Updated));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Still inside the window: the pass is pushed back again.
        broker.publish(Topic::ConnectorUpdate, event(EventOp::Updated));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_reconcile_stops_the_listener() {
        let broker = Broker::new();
        let listener = BroadcastListener::new(&broker, Duration::from_secs(1));
        let task = tokio::spawn(async move {
            listener
                .run(|| async { anyhow::bail!("unsupported provider") })
                .await
        });

        broker.publish(Topic::ConnectorUpdate, event(EventOp::Added));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(task.await.unwrap().is_err());
    }
}
