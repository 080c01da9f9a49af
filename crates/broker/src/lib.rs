//! Publish/subscribe broker for plexus.
//!
//! The client publishes through [`Broker::publish`]; the server attaches its
//! (wrapped) subscribers with [`Broker::subscribe`] at start and detaches them
//! while draining.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use plexus_core::{Context, Error, Publication, Result, SubscriberFn};
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle identifying one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Message broker.
#[async_trait]
pub trait Broker: Debug + Send + Sync + 'static {
    /// Delivers `publication` to the subscribers of its topic.
    async fn publish(&self, publication: Publication) -> Result<()>;

    /// Attaches `handler` to `topic`.
    async fn subscribe(&self, topic: &str, handler: SubscriberFn) -> Result<SubscriptionId>;

    /// Detaches a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Stops accepting publications.
    async fn close(&self) -> Result<()>;
}

/// In-process broker delivering inline to every subscriber of a topic.
///
/// Subscriber failures are logged and do not fail the publish. Clones share
/// subscriptions.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Arc<DashMap<String, Vec<(SubscriptionId, SubscriberFn)>>>,
    closed: Arc<AtomicBool>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("topics", &self.topics.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryBroker {
    /// Creates a broker with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed("broker closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, publication: Publication) -> Result<()> {
        self.ensure_open()?;

        let handlers: Vec<SubscriberFn> = self
            .topics
            .get(&publication.topic)
            .map(|subs| subs.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        debug!(
            "Publishing to {} ({} subscribers)",
            publication.topic,
            handlers.len()
        );

        for handler in handlers {
            let mut ctx = Context::background();
            ctx.metadata_mut().extend(&publication.header);
            if let Err(e) = handler(ctx, publication.clone()).await {
                warn!("Subscriber of {} failed: {}", publication.topic, e);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: SubscriberFn) -> Result<SubscriptionId> {
        self.ensure_open()?;

        let id = SubscriptionId(Uuid::new_v4());
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));

        debug!("Subscribed {:?} to {}", id, topic);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.topics.retain(|_, subs| {
            subs.retain(|(sub_id, _)| *sub_id != id);
            !subs.is_empty()
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use plexus_core::subscriber_fn;

    fn collecting(seen: Arc<Mutex<Vec<String>>>, label: &'static str) -> SubscriberFn {
        subscriber_fn(move |ctx: Context, publication: Publication| {
            let seen = seen.clone();
            async move {
                let user = ctx.metadata().get("user").unwrap_or("-").to_string();
                seen.lock().push(format!(
                    "{label}:{}:{user}",
                    String::from_utf8_lossy(&publication.body)
                ));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        broker
            .subscribe("events", collecting(seen.clone(), "a"))
            .await
            .unwrap();
        broker
            .subscribe("events", collecting(seen.clone(), "b"))
            .await
            .unwrap();
        broker
            .subscribe("other", collecting(seen.clone(), "c"))
            .await
            .unwrap();

        let mut publication = Publication::new("events", "text/plain", "hello");
        publication.header.insert("user", "alice");
        broker.publish(publication).await.unwrap();

        assert_eq!(*seen.lock(), vec!["a:hello:alice", "b:hello:alice"]);
    }

    #[tokio::test]
    async fn test_subscriber_error_does_not_fail_publish() {
        let broker = MemoryBroker::new();
        broker
            .subscribe(
                "events",
                subscriber_fn(|_, _| async { Err::<(), _>(Error::InternalServer("boom".to_string())) }),
            )
            .await
            .unwrap();

        broker
            .publish(Publication::new("events", "text/plain", "x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let broker = MemoryBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = broker
            .subscribe("events", collecting(seen.clone(), "a"))
            .await
            .unwrap();

        broker.unsubscribe(id).await.unwrap();
        assert_eq!(broker.subscriber_count("events"), 0);
        broker
            .publish(Publication::new("events", "text/plain", "x"))
            .await
            .unwrap();
        assert!(seen.lock().is_empty());

        broker.close().await.unwrap();
        assert!(matches!(
            broker
                .publish(Publication::new("events", "text/plain", "x"))
                .await,
            Err(Error::Closed(_))
        ));
    }
}
