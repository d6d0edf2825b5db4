//! Pub/sub primitive exposed to script filters
//!
//! Topics are plain strings; the gateway scopes them per site before handing
//! the subscriber to a filter context. The in-memory implementation fans out
//! over tokio broadcast channels; shared brokers are external collaborators.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn publish(&self, topic: &str, value: &str) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A view of `inner` whose topics live under `namespace.join("/")`.
pub fn scoped(inner: Arc<dyn Subscriber>, namespace: &[&str]) -> Arc<dyn Subscriber> {
    Arc::new(ScopedSubscriber {
        inner,
        prefix: format!("{}/", namespace.join("/")),
    })
}

struct ScopedSubscriber {
    inner: Arc<dyn Subscriber>,
    prefix: String,
}

#[async_trait]
impl Subscriber for ScopedSubscriber {
    async fn publish(&self, topic: &str, value: &str) -> Result<()> {
        self.inner
            .publish(&format!("{}{}", self.prefix, topic), value)
            .await
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>> {
        self.inner
            .subscribe(&format!("{}{}", self.prefix, topic))
            .await
    }
}

#[derive(Default)]
pub struct MemorySubscriber {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemorySubscriber {
    pub fn new() -> Self {
        MemorySubscriber::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn publish(&self, topic: &str, value: &str) -> Result<()> {
        // A send error only means nobody is listening right now.
        let _ = self.sender(topic).send(value.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>> {
        Ok(self.sender(topic).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = MemorySubscriber::new();
        let mut rx = bus.subscribe("events").await.unwrap();
        bus.publish("events", "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_publish_without_listeners() {
        let bus = MemorySubscriber::new();
        assert!(bus.publish("void", "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_scoped_isolation() {
        let root: Arc<dyn Subscriber> = Arc::new(MemorySubscriber::new());
        let site_a = scoped(root.clone(), &["org1", "repo1"]);
        let site_b = scoped(root.clone(), &["org1", "repo2"]);

        let mut rx_a = site_a.subscribe("chat").await.unwrap();
        site_b.publish("chat", "for b only").await.unwrap();
        site_a.publish("chat", "for a").await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), "for a");
    }
}
