//! In-process bus implementation.
//!
//! `MemBus` routes messages between in-process subscribers without a broker.
//! It additionally records everything published through it, in order, which
//! is what the test suite asserts against, and exposes
//! [`request`](MemBus::request) to inject an inbound request and obtain its
//! reply inbox, mirroring the request operation of a real bus client.

use crate::bus::{Bus, BusMessage, BusResult};
use crate::subject::subject_matches;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const NEXT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(1);

struct Subscription {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct MemBusInner {
    subs: Mutex<Vec<Subscription>>,
    published_tx: mpsc::UnboundedSender<BusMessage>,
    published_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusMessage>>,
    inbox_seq: AtomicU64,
}

/// In-process [`Bus`] with recorded publishes and a request operation.
#[derive(Clone)]
pub struct MemBus {
    inner: Arc<MemBusInner>,
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBus {
    pub fn new() -> Self {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemBusInner {
                subs: Mutex::new(Vec::new()),
                published_tx,
                published_rx: tokio::sync::Mutex::new(published_rx),
                inbox_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Send a request to subscribers of `subject` and return the generated
    /// reply inbox subject. Replies published to the inbox show up through
    /// [`next_message`](MemBus::next_message) like any other publish.
    pub fn request(&self, subject: &str, payload: Vec<u8>) -> String {
        let inbox = format!(
            "_INBOX.{}",
            self.inner.inbox_seq.fetch_add(1, Ordering::Relaxed)
        );
        let msg = BusMessage::new(subject, payload).with_reply(inbox.clone());
        self.deliver(msg);
        inbox
    }

    /// The next message published through the bus, in publish order, or
    /// `None` when nothing is published within a second.
    pub async fn next_message(&self) -> Option<BusMessage> {
        let mut rx = self.inner.published_rx.lock().await;
        tokio::time::timeout(NEXT_MESSAGE_TIMEOUT, rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Assert that no further message is published within a short window.
    pub async fn assert_no_message(&self) {
        let mut rx = self.inner.published_rx.lock().await;
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        if let Ok(Some(msg)) = result {
            panic!("expected no message, but got one on {}", msg.subject);
        }
    }

    fn deliver(&self, msg: BusMessage) {
        let mut subs = self.inner.subs.lock().unwrap();
        subs.retain(|sub| {
            if subject_matches(&sub.pattern, &msg.subject) {
                sub.tx.send(msg.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }
}

#[async_trait]
impl Bus for MemBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let msg = BusMessage::new(subject, payload);
        let _ = self.inner.published_tx.send(msg.clone());
        self.deliver(msg);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subs.lock().unwrap().push(Subscription {
            pattern: subject.to_string(),
            tx,
        });
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = MemBus::new();
        let mut stream = bus.subscribe("call.test.>").await.unwrap();
        bus.publish("call.test.model.set", b"{}".to_vec())
            .await
            .unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.subject, "call.test.model.set");
        assert_eq!(msg.payload, b"{}");
        assert_eq!(msg.reply, None);
    }

    #[tokio::test]
    async fn test_publish_skips_non_matching_subscriber() {
        let bus = MemBus::new();
        let mut stream = bus.subscribe("get.test.>").await.unwrap();
        bus.publish("call.test.model.set", b"{}".to_vec())
            .await
            .unwrap();
        bus.publish("get.test.model", b"{}".to_vec()).await.unwrap();
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.subject, "get.test.model");
    }

    #[tokio::test]
    async fn test_publishes_are_recorded_in_order() {
        let bus = MemBus::new();
        bus.publish("a", b"1".to_vec()).await.unwrap();
        bus.publish("b", b"2".to_vec()).await.unwrap();
        assert_eq!(bus.next_message().await.unwrap().subject, "a");
        assert_eq!(bus.next_message().await.unwrap().subject, "b");
        assert!(bus.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_request_carries_reply_inbox() {
        let bus = MemBus::new();
        let mut stream = bus.subscribe("call.test.>").await.unwrap();
        let inbox = bus.request("call.test.model.set", b"{}".to_vec());
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.reply, Some(inbox.clone()));
        // Requests are not recorded; only service publishes are.
        bus.publish(&inbox, b"reply".to_vec()).await.unwrap();
        let recorded = bus.next_message().await.unwrap();
        assert_eq!(recorded.subject, inbox);
        assert_eq!(recorded.payload, b"reply");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = MemBus::new();
        let stream = bus.subscribe("call.test.>").await.unwrap();
        drop(stream);
        bus.publish("call.test.model.set", b"{}".to_vec())
            .await
            .unwrap();
        assert!(bus.inner.subs.lock().unwrap().is_empty());
    }
}
