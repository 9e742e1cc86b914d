//! Message bus abstraction.
//!
//! The service talks to its gateway through a subject-addressed
//! publish/subscribe bus. The [`Bus`] trait is the narrow seam the framework
//! consumes; two implementations ship with the crate:
//!
//! - [`NatsBus`](crate::NatsBus): production implementation over a NATS
//!   connection
//! - [`MemBus`](crate::MemBus): in-process implementation used by the test
//!   suite and for embedding without a broker

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// A message received from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Reply subject for request/response traffic.
    pub reply: Option<String>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Create a message without a reply subject.
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload,
        }
    }

    /// Set the reply subject.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// Errors surfaced by a bus implementation.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe to subject: {0}")]
    Subscribe(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Subject-addressed publish/subscribe transport.
///
/// Subscription subjects support the usual wildcard tokens: `*` matches
/// exactly one token, a trailing `>` matches one or more tokens.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish raw bytes to a subject.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to all messages matching a subject pattern.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}
