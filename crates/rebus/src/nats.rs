//! NATS-backed bus implementation.

use crate::bus::{Bus, BusError, BusMessage, BusResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

/// A [`Bus`] over a NATS connection.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to a NATS server, e.g. `nats://127.0.0.1:4222`.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing NATS client.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// The underlying NATS client.
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(subscriber
            .map(|msg| BusMessage {
                subject: msg.subject.to_string(),
                reply: msg.reply.map(|r| r.to_string()),
                payload: msg.payload.to_vec(),
            })
            .boxed())
    }
}
