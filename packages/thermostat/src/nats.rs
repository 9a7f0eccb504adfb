//! NATS implementation of the live socket pub/sub transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use live_socket::{LiveError, PubSubTransport};
use tracing::info;

/// Real NATS client transport.
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", url))?;
        info!(url = %url, "Connected to NATS");
        Ok(Self::new(client))
    }
}

#[async_trait]
impl PubSubTransport for NatsTransport {
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, Bytes>, LiveError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| LiveError::PubSub(format!("subscribe {}: {}", subject, e)))?;
        Ok(subscriber.map(|message| message.payload).boxed())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), LiveError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| LiveError::PubSub(format!("publish {}: {}", subject, e)))
    }
}
