//! NATS-backed channel.
//!
//! Topic levels map onto subject tokens: `/` becomes `.`, `+` becomes `*` and
//! a trailing `#` becomes `>`. Machine ids must therefore not contain `.`.

use crate::transport::{Channel, ChannelError, Message, Subscription};
use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

pub struct NatsChannel {
    client: Client,
}

impl NatsChannel {
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        info!(%url, "connected to NATS");
        Ok(Self { client })
    }
}

fn to_subject(topic: &str) -> String {
    topic
        .split('/')
        .map(|level| match level {
            "+" => "*",
            "#" => ">",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn from_subject(subject: &str) -> String {
    subject.replace('.', "/")
}

#[async_trait]
impl Channel for NatsChannel {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), ChannelError> {
        self.client
            .publish(to_subject(topic), payload)
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, ChannelError> {
        let subscriber = self
            .client
            .subscribe(to_subject(pattern))
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;
        Ok(subscriber
            .map(|msg| Message {
                topic: from_subject(msg.subject.as_str()),
                payload: msg.payload,
            })
            .boxed())
    }
}
