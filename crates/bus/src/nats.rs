use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::OrderedConfig, DeliverPolicy as JsDeliverPolicy},
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use crate::{BusClient, BusError, BusMessage, BusSubscription, DeliverPolicy, SubscribeOptions};

/// JetStream stream provisioned for realtime delivery. The duplicate window
/// bounds how long a republished dedupe key is suppressed by the server.
#[derive(Clone, Debug)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub duplicate_window: Duration,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            duplicate_window: Duration::from_secs(120),
        }
    }
}

pub struct NatsBusClient {
    js: jetstream::Context,
    stream_name: String,
}

impl NatsBusClient {
    /// Ensures the delivery stream exists (or creates it) and returns a
    /// client handle bound to it.
    pub async fn ensure(client: async_nats::Client, spec: StreamSpec) -> Result<Self, BusError> {
        let js = jetstream::new(client);
        js.get_or_create_stream(StreamConfig {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            duplicate_window: spec.duplicate_window,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            ..Default::default()
        })
        .await
        .map_err(|err| BusError::Subscribe(anyhow::Error::new(err)))?;

        Ok(Self {
            js,
            stream_name: spec.name,
        })
    }
}

#[async_trait]
impl BusClient for NatsBusClient {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        dedupe_key: &str,
    ) -> Result<(), BusError> {
        let bytes =
            serde_json::to_vec(&payload).map_err(|e| BusError::Publish(anyhow::Error::new(e)))?;
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, dedupe_key);
        self.js
            .publish_with_headers(subject.to_string(), headers, bytes.into())
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?
            .await
            .map_err(|err| BusError::Publish(anyhow::Error::new(err)))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<BusSubscription, BusError> {
        let stream = self
            .js
            .get_stream(&self.stream_name)
            .await
            .map_err(|err| BusError::Subscribe(anyhow::Error::new(err)))?;

        let deliver_policy = match options.deliver {
            DeliverPolicy::All => JsDeliverPolicy::All,
            DeliverPolicy::LastPerSubject => JsDeliverPolicy::LastPerSubject,
            DeliverPolicy::FromSequence(start_sequence) => {
                JsDeliverPolicy::ByStartSequence { start_sequence }
            }
        };

        let consumer = stream
            .create_consumer(OrderedConfig {
                filter_subjects: vec![subject.to_string()],
                deliver_policy,
                ..Default::default()
            })
            .await
            .map_err(|err| BusError::Subscribe(anyhow::Error::new(err)))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|err| BusError::Subscribe(anyhow::Error::new(err)))?;

        let stream_name = self.stream_name.clone();
        let mapped = async_stream::stream! {
            while let Some(next) = messages.next().await {
                match next {
                    Ok(msg) => yield map_message(&stream_name, &msg),
                    Err(err) => yield Err(BusError::Subscribe(anyhow::Error::new(err))),
                }
            }
        };

        // Ordered consumers are ephemeral; dropping the message stream is the
        // release path on the server side.
        Ok(BusSubscription::new(Box::pin(mapped), || {}))
    }
}

fn map_message(
    stream_name: &str,
    msg: &jetstream::Message,
) -> Result<BusMessage, BusError> {
    let sequence = msg
        .info()
        .map(|info| info.stream_sequence)
        .map_err(|err| BusError::Subscribe(anyhow::anyhow!("missing delivery info: {err}")))?;
    let payload: Value = serde_json::from_slice(&msg.payload)
        .map_err(|err| BusError::Subscribe(anyhow::Error::new(err)))?;
    Ok(BusMessage {
        subject: msg.subject.to_string(),
        payload,
        sequence,
        delivery_tag: Some(format!("{stream_name}:{sequence}")),
    })
}
