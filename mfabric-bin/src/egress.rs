use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use mfabric::bridge::Egress;
use mfabric::broker::Broker;
use mfabric::Result;

/// Hands protocol frames to the data plane under `<prefix>.<topic>`, where a
/// gateway for the external protocol picks them up. `/` in the protocol
/// topic becomes `.`.
pub struct BrokerEgress {
    broker: Arc<dyn Broker>,
    prefix: String,
}

impl BrokerEgress {
    pub fn new<P: Into<String>>(broker: Arc<dyn Broker>, prefix: P) -> Self {
        Self { broker, prefix: prefix.into() }
    }

    #[inline]
    fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.prefix, topic.trim_matches('/').replace('/', "."))
    }
}

#[async_trait]
impl Egress for BrokerEgress {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.broker.publish(&self.subject(topic), payload).await
    }
}
