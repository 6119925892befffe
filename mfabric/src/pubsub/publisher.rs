use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use mfabric_utils::NanoClock;

use super::Supervisor;
use crate::auth::{AuthGate, Credential};
use crate::message::{self, Limits};
use crate::queue::Record;
use crate::topic::Router;
use crate::types::{Action, Object, Subject};
use crate::{FabricError, Result};

pub struct Publisher {
    gate: Arc<AuthGate>,
    supervisor: Arc<Supervisor>,
    router: Router,
    limits: Limits,
    timeout: Duration,
    clock: NanoClock,
    sent: AtomicU64,
    queued: AtomicU64,
}

impl Publisher {
    pub fn new(gate: Arc<AuthGate>, supervisor: Arc<Supervisor>, router: Router, limits: Limits) -> Self {
        let timeout = supervisor.cfg().publish_timeout;
        Self {
            gate,
            supervisor,
            router,
            limits,
            timeout,
            clock: NanoClock::new(),
            sent: AtomicU64::new(0),
            queued: AtomicU64::new(0),
        }
    }

    /// Validates, authorizes and writes one data message.
    ///
    /// Ok means the broker took the message or it is queued for the drain.
    /// `Overloaded` means it was neither and the caller should back off.
    /// `Timeout` leaves the message queued, so it may still be delivered.
    pub async fn publish(
        &self,
        cred: &Credential,
        channel: &str,
        subtopic: &str,
        payload: Bytes,
        protocol: &str,
    ) -> Result<()> {
        self.supervisor.check_available()?;
        let mut msg = message::build(channel, subtopic, payload, protocol, &self.limits)?;
        let identity = self.gate.require(cred, Action::Publish, &Object::channel(channel)).await?;
        msg.publisher = identity.id.to_string();
        msg.created = self.clock.now();

        let subject = self.router.subject_of(&msg.channel, &msg.subtopic);
        self.write(subject, msg.encode_to_bytes()?).await
    }

    async fn write(&self, subject: Subject, payload: Bytes) -> Result<()> {
        if !self.supervisor.writes_direct() {
            return self.enqueue(Record::Data { subject, payload });
        }
        let broker = self.supervisor.broker();
        match tokio::time::timeout(self.timeout, broker.publish(&subject, payload.clone())).await {
            Ok(Ok(())) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => {
                log::debug!("pubsub, publish to {subject} failed, {e}, queued for retry");
                self.enqueue(Record::Data { subject, payload })
            }
            Err(_) => {
                log::warn!("pubsub, publish to {subject} timed out after {:?}", self.timeout);
                self.enqueue(Record::Data { subject, payload })?;
                Err(FabricError::Timeout)
            }
        }
    }

    fn enqueue(&self, r: Record) -> Result<()> {
        if let Err(r) = self.supervisor.queue().push(r) {
            log::warn!("pubsub, recovery queue is full, rejected {r:?}");
            return Err(FabricError::Overloaded);
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.supervisor.wake();
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "sent": self.sent.load(Ordering::Relaxed),
            "queued": self.queued.load(Ordering::Relaxed),
        })
    }
}
