//! Control-plane event log.
//!
//! Events are appended to capped broker streams and fanned out to consumer
//! groups. Appends that cannot reach the stream store go to the recovery
//! queue ahead of data messages, so control-plane state catches up first
//! once the broker is back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Map, Value};

use mfabric_conf::EventLog as EventLogConfig;
use mfabric_utils::timestamp_nanos;

pub use self::consumer::{event_handler_fn, Consumer, ConsumerStats, EventHandler};

use crate::pubsub::{ConnState, Supervisor};
use crate::queue::{Priority, Record};
use crate::types::{EventId, EventRecord, NodeId, PolicyTuple, StreamId};
use crate::{FabricError, Result};

mod consumer;

pub const STREAM_BOOTSTRAP: &str = "bootstrap";
pub const STREAM_THINGS: &str = "things";
pub const STREAM_CHANNELS: &str = "channels";
pub const STREAM_CONNECTIONS: &str = "connections";
pub const STREAM_POLICIES: &str = "policies";

pub const OP_THING_CREATE: &str = "thing.create";
pub const OP_THING_UPDATE: &str = "thing.update";
pub const OP_THING_REMOVE: &str = "thing.remove";
pub const OP_THING_CONNECT: &str = "thing.connect";
pub const OP_THING_DISCONNECT: &str = "thing.disconnect";

pub const OP_CHANNEL_CREATE: &str = "channel.create";
pub const OP_CHANNEL_UPDATE: &str = "channel.update";
pub const OP_CHANNEL_REMOVE: &str = "channel.remove";

pub const OP_CONFIG_CREATE: &str = "config.create";
pub const OP_CONFIG_UPDATE: &str = "config.update";
pub const OP_CONFIG_REMOVE: &str = "config.remove";
pub const OP_CONFIG_LIST: &str = "config.list";
pub const OP_CONFIG_REMOVE_HANDLER: &str = "config.remove_handler";
pub const OP_THING_BOOTSTRAP: &str = "thing.bootstrap";
pub const OP_THING_CHANGE_STATE: &str = "thing.change_state";
pub const OP_THING_UPDATE_CONNECTIONS: &str = "thing.update_connections";
pub const OP_GROUP_UPDATE_HANDLER: &str = "group.update_handler";
pub const OP_GROUP_REMOVE_HANDLER: &str = "group.remove_handler";
pub const OP_CERT_UPDATE: &str = "cert.update";

pub const OP_ADD_POLICY: &str = "add_policy";
pub const OP_DELETE_POLICY: &str = "delete_policy";

/// Dead-letter field names, next to the original event fields.
pub const KEY_DEAD_LETTER_OF: &str = "dead_letter_of";
pub const KEY_FAILURES: &str = "failures";
pub const KEY_LAST_ERROR: &str = "last_error";

/// Operations accepted on the enumerated streams, none for other streams.
pub fn operations(stream: &str) -> Option<&'static [&'static str]> {
    Some(match stream {
        STREAM_BOOTSTRAP => &[
            OP_CONFIG_CREATE,
            OP_CONFIG_UPDATE,
            OP_CONFIG_REMOVE,
            OP_CONFIG_LIST,
            OP_CONFIG_REMOVE_HANDLER,
            OP_THING_BOOTSTRAP,
            OP_THING_CHANGE_STATE,
            OP_THING_UPDATE_CONNECTIONS,
            OP_THING_CONNECT,
            OP_THING_DISCONNECT,
            OP_GROUP_UPDATE_HANDLER,
            OP_GROUP_REMOVE_HANDLER,
            OP_CERT_UPDATE,
        ],
        STREAM_THINGS => {
            &[OP_THING_CREATE, OP_THING_UPDATE, OP_THING_REMOVE, OP_THING_CONNECT, OP_THING_DISCONNECT]
        }
        STREAM_CHANNELS => &[OP_CHANNEL_CREATE, OP_CHANNEL_UPDATE, OP_CHANNEL_REMOVE],
        STREAM_CONNECTIONS => &[OP_THING_CONNECT, OP_THING_DISCONNECT],
        STREAM_POLICIES => &[OP_ADD_POLICY, OP_DELETE_POLICY],
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Written(EventId),
    /// Held by the recovery queue, the id is assigned when it drains.
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyChange {
    Add,
    Delete,
}

impl PolicyChange {
    #[inline]
    pub fn operation(&self) -> &'static str {
        match self {
            PolicyChange::Add => OP_ADD_POLICY,
            PolicyChange::Delete => OP_DELETE_POLICY,
        }
    }
}

pub struct EventLog {
    supervisor: Arc<Supervisor>,
    cfg: EventLogConfig,
    node_id: NodeId,
    timeout: Duration,
    appended: AtomicU64,
    queued: AtomicU64,
    dead_lettered: AtomicU64,
}

impl EventLog {
    pub fn new(supervisor: Arc<Supervisor>, cfg: EventLogConfig, node_id: NodeId) -> Self {
        let timeout = supervisor.cfg().publish_timeout;
        Self {
            supervisor,
            cfg,
            node_id,
            timeout,
            appended: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn cfg(&self) -> &EventLogConfig {
        &self.cfg
    }

    #[inline]
    pub fn dead_letter_stream(&self, stream: &str) -> StreamId {
        StreamId::from(format!("{stream}{}", self.cfg.dead_letter_suffix))
    }

    /// Appends one event, stamping `occurred_at`.
    ///
    /// While the stream store is unreachable, or earlier events are still
    /// queued, the event is queued instead and `Appended::Queued` returned.
    pub async fn append(&self, stream: &str, operation: &str, fields: Map<String, Value>) -> Result<Appended> {
        if stream.is_empty() {
            return Err(FabricError::MalformedEntity("empty stream id".into()));
        }
        if operation.is_empty() {
            return Err(FabricError::MalformedEntity("empty operation".into()));
        }
        if let Some(ops) = operations(stream) {
            if !ops.contains(&operation) {
                return Err(FabricError::MalformedEntity(format!(
                    "unknown operation `{operation}` on stream `{stream}`"
                )));
            }
        }
        let mut ev = EventRecord::new(operation, fields);
        ev.occurred_at = timestamp_nanos();
        self.write(stream, &ev).await
    }

    /// `add_policy` / `delete_policy` carrying the full tuple.
    pub async fn append_policy(&self, change: PolicyChange, tuple: &PolicyTuple) -> Result<Appended> {
        self.append(STREAM_POLICIES, change.operation(), tuple.to_fields()).await
    }

    async fn write(&self, stream: &str, ev: &EventRecord) -> Result<Appended> {
        self.supervisor.check_available()?;
        let payload = ev.encode()?;
        let queued = |payload: Bytes| Record::Event { stream: StreamId::from(stream), payload, max_len: self.cfg.max_len };

        let direct =
            self.supervisor.state() == ConnState::Connected && self.supervisor.queue().pending(Priority::High) == 0;
        if !direct {
            return self.enqueue(queued(payload));
        }

        let streams = self.supervisor.streams();
        match tokio::time::timeout(self.timeout, streams.append(stream, payload.clone(), self.cfg.max_len)).await {
            Ok(Ok(id)) => {
                self.appended.fetch_add(1, Ordering::Relaxed);
                log::debug!("event log, appended {} to {stream}, id: {id}", ev.operation);
                Ok(Appended::Written(id))
            }
            Ok(Err(e)) => {
                log::info!("event log, append {} to {stream} failed, {e}, queued for retry", ev.operation);
                self.enqueue(queued(payload))
            }
            Err(_) => {
                log::warn!("event log, append to {stream} timed out after {:?}", self.timeout);
                self.enqueue(queued(payload))?;
                Err(FabricError::Timeout)
            }
        }
    }

    fn enqueue(&self, r: Record) -> Result<Appended> {
        if let Err(r) = self.supervisor.queue().push(r) {
            log::warn!("event log, recovery queue is full, rejected {r:?}");
            return Err(FabricError::Overloaded);
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.supervisor.wake();
        Ok(Appended::Queued)
    }

    /// Moves a poison event to `<stream><dead_letter_suffix>`.
    pub(crate) async fn dead_letter(
        &self,
        stream: &str,
        ev: &EventRecord,
        failures: u32,
        last_error: &FabricError,
    ) -> Result<Appended> {
        let mut fields = ev.fields.clone();
        fields.insert(KEY_DEAD_LETTER_OF.into(), Value::from(ev.event_id));
        fields.insert(KEY_FAILURES.into(), Value::from(failures));
        fields.insert(KEY_LAST_ERROR.into(), Value::from(last_error.to_string()));
        let mut dead = EventRecord::new(ev.operation.clone(), fields);
        dead.occurred_at = ev.occurred_at;

        let dlq = self.dead_letter_stream(stream);
        let res = self.write(&dlq, &dead).await?;
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "event log, {} {} on {stream} failed {failures} times, moved to {dlq}, {last_error}",
            ev.operation,
            ev.event_id
        );
        Ok(res)
    }

    /// Consumes `stream` as a member of `group`.
    ///
    /// The group is created on first use at the tail of the stream, or at the
    /// head with `backfill`. Entries this node received but never acked are
    /// handled again before new ones. Each event is acked once the handler
    /// returns Ok; an Err is a nack and the event is retried with backoff
    /// until `nack_limit` consecutive failures move it to the dead-letter
    /// stream.
    pub async fn consume(self: &Arc<Self>, stream: &str, group: &str, handler: EventHandler) -> Result<Consumer> {
        consumer::start(self.clone(), StreamId::from(stream), group.into(), handler).await
    }

    #[inline]
    pub(crate) fn consumer_name(&self, group: &str) -> String {
        format!("{group}-{}", self.node_id)
    }

    #[inline]
    pub(crate) fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "appended": self.appended.load(Ordering::Relaxed),
            "queued": self.queued.load(Ordering::Relaxed),
            "dead_lettered": self.dead_lettered.load(Ordering::Relaxed),
        })
    }
}
