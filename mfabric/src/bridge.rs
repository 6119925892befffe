//! Protocol bridge kit.
//!
//! A [`Bridge`] adapts one external protocol to the fabric. Ingress goes
//! through [`Bridge::on_message`], which resolves external addressing with
//! route maps and publishes with a credential taken from the external
//! connection. The [`BridgeManager`] wires the rest: it consumes the event
//! streams a bridge derives state from and subscribes the patterns it
//! delivers back out.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::Mutex;

use mfabric_conf::{RouteMap as RouteMapConfig, Settings};

use crate::auth::Credential;
use crate::eventlog::{event_handler_fn, Consumer, EventLog};
use crate::pubsub::{handler_fn, Publisher, SubscribeOptions, Subscriber, Subscription};
use crate::routemap::{KvStore, RouteMap};
use crate::topic::Pattern;
use crate::types::{EventRecord, Message};
use crate::{FabricError, Result};

/// A frame as the wire library hands it over.
#[derive(Debug, Clone)]
pub struct ExternalMessage {
    /// Protocol address, an MQTT topic, a URL path or a node id.
    pub topic: String,
    pub payload: Bytes,
    /// Credential of the external connection, bridges that publish under a
    /// service identity leave it empty.
    pub credential: Option<Credential>,
}

impl ExternalMessage {
    pub fn new<T: Into<String>>(topic: T, payload: Bytes) -> Self {
        Self { topic: topic.into(), payload, credential: None }
    }

    pub fn with_credential(mut self, cred: Credential) -> Self {
        self.credential = Some(cred);
        self
    }
}

/// A subscription the manager holds on a bridge's behalf, every matching
/// message goes to [`Bridge::deliver`].
pub struct DeliverySpec {
    pub credential: Credential,
    pub pattern: Pattern,
    pub opts: SubscribeOptions,
}

/// Outbound side of a wire protocol.
#[async_trait]
pub trait Egress: Send + Sync + 'static {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// Collects outbound frames, for embedding and tests.
#[derive(Default)]
pub struct MemoryEgress {
    frames: parking_lot::Mutex<Vec<(String, Bytes)>>,
}

impl MemoryEgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<(String, Bytes)> {
        self.frames.lock().clone()
    }
}

#[async_trait]
impl Egress for MemoryEgress {
    async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.frames.lock().push((topic.to_owned(), payload));
        Ok(())
    }
}

/// What a bridge gets from the substrate. Cloning is cheap.
#[derive(Clone)]
pub struct BridgeContext {
    pub settings: Settings,
    pub publisher: Arc<Publisher>,
    pub subscriber: Arc<Subscriber>,
    pub event_log: Arc<EventLog>,
    kv: Arc<dyn KvStore>,
    route_map_cfg: RouteMapConfig,
}

impl BridgeContext {
    pub fn new(
        settings: Settings,
        publisher: Arc<Publisher>,
        subscriber: Arc<Subscriber>,
        event_log: Arc<EventLog>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let route_map_cfg = settings.route_map.clone();
        Self { settings, publisher, subscriber, event_log, kv, route_map_cfg }
    }

    /// A route map over the shared key-value store.
    pub fn route_map(&self, prefix: &str) -> RouteMap {
        RouteMap::new(prefix, self.kv.clone(), &self.route_map_cfg)
    }
}

#[async_trait]
pub trait Bridge: Send + Sync + 'static {
    fn name(&self) -> &str;

    #[inline]
    fn version(&self) -> &str {
        "0.0.0"
    }

    #[inline]
    fn descr(&self) -> &str {
        ""
    }

    /// Event streams applied through [`Bridge::apply_event`].
    #[inline]
    fn event_streams(&self) -> Vec<String> {
        Vec::new()
    }

    /// Consumer group on the event streams, one group per bridge so every
    /// bridge sees every event.
    #[inline]
    fn consumer_group(&self) -> String {
        format!("bridge-{}", self.name())
    }

    /// Patterns delivered through [`Bridge::deliver`].
    #[inline]
    fn deliveries(&self) -> Vec<DeliverySpec> {
        Vec::new()
    }

    #[inline]
    async fn start(&self, _ctx: &BridgeContext) -> Result<()> {
        Ok(())
    }

    #[inline]
    async fn stop(&self, _ctx: &BridgeContext) -> Result<()> {
        Ok(())
    }

    /// Ingress: translate, build and publish one external frame.
    async fn on_message(&self, ctx: &BridgeContext, msg: ExternalMessage) -> Result<()>;

    /// Egress: map a fabric message back to a protocol frame.
    #[inline]
    async fn deliver(&self, _msg: Message) -> Result<()> {
        Ok(())
    }

    /// Err nacks the event, it is redelivered and finally dead-lettered.
    async fn apply_event(&self, stream: &str, ev: &EventRecord) -> Result<()>;

    #[inline]
    async fn attrs(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

struct Entry {
    bridge: Arc<dyn Bridge>,
    active: bool,
    consumers: Vec<Consumer>,
    subs: Vec<Subscription>,
}

/// Bridges in registration order. Started in that order, stopped in reverse.
pub struct BridgeManager {
    ctx: BridgeContext,
    entries: Mutex<Vec<Entry>>,
}

impl BridgeManager {
    pub fn new(ctx: BridgeContext) -> Self {
        Self { ctx, entries: Mutex::new(Vec::new()) }
    }

    #[inline]
    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    pub async fn register(&self, bridge: Arc<dyn Bridge>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.bridge.name() == bridge.name()) {
            return Err(FabricError::Conflict(format!("bridge {} is already registered", bridge.name())));
        }
        log::info!("bridge {} {} registered", bridge.name(), bridge.version());
        entries.push(Entry { bridge, active: false, consumers: Vec::new(), subs: Vec::new() });
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Bridge>> {
        self.entries.lock().await.iter().find(|e| e.bridge.name() == name).map(|e| e.bridge.clone())
    }

    /// Hands an external frame to the named bridge.
    pub async fn on_message(&self, name: &str, msg: ExternalMessage) -> Result<()> {
        let bridge = self.get(name).await.ok_or(FabricError::NotFound)?;
        bridge.on_message(&self.ctx, msg).await
    }

    pub async fn start_all(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut().filter(|e| !e.active) {
            if let Err(e) = self.start(entry).await {
                log::error!("bridge {} failed to start, {e}", entry.bridge.name());
                self.stop(entry).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn start(&self, entry: &mut Entry) -> Result<()> {
        let bridge = entry.bridge.clone();
        bridge.start(&self.ctx).await?;
        entry.active = true;

        let group = bridge.consumer_group();
        for stream in bridge.event_streams() {
            let b = bridge.clone();
            let s = stream.clone();
            let handler = event_handler_fn(move |ev: EventRecord| {
                let b = b.clone();
                let s = s.clone();
                async move { b.apply_event(&s, &ev).await }
            });
            entry.consumers.push(self.ctx.event_log.consume(&stream, &group, handler).await?);
        }

        for d in bridge.deliveries() {
            let b = bridge.clone();
            let handler = handler_fn(move |msg: Message| {
                let b = b.clone();
                async move { b.deliver(msg).await }
            });
            let sub = self.ctx.subscriber.subscribe(&d.credential, &d.pattern, d.opts, handler).await?;
            entry.subs.push(sub);
        }
        log::info!(
            "bridge {} started, streams: {}, deliveries: {}",
            bridge.name(),
            entry.consumers.len(),
            entry.subs.len()
        );
        Ok(())
    }

    async fn stop(&self, entry: &mut Entry) {
        for sub in entry.subs.drain(..).rev() {
            let subject = sub.subject().to_owned();
            if let Err(e) = sub.unsubscribe().await {
                log::warn!("bridge {}, unsubscribe from {subject} failed, {e}", entry.bridge.name());
            }
        }
        for consumer in entry.consumers.drain(..).rev() {
            consumer.stop().await;
        }
        if entry.active {
            if let Err(e) = entry.bridge.stop(&self.ctx).await {
                log::warn!("bridge {} failed to stop cleanly, {e}", entry.bridge.name());
            }
            entry.active = false;
            log::info!("bridge {} stopped", entry.bridge.name());
        }
    }

    pub async fn stop_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut().rev() {
            self.stop(entry).await;
        }
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let entries = self.entries.lock().await;
        let mut out = Vec::with_capacity(entries.len());
        for e in entries.iter() {
            out.push(json!({
                "name": e.bridge.name(),
                "version": e.bridge.version(),
                "descr": e.bridge.descr(),
                "active": e.active,
                "consumers": e.consumers.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
                "subscriptions": e.subs.iter().map(|s| json!({"subject": s.subject(), "stats": s.stats()})).collect::<Vec<_>>(),
                "attrs": e.bridge.attrs().await,
            }));
        }
        serde_json::Value::Array(out)
    }
}
