#![deny(unsafe_code)]

//! LoRa bridge.
//!
//! Uplinks arrive as ChirpStack application JSON. The device EUI and the
//! application id are resolved to a thing and a channel through route maps
//! that are kept current from the things, channels, connections and
//! bootstrap event streams. Downlinks are fabric messages on the configured
//! patterns, sent to the device as `tx` frames.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use mfabric::auth::Credential;
use mfabric::bridge::{Bridge, BridgeContext, DeliverySpec, Egress, ExternalMessage};
use mfabric::conf::Settings;
use mfabric::eventlog::{
    OP_CHANNEL_CREATE, OP_CHANNEL_REMOVE, OP_CHANNEL_UPDATE, OP_CONFIG_CREATE, OP_CONFIG_REMOVE,
    OP_CONFIG_UPDATE, OP_THING_CONNECT, OP_THING_CREATE, OP_THING_DISCONNECT, OP_THING_REMOVE,
    OP_THING_UPDATE, OP_THING_UPDATE_CONNECTIONS, STREAM_BOOTSTRAP, STREAM_CHANNELS, STREAM_CONNECTIONS,
    STREAM_THINGS,
};
use mfabric::pubsub::SubscribeOptions;
use mfabric::routemap::RouteMap;
use mfabric::topic::Pattern;
use mfabric::types::{EventRecord, Message};
use mfabric::{FabricError, Result};

pub use config::PluginConfig;

mod config;

pub const NAME: &str = "mfabric-bridge-lora";
pub const PROTOCOL: &str = "lora";

/// ChirpStack application uplink.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Uplink {
    #[serde(rename = "applicationID", default)]
    pub application_id: String,
    #[serde(rename = "applicationName", default)]
    pub application_name: String,
    #[serde(rename = "deviceName", default)]
    pub device_name: String,
    #[serde(rename = "devEUI", default)]
    pub dev_eui: String,
    #[serde(rename = "fPort", default)]
    pub fport: u8,
    #[serde(default)]
    pub data: String,
    /// Decoded by the ChirpStack codec, preferred over `data` when present.
    #[serde(default)]
    pub object: Option<Value>,
}

impl Uplink {
    fn payload(&self) -> Result<Bytes> {
        match &self.object {
            Some(obj) if !obj.is_null() => serde_json::to_vec(obj)
                .map(Bytes::from)
                .map_err(|e| FabricError::Internal(e.to_string())),
            _ => BASE64_STANDARD
                .decode(self.data.as_bytes())
                .map(Bytes::from)
                .map_err(|e| FabricError::MalformedEntity(format!("uplink data is not base64, {e}"))),
        }
    }
}

/// ChirpStack downlink frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Downlink {
    pub confirmed: bool,
    #[serde(rename = "fPort")]
    pub fport: u8,
    pub data: String,
}

struct Maps {
    things: RouteMap,
    channels: RouteMap,
    connections: RouteMap,
}

impl Maps {
    async fn connect(&self, channel: &str, thing: &str) -> Result<()> {
        let c = format!("{channel}:{thing}");
        self.connections.save(&c, &c).await
    }

    async fn disconnect(&self, channel: &str, thing: &str) -> Result<()> {
        self.connections.remove(&format!("{channel}:{thing}")).await
    }

    async fn is_connected(&self, channel: &str, thing: &str) -> Result<bool> {
        match self.connections.get(&format!("{channel}:{thing}")).await {
            Ok(_) => Ok(true),
            Err(FabricError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Default)]
struct Counters {
    uplinks: AtomicU64,
    uplink_errors: AtomicU64,
    downlinks: AtomicU64,
    downlink_skipped: AtomicU64,
    events: AtomicU64,
}

pub struct LoraBridge {
    cfg: PluginConfig,
    credential: Option<Credential>,
    downlinks: Vec<Pattern>,
    egress: Arc<dyn Egress>,
    maps: RwLock<Option<Arc<Maps>>>,
    counters: Counters,
}

impl LoraBridge {
    pub fn new(cfg: PluginConfig, egress: Arc<dyn Egress>) -> Result<Self> {
        let credential = cfg.authorization.as_deref().map(Credential::from_authorization).transpose()?;
        let downlinks = cfg.downlinks.iter().map(|p| Pattern::from_str(p)).collect::<Result<Vec<_>>>()?;
        if !downlinks.is_empty() && credential.is_none() {
            return Err(FabricError::MalformedEntity("downlinks need an authorization to subscribe with".into()));
        }
        Ok(Self { cfg, credential, downlinks, egress, maps: RwLock::new(None), counters: Counters::default() })
    }

    /// Loads `mfabric-bridge-lora` from the plugin config directory.
    pub fn from_settings(settings: &Settings, egress: Arc<dyn Egress>) -> Result<Self> {
        let cfg = settings.plugins.load_config_default::<PluginConfig>(NAME)?;
        log::info!("{} LoraBridge cfg: {:?}", NAME, cfg);
        Self::new(cfg, egress)
    }

    #[inline]
    pub fn cfg(&self) -> &PluginConfig {
        &self.cfg
    }

    fn maps(&self) -> Result<Arc<Maps>> {
        self.maps.read().clone().ok_or_else(|| FabricError::Unavailable(format!("{NAME} is not started")))
    }

    async fn apply_thing(&self, maps: &Maps, ev: &EventRecord) -> Result<()> {
        match ev.operation.as_str() {
            OP_THING_CREATE | OP_THING_UPDATE => {
                let id = required(ev, "id")?;
                match lora_field(ev, "dev_eui") {
                    Some(eui) => maps.things.save(id, &eui).await,
                    None => Ok(()),
                }
            }
            OP_THING_REMOVE => maps.things.remove(required(ev, "id")?).await,
            _ => self.apply_connection(maps, ev).await,
        }
    }

    async fn apply_channel(&self, maps: &Maps, ev: &EventRecord) -> Result<()> {
        match ev.operation.as_str() {
            OP_CHANNEL_CREATE | OP_CHANNEL_UPDATE => {
                let id = required(ev, "id")?;
                match lora_field(ev, "app_id") {
                    Some(app) => maps.channels.save(id, &app).await,
                    None => Ok(()),
                }
            }
            OP_CHANNEL_REMOVE => maps.channels.remove(required(ev, "id")?).await,
            _ => Ok(()),
        }
    }

    async fn apply_connection(&self, maps: &Maps, ev: &EventRecord) -> Result<()> {
        match ev.operation.as_str() {
            OP_THING_CONNECT => maps.connect(required(ev, "chan_id")?, required(ev, "thing_id")?).await,
            OP_THING_DISCONNECT => maps.disconnect(required(ev, "chan_id")?, required(ev, "thing_id")?).await,
            _ => Ok(()),
        }
    }

    async fn apply_bootstrap(&self, maps: &Maps, ev: &EventRecord) -> Result<()> {
        match ev.operation.as_str() {
            OP_CONFIG_CREATE | OP_CONFIG_UPDATE => {
                let thing = required(ev, "thing_id")?;
                if let Some(ext) = ev.get_str("external_id") {
                    maps.things.save(thing, ext).await?;
                }
                for channel in ev.get_str_list("channels") {
                    maps.connect(&channel, thing).await?;
                }
                Ok(())
            }
            OP_CONFIG_REMOVE => {
                let thing = required(ev, "thing_id")?;
                for channel in ev.get_str_list("channels") {
                    maps.disconnect(&channel, thing).await?;
                }
                maps.things.remove(thing).await
            }
            OP_THING_UPDATE_CONNECTIONS => {
                let thing = required(ev, "thing_id")?;
                for channel in ev.get_str_list("channels") {
                    maps.connect(&channel, thing).await?;
                }
                Ok(())
            }
            _ => self.apply_connection(maps, ev).await,
        }
    }

    async fn uplink(&self, ctx: &BridgeContext, msg: ExternalMessage) -> Result<()> {
        let up: Uplink = serde_json::from_slice(&msg.payload)
            .map_err(|e| FabricError::MalformedEntity(format!("uplink from {}, {e}", msg.topic)))?;
        let maps = self.maps()?;

        let thing = maps.things.get(&up.dev_eui).await.map_err(|e| match e {
            FabricError::NotFound => {
                FabricError::MalformedEntity(format!("route map not found for device EUI `{}`", up.dev_eui))
            }
            e => e,
        })?;
        let channel = maps.channels.get(&up.application_id).await.map_err(|e| match e {
            FabricError::NotFound => FabricError::MalformedEntity(format!(
                "route map not found for application id `{}`",
                up.application_id
            )),
            e => e,
        })?;
        if !maps.is_connected(&channel, &thing).await? {
            return Err(FabricError::Forbidden);
        }

        let payload = up.payload()?;
        let cred = msg
            .credential
            .as_ref()
            .or(self.credential.as_ref())
            .ok_or_else(|| FabricError::Unauthenticated("uplink without credential".into()))?;
        ctx.publisher.publish(cred, &channel, &self.cfg.uplink_subtopic, payload, PROTOCOL).await
    }

    fn downlink_topic(&self, app: &str, dev: &str) -> String {
        self.cfg.downlink_topic.replace("{app}", app).replace("{dev}", dev)
    }
}

#[async_trait]
impl Bridge for LoraBridge {
    fn name(&self) -> &str {
        NAME
    }

    #[inline]
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    #[inline]
    fn descr(&self) -> &str {
        env!("CARGO_PKG_DESCRIPTION")
    }

    fn event_streams(&self) -> Vec<String> {
        vec![STREAM_THINGS.into(), STREAM_CHANNELS.into(), STREAM_CONNECTIONS.into(), STREAM_BOOTSTRAP.into()]
    }

    fn deliveries(&self) -> Vec<DeliverySpec> {
        let Some(cred) = self.credential.as_ref() else {
            return Vec::new();
        };
        self.downlinks
            .iter()
            .map(|p| DeliverySpec { credential: cred.clone(), pattern: p.clone(), opts: SubscribeOptions::default() })
            .collect()
    }

    async fn start(&self, ctx: &BridgeContext) -> Result<()> {
        let maps = Maps {
            things: ctx.route_map(&self.cfg.things_prefix),
            channels: ctx.route_map(&self.cfg.channels_prefix),
            connections: ctx.route_map(&self.cfg.connections_prefix),
        };
        self.maps.write().replace(Arc::new(maps));
        log::info!("{NAME} started, downlinks: {:?}", self.cfg.downlinks);
        Ok(())
    }

    async fn stop(&self, _ctx: &BridgeContext) -> Result<()> {
        self.maps.write().take();
        Ok(())
    }

    async fn on_message(&self, ctx: &BridgeContext, msg: ExternalMessage) -> Result<()> {
        let topic = msg.topic.clone();
        match self.uplink(ctx, msg).await {
            Ok(()) => {
                self.counters.uplinks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.uplink_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("{NAME}, uplink from {topic} dropped, {e}");
                Err(e)
            }
        }
    }

    async fn deliver(&self, msg: Message) -> Result<()> {
        //uplinks published by this bridge come back on overlapping patterns
        if msg.protocol == PROTOCOL {
            self.counters.downlink_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let maps = self.maps()?;
        let thing = msg.subtopic.split('.').next().filter(|t| !t.is_empty()).ok_or_else(|| {
            FabricError::InvalidSubtopic(format!("downlink on {} names no thing", msg.channel))
        })?;
        if !maps.is_connected(&msg.channel, thing).await? {
            self.counters.downlink_skipped.fetch_add(1, Ordering::Relaxed);
            log::debug!("{NAME}, thing {thing} is not connected to {}, downlink skipped", msg.channel);
            return Ok(());
        }
        let app = maps.channels.get(&msg.channel).await?;
        let dev = maps.things.get(thing).await?;

        let frame = Downlink { confirmed: self.cfg.confirmed, fport: self.cfg.fport, data: BASE64_STANDARD.encode(&msg.payload) };
        let frame = serde_json::to_vec(&frame).map_err(|e| FabricError::Internal(e.to_string()))?;
        self.egress.send(&self.downlink_topic(&app, &dev), Bytes::from(frame)).await?;
        self.counters.downlinks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn apply_event(&self, stream: &str, ev: &EventRecord) -> Result<()> {
        let maps = self.maps()?;
        match stream {
            STREAM_THINGS => self.apply_thing(&maps, ev).await?,
            STREAM_CHANNELS => self.apply_channel(&maps, ev).await?,
            STREAM_CONNECTIONS => self.apply_connection(&maps, ev).await?,
            STREAM_BOOTSTRAP => self.apply_bootstrap(&maps, ev).await?,
            _ => {}
        }
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn attrs(&self) -> Value {
        let maps = self.maps.read().clone();
        json!({
            "cfg": self.cfg.to_json(),
            "uplinks": self.counters.uplinks.load(Ordering::Relaxed),
            "uplink_errors": self.counters.uplink_errors.load(Ordering::Relaxed),
            "downlinks": self.counters.downlinks.load(Ordering::Relaxed),
            "downlink_skipped": self.counters.downlink_skipped.load(Ordering::Relaxed),
            "events": self.counters.events.load(Ordering::Relaxed),
            "route_maps": maps.map(|m| json!([m.things.to_json(), m.channels.to_json(), m.connections.to_json()])),
        })
    }
}

fn required<'a>(ev: &'a EventRecord, key: &str) -> Result<&'a str> {
    ev.get_str(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FabricError::MalformedEntity(format!("{} event misses `{key}`", ev.operation)))
}

/// `key` from the event itself or from `metadata.lora`, metadata may be a
/// JSON object or its string encoding.
fn lora_field(ev: &EventRecord, key: &str) -> Option<String> {
    if let Some(v) = ev.get_str(key).filter(|v| !v.is_empty()) {
        return Some(v.to_owned());
    }
    let metadata = match ev.fields.get("metadata")? {
        Value::String(s) => serde_json::from_str::<Value>(s).ok()?,
        v => v.clone(),
    };
    metadata.get("lora")?.get(key)?.as_str().filter(|v| !v.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mfabric::auth::{MemoryPolicyOracle, MemoryThingRepository};
    use mfabric::bridge::MemoryEgress;
    use mfabric::broker::MemoryBroker;
    use mfabric::conf::{Inner, SigningKey};
    use mfabric::context::Substrate;
    use mfabric::eventlog::Appended;
    use mfabric::routemap::MemoryStore;
    use mfabric::types::SubjectType;

    use super::*;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        egress: Arc<MemoryEgress>,
        bridge: Arc<LoraBridge>,
        sub: Substrate,
    }

    fn settings() -> Settings {
        let mut inner = Inner::default();
        inner.auth.token.active_key = SigningKey { id: "k1".into(), secret: "lora-secret".into() };
        inner.event_log.block = Duration::from_millis(20);
        inner.event_log.redelivery_backoff = Duration::from_millis(5);
        inner.event_log.backfill = true;
        Settings::from(inner)
    }

    async fn started(downlinks: &[&str]) -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let oracle = Arc::new(MemoryPolicyOracle::new());
        oracle.set_owner("c1", "lora-svc");
        oracle.set_owner("c2", "lora-svc");
        let sub = Substrate::new(
            settings(),
            broker.clone(),
            broker.clone(),
            oracle.clone(),
            Arc::new(MemoryThingRepository::new()),
            Arc::new(MemoryStore::new()),
        );
        let token = sub.gate().issue_token("lora-svc", SubjectType::User, &[]).unwrap();
        let cfg = PluginConfig {
            authorization: Some(format!("Bearer {token}")),
            downlinks: downlinks.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let egress = Arc::new(MemoryEgress::new());
        let bridge = Arc::new(LoraBridge::new(cfg, egress.clone()).unwrap());
        sub.bridges().register(bridge.clone()).await.unwrap();
        sub.start().await.unwrap();
        Fixture { broker, egress, bridge, sub }
    }

    async fn append(f: &Fixture, stream: &str, op: &str, fields: Value) {
        let Value::Object(fields) = fields else { panic!("fields must be an object") };
        let res = f.sub.event_log().append(stream, op, fields).await.unwrap();
        assert!(matches!(res, Appended::Written(_)));
    }

    async fn provision(f: &Fixture) {
        append(f, STREAM_THINGS, OP_THING_CREATE, json!({"id": "t1", "metadata": r#"{"lora":{"dev_eui":"eui-1"}}"#}))
            .await;
        append(f, STREAM_CHANNELS, OP_CHANNEL_CREATE, json!({"id": "c1", "metadata": {"lora": {"app_id": "app-1"}}}))
            .await;
        append(f, STREAM_CONNECTIONS, OP_THING_CONNECT, json!({"chan_id": "c1", "thing_id": "t1"})).await;
        eventually(|| f.bridge.counters.events.load(Ordering::SeqCst) == 3).await;
    }

    async fn eventually<F: Fn() -> bool>(f: F) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn uplink(body: Value) -> ExternalMessage {
        ExternalMessage::new("application/app-1/device/eui-1/rx", Bytes::from(body.to_string()))
    }

    #[test]
    fn metadata_may_be_encoded() {
        let mut fields = serde_json::Map::new();
        fields.insert("metadata".into(), Value::from(r#"{"lora":{"dev_eui":"abc"}}"#));
        let ev = EventRecord::new(OP_THING_CREATE, fields);
        assert_eq!(lora_field(&ev, "dev_eui").as_deref(), Some("abc"));
        assert_eq!(lora_field(&ev, "app_id"), None);
    }

    #[test]
    fn downlinks_need_a_credential() {
        let cfg = PluginConfig { downlinks: vec!["c1.>".into()], ..Default::default() };
        assert!(LoraBridge::new(cfg, Arc::new(MemoryEgress::new())).is_err());
    }

    #[tokio::test]
    async fn uplink_reaches_the_channel() {
        let f = started(&[]).await;
        provision(&f).await;

        let data = BASE64_STANDARD.encode(b"\x01\x02");
        let body = json!({"applicationID": "app-1", "devEUI": "eui-1", "fPort": 1, "data": data});
        f.sub.bridges().on_message(NAME, uplink(body)).await.unwrap();
        assert_eq!(f.broker.writes("m.c1"), 1);

        let body = json!({"applicationID": "app-1", "devEUI": "eui-1", "object": {"temp": 21}});
        f.sub.bridges().on_message(NAME, uplink(body)).await.unwrap();
        assert_eq!(f.broker.writes("m.c1"), 2);
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn uplink_needs_routes() {
        let f = started(&[]).await;

        let body = json!({"applicationID": "app-1", "devEUI": "eui-1", "data": "AQI="});
        let res = f.sub.bridges().on_message(NAME, uplink(body.clone())).await;
        assert!(matches!(res, Err(FabricError::MalformedEntity(_))));

        provision(&f).await;
        append(&f, STREAM_CONNECTIONS, OP_THING_DISCONNECT, json!({"chan_id": "c1", "thing_id": "t1"})).await;
        eventually(|| f.bridge.counters.events.load(Ordering::SeqCst) == 4).await;
        let res = f.sub.bridges().on_message(NAME, uplink(body)).await;
        assert_eq!(res, Err(FabricError::Forbidden));

        let bad = json!({"applicationID": "app-1", "devEUI": "eui-1", "data": "not base64!"});
        append(&f, STREAM_CONNECTIONS, OP_THING_CONNECT, json!({"chan_id": "c1", "thing_id": "t1"})).await;
        eventually(|| f.bridge.counters.events.load(Ordering::SeqCst) == 5).await;
        let res = f.sub.bridges().on_message(NAME, uplink(bad)).await;
        assert!(matches!(res, Err(FabricError::MalformedEntity(_))));
        assert_eq!(f.broker.writes("m.c1"), 0);
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn downlink_goes_to_the_device() {
        let f = started(&["c1.>"]).await;
        provision(&f).await;

        let cred = Credential::from_authorization(f.bridge.cfg().authorization.as_deref().unwrap()).unwrap();
        f.sub.publisher().publish(&cred, "c1", "t1.cmd", Bytes::from_static(b"on"), "http").await.unwrap();
        eventually(|| !f.egress.frames().is_empty()).await;

        let (topic, frame) = f.egress.frames().remove(0);
        assert_eq!(topic, "application/app-1/device/eui-1/tx");
        let frame: Downlink = serde_json::from_slice(&frame).unwrap();
        assert_eq!(frame.fport, 1);
        assert_eq!(BASE64_STANDARD.decode(frame.data).unwrap(), b"on");
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn bootstrap_config_connects() {
        let f = started(&[]).await;
        append(&f, STREAM_CHANNELS, OP_CHANNEL_CREATE, json!({"id": "c2", "app_id": "app-2"})).await;
        append(
            &f,
            STREAM_BOOTSTRAP,
            OP_CONFIG_CREATE,
            json!({"thing_id": "t9", "external_id": "eui-9", "channels": ["c2"]}),
        )
        .await;
        eventually(|| f.bridge.counters.events.load(Ordering::SeqCst) == 2).await;

        let body = json!({"applicationID": "app-2", "devEUI": "eui-9", "data": "AQI="});
        f.sub.bridges().on_message(NAME, uplink(body.clone())).await.unwrap();
        assert_eq!(f.broker.writes("m.c2"), 1);

        append(&f, STREAM_BOOTSTRAP, OP_CONFIG_REMOVE, json!({"thing_id": "t9", "channels": ["c2"]})).await;
        eventually(|| f.bridge.counters.events.load(Ordering::SeqCst) == 3).await;
        assert!(f.sub.bridges().on_message(NAME, uplink(body)).await.is_err());

        let attrs = f.sub.bridges().to_json().await;
        assert_eq!(attrs[0]["attrs"]["uplinks"], 1);
        f.sub.stop().await;
    }
}
