use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use mfabric_conf::Settings;

use crate::auth::{AuthGate, PolicyOracle, ThingRepository};
use crate::bridge::{BridgeContext, BridgeManager};
use crate::broker::{Broker, StreamStore};
use crate::eventlog::{event_handler_fn, Consumer, EventLog, STREAM_POLICIES};
use crate::message::Limits;
use crate::pubsub::{Publisher, Subscriber, Supervisor};
use crate::queue::RecoveryQueue;
use crate::routemap::KvStore;
use crate::topic::Router;
use crate::types::EventRecord;
use crate::Result;

/// The composition root. Owns the broker connection, the auth cache, the
/// event log and the bridges; constructed once and passed by reference.
pub struct Substrate {
    settings: Settings,
    router: Router,
    gate: Arc<AuthGate>,
    supervisor: Arc<Supervisor>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    event_log: Arc<EventLog>,
    bridges: BridgeManager,
    stop: watch::Sender<bool>,
    runner: Mutex<Option<JoinHandle<()>>>,
    policies: Mutex<Option<Consumer>>,
}

impl Substrate {
    pub fn new(
        settings: Settings,
        broker: Arc<dyn Broker>,
        streams: Arc<dyn StreamStore>,
        oracle: Arc<dyn PolicyOracle>,
        things: Arc<dyn ThingRepository>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let router = Router::new(settings.message.subject_prefix.as_str());
        let gate = Arc::new(AuthGate::new(settings.auth.clone(), oracle, things));
        let queue = Arc::new(RecoveryQueue::new(settings.pubsub.recovery_queue_capacity));
        let supervisor = Arc::new(Supervisor::new(broker, streams, queue, settings.pubsub.clone()));
        let publisher =
            Arc::new(Publisher::new(gate.clone(), supervisor.clone(), router.clone(), Limits::from(&settings)));
        let subscriber = Arc::new(Subscriber::new(gate.clone(), supervisor.clone(), router.clone()));
        let event_log = Arc::new(EventLog::new(supervisor.clone(), settings.event_log.clone(), settings.node.id));
        let ctx = BridgeContext::new(settings.clone(), publisher.clone(), subscriber.clone(), event_log.clone(), kv);
        Self {
            settings,
            router,
            gate,
            supervisor,
            publisher,
            subscriber,
            event_log,
            bridges: BridgeManager::new(ctx),
            stop: watch::channel(false).0,
            runner: Mutex::new(None),
            policies: Mutex::new(None),
        }
    }

    /// Connects the broker, then starts the supervisor, the policy
    /// invalidation consumer and every registered bridge. A broker that
    /// cannot be reached within `pubsub.connect_timeout` fails the start.
    pub async fn start(&self) -> Result<()> {
        {
            let mut runner = self.runner.lock().await;
            if runner.is_some() {
                return Ok(());
            }
            self.supervisor.connect().await?;
            self.stop.send_replace(false);
            runner.replace(tokio::spawn(self.supervisor.clone().run(self.stop.subscribe())));
        }

        //every node keeps its own cache, so every node needs every event
        let group = format!("{}-{}", self.settings.auth.policies_group, self.settings.node.id);
        let gate = self.gate.clone();
        let handler = event_handler_fn(move |ev: EventRecord| {
            let gate = gate.clone();
            async move { gate.apply_policy_event(&ev) }
        });
        let consumer = self.event_log.consume(STREAM_POLICIES, &group, handler).await?;
        self.policies.lock().await.replace(consumer);

        self.bridges.start_all().await?;
        log::info!("substrate started on node {}, broker: {}", self.settings.node.id, self.supervisor.broker().name());
        Ok(())
    }

    /// Stops bridges first, then the consumers and the broker connection.
    pub async fn stop(&self) {
        self.bridges.stop_all().await;
        if let Some(consumer) = self.policies.lock().await.take() {
            consumer.stop().await;
        }
        self.stop.send_replace(true);
        if let Some(runner) = self.runner.lock().await.take() {
            if let Err(e) = runner.await {
                log::warn!("substrate, supervisor ended abnormally, {e}");
            }
        }
        if let Err(e) = self.supervisor.broker().close().await {
            log::warn!("substrate, closing broker {} failed, {e}", self.supervisor.broker().name());
        }
        log::info!("substrate stopped");
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[inline]
    pub fn router(&self) -> &Router {
        &self.router
    }

    #[inline]
    pub fn gate(&self) -> &Arc<AuthGate> {
        &self.gate
    }

    #[inline]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    #[inline]
    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    #[inline]
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    #[inline]
    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    #[inline]
    pub fn bridges(&self) -> &BridgeManager {
        &self.bridges
    }

    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "node": self.settings.node.id,
            "pubsub": self.supervisor.to_json(),
            "publisher": self.publisher.to_json(),
            "event_log": self.event_log.to_json(),
            "auth": self.gate.to_json(),
            "bridges": self.bridges.to_json().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    use mfabric_conf::{Inner, SigningKey};

    use super::*;
    use crate::auth::{Credential, MemoryPolicyOracle, MemoryThingRepository};
    use crate::bridge::{Bridge, ExternalMessage};
    use crate::broker::MemoryBroker;
    use crate::eventlog::{PolicyChange, OP_CONFIG_CREATE, STREAM_BOOTSTRAP};
    use crate::pubsub::{handler_fn, ConnState, MessageHandler, SubscribeOptions};
    use crate::routemap::MemoryStore;
    use crate::topic::Pattern;
    use crate::types::{Action, Message, ObjectType, PolicyTuple, SubjectType};
    use crate::FabricError;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        oracle: Arc<MemoryPolicyOracle>,
        things: Arc<MemoryThingRepository>,
        kv: Arc<MemoryStore>,
        sub: Substrate,
    }

    fn settings() -> Settings {
        let mut inner = Inner::default();
        inner.auth.token.active_key = SigningKey { id: "k1".into(), secret: "fabric-secret".into() };
        inner.pubsub.reconnect_initial = Duration::from_millis(10);
        inner.pubsub.reconnect_max = Duration::from_millis(50);
        inner.pubsub.recovery_queue_capacity = 50;
        inner.event_log.block = Duration::from_millis(20);
        inner.event_log.redelivery_backoff = Duration::from_millis(5);
        inner.event_log.backfill = true;
        Settings::from(inner)
    }

    fn fixture_on(broker: Arc<MemoryBroker>) -> Fixture {
        let oracle = Arc::new(MemoryPolicyOracle::new());
        let things = Arc::new(MemoryThingRepository::new());
        let kv = Arc::new(MemoryStore::new());
        let sub = Substrate::new(settings(), broker.clone(), broker.clone(), oracle.clone(), things.clone(), kv.clone());
        Fixture { broker, oracle, things, kv, sub }
    }

    async fn started() -> Fixture {
        let f = fixture_on(Arc::new(MemoryBroker::new()));
        f.sub.start().await.unwrap();
        f
    }

    fn bearer(f: &Fixture, user: &str) -> Credential {
        Credential::Bearer(f.sub.gate().issue_token(user, SubjectType::User, &[]).unwrap())
    }

    fn collect(tx: mpsc::UnboundedSender<Message>) -> MessageHandler {
        handler_fn(move |m| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m);
                Ok(())
            }
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap()
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

    #[tokio::test]
    async fn happy_publish() {
        let f = started().await;
        f.oracle.set_owner("ch1", "u1");
        let cred = bearer(&f, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pattern = Pattern::from_str("ch1.temp.*").unwrap();
        let s = f.sub.subscriber().subscribe(&cred, &pattern, SubscribeOptions::default(), collect(tx)).await.unwrap();

        f.sub.publisher().publish(&cred, "ch1", "temp.room1", Bytes::from_static(&[0x7B]), "http").await.unwrap();
        let m = recv(&mut rx).await;
        assert_eq!(m.publisher, "u1");
        assert!(m.created > 0);
        assert_eq!(m.subtopic, "temp.room1");
        assert_eq!(&m.payload[..], &[0x7B]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());

        s.unsubscribe().await.unwrap();
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn wildcard_fan_out() {
        let f = started().await;
        f.oracle.set_owner("ch1", "u1");
        let cred = bearer(&f, "u1");
        let pattern = Pattern::from_str("ch1.>").unwrap();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (txq, mut rxq) = mpsc::unbounded_channel();
        let subscriber = f.sub.subscriber();
        let s1 = subscriber.subscribe(&cred, &pattern, SubscribeOptions::default(), collect(tx1)).await.unwrap();
        let q = SubscribeOptions::default().queue_group("q");
        let s2 = subscriber.subscribe(&cred, &pattern, q.clone(), collect(txq.clone())).await.unwrap();
        let s3 = subscriber.subscribe(&cred, &pattern, q, collect(txq)).await.unwrap();

        for st in ["a", "b", "c"] {
            f.sub.publisher().publish(&cred, "ch1", st, Bytes::from_static(b"x"), "mqtt").await.unwrap();
        }
        let mut all = Vec::new();
        let mut grouped = Vec::new();
        for _ in 0..3 {
            all.push(recv(&mut rx1).await.subtopic);
            grouped.push(recv(&mut rxq).await.subtopic);
        }
        grouped.sort();
        assert_eq!(all, vec!["a", "b", "c"]);
        assert_eq!(grouped, vec!["a", "b", "c"]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rxq.try_recv().is_err());

        for s in [s1, s2, s3] {
            s.unsubscribe().await.unwrap();
        }
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn authorization_denial() {
        let f = started().await;
        f.things.create("t7", "dev-secret-X").unwrap();
        f.oracle.add_policy(PolicyTuple {
            subject_type: SubjectType::Thing,
            subject_id: "t7".into(),
            relation: Action::Publish,
            object_type: ObjectType::Channel,
            object_id: "ch2".into(),
        });
        f.oracle.set_owner("ch1", "u1");
        let cred = Credential::from_authorization("Thing dev-secret-X").unwrap();

        let res = f.sub.publisher().publish(&cred, "ch1", "", Bytes::from_static(b"1"), "http").await;
        assert_eq!(res, Err(FabricError::Forbidden));
        assert_eq!(f.broker.writes("m.ch1"), 0);

        f.sub.publisher().publish(&cred, "ch2", "", Bytes::from_static(b"1"), "http").await.unwrap();
        assert_eq!(f.broker.writes("m.ch2"), 1);
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn outage_then_recovery() {
        let f = started().await;
        f.oracle.set_owner("ch1", "u1");
        let cred = bearer(&f, "u1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pattern = Pattern::from_str("ch1.seq").unwrap();
        let s = f.sub.subscriber().subscribe(&cred, &pattern, SubscribeOptions::default(), collect(tx)).await.unwrap();

        f.broker.set_reachable(false);
        let mut accepted = Vec::new();
        let mut overloaded = 0;
        for i in 0..100u32 {
            let payload = Bytes::from(i.to_string());
            match f.sub.publisher().publish(&cred, "ch1", "seq", payload, "http").await {
                Ok(()) => accepted.push(i.to_string()),
                Err(FabricError::Overloaded) => overloaded += 1,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(accepted.len(), 50);
        assert_eq!(overloaded, 50);
        assert_eq!(accepted, (0..50u32).map(|i| i.to_string()).collect::<Vec<_>>());

        f.broker.set_reachable(true);
        //the queue is still full until the drain starts
        loop {
            match f.sub.publisher().publish(&cred, "ch1", "seq", Bytes::from_static(b"after"), "http").await {
                Ok(()) => break,
                Err(FabricError::Overloaded) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => panic!("unexpected {e}"),
            }
        }

        let mut got = Vec::new();
        for _ in 0..51 {
            got.push(String::from_utf8(recv(&mut rx).await.payload.to_vec()).unwrap());
        }
        let mut expected = accepted.clone();
        expected.push("after".into());
        assert_eq!(got, expected);

        s.unsubscribe().await.unwrap();
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn policy_change_invalidation() {
        let f = started().await;
        let cred = bearer(&f, "u1");
        let tuple = PolicyTuple {
            subject_type: SubjectType::User,
            subject_id: "u1".into(),
            relation: Action::Publish,
            object_type: ObjectType::Channel,
            object_id: "ch3".into(),
        };
        f.oracle.add_policy(tuple.clone());
        f.sub.publisher().publish(&cred, "ch3", "", Bytes::from_static(b"1"), "http").await.unwrap();

        f.oracle.delete_policy(&tuple);
        f.sub.event_log().append_policy(PolicyChange::Delete, &tuple).await.unwrap();

        //well inside the 5s positive TTL, only the event can explain a denial
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let res = f.sub.publisher().publish(&cred, "ch3", "", Bytes::from_static(b"1"), "http").await;
                if res == Err(FabricError::Forbidden) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        f.sub.stop().await;
    }

    struct ConfigBridge {
        name: &'static str,
        applied: AtomicU64,
        ctx: parking_lot::Mutex<Option<BridgeContext>>,
    }

    impl ConfigBridge {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, applied: AtomicU64::new(0), ctx: parking_lot::Mutex::new(None) })
        }
    }

    #[async_trait]
    impl Bridge for ConfigBridge {
        fn name(&self) -> &str {
            self.name
        }

        fn event_streams(&self) -> Vec<String> {
            vec![STREAM_BOOTSTRAP.into()]
        }

        async fn start(&self, ctx: &BridgeContext) -> Result<()> {
            self.ctx.lock().replace(ctx.clone());
            Ok(())
        }

        async fn on_message(&self, _ctx: &BridgeContext, _msg: ExternalMessage) -> Result<()> {
            Ok(())
        }

        async fn apply_event(&self, _stream: &str, ev: &EventRecord) -> Result<()> {
            if ev.operation != OP_CONFIG_CREATE {
                return Ok(());
            }
            let ctx = self.ctx.lock().clone().ok_or(FabricError::Unavailable("bridge is not started".into()))?;
            let thing = ev.get_str("thing_id").ok_or(FabricError::MalformedEntity("thing_id".into()))?;
            let ext = ev.get_str("external_id").ok_or(FabricError::MalformedEntity("external_id".into()))?;
            ctx.route_map("lora").save(thing, ext).await?;
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn bootstrap_event_round_trip() {
        let f = fixture_on(Arc::new(MemoryBroker::new()));
        let bridge = ConfigBridge::new("config");
        f.sub.bridges().register(bridge.clone()).await.unwrap();
        assert!(f.sub.bridges().register(ConfigBridge::new("config")).await.is_err());
        f.sub.start().await.unwrap();

        let fields = json!({"thing_id": "t9", "channels": ["c1", "c2"], "external_id": "e9"});
        let serde_json::Value::Object(fields) = fields else { unreachable!() };
        f.sub.event_log().append(STREAM_BOOTSTRAP, OP_CONFIG_CREATE, fields).await.unwrap();

        eventually(|| bridge.applied.load(Ordering::SeqCst) == 1).await;
        let rm = f.sub.bridges().context().route_map("lora");
        assert_eq!(rm.get("e9").await.unwrap(), "t9");
        assert_eq!(f.kv.get("lora:ext:e9").await.unwrap().as_deref(), Some("t9"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bridge.applied.load(Ordering::SeqCst), 1);

        let attrs = f.sub.bridges().to_json().await;
        assert_eq!(attrs[0]["name"], "config");
        assert_eq!(attrs[0]["consumers"][0]["stats"]["acked"], 1);

        //a fresh group on a fresh store rebuilds the same state
        let replay = fixture_on(f.broker.clone());
        let again = ConfigBridge::new("config-replay");
        replay.sub.bridges().register(again.clone()).await.unwrap();
        replay.sub.start().await.unwrap();
        eventually(|| again.applied.load(Ordering::SeqCst) == 1).await;
        assert_eq!(replay.kv.get("lora:ext:e9").await.unwrap().as_deref(), Some("t9"));
        assert_eq!(replay.kv.get("lora:id:t9").await.unwrap().as_deref(), Some("e9"));

        replay.sub.bridges().stop_all().await;
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn start_connects_the_broker_first() {
        //reachable but never connected, as a client before its first dial
        let broker = Arc::new(MemoryBroker::new());
        broker.set_reachable(false);
        broker.set_reachable(true);
        assert!(!broker.is_connected());

        let f = fixture_on(broker);
        let bridge = ConfigBridge::new("config");
        f.sub.bridges().register(bridge).await.unwrap();
        f.sub.start().await.unwrap();
        assert!(f.broker.is_connected());
        assert_eq!(f.sub.supervisor().state(), ConnState::Connected);
        assert_eq!(f.sub.to_json().await["bridges"][0]["active"], true);
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn unreachable_broker_fails_start() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_reachable(false);
        let f = fixture_on(broker);
        let err = f.sub.start().await.unwrap_err();
        assert!(matches!(err, FabricError::BrokerUnreachable(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);

        //nothing was started, so a later start can still succeed
        f.broker.set_reachable(true);
        f.sub.start().await.unwrap();
        assert!(f.broker.is_connected());
        f.sub.stop().await;
    }

    #[tokio::test]
    async fn stop_is_orderly() {
        let f = started().await;
        let bridge = ConfigBridge::new("late");
        f.sub.bridges().register(bridge).await.unwrap();
        f.sub.bridges().start_all().await.unwrap();
        assert_eq!(f.sub.to_json().await["bridges"][0]["active"], true);
        f.sub.stop().await;
        assert_eq!(f.sub.bridges().to_json().await[0]["active"], false);
        assert!(!f.broker.is_connected());
    }
}
