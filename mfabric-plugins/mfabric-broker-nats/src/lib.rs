#![deny(unsafe_code)]

//! [`Broker`] over a NATS server.
//!
//! Covers the subject data plane only, streams stay on a [`StreamStore`]
//! of their own. The client reconnects and restores its subscriptions by
//! itself, so registrations never go stale and the epoch stays at zero.
//!
//! [`StreamStore`]: mfabric::broker::StreamStore

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_nats::connection::State;
use async_nats::{connect_with_options, Client, ConnectOptions, ServerAddr, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mfabric::broker::{Broker, BrokerSubscription, Delivery, SubscriptionId};
use mfabric::conf::Settings;
use mfabric::types::DashMap;
use mfabric::{FabricError, Result};

pub use config::PluginConfig;

mod config;

pub const NAME: &str = "mfabric-broker-nats";

pub struct NatsBroker {
    cfg: PluginConfig,
    servers: Vec<ServerAddr>,
    client_name: String,
    client: RwLock<Option<Client>>,
    next_id: AtomicU64,
    subs: DashMap<SubscriptionId, JoinHandle<()>>,
}

impl NatsBroker {
    pub fn new(cfg: PluginConfig) -> Result<Self> {
        let servers = parse_servers(&cfg.servers)?;
        let client_name = format!("{}-{}", cfg.name_prefix, uuid::Uuid::new_v4());
        Ok(Self {
            cfg,
            servers,
            client_name,
            client: RwLock::new(None),
            next_id: AtomicU64::new(1),
            subs: DashMap::default(),
        })
    }

    /// Loads `mfabric-broker-nats` from the plugin config directory.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let cfg = settings.plugins.load_config_default::<PluginConfig>(NAME)?;
        log::info!("{} NatsBroker cfg: {:?}", NAME, cfg);
        Self::new(cfg)
    }

    #[inline]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    fn options(&self) -> ConnectOptions {
        let cfg = &self.cfg;
        let mut opts = ConnectOptions::new().name(&self.client_name).connection_timeout(cfg.connection_timeout);
        if let Some(max_reconnects) = cfg.max_reconnects {
            opts = opts.max_reconnects(max_reconnects);
        }
        if let Some(ping_interval) = cfg.ping_interval {
            opts = opts.ping_interval(ping_interval);
        }
        if let Some(sender_capacity) = cfg.sender_capacity {
            opts = opts.client_capacity(sender_capacity);
        }
        if let Some(tls_required) = cfg.tls_required {
            opts = opts.require_tls(tls_required);
        }
        opts = opts.request_timeout(cfg.request_timeout);
        if cfg.retry_on_initial_connect {
            opts = opts.retry_on_initial_connect();
        }
        if let (Some(username), Some(password)) = (cfg.auth.username.as_ref(), cfg.auth.password.as_ref()) {
            opts = opts.user_and_password(username.into(), password.into());
        }
        if let Some(token) = cfg.auth.token.as_ref() {
            opts = opts.token(token.into());
        }
        opts
    }

    fn client(&self) -> Result<Client> {
        self.client.read().clone().ok_or_else(|| FabricError::Unavailable("nats is not connected".into()))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> &str {
        NAME
    }

    async fn connect(&self) -> Result<()> {
        //an existing client reconnects by itself, only report its state
        if let Some(state) = self.client.read().as_ref().map(|c| c.connection_state()) {
            return match state {
                State::Connected => Ok(()),
                state => Err(FabricError::Unavailable(format!("nats is {state}"))),
            };
        }
        log::debug!("{NAME}, connecting to {} as {}", self.cfg.servers, self.client_name);
        let client = connect_with_options(self.servers.clone(), self.options())
            .await
            .map_err(|e| FabricError::Unavailable(format!("failed to connect to nats, {e}")))?;
        log::info!("{NAME}, connected to {}", self.cfg.servers);
        self.client.write().replace(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.read().as_ref().map(|c| c.connection_state() == State::Connected).unwrap_or(false)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client()?
            .publish(subject.to_owned(), payload)
            .await
            .map_err(|e| FabricError::Unavailable(format!("nats publish to {subject} failed, {e}")))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        capacity: usize,
    ) -> Result<BrokerSubscription> {
        let client = self.client()?;
        let sub = match queue_group {
            Some(group) => client.queue_subscribe(subject.to_owned(), group.to_owned()).await,
            None => client.subscribe(subject.to_owned()).await,
        }
        .map_err(|e| FabricError::Unavailable(format!("nats subscribe to {subject} failed, {e}")))?;
        //returns once the SUB has been written out to the server
        client
            .flush()
            .await
            .map_err(|e| FabricError::Unavailable(format!("nats subscribe to {subject} not acknowledged, {e}")))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let pump = tokio::spawn(forward(id, sub, tx, dropped.clone()));
        self.subs.insert(id, pump);
        Ok(BrokerSubscription { id, epoch: self.epoch(), rx, dropped })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        //dropping the nats subscriber unsubscribes on the server
        if let Some((_, pump)) = self.subs.remove(&id) {
            pump.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for entry in self.subs.iter() {
            entry.value().abort();
        }
        self.subs.clear();
        let client = self.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                log::warn!("{NAME}, flush on close failed, {e}");
            }
        }
        log::info!("{NAME}, closed");
        Ok(())
    }
}

async fn forward(id: SubscriptionId, mut sub: Subscriber, tx: mpsc::Sender<Delivery>, dropped: Arc<AtomicU64>) {
    while let Some(msg) = sub.next().await {
        let d = Delivery { subject: ByteString::from(msg.subject.as_str()), payload: msg.payload };
        match tx.try_send(d) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(d)) => {
                let n = dropped.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!("slow consumer, subscription {id} dropped a message on {}, dropped: {n}", d.subject);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    if let Err(e) = sub.unsubscribe().await {
        log::debug!("{NAME}, unsubscribe {id} failed, {e}");
    }
}

fn parse_servers(servers: &str) -> Result<Vec<ServerAddr>> {
    let addrs = servers
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|url| url.parse::<ServerAddr>().map_err(|e| FabricError::MalformedEntity(format!("nats server `{url}`, {e}"))))
        .collect::<Result<Vec<_>>>()?;
    if addrs.is_empty() {
        return Err(FabricError::MalformedEntity("no nats servers configured".into()));
    }
    Ok(addrs)
}
