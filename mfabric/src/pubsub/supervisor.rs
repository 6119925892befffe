use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use mfabric_conf::PubSub as PubSubConfig;

use crate::broker::{Broker, BrokerSubscription, StreamStore, SubscriptionId};
use crate::queue::{Record, RecoveryQueue};
use crate::types::{DashMap, QueueGroup, Subject};
use crate::{FabricError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Reconnecting,
    /// Reconnection failed past the deadline, callers get Unavailable.
    Degraded,
}

impl ConnState {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Connected => "connected",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Degraded => "degraded",
        }
    }
}

struct Registration {
    subject: Subject,
    queue_group: Option<QueueGroup>,
    capacity: usize,
    epoch: u64,
    broker_id: SubscriptionId,
    rebind: mpsc::UnboundedSender<BrokerSubscription>,
}

/// A subscription as seen by its pump, the broker side may be replaced after
/// a reconnect through `rebind`.
pub struct Bound {
    pub id: u64,
    pub sub: BrokerSubscription,
    pub rebind: mpsc::UnboundedReceiver<BrokerSubscription>,
}

/// Owns the broker connection: watches it, reconnects with exponential
/// backoff, registers subscriptions again after a reconnect and drains the
/// recovery queue once the broker is back.
pub struct Supervisor {
    broker: Arc<dyn Broker>,
    streams: Arc<dyn StreamStore>,
    queue: Arc<RecoveryQueue>,
    cfg: PubSubConfig,
    state: watch::Sender<ConnState>,
    wake: Notify,
    regs: DashMap<u64, Registration>,
    next_id: AtomicU64,
    reconnects: AtomicU64,
}

impl Supervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        streams: Arc<dyn StreamStore>,
        queue: Arc<RecoveryQueue>,
        cfg: PubSubConfig,
    ) -> Self {
        let initial = if broker.is_connected() { ConnState::Connected } else { ConnState::Reconnecting };
        Self {
            broker,
            streams,
            queue,
            cfg,
            state: watch::channel(initial).0,
            wake: Notify::new(),
            regs: DashMap::default(),
            next_id: AtomicU64::new(1),
            reconnects: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    #[inline]
    pub fn streams(&self) -> &Arc<dyn StreamStore> {
        &self.streams
    }

    #[inline]
    pub fn queue(&self) -> &Arc<RecoveryQueue> {
        &self.queue
    }

    #[inline]
    pub fn cfg(&self) -> &PubSubConfig {
        &self.cfg
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    #[inline]
    pub fn watch(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// Errors with Unavailable while degraded.
    #[inline]
    pub fn check_available(&self) -> Result<()> {
        match self.state() {
            ConnState::Degraded => Err(FabricError::Unavailable("broker unreachable past reconnect deadline".into())),
            _ => Ok(()),
        }
    }

    /// Writes go straight to the broker only when nothing is queued ahead of
    /// them and the connection is fully recovered.
    #[inline]
    pub fn writes_direct(&self) -> bool {
        self.state() == ConnState::Connected && self.broker.is_connected() && self.queue.is_empty()
    }

    /// First connection, made before anything registers with the broker.
    /// Failing here is fatal, later outages are left to [`Supervisor::run`].
    pub async fn connect(&self) -> Result<()> {
        let name = self.broker.name();
        match tokio::time::timeout(self.cfg.connect_timeout, self.broker.connect()).await {
            Ok(Ok(())) => {
                self.set_state(ConnState::Connected);
                Ok(())
            }
            Ok(Err(e)) => Err(FabricError::BrokerUnreachable(format!("{name}, {e}"))),
            Err(_) => Err(FabricError::BrokerUnreachable(format!(
                "{name}, no connection after {:?}",
                self.cfg.connect_timeout
            ))),
        }
    }

    /// Asks the supervisor task to look at the connection and the queue now.
    #[inline]
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn set_state(&self, s: ConnState) {
        let prev = self.state.send_replace(s);
        if prev != s {
            log::info!("pubsub, broker {} {} -> {}", self.broker.name(), prev.as_str(), s.as_str());
        }
    }

    pub async fn register(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        capacity: usize,
    ) -> Result<Bound> {
        let sub = self.broker.subscribe(&subject, queue_group.as_deref(), capacity).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.regs.insert(
            id,
            Registration { subject, queue_group, capacity, epoch: sub.epoch, broker_id: sub.id, rebind: tx },
        );
        Ok(Bound { id, sub, rebind: rx })
    }

    pub async fn deregister(&self, id: u64) -> Result<()> {
        if let Some((_, reg)) = self.regs.remove(&id) {
            if self.broker.is_connected() {
                self.broker.unsubscribe(reg.broker_id).await?;
            }
        }
        Ok(())
    }

    #[inline]
    pub fn registrations(&self) -> usize {
        self.regs.len()
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.cfg.reconnect_initial)
            .with_max_interval(self.cfg.reconnect_max)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Runs until `stop` flips to true.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let tick = self.cfg.reconnect_initial.max(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = self.wake.notified() => {},
                _ = tokio::time::sleep(tick) => {},
                res = stop.changed() => if res.is_err() { break },
            }
            if *stop.borrow() {
                break;
            }
            if !self.broker.is_connected() && !self.reconnect(&mut stop).await {
                break;
            }
            if let Err(e) = self.recover().await {
                log::warn!("pubsub, recovery interrupted, {e}");
                continue;
            }
            self.set_state(ConnState::Connected);
            //a record may have been queued after the last drain pass
            if !self.queue.is_empty() {
                self.wake();
            }
        }
        log::info!("pubsub, supervisor stopped");
    }

    /// Returns false when stopped before the broker came back.
    async fn reconnect(&self, stop: &mut watch::Receiver<bool>) -> bool {
        self.set_state(ConnState::Reconnecting);
        let started = Instant::now();
        let mut backoff = self.backoff();
        loop {
            match self.broker.connect().await {
                Ok(()) => {
                    let n = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                    log::info!(
                        "pubsub, broker {} reconnected after {:?}, reconnects: {}",
                        self.broker.name(),
                        started.elapsed(),
                        n
                    );
                    return true;
                }
                Err(e) => {
                    if started.elapsed() >= self.cfg.reconnect_deadline {
                        self.set_state(ConnState::Degraded);
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.cfg.reconnect_max);
                    log::debug!("pubsub, reconnect failed, {e}, retry in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {},
                        res = stop.changed() => if res.is_err() { return false },
                    }
                    if *stop.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    async fn recover(&self) -> Result<()> {
        self.resubscribe().await?;
        self.drain().await
    }

    /// Registers again every subscription the broker lost with an older epoch.
    async fn resubscribe(&self) -> Result<()> {
        let epoch = self.broker.epoch();
        let stale = self.regs.iter().filter(|r| r.epoch < epoch).map(|r| *r.key()).collect::<Vec<_>>();
        for id in stale {
            let (subject, queue_group, capacity) = match self.regs.get(&id) {
                Some(r) => (r.subject.clone(), r.queue_group.clone(), r.capacity),
                None => continue,
            };
            let sub = self.broker.subscribe(&subject, queue_group.as_deref(), capacity).await?;
            let broker_id = sub.id;
            let rebound = match self.regs.get_mut(&id) {
                Some(mut r) => {
                    r.epoch = sub.epoch;
                    r.broker_id = broker_id;
                    if r.rebind.send(sub).is_err() {
                        log::debug!("pubsub, subscription {id} went away during resubscribe");
                    }
                    true
                }
                None => false,
            };
            if !rebound {
                self.broker.unsubscribe(broker_id).await?;
                continue;
            }
            log::debug!("pubsub, resubscribed {subject}");
        }
        Ok(())
    }

    /// Writes queued records in FIFO order, event appends first. A record is
    /// removed only after the broker accepted it.
    async fn drain(&self) -> Result<()> {
        let mut drained = 0usize;
        while let Some(r) = self.queue.peek() {
            match &r {
                Record::Data { subject, payload } => self.broker.publish(subject, payload.clone()).await?,
                Record::Event { stream, payload, max_len } => {
                    self.streams.append(stream, payload.clone(), *max_len).await.map(|_| ())?
                }
            }
            self.queue.pop(r.priority());
            drained += 1;
        }
        if drained > 0 {
            log::info!("pubsub, drained {drained} queued records");
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "broker": self.broker.name(),
            "state": self.state().as_str(),
            "epoch": self.broker.epoch(),
            "reconnects": self.reconnects.load(Ordering::SeqCst),
            "registrations": self.regs.len(),
            "recovery_queue": self.queue.to_json(),
        })
    }
}
