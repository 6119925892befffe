use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use super::{Bound, Supervisor};
use crate::auth::{AuthGate, Credential};
use crate::broker::{BrokerSubscription, Delivery};
use crate::topic::{Pattern, Router};
use crate::types::{Action, Identity, Message, Object, QueueGroup, Subject};
use crate::{FabricError, Result};

/// Subscription callback. Errors are logged and counted, the message is not
/// redelivered.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |m| f(m).boxed())
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub queue_group: Option<QueueGroup>,
    /// Concurrent handler invocations, 1 keeps per-subscription order.
    pub concurrency: usize,
    /// Overrides the configured per-subscription channel capacity.
    pub capacity: Option<usize>,
}

impl SubscribeOptions {
    #[inline]
    pub fn queue_group<Q: Into<QueueGroup>>(mut self, q: Q) -> Self {
        self.queue_group = Some(q.into());
        self
    }

    #[inline]
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub delivered: u64,
    /// Messages the broker dropped because this subscription lagged behind.
    pub dropped: u64,
    pub handler_errors: u64,
    pub malformed: u64,
    pub in_flight: u64,
}

#[derive(Default)]
struct Stats {
    delivered: AtomicU64,
    handler_errors: AtomicU64,
    malformed: AtomicU64,
    in_flight: AtomicU64,
    //drops of replaced broker registrations, plus the live counter
    dropped: Mutex<(u64, Arc<AtomicU64>)>,
}

impl Stats {
    fn rebind(&self, next: Arc<AtomicU64>) {
        let mut d = self.dropped.lock();
        d.0 += d.1.load(Ordering::SeqCst);
        d.1 = next;
    }

    fn snapshot(&self) -> SubscriptionStats {
        let dropped = {
            let d = self.dropped.lock();
            d.0 + d.1.load(Ordering::SeqCst)
        };
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            dropped,
            handler_errors: self.handler_errors.load(Ordering::SeqCst),
            malformed: self.malformed.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

pub struct Subscriber {
    gate: Arc<AuthGate>,
    supervisor: Arc<Supervisor>,
    router: Router,
}

impl Subscriber {
    pub fn new(gate: Arc<AuthGate>, supervisor: Arc<Supervisor>, router: Router) -> Self {
        Self { gate, supervisor, router }
    }

    /// Authorizes `subscribe` on the pattern's channel and registers with the
    /// broker. Returns once the broker acknowledged the registration.
    pub async fn subscribe(
        &self,
        cred: &Credential,
        pattern: &Pattern,
        opts: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<Subscription> {
        self.supervisor.check_available()?;
        let identity = self.gate.require(cred, Action::Subscribe, &Object::channel(pattern.channel.clone())).await?;
        let subject = self.router.pattern_subject(pattern);
        let capacity = opts.capacity.unwrap_or(self.supervisor.cfg().subscriber_channel_capacity);
        let bound = self.supervisor.register(subject.clone(), opts.queue_group.clone(), capacity).await?;
        log::debug!(
            "pubsub, {} subscribed to {subject}, queue group: {:?}, concurrency: {}",
            identity.id,
            opts.queue_group,
            opts.concurrency.max(1)
        );
        Ok(Subscription::start(self.supervisor.clone(), identity, subject, bound, opts.concurrency, handler))
    }
}

pub struct Subscription {
    id: u64,
    subject: Subject,
    identity: Identity,
    supervisor: Arc<Supervisor>,
    stats: Arc<Stats>,
    sem: Arc<Semaphore>,
    concurrency: usize,
    stop: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    fn start(
        supervisor: Arc<Supervisor>,
        identity: Identity,
        subject: Subject,
        bound: Bound,
        concurrency: usize,
        handler: MessageHandler,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let stats = Arc::new(Stats { dropped: Mutex::new((0, bound.sub.dropped.clone())), ..Default::default() });
        let sem = Arc::new(Semaphore::new(concurrency));
        let (stop_tx, stop_rx) = oneshot::channel();
        let pump = Pump { subject: subject.clone(), handler, stats: stats.clone(), sem: sem.clone(), concurrency };
        let pump = tokio::spawn(pump.run(bound.sub, bound.rebind, stop_rx));
        Self {
            id: bound.id,
            subject,
            identity,
            supervisor,
            stats,
            sem,
            concurrency,
            stop: Some(stop_tx),
            pump: Some(pump),
        }
    }

    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[inline]
    pub fn stats(&self) -> SubscriptionStats {
        self.stats.snapshot()
    }

    /// Stops deliveries and waits for running handlers, bounded by the
    /// configured drain timeout. The subscription is closed either way.
    pub async fn unsubscribe(self) -> Result<()> {
        let deadline = self.supervisor.cfg().drain_timeout;
        self.unsubscribe_within(deadline).await
    }

    pub async fn unsubscribe_within(mut self, deadline: Duration) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let deregistered = self.supervisor.deregister(self.id).await;

        let mut pump = self.pump.take();
        let sem = self.sem.clone();
        let n = self.concurrency as u32;
        let drained = tokio::time::timeout(deadline, async {
            if let Some(p) = pump.as_mut() {
                let _ = p.await;
            }
            sem.acquire_many(n).await.map(|p| p.forget())
        })
        .await;

        match drained {
            Ok(_) => {
                log::debug!("pubsub, unsubscribed from {}", self.subject);
                deregistered
            }
            Err(_) => {
                if let Some(p) = pump {
                    p.abort();
                }
                self.sem.close();
                log::warn!(
                    "pubsub, unsubscribe from {} timed out, in flight: {}",
                    self.subject,
                    self.stats.in_flight.load(Ordering::SeqCst)
                );
                Err(FabricError::DrainTimeout)
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            let Ok(rt) = tokio::runtime::Handle::try_current() else {
                return;
            };
            let supervisor = self.supervisor.clone();
            let id = self.id;
            rt.spawn(async move {
                if let Err(e) = supervisor.deregister(id).await {
                    log::debug!("pubsub, deregister {id} on drop failed, {e}");
                }
            });
        }
    }
}

struct Pump {
    subject: Subject,
    handler: MessageHandler,
    stats: Arc<Stats>,
    sem: Arc<Semaphore>,
    concurrency: usize,
}

impl Pump {
    async fn run(
        self,
        mut sub: BrokerSubscription,
        mut rebind: tokio::sync::mpsc::UnboundedReceiver<BrokerSubscription>,
        mut stop: oneshot::Receiver<()>,
    ) {
        //the broker dropped the registration, wait for the supervisor
        let mut lost = false;
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                next = rebind.recv() => match next {
                    Some(next) => {
                        log::debug!("pubsub, {} rebound to broker subscription {}", self.subject, next.id);
                        self.stats.rebind(next.dropped.clone());
                        sub = next;
                        lost = false;
                    }
                    None => break,
                },
                d = sub.rx.recv(), if !lost => match d {
                    Some(d) => self.dispatch(d).await,
                    None => lost = true,
                },
            }
        }
    }

    async fn dispatch(&self, d: Delivery) {
        let msg = match Message::decode_from(&d.payload) {
            Ok(m) => m,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::SeqCst);
                log::warn!("pubsub, undecodable message on {}, {e}", d.subject);
                return;
            }
        };
        self.stats.delivered.fetch_add(1, Ordering::SeqCst);

        let Ok(permit) = self.sem.clone().acquire_owned().await else {
            return;
        };
        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
        let fut = (self.handler)(msg);
        let stats = self.stats.clone();
        let subject = self.subject.clone();
        let call = async move {
            if let Err(e) = fut.await {
                stats.handler_errors.fetch_add(1, Ordering::SeqCst);
                log::warn!("pubsub, handler for {subject} failed, {e}");
            }
            stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        };
        if self.concurrency > 1 {
            tokio::spawn(call);
        } else {
            call.await;
        }
    }
}
