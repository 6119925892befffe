use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mfabric_conf::EventLog as EventLogConfig;

use super::EventLog;
use crate::broker::{StartFrom, StreamEntry, StreamStore};
use crate::types::{EventId, EventRecord, GroupName, StreamId};
use crate::{FabricError, Result};

/// Event callback, Ok acks the event and Err nacks it.
pub type EventHandler = Arc<dyn Fn(EventRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub fn event_handler_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ev| f(ev).boxed())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    pub nacks: u64,
    pub dead_lettered: u64,
    /// Redeliveries of events already acked by this consumer.
    pub duplicates: u64,
    pub malformed: u64,
    pub last_acked: EventId,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    nacks: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    last_acked: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.delivered.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            nacks: self.nacks.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            malformed: self.malformed.load(Ordering::SeqCst),
            last_acked: self.last_acked.load(Ordering::SeqCst),
        }
    }
}

/// A running consumer group member. Dropping it stops the worker after the
/// event in hand.
pub struct Consumer {
    stream: StreamId,
    group: GroupName,
    counters: Arc<Counters>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Consumer {
    #[inline]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[inline]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[inline]
    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Waits for the event in hand to be acked or left pending.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("event log, consumer {} on {} ended abnormally, {e}", self.group, self.stream);
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "stream": self.stream.to_string(),
            "group": self.group.to_string(),
            "stats": self.stats(),
        })
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

pub(super) async fn start(
    log: Arc<EventLog>,
    stream: StreamId,
    group: GroupName,
    handler: EventHandler,
) -> Result<Consumer> {
    let from = if log.cfg().backfill { StartFrom::Head } else { StartFrom::Tail };
    let streams = log.supervisor().streams().clone();
    if streams.create_group(&stream, &group, from).await? {
        log::info!("event log, created group {group} on {stream} from {from:?}");
    }
    let counters = Arc::new(Counters::default());
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = Worker {
        cfg: log.cfg().clone(),
        consumer: log.consumer_name(&group),
        log,
        streams,
        stream: stream.clone(),
        group: group.clone(),
        from,
        handler,
        counters: counters.clone(),
        last_acked: 0,
    };
    log::debug!("event log, {} consuming {stream}", worker.consumer);
    let task = tokio::spawn(worker.run(stop_rx));
    Ok(Consumer { stream, group, counters, stop: stop_tx, task: Some(task) })
}

struct Worker {
    log: Arc<EventLog>,
    streams: Arc<dyn StreamStore>,
    cfg: EventLogConfig,
    stream: StreamId,
    group: GroupName,
    consumer: String,
    from: StartFrom,
    handler: EventHandler,
    counters: Arc<Counters>,
    last_acked: EventId,
}

impl Worker {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        //entries handed to this consumer earlier and never acked go first
        let mut pending = true;
        loop {
            if *stop.borrow() {
                break;
            }
            let read = if pending {
                self.streams.read_pending(&self.stream, &self.group, &self.consumer, self.cfg.batch).await
            } else {
                tokio::select! {
                    res = self.streams.read_group(&self.stream, &self.group, &self.consumer, self.cfg.batch, self.cfg.block) => res,
                    _ = stop.changed() => break,
                }
            };

            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    log::debug!("event log, read of {} for {} failed, {e}", self.stream, self.group);
                    if e == FabricError::NotFound {
                        self.recreate_group().await;
                    }
                    pending = true;
                    if !self.pause(&mut stop).await {
                        break;
                    }
                    continue;
                }
            };
            if pending && entries.is_empty() {
                pending = false;
                continue;
            }

            let mut failed = false;
            for entry in entries {
                if let Err(e) = self.process(entry).await {
                    log::info!("event log, {} on {} interrupted, {e}", self.group, self.stream);
                    failed = true;
                    break;
                }
            }
            if failed {
                pending = true;
                if !self.pause(&mut stop).await {
                    break;
                }
            }
        }
        log::debug!("event log, {} stopped consuming {}", self.consumer, self.stream);
    }

    /// Returns false when stopped.
    async fn pause(&self, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.cfg.block) => !*stop.borrow(),
            _ = stop.changed() => false,
        }
    }

    async fn recreate_group(&self) {
        match self.streams.create_group(&self.stream, &self.group, self.from).await {
            Ok(true) => log::warn!("event log, group {} on {} was lost and is created again", self.group, self.stream),
            Ok(false) => {}
            Err(e) => log::debug!("event log, create group {} on {} failed, {e}", self.group, self.stream),
        }
    }

    fn redelivery(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.cfg.redelivery_backoff)
            .with_max_interval(self.cfg.redelivery_backoff.saturating_mul(16).max(Duration::from_millis(1)))
            .with_max_elapsed_time(None)
            .build()
    }

    /// Errors only when the entry could not be acked or dead-lettered, it
    /// then stays pending and is read again.
    async fn process(&mut self, entry: StreamEntry) -> Result<()> {
        let mut ev = match EventRecord::decode(&entry.payload) {
            Ok(ev) => ev,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::SeqCst);
                log::warn!("event log, undecodable entry {} on {}, {e}", entry.id, self.stream);
                return self.ack(entry.id).await;
            }
        };
        ev.event_id = entry.id;

        if entry.id <= self.last_acked {
            self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
            log::debug!("event log, {} {} already handled by {}", ev.operation, entry.id, self.consumer);
            return self.ack(entry.id).await;
        }
        self.counters.delivered.fetch_add(1, Ordering::SeqCst);

        let limit = self.cfg.nack_limit.max(1);
        let mut backoff = self.redelivery();
        let mut failures = 0u32;
        loop {
            match (self.handler)(ev.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    self.counters.nacks.fetch_add(1, Ordering::SeqCst);
                    if failures >= limit {
                        self.log.dead_letter(&self.stream, &ev, failures, &e).await?;
                        self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.cfg.redelivery_backoff);
                    log::debug!(
                        "event log, {} {} nacked by {}, {e}, redelivery in {delay:?}",
                        ev.operation,
                        ev.event_id,
                        self.group
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.last_acked = entry.id;
        self.counters.last_acked.store(entry.id, Ordering::SeqCst);
        self.ack(entry.id).await
    }

    async fn ack(&self, id: EventId) -> Result<()> {
        self.streams.ack(&self.stream, &self.group, &[id]).await?;
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
