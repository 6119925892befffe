use std::collections::{BTreeMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use bytestring::ByteString;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};

use super::{Broker, BrokerSubscription, Delivery, StartFrom, StreamEntry, StreamStore, SubscriptionId};
use crate::topic::Topic;
use crate::types::{DashMap, EventId, HashMap};
use crate::{FabricError, Result};

struct Registration {
    id: SubscriptionId,
    pattern: Topic,
    queue_group: Option<ByteString>,
    tx: mpsc::Sender<Delivery>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EventId,
    //id -> consumer
    pending: BTreeMap<EventId, ByteString>,
}

#[derive(Default)]
struct StreamState {
    last_id: EventId,
    entries: VecDeque<(EventId, Bytes)>,
    groups: HashMap<ByteString, GroupState>,
}

impl StreamState {
    fn trim(&mut self, max_len: usize) {
        if max_len == 0 {
            return;
        }
        //approximate, trims in batches once the slack is used up
        let slack = (max_len / 10).max(1);
        if self.entries.len() > max_len + slack {
            let n = self.entries.len() - max_len;
            self.entries.drain(..n);
        }
    }

    fn entry(&self, id: EventId) -> Option<&Bytes> {
        let first = self.entries.front()?.0;
        if id < first {
            return None;
        }
        self.entries.get((id - first) as usize).filter(|(eid, _)| *eid == id).map(|(_, p)| p)
    }
}

/// In-process broker with NATS subject semantics and Redis-like streams.
///
/// Used as the embedded broker and in tests, where `set_reachable(false)`
/// simulates an outage: the connection drops together with all registrations,
/// and writes fail until `connect` succeeds again.
pub struct MemoryBroker {
    reachable: AtomicBool,
    connected: AtomicBool,
    epoch: AtomicU64,
    next_id: AtomicU64,
    subs: RwLock<Vec<Registration>>,
    queue_cursors: DashMap<ByteString, AtomicUsize>,
    writes: DashMap<ByteString, u64>,
    streams: Mutex<HashMap<ByteString, StreamState>>,
    notifies: DashMap<ByteString, Arc<Notify>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            subs: RwLock::new(Vec::new()),
            queue_cursors: DashMap::default(),
            writes: DashMap::default(),
            streams: Mutex::new(HashMap::default()),
            notifies: DashMap::default(),
        }
    }

    /// Outage injection. Going unreachable drops the connection and every
    /// registration; coming back only allows `connect` to succeed again.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.connected.store(false, Ordering::SeqCst);
            self.subs.write().clear();
            log::info!("memory broker is unreachable");
        } else {
            log::info!("memory broker is reachable");
        }
    }

    /// Successful subject writes observed so far.
    #[inline]
    pub fn writes(&self, subject: &str) -> u64 {
        self.writes.get(subject).map(|n| *n).unwrap_or_default()
    }

    #[inline]
    pub fn subscriptions_len(&self) -> usize {
        self.subs.read().len()
    }

    #[inline]
    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FabricError::Unavailable("broker disconnected".into()))
        }
    }

    fn notify(&self, stream: &str) -> Arc<Notify> {
        self.notifies.entry(ByteString::from(stream)).or_insert_with(|| Arc::new(Notify::new())).value().clone()
    }

    #[inline]
    fn deliver(reg: &Registration, subject: &str, payload: &Bytes) {
        let d = Delivery { subject: ByteString::from(subject), payload: payload.clone() };
        match reg.tx.try_send(d) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = reg.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!("slow consumer, subscription {} dropped a message on {subject}, dropped: {n}", reg.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("subscription {} is closed", reg.id);
            }
        }
    }

    fn take_pending(
        st: &mut StreamState,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let state = st
            .groups
            .get(group)
            .ok_or_else(|| FabricError::NotFound)?;
        let ids = state
            .pending
            .iter()
            .filter(|(_, c)| &***c == consumer)
            .map(|(id, _)| *id)
            .take(count)
            .collect::<Vec<_>>();
        let mut out = Vec::with_capacity(ids.len());
        let mut trimmed = Vec::new();
        for id in ids {
            match st.entry(id) {
                Some(payload) => out.push(StreamEntry { id, payload: payload.clone() }),
                None => trimmed.push(id),
            }
        }
        if let Some(state) = st.groups.get_mut(group) {
            for id in trimmed {
                state.pending.remove(&id);
            }
        }
        Ok(out)
    }

    fn take_new(st: &mut StreamState, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let last_delivered = st.groups.get(group).ok_or_else(|| FabricError::NotFound)?.last_delivered;
        let out = st
            .entries
            .iter()
            .filter(|(id, _)| *id > last_delivered)
            .take(count)
            .map(|(id, payload)| StreamEntry { id: *id, payload: payload.clone() })
            .collect::<Vec<_>>();
        if let (Some(last), Some(state)) = (out.last(), st.groups.get_mut(group)) {
            state.last_delivered = last.id;
            for e in &out {
                state.pending.insert(e.id, ByteString::from(consumer));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(FabricError::Unavailable("broker unreachable".into()));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            log::info!("memory broker connected, epoch: {epoch}");
        }
        Ok(())
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[inline]
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.check_connected()?;
        //delivery happens under the read lock so per-subject order holds
        let subs = self.subs.read();
        let matched = subs.iter().filter(|reg| reg.pattern.matches_str(subject));
        let (grouped, plain): (Vec<_>, Vec<_>) = matched.partition(|reg| reg.queue_group.is_some());

        for reg in plain {
            Self::deliver(reg, subject, &payload);
        }

        let groups = grouped.into_iter().into_group_map_by(|reg| reg.queue_group.clone().unwrap_or_default());
        for (name, members) in groups.into_iter().sorted_by(|(a, _), (b, _)| a.cmp(b)) {
            let cursor = self.queue_cursors.entry(name).or_insert_with(|| AtomicUsize::new(0));
            let n = cursor.fetch_add(1, Ordering::SeqCst);
            Self::deliver(members[n % members.len()], subject, &payload);
        }
        drop(subs);

        *self.writes.entry(ByteString::from(subject)).or_insert(0) += 1;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        capacity: usize,
    ) -> Result<BrokerSubscription> {
        self.check_connected()?;
        let pattern = Topic::from_str(subject)?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subs.write().push(Registration {
            id,
            pattern,
            queue_group: queue_group.map(ByteString::from),
            tx,
            dropped: dropped.clone(),
        });
        Ok(BrokerSubscription { id, epoch: self.epoch(), rx, dropped })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subs.write().retain(|reg| reg.id != id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subs.write().clear();
        Ok(())
    }
}

#[async_trait]
impl StreamStore for MemoryBroker {
    async fn append(&self, stream: &str, payload: Bytes, max_len: usize) -> Result<EventId> {
        self.check_connected()?;
        let id = {
            let mut streams = self.streams.lock();
            let st = streams.entry(ByteString::from(stream)).or_default();
            st.last_id += 1;
            let id = st.last_id;
            st.entries.push_back((id, payload));
            st.trim(max_len);
            id
        };
        self.notify(stream).notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str, start: StartFrom) -> Result<bool> {
        self.check_connected()?;
        let mut streams = self.streams.lock();
        let st = streams.entry(ByteString::from(stream)).or_default();
        if st.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = match start {
            StartFrom::Head => 0,
            StartFrom::Tail => st.last_id,
        };
        st.groups.insert(ByteString::from(group), GroupState { last_delivered, pending: BTreeMap::new() });
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let notify = self.notify(stream);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.check_connected()?;
        {
            let mut streams = self.streams.lock();
            let st = streams.entry(ByteString::from(stream)).or_default();
            let out = Self::take_new(st, group, consumer, count)?;
            if !out.is_empty() || block.is_zero() {
                return Ok(out);
            }
        }

        let _ = tokio::time::timeout(block, notified).await;

        self.check_connected()?;
        let mut streams = self.streams.lock();
        let st = streams.entry(ByteString::from(stream)).or_default();
        Self::take_new(st, group, consumer, count)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.check_connected()?;
        let mut streams = self.streams.lock();
        let st = streams.entry(ByteString::from(stream)).or_default();
        Self::take_pending(st, group, consumer, count)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EventId]) -> Result<()> {
        self.check_connected()?;
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream).and_then(|st| st.groups.get_mut(group)) {
            for id in ids {
                state.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        self.check_connected()?;
        Ok(self.streams.lock().get(stream).map(|st| st.entries.len()).unwrap_or_default())
    }
}
