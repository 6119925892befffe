use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;

use mfabric_utils::Counter;

use crate::types::{StreamId, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    //Event log appends, drained first
    High,
    Normal,
}

/// A broker write that could not be completed.
#[derive(Clone, PartialEq, Eq)]
pub enum Record {
    Data { subject: Subject, payload: Bytes },
    Event { stream: StreamId, payload: Bytes, max_len: usize },
}

impl Record {
    #[inline]
    pub fn priority(&self) -> Priority {
        match self {
            Record::Data { .. } => Priority::Normal,
            Record::Event { .. } => Priority::High,
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Data { subject, payload } => write!(f, "Data({subject}, {} bytes)", payload.len()),
            Record::Event { stream, payload, .. } => write!(f, "Event({stream}, {} bytes)", payload.len()),
        }
    }
}

#[derive(Default)]
struct Inner {
    high: VecDeque<Record>,
    normal: VecDeque<Record>,
}

impl Inner {
    #[inline]
    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// Bounded FIFO of undelivered broker writes, one queue per priority class
/// sharing a single capacity. A full queue rejects the incoming record and
/// keeps its head order.
pub struct RecoveryQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    len: Counter,
    rejected: Counter,
}

impl RecoveryQueue {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, inner: Mutex::new(Inner::default()), len: Counter::new(), rejected: Counter::new() }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records of one priority class waiting for the drain.
    #[inline]
    pub fn pending(&self, priority: Priority) -> usize {
        let inner = self.inner.lock();
        match priority {
            Priority::High => inner.high.len(),
            Priority::Normal => inner.normal.len(),
        }
    }

    #[inline]
    pub fn push(&self, r: Record) -> Result<(), Record> {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            self.rejected.inc();
            return Err(r);
        }
        match r.priority() {
            Priority::High => inner.high.push_back(r),
            Priority::Normal => inner.normal.push_back(r),
        }
        self.len.sets(inner.len() as isize);
        Ok(())
    }

    /// Head of the queue without removing it, high priority first.
    #[inline]
    pub fn peek(&self) -> Option<Record> {
        let inner = self.inner.lock();
        inner.high.front().or_else(|| inner.normal.front()).cloned()
    }

    /// Removes the head of one priority class, after it was written.
    #[inline]
    pub fn pop(&self, priority: Priority) -> Option<Record> {
        let mut inner = self.inner.lock();
        let r = match priority {
            Priority::High => inner.high.pop_front(),
            Priority::Normal => inner.normal.pop_front(),
        };
        self.len.sets(inner.len() as isize);
        r
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "capacity": self.capacity,
            "len": self.len.to_json(),
            "rejected": self.rejected.count(),
        })
    }
}
