//! Bounded per-connection outbound queue
//!
//! FIFO with a fixed capacity. Enqueueing into a full queue evicts the oldest
//! catalog event: UI reconciliation is by full-object upsert, so a fresh
//! revision is worth more than a stale one. Control frames (`authenticated`,
//! errors, pongs, the close request) are never pushed out by events; only a
//! backlog made entirely of control frames drops its own oldest entry. The
//! consumer waits on a [`Notify`] rather than polling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::events::Outbound;

/// Result of an enqueue
#[derive(Debug)]
pub enum Enqueue {
    Queued,
    /// Queue was full; the returned oldest entry was dropped
    Evicted(Outbound),
    /// Queue has been closed; the item was dropped
    Closed,
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Outbound>,
    closed: bool,
}

pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    evicted: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest event when full. Never blocks.
    ///
    /// An event arriving while only control frames are queued is itself the
    /// entry dropped.
    pub fn push(&self, item: Outbound) -> Enqueue {
        let mut inner = self.lock();
        if inner.closed {
            return Enqueue::Closed;
        }

        if inner.items.len() >= self.capacity
            && item.is_evictable()
            && !inner.items.iter().any(Outbound::is_evictable)
        {
            drop(inner);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return Enqueue::Evicted(item);
        }

        let evicted = self.make_room(&mut inner);
        inner.items.push_back(item);
        drop(inner);

        self.notify.notify_one();

        match evicted {
            Some(oldest) => Enqueue::Evicted(oldest),
            None => Enqueue::Queued,
        }
    }

    /// Drop one entry if the queue is full: the oldest event, or the oldest
    /// control frame when no event is queued
    fn make_room(&self, inner: &mut QueueInner) -> Option<Outbound> {
        if inner.items.len() < self.capacity {
            return None;
        }
        let index = inner
            .items
            .iter()
            .position(Outbound::is_evictable)
            .unwrap_or(0);
        let evicted = inner.items.remove(index);
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Wait for the next item.
    ///
    /// After [`close`](Self::close), items already queued are still handed
    /// out; `None` is returned once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take the next item without waiting
    pub fn try_pop(&self) -> Option<Outbound> {
        self.lock().items.pop_front()
    }

    /// Stop accepting items, optionally appending a final one.
    ///
    /// The final item bypasses the closed check but still respects capacity.
    pub fn close(&self, last: Option<Outbound>) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if let Some(item) = last {
            self.make_room(&mut inner);
            inner.items.push_back(item);
        }
        inner.closed = true;
        drop(inner);

        self.notify.notify_one();
    }

    /// Drop everything still queued
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries dropped by eviction so far
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
