//! Push notifications for changed diagnostic sets.
//!
//! Every subscriber gets its own bounded queue and dispatch task. Publishing
//! never waits on a subscriber: when a queue is full its oldest pending
//! notification is dropped.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use triage_types::DiagnosticSet;

pub type Callback = Arc<dyn Fn(Arc<DiagnosticSet>) + Send + Sync>;

/// Returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[must_use]
pub struct SubscriptionHandle(u64);

struct Queue {
    pending: Mutex<VecDeque<Arc<DiagnosticSet>>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl Queue {
    fn push(&self, set: Arc<DiagnosticSet>) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.len() >= self.capacity {
                pending.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Subscriber queue full; dropped oldest notification");
            }
            pending.push_back(set);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<DiagnosticSet>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

struct Subscriber {
    queue: Arc<Queue>,
    task: JoinHandle<()>,
}

/// Per-subscriber delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub delivered: u64,
    pub dropped: u64,
    pub pending: usize,
}

pub struct Subscriptions {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<BTreeMap<SubscriptionHandle, Subscriber>>,
}

impl Subscriptions {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register `callback`. Must be called inside a tokio runtime.
    pub fn subscribe(&self, callback: Callback) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(Queue {
            pending: Mutex::new(VecDeque::with_capacity(self.capacity)),
            capacity: self.capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });
        let task = tokio::spawn(dispatch(Arc::clone(&queue), callback));
        self.lock().insert(handle, Subscriber { queue, task });
        tracing::debug!(subscription = handle.0, "Subscriber registered");
        handle
    }

    /// Remove a subscription. Pending notifications are discarded.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        match self.lock().remove(&handle) {
            Some(subscriber) => {
                subscriber.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn publish(&self, set: &Arc<DiagnosticSet>) {
        for subscriber in self.lock().values() {
            subscriber.queue.push(Arc::clone(set));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self, handle: SubscriptionHandle) -> Option<SubscriberStats> {
        self.lock().get(&handle).map(|s| SubscriberStats {
            delivered: s.queue.delivered.load(Ordering::Relaxed),
            dropped: s.queue.dropped.load(Ordering::Relaxed),
            pending: s.queue.pending.lock().unwrap_or_else(PoisonError::into_inner).len(),
        })
    }

    pub fn clear(&self) {
        let subscribers = std::mem::take(&mut *self.lock());
        for subscriber in subscribers.into_values() {
            subscriber.task.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SubscriptionHandle, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn dispatch(queue: Arc<Queue>, callback: Callback) {
    loop {
        while let Some(set) = queue.pop() {
            callback(set);
            queue.delivered.fetch_add(1, Ordering::Relaxed);
            tokio::task::yield_now().await;
        }
        queue.notify.notified().await;
    }
}
