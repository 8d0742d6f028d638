//! Progress fan-out.
//!
//! Every subscription owns a bounded ring buffer. `publish` appends to each
//! buffer of the job and never waits: when a buffer is full the oldest event
//! is discarded and the drop counters are incremented. Order per subscription
//! is publish order minus drops.

use kiln_training::{JobId, ProgressEvent};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Buffer size used by [`CallbackDispatcher::subscribe`].
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// Buffers hold plain data; a poisoned lock is recovered rather than propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Mailbox {
    id: SubscriptionId,
    capacity: usize,
    buffer: Mutex<VecDeque<ProgressEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    detached: AtomicBool,
}

impl Mailbox {
    fn new(id: SubscriptionId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    /// Returns `true` if an older event had to be dropped.
    fn push(&self, event: ProgressEvent) -> bool {
        let overflowed = {
            let mut buffer = lock(&self.buffer);
            let overflowed = buffer.len() >= self.capacity;
            if overflowed {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(event);
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    fn pop(&self) -> Option<ProgressEvent> {
        lock(&self.buffer).pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receiving end of a subscription.
///
/// Dropping it detaches the buffer; the dispatcher prunes it on the next publish.
pub struct Subscription {
    job_id: JobId,
    mailbox: Arc<Mailbox>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.mailbox.id)
            .field("job_id", &self.job_id)
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.mailbox.id
    }

    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Waits for the next event.
    ///
    /// # Returns
    /// `None` once the job's stream is closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.is_closed() {
                // An event may have landed between the pop and the close check.
                return self.mailbox.pop();
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Takes the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.mailbox.pop()
    }

    /// Events discarded from this subscription's buffer.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.mailbox.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailbox.detached.store(true, Ordering::Release);
    }
}

/// Fan-out of progress events to per-job subscribers.
pub struct CallbackDispatcher {
    consumers: Mutex<HashMap<JobId, Vec<Arc<Mailbox>>>>,
    default_capacity: usize,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher")
            .field("default_capacity", &self.default_capacity)
            .field("dropped_total", &self.dropped_total())
            .finish_non_exhaustive()
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl CallbackDispatcher {
    /// Creates a dispatcher whose subscriptions buffer `default_capacity` events.
    #[must_use]
    pub fn new(default_capacity: usize) -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
            default_capacity: default_capacity.max(1),
            next_id: AtomicU64::new(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Subscribes to events of `job_id` with the default buffer size.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        self.subscribe_with_capacity(job_id, self.default_capacity)
    }

    /// Subscribes with an explicit buffer size (at least 1).
    pub fn subscribe_with_capacity(&self, job_id: &JobId, capacity: usize) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mailbox = Arc::new(Mailbox::new(id, capacity.max(1)));
        lock(&self.consumers).entry(job_id.clone()).or_default().push(Arc::clone(&mailbox));
        debug!(job_id = %job_id, subscription = %id, capacity = mailbox.capacity, "Subscribed");
        Subscription { job_id: job_id.clone(), mailbox }
    }

    /// Removes a subscription. Its receiver observes end-of-stream.
    ///
    /// # Returns
    /// `false` if the subscription was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut consumers = lock(&self.consumers);
        let mut removed = None;
        for list in consumers.values_mut() {
            if let Some(pos) = list.iter().position(|m| m.id == id) {
                removed = Some(list.remove(pos));
                break;
            }
        }
        consumers.retain(|_, list| !list.is_empty());
        drop(consumers);

        match removed {
            Some(mailbox) => {
                mailbox.close();
                debug!(subscription = %id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Delivers `event` to every subscription of its job.
    ///
    /// Never waits on consumers. Publishing to a job without subscribers is a no-op.
    ///
    /// # Returns
    /// Number of subscriptions the event was delivered to.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        let mut consumers = lock(&self.consumers);
        let Some(list) = consumers.get_mut(&event.job_id) else {
            return 0;
        };

        list.retain(|m| !m.detached.load(Ordering::Acquire));
        for mailbox in list.iter() {
            if mailbox.push(event.clone()) {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                trace!(job_id = %event.job_id, subscription = %mailbox.id, "Dropped oldest progress event");
            }
        }

        let delivered = list.len();
        if delivered == 0 {
            consumers.remove(&event.job_id);
        }
        delivered
    }

    /// Ends the stream of `job_id`; subscribers drain what is buffered, then see `None`.
    pub fn close_job(&self, job_id: &JobId) {
        let removed = lock(&self.consumers).remove(job_id);
        if let Some(list) = removed {
            for mailbox in &list {
                mailbox.close();
            }
            debug!(job_id = %job_id, subscribers = list.len(), "Progress stream closed");
        }
    }

    /// Events dropped across all subscriptions since creation.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Live subscriptions of `job_id`.
    #[must_use]
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        lock(&self.consumers)
            .get(job_id)
            .map_or(0, |list| list.iter().filter(|m| !m.detached.load(Ordering::Acquire)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_training::Metrics;
    use std::time::{Duration, Instant};

    fn event(job: &JobId, step: u64) -> ProgressEvent {
        ProgressEvent::new(job.clone(), step, Some(100), Metrics::new())
    }

    #[tokio::test]
    async fn test_publish_and_recv_in_order() {
        let dispatcher = CallbackDispatcher::default();
        let job = JobId::from("job-1");
        let mut sub = dispatcher.subscribe(&job);

        for step in 1..=3 {
            assert_eq!(dispatcher.publish(&event(&job, step)), 1);
        }
        dispatcher.close_job(&job);

        let mut steps = Vec::new();
        while let Some(e) = sub.recv().await {
            steps.push(e.step);
        }
        assert_eq!(steps, vec![1, 2, 3]);
        assert!(sub.is_closed());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let dispatcher = CallbackDispatcher::default();
        assert_eq!(dispatcher.publish(&event(&JobId::from("nobody"), 1)), 0);
    }

    #[test]
    fn test_slow_consumer_drops_oldest_without_blocking() {
        let dispatcher = CallbackDispatcher::default();
        let job = JobId::from("job-1");
        let mut slow = dispatcher.subscribe_with_capacity(&job, 4);

        let started = Instant::now();
        for step in 1..=1000 {
            dispatcher.publish(&event(&job, step));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(slow.dropped(), 996);
        assert_eq!(dispatcher.dropped_total(), 996);

        let mut steps = Vec::new();
        while let Some(e) = slow.try_recv() {
            steps.push(e.step);
        }
        assert_eq!(steps, vec![997, 998, 999, 1000]);
    }

    #[test]
    fn test_consumers_are_independent() {
        let dispatcher = CallbackDispatcher::default();
        let job = JobId::from("job-1");
        let mut small = dispatcher.subscribe_with_capacity(&job, 1);
        let mut large = dispatcher.subscribe_with_capacity(&job, 10);

        for step in 1..=5 {
            dispatcher.publish(&event(&job, step));
        }
        assert_eq!(small.try_recv().map(|e| e.step), Some(5));
        assert_eq!(large.dropped(), 0);
        assert_eq!(large.try_recv().map(|e| e.step), Some(1));
    }

    #[test]
    fn test_unsubscribe_and_prune_dropped_handles() {
        let dispatcher = CallbackDispatcher::default();
        let job = JobId::from("job-1");
        let kept = dispatcher.subscribe(&job);
        let gone = dispatcher.subscribe(&job);
        assert_eq!(dispatcher.subscriber_count(&job), 2);

        drop(gone);
        assert_eq!(dispatcher.publish(&event(&job, 1)), 1);

        assert!(dispatcher.unsubscribe(kept.id()));
        assert!(!dispatcher.unsubscribe(kept.id()));
        assert!(kept.is_closed());
        assert_eq!(dispatcher.publish(&event(&job, 2)), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let dispatcher = Arc::new(CallbackDispatcher::default());
        let job = JobId::from("job-1");
        let mut sub = dispatcher.subscribe(&job);

        let publisher = {
            let dispatcher = Arc::clone(&dispatcher);
            let job = job.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                dispatcher.publish(&event(&job, 7));
            })
        };

        let received = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
        assert_eq!(received.map(|e| e.step), Some(7));
        publisher.await.unwrap();
    }
}
