use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// What `push` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPolicy {
    /// The producer waits until the consumer drains a slot. Used on paths
    /// where losing an event is not acceptable; the stall is backpressure.
    Block,
    /// The incoming item is discarded. Only suitable for telemetry-like
    /// events where the newest sample is expendable.
    DropNewest,
}

/// Fixed-capacity FIFO ring buffer.
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, value: T) -> Result<(), T> {
        if self.len == self.slots.len() {
            return Err(value);
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(value);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        value
    }
}

/// A bounded multi-producer queue of typed events.
///
/// The capacity and push policy are fixed at construction. Producers and
/// consumers may live on different tasks; the ring itself is guarded by a
/// mutex that is never held across an await point.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    policy: PushPolicy,
    /// Signalled whenever an item is pushed.
    items: Notify,
    /// Signalled whenever a slot frees up.
    space: Notify,
    /// External wake handles, signalled on every push. Lets one consumer
    /// sleep on a single `Notify` shared between several queues.
    wakers: Mutex<Vec<Arc<Notify>>>,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: PushPolicy) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            policy,
            items: Notify::new(),
            space: Notify::new(),
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring<T>> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push an item according to the queue's policy: waits for space on a
    /// `Block` queue, silently discards the item on a full `DropNewest` one.
    pub async fn push(&self, value: T) {
        match self.policy {
            PushPolicy::DropNewest => {
                let _ = self.try_push(value);
            }
            PushPolicy::Block => {
                let mut value = value;
                loop {
                    let space = self.space.notified();
                    match self.try_push(value) {
                        Ok(()) => return,
                        Err(rejected) => {
                            value = rejected;
                            space.await;
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking push; hands the item back if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.ring().push(value)?;
        self.items.notify_one();
        for waker in self
            .wakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
        {
            waker.notify_one();
        }
        Ok(())
    }

    /// Remove and return the oldest item, waiting until one is available.
    pub async fn pop(&self) -> T {
        loop {
            let items = self.items.notified();
            if let Some(value) = self.try_pop() {
                return value;
            }
            items.await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.ring().pop();
        if value.is_some() {
            self.space.notify_one();
        }
        value
    }

    pub fn len(&self) -> usize {
        self.ring().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a `try_pop` right now would yield an item.
    pub fn can_pop(&self) -> bool {
        !self.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring().slots.len()
    }

    /// Register a wake handle that is signalled on every push. A consumer
    /// waiting on several queues registers the same handle with each of
    /// them and sleeps on it instead of polling.
    pub fn register_waker(&self, waker: Arc<Notify>) {
        self.wakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(waker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = BoundedQueue::new(4, PushPolicy::Block);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        queue.try_push(3).unwrap();
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let queue = BoundedQueue::new(2, PushPolicy::Block);
        queue.try_push('a').unwrap();
        queue.try_push('b').unwrap();
        assert!(queue.try_push('c').is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn wraparound_reuses_slots() {
        let queue = BoundedQueue::new(2, PushPolicy::Block);
        for round in 0..10 {
            queue.try_push(round * 2).unwrap();
            queue.try_push(round * 2 + 1).unwrap();
            assert_eq!(queue.try_pop(), Some(round * 2));
            assert_eq!(queue.try_pop(), Some(round * 2 + 1));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn drop_newest_discards_on_full() {
        let queue = BoundedQueue::new(2, PushPolicy::DropNewest);
        queue.push(1).await;
        queue.push(2).await;
        queue.push(3).await; // discarded
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn blocking_push_waits_for_space() {
        let queue = Arc::new(BoundedQueue::new(1, PushPolicy::Block));
        queue.push(1).await;

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(2).await })
        };

        // The producer cannot finish until we drain a slot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, 1);
        producer.await.unwrap();
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(4, PushPolicy::Block));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(42u32).await;
        assert_eq!(consumer.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn registered_waker_fires_on_push() {
        let first = Arc::new(BoundedQueue::<i32>::new(4, PushPolicy::Block));
        let second = Arc::new(BoundedQueue::new(4, PushPolicy::Block));
        let waker = Arc::new(Notify::new());
        first.register_waker(Arc::clone(&waker));
        second.register_waker(Arc::clone(&waker));

        let notified = waker.notified();
        second.push(7).await;
        notified.await;

        assert!(!first.can_pop());
        assert!(second.can_pop());
        assert_eq!(second.try_pop(), Some(7));
    }
}
