use std::sync::Arc;

use tokio::sync::Notify;

use super::{BoundedQueue, PushPolicy};

/// Two [`BoundedQueue`]s paired into a single bidirectional link.
///
/// The Left endpoint pushes `L` and pops `R`; the Right endpoint pushes `R`
/// and pops `L`. The two sides exchange distinct request/response
/// vocabularies over one logical channel.
pub struct DuplexChannel;

impl DuplexChannel {
    pub fn new<L, R>(
        left_capacity: usize,
        left_policy: PushPolicy,
        right_capacity: usize,
        right_policy: PushPolicy,
    ) -> (LeftEndpoint<L, R>, RightEndpoint<L, R>) {
        Self::from_queues(
            Arc::new(BoundedQueue::new(left_capacity, left_policy)),
            Arc::new(BoundedQueue::new(right_capacity, right_policy)),
        )
    }

    /// Build a channel over existing queues. Passing a queue that is shared
    /// with another channel fans several producers into one consumer
    /// endpoint (the two I/O multiplexers feed a single event queue this
    /// way).
    pub fn from_queues<L, R>(
        left_to_right: Arc<BoundedQueue<L>>,
        right_to_left: Arc<BoundedQueue<R>>,
    ) -> (LeftEndpoint<L, R>, RightEndpoint<L, R>) {
        (
            LeftEndpoint {
                tx: Arc::clone(&left_to_right),
                rx: Arc::clone(&right_to_left),
            },
            RightEndpoint {
                tx: right_to_left,
                rx: left_to_right,
            },
        )
    }
}

pub struct LeftEndpoint<L, R> {
    tx: Arc<BoundedQueue<L>>,
    rx: Arc<BoundedQueue<R>>,
}

pub struct RightEndpoint<L, R> {
    tx: Arc<BoundedQueue<R>>,
    rx: Arc<BoundedQueue<L>>,
}

impl<L, R> LeftEndpoint<L, R> {
    pub async fn push(&self, value: L) {
        self.tx.push(value).await;
    }

    pub fn try_push(&self, value: L) -> Result<(), L> {
        self.tx.try_push(value)
    }

    pub async fn pop(&self) -> R {
        self.rx.pop().await
    }

    pub fn try_pop(&self) -> Option<R> {
        self.rx.try_pop()
    }

    pub fn can_pop(&self) -> bool {
        self.rx.can_pop()
    }

    /// Wake handle signalled whenever the pop side gains an item.
    pub fn register_waker(&self, waker: Arc<Notify>) {
        self.rx.register_waker(waker);
    }
}

impl<L, R> RightEndpoint<L, R> {
    pub async fn push(&self, value: R) {
        self.tx.push(value).await;
    }

    pub fn try_push(&self, value: R) -> Result<(), R> {
        self.tx.try_push(value)
    }

    pub async fn pop(&self) -> L {
        self.rx.pop().await
    }

    pub fn try_pop(&self) -> Option<L> {
        self.rx.try_pop()
    }

    pub fn can_pop(&self) -> bool {
        self.rx.can_pop()
    }

    pub fn register_waker(&self, waker: Arc<Notify>) {
        self.rx.register_waker(waker);
    }
}

impl<L, R> Clone for LeftEndpoint<L, R> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<L, R> Clone for RightEndpoint<L, R> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            rx: Arc::clone(&self.rx),
        }
    }
}
