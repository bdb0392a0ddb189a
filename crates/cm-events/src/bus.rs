use crate::types::EventRecord;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use ulid::Ulid;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct EventBus<B> {
    sender: broadcast::Sender<EventRecord<B>>,
    next_seq: Arc<AtomicU64>,
}

impl<B> Clone for EventBus<B> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            next_seq: Arc::clone(&self.next_seq),
        }
    }
}

impl<B: Clone + Send + 'static> Default for EventBus<B> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<B: Clone + Send + 'static> EventBus<B> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> Subscription<B> {
        Subscription {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Publishes to every live subscriber. Having no subscribers is not an error.
    pub fn publish(&self, session_id: Option<String>, body: B) -> EventRecord<B> {
        let record = EventRecord {
            id: format!("evt_{}", Ulid::new()),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: Utc::now(),
            session_id,
            body,
        };
        let _ = self.sender.send(record.clone());
        record
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live subscription. Dropping it (or calling [`Subscription::unsubscribe`])
/// detaches it from the bus.
#[derive(Debug)]
pub struct Subscription<B> {
    receiver: broadcast::Receiver<EventRecord<B>>,
    missed: u64,
}

impl<B: Clone> Subscription<B> {
    /// Waits for the next event. Returns `None` once the bus is gone.
    /// Events dropped because this subscriber fell behind are counted in
    /// [`Subscription::missed`] and skipped.
    pub async fn recv(&mut self) -> Option<EventRecord<B>> {
        loop {
            match self.receiver.recv().await {
                Ok(record) => return Some(record),
                Err(RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<EventRecord<B>> {
        loop {
            match self.receiver.try_recv() {
                Ok(record) => return Some(record),
                Err(TryRecvError::Lagged(skipped)) => self.missed += skipped,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn unsubscribe(self) {}
}
