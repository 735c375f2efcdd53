use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::pipeline::Sample;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers whose queue was full; they miss this sample only.
    pub dropped: usize,
    /// Subscribers found closed and unregistered.
    pub removed: usize,
}

struct HubInner {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Arc<Sample>>>>,
    capacity: usize,
}

/// One-producer, many-consumer fan-out of telemetry samples.
///
/// Every subscriber owns a bounded FIFO queue. Publishing never waits on a
/// subscriber: a full queue drops that sample for that subscriber alone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<Uuid, mpsc::Sender<Arc<Sample>>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        if self.subscribers().insert(id, tx).is_some() {
            warn!("Subscriber {id} re-registered, previous queue replaced");
        }
        debug!("Subscriber {id} registered");
        Subscription {
            id,
            hub: self.clone(),
            rx,
        }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.subscribers().remove(&id).is_some();
        if removed {
            debug!("Subscriber {id} unregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    pub fn is_subscribed(&self, id: Uuid) -> bool {
        self.subscribers().contains_key(&id)
    }

    pub fn publish(&self, sample: Sample) -> PublishReport {
        let sample = Arc::new(sample);
        let mut report = PublishReport::default();
        let mut subscribers = self.subscribers();
        let mut closed = Vec::new();

        for (id, tx) in subscribers.iter() {
            match tx.try_send(sample.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!("Subscriber {id} is lagging, sample dropped for it");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            subscribers.remove(&id);
            report.removed += 1;
            debug!("Subscriber {id} closed, unregistered during publish");
        }

        report
    }
}

/// Receiving end of one subscriber's queue. Dropping it unregisters.
pub struct Subscription {
    id: Uuid,
    hub: BroadcastHub,
    rx: mpsc::Receiver<Arc<Sample>>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<Sample>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Sample>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
