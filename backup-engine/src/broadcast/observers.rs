//! Registry of live progress subscribers.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::models::ProgressView;

pub type ObserverId = Uuid;

/// Views buffered per channel observer before new ones are dropped for it
pub const OBSERVER_QUEUE_CAPACITY: usize = 256;

/// Receives every progress view pushed after it joined.
pub trait Observer: Send + Sync {
    fn notify(&self, view: &ProgressView) -> anyhow::Result<()>;
}

/// Never waits: a full queue drops this view for this observer only.
impl Observer for mpsc::Sender<ProgressView> {
    fn notify(&self, view: &ProgressView) -> anyhow::Result<()> {
        self.try_send(view.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("observer queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("observer channel closed"),
        })
    }
}

/// Process-wide set of observers. Cheap to clone; clones share the set.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<DashMap<ObserverId, Arc<dyn Observer>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = Uuid::new_v4();
        self.observers.insert(id, observer);
        debug!(observer_id = %id, "Observer subscribed");
        id
    }

    /// Subscribe a fresh bounded channel and hand back its receiving end.
    pub fn subscribe_channel(&self) -> (ObserverId, mpsc::Receiver<ProgressView>) {
        self.subscribe_channel_with_capacity(OBSERVER_QUEUE_CAPACITY)
    }

    pub fn subscribe_channel_with_capacity(&self, capacity: usize) -> (ObserverId, mpsc::Receiver<ProgressView>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.subscribe(Arc::new(tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &ObserverId) -> bool {
        let removed = self.observers.remove(id).is_some();
        if removed {
            debug!(observer_id = %id, "Observer unsubscribed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Push `view` to every observer. A failing observer is skipped, never
    /// removed; disconnect cleanup belongs to whoever subscribed it.
    /// Returns how many observers accepted the view.
    pub fn broadcast(&self, view: &ProgressView) -> usize {
        // Snapshot first so no shard lock is held while observers run.
        let targets: Vec<(ObserverId, Arc<dyn Observer>)> = self
            .observers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut delivered = 0;
        for (id, observer) in targets {
            match observer.notify(view) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(observer_id = %id, error = %e, "Skipping observer"),
            }
        }
        delivered
    }
}
