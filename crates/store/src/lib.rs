//! Kindex store: per-kind watch-synchronized object mirrors, the fan-out
//! that creates them, and the cache-first read path.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use kindex_core::{ApiResourceInfo, ObjectKey, WatchEvent};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub mod fanout;
pub mod read;

pub use fanout::{KindFilter, KindStatus, WatchFanout};
pub use read::{ListResult, ObjectList, ReadPath};

/// One mutation headed for a store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreDelta {
    Upsert(ObjectKey, Value),
    Remove(ObjectKey),
    /// Full relist; replaces the store contents in one swap.
    Replace(Vec<Value>),
}

impl StoreDelta {
    /// Translate a watch event. Objects without `metadata.name` are dropped.
    pub fn from_event(ev: WatchEvent) -> Option<Self> {
        match ev {
            WatchEvent::Applied(obj) => ObjectKey::of(&obj).map(|k| Self::Upsert(k, obj)),
            WatchEvent::Deleted(obj) => ObjectKey::of(&obj).map(Self::Remove),
            WatchEvent::Restarted(list) => Some(Self::Replace(list)),
        }
    }
}

/// Batch drained from the coalescer; `reset` is applied before `deltas`.
#[derive(Debug, Default)]
pub struct Batch {
    pub reset: Option<Vec<Value>>,
    pub deltas: Vec<StoreDelta>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.reset.is_none() && self.deltas.is_empty()
    }
}

/// Coalescing queue keyed by object with FIFO order. Later deltas for the
/// same key overwrite earlier ones in place; a relist discards everything
/// queued before it.
pub struct Coalescer {
    map: FxHashMap<ObjectKey, StoreDelta>,
    order: VecDeque<ObjectKey>,
    reset: Option<Vec<Value>>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), reset: None, cap: cap.max(1) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.reset.is_none()
    }

    /// True once `cap` distinct keys are pending; the caller should flush.
    pub fn is_full(&self) -> bool {
        self.order.len() >= self.cap
    }

    pub fn push(&mut self, d: StoreDelta) {
        let key = match d {
            StoreDelta::Upsert(ref k, _) | StoreDelta::Remove(ref k) => k.clone(),
            StoreDelta::Replace(list) => {
                self.map.clear();
                self.order.clear();
                self.reset = Some(list);
                return;
            }
        };
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, d);
    }

    pub fn drain_ready(&mut self) -> Batch {
        let mut deltas = Vec::with_capacity(self.order.len());
        while let Some(k) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&k) {
                deltas.push(d);
            }
        }
        Batch { reset: self.reset.take(), deltas }
    }
}

/// Immutable view of one kind's objects at an epoch.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub objects: FxHashMap<ObjectKey, Arc<Value>>,
}

impl StoreSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Value>> {
        self.objects.get(key).cloned()
    }

    /// Objects in `namespace` (exact match), or every object when `None`.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<Value>> {
        self.objects
            .iter()
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace.as_deref() == Some(ns)))
            .map(|(_, v)| Arc::clone(v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Builds snapshots from coalesced batches.
pub struct StoreBuilder {
    epoch: u64,
    objects: FxHashMap<ObjectKey, Arc<Value>>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self { epoch: 0, objects: FxHashMap::default() }
    }

    pub fn apply(&mut self, batch: Batch) {
        if let Some(list) = batch.reset {
            self.objects = list
                .into_iter()
                .filter_map(|o| ObjectKey::of(&o).map(|k| (k, Arc::new(o))))
                .collect();
        }
        for d in batch.deltas {
            match d {
                StoreDelta::Upsert(k, v) => {
                    self.objects.insert(k, Arc::new(v));
                }
                StoreDelta::Remove(k) => {
                    self.objects.remove(&k);
                }
                StoreDelta::Replace(_) => {}
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<StoreSnapshot> {
        Arc::new(StoreSnapshot { epoch: self.epoch, objects: self.objects.clone() })
    }
}

/// Lifecycle of one store. Only `Synced` stores answer reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum StoreStatus {
    Pending,
    Synced,
    Failed(String),
}

/// Read handle for one kind's mirror. Cheap to clone.
#[derive(Clone)]
pub struct ResourceStore {
    info: Arc<ApiResourceInfo>,
    snap: Arc<ArcSwap<StoreSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    status_tx: Arc<watch::Sender<StoreStatus>>,
}

impl ResourceStore {
    pub fn info(&self) -> &ApiResourceInfo {
        &self.info
    }

    pub fn kind(&self) -> &str {
        &self.info.kind
    }

    pub fn current(&self) -> Arc<StoreSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    pub fn status(&self) -> StoreStatus {
        self.status_tx.borrow().clone()
    }

    pub fn is_synced(&self) -> bool {
        matches!(*self.status_tx.borrow(), StoreStatus::Synced)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.status_tx.borrow(), StoreStatus::Failed(_))
    }

    /// Wait until the initial list is applied. `false` on timeout or failure.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        let wait = rx.wait_for(|s| !matches!(s, StoreStatus::Pending));
        let synced = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(s)) => matches!(*s, StoreStatus::Synced),
            _ => false,
        };
        synced
    }

    /// Failure before the first sync is terminal; a synced store keeps its status.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.status_tx.send_if_modified(|s| {
            if matches!(s, StoreStatus::Pending) {
                *s = StoreStatus::Failed(reason);
                true
            } else {
                false
            }
        })
    }

    fn mark_synced(&self) -> bool {
        self.status_tx.send_if_modified(|s| {
            if matches!(s, StoreStatus::Pending) {
                *s = StoreStatus::Synced;
                true
            } else {
                false
            }
        })
    }
}

/// Spawn the ingest loop for one kind. Returns the delta sender and the read
/// handle; the loop exits once every sender is dropped.
pub fn spawn_ingest(info: ApiResourceInfo, cap: usize) -> (mpsc::Sender<StoreDelta>, ResourceStore) {
    let (tx, mut rx) = mpsc::channel::<StoreDelta>(cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(StoreSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (status_tx, _) = watch::channel(StoreStatus::Pending);
    let store = ResourceStore { info: Arc::new(info), snap, epoch_rx, status_tx: Arc::new(status_tx) };
    let handle = store.clone();

    tokio::spawn(async move {
        let kind = handle.kind().to_string();
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = StoreBuilder::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(8));
        let publish = |coalescer: &mut Coalescer, builder: &mut StoreBuilder| {
            let batch = coalescer.drain_ready();
            if batch.is_empty() {
                return;
            }
            let relisted = batch.reset.is_some();
            builder.apply(batch);
            let next = builder.freeze();
            let (epoch, len) = (next.epoch, next.len());
            handle.snap.store(next);
            let _ = epoch_tx.send(epoch);
            if relisted && handle.mark_synced() {
                info!(kind = %kind, objects = len, "store: synced");
            }
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(d) => {
                        coalescer.push(d);
                        if coalescer.is_full() {
                            publish(&mut coalescer, &mut builder);
                        }
                    }
                    None => {
                        debug!(kind = %kind, "delta channel closed; draining and exiting ingest loop");
                        publish(&mut coalescer, &mut builder);
                        break;
                    }
                },
                _ = ticker.tick() => publish(&mut coalescer, &mut builder),
            }
        }
        debug!(kind = %kind, "ingest loop stopped");
    });

    (tx, store)
}
