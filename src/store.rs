//! In-memory job and queue counters.
//!
//! [`StateStore`] owns every counter the engine tracks. Each process and queue
//! has its own `tokio::sync::Mutex`, so unrelated targets never serialize on
//! each other; the registry lock is only held to look up or insert entries.
//!
//! Lock order: when a queue reservation needs both counters, the consumer
//! process is locked before the queue.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Queue definition id as used by the remote orchestrator.
pub type QueueId = i64;

/// Concurrency limits and queue wiring used when a counter is first created.
#[derive(Debug, Clone)]
pub struct Limits {
    default_limit: u32,
    processes: HashMap<String, u32>,
    queues: HashMap<QueueId, QueuePolicy>,
}

/// Which process consumes a queue and how many consumers it may have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    pub process: String,
    pub max_consumers: Option<u32>,
}

impl Limits {
    pub fn with_default(default_limit: u32) -> Self {
        Self {
            default_limit,
            processes: HashMap::new(),
            queues: HashMap::new(),
        }
    }

    pub fn with_process(mut self, process: impl Into<String>, limit: u32) -> Self {
        self.processes.insert(process.into(), limit);
        self
    }

    pub fn with_queue(mut self, queue_id: QueueId, policy: QueuePolicy) -> Self {
        self.queues.insert(queue_id, policy);
        self
    }

    pub fn process_limit(&self, process: &str) -> u32 {
        self.processes
            .get(process)
            .copied()
            .unwrap_or(self.default_limit)
    }

    fn new_queue(&self, queue_id: QueueId) -> QueueCounter {
        match self.queues.get(&queue_id) {
            Some(policy) => QueueCounter {
                available_items: 0,
                active_consumers: 0,
                max_consumers: policy
                    .max_consumers
                    .unwrap_or_else(|| self.process_limit(&policy.process)),
                process: Some(policy.process.clone()),
            },
            None => QueueCounter {
                available_items: 0,
                active_consumers: 0,
                max_consumers: self.default_limit,
                process: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessCounter {
    pub running: u32,
    pub pending: u32,
    /// Runs requested for this process that have not been admitted yet.
    pub backlog: u32,
    pub max_concurrent: u32,
}

impl ProcessCounter {
    fn new(max_concurrent: u32) -> Self {
        Self {
            running: 0,
            pending: 0,
            backlog: 0,
            max_concurrent,
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.running.saturating_add(self.pending)
    }

    /// Free slots: `max_concurrent - (running + pending)`, floored at zero.
    pub fn capacity(&self) -> u32 {
        self.max_concurrent.saturating_sub(self.in_flight())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCounter {
    pub available_items: u32,
    pub active_consumers: u32,
    pub max_consumers: u32,
    /// Process whose jobs drain this queue; `None` for queues we only observe.
    pub process: Option<String>,
}

impl QueueCounter {
    /// Items not yet covered by a consumer.
    pub fn demand(&self) -> u32 {
        self.available_items.saturating_sub(self.active_consumers)
    }

    pub fn consumer_capacity(&self) -> u32 {
        self.max_consumers.saturating_sub(self.active_consumers)
    }
}

/// Authoritative process counts from the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessCounts {
    pub running: u32,
    pub pending: u32,
}

/// Authoritative queue counts from the remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub available_items: u32,
    pub active_consumers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Process(String, ProcessCounts),
    Queue(QueueId, QueueCounts),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessField {
    Running,
    Pending,
    Backlog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueField {
    AvailableItems,
    ActiveConsumers,
}

/// One adjustable counter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Process(&'a str, ProcessField),
    Queue(QueueId, QueueField),
}

impl FieldRef<'_> {
    fn describe(&self) -> (String, &'static str) {
        match self {
            FieldRef::Process(id, field) => (
                format!("process {id}"),
                match field {
                    ProcessField::Running => "running",
                    ProcessField::Pending => "pending",
                    ProcessField::Backlog => "backlog",
                },
            ),
            FieldRef::Queue(id, field) => (
                format!("queue {id}"),
                match field {
                    QueueField::AvailableItems => "available_items",
                    QueueField::ActiveConsumers => "active_consumers",
                },
            ),
        }
    }
}

/// A decrement tried to take a counter below zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("drift on {target}.{field}: decrement overshot by {shortfall}")]
pub struct Drift {
    pub target: String,
    pub field: &'static str,
    pub shortfall: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub value: u32,
    pub drift: Option<Drift>,
}

/// Where a reservation took its demand from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandSource {
    Backlog,
    Queue(QueueId),
}

/// Slots optimistically taken by admission. Hand back unused slots with
/// [`StateStore::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub process: String,
    pub source: DemandSource,
    pub count: u32,
}

/// Saturating signed adjustment. Returns the new value and how far below zero
/// the decrement would have gone.
fn adjust(value: &mut u32, delta: i64) -> u64 {
    let next = i64::from(*value) + delta;
    if next < 0 {
        *value = 0;
        next.unsigned_abs()
    } else {
        *value = u32::try_from(next).unwrap_or(u32::MAX);
        0
    }
}

struct Registry<K, V> {
    order: Vec<K>,
    entries: HashMap<K, Arc<Mutex<V>>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

async fn entry<K, V>(
    registry: &RwLock<Registry<K, V>>,
    key: &K,
    create: impl FnOnce() -> V,
) -> Arc<Mutex<V>>
where
    K: Eq + Hash + Clone,
{
    if let Some(found) = registry.read().await.entries.get(key) {
        return Arc::clone(found);
    }
    let mut registry = registry.write().await;
    if let Some(found) = registry.entries.get(key) {
        return Arc::clone(found);
    }
    let value = Arc::new(Mutex::new(create()));
    registry.entries.insert(key.clone(), Arc::clone(&value));
    registry.order.push(key.clone());
    value
}

/// Owner of all process and queue counters.
pub struct StateStore {
    limits: Limits,
    processes: RwLock<Registry<String, ProcessCounter>>,
    queues: RwLock<Registry<QueueId, QueueCounter>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl StateStore {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            processes: RwLock::new(Registry::default()),
            queues: RwLock::new(Registry::default()),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    async fn process_entry(&self, id: &str) -> Arc<Mutex<ProcessCounter>> {
        entry(&self.processes, &id.to_string(), || {
            ProcessCounter::new(self.limits.process_limit(id))
        })
        .await
    }

    async fn queue_entry(&self, id: QueueId) -> Arc<Mutex<QueueCounter>> {
        entry(&self.queues, &id, || self.limits.new_queue(id)).await
    }

    /// Current counters for a process, created with zero counts if absent.
    pub async fn process_counter(&self, id: &str) -> ProcessCounter {
        self.process_entry(id).await.lock().await.clone()
    }

    /// Current counters for a queue, created with zero counts if absent.
    pub async fn queue_counter(&self, id: QueueId) -> QueueCounter {
        self.queue_entry(id).await.lock().await.clone()
    }

    /// Process ids in registration order.
    pub async fn process_ids(&self) -> Vec<String> {
        self.processes.read().await.order.clone()
    }

    /// Queue ids in registration order.
    pub async fn queue_ids(&self) -> Vec<QueueId> {
        self.queues.read().await.order.clone()
    }

    /// Adjust one counter by `delta`, clamping at zero.
    pub async fn apply_delta(&self, field: FieldRef<'_>, delta: i64) -> DeltaOutcome {
        let (value, shortfall) = match field {
            FieldRef::Process(id, which) => {
                let counter = self.process_entry(id).await;
                let mut counter = counter.lock().await;
                let slot = match which {
                    ProcessField::Running => &mut counter.running,
                    ProcessField::Pending => &mut counter.pending,
                    ProcessField::Backlog => &mut counter.backlog,
                };
                let shortfall = adjust(slot, delta);
                (*slot, shortfall)
            }
            FieldRef::Queue(id, which) => {
                let counter = self.queue_entry(id).await;
                let mut counter = counter.lock().await;
                let slot = match which {
                    QueueField::AvailableItems => &mut counter.available_items,
                    QueueField::ActiveConsumers => &mut counter.active_consumers,
                };
                let shortfall = adjust(slot, delta);
                (*slot, shortfall)
            }
        };

        let drift = (shortfall > 0).then(|| {
            let (target, field) = field.describe();
            Drift {
                target,
                field,
                shortfall,
            }
        });
        if let Some(drift) = &drift {
            tracing::warn!(%drift, "counter clamped at zero");
        }
        DeltaOutcome { value, drift }
    }

    /// Overwrite a target's authoritative counters. Last writer wins.
    pub async fn replace_snapshot(&self, snapshot: Snapshot) {
        match snapshot {
            Snapshot::Process(id, counts) => {
                let counter = self.process_entry(&id).await;
                let mut counter = counter.lock().await;
                counter.running = counts.running;
                counter.pending = counts.pending;
            }
            Snapshot::Queue(id, counts) => {
                let counter = self.queue_entry(id).await;
                let mut counter = counter.lock().await;
                counter.available_items = counts.available_items;
                counter.active_consumers = counts.active_consumers;
            }
        }
    }

    /// Take up to `min(capacity, backlog)` slots for a process, moving them
    /// from `backlog` to `pending` in one step.
    pub async fn reserve_process(&self, id: &str) -> Option<Reservation> {
        let counter = self.process_entry(id).await;
        let mut counter = counter.lock().await;
        let count = counter.capacity().min(counter.backlog);
        if count == 0 {
            return None;
        }
        counter.backlog -= count;
        counter.pending += count;
        Some(Reservation {
            process: id.to_string(),
            source: DemandSource::Backlog,
            count,
        })
    }

    /// Take consumer slots for a queue: bounded by the consumer process'
    /// capacity, the queue's consumer cap, its uncovered items and
    /// `requested`. Increments the process' `pending` and the queue's
    /// `active_consumers` together.
    pub async fn reserve_queue(&self, queue_id: QueueId, requested: u32) -> Option<Reservation> {
        let queue = self.queue_entry(queue_id).await;
        let process_id = queue.lock().await.process.clone()?;
        let process = self.process_entry(&process_id).await;

        let mut process = process.lock().await;
        let mut queue = queue.lock().await;
        let count = process
            .capacity()
            .min(queue.consumer_capacity())
            .min(queue.demand())
            .min(requested);
        if count == 0 {
            return None;
        }
        process.pending += count;
        queue.active_consumers += count;
        Some(Reservation {
            process: process_id,
            source: DemandSource::Queue(queue_id),
            count,
        })
    }

    /// Give back `count` slots of a reservation by applying the negated
    /// deltas.
    pub async fn release(&self, reservation: &Reservation, count: u32) {
        if count == 0 {
            return;
        }
        let delta = i64::from(count);
        self.apply_delta(
            FieldRef::Process(&reservation.process, ProcessField::Pending),
            -delta,
        )
        .await;
        match reservation.source {
            DemandSource::Backlog => {
                self.apply_delta(
                    FieldRef::Process(&reservation.process, ProcessField::Backlog),
                    delta,
                )
                .await;
            }
            DemandSource::Queue(queue_id) => {
                self.apply_delta(
                    FieldRef::Queue(queue_id, QueueField::ActiveConsumers),
                    -delta,
                )
                .await;
            }
        }
    }
}
