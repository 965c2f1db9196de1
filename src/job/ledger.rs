use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::record::{JobRecord, JobState, Transition};

/// How many finished job ids are remembered for duplicate detection.
pub const FINISHED_MEMORY: usize = 1024;

/// Tracks jobs this service knows about so repeated webhook deliveries can be
/// recognised.
#[derive(Debug, Default)]
pub struct JobLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    active: HashMap<i64, JobRecord>,
    finished: VecDeque<i64>,
    finished_ids: HashSet<i64>,
}

impl LedgerInner {
    fn remember_finished(&mut self, id: i64) {
        if !self.finished_ids.insert(id) {
            return;
        }
        self.finished.push_back(id);
        while self.finished.len() > FINISHED_MEMORY {
            if let Some(old) = self.finished.pop_front() {
                self.finished_ids.remove(&old);
            }
        }
    }
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record jobs the remote accepted as `Pending`.
    ///
    /// Returns how many of them were already marked uncounted by an early
    /// "created" event; the caller owes that many `pending` decrements.
    pub async fn record_accepted(
        &self,
        process: &str,
        ids: impl IntoIterator<Item = i64>,
    ) -> u32 {
        let mut inner = self.inner.lock().await;
        let mut settled = 0;
        for id in ids {
            if inner.finished_ids.contains(&id) {
                continue;
            }
            let record = inner
                .active
                .entry(id)
                .or_insert_with(|| JobRecord::new(id, process, JobState::Pending));
            if record.uncounted {
                record.uncounted = false;
                settled += 1;
            }
        }
        settled
    }

    /// Flag a running job whose "created" event found no pending slot.
    pub async fn mark_uncounted(&self, id: i64) {
        if let Some(record) = self.inner.lock().await.active.get_mut(&id) {
            record.uncounted = true;
        }
    }

    /// A "job created" notification arrived.
    ///
    /// Unknown jobs (started by someone else, or pruned) are adopted as
    /// running and reported as [`Transition::Started`].
    pub async fn observe_created(&self, id: i64, process: &str) -> Transition {
        let mut inner = self.inner.lock().await;
        if inner.finished_ids.contains(&id) {
            return Transition::Duplicate;
        }
        match inner.active.get_mut(&id) {
            Some(record) => record.start(),
            None => {
                inner
                    .active
                    .insert(id, JobRecord::new(id, process, JobState::Running));
                Transition::Started
            }
        }
    }

    /// A "job finished" notification arrived. The record is discarded and its
    /// id remembered.
    pub async fn observe_finished(&self, id: i64) -> Transition {
        let mut inner = self.inner.lock().await;
        if inner.finished_ids.contains(&id) {
            return Transition::Duplicate;
        }
        let transition = match inner.active.remove(&id) {
            Some(mut record) => record.finish(),
            None => Transition::Finished {
                from: JobState::Running,
            },
        };
        inner.remember_finished(id);
        transition
    }

    /// Drop records the remote no longer lists as active. Records touched at
    /// or after `observed_at` are kept, since the listing may predate them.
    pub async fn retain_active(
        &self,
        remote_ids: &HashSet<i64>,
        observed_at: DateTime<Utc>,
    ) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.active.len();
        inner
            .active
            .retain(|id, record| remote_ids.contains(id) || record.updated_at >= observed_at);
        before - inner.active.len()
    }

    pub async fn get(&self, id: i64) -> Option<JobRecord> {
        self.inner.lock().await.active.get(&id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }
}
