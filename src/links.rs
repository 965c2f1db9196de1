//! Queue item links: "when this item completes, do that".

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::QueueId;

/// Links older than this are dropped even if their queue never drains.
pub const DEFAULT_LINK_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// What to trigger when a linked queue item completes.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkedAction {
    /// Evaluate the dependent queue for one more consumer.
    StartQueue { queue_id: QueueId },
    /// Start one job of a process outright.
    StartProcess {
        process: String,
        env: String,
        args: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone)]
struct Link {
    /// Queue the item lives in.
    source: QueueId,
    action: LinkedAction,
    linked_at: DateTime<Utc>,
}

/// Pending links keyed by queue item id. Each link fires at most once.
///
/// Completion events can be lost, so links are also pruned once their
/// source queue is seen drained, or once they outlive `max_age`.
#[derive(Debug)]
pub struct LinkBook {
    links: Mutex<HashMap<i64, Vec<Link>>>,
    max_age: Duration,
}

impl Default for LinkBook {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_LINK_MAX_AGE)
    }
}

impl LinkBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    pub async fn link(&self, source: QueueId, item_id: i64, action: LinkedAction) {
        self.link_at(source, item_id, action, Utc::now()).await;
    }

    async fn link_at(
        &self,
        source: QueueId,
        item_id: i64,
        action: LinkedAction,
        linked_at: DateTime<Utc>,
    ) {
        self.links.lock().await.entry(item_id).or_default().push(Link {
            source,
            action,
            linked_at,
        });
    }

    /// Remove and return every link for `item_id`.
    pub async fn take(&self, item_id: i64) -> Vec<LinkedAction> {
        self.links
            .lock()
            .await
            .remove(&item_id)
            .unwrap_or_default()
            .into_iter()
            .map(|link| link.action)
            .collect()
    }

    /// Drop links registered before `observed_at` whose source queue was
    /// drained at that time, or that are older than `max_age`. Returns how
    /// many were dropped.
    pub async fn prune(&self, drained: &HashSet<QueueId>, observed_at: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| observed_at.checked_sub_signed(age));
        let mut links = self.links.lock().await;
        let mut pruned = 0;
        links.retain(|_, item_links| {
            let before = item_links.len();
            item_links.retain(|link| {
                let stale = link.linked_at < observed_at
                    && (drained.contains(&link.source)
                        || cutoff.is_some_and(|cutoff| link.linked_at < cutoff));
                !stale
            });
            pruned += before - item_links.len();
            !item_links.is_empty()
        });
        pruned
    }

    pub async fn len(&self) -> usize {
        self.links.lock().await.values().map(Vec::len).sum()
    }
}
