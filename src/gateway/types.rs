//! Wire types for the orchestrator OData endpoints.
//!
//! Field names follow the remote API's PascalCase JSON via `serde(rename)`.
//! The aggregated forms ([`ProcessDetails`], [`QueueDetails`]) are what the
//! rest of the crate consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Generic OData collection envelope: `{ "value": [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ODataList<T> {
    pub value: Vec<T>,
}

/// Remote job state as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteJobState {
    Pending,
    Running,
    Stopping,
    Terminating,
    Faulted,
    Successful,
    Stopped,
    Suspended,
    Resumed,
    #[serde(other)]
    Unknown,
}

impl RemoteJobState {
    /// Whether a job in this state occupies a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RemoteJobState::Pending
                | RemoteJobState::Running
                | RemoteJobState::Stopping
                | RemoteJobState::Terminating
                | RemoteJobState::Resumed
        )
    }
}

/// A single job row from `GET /odata/Jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteJob {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "ReleaseName")]
    pub release_name: String,
    #[serde(rename = "State")]
    pub state: RemoteJobState,
}

/// A row from `GetQueuesProcessingStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    #[serde(rename = "QueueDefinitionId")]
    pub queue_definition_id: i64,
    #[serde(rename = "QueueDefinitionName", default)]
    pub queue_definition_name: String,
    #[serde(rename = "ItemsToProcess", default)]
    pub items_to_process: u32,
    #[serde(rename = "ItemsInProgress", default)]
    pub items_in_progress: u32,
}

/// A row from `GET /odata/Releases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// Body of the `StartJobs` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobsRequest {
    #[serde(rename = "startInfo")]
    pub start_info: StartInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartInfo {
    #[serde(rename = "ReleaseKey")]
    pub release_key: String,
    #[serde(rename = "Strategy")]
    pub strategy: String,
    #[serde(rename = "JobsCount")]
    pub jobs_count: u32,
    /// JSON-encoded argument object; the remote expects a string here.
    #[serde(rename = "InputArguments", skip_serializing_if = "Option::is_none")]
    pub input_arguments: Option<String>,
}

/// Active job counts for one process, aggregated from the jobs listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessActivity {
    pub running: u32,
    pub pending: u32,
    /// Ids of every active job, used to prune the local job ledger.
    pub job_ids: Vec<i64>,
}

/// Authoritative per-process activity, keyed by process (release) name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessDetails {
    pub processes: BTreeMap<String, ProcessActivity>,
}

impl ProcessDetails {
    /// Aggregate a raw jobs listing into per-process counts.
    ///
    /// Inactive jobs are ignored; `Pending` counts as pending and every other
    /// active state as running.
    pub fn from_jobs(jobs: &[RemoteJob]) -> Self {
        let mut processes: BTreeMap<String, ProcessActivity> = BTreeMap::new();
        for job in jobs.iter().filter(|j| j.state.is_active()) {
            let entry = processes.entry(job.release_name.clone()).or_default();
            if job.state == RemoteJobState::Pending {
                entry.pending += 1;
            } else {
                entry.running += 1;
            }
            entry.job_ids.push(job.id);
        }
        Self { processes }
    }
}

/// Authoritative item counts keyed by queue definition id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDetails {
    pub available: BTreeMap<i64, u32>,
    pub in_progress: BTreeMap<i64, u32>,
}

impl QueueDetails {
    pub fn from_statuses(rows: &[QueueStatus]) -> Self {
        Self {
            available: rows
                .iter()
                .map(|r| (r.queue_definition_id, r.items_to_process))
                .collect(),
            in_progress: rows
                .iter()
                .map(|r| (r.queue_definition_id, r.items_in_progress))
                .collect(),
        }
    }

    /// Listed queues with nothing waiting and nothing being worked on.
    pub fn drained(&self) -> impl Iterator<Item = i64> + '_ {
        self.available
            .iter()
            .filter(|&(id, &available)| {
                available == 0 && self.in_progress.get(id).copied().unwrap_or(0) == 0
            })
            .map(|(&id, _)| id)
    }
}

/// A job the remote accepted in response to a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedJob {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "ReleaseName", default)]
    pub release_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_listing_deserializes_from_api_format() {
        let json = r#"{
            "value": [
                {"Id": 1, "ReleaseName": "InvoiceBot", "State": "Running"},
                {"Id": 2, "ReleaseName": "InvoiceBot", "State": "Pending"},
                {"Id": 3, "ReleaseName": "Mailer", "State": "Faulted"},
                {"Id": 4, "ReleaseName": "Mailer", "State": "SomethingNew"}
            ]
        }"#;
        let list: ODataList<RemoteJob> = serde_json::from_str(json).unwrap();
        assert_eq!(list.value.len(), 4);
        assert_eq!(list.value[1].state, RemoteJobState::Pending);
        assert_eq!(list.value[3].state, RemoteJobState::Unknown);
    }

    #[test]
    fn process_details_aggregate_active_jobs_only() {
        let jobs = vec![
            RemoteJob { id: 1, release_name: "A".into(), state: RemoteJobState::Running },
            RemoteJob { id: 2, release_name: "A".into(), state: RemoteJobState::Pending },
            RemoteJob { id: 3, release_name: "A".into(), state: RemoteJobState::Successful },
            RemoteJob { id: 4, release_name: "B".into(), state: RemoteJobState::Stopping },
        ];
        let details = ProcessDetails::from_jobs(&jobs);

        let a = &details.processes["A"];
        assert_eq!((a.running, a.pending), (1, 1));
        assert_eq!(a.job_ids, vec![1, 2]);
        assert_eq!(details.processes["B"].running, 1);
    }

    #[test]
    fn start_info_serializes_remote_field_names() {
        let req = StartJobsRequest {
            start_info: StartInfo {
                release_key: "abc".into(),
                strategy: "ModernJobsCount".into(),
                jobs_count: 2,
                input_arguments: None,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["startInfo"]["ReleaseKey"], "abc");
        assert_eq!(json["startInfo"]["JobsCount"], 2);
        assert!(json["startInfo"].get("InputArguments").is_none());
    }

    #[test]
    fn queue_status_defaults_missing_counts() {
        let row: QueueStatus = serde_json::from_str(r#"{"QueueDefinitionId": 7}"#).unwrap();
        assert_eq!(row.items_to_process, 0);
        let details = QueueDetails::from_statuses(&[row]);
        assert_eq!(details.available[&7], 0);
        assert_eq!(details.drained().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn queue_with_items_in_progress_is_not_drained() {
        let rows: Vec<QueueStatus> = serde_json::from_str(
            r#"[{"QueueDefinitionId": 7, "ItemsToProcess": 0, "ItemsInProgress": 2},
                {"QueueDefinitionId": 8, "ItemsToProcess": 0, "ItemsInProgress": 0}]"#,
        )
        .unwrap();
        let details = QueueDetails::from_statuses(&rows);
        assert_eq!(details.in_progress[&7], 2);
        assert_eq!(details.drained().collect::<Vec<_>>(), vec![8]);
    }
}
