use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::RemoteGateway;
use super::error::GatewayError;
use super::types::{
    ODataList, ProcessDetails, QueueDetails, QueueStatus, Release, RemoteJob, StartInfo,
    StartJobsRequest, StartedJob,
};

const JOBS_PATH: &str = "/odata/Jobs";
const QUEUE_STATUS_PATH: &str = "/odata/QueueDefinitions/UiPathODataSvc.GetQueuesProcessingStatus";
const RELEASES_PATH: &str = "/odata/Releases";
const START_JOBS_PATH: &str = "/odata/Jobs/UiPath.Server.Configuration.OData.StartJobs";
const FOLDER_HEADER: &str = "X-UIPATH-OrganizationUnitId";

/// HTTP client for the orchestrator OData API.
pub struct OrchestratorClient {
    client: Client,
    base_url: String,
    token: String,
    folder_id: Option<i64>,
    // (process, env) -> release key
    releases: Mutex<HashMap<(String, String), String>>,
}

impl OrchestratorClient {
    pub fn new(base_url: &str, token: String, folder_id: Option<i64>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            folder_id,
            releases: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.bearer_auth(&self.token);
        match self.folder_id {
            Some(id) => req.header(FOLDER_HEADER, id.to_string()),
            None => req,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        filter: Option<&str>,
    ) -> Result<T, GatewayError> {
        let mut req = self.authorized(self.client.get(self.url(path)));
        if let Some(filter) = filter {
            req = req.query(&[("$filter", filter)]);
        }
        let response = check_status(req.send().await?, false).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Look up (and cache) the release key for a process in an environment.
    /// Processes are identified by release name, the same name job listings
    /// and webhooks report.
    async fn release_key(&self, process: &str, env: &str) -> Result<String, GatewayError> {
        let cache_key = (process.to_string(), env.to_string());
        if let Some(key) = self.releases.lock().await.get(&cache_key) {
            return Ok(key.clone());
        }

        let filter = format!(
            "Name eq '{}' and EnvironmentName eq '{}'",
            odata_quote(process),
            odata_quote(env)
        );
        let list: ODataList<Release> = self.get_json(RELEASES_PATH, Some(&filter)).await?;
        let release = list.value.into_iter().next().ok_or_else(|| {
            GatewayError::Decode(format!("no release for process {process} in {env}"))
        })?;

        self.releases
            .lock()
            .await
            .insert(cache_key, release.key.clone());
        Ok(release.key)
    }
}

impl RemoteGateway for OrchestratorClient {
    async fn get_process_details(&self) -> Result<ProcessDetails, GatewayError> {
        let list: ODataList<RemoteJob> = self
            .get_json(JOBS_PATH, Some("State eq 'Pending' or State eq 'Running'"))
            .await?;
        Ok(ProcessDetails::from_jobs(&list.value))
    }

    async fn get_queue_details(&self) -> Result<QueueDetails, GatewayError> {
        let list: ODataList<QueueStatus> = self.get_json(QUEUE_STATUS_PATH, None).await?;
        Ok(QueueDetails::from_statuses(&list.value))
    }

    async fn start_job(
        &self,
        process: &str,
        env: &str,
        count: u32,
        args: Option<&serde_json::Value>,
    ) -> Result<Vec<StartedJob>, GatewayError> {
        let release_key = self.release_key(process, env).await?;
        let body = StartJobsRequest {
            start_info: StartInfo {
                release_key,
                strategy: "ModernJobsCount".to_string(),
                jobs_count: count,
                input_arguments: args.map(|a| a.to_string()),
            },
        };

        let response = self
            .authorized(self.client.post(self.url(START_JOBS_PATH)))
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, true).await?;
        let list: ODataList<StartedJob> = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(list.value)
    }
}

/// Map non-2xx responses to errors. For start requests, 400 and 409 mean the
/// remote refused to admit the jobs.
async fn check_status(response: Response, start: bool) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    let status_code = status.as_u16();

    if start && matches!(status, StatusCode::CONFLICT | StatusCode::BAD_REQUEST) {
        return Err(GatewayError::Rejected {
            status: status_code,
            message,
        });
    }
    Err(GatewayError::Api {
        status: status_code,
        message,
    })
}

fn odata_quote(value: &str) -> String {
    value.replace('\'', "''")
}
