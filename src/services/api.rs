use crate::actions::ActionOutcome;
use crate::core::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::services::{ExecutionReporter, WorkflowSource};
use crate::types::{DeviceType, ExecutionRecord, ExecutionStatus, Workflow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the workflow service: fetches active workflows and
/// receives execution records.
#[derive(Debug, Clone)]
pub struct WorkflowApiClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActiveWorkflowsResponse {
    success: bool,
    #[serde(default)]
    workflows: Vec<Workflow>,
    #[serde(default)]
    error: Option<String>,
}

/// Wire shape of an execution report.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionPayload<'a> {
    workflow_id: &'a str,
    trigger_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    status: ExecutionStatus,
    execution_time_ms: u64,
    page_url: &'a str,
    session_id: &'a str,
    user_agent: &'a str,
    device_type: DeviceType,
    actions: &'a [ActionOutcome],
    execution_key: &'a str,
    timestamp: String,
}

impl<'a> ExecutionPayload<'a> {
    fn new(record: &'a ExecutionRecord, user_id: Option<&'a str>) -> Self {
        Self {
            workflow_id: &record.workflow_id,
            trigger_id: &record.trigger_id,
            user_id,
            status: record.status,
            execution_time_ms: record.execution_time_ms,
            page_url: &record.page_url,
            session_id: &record.session_id,
            user_agent: &record.user_agent,
            device_type: record.device_type,
            actions: &record.actions_executed,
            execution_key: &record.execution_key,
            timestamp: record.timestamp.to_rfc3339(),
        }
    }
}

impl WorkflowApiClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if config.endpoint().is_empty() {
            return Err(EngineError::ConfigurationError(
                "endpoint is required".to_string(),
            ));
        }

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint().to_string(),
            api_key: config.api_key.clone(),
            user_id: config.user_id.clone(),
        })
    }

    fn active_workflows_url(&self, page_url: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/api/workflows/active", self.endpoint))?;
        url.query_pairs_mut().append_pair("url", page_url);
        Ok(url)
    }

    fn track_execution_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/functions/v1/track-execution",
            self.endpoint
        ))?)
    }
}

#[async_trait]
impl WorkflowSource for WorkflowApiClient {
    async fn fetch_active(&self, page_url: &str) -> Result<Vec<Workflow>> {
        let url = self.active_workflows_url(page_url)?;
        debug!(url = %url, "Fetching active workflows");

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::WorkflowFetchFailed(format!("HTTP {}", status)));
        }

        let body: ActiveWorkflowsResponse = response.json().await?;
        if !body.success {
            return Err(EngineError::WorkflowFetchFailed(
                body.error
                    .unwrap_or_else(|| "service reported failure".to_string()),
            ));
        }

        Ok(body.workflows.into_iter().filter(|w| w.is_active).collect())
    }
}

#[async_trait]
impl ExecutionReporter for WorkflowApiClient {
    async fn report(&self, record: &ExecutionRecord) -> Result<()> {
        let payload = ExecutionPayload::new(record, self.user_id.as_deref());

        let mut request = self.client.post(self.track_execution_url()?).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EngineError::ReportFailed(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}
