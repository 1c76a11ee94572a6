//! Query the execution state of the generating task itself.

use anyhow::Result;
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::{event, Level};

const STATUS_SUCCESS: &str = "success";

/// Details about a single execution of an evergreen task.
#[derive(Debug, Deserialize)]
struct TaskExecutionDetails {
    /// Index of this execution of the task.
    execution: u64,
    /// Completion status of the execution.
    status: String,
}

/// A service for checking whether task generation already ran.
#[async_trait]
pub trait TaskStateService: Send + Sync {
    /// Check if a previous execution of the generating task already succeeded.
    ///
    /// Generation is retried by the CI platform when unrelated steps fail. A retry
    /// of a task that already published its configuration must not publish again.
    async fn generation_already_completed(&self, task_id: &str) -> Result<bool>;
}

/// Implementation of `TaskStateService` backed by the evergreen API.
pub struct TaskStateServiceImpl {
    /// HTTP client to query the API with.
    client: ClientWithMiddleware,
    /// Base URL of the evergreen API.
    api_server: String,
}

impl TaskStateServiceImpl {
    /// Create a new instance of the task state service.
    pub fn new(client: ClientWithMiddleware, api_server: String) -> Self {
        Self { client, api_server }
    }

    async fn get_execution(
        &self,
        task_id: &str,
        execution: Option<u64>,
    ) -> Result<Option<TaskExecutionDetails>> {
        let mut url = format!("{}/rest/v2/tasks/{}", self.api_server, task_id);
        if let Some(execution) = execution {
            url = format!("{}?execution={}", url, execution);
        }
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                event!(
                    Level::WARN,
                    task_id,
                    error = error.to_string(),
                    "Could not query task execution state"
                );
                return Ok(None);
            }
        };
        if !response.status().is_success() {
            event!(
                Level::WARN,
                task_id,
                status = response.status().as_u16(),
                "Task execution state query failed"
            );
            return Ok(None);
        }
        Ok(response.json().await.ok())
    }
}

/// Whether any of the observed prior executions completed successfully.
///
/// Executions whose state could not be fetched count as not successful.
fn any_prior_success(executions: &[Option<TaskExecutionDetails>]) -> bool {
    executions
        .iter()
        .flatten()
        .any(|details| details.status == STATUS_SUCCESS)
}

#[async_trait]
impl TaskStateService for TaskStateServiceImpl {
    /// Check if a previous execution of the generating task already succeeded.
    ///
    /// If the state cannot be determined the task is treated as not yet generated,
    /// producing a fresh plan is safer than silently skipping generation.
    async fn generation_already_completed(&self, task_id: &str) -> Result<bool> {
        let current = match self.get_execution(task_id, None).await? {
            Some(details) => details,
            None => return Ok(false),
        };

        let mut prior_executions = vec![];
        for execution in 0..current.execution {
            prior_executions.push(self.get_execution(task_id, Some(execution)).await?);
        }
        Ok(any_prior_success(&prior_executions))
    }
}
