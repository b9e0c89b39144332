//! HTTP client for the platform REST API.
//!
//! All pipeline traffic goes through [`PlatformClient`]: bearer-token
//! authentication, JSON bodies, cursor pagination for list endpoints and
//! retry with exponential backoff on throttling and server errors.

use crate::platform::types::{
    AnalyticsRequest, Assignment, AssignmentStatus, Operation, Pool, Project, Requester, Skill,
    Task, Training,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors returned by the platform API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("the requested object does not exist: {0}")]
    DoesNotExist(String),

    #[error("the platform rejected the request: {0}")]
    Validation(String),

    #[error("platform API error {status}: {message}")]
    Unexpected { status: StatusCode, message: String },

    #[error("request failed after {retries} retries: {source}")]
    Transport {
        retries: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to decode platform response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Retry behavior for throttled and failed requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub backoff_multiplier: f32,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff before the given retry attempt (0-based).
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_secs_f32();
        let backoff = base * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f32(backoff.min(self.max_backoff.as_secs_f32()))
    }
}

/// Error document returned by the platform on 4xx responses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Page of a list endpoint.
#[derive(Debug, Deserialize)]
struct ListPage<T> {
    items: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct AcceptancePatch<'a> {
    status: AssignmentStatus,
    public_comment: &'a str,
}

/// Client for the platform REST API.
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryConfig,
}

impl PlatformClient {
    /// Create a client for the given API base URL and OAuth token.
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        Self::with_retry(base_url, token, RetryConfig::default())
    }

    pub fn with_retry(base_url: &str, token: &str, retry: RetryConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(ApiError::Decode)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry,
        })
    }

    /// The requester account behind the configured token.
    pub async fn get_requester(&self) -> Result<Requester, ApiError> {
        self.request(Method::GET, "requester", &[], None).await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, ApiError> {
        self.request(Method::GET, &format!("projects/{project_id}"), &[], None)
            .await
    }

    pub async fn create_project(&self, project: &Project) -> Result<Project, ApiError> {
        self.request(Method::POST, "projects", &[], Some(to_body(project)?))
            .await
    }

    pub async fn get_pool(&self, pool_id: &str) -> Result<Pool, ApiError> {
        self.request(Method::GET, &format!("pools/{pool_id}"), &[], None)
            .await
    }

    pub async fn create_pool(&self, pool: &Pool) -> Result<Pool, ApiError> {
        self.request(Method::POST, "pools", &[], Some(to_body(pool)?))
            .await
    }

    pub async fn update_pool(&self, pool_id: &str, pool: &Pool) -> Result<Pool, ApiError> {
        self.request(Method::PUT, &format!("pools/{pool_id}"), &[], Some(to_body(pool)?))
            .await
    }

    pub async fn open_pool(&self, pool_id: &str) -> Result<(), ApiError> {
        self.request_no_content(Method::POST, &format!("pools/{pool_id}/open"))
            .await
    }

    pub async fn close_pool(&self, pool_id: &str) -> Result<(), ApiError> {
        self.request_no_content(Method::POST, &format!("pools/{pool_id}/close"))
            .await
    }

    pub async fn get_training(&self, training_id: &str) -> Result<Training, ApiError> {
        self.request(Method::GET, &format!("trainings/{training_id}"), &[], None)
            .await
    }

    pub async fn create_training(&self, training: &Training) -> Result<Training, ApiError> {
        self.request(Method::POST, "trainings", &[], Some(to_body(training)?))
            .await
    }

    pub async fn open_training(&self, training_id: &str) -> Result<(), ApiError> {
        self.request_no_content(Method::POST, &format!("trainings/{training_id}/open"))
            .await
    }

    pub async fn close_training(&self, training_id: &str) -> Result<(), ApiError> {
        self.request_no_content(Method::POST, &format!("trainings/{training_id}/close"))
            .await
    }

    /// All training pools of a project.
    pub async fn get_trainings(&self, project_id: &str) -> Result<Vec<Training>, ApiError> {
        self.list("trainings", &[("project_id", project_id.to_string())])
            .await
    }

    /// Upload tasks. `allow_defaults` applies the pool's default overlap;
    /// `open_pool` opens the target pool once the tasks land.
    pub async fn create_tasks(
        &self,
        tasks: &[Task],
        allow_defaults: bool,
        open_pool: bool,
    ) -> Result<(), ApiError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let query = [
            ("allow_defaults", allow_defaults.to_string()),
            ("open_pool", open_pool.to_string()),
            ("async_mode", "false".to_string()),
        ];

        let _: Value = self
            .request(Method::POST, "tasks", &query, Some(to_body(&tasks)?))
            .await?;
        Ok(())
    }

    /// All tasks currently in a pool.
    pub async fn get_tasks(&self, pool_id: &str) -> Result<Vec<Task>, ApiError> {
        self.list("tasks", &[("pool_id", pool_id.to_string())]).await
    }

    /// Assignments in a pool, optionally narrowed to a status set.
    pub async fn get_assignments(
        &self,
        pool_id: &str,
        statuses: &[AssignmentStatus],
    ) -> Result<Vec<Assignment>, ApiError> {
        let mut query = vec![("pool_id", pool_id.to_string())];
        if !statuses.is_empty() {
            let joined = statuses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            query.push(("status", joined));
        }
        self.list("assignments", &query).await
    }

    pub async fn accept_assignment(
        &self,
        assignment_id: &str,
        public_comment: &str,
    ) -> Result<Assignment, ApiError> {
        let patch = AcceptancePatch {
            status: AssignmentStatus::Accepted,
            public_comment,
        };
        self.request(
            Method::PATCH,
            &format!("assignments/{assignment_id}"),
            &[],
            Some(to_body(&patch)?),
        )
        .await
    }

    pub async fn reject_assignment(
        &self,
        assignment_id: &str,
        public_comment: &str,
    ) -> Result<Assignment, ApiError> {
        let patch = AcceptancePatch {
            status: AssignmentStatus::Rejected,
            public_comment,
        };
        self.request(
            Method::PATCH,
            &format!("assignments/{assignment_id}"),
            &[],
            Some(to_body(&patch)?),
        )
        .await
    }

    pub async fn get_skill(&self, skill_id: &str) -> Result<Skill, ApiError> {
        self.request(Method::GET, &format!("skills/{skill_id}"), &[], None)
            .await
    }

    pub async fn create_skill(
        &self,
        name: &str,
        language: &str,
        description: &str,
    ) -> Result<Skill, ApiError> {
        let mut public_requester_description = BTreeMap::new();
        public_requester_description.insert(language.to_string(), description.to_string());

        let skill = Skill {
            id: None,
            name: name.to_string(),
            public_requester_description: Some(public_requester_description),
        };
        self.request(Method::POST, "skills", &[], Some(to_body(&skill)?))
            .await
    }

    /// Start an analytics computation; poll the returned operation.
    pub async fn request_analytics(
        &self,
        requests: &[AnalyticsRequest],
    ) -> Result<Operation, ApiError> {
        self.request(Method::POST, "analytics-2", &[], Some(to_body(&requests)?))
            .await
    }

    pub async fn get_operation(&self, operation_id: &str) -> Result<Operation, ApiError> {
        self.request(Method::GET, &format!("operations/{operation_id}"), &[], None)
            .await
    }

    /// Drain a paginated list endpoint, sorting by id.
    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let mut items: Vec<T> = Vec::new();
        let mut id_gt: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = query.to_vec();
            query.push(("sort", "id".to_string()));
            query.push(("limit", "300".to_string()));
            if let Some(ref id) = id_gt {
                query.push(("id_gt", id.clone()));
            }

            let page: ListPage<Value> = self.request(Method::GET, path, &query, None).await?;
            let has_more = page.has_more;

            id_gt = page
                .items
                .last()
                .and_then(|item| item.get("id"))
                .and_then(Value::as_str)
                .map(String::from);

            for item in page.items {
                items.push(serde_json::from_value(item).map_err(|e| ApiError::Validation(
                    format!("unexpected item shape from {path}: {e}"),
                ))?);
            }

            if !has_more || id_gt.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn request_no_content(&self, method: Method, path: &str) -> Result<(), ApiError> {
        let _: Value = self.request(method, path, &[], None).await?;
        Ok(())
    }

    /// Issue one request with retry; decode the JSON response.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .query(query);

            if let Some(ref body) = body {
                builder = builder.json(body);
            }

            let result = builder.send().await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<T>().await.map_err(ApiError::Decode);
                    }

                    if retryable(status) && attempt < self.retry.max_retries {
                        let backoff = self.retry.backoff_duration(attempt);
                        warn!(
                            "Platform returned {} for {} {}; retrying in {:?}",
                            status, method, url, backoff
                        );
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(map_error(status, &body));
                }
                Err(e) if attempt < self.retry.max_retries && e.is_timeout() => {
                    let backoff = self.retry.backoff_duration(attempt);
                    debug!("Request to {} timed out; retrying in {:?}", url, backoff);
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(ApiError::Transport {
                        retries: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn map_error(status: StatusCode, body: &str) -> ApiError {
    let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .or_else(|| parsed.as_ref().and_then(|b| b.code.clone()))
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::NOT_FOUND => ApiError::DoesNotExist(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT => ApiError::Validation(message),
        _ => ApiError::Unexpected { status, message },
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value)
        .map_err(|e| ApiError::Validation(format!("could not serialize request body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
        };

        assert_eq!(retry.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_duration(1), Duration::from_millis(200));
        assert!(retry.backoff_duration(9) <= Duration::from_secs(1));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable(StatusCode::BAD_GATEWAY));
        assert!(!retryable(StatusCode::BAD_REQUEST));
        assert!(!retryable(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_error_mapping() {
        let err = map_error(
            StatusCode::NOT_FOUND,
            r#"{"code": "DOES_NOT_EXIST", "message": "no such pool"}"#,
        );
        assert!(matches!(err, ApiError::DoesNotExist(m) if m == "no such pool"));

        let err = map_error(StatusCode::BAD_REQUEST, r#"{"code": "VALIDATION_ERROR"}"#);
        assert!(matches!(err, ApiError::Validation(m) if m == "VALIDATION_ERROR"));

        let err = map_error(StatusCode::IM_A_TEAPOT, "nope");
        assert!(matches!(err, ApiError::Unexpected { .. }));
    }
}
