use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use lurker_core::{KnownIssue, RepoId};

use crate::rate_limit::RateLimiter;
use crate::{HostingError, HostingResult};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";
const CLIENT_USER_AGENT: &str = "lurker-issue-watcher";
const RETRY_ATTEMPT_HEADER: &str = "x-lurker-retry-attempt";
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Clone)]
pub struct HostingClientConfig {
    pub api_base: String,
    pub token: String,
    pub request_timeout: Duration,
    /// Total attempts, counting the first (4 = 3 retries).
    pub retry_max_attempts: usize,
    /// First backoff; doubles before each further retry.
    pub retry_base_delay: Duration,
}

impl HostingClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_owned(),
            token: token.into(),
            request_timeout: Duration::from_secs(30),
            retry_max_attempts: 4,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// The fields needed to create a pull request.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatePullRequest {
    pub repo: RepoId,
    pub title: String,
    pub body: String,
    /// Branch name carrying the changes.
    pub head: String,
    /// Target branch, e.g. `main`.
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

/// Authenticated request executor for the hosting API with rate-limit
/// tracking and bounded retry. Safe for concurrent use across pollers.
#[derive(Debug, Clone)]
pub struct HostingClient {
    http: reqwest::Client,
    api_base: String,
    retry_max_attempts: usize,
    retry_base_delay: Duration,
    limiter: Arc<RateLimiter>,
}

impl HostingClient {
    pub fn new(config: HostingClientConfig) -> HostingResult<Self> {
        if config.token.trim().is_empty() {
            return Err(HostingError::Credentials("empty token".to_owned()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(API_VERSION),
        );
        let auth = format!("Bearer {}", config.token.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| HostingError::Credentials("token is not a valid header".to_owned()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| HostingError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay: config.retry_base_delay,
            limiter: Arc::new(RateLimiter::new()),
        })
    }

    /// The process-wide limiter, shared across clones of this client.
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Returns open issues for the repo, excluding pull requests.
    pub async fn list_open_issues(&self, repo: &RepoId) -> HostingResult<Vec<KnownIssue>> {
        let url = format!(
            "{}/repos/{}/issues?state=open&per_page=100",
            self.api_base,
            repo.as_str()
        );
        let response = self.execute(|| self.http.get(&url)).await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(self.classify(status, response).await);
        }

        let issues: Vec<KnownIssue> = response
            .json()
            .await
            .map_err(|error| HostingError::Decode(format!("listing issues: {error}")))?;
        Ok(issues
            .into_iter()
            .filter(|issue| !issue.is_pull_request())
            .collect())
    }

    /// Adds a reaction to an issue. Idempotent: 200 (already present)
    /// and 201 (created) are both success.
    pub async fn add_reaction(
        &self,
        repo: &RepoId,
        number: u64,
        reaction: &str,
    ) -> HostingResult<()> {
        let url = format!(
            "{}/repos/{}/issues/{number}/reactions",
            self.api_base,
            repo.as_str()
        );
        let payload = json!({ "content": reaction });
        let response = self
            .execute(|| self.http.post(&url).json(&payload))
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(self.classify(status, response).await);
        }
        Ok(())
    }

    pub async fn create_pull_request(
        &self,
        request: &CreatePullRequest,
    ) -> HostingResult<PullRequest> {
        let url = format!("{}/repos/{}/pulls", self.api_base, request.repo.as_str());
        let payload = json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
        });
        let response = self
            .execute(|| self.http.post(&url).json(&payload))
            .await?;

        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(self.classify(status, response).await);
        }
        response
            .json()
            .await
            .map_err(|error| HostingError::Decode(format!("creating pull request: {error}")))
    }

    /// Runs a request with rate limiting and bounded retry. Transport
    /// failures and 5xx retry with exponential backoff; rate-limit
    /// responses mark the limiter exhausted so the next pass blocks
    /// until reset. 2xx and non-rate-limit 4xx return immediately.
    async fn execute<F>(&self, build: F) -> HostingResult<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_failure = HostingError::Transport("request was never sent".to_owned());

        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 {
                let backoff = self.retry_base_delay * (1 << (attempt - 1)) as u32;
                tokio::time::sleep(backoff).await;
            }

            self.limiter.wait().await;

            let response = match build()
                .header(RETRY_ATTEMPT_HEADER, attempt.to_string())
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    last_failure = HostingError::Transport(error.to_string());
                    continue;
                }
            };

            self.limiter.update(response.headers());

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS
                || (status == StatusCode::FORBIDDEN && zero_remaining(response.headers()))
            {
                self.limiter.note_exhausted(response.headers());
                last_failure = HostingError::RateLimited(format!(
                    "hosting api returned {status} with an exhausted budget"
                ));
                continue;
            }

            if status.is_server_error() {
                last_failure = HostingError::Server {
                    status: status.as_u16(),
                    message: truncated_body(response).await,
                };
                continue;
            }

            return Ok(response);
        }

        Err(last_failure)
    }

    async fn classify(&self, status: StatusCode, response: Response) -> HostingError {
        let message = truncated_body(response).await;
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HostingError::Auth {
                status: status.as_u16(),
                message,
            },
            StatusCode::TOO_MANY_REQUESTS => HostingError::RateLimited(message),
            status if status.is_server_error() => HostingError::Server {
                status: status.as_u16(),
                message,
            },
            status => HostingError::Client {
                status: status.as_u16(),
                message,
            },
        }
    }
}

fn zero_remaining(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "0")
}

async fn truncated_body(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    let trimmed = body.trim();
    if trimmed.len() > ERROR_BODY_LIMIT {
        let cut = trimmed
            .char_indices()
            .take_while(|(index, _)| *index < ERROR_BODY_LIMIT)
            .last()
            .map(|(index, ch)| index + ch.len_utf8())
            .unwrap_or(0);
        format!("{}…", &trimmed[..cut])
    } else {
        trimmed.to_owned()
    }
}
