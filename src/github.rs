use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::config::GitHubSettings;
use crate::http::{FetchError, HttpRequest, Transport};

/// Timestamp format of every GitHub REST API field we read.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub const PER_PAGE: u32 = 100;

/// Parse a GitHub API timestamp.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

/// Accept a string field, treating `null`, a missing field or any non-string
/// value as absent instead of failing the whole page.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}

// ── Workflow runs ────────────────────────────────────────

/// One page of `GET /repos/{repo}/actions/workflows/{id}/runs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunListPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub workflow_runs: Vec<RunSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: u64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub conclusion: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub jobs_url: Option<String>,
}

/// `GET {jobs_url}`. A body without `jobs` fails to decode, which callers
/// treat as a failed jobs fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub started_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub completed_at: Option<String>,
}

// ── Pull requests ────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct RawPullRequest {
    number: u64,
    #[serde(default)]
    state: String,
    #[serde(default, deserialize_with = "lenient_string")]
    created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    closed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ── Container package versions ───────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageVersion {
    pub id: u64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<PackageMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub container: Option<ContainerMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PackageVersion {
    /// The tag a version is known by; untagged versions have none.
    pub fn first_tag(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .container
            .as_ref()?
            .tags
            .first()
            .map(|t| t.as_str())
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.as_deref().and_then(parse_timestamp)
    }
}

// ── Client ───────────────────────────────────────────────

/// GitHub REST client. Built once per process from [`GitHubSettings`] and
/// passed by reference to every collector.
pub struct GitHubClient<T> {
    transport: T,
    api_url: String,
    headers: Vec<(String, String)>,
    log_timeout: Duration,
}

impl<T: Transport> GitHubClient<T> {
    pub fn new(transport: T, settings: &GitHubSettings) -> Self {
        let mut headers = vec![
            (
                "Accept".to_string(),
                "application/vnd.github+json".to_string(),
            ),
            ("X-GitHub-Api-Version".to_string(), "2022-11-28".to_string()),
        ];
        if let Some(token) = &settings.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        GitHubClient {
            transport,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            headers,
            log_timeout: settings.log_timeout,
        }
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn request(&self, url: String) -> HttpRequest {
        HttpRequest::get(url).headers(&self.headers)
    }

    /// One page of completed runs for a workflow, 1-based.
    pub async fn workflow_runs_page(
        &self,
        repo: &str,
        workflow_id: &str,
        page: u64,
    ) -> Result<RunListPage, FetchError> {
        let url = format!(
            "{}/repos/{repo}/actions/workflows/{workflow_id}/runs",
            self.api_url
        );
        let request = self
            .request(url)
            .query("per_page", PER_PAGE)
            .query("status", "completed")
            .query("page", page);
        self.transport.get_json(&request).await
    }

    pub async fn jobs(&self, jobs_url: &str) -> Result<JobList, FetchError> {
        self.transport
            .get_json(&self.request(jobs_url.to_string()))
            .await
    }

    /// Raw zip bytes of a run's log bundle. The API answers with a redirect
    /// to blob storage, which the transport follows.
    pub async fn run_logs_archive(&self, repo: &str, run_id: u64) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/repos/{repo}/actions/runs/{run_id}/logs", self.api_url);
        let request = self.request(url).timeout(self.log_timeout);
        let response = self
            .transport
            .send(&request)
            .await?
            .error_for_status(&request.url)?;
        Ok(response.body)
    }

    /// All pull requests (open and closed). Pages until a short page.
    pub async fn list_pull_requests(&self, repo: &str) -> Result<Vec<PullRequest>, FetchError> {
        let url = format!("{}/repos/{repo}/pulls", self.api_url);
        let raw: Vec<RawPullRequest> = self
            .paginate(|page| self.request(url.clone()).query("state", "all").query("page", page))
            .await?;

        let mut pulls = Vec::with_capacity(raw.len());
        for pr in raw {
            let Some(created_at) = pr.created_at.as_deref().and_then(parse_timestamp) else {
                tracing::warn!("skipping pull request #{} with unparseable created_at", pr.number);
                continue;
            };
            pulls.push(PullRequest {
                number: pr.number,
                state: pr.state,
                created_at,
                closed_at: pr.closed_at.as_deref().and_then(parse_timestamp),
            });
        }
        Ok(pulls)
    }

    /// All versions of an organization's container package.
    pub async fn list_package_versions(
        &self,
        org: &str,
        package: &str,
    ) -> Result<Vec<PackageVersion>, FetchError> {
        let url = format!(
            "{}/orgs/{org}/packages/container/{package}/versions",
            self.api_url
        );
        tracing::info!("fetching package versions from {}", url);
        self.paginate(|page| self.request(url.clone()).query("page", page))
            .await
    }

    async fn paginate<D, B>(&self, build: B) -> Result<Vec<D>, FetchError>
    where
        D: serde::de::DeserializeOwned,
        B: Fn(u64) -> HttpRequest,
    {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let request = build(page).query("per_page", PER_PAGE);
            let batch: Vec<D> = self.transport.get_json(&request).await?;
            let len = batch.len();
            items.extend(batch);
            if len < PER_PAGE as usize {
                break;
            }
            page += 1;
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{FakeTransport, json_response, status_response};
    use crate::http::HttpResponse;
    use serde_json::json;

    fn settings() -> GitHubSettings {
        GitHubSettings {
            api_url: "https://api.github.test/".to_string(),
            token: Some("secret".to_string()),
            repo: "org/repo".to_string(),
            log_timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("2024-02-29T23:59:58Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-02-29T23:59:58+00:00");
        assert!(parse_timestamp("2024-02-29 23:59:58").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_run_summary_tolerates_odd_fields() {
        let run: RunSummary = serde_json::from_value(json!({
            "id": 5,
            "conclusion": null,
            "created_at": 12345,
            "jobs_url": "https://api.github.test/jobs/5"
        }))
        .unwrap();
        assert_eq!(run.conclusion, None);
        assert_eq!(run.created_at, None);
        assert_eq!(run.updated_at, None);
        assert_eq!(run.jobs_url.as_deref(), Some("https://api.github.test/jobs/5"));
    }

    #[tokio::test]
    async fn test_requests_carry_auth_and_api_version() {
        let transport = FakeTransport::new(|_req: &HttpRequest| {
            json_response(json!({"total_count": 0, "workflow_runs": []}))
        });
        let client = GitHubClient::new(transport, &settings());
        let page = client
            .workflow_runs_page("org/repo", "build-main.yaml", 1)
            .await
            .unwrap();
        assert_eq!(page.total_count, 0);

        let sent = client.transport().requests();
        assert_eq!(
            sent[0].url,
            "https://api.github.test/repos/org/repo/actions/workflows/build-main.yaml/runs"
        );
        assert_eq!(sent[0].header_value("authorization"), Some("Bearer secret"));
        assert_eq!(sent[0].header_value("x-github-api-version"), Some("2022-11-28"));
        assert_eq!(sent[0].query_value("status"), Some("completed"));
        assert_eq!(sent[0].query_value("per_page"), Some("100"));
    }

    #[tokio::test]
    async fn test_package_versions_page_until_short_page() {
        let transport = FakeTransport::new(|req: &HttpRequest| {
            let page: u64 = req.query_value("page").unwrap().parse().unwrap();
            let count = if page == 1 { 100 } else { 3 };
            let versions: Vec<_> = (0..count)
                .map(|i| {
                    json!({
                        "id": page * 1000 + i,
                        "updated_at": "2024-05-01T00:00:00Z",
                        "metadata": {"container": {"tags": [format!("tag-{page}-{i}")]}}
                    })
                })
                .collect();
            json_response(json!(versions))
        });
        let client = GitHubClient::new(transport, &settings());
        let versions = client
            .list_package_versions("autowarefoundation", "autoware")
            .await
            .unwrap();
        assert_eq!(versions.len(), 103);
        assert_eq!(client.transport().requests().len(), 2);
        assert_eq!(versions[100].first_tag(), Some("tag-2-0"));
    }

    #[test]
    fn test_untagged_version_has_no_first_tag() {
        let version: PackageVersion = serde_json::from_value(json!({
            "id": 1,
            "updated_at": "2024-05-01T00:00:00Z",
            "metadata": {"container": {"tags": []}}
        }))
        .unwrap();
        assert_eq!(version.first_tag(), None);
        assert!(version.updated_at().is_some());
    }

    #[tokio::test]
    async fn test_pull_requests_parse_closed_at() {
        let transport = FakeTransport::new(|_req: &HttpRequest| {
            json_response(json!([
                {"number": 1, "state": "closed", "created_at": "2024-01-01T00:00:00Z", "closed_at": "2024-01-03T00:00:00Z"},
                {"number": 2, "state": "open", "created_at": "2024-01-02T00:00:00Z", "closed_at": null},
                {"number": 3, "state": "open", "created_at": null}
            ]))
        });
        let client = GitHubClient::new(transport, &settings());
        let pulls = client.list_pull_requests("org/repo").await.unwrap();
        assert_eq!(pulls.len(), 2);
        assert!(pulls[0].closed_at.is_some());
        assert!(pulls[1].closed_at.is_none());
        assert_eq!(client.transport().requests()[0].query_value("state"), Some("all"));
    }

    #[tokio::test]
    async fn test_expired_logs_are_not_found() {
        let transport = FakeTransport::new(|_req: &HttpRequest| status_response(410));
        let client = GitHubClient::new(transport, &settings());
        let err = client.run_logs_archive("org/repo", 42).await.unwrap_err();
        assert!(err.is_not_found());

        let sent = client.transport().requests();
        assert_eq!(sent[0].url, "https://api.github.test/repos/org/repo/actions/runs/42/logs");
        assert_eq!(sent[0].timeout, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_jobs_without_jobs_field_is_decode_error() {
        let transport = FakeTransport::new(|_req: &HttpRequest| -> HttpResponse {
            json_response(json!({"message": "API rate limit exceeded"}))
        });
        let client = GitHubClient::new(transport, &settings());
        let err = client.jobs("https://api.github.test/jobs/1").await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
