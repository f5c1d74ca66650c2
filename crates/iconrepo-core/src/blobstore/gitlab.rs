//! GitLab blobstore
//!
//! Keeps iconfiles in a GitLab project, using the REST API (v4). Each
//! mutation is one call to the commits API carrying all file actions, so a
//! logical operation is still exactly one version.

use super::paths::iconfile_path;
use super::{
    commit_failure_requested, commit_message, BlobstoreError, BlobstoreRepository,
    CommitMetadata,
};
use crate::models::{IconDescriptor, Iconfile, IconfileDescriptor};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::DateTime;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const DEFAULT_API_BASE: &str = "https://gitlab.com/api/v4";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const RATE_LIMIT_HEADER: &str = "RateLimit-Remaining";
const RATE_LIMIT_LOW_WATER: u64 = 5;

const PROJECT_ALREADY_TAKEN: &str = "has already been taken";
const TRANSIENT_CREATION_MESSAGES: &[&str] = &[
    "The project is still being deleted. Please try again later.",
    PROJECT_ALREADY_TAKEN,
];

/// Connection settings for a GitLab project
#[derive(Debug, Clone)]
pub struct GitlabConfig {
    pub api_base: String,
    pub namespace_path: String,
    pub project_path: String,
    pub main_branch: String,
    pub access_token: String,
}

/// Retry behaviour for project creation
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_millis(1000),
        }
    }
}

/// A GitLab project used as blobstore
pub struct GitlabRepository {
    client: reqwest::Client,
    api_base: Url,
    namespace_path: String,
    project_path: String,
    branch: String,
    access_token: String,
    namespace_id: OnceCell<u64>,
    retry: RetryPolicy,
    simulate_commit_failure: AtomicBool,
}

struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

#[derive(Debug, Deserialize)]
struct NamespaceInfo {
    id: u64,
    path: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    encoding: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    id: String,
    message: String,
    author_name: String,
    author_email: String,
    authored_date: String,
    committer_name: String,
    committer_email: String,
    committed_date: String,
}

#[derive(Debug, Serialize)]
struct CommitAction {
    action: &'static str,
    file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<&'static str>,
}

impl CommitAction {
    fn create(file_path: String, content: &[u8]) -> Self {
        Self {
            action: "create",
            file_path,
            content: Some(BASE64.encode(content)),
            encoding: Some("base64"),
        }
    }

    fn delete(file_path: String) -> Self {
        Self {
            action: "delete",
            file_path,
            content: None,
            encoding: None,
        }
    }
}

impl GitlabRepository {
    pub fn new(config: GitlabConfig) -> Result<Self, BlobstoreError> {
        if config.access_token.is_empty() {
            return Err(BlobstoreError::Configuration(
                "no API token for GitLab repository".to_string(),
            ));
        }

        let api_base = Url::parse(&config.api_base).map_err(|e| {
            BlobstoreError::Configuration(format!("invalid API base '{}': {}", config.api_base, e))
        })?;
        if api_base.cannot_be_a_base() {
            return Err(BlobstoreError::Configuration(format!(
                "API base '{}' cannot carry a path",
                config.api_base
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| BlobstoreError::Http {
                context: "Failed to build HTTP client".to_string(),
                source,
            })?;

        Ok(Self {
            client,
            api_base,
            namespace_path: config.namespace_path,
            project_path: config.project_path,
            branch: config.main_branch,
            access_token: config.access_token,
            namespace_id: OnceCell::new(),
            retry: RetryPolicy::default(),
            simulate_commit_failure: AtomicBool::new(commit_failure_requested()),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make every following commit fail without contacting the server
    pub fn set_commit_failure(&self, enabled: bool) {
        self.simulate_commit_failure.store(enabled, Ordering::SeqCst);
    }

    fn project_id(&self) -> String {
        format!("{}/{}", self.namespace_path, self.project_path)
    }

    /// Build an API URL; each segment is percent-encoded as a whole
    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    fn project_url(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let project = self.project_id();
        let mut all = vec!["projects", project.as_str()];
        all.extend_from_slice(segments);
        self.url(&all, query)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        context: &str,
    ) -> Result<ApiResponse, BlobstoreError> {
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.access_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|source| BlobstoreError::Http {
            context: context.to_string(),
            source,
        })?;

        check_rate_limit(response.headers());

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|source| BlobstoreError::Http {
            context: context.to_string(),
            source,
        })?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn namespace_id(&self) -> Result<u64, BlobstoreError> {
        let id = self
            .namespace_id
            .get_or_try_init(|| async {
                let url = self.url(&["namespaces"], &[("owned_only", "true")]);
                let context = "Failed to retrieve GitLab namespaces";
                let response = self.send(Method::GET, url, None, context).await?;
                expect_status(&response, &[StatusCode::OK], context)?;

                let namespaces: Vec<NamespaceInfo> = decode(&response.body, "namespace list")?;
                namespaces
                    .into_iter()
                    .find(|ns| ns.path == self.namespace_path)
                    .map(|ns| ns.id)
                    .ok_or_else(|| BlobstoreError::NamespaceNotFound(self.namespace_path.clone()))
            })
            .await?;
        Ok(*id)
    }

    async fn commit(
        &self,
        author: &str,
        message: String,
        actions: Vec<CommitAction>,
    ) -> Result<(), BlobstoreError> {
        if self.simulate_commit_failure.load(Ordering::SeqCst) {
            return Err(BlobstoreError::SimulatedFailure);
        }

        let context = format!("Failed to commit to {}", self);
        let body = json!({
            "branch": self.branch,
            "author_name": author,
            "commit_message": message,
            "actions": actions,
        });
        let url = self.project_url(&["repository", "commits"], &[]);
        let response = self.send(Method::POST, url, Some(body), &context).await?;
        expect_status(&response, &[StatusCode::CREATED], &context)?;

        info!("Committed to {}: {}", self, message);
        Ok(())
    }

    async fn delete_project(&self) -> Result<(), BlobstoreError> {
        let context = format!("Failed to delete {}", self);
        let response = self
            .send(Method::DELETE, self.project_url(&[], &[]), None, &context)
            .await?;
        expect_status(
            &response,
            &[
                StatusCode::OK,
                StatusCode::ACCEPTED,
                StatusCode::NO_CONTENT,
                StatusCode::NOT_FOUND,
            ],
            &context,
        )?;
        info!("Deleted {}", self);
        Ok(())
    }
}

/// Warn when few requests remain; returns the remaining count in that case.
/// Requests are never held back.
fn check_rate_limit(headers: &HeaderMap) -> Option<u64> {
    let remaining = headers
        .get(RATE_LIMIT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|remaining| *remaining < RATE_LIMIT_LOW_WATER)?;

    warn!("GitLab rate limit nearly exhausted: {} requests remaining", remaining);
    Some(remaining)
}

fn expect_status(
    response: &ApiResponse,
    accepted: &[StatusCode],
    context: &str,
) -> Result<(), BlobstoreError> {
    if accepted.contains(&response.status) {
        Ok(())
    } else {
        Err(BlobstoreError::Provider {
            context: context.to_string(),
            status: response.status.as_u16(),
            body: response.body.clone(),
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str, what: &str) -> Result<T, BlobstoreError> {
    serde_json::from_str(body).map_err(|e| BlobstoreError::Decode {
        what: what.to_string(),
        details: e.to_string(),
    })
}

fn is_transient_creation_error(body: &str) -> bool {
    TRANSIENT_CREATION_MESSAGES
        .iter()
        .any(|fragment| body.contains(fragment))
}

fn to_metadata(commit: CommitResponse) -> Result<CommitMetadata, BlobstoreError> {
    let parse_date = |value: &str| {
        DateTime::parse_from_rfc3339(value).map_err(|e| BlobstoreError::Decode {
            what: "commit date".to_string(),
            details: format!("{}: {}", value, e),
        })
    };

    Ok(CommitMetadata {
        authored_at: parse_date(&commit.authored_date)?,
        committed_at: parse_date(&commit.committed_date)?,
        commit_id: commit.id,
        author_name: commit.author_name,
        author_email: commit.author_email,
        committer_name: commit.committer_name,
        committer_email: commit.committer_email,
        message: commit.message.trim_end().to_string(),
    })
}

impl fmt::Display for GitlabRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GitLab repository at {}?ref={}",
            self.project_id(),
            self.branch
        )
    }
}

#[async_trait]
impl BlobstoreRepository for GitlabRepository {
    async fn create(&self) -> Result<(), BlobstoreError> {
        let namespace_id = self.namespace_id().await?;
        let context = format!("Failed to create {}", self);
        let body = json!({
            "namespace_id": namespace_id,
            "path": self.project_path,
        });

        let mut attempts = 0;
        loop {
            let url = self.url(&["projects"], &[]);
            let response = self
                .send(Method::POST, url, Some(body.clone()), &context)
                .await?;

            if response.status == StatusCode::CREATED {
                info!("Created {}", self);
                return Ok(());
            }

            if response.status != StatusCode::BAD_REQUEST
                || !is_transient_creation_error(&response.body)
            {
                return Err(BlobstoreError::Provider {
                    context,
                    status: response.status.as_u16(),
                    body: response.body,
                });
            }

            attempts += 1;
            if attempts >= self.retry.max_attempts {
                return Err(BlobstoreError::RetriesExhausted {
                    operation: context,
                    attempts,
                });
            }

            debug!(
                "Transient error creating {} (attempt {}): {}",
                self, attempts, response.body
            );
            tokio::time::sleep(self.retry.delay).await;

            if response.body.contains(PROJECT_ALREADY_TAKEN) {
                if let Err(e) = self.delete_project().await {
                    warn!("Failed to delete stale {}: {}", self, e);
                }
                tokio::time::sleep(self.retry.delay).await;
            }
        }
    }

    async fn delete(&self) -> Result<(), BlobstoreError> {
        self.delete_project().await
    }

    async fn add_iconfile(
        &self,
        icon_name: &str,
        iconfile: &Iconfile,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let path = iconfile_path(icon_name, &iconfile.descriptor)?;
        let message = commit_message(std::slice::from_ref(&path), "added", modified_by);
        self.commit(
            modified_by,
            message,
            vec![CommitAction::create(path, &iconfile.content)],
        )
        .await
    }

    async fn get_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> Result<Vec<u8>, BlobstoreError> {
        let path = iconfile_path(icon_name, descriptor)?;
        let context = format!("Failed to get {} from {}", path, self);
        let url = self.project_url(&["repository", "files", &path], &[("ref", self.branch.as_str())]);
        let response = self.send(Method::GET, url, None, &context).await?;

        if response.status == StatusCode::NOT_FOUND {
            return Err(BlobstoreError::IconfileNotFound {
                icon: icon_name.to_string(),
                iconfile: descriptor.clone(),
            });
        }
        expect_status(&response, &[StatusCode::OK], &context)?;

        let file: FileResponse = decode(&response.body, "file response")?;
        if file.encoding != "base64" {
            return Err(BlobstoreError::Decode {
                what: path,
                details: format!("unexpected encoding '{}'", file.encoding),
            });
        }
        BASE64
            .decode(file.content.trim())
            .map_err(|e| BlobstoreError::Decode {
                what: path,
                details: e.to_string(),
            })
    }

    async fn delete_icon(
        &self,
        icon: &IconDescriptor,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let paths = icon
            .iconfiles
            .iter()
            .map(|descriptor| iconfile_path(&icon.name, descriptor))
            .collect::<Result<Vec<_>, _>>()?;
        if paths.is_empty() {
            return Ok(());
        }

        let message = commit_message(&paths, "deleted", modified_by);
        let actions = paths.into_iter().map(CommitAction::delete).collect();
        self.commit(modified_by, message, actions).await
    }

    async fn delete_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let path = iconfile_path(icon_name, descriptor)?;
        let message = commit_message(std::slice::from_ref(&path), "deleted", modified_by);
        self.commit(modified_by, message, vec![CommitAction::delete(path)])
            .await
    }

    /// GitLab keeps the repository consistent on its own
    async fn check_status(&self) -> Result<bool, BlobstoreError> {
        Ok(true)
    }

    async fn get_state_id(&self) -> Result<String, BlobstoreError> {
        let context = format!("Failed to list commits of {}", self);
        let url = self.project_url(
            &["repository", "commits"],
            &[("ref_name", self.branch.as_str()), ("per_page", "1")],
        );
        let response = self.send(Method::GET, url, None, &context).await?;
        expect_status(&response, &[StatusCode::OK], &context)?;

        let commits: Vec<CommitResponse> = decode(&response.body, "commit list")?;
        commits
            .into_iter()
            .next()
            .map(|commit| commit.id)
            .ok_or_else(|| BlobstoreError::Decode {
                what: "commit list".to_string(),
                details: format!("no commit yet in {}", self),
            })
    }

    async fn list_iconfiles(&self) -> Result<Vec<String>, BlobstoreError> {
        let context = format!("Failed to list files of {}", self);
        let mut files = Vec::new();
        let mut page = "1".to_string();

        loop {
            let url = self.project_url(
                &["repository", "tree"],
                &[
                    ("ref", self.branch.as_str()),
                    ("recursive", "true"),
                    ("per_page", "100"),
                    ("page", page.as_str()),
                ],
            );
            let response = self.send(Method::GET, url, None, &context).await?;
            // An empty project has no tree yet
            if response.status == StatusCode::NOT_FOUND {
                break;
            }
            expect_status(&response, &[StatusCode::OK], &context)?;

            let items: Vec<TreeItem> = decode(&response.body, "repository tree")?;
            files.extend(
                items
                    .into_iter()
                    .filter(|item| item.kind == "blob")
                    .map(|item| item.path),
            );

            match response
                .headers
                .get("X-Next-Page")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
            {
                Some(next) if !next.is_empty() => page = next.to_string(),
                _ => break,
            }
        }

        Ok(files)
    }

    async fn get_version_for(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> Result<Option<String>, BlobstoreError> {
        let path = iconfile_path(icon_name, descriptor)?;
        let context = format!("Failed to get version of {} from {}", path, self);
        let url = self.project_url(&["repository", "files", &path], &[("ref", self.branch.as_str())]);
        let response = self.send(Method::HEAD, url, None, &context).await?;

        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_status(&response, &[StatusCode::OK], &context)?;

        let version = ["X-Gitlab-Last-Commit-Id", "X-Gitlab-Commit-Id"]
            .iter()
            .find_map(|name| response.headers.get(*name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(version)
    }

    async fn get_version_metadata(&self, version: &str) -> Result<CommitMetadata, BlobstoreError> {
        let context = format!("Failed to get commit {} of {}", version, self);
        let url = self.project_url(&["repository", "commits", version], &[]);
        let response = self.send(Method::GET, url, None, &context).await?;
        expect_status(&response, &[StatusCode::OK], &context)?;

        to_metadata(decode(&response.body, "commit")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const COMMITS_PATH: &str = r"^/api/v4/projects/[^/]+/repository/commits$";
    const FILES_PATH: &str = r"^/api/v4/projects/[^/]+/repository/files/[^/]+$";

    fn repository(server: &MockServer) -> GitlabRepository {
        let repo = GitlabRepository::new(GitlabConfig {
            api_base: format!("{}/api/v4", server.uri()),
            namespace_path: "icons".to_string(),
            project_path: "dock-repo".to_string(),
            main_branch: "main".to_string(),
            access_token: "secret".to_string(),
        })
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(5),
        });
        repo.set_commit_failure(false);
        repo
    }

    async fn mount_namespaces(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/v4/namespaces"))
            .and(query_param("owned_only", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 3, "path": "someone-else"},
                {"id": 7, "path": "icons"}
            ])))
            .mount(server)
            .await;
    }

    fn dock_png() -> Iconfile {
        Iconfile::new(IconfileDescriptor::new("png", "36dp"), b"png-bytes".to_vec())
    }

    #[test]
    fn test_requires_access_token() {
        let result = GitlabRepository::new(GitlabConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            namespace_path: "icons".to_string(),
            project_path: "dock-repo".to_string(),
            main_branch: "main".to_string(),
            access_token: String::new(),
        });
        assert!(matches!(result, Err(BlobstoreError::Configuration(_))));
    }

    #[test]
    fn test_project_is_encoded_as_single_segment() {
        let repo = GitlabRepository::new(GitlabConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            namespace_path: "icons".to_string(),
            project_path: "dock-repo".to_string(),
            main_branch: "main".to_string(),
            access_token: "secret".to_string(),
        })
        .unwrap();

        let url = repo.project_url(
            &["repository", "files", "png/36dp/dock@36dp.png"],
            &[("ref", "main")],
        );
        assert!(url
            .as_str()
            .starts_with("https://gitlab.com/api/v4/projects/icons%2Fdock-repo/repository/files/png%2F36dp%2Fdock"));
        assert_eq!(url.query(), Some("ref=main"));
        assert_eq!(repo.to_string(), "GitLab repository at icons/dock-repo?ref=main");
    }

    #[tokio::test]
    async fn test_add_iconfile_commits_base64_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(COMMITS_PATH))
            .and(header("PRIVATE-TOKEN", "secret"))
            .and(body_partial_json(json!({
                "branch": "main",
                "author_name": "ux",
                "actions": [{
                    "action": "create",
                    "file_path": "png/36dp/dock@36dp.png",
                    "content": BASE64.encode(b"png-bytes"),
                    "encoding": "base64"
                }]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "abc"})))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&server);
        repo.add_iconfile("dock", &dock_png(), "ux").await.unwrap();
    }

    #[test]
    fn test_rate_limit_warning_threshold() {
        let headers = |value: &str| {
            let mut headers = HeaderMap::new();
            headers.insert("ratelimit-remaining", value.parse().unwrap());
            headers
        };

        assert_eq!(check_rate_limit(&headers("3")), Some(3));
        assert_eq!(check_rate_limit(&headers(" 0 ")), Some(0));
        assert_eq!(check_rate_limit(&headers("5")), None);
        assert_eq!(check_rate_limit(&headers("unlimited")), None);
        assert_eq!(check_rate_limit(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_low_rate_limit_does_not_hold_back_commits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(COMMITS_PATH))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("RateLimit-Remaining", "3")
                    .set_body_json(json!({"id": "abc"})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let repo = repository(&server);
        let started = std::time::Instant::now();
        repo.add_iconfile("dock", &dock_png(), "ux").await.unwrap();
        repo.add_iconfile(
            "dock",
            &Iconfile::new(IconfileDescriptor::new("svg", "18px"), b"<svg/>".to_vec()),
            "ux",
        )
        .await
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_commit_failure_status_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(COMMITS_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("A file with this name already exists"))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&server);
        let err = repo.add_iconfile("dock", &dock_png(), "ux").await.unwrap_err();
        assert!(matches!(err, BlobstoreError::Provider { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_simulated_commit_failure_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(COMMITS_PATH))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let repo = repository(&server);
        repo.set_commit_failure(true);
        let err = repo.add_iconfile("dock", &dock_png(), "ux").await.unwrap_err();
        assert!(matches!(err, BlobstoreError::SimulatedFailure));
    }

    #[tokio::test]
    async fn test_get_iconfile_decodes_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(FILES_PATH))
            .and(query_param("ref", "main"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("RateLimit-Remaining", "2")
                    .set_body_json(json!({
                        "file_path": "png/36dp/dock@36dp.png",
                        "encoding": "base64",
                        "content": BASE64.encode(b"png-bytes"),
                    })),
            )
            .mount(&server)
            .await;

        let repo = repository(&server);
        let content = repo
            .get_iconfile("dock", &IconfileDescriptor::new("png", "36dp"))
            .await
            .unwrap();
        assert_eq!(content, b"png-bytes".to_vec());
    }

    #[tokio::test]
    async fn test_get_missing_iconfile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(FILES_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "404 File Not Found"})))
            .mount(&server)
            .await;

        let repo = repository(&server);
        let err = repo
            .get_iconfile("dock", &IconfileDescriptor::new("png", "36dp"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobstoreError::IconfileNotFound { .. }));
    }

    #[tokio::test]
    async fn test_version_for_missing_file_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path_regex(FILES_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let repo = repository(&server);
        let version = repo
            .get_version_for("dock", &IconfileDescriptor::new("png", "36dp"))
            .await
            .unwrap();
        assert!(version.is_none());
    }

    #[tokio::test]
    async fn test_version_for_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path_regex(FILES_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Gitlab-Commit-Id", "head-commit")
                    .insert_header("X-Gitlab-Last-Commit-Id", "file-commit"),
            )
            .mount(&server)
            .await;

        let repo = repository(&server);
        let version = repo
            .get_version_for("dock", &IconfileDescriptor::new("png", "36dp"))
            .await
            .unwrap();
        assert_eq!(version.as_deref(), Some("file-commit"));
    }

    #[tokio::test]
    async fn test_create_retries_while_project_is_being_deleted() {
        let server = MockServer::start().await;
        mount_namespaces(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "message": "The project is still being deleted. Please try again later."
            })))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects"))
            .and(body_partial_json(json!({"namespace_id": 7, "path": "dock-repo"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&server);
        repo.create().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_deletes_project_when_name_is_taken() {
        let server = MockServer::start().await;
        mount_namespaces(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "message": {"name": ["has already been taken"]}
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/api/v4/projects/[^/]+$"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&server);
        repo.create().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        mount_namespaces(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                "The project is still being deleted. Please try again later.",
            ))
            .expect(3)
            .mount(&server)
            .await;

        let repo = repository(&server);
        let err = repo.create().await.unwrap_err();
        assert!(matches!(err, BlobstoreError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_create_fails_fast_on_other_errors() {
        let server = MockServer::start().await;
        mount_namespaces(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v4/projects"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&server);
        let err = repo.create().await.unwrap_err();
        assert!(matches!(err, BlobstoreError::Provider { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_create_with_unknown_namespace() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/namespaces"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let repo = repository(&server);
        let err = repo.create().await.unwrap_err();
        assert!(matches!(err, BlobstoreError::NamespaceNotFound(ns) if ns == "icons"));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_project() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/api/v4/projects/[^/]+$"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let repo = repository(&server);
        repo.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_iconfiles_follows_pages() {
        let server = MockServer::start().await;
        let tree_path = r"^/api/v4/projects/[^/]+/repository/tree$";
        Mock::given(method("GET"))
            .and(path_regex(tree_path))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "2")
                    .set_body_json(json!([
                        {"path": "png", "type": "tree"},
                        {"path": "png/36dp/dock@36dp.png", "type": "blob"}
                    ])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(tree_path))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "")
                    .set_body_json(json!([
                        {"path": "svg/18px/dock@18px.svg", "type": "blob"}
                    ])),
            )
            .mount(&server)
            .await;

        let repo = repository(&server);
        let files = repo.list_iconfiles().await.unwrap();
        assert_eq!(
            files,
            vec![
                "png/36dp/dock@36dp.png".to_string(),
                "svg/18px/dock@18px.svg".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_state_id_and_metadata() {
        let server = MockServer::start().await;
        let commit = json!({
            "id": "ed899a2f4b50b4370feeea94676502b42383c746",
            "message": "png/36dp/dock@36dp.png added by ux\n",
            "author_name": "ux",
            "author_email": "ux@example.com",
            "authored_date": "2024-03-11T09:00:00.000+01:00",
            "committer_name": "Icon Repo Server",
            "committer_email": "IconRepoServer@UIToolBox",
            "committed_date": "2024-03-11T09:00:01.000+01:00"
        });
        Mock::given(method("GET"))
            .and(path_regex(COMMITS_PATH))
            .and(query_param("ref_name", "main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([commit.clone()])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/v4/projects/[^/]+/repository/commits/ed899a2f"))
            .respond_with(ResponseTemplate::new(200).set_body_json(commit))
            .mount(&server)
            .await;

        let repo = repository(&server);
        let state = repo.get_state_id().await.unwrap();
        assert_eq!(state, "ed899a2f4b50b4370feeea94676502b42383c746");

        let metadata = repo.get_version_metadata(&state).await.unwrap();
        assert_eq!(metadata.author_name, "ux");
        assert_eq!(metadata.message, "png/36dp/dock@36dp.png added by ux");
        assert_eq!(
            metadata.authored_at.to_rfc3339(),
            "2024-03-11T09:00:00+01:00"
        );
    }
}
