//! GitLab implementation of the forge client
//!
//! Direct REST implementation over reqwest. Transport concerns live here:
//! the 60 second request deadline, the small retry budget for 5xx and
//! connection errors, paging, and the version-dependent endpoint routing.

use crate::client::ForgeClient;
use crate::error::{ClientError, Result};
use crate::types::{
    Approvals, Capabilities, Commit, ForgeVersion, MergeRequest, Pipeline, Project, User,
};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

/// Default wall-clock deadline per request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts per call for transient failures.
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Page size for list endpoints.
const PER_PAGE: usize = 100;

/// GitLab REST API client.
pub struct GitLabClient {
    http: Client,
    base_url: String,
    token: String,
    version: ForgeVersion,
    capabilities: Capabilities,
}

impl GitLabClient {
    /// Connect to the forge: build the HTTP client, detect the version
    /// once, and derive the capability set.
    pub async fn connect(base_url: &str, token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let base_url = format!("{}/api/v4", base_url.trim_end_matches('/'));

        let mut client = GitLabClient {
            http,
            base_url,
            token: token.to_string(),
            version: ForgeVersion { major: 0, minor: 0 },
            capabilities: Capabilities::for_version(ForgeVersion { major: 0, minor: 0 }),
        };

        #[derive(serde::Deserialize)]
        struct VersionResponse {
            version: String,
        }

        let resp: VersionResponse = client.get("/version", &[]).await?;
        let version = ForgeVersion::parse(&resp.version).ok_or_else(|| ClientError::Protocol {
            detail: format!("unparseable forge version {:?}", resp.version),
        })?;

        debug!("Forge version {}.{}", version.major, version.minor);
        client.version = version;
        client.capabilities = Capabilities::for_version(version);
        Ok(client)
    }

    pub fn version(&self) -> ForgeVersion {
        self.version
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        sudo: Option<&str>,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("PRIVATE-TOKEN", &self.token)
                .query(query);
            if let Some(user) = sudo {
                req = req.header("Sudo", user);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let err = match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str(&text).map_err(|e| {
                            debug!("undecodable response from {url}: {text}");
                            ClientError::Protocol {
                                detail: e.to_string(),
                            }
                        });
                    }
                    classify_status(status, &text)
                }
                Err(e) if e.is_timeout() => ClientError::Timeout,
                Err(e) => ClientError::Network(e.to_string()),
            };

            if err.is_transient() && attempt < MAX_ATTEMPTS {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                warn!("{method} {path} failed ({err}), retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                continue;
            }
            return Err(err);
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.request(Method::GET, path, query, None, None).await
    }

    /// Follow `page`/`per_page` until a short page comes back.
    async fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut page = 1usize;
        loop {
            let mut q: Vec<(&str, String)> = query.to_vec();
            q.push(("per_page", PER_PAGE.to_string()));
            q.push(("page", page.to_string()));

            let items: Vec<T> = self.get(path, &q).await?;
            let short = items.len() < PER_PAGE;
            out.extend(items);
            if short {
                return Ok(out);
            }
            page += 1;
        }
    }
}

/// Percent-encode one path segment, so branch names containing `/` or
/// other reserved characters survive the trip.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn classify_status(status: StatusCode, body: &str) -> ClientError {
    let reason = || {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error"))
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| body.to_string())
    };

    match status.as_u16() {
        401 => ClientError::Unauthorised,
        403 => ClientError::Forbidden,
        404 => ClientError::NotFound,
        405 => ClientError::MethodNotAllowed,
        406 => ClientError::NotAcceptable,
        409 => ClientError::Conflict,
        422 => {
            let reason = reason();
            if reason.to_lowercase().contains("locked") {
                ClientError::Locked
            } else {
                ClientError::Unprocessable { reason }
            }
        }
        s => ClientError::Http {
            status: s,
            body: reason(),
        },
    }
}

#[async_trait]
impl ForgeClient for GitLabClient {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn current_user(&self) -> Result<User> {
        self.get("/user", &[]).await
    }

    async fn fetch_user_by_username(&self, username: &str) -> Result<User> {
        let users: Vec<User> = self
            .get("/users", &[("username", username.to_string())])
            .await?;
        users.into_iter().next().ok_or(ClientError::NotFound)
    }

    async fn list_projects_for_member(&self) -> Result<Vec<Project>> {
        self.get_paged("/projects", &[("membership", "true".to_string())])
            .await
    }

    async fn get_project(&self, project_id: u64) -> Result<Project> {
        self.get(&format!("/projects/{project_id}"), &[]).await
    }

    async fn list_assigned_mrs(&self, project_id: u64, user_id: u64) -> Result<Vec<MergeRequest>> {
        self.get_paged(
            &format!("/projects/{project_id}/merge_requests"),
            &[
                ("state", "opened".to_string()),
                ("assignee_id", user_id.to_string()),
            ],
        )
        .await
    }

    async fn get_mr(&self, project_id: u64, iid: u64) -> Result<MergeRequest> {
        self.get(&format!("/projects/{project_id}/merge_requests/{iid}"), &[])
            .await
    }

    async fn get_approvals(&self, project_id: u64, iid: u64) -> Result<Approvals> {
        self.get(
            &format!("/projects/{project_id}/merge_requests/{iid}/approvals"),
            &[],
        )
        .await
    }

    async fn get_pipelines_for_mr(&self, mr: &MergeRequest) -> Result<Vec<Pipeline>> {
        if self.capabilities.supports_mr_pipelines_endpoint {
            debug!(
                "Fetching pipelines for MR !{} via MR endpoint",
                mr.iid
            );
            self.get_paged(
                &format!(
                    "/projects/{}/merge_requests/{}/pipelines",
                    mr.project_id, mr.iid
                ),
                &[],
            )
            .await
        } else {
            // Pre-10.5 fallback: pipelines live on the source project,
            // keyed by branch ref.
            let source_project = mr.source_project_id.unwrap_or(mr.project_id);
            debug!(
                "Fetching pipelines for MR !{} via branch ref {}",
                mr.iid, mr.source_branch
            );
            self.get_paged(
                &format!("/projects/{source_project}/pipelines"),
                &[("ref", mr.source_branch.clone())],
            )
            .await
        }
    }

    async fn get_branch_sha(&self, project_id: u64, branch: &str) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct Branch {
            commit: BranchCommit,
        }
        #[derive(serde::Deserialize)]
        struct BranchCommit {
            id: String,
        }

        let b: Branch = self
            .get(
                &format!(
                    "/projects/{project_id}/repository/branches/{}",
                    encode_segment(branch)
                ),
                &[],
            )
            .await?;
        Ok(b.commit.id)
    }

    async fn get_commit(&self, project_id: u64, sha: &str) -> Result<Commit> {
        self.get(
            &format!("/projects/{project_id}/repository/commits/{sha}"),
            &[],
        )
        .await
    }

    async fn accept_mr(
        &self,
        project_id: u64,
        iid: u64,
        sha: &str,
        remove_source_branch: bool,
        squash: bool,
    ) -> Result<MergeRequest> {
        let mut body = json!({
            "sha": sha,
            "should_remove_source_branch": remove_source_branch,
        });
        if self.capabilities.supports_squash {
            body["squash"] = json!(squash);
        }
        self.request(
            Method::PUT,
            &format!("/projects/{project_id}/merge_requests/{iid}/merge"),
            &[],
            Some(&body),
            None,
        )
        .await
    }

    async fn approve_mr(
        &self,
        project_id: u64,
        iid: u64,
        sha: &str,
        impersonate: Option<&str>,
    ) -> Result<()> {
        let body = json!({ "sha": sha });
        let _: Value = self
            .request(
                Method::POST,
                &format!("/projects/{project_id}/merge_requests/{iid}/approve"),
                &[],
                Some(&body),
                impersonate,
            )
            .await?;
        Ok(())
    }

    async fn unapprove_mr(&self, project_id: u64, iid: u64) -> Result<()> {
        let _: Value = self
            .request(
                Method::POST,
                &format!("/projects/{project_id}/merge_requests/{iid}/unapprove"),
                &[],
                None,
                None,
            )
            .await?;
        Ok(())
    }

    async fn reset_approvals(&self, project_id: u64, iid: u64) -> Result<()> {
        let _: Value = self
            .request(
                Method::PUT,
                &format!("/projects/{project_id}/merge_requests/{iid}/reset_approvals"),
                &[],
                None,
                None,
            )
            .await?;
        Ok(())
    }

    async fn post_note(&self, project_id: u64, iid: u64, body: &str) -> Result<()> {
        let payload = json!({ "body": body });
        let _: Value = self
            .request(
                Method::POST,
                &format!("/projects/{project_id}/merge_requests/{iid}/notes"),
                &[],
                Some(&payload),
                None,
            )
            .await?;
        Ok(())
    }

    async fn set_assignees(&self, project_id: u64, iid: u64, assignee_ids: &[u64]) -> Result<()> {
        // An empty list must still be transmitted; GitLab clears the
        // field with assignee_ids=[0] on single-assignee versions, but
        // the modern form accepts [].
        let body = json!({ "assignee_ids": assignee_ids });
        let _: Value = self
            .request(
                Method::PUT,
                &format!("/projects/{project_id}/merge_requests/{iid}"),
                &[],
                Some(&body),
                None,
            )
            .await?;
        Ok(())
    }
}
