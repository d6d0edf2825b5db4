//! Gitea-style REST backend
//!
//! Reads branch tips and raw file blobs through the Gitea HTTP API:
//! `GET /api/v1/repos/{owner}/{repo}/branches/{branch}` for metadata and
//! `GET /api/v1/repos/{owner}/{repo}/media/{path}?ref={commit}` for blobs.

use crate::backend::{Backend, BranchMeta, FileResponse};
use crate::body;
use crate::error::{PagesError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub struct GiteaBackend {
    base: reqwest::Url,
    token: String,
    branch: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct BranchPayload {
    commit: CommitPayload,
}

#[derive(Deserialize)]
struct CommitPayload {
    id: String,
    timestamp: DateTime<Utc>,
}

impl GiteaBackend {
    /// Create a backend against a Gitea server.
    ///
    /// `branch` is the pages branch served for every repository.
    pub fn new(server: &str, token: &str, branch: &str) -> Result<Self> {
        let base = reqwest::Url::parse(server)
            .map_err(|e| PagesError::Config(format!("invalid gitea server url: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(PagesError::Config(format!(
                "gitea server url must be absolute: {}",
                server
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;
        Ok(GiteaBackend {
            base,
            token: token.to_string(),
            branch: branch.to_string(),
            client,
        })
    }

    fn api_url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = self.base.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| PagesError::Config("gitea server url is not a base".into()))?;
            parts.pop_if_empty();
            parts.extend(["api", "v1", "repos"]);
            parts.extend(segments.iter().copied());
        }
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.header("Authorization", format!("token {}", self.token))
        }
    }
}

#[async_trait]
impl Backend for GiteaBackend {
    async fn meta(&self, owner: &str, repo: &str) -> Result<BranchMeta> {
        let url = self.api_url(&[owner, repo, "branches", &self.branch])?;
        debug!(owner, repo, branch = %self.branch, "fetch branch tip");
        let resp = self.authorize(self.client.get(url)).send().await?;
        match resp.status() {
            reqwest::StatusCode::NOT_FOUND => Err(PagesError::NotFound),
            status if status.is_success() => {
                let payload: BranchPayload = resp.json().await?;
                Ok(BranchMeta {
                    id: payload.commit.id,
                    last_modified: payload.commit.timestamp,
                })
            }
            status => Err(PagesError::Backend(format!(
                "branch lookup for {}/{} returned {}",
                owner, repo, status
            ))),
        }
    }

    async fn open(
        &self,
        owner: &str,
        repo: &str,
        commit: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<FileResponse> {
        let mut url = self.api_url(&[owner, repo, "media"])?;
        url.path_segments_mut()
            .map_err(|_| PagesError::Config("gitea server url is not a base".into()))?
            .extend(path.split('/').filter(|s| !s.is_empty()));
        url.query_pairs_mut().append_pair("ref", commit);

        let mut req = self.authorize(self.client.get(url));
        for (name, value) in headers {
            req = req.header(name, value);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PagesError::NotFound);
        }
        Ok(FileResponse {
            status: resp.status(),
            headers: resp.headers().clone(),
            body: body::from_reqwest(resp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_escapes_segments() {
        let backend = GiteaBackend::new("https://git.example.com", "", "gh-pages").unwrap();
        let url = backend.api_url(&["org1", "repo1", "branches", "gh-pages"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://git.example.com/api/v1/repos/org1/repo1/branches/gh-pages"
        );
    }

    #[test]
    fn test_base_with_subpath() {
        let backend = GiteaBackend::new("https://example.com/gitea/", "", "main").unwrap();
        let url = backend.api_url(&["o", "r", "media"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/gitea/api/v1/repos/o/r/media");
    }

    #[test]
    fn test_invalid_server_rejected() {
        assert!(GiteaBackend::new("not a url", "", "main").is_err());
    }
}
