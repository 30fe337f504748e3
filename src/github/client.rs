// GitHub tree client
//
// Directory listings come from the GraphQL API (one query per directory);
// blob content is read with range requests against the raw-content host.

use super::{TreeClient, TreeItem, TreeItemKind};
use crate::config::GitHubConfig;
use crate::index::{IndexError, IndexResult};
use crate::remote::{HttpRangeReader, RangeOptions};
use crate::source::ByteSource;
use async_trait::async_trait;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

const TREE_QUERY: &str = r#"
query($owner: String!, $name: String!, $expression: String!) {
  repository(owner: $owner, name: $name) {
    object(expression: $expression) {
      ... on Tree {
        entries {
          name
          type
          path
          mode
          object { ... on Blob { byteSize } }
        }
      }
    }
  }
}"#;

/// Repository coordinates: `owner/name` at a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub revision: String,
}

impl RepoRef {
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Git object expression for the tree at `path`, e.g. `main:src/lib`
    fn expression(&self, path: &str) -> String {
        format!("{}:{}", self.revision, path)
    }
}

impl FromStr for RepoRef {
    type Err = IndexError;

    /// Parse `owner/name`; the revision defaults to `main`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IndexError::InvalidPath(format!("expected owner/repo, got {:?}", s));
        let (owner, name) = s.trim().split_once('/').ok_or_else(invalid)?;
        let name = name.strip_suffix(".git").unwrap_or(name);
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self { owner: owner.to_string(), name: name.to_string(), revision: "main".to_string() })
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<ResponseData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponseData {
    repository: Option<Repository>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    object: Option<TreeObject>,
}

#[derive(Debug, Deserialize)]
struct TreeObject {
    /// Absent when the expression resolves to something other than a tree
    entries: Option<Vec<RawTreeEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawTreeEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    path: Option<String>,
    mode: u32,
    object: Option<BlobObject>,
}

#[derive(Debug, Deserialize)]
struct BlobObject {
    #[serde(rename = "byteSize")]
    byte_size: Option<u64>,
}

pub struct GitHubClient {
    http: reqwest::Client,
    repo: RepoRef,
    api_url: String,
    raw_url: Url,
    range: RangeOptions,
}

impl GitHubClient {
    pub fn new(repo: RepoRef, config: &GitHubConfig, range: RangeOptions) -> IndexResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| IndexError::Api(format!("invalid token: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        // The token rides along on both API and raw-content requests
        let http = reqwest::Client::builder()
            .user_agent(concat!("tarmount/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;
        let raw_url = Url::parse(&config.raw_url)
            .map_err(|e| IndexError::InvalidPath(format!("{}: {}", config.raw_url, e)))?;

        Ok(Self { http, repo, api_url: config.api_url.clone(), raw_url, range })
    }

    /// `{raw}/{owner}/{repo}/{revision}/{path}`, each segment escaped
    pub fn raw_url(&self, path: &str) -> IndexResult<Url> {
        let mut url = self.raw_url.clone();
        url.path_segments_mut()
            .map_err(|_| IndexError::InvalidPath(format!("not a base URL: {}", self.raw_url)))?
            .pop_if_empty()
            .push(&self.repo.owner)
            .push(&self.repo.name)
            .push(&self.repo.revision)
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl TreeClient for GitHubClient {
    async fn list_tree(&self, path: &str) -> IndexResult<Vec<TreeItem>> {
        let body = json!({
            "query": TREE_QUERY,
            "variables": {
                "owner": self.repo.owner,
                "name": self.repo.name,
                "expression": self.repo.expression(path),
            }
        });

        tracing::debug!(repo = %self.repo.name, path = %path, "Listing tree");
        let response = self.http.post(&self.api_url).json(&body).send().await?.error_for_status()?;
        let response: GraphQlResponse = response.json().await?;

        decode_listing(response, path)
    }

    async fn open_blob(&self, path: &str, size: u64) -> IndexResult<Arc<dyn ByteSource>> {
        let url = self.raw_url(path)?;
        tracing::debug!(url = %url, size, "Opening blob reader");
        Ok(Arc::new(HttpRangeReader::with_length(self.http.clone(), url, size, self.range)))
    }
}

fn decode_listing(response: GraphQlResponse, path: &str) -> IndexResult<Vec<TreeItem>> {
    if !response.errors.is_empty() {
        let messages: Vec<_> = response.errors.into_iter().map(|e| e.message).collect();
        return Err(IndexError::Api(messages.join("; ")));
    }

    let repository = response
        .data
        .and_then(|d| d.repository)
        .ok_or_else(|| IndexError::Api("repository not found".to_string()))?;

    let entries = repository
        .object
        .and_then(|o| o.entries)
        .ok_or_else(|| IndexError::NotFound(path.to_string()))?;

    Ok(entries
        .into_iter()
        .map(|raw| {
            let kind = match raw.kind.as_str() {
                "tree" => TreeItemKind::Tree,
                "commit" => TreeItemKind::Commit,
                _ => TreeItemKind::Blob,
            };
            let path = raw.path.unwrap_or_else(|| {
                if path.is_empty() { raw.name.clone() } else { format!("{}/{}", path, raw.name) }
            });
            TreeItem {
                name: raw.name,
                path,
                kind,
                mode: raw.mode,
                size: raw.object.and_then(|o| o.byte_size).unwrap_or(0),
            }
        })
        .collect())
}
