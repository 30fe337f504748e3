// Back-end selection
//
// The CLI decides which index to serve; everything downstream sees only
// `Arc<dyn Index>`.

use crate::archive::TarIndex;
use crate::config::Config;
use crate::github::{GitHubClient, RepoRef, TreeIndex};
use crate::index::{Index, IndexResult, OpContext};
use crate::remote::open_remote_index;
use std::path::PathBuf;
use std::sync::Arc;

/// Where an index comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSource {
    /// Store directory built by `index generate`, plus the tar it indexes
    Local { index: PathBuf, tar: PathBuf },
    /// Published bundle: `{base_url}.index` and `{base_url}.tar`
    Remote { base_url: String },
    /// Repository tree listed through the GitHub API
    GitHub { repo: RepoRef },
}

impl std::fmt::Display for IndexSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexSource::Local { index, tar } => {
                write!(f, "local {} ({})", tar.display(), index.display())
            }
            IndexSource::Remote { base_url } => write!(f, "remote {}", base_url),
            IndexSource::GitHub { repo } => {
                write!(f, "github {}/{}@{}", repo.owner, repo.name, repo.revision)
            }
        }
    }
}

impl IndexSource {
    /// Open the index; failures here abort mount setup
    pub async fn open(&self, ctx: &OpContext, config: &Config) -> IndexResult<Arc<dyn Index>> {
        tracing::info!(source = %self, "Opening index");

        let index: Arc<dyn Index> = match self {
            IndexSource::Local { index, tar } => {
                Arc::new(ctx.run(TarIndex::open_local(index, tar)).await?)
            }
            IndexSource::Remote { base_url } => {
                Arc::new(open_remote_index(ctx, base_url, &config.remote).await?)
            }
            IndexSource::GitHub { repo } => {
                let client =
                    GitHubClient::new(repo.clone(), &config.github, config.remote.range_options())?;
                Arc::new(TreeIndex::new(ctx, Arc::new(client)).await?)
            }
        };

        Ok(index)
    }
}
