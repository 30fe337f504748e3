use crate::remote::RangeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `TARMOUNT__MOUNT__DEFAULT_UID=1000`
pub const ENV_PREFIX: &str = "TARMOUNT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mount: MountConfig,
    pub remote: RemoteConfig,
    pub github: GitHubConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Owner reported for entries whose back-end does not know one
    pub default_uid: u32,
    pub default_gid: u32,
    pub allow_other: bool,
    /// Let root in as well as the mounting user; exclusive with `allow_other`
    pub allow_root: bool,
    pub attr_ttl_secs: u64,
    /// Deadline for a single index call made on behalf of the kernel
    pub operation_timeout_secs: u64,
    pub fsname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub range_block_size: u64,
    /// Blocks kept in the range cache, 0 disables caching
    pub range_cache_blocks: u64,
    /// Timeout for the bundle download when the caller set no deadline
    pub download_timeout_secs: Option<u64>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_url: String,
    pub raw_url: String,
    pub token: Option<String>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            default_uid: 33333,
            default_gid: 33333,
            allow_other: false,
            allow_root: false,
            attr_ttl_secs: 1,
            operation_timeout_secs: 30,
            fsname: "tarmount".to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            range_block_size: 64 * 1024,
            range_cache_blocks: 4096,
            download_timeout_secs: None,
            request_timeout_secs: 60,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com/graphql".to_string(),
            raw_url: "https://raw.githubusercontent.com".to_string(),
            token: None,
        }
    }
}

impl MountConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl RemoteConfig {
    pub fn range_options(&self) -> RangeOptions {
        RangeOptions { block_size: self.range_block_size.max(1), cached_blocks: self.range_cache_blocks }
    }

    pub fn download_timeout(&self) -> Option<Duration> {
        self.download_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load defaults, then the config file, then `TARMOUNT__*` environment variables.
    ///
    /// Without an explicit path an optional `tarmount.{toml,yaml,json}` in the
    /// working directory is used.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with_env(path, environment())
    }

    pub fn load_with_env(path: Option<&Path>, env: config::Environment) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("tarmount").required(false),
        };

        let config = config::Config::builder().add_source(file).add_source(env).build()?;

        Ok(config.try_deserialize()?)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
