// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// Default cache block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 1 << 20;

/// Files at or above this content-length take the LFS flow by default.
pub const DEFAULT_LFS_THRESHOLD: u64 = 10 << 20;

/// Process-wide configuration, deserialized from TOML and frozen after
/// validation. The only runtime-mutable state is the offline toggle, which
/// lives in [`crate::OfflineGuard`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the server binds to.
    pub host: String,
    /// Port the server binds to.
    pub port: u16,
    /// TLS key path, consumed by an external terminator.
    pub ssl_key: Option<PathBuf>,
    /// TLS certificate path, consumed by an external terminator.
    pub ssl_cert: Option<PathBuf>,

    /// Root of the block cache and metadata cache.
    pub repos_path: PathBuf,
    /// Optional directory of pre-cloned repositories, served by an external
    /// collaborator.
    pub mirrors_path: Option<PathBuf>,

    /// Scheme used to reach the upstream hub.
    pub hf_scheme: String,
    /// Host (and optional port) of the upstream hub.
    pub hf_netloc: String,
    /// Host of the upstream LFS CDN.
    pub hf_lfs_netloc: String,

    /// Scheme this mirror advertises for itself.
    pub mirror_scheme: String,
    /// Netloc this mirror advertises for itself.
    pub mirror_netloc: String,
    /// Netloc this mirror advertises for LFS traffic.
    pub mirror_lfs_netloc: String,

    /// Cache block size in bytes; must be a power of two.
    pub block_size: u64,
    /// Content-length at which a file is treated as LFS.
    pub lfs_threshold: u64,
    /// Start with the offline toggle on.
    pub offline: bool,

    /// Upstream request attempts before giving up.
    pub retries: usize,
    /// Redirect hops followed before failing.
    pub redirect_limit: usize,
    /// Upstream request timeout in seconds.
    pub timeout_secs: u64,

    /// Total cache size above which eviction starts. `None` disables
    /// eviction.
    pub cache_size_limit: Option<u64>,
    /// Victim selection order for eviction.
    pub eviction_policy: EvictionPolicy,

    /// Soft TTLs for cached metadata, per kind.
    pub meta_ttl: TtlConfig,

    /// Ordered proxy allow/deny rules; first match wins, default allow.
    pub proxy_rules: Vec<RuleConfig>,
    /// Ordered cache allow/deny rules; first match wins, default allow.
    pub cache_rules: Vec<RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            ssl_key: None,
            ssl_cert: None,
            repos_path: PathBuf::from("./repos"),
            mirrors_path: None,
            hf_scheme: "https".to_string(),
            hf_netloc: "huggingface.co".to_string(),
            hf_lfs_netloc: "cdn-lfs.huggingface.co".to_string(),
            mirror_scheme: "http".to_string(),
            mirror_netloc: "localhost:8090".to_string(),
            mirror_lfs_netloc: "localhost:8090".to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            lfs_threshold: DEFAULT_LFS_THRESHOLD,
            offline: false,
            retries: 5,
            redirect_limit: 5,
            timeout_secs: 60,
            cache_size_limit: None,
            eviction_policy: EvictionPolicy::Lru,
            meta_ttl: TtlConfig::default(),
            proxy_rules: Vec::new(),
            cache_rules: Vec::new(),
        }
    }
}

/// Order in which eviction picks victims once the cache exceeds its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    Lru,
    /// Oldest created first.
    Fifo,
    /// Biggest allocation first.
    LargeFirst,
}

/// Soft TTLs (seconds) for the metadata cache. Expired entries are still
/// served when the upstream is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtlConfig {
    pub api_info: u64,
    pub resolve_head: u64,
    pub tree_listing: u64,
    pub raw_file: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            api_info: 600,
            resolve_head: 600,
            tree_listing: 600,
            raw_file: 600,
        }
    }
}

/// One allow/deny rule over `org/name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// The pattern matched against `org/name`.
    pub repo: String,
    /// Treat `repo` as an anchored regex instead of a glob.
    #[serde(default)]
    pub use_regex: bool,
    /// Whether a match allows or denies.
    pub allow: bool,
}

impl Config {
    /// Load a config file in TOML format.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::ConfigInvalid, "config file is unreadable")
                .with_context("path", path.display().to_string())
                .set_source(err)
        })?;

        let config: Config = toml::from_str(&content).map_err(|err| {
            Error::new(ErrorKind::ConfigInvalid, "config file failed to parse")
                .with_context("path", path.display().to_string())
                .set_source(err)
        })?;

        Ok(config)
    }

    /// Validate the frozen configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                "block_size must be a power of two",
            )
            .with_context("block_size", self.block_size.to_string()));
        }

        if self.retries == 0 {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                "retries must be greater than zero",
            ));
        }

        if self.redirect_limit == 0 {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                "redirect_limit must be greater than zero",
            ));
        }

        for scheme in [&self.hf_scheme, &self.mirror_scheme] {
            if scheme != "http" && scheme != "https" {
                return Err(Error::new(ErrorKind::ConfigInvalid, "unknown scheme")
                    .with_context("scheme", scheme));
            }
        }

        Ok(())
    }

    /// The tmp directory for in-progress cache files.
    pub fn tmp_path(&self) -> PathBuf {
        self.repos_path.join("tmp")
    }

    /// The metadata cache root.
    pub fn api_path(&self) -> PathBuf {
        self.repos_path.join("api")
    }
}
