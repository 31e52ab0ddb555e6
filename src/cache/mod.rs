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

//! The persistent mirror: block-granular file cache and metadata cache.

mod block_file;
pub use block_file::remove_pair;
pub use block_file::BlockFile;
pub use block_file::OpenArgs;
pub use block_file::RangePresence;

mod chunk_cache;
pub use chunk_cache::BlockFetcher;
pub use chunk_cache::ChunkCache;
pub use chunk_cache::Handle;

mod meta_cache;
pub use meta_cache::MetaCache;
pub use meta_cache::MetaFetcher;
pub use meta_cache::MetaKey;
pub use meta_cache::MetaKind;
pub use meta_cache::MetaValue;

mod eviction;
pub use eviction::spawn_eviction_task;

use std::path::PathBuf;

use crate::raw::RepoType;

/// Uniquely identifies one cached upstream file at one immutable commit.
///
/// Requests arriving with a branch or tag revision are resolved to a commit
/// hash before this key is formed, so `main` and its resolved commit share
/// one BlockFile.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    pub repo_type: RepoType,
    pub org: String,
    pub name: String,
    pub commit: String,
    pub path: String,
}

impl CacheKey {
    /// The `org/name` form used by the policy engine.
    pub fn repo(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }

    /// Data file path relative to the cache root. Directory separators in
    /// `path` are preserved.
    pub fn data_rel_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}/{}/{}/blocks/{}/{}.bin",
            self.repo_type.as_segment(),
            self.org,
            self.name,
            self.commit,
            self.path
        ))
    }

    /// Sidecar path relative to the cache root.
    pub fn meta_rel_path(&self) -> PathBuf {
        self.data_rel_path().with_extension("meta")
    }
}
