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

//! Background eviction: hourly usage scans that delete cached pairs once the
//! cache outgrows its configured limit.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use super::block_file::remove_pair;
use super::ChunkCache;
use crate::config::EvictionPolicy;
use crate::error::new_std_io_error;
use crate::error::new_task_join_error;
use crate::Result;

const SCAN_INTERVAL: Duration = Duration::from_secs(3600);

struct Candidate {
    data_path: PathBuf,
    /// Actually allocated bytes of the pair, not the sparse apparent size.
    allocated: u64,
    accessed: SystemTime,
    created: SystemTime,
}

/// Spawn the hourly eviction loop. The first scan runs right away.
pub fn spawn_eviction_task(
    cache: Arc<ChunkCache>,
    limit: u64,
    policy: EvictionPolicy,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            let outcome =
                tokio::task::spawn_blocking(move || evict_once(&cache, limit, policy)).await;
            match outcome {
                Ok(Ok(freed)) if freed > 0 => log::info!("eviction freed {freed} bytes"),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => log::warn!("eviction scan failed: {err}"),
                Err(err) => log::warn!("eviction scan failed: {}", new_task_join_error(err)),
            }
        }
    })
}

/// One scan-and-evict pass. Returns the bytes freed.
pub fn evict_once(cache: &ChunkCache, limit: u64, policy: EvictionPolicy) -> Result<u64> {
    let mut candidates = Vec::new();
    for segment in ["models", "datasets", "spaces"] {
        let root = cache.repos_path().join(segment);
        if root.is_dir() {
            collect_candidates(&root, &mut candidates)?;
        }
    }

    let total: u64 = candidates.iter().map(|c| c.allocated).sum();
    if total <= limit {
        return Ok(0);
    }

    match policy {
        EvictionPolicy::Lru => candidates.sort_by_key(|c| c.accessed),
        EvictionPolicy::Fifo => candidates.sort_by_key(|c| c.created),
        EvictionPolicy::LargeFirst => {
            candidates.sort_by(|a, b| b.allocated.cmp(&a.allocated));
        }
    }

    let pinned = cache.pinned_paths();
    let mut remaining = total;
    let mut freed = 0u64;
    for candidate in candidates {
        if remaining <= limit {
            break;
        }
        if pinned.contains(&candidate.data_path) {
            continue;
        }

        let meta_path = candidate.data_path.with_extension("meta");
        remove_pair(&candidate.data_path, &meta_path)?;
        remaining -= candidate.allocated;
        freed += candidate.allocated;
        log::debug!(
            "evicted {} ({} bytes)",
            candidate.data_path.display(),
            candidate.allocated
        );
    }

    Ok(freed)
}

fn collect_candidates(dir: &Path, out: &mut Vec<Candidate>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(new_std_io_error)? {
        let entry = entry.map_err(new_std_io_error)?;
        let path = entry.path();
        let md = entry.metadata().map_err(new_std_io_error)?;

        if md.is_dir() {
            collect_candidates(&path, out)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }

        let meta_md = fs::metadata(path.with_extension("meta")).ok();
        let allocated =
            allocated_bytes(&md) + meta_md.as_ref().map(allocated_bytes).unwrap_or_default();

        out.push(Candidate {
            data_path: path,
            allocated,
            accessed: md.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            created: md
                .created()
                .or_else(|_| md.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn allocated_bytes(md: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(md: &fs::Metadata) -> u64 {
    md.len()
}
