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

//! Keyed store for upstream metadata responses with soft TTL.
//!
//! Entries live as whole files under `api/`; only freshness bookkeeping is
//! in memory. Expiry is soft: an expired or unindexed entry still serves
//! when the upstream cannot be asked.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use futures::future::BoxFuture;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::new_std_io_error;
use crate::error::new_task_join_error;
use crate::raw::RepoType;
use crate::Error;
use crate::ErrorKind;
use crate::OfflineGuard;
use crate::Result;

/// What kind of upstream metadata an entry caches.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MetaKind {
    /// Repo info JSON, optionally pinned to a revision.
    ApiInfo,
    /// Per-file HEAD resolution: commit, size, etag, digest, LFS target.
    ResolveHead,
    /// Tree listing JSON.
    TreeListing,
    /// Small raw-endpoint file content.
    RawFile,
}

impl MetaKind {
    fn as_segment(&self) -> &'static str {
        match self {
            MetaKind::ApiInfo => "info",
            MetaKind::ResolveHead => "resolve",
            MetaKind::TreeListing => "tree",
            MetaKind::RawFile => "raw",
        }
    }
}

/// Cache key for one metadata entry. `extra` carries the revision, or a
/// `revision/path` pair for per-file kinds.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetaKey {
    pub kind: MetaKind,
    pub repo_type: RepoType,
    pub org: String,
    pub name: String,
    pub extra: String,
}

impl MetaKey {
    fn rel_path(&self) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(self.repo_type.as_segment().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.extra.as_bytes());
        let keyhash = hex::encode(&hasher.finalize()[..16]);

        PathBuf::from(format!(
            "{}/{}/{}/{}.json",
            self.kind.as_segment(),
            self.org,
            self.name,
            keyhash
        ))
    }
}

/// A cached metadata value: the raw upstream bytes plus the upstream etag.
#[derive(Clone, Debug)]
pub struct MetaValue {
    pub bytes: Bytes,
    pub etag: Option<String>,
}

/// Fetches one entry from upstream. Runs in a detached task so coalesced
/// requests are answered even if the one that started the fetch goes away.
pub type MetaFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<MetaValue>> + Send + Sync>;

type SharedResult = std::result::Result<MetaValue, Arc<Error>>;

struct IndexEntry {
    fetched_at: DateTime<Utc>,
    etag: Option<String>,
}

#[derive(Default)]
struct MetaState {
    index: HashMap<MetaKey, IndexEntry>,
    in_flight: HashMap<MetaKey, Vec<oneshot::Sender<SharedResult>>>,
}

/// The metadata cache rooted at `<repos-path>/api`.
pub struct MetaCache {
    root: PathBuf,
    tmp_path: PathBuf,
    offline: Arc<OfflineGuard>,
    state: Arc<Mutex<MetaState>>,
}

impl MetaCache {
    pub fn new(root: PathBuf, tmp_path: PathBuf, offline: Arc<OfflineGuard>) -> Self {
        MetaCache {
            root,
            tmp_path,
            offline,
            state: Arc::new(Mutex::new(MetaState::default())),
        }
    }

    fn entry_path(&self, key: &MetaKey) -> PathBuf {
        self.root.join(key.rel_path())
    }

    /// Return the cached value if fresh, otherwise fetch and store.
    ///
    /// Fetch failures fall back to a stale entry when one exists; offline
    /// mode never fetches at all. Concurrent calls for one key coalesce into
    /// a single upstream fetch.
    pub async fn get_or_fetch(
        &self,
        key: &MetaKey,
        ttl_secs: u64,
        fetcher: &MetaFetcher,
    ) -> Result<MetaValue> {
        let fresh = {
            let state = self.state.lock().expect("meta state lock poisoned");
            state.index.get(key).and_then(|entry| {
                let age = Utc::now().signed_duration_since(entry.fetched_at);
                (age.num_seconds() >= 0 && (age.num_seconds() as u64) < ttl_secs)
                    .then(|| entry.etag.clone())
            })
        };

        if let Some(etag) = fresh {
            match self.read_entry(key).await? {
                Some(bytes) => return Ok(MetaValue { bytes, etag }),
                // The file went away under us; drop the index row and fetch.
                None => {
                    let mut state = self.state.lock().expect("meta state lock poisoned");
                    state.index.remove(key);
                }
            }
        }

        if self.offline.is_offline() {
            return match self.read_entry(key).await? {
                Some(bytes) => {
                    log::debug!("serving stale metadata for {key:?} while offline");
                    Ok(MetaValue { bytes, etag: None })
                }
                None => Err(Error::new(
                    ErrorKind::OfflineMiss,
                    "metadata is not cached and offline mode forbids fetching",
                )
                .with_operation("MetaCache::get_or_fetch")),
            };
        }

        match self.fetch_coalesced(key, fetcher).await {
            Ok(value) => Ok(value),
            Err(err) => match self.read_entry(key).await? {
                Some(bytes) => {
                    log::warn!("metadata fetch failed ({err}), serving stale entry");
                    Ok(MetaValue { bytes, etag: None })
                }
                None => Err(err),
            },
        }
    }

    /// Drop an entry from the index and from disk.
    pub async fn invalidate(&self, key: &MetaKey) -> Result<()> {
        self.state
            .lock()
            .expect("meta state lock poisoned")
            .index
            .remove(key);

        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(new_std_io_error(err)),
        })
        .await
        .map_err(new_task_join_error)?
    }

    async fn fetch_coalesced(&self, key: &MetaKey, fetcher: &MetaFetcher) -> Result<MetaValue> {
        let mut lost_fetches = 0;
        loop {
            let rx = {
                let mut state = self.state.lock().expect("meta state lock poisoned");
                let (tx, rx) = oneshot::channel();
                match state.in_flight.entry(key.clone()) {
                    Entry::Occupied(mut occupied) => occupied.get_mut().push(tx),
                    Entry::Vacant(vacant) => {
                        vacant.insert(vec![tx]);
                        self.spawn_fetch(key.clone(), fetcher.clone());
                    }
                }
                rx
            };

            match rx.await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    return Err(Error::new(err.kind(), err.to_string())
                        .with_operation("MetaCache::get_or_fetch"))
                }
                Err(_) => {
                    lost_fetches += 1;
                    if lost_fetches >= 3 {
                        return Err(Error::new(
                            ErrorKind::Cancelled,
                            "metadata fetch abandoned repeatedly",
                        ));
                    }
                }
            }
        }
    }

    fn spawn_fetch(&self, key: MetaKey, fetcher: MetaFetcher) {
        let state = self.state.clone();
        let path = self.entry_path(&key);
        let tmp_path = self.tmp_path.clone();

        tokio::spawn(async move {
            let result = match fetcher().await {
                Ok(value) => {
                    let bytes = value.bytes.clone();
                    let write_path = path.clone();
                    let write = tokio::task::spawn_blocking(move || {
                        write_atomic(&write_path, &tmp_path, &bytes)
                    })
                    .await
                    .map_err(new_task_join_error)
                    .and_then(|r| r);
                    match write {
                        Ok(()) => Ok(value),
                        Err(err) => Err(err),
                    }
                }
                Err(err) => Err(err),
            };
            let result: SharedResult = result.map_err(Arc::new);

            let waiters = {
                let mut state = state.lock().expect("meta state lock poisoned");
                if let Ok(value) = &result {
                    state.index.insert(
                        key.clone(),
                        IndexEntry {
                            fetched_at: Utc::now(),
                            etag: value.etag.clone(),
                        },
                    );
                }
                state.in_flight.remove(&key).unwrap_or_default()
            };
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        });
    }

    async fn read_entry(&self, key: &MetaKey) -> Result<Option<Bytes>> {
        let path = self.entry_path(key);
        tokio::task::spawn_blocking(move || match fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(new_std_io_error(err)),
        })
        .await
        .map_err(new_task_join_error)?
    }
}

fn write_atomic(path: &PathBuf, tmp_dir: &PathBuf, bytes: &Bytes) -> Result<()> {
    fs::create_dir_all(tmp_dir).map_err(new_std_io_error)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(new_std_io_error)?;
    }

    let tmp = tmp_dir.join(format!("{}.json", Uuid::new_v4()));
    fs::write(&tmp, bytes).map_err(new_std_io_error)?;
    fs::rename(&tmp, path).map_err(new_std_io_error)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn test_key(extra: &str) -> MetaKey {
        MetaKey {
            kind: MetaKind::ApiInfo,
            repo_type: RepoType::Model,
            org: "org".to_string(),
            name: "name".to_string(),
            extra: extra.to_string(),
        }
    }

    fn test_cache(dir: &tempfile::TempDir, offline: bool) -> MetaCache {
        MetaCache::new(
            dir.path().join("api"),
            dir.path().join("tmp"),
            Arc::new(OfflineGuard::new(offline)),
        )
    }

    fn fetcher_returning(body: &'static str, calls: Arc<AtomicUsize>) -> MetaFetcher {
        Arc::new(move || {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(MetaValue {
                    bytes: Bytes::from_static(body.as_bytes()),
                    etag: Some("v1".to_string()),
                })
            })
        })
    }

    fn failing_fetcher() -> MetaFetcher {
        Arc::new(|| {
            Box::pin(async {
                Err(Error::new(ErrorKind::UpstreamNetwork, "unreachable").set_temporary())
            })
        })
    }

    #[tokio::test]
    async fn test_fetch_then_fresh_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, false);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_returning(r#"{"id":"org/name"}"#, calls.clone());

        let key = test_key("main");
        let first = cache.get_or_fetch(&key, 600, &fetcher).await.unwrap();
        assert_eq!(first.bytes, Bytes::from_static(br#"{"id":"org/name"}"#));
        assert_eq!(first.etag.as_deref(), Some("v1"));

        let second = cache.get_or_fetch(&key, 600, &fetcher).await.unwrap();
        assert_eq!(second.bytes, first.bytes);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, false);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_returning("{}", calls.clone());

        let key = test_key("main");
        cache.get_or_fetch(&key, 0, &fetcher).await.unwrap();
        cache.get_or_fetch(&key, 0, &fetcher).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_fallback_on_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, false);
        let calls = Arc::new(AtomicUsize::new(0));

        let key = test_key("main");
        cache
            .get_or_fetch(&key, 0, &fetcher_returning("stale body", calls))
            .await
            .unwrap();

        // TTL 0 forces a refetch; the failure falls back to the stored body.
        let value = cache
            .get_or_fetch(&key, 0, &failing_fetcher())
            .await
            .unwrap();
        assert_eq!(value.bytes, Bytes::from_static(b"stale body"));
    }

    #[tokio::test]
    async fn test_offline_never_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, true);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_returning("{}", calls.clone());

        let err = cache
            .get_or_fetch(&test_key("main"), 600, &fetcher)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OfflineMiss);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_offline_serves_stale() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key("main");
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let cache = test_cache(&dir, false);
            cache
                .get_or_fetch(&key, 600, &fetcher_returning("cached", calls.clone()))
                .await
                .unwrap();
        }

        // A fresh process with no index serves the on-disk entry offline.
        let cache = test_cache(&dir, true);
        let value = cache
            .get_or_fetch(&key, 600, &fetcher_returning("other", calls.clone()))
            .await
            .unwrap();
        assert_eq!(value.bytes, Bytes::from_static(b"cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(&dir, false));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_calls = calls.clone();
        let fetcher: MetaFetcher = Arc::new(move || {
            let calls = slow_calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(MetaValue {
                    bytes: Bytes::from_static(b"shared"),
                    etag: None,
                })
            })
        });

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetcher = fetcher.clone();
            tasks.push(tokio::spawn(async move {
                cache.get_or_fetch(&test_key("main"), 600, &fetcher).await
            }));
        }
        for task in tasks {
            assert_eq!(
                task.await.unwrap().unwrap().bytes,
                Bytes::from_static(b"shared")
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, false);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = fetcher_returning("{}", calls.clone());

        let key = test_key("main");
        cache.get_or_fetch(&key, 600, &fetcher).await.unwrap();
        cache.invalidate(&key).await.unwrap();
        cache.get_or_fetch(&key, 600, &fetcher).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
