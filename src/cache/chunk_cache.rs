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

//! Process-wide manager over BlockFiles: open-file registry, refcounted
//! handles, and single-flight coordination of block fetches.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::oneshot;

use super::block_file::remove_pair;
use super::block_file::BlockFile;
use super::block_file::OpenArgs;
use super::CacheKey;
use crate::error::new_task_join_error;
use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// Fetches one block's bytes from upstream, given `(offset, len)`.
///
/// The closure must be self-contained: it runs inside a detached task so a
/// fetch outlives the request that started it.
pub type BlockFetcher = Arc<dyn Fn(u64, u64) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

type SharedResult = std::result::Result<(), Arc<Error>>;

struct OpenEntry {
    file: Arc<BlockFile>,
    refs: AtomicUsize,
}

#[derive(Default)]
struct Registry {
    open: HashMap<CacheKey, Arc<OpenEntry>>,
    in_flight: HashMap<(CacheKey, u64), Vec<oneshot::Sender<SharedResult>>>,
}

/// The block cache over `repos_path`.
///
/// All file I/O runs on the blocking pool; the registry mutex protects only
/// map lookups and is never held across I/O or `.await`.
pub struct ChunkCache {
    repos_path: PathBuf,
    tmp_path: PathBuf,
    block_size: u64,
    registry: Arc<Mutex<Registry>>,
}

/// A refcounted reference to an open BlockFile. Eviction refuses to touch a
/// file while any handle to it is alive.
pub struct Handle {
    registry: Arc<Mutex<Registry>>,
    key: CacheKey,
    entry: Arc<OpenEntry>,
}

impl Handle {
    /// The underlying file.
    pub fn file(&self) -> &Arc<BlockFile> {
        &self.entry.file
    }

    /// The key this handle was acquired for.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.entry.refs.fetch_add(1, Ordering::Relaxed);
        Handle {
            registry: self.registry.clone(),
            key: self.key.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        // Only drop the record if it is still ours; an invalidation may have
        // replaced it while this handle was alive.
        let ours = registry.open.get(&self.key).is_some_and(|entry| {
            Arc::ptr_eq(&entry.file, &self.entry.file) && entry.refs.load(Ordering::Acquire) == 0
        });
        if ours {
            registry.open.remove(&self.key);
        }
    }
}

impl ChunkCache {
    /// Create the cache rooted at `repos_path`.
    pub fn new(repos_path: PathBuf, tmp_path: PathBuf, block_size: u64) -> Self {
        ChunkCache {
            repos_path,
            tmp_path,
            block_size,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn repos_path(&self) -> &Path {
        &self.repos_path
    }

    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.repos_path.join(key.data_rel_path())
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.repos_path.join(key.meta_rel_path())
    }

    /// Open or create the BlockFile for `key` and return a refcounted handle.
    ///
    /// When a record is already open but its size or digest disagrees with
    /// the upstream-reported identity, the stale file is invalidated and a
    /// fresh one created in its place; handles acquired earlier keep reading
    /// their unlinked file.
    pub async fn acquire(&self, key: CacheKey, args: OpenArgs) -> Result<Handle> {
        {
            let mut registry = self.registry.lock().expect("registry lock poisoned");
            if let Some(entry) = registry.open.get(&key).cloned() {
                if file_matches(&entry.file, &args) {
                    entry.refs.fetch_add(1, Ordering::Relaxed);
                    return Ok(Handle {
                        registry: self.registry.clone(),
                        key,
                        entry,
                    });
                }
                log::info!(
                    "invalidating {} (size {} -> {})",
                    key.repo(),
                    entry.file.total_size(),
                    args.total_size
                );
                registry.open.remove(&key);
            }
        }

        let data_path = self.data_path(&key);
        let meta_path = self.meta_path(&key);
        let tmp_path = self.tmp_path.clone();
        let open_args = args.clone();

        let file = tokio::task::spawn_blocking(move || {
            BlockFile::open_or_create(&data_path, &meta_path, &tmp_path, &open_args)
        })
        .await
        .map_err(new_task_join_error)??;
        let file = Arc::new(file);

        let mut registry = self.registry.lock().expect("registry lock poisoned");
        // A concurrent acquire may have opened the same file; keep the first
        // record so everyone shares one bitmap.
        if let Some(entry) = registry.open.get(&key).cloned() {
            if file_matches(&entry.file, &args) {
                entry.refs.fetch_add(1, Ordering::Relaxed);
                return Ok(Handle {
                    registry: self.registry.clone(),
                    key,
                    entry,
                });
            }
            registry.open.remove(&key);
        }

        let entry = Arc::new(OpenEntry {
            file,
            refs: AtomicUsize::new(1),
        });
        registry.open.insert(key.clone(), entry.clone());

        Ok(Handle {
            registry: self.registry.clone(),
            key,
            entry,
        })
    }

    /// Delete the cached pair for `key` and drop its registry record.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .open
            .remove(key);

        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);
        tokio::task::spawn_blocking(move || remove_pair(&data_path, &meta_path))
            .await
            .map_err(new_task_join_error)?
    }

    /// Ensure every block intersecting `[offset, offset + len)` is complete,
    /// fetching missing ones through `fetcher` with at most one concurrent
    /// upstream fetch per (key, block) across the whole process.
    pub async fn fill_range(
        &self,
        handle: &Handle,
        offset: u64,
        len: u64,
        fetcher: &BlockFetcher,
    ) -> Result<()> {
        let Some((first, last)) = handle.file().block_span(offset, len) else {
            return Ok(());
        };
        for block in first..=last {
            self.ensure_block(handle, block, fetcher).await?;
        }
        Ok(())
    }

    /// Wait for one block, becoming the fetch leader if nobody else is.
    ///
    /// The leader spawns the fetch as a detached task: the block is written
    /// and remaining waiters are woken even if the request that started the
    /// fetch disconnects.
    pub async fn ensure_block(
        &self,
        handle: &Handle,
        block: u64,
        fetcher: &BlockFetcher,
    ) -> Result<()> {
        let mut lost_fetches = 0;
        loop {
            if handle.file().is_block_complete(block) {
                return Ok(());
            }

            let rx = {
                let mut registry = self.registry.lock().expect("registry lock poisoned");
                if handle.file().is_block_complete(block) {
                    return Ok(());
                }

                let (tx, rx) = oneshot::channel();
                match registry.in_flight.entry((handle.key.clone(), block)) {
                    Entry::Occupied(mut occupied) => occupied.get_mut().push(tx),
                    Entry::Vacant(vacant) => {
                        vacant.insert(vec![tx]);
                        self.spawn_block_fetch(
                            (handle.key.clone(), block),
                            handle.file().clone(),
                            fetcher.clone(),
                        );
                    }
                }
                rx
            };

            match rx.await {
                // Recheck against our own file: after an invalidation the
                // completed fetch may have landed in a replaced instance.
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    return Err(Error::new(err.kind(), err.to_string())
                        .with_operation("ChunkCache::ensure_block"))
                }
                // The fetch task went away without an answer; retry, bounded
                // so a crash-looping fetcher cannot spin forever.
                Err(_) => {
                    lost_fetches += 1;
                    if lost_fetches >= 3 {
                        return Err(Error::new(
                            ErrorKind::Cancelled,
                            format!("block {block} fetch abandoned repeatedly"),
                        ));
                    }
                    continue;
                }
            }
        }
    }

    fn spawn_block_fetch(&self, slot: (CacheKey, u64), file: Arc<BlockFile>, fetcher: BlockFetcher) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let block = slot.1;
            let offset = file.block_offset(block);
            let len = file.block_len(block);

            let result = match fetcher(offset, len).await {
                Ok(bytes) => {
                    let file = file.clone();
                    match tokio::task::spawn_blocking(move || file.write_block(block, &bytes)).await
                    {
                        Ok(res) => res,
                        Err(err) => Err(new_task_join_error(err)),
                    }
                }
                Err(err) => Err(err),
            };
            let result: SharedResult = result.map_err(Arc::new);

            if let Err(err) = &result {
                log::warn!("block fetch {}#{} failed: {}", slot.0.repo(), block, err);
            }

            let waiters = registry
                .lock()
                .expect("registry lock poisoned")
                .in_flight
                .remove(&slot)
                .unwrap_or_default();
            for tx in waiters {
                let _ = tx.send(result.clone());
            }
        });
    }

    /// Wait for a block someone else is fetching. Used when this request is
    /// not allowed to go upstream itself; a missing block with no fetch in
    /// flight is an offline miss.
    async fn wait_block(&self, handle: &Handle, block: u64) -> Result<()> {
        let mut lost_fetches = 0;
        loop {
            if handle.file().is_block_complete(block) {
                return Ok(());
            }

            let rx = {
                let mut registry = self.registry.lock().expect("registry lock poisoned");
                if handle.file().is_block_complete(block) {
                    return Ok(());
                }
                let slot = (handle.key.clone(), block);
                match registry.in_flight.get_mut(&slot) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                    None => {
                        return Err(Error::new(
                            ErrorKind::OfflineMiss,
                            format!("block {block} is not cached and cannot be fetched"),
                        ))
                    }
                }
            };

            match rx.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    return Err(Error::new(err.kind(), err.to_string())
                        .with_operation("ChunkCache::wait_block"))
                }
                Err(_) => {
                    lost_fetches += 1;
                    if lost_fetches >= 3 {
                        return Err(Error::new(
                            ErrorKind::Cancelled,
                            format!("block {block} fetch abandoned repeatedly"),
                        ));
                    }
                    continue;
                }
            }
        }
    }

    /// Stream `[offset, offset + len)` in order, one block at a time.
    ///
    /// Each step waits for the block to be complete (fetching it through
    /// `fetcher` when one is given), then reads the slice from disk. The
    /// consumer's pull pace is the only buffer: at most one block sits in
    /// memory per stream. A `DiskFull` from the cache downgrades that block
    /// to a direct upstream fetch so the response still completes.
    pub fn stream_range(
        self: &Arc<Self>,
        handle: Handle,
        offset: u64,
        len: u64,
        fetcher: Option<BlockFetcher>,
    ) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        struct StreamState {
            cache: Arc<ChunkCache>,
            handle: Handle,
            cursor: u64,
            remaining: u64,
            fetcher: Option<BlockFetcher>,
        }

        let state = StreamState {
            cache: self.clone(),
            handle,
            cursor: offset,
            remaining: len,
            fetcher,
        };

        futures::stream::try_unfold(state, |mut state| async move {
            if state.remaining == 0 {
                return Ok(None);
            }

            let file = state.handle.file().clone();
            let block = state.cursor / file.block_size();
            let block_end = file.block_offset(block) + file.block_len(block);
            let take = state.remaining.min(block_end - state.cursor);

            let mut direct: Option<Bytes> = None;
            if !file.is_block_complete(block) {
                match &state.fetcher {
                    Some(fetcher) => {
                        match state.cache.ensure_block(&state.handle, block, fetcher).await {
                            Ok(()) => {}
                            Err(err) if err.kind() == ErrorKind::DiskFull => {
                                log::warn!(
                                    "cache volume full, serving block {block} without tee"
                                );
                                let bytes =
                                    fetcher(file.block_offset(block), file.block_len(block))
                                        .await?;
                                direct = Some(bytes);
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    None => state.cache.wait_block(&state.handle, block).await?,
                }
            }

            let bytes = match direct {
                Some(block_bytes) => {
                    let skip = (state.cursor - file.block_offset(block)) as usize;
                    block_bytes.slice(skip..skip + take as usize)
                }
                None => {
                    let cursor = state.cursor;
                    let chunk = tokio::task::spawn_blocking(move || {
                        file.read_range(cursor, take)
                    })
                    .await
                    .map_err(new_task_join_error)??;
                    Bytes::from(chunk)
                }
            };

            state.cursor += take;
            state.remaining -= take;
            Ok(Some((bytes, state)))
        })
    }

    /// Data paths of files currently held open, for eviction to skip.
    pub fn pinned_paths(&self) -> HashSet<PathBuf> {
        let registry = self.registry.lock().expect("registry lock poisoned");
        registry
            .open
            .values()
            .map(|entry| entry.file.data_path().to_path_buf())
            .collect()
    }
}

fn file_matches(file: &BlockFile, args: &OpenArgs) -> bool {
    if file.total_size() != args.total_size {
        return false;
    }
    match (file.digest(), args.digest) {
        (Some(stored), Some(expected)) => stored == expected,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::raw::RepoType;

    fn test_key(path: &str) -> CacheKey {
        CacheKey {
            repo_type: RepoType::Model,
            org: "org".to_string(),
            name: "name".to_string(),
            commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
            path: path.to_string(),
        }
    }

    fn test_cache(dir: &tempfile::TempDir, block_size: u64) -> Arc<ChunkCache> {
        Arc::new(ChunkCache::new(
            dir.path().join("repos"),
            dir.path().join("repos/tmp"),
            block_size,
        ))
    }

    /// A fetcher over a fixed payload that counts upstream calls.
    fn counting_fetcher(payload: Vec<u8>, calls: Arc<AtomicUsize>) -> BlockFetcher {
        let payload = Bytes::from(payload);
        Arc::new(move |offset, len| {
            let payload = payload.clone();
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Let concurrent requests pile onto the same slot.
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(payload.slice(offset as usize..(offset + len) as usize))
            })
        })
    }

    fn open_args(total_size: u64, block_size: u64) -> OpenArgs {
        OpenArgs {
            total_size,
            block_size,
            digest: None,
            etag: "etag".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fill_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let payload: Vec<u8> = (0..10u8).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(payload.clone(), calls.clone());

        let handle = cache
            .acquire(test_key("weights.bin"), open_args(10, 4))
            .await
            .unwrap();

        cache.fill_range(&handle, 0, 10, &fetcher).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(handle.file().is_complete());

        // Streaming a filled file goes to disk, not upstream.
        let got: Vec<Bytes> = cache
            .stream_range(handle, 2, 7, None)
            .try_collect()
            .await
            .unwrap();
        let flat: Vec<u8> = got.concat();
        assert_eq!(flat, payload[2..9].to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stream_fetches_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let payload: Vec<u8> = (0..12u8).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(payload.clone(), calls.clone());

        let handle = cache
            .acquire(test_key("lazy.bin"), open_args(12, 4))
            .await
            .unwrap();

        // A range inside one block fetches exactly that block.
        let got: Vec<Bytes> = cache
            .stream_range(handle.clone(), 5, 2, Some(fetcher.clone()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(got.concat(), payload[5..7].to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.file().is_block_complete(1));
        assert!(!handle.file().is_block_complete(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_overlapping_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let payload: Vec<u8> = (0..16u8).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(payload.clone(), calls.clone());

        let handle_a = cache
            .acquire(test_key("shared.bin"), open_args(16, 4))
            .await
            .unwrap();
        let handle_b = handle_a.clone();

        let cache_a = cache.clone();
        let fetcher_a = fetcher.clone();
        // A wants blocks 0..=1, B wants blocks 1..=2; block 1 is shared.
        let a = tokio::spawn(async move {
            cache_a.fill_range(&handle_a, 0, 8, &fetcher_a).await
        });
        let cache_b = cache.clone();
        let fetcher_b = fetcher.clone();
        let b = tokio::spawn(async move {
            cache_b.fill_range(&handle_b, 4, 8, &fetcher_b).await
        });

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Blocks 0, 1, 2: exactly three upstream fetches despite the overlap.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_fetcher = attempts.clone();
        let fetcher: BlockFetcher = Arc::new(move |_offset, len| {
            let attempts = attempts_in_fetcher.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(
                        Error::new(ErrorKind::UpstreamNetwork, "connection reset").set_temporary()
                    );
                }
                Ok(Bytes::from(vec![7u8; len as usize]))
            })
        });

        let handle = cache
            .acquire(test_key("flaky.bin"), open_args(4, 4))
            .await
            .unwrap();

        let err = cache.fill_range(&handle, 0, 4, &fetcher).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamNetwork);

        // A later request retries the block from scratch.
        cache.fill_range(&handle, 0, 4, &fetcher).await.unwrap();
        assert!(handle.file().is_complete());
    }

    #[tokio::test]
    async fn test_wait_block_without_fetch_is_offline_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let handle = cache
            .acquire(test_key("cold.bin"), open_args(8, 4))
            .await
            .unwrap();

        let err = cache
            .stream_range(handle, 0, 8, None)
            .try_collect::<Vec<Bytes>>()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OfflineMiss);
    }

    #[tokio::test]
    async fn test_acquire_size_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher((0..10u8).collect(), calls.clone());

        let handle = cache
            .acquire(test_key("shrink.bin"), open_args(10, 4))
            .await
            .unwrap();
        cache.fill_range(&handle, 0, 10, &fetcher).await.unwrap();
        drop(handle);

        // Same commit, smaller upstream size: recreated empty.
        let handle = cache
            .acquire(test_key("shrink.bin"), open_args(8, 4))
            .await
            .unwrap();
        assert_eq!(handle.file().total_size(), 8);
        assert!(!handle.file().is_block_complete(0));
    }

    #[tokio::test]
    async fn test_handle_refcounts_pin_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let handle = cache
            .acquire(test_key("pinned.bin"), open_args(4, 4))
            .await
            .unwrap();
        assert_eq!(cache.pinned_paths().len(), 1);

        let clone = handle.clone();
        drop(handle);
        assert_eq!(cache.pinned_paths().len(), 1);

        drop(clone);
        assert!(cache.pinned_paths().is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_file_streams_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);

        let handle = cache
            .acquire(test_key("empty.bin"), open_args(0, 4))
            .await
            .unwrap();
        let got: Vec<Bytes> = cache
            .stream_range(handle, 0, 0, None)
            .try_collect()
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(&dir, 4);
        let key = test_key("gone.bin");

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting_fetcher(vec![1, 2, 3, 4], calls);
        let handle = cache.acquire(key.clone(), open_args(4, 4)).await.unwrap();
        cache.fill_range(&handle, 0, 4, &fetcher).await.unwrap();
        drop(handle);

        let data_path = cache.repos_path().join(key.data_rel_path());
        assert!(data_path.exists());
        cache.invalidate(&key).await.unwrap();
        assert!(!data_path.exists());
    }
}
