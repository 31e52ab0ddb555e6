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

//! The per-request state machine behind `resolve` file traffic.
//!
//! For each `(repo, revision, path, range)` it resolves the revision to a
//! commit, checks policy, opens the BlockFile, and streams the requested
//! window block by block: cached blocks from disk, missing blocks fetched
//! through the single-flight registry and teed to disk on the way through.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::header;
use http::HeaderMap;
use http::Method;
use http::StatusCode;

use super::Mirror;
use crate::cache::BlockFetcher;
use crate::cache::CacheKey;
use crate::cache::MetaFetcher;
use crate::cache::MetaKey;
use crate::cache::MetaKind;
use crate::cache::MetaValue;
use crate::cache::OpenArgs;
use crate::raw::format_content_range;
use crate::raw::is_commit_hash;
use crate::raw::BytesRange;
use crate::raw::RepoType;
use crate::upstream::FileStat;
use crate::upstream::UpstreamClient;
use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// Commit-pinned resolutions are immutable; cache them effectively forever.
const COMMIT_PIN_TTL: u64 = u64::MAX;

/// Coordinates of one file request, as produced by the router.
#[derive(Clone, Debug)]
pub struct FileCoords {
    pub repo_type: RepoType,
    pub org: String,
    pub name: String,
    pub revision: String,
    pub path: String,
}

impl FileCoords {
    fn repo(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }
}

/// Serve `GET`/`HEAD` for a `resolve` path.
pub async fn handle(
    mirror: &Arc<Mirror>,
    method: &Method,
    headers: &HeaderMap,
    coords: FileCoords,
) -> Result<Response> {
    // Denied repos never cause upstream traffic, not even for resolution.
    if !mirror.policy.proxy_allowed(&coords.repo()) {
        return Err(Error::new(
            ErrorKind::ProxyDenied,
            format!("repository {} is not proxied", coords.repo()),
        ));
    }

    // Integrity failures invalidate the local state and run the cycle once
    // more; a second failure surfaces.
    let mut attempt = 0;
    loop {
        match try_handle(mirror, method, headers, &coords).await {
            Err(err)
                if attempt == 0
                    && matches!(
                        err.kind(),
                        ErrorKind::SizeMismatch
                            | ErrorKind::DigestMismatch
                            | ErrorKind::BitmapCorrupt
                    ) =>
            {
                log::warn!(
                    "cache integrity failure for {}/{} ({}), invalidating and retrying",
                    coords.repo(),
                    coords.path,
                    err.kind()
                );
                invalidate_request_state(mirror, &coords).await?;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn try_handle(
    mirror: &Arc<Mirror>,
    method: &Method,
    headers: &HeaderMap,
    coords: &FileCoords,
) -> Result<Response> {
    let stat = resolve_stat(mirror, headers, coords).await?;

    let commit = match &stat.commit {
        Some(commit) => commit.clone(),
        None if is_commit_hash(&coords.revision) => coords.revision.clone(),
        None => {
            return Err(Error::new(
                ErrorKind::UpstreamHttp,
                "upstream did not resolve the revision to a commit",
            ))
        }
    };

    let range_header = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str().map_err(|_| {
                Error::new(ErrorKind::BadRequest, "range header is not valid ascii")
            })
        })
        .transpose()?;
    let range = match range_header {
        Some(value) => BytesRange::from_header(value)?,
        None => BytesRange::default(),
    };
    let (offset, len) = range.complete(stat.size)?;

    // 206 only when the client actually asked for a range of a non-empty
    // file; an empty file answers 200 with an empty body.
    let partial = range_header.is_some() && stat.size > 0;

    let mut response = Response::builder()
        .status(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ETAG, format!("\"{commit}\""))
        .header("x-repo-commit", &commit);
    if partial {
        response = response.header(
            header::CONTENT_RANGE,
            format_content_range(offset, len, stat.size),
        );
    }
    if let Some(linked_etag) = &stat.linked_etag {
        response = response.header("x-linked-etag", format!("\"{linked_etag}\""));
    }
    if let Some(linked_size) = stat.linked_size {
        response = response.header("x-linked-size", linked_size);
    }

    if method == Method::HEAD {
        return response
            .body(Body::empty())
            .map_err(|err| Error::new(ErrorKind::Unexpected, "response failed to build").set_source(err));
    }

    let cache_flag = mirror.policy.cache_allowed(&coords.repo()) && !mirror.offline.is_offline();

    let body = if cache_flag {
        cached_body(mirror, headers, coords, &stat, commit, offset, len).await?
    } else if mirror.offline.is_offline() {
        // Offline but cache-readable: serve whatever blocks exist, without
        // any fetcher behind the stream.
        offline_body(mirror, coords, &stat, commit, offset, len).await?
    } else {
        // Cache-denied: pass bytes through, no tee, no disk writes.
        mirror
            .upstream
            .stream_file_range(&stat.fetch_url, offset, len, headers)
            .await?
    };

    response
        .body(Body::from_stream(body))
        .map_err(|err| Error::new(ErrorKind::Unexpected, "response failed to build").set_source(err))
}

async fn cached_body(
    mirror: &Arc<Mirror>,
    headers: &HeaderMap,
    coords: &FileCoords,
    stat: &FileStat,
    commit: String,
    offset: u64,
    len: u64,
) -> Result<BoxStream<'static, Result<Bytes>>> {
    let key = CacheKey {
        repo_type: coords.repo_type,
        org: coords.org.clone(),
        name: coords.name.clone(),
        commit,
        path: coords.path.clone(),
    };

    let handle = mirror
        .chunk_cache
        .acquire(
            key.clone(),
            OpenArgs {
                total_size: stat.size,
                block_size: mirror.chunk_cache.block_size(),
                digest: stat.digest_bytes(),
                etag: stat.etag.clone().unwrap_or_default(),
            },
        )
        .await?;

    let fetcher = block_fetcher(
        mirror.upstream.clone(),
        stat.fetch_url.clone(),
        headers.clone(),
    );

    let finalize_handle = handle.clone();
    let chunk_cache = mirror.chunk_cache.clone();
    let data = mirror
        .chunk_cache
        .stream_range(handle, offset, len, Some(fetcher));

    // After the window is streamed, verify the digest once the file is
    // complete. A mismatch deletes the file and aborts the response tail.
    let tail = futures::stream::try_unfold(
        (chunk_cache, finalize_handle, key),
        |(cache, handle, key)| async move {
            if !handle.file().is_complete() {
                return Ok(None);
            }
            let file = handle.file().clone();
            let outcome = tokio::task::spawn_blocking(move || file.finalize())
                .await
                .map_err(crate::error::new_task_join_error)?;
            match outcome {
                Ok(()) => Ok(None),
                Err(err) => {
                    cache.invalidate(&key).await?;
                    Err(err)
                }
            }
        },
    );

    Ok(data.chain(tail).boxed())
}

async fn offline_body(
    mirror: &Arc<Mirror>,
    coords: &FileCoords,
    stat: &FileStat,
    commit: String,
    offset: u64,
    len: u64,
) -> Result<BoxStream<'static, Result<Bytes>>> {
    let key = CacheKey {
        repo_type: coords.repo_type,
        org: coords.org.clone(),
        name: coords.name.clone(),
        commit,
        path: coords.path.clone(),
    };

    let handle = mirror
        .chunk_cache
        .acquire(
            key,
            OpenArgs {
                total_size: stat.size,
                block_size: mirror.chunk_cache.block_size(),
                digest: stat.digest_bytes(),
                etag: stat.etag.clone().unwrap_or_default(),
            },
        )
        .await?;

    // Fail before any byte is sent rather than truncating mid-body.
    if handle.file().has_range(offset, len) != crate::cache::RangePresence::Complete {
        return Err(Error::new(
            ErrorKind::OfflineMiss,
            "requested bytes are not cached and offline mode forbids fetching",
        ));
    }

    Ok(mirror
        .chunk_cache
        .stream_range(handle, offset, len, None)
        .boxed())
}

/// Resolve `(revision, path)` to the authoritative file identity, through
/// the metadata cache. Commit-pinned revisions never expire; branch and tag
/// revisions use the configured TTL.
pub async fn resolve_stat(
    mirror: &Arc<Mirror>,
    headers: &HeaderMap,
    coords: &FileCoords,
) -> Result<FileStat> {
    let meta_key = MetaKey {
        kind: MetaKind::ResolveHead,
        repo_type: coords.repo_type,
        org: coords.org.clone(),
        name: coords.name.clone(),
        extra: format!("{}/{}", coords.revision, coords.path),
    };

    let ttl = if is_commit_hash(&coords.revision) {
        COMMIT_PIN_TTL
    } else {
        mirror.config.meta_ttl.resolve_head
    };

    let upstream = mirror.upstream.clone();
    let coords_for_fetch = coords.clone();
    let headers_for_fetch = headers.clone();
    let fetcher: MetaFetcher = Arc::new(move || {
        let upstream = upstream.clone();
        let coords = coords_for_fetch.clone();
        let headers = headers_for_fetch.clone();
        Box::pin(async move {
            let stat = upstream
                .head_file(
                    coords.repo_type,
                    &coords.org,
                    &coords.name,
                    &coords.revision,
                    &coords.path,
                    &headers,
                )
                .await?;
            let etag = stat.etag.clone();
            let bytes = serde_json::to_vec(&stat).map_err(|err| {
                Error::new(ErrorKind::Unexpected, "file stat failed to serialize").set_source(err)
            })?;
            Ok(MetaValue {
                bytes: Bytes::from(bytes),
                etag,
            })
        })
    });

    let value = mirror
        .meta_cache
        .get_or_fetch(&meta_key, ttl, &fetcher)
        .await?;

    serde_json::from_slice(&value.bytes).map_err(|err| {
        Error::new(ErrorKind::Unexpected, "cached file stat failed to parse").set_source(err)
    })
}

/// Throw away the local state a failed request cycle depends on: the
/// resolution entry and, when the revision pins a commit, the block file.
async fn invalidate_request_state(mirror: &Arc<Mirror>, coords: &FileCoords) -> Result<()> {
    let meta_key = MetaKey {
        kind: MetaKind::ResolveHead,
        repo_type: coords.repo_type,
        org: coords.org.clone(),
        name: coords.name.clone(),
        extra: format!("{}/{}", coords.revision, coords.path),
    };
    mirror.meta_cache.invalidate(&meta_key).await?;

    if is_commit_hash(&coords.revision) {
        let key = CacheKey {
            repo_type: coords.repo_type,
            org: coords.org.clone(),
            name: coords.name.clone(),
            commit: coords.revision.clone(),
            path: coords.path.clone(),
        };
        mirror.chunk_cache.invalidate(&key).await?;
    }
    Ok(())
}

fn block_fetcher(
    upstream: Arc<UpstreamClient>,
    url: String,
    inbound: HeaderMap,
) -> BlockFetcher {
    Arc::new(move |offset, len| {
        let upstream = upstream.clone();
        let url = url.clone();
        let inbound = inbound.clone();
        Box::pin(async move { upstream.fetch_block(&url, offset, len, &inbound).await })
    })
}
