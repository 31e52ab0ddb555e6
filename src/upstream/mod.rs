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

//! The HTTP client that talks to the upstream hub and its LFS CDN.

mod error;
pub use error::from_reqwest_error;
pub use error::parse_error;

use std::sync::Arc;
use std::time::Duration;

use backon::ExponentialBuilder;
use backon::Retryable;
use bytes::Bytes;
use bytes::BytesMut;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use http::header;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use reqwest::redirect::Policy;
use reqwest::Url;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Config;
use crate::raw::digest_from_etag;
use crate::raw::is_hop_by_hop;
use crate::raw::parse_header_str;
use crate::raw::parse_header_u64;
use crate::raw::percent_encode_path;
use crate::raw::trim_etag;
use crate::raw::BytesRange;
use crate::raw::RepoType;
use crate::Error;
use crate::ErrorKind;
use crate::OfflineGuard;
use crate::Result;

/// What a HEAD against a repo file resolves to: the authoritative identity
/// of the bytes plus where to actually fetch them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStat {
    /// Authoritative total size.
    pub size: u64,
    /// The upstream entity tag, unquoted.
    pub etag: Option<String>,
    /// SHA-256 content digest in hex, when the upstream reports one.
    pub digest: Option<String>,
    /// The commit hash the revision resolved to.
    pub commit: Option<String>,
    /// URL to GET the bytes from; the CDN location for LFS files.
    pub fetch_url: String,
    /// Whether the upstream redirected to the LFS CDN.
    pub is_lfs: bool,
    /// Upstream `X-Linked-Size`, forwarded to clients.
    pub linked_size: Option<u64>,
    /// Upstream `X-Linked-ETag`, forwarded to clients.
    pub linked_etag: Option<String>,
}

impl FileStat {
    /// The digest as raw bytes, when present and well-formed.
    pub fn digest_bytes(&self) -> Option<[u8; 32]> {
        let hex64 = self.digest.as_deref()?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(hex64, &mut out).ok()?;
        Some(out)
    }
}

/// A proxied upstream response: status, filtered headers, body stream.
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: futures::stream::BoxStream<'static, Result<Bytes>>,
}

/// HTTP client for the upstream hub. Owns retry and redirect policy; checks
/// the offline guard before every request leaves the process.
pub struct UpstreamClient {
    client: reqwest::Client,
    scheme: String,
    netloc: String,
    lfs_netloc: String,
    offline: Arc<OfflineGuard>,
    backoff: ExponentialBuilder,
    redirect_limit: usize,
}

impl UpstreamClient {
    pub fn new(config: &Config, offline: Arc<OfflineGuard>) -> Result<Self> {
        // Bytes must arrive exactly as stored upstream, so auto-decompression
        // stays off; redirects are followed by hand to record CDN locations.
        let client = reqwest::ClientBuilder::new()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| {
                Error::new(ErrorKind::ConfigInvalid, "http client failed to build")
                    .set_source(err)
            })?;

        Ok(UpstreamClient {
            client,
            scheme: config.hf_scheme.clone(),
            netloc: config.hf_netloc.clone(),
            lfs_netloc: config.hf_lfs_netloc.clone(),
            offline,
            backoff: ExponentialBuilder::default()
                .with_jitter()
                .with_max_times(config.retries),
            redirect_limit: config.redirect_limit,
        })
    }

    /// URL of a repo file's resolve endpoint.
    pub fn file_url(
        &self,
        repo_type: RepoType,
        org: &str,
        name: &str,
        revision: &str,
        path: &str,
    ) -> String {
        format!(
            "{}://{}/{}{}/{}/resolve/{}/{}",
            self.scheme,
            self.netloc,
            repo_type.file_prefix(),
            org,
            name,
            percent_encode_path(revision),
            percent_encode_path(path),
        )
    }

    /// URL of an API path on the hub, e.g. `/api/models/org/name`.
    pub fn api_url(&self, path_and_query: &str) -> String {
        format!("{}://{}{}", self.scheme, self.netloc, path_and_query)
    }

    /// URL of an opaque object path on the LFS CDN.
    pub fn lfs_url(&self, path: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            self.lfs_netloc,
            percent_encode_path(path)
        )
    }

    /// HEAD a repo file, following redirects by hand so the CDN location of
    /// an LFS file is recorded. Metadata headers are accumulated across hops
    /// because the hub answers them on the redirect itself.
    pub async fn head_file(
        &self,
        repo_type: RepoType,
        org: &str,
        name: &str,
        revision: &str,
        path: &str,
        inbound: &HeaderMap,
    ) -> Result<FileStat> {
        let url = self.file_url(repo_type, org, name, revision, path);
        let headers = forward_headers(inbound);

        { || self.head_file_inner(url.clone(), headers.clone()) }
            .retry(self.backoff.clone())
            .when(|e: &Error| e.is_temporary())
            .notify(|err, dur| {
                log::warn!("head retry after {:.1}s: {err}", dur.as_secs_f64());
            })
            .await
            .map_err(|e| e.set_persistent().with_operation("UpstreamClient::head_file"))
    }

    async fn head_file_inner(&self, url: String, headers: HeaderMap) -> Result<FileStat> {
        self.offline.check()?;

        let mut stat = FileStat {
            size: 0,
            etag: None,
            digest: None,
            commit: None,
            fetch_url: url.clone(),
            is_lfs: false,
            linked_size: None,
            linked_etag: None,
        };

        let mut current = url;
        let mut size: Option<u64> = None;

        for _hop in 0..=self.redirect_limit {
            let mut headers = headers.clone();
            if stat.is_lfs {
                // Presigned CDN locations must not see the hub credential.
                headers.remove(header::AUTHORIZATION);
            }

            let resp = self
                .client
                .request(Method::HEAD, &current)
                .headers(headers)
                .send()
                .await
                .map_err(from_reqwest_error)?;

            let status = resp.status();
            let resp_headers = resp.headers();

            // The hub sets these on both final and redirect responses; first
            // one seen wins.
            if stat.commit.is_none() {
                stat.commit = parse_header_str(resp_headers, "x-repo-commit").map(str::to_string);
            }
            if stat.etag.is_none() {
                stat.etag =
                    parse_header_str(resp_headers, "etag").map(|v| trim_etag(v).to_string());
            }
            if stat.linked_etag.is_none() {
                stat.linked_etag =
                    parse_header_str(resp_headers, "x-linked-etag").map(|v| trim_etag(v).to_string());
            }
            if stat.linked_size.is_none() {
                stat.linked_size = parse_header_u64(resp_headers, "x-linked-size");
            }

            if status.is_redirection() {
                let location = parse_header_str(resp_headers, "location").ok_or_else(|| {
                    Error::new(ErrorKind::UpstreamHttp, "redirect without location")
                })?;
                current = resolve_location(&current, location)?;
                stat.is_lfs = true;
                continue;
            }

            if !status.is_success() {
                return Err(parse_error(status, &current));
            }

            size = parse_header_u64(resp_headers, "content-length").or(size);
            stat.size = stat
                .linked_size
                .or(size)
                .ok_or_else(|| Error::new(ErrorKind::UpstreamHttp, "upstream reported no size"))?;
            stat.digest = stat
                .linked_etag
                .as_deref()
                .and_then(digest_from_etag)
                .or_else(|| stat.etag.as_deref().and_then(digest_from_etag))
                .map(hex::encode);
            stat.fetch_url = current;
            return Ok(stat);
        }

        Err(Error::new(
            ErrorKind::UpstreamHttp,
            format!("more than {} redirects", self.redirect_limit),
        ))
    }

    /// Fetch exactly `[offset, offset + len)` of `url` into memory.
    ///
    /// An upstream that answers 200 where 206 was expected sent the whole
    /// file; the body is sliced on the fly, never buffered beyond the
    /// requested window.
    pub async fn fetch_block(
        &self,
        url: &str,
        offset: u64,
        len: u64,
        inbound: &HeaderMap,
    ) -> Result<Bytes> {
        let headers = forward_headers(inbound);

        {
            || async {
                let stream = self
                    .get_range_inner(url.to_string(), headers.clone(), offset, len)
                    .await?;
                let mut stream = std::pin::pin!(stream);
                let mut buf = BytesMut::with_capacity(len as usize);
                while let Some(chunk) = stream.try_next().await? {
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
        .retry(self.backoff.clone())
        .when(|e: &Error| e.is_temporary())
        .notify(|err, dur| {
            log::warn!("range retry after {:.1}s: {err}", dur.as_secs_f64());
        })
        .await
        .map_err(|e| e.set_persistent().with_operation("UpstreamClient::fetch_block"))
    }

    /// Stream `[offset, offset + len)` of `url` without buffering, for
    /// pass-through serving when the tee is disabled.
    pub async fn stream_file_range(
        &self,
        url: &str,
        offset: u64,
        len: u64,
        inbound: &HeaderMap,
    ) -> Result<futures::stream::BoxStream<'static, Result<Bytes>>> {
        let headers = forward_headers(inbound);
        self.get_range_inner(url.to_string(), headers, offset, len)
            .await
    }

    async fn get_range_inner(
        &self,
        url: String,
        mut headers: HeaderMap,
        offset: u64,
        len: u64,
    ) -> Result<futures::stream::BoxStream<'static, Result<Bytes>>> {
        self.offline.check()?;

        if len == 0 {
            return Ok(slice_body(futures::stream::empty(), 0, 0).boxed());
        }

        let range = BytesRange::new(Some(offset), Some(len));
        headers.insert(
            header::RANGE,
            range
                .to_string()
                .parse()
                .expect("range header value must be valid"),
        );

        let mut current = url;
        let mut cross_host = false;
        for _hop in 0..=self.redirect_limit {
            let mut headers = headers.clone();
            if cross_host {
                headers.remove(header::AUTHORIZATION);
            }

            let resp = self
                .client
                .request(Method::GET, &current)
                .headers(headers)
                .send()
                .await
                .map_err(from_reqwest_error)?;

            let status = resp.status();
            if status.is_redirection() {
                let location = parse_header_str(resp.headers(), "location")
                    .ok_or_else(|| {
                        Error::new(ErrorKind::UpstreamHttp, "redirect without location")
                    })?
                    .to_string();
                current = resolve_location(&current, &location)?;
                cross_host = true;
                continue;
            }

            return match status {
                StatusCode::PARTIAL_CONTENT => Ok(slice_body(resp.bytes_stream(), 0, len).boxed()),
                // Range ignored: the body is the whole file, slice it.
                StatusCode::OK => Ok(slice_body(resp.bytes_stream(), offset, len).boxed()),
                _ => Err(parse_error(status, &current)),
            };
        }

        Err(Error::new(
            ErrorKind::UpstreamHttp,
            format!("more than {} redirects", self.redirect_limit),
        ))
    }

    /// GET a metadata path on the hub, returning the bytes whole. Retried
    /// like any upstream call; 4xx surfaces immediately.
    pub async fn get_metadata(
        &self,
        path_and_query: &str,
        inbound: &HeaderMap,
    ) -> Result<(Bytes, Option<String>)> {
        let url = self.api_url(path_and_query);
        let headers = forward_headers(inbound);

        { || self.get_metadata_inner(url.clone(), headers.clone()) }
            .retry(self.backoff.clone())
            .when(|e: &Error| e.is_temporary())
            .notify(|err, dur| {
                log::warn!("metadata retry after {:.1}s: {err}", dur.as_secs_f64());
            })
            .await
            .map_err(|e| {
                e.set_persistent()
                    .with_operation("UpstreamClient::get_metadata")
            })
    }

    async fn get_metadata_inner(
        &self,
        url: String,
        headers: HeaderMap,
    ) -> Result<(Bytes, Option<String>)> {
        self.offline.check()?;

        let mut current = url;
        for _hop in 0..=self.redirect_limit {
            let resp = self
                .client
                .request(Method::GET, &current)
                .headers(headers.clone())
                .send()
                .await
                .map_err(from_reqwest_error)?;

            let status = resp.status();
            if status.is_redirection() {
                let location = parse_header_str(resp.headers(), "location")
                    .ok_or_else(|| {
                        Error::new(ErrorKind::UpstreamHttp, "redirect without location")
                    })?
                    .to_string();
                current = resolve_location(&current, &location)?;
                continue;
            }
            if !status.is_success() {
                return Err(parse_error(status, &current));
            }

            let etag = parse_header_str(resp.headers(), "etag").map(|v| trim_etag(v).to_string());
            let bytes = resp.bytes().await.map_err(from_reqwest_error)?;
            return Ok((bytes, etag));
        }

        Err(Error::new(
            ErrorKind::UpstreamHttp,
            format!("more than {} redirects", self.redirect_limit),
        ))
    }

    /// Transparent proxy for URL shapes the mirror doesn't recognise or
    /// cannot key: one hop, response forwarded as-is minus hop-by-hop
    /// headers. No retries; the client sees exactly what the upstream said.
    /// The inbound `Range` header travels along so CDN-style requests keep
    /// their semantics.
    pub async fn proxy_passthrough(
        &self,
        method: Method,
        url: &str,
        inbound: &HeaderMap,
    ) -> Result<RawResponse> {
        self.offline.check()?;

        let mut headers = forward_headers(inbound);
        if let Some(range) = inbound.get(header::RANGE) {
            headers.insert(header::RANGE, range.clone());
        }

        let resp = self
            .client
            .request(method, url)
            .headers(headers)
            .send()
            .await
            .map_err(from_reqwest_error)?;

        let status = resp.status();
        let mut headers = HeaderMap::new();
        for (name, value) in resp.headers() {
            if !is_hop_by_hop(name.as_str()) {
                headers.insert(name.clone(), value.clone());
            }
        }

        Ok(RawResponse {
            status,
            headers,
            body: resp.bytes_stream().map_err(from_reqwest_error).boxed(),
        })
    }
}

/// Pick the inbound headers that travel upstream verbatim.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in [header::AUTHORIZATION, header::USER_AGENT, header::ACCEPT] {
        if let Some(value) = inbound.get(&name) {
            out.insert(name, value.clone());
        }
    }
    out
}

fn resolve_location(base: &str, location: &str) -> Result<String> {
    let base = Url::parse(base).map_err(|err| {
        Error::new(ErrorKind::Unexpected, "request url failed to parse").set_source(err)
    })?;
    let resolved = base.join(location).map_err(|err| {
        Error::new(ErrorKind::UpstreamHttp, "redirect location failed to parse").set_source(err)
    })?;
    Ok(resolved.to_string())
}

/// Adapt an upstream body into exactly `[skip, skip + take)` of it, erroring
/// if the body ends before the window is served.
fn slice_body(
    stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    skip: u64,
    take: u64,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    let state = (Box::pin(stream), skip, take);
    futures::stream::try_unfold(state, |(mut stream, mut skip, mut take)| async move {
        if take == 0 {
            return Ok(None);
        }
        loop {
            match stream.next().await {
                Some(Ok(mut chunk)) => {
                    if skip > 0 {
                        if (chunk.len() as u64) <= skip {
                            skip -= chunk.len() as u64;
                            continue;
                        }
                        chunk = chunk.split_off(skip as usize);
                        skip = 0;
                    }
                    if chunk.is_empty() {
                        continue;
                    }
                    if (chunk.len() as u64) > take {
                        chunk = chunk.split_to(take as usize);
                    }
                    take -= chunk.len() as u64;
                    return Ok(Some((chunk, (stream, skip, take))));
                }
                Some(Err(err)) => return Err(from_reqwest_error(err)),
                None => {
                    return Err(Error::new(
                        ErrorKind::UpstreamNetwork,
                        "upstream body ended before the requested range",
                    )
                    .set_temporary())
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_slice_body_whole_file() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let sliced: Vec<Bytes> = slice_body(futures::stream::iter(chunks), 3, 5)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(sliced.concat(), b"lo wo".to_vec());
    }

    #[tokio::test]
    async fn test_slice_body_short_read_is_error() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc"))];
        let err = slice_body(futures::stream::iter(chunks), 0, 10)
            .try_collect::<Vec<Bytes>>()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamNetwork);
    }

    #[tokio::test]
    async fn test_slice_body_zero_take() {
        let sliced: Vec<Bytes> = slice_body(futures::stream::empty(), 0, 0)
            .try_collect()
            .await
            .unwrap();
        assert!(sliced.is_empty());
    }

    #[test]
    fn test_forward_headers_filters() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        inbound.insert(header::USER_AGENT, "hub-cli/1.0".parse().unwrap());
        inbound.insert(header::HOST, "mirror.local".parse().unwrap());
        inbound.insert(header::CONNECTION, "keep-alive".parse().unwrap());

        let out = forward_headers(&inbound);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key(header::AUTHORIZATION));
        assert!(out.contains_key(header::USER_AGENT));
        assert!(!out.contains_key(header::HOST));
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("https://hub.example.com/a/b", "https://cdn.example.com/x").unwrap(),
            "https://cdn.example.com/x"
        );
        assert_eq!(
            resolve_location("https://hub.example.com/a/b", "/c/d").unwrap(),
            "https://hub.example.com/c/d"
        );
    }

    #[test]
    fn test_file_url_shapes() {
        let config = Config {
            hf_netloc: "hub.example.com".to_string(),
            ..Config::default()
        };
        let client =
            UpstreamClient::new(&config, Arc::new(crate::OfflineGuard::new(false))).unwrap();

        assert_eq!(
            client.file_url(RepoType::Model, "org", "name", "main", "config.json"),
            "https://hub.example.com/org/name/resolve/main/config.json"
        );
        assert_eq!(
            client.file_url(RepoType::Dataset, "org", "name", "main", "data/x y.csv"),
            "https://hub.example.com/datasets/org/name/resolve/main/data/x%20y.csv"
        );
    }

    #[tokio::test]
    async fn test_offline_blocks_requests() {
        let config = Config::default();
        let offline = Arc::new(crate::OfflineGuard::new(true));
        let client = UpstreamClient::new(&config, offline).unwrap();

        let err = client
            .head_file(
                RepoType::Model,
                "org",
                "name",
                "main",
                "file",
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OfflineMiss);
    }
}
