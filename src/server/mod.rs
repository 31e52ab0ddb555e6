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

//! The HTTP face of the mirror: one axum application whose fallback
//! dispatcher feeds every request through the path classifier.

mod file_handler;
mod meta_handler;
pub mod router;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::extract::State;
use axum::response::Response;
use http::header;
use http::HeaderMap;
use http::Method;
use http::StatusCode;
use http::Uri;

use self::file_handler::FileCoords;
use self::router::classify;
use self::router::RouteTarget;
use crate::cache::spawn_eviction_task;
use crate::cache::ChunkCache;
use crate::cache::MetaCache;
use crate::config::Config;
use crate::upstream::RawResponse;
use crate::upstream::UpstreamClient;
use crate::Error;
use crate::ErrorKind;
use crate::OfflineGuard;
use crate::PolicyEngine;
use crate::Result;

/// The long-lived services, constructed once at startup and injected into
/// every request handler.
pub struct Mirror {
    pub config: Config,
    pub chunk_cache: Arc<ChunkCache>,
    pub meta_cache: Arc<MetaCache>,
    pub upstream: Arc<UpstreamClient>,
    pub policy: PolicyEngine,
    pub offline: Arc<OfflineGuard>,
}

impl Mirror {
    /// Validate the config and build the service graph.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let offline = Arc::new(OfflineGuard::new(config.offline));
        let policy = PolicyEngine::new(&config.proxy_rules, &config.cache_rules)?;
        let chunk_cache = Arc::new(ChunkCache::new(
            config.repos_path.clone(),
            config.tmp_path(),
            config.block_size,
        ));
        let meta_cache = Arc::new(MetaCache::new(
            config.api_path(),
            config.tmp_path(),
            offline.clone(),
        ));
        let upstream = Arc::new(UpstreamClient::new(&config, offline.clone())?);

        Ok(Arc::new(Mirror {
            config,
            chunk_cache,
            meta_cache,
            upstream,
            policy,
            offline,
        }))
    }

    /// The axum application.
    pub fn app(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .fallback(dispatch)
            .with_state(self.clone())
    }

    /// Start background maintenance. Currently: eviction, when a size limit
    /// is configured.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();
        if let Some(limit) = self.config.cache_size_limit {
            tasks.push(spawn_eviction_task(
                self.chunk_cache.clone(),
                limit,
                self.config.eviction_policy,
            ));
        }
        tasks
    }
}

async fn dispatch(State(mirror): State<Arc<Mirror>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    match route(&mirror, &method, &uri, &headers).await {
        Ok(response) => {
            log::info!("{} {} -> {}", method, uri, response.status().as_u16());
            response
        }
        Err(err) => {
            let status = status_for(err.kind());
            if err.kind() == ErrorKind::Cancelled {
                log::debug!("{method} {uri} cancelled");
            } else if status.is_server_error() {
                log::warn!("{} {} -> {}: {}", method, uri, status.as_u16(), err);
            } else {
                log::info!("{} {} -> {}", method, uri, status.as_u16());
            }
            error_response(&err)
        }
    }
}

async fn route(
    mirror: &Arc<Mirror>,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response> {
    // Only GET and HEAD participate in mirroring; anything else goes
    // straight through.
    if method != Method::GET && method != Method::HEAD {
        return passthrough(mirror, method, uri, headers).await;
    }

    match classify(uri.path())? {
        RouteTarget::ApiInfo {
            repo_type,
            org,
            name,
            revision,
        } => {
            meta_handler::handle_api_info(
                mirror,
                method,
                headers,
                repo_type,
                &org,
                &name,
                revision.as_deref(),
            )
            .await
        }
        RouteTarget::TreeListing {
            repo_type,
            org,
            name,
            revision,
            path,
        } => {
            meta_handler::handle_tree(
                mirror, method, headers, repo_type, &org, &name, &revision, &path,
            )
            .await
        }
        RouteTarget::File {
            repo_type,
            org,
            name,
            revision,
            path,
            raw,
        } => {
            if raw {
                meta_handler::handle_raw(
                    mirror, method, headers, repo_type, &org, &name, &revision, &path,
                )
                .await
            } else {
                file_handler::handle(
                    mirror,
                    method,
                    headers,
                    FileCoords {
                        repo_type,
                        org,
                        name,
                        revision,
                        path,
                    },
                )
                .await
            }
        }
        // A CDN-style path carries no commit identity, so there is no
        // CacheKey for it; it streams through untouched.
        RouteTarget::Lfs { path } => {
            let url = mirror.upstream.lfs_url(&path);
            let raw = mirror
                .upstream
                .proxy_passthrough(method.clone(), &url, headers)
                .await?;
            Ok(raw_response(raw))
        }
        RouteTarget::Unknown => Err(Error::new(
            ErrorKind::NotFound,
            "unrecognized api path",
        )),
        RouteTarget::Passthrough => passthrough(mirror, method, uri, headers).await,
    }
}

async fn passthrough(
    mirror: &Arc<Mirror>,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = mirror.upstream.api_url(path_and_query);
    let raw = mirror
        .upstream
        .proxy_passthrough(method.clone(), &url, headers)
        .await?;
    Ok(raw_response(raw))
}

fn raw_response(raw: RawResponse) -> Response {
    let mut response = Response::builder().status(raw.status);
    if let Some(headers) = response.headers_mut() {
        headers.extend(raw.headers);
    }
    response
        .body(Body::from_stream(raw.body))
        .expect("proxied response must build")
}

/// HTTP status for each error kind, per the user-visible contract.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::ProxyDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
        ErrorKind::UpstreamHttp
        | ErrorKind::UpstreamNetwork
        | ErrorKind::SizeMismatch
        | ErrorKind::DigestMismatch
        | ErrorKind::BitmapCorrupt => StatusCode::BAD_GATEWAY,
        ErrorKind::UpstreamTimeout | ErrorKind::OfflineMiss => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Every non-2xx carries a short JSON body naming the error kind; context
/// and sources stay in the logs.
pub fn error_response(err: &Error) -> Response {
    let body = serde_json::json!({
        "error": err.kind().into_static(),
        "detail": err.message(),
    });

    Response::builder()
        .status(status_for(err.kind()))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("error response must build")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::ProxyDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::OfflineMiss), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(ErrorKind::UpstreamHttp), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::SizeMismatch), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(ErrorKind::RangeNotSatisfiable),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            status_for(ErrorKind::Unexpected),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let err = Error::new(ErrorKind::ProxyDenied, "repository org/name is not proxied")
            .with_context("secret", "must not leak");
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "ProxyDenied");
        assert_eq!(json["detail"], "repository org/name is not proxied");
        // The context never reaches the body.
        assert!(!body.windows(13).any(|w| w == b"must not leak"));
    }
}
