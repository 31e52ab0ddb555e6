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

//! End-to-end behavior of the mirror against a loopback stub hub.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::extract::Request;
use axum::extract::State;
use axum::response::Response;
use axum::Router;
use hubmirror::config::RuleConfig;
use hubmirror::Config;
use hubmirror::Mirror;
use hubmirror::OfflineReason;
use tower::ServiceExt;

const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

/// A minimal hub: serves resolve/raw/api paths over one fixed file body and
/// counts what the mirror actually asks for.
struct Stub {
    body: Vec<u8>,
    heads: AtomicUsize,
    gets: AtomicUsize,
    api_gets: AtomicUsize,
}

impl Stub {
    fn new(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Stub {
            body,
            heads: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            api_gets: AtomicUsize::new(0),
        })
    }
}

async fn stub_handler(State(stub): State<Arc<Stub>>, req: Request) -> Response {
    let path = req.uri().path().to_string();

    if path.starts_with("/api/") {
        stub.api_gets.fetch_add(1, Ordering::SeqCst);
        let body = format!(r#"{{"id":"org/name","sha":"{COMMIT}"}}"#);
        return Response::builder()
            .header("content-type", "application/json")
            .header("etag", "\"api-etag\"")
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap();
    }

    if path.contains("/raw/") {
        let body = "raw readme";
        return Response::builder()
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap();
    }

    if !path.contains("/resolve/") {
        return Response::builder()
            .status(404)
            .body(Body::empty())
            .unwrap();
    }

    let total = stub.body.len() as u64;

    if req.method() == http::Method::HEAD {
        stub.heads.fetch_add(1, Ordering::SeqCst);
        return Response::builder()
            .header("x-repo-commit", COMMIT)
            .header("etag", "\"upstream-weak-etag\"")
            .header("content-length", total)
            .header("accept-ranges", "bytes")
            .body(Body::empty())
            .unwrap();
    }

    stub.gets.fetch_add(1, Ordering::SeqCst);

    let range = req
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v));
    match range {
        Some((start, end)) if start < total => {
            let end = end.min(total - 1);
            let slice = stub.body[start as usize..=end as usize].to_vec();
            Response::builder()
                .status(206)
                .header("content-range", format!("bytes {start}-{end}/{total}"))
                .header("content-length", slice.len())
                .body(Body::from(slice))
                .unwrap()
        }
        Some(_) => Response::builder()
            .status(416)
            .body(Body::empty())
            .unwrap(),
        None => Response::builder()
            .header("content-length", total)
            .body(Body::from(stub.body.clone()))
            .unwrap(),
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn spawn_stub(stub: Arc<Stub>) -> SocketAddr {
    let app = Router::new().fallback(stub_handler).with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn mirror_config(dir: &tempfile::TempDir, upstream: SocketAddr) -> Config {
    Config {
        repos_path: dir.path().join("repos"),
        hf_scheme: "http".to_string(),
        hf_netloc: upstream.to_string(),
        hf_lfs_netloc: upstream.to_string(),
        block_size: 4,
        ..Config::default()
    }
}

async fn get(app: &Router, uri: &str) -> (http::StatusCode, http::HeaderMap, Vec<u8>) {
    request(app, http::Method::GET, uri, None).await
}

async fn request(
    app: &Router,
    method: http::Method,
    uri: &str,
    range: Option<&str>,
) -> (http::StatusCode, http::HeaderMap, Vec<u8>) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(range) = range {
        req = req.header("range", range);
    }
    let response = app
        .clone()
        .oneshot(req.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();
    (status, headers, body)
}

fn readme_body() -> Vec<u8> {
    let mut body = b"hello".to_vec();
    body.resize(42, b'x');
    body
}

#[tokio::test]
async fn test_cold_fetch_then_warm_offline_range() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub.clone()).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    // Cold: the whole file comes from upstream and lands in the cache.
    let (status, headers, body) = get(&app, "/org/name/resolve/main/README.md").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, readme_body());
    assert_eq!(headers["etag"], format!("\"{COMMIT}\""));
    assert_eq!(headers["x-repo-commit"], COMMIT);
    assert_eq!(headers["content-length"], "42");
    assert_eq!(stub.heads.load(Ordering::SeqCst), 1);

    let data_path = dir
        .path()
        .join(format!("repos/models/org/name/blocks/{COMMIT}/README.md.bin"));
    assert!(data_path.exists());

    // Warm + offline: a range is synthesized locally, zero upstream calls.
    let gets_before = stub.gets.load(Ordering::SeqCst);
    mirror.offline.set_offline(OfflineReason::Operator);

    let (status, headers, body) = request(
        &app,
        http::Method::GET,
        "/org/name/resolve/main/README.md",
        Some("bytes=0-4"),
    )
    .await;
    assert_eq!(status, http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, b"hello");
    assert_eq!(headers["content-range"], "bytes 0-4/42");
    assert_eq!(headers["content-length"], "5");
    assert_eq!(stub.gets.load(Ordering::SeqCst), gets_before);
    assert_eq!(stub.heads.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_range_additivity() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let uri = "/org/name/resolve/main/README.md";
    let mut assembled = Vec::new();
    for range in ["bytes=0-9", "bytes=10-20", "bytes=21-"] {
        let (status, _, body) = request(&app, http::Method::GET, uri, Some(range)).await;
        assert_eq!(status, http::StatusCode::PARTIAL_CONTENT);
        assembled.extend_from_slice(&body);
    }
    assert_eq!(assembled, readme_body());

    // Suffix form, clamped when larger than the file.
    let (status, headers, body) = request(&app, http::Method::GET, uri, Some("bytes=-5")).await;
    assert_eq!(status, http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, b"xxxxx");
    assert_eq!(headers["content-range"], "bytes 37-41/42");

    let (status, _, body) = request(&app, http::Method::GET, uri, Some("bytes=-100")).await;
    assert_eq!(status, http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(body.len(), 42);

    Ok(())
}

#[tokio::test]
async fn test_unsatisfiable_and_malformed_ranges() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let uri = "/org/name/resolve/main/README.md";
    let (status, _, body) = request(&app, http::Method::GET, uri, Some("bytes=100-200")).await;
    assert_eq!(status, http::StatusCode::RANGE_NOT_SATISFIABLE);
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["error"], "RangeNotSatisfiable");

    let (status, _, _) = request(&app, http::Method::GET, uri, Some("bytes=5-2")).await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn test_head_answers_without_body() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub.clone()).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let (status, headers, body) = request(
        &app,
        http::Method::HEAD,
        "/org/name/resolve/main/README.md",
        None,
    )
    .await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(headers["content-length"], "42");
    assert_eq!(headers["etag"], format!("\"{COMMIT}\""));
    assert!(body.is_empty());
    // A HEAD never opens the byte stream.
    assert_eq!(stub.gets.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn test_policy_denial_is_403_without_upstream_traffic() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub.clone()).await;
    let dir = tempfile::tempdir()?;

    let mut config = mirror_config(&dir, addr);
    config.proxy_rules = vec![RuleConfig {
        repo: "adept/*".to_string(),
        use_regex: false,
        allow: false,
    }];
    let mirror = Mirror::new(config)?;
    let app = mirror.app();

    let (status, _, body) = get(&app, "/adept/fuyu-8b/resolve/main/config.json").await;
    assert_eq!(status, http::StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["error"], "ProxyDenied");

    assert_eq!(stub.heads.load(Ordering::SeqCst), 0);
    assert_eq!(stub.gets.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("repos/models/adept").exists());

    // Other repos still flow.
    let (status, _, _) = get(&app, "/org/name/resolve/main/README.md").await;
    assert_eq!(status, http::StatusCode::OK);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_overlapping_ranges_share_fetches() -> Result<()> {
    let body: Vec<u8> = (0..12u8).collect();
    let stub = Stub::new(body.clone());
    let addr = spawn_stub(stub.clone()).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let uri = "/org/name/resolve/main/data.bin";
    let app_a = app.clone();
    let app_b = app.clone();
    let a = tokio::spawn(async move {
        request(&app_a, http::Method::GET, uri, Some("bytes=0-7")).await
    });
    let b = tokio::spawn(async move {
        request(&app_b, http::Method::GET, uri, Some("bytes=4-11")).await
    });

    let (status_a, _, body_a) = a.await?;
    let (status_b, _, body_b) = b.await?;
    assert_eq!(status_a, http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(status_b, http::StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_a, body[0..8].to_vec());
    assert_eq!(body_b, body[4..12].to_vec());

    // Blocks 0, 1, 2 with block 1 shared: exactly three upstream range GETs.
    assert_eq!(stub.gets.load(Ordering::SeqCst), 3);

    Ok(())
}

#[tokio::test]
async fn test_api_info_cached_and_served_offline() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub.clone()).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let (status, headers, body) = get(&app, "/api/models/org/name").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(headers["content-type"], "application/json");
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["sha"], COMMIT);
    assert_eq!(stub.api_gets.load(Ordering::SeqCst), 1);

    mirror.offline.set_offline(OfflineReason::Operator);

    // Cached info still answers; an uncached one is an offline miss.
    let (status, _, offline_body) = get(&app, "/api/models/org/name").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(offline_body, body);
    assert_eq!(stub.api_gets.load(Ordering::SeqCst), 1);

    let (status, _, body) = get(&app, "/api/models/other/repo").await;
    assert_eq!(status, http::StatusCode::GATEWAY_TIMEOUT);
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["error"], "OfflineMiss");

    Ok(())
}

#[tokio::test]
async fn test_raw_file_flow() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let (status, _, body) = get(&app, "/org/name/raw/main/README.md").await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body, b"raw readme");

    Ok(())
}

#[tokio::test]
async fn test_unknown_api_shape_is_404() -> Result<()> {
    let stub = Stub::new(readme_body());
    let addr = spawn_stub(stub).await;
    let dir = tempfile::tempdir()?;
    let mirror = Mirror::new(mirror_config(&dir, addr))?;
    let app = mirror.app();

    let (status, _, _) = get(&app, "/api/models/org/name/branches").await;
    assert_eq!(status, http::StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_upstream_size_shrink_recreates_cache() -> Result<()> {
    // Same commit, upstream first says 12 bytes, later 8.
    let body: Vec<u8> = (0..12u8).collect();
    let stub = Stub::new(body.clone());
    let addr = spawn_stub(stub.clone()).await;
    let dir = tempfile::tempdir()?;

    let mut config = mirror_config(&dir, addr);
    // TTL 0 so the second request re-resolves against the shrunken upstream.
    config.meta_ttl.resolve_head = 0;
    let mirror = Mirror::new(config)?;
    let app = mirror.app();

    let uri = "/org/name/resolve/main/data.bin";
    let (status, _, got) = get(&app, uri).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(got, body);

    // Shrink the upstream by pointing the mirror at a fresh stub.
    let short: Vec<u8> = (0..8u8).collect();
    let stub_short = Stub::new(short.clone());
    let addr_short = spawn_stub(stub_short).await;
    let mut config = mirror_config(&dir, addr_short);
    config.meta_ttl.resolve_head = 0;
    let mirror = Mirror::new(config)?;
    let app = mirror.app();

    let (status, headers, got) = get(&app, uri).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(headers["content-length"], "8");
    assert_eq!(got, short);

    Ok(())
}
