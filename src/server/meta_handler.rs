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

//! Metadata endpoints: repo info, tree listings, and small raw files, all
//! answered through the metadata cache.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use http::header;
use http::HeaderMap;
use http::Method;
use http::StatusCode;

use super::Mirror;
use crate::cache::MetaFetcher;
use crate::cache::MetaKey;
use crate::cache::MetaKind;
use crate::cache::MetaValue;
use crate::raw::percent_encode_path;
use crate::raw::RepoType;
use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// `/api/{models|datasets|spaces}/{org}/{name}[/revision/{rev}]`
pub async fn handle_api_info(
    mirror: &Arc<Mirror>,
    method: &Method,
    headers: &HeaderMap,
    repo_type: RepoType,
    org: &str,
    name: &str,
    revision: Option<&str>,
) -> Result<Response> {
    let upstream_path = match revision {
        Some(rev) => format!(
            "/api/{}/{}/{}/revision/{}",
            repo_type.as_segment(),
            org,
            name,
            percent_encode_path(rev)
        ),
        None => format!("/api/{}/{}/{}", repo_type.as_segment(), org, name),
    };

    let key = MetaKey {
        kind: MetaKind::ApiInfo,
        repo_type,
        org: org.to_string(),
        name: name.to_string(),
        extra: revision.unwrap_or("").to_string(),
    };

    serve_meta(
        mirror,
        method,
        headers,
        org,
        name,
        key,
        upstream_path,
        mirror.config.meta_ttl.api_info,
        "application/json",
    )
    .await
}

/// `/api/{models|datasets|spaces}/{org}/{name}/tree/{rev}[/{path}]`
pub async fn handle_tree(
    mirror: &Arc<Mirror>,
    method: &Method,
    headers: &HeaderMap,
    repo_type: RepoType,
    org: &str,
    name: &str,
    revision: &str,
    path: &str,
) -> Result<Response> {
    let mut upstream_path = format!(
        "/api/{}/{}/{}/tree/{}",
        repo_type.as_segment(),
        org,
        name,
        percent_encode_path(revision)
    );
    if !path.is_empty() {
        upstream_path.push('/');
        upstream_path.push_str(&percent_encode_path(path));
    }

    let key = MetaKey {
        kind: MetaKind::TreeListing,
        repo_type,
        org: org.to_string(),
        name: name.to_string(),
        extra: format!("{revision}/{path}"),
    };

    serve_meta(
        mirror,
        method,
        headers,
        org,
        name,
        key,
        upstream_path,
        mirror.config.meta_ttl.tree_listing,
        "application/json",
    )
    .await
}

/// `/{org}/{name}/raw/{rev}/{path}` — small file content, cached whole.
pub async fn handle_raw(
    mirror: &Arc<Mirror>,
    method: &Method,
    headers: &HeaderMap,
    repo_type: RepoType,
    org: &str,
    name: &str,
    revision: &str,
    path: &str,
) -> Result<Response> {
    let upstream_path = format!(
        "/{}{}/{}/raw/{}/{}",
        repo_type.file_prefix(),
        org,
        name,
        percent_encode_path(revision),
        percent_encode_path(path)
    );

    let key = MetaKey {
        kind: MetaKind::RawFile,
        repo_type,
        org: org.to_string(),
        name: name.to_string(),
        extra: format!("{revision}/{path}"),
    };

    serve_meta(
        mirror,
        method,
        headers,
        org,
        name,
        key,
        upstream_path,
        mirror.config.meta_ttl.raw_file,
        "text/plain; charset=utf-8",
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn serve_meta(
    mirror: &Arc<Mirror>,
    method: &Method,
    headers: &HeaderMap,
    org: &str,
    name: &str,
    key: MetaKey,
    upstream_path: String,
    ttl: u64,
    content_type: &'static str,
) -> Result<Response> {
    let repo = format!("{org}/{name}");
    if !mirror.policy.proxy_allowed(&repo) {
        return Err(Error::new(
            ErrorKind::ProxyDenied,
            format!("repository {repo} is not proxied"),
        ));
    }

    let upstream = mirror.upstream.clone();
    let headers_for_fetch = headers.clone();
    let fetcher: MetaFetcher = Arc::new(move || {
        let upstream = upstream.clone();
        let headers = headers_for_fetch.clone();
        let path = upstream_path.clone();
        Box::pin(async move {
            let (bytes, etag) = upstream.get_metadata(&path, &headers).await?;
            Ok(MetaValue { bytes, etag })
        })
    });

    let value = mirror.meta_cache.get_or_fetch(&key, ttl, &fetcher).await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, value.bytes.len());
    if let Some(etag) = &value.etag {
        response = response.header(header::ETAG, format!("\"{etag}\""));
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(value.bytes)
    };

    response
        .body(body)
        .map_err(|err| Error::new(ErrorKind::Unexpected, "response failed to build").set_source(err))
}
