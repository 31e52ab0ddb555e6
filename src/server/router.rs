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

//! Classifies inbound URL paths into the traffic kinds the mirror serves.

use percent_encoding::percent_decode_str;

use crate::raw::RepoType;
use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// Where a request goes after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// `/api/{models|datasets|spaces}/{org}/{name}[/revision/{rev}]`
    ApiInfo {
        repo_type: RepoType,
        org: String,
        name: String,
        revision: Option<String>,
    },
    /// `/api/{models|datasets|spaces}/{org}/{name}/tree/{rev}[/{path}]`
    TreeListing {
        repo_type: RepoType,
        org: String,
        name: String,
        revision: String,
        path: String,
    },
    /// `[/datasets|/spaces]/{org}/{name}/{resolve|raw}/{rev}/{path}`
    File {
        repo_type: RepoType,
        org: String,
        name: String,
        revision: String,
        path: String,
        raw: bool,
    },
    /// `/lfs/{path}` and other CDN-style opaque object paths.
    Lfs { path: String },
    /// A recognised API prefix with an unrecognised shape.
    Unknown,
    /// Anything else: transparently proxied, never cached.
    Passthrough,
}

/// Classify a request path.
///
/// Traversal segments are rejected before any of this touches the
/// filesystem.
pub fn classify(path: &str) -> Result<RouteTarget> {
    let segments = decode_segments(path)?;
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

    match parts.as_slice() {
        ["api", repo_type, rest @ ..] => {
            let Ok(repo_type) = repo_type.parse::<RepoType>() else {
                return Ok(RouteTarget::Unknown);
            };
            Ok(classify_api(repo_type, rest))
        }
        ["lfs", rest @ ..] if !rest.is_empty() => Ok(RouteTarget::Lfs {
            path: rest.join("/"),
        }),
        ["datasets", rest @ ..] => Ok(classify_file(RepoType::Dataset, rest)),
        ["spaces", rest @ ..] => Ok(classify_file(RepoType::Space, rest)),
        rest => Ok(classify_file(RepoType::Model, rest)),
    }
}

fn classify_api(repo_type: RepoType, rest: &[&str]) -> RouteTarget {
    match rest {
        [org, name] => RouteTarget::ApiInfo {
            repo_type,
            org: org.to_string(),
            name: name.to_string(),
            revision: None,
        },
        [org, name, "revision", revision] => RouteTarget::ApiInfo {
            repo_type,
            org: org.to_string(),
            name: name.to_string(),
            revision: Some(revision.to_string()),
        },
        [org, name, "tree", revision, path @ ..] => RouteTarget::TreeListing {
            repo_type,
            org: org.to_string(),
            name: name.to_string(),
            revision: revision.to_string(),
            path: path.join("/"),
        },
        _ => RouteTarget::Unknown,
    }
}

fn classify_file(repo_type: RepoType, rest: &[&str]) -> RouteTarget {
    match rest {
        [org, name, action @ ("resolve" | "raw"), revision, path @ ..] if !path.is_empty() => {
            RouteTarget::File {
                repo_type,
                org: org.to_string(),
                name: name.to_string(),
                revision: revision.to_string(),
                path: path.join("/"),
                raw: *action == "raw",
            }
        }
        _ => RouteTarget::Passthrough,
    }
}

fn decode_segments(path: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        let decoded = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| Error::new(ErrorKind::BadRequest, "path is not valid utf-8"))?;
        if decoded == "." || decoded == ".." || decoded.contains('\0') {
            return Err(Error::new(
                ErrorKind::BadRequest,
                "path contains traversal segments",
            ));
        }
        out.push(decoded.into_owned());
    }
    Ok(out)
}
