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

//! Raw building blocks shared across components: byte ranges, repo
//! coordinates, header plumbing.

mod bytes_range;
pub use bytes_range::format_content_range;
pub use bytes_range::BytesRange;

use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use http::HeaderMap;
use once_cell::sync::Lazy;
use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// The kind of hub repository a request addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Model,
    Dataset,
    Space,
}

impl RepoType {
    /// The plural path segment used both in API URLs and in the on-disk
    /// layout, e.g. `models`.
    pub fn as_segment(&self) -> &'static str {
        match self {
            RepoType::Model => "models",
            RepoType::Dataset => "datasets",
            RepoType::Space => "spaces",
        }
    }

    /// The upstream URL prefix for repo file paths. Models live at the URL
    /// root, datasets and spaces under their segment.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            RepoType::Model => "",
            RepoType::Dataset => "datasets/",
            RepoType::Space => "spaces/",
        }
    }
}

impl Display for RepoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_segment())
    }
}

impl FromStr for RepoType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "models" | "model" => Ok(RepoType::Model),
            "datasets" | "dataset" => Ok(RepoType::Dataset),
            "spaces" | "space" => Ok(RepoType::Space),
            _ => Err(Error::new(
                ErrorKind::BadRequest,
                format!("unknown repo type: {s}"),
            )),
        }
    }
}

static COMMIT_HASH: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[0-9a-f]{40}$").expect("commit hash regex must compile"));

/// Whether a revision string is already a canonical 40-hex commit hash.
pub fn is_commit_hash(revision: &str) -> bool {
    COMMIT_HASH.is_match(revision)
}

/// Encoding set for URL path parts: keep `/` and the unreserved characters.
static PATH_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a URL path, leaving separators intact.
pub fn percent_encode_path(path: &str) -> String {
    utf8_percent_encode(path, &PATH_ENCODE_SET).to_string()
}

/// Hop-by-hop headers are stripped in both directions; they describe a single
/// transport link, not the end-to-end exchange.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header is hop-by-hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Read a header as an UTF-8 string, if present and valid.
pub fn parse_header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Read a header as a u64, if present and numeric.
pub fn parse_header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    parse_header_str(headers, name).and_then(|v| v.parse().ok())
}

/// ETag values arrive quoted and sometimes weak (`W/"..."`); compare and
/// store the bare opaque value.
pub fn trim_etag(etag: &str) -> &str {
    etag.trim_start_matches("W/").trim_matches('"')
}

/// Interpret a 64-hex etag-like value as a SHA-256 content digest.
pub fn digest_from_etag(etag: &str) -> Option<[u8; 32]> {
    let raw = trim_etag(etag);
    if raw.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(raw, &mut out).ok()?;
    Some(out)
}
