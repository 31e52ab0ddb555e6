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

use http::StatusCode;

use crate::Error;
use crate::ErrorKind;

/// Map an upstream non-success status into an Error.
pub fn parse_error(status: StatusCode, url: &str) -> Error {
    let (kind, retryable) = match status.as_u16() {
        404 => (ErrorKind::NotFound, false),
        // A 416 on a range we computed from the cached size means the
        // upstream file shrank; the caller invalidates and retries.
        416 => (ErrorKind::SizeMismatch, false),
        408 => (ErrorKind::UpstreamTimeout, true),
        429 => (ErrorKind::UpstreamHttp, true),
        500 | 502 | 503 | 504 => (ErrorKind::UpstreamHttp, true),
        _ => (ErrorKind::UpstreamHttp, false),
    };

    let mut err = Error::new(kind, format!("upstream returned {status}"))
        .with_context("url", url.to_string());

    if retryable {
        err = err.set_temporary();
    }

    err
}

/// Map a reqwest transport error into an Error.
pub fn from_reqwest_error(err: reqwest::Error) -> Error {
    let kind = if err.is_timeout() {
        ErrorKind::UpstreamTimeout
    } else {
        ErrorKind::UpstreamNetwork
    };

    Error::new(kind, "upstream request failed")
        .set_source(err)
        .set_temporary()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let cases = vec![
            (StatusCode::NOT_FOUND, ErrorKind::NotFound, false),
            (StatusCode::RANGE_NOT_SATISFIABLE, ErrorKind::SizeMismatch, false),
            (StatusCode::BAD_GATEWAY, ErrorKind::UpstreamHttp, true),
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::UpstreamHttp, true),
            (StatusCode::FORBIDDEN, ErrorKind::UpstreamHttp, false),
        ];

        for (status, kind, retryable) in cases {
            let err = parse_error(status, "https://example.com/x");
            assert_eq!(err.kind(), kind, "{status}");
            assert_eq!(err.is_temporary(), retryable, "{status}");
        }
    }
}
