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

use std::fmt::Display;
use std::fmt::Formatter;

use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// BytesRange(offset, size) carries a parsed `Range` request.
///
/// - `(None, None)` means the full entity.
/// - `(Some(offset), Some(size))` means `[offset, offset + size)`.
/// - `(Some(offset), None)` means `[offset, ..)`, from offset to the end.
/// - `(None, Some(size))` means the suffix form `-size`, the last `size`
///   bytes.
///
/// Offsets are absolute; sizes are byte counts, never inclusive end
/// positions. `complete` resolves the range against a concrete total size,
/// applying the clamping rules for suffix and open-ended forms.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct BytesRange(
    /// Offset of the range.
    Option<u64>,
    /// Size of the range.
    Option<u64>,
);

impl BytesRange {
    /// Create a new `BytesRange`.
    pub fn new(offset: Option<u64>, size: Option<u64>) -> Self {
        BytesRange(offset, size)
    }

    /// Get the offset of the range.
    pub fn offset(&self) -> Option<u64> {
        self.0
    }

    /// Get the size of the range.
    pub fn size(&self) -> Option<u64> {
        self.1
    }

    /// Check if this range covers the full entity.
    pub fn is_full(&self) -> bool {
        self.0.is_none() && self.1.is_none()
    }

    /// Parse an inbound `Range` header value.
    ///
    /// Only the single-range `bytes=` forms are supported; multipart ranges
    /// are rejected as `BadRequest`.
    pub fn from_header(value: &str) -> Result<Self> {
        let err = |msg: &str| {
            Error::new(ErrorKind::BadRequest, msg.to_string())
                .with_operation("BytesRange::from_header")
                .with_context("value", value)
        };

        let v = value.trim();
        let v = v
            .strip_prefix("bytes=")
            .ok_or_else(|| err("range unit must be bytes"))?;

        if v.contains(',') {
            return Err(err("multipart ranges are not supported"));
        }

        let (start, end) = v.split_once('-').ok_or_else(|| err("missing dash"))?;

        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| err("range bound is not a number"))
        };

        match (start.is_empty(), end.is_empty()) {
            // `bytes=-suffix`
            (true, false) => {
                let suffix = parse(end)?;
                if suffix == 0 {
                    return Err(err("zero suffix length"));
                }
                Ok(BytesRange::new(None, Some(suffix)))
            }
            // `bytes=a-`
            (false, true) => Ok(BytesRange::new(Some(parse(start)?), None)),
            // `bytes=a-b`, end inclusive
            (false, false) => {
                let a = parse(start)?;
                let b = parse(end)?;
                if b < a {
                    return Err(err("range end before start"));
                }
                Ok(BytesRange::new(Some(a), Some(b - a + 1)))
            }
            (true, true) => Err(err("empty range")),
        }
    }

    /// Resolve this range against the total entity size, producing the
    /// concrete `(offset, len)` to serve.
    ///
    /// Suffix ranges larger than the entity clamp to the whole entity, and
    /// `a-b` ends past the entity clamp to its end. An offset at or past the
    /// end is unsatisfiable, except on a zero-length entity where every range
    /// degenerates to `(0, 0)`.
    pub fn complete(&self, total: u64) -> Result<(u64, u64)> {
        if total == 0 {
            return Ok((0, 0));
        }

        match (self.0, self.1) {
            (None, None) => Ok((0, total)),
            (None, Some(suffix)) => {
                let len = suffix.min(total);
                Ok((total - len, len))
            }
            (Some(offset), size) => {
                if offset >= total {
                    return Err(Error::new(
                        ErrorKind::RangeNotSatisfiable,
                        format!("range offset {offset} is beyond total size {total}"),
                    ));
                }
                let len = match size {
                    Some(size) => size.min(total - offset),
                    None => total - offset,
                };
                Ok((offset, len))
            }
        }
    }
}

impl Display for BytesRange {
    /// Render as an outbound `Range` header value.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.0, self.1) {
            (None, None) => write!(f, "bytes=0-"),
            (None, Some(size)) => write!(f, "bytes=-{size}"),
            (Some(offset), None) => write!(f, "bytes={offset}-"),
            (Some(offset), Some(size)) => write!(f, "bytes={}-{}", offset, offset + size - 1),
        }
    }
}

/// Render a `Content-Range` header value for a 206 response.
pub fn format_content_range(offset: u64, len: u64, total: u64) -> String {
    debug_assert!(len > 0, "content range of an empty body");
    format!("bytes {}-{}/{}", offset, offset + len - 1, total)
}
