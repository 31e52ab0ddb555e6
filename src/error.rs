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

//! Errors returned by hubmirror.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io;

/// Result that is a wrapper of `std::result::Result<T, hubmirror::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// ErrorKind is all kinds of errors hubmirror can return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// hubmirror doesn't know what happened here, and no actions other than
    /// returning it back. For example, an upstream internal service error.
    Unexpected,
    /// The config for a service or the whole process is invalid.
    ConfigInvalid,
    /// The inbound request is malformed: bad URL shape or bad `Range`.
    BadRequest,
    /// The requested entity doesn't exist, either locally or upstream.
    NotFound,
    /// PolicyEngine refused to proxy this repository.
    ProxyDenied,
    /// PolicyEngine refused to cache this repository. Informational, never
    /// fails a request on its own.
    CacheDenied,
    /// The requested range lies entirely outside the file.
    RangeNotSatisfiable,
    /// The upstream didn't answer within the request timeout.
    UpstreamTimeout,
    /// The upstream answered with a non-success HTTP status.
    UpstreamHttp,
    /// The upstream was unreachable at the transport level.
    UpstreamNetwork,
    /// The upstream reports a different total size than the cached file.
    SizeMismatch,
    /// A finalized file doesn't hash to the digest the upstream declared.
    DigestMismatch,
    /// The sidecar header or bitmap can't be decoded.
    BitmapCorrupt,
    /// The cache volume has no space left; caching is skipped.
    DiskFull,
    /// Offline mode is on and the requested bytes are not in the cache.
    OfflineMiss,
    /// The request was abandoned before it finished.
    Cancelled,
}

impl ErrorKind {
    /// Convert self into static str.
    pub fn into_static(self) -> &'static str {
        self.into()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.into_static())
    }
}

impl From<ErrorKind> for &'static str {
    fn from(v: ErrorKind) -> &'static str {
        match v {
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ProxyDenied => "ProxyDenied",
            ErrorKind::CacheDenied => "CacheDenied",
            ErrorKind::RangeNotSatisfiable => "RangeNotSatisfiable",
            ErrorKind::UpstreamTimeout => "UpstreamTimeout",
            ErrorKind::UpstreamHttp => "UpstreamHttp",
            ErrorKind::UpstreamNetwork => "UpstreamNetwork",
            ErrorKind::SizeMismatch => "SizeMismatch",
            ErrorKind::DigestMismatch => "DigestMismatch",
            ErrorKind::BitmapCorrupt => "BitmapCorrupt",
            ErrorKind::DiskFull => "DiskFull",
            ErrorKind::OfflineMiss => "OfflineMiss",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorStatus {
    /// Permanent means without external changes, the error never changes.
    Permanent,
    /// Temporary means this error is returned for a temporary reason and the
    /// caller is free to retry.
    Temporary,
    /// Persistent means this error used to be temporary but retries have been
    /// exhausted.
    Persistent,
}

impl Display for ErrorStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Permanent => write!(f, "permanent"),
            ErrorStatus::Temporary => write!(f, "temporary"),
            ErrorStatus::Persistent => write!(f, "persistent"),
        }
    }
}

/// Error is the error struct returned by all hubmirror functions.
pub struct Error {
    kind: ErrorKind,
    message: String,

    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<anyhow::Error>,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;

        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            write!(
                f,
                "{}",
                self.context
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }

        Ok(())
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({}) at {} => {}",
            self.kind, self.status, self.operation, self.message
        )?;
        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "Context:")?;
            for (k, v) in self.context.iter() {
                writeln!(f, "    {k}: {v}")?;
            }
        }
        if let Some(source) = &self.source {
            writeln!(f)?;
            writeln!(f, "Source: {source:?}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|v| v.as_ref())
    }
}

impl Error {
    /// Create a new Error with error kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),

            status: ErrorStatus::Permanent,
            operation: "",
            context: Vec::default(),
            source: None,
        }
    }

    /// Update error's operation.
    ///
    /// If the error already carries an operation, the old one is pushed into
    /// the context.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }

        self.operation = operation;
        self
    }

    /// Add more context in error.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set source for error.
    ///
    /// # Notes
    ///
    /// If the source has been set, we will raise a panic here.
    pub fn set_source(mut self, src: impl Into<anyhow::Error>) -> Self {
        debug_assert!(self.source.is_none(), "the source error has been set");

        self.source = Some(src.into());
        self
    }

    /// Set the error status to permanent.
    pub fn set_permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the error status to temporary: the caller is allowed to retry.
    pub fn set_temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Set the error status to persistent: retries were performed and
    /// exhausted.
    pub fn set_persistent(mut self) -> Self {
        self.status = ErrorStatus::Persistent;
        self
    }

    /// Return error's kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Check if this error is temporary.
    pub fn is_temporary(&self) -> bool {
        self.status == ErrorStatus::Temporary
    }

    /// The message alone, without operation or context, for user-facing
    /// response bodies.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::ProxyDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::UpstreamTimeout => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, err)
    }
}

/// Wrap a `std::io::Error` into a cache error, spotting disk-full conditions
/// so callers can downgrade to pass-through.
pub fn new_std_io_error(err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        // ENOSPC arrives as `Other` with raw os error 28 on unix while
        // `io::ErrorKind::StorageFull` is unstable.
        _ if err.raw_os_error() == Some(28) => ErrorKind::DiskFull,
        _ => ErrorKind::Unexpected,
    };

    Error::new(kind, "io operation failed").set_source(err)
}

/// Wrap a tokio `JoinError` from a blocking io task.
pub fn new_task_join_error(err: tokio::task::JoinError) -> Error {
    Error::new(ErrorKind::Unexpected, "io task failed to join").set_source(err)
}
