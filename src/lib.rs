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

//! hubmirror is a self-hosted mirroring proxy for Hugging Face style hubs.
//!
//! It sits between hub-compatible clients and the upstream, serving their
//! requests transparently while building a persistent local mirror at block
//! granularity: the first download of any file populates a chunked on-disk
//! cache, and later downloads — for any byte range — are served locally.
//!
//! The crate is organised leaves-first:
//!
//! - [`cache`]: the block-granular file cache ([`cache::BlockFile`],
//!   [`cache::ChunkCache`]) and the metadata cache ([`cache::MetaCache`]).
//! - [`policy`]: per-repo allow/deny rules for proxying and caching.
//! - [`upstream`]: the HTTP client for the hub and its LFS CDN.
//! - [`server`]: the axum application, path router, and request handlers.

mod error;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;

pub mod config;
pub use config::Config;

mod offline;
pub use offline::OfflineGuard;
pub use offline::OfflineReason;

mod policy;
pub use policy::PolicyEngine;

pub mod cache;
pub mod raw;
pub mod server;
pub mod upstream;

pub use server::Mirror;
