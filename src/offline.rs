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

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// Why outbound traffic is forbidden.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OfflineReason {
    /// Switched on by configuration at startup.
    Config,
    /// Switched on by an operator at runtime.
    Operator,
}

const ONLINE: u8 = 0;
const OFFLINE_CONFIG: u8 = 1;
const OFFLINE_OPERATOR: u8 = 2;

/// Global toggle that forbids upstream contact.
///
/// When offline, metadata reads are served from the cache only and block
/// fetches fail with `OfflineMiss`; blocks already on disk serve normally.
#[derive(Debug, Default)]
pub struct OfflineGuard {
    state: AtomicU8,
}

impl OfflineGuard {
    /// Create a guard, optionally starting offline per config.
    pub fn new(offline: bool) -> Self {
        let guard = OfflineGuard::default();
        if offline {
            guard.set_offline(OfflineReason::Config);
        }
        guard
    }

    /// Whether outbound traffic is currently forbidden.
    pub fn is_offline(&self) -> bool {
        self.state.load(Ordering::Acquire) != ONLINE
    }

    /// The reason for being offline, if offline.
    pub fn reason(&self) -> Option<OfflineReason> {
        match self.state.load(Ordering::Acquire) {
            OFFLINE_CONFIG => Some(OfflineReason::Config),
            OFFLINE_OPERATOR => Some(OfflineReason::Operator),
            _ => None,
        }
    }

    /// Forbid outbound traffic.
    pub fn set_offline(&self, reason: OfflineReason) {
        let state = match reason {
            OfflineReason::Config => OFFLINE_CONFIG,
            OfflineReason::Operator => OFFLINE_OPERATOR,
        };
        self.state.store(state, Ordering::Release);
    }

    /// Allow outbound traffic again.
    pub fn set_online(&self) {
        self.state.store(ONLINE, Ordering::Release);
    }

    /// Fail with `OfflineMiss` when outbound traffic is forbidden. Every
    /// upstream call checks this before leaving the process.
    pub fn check(&self) -> Result<()> {
        if self.is_offline() {
            return Err(Error::new(
                ErrorKind::OfflineMiss,
                "offline mode forbids upstream contact",
            ));
        }
        Ok(())
    }
}
