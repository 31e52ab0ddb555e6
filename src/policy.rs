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

//! Per-repo allow/deny rules for proxying and caching.

use regex::Regex;

use crate::config::RuleConfig;
use crate::Error;
use crate::ErrorKind;
use crate::Result;

/// A compiled rule: an anchored pattern and its verdict.
#[derive(Debug)]
struct Rule {
    pattern: Regex,
    allow: bool,
}

impl Rule {
    fn compile(config: &RuleConfig) -> Result<Self> {
        let source = if config.use_regex {
            anchor(&config.repo)
        } else {
            glob_to_regex(&config.repo)
        };

        let pattern = Regex::new(&source).map_err(|err| {
            Error::new(ErrorKind::ConfigInvalid, "policy rule failed to compile")
                .with_context("repo", &config.repo)
                .set_source(err)
        })?;

        Ok(Rule {
            pattern,
            allow: config.allow,
        })
    }
}

/// Wrap a user regex so it must match the whole `org/name`, not a substring.
fn anchor(source: &str) -> String {
    let source = source.strip_prefix('^').unwrap_or(source);
    let source = source.strip_suffix('$').unwrap_or(source);
    format!("^(?:{source})$")
}

/// Compile a glob with `*` and `?` into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Evaluates ordered allow/deny rule lists for proxying and caching.
///
/// Rules are checked in declaration order, the first matching rule wins, and
/// no match means allow. The engine holds no mutable state; both queries are
/// pure functions of the compiled rules and the repo name.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    proxy: Vec<Rule>,
    cache: Vec<Rule>,
}

impl PolicyEngine {
    /// Compile rule lists. Invalid patterns fail construction, not lookup.
    pub fn new(proxy_rules: &[RuleConfig], cache_rules: &[RuleConfig]) -> Result<Self> {
        Ok(PolicyEngine {
            proxy: proxy_rules.iter().map(Rule::compile).collect::<Result<_>>()?,
            cache: cache_rules.iter().map(Rule::compile).collect::<Result<_>>()?,
        })
    }

    /// Whether `org/name` may be proxied upstream at all.
    pub fn proxy_allowed(&self, repo: &str) -> bool {
        Self::evaluate(&self.proxy, repo)
    }

    /// Whether bytes of `org/name` may be written to the local cache. A
    /// denial only skips the tee; the request is still served pass-through.
    pub fn cache_allowed(&self, repo: &str) -> bool {
        Self::evaluate(&self.cache, repo)
    }

    fn evaluate(rules: &[Rule], repo: &str) -> bool {
        for rule in rules {
            if rule.pattern.is_match(repo) {
                return rule.allow;
            }
        }
        true
    }
}
