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

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use hubmirror::Config;
use hubmirror::Mirror;

/// Self-hosted mirroring proxy for Hugging Face style hubs.
#[derive(Debug, Parser)]
#[command(name = "hubmirror", version, about)]
struct Cli {
    /// Path to a TOML config file; flags override its values.
    #[arg(short = 'c', long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind.
    #[arg(long)]
    port: Option<u16>,

    /// TLS key path, consumed by an external terminator.
    #[arg(long)]
    ssl_key: Option<PathBuf>,

    /// TLS certificate path, consumed by an external terminator.
    #[arg(long)]
    ssl_cert: Option<PathBuf>,

    /// Root of the local cache.
    #[arg(long)]
    repos_path: Option<PathBuf>,

    /// Directory of pre-cloned repositories served ahead of upstream.
    #[arg(long)]
    mirrors_path: Option<PathBuf>,

    /// Scheme for reaching the upstream hub.
    #[arg(long)]
    hf_scheme: Option<String>,

    /// Netloc of the upstream hub.
    #[arg(long)]
    hf_netloc: Option<String>,

    /// Netloc of the upstream LFS CDN.
    #[arg(long)]
    hf_lfs_netloc: Option<String>,

    /// Scheme this mirror advertises for itself.
    #[arg(long)]
    mirror_scheme: Option<String>,

    /// Netloc this mirror advertises for itself.
    #[arg(long)]
    mirror_netloc: Option<String>,

    /// Netloc this mirror advertises for LFS traffic.
    #[arg(long)]
    mirror_lfs_netloc: Option<String>,
}

impl Cli {
    fn into_config(self) -> hubmirror::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.ssl_key.is_some() {
            config.ssl_key = self.ssl_key;
        }
        if self.ssl_cert.is_some() {
            config.ssl_cert = self.ssl_cert;
        }
        if let Some(repos_path) = self.repos_path {
            config.repos_path = repos_path;
        }
        if self.mirrors_path.is_some() {
            config.mirrors_path = self.mirrors_path;
        }
        if let Some(hf_scheme) = self.hf_scheme {
            config.hf_scheme = hf_scheme;
        }
        if let Some(hf_netloc) = self.hf_netloc {
            config.hf_netloc = hf_netloc;
        }
        if let Some(hf_lfs_netloc) = self.hf_lfs_netloc {
            config.hf_lfs_netloc = hf_lfs_netloc;
        }
        if let Some(mirror_scheme) = self.mirror_scheme {
            config.mirror_scheme = mirror_scheme;
        }
        if let Some(mirror_netloc) = self.mirror_netloc {
            config.mirror_netloc = mirror_netloc;
        }
        if let Some(mirror_lfs_netloc) = self.mirror_lfs_netloc {
            config.mirror_lfs_netloc = mirror_lfs_netloc;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            log::error!("configuration rejected: {err}");
            return ExitCode::from(2);
        }
    };

    if config.ssl_key.is_some() || config.ssl_cert.is_some() {
        log::warn!("tls termination is handled by a fronting proxy; serving plain http here");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("server failed: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let mirror = Mirror::new(config)?;
    let tasks = mirror.spawn_background_tasks();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");

    axum::serve(listener, mirror.app())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in tasks {
        task.abort();
    }
    log::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("shutdown signal listener failed: {err}");
    }
}
