// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Dawn Mesh node entrypoint (systemd-friendly).
//! Loads config, starts the node, and drains cleanly on SIGINT/SIGTERM.

use dawn_mesh::core::config::NodeConfig;
use dawn_mesh::networking::node::{NodeError, P2pNode};
use tracing::{error, info};

// Exit codes: 0 normal, 1 configuration, 2 identity, 3 listener bind,
// 4 internal fatal.
const EXIT_CONFIG: i32 = 1;
const EXIT_IDENTITY: i32 = 2;
const EXIT_BIND: i32 = 3;
const EXIT_INTERNAL: i32 = 4;

fn init_tracing(cfg: &NodeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.logging.level.clone()));
    let file = cfg.logging.file.as_deref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(std::sync::Mutex::new)
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);
    match (cfg.logging.format.as_str(), file) {
        ("json", Some(file)) => {
            let _ = builder.json().with_writer(file).try_init();
        }
        ("json", None) => {
            let _ = builder.json().try_init();
        }
        (_, Some(file)) => {
            let _ = builder.compact().with_writer(file).try_init();
        }
        (_, None) => {
            let _ = builder.compact().try_init();
        }
    }
}

#[tokio::main]
async fn main() {
    let cfg = match NodeConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    init_tracing(&cfg);

    let node = match P2pNode::start(cfg).await {
        Ok(node) => node,
        Err(NodeError::Identity(e)) => {
            error!(err = %e, "identity load failed");
            std::process::exit(EXIT_IDENTITY);
        }
        Err(NodeError::Bind) => {
            error!("listener bind failed");
            std::process::exit(EXIT_BIND);
        }
        Err(e) => {
            error!(err = %e, "node start failed");
            std::process::exit(EXIT_INTERNAL);
        }
    };

    info!(node_id = %node.node_id(), addr = %node.advertised_address(), "dawn mesh node running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(err = %e, "signal handler failed"),
    }
    node.shutdown().await;
}
