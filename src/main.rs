// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! dawei server entrypoint.

use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dawei_node::AppState;

#[derive(Parser, Debug)]
#[command(name = "dawei", about = "Workspace-scoped AI agent orchestration server")]
struct Args {
    /// Address to bind the WebSocket server on.
    #[arg(long, default_value = "127.0.0.1:8787", env = "DAWEI_LISTEN")]
    listen: SocketAddr,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info", env = "DAWEI_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let state = AppState::new();
    dawei_node::serve(args.listen, state).await
}
