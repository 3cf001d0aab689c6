// Copyright 2025 Tether Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Tether CLI Entry Point
//!
//! Loads a JavaScript file into the script host and serves until SIGINT or
//! SIGTERM. On a signal the script's `onApplicationQuit(signal)` hook runs,
//! queued work drains and the process exits.
//!
//! ## Usage
//!
//! ```bash
//! # Run a script
//! tether run -s echo.js
//!
//! # Log server counters every 30 seconds
//! tether run -s echo.js --stats-interval 30
//!
//! # Verbose logging
//! RUST_LOG=debug tether run -s echo.js
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use tether_metrics::MetricsRegistry;
use tether_server::{Coordinator, CoordinatorConfig, ScriptHost, ServerContext, ShutdownCoordinator};

#[derive(FromArgs)]
/// Tether - script-driven TCP server
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
}

/// Arguments for running a script.
///
/// The script is evaluated once on the coordinator thread. Listeners it
/// starts with `net.listen` keep the process alive until a signal arrives.
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// run a script until SIGINT or SIGTERM
struct RunArgs {
    /// path to the JavaScript file to load
    #[argh(option, short = 's')]
    script: String,

    /// seconds between stats log lines, 0 disables
    #[argh(option, long = "stats-interval", default = "10")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO, RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let script = PathBuf::from(&args.script);
    tracing::info!("Starting tether with script: {}", script.display());

    let runtime = tokio::runtime::Handle::current();
    let path = script.clone();
    let coordinator = Coordinator::spawn(CoordinatorConfig::new(), move |handle| {
        ScriptHost::load(ServerContext::new(handle.clone(), runtime), path)
    })
    .with_context(|| format!("Failed to start script {}", script.display()))?;
    tracing::info!("Script loaded");

    let handle = coordinator.handle();
    if args.stats_interval > 0 {
        tokio::spawn(log_stats(
            Arc::clone(handle.metrics()),
            Duration::from_secs(args.stats_interval),
        ));
    }

    let shutdown = ShutdownCoordinator::new(handle);
    shutdown.run().await.context("Shutdown failed")?;

    tokio::task::spawn_blocking(move || coordinator.join())
        .await
        .context("Failed to join coordinator thread")?;

    tracing::info!("Shutdown complete");
    std::process::exit(0);
}

/// Logs a JSON metrics snapshot every `interval`.
async fn log_stats(metrics: Arc<MetricsRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match metrics.snapshot().to_json() {
            Ok(json) => tracing::info!("stats {}", json),
            Err(e) => tracing::warn!("Failed to serialize stats: {}", e),
        }
    }
}
