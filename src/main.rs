// Copyright 2026 Boundless Foundation, Inc.
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

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use paymaster::{config::Config, PayoutService};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MainArgs {
    /// Path to the TOML configuration file.
    #[clap(short, long, env = "PAYMASTER_CONFIG", default_value = "paymaster.toml")]
    config: PathBuf,
    /// Emit logs as JSON.
    #[clap(long, env = "PAYMASTER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MainArgs::parse();

    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .json()
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("loaded environment variables from {path:?}"),
        Err(err) if err.not_found() => tracing::debug!("no .env file found"),
        Err(err) => bail!("failed to load .env file: {err}"),
    }

    let config = Config::load(&args.config).await.context("failed to load configuration")?;
    tracing::info!(
        "tracking {} bakers, autopay {}",
        config.bakers.len(),
        if config.autopay.enabled { "enabled" } else { "disabled" }
    );

    let service = PayoutService::new(config).await.context("failed to start payout service")?;
    service.run().await.context("payout service failed")?;

    Ok(())
}
