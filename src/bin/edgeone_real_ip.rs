// Copyright 2025 Google LLC
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
//! Envoy external processor that validates EdgeOne CDN requests and sets
//! real client IP headers.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use envoy_ext_procs::config::{self, EdgeOneArgs, GrpcArgs, HealthArgs, LogArgs};
use envoy_ext_procs::edgeone::Validator;
use envoy_ext_procs::filters::edgeone::EdgeOneFactory;
use envoy_ext_procs::logging;

#[derive(Debug, Parser)]
#[command(
    name = "edgeone-real-ip",
    about = "Envoy external processor that validates EdgeOne CDN requests and sets real client IP headers.",
    version
)]
struct Cli {
    #[command(flatten)]
    grpc: GrpcArgs,
    #[command(flatten)]
    health: HealthArgs,
    #[command(flatten)]
    log: LogArgs,
    #[command(flatten)]
    edgeone: EdgeOneArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.log).context("failed to initialize logging")?;

    let validator =
        Validator::new((&cli.edgeone).into()).context("edgeone validator init failed")?;

    info!(
        api_endpoint = %cli.edgeone.api_endpoint,
        region = %cli.edgeone.region,
        cache_size = cli.edgeone.cache_size,
        cache_ttl = ?cli.edgeone.cache_ttl,
        timeout = ?cli.edgeone.timeout,
        "edgeone validator configured"
    );

    let factory = Arc::new(EdgeOneFactory::new(Arc::new(validator)));

    extproc::server::run(config::server_config(&cli.grpc, &cli.health), factory)
        .await
        .context("server exited with an error")?;
    Ok(())
}
