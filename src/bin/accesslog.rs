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
//! Envoy external processor that emits one structured JSON access-log
//! record per HTTP transaction.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use envoy_ext_procs::config::{self, AccessLogArgs, GrpcArgs, HealthArgs, LogArgs};
use envoy_ext_procs::filters::accesslog::{AccessLogConfig, AccessLogFactory};
use envoy_ext_procs::logging;

#[derive(Debug, Parser)]
#[command(
    name = "accesslog",
    about = "Envoy external processor that emits structured JSON access logs.",
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
    access_log: AccessLogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(&cli.log).context("failed to initialize logging")?;

    let sink: Box<dyn Write + Send> = match cli.access_log.output.as_str() {
        "stdout" | "" => Box::new(std::io::stdout()),
        "stderr" => Box::new(std::io::stderr()),
        path => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open access log file {path}"))?,
        ),
    };

    info!(
        output = %cli.access_log.output,
        include_request_headers = cli.access_log.include_request_headers,
        include_response_headers = cli.access_log.include_response_headers,
        exclude_headers = ?cli.access_log.exclude_headers,
        "access log processor configured"
    );

    let factory = Arc::new(AccessLogFactory::new(
        sink,
        AccessLogConfig {
            include_request_headers: cli.access_log.include_request_headers,
            include_response_headers: cli.access_log.include_response_headers,
            exclude_headers: cli.access_log.exclude_headers.clone(),
        },
    ));

    extproc::server::run(config::server_config(&cli.grpc, &cli.health), factory)
        .await
        .context("server exited with an error")?;
    Ok(())
}
