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
//! Command line and environment configuration shared by the processor
//! binaries. Every flag has a `SCREAMING_SNAKE` environment equivalent.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

#[derive(Debug, Args)]
pub struct GrpcArgs {
    /// gRPC server listen port.
    #[arg(id = "grpc_port", long = "grpc-port", env = "GRPC_PORT", default_value_t = 9002)]
    pub port: u16,

    /// Path to directory containing server.crt and server.key for TLS.
    #[arg(long = "grpc-cert-path", env = "GRPC_CERT_PATH")]
    pub cert_path: PathBuf,

    /// Path to CA certificate file used by the health check dial.
    #[arg(long = "grpc-ca-file", env = "GRPC_CA_FILE")]
    pub ca_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct HealthArgs {
    /// Health check HTTP server listen port.
    #[arg(id = "health_port", long = "health-port", env = "HEALTH_PORT", default_value_t = 8080)]
    pub port: u16,

    /// TLS server name for the health check gRPC dial.
    #[arg(
        long = "health-dial-server-name",
        env = "HEALTH_DIAL_SERVER_NAME",
        default_value = "grpc-ext-proc.envoygateway"
    )]
    pub dial_server_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Console,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub level: String,

    /// Log output: stdout, stderr, or a file path.
    #[arg(id = "log_output", long = "log-output", env = "LOG_OUTPUT", default_value = "stdout")]
    pub output: String,

    /// Log format.
    #[arg(
        long = "log-format",
        env = "LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Json
    )]
    pub format: LogFormat,

    /// Maximum size in megabytes of the log file before rotation.
    #[arg(long = "log-max-size", env = "LOG_MAX_SIZE", default_value_t = 0)]
    pub max_size: u64,

    /// Maximum age in days to retain rotated log files.
    #[arg(long = "log-max-age", env = "LOG_MAX_AGE", default_value_t = 0)]
    pub max_age: u32,

    /// Maximum number of rotated log files to retain.
    #[arg(long = "log-max-backups", env = "LOG_MAX_BACKUPS", default_value_t = 0)]
    pub max_backups: usize,

    /// Compress rotated log files.
    #[arg(long = "log-compress", env = "LOG_COMPRESS")]
    pub compress: bool,
}

#[derive(Debug, Args)]
pub struct EdgeOneArgs {
    /// Tencent Cloud SecretId for the TEO API.
    #[arg(long = "edgeone-secret-id", env = "EDGEONE_SECRET_ID")]
    pub secret_id: String,

    /// Tencent Cloud SecretKey for the TEO API.
    #[arg(
        long = "edgeone-secret-key",
        env = "EDGEONE_SECRET_KEY",
        hide_env_values = true
    )]
    pub secret_key: String,

    /// Tencent EdgeOne TEO API endpoint.
    #[arg(
        long = "edgeone-api-endpoint",
        env = "EDGEONE_API_ENDPOINT",
        default_value = "teo.tencentcloudapi.com"
    )]
    pub api_endpoint: String,

    /// Tencent Cloud region for the TEO client (optional).
    #[arg(long = "edgeone-region", env = "EDGEONE_REGION", default_value = "")]
    pub region: String,

    /// LRU cache size for IP validation results.
    #[arg(
        long = "edgeone-cache-size",
        env = "EDGEONE_CACHE_SIZE",
        default_value_t = 1000
    )]
    pub cache_size: usize,

    /// Cache TTL for IP validation results (e.g. 1h, 30m).
    #[arg(
        long = "edgeone-cache-ttl",
        env = "EDGEONE_CACHE_TTL",
        default_value = "1h",
        value_parser = humantime::parse_duration
    )]
    pub cache_ttl: Duration,

    /// TEO API request timeout (e.g. 5s, 10s).
    #[arg(
        long = "edgeone-timeout",
        env = "EDGEONE_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,
}

#[derive(Debug, Args)]
pub struct AccessLogArgs {
    /// Comma-separated list of headers to redact in addition to the
    /// built-in set.
    #[arg(long = "exclude-headers", env = "EXCLUDE_HEADERS", value_delimiter = ',')]
    pub exclude_headers: Vec<String>,

    /// Whether request headers are included in the record.
    #[arg(
        long = "access-log-include-request-headers",
        env = "ACCESS_LOG_INCLUDE_REQUEST_HEADERS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub include_request_headers: bool,

    /// Whether response headers are included in the record.
    #[arg(
        long = "access-log-include-response-headers",
        env = "ACCESS_LOG_INCLUDE_RESPONSE_HEADERS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub include_response_headers: bool,

    /// Access log output: stdout, stderr, or a file path.
    #[arg(
        id = "access_log_output",
        long = "access-log-output",
        env = "ACCESS_LOG_OUTPUT",
        default_value = "stdout"
    )]
    pub output: String,
}

/// Builds the framework server configuration from the shared flag groups.
pub fn server_config(grpc: &GrpcArgs, health: &HealthArgs) -> extproc::server::Config {
    extproc::server::Config {
        grpc_port: grpc.port,
        cert_path: grpc.cert_path.clone(),
        ca_file: grpc.ca_file.clone(),
        health_port: health.port,
        dial_server_name: health.dial_server_name.clone(),
    }
}

impl From<&EdgeOneArgs> for crate::edgeone::Config {
    fn from(args: &EdgeOneArgs) -> Self {
        Self {
            secret_id: args.secret_id.clone(),
            secret_key: args.secret_key.clone(),
            api_endpoint: args.api_endpoint.clone(),
            region: args.region.clone(),
            cache_size: args.cache_size,
            cache_ttl: args.cache_ttl,
            timeout: args.timeout,
        }
    }
}
