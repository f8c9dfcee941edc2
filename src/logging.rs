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
//! Diagnostic logger construction from the `--log-*` flags.

use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use crate::config::{LogArgs, LogFormat};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log output path {path:?}")]
    InvalidOutputPath { path: String },
    #[error("failed to initialize log file appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),
}

/// Keeps the non-blocking log writer alive. Dropping it flushes and stops
/// the writer thread, so hold it for the process lifetime.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber according to the log flags.
///
/// `RUST_LOG` overrides `--log-level` when set. File outputs rotate daily
/// when a retention limit is configured and are written through a
/// non-blocking worker.
pub fn init(args: &LogArgs) -> Result<LogGuard, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.level.clone()));

    let guard = match args.output.as_str() {
        "stdout" | "" => {
            init_subscriber(args.format, filter, std::io::stdout);
            LogGuard { _worker: None }
        }
        "stderr" => {
            init_subscriber(args.format, filter, std::io::stderr);
            LogGuard { _worker: None }
        }
        path => {
            let (writer, worker) = file_writer(args, Path::new(path))?;
            init_subscriber(args.format, filter, writer);
            LogGuard {
                _worker: Some(worker),
            }
        }
    };

    if args.max_size > 0 || args.compress {
        tracing::warn!(
            max_size = args.max_size,
            compress = args.compress,
            "size-based rotation and compression are not supported, rotating daily"
        );
    }

    Ok(guard)
}

fn file_writer(
    args: &LogArgs,
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), LoggingError> {
    let invalid = || LoggingError::InvalidOutputPath {
        path: path.display().to_string(),
    };
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(invalid)?;

    let rotate = args.max_age > 0 || args.max_backups > 0;
    let mut builder = RollingFileAppender::builder()
        .rotation(if rotate { Rotation::DAILY } else { Rotation::NEVER })
        .filename_prefix(file_name.to_string_lossy());
    if rotate && args.max_backups > 0 {
        builder = builder.max_log_files(args.max_backups);
    }
    let appender = builder.build(directory)?;

    Ok(tracing_appender::non_blocking(appender))
}

fn init_subscriber<W>(format: LogFormat, filter: EnvFilter, writer: W)
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
        LogFormat::Console => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
    }
}
