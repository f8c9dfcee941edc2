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
//! # Server Module
//!
//! This module provides the boundary wiring for running Envoy external
//! processors: listen sockets, TLS, server lifetime and graceful shutdown.
//!
//! ## Overview
//!
//! [`run`] is responsible for:
//!
//! - Serving the ext_proc gRPC service over TLS, with credentials provided
//!   by the certificate watcher so rotated key pairs are picked up by new
//!   handshakes without a restart
//! - Registering the standard gRPC health service alongside it
//! - Serving the `/healthz` HTTP endpoint that probes the gRPC server
//!   through a loopback ext_proc stream
//! - Draining both servers when a shutdown signal arrives
//!
//! This lets processors focus on their per-phase logic without worrying
//! about server setup and lifecycle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::health::{self, HealthState};
use crate::processor::ProcessorFactory;
use crate::service::ExtProcService;
use crate::tlsutil::{CertWatcher, TlsError};

/// Configuration for the server boundary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the TLS gRPC server listens on.
    pub grpc_port: u16,
    /// Directory containing `server.crt` and `server.key`.
    pub cert_path: PathBuf,
    /// Optional CA bundle the health probe verifies the server with.
    pub ca_file: Option<PathBuf>,
    /// Port the plaintext health check HTTP server listens on.
    pub health_port: u16,
    /// TLS server name the health probe dials with.
    pub dial_server_name: String,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("gRPC server error")]
    Grpc(#[from] tonic::transport::Error),
    #[error("health check server error")]
    Health(#[source] std::io::Error),
}

/// Runs the gRPC server and the health check server until a shutdown signal
/// arrives or either server fails.
///
/// The factory supplies one processor per accepted ext_proc stream.
pub async fn run(config: Config, factory: Arc<dyn ProcessorFactory>) -> Result<(), ServeError> {
    // The watcher's resolver runs on the process-default rustls provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let watcher = Arc::new(CertWatcher::new(&config.cert_path)?);
    let acceptor = TlsAcceptor::from(Arc::new(watcher.server_config()));

    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
    let grpc_listener = TcpListener::bind(grpc_addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: grpc_addr,
            source,
        })?;

    // Handshake failures only cost the one connection, never the listener.
    let incoming = TcpListenerStream::new(grpc_listener)
        .then(move |conn| {
            let acceptor = acceptor.clone();
            async move {
                match conn {
                    Ok(stream) => acceptor.accept(stream).await,
                    Err(err) => Err(err),
                }
            }
        })
        .filter_map(|conn| async move {
            match conn {
                Ok(stream) => Some(Ok::<_, std::io::Error>(stream)),
                Err(err) => {
                    warn!(error = %err, "TLS accept failed");
                    None
                }
            }
        });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (_health_reporter, health_service) = tonic_health::server::health_reporter();
    let service = ExtProcService::new(factory);

    info!(port = config.grpc_port, "gRPC server listening");
    let mut grpc_shutdown = shutdown_rx.clone();
    let grpc_server = Server::builder()
        .add_service(health_service)
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(incoming, async move {
            let _ = grpc_shutdown.wait_for(|stop| *stop).await;
        });

    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let health_listener = TcpListener::bind(health_addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: health_addr,
            source,
        })?;
    let health_app = axum::Router::new()
        .route("/healthz", axum::routing::get(health::healthz))
        .with_state(HealthState {
            grpc_port: config.grpc_port,
            ca_file: config.ca_file.clone(),
            dial_server_name: config.dial_server_name.clone(),
        });

    info!(port = config.health_port, "health check server listening");
    let mut health_shutdown = shutdown_rx;
    let health_server = axum::serve(health_listener, health_app).with_graceful_shutdown(
        async move {
            let _ = health_shutdown.wait_for(|stop| *stop).await;
        },
    );

    tokio::try_join!(
        async { grpc_server.await.map_err(ServeError::from) },
        async { health_server.await.map_err(ServeError::Health) },
    )?;
    Ok(())
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
