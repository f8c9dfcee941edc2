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
//! Liveness endpoint: probes the local gRPC server over TLS with a minimal
//! ext_proc exchange and reports the outcome as an HTTP status.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tracing::warn;

use crate::envoy::service::ext_proc::v3::common_response::ResponseStatus;
use crate::envoy::service::ext_proc::v3::external_processor_client::ExternalProcessorClient;
use crate::envoy::service::ext_proc::v3::processing_request::Request as ProcessingRequestVariant;
use crate::envoy::service::ext_proc::v3::processing_response::Response as ProcessingResponseVariant;
use crate::envoy::service::ext_proc::v3::{HttpHeaders, ProcessingRequest};
use crate::tlsutil;

/// What the probe needs to reach the gRPC server it lives next to.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub grpc_port: u16,
    pub ca_file: Option<PathBuf>,
    pub dial_server_name: String,
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Rpc(#[from] tonic::Status),
    #[error("ext_proc stream closed before responding")]
    StreamClosed,
    #[error("unexpected probe response")]
    Unexpected,
}

/// `GET /healthz` handler. 200 when the probe succeeds, 503 on any failure.
pub async fn healthz(State(state): State<HealthState>) -> StatusCode {
    match probe(&state).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(error = %err, "healthz probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Opens a loopback ext_proc stream, sends an empty request-headers phase
/// and expects a CONTINUE answer for the same phase.
async fn probe(state: &HealthState) -> Result<(), ProbeError> {
    let mut tls = ClientTlsConfig::new().domain_name(&state.dial_server_name);
    match state.ca_file.as_deref().map(tlsutil::read_ca) {
        Some(Ok(pem)) => tls = tls.ca_certificate(Certificate::from_pem(pem)),
        Some(Err(err)) => {
            warn!(error = %err, "could not load CA certificate, using system trust roots");
            tls = tls.with_native_roots();
        }
        None => tls = tls.with_native_roots(),
    }

    let channel = Endpoint::from_shared(format!("https://localhost:{}", state.grpc_port))?
        .tls_config(tls)?
        .connect()
        .await?;
    let mut client = ExternalProcessorClient::new(channel);

    let requests = tokio_stream::once(ProcessingRequest {
        request: Some(ProcessingRequestVariant::RequestHeaders(
            HttpHeaders::default(),
        )),
        ..Default::default()
    });
    let mut responses = client.process(requests).await?.into_inner();

    let response = responses.message().await?.ok_or(ProbeError::StreamClosed)?;
    match response.response {
        Some(ProcessingResponseVariant::RequestHeaders(headers))
            if headers
                .response
                .clone()
                .map(|common| common.status)
                .unwrap_or_default()
                == ResponseStatus::Continue as i32 =>
        {
            Ok(())
        }
        _ => Err(ProbeError::Unexpected),
    }
}
