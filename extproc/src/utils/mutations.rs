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
//! # Mutations Utility Module
//!
//! This module translates the neutral [`ProcessingResult`] returned by
//! processors into the Envoy protobuf envelopes the proxy expects, one
//! envelope shape per phase.
//!
//! ## Overview
//!
//! The translation rules are:
//!
//! - `Continue` becomes a common response with status `CONTINUE` and no
//!   mutation.
//! - `ContinueWithMutations` becomes a common response carrying a header
//!   mutation section; header names are normalized to lowercase and each
//!   set-header carries an explicit `OVERWRITE_IF_EXISTS_OR_ADD` action
//!   unless the processor chose another one.
//! - `ImmediateResponse` becomes an immediate-response envelope regardless
//!   of the phase it was returned from.
//!
//! Trailer phases have no common response on the wire, so their envelope
//! carries the header mutation directly.

use crate::envoy::config::core::v3::header_value_option::HeaderAppendAction;
use crate::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use crate::envoy::r#type::v3::HttpStatus;
use crate::envoy::service::ext_proc::v3::common_response::ResponseStatus;
use crate::envoy::service::ext_proc::v3::processing_response::Response;
use crate::envoy::service::ext_proc::v3::{
    BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, ImmediateResponse,
    ProcessingResponse, TrailersResponse,
};
use crate::processor::{ProcessingResult, SetHeader};

/// The six directional phases of an ext_proc stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RequestHeaders,
    RequestBody,
    RequestTrailers,
    ResponseHeaders,
    ResponseBody,
    ResponseTrailers,
}

/// Translates a processing result into the wire response for `phase`.
pub fn into_processing_response(phase: Phase, result: ProcessingResult) -> ProcessingResponse {
    match result {
        ProcessingResult::Continue => envelope(phase, None),
        ProcessingResult::ContinueWithMutations {
            set_headers,
            remove_headers,
        } => envelope(phase, Some(header_mutation(set_headers, remove_headers))),
        ProcessingResult::ImmediateResponse {
            status,
            headers,
            body,
        } => immediate_response(status, headers, body),
    }
}

/// Builds a header mutation from set and remove lists.
pub fn header_mutation(set_headers: Vec<SetHeader>, remove_headers: Vec<String>) -> HeaderMutation {
    HeaderMutation {
        set_headers: set_headers.into_iter().map(set_header_option).collect(),
        remove_headers,
    }
}

/// Builds a single set-header option. The header name is lowercased and the
/// value travels as raw bytes.
pub fn set_header_option(header: SetHeader) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: header.name.to_ascii_lowercase(),
            raw_value: header.value.into_bytes(),
            ..Default::default()
        }),
        append_action: header
            .append_action
            .unwrap_or(HeaderAppendAction::OverwriteIfExistsOrAdd) as i32,
        ..Default::default()
    }
}

/// Builds an immediate-response envelope with the given status, headers and
/// body.
pub fn immediate_response(
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
) -> ProcessingResponse {
    let headers = if headers.is_empty() {
        None
    } else {
        Some(header_mutation(
            headers
                .into_iter()
                .map(|(name, value)| SetHeader::overwrite(name, value))
                .collect(),
            Vec::new(),
        ))
    };

    ProcessingResponse {
        response: Some(Response::ImmediateResponse(ImmediateResponse {
            status: Some(HttpStatus {
                code: i32::from(status),
            }),
            headers,
            body,
            grpc_status: None,
            details: String::new(),
        })),
        ..Default::default()
    }
}

fn envelope(phase: Phase, mutation: Option<HeaderMutation>) -> ProcessingResponse {
    let response = match phase {
        Phase::RequestHeaders => Response::RequestHeaders(headers_response(mutation)),
        Phase::ResponseHeaders => Response::ResponseHeaders(headers_response(mutation)),
        Phase::RequestBody => Response::RequestBody(body_response(mutation)),
        Phase::ResponseBody => Response::ResponseBody(body_response(mutation)),
        Phase::RequestTrailers => Response::RequestTrailers(trailers_response(mutation)),
        Phase::ResponseTrailers => Response::ResponseTrailers(trailers_response(mutation)),
    };
    ProcessingResponse {
        response: Some(response),
        ..Default::default()
    }
}

fn common_response(mutation: Option<HeaderMutation>) -> CommonResponse {
    CommonResponse {
        status: ResponseStatus::Continue as i32,
        header_mutation: mutation,
        ..Default::default()
    }
}

fn headers_response(mutation: Option<HeaderMutation>) -> HeadersResponse {
    HeadersResponse {
        response: Some(common_response(mutation)),
    }
}

fn body_response(mutation: Option<HeaderMutation>) -> BodyResponse {
    BodyResponse {
        response: Some(common_response(mutation)),
    }
}

fn trailers_response(mutation: Option<HeaderMutation>) -> TrailersResponse {
    TrailersResponse {
        header_mutation: mutation,
    }
}
