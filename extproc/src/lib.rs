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
//! # Envoy External Processor Framework
//!
//! This crate provides the infrastructure for building Envoy `ext_proc`
//! callout servers: a per-stream dispatch runtime, a processor contract with
//! per-phase entry points, translation from neutral processing results into
//! Envoy wire envelopes, a hot-reloading TLS certificate watcher, and the
//! boundary wiring for the gRPC and health check servers.
//!
//! Processors implement [`processor::Processor`] and are minted one per
//! accepted stream by a [`processor::ProcessorFactory`]; everything else is
//! handled by the framework.

pub mod health;
pub mod processor;
pub mod server;
pub mod service;
pub mod tlsutil;
pub mod util;
pub mod utils;

/// Generated Envoy protobuf types, re-exported so downstream crates can name
/// wire messages without depending on the bindings crate directly.
pub use envoy_types::pb::envoy;
/// Well-known protobuf types (`Struct`, `Value`, ...) from the same
/// bindings, used by the ext_proc attribute maps.
pub use envoy_types::pb::google;
