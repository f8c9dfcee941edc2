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
//! Processor contract: per-phase entry points, the request context handed to
//! each entry point, and the result type the runtime translates back into
//! Envoy wire responses.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::envoy::config::core::v3::header_value_option::HeaderAppendAction;
use crate::envoy::config::core::v3::HeaderMap as ProtoHeaderMap;
use crate::util::{parse_ip_from_address, struct_to_json, AddressParseError};

/// Attribute namespace Envoy uses for attributes forwarded to ext_proc.
pub const ENVOY_ATTRIBUTES_KEY: &str = "envoy.filters.http.ext_proc";

/// Header Envoy sets with the trusted client address when configured to do so.
pub const HEADER_ENVOY_EXTERNAL_ADDRESS: &str = "x-envoy-external-address";

#[derive(Debug, Error)]
pub enum ContextError {
    /// Neither the `source.address` attribute nor the
    /// `x-envoy-external-address` header yielded a value.
    #[error("downstream remote IP not found")]
    RemoteIpNotFound,
    #[error(transparent)]
    ParseIp(#[from] AddressParseError),
}

/// Case-insensitive multimap over HTTP headers.
///
/// Keys keep the spelling they arrived with (HTTP/2 wire headers are
/// lowercase, pseudo-headers start with `:`); lookups ignore ASCII case.
/// Values for one name stay in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header map from the wire representation. When a header
    /// carries both `raw_value` bytes and a `value` string, the raw bytes
    /// win so binary-safe headers survive untouched.
    pub fn from_proto(map: Option<&ProtoHeaderMap>) -> Self {
        let mut headers = Self::new();
        if let Some(map) = map {
            for header in &map.headers {
                let value = if header.raw_value.is_empty() {
                    header.value.clone()
                } else {
                    String::from_utf8_lossy(&header.raw_value).into_owned()
                };
                headers.append(&header.key, value);
            }
        }
        headers
    }

    pub fn append(&mut self, name: &str, value: String) {
        match self.entry_mut(name) {
            Some(values) => values.push(value),
            None => self.entries.push((name.to_string(), vec![value])),
        }
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values for `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entry(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> Option<&Vec<String>> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }
}

/// Per-phase snapshot passed to processor entry points.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Attributes forwarded by Envoy, keyed by attribute namespace.
    pub attributes: HashMap<String, crate::google::protobuf::Struct>,
    /// Headers of the current phase, empty for body phases.
    pub headers: Headers,
    /// Whether this message is the last one for the current direction.
    pub end_of_stream: bool,
}

impl RequestContext {
    /// Looks up an ext_proc attribute such as `source.address` or
    /// `request.id`.
    pub fn get_attribute(&self, key: &str) -> Option<&crate::google::protobuf::Value> {
        self.attributes.get(ENVOY_ATTRIBUTES_KEY)?.fields.get(key)
    }

    /// The ext_proc attributes converted to a JSON map, verbatim.
    pub fn attributes_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.attributes
            .get(ENVOY_ATTRIBUTES_KEY)
            .map(struct_to_json)
            .unwrap_or_default()
    }

    /// The proxy-assigned request id, from the `request.id` attribute with
    /// the `x-request-id` header as fallback.
    pub fn get_request_id(&self) -> Option<String> {
        if let Some(value) = self.get_attribute("request.id") {
            if let Some(crate::google::protobuf::value::Kind::StringValue(id)) = &value.kind {
                if !id.is_empty() {
                    return Some(id.clone());
                }
            }
        }
        self.headers
            .get("x-request-id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// The TCP-level source address of the downstream connection.
    ///
    /// Tries the `source.address` attribute first, then the
    /// `x-envoy-external-address` header. Both `host:port` and bracketed
    /// IPv6 forms are accepted.
    pub fn get_downstream_remote_ip(&self) -> Result<IpAddr, ContextError> {
        if let Some(value) = self.get_attribute("source.address") {
            if let Some(crate::google::protobuf::value::Kind::StringValue(addr)) = &value.kind {
                return Ok(parse_ip_from_address(addr)?);
            }
        }
        if let Some(addr) = self.headers.get(HEADER_ENVOY_EXTERNAL_ADDRESS) {
            if !addr.is_empty() {
                return Ok(parse_ip_from_address(addr)?);
            }
        }
        Err(ContextError::RemoteIpNotFound)
    }
}

/// A header to set, defaulting to `OVERWRITE_IF_EXISTS_OR_ADD` when no
/// append action is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetHeader {
    pub name: String,
    pub value: String,
    pub append_action: Option<HeaderAppendAction>,
}

impl SetHeader {
    pub fn overwrite(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            append_action: None,
        }
    }

    pub fn with_action(
        name: impl Into<String>,
        value: impl Into<String>,
        append_action: HeaderAppendAction,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            append_action: Some(append_action),
        }
    }
}

/// Outcome of one processor entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Continue without mutation.
    Continue,
    /// Continue after applying header mutations.
    ContinueWithMutations {
        set_headers: Vec<SetHeader>,
        remove_headers: Vec<String>,
    },
    /// Terminate the transaction with a synthetic response.
    ImmediateResponse {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
}

impl ProcessingResult {
    pub fn continue_with_headers(set_headers: Vec<SetHeader>) -> Self {
        Self::ContinueWithMutations {
            set_headers,
            remove_headers: Vec::new(),
        }
    }
}

/// Per-stream processor with one entry point per ext_proc phase.
///
/// Every entry point defaults to [`ProcessingResult::Continue`], so
/// implementations override only the phases they care about. An instance is
/// created per accepted stream and only ever called from that stream's task,
/// one phase at a time.
#[async_trait]
pub trait Processor: Send {
    async fn on_request_headers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
        ProcessingResult::Continue
    }

    async fn on_request_body(
        &mut self,
        _ctx: &RequestContext,
        _body: &[u8],
        _end_of_stream: bool,
    ) -> ProcessingResult {
        ProcessingResult::Continue
    }

    async fn on_request_trailers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
        ProcessingResult::Continue
    }

    async fn on_response_headers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
        ProcessingResult::Continue
    }

    async fn on_response_body(
        &mut self,
        _ctx: &RequestContext,
        _body: &[u8],
        _end_of_stream: bool,
    ) -> ProcessingResult {
        ProcessingResult::Continue
    }

    async fn on_response_trailers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
        ProcessingResult::Continue
    }
}

/// Creates one [`Processor`] per accepted stream.
pub trait ProcessorFactory: Send + Sync {
    fn new_processor(&self) -> Box<dyn Processor>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoy::config::core::v3::HeaderValue;

    fn string_value(value: &str) -> crate::google::protobuf::Value {
        crate::google::protobuf::Value {
            kind: Some(crate::google::protobuf::value::Kind::StringValue(value.to_string())),
        }
    }

    fn ext_proc_attributes(pairs: &[(&str, &str)]) -> HashMap<String, crate::google::protobuf::Struct> {
        let fields = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), string_value(value)))
            .collect();
        let mut attributes = HashMap::new();
        attributes.insert(
            ENVOY_ATTRIBUTES_KEY.to_string(),
            crate::google::protobuf::Struct { fields },
        );
        attributes
    }

    #[test]
    fn test_headers_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain".to_string());

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get("content-length"), None);
    }

    #[test]
    fn test_headers_keep_multiple_values_in_order() {
        let mut headers = Headers::new();
        headers.append("set-cookie", "a=1".to_string());
        headers.append("Set-Cookie", "b=2".to_string());

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_all("set-cookie"), ["a=1", "b=2"]);
        assert_eq!(headers.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn test_from_proto_prefers_raw_value() {
        let map = ProtoHeaderMap {
            headers: vec![
                HeaderValue {
                    key: ":method".to_string(),
                    value: "IGNORED".to_string(),
                    raw_value: b"GET".to_vec(),
                },
                HeaderValue {
                    key: "host".to_string(),
                    value: "example.test".to_string(),
                    raw_value: Vec::new(),
                },
            ],
        };

        let headers = Headers::from_proto(Some(&map));
        assert_eq!(headers.get(":method"), Some("GET"));
        assert_eq!(headers.get("host"), Some("example.test"));
    }

    #[test]
    fn test_get_attribute() {
        let ctx = RequestContext {
            attributes: ext_proc_attributes(&[("source.address", "203.0.113.7:51522")]),
            ..Default::default()
        };

        let value = ctx.get_attribute("source.address").unwrap();
        assert_eq!(
            value.kind,
            Some(crate::google::protobuf::value::Kind::StringValue(
                "203.0.113.7:51522".to_string()
            ))
        );
        assert!(ctx.get_attribute("request.id").is_none());
    }

    #[test]
    fn test_get_request_id_prefers_attribute() {
        let mut ctx = RequestContext {
            attributes: ext_proc_attributes(&[("request.id", "attr-id")]),
            ..Default::default()
        };
        ctx.headers.append("x-request-id", "header-id".to_string());

        assert_eq!(ctx.get_request_id(), Some("attr-id".to_string()));
    }

    #[test]
    fn test_get_request_id_falls_back_to_header() {
        let mut ctx = RequestContext::default();
        ctx.headers.append("x-request-id", "header-id".to_string());

        assert_eq!(ctx.get_request_id(), Some("header-id".to_string()));
        assert_eq!(RequestContext::default().get_request_id(), None);
    }

    #[test]
    fn test_downstream_remote_ip_from_attribute() {
        let ctx = RequestContext {
            attributes: ext_proc_attributes(&[("source.address", "203.0.113.7:51522")]),
            ..Default::default()
        };

        let ip = ctx.get_downstream_remote_ip().unwrap();
        assert_eq!(ip.to_string(), "203.0.113.7");
    }

    #[test]
    fn test_downstream_remote_ip_from_header() {
        let mut ctx = RequestContext::default();
        ctx.headers.append(
            HEADER_ENVOY_EXTERNAL_ADDRESS,
            "[2001:db8::1]:443".to_string(),
        );

        let ip = ctx.get_downstream_remote_ip().unwrap();
        assert_eq!(ip.to_string(), "2001:db8::1");
    }

    #[test]
    fn test_downstream_remote_ip_not_found() {
        let err = RequestContext::default()
            .get_downstream_remote_ip()
            .unwrap_err();
        assert!(matches!(err, ContextError::RemoteIpNotFound));
    }

    #[test]
    fn test_downstream_remote_ip_unparseable_attribute_is_an_error() {
        let ctx = RequestContext {
            attributes: ext_proc_attributes(&[("source.address", "not-an-address")]),
            ..Default::default()
        };

        let err = ctx.get_downstream_remote_ip().unwrap_err();
        assert!(matches!(err, ContextError::ParseIp(_)));
    }

    #[tokio::test]
    async fn test_default_processor_continues_every_phase() {
        struct Noop;
        #[async_trait]
        impl Processor for Noop {}

        let mut processor = Noop;
        let ctx = RequestContext::default();

        assert_eq!(
            processor.on_request_headers(&ctx).await,
            ProcessingResult::Continue
        );
        assert_eq!(
            processor.on_request_body(&ctx, b"chunk", false).await,
            ProcessingResult::Continue
        );
        assert_eq!(
            processor.on_request_trailers(&ctx).await,
            ProcessingResult::Continue
        );
        assert_eq!(
            processor.on_response_headers(&ctx).await,
            ProcessingResult::Continue
        );
        assert_eq!(
            processor.on_response_body(&ctx, b"chunk", true).await,
            ProcessingResult::Continue
        );
        assert_eq!(
            processor.on_response_trailers(&ctx).await,
            ProcessingResult::Continue
        );
    }
}
