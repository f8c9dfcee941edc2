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
//! Access-log processor: collects request and response metadata across the
//! phases of one transaction and emits a single JSON record when the
//! response side completes.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::error;

use extproc::processor::{
    Headers, ProcessingResult, Processor, ProcessorFactory, RequestContext,
};
use extproc::util::first_non_empty;

/// Headers always redacted, regardless of configuration.
pub const DEFAULT_REDACTED_HEADERS: [&str; 4] =
    ["cookie", "set-cookie", "authorization", "proxy-authorization"];

const REDACTED: &str = "REDACTED";

#[derive(Debug, Clone)]
pub struct AccessLogConfig {
    pub include_request_headers: bool,
    pub include_response_headers: bool,
    /// Additional headers to redact, matched case-insensitively.
    pub exclude_headers: Vec<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            include_request_headers: true,
            include_response_headers: true,
            exclude_headers: Vec::new(),
        }
    }
}

/// Creates one access-log processor per stream; all of them share the
/// output sink and the redaction set.
pub struct AccessLogFactory {
    shared: Arc<Shared>,
}

struct Shared {
    sink: Mutex<Box<dyn Write + Send>>,
    include_request_headers: bool,
    include_response_headers: bool,
    redact: HashSet<String>,
}

impl AccessLogFactory {
    pub fn new(sink: Box<dyn Write + Send>, config: AccessLogConfig) -> Self {
        let mut redact: HashSet<String> = DEFAULT_REDACTED_HEADERS
            .iter()
            .map(|name| name.to_string())
            .collect();
        redact.extend(
            config
                .exclude_headers
                .iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty()),
        );

        Self {
            shared: Arc::new(Shared {
                sink: Mutex::new(sink),
                include_request_headers: config.include_request_headers,
                include_response_headers: config.include_response_headers,
                redact,
            }),
        }
    }
}

impl ProcessorFactory for AccessLogFactory {
    fn new_processor(&self) -> Box<dyn Processor> {
        Box::new(AccessLogProcessor {
            shared: Arc::clone(&self.shared),
            logged: false,
            started: None,
            request: RequestInfo::default(),
            status: 0,
            resp_headers: None,
            resp_content_length: None,
            body_bytes: 0,
            attrs: serde_json::Map::new(),
        })
    }
}

#[derive(Debug, Default, Serialize)]
struct RequestInfo {
    remote_ip: String,
    client_ip: String,
    proto: String,
    method: String,
    host: String,
    uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<String, Vec<String>>>,
    start_time: String,
    size: u64,
}

#[derive(Serialize)]
struct AccessLogRecord<'a> {
    level: &'a str,
    time: String,
    logger: &'a str,
    request: &'a RequestInfo,
    duration: u64,
    size: u64,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    resp_headers: Option<&'a BTreeMap<String, Vec<String>>>,
    attrs: &'a serde_json::Map<String, serde_json::Value>,
    msg: &'a str,
}

/// Per-stream state for one transaction's record.
pub struct AccessLogProcessor {
    shared: Arc<Shared>,
    logged: bool,
    started: Option<Instant>,
    request: RequestInfo,
    status: u16,
    resp_headers: Option<BTreeMap<String, Vec<String>>>,
    resp_content_length: Option<u64>,
    body_bytes: u64,
    attrs: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
impl Processor for AccessLogProcessor {
    async fn on_request_headers(&mut self, ctx: &RequestContext) -> ProcessingResult {
        let headers = &ctx.headers;

        self.started = Some(Instant::now());
        self.request.start_time = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.request.remote_ip = ctx
            .get_downstream_remote_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        self.request.client_ip = headers
            .get("x-forwarded-for")
            .and_then(first_forwarded_entry)
            .unwrap_or_default();
        self.request.proto = first_non_empty([
            headers.get("x-forwarded-proto"),
            headers.get(":protocol"),
        ])
        .unwrap_or("HTTP/1.1")
        .to_string();
        self.request.method = headers.get(":method").unwrap_or_default().to_string();
        self.request.host = first_non_empty([
            headers.get("x-forwarded-host"),
            headers.get(":authority"),
            headers.get("host"),
        ])
        .unwrap_or_default()
        .to_string();
        self.request.uri = first_non_empty([
            headers.get("x-envoy-original-path"),
            headers.get(":path"),
        ])
        .unwrap_or_default()
        .to_string();
        self.request.size = content_length(headers).unwrap_or(0);
        if self.shared.include_request_headers {
            self.request.headers = Some(redact_headers(headers, &self.shared.redact));
        }
        self.attrs = ctx.attributes_json();

        ProcessingResult::Continue
    }

    async fn on_response_headers(&mut self, ctx: &RequestContext) -> ProcessingResult {
        self.status = ctx
            .headers
            .get(":status")
            .and_then(|status| status.parse().ok())
            .unwrap_or(0);
        self.resp_content_length = content_length(&ctx.headers);
        if self.shared.include_response_headers {
            self.resp_headers = Some(redact_headers(&ctx.headers, &self.shared.redact));
        }
        if ctx.end_of_stream {
            self.emit();
        }
        ProcessingResult::Continue
    }

    async fn on_response_body(
        &mut self,
        _ctx: &RequestContext,
        body: &[u8],
        end_of_stream: bool,
    ) -> ProcessingResult {
        self.body_bytes += body.len() as u64;
        if end_of_stream {
            self.emit();
        }
        ProcessingResult::Continue
    }

    async fn on_response_trailers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
        self.emit();
        ProcessingResult::Continue
    }
}

impl AccessLogProcessor {
    /// Writes the record. The `logged` flag makes this a no-op after the
    /// first call, whichever phase gets here first.
    fn emit(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;

        let duration = self.started.map(|started| started.elapsed()).unwrap_or_default();
        let record = AccessLogRecord {
            level: if self.status >= 500 { "error" } else { "info" },
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            logger: "http.log.access",
            request: &self.request,
            duration: duration.as_nanos() as u64,
            size: self.resp_content_length.unwrap_or(self.body_bytes),
            status: self.status,
            resp_headers: self.resp_headers.as_ref(),
            attrs: &self.attrs,
            msg: "request processed",
        };

        let mut sink = self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = write_record(sink.as_mut(), &record) {
            error!(error = %err, "failed to write access log record");
        }
    }
}

fn write_record(sink: &mut dyn Write, record: &AccessLogRecord<'_>) -> std::io::Result<()> {
    serde_json::to_writer(&mut *sink, record)?;
    sink.write_all(b"\n")?;
    sink.flush()
}

/// First entry of an `x-forwarded-for` style list. Entries that carry a
/// port or brackets are normalized to the bare IP; anything unparseable is
/// passed through as-is.
fn first_forwarded_entry(value: &str) -> Option<String> {
    let entry = value.split(',').map(str::trim).find(|entry| !entry.is_empty())?;
    Some(match extproc::util::parse_ip_from_address(entry) {
        Ok(ip) => ip.to_string(),
        Err(_) => entry.to_string(),
    })
}

fn content_length(headers: &Headers) -> Option<u64> {
    headers.get("content-length")?.trim().parse().ok()
}

/// Copies headers for logging. Pseudo-headers keep their name and values
/// untouched; everything else is rewritten to canonical case, and names on
/// the redaction list have their values replaced wholesale.
fn redact_headers(headers: &Headers, redact: &HashSet<String>) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for (name, values) in headers.iter() {
        if name.starts_with(':') {
            out.insert(name.to_string(), values.to_vec());
            continue;
        }
        let values = if redact.contains(&name.to_ascii_lowercase()) {
            vec![REDACTED.to_string()]
        } else {
            values.to_vec()
        };
        out.insert(canonical_header_case(name), values);
    }
    out
}

/// `x-forwarded-for` becomes `X-Forwarded-For`.
fn canonical_header_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    out
}
