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
//! Trusted-edge processor: classifies the downstream peer against the
//! EdgeOne network and rewrites the client-IP headers accordingly.
//!
//! Downstream services always see a uniform `x-real-ip`/`x-forwarded-for`
//! pair whose provenance is signaled by `x-forwarded-from-edgeone`. The
//! trust header is overwritten on every request, so untrusted peers cannot
//! forge it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use extproc::processor::{
    ProcessingResult, Processor, ProcessorFactory, RequestContext, SetHeader,
};
use extproc::util::parse_ip_from_address;

use crate::edgeone::EdgeOneValidator;

pub const HEADER_TRUSTED: &str = "x-forwarded-from-edgeone";
pub const HEADER_DOWNSTREAM_REAL_IP: &str = "eo-connecting-ip";
pub const HEADER_XFF: &str = "x-forwarded-for";
pub const HEADER_X_REAL_IP: &str = "x-real-ip";

/// Classifier output for a peer IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    Yes,
    No,
    /// The peer IP could not be determined at all.
    Unknown,
}

impl TrustVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Unknown => "unknown",
        }
    }
}

pub struct EdgeOneFactory {
    validator: Arc<dyn EdgeOneValidator>,
}

impl EdgeOneFactory {
    pub fn new(validator: Arc<dyn EdgeOneValidator>) -> Self {
        Self { validator }
    }
}

impl ProcessorFactory for EdgeOneFactory {
    fn new_processor(&self) -> Box<dyn Processor> {
        Box::new(EdgeOneProcessor {
            validator: Arc::clone(&self.validator),
        })
    }
}

/// Stateless per-stream processor; only the request-headers phase acts.
pub struct EdgeOneProcessor {
    validator: Arc<dyn EdgeOneValidator>,
}

#[async_trait]
impl Processor for EdgeOneProcessor {
    async fn on_request_headers(&mut self, ctx: &RequestContext) -> ProcessingResult {
        let remote_ip = match ctx.get_downstream_remote_ip() {
            Ok(ip) => ip,
            Err(err) => {
                warn!(error = %err, "failed to get downstream remote IP");
                return ProcessingResult::continue_with_headers(vec![SetHeader::overwrite(
                    HEADER_TRUSTED,
                    TrustVerdict::Unknown.as_str(),
                )]);
            }
        };

        let verdict = match self.validator.is_edgeone_ip(remote_ip).await {
            Ok(true) => TrustVerdict::Yes,
            Ok(false) => TrustVerdict::No,
            Err(err) => {
                // Fail closed: an unreachable authority means no peer is
                // treated as the trusted edge.
                error!(
                    error = %err,
                    remote_ip = %remote_ip,
                    "edgeone validation failed"
                );
                TrustVerdict::No
            }
        };

        let remote = remote_ip.to_string();
        let mut set_headers = vec![SetHeader::overwrite(HEADER_TRUSTED, verdict.as_str())];

        if verdict == TrustVerdict::Yes {
            match ctx
                .headers
                .get(HEADER_DOWNSTREAM_REAL_IP)
                .map(parse_ip_from_address)
            {
                Some(Ok(client_ip)) => {
                    let client = client_ip.to_string();
                    set_headers.push(SetHeader::overwrite(
                        HEADER_XFF,
                        format!("{client}, {remote}"),
                    ));
                    set_headers.push(SetHeader::overwrite(HEADER_X_REAL_IP, client));
                    return ProcessingResult::continue_with_headers(set_headers);
                }
                other => {
                    if let Some(Err(err)) = other {
                        warn!(error = %err, "failed to parse downstream client IP");
                    }
                    warn!(
                        header = HEADER_DOWNSTREAM_REAL_IP,
                        remote_ip = %remote,
                        "edgeone missing or invalid header"
                    );
                }
            }
        }

        set_headers.push(SetHeader::overwrite(HEADER_XFF, remote.clone()));
        set_headers.push(SetHeader::overwrite(HEADER_X_REAL_IP, remote));
        ProcessingResult::continue_with_headers(set_headers)
    }
}
