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
//! Per-stream dispatch runtime for the `ExternalProcessor.Process` RPC.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::envoy::service::ext_proc::v3::external_processor_server::{
    ExternalProcessor, ExternalProcessorServer,
};
use crate::envoy::service::ext_proc::v3::{
    processing_request::Request as ProcessingRequestVariant, HttpBody, HttpHeaders, HttpTrailers,
    ProcessingRequest, ProcessingResponse,
};
use crate::processor::{Headers, Processor, ProcessorFactory, RequestContext};
use crate::utils::mutations::{into_processing_response, Phase};

/// gRPC service driving one [`Processor`] per accepted stream.
///
/// Each stream runs its own receive loop: one inbound phase message is
/// dispatched to the matching processor entry point, and exactly one
/// response is sent back before the next message is read. Responses
/// therefore always leave in request order.
pub struct ExtProcService {
    factory: Arc<dyn ProcessorFactory>,
}

impl ExtProcService {
    pub fn new(factory: Arc<dyn ProcessorFactory>) -> Self {
        Self { factory }
    }

    pub fn into_server(self) -> ExternalProcessorServer<Self> {
        ExternalProcessorServer::new(self)
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let mut stream = request.into_inner();
        let (tx, rx) = mpsc::channel(32);
        let mut processor = self.factory.new_processor();

        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(req)) => {
                        let response = process_message(processor.as_mut(), &req).await;
                        if tx.send(Ok(response)).await.is_err() {
                            // Peer stopped reading; the stream is over.
                            break;
                        }
                    }
                    // Clean end of input.
                    Ok(None) => break,
                    Err(status) if status.code() == Code::Cancelled => {
                        debug!("stream cancelled by peer");
                        break;
                    }
                    Err(status) => {
                        let _ = tx
                            .send(Err(Status::unknown(format!(
                                "cannot receive stream request: {status}"
                            ))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Dispatches one inbound phase message to the matching processor entry
/// point and translates the result into the response envelope for that
/// phase. A message without a recognized phase is logged and answered with
/// an empty response.
pub async fn process_message(
    processor: &mut dyn Processor,
    req: &ProcessingRequest,
) -> ProcessingResponse {
    match &req.request {
        Some(ProcessingRequestVariant::RequestHeaders(headers)) => {
            let ctx = headers_context(req, headers);
            let result = processor.on_request_headers(&ctx).await;
            into_processing_response(Phase::RequestHeaders, result)
        }
        Some(ProcessingRequestVariant::RequestBody(body)) => {
            let ctx = body_context(req, body);
            let result = processor
                .on_request_body(&ctx, &body.body, body.end_of_stream)
                .await;
            into_processing_response(Phase::RequestBody, result)
        }
        Some(ProcessingRequestVariant::RequestTrailers(trailers)) => {
            let ctx = trailers_context(req, trailers);
            let result = processor.on_request_trailers(&ctx).await;
            into_processing_response(Phase::RequestTrailers, result)
        }
        Some(ProcessingRequestVariant::ResponseHeaders(headers)) => {
            let ctx = headers_context(req, headers);
            let result = processor.on_response_headers(&ctx).await;
            into_processing_response(Phase::ResponseHeaders, result)
        }
        Some(ProcessingRequestVariant::ResponseBody(body)) => {
            let ctx = body_context(req, body);
            let result = processor
                .on_response_body(&ctx, &body.body, body.end_of_stream)
                .await;
            into_processing_response(Phase::ResponseBody, result)
        }
        Some(ProcessingRequestVariant::ResponseTrailers(trailers)) => {
            let ctx = trailers_context(req, trailers);
            let result = processor.on_response_trailers(&ctx).await;
            into_processing_response(Phase::ResponseTrailers, result)
        }
        None => {
            warn!("processing request without a recognized phase");
            ProcessingResponse::default()
        }
    }
}

fn headers_context(req: &ProcessingRequest, headers: &HttpHeaders) -> RequestContext {
    RequestContext {
        attributes: req.attributes.clone(),
        headers: Headers::from_proto(headers.headers.as_ref()),
        end_of_stream: headers.end_of_stream,
    }
}

fn body_context(req: &ProcessingRequest, body: &HttpBody) -> RequestContext {
    RequestContext {
        attributes: req.attributes.clone(),
        headers: Headers::new(),
        end_of_stream: body.end_of_stream,
    }
}

fn trailers_context(req: &ProcessingRequest, trailers: &HttpTrailers) -> RequestContext {
    RequestContext {
        attributes: req.attributes.clone(),
        headers: Headers::from_proto(trailers.trailers.as_ref()),
        end_of_stream: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoy::config::core::v3::{HeaderMap, HeaderValue};
    use crate::envoy::service::ext_proc::v3::processing_response::Response as ProcessingResponseVariant;
    use crate::processor::{ProcessingResult, SetHeader};
    use async_trait::async_trait;

    /// Records which entry points ran and what each phase saw.
    #[derive(Default)]
    struct RecordingProcessor {
        phases: Vec<String>,
        bodies: Vec<(Vec<u8>, bool)>,
    }

    #[async_trait]
    impl Processor for RecordingProcessor {
        async fn on_request_headers(&mut self, ctx: &RequestContext) -> ProcessingResult {
            self.phases.push(format!(
                "request_headers eos={} method={}",
                ctx.end_of_stream,
                ctx.headers.get(":method").unwrap_or("-")
            ));
            ProcessingResult::continue_with_headers(vec![SetHeader::overwrite("x-seen", "1")])
        }

        async fn on_request_body(
            &mut self,
            _ctx: &RequestContext,
            body: &[u8],
            end_of_stream: bool,
        ) -> ProcessingResult {
            self.phases.push("request_body".to_string());
            self.bodies.push((body.to_vec(), end_of_stream));
            ProcessingResult::Continue
        }

        async fn on_request_trailers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
            self.phases.push("request_trailers".to_string());
            ProcessingResult::Continue
        }

        async fn on_response_headers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
            self.phases.push("response_headers".to_string());
            ProcessingResult::Continue
        }

        async fn on_response_body(
            &mut self,
            _ctx: &RequestContext,
            body: &[u8],
            end_of_stream: bool,
        ) -> ProcessingResult {
            self.phases.push("response_body".to_string());
            self.bodies.push((body.to_vec(), end_of_stream));
            ProcessingResult::Continue
        }

        async fn on_response_trailers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
            self.phases.push("response_trailers".to_string());
            ProcessingResult::Continue
        }
    }

    fn request_headers_message(headers: Vec<(&str, &str)>, end_of_stream: bool) -> ProcessingRequest {
        ProcessingRequest {
            request: Some(ProcessingRequestVariant::RequestHeaders(HttpHeaders {
                headers: Some(HeaderMap {
                    headers: headers
                        .into_iter()
                        .map(|(key, value)| HeaderValue {
                            key: key.to_string(),
                            raw_value: value.as_bytes().to_vec(),
                            ..Default::default()
                        })
                        .collect(),
                }),
                end_of_stream,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn envelope_tag(response: &ProcessingResponse) -> &'static str {
        match response.response.as_ref() {
            Some(ProcessingResponseVariant::RequestHeaders(_)) => "request_headers",
            Some(ProcessingResponseVariant::RequestBody(_)) => "request_body",
            Some(ProcessingResponseVariant::RequestTrailers(_)) => "request_trailers",
            Some(ProcessingResponseVariant::ResponseHeaders(_)) => "response_headers",
            Some(ProcessingResponseVariant::ResponseBody(_)) => "response_body",
            Some(ProcessingResponseVariant::ResponseTrailers(_)) => "response_trailers",
            Some(ProcessingResponseVariant::ImmediateResponse(_)) => "immediate_response",
            None => "none",
        }
    }

    #[tokio::test]
    async fn test_each_phase_dispatches_to_matching_entry_point() {
        let mut processor = RecordingProcessor::default();

        let messages = vec![
            (
                request_headers_message(vec![(":method", "GET")], false),
                "request_headers",
            ),
            (
                ProcessingRequest {
                    request: Some(ProcessingRequestVariant::RequestBody(HttpBody {
                        body: b"ping".to_vec(),
                        end_of_stream: true,
                    })),
                    ..Default::default()
                },
                "request_body",
            ),
            (
                ProcessingRequest {
                    request: Some(ProcessingRequestVariant::RequestTrailers(
                        HttpTrailers::default(),
                    )),
                    ..Default::default()
                },
                "request_trailers",
            ),
            (
                ProcessingRequest {
                    request: Some(ProcessingRequestVariant::ResponseHeaders(
                        HttpHeaders::default(),
                    )),
                    ..Default::default()
                },
                "response_headers",
            ),
            (
                ProcessingRequest {
                    request: Some(ProcessingRequestVariant::ResponseBody(HttpBody {
                        body: b"pong".to_vec(),
                        end_of_stream: true,
                    })),
                    ..Default::default()
                },
                "response_body",
            ),
            (
                ProcessingRequest {
                    request: Some(ProcessingRequestVariant::ResponseTrailers(
                        HttpTrailers::default(),
                    )),
                    ..Default::default()
                },
                "response_trailers",
            ),
        ];

        for (message, expected_tag) in messages {
            let response = process_message(&mut processor, &message).await;
            assert_eq!(envelope_tag(&response), expected_tag);
        }

        assert_eq!(
            processor.phases,
            [
                "request_headers eos=false method=GET",
                "request_body",
                "request_trailers",
                "response_headers",
                "response_body",
                "response_trailers",
            ]
        );
        assert_eq!(
            processor.bodies,
            [(b"ping".to_vec(), true), (b"pong".to_vec(), true)]
        );
    }

    #[tokio::test]
    async fn test_unrecognized_phase_gets_empty_response() {
        let mut processor = RecordingProcessor::default();
        let response = process_message(&mut processor, &ProcessingRequest::default()).await;

        assert!(response.response.is_none());
        assert!(processor.phases.is_empty());
    }

    #[tokio::test]
    async fn test_header_mutation_reaches_the_wire() {
        let mut processor = RecordingProcessor::default();
        let message = request_headers_message(vec![(":method", "GET")], false);
        let response = process_message(&mut processor, &message).await;

        if let Some(ProcessingResponseVariant::RequestHeaders(headers)) = response.response {
            let mutation = headers.response.unwrap().header_mutation.unwrap();
            assert_eq!(mutation.set_headers.len(), 1);
            assert_eq!(
                mutation.set_headers[0].header.as_ref().unwrap().key,
                "x-seen"
            );
        } else {
            panic!("expected RequestHeaders envelope");
        }
    }

    #[tokio::test]
    async fn test_immediate_response_overrides_phase_envelope() {
        struct Denying;

        #[async_trait]
        impl Processor for Denying {
            async fn on_request_headers(&mut self, _ctx: &RequestContext) -> ProcessingResult {
                ProcessingResult::ImmediateResponse {
                    status: 429,
                    headers: Vec::new(),
                    body: Vec::new(),
                }
            }
        }

        let mut processor = Denying;
        let message = request_headers_message(vec![], false);
        let response = process_message(&mut processor, &message).await;

        assert_eq!(envelope_tag(&response), "immediate_response");
    }

    #[tokio::test]
    async fn test_end_of_stream_reaches_the_context() {
        struct EosProbe(Vec<bool>);

        #[async_trait]
        impl Processor for EosProbe {
            async fn on_response_headers(&mut self, ctx: &RequestContext) -> ProcessingResult {
                self.0.push(ctx.end_of_stream);
                ProcessingResult::Continue
            }
        }

        let mut processor = EosProbe(Vec::new());
        for end_of_stream in [false, true] {
            let message = ProcessingRequest {
                request: Some(ProcessingRequestVariant::ResponseHeaders(HttpHeaders {
                    end_of_stream,
                    ..Default::default()
                })),
                ..Default::default()
            };
            process_message(&mut processor, &message).await;
        }

        assert_eq!(processor.0, [false, true]);
    }
}
