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
//! Thin client for the TEO `DescribeIPRegion` API with TC3-HMAC-SHA256
//! request signing. The per-call timeout is owned here.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Config, EdgeOneValidator, Error};

const ALGORITHM: &str = "TC3-HMAC-SHA256";
const SERVICE: &str = "teo";
const API_VERSION: &str = "2022-09-01";
const ACTION_DESCRIBE_IP_REGION: &str = "DescribeIPRegion";
const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host;x-tc-action";

pub struct TeoClient {
    http: reqwest::Client,
    secret_id: String,
    secret_key: String,
    host: String,
    region: String,
}

impl TeoClient {
    pub fn new(config: &Config) -> Result<Self, Error> {
        if config.secret_id.trim().is_empty() || config.secret_key.trim().is_empty() {
            return Err(Error::MissingCredentials);
        }

        let host = config
            .api_endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| Error::Request(Arc::new(err)))?;

        Ok(Self {
            http,
            secret_id: config.secret_id.clone(),
            secret_key: config.secret_key.clone(),
            host,
            region: config.region.clone(),
        })
    }

    async fn describe_ip_region(&self, ips: &[IpAddr]) -> Result<ApiResponse, Error> {
        let request = DescribeIpRegionRequest {
            ips: ips.iter().map(ToString::to_string).collect(),
        };
        let payload =
            serde_json::to_vec(&request).map_err(|err| Error::Encode(Arc::new(err)))?;

        let timestamp = Utc::now().timestamp();
        let authorization = self.authorization(&payload, timestamp);

        let mut http_request = self
            .http
            .post(format!("https://{}/", self.host))
            .header("Authorization", authorization)
            .header("Content-Type", CONTENT_TYPE)
            .header("X-TC-Action", ACTION_DESCRIBE_IP_REGION)
            .header("X-TC-Version", API_VERSION)
            .header("X-TC-Timestamp", timestamp.to_string());
        if !self.region.is_empty() {
            http_request = http_request.header("X-TC-Region", &self.region);
        }

        let envelope: ApiEnvelope = http_request
            .body(payload)
            .send()
            .await
            .map_err(|err| Error::Request(Arc::new(err)))?
            .json()
            .await
            .map_err(|err| Error::Request(Arc::new(err)))?;

        if let Some(api_error) = envelope.response.error {
            return Err(Error::Api {
                code: api_error.code,
                message: api_error.message,
            });
        }
        debug!(
            request_id = %envelope.response.request_id,
            results = envelope.response.ip_region_info.len(),
            "DescribeIPRegion succeeded"
        );
        Ok(envelope.response)
    }

    /// TC3-HMAC-SHA256 `Authorization` header for a signed POST.
    fn authorization(&self, payload: &[u8], timestamp: i64) -> String {
        let date = DateTime::<Utc>::from_timestamp(timestamp, 0)
            .map(|when| when.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        let hashed_payload = hex::encode(Sha256::digest(payload));
        let canonical_request = canonical_request(&self.host, &hashed_payload);
        let credential_scope = format!("{date}/{SERVICE}/tc3_request");
        let string_to_sign = format!(
            "{ALGORITHM}\n{timestamp}\n{credential_scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key_date = hmac_sha256(format!("TC3{}", self.secret_key).as_bytes(), date.as_bytes());
        let key_service = hmac_sha256(&key_date, SERVICE.as_bytes());
        let key_signing = hmac_sha256(&key_service, b"tc3_request");
        let signature = hex::encode(hmac_sha256(&key_signing, string_to_sign.as_bytes()));

        format!(
            "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.secret_id
        )
    }
}

#[async_trait]
impl EdgeOneValidator for TeoClient {
    async fn is_edgeone_ip(&self, ip: IpAddr) -> Result<bool, Error> {
        let response = self.describe_ip_region(&[ip]).await?;
        Ok(is_edge_verdict(&response.ip_region_info))
    }
}

/// The API labels each IP with a `yes`/`no` string, compared without case.
fn is_edge_verdict(infos: &[IpRegionInfo]) -> bool {
    infos
        .iter()
        .any(|info| info.is_edgeone_ip.eq_ignore_ascii_case("yes"))
}

fn canonical_request(host: &str, hashed_payload: &str) -> String {
    format!(
        "POST\n/\n\ncontent-type:{CONTENT_TYPE}\nhost:{host}\nx-tc-action:{}\n\n{SIGNED_HEADERS}\n{hashed_payload}",
        ACTION_DESCRIBE_IP_REGION.to_ascii_lowercase()
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[derive(Debug, Serialize)]
struct DescribeIpRegionRequest {
    #[serde(rename = "IPs")]
    ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(rename = "Response")]
    response: ApiResponse,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(rename = "RequestId", default)]
    request_id: String,
    #[serde(rename = "Error", default)]
    error: Option<ApiErrorBody>,
    #[serde(rename = "IPRegionInfo", default)]
    ip_region_info: Vec<IpRegionInfo>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct IpRegionInfo {
    #[serde(rename = "IsEdgeOneIP", default)]
    is_edgeone_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            secret_id: "AKID-test".to_string(),
            secret_key: "secret".to_string(),
            api_endpoint: "teo.tencentcloudapi.com".to_string(),
            region: String::new(),
            cache_size: 1000,
            cache_ttl: Duration::from_secs(3600),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_new_requires_credentials() {
        let mut config = test_config();
        config.secret_key = "   ".to_string();

        assert!(matches!(
            TeoClient::new(&config),
            Err(Error::MissingCredentials)
        ));
        assert!(TeoClient::new(&test_config()).is_ok());
    }

    #[test]
    fn test_endpoint_is_normalized_to_a_host() {
        let mut config = test_config();
        config.api_endpoint = "https://teo.tencentcloudapi.com/".to_string();

        let client = TeoClient::new(&config).unwrap();
        assert_eq!(client.host, "teo.tencentcloudapi.com");
    }

    #[test]
    fn test_canonical_request_layout() {
        let canonical = canonical_request("teo.tencentcloudapi.com", "abc123");
        assert_eq!(
            canonical,
            "POST\n\
             /\n\
             \n\
             content-type:application/json; charset=utf-8\n\
             host:teo.tencentcloudapi.com\n\
             x-tc-action:describeipregion\n\
             \n\
             content-type;host;x-tc-action\n\
             abc123"
        );
    }

    #[test]
    fn test_authorization_header_shape() {
        let client = TeoClient::new(&test_config()).unwrap();
        let authorization = client.authorization(br#"{"IPs":["203.0.113.7"]}"#, 1_700_000_000);

        assert!(authorization.starts_with(
            "TC3-HMAC-SHA256 Credential=AKID-test/2023-11-14/teo/tc3_request, \
             SignedHeaders=content-type;host;x-tc-action, Signature="
        ));
        let signature = authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let client = TeoClient::new(&test_config()).unwrap();
        let first = client.authorization(b"{}", 1_700_000_000);
        let second = client.authorization(b"{}", 1_700_000_000);
        let third = client.authorization(b"{}", 1_700_000_001);

        assert_eq!(first, second);
        assert_ne!(first, third);
    }

    #[test]
    fn test_response_parsing_and_verdict() {
        let body = r#"{
            "Response": {
                "RequestId": "a-request-id",
                "IPRegionInfo": [
                    {"IP": "203.0.113.7", "IsEdgeOneIP": "Yes"},
                    {"IP": "203.0.113.8", "IsEdgeOneIP": "no"}
                ]
            }
        }"#;
        let envelope: ApiEnvelope = serde_json::from_str(body).unwrap();

        assert!(envelope.response.error.is_none());
        assert!(is_edge_verdict(&envelope.response.ip_region_info));
    }

    #[test]
    fn test_verdict_is_false_without_a_yes() {
        let body = r#"{"Response": {"RequestId": "x", "IPRegionInfo": [{"IsEdgeOneIP": "no"}]}}"#;
        let envelope: ApiEnvelope = serde_json::from_str(body).unwrap();
        assert!(!is_edge_verdict(&envelope.response.ip_region_info));

        let empty = r#"{"Response": {"RequestId": "x"}}"#;
        let envelope: ApiEnvelope = serde_json::from_str(empty).unwrap();
        assert!(!is_edge_verdict(&envelope.response.ip_region_info));
    }

    #[test]
    fn test_api_error_body_is_parsed() {
        let body = r#"{
            "Response": {
                "RequestId": "x",
                "Error": {"Code": "AuthFailure.SignatureFailure", "Message": "denied"}
            }
        }"#;
        let envelope: ApiEnvelope = serde_json::from_str(body).unwrap();

        let error = envelope.response.error.unwrap();
        assert_eq!(error.code, "AuthFailure.SignatureFailure");
        assert_eq!(error.message, "denied");
    }
}
