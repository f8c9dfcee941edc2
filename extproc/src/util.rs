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
//! Small helpers shared by the runtime and by processors: address parsing,
//! fallback chains, and protobuf `Struct` conversion.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("cannot parse IP from address {addr:?}")]
pub struct AddressParseError {
    pub addr: String,
}

/// Extracts the IP from a plain address, a bracketed IPv6 address, or a
/// `host:port` pair.
pub fn parse_ip_from_address(addr: &str) -> Result<IpAddr, AddressParseError> {
    if let Ok(ip) = addr.trim_matches(['[', ']']).parse::<IpAddr>() {
        return Ok(ip);
    }
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Ok(sock.ip());
    }
    Err(AddressParseError {
        addr: addr.to_string(),
    })
}

/// First value that is present and non-empty.
pub fn first_non_empty<'a, I>(values: I) -> Option<&'a str>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    values.into_iter().flatten().find(|value| !value.is_empty())
}

/// Converts a protobuf `Struct` into a JSON object, field by field.
pub fn struct_to_json(fields: &crate::google::protobuf::Struct) -> serde_json::Map<String, serde_json::Value> {
    fields
        .fields
        .iter()
        .map(|(key, value)| (key.clone(), value_to_json(value)))
        .collect()
}

/// Converts a protobuf `Value` into the matching JSON value. Numbers that do
/// not fit a JSON number (NaN, infinities) become null.
pub fn value_to_json(value: &crate::google::protobuf::Value) -> serde_json::Value {
    use crate::google::protobuf::value::Kind;

    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::NumberValue(number)) => serde_json::Number::from_f64(*number)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(string)) => serde_json::Value::String(string.clone()),
        Some(Kind::BoolValue(boolean)) => serde_json::Value::Bool(*boolean),
        Some(Kind::StructValue(fields)) => serde_json::Value::Object(struct_to_json(fields)),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(value_to_json).collect())
        }
    }
}
