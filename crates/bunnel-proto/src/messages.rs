//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header map as carried on the wire: lowercased names, last write wins.
pub type Headers = HashMap<String, String>;

/// An HTTP request forwarded from the server to the agent.
///
/// Carries the full materialised body; there is no streaming at the
/// protocol layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRequest {
    /// Correlation id, unique for the lifetime of the tunnel.
    pub id: String,
    pub method: String,
    /// URL path plus query string, e.g. `/api/items?page=2`.
    pub path: String,
    #[serde(with = "header_values")]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// The agent's answer to a [`TunnelRequest`], correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelResponse {
    pub id: String,
    pub status: u16,
    #[serde(with = "header_values")]
    pub headers: Headers,
    pub body: String,
}

impl TunnelResponse {
    /// The response the agent sends when the local service cannot be reached
    /// or its reply cannot be parsed.
    pub fn bad_gateway(id: String) -> Self {
        Self {
            id,
            status: 502,
            headers: Headers::new(),
            body: "Bad Gateway".to_string(),
        }
    }
}

/// Sent server -> agent exactly once per control-channel establishment.
///
/// On the wire: `{"type":"connected","subdomain":"abc123def456"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedNotice {
    #[serde(rename = "type")]
    kind: ConnectedTag,
    pub subdomain: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
enum ConnectedTag {
    #[serde(rename = "connected")]
    Connected,
}

impl ConnectedNotice {
    pub fn new(subdomain: String) -> Self {
        Self {
            kind: ConnectedTag::Connected,
            subdomain,
        }
    }
}

/// Any frame the server may send to the agent.
///
/// `ConnectedNotice` is tried first: it is the only frame with a `type`
/// discriminator, so the untagged match is unambiguous.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Connected(ConnectedNotice),
    Request(TunnelRequest),
}

/// Serde helper that coerces scalar header values to strings on decode.
///
/// Peers occasionally emit numeric header values (`{"content-length": 42}`);
/// the decoder accepts them, while non-scalar values are a hard error.
mod header_values {
    use super::Headers;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use std::collections::HashMap;

    pub fn serialize<S>(headers: &Headers, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(headers)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Headers, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, Value>::deserialize(deserializer)?;
        let mut headers = Headers::with_capacity(raw.len());
        for (name, value) in raw {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(D::Error::custom(format!(
                        "header {name:?} has non-scalar value {other}"
                    )))
                }
            };
            headers.insert(name, value);
        }
        Ok(headers)
    }
}
