//! Frame codec
//!
//! Frames are single-line JSON text. The decoder is strict about required
//! fields and the response status range; anything it cannot make sense of is
//! a protocol error, which the session layer treats as fatal for the tunnel.

use crate::messages::{ConnectedNotice, ServerFrame, TunnelRequest, TunnelResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("response status {0} outside 100..=599")]
    StatusOutOfRange(u16),
}

pub fn encode_request(request: &TunnelRequest) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(request)?)
}

pub fn encode_response(response: &TunnelResponse) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(response)?)
}

pub fn encode_connected(notice: &ConnectedNotice) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(notice)?)
}

/// Decode a frame received by the agent on its control channel.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a frame received by the server on a control channel.
///
/// Only [`TunnelResponse`] frames are valid in that direction.
pub fn decode_response(text: &str) -> Result<TunnelResponse, ProtocolError> {
    let response: TunnelResponse = serde_json::from_str(text)?;
    if !(100..=599).contains(&response.status) {
        return Err(ProtocolError::StatusOutOfRange(response.status));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Headers;

    #[test]
    fn response_round_trip() {
        let mut headers = Headers::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        let resp = TunnelResponse {
            id: "r-1".to_string(),
            status: 201,
            headers,
            body: "created".to_string(),
        };
        let text = encode_response(&resp).unwrap();
        let back = decode_response(&text).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        // No status
        assert!(decode_response(r#"{"id":"r-1","headers":{},"body":""}"#).is_err());
        // No id
        assert!(decode_response(r#"{"status":200,"headers":{},"body":""}"#).is_err());
        // Not JSON at all
        assert!(decode_response("not json").is_err());
    }

    #[test]
    fn status_range_is_enforced() {
        let below = r#"{"id":"r-1","status":99,"headers":{},"body":""}"#;
        assert!(matches!(
            decode_response(below),
            Err(ProtocolError::StatusOutOfRange(99))
        ));

        let above = r#"{"id":"r-1","status":600,"headers":{},"body":""}"#;
        assert!(matches!(
            decode_response(above),
            Err(ProtocolError::StatusOutOfRange(600))
        ));

        let edge_low = r#"{"id":"r-1","status":100,"headers":{},"body":""}"#;
        assert!(decode_response(edge_low).is_ok());

        let edge_high = r#"{"id":"r-1","status":599,"headers":{},"body":""}"#;
        assert!(decode_response(edge_high).is_ok());
    }

    #[test]
    fn server_frame_rejects_garbage() {
        assert!(decode_server_frame("{}").is_err());
        assert!(decode_server_frame(r#"{"type":"unknown"}"#).is_err());
    }

    #[test]
    fn request_encodes_as_utf8_json_text() {
        let req = TunnelRequest {
            id: "r-1".to_string(),
            method: "GET".to_string(),
            path: "/caf\u{e9}?q=\u{2603}".to_string(),
            headers: Headers::new(),
            body: None,
        };
        let text = encode_request(&req).unwrap();
        // Control characters only appear JSON-escaped.
        assert!(!text.chars().any(|c| c.is_control()));
        let back = decode_server_frame(&text).unwrap();
        assert!(matches!(back, ServerFrame::Request(r) if r.path == req.path));
    }
}
