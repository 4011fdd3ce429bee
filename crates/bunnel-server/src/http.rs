//! HTTP front door
//!
//! A single fallback handler dispatches every incoming request by Host
//! header, in priority order: health probe, WebSocket upgrade (new agent on
//! the root host, secondary client on a tunnel host), tunneled HTTP.

use crate::allocator::SubdomainAllocator;
use crate::pending::PendingRequests;
use crate::registry::TunnelRegistry;
use crate::session;
use crate::ServerConfig;
use axum::body::Body;
use axum::extract::{Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::Router;
use bunnel_proto::{encode_request, Headers, TunnelRequest, TunnelResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shared state behind the tunnel listener.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: TunnelRegistry,
    pub pending: PendingRequests,
    pub allocator: SubdomainAllocator,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let pending = PendingRequests::new();
        Arc::new(Self {
            registry: TunnelRegistry::new(pending.clone()),
            pending,
            allocator: SubdomainAllocator::new(),
            config,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

/// Where a Host header routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRoute {
    /// The root host itself: health probe, or a new agent control channel.
    Root,
    /// `<subdomain>.<root>`: tunneled HTTP or a secondary client channel.
    Tunnel(String),
    /// Anything else.
    Unknown,
}

impl HostRoute {
    /// Classify a Host header value against the configured root label.
    /// Comparison is ASCII case-insensitive with the port stripped.
    pub fn parse(host: &str, root: &str) -> Self {
        let host = strip_port(host).to_ascii_lowercase();
        let root = root.to_ascii_lowercase();
        if host.is_empty() {
            return HostRoute::Unknown;
        }
        if host == root || !host.contains('.') {
            return HostRoute::Root;
        }
        // "<root>.<anything>" counts as the root host: the leftmost label
        // is what identifies the server itself.
        if host.split('.').next() == Some(root.as_str()) {
            return HostRoute::Root;
        }
        if let Some(label) = host.strip_suffix(&format!(".{root}")) {
            if is_valid_label(label) {
                return HostRoute::Tunnel(label.to_string());
            }
        }
        HostRoute::Unknown
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split(':').next().unwrap_or(host)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && !label.contains('.')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    req: Request,
) -> Response {
    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
    };
    let route = HostRoute::parse(&host, &state.config.root_label);

    if let Some(ws) = ws {
        return match route {
            HostRoute::Root => {
                let subdomain = state.allocator.allocate(&state.registry);
                ws.on_upgrade(move |socket| session::run_control(socket, subdomain, state))
            }
            HostRoute::Tunnel(sub) if state.registry.contains(&sub) => {
                ws.on_upgrade(move |socket| session::run_client(socket, sub, state))
            }
            HostRoute::Tunnel(_) => text_response(StatusCode::NOT_FOUND, "Tunnel not found"),
            HostRoute::Unknown => text_response(StatusCode::BAD_REQUEST, "Malformed Host header"),
        };
    }

    match route {
        HostRoute::Tunnel(sub) => forward_request(state, sub, req).await,
        HostRoute::Root => {
            if req.method() == Method::GET && req.uri().path() == "/" {
                text_response(StatusCode::OK, "Tunnel server is running")
            } else {
                text_response(StatusCode::NOT_FOUND, "Not found")
            }
        }
        HostRoute::Unknown => text_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// Serialise one HTTP request over the tunnel and await the agent's answer.
async fn forward_request(state: Arc<AppState>, subdomain: String, req: Request) -> Response {
    if !state.registry.contains(&subdomain) {
        return text_response(StatusCode::NOT_FOUND, "Tunnel not found");
    }

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_string());

    let body = match Limited::new(body, state.config.max_body_bytes)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large");
        }
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "Unreadable request body"),
    };

    let request = TunnelRequest {
        id: Uuid::new_v4().simple().to_string(),
        method: parts.method.as_str().to_owned(),
        path,
        headers: forwardable_headers(&parts.headers),
        body: request_body(&parts.method, body),
    };
    let frame = match encode_request(&request) {
        Ok(text) => axum::extract::ws::Message::Text(text),
        Err(err) => {
            warn!(subdomain = %subdomain, error = %err, "failed to encode request frame");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };

    // The pending entry goes in before the frame goes out, so an immediate
    // response cannot race past an empty table. The table-side ttl outlives
    // the await below; it only catches callers that disappear mid-wait.
    let ttl = state.config.request_timeout + Duration::from_secs(30);
    let receiver = state.pending.register(&subdomain, &request.id, ttl);

    let Some(control) = state.registry.control_sender(&subdomain) else {
        state.pending.cancel(&request.id);
        return text_response(StatusCode::NOT_FOUND, "Tunnel not found");
    };
    if control.send(frame).await.is_err() {
        // The writer is gone: the channel is dead even if the registry entry
        // has not caught up yet.
        debug!(subdomain = %subdomain, "control channel send failed");
        state.pending.cancel(&request.id);
        state.registry.reap(&subdomain);
        return text_response(StatusCode::BAD_GATEWAY, "Tunnel connection lost");
    }
    state.registry.touch(&subdomain);

    match timeout(state.config.request_timeout, receiver).await {
        Ok(Ok(response)) => {
            state.registry.touch(&subdomain);
            tunnel_response(response)
        }
        Ok(Err(_)) => text_response(StatusCode::BAD_GATEWAY, "Tunnel connection lost"),
        Err(_) => {
            state.pending.cancel(&request.id);
            text_response(StatusCode::GATEWAY_TIMEOUT, "Request timeout")
        }
    }
}

/// Hop-by-hop headers never cross the tunnel (RFC 9110 §7.6.1), and Host is
/// rewritten by the agent for its local service.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

fn forwardable_headers(headers: &HeaderMap) -> Headers {
    let mut map = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&name) || name == "host" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.insert(name, value.to_owned());
        }
    }
    map
}

fn request_body(method: &Method, bytes: Bytes) -> Option<String> {
    let bodyless = matches!(method.as_str(), "GET" | "HEAD" | "DELETE" | "OPTIONS");
    if bytes.is_empty() && bodyless {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Translate the agent's wire response into an HTTP response.
fn tunnel_response(response: TunnelResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        let name = name.to_ascii_lowercase();
        // The body is re-materialised here, so the original framing headers
        // no longer apply.
        if is_hop_by_hop(&name) || name == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
}

pub(crate) fn text_response(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}
