//! Local HTTP forwarding
//!
//! Executes tunnel requests against the local service over a pooled HTTP/1.1
//! connection. A request that cannot be executed never propagates an error
//! upward: the agent answers 502 so the caller on the far side always gets a
//! response.

use crate::ClientError;
use bunnel_proto::{Headers, TunnelRequest, TunnelResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// Headers that must not be replayed against the local service.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Forwards requests to the local service with a single cached connection.
#[derive(Clone)]
pub struct LocalForwarder {
    /// host:port dialled for every connection.
    addr: String,
    /// Host header presented to the local service.
    authority: HeaderValue,
    pool: Arc<Mutex<Option<http1::SendRequest<Full<Bytes>>>>>,
}

impl LocalForwarder {
    pub fn new(local_url: &Url) -> Result<Self, ClientError> {
        let host = local_url
            .host_str()
            .ok_or_else(|| ClientError::UnsupportedScheme {
                scheme: local_url.scheme().to_string(),
                url: local_url.to_string(),
            })?;
        let port = local_url.port_or_known_default().unwrap_or(80);
        let addr = format!("{host}:{port}");
        let authority =
            HeaderValue::from_str(&addr).map_err(|_| ClientError::UnsupportedScheme {
                scheme: local_url.scheme().to_string(),
                url: local_url.to_string(),
            })?;
        Ok(Self {
            addr,
            authority,
            pool: Arc::new(Mutex::new(None)),
        })
    }

    /// Availability probe: a HEAD request that only has to be answered, not
    /// succeed. Run before dialling the tunnel server.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ClientError> {
        let request = Request::builder()
            .method(Method::HEAD)
            .uri("/")
            .header(HOST, self.authority.clone())
            .body(Full::new(Bytes::new()))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        tokio::time::timeout(timeout, async {
            let mut sender = self.connect().await?;
            sender
                .send_request(request)
                .await
                .map_err(|e| ClientError::LocalUnreachable {
                    url: self.addr.clone(),
                    reason: e.to_string(),
                })?;
            Ok::<_, ClientError>(())
        })
        .await
        .map_err(|_| ClientError::LocalUnreachable {
            url: self.addr.clone(),
            reason: format!("no response within {}s", timeout.as_secs()),
        })?
    }

    /// Execute one tunnel request. Infallible by design: failures map to a
    /// 502 response carrying the request's id.
    pub async fn execute(&self, request: TunnelRequest) -> TunnelResponse {
        let id = request.id.clone();
        match self.try_execute(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(request_id = %id, error = %err, "local request failed");
                TunnelResponse::bad_gateway(id)
            }
        }
    }

    async fn try_execute(&self, request: TunnelRequest) -> Result<TunnelResponse, ClientError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let path = if request.path.starts_with('/') {
            request.path.clone()
        } else {
            format!("/{}", request.path)
        };

        let mut builder = Request::builder().method(method).uri(&path);
        for (name, value) in &request.headers {
            let lower = name.to_ascii_lowercase();
            if SKIPPED_REQUEST_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            builder = builder.header(lower.as_str(), value.as_str());
        }
        builder = builder.header(HOST, self.authority.clone());

        let body = Bytes::from(request.body.unwrap_or_default());
        let local_request = builder
            .body(Full::new(body))
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let mut sender = self.checkout().await?;
        let response = sender
            .send_request(local_request)
            .await
            .map_err(|e| ClientError::LocalUnreachable {
                url: self.addr.clone(),
                reason: e.to_string(),
            })?;

        let (parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| ClientError::LocalUnreachable {
                url: self.addr.clone(),
                reason: e.to_string(),
            })?
            .to_bytes();
        // Body fully consumed, the connection can take another request.
        self.checkin(sender).await;

        Ok(TunnelResponse {
            id: request.id,
            status: parts.status.as_u16(),
            headers: collect_headers(&parts.headers),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    async fn checkout(&self) -> Result<http1::SendRequest<Full<Bytes>>, ClientError> {
        if let Some(sender) = self.pool.lock().await.take() {
            if sender.is_ready() {
                debug!(target = %self.addr, "reusing local connection");
                return Ok(sender);
            }
        }
        self.connect().await
    }

    async fn checkin(&self, sender: http1::SendRequest<Full<Bytes>>) {
        *self.pool.lock().await = Some(sender);
    }

    async fn connect(&self) -> Result<http1::SendRequest<Full<Bytes>>, ClientError> {
        let stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ClientError::LocalUnreachable {
                    url: self.addr.clone(),
                    reason: e.to_string(),
                })?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClientError::LocalUnreachable {
                url: self.addr.clone(),
                reason: e.to_string(),
            })?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "local connection ended");
            }
        });
        debug!(target = %self.addr, "connected to local service");
        Ok(sender)
    }
}

/// Lowercase names, last write wins, values read as text.
fn collect_headers(headers: &hyper::HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_ascii_lowercase(), value.to_owned());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder() -> LocalForwarder {
        let url = Url::parse("http://localhost:3000").unwrap();
        LocalForwarder::new(&url).unwrap()
    }

    #[test]
    fn derives_authority_from_url() {
        let fwd = forwarder();
        assert_eq!(fwd.addr, "localhost:3000");

        let no_port = LocalForwarder::new(&Url::parse("http://svc.internal").unwrap()).unwrap();
        assert_eq!(no_port.addr, "svc.internal:80");
    }

    #[test]
    fn collect_headers_lowercases_and_dedupes() {
        let mut headers = hyper::HeaderMap::new();
        headers.append("X-Thing", "one".parse().unwrap());
        headers.append("x-thing", "two".parse().unwrap());
        headers.insert("Content-Type", "text/plain".parse().unwrap());

        let map = collect_headers(&headers);
        assert_eq!(map.get("x-thing").unwrap(), "two");
        assert_eq!(map.get("content-type").unwrap(), "text/plain");
    }

    #[tokio::test]
    async fn unreachable_service_maps_to_bad_gateway() {
        // Nothing listens on this port.
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        let fwd = LocalForwarder::new(&url).unwrap();

        let response = fwd
            .execute(TunnelRequest {
                id: "r-1".to_string(),
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: Headers::new(),
                body: None,
            })
            .await;

        assert_eq!(response.id, "r-1");
        assert_eq!(response.status, 502);
        assert_eq!(response.body, "Bad Gateway");
    }

    #[tokio::test]
    async fn probe_fails_fast_when_service_is_down() {
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        let fwd = LocalForwarder::new(&url).unwrap();

        let err = fwd.probe(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::LocalUnreachable { .. }));
    }
}
