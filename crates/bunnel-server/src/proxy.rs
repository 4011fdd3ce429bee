//! Cleartext proxy front-end
//!
//! A convenience listener for callers that cannot speak TLS to the tunnel
//! port. Every request is re-issued against the tunnel port on loopback with
//! the Host header preserved, so subdomain routing behaves identically.

use crate::http::text_response;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub(crate) struct ProxyState {
    /// Tunnel port on loopback this front-end forwards to.
    pub target_port: u16,
    /// Present when the tunnel port runs TLS.
    pub tls: Option<tokio_rustls::TlsConnector>,
    pub max_body_bytes: usize,
}

pub(crate) fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(forward).with_state(state)
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    match try_forward(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "proxy forward failed");
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

async fn try_forward(state: &ProxyState, req: Request) -> Result<Response, anyhow::Error> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")),
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_string());

    let mut builder = hyper::Request::builder().method(parts.method).uri(path);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    let request = builder.body(Full::new(body))?;

    let stream = TcpStream::connect(("127.0.0.1", state.target_port)).await?;
    debug!(target_port = state.target_port, "proxying to tunnel port");

    match &state.tls {
        Some(connector) => {
            let tls = connector
                .connect(crate::tls::loopback_server_name(), stream)
                .await?;
            exchange(tls, request).await
        }
        None => exchange(stream, request).await,
    }
}

/// Run one HTTP/1.1 exchange over a fresh connection.
async fn exchange<S>(
    io: S,
    request: hyper::Request<Full<Bytes>>,
) -> Result<Response, anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "proxy connection ended");
        }
    });

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();

    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        if *name == header::TRANSFER_ENCODING || *name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    Ok(builder.body(Body::from(bytes))?)
}
