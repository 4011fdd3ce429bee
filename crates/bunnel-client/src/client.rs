//! Tunnel client state machine
//!
//! `connect` resolves once the server's connected notice arrives, after
//! which a background reader executes every incoming request against the
//! local service. Requests run on their own tasks, so responses may complete
//! out of order; the server correlates them by id.

use crate::config::ClientConfig;
use crate::forwarder::LocalForwarder;
use crate::ClientError;
use bunnel_proto::{decode_server_frame, encode_response, ConnectedNotice, ServerFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Shared {
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// A live tunnel session.
pub struct TunnelClient {
    subdomain: String,
    tunnel_url: String,
    outbound: mpsc::Sender<Message>,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
}

impl TunnelClient {
    /// Probe the local service, dial the tunnel server, and wait for the
    /// connected notice. Errors here are terminal; there is no retry loop.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let forwarder = LocalForwarder::new(&config.local_url)?;
        forwarder.probe(config.probe_timeout).await?;

        let ws = dial(&config).await?;
        let (sink, stream) = ws.split();

        let (outbound, outbound_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(write_loop(sink, outbound_rx));

        let (ready_tx, ready_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(read_loop(
            stream,
            forwarder,
            outbound.clone(),
            ready_tx,
            shared.clone(),
        ));

        let notice = tokio::time::timeout(config.connect_timeout, ready_rx)
            .await
            .map_err(|_| ClientError::Transport("timed out waiting for connected notice".into()))?
            .map_err(|_| ClientError::ClosedDuringHandshake)?;

        let tunnel_url = config.public_url(&notice.subdomain);
        shared.connected.store(true, Ordering::SeqCst);
        info!(subdomain = %notice.subdomain, url = %tunnel_url, "tunnel established");

        Ok(Self {
            subdomain: notice.subdomain,
            tunnel_url,
            outbound,
            shared,
            closed_rx,
        })
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    /// Public URL callers use to reach the local service.
    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Close the tunnel. Terminal: reconnecting means a fresh `connect`.
    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None)).await;
        debug!(subdomain = %self.subdomain, "disconnect requested");
    }

    /// Resolves when the session ends, whatever the reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn dial(config: &ClientConfig) -> Result<WsStream, ClientError> {
    let url = config.tunnel_url.as_str();
    let (ws, _response) = if config.tunnel_url.scheme() == "wss" {
        let connector = if config.self_signed {
            insecure_tls_connector()
        } else {
            webpki_tls_connector()
        };
        tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
    } else {
        tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?
    };
    debug!(url = %url, "websocket connected");
    Ok(ws)
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    forwarder: LocalForwarder,
    outbound: mpsc::Sender<Message>,
    ready_tx: oneshot::Sender<ConnectedNotice>,
    shared: Arc<Shared>,
) {
    let mut ready = Some(ready_tx);

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("tunnel closed by server");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "tunnel read error");
                break;
            }
        };

        match decode_server_frame(&text) {
            Ok(ServerFrame::Connected(notice)) => match ready.take() {
                Some(tx) => {
                    let _ = tx.send(notice);
                }
                None => debug!("duplicate connected notice ignored"),
            },
            Ok(ServerFrame::Request(request)) => {
                let forwarder = forwarder.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = forwarder.execute(request).await;
                    match encode_response(&response) {
                        Ok(frame) => {
                            let _ = outbound.send(Message::Text(frame)).await;
                        }
                        Err(err) => {
                            warn!(request_id = %response.id, error = %err, "failed to encode response")
                        }
                    }
                });
            }
            // No id is recoverable from an unparseable frame, so there is
            // nothing useful to answer; drop it.
            Err(err) => warn!(error = %err, "dropping unparseable frame"),
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    let _ = shared.closed_tx.send(true);
    info!("tunnel session ended");
}

fn webpki_tls_connector() -> Connector {
    ensure_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Connector::Rustls(Arc::new(config))
}

/// Skip certificate verification: the `--self-signed` escape hatch. The
/// permissive config is scoped to this one connection, never process-wide.
fn insecure_tls_connector() -> Connector {
    ensure_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth();
    Connector::Rustls(Arc::new(config))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
