//! TLS tunnel port + wss agent + cleartext proxy front-end, end to end.

use axum::routing::get;
use axum::Router;
use bunnel_client::{ClientConfig, TunnelClient};
use bunnel_server::{ServerConfig, TlsMaterial, TunnelServer};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

fn write_self_signed(dir: &tempfile::TempDir) -> TlsMaterial {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "*.localhost".to_string(),
    ])
    .unwrap()
    .self_signed(&key_pair)
    .unwrap();

    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::File::create(&cert_path)
        .unwrap()
        .write_all(cert.pem().as_bytes())
        .unwrap();
    std::fs::File::create(&key_path)
        .unwrap()
        .write_all(key_pair.serialize_pem().as_bytes())
        .unwrap();

    TlsMaterial {
        cert: cert_path,
        key: key_path,
        ca: vec![],
    }
}

async fn proxy_get(addr: SocketAddr, host: &str, path: &str) -> (u16, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(connection);

    let request = hyper::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test(flavor = "multi_thread")]
async fn self_signed_tls_with_proxy_front_end() {
    // Local service
    let app = Router::new().route("/", get(|| async { "hello over tls" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // TLS tunnel server with the cleartext proxy enabled
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(TunnelServer::new(ServerConfig {
        port: 0,
        proxy_port: Some(0),
        request_timeout: Duration::from_secs(5),
        tls: Some(write_self_signed(&dir)),
        ..ServerConfig::default()
    }));
    let runner = server.clone();
    tokio::spawn(async move { runner.start().await });
    let tunnel_addr = server.local_addr().await.expect("tunnel port bind");
    let proxy_port = server.proxy_addr().await.expect("proxy port bind").port();
    let proxy_addr = SocketAddr::from(([127, 0, 0, 1], proxy_port));

    // Agent connects over wss, trusting the self-signed certificate
    let config = ClientConfig::new(
        &format!("http://127.0.0.1:{}", local.port()),
        &format!("wss://localhost:{}", tunnel_addr.port()),
        true,
    )
    .unwrap();
    let client = TunnelClient::connect(config).await.unwrap();
    assert!(client.tunnel_url().starts_with("https://"));

    // Caller reaches the tunnel through the cleartext proxy; the proxy hops
    // to the TLS port on loopback.
    let host = format!("{}.localhost:{}", client.subdomain(), proxy_addr.port());
    let (status, body) = proxy_get(proxy_addr, &host, "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello over tls");

    // Health probe through the proxy too.
    let (status, body) = proxy_get(proxy_addr, "localhost", "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "Tunnel server is running");

    server.shutdown();
}
