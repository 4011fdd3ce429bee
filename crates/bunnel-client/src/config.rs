//! Agent configuration

use crate::ClientError;
use std::time::Duration;
use url::Url;

/// Agent configuration, normally built from the CLI flags.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local HTTP service the agent forwards to, e.g. `http://localhost:3000`.
    pub local_url: Url,
    /// Tunnel server upgrade endpoint, `ws://` or `wss://`.
    pub tunnel_url: Url,
    /// Accept a self-signed certificate from the tunnel server (wss only).
    pub self_signed: bool,
    /// Availability probe timeout against the local service.
    pub probe_timeout: Duration,
    /// How long to wait for the connected notice after the upgrade.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(local: &str, tunnel: &str, self_signed: bool) -> Result<Self, ClientError> {
        let local_url = Url::parse(local)?;
        if local_url.scheme() != "http" {
            return Err(ClientError::UnsupportedScheme {
                scheme: local_url.scheme().to_string(),
                url: local.to_string(),
            });
        }

        let tunnel_url = Url::parse(tunnel)?;
        if !matches!(tunnel_url.scheme(), "ws" | "wss") {
            return Err(ClientError::UnsupportedScheme {
                scheme: tunnel_url.scheme().to_string(),
                url: tunnel.to_string(),
            });
        }

        Ok(Self {
            local_url,
            tunnel_url,
            self_signed,
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        })
    }

    /// Public URL for a subdomain issued by this config's tunnel server.
    pub fn public_url(&self, subdomain: &str) -> String {
        let scheme = if self.tunnel_url.scheme() == "wss" {
            "https"
        } else {
            "http"
        };
        let host = self.tunnel_url.host_str().unwrap_or("localhost");
        match self.tunnel_url.port() {
            Some(port) => format!("{scheme}://{subdomain}.{host}:{port}"),
            None => format!("{scheme}://{subdomain}.{host}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_local_and_ws_tunnel() {
        let config =
            ClientConfig::new("http://localhost:3000", "ws://localhost:4444", false).unwrap();
        assert_eq!(config.local_url.port(), Some(3000));
        assert!(!config.self_signed);
    }

    #[test]
    fn rejects_non_http_local() {
        let err = ClientConfig::new("ftp://localhost", "ws://localhost:4444", false).unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedScheme { .. }));
    }

    #[test]
    fn rejects_non_ws_tunnel() {
        let err =
            ClientConfig::new("http://localhost:3000", "http://localhost:4444", false).unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedScheme { .. }));
    }

    #[test]
    fn public_url_follows_tunnel_scheme_and_port() {
        let ws = ClientConfig::new("http://localhost:3000", "ws://localhost:4444", false).unwrap();
        assert_eq!(ws.public_url("abc"), "http://abc.localhost:4444");

        let wss =
            ClientConfig::new("http://localhost:3000", "wss://tunnel.example.com", true).unwrap();
        assert_eq!(wss.public_url("abc"), "https://abc.tunnel.example.com");
    }
}
