//! Tunnel server assembly and lifecycle

use crate::http::{self, AppState};
use crate::proxy::{self, ProxyState};
use crate::{monitor, tls, ServerConfig, ServerError};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The long-lived tunnel server: one listener for upgrades and tunneled
/// HTTP, the idle sweeper, and the optional cleartext proxy front-end.
pub struct TunnelServer {
    state: Arc<AppState>,
    handle: Handle,
    proxy_handle: Handle,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: AppState::new(config),
            handle: Handle::new(),
            proxy_handle: Handle::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Address the tunnel listener actually bound, once it is up.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    /// Address the proxy front-end bound, once it is up.
    pub async fn proxy_addr(&self) -> Option<SocketAddr> {
        self.proxy_handle.listening().await
    }

    /// Run until shutdown. Binds the tunnel port (TLS when material is
    /// configured), spawns the idle monitor and the proxy front-end, and on
    /// exit reaps every tunnel so no caller is left hanging.
    pub async fn start(&self) -> Result<(), ServerError> {
        let config = self.state.config.clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

        let rustls_config = match &config.tls {
            Some(material) => {
                let server_config = tls::build_server_config(material)?;
                Some(RustlsConfig::from_config(Arc::new(server_config)))
            }
            None => None,
        };

        *self.monitor.lock().unwrap() = Some(monitor::spawn(
            self.state.registry.clone(),
            config.sweep_interval,
            config.idle_timeout,
        ));

        if let Some(proxy_port) = config.proxy_port {
            self.spawn_proxy(proxy_port, config.tls.is_some(), config.max_body_bytes);
        }

        let app = http::router(self.state.clone());
        info!(
            port = config.port,
            tls = config.tls.is_some(),
            root = %config.root_label,
            "tunnel server starting"
        );

        let served = match rustls_config {
            Some(rustls_config) => {
                axum_server::bind_rustls(addr, rustls_config)
                    .handle(self.handle.clone())
                    .serve(app.into_make_service())
                    .await
            }
            None => {
                axum_server::bind(addr)
                    .handle(self.handle.clone())
                    .serve(app.into_make_service())
                    .await
            }
        };

        self.cleanup();
        served.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// The proxy resolves the tunnel port's real address first, so it also
    /// works when the tunnel port was bound ephemeral.
    fn spawn_proxy(&self, proxy_port: u16, tls_enabled: bool, max_body_bytes: usize) {
        let tunnel_handle = self.handle.clone();
        let proxy_handle = self.proxy_handle.clone();
        tokio::spawn(async move {
            let Some(tunnel_addr) = tunnel_handle.listening().await else {
                return;
            };
            let state = Arc::new(ProxyState {
                target_port: tunnel_addr.port(),
                tls: tls_enabled.then(tls::loopback_connector),
                max_body_bytes,
            });
            let app = proxy::router(state);
            let addr = SocketAddr::from(([0, 0, 0, 0], proxy_port));
            info!(port = proxy_port, "proxy front-end starting");
            if let Err(err) = axum_server::bind(addr)
                .handle(proxy_handle)
                .serve(app.into_make_service())
                .await
            {
                error!(port = proxy_port, error = %err, "proxy front-end failed");
            }
        });
    }

    /// Begin graceful shutdown; `start` returns once in-flight work drains.
    pub fn shutdown(&self) {
        info!("tunnel server shutting down");
        self.handle.graceful_shutdown(Some(Duration::from_secs(1)));
        self.proxy_handle
            .graceful_shutdown(Some(Duration::from_secs(1)));
    }

    fn cleanup(&self) {
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.abort();
        }
        self.proxy_handle.shutdown();
        self.state.registry.reap_all();
        info!("tunnel server stopped");
    }
}
