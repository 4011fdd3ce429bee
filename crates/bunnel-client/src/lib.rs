//! bunnel agent library
//!
//! The agent dials the tunnel server, receives its subdomain, and then
//! executes every incoming request against the local HTTP service, sending
//! the response back over the same channel.

pub mod client;
pub mod config;
pub mod forwarder;

use thiserror::Error;

pub use client::TunnelClient;
pub use config::ClientConfig;
pub use forwarder::LocalForwarder;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported URL scheme {scheme:?} in {url}")]
    UnsupportedScheme { scheme: String, url: String },

    #[error("local service unavailable at {url}: {reason}")]
    LocalUnreachable { url: String, reason: String },

    #[error("tunnel connection failed: {0}")]
    Transport(String),

    #[error("tunnel closed before the connected notice arrived")]
    ClosedDuringHandshake,

    #[error("protocol error: {0}")]
    Protocol(#[from] bunnel_proto::ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
