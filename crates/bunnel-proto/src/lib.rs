//! Wire protocol for the bunnel tunnel.
//!
//! The control channel carries JSON text frames in both directions:
//!
//! - server -> agent: [`ConnectedNotice`] once at session establishment,
//!   then one [`TunnelRequest`] per proxied HTTP request.
//! - agent -> server: one [`TunnelResponse`] per request, correlated by id.
//!
//! Frames relayed from secondary client channels are passed through opaquely
//! and never travel through this codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_response, decode_server_frame, encode_connected, encode_request, encode_response,
    ProtocolError,
};
pub use messages::{ConnectedNotice, Headers, ServerFrame, TunnelRequest, TunnelResponse};
