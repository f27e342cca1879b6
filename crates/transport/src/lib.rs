//! imserver Transport - WebSocket and network layer
//!
//! This crate provides:
//! - `Transport`: the send-text capability the router writes through
//! - `WsTransport`: a channel-backed writer for one WebSocket connection
//! - `WssServer`: TCP listener plus the HTTP upgrade handshake helpers

mod ws_transport;
mod wss_server;

pub use ws_transport::*;
pub use wss_server::*;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection {0} is closed")]
    Closed(u64),

    #[error("Write failed: {0}")]
    Io(#[source] WsError),
}

/// Write side of one live connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection this transport writes to
    fn conn_id(&self) -> u64;

    /// Send a text frame to the peer, resolving once it has been written
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Start closing the connection; later sends fail
    fn close(&self);
}

pub type SharedTransport = Arc<dyn Transport>;
