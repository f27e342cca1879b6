//! WebSocket server for handling client connections

use hyper::header::{CONNECTION, HeaderMap, HeaderValue, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::info;

#[derive(Error, Debug)]
pub enum WssServerError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Server side of an upgraded HTTP connection
pub type ServerStream = WebSocketStream<TokioIo<Upgraded>>;

/// WebSocket server (TCP accept; HTTP parsing and upgrade happen in the daemon)
pub struct WssServer {
    listener: TcpListener,
}

impl WssServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr) -> Result<Self, WssServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WssServerError::BindFailed(e.to_string()))?;

        info!("WebSocket server listening on {}", addr);

        Ok(Self { listener })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept next connection
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), WssServerError> {
        self.listener
            .accept()
            .await
            .map_err(|e| WssServerError::AcceptFailed(e.to_string()))
    }
}

/// Whether the request headers ask for a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|s| s.eq_ignore_ascii_case("websocket"));

    let connection = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|s| {
            s.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });

    upgrade && connection && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// `Sec-WebSocket-Accept` value for the client's key
pub fn accept_key(headers: &HeaderMap) -> Result<HeaderValue, WssServerError> {
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| WssServerError::UpgradeFailed("missing Sec-WebSocket-Key".into()))?;

    HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(|e| WssServerError::UpgradeFailed(e.to_string()))
}

/// Wrap an upgraded connection as a server-role WebSocket stream
pub async fn accept_upgraded(upgraded: Upgraded) -> ServerStream {
    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await
}
