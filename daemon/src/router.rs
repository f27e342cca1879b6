//! Message routing between connected users
//!
//! Every delivery path ends in [`MessageRouter::deliver`]: peer-to-peer frames
//! arriving on a connection, server-side pushes and the welcome notice sent on
//! connect. Delivery is best-effort; nothing is queued or retried.

use crate::connection_registry::{ConnectionHandle, ConnectionRegistry};
use crate::metrics::METRICS;
use imserver_protocol::{Envelope, EnvelopeError, is_blank};
use imserver_transport::TransportError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("User {0} is not online")]
    RecipientOffline(String),

    #[error("Delivery to {user_id} failed: {source}")]
    DeliveryFailed {
        user_id: String,
        #[source]
        source: TransportError,
    },

    #[error("Malformed envelope from {from}: {source}")]
    Malformed {
        from: String,
        #[source]
        source: EnvelopeError,
    },
}

/// Successful routing outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the recipient's transport
    Delivered,
    /// Blank input, nothing to route
    Skipped,
}

pub type DeliveryResult = Result<Delivery, RouteError>;

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    welcome_text: String,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, welcome_text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            welcome_text: welcome_text.into(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Write `body` to whoever is registered as `to_user_id`
    pub async fn deliver(&self, to_user_id: &str, body: String) -> DeliveryResult {
        let Some(handle) = self.registry.lookup(to_user_id) else {
            warn!("User {} is not online, message dropped", to_user_id);
            METRICS.messages_offline.inc();
            return Err(RouteError::RecipientOffline(to_user_id.to_string()));
        };

        self.write(&handle, body).await
    }

    /// Route a text frame received from `from_user_id`'s connection
    ///
    /// The sender field is always overwritten with the id the connection
    /// registered under, whatever the client put there.
    pub async fn route_inbound(&self, raw: &str, from_user_id: &str) -> DeliveryResult {
        if is_blank(raw) {
            trace!("Blank frame from {}, ignored", from_user_id);
            return Ok(Delivery::Skipped);
        }
        debug!("Message from {}: {}", from_user_id, raw);

        let (to_user_id, body) = match Self::restamp(raw, from_user_id) {
            Ok(routed) => routed,
            Err(source) => {
                warn!("Dropping malformed message from {}: {}", from_user_id, source);
                METRICS.malformed_envelopes.inc();
                return Err(RouteError::Malformed {
                    from: from_user_id.to_string(),
                    source,
                });
            }
        };

        self.deliver(&to_user_id, body).await
    }

    /// Send the welcome notice to a connection that just registered
    ///
    /// Goes straight to `handle`, not through a lookup, so it always reaches
    /// the connection that opened even if the same user id reconnected since.
    pub async fn announce(&self, handle: &ConnectionHandle) -> DeliveryResult {
        self.write(handle, self.welcome_text.clone()).await
    }

    /// Push entry point for callers outside a connection lifecycle
    ///
    /// No caller authentication happens here.
    pub async fn push_external(&self, to_user_id: &str, body: String) -> DeliveryResult {
        METRICS.pushes.inc();
        debug!("Push to {}: {}", to_user_id, body);

        if is_blank(to_user_id) {
            warn!("Push without recipient, message dropped");
            METRICS.messages_offline.inc();
            return Err(RouteError::RecipientOffline(to_user_id.to_string()));
        }

        self.deliver(to_user_id, body).await
    }

    fn restamp(raw: &str, from_user_id: &str) -> Result<(String, String), EnvelopeError> {
        let mut envelope = Envelope::parse(raw)?;
        if let Some(claimed) = envelope.from_user_id().filter(|claimed| *claimed != from_user_id) {
            warn!("{} sent a message as {}, sender overwritten", from_user_id, claimed);
        }
        envelope.stamp_sender(from_user_id);
        let to_user_id = envelope.to_user_id()?.to_string();
        Ok((to_user_id, envelope.to_text()?))
    }

    async fn write(&self, handle: &ConnectionHandle, body: String) -> DeliveryResult {
        let size = body.len();

        match handle.transport.send_text(body).await {
            Ok(()) => {
                METRICS.messages_delivered.inc();
                METRICS.message_size.observe(size as f64);
                trace!("Delivered {} bytes to {} (conn {})", size, handle.user_id, handle.conn_id);
                Ok(Delivery::Delivered)
            }
            Err(source) => {
                // Entry stays registered; the connection's own close path removes it
                warn!("Delivery to {} failed: {}", handle.user_id, source);
                METRICS.delivery_failures.inc();
                Err(RouteError::DeliveryFailed {
                    user_id: handle.user_id.clone(),
                    source,
                })
            }
        }
    }
}
