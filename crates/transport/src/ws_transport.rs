//! Channel-backed outbound writer for one WebSocket connection

use crate::{Transport, TransportError};
use async_trait::async_trait;
use futures::{Sink, SinkExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

/// Frame queued for the writer, with an optional slot for the write result
struct Outbound {
    msg: Message,
    ack: Option<oneshot::Sender<Result<(), WsError>>>,
}

/// Write handle for a WebSocket connection
///
/// Frames go through an unbounded channel to a dedicated writer task, so
/// concurrent senders never contend for the socket. `send_text` waits for
/// the writer to report the outcome of its own frame; a socket fault comes
/// back as `TransportError::Io`. Once the writer task has stopped every send
/// fails with `TransportError::Closed`.
#[derive(Debug)]
pub struct WsTransport {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl WsTransport {
    /// Start the writer task over the sink half of a connection
    pub fn spawn<S>(conn_id: u64, mut sink: S) -> (Arc<Self>, JoinHandle<()>)
    where
        S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = tokio::spawn(async move {
            while let Some(Outbound { msg, ack }) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));

                match sink.send(msg).await {
                    Ok(()) => {
                        trace!("Frame written to conn {}", conn_id);
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        warn!("WS send error on conn {}: {}", conn_id, e);
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(e));
                        }
                        break;
                    }
                }

                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("WS writer for conn {} ended", conn_id);
        });

        (Arc::new(Self { conn_id, tx }), writer)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn conn_id(&self) -> u64 {
        self.conn_id
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let (ack, result) = oneshot::channel();
        self.tx
            .send(Outbound {
                msg: Message::text(text),
                ack: Some(ack),
            })
            .map_err(|_| TransportError::Closed(self.conn_id))?;

        // Writer dropped the ack without answering: it stopped before our frame
        match result.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Closed(self.conn_id)),
        }
    }

    /// Ask the writer to send a close frame and stop
    fn close(&self) {
        let _ = self.tx.send(Outbound {
            msg: Message::Close(None),
            ack: None,
        });
    }
}
