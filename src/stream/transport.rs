//! # Transport
//!
//! The controller talks to the simulation server through the [`Transport`]
//! trait. A connected transport is reduced to two channels: text frames going
//! out and frames (or a terminal error) coming in. When the inbound channel
//! closes, the connection is over.
//!
//! [`WsTransport`] is the tokio-tungstenite implementation. It splits the socket
//! and runs one pump task per direction.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection error: {0}")]
    Receive(String),
}

/// One inbound frame as the controller sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A live, established connection.
pub struct Connection {
    /// Identifies the connection in logs
    pub id: Uuid,
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve once the connection is open (or has failed to open).
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let id = Uuid::new_v4();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(connection_id = %id, error = %err, "websocket send failed");
                    break;
                }
            }
            // Sender dropped: the controller is done with this connection
            let _ = ws_writer.close().await;
            debug!(connection_id = %id, "websocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Ok(Frame::Text(text)),
                    Ok(Message::Binary(data)) => Ok(Frame::Binary(data)),
                    Ok(Message::Close(reason)) => {
                        debug!(connection_id = %id, ?reason, "websocket closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => Err(TransportError::Receive(err.to_string())),
                };
                let terminal = frame.is_err();
                if in_tx.send(frame).is_err() || terminal {
                    break;
                }
            }
            debug!(connection_id = %id, "websocket reader finished");
        });

        Ok(Connection {
            id,
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
