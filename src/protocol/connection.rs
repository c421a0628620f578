use std::fmt::Display;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{FleetError, Result};
use crate::protocol::messages::CloseReason;

/// A frame queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Text {
        text: String,
        /// Resolved once the frame has been written (or failed to be)
        ack: Option<oneshot::Sender<std::result::Result<(), String>>>,
    },
    Close(CloseReason),
}

/// Cheap, cloneable handle for writing to one worker connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a frame without waiting for it to be written.
    pub async fn send(&self, text: String) -> Result<()> {
        self.tx
            .send(Outbound::Text { text, ack: None })
            .await
            .map_err(|_| FleetError::Delivery("connection closed".to_string()))
    }

    /// Write a frame and wait until the socket accepted it.
    pub async fn deliver(&self, text: String) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Text {
                text,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| FleetError::Delivery("connection closed".to_string()))?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FleetError::Delivery(e)),
            Err(_) => Err(FleetError::Delivery(
                "connection closed before write".to_string(),
            )),
        }
    }

    pub async fn close(&self, reason: CloseReason) {
        // Writer already gone means the socket is closed anyway.
        let _ = self.tx.send(Outbound::Close(reason)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }))
}

/// Drain queued frames into the socket until closed or a write fails.
pub async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Text { text, ack } => {
                let result = sink
                    .send(Message::Text(text))
                    .await
                    .map_err(|e| e.to_string());
                let failed = result.is_err();
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "Write to worker connection failed");
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
                if failed {
                    return;
                }
            }
            Outbound::Close(reason) => {
                if let Err(e) = sink.send(close_message(reason)).await {
                    tracing::debug!(error = %e, "Close frame not delivered");
                }
                return;
            }
        }
    }
    let _ = sink.close().await;
}
