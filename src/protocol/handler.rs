//! One task per worker connection.
//!
//! The handler authenticates the upgrade, then reads frames and routes
//! decoded commands into the coordinator until the socket closes, the worker
//! unregisters, goes idle, or is evicted. Whatever ends the session, the
//! worker is removed through [`Coordinator::remove_worker`], which runs at
//! most once per record.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use crate::coordinator::Coordinator;
use crate::error::FleetError;
use crate::protocol::auth::extract_bearer;
use crate::protocol::connection::{close_message, write_loop, ConnectionHandle};
use crate::protocol::messages::{
    error_frame, registered_frame, CloseReason, ProtocolError, RegisterPayload, WorkerCommand,
};
use crate::scheduler::WorkerRecord;

/// `GET /ws` upgrade endpoint for workers.
pub async fn worker_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    let credential = extract_bearer(&headers).or_else(|| params.get("token").cloned());
    ws.on_upgrade(move |socket| serve_connection(coordinator, socket, credential))
}

enum Flow {
    Continue,
    Close(CloseReason),
}

struct Session {
    coordinator: Arc<Coordinator>,
    connection: ConnectionHandle,
    record: Option<Arc<WorkerRecord>>,
}

/// Drive one authenticated-or-rejected worker connection to completion.
pub async fn serve_connection(
    coordinator: Arc<Coordinator>,
    socket: WebSocket,
    credential: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();

    if let Err(e) = coordinator.authorize(credential.as_deref()) {
        tracing::warn!(has_credential = credential.is_some(), error = %e, "Rejected worker connection");
        if let Err(e) = sink.send(close_message(CloseReason::BadCredential)).await {
            tracing::debug!(error = %e, "Close frame not delivered");
        }
        return;
    }

    let config = coordinator.config().connection.clone();
    let (connection, outbound_rx) = ConnectionHandle::channel(config.outbound_capacity);
    let writer = tokio::spawn(write_loop(sink, outbound_rx));

    let mut session = Session {
        coordinator,
        connection: connection.clone(),
        record: None,
    };

    let reason = loop {
        let terminated = {
            let record = session.record.clone();
            async move {
                match record {
                    Some(record) => record.terminated().await,
                    None => std::future::pending().await,
                }
            }
        };

        let next = tokio::select! {
            _ = terminated => break CloseReason::Deregistered,
            next = tokio::time::timeout(config.idle_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                tracing::info!(worker_id = ?session.worker_id(), "Worker connection idle, closing");
                break CloseReason::IdleTimeout;
            }
            Ok(None) => break CloseReason::Normal,
            Ok(Some(Err(e))) => {
                tracing::info!(worker_id = ?session.worker_id(), error = %e, "Worker connection read failed");
                break CloseReason::Normal;
            }
            Ok(Some(Ok(message))) => message,
        };

        let flow = match message {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Binary(_) => session.reject_frame(ProtocolError::BinaryFrame),
            Message::Close(_) => Flow::Close(CloseReason::Normal),
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
        };

        if let Flow::Close(reason) = flow {
            break reason;
        }
    };

    session.cleanup().await;
    connection.close(reason).await;
    drop(connection);
    drop(session);
    if let Err(e) = writer.await {
        tracing::error!(error = %e, "Connection writer task failed");
    }
}

impl Session {
    fn worker_id(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.identity.as_str())
    }

    async fn reply_error(&self, message: &str) {
        match error_frame(message) {
            Ok(text) => {
                if let Err(e) = self.connection.send(text).await {
                    tracing::debug!(error = %e, "Error frame not delivered");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode error frame"),
        }
    }

    fn reject_frame(&self, error: ProtocolError) -> Flow {
        tracing::warn!(worker_id = ?self.worker_id(), error = %error, "Malformed frame, closing connection");
        Flow::Close(CloseReason::MalformedFrame)
    }

    async fn handle_text(&mut self, text: &str) -> Flow {
        let command = match WorkerCommand::decode(text) {
            Ok(command) => command,
            Err(e) if e.is_fatal() => return self.reject_frame(e),
            Err(e) => {
                tracing::warn!(worker_id = ?self.worker_id(), error = %e, "Rejected worker command");
                self.reply_error(&e.to_string()).await;
                return Flow::Continue;
            }
        };

        if let WorkerCommand::Register(payload) = command {
            return self.register(payload).await;
        }

        let Some(record) = self.record.clone() else {
            self.reply_error(&format!("{} before register_worker", command.name()))
                .await;
            return Flow::Continue;
        };
        if command.worker_id() != record.identity {
            self.reply_error(&format!(
                "{} for worker {} on connection of {}",
                command.name(),
                command.worker_id(),
                record.identity
            ))
            .await;
            return Flow::Continue;
        }

        let coordinator = &self.coordinator;
        let result = match &command {
            WorkerCommand::Register(_) => Ok(()),
            WorkerCommand::Unregister(_) => {
                tracing::info!(worker_id = %record.identity, "Worker requested unregistration");
                return Flow::Close(CloseReason::Deregistered);
            }
            WorkerCommand::Acknowledge(r) => coordinator.acknowledge_job(&r.worker_id, &r.job_id).await,
            WorkerCommand::Complete(r) => coordinator
                .complete_job(&r.worker_id, &r.job_id)
                .await
                .map(|_| ()),
            WorkerCommand::Result(r) => {
                coordinator
                    .record_result(&r.worker_id, &r.job_id, &r.result)
                    .await
            }
        };

        if let Err(e) = result {
            tracing::warn!(worker_id = %record.identity, command = command.name(), error = %e, "Worker command failed");
            self.reply_error(&e.to_string()).await;
        }
        Flow::Continue
    }

    async fn register(&mut self, payload: RegisterPayload) -> Flow {
        if let Some(record) = &self.record {
            let message = format!("connection already registered as {}", record.identity);
            self.reply_error(&message).await;
            return Flow::Continue;
        }

        let worker_id = payload.worker_id.clone();
        match self
            .coordinator
            .register_worker(payload, Some(self.connection.clone()))
            .await
        {
            Ok(record) => {
                self.record = Some(record);
                match registered_frame(&worker_id) {
                    Ok(text) => {
                        if self.connection.send(text).await.is_err() {
                            return Flow::Close(CloseReason::Normal);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode registered frame");
                        return Flow::Close(CloseReason::Error);
                    }
                }
                Flow::Continue
            }
            Err(e @ (FleetError::InvalidIdentity(_) | FleetError::DuplicateWorker(_))) => {
                tracing::warn!(worker_id = %worker_id, error = %e, "Registration rejected");
                self.reply_error(&e.to_string()).await;
                Flow::Continue
            }
            Err(e) => {
                tracing::error!(worker_id = %worker_id, error = %e, "Registration failed");
                Flow::Close(CloseReason::Error)
            }
        }
    }

    async fn cleanup(&mut self) {
        if let Some(record) = self.record.take() {
            self.coordinator.remove_worker(&record).await;
        }
    }
}
