use axum::{
    Extension,
    extract::{
        Query, State,
        rejection::QueryRejection,
        ws::{
            CloseFrame, Message, WebSocket, WebSocketUpgrade,
            rejection::WebSocketUpgradeRejection,
        },
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, future};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::auth::{Auth, AuthRejection};
use crate::core::processor::SharedProcessor;
use crate::core::session::Session;
use crate::core::turn::{Inbound, MessageRoute, ServerMessage, TurnScheduler};
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Close code for a connection that failed authentication
pub const CLOSE_AUTH_REQUIRED: u16 = 4401;
/// Close code for an unknown session or one owned by another client
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;
/// Close code for a backend failure during the handshake
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Optimized channel buffer size for the outbound queue
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (1 MB)
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum WebSocket message size (1 MB)
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long queued messages may take to flush once the connection is done
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct RealtimeQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("authentication required: {}", .0.as_str())]
    Unauthorized(AuthRejection),
    #[error("session_id query parameter is required")]
    MissingSessionId,
    #[error("session not found")]
    SessionNotFound,
    #[error("session unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("processor unavailable: {0}")]
    ProcessorUnavailable(String),
}

impl HandshakeError {
    fn close_code(&self) -> u16 {
        match self {
            HandshakeError::Unauthorized(_) => CLOSE_AUTH_REQUIRED,
            HandshakeError::MissingSessionId | HandshakeError::SessionNotFound => {
                CLOSE_SESSION_NOT_FOUND
            }
            HandshakeError::DirectoryUnavailable(_) | HandshakeError::ProcessorUnavailable(_) => {
                CLOSE_INTERNAL_ERROR
            }
        }
    }
}

/// Realtime WebSocket handler
///
/// Upgrades the HTTP connection to WebSocket for a turn-scheduled
/// conversation. Authentication and session problems are reported with
/// close codes after the upgrade rather than HTTP errors.
///
/// # Arguments
/// * `ws` - The WebSocket upgrade request from Axum
/// * `state` - Application state containing configuration and backends
/// * `query` - `session_id` of the conversation to attach to
/// * `auth` - Auth context from middleware
/// * `client_ip` - Connection slot owner, set by the connection-limit middleware
pub async fn realtime_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RealtimeQuery>, QueryRejection>,
    Extension(auth): Extension<Auth>,
    client_ip: Option<Extension<ClientIp>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let client_ip = client_ip.map(|Extension(ClientIp(ip))| ip);
    let query = match query {
        Ok(Query(query)) => query,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed realtime query string");
            RealtimeQuery::default()
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected realtime upgrade request");
            if let Some(ip) = client_ip {
                state.release_connection(ip);
            }
            return rejection.into_response();
        }
    };

    info!(
        auth_id = ?auth.id(),
        session_id = ?query.session_id,
        "Realtime WebSocket connection upgrade requested"
    );

    let failed_state = state.clone();
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_failed_upgrade(move |e| {
            warn!(error = %e, "Realtime WebSocket upgrade failed");
            if let Some(ip) = client_ip {
                failed_state.release_connection(ip);
            }
        })
        .on_upgrade(move |socket| async move {
            handle_realtime_socket(socket, &state, auth, query.session_id).await;
            if let Some(ip) = client_ip {
                state.release_connection(ip);
            }
        })
}

/// Handle the realtime WebSocket connection
async fn handle_realtime_socket(
    socket: WebSocket,
    app_state: &Arc<AppState>,
    auth: Auth,
    session_id: Option<String>,
) {
    let (mut sender, receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);

    // Single writer for the socket; every outbound frame goes through message_tx
    let mut sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, MessageRoute::Close { .. });

            let result = match route {
                MessageRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                MessageRoute::Close { code, reason } => {
                    info!(code, reason = %reason, "Closing realtime WebSocket connection");
                    sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await
                }
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    });

    match open_session(app_state, &auth, session_id).await {
        Ok((session, processor)) => {
            let session_id = session.session_id.clone();
            info!(
                session_id = %session_id,
                user_id = %session.user_id,
                launch_mode = %session.launch_mode,
                "Realtime session established"
            );

            let ready = ServerMessage::SessionReady {
                session_id: session.session_id.clone(),
                user_id: session.user_id.clone(),
                chat_session_id: session.chat_session_id.clone(),
                launch_mode: session.launch_mode,
            };

            if message_tx.send(MessageRoute::Outgoing(ready)).await.is_ok() {
                let scheduler = TurnScheduler::new(
                    session,
                    processor,
                    app_state.directory.clone(),
                    message_tx.clone(),
                    app_state.config.scheduler_settings(),
                );
                let inbound = receiver.filter_map(|frame| future::ready(to_inbound(frame)));
                let exit = scheduler.run(inbound).await;
                debug!(session_id = %session_id, exit = ?exit, "Realtime connection finished");
            } else {
                // The processor was never handed to a scheduler
                if let Err(e) = processor.close().await {
                    warn!(error = %e, "Failed to close processor");
                }
            }
        }
        Err(e) => {
            warn!(
                auth_id = ?auth.id(),
                code = e.close_code(),
                error = %e,
                "Realtime handshake failed"
            );
            let _ = message_tx
                .send(MessageRoute::Close {
                    code: e.close_code(),
                    reason: e.to_string(),
                })
                .await;
        }
    }

    drop(message_tx);
    if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        warn!("Timed out flushing realtime WebSocket messages");
        sender_task.abort();
    }
}

/// Resolve the session and build its processor.
async fn open_session(
    app_state: &AppState,
    auth: &Auth,
    session_id: Option<String>,
) -> Result<(Session, SharedProcessor), HandshakeError> {
    if let Auth::Rejected(reason) = auth {
        return Err(HandshakeError::Unauthorized(*reason));
    }

    let session_id = session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(HandshakeError::MissingSessionId)?;

    let session = app_state
        .directory
        .lookup(&session_id)
        .await
        .map_err(|e| HandshakeError::DirectoryUnavailable(e.to_string()))?
        .ok_or(HandshakeError::SessionNotFound)?;

    if !auth.may_access(&session) {
        // Same code as a missing session so ids cannot be probed
        return Err(HandshakeError::SessionNotFound);
    }

    let processor = app_state
        .processor_factory
        .create(&session)
        .map_err(|e| HandshakeError::ProcessorUnavailable(e.to_string()))?;

    Ok((session, processor))
}

fn to_inbound(frame: Result<Message, axum::Error>) -> Option<Inbound> {
    match frame {
        Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_owned())),
        Ok(Message::Binary(data)) => Some(Inbound::Binary(data)),
        Ok(Message::Close(_)) => Some(Inbound::Closed),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => {
            warn!("Realtime WebSocket error: {}", e);
            Some(Inbound::Closed)
        }
    }
}
