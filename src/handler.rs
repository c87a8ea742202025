//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, session
//! binding via the `hello` frame, message parsing, and bidirectional
//! communication with the ChatServer. Each connection gets one handler
//! task; all state lives in the server actor.

use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::server::ServerCommand;
use crate::types::SessionId;

/// How long a client may take to send its first frame
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection server → client channel buffer
const CLIENT_BUFFER_SIZE: usize = 64;

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, resolves the session identity from
/// the client's first frame, and manages the connection lifecycle. The
/// transport closing does not evict the session: the server holds it
/// through the grace period for a possible resume.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // First frame: a `hello` replaying a durable token resumes that
    // session; anything else gets a freshly minted session (lenient)
    let Some((session_id, pending)) = await_hello(&mut ws_receiver).await else {
        debug!("Connection from {} closed before hello", peer_addr);
        return Ok(());
    };
    info!("Session {} connected from {}", session_id, peer_addr);

    // Create channel for server -> client messages
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(CLIENT_BUFFER_SIZE);

    // Bind the transport to the session
    if cmd_tx
        .send(ServerCommand::Connect {
            session_id: session_id.clone(),
            sender: msg_tx.clone(),
        })
        .await
        .is_err()
    {
        error!("Failed to bind session {} - server closed", session_id);
        return Err(AppError::ChannelSend);
    }

    // A non-hello first frame is processed normally after binding
    if let Some(cmd) = pending.and_then(|msg| client_message_to_command(&session_id, msg)) {
        if cmd_tx.send(cmd).await.is_err() {
            return Err(AppError::ChannelSend);
        }
    }

    // Clone handles for the read task
    let cmd_tx_read = cmd_tx.clone();
    let err_tx = msg_tx.clone();
    let read_session = session_id.clone();

    // Spawn read task (WebSocket -> ServerCommand)
    let read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            let Some(cmd) =
                                client_message_to_command(&read_session, client_msg)
                            else {
                                // Mid-stream hello; the session is already bound
                                continue;
                            };
                            if cmd_tx_read.send(cmd).await.is_err() {
                                debug!("Server closed, ending read task for {}", read_session);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Invalid JSON from {}: {}", read_session, e);
                            // Malformed frames never reach the relay; tell
                            // the sender, droppable if they are backlogged
                            let _ = err_tx.try_send(ServerMessage::from(AppError::Json(e)));
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("Session {} sent close frame", read_session);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong is handled automatically by tungstenite
                }
                Ok(_) => {
                    // Binary or other message types - ignore
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", read_session, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", read_session);
    });

    // Spawn write task (ServerMessage -> WebSocket)
    let write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    // Continue - don't break on serialization errors
                }
            }
        }
        debug!("Write task ended for client");

        // Send close frame when done
        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = read_task => {
            debug!("Read task completed for {}", session_id);
        }
        _ = write_task => {
            debug!("Write task completed for {}", session_id);
        }
    }

    // Unbind the transport; the session survives into its grace period.
    // Carrying our channel lets the server ignore this if a newer
    // connection already replaced us.
    let _ = cmd_tx
        .send(ServerCommand::Disconnect {
            session_id: session_id.clone(),
            sender: msg_tx,
        })
        .await;

    info!("Session {} transport closed", session_id);

    Ok(())
}

/// Wait for the first meaningful frame and resolve the session identity
///
/// Returns the session id plus any non-hello first message to process
/// after binding, or None if the connection closed (or stayed silent
/// past the hello timeout) first.
async fn await_hello(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<(SessionId, Option<ClientMessage>)> {
    let first = tokio::time::timeout(HELLO_TIMEOUT, async {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        warn!("Invalid JSON before hello: {}", e);
                    }
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    })
    .await;

    match first {
        Ok(Some(ClientMessage::Hello { session_id })) => {
            let resolved = match session_id {
                Some(token) => match SessionId::from_token(token) {
                    Some(id) => id,
                    None => {
                        warn!("Rejecting bad session token, minting a fresh session");
                        SessionId::generate()
                    }
                },
                None => SessionId::generate(),
            };
            Some((resolved, None))
        }
        Ok(Some(other)) => Some((SessionId::generate(), Some(other))),
        Ok(None) => None,
        Err(_) => {
            debug!("No hello within {:?}", HELLO_TIMEOUT);
            None
        }
    }
}

/// Convert a ClientMessage to a ServerCommand
///
/// Returns None for `hello`, which is only meaningful as a first frame.
fn client_message_to_command(session_id: &SessionId, msg: ClientMessage) -> Option<ServerCommand> {
    let session_id = session_id.clone();
    match msg {
        ClientMessage::Hello { .. } => None,
        ClientMessage::FindPartner {
            display_name,
            attribute,
        } => Some(ServerCommand::FindPartner {
            session_id,
            display_name,
            attribute,
        }),
        ClientMessage::SendMessage { envelope } => Some(ServerCommand::SendMessage {
            session_id,
            envelope,
        }),
        ClientMessage::Typing { typing } => Some(ServerCommand::Typing { session_id, typing }),
        ClientMessage::SendReaction {
            message_id,
            reaction,
        } => Some(ServerCommand::SendReaction {
            session_id,
            message_id,
            reaction,
        }),
        ClientMessage::MarkRead { message_id } => Some(ServerCommand::MarkRead {
            session_id,
            message_id,
        }),
        ClientMessage::SetReadReceipts { enabled } => Some(ServerCommand::SetReadReceipts {
            session_id,
            enabled,
        }),
        ClientMessage::DisconnectPartner => {
            Some(ServerCommand::DisconnectPartner { session_id })
        }
    }
}
