//! Per-client channel handler
//!
//! The bearer token is validated before the WebSocket upgrade: an invalid
//! token refuses the connection with 401 and allocates nothing. After the
//! upgrade the connection is registered, subscribed to its user's fanout
//! events, and driven by one select loop until either side closes.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cardhub_core::models::UserId;

use crate::events::{server_event_from_fanout, ClientEvent, ServerEvent};
use crate::http::{AppError, AppState};

/// Maximum accepted frame size; signaling payloads never need more
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Outbound buffer per connection; slow clients drop frames rather than
/// stall the whole instance
const OUTBOUND_BUFFER: usize = 1024;

/// Query parameters for the channel upgrade
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token issued by the marketplace auth service
    pub token: Option<String>,
}

/// Channel upgrade handler
///
/// Clients connect with `GET /ws?token={bearer}`.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::unauthorized("Missing token query parameter"))?;

    // Refused before upgrade: no connection resources are allocated
    let user_id = state
        .validator
        .validate(&token)
        .map_err(|e| AppError::unauthorized(format!("Invalid token: {e}")))?;

    Ok(ws
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let connection_id = format!("{}_{}", user_id, nanoid::nanoid!(8));
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let transition = match state
        .bus
        .registry()
        .register(connection_id.clone(), user_id.clone())
    {
        Ok(transition) => transition,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Connection refused");
            let refusal = serde_json::to_string(&ServerEvent::error("refused", e.to_string()))
                .unwrap_or_default();
            let _ = ws_sender.send(WsMessage::Text(refusal.into())).await;
            let _ = ws_sender.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let mut event_rx = state.bus.subscribe(user_id.clone(), connection_id.clone());
    let mut status_rx = state.bus.registry().subscribe_status();

    if transition.came_online {
        state.bus.publish_presence(user_id.clone(), true);
    }

    info!(
        user_id = %user_id,
        connection_id = %connection_id,
        "Channel established"
    );

    // Writer task: serializes outbound events onto the socket. Bounded
    // channel so a slow client sheds load instead of backing up the hub.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);
    let writer_connection_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize server event");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(WsMessage::Text(json.into())).await {
                debug!(
                    connection_id = %writer_connection_id,
                    error = %e,
                    "Channel write failed"
                );
                break;
            }
        }
    });

    // Users this connection wants presence updates for
    let mut watched: HashSet<UserId> = HashSet::new();

    loop {
        tokio::select! {
            // Inbound client frame
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        state.bus.registry().touch(&connection_id);
                        let replies = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                handle_client_event(&state, &user_id, event, &mut watched).await
                            }
                            Err(e) => {
                                vec![ServerEvent::error("bad_event", format!("Unparseable event: {e}"))]
                            }
                        };
                        if !forward_all(&out_tx, replies) {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        state.bus.registry().touch(&connection_id);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(connection_id = %connection_id, "Client closed channel");
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        let reply = ServerEvent::error("bad_event", "Binary frames not accepted");
                        if !forward_all(&out_tx, vec![reply]) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "Channel receive error");
                        break;
                    }
                }
            }

            // Event routed to this user through the fanout bus
            event = event_rx.recv() => {
                let Some(event) = event else {
                    warn!(connection_id = %connection_id, "Fanout subscription closed");
                    break;
                };
                if let Some(server_event) = server_event_from_fanout(event) {
                    if !forward_all(&out_tx, vec![server_event]) {
                        break;
                    }
                }
            }

            // Merged presence transitions for watched users
            status = status_rx.recv() => {
                match status {
                    Ok(update) => {
                        if watched.contains(&update.user_id) {
                            let event = ServerEvent::Presence {
                                user_id: update.user_id,
                                online: update.online,
                            };
                            if !forward_all(&out_tx, vec![event]) {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(connection_id = %connection_id, missed = missed, "Presence feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    // Cleanup; the presence watcher ends any live call once the user's
    // last connection is gone
    drop(out_tx);
    writer.abort();
    state.bus.unsubscribe(&connection_id);
    if let Some(departure) = state.bus.registry().deregister(&connection_id) {
        if departure.went_offline {
            state.bus.publish_presence(departure.user_id, false);
        }
    }

    info!(
        user_id = %user_id,
        connection_id = %connection_id,
        "Channel closed"
    );
}

/// Queue events for the writer. Returns false when the writer is gone;
/// a full buffer drops the frame (slow client) instead of blocking.
fn forward_all(out_tx: &mpsc::Sender<ServerEvent>, events: Vec<ServerEvent>) -> bool {
    for event in events {
        match out_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound buffer full, dropping frame for slow client");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
    true
}

async fn handle_client_event(
    state: &AppState,
    user_id: &UserId,
    event: ClientEvent,
    watched: &mut HashSet<UserId>,
) -> Vec<ServerEvent> {
    match event {
        ClientEvent::Ping => vec![ServerEvent::Pong],

        ClientEvent::MessageNew {
            conversation_id,
            recipient_id,
            content,
        } => {
            let req = cardhub_core::models::message::SendMessageRequest {
                conversation_id,
                recipient_id,
                content,
            };
            match state.orchestrator.send_message(user_id.clone(), req).await {
                Ok(message) => vec![ServerEvent::MessageAck {
                    message_id: message.id,
                    conversation_id: message.conversation_id,
                    created_at: message.created_at,
                }],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::MessageRead { message_id } => {
            match state.orchestrator.mark_read(user_id.clone(), &message_id).await {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::MessageDeleted { message_id } => {
            match state
                .orchestrator
                .delete_message(user_id.clone(), &message_id)
                .await
            {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::TypingStart {
            conversation_id,
            recipient_id,
        } => {
            state
                .orchestrator
                .typing(user_id.clone(), conversation_id, recipient_id, true);
            vec![]
        }

        ClientEvent::TypingStop {
            conversation_id,
            recipient_id,
        } => {
            state
                .orchestrator
                .typing(user_id.clone(), conversation_id, recipient_id, false);
            vec![]
        }

        ClientEvent::NotificationRead { notification_id } => {
            match state
                .orchestrator
                .notification_read(user_id, notification_id)
                .await
            {
                Ok(()) => vec![ServerEvent::NotificationRead { notification_id }],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::NotificationsReadAll => {
            match state.orchestrator.notifications_read_all(user_id).await {
                Ok(affected) => vec![ServerEvent::NotificationsReadAll { affected }],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::CallInitiate {
            callee_id,
            call_type,
            offer,
        } => {
            match state
                .coordinator
                .initiate(user_id.clone(), callee_id, call_type, offer)
                .await
            {
                Ok(session) => vec![ServerEvent::CallRinging {
                    call_id: session.call_id,
                }],
                // BUSY and the rest are synchronous, never retried
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::CallAnswer { call_id, answer } => {
            match state
                .coordinator
                .answer(&call_id, user_id.clone(), answer)
                .await
            {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::CallReject { call_id } => {
            match state.coordinator.reject(&call_id, user_id.clone()).await {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::CallEnd { call_id } => {
            match state.coordinator.end(&call_id, user_id.clone()).await {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::CallIceCandidate { call_id, candidate } => {
            match state
                .coordinator
                .ice_candidate(&call_id, user_id.clone(), candidate)
                .await
            {
                Ok(()) => vec![],
                Err(e) => vec![ServerEvent::from_error(&e)],
            }
        }

        ClientEvent::CallGetActive => vec![ServerEvent::CallActive {
            session: state.coordinator.active_call(user_id).await,
        }],

        ClientEvent::PresenceSubscribe { user_ids } => {
            let mut replies = Vec::with_capacity(user_ids.len());
            for watched_user in user_ids {
                replies.push(ServerEvent::Presence {
                    user_id: watched_user.clone(),
                    online: state.bus.registry().is_online(&watched_user),
                });
                watched.insert(watched_user);
            }
            replies
        }

        ClientEvent::PresenceQuery { user_ids } => user_ids
            .into_iter()
            .map(|queried| {
                let online = state.bus.registry().is_online(&queried);
                ServerEvent::Presence {
                    user_id: queried,
                    online,
                }
            })
            .collect(),
    }
}
