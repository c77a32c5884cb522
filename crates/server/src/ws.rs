//! Realtime socket: clients attach to channels with `subscribe` frames and
//! receive channel events as `event` frames.

use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use channel_transport::Subscription;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{ChannelName, ClientFrame, ServerFrame},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

pub(crate) async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sink, mut stream) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "failed to encode server frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    info!(user_id = user_id.0, "realtime connection opened");
    // dropping a stop handle detaches its forwarder
    let mut subscriptions: HashMap<ChannelName, oneshot::Sender<()>> = HashMap::new();

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(error) => {
                let _ = frames_tx.send(ServerFrame::Error(ApiError::bad_request(format!(
                    "invalid frame: {error}"
                ))));
                continue;
            }
        };

        match frame {
            ClientFrame::Subscribe { channel } => {
                if let Err(err) = authorize_channel(&state, user_id, channel).await {
                    debug!(user_id = user_id.0, %channel, code = ?err.code, "subscribe refused");
                    let _ = frames_tx.send(ServerFrame::Error(err));
                    continue;
                }
                if !subscriptions.contains_key(&channel) {
                    let subscription = state.hub.subscribe(channel).await;
                    let (stop_tx, stop_rx) = oneshot::channel();
                    let _ = frames_tx.send(ServerFrame::Subscribed { channel });
                    tokio::spawn(forward_events(subscription, stop_rx, frames_tx.clone()));
                    subscriptions.insert(channel, stop_tx);
                } else {
                    let _ = frames_tx.send(ServerFrame::Subscribed { channel });
                }
            }
            ClientFrame::Unsubscribe { channel } => {
                subscriptions.remove(&channel);
                let _ = frames_tx.send(ServerFrame::Unsubscribed { channel });
            }
        }
    }

    drop(subscriptions);
    drop(frames_tx);
    let _ = writer.await;
    info!(user_id = user_id.0, "realtime connection closed");
}

/// A user may listen on their own user channel and on conversations they are
/// an active participant of.
async fn authorize_channel(
    state: &AppState,
    user_id: UserId,
    channel: ChannelName,
) -> Result<(), ApiError> {
    match channel {
        ChannelName::User(owner) if owner == user_id => Ok(()),
        ChannelName::User(_) => Err(ApiError::forbidden("cannot listen on another user's channel")),
        ChannelName::Conversation(conversation_id) => {
            if server_api::has_access(&state.api, user_id, conversation_id).await? {
                Ok(())
            } else {
                Err(ApiError::forbidden("user is not a participant"))
            }
        }
    }
}

async fn forward_events(
    mut subscription: Subscription,
    mut stop: oneshot::Receiver<()>,
    frames: mpsc::UnboundedSender<ServerFrame>,
) {
    let channel = subscription.channel();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if frames.send(ServerFrame::Event { channel, event }).is_err() {
                    break;
                }
            }
        }
    }
    subscription.unsubscribe().await;
}
