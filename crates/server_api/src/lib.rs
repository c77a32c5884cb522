use std::sync::Arc;

use channel_transport::ChannelPublisher;
use futures::StreamExt;
use serde::Deserialize;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ChannelEvent, ChannelName, ConversationSummary, Message, ParticipantSummary,
        SendMessageRequest,
    },
};
use storage::{ConversationDirectory, MessageStore, NewMessage, Storage, StoredParticipant};
use tracing::{debug, error, warn};

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 100;
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 16;
pub const MAX_CONTENT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy)]
pub struct ApiLimits {
    pub history_limit: u32,
    pub max_history_limit: u32,
    pub fanout_concurrency: usize,
    pub max_content_chars: usize,
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_history_limit: MAX_HISTORY_LIMIT,
            fanout_concurrency: DEFAULT_FANOUT_CONCURRENCY,
            max_content_chars: MAX_CONTENT_CHARS,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub messages: Arc<dyn MessageStore>,
    pub conversations: Arc<dyn ConversationDirectory>,
    pub channels: Arc<dyn ChannelPublisher>,
    pub limits: ApiLimits,
}

impl ApiContext {
    pub fn new(storage: Storage, channels: Arc<dyn ChannelPublisher>) -> Self {
        Self {
            messages: Arc::new(storage.clone()),
            conversations: Arc::new(storage),
            channels,
            limits: ApiLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ApiLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub before: Option<MessageId>,
}

/// True iff `user_id` has a participant row in the conversation that has not been left.
pub async fn has_access(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<bool, ApiError> {
    Ok(ctx
        .conversations
        .find_active_participant(conversation_id, user_id)
        .await
        .map_err(internal)?
        .is_some())
}

/// Newest-first page of a conversation's messages.
pub async fn history(
    ctx: &ApiContext,
    requester: Option<UserId>,
    query: HistoryQuery,
) -> Result<Vec<Message>, ApiError> {
    let user_id = authenticated(requester)?;
    let conversation_id = query
        .conversation_id
        .ok_or_else(|| ApiError::bad_request("conversation_id is required"))?;
    ensure_access(ctx, user_id, conversation_id).await?;

    let limit = query
        .limit
        .unwrap_or(ctx.limits.history_limit)
        .clamp(1, ctx.limits.max_history_limit.max(1));
    ctx.messages
        .list_recent(conversation_id, limit, query.before)
        .await
        .map_err(internal)
}

/// Runs one send request end to end.
///
/// Persistence happens before any publish, so a failed insert leaves no
/// trace on any channel. Touching the conversation is best effort and runs
/// after fan-out.
pub async fn send_message(
    ctx: &ApiContext,
    requester: Option<UserId>,
    request: SendMessageRequest,
) -> Result<Message, ApiError> {
    let sender_id = authenticated(requester)?;

    let conversation_id = request
        .conversation_id
        .ok_or_else(|| ApiError::bad_request("conversation_id is required"))?;
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("content is required"));
    }
    if request.content.chars().count() > ctx.limits.max_content_chars {
        return Err(ApiError::bad_request(format!(
            "content exceeds {} characters",
            ctx.limits.max_content_chars
        )));
    }

    ensure_access(ctx, sender_id, conversation_id).await?;

    if let Some(reply_to_id) = request.reply_to_id {
        let same_conversation = ctx
            .messages
            .message_belongs_to(conversation_id, reply_to_id)
            .await
            .map_err(internal)?;
        if !same_conversation {
            return Err(ApiError::bad_request(
                "reply_to_id must reference a message in the same conversation",
            ));
        }
    }

    let mut message = ctx
        .messages
        .append(NewMessage {
            conversation_id,
            sender_id,
            content: &request.content,
            message_type: request.message_type.unwrap_or_default(),
            reply_to_id: request.reply_to_id,
        })
        .await
        .map_err(|err| {
            error!(
                conversation_id = conversation_id.0,
                sender_id = sender_id.0,
                error = %err,
                "message persistence failed; nothing published"
            );
            internal(err)
        })?;

    message.client_id = request.client_id;

    ctx.channels
        .publish(
            ChannelName::Conversation(conversation_id),
            ChannelEvent::NewMessage(message.clone()),
        )
        .await;

    let participants = ctx
        .conversations
        .list_active_participants(conversation_id)
        .await
        .map_err(internal)?;
    fan_out_conversation_update(ctx, &participants, &message).await;

    if let Err(err) = ctx.messages.touch_conversation(conversation_id).await {
        warn!(
            conversation_id = conversation_id.0,
            error = %err,
            "failed to bump conversation ordering"
        );
    }

    debug!(
        conversation_id = conversation_id.0,
        message_id = message.id.0,
        participants = participants.len(),
        "message sent"
    );
    Ok(message)
}

pub async fn list_conversations(
    ctx: &ApiContext,
    requester: Option<UserId>,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let user_id = authenticated(requester)?;
    let conversations = ctx
        .conversations
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;

    Ok(conversations
        .into_iter()
        .map(|conversation| ConversationSummary {
            conversation_id: conversation.conversation_id,
            conversation_type: conversation.conversation_type,
            title: conversation.title,
            property_id: conversation.property_id,
            participants: conversation
                .participants
                .into_iter()
                .map(participant_summary)
                .collect(),
            last_message: conversation.last_message,
            updated_at: conversation.updated_at,
        })
        .collect())
}

/// One `conversation-update` per participant, at most `fanout_concurrency` in flight.
async fn fan_out_conversation_update(
    ctx: &ApiContext,
    participants: &[StoredParticipant],
    message: &Message,
) {
    let update = ChannelEvent::ConversationUpdate {
        conversation_id: message.conversation_id,
        last_message: message.clone(),
    };
    let channels = &ctx.channels;
    let update = &update;

    futures::stream::iter(participants)
        .for_each_concurrent(ctx.limits.fanout_concurrency.max(1), |participant| async move {
            channels
                .publish(ChannelName::User(participant.user_id), update.clone())
                .await;
        })
        .await;
}

async fn ensure_access(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    if has_access(ctx, user_id, conversation_id).await? {
        Ok(())
    } else {
        Err(ApiError::forbidden("user is not a participant"))
    }
}

fn authenticated(requester: Option<UserId>) -> Result<UserId, ApiError> {
    requester.ok_or_else(|| ApiError::unauthorized("sign in required"))
}

fn participant_summary(participant: StoredParticipant) -> ParticipantSummary {
    ParticipantSummary {
        user_id: participant.user_id,
        username: participant.username,
        role: participant.role,
        business_name: participant.business_name,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
