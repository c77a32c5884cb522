use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use shared::{
    domain::{ConversationId, MessageId, MessageType, UserId},
    protocol::{Message, MessageSender, CONVERSATION_UPDATE_EVENT, NEW_MESSAGE_EVENT},
};

use super::*;

fn message(id: i64) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: ConversationId(1),
        sender_id: UserId(2),
        sender: MessageSender {
            id: UserId(2),
            username: "landlord".to_string(),
            first_name: None,
            last_name: None,
        },
        content: format!("message {id}"),
        message_type: MessageType::Text,
        created_at: chrono::Utc::now(),
        is_edited: false,
        is_deleted: false,
        reply_to_id: None,
        client_id: None,
    }
}

const CONVERSATION: ChannelName = ChannelName::Conversation(ConversationId(1));

#[tokio::test]
async fn delivers_to_every_current_subscriber_in_publish_order() {
    let hub = ChannelHub::new();
    let mut first = hub.subscribe(CONVERSATION).await;
    let mut second = hub.subscribe(CONVERSATION).await;

    hub.publish(CONVERSATION, ChannelEvent::NewMessage(message(1)))
        .await;
    hub.publish(CONVERSATION, ChannelEvent::NewMessage(message(2)))
        .await;

    for subscription in [&mut first, &mut second] {
        let ids: Vec<_> = [
            subscription.recv().await.expect("first"),
            subscription.recv().await.expect("second"),
        ]
        .into_iter()
        .map(|event| match event {
            ChannelEvent::NewMessage(message) => message.id,
            other => panic!("unexpected event: {other:?}"),
        })
        .collect();
        assert_eq!(ids, vec![MessageId(1), MessageId(2)]);
    }
}

#[tokio::test]
async fn late_subscribers_do_not_receive_earlier_events() {
    let hub = ChannelHub::new();
    hub.publish(CONVERSATION, ChannelEvent::NewMessage(message(1)))
        .await;

    let mut late = hub.subscribe(CONVERSATION).await;
    let pending = tokio::time::timeout(Duration::from_millis(50), late.recv()).await;
    assert!(pending.is_err(), "no replay expected");
}

#[tokio::test]
async fn channels_are_isolated() {
    let hub = ChannelHub::new();
    let mut user_channel = hub.subscribe(ChannelName::User(UserId(2))).await;

    let delivered = hub
        .broadcast(CONVERSATION, ChannelEvent::NewMessage(message(1)))
        .await;
    assert_eq!(delivered, 0);

    let pending = tokio::time::timeout(Duration::from_millis(50), user_channel.recv()).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn unsubscribe_detaches_immediately_and_drop_is_pruned_on_publish() {
    let hub = ChannelHub::new();
    let explicit = hub.subscribe(CONVERSATION).await;
    let dropped = hub.subscribe(CONVERSATION).await;
    let _kept = hub.subscribe(CONVERSATION).await;
    assert_eq!(hub.subscriber_count(CONVERSATION).await, 3);

    explicit.unsubscribe().await;
    assert_eq!(hub.subscriber_count(CONVERSATION).await, 2);

    drop(dropped);
    let delivered = hub
        .broadcast(CONVERSATION, ChannelEvent::NewMessage(message(1)))
        .await;
    assert_eq!(delivered, 1);
    assert_eq!(hub.subscriber_count(CONVERSATION).await, 1);
}

#[tokio::test]
async fn resubscribing_yields_independent_handles() {
    let hub = ChannelHub::new();
    let first = hub.subscribe(CONVERSATION).await;
    let mut second = hub.subscribe(CONVERSATION).await;
    assert_ne!(first.id(), second.id());

    first.unsubscribe().await;
    hub.publish(CONVERSATION, ChannelEvent::NewMessage(message(3)))
        .await;
    assert!(matches!(
        second.recv().await,
        Some(ChannelEvent::NewMessage(m)) if m.id == MessageId(3)
    ));
}

#[tokio::test]
async fn handlers_run_only_for_their_event_name() {
    let hub = ChannelHub::new();
    let channel = ChannelName::User(UserId(2));
    let mut subscription = hub.subscribe(channel).await;

    let new_messages = Arc::new(AtomicUsize::new(0));
    let updates = Arc::new(AtomicUsize::new(0));
    {
        let new_messages = Arc::clone(&new_messages);
        let updates = Arc::clone(&updates);
        subscription
            .on(NEW_MESSAGE_EVENT, move |_| {
                new_messages.fetch_add(1, Ordering::SeqCst);
            })
            .on(CONVERSATION_UPDATE_EVENT, move |_| {
                updates.fetch_add(1, Ordering::SeqCst);
            });
    }

    hub.publish(
        channel,
        ChannelEvent::ConversationUpdate {
            conversation_id: ConversationId(1),
            last_message: message(4),
        },
    )
    .await;

    let event = subscription.recv().await.expect("event");
    assert_eq!(event.name(), CONVERSATION_UPDATE_EVENT);
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    assert_eq!(new_messages.load(Ordering::SeqCst), 0);
}
