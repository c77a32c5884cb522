use chrono::TimeZone;
use shared::{
    domain::{ConversationType, MessageId, MessageType, UserId},
    protocol::MessageSender,
};

use super::*;

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0)
        .single()
        .expect("timestamp")
}

fn summary(id: i64, updated_at: DateTime<Utc>) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(id),
        conversation_type: ConversationType::Direct,
        title: Some(format!("Listing {id}")),
        property_id: None,
        participants: Vec::new(),
        last_message: None,
        updated_at,
    }
}

fn message(id: i64, conversation_id: i64, created_at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(1),
        sender: MessageSender {
            id: UserId(1),
            username: "renter".to_string(),
            first_name: None,
            last_name: None,
        },
        content: format!("message {id}"),
        message_type: MessageType::Text,
        created_at,
        is_edited: false,
        is_deleted: false,
        reply_to_id: None,
        client_id: None,
    }
}

fn order(list: &ConversationList) -> Vec<i64> {
    list.entries()
        .iter()
        .map(|entry| entry.conversation_id().0)
        .collect()
}

#[test]
fn seeded_list_is_sorted_by_activity() {
    let mut with_message = summary(1, at(9, 0));
    with_message.last_message = Some(message(1, 1, at(10, 30)));
    let list = ConversationList::new(vec![summary(2, at(10, 5)), with_message, summary(3, at(8, 0))]);
    assert_eq!(order(&list), vec![1, 2, 3]);
}

#[test]
fn update_moves_conversation_to_its_new_position() {
    let mut list = ConversationList::new(vec![summary(1, at(10, 0)), summary(2, at(10, 5))]);
    assert_eq!(order(&list), vec![2, 1]);

    assert!(list.apply_update(ConversationId(1), message(9, 1, at(10, 10))));
    assert_eq!(order(&list), vec![1, 2]);
    assert_eq!(list.get(ConversationId(1)).and_then(|e| e.preview()), Some("message 9"));
}

#[test]
fn update_places_conversation_between_neighbours() {
    let mut list = ConversationList::new(vec![
        summary(1, at(9, 0)),
        summary(2, at(10, 0)),
        summary(3, at(11, 0)),
    ]);
    assert_eq!(order(&list), vec![3, 2, 1]);

    list.apply_update(ConversationId(1), message(4, 1, at(10, 30)));
    assert_eq!(order(&list), vec![3, 1, 2]);
    assert_eq!(list.position(ConversationId(1)), Some(1));
}

#[test]
fn update_for_unknown_conversation_is_ignored() {
    let mut list = ConversationList::new(vec![summary(1, at(10, 0))]);
    assert!(!list.apply_update(ConversationId(99), message(1, 99, at(12, 0))));
    assert_eq!(order(&list), vec![1]);
    assert!(list.get(ConversationId(99)).is_none());
}

#[test]
fn optimistic_preview_reorders_and_is_cleared_by_confirmation() {
    let mut list = ConversationList::new(vec![summary(1, at(10, 0)), summary(2, at(10, 5))]);
    let pending = PendingMessage {
        client_id: ClientId::from("c-1"),
        conversation_id: ConversationId(1),
        sender_id: UserId(1),
        content: "on my way".to_string(),
        message_type: MessageType::Text,
        created_at: at(10, 7),
    };

    assert!(list.set_optimistic_last(pending));
    assert_eq!(order(&list), vec![1, 2]);
    assert_eq!(list.get(ConversationId(1)).and_then(|e| e.preview()), Some("on my way"));

    let confirmed = Message {
        client_id: Some(ClientId::from("c-1")),
        ..message(5, 1, at(10, 8))
    };
    list.apply_update(ConversationId(1), confirmed);
    let entry = list.get(ConversationId(1)).expect("entry");
    assert!(entry.pending.is_none());
    assert_eq!(entry.preview(), Some("message 5"));
}

#[test]
fn clearing_a_rolled_back_preview_restores_order() {
    let mut list = ConversationList::new(vec![summary(1, at(10, 0)), summary(2, at(10, 5))]);
    list.set_optimistic_last(PendingMessage {
        client_id: ClientId::from("c-2"),
        conversation_id: ConversationId(1),
        sender_id: UserId(1),
        content: "lost".to_string(),
        message_type: MessageType::Text,
        created_at: at(10, 9),
    });
    assert_eq!(order(&list), vec![1, 2]);

    assert!(!list.clear_optimistic(ConversationId(1), &ClientId::from("other")));
    assert!(list.clear_optimistic(ConversationId(1), &ClientId::from("c-2")));
    assert_eq!(order(&list), vec![2, 1]);
    assert_eq!(list.get(ConversationId(1)).and_then(|e| e.preview()), None);
}
