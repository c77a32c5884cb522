use super::*;

fn sample_message() -> Message {
    Message {
        id: MessageId(42),
        conversation_id: ConversationId(7),
        sender_id: UserId(3),
        sender: MessageSender {
            id: UserId(3),
            username: "alice".to_string(),
            first_name: Some("Alice".to_string()),
            last_name: None,
        },
        content: "Hi".to_string(),
        message_type: MessageType::Text,
        created_at: "2024-01-01T10:00:00Z".parse().expect("timestamp"),
        is_edited: false,
        is_deleted: false,
        reply_to_id: None,
        client_id: Some(ClientId::from("c-1")),
    }
}

#[test]
fn channel_names_round_trip_through_text() {
    let conversation = ChannelName::Conversation(ConversationId(12));
    let user = ChannelName::User(UserId(5));
    assert_eq!(conversation.to_string(), "conversation:12");
    assert_eq!(user.to_string(), "user:5");
    assert_eq!("conversation:12".parse::<ChannelName>(), Ok(conversation));
    assert_eq!("user:5".parse::<ChannelName>(), Ok(user));
}

#[test]
fn rejects_unknown_channel_families_and_ids() {
    assert!("room:1".parse::<ChannelName>().is_err());
    assert!("user:abc".parse::<ChannelName>().is_err());
    assert!("conversation".parse::<ChannelName>().is_err());
}

#[test]
fn new_message_event_uses_wire_event_name_and_keeps_client_id() {
    let event = ChannelEvent::NewMessage(sample_message());
    assert_eq!(event.name(), NEW_MESSAGE_EVENT);

    let json = serde_json::to_value(&event).expect("json");
    assert_eq!(json["event"], "new-message");
    assert_eq!(json["payload"]["clientId"], "c-1");
    assert_eq!(json["payload"]["id"], 42);
}

#[test]
fn conversation_update_event_carries_last_message_snapshot() {
    let event = ChannelEvent::ConversationUpdate {
        conversation_id: ConversationId(7),
        last_message: sample_message(),
    };
    assert_eq!(event.name(), CONVERSATION_UPDATE_EVENT);

    let json = serde_json::to_value(&event).expect("json");
    assert_eq!(json["event"], "conversation-update");
    assert_eq!(json["payload"]["conversationId"], 7);
    assert_eq!(json["payload"]["lastMessage"]["content"], "Hi");
}

#[test]
fn send_request_tolerates_missing_fields() {
    let request: SendMessageRequest = serde_json::from_str("{}").expect("json");
    assert!(request.conversation_id.is_none());
    assert!(request.content.is_empty());
    assert!(request.client_id.is_none());
}

#[test]
fn server_frame_serializes_channel_as_string() {
    let frame = ServerFrame::Subscribed {
        channel: ChannelName::User(UserId(9)),
    };
    let json = serde_json::to_value(&frame).expect("json");
    assert_eq!(json["type"], "subscribed");
    assert_eq!(json["payload"]["channel"], "user:9");
}

#[test]
fn send_request_reads_camel_case_keys() {
    let request: SendMessageRequest = serde_json::from_str(
        r#"{"conversationId":1,"content":"Hi","clientId":"c-1","replyToId":4}"#,
    )
    .expect("json");
    assert_eq!(request.conversation_id, Some(ConversationId(1)));
    assert_eq!(request.client_id, Some(ClientId::from("c-1")));
    assert_eq!(request.reply_to_id, Some(MessageId(4)));
    assert_eq!(request.content, "Hi");
}

#[test]
fn wire_payloads_use_camel_case_keys() {
    let json = serde_json::to_value(ChannelEvent::NewMessage(sample_message())).expect("json");
    let payload = json["payload"].as_object().expect("object");
    for key in ["conversationId", "senderId", "messageType", "createdAt", "isEdited", "isDeleted"] {
        assert!(payload.contains_key(key), "missing {key}");
    }
    assert!(!payload.contains_key("conversation_id"));
    assert_eq!(json["payload"]["sender"]["firstName"], "Alice");

    let update = serde_json::to_value(ChannelEvent::ConversationUpdate {
        conversation_id: ConversationId(7),
        last_message: sample_message(),
    })
    .expect("json");
    let keys: Vec<_> = update["payload"]
        .as_object()
        .expect("object")
        .keys()
        .cloned()
        .collect();
    assert_eq!(keys, vec!["conversationId", "lastMessage"]);

    let login = serde_json::to_value(LoginResponse {
        user_id: UserId(3),
        token: "t".to_string(),
    })
    .expect("json");
    assert_eq!(login["userId"], 3);
}
