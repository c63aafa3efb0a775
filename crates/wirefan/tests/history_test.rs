mod common;

use base64::Engine;
use common::{deliver_direct, drain_events, endpoint, Directory, Endpoint};
use wirefan::history::{
    deflate_history_payload, ConversationHistory, HistorySyncPayload, HistorySyncType,
    PushNameRecord,
};
use wirefan::{
    ChatMessage, ClientEvent, ConversationId, InnerMessage, MessageKey, MessageStatus,
    OutgoingRequest, ProtocolMessage, Store,
};

fn history_message(chat: &str, id: &str, text: &str) -> ChatMessage {
    ChatMessage {
        key: MessageKey {
            chat: chat.to_string(),
            id: id.to_string(),
            sender: format!("{chat}:0"),
            from_me: false,
        },
        timestamp: 1000,
        message: InnerMessage::Chat {
            text: text.to_string(),
        },
        status: MessageStatus::Read,
        ignore_unread: false,
        reactions: Vec::new(),
        poll: None,
        delivered_to: Vec::new(),
        read_by: Vec::new(),
    }
}

fn conversation(id: &str, unread: u32, messages: Vec<ChatMessage>) -> ConversationHistory {
    ConversationHistory {
        id: id.to_string(),
        display_name: Some(id.to_uppercase()),
        unread: Some(unread),
        archived: None,
        ephemeral_expiration: None,
        messages,
    }
}

fn payload(sync_type: HistorySyncType, conversations: Vec<ConversationHistory>) -> HistorySyncPayload {
    HistorySyncPayload {
        sync_type,
        conversations,
        statuses: Vec::new(),
        push_names: Vec::new(),
        past_participants: Vec::new(),
        progress: None,
    }
}

/// Routes a history notification from alice's primary to bob, the way a
/// freshly paired companion receives its backlog.
fn send_history(alice: &mut Endpoint, bob: &mut Endpoint, payload: &HistorySyncPayload) {
    let compressed = deflate_history_payload(payload).unwrap();
    let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);
    alice
        .pipeline
        .send(OutgoingRequest::new(
            ConversationId::Direct(bob.address.user_id.clone()),
            InnerMessage::Protocol(ProtocolMessage::HistorySyncNotification { payload: encoded }),
        ))
        .unwrap();
    let sent = alice.transport.take_sent();
    bob.pipeline
        .receive(&deliver_direct(
            sent.last().unwrap(),
            &alice.address,
            &bob.address,
        ))
        .unwrap();
}

#[test]
fn initial_bootstrap_seeds_then_recent_reconciles_exactly_once() {
    let directory = Directory::new();
    let mut alice = endpoint(&directory, "alice", 0);
    let mut bob = endpoint(&directory, "bob", 0);

    // === Initial bootstrap: two chats land ===
    let mut bootstrap = payload(
        HistorySyncType::InitialBootstrap,
        vec![
            conversation("carl", 3, vec![history_message("carl", "h1", "old news")]),
            conversation("dana", 0, vec![]),
        ],
    );
    bootstrap.progress = Some(10);
    send_history(&mut alice, &mut bob, &bootstrap);

    let events = drain_events(&bob.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::ChatsLoaded { count: 2 })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::HistorySyncProgress { percent: 10 })));

    let carl = bob.store.chat("carl").unwrap();
    assert_eq!(carl.unread, 3);
    assert_eq!(carl.display_name.as_deref(), Some("CARL"));
    let merged = bob.store.get_message("carl", "h1").unwrap();
    // History merges never count toward unread again.
    assert!(merged.ignore_unread);

    // === Recent payload omits dana ===
    send_history(
        &mut alice,
        &mut bob,
        &payload(HistorySyncType::Recent, vec![conversation("carl", 3, vec![])]),
    );
    let events = drain_events(&bob.events);
    let dropped: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::ConversationNoLongerRecent { chat } if chat == "dana"))
        .collect();
    assert_eq!(dropped.len(), 1);

    // === Replaying the same recent payload reports nothing new ===
    send_history(
        &mut alice,
        &mut bob,
        &payload(HistorySyncType::Recent, vec![conversation("carl", 3, vec![])]),
    );
    let events = drain_events(&bob.events);
    assert!(events
        .iter()
        .all(|e| !matches!(e, ClientEvent::ConversationNoLongerRecent { .. })));
}

#[test]
fn push_name_payload_updates_contacts() {
    let directory = Directory::new();
    let mut alice = endpoint(&directory, "alice", 0);
    let mut bob = endpoint(&directory, "bob", 0);

    let mut names = payload(HistorySyncType::PushName, vec![]);
    names.push_names = vec![PushNameRecord {
        user_id: "carl".to_string(),
        push_name: "Carl ☕".to_string(),
    }];
    send_history(&mut alice, &mut bob, &names);

    assert_eq!(
        bob.store.contact("carl").unwrap().push_name.as_deref(),
        Some("Carl ☕")
    );
    let events = drain_events(&bob.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::NewContact { user_id, .. } if user_id == "carl")));
}

#[test]
fn revoke_and_ephemeral_setting_protocol_messages() {
    let directory = Directory::new();
    let mut alice = endpoint(&directory, "alice", 0);
    let mut bob = endpoint(&directory, "bob", 0);

    let id = alice
        .pipeline
        .send(OutgoingRequest::text(
            ConversationId::Direct("bob".to_string()),
            "delete me",
        ))
        .unwrap();
    let sent = alice.transport.take_sent();
    bob.pipeline
        .receive(&deliver_direct(&sent[0], &alice.address, &bob.address))
        .unwrap();
    drain_events(&bob.events);
    assert!(bob.store.get_message("alice", &id).is_some());

    // === Revoke removes the message ===
    alice
        .pipeline
        .send(OutgoingRequest::new(
            ConversationId::Direct("bob".to_string()),
            InnerMessage::Protocol(ProtocolMessage::Revoke {
                target_id: id.clone(),
            }),
        ))
        .unwrap();
    let sent = alice.transport.take_sent();
    bob.pipeline
        .receive(&deliver_direct(
            sent.last().unwrap(),
            &alice.address,
            &bob.address,
        ))
        .unwrap();

    assert!(bob.store.get_message("alice", &id).is_none());
    let events = drain_events(&bob.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::MessageDeleted { id: deleted, .. } if deleted == &id)));

    // === Disappearing-message setting ===
    alice
        .pipeline
        .send(OutgoingRequest::new(
            ConversationId::Direct("bob".to_string()),
            InnerMessage::Protocol(ProtocolMessage::EphemeralSetting { expiration: 86400 }),
        ))
        .unwrap();
    let sent = alice.transport.take_sent();
    bob.pipeline
        .receive(&deliver_direct(
            sent.last().unwrap(),
            &alice.address,
            &bob.address,
        ))
        .unwrap();

    assert_eq!(
        bob.store.chat("alice").unwrap().ephemeral_expiration,
        Some(86400)
    );
    let events = drain_events(&bob.events);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::SettingChanged { ephemeral_expiration: Some(86400), .. }
    )));
}
