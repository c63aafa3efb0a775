use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::HistoryReconciliationSet;
use crate::establisher::SessionEstablisher;
use crate::events::{ClientEvent, EventSink};
use crate::group::GroupCodec;
use crate::history::{inflate_history_payload, HistorySyncPayload, HistorySyncType};
use crate::keystore::{KeyStore, PairwiseCiphertext};
use crate::node::Node;
use crate::pairwise::PairwiseCodec;
use crate::resolver::AddressResolver;
use crate::retry::{build_retry_receipt, RetryDecision, RetryLedger};
use crate::store::{
    Chat, ChatMessage, MessageKey, MessageStatus, PollState, Reaction, Store,
};
use crate::transport::{Transport, IQ_SET, XMLNS_APP_STATE};
use crate::types::{
    CiphertextType, ConversationId, DecodeFailure, DeviceAddress, IncomingEnvelope, InnerMessage,
    OutgoingRequest, ProtocolMessage, STATUS_BROADCAST, WIRE_VERSION,
};
use crate::utils::{derive_key_nonce, kdf, now_seconds, open, seal};
use crate::{Error, Result};

const POLL_VOTE_AEAD_LABEL: &[u8] = b"wirefan-poll-vote";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Re-surface archived chats when new messages arrive in them.
    pub auto_unarchive: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_unarchive: true,
        }
    }
}

/// The message encode/decode orchestrator. One instance per logged-in
/// device; all methods take `&mut self`, which is the serializing context
/// that keeps session mutation, retry accounting and cache access ordered.
pub struct MessagePipeline {
    own_address: DeviceAddress,
    config: PipelineConfig,
    keystore: Arc<dyn KeyStore>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    resolver: AddressResolver,
    establisher: SessionEstablisher,
    pairwise: PairwiseCodec,
    group: GroupCodec,
    retries: RetryLedger,
    history: HistoryReconciliationSet,
    /// Per group: user ids whose devices have our current sender key.
    distributed: HashMap<String, HashSet<String>>,
    app_state_pulled: bool,
}

impl MessagePipeline {
    pub fn new(
        own_address: DeviceAddress,
        keystore: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            resolver: AddressResolver::new(transport.clone(), own_address.clone()),
            establisher: SessionEstablisher::new(keystore.clone(), transport.clone()),
            pairwise: PairwiseCodec::new(keystore.clone()),
            group: GroupCodec::new(),
            retries: RetryLedger::new(),
            history: HistoryReconciliationSet::new(),
            distributed: HashMap::new(),
            app_state_pulled: false,
            own_address,
            config,
            keystore,
            transport,
            store,
            events,
        }
    }

    pub fn own_address(&self) -> &DeviceAddress {
        &self.own_address
    }

    // ---- outbound ----------------------------------------------------

    /// Encodes and sends one logical message, returning its id. The message
    /// is stored before the wire attempt; on failure it is marked Failed and
    /// the error is returned. The request is consumed either way and is
    /// never retried internally.
    pub fn send(&mut self, request: OutgoingRequest) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let chat_id = request.conversation.wire_id().to_string();

        self.store.ensure_chat(&chat_id);
        let stored = ChatMessage {
            key: MessageKey {
                chat: chat_id.clone(),
                id: message_id.clone(),
                sender: self.own_address.to_string(),
                from_me: true,
            },
            timestamp: now_seconds(),
            message: request.message.clone(),
            status: MessageStatus::Pending,
            ignore_unread: true,
            reactions: Vec::new(),
            poll: poll_state_for(&request.message),
            delivered_to: Vec::new(),
            read_by: Vec::new(),
        };
        self.store.upsert_message(stored);

        match self.encode_and_send(&message_id, &request) {
            Ok(()) => {
                self.store
                    .set_message_status(&chat_id, &message_id, MessageStatus::Sent);
                Ok(message_id)
            }
            Err(e) => {
                warn!(%message_id, error = %e, "send failed");
                self.store
                    .set_message_status(&chat_id, &message_id, MessageStatus::Failed);
                Err(e)
            }
        }
    }

    fn encode_and_send(&mut self, message_id: &str, request: &OutgoingRequest) -> Result<()> {
        let node = match &request.conversation {
            ConversationId::Direct(_) => self.encode_direct(message_id, request)?,
            ConversationId::Group(group_id) => {
                let group_id = group_id.clone();
                self.encode_group(message_id, &group_id, request)?
            }
        };
        self.transport.send_no_response(node)
    }

    /// Direct fan-out: every device of both participants gets its own
    /// pairwise ciphertext. Our own other devices receive the companion
    /// echo wrapper instead of the bare content.
    fn encode_direct(&mut self, message_id: &str, request: &OutgoingRequest) -> Result<Node> {
        let targets = match &request.recipient_override {
            Some(addr) => vec![addr.clone()],
            None => self
                .resolver
                .resolve(&request.conversation, true, request.force_refresh)?,
        };
        self.establisher
            .ensure_sessions(&targets, request.force_refresh)?;

        let peer_plaintext = serde_json::to_vec(&request.message)?;
        let echo_plaintext = serde_json::to_vec(&InnerMessage::DeviceSent {
            destination: request.conversation.wire_id().to_string(),
            message: Box::new(request.message.clone()),
        })?;

        let mut to_nodes = Vec::with_capacity(targets.len());
        let mut any_prekey = false;
        for target in &targets {
            let plaintext = if target.user_id == self.own_address.user_id {
                &echo_plaintext
            } else {
                &peer_plaintext
            };
            let ct = self.pairwise.encrypt(target, plaintext)?;
            any_prekey |= ct.enc_type == CiphertextType::PreKey;
            to_nodes.push(to_node(target, &ct));
        }
        debug!(message_id, devices = to_nodes.len(), "direct fan-out encoded");

        let mut message = Node::new("message")
            .attr("id", message_id)
            .attr("to", request.conversation.wire_id())
            .attr("t", now_seconds().to_string());
        for (key, value) in &request.extra_attrs {
            message = message.attr(key.clone(), value.clone());
        }
        message = message.children(to_nodes);
        if any_prekey {
            message = message.child(identity_node(self.keystore.as_ref()));
        }
        Ok(message)
    }

    /// Group send: one sender-key ciphertext for everyone, plus pairwise
    /// wrapped key distributions for participants not yet provisioned with
    /// our current chain. Distribution is at-most-once per (group, user)
    /// for the lifetime of the chain.
    fn encode_group(
        &mut self,
        message_id: &str,
        group_id: &str,
        request: &OutgoingRequest,
    ) -> Result<Node> {
        let participants = self
            .resolver
            .group_participants(group_id, request.force_refresh)?;
        let devices = self
            .resolver
            .resolve(&request.conversation, true, request.force_refresh)?;

        let plaintext = serde_json::to_vec(&request.message)?;

        let provisioned = self.distributed.entry(group_id.to_string()).or_default();
        let missing: HashSet<String> = participants
            .iter()
            .filter(|user| !provisioned.contains(*user))
            .cloned()
            .collect();

        let mut participant_nodes = Vec::new();
        let mut any_prekey = false;
        if !missing.is_empty() {
            // Snapshot the chain before sealing the message so a joiner
            // ingests the iteration this very skmsg was produced at.
            let distribution = self.group.build_distribution(group_id);
            let dist_plaintext = serde_json::to_vec(&InnerMessage::SenderKeyDistribution {
                distribution,
            })?;

            let dist_targets: Vec<DeviceAddress> = devices
                .iter()
                .filter(|addr| missing.contains(&addr.user_id))
                .cloned()
                .collect();
            self.establisher
                .ensure_sessions(&dist_targets, request.force_refresh)?;

            for target in &dist_targets {
                let ct = self.pairwise.encrypt(target, &dist_plaintext)?;
                any_prekey |= ct.enc_type == CiphertextType::PreKey;
                participant_nodes.push(to_node(target, &ct));
            }
            debug!(
                message_id,
                group_id,
                users = missing.len(),
                "sender key distributed"
            );
        }

        let skmsg = self.group.encrypt_outgoing(group_id, &plaintext)?;

        let mut message = Node::new("message")
            .attr("id", message_id)
            .attr("to", group_id)
            .attr("t", now_seconds().to_string());
        for (key, value) in &request.extra_attrs {
            message = message.attr(key.clone(), value.clone());
        }
        if !participant_nodes.is_empty() {
            message = message.child(Node::new("participants").children(participant_nodes));
        }
        message = message.child(
            Node::new("enc")
                .attr("type", CiphertextType::SenderKey.as_wire())
                .attr("v", WIRE_VERSION)
                .content(skmsg),
        );
        if any_prekey {
            message = message.child(identity_node(self.keystore.as_ref()));
        }

        let provisioned = self.distributed.entry(group_id.to_string()).or_default();
        provisioned.extend(missing);
        Ok(message)
    }

    // ---- inbound -----------------------------------------------------

    /// Decodes one inbound message node. Every `enc` child is processed
    /// independently; decode failures never abort the node and are answered
    /// with retry receipts until the per-id budget runs out. Only a
    /// malformed node itself is an error.
    pub fn receive(&mut self, node: &Node) -> Result<()> {
        if node.tag != "message" {
            return Err(Error::InvalidNode(format!(
                "expected <message>, got <{}>",
                node.tag
            )));
        }
        let from = node.required_attr("from")?.to_string();
        let message_id = node.required_attr("id")?.to_string();
        let timestamp = node
            .get_attr("t")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or_else(now_seconds);
        let push_name = node.get_attr("notify").map(str::to_string);
        let business_name = node.get_attr("verified_name").map(str::to_string);
        let peer_originated = node.get_attr("category") == Some("peer");

        let is_group = from.ends_with(crate::types::GROUP_SUFFIX);
        let sender = DeviceAddress::parse(&from)?;
        let participant = node
            .get_attr("participant")
            .map(DeviceAddress::parse)
            .transpose()?;

        // Group fan-out places per-device ciphertexts under <participants>;
        // only the ones addressed to us are ours to decode.
        let own_jid = self.own_address.to_string();
        let mut enc_children: Vec<&Node> = node.get_children("enc");
        if let Some(participants) = node.get_child("participants") {
            for to in participants.get_children("to") {
                if to.get_attr("jid") == Some(own_jid.as_str()) {
                    enc_children.extend(to.get_children("enc"));
                }
            }
        }

        // Pairwise ciphertexts decode before sender-key ones: a group node
        // can carry the key distribution and the first skmsg together.
        enc_children.sort_by_key(|enc| enc.get_attr("type") == Some("skmsg"));

        if enc_children.is_empty() {
            if node.has_child("unavailable") {
                // The relay could not deliver the ciphertext at all; ask the
                // sender to re-encrypt via the retry protocol.
                let envelope = IncomingEnvelope {
                    sender: sender.clone(),
                    participant: participant.clone(),
                    timestamp,
                    message_id: message_id.clone(),
                    business_name: business_name.clone(),
                    payload: None,
                    enc_type: CiphertextType::Ratchet,
                    peer_originated,
                };
                self.handle_decode_failure(&envelope, DecodeFailure::MessageUnavailable)?;
                return Ok(());
            }
            return Err(Error::InvalidNode("message without <enc>".into()));
        }

        for enc in enc_children {
            let enc_type = enc
                .required_attr("type")
                .ok()
                .and_then(CiphertextType::from_wire)
                .ok_or_else(|| Error::InvalidNode("unknown enc type".into()))?;

            let envelope = IncomingEnvelope {
                sender: sender.clone(),
                participant: participant.clone(),
                timestamp,
                message_id: message_id.clone(),
                business_name: business_name.clone(),
                payload: enc.content_bytes().map(|b| b.to_vec()),
                enc_type,
                peer_originated,
            };

            let decoded = match enc_type {
                CiphertextType::SenderKey => {
                    if !is_group && from != STATUS_BROADCAST {
                        return Err(Error::InvalidNode("skmsg outside a group".into()));
                    }
                    match envelope.payload.as_deref() {
                        Some(payload) => {
                            self.group
                                .decrypt(&from, envelope.decrypt_address(), payload)
                        }
                        None => crate::types::DecodedMessage::failed(
                            enc_type,
                            DecodeFailure::MessageUnavailable,
                        ),
                    }
                }
                CiphertextType::PreKey | CiphertextType::Ratchet => self.pairwise.decrypt(
                    envelope.decrypt_address(),
                    enc_type,
                    envelope.payload.as_deref(),
                ),
            };

            match decoded.outcome {
                Ok(plaintext) => match serde_json::from_slice::<InnerMessage>(&plaintext) {
                    Ok(inner) => {
                        self.handle_inner(&from, is_group, &envelope, push_name.clone(), inner)?
                    }
                    Err(e) => self.handle_decode_failure(
                        &envelope,
                        DecodeFailure::Malformed(e.to_string()),
                    )?,
                },
                Err(cause) => self.handle_decode_failure(&envelope, cause)?,
            }
        }
        Ok(())
    }

    fn handle_inner(
        &mut self,
        from: &str,
        is_group: bool,
        envelope: &IncomingEnvelope,
        push_name: Option<String>,
        inner: InnerMessage,
    ) -> Result<()> {
        let sender_user = envelope.decrypt_address().user_id.clone();
        let from_me = sender_user == self.own_address.user_id;
        let chat_id = if is_group || from == STATUS_BROADCAST {
            from.to_string()
        } else {
            sender_user.clone()
        };

        match inner {
            InnerMessage::SenderKeyDistribution { distribution } => {
                let group_id = distribution.group_id.clone();
                self.group
                    .ingest_distribution(&group_id, envelope.decrypt_address(), &distribution);
                self.keystore.flush()?;
            }
            InnerMessage::DeviceSent {
                destination,
                message,
            } => {
                // Echo from one of our own devices: same content we sent
                // elsewhere, filed under the destination chat.
                self.store_content(
                    &destination,
                    envelope,
                    *message,
                    true,
                    None,
                )?;
            }
            InnerMessage::Protocol(protocol) => {
                self.handle_protocol(&chat_id, protocol)?;
                self.keystore.flush()?;
                self.store.flush()?;
                if envelope.peer_originated {
                    self.send_receipt(envelope, Some("peer_msg"))?;
                }
            }
            InnerMessage::Reaction { target_id, emoji } => {
                self.store.add_reaction(
                    &chat_id,
                    &target_id,
                    Reaction {
                        sender: sender_user.clone(),
                        emoji,
                    },
                );
                self.store.mark_ignored(&chat_id, &target_id);
                self.events.emit(ClientEvent::ActionApplied {
                    chat: chat_id.clone(),
                    target_id,
                    action: "reaction".to_string(),
                });
                if !from_me {
                    self.send_receipt(envelope, None)?;
                }
            }
            InnerMessage::PollUpdate { target_id, payload } => {
                self.apply_poll_vote(&chat_id, &target_id, &sender_user, &payload)?;
                if !from_me {
                    self.send_receipt(envelope, None)?;
                }
            }
            content @ (InnerMessage::Chat { .. } | InnerMessage::PollCreation { .. }) => {
                self.store_content(&chat_id, envelope, content, from_me, push_name)?;
                if !from_me {
                    self.send_receipt(envelope, None)?;
                }
            }
        }
        Ok(())
    }

    /// Files a content message, deduplicating on the message key. Unread
    /// counting, contact bookkeeping and events only happen for the first
    /// delivery of a peer message.
    fn store_content(
        &mut self,
        chat_id: &str,
        envelope: &IncomingEnvelope,
        content: InnerMessage,
        from_me: bool,
        push_name: Option<String>,
    ) -> Result<()> {
        let sender_user = envelope.decrypt_address().user_id.clone();
        let message = ChatMessage {
            key: MessageKey {
                chat: chat_id.to_string(),
                id: envelope.message_id.clone(),
                sender: envelope.decrypt_address().to_string(),
                from_me,
            },
            timestamp: envelope.timestamp,
            message: content.clone(),
            status: if from_me {
                MessageStatus::Read
            } else {
                MessageStatus::Delivered
            },
            ignore_unread: from_me,
            reactions: Vec::new(),
            poll: poll_state_for(&content),
            delivered_to: Vec::new(),
            read_by: Vec::new(),
        };

        self.store.ensure_chat(chat_id);
        if !self.store.upsert_message(message.clone()) {
            debug!(message_id = %envelope.message_id, "duplicate delivery ignored");
            return Ok(());
        }

        if from_me {
            // Our own copy counts as delivered to and read by us.
            self.store
                .add_receipt_recipient(chat_id, &envelope.message_id, &sender_user, true);
        } else {
            if chat_id != STATUS_BROADCAST {
                self.store.increment_unread(chat_id);
                if self.config.auto_unarchive {
                    self.store.set_archived(chat_id, false);
                }
            }
            self.store.touch_last_seen(&sender_user, envelope.timestamp);
            if push_name.is_some() {
                self.store.upsert_contact(&sender_user, push_name.clone());
                self.events.emit(ClientEvent::NewContact {
                    user_id: sender_user.clone(),
                    push_name,
                });
            }
        }

        if chat_id == STATUS_BROADCAST {
            self.events.emit(ClientEvent::NewStatus { message });
        } else {
            self.events.emit(ClientEvent::NewMessage {
                chat: chat_id.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn handle_protocol(&mut self, chat_id: &str, protocol: ProtocolMessage) -> Result<()> {
        match protocol {
            ProtocolMessage::HistorySyncNotification { payload } => {
                let compressed = base64::engine::general_purpose::STANDARD
                    .decode(&payload)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                let payload = inflate_history_payload(&compressed)?;
                self.apply_history(payload)?;
            }
            ProtocolMessage::AppStateKeyShare { keys } => {
                let first_share = !self.keystore.has_app_state_keys();
                for key in &keys {
                    self.keystore.store_app_state_key(&key.key_id, &key.key_data)?;
                }
                debug!(count = keys.len(), "app state keys stored");
                if first_share && !self.app_state_pulled {
                    // Now that we can decrypt app state, pull the collections
                    // once.
                    self.transport.send_query(
                        IQ_SET,
                        XMLNS_APP_STATE,
                        Node::new("sync").child(Node::new("collection").attr("name", "regular")),
                    )?;
                    self.app_state_pulled = true;
                }
            }
            ProtocolMessage::Revoke { target_id } => {
                if self.store.remove_message(chat_id, &target_id) {
                    self.events.emit(ClientEvent::MessageDeleted {
                        chat: chat_id.to_string(),
                        id: target_id,
                    });
                }
            }
            ProtocolMessage::EphemeralSetting { expiration } => {
                let expiration = (expiration > 0).then_some(expiration);
                self.store.set_ephemeral_expiration(chat_id, expiration);
                self.events.emit(ClientEvent::SettingChanged {
                    chat: chat_id.to_string(),
                    ephemeral_expiration: expiration,
                });
            }
        }
        Ok(())
    }

    fn apply_history(&mut self, payload: HistorySyncPayload) -> Result<()> {
        match payload.sync_type {
            HistorySyncType::InitialBootstrap => {
                let ids: Vec<String> = payload
                    .conversations
                    .iter()
                    .map(|c| c.id.clone())
                    .collect();
                let count = ids.len();
                for conversation in payload.conversations {
                    self.merge_conversation(conversation);
                }
                self.history.replace(ids);
                self.events.emit(ClientEvent::ChatsLoaded { count });
            }
            HistorySyncType::Recent | HistorySyncType::Full => {
                let current: HashSet<String> = payload
                    .conversations
                    .iter()
                    .map(|c| c.id.clone())
                    .collect();
                for conversation in payload.conversations {
                    self.merge_conversation(conversation);
                }
                for chat in self.history.reconcile(&current) {
                    self.events
                        .emit(ClientEvent::ConversationNoLongerRecent { chat });
                }
            }
            HistorySyncType::InitialStatusV3 => {
                self.store.ensure_chat(STATUS_BROADCAST);
                for status in payload.statuses {
                    self.store.upsert_message(status);
                }
            }
            HistorySyncType::PushName => {
                for record in payload.push_names {
                    self.store
                        .upsert_contact(&record.user_id, Some(record.push_name.clone()));
                    self.events.emit(ClientEvent::NewContact {
                        user_id: record.user_id,
                        push_name: Some(record.push_name),
                    });
                }
            }
            HistorySyncType::NonBlockingData => {
                for past in payload.past_participants {
                    self.store
                        .add_past_participants(&past.group_id, past.participants);
                }
            }
        }

        if let Some(percent) = payload.progress {
            self.events
                .emit(ClientEvent::HistorySyncProgress { percent });
        }
        self.store.flush()
    }

    /// History messages merge without touching unread counters; the payload
    /// carries the authoritative count.
    fn merge_conversation(&mut self, conversation: crate::history::ConversationHistory) {
        let mut chat = self
            .store
            .chat(&conversation.id)
            .unwrap_or_else(|| Chat::new(&conversation.id));
        if let Some(name) = conversation.display_name {
            chat.display_name = Some(name);
        }
        if let Some(unread) = conversation.unread {
            chat.unread = unread;
        }
        if let Some(archived) = conversation.archived {
            chat.archived = archived;
        }
        if let Some(expiration) = conversation.ephemeral_expiration {
            chat.ephemeral_expiration = Some(expiration);
        }
        self.store.upsert_chat(chat);

        for mut message in conversation.messages {
            message.ignore_unread = true;
            self.store.upsert_message(message);
        }
    }

    fn apply_poll_vote(
        &mut self,
        chat_id: &str,
        target_id: &str,
        voter: &str,
        payload: &str,
    ) -> Result<()> {
        let Some(poll_message) = self.store.get_message(chat_id, target_id) else {
            debug!(target_id, "vote for unknown poll dropped");
            return Ok(());
        };
        let Some(poll) = poll_message.poll else {
            debug!(target_id, "vote target is not a poll");
            return Ok(());
        };

        let hashes = match decrypt_poll_vote(
            &poll.enc_key,
            target_id,
            &poll_message.key.sender,
            voter,
            payload,
        ) {
            Ok(hashes) => hashes,
            Err(e) => {
                // A vote that does not authenticate is dropped, not fatal.
                warn!(target_id, error = %e, "undecryptable poll vote dropped");
                return Ok(());
            }
        };
        let selection: Vec<String> = hashes
            .iter()
            .filter_map(|h| poll.option_hashes.get(h).cloned())
            .collect();

        if self
            .store
            .record_poll_vote(chat_id, target_id, voter, selection)
        {
            self.events.emit(ClientEvent::ActionApplied {
                chat: chat_id.to_string(),
                target_id: target_id.to_string(),
                action: "poll_vote".to_string(),
            });
        }
        Ok(())
    }

    /// One decode failure for one envelope: count it, and either ask the
    /// sender to re-encrypt or surface the terminal failure as an event.
    fn handle_decode_failure(
        &mut self,
        envelope: &IncomingEnvelope,
        cause: DecodeFailure,
    ) -> Result<()> {
        match self.retries.register_failure(&envelope.message_id) {
            RetryDecision::Retry { attempt } => {
                // A fresh one-time pre-key rides along once it is likely the
                // sender's session state itself is bad.
                let needs_bundle = attempt > 1 || envelope.payload.is_none();
                let bundle = if needs_bundle {
                    Some(self.keystore.allocate_one_time_prekey()?)
                } else {
                    None
                };
                warn!(
                    message_id = %envelope.message_id,
                    attempt,
                    cause = %cause,
                    "decode failed, requesting retry"
                );
                let receipt = build_retry_receipt(
                    envelope,
                    attempt,
                    self.keystore.registration_id(),
                    bundle.as_ref(),
                )?;
                self.transport.send_no_response(receipt)?;
            }
            RetryDecision::Exhausted => {
                warn!(
                    message_id = %envelope.message_id,
                    cause = %cause,
                    "retry budget exhausted"
                );
                self.events.emit(ClientEvent::RetryExhausted {
                    message_id: envelope.message_id.clone(),
                    sender: envelope.sender.to_string(),
                    participant: envelope.participant.as_ref().map(|p| p.to_string()),
                    enc_type: envelope.enc_type,
                    cause,
                });
            }
        }
        Ok(())
    }

    fn send_receipt(&self, envelope: &IncomingEnvelope, receipt_type: Option<&str>) -> Result<()> {
        let target = match &envelope.participant {
            Some(_) => envelope.sender.user_id.clone(),
            None => envelope.sender.to_string(),
        };
        let mut receipt = Node::new("receipt")
            .attr("to", target)
            .attr("id", envelope.message_id.clone());
        if let Some(t) = receipt_type {
            receipt = receipt.attr("type", t);
        }
        if let Some(participant) = &envelope.participant {
            receipt = receipt.attr("participant", participant.to_string());
        }
        self.transport.send_no_response(receipt)
    }
}

fn to_node(target: &DeviceAddress, ct: &PairwiseCiphertext) -> Node {
    Node::new("to").attr("jid", target.to_string()).child(
        Node::new("enc")
            .attr("type", ct.enc_type.as_wire())
            .attr("v", WIRE_VERSION)
            .content(ct.ciphertext.clone()),
    )
}

fn identity_node(keystore: &dyn KeyStore) -> Node {
    Node::new("device-identity").content(keystore.identity_block())
}

fn poll_state_for(message: &InnerMessage) -> Option<PollState> {
    match message {
        InnerMessage::PollCreation {
            options, enc_key, ..
        } => Some(PollState {
            enc_key: *enc_key,
            options: options.clone(),
            option_hashes: options
                .iter()
                .map(|o| (poll_option_hash(o), o.clone()))
                .collect(),
            votes: HashMap::new(),
        }),
        _ => None,
    }
}

/// Hash under which a poll option travels inside encrypted votes.
pub fn poll_option_hash(option: &str) -> String {
    hex::encode(Sha256::digest(option.as_bytes()))
}

fn poll_vote_key(
    enc_key: &[u8; 32],
    poll_id: &str,
    poll_sender: &str,
    voter: &str,
) -> ([u8; 32], [u8; 12]) {
    let mut context = Vec::new();
    context.extend_from_slice(poll_id.as_bytes());
    context.push(0);
    context.extend_from_slice(poll_sender.as_bytes());
    context.push(0);
    context.extend_from_slice(voter.as_bytes());
    let derived = kdf(enc_key, &context, 1)[0];
    derive_key_nonce(&derived, POLL_VOTE_AEAD_LABEL)
}

/// Encrypts a voter's selected option names for a poll vote payload.
pub fn encrypt_poll_vote(
    enc_key: &[u8; 32],
    poll_id: &str,
    poll_sender: &str,
    voter: &str,
    selected: &[String],
) -> Result<String> {
    let hashes: Vec<String> = selected.iter().map(|o| poll_option_hash(o)).collect();
    let raw = serde_json::to_vec(&hashes)?;
    let (key, nonce) = poll_vote_key(enc_key, poll_id, poll_sender, voter);
    let sealed = seal(&key, &nonce, &raw)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
}

fn decrypt_poll_vote(
    enc_key: &[u8; 32],
    poll_id: &str,
    poll_sender: &str,
    voter: &str,
    payload: &str,
) -> Result<Vec<String>> {
    let sealed = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let (key, nonce) = poll_vote_key(enc_key, poll_id, poll_sender, voter);
    let raw = open(&key, &nonce, &sealed)?;
    Ok(serde_json::from_slice(&raw)?)
}
