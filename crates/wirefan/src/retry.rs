use std::collections::HashMap;

use crate::keystore::PreKeyBundle;
use crate::node::Node;
use crate::types::IncomingEnvelope;
use crate::utils::now_seconds;
use crate::Result;

/// Hard cap on retry receipts sent per message id.
pub const MAX_RETRY_ATTEMPTS: u8 = 3;

const RETRY_PROTOCOL_VERSION: &str = "1";

/// What to do after one more decode failure for a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send a retry receipt carrying this attempt number (1-based).
    Retry { attempt: u8 },
    /// Budget spent; surface the failure and stay silent on the wire.
    Exhausted,
}

/// Per-message-id retry attempt counter.
///
/// Entries are never removed or reset, even after a later successful
/// decode: a peer replaying failures for an id we already gave up on must
/// not be able to restart the receipt loop.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: HashMap<String, u8>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one decode failure for `message_id` and decides the response.
    pub fn register_failure(&mut self, message_id: &str) -> RetryDecision {
        let count = self.attempts.entry(message_id.to_string()).or_insert(0);
        if *count >= MAX_RETRY_ATTEMPTS {
            return RetryDecision::Exhausted;
        }
        *count += 1;
        RetryDecision::Retry { attempt: *count }
    }

    pub fn attempts(&self, message_id: &str) -> u8 {
        self.attempts.get(message_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Drops the whole ledger, e.g. on logout.
    pub fn clear(&mut self) {
        self.attempts.clear();
    }
}

/// Builds the retry receipt asking the sender to re-encrypt one message.
/// `bundle` is attached when the sender will need fresh key material to
/// re-establish the session before resending.
pub fn build_retry_receipt(
    envelope: &IncomingEnvelope,
    attempt: u8,
    registration_id: u32,
    bundle: Option<&PreKeyBundle>,
) -> Result<Node> {
    // Group failures are addressed to the group id with the sending device
    // named as participant; direct failures go straight to the device.
    let target = match &envelope.participant {
        Some(_) => envelope.sender.user_id.clone(),
        None => envelope.sender.to_string(),
    };
    let mut receipt = Node::new("receipt")
        .attr("to", target)
        .attr("id", envelope.message_id.clone())
        .attr("type", "retry");
    if let Some(participant) = &envelope.participant {
        receipt = receipt.attr("participant", participant.to_string());
    }

    receipt = receipt
        .child(
            Node::new("retry")
                .attr("count", attempt.to_string())
                .attr("id", envelope.message_id.clone())
                .attr("t", now_seconds().to_string())
                .attr("v", RETRY_PROTOCOL_VERSION),
        )
        .child(Node::new("registration").content(registration_id.to_string().into_bytes()));

    if let Some(bundle) = bundle {
        receipt = receipt.child(Node::new("keys").content(serde_json::to_vec(bundle)?));
    }

    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CiphertextType, DeviceAddress};

    fn envelope() -> IncomingEnvelope {
        IncomingEnvelope {
            sender: DeviceAddress::primary("bob"),
            participant: None,
            timestamp: 1,
            message_id: "m1".to_string(),
            business_name: None,
            payload: Some(vec![1, 2, 3]),
            enc_type: CiphertextType::Ratchet,
            peer_originated: false,
        }
    }

    #[test]
    fn cap_is_three_and_never_resets() {
        let mut ledger = RetryLedger::new();
        assert_eq!(
            ledger.register_failure("m1"),
            RetryDecision::Retry { attempt: 1 }
        );
        assert_eq!(
            ledger.register_failure("m1"),
            RetryDecision::Retry { attempt: 2 }
        );
        assert_eq!(
            ledger.register_failure("m1"),
            RetryDecision::Retry { attempt: 3 }
        );
        assert_eq!(ledger.register_failure("m1"), RetryDecision::Exhausted);
        assert_eq!(ledger.register_failure("m1"), RetryDecision::Exhausted);
        assert_eq!(ledger.attempts("m1"), 3);

        // Independent ids keep independent budgets.
        assert_eq!(
            ledger.register_failure("m2"),
            RetryDecision::Retry { attempt: 1 }
        );
    }

    #[test]
    fn receipt_carries_count_and_registration() {
        let node = build_retry_receipt(&envelope(), 2, 42, None).unwrap();
        assert_eq!(node.get_attr("type"), Some("retry"));
        assert_eq!(node.get_attr("to"), Some("bob:0"));
        let retry = node.get_child("retry").unwrap();
        assert_eq!(retry.get_attr("count"), Some("2"));
        assert_eq!(retry.get_attr("id"), Some("m1"));
        assert_eq!(
            node.get_child("registration").unwrap().content_str().unwrap(),
            "42"
        );
        assert!(node.get_child("keys").is_none());
    }

    #[test]
    fn receipt_for_group_names_the_participant() {
        let mut env = envelope();
        env.participant = Some(DeviceAddress::new("carol", 4));
        let node = build_retry_receipt(&env, 1, 7, None).unwrap();
        assert_eq!(node.get_attr("participant"), Some("carol:4"));
    }
}
