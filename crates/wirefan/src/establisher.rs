use std::sync::Arc;
use tracing::debug;

use crate::keystore::{KeyStore, PreKeyBundle};
use crate::node::Node;
use crate::transport::{Transport, IQ_GET, XMLNS_ENCRYPT};
use crate::types::DeviceAddress;
use crate::{Error, Result};

/// Guarantees pairwise sessions exist for a set of device addresses before
/// the pipeline encrypts to them. Missing sessions are bootstrapped from
/// relay-fetched pre-key bundles in one batched query.
pub struct SessionEstablisher {
    keystore: Arc<dyn KeyStore>,
    transport: Arc<dyn Transport>,
}

impl SessionEstablisher {
    pub fn new(keystore: Arc<dyn KeyStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            keystore,
            transport,
        }
    }

    /// Idempotent: addresses that already have a session are skipped, so a
    /// second call with the same set sends no query at all. `force` refetches
    /// bundles for every address, overwriting existing sessions.
    pub fn ensure_sessions(&self, addrs: &[DeviceAddress], force: bool) -> Result<()> {
        let missing: Vec<&DeviceAddress> = addrs
            .iter()
            .filter(|addr| force || !self.keystore.has_session(addr))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        debug!(count = missing.len(), "fetching pre-key bundles");
        let body = Node::new("key").children(
            missing
                .iter()
                .map(|addr| Node::new("user").attr("jid", addr.to_string())),
        );
        let response = self
            .transport
            .send_query(IQ_GET, XMLNS_ENCRYPT, body)
            .map_err(|e| Error::SessionBootstrap(format!("bundle fetch: {e}")))?;

        for addr in missing {
            let user_node = response
                .get_children("user")
                .into_iter()
                .find(|u| u.get_attr("jid") == Some(addr.to_string().as_str()))
                .ok_or_else(|| {
                    Error::SessionBootstrap(format!("no bundle returned for {addr}"))
                })?;
            if user_node.has_child("error") {
                return Err(Error::SessionBootstrap(format!(
                    "relay refused bundle for {addr}"
                )));
            }

            let bundle = parse_bundle(user_node)?;
            self.keystore.create_session(addr, &bundle)?;
        }

        Ok(())
    }
}

/// Reads one published bundle out of its wire node.
///
/// ```text
/// <user jid="alice:0">
///   <registration>381273</registration>
///   <identity>64 hex chars</identity>
///   <skey><id>1</id><value>64 hex chars</value></skey>
///   <key><id>7</id><value>64 hex chars</value></key>   (optional)
/// </user>
/// ```
pub fn parse_bundle(user_node: &Node) -> Result<PreKeyBundle> {
    let registration_id = child_text(user_node, "registration")?
        .parse::<u32>()
        .map_err(|_| Error::SessionBootstrap("bad registration id".into()))?;
    let identity_key = parse_hex32(&child_text(user_node, "identity")?)?;

    let skey = user_node
        .get_child("skey")
        .ok_or_else(|| Error::SessionBootstrap("bundle without signed pre-key".into()))?;
    let signed_prekey_id = child_text(skey, "id")?
        .parse::<u32>()
        .map_err(|_| Error::SessionBootstrap("bad signed pre-key id".into()))?;
    let signed_prekey = parse_hex32(&child_text(skey, "value")?)?;

    let (one_time_prekey_id, one_time_prekey) = match user_node.get_child("key") {
        Some(key) => {
            let id = child_text(key, "id")?
                .parse::<u32>()
                .map_err(|_| Error::SessionBootstrap("bad one-time pre-key id".into()))?;
            let value = parse_hex32(&child_text(key, "value")?)?;
            (Some(id), Some(value))
        }
        None => (None, None),
    };

    Ok(PreKeyBundle {
        registration_id,
        identity_key,
        signed_prekey_id,
        signed_prekey,
        one_time_prekey_id,
        one_time_prekey,
    })
}

/// Renders a bundle back into the wire shape `parse_bundle` reads.
pub fn bundle_node(jid: &str, bundle: &PreKeyBundle) -> Node {
    let mut node = Node::new("user")
        .attr("jid", jid)
        .child(Node::new("registration").content(bundle.registration_id.to_string().into_bytes()))
        .child(Node::new("identity").content(hex::encode(bundle.identity_key).into_bytes()))
        .child(
            Node::new("skey")
                .child(
                    Node::new("id").content(bundle.signed_prekey_id.to_string().into_bytes()),
                )
                .child(Node::new("value").content(hex::encode(bundle.signed_prekey).into_bytes())),
        );

    if let (Some(id), Some(value)) = (bundle.one_time_prekey_id, &bundle.one_time_prekey) {
        node = node.child(
            Node::new("key")
                .child(Node::new("id").content(id.to_string().into_bytes()))
                .child(Node::new("value").content(hex::encode(value).into_bytes())),
        );
    }
    node
}

fn child_text(node: &Node, tag: &str) -> Result<String> {
    let child = node
        .get_child(tag)
        .ok_or_else(|| Error::SessionBootstrap(format!("bundle missing <{tag}>")))?;
    let text = child
        .content_str()
        .map_err(|_| Error::SessionBootstrap(format!("empty <{tag}>")))?;
    Ok(text.to_string())
}

fn parse_hex32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::SessionBootstrap("key is not 32 bytes".into()))?;
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    #[test]
    fn bundle_node_roundtrip() {
        let store = MemoryKeyStore::new();
        let bundle = store.allocate_one_time_prekey().unwrap();
        let node = bundle_node("alice:0", &bundle);
        assert_eq!(parse_bundle(&node).unwrap(), bundle);
    }

    #[test]
    fn bundle_without_one_time_key_parses() {
        let store = MemoryKeyStore::new();
        let bundle = store.own_bundle();
        assert!(bundle.one_time_prekey.is_none());
        let node = bundle_node("bob:2", &bundle);
        assert_eq!(parse_bundle(&node).unwrap(), bundle);
    }
}
