use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{DeviceCache, GroupMetadata, GroupMetadataCache, DEVICE_CACHE_TTL, GROUP_METADATA_TTL};
use crate::node::Node;
use crate::transport::{Transport, IQ_GET, XMLNS_DEVICE_SYNC, XMLNS_GROUPS};
use crate::types::{ConversationId, DeviceAddress};
use crate::{Error, Result};

/// Maps a conversation to the concrete set of device addresses that must
/// each receive an independent ciphertext. Device lists and group
/// participant lists are cached with a TTL; `force` bypasses both caches.
pub struct AddressResolver {
    transport: Arc<dyn Transport>,
    own_address: DeviceAddress,
    devices: DeviceCache,
    groups: GroupMetadataCache,
}

impl AddressResolver {
    pub fn new(transport: Arc<dyn Transport>, own_address: DeviceAddress) -> Self {
        Self {
            transport,
            own_address,
            devices: DeviceCache::new(DEVICE_CACHE_TTL),
            groups: GroupMetadataCache::new(GROUP_METADATA_TTL),
        }
    }

    pub fn own_address(&self) -> &DeviceAddress {
        &self.own_address
    }

    pub fn resolve(
        &mut self,
        conversation: &ConversationId,
        exclude_self: bool,
        force: bool,
    ) -> Result<Vec<DeviceAddress>> {
        let users = match conversation {
            ConversationId::Direct(peer) => {
                let mut users = vec![self.own_address.user_id.clone()];
                if *peer != self.own_address.user_id {
                    users.push(peer.clone());
                }
                users
            }
            ConversationId::Group(group_id) => self.group_participants(group_id, force)?,
        };

        self.expand_users(&users, exclude_self, force)
    }

    /// The group's participant user ids, from cache or a metadata query.
    pub fn group_participants(&mut self, group_id: &str, force: bool) -> Result<Vec<String>> {
        if !force {
            if let Some(metadata) = self.groups.get(&group_id.to_string()) {
                return Ok(metadata.participants.clone());
            }
        }

        let body = Node::new("query").attr("id", group_id);
        let response = self
            .transport
            .send_query(IQ_GET, XMLNS_GROUPS, body)
            .map_err(|e| Error::AddressResolution(format!("group metadata query: {e}")))?;

        let group_node = response
            .get_child("group")
            .ok_or_else(|| Error::AddressResolution("metadata reply without <group>".into()))?;
        if group_node.has_child("error") {
            return Err(Error::AddressResolution(format!(
                "relay rejected metadata query for {group_id}"
            )));
        }

        let version = group_node
            .get_attr("version")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let participants: Vec<String> = group_node
            .get_children("participant")
            .iter()
            .filter_map(|p| p.get_attr("jid").map(str::to_string))
            .collect();

        debug!(group_id, version, count = participants.len(), "group metadata refreshed");
        self.groups.insert(
            group_id.to_string(),
            GroupMetadata {
                participants: participants.clone(),
                version,
            },
        );
        Ok(participants)
    }

    /// Expands user ids into concrete device addresses, de-duplicated.
    /// Cache misses (or all users under `force`) share one batched
    /// discovery query whose results refresh every user id touched.
    pub fn expand_users(
        &mut self,
        users: &[String],
        exclude_self: bool,
        force: bool,
    ) -> Result<Vec<DeviceAddress>> {
        let mut unique_users: Vec<String> = Vec::new();
        let mut seen_users = HashSet::new();
        for user in users {
            if seen_users.insert(user.clone()) {
                unique_users.push(user.clone());
            }
        }

        let misses: Vec<String> = if force {
            unique_users.clone()
        } else {
            unique_users
                .iter()
                .filter(|user| self.devices.get(*user).is_none())
                .cloned()
                .collect()
        };

        if !misses.is_empty() {
            self.query_devices(&misses)?;
        }

        let mut addresses = Vec::new();
        let mut seen = HashSet::new();
        for user in &unique_users {
            let Some(devices) = self.devices.get(user) else {
                continue;
            };
            for addr in devices {
                if exclude_self && *addr == self.own_address {
                    continue;
                }
                if seen.insert(addr.clone()) {
                    addresses.push(addr.clone());
                }
            }
        }
        Ok(addresses)
    }

    pub fn invalidate_user(&mut self, user_id: &str) {
        self.devices.invalidate(&user_id.to_string());
    }

    pub fn invalidate_group(&mut self, group_id: &str) {
        self.groups.invalidate(&group_id.to_string());
    }

    /// One batched usync round trip. Every user id present in the reply
    /// refreshes the cache, not just the original misses.
    fn query_devices(&mut self, users: &[String]) -> Result<()> {
        let body = Node::new("usync").children(
            users
                .iter()
                .map(|user| Node::new("user").attr("jid", user.clone())),
        );

        let response = self
            .transport
            .send_query(IQ_GET, XMLNS_DEVICE_SYNC, body)
            .map_err(|e| Error::AddressResolution(format!("device discovery: {e}")))?;

        if response.has_child("error") {
            return Err(Error::AddressResolution(
                "relay rejected device discovery".into(),
            ));
        }

        for user_node in response.get_children("user") {
            let Some(user_id) = user_node.get_attr("jid") else {
                continue;
            };

            let mut devices = Vec::new();
            for device_node in user_node.get_children("device") {
                let Some(device_id) = device_node
                    .get_attr("id")
                    .and_then(|id| id.parse::<u16>().ok())
                else {
                    continue;
                };

                // A non-primary device announcement without a rotation key
                // index is treated as stale and rejected.
                if device_id != 0 && device_node.get_attr("key-index").is_none() {
                    continue;
                }

                devices.push(DeviceAddress::new(user_id, device_id));
            }

            debug!(user_id, count = devices.len(), "device list refreshed");
            self.devices.insert(user_id.to_string(), devices);
        }

        Ok(())
    }
}
