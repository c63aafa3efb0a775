#![allow(dead_code)]

use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use wirefan::establisher::bundle_node;
use wirefan::node::Node;
use wirefan::transport::{Transport, XMLNS_DEVICE_SYNC, XMLNS_ENCRYPT, XMLNS_GROUPS};
use wirefan::{
    ClientEvent, DeviceAddress, MemoryKeyStore, MemoryStore, MessagePipeline, PipelineConfig,
    PreKeyBundle, Result,
};

#[derive(Default)]
struct DirectoryInner {
    /// user id -> (device id, announced with key index)
    devices: HashMap<String, Vec<(u16, bool)>>,
    groups: HashMap<String, Vec<String>>,
    bundles: HashMap<String, PreKeyBundle>,
}

/// Shared relay-side state: who has which devices, which bundles are
/// published, who is in which group. All endpoints in a test point their
/// transports at the same directory.
#[derive(Clone, Default)]
pub struct Directory {
    inner: Arc<Mutex<DirectoryInner>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: &DeviceAddress, bundle: PreKeyBundle) {
        let mut inner = self.inner.lock().unwrap();
        let devices = inner.devices.entry(addr.user_id.clone()).or_default();
        if !devices.iter().any(|(id, _)| *id == addr.device_id) {
            devices.push((addr.device_id, true));
        }
        inner.bundles.insert(addr.to_string(), bundle);
    }

    /// A companion-device announcement missing its key index, which
    /// resolvers must reject.
    pub fn register_stale(&self, user_id: &str, device_id: u16) {
        self.inner
            .lock()
            .unwrap()
            .devices
            .entry(user_id.to_string())
            .or_default()
            .push((device_id, false));
    }

    pub fn set_group(&self, group_id: &str, participants: &[&str]) {
        self.inner.lock().unwrap().groups.insert(
            group_id.to_string(),
            participants.iter().map(|p| p.to_string()).collect(),
        );
    }
}

/// In-memory [`Transport`] backed by a [`Directory`]. Fire-and-forget
/// nodes are recorded for assertions; queries are answered from directory
/// state and logged by xmlns.
pub struct FakeTransport {
    directory: Directory,
    sent: Mutex<Vec<Node>>,
    queries: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            sent: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn take_sent(&self) -> Vec<Node> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn query_count(&self, xmlns: &str) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| *q == xmlns)
            .count()
    }
}

impl Transport for FakeTransport {
    fn send_query(&self, _query_type: &str, xmlns: &str, body: Node) -> Result<Node> {
        self.queries.lock().unwrap().push(xmlns.to_string());
        let inner = self.directory.inner.lock().unwrap();

        match xmlns {
            XMLNS_DEVICE_SYNC => {
                let mut response = Node::new("usync");
                for user in body.get_children("user") {
                    let Some(jid) = user.get_attr("jid") else {
                        continue;
                    };
                    let mut user_node = Node::new("user").attr("jid", jid);
                    if let Some(devices) = inner.devices.get(jid) {
                        for (device_id, has_key_index) in devices {
                            let mut device = Node::new("device").attr("id", device_id.to_string());
                            if *has_key_index && *device_id != 0 {
                                device = device.attr("key-index", "1");
                            }
                            user_node = user_node.child(device);
                        }
                    }
                    response = response.child(user_node);
                }
                Ok(response)
            }
            XMLNS_ENCRYPT => {
                let mut response = Node::new("list");
                for user in body.get_children("user") {
                    let Some(jid) = user.get_attr("jid") else {
                        continue;
                    };
                    let child = match inner.bundles.get(jid) {
                        Some(bundle) => bundle_node(jid, bundle),
                        None => Node::new("user").attr("jid", jid).child(Node::new("error")),
                    };
                    response = response.child(child);
                }
                Ok(response)
            }
            XMLNS_GROUPS => {
                let group_id = body.get_attr("id").unwrap_or_default();
                let mut group = Node::new("group").attr("id", group_id).attr("version", "1");
                if let Some(participants) = inner.groups.get(group_id) {
                    for participant in participants {
                        group = group.child(Node::new("participant").attr("jid", participant));
                    }
                }
                Ok(Node::new("result").child(group))
            }
            _ => Ok(Node::new("result")),
        }
    }

    fn send_no_response(&self, node: Node) -> Result<()> {
        self.sent.lock().unwrap().push(node);
        Ok(())
    }
}

/// One logged-in device with its full stack wired to the shared directory.
pub struct Endpoint {
    pub address: DeviceAddress,
    pub keystore: Arc<MemoryKeyStore>,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<FakeTransport>,
    pub events: Receiver<ClientEvent>,
    pub pipeline: MessagePipeline,
}

pub fn endpoint(directory: &Directory, user: &str, device: u16) -> Endpoint {
    let address = DeviceAddress::new(user, device);
    let keystore = Arc::new(MemoryKeyStore::new());
    directory.register(&address, keystore.own_bundle());

    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(FakeTransport::new(directory.clone()));
    let (tx, rx) = crossbeam_channel::unbounded();

    let pipeline = MessagePipeline::new(
        address.clone(),
        keystore.clone(),
        transport.clone(),
        store.clone(),
        Arc::new(tx),
        PipelineConfig::default(),
    );

    Endpoint {
        address,
        keystore,
        store,
        transport,
        events: rx,
        pipeline,
    }
}

/// Plays relay: extracts the recipient's slice of a sent direct message
/// node and re-frames it the way it would arrive at that device.
pub fn deliver_direct(sent: &Node, sender: &DeviceAddress, recipient: &DeviceAddress) -> Node {
    let recipient_jid = recipient.to_string();
    let to = sent
        .get_children("to")
        .into_iter()
        .find(|to| to.get_attr("jid") == Some(recipient_jid.as_str()))
        .unwrap_or_else(|| panic!("{recipient_jid} not in fan-out"));
    let enc = to.get_child("enc").expect("to node without enc").clone();

    Node::new("message")
        .attr("from", sender.to_string())
        .attr("id", sent.get_attr("id").expect("message id"))
        .attr("t", sent.get_attr("t").unwrap_or("0"))
        .child(enc)
}

/// Relay framing for a group message as seen by one recipient device: the
/// shared skmsg plus, if present, the recipient's pairwise slice of the
/// participants block.
pub fn deliver_group(
    sent: &Node,
    group_id: &str,
    sender: &DeviceAddress,
    recipient: &DeviceAddress,
) -> Node {
    let mut message = Node::new("message")
        .attr("from", group_id)
        .attr("participant", sender.to_string())
        .attr("id", sent.get_attr("id").expect("message id"))
        .attr("t", sent.get_attr("t").unwrap_or("0"));

    if let Some(participants) = sent.get_child("participants") {
        let recipient_jid = recipient.to_string();
        let mine: Vec<Node> = participants
            .get_children("to")
            .into_iter()
            .filter(|to| to.get_attr("jid") == Some(recipient_jid.as_str()))
            .cloned()
            .collect();
        if !mine.is_empty() {
            message = message.child(Node::new("participants").children(mine));
        }
    }

    for enc in sent.get_children("enc") {
        message = message.child(enc.clone());
    }
    message
}

pub fn drain_events(rx: &Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
