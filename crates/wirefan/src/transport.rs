use crate::node::Node;
use crate::Result;

pub const IQ_GET: &str = "get";
pub const IQ_SET: &str = "set";

/// Query domain for device discovery.
pub const XMLNS_DEVICE_SYNC: &str = "usync";
/// Query domain for key-bundle fetches.
pub const XMLNS_ENCRYPT: &str = "encrypt";
/// Query domain for group metadata.
pub const XMLNS_GROUPS: &str = "w:g2";
/// Query domain for app-state collection pulls.
pub const XMLNS_APP_STATE: &str = "w:sync:app:state";

/// Wire framing and socket handling live behind this seam. The relay only
/// ever sees the opaque node trees exchanged here.
pub trait Transport: Send + Sync {
    /// Request/response round trip; the relay's reply node is returned.
    fn send_query(&self, query_type: &str, xmlns: &str, body: Node) -> Result<Node>;

    /// Fire-and-forget, used for messages, receipts and retries.
    fn send_no_response(&self, node: Node) -> Result<()>;
}
