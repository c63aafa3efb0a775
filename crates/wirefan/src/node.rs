use std::collections::BTreeMap;

use crate::{Error, Result};

/// Abstract wire tree: a tag, string attributes, optional raw content and
/// child nodes. The pipeline depends only on this shape; framing and
/// transport encoding belong to the Transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub content: Option<Vec<u8>>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: None,
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn content(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = Some(bytes.into());
        self
    }

    pub fn child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn required_attr(&self, key: &str) -> Result<&str> {
        self.get_attr(key)
            .ok_or_else(|| Error::MissingAttribute(key.to_string()))
    }

    pub fn get_child(&self, tag: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn get_children(&self, tag: &str) -> Vec<&Node> {
        self.children.iter().filter(|c| c.tag == tag).collect()
    }

    pub fn has_child(&self, tag: &str) -> bool {
        self.get_child(tag).is_some()
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    /// Content interpreted as UTF-8, for text-valued children.
    pub fn content_str(&self) -> Result<&str> {
        let bytes = self
            .content_bytes()
            .ok_or_else(|| Error::InvalidNode(format!("<{}> has no content", self.tag)))?;
        std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidNode(format!("<{}> content is not UTF-8", self.tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_accessors() {
        let node = Node::new("message")
            .attr("id", "m1")
            .attr("to", "bob")
            .child(Node::new("enc").attr("type", "msg").content(vec![1, 2, 3]))
            .child(Node::new("enc").attr("type", "pkmsg").content(vec![4]));

        assert_eq!(node.get_attr("id"), Some("m1"));
        assert_eq!(node.required_attr("to").unwrap(), "bob");
        assert!(node.required_attr("from").is_err());
        assert_eq!(node.get_children("enc").len(), 2);
        assert_eq!(
            node.get_child("enc").unwrap().content_bytes(),
            Some(&[1u8, 2, 3][..])
        );
        assert!(!node.has_child("receipt"));
    }
}
