//! Container content trees
//!
//! A container (page) is a tree of typed nodes. Embed instances appear as
//! nodes whose `localId` equals the instance's consumer id; that is the only
//! matching rule used to decide whether an instance still exists.

use crate::ids::{ConsumerId, ContainerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Node type used for embed placements
pub const EMBED_NODE_TYPE: &str = "extension";

/// One node of a container's content tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentNode {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentNode>,
}

impl ContentNode {
    /// Document root
    #[must_use]
    pub fn doc(content: Vec<ContentNode>) -> Self {
        Self {
            kind: "doc".to_string(),
            content,
            ..Self::default()
        }
    }

    /// Paragraph wrapping child nodes
    #[must_use]
    pub fn paragraph(content: Vec<ContentNode>) -> Self {
        Self {
            kind: "paragraph".to_string(),
            content,
            ..Self::default()
        }
    }

    /// Embed placement for a consumer
    #[must_use]
    pub fn embed(consumer_id: &ConsumerId) -> Self {
        Self {
            kind: EMBED_NODE_TYPE.to_string(),
            local_id: Some(consumer_id.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Whether any node in this subtree carries `localId == id`
    #[must_use]
    pub fn contains_node(&self, id: &str) -> bool {
        self.walk().any(|node| node.local_id.as_deref() == Some(id))
    }

    /// Total number of nodes in this subtree
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.walk().count()
    }

    /// Local ids of every embed node in this subtree
    #[must_use]
    pub fn embed_ids(&self) -> Vec<ConsumerId> {
        self.walk()
            .filter(|node| node.kind == EMBED_NODE_TYPE)
            .filter_map(|node| node.local_id.as_deref().map(ConsumerId::from))
            .collect()
    }

    /// Depth-first iterator over this subtree
    pub fn walk(&self) -> impl Iterator<Item = &ContentNode> {
        NodeWalk { stack: vec![self] }
    }
}

// Explicit stack so deeply nested documents cannot overflow the call stack.
struct NodeWalk<'a> {
    stack: Vec<&'a ContentNode>,
}

impl<'a> Iterator for NodeWalk<'a> {
    type Item = &'a ContentNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.content.iter().rev());
        Some(node)
    }
}

/// A container as returned by the document service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: ContainerId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version_number: u64,
    pub content: ContentNode,
}

impl Container {
    /// Whether the consumer's embed node is still present
    #[inline]
    #[must_use]
    pub fn contains_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.content.contains_node(consumer_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested(depth: usize, leaf: ContentNode) -> ContentNode {
        (0..depth).fold(leaf, |inner, _| ContentNode::paragraph(vec![inner]))
    }

    #[test]
    fn finds_deeply_nested_embed() {
        let tree = ContentNode::doc(vec![
            ContentNode::paragraph(vec![]),
            nested(1_000, ContentNode::embed(&"E9".into())),
        ]);
        assert!(tree.contains_node("E9"));
        assert!(!tree.contains_node("E10"));
        assert_eq!(tree.node_count(), 1_003);
    }

    #[test]
    fn matches_only_on_local_id() {
        let tree: ContentNode = serde_json::from_value(json!({
            "type": "doc",
            "content": [
                {"type": "extension", "attrs": {"localId": "E1"}},
                {"type": "extension", "localId": "E2"}
            ]
        }))
        .unwrap();

        assert!(!tree.contains_node("E1"));
        assert!(tree.contains_node("E2"));
        assert_eq!(tree.embed_ids(), vec![ConsumerId::from("E2")]);
    }

    #[test]
    fn container_roundtrips_as_camel_case() {
        let container = Container {
            id: "C1".into(),
            title: "Runbook".to_string(),
            version_number: 7,
            content: ContentNode::doc(vec![ContentNode::embed(&"E1".into())]),
        };
        let json = serde_json::to_value(&container).unwrap();
        assert_eq!(json["versionNumber"], 7);
        assert_eq!(json["content"]["content"][0]["localId"], "E1");
        assert!(container.contains_consumer(&"E1".into()));
    }
}
