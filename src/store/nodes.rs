//! Peer-node registry. Admission accepts submissions targeting this
//! node or any registered peer.

use super::partitions::encode_node_key;
use super::{Result, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub name: String,
    pub institution: String,
    pub endpoint_url: String,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Store {
    pub fn upsert_node(&self, node: &NodeRecord) -> Result<()> {
        self.nodes
            .insert(encode_node_key(&node.node_id), serde_json::to_vec(node)?)?;
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        match self.nodes.get(encode_node_key(node_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        for item in self.nodes.iter() {
            let (_, value) = item?;
            nodes.push(serde_json::from_slice(&value)?);
        }
        Ok(nodes)
    }
}
