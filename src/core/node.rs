use serde::Serialize;
use std::net::SocketAddr;

/// Cluster id meaning "not assigned to any cluster".
pub const UNASSIGNED: i64 = 0;

/// How a node's SSH account authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAuth {
    Password(String),
    IdentityFile(String),
}

/// A registered node including its SSH credentials. Never serialized;
/// use [`Node`] for anything outward-facing.
#[derive(Debug, Clone)]
pub struct FullNode {
    pub id: i64,
    pub name: String,
    pub addr: SocketAddr,
    pub login: String,
    pub auth: NodeAuth,
    pub cluster_id: i64,
    pub is_control_plane: bool,
}

/// Registration-time node data. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub addr: SocketAddr,
    pub login: String,
    pub auth: NodeAuth,
}

/// Credential-free view of a node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub addr: SocketAddr,
    pub cluster_id: i64,
    pub is_control_plane: bool,
}

impl FullNode {
    pub fn redacted(&self) -> Node {
        Node {
            id: self.id,
            name: self.name.clone(),
            addr: self.addr,
            cluster_id: self.cluster_id,
            is_control_plane: self.is_control_plane,
        }
    }
}
