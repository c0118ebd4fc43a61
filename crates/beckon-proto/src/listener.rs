//! Listener configuration shared across broker crates

use serde::{Deserialize, Serialize};

/// Transport handled by a front listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    /// Raw passthrough, no routing key; dial-backs go to any agent
    /// registered for the listener
    Tcp,
    /// Request head is read far enough to extract the Host routing key
    Http,
}

/// One ACL entry: which access id may register, with which token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclEntry {
    pub access_id: String,
    pub register_token: String,
}

/// A public endpoint the broker listens on; immutable after startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub listen_address: String,
    pub protocol: ListenerProtocol,
    #[serde(default)]
    pub acl: Vec<AclEntry>,
}

impl ListenerSpec {
    /// Key identifying this listener in the agent table
    pub fn listener_key(&self) -> &str {
        &self.listen_address
    }
}
