//! Control channel server.
//!
//! Agents connect here, register with an access id and token, and then
//! hold the connection open. The broker pushes one bind frame down the
//! connection for every public stream routed to the agent; the agent
//! never sends anything after its registration frame.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::Framed;
use uuid::Uuid;

use beckon_proto::{ControlCodec, ControlMessage, ListenerSpec};

use crate::agent_registry::{AgentKey, AgentRegistry, RegisteredAgent};

/// Why a registration was rejected.
///
/// Rejections are terminal: the connection is closed without a response
/// payload and the reason only appears in the broker's logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("Unknown access id")]
    UnknownAccessId,
    #[error("Register token mismatch")]
    TokenMismatch,
}

/// Search every listener ACL for entries granting `access_id` with
/// `register_token`, and return the keys of the listeners it may serve.
///
/// An access id that appears in no ACL at all is distinguished from one
/// that appears but only with other tokens, so the log can tell an
/// unknown agent from a bad credential.
pub fn acl_grants(
    listeners: &[ListenerSpec],
    access_id: &str,
    register_token: &str,
) -> Result<Vec<String>, RegisterError> {
    let mut known = false;
    let mut grants = Vec::new();

    for spec in listeners {
        for entry in &spec.acl {
            if entry.access_id != access_id {
                continue;
            }
            known = true;
            if entry.register_token == register_token {
                grants.push(spec.listener_key().to_string());
                break;
            }
        }
    }

    if grants.is_empty() {
        if known {
            Err(RegisterError::TokenMismatch)
        } else {
            Err(RegisterError::UnknownAccessId)
        }
    } else {
        Ok(grants)
    }
}

/// Accepts agent control connections and keeps the registry current.
pub struct ControlServer {
    listeners: Vec<ListenerSpec>,
    agents: Arc<AgentRegistry>,
}

impl ControlServer {
    pub fn new(listeners: Vec<ListenerSpec>, agents: Arc<AgentRegistry>) -> Self {
        Self { listeners, agents }
    }

    /// Accept loop. Runs until the shutdown signal fires.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(socket, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Control accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Control listener shutting down");
                    break;
                }
            }
        }
    }

    /// Drive one agent connection from handshake to close.
    ///
    /// A protocol violation anywhere kills this connection and nothing
    /// else. Whatever registrations the connection accumulated are
    /// purged when it ends, however it ends.
    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("Control connection from {}", peer_addr);

        let mut framed = Framed::new(socket, ControlCodec::new());

        // The first frame must be a registration.
        let (access_id, register_token) = match framed.next().await {
            Some(Ok(ControlMessage::Register {
                access_id,
                register_token,
            })) => (access_id, register_token),
            Some(Ok(other)) => {
                tracing::warn!(
                    "Control connection from {} sent {} before registering, closing",
                    peer_addr,
                    message_name(&other)
                );
                return;
            }
            Some(Err(e)) => {
                tracing::warn!("Malformed control frame from {}: {}", peer_addr, e);
                return;
            }
            None => {
                tracing::debug!("Control connection from {} closed before registering", peer_addr);
                return;
            }
        };

        let grants = match acl_grants(&self.listeners, &access_id, &register_token) {
            Ok(grants) => grants,
            Err(reason) => {
                tracing::warn!(
                    access_id = %access_id,
                    peer = %peer_addr,
                    "Registration rejected: {}",
                    reason
                );
                return;
            }
        };

        let conn_id = Uuid::new_v4();
        let (sink, mut stream) = framed.split();
        let sink = Arc::new(Mutex::new(sink));

        for listener_key in &grants {
            self.agents.register_or_replace(
                AgentKey::new(listener_key.clone(), access_id.clone()),
                RegisteredAgent::new(access_id.clone(), peer_addr, conn_id, Arc::clone(&sink)),
            );
        }

        tracing::info!(
            access_id = %access_id,
            peer = %peer_addr,
            listeners = grants.len(),
            "Agent registered"
        );

        // Park on the read half until the agent goes away. The agent has
        // nothing left to say, so any inbound frame is a violation.
        loop {
            match stream.next().await {
                None => {
                    tracing::debug!(access_id = %access_id, "Agent control connection closed");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        access_id = %access_id,
                        "Malformed frame on registered control connection: {}, closing",
                        e
                    );
                    break;
                }
                Some(Ok(msg)) => {
                    tracing::warn!(
                        access_id = %access_id,
                        "Unexpected {} frame on registered control connection, closing",
                        message_name(&msg)
                    );
                    break;
                }
            }
        }

        let purged = self.agents.purge_connection(conn_id);
        tracing::info!(
            access_id = %access_id,
            peer = %peer_addr,
            purged,
            "Agent connection ended"
        );
    }
}

fn message_name(msg: &ControlMessage) -> &'static str {
    match msg {
        ControlMessage::Register { .. } => "Register",
        ControlMessage::Bind { .. } => "Bind",
    }
}
