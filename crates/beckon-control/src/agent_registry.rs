//! Registry of agent control connections keyed by listener and access id.
//!
//! Each registered agent holds the write half of its control connection.
//! Bind frames for new public streams are pushed through that write half,
//! one frame per stream, in the order the notifications are issued.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use uuid::Uuid;

use beckon_proto::{CodecError, ControlCodec, ControlMessage, StreamId};

/// Write half of a framed control connection.
pub type ControlSink = SplitSink<Framed<TcpStream, ControlCodec>, ControlMessage>;

/// Errors from notifying an agent about a new public stream.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No agent available for {access_id:?} on listener {listener_key}")]
    NoAgentAvailable {
        listener_key: String,
        access_id: Option<String>,
    },
    #[error("Bind write failed: {0}")]
    BindWriteFailed(#[from] CodecError),
}

/// Key for one registration: a listener the agent serves, and the
/// access id it serves it under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentKey {
    pub listener_key: String,
    pub access_id: String,
}

impl AgentKey {
    pub fn new(listener_key: impl Into<String>, access_id: impl Into<String>) -> Self {
        Self {
            listener_key: listener_key.into(),
            access_id: access_id.into(),
        }
    }
}

/// A registered agent control connection.
///
/// Cloning is cheap: the sink is shared behind a mutex, so every clone
/// writes to the same underlying socket. The mutex is fair, which keeps
/// bind frames in issue order when several streams arrive at once.
#[derive(Clone)]
pub struct RegisteredAgent {
    /// Access id the agent registered under.
    pub access_id: String,
    /// Remote address of the control connection.
    pub peer_addr: SocketAddr,
    /// Identity of the underlying control connection. All registrations
    /// made over one connection share this id, and a close purges only
    /// registrations that still carry it.
    pub conn_id: Uuid,
    sink: Arc<Mutex<ControlSink>>,
}

impl fmt::Debug for RegisteredAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAgent")
            .field("access_id", &self.access_id)
            .field("peer_addr", &self.peer_addr)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl RegisteredAgent {
    pub fn new(
        access_id: impl Into<String>,
        peer_addr: SocketAddr,
        conn_id: Uuid,
        sink: Arc<Mutex<ControlSink>>,
    ) -> Self {
        Self {
            access_id: access_id.into(),
            peer_addr,
            conn_id,
            sink,
        }
    }

    /// Write a bind frame for `stream_id` to the agent.
    ///
    /// Returns once the frame has been flushed to the socket. Delivery
    /// beyond that is not confirmed; the agent is expected to dial back.
    pub async fn send_bind(&self, stream_id: StreamId) -> Result<(), CodecError> {
        let mut sink = self.sink.lock().await;
        sink.send(ControlMessage::Bind { stream_id }).await
    }
}

/// Notification seam between the public listeners and the agent table.
///
/// Front listeners only need this one operation, so they hold the
/// registry as `Arc<dyn Notifier>` and tests substitute a mock.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask an agent serving `listener_key` to dial back for `stream_id`.
    ///
    /// With `access_id` set, the agent registered under that id is used;
    /// without it, any agent registered for the listener is picked.
    async fn notify_downstream(
        &self,
        listener_key: &str,
        access_id: Option<&str>,
        stream_id: StreamId,
    ) -> Result<(), NotifyError>;
}

/// Table of live agent registrations.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentKey, RegisteredAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register an agent, replacing any previous registration under the
    /// same key. The newest registration wins; the replaced handle is
    /// returned and its connection is left open.
    pub fn register_or_replace(
        &self,
        key: AgentKey,
        agent: RegisteredAgent,
    ) -> Option<RegisteredAgent> {
        let mut agents = self.agents.write().unwrap();
        let replaced = agents.insert(key.clone(), agent);

        if replaced.is_some() {
            tracing::info!(
                listener = %key.listener_key,
                access_id = %key.access_id,
                "Re-registered agent (replaced previous registration)"
            );
        } else {
            tracing::info!(
                listener = %key.listener_key,
                access_id = %key.access_id,
                "Registered new agent"
            );
        }

        replaced
    }

    /// Look up the agent registered for an exact (listener, access id) pair.
    pub fn lookup(&self, listener_key: &str, access_id: &str) -> Option<RegisteredAgent> {
        let agents = self.agents.read().unwrap();
        agents
            .get(&AgentKey::new(listener_key, access_id))
            .cloned()
    }

    /// Pick some agent registered for `listener_key`, regardless of
    /// access id. Which one is unspecified when several are registered;
    /// it falls out of hash map iteration order.
    pub fn pick_any(&self, listener_key: &str) -> Option<RegisteredAgent> {
        let agents = self.agents.read().unwrap();
        agents
            .iter()
            .find(|(key, _)| key.listener_key == listener_key)
            .map(|(_, agent)| agent.clone())
    }

    /// Drop every registration still carried by the connection `conn_id`.
    ///
    /// Registrations that were already replaced by a newer connection
    /// carry a different id and stay untouched. Returns how many
    /// registrations were removed.
    pub fn purge_connection(&self, conn_id: Uuid) -> usize {
        let mut agents = self.agents.write().unwrap();
        let before = agents.len();
        agents.retain(|_, agent| agent.conn_id != conn_id);
        let purged = before - agents.len();

        if purged > 0 {
            tracing::info!(
                conn_id = %conn_id,
                purged,
                "Purged registrations for closed control connection"
            );
        }

        purged
    }

    /// Number of live registrations.
    pub fn count(&self) -> usize {
        self.agents.read().unwrap().len()
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.agents.write().unwrap().clear();
    }

    async fn notify(
        &self,
        listener_key: &str,
        access_id: Option<&str>,
        stream_id: StreamId,
    ) -> Result<(), NotifyError> {
        let agent = match access_id {
            Some(access_id) => self.lookup(listener_key, access_id),
            None => self.pick_any(listener_key),
        };

        let Some(agent) = agent else {
            tracing::warn!(
                listener = %listener_key,
                access_id = ?access_id,
                "No agent available for incoming stream"
            );
            return Err(NotifyError::NoAgentAvailable {
                listener_key: listener_key.to_string(),
                access_id: access_id.map(|s| s.to_string()),
            });
        };

        match agent.send_bind(stream_id).await {
            Ok(()) => {
                tracing::debug!(
                    stream_id = %stream_id,
                    access_id = %agent.access_id,
                    agent = %agent.peer_addr,
                    "Sent bind frame to agent"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    access_id = %agent.access_id,
                    agent = %agent.peer_addr,
                    "Bind write failed, purging agent connection: {}",
                    e
                );
                self.purge_connection(agent.conn_id);
                Err(NotifyError::BindWriteFailed(e))
            }
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for AgentRegistry {
    async fn notify_downstream(
        &self,
        listener_key: &str,
        access_id: Option<&str>,
        stream_id: StreamId,
    ) -> Result<(), NotifyError> {
        self.notify(listener_key, access_id, stream_id).await
    }
}
