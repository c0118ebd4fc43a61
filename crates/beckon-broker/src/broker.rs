//! Broker lifecycle: build the shared registries, bring every listener
//! up, and tear the whole thing down on request.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use beckon_control::{AgentRegistry, ControlServer, Notifier};
use beckon_registry::StreamRegistry;
use beckon_server::{BackServer, FrontServer};

use crate::config::BrokerConfig;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to bind {role} listener on {address}: {source}")]
    Bind {
        role: &'static str,
        address: String,
        source: std::io::Error,
    },
}

/// All broker state: configuration plus the two shared tables. Routing
/// state only ever changes through the registry APIs, and it all dies
/// with this value's handle.
pub struct Broker {
    config: BrokerConfig,
    streams: Arc<StreamRegistry>,
    agents: Arc<AgentRegistry>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            streams: Arc::new(StreamRegistry::new()),
            agents: Arc::new(AgentRegistry::new()),
        }
    }

    /// Bind every listener, then spawn the accept loops.
    ///
    /// Binding happens up front so a bad address aborts startup before
    /// anything is serving. Ephemeral ports (`:0`) work; the handle
    /// reports the addresses actually bound.
    pub async fn start(self) -> Result<BrokerHandle, BrokerError> {
        let (notify_listener, notify_addr) = bind("notify", &self.config.notify_address).await?;
        let (back_listener, back_addr) = bind("back", &self.config.back_address).await?;

        let mut fronts = Vec::with_capacity(self.config.listeners.len());
        for spec in &self.config.listeners {
            let (listener, addr) = bind("front", &spec.listen_address).await?;
            fronts.push((spec.clone(), listener, addr));
        }

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        let control = Arc::new(ControlServer::new(
            self.config.listeners.clone(),
            Arc::clone(&self.agents),
        ));
        tasks.push(tokio::spawn(
            control.run(notify_listener, shutdown.subscribe()),
        ));
        tracing::info!("Notify listener on {}", notify_addr);

        let back = Arc::new(BackServer::new(Arc::clone(&self.streams)));
        tasks.push(tokio::spawn(back.run(back_listener, shutdown.subscribe())));
        tracing::info!("Back listener on {}", back_addr);

        let mut front_addrs = Vec::with_capacity(fronts.len());
        for (spec, listener, addr) in fronts {
            tracing::info!(
                "Front listener on {} ({:?}, {} ACL entries)",
                addr,
                spec.protocol,
                spec.acl.len()
            );
            let front = Arc::new(FrontServer::new(
                spec,
                Arc::clone(&self.streams),
                Arc::clone(&self.agents) as Arc<dyn Notifier>,
            ));
            tasks.push(tokio::spawn(front.run(listener, shutdown.subscribe())));
            front_addrs.push(addr);
        }

        Ok(BrokerHandle {
            notify_addr,
            back_addr,
            front_addrs,
            shutdown,
            tasks,
            streams: self.streams,
            agents: self.agents,
        })
    }
}

async fn bind(role: &'static str, address: &str) -> Result<(TcpListener, SocketAddr), BrokerError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| BrokerError::Bind {
            role,
            address: address.to_string(),
            source,
        })?;
    let addr = listener.local_addr().map_err(|source| BrokerError::Bind {
        role,
        address: address.to_string(),
        source,
    })?;
    Ok((listener, addr))
}

/// A running broker. Dropping the handle leaves the accept loops
/// running; call [`BrokerHandle::shutdown`] to stop them.
#[derive(Debug)]
pub struct BrokerHandle {
    notify_addr: SocketAddr,
    back_addr: SocketAddr,
    front_addrs: Vec<SocketAddr>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    streams: Arc<StreamRegistry>,
    agents: Arc<AgentRegistry>,
}

impl BrokerHandle {
    /// Address agents register on.
    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    /// Address agents dial back to.
    pub fn back_addr(&self) -> SocketAddr {
        self.back_addr
    }

    /// Bound front addresses, in config order.
    pub fn front_addrs(&self) -> &[SocketAddr] {
        &self.front_addrs
    }

    /// Live agent registrations.
    pub fn agent_count(&self) -> usize {
        self.agents.count()
    }

    /// Streams parked and waiting for a dial-back.
    pub fn pending_streams(&self) -> usize {
        self.streams.len()
    }

    /// Stop accepting, abort the accept loops and drop all routing
    /// state. In-flight relays are abandoned.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in &self.tasks {
            task.abort();
        }
        self.streams.clear();
        self.agents.clear();
        tracing::info!("Broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beckon_proto::{ListenerProtocol, ListenerSpec};

    fn loopback_config() -> BrokerConfig {
        BrokerConfig {
            notify_address: "127.0.0.1:0".to_string(),
            back_address: "127.0.0.1:0".to_string(),
            listeners: vec![ListenerSpec {
                listen_address: "127.0.0.1:0".to_string(),
                protocol: ListenerProtocol::Tcp,
                acl: Vec::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_start_reports_bound_addresses() {
        let handle = Broker::new(loopback_config()).start().await.unwrap();

        assert_ne!(handle.notify_addr().port(), 0);
        assert_ne!(handle.back_addr().port(), 0);
        assert_eq!(handle.front_addrs().len(), 1);
        assert_ne!(handle.front_addrs()[0].port(), 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_bind_failure_aborts_startup() {
        let first = Broker::new(loopback_config()).start().await.unwrap();

        // Reusing an already-bound port fails.
        let mut config = loopback_config();
        config.notify_address = first.notify_addr().to_string();
        let err = Broker::new(config).start().await.unwrap_err();

        match err {
            BrokerError::Bind { role, .. } => assert_eq!(role, "notify"),
        }

        first.shutdown();
    }

    #[tokio::test]
    async fn test_client_without_agent_is_dropped() {
        let handle = Broker::new(loopback_config()).start().await.unwrap();
        let front = handle.front_addrs()[0];

        let mut client = tokio::net::TcpStream::connect(front).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should be dropped promptly")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(handle.pending_streams(), 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let handle = Broker::new(loopback_config()).start().await.unwrap();
        let front = handle.front_addrs()[0];

        handle.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(tokio::net::TcpStream::connect(front).await.is_err());
    }
}
