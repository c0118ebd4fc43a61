//! Back channel listener: agents dial here to complete a circuit.
//!
//! An agent that received a bind frame connects and sends the 32
//! character hex stream id, then nothing but raw application bytes.
//! Anything that fails before the splice starts closes the connection
//! with no response on the wire; a forged or stale id looks exactly
//! like a broken connection to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use beckon_proto::{StreamId, StreamIdError, STREAM_ID_ENCODED_LEN};
use beckon_registry::{StreamError, StreamRegistry};

use crate::conduit::{splice, ConduitError};

/// Why a back connection was dropped.
#[derive(Debug, Error)]
pub enum BackError {
    #[error("Stream id read failed: {0}")]
    IdRead(std::io::Error),
    #[error(transparent)]
    BadId(#[from] StreamIdError),
    #[error(transparent)]
    Unknown(#[from] StreamError),
    #[error("Prebuffer replay failed: {0}")]
    Replay(std::io::Error),
    #[error(transparent)]
    Splice(#[from] ConduitError),
}

/// Accepts agent dial-backs and splices them onto parked client
/// connections.
pub struct BackServer {
    streams: Arc<StreamRegistry>,
}

impl BackServer {
    pub fn new(streams: Arc<StreamRegistry>) -> Self {
        Self { streams }
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
                                if let Err(e) = server.handle_connection(socket, peer_addr).await {
                                    tracing::debug!("Back connection from {} dropped: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Back accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Back listener shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        mut agent: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), BackError> {
        // The id token comes first, fixed width, before any data bytes.
        let mut token = [0u8; STREAM_ID_ENCODED_LEN];
        agent
            .read_exact(&mut token)
            .await
            .map_err(BackError::IdRead)?;

        let stream_id = StreamId::decode(&token)?;
        let pending = self.streams.resolve(&stream_id)?;

        tracing::debug!(
            stream_id = %stream_id,
            agent = %peer_addr,
            "Matched back connection to pending stream"
        );

        // Replay bytes consumed while routing, so the agent sees the
        // client's byte stream from its first byte.
        if !pending.prebuffered.is_empty() {
            agent
                .write_all(&pending.prebuffered)
                .await
                .map_err(BackError::Replay)?;
        }

        let copied = splice(pending.client, agent).await?;
        tracing::debug!(
            stream_id = %stream_id,
            "Relay finished, {} bytes in first-closed direction",
            copied
        );
        Ok(())
    }
}
