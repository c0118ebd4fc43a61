//! Public-facing listeners.
//!
//! One `FrontServer` runs per configured listener. It accepts client
//! connections, works out the routing key when the listener speaks
//! HTTP, parks the connection in the stream registry and asks an agent
//! to dial back for it. The client is never answered directly: either
//! an agent completes the circuit, or the connection is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use beckon_control::Notifier;
use beckon_proto::{ListenerProtocol, ListenerSpec};
use beckon_registry::{ClientPoll, StreamRegistry};

/// Upper bound on how much of an HTTP request the broker will read
/// while looking for the end of the head.
const HTTP_HEAD_LIMIT: usize = 8 * 1024;

/// How often a parked client connection is probed for liveness.
const CLIENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Why an accepted front connection could not be routed.
#[derive(Debug, Error)]
pub enum FrontError {
    #[error("Request head too large: {0} bytes")]
    HeadTooLarge(usize),
    #[error("Connection closed before the request head completed")]
    EarlyEof,
    #[error("No Host header in request head")]
    MissingHost,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Accept loop for one configured public listener.
pub struct FrontServer {
    spec: ListenerSpec,
    streams: Arc<StreamRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl FrontServer {
    pub fn new(
        spec: ListenerSpec,
        streams: Arc<StreamRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            spec,
            streams,
            notifier,
        }
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
                            tracing::warn!(listener = %self.spec.listen_address, "Front accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!(listener = %self.spec.listen_address, "Front listener shutting down");
                    break;
                }
            }
        }
    }

    /// Take one client connection from accept to parked (or dropped).
    async fn handle_connection(&self, mut client: TcpStream, peer_addr: SocketAddr) {
        let listener_key = self.spec.listener_key().to_string();

        let (access_id, prebuffered) = match self.spec.protocol {
            ListenerProtocol::Tcp => (None, None),
            ListenerProtocol::Http => match route_http(&mut client).await {
                Ok((host, consumed)) => (Some(host), Some(consumed.freeze())),
                Err(e) => {
                    tracing::debug!(
                        listener = %listener_key,
                        client = %peer_addr,
                        "Unroutable connection: {}",
                        e
                    );
                    return;
                }
            },
        };

        let stream_id = self.streams.create(client, prebuffered);
        tracing::debug!(
            stream_id = %stream_id,
            listener = %listener_key,
            client = %peer_addr,
            access_id = ?access_id,
            "Parked incoming connection"
        );

        if let Err(e) = self
            .notifier
            .notify_downstream(&listener_key, access_id.as_deref(), stream_id)
            .await
        {
            tracing::warn!(
                stream_id = %stream_id,
                listener = %listener_key,
                "Dropping client, no agent reachable: {}",
                e
            );
            self.streams.evict(&stream_id);
            return;
        }

        // Watch the parked connection until an agent claims it or the
        // client gives up. Eviction here is what stops a later dial-back
        // from splicing onto a dead socket.
        let mut poll = tokio::time::interval(CLIENT_POLL_INTERVAL);
        loop {
            poll.tick().await;
            match self.streams.poll_client(&stream_id) {
                ClientPoll::Alive => continue,
                ClientPoll::Closed => {
                    tracing::debug!(
                        stream_id = %stream_id,
                        client = %peer_addr,
                        "Client disconnected while parked, evicting"
                    );
                    self.streams.evict(&stream_id);
                    break;
                }
                ClientPoll::Gone => break,
            }
        }
    }
}

/// Read the request head and pull the routing key out of it. The bytes
/// consumed are returned as well; they belong to the backend, not to
/// the broker.
async fn route_http(client: &mut TcpStream) -> Result<(String, BytesMut), FrontError> {
    let (buf, head_end) = read_request_head(client).await?;
    let host = extract_host(&buf[..head_end]).ok_or(FrontError::MissingHost)?;
    Ok((host, buf))
}

/// Read from `client` until the end of the request head (`\r\n\r\n`) is
/// in the buffer, up to `HTTP_HEAD_LIMIT` bytes. Returns the buffer and
/// the offset one past the head terminator.
async fn read_request_head(client: &mut TcpStream) -> Result<(BytesMut, usize), FrontError> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() >= HTTP_HEAD_LIMIT {
            return Err(FrontError::HeadTooLarge(buf.len()));
        }
        let n = client.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(FrontError::EarlyEof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Extract the Host header value from a request head: first Host line
/// wins, the port is stripped, and the result is ASCII-lowercased so it
/// compares cleanly against configured access ids.
fn extract_host(head: &[u8]) -> Option<String> {
    for raw in head.split(|&b| b == b'\n').skip(1) {
        let Ok(line) = std::str::from_utf8(raw) else {
            continue;
        };
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let mut host = value.trim().to_string();
        if let Some(idx) = host.rfind(':') {
            if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) {
                host.truncate(idx);
            }
        }
        if host.is_empty() {
            return None;
        }
        return Some(host.to_ascii_lowercase());
    }
    None
}
