//! Pending-stream registry
//!
//! Correlates an ephemeral stream id to a front connection that is waiting
//! for its matching back connection. An entry lives from the moment the
//! front listener accepts the connection until a back connection resolves it
//! or it is evicted.

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use beckon_proto::StreamId;

/// Cap on bytes buffered for a parked client. Past this the broker stops
/// draining and the kernel buffer backpressures the client.
pub const PREBUFFER_LIMIT: usize = 64 * 1024;

/// A front connection parked until its back connection arrives
#[derive(Debug)]
pub struct PendingStream {
    /// The accepted client socket
    pub client: TcpStream,
    /// Bytes already consumed from the client (routing peek plus anything
    /// drained while parked); the back connection must see these first
    pub prebuffered: BytesMut,
}

/// Result of probing a parked client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPoll {
    /// Still connected and waiting
    Alive,
    /// The client closed or errored; the entry should be evicted
    Closed,
    /// No entry under this id (already resolved or evicted)
    Gone,
}

/// Stream registry errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Unknown stream: {0}")]
    UnknownStream(StreamId),
}

/// In-memory table of pending streams
///
/// Backed by a concurrent map; `resolve` is an atomic remove-and-return, so
/// an id is consumed at most once no matter how many back connections
/// present it.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: Arc<DashMap<StreamId, PendingStream>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
        }
    }

    /// Park a front connection and return its fresh stream id
    ///
    /// Ids are 128-bit random tokens; on the off chance of a collision with
    /// a currently-pending id, a new one is generated.
    pub fn create(&self, client: TcpStream, prebuffered: Option<Bytes>) -> StreamId {
        let pending = PendingStream {
            client,
            prebuffered: prebuffered
                .map(|bytes| BytesMut::from(&bytes[..]))
                .unwrap_or_default(),
        };

        loop {
            let id = StreamId::generate();
            match self.streams.entry(id) {
                Entry::Occupied(_) => {
                    // Collision with a pending id, regenerate
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(pending);
                    debug!("Stream {} created ({} pending)", id, self.streams.len());
                    return id;
                }
            }
        }
    }

    /// Atomically remove and return the pending stream for an id
    pub fn resolve(&self, id: &StreamId) -> Result<PendingStream, StreamError> {
        match self.streams.remove(id) {
            Some((_, pending)) => {
                debug!("Stream {} resolved", id);
                Ok(pending)
            }
            None => Err(StreamError::UnknownStream(*id)),
        }
    }

    /// Drop a pending entry, closing its parked client socket
    ///
    /// Any later `resolve` for this id fails. Returns false if the id was
    /// already resolved or evicted.
    pub fn evict(&self, id: &StreamId) -> bool {
        match self.streams.remove(id) {
            Some(_) => {
                debug!("Stream {} evicted", id);
                true
            }
            None => false,
        }
    }

    /// Probe a parked client connection without blocking
    ///
    /// Bytes the client sent while parked are drained into the prebuffer so
    /// the back connection still observes the exact original byte stream.
    /// Once the prebuffer is full the probe stops reading and reports the
    /// client alive.
    pub fn poll_client(&self, id: &StreamId) -> ClientPoll {
        let mut entry = match self.streams.get_mut(id) {
            Some(entry) => entry,
            None => return ClientPoll::Gone,
        };

        if entry.prebuffered.len() >= PREBUFFER_LIMIT {
            return ClientPoll::Alive;
        }

        let mut chunk = [0u8; 4096];
        loop {
            match entry.client.try_read(&mut chunk) {
                Ok(0) => return ClientPoll::Closed,
                Ok(n) => {
                    trace!("Stream {} drained {} parked bytes", id, n);
                    entry.prebuffered.extend_from_slice(&chunk[..n]);
                    if entry.prebuffered.len() >= PREBUFFER_LIMIT {
                        return ClientPoll::Alive;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ClientPoll::Alive,
                Err(_) => return ClientPoll::Closed,
            }
        }
    }

    /// Number of currently-pending streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop every pending entry (broker shutdown)
    pub fn clear(&self) {
        let dropped = self.streams.len();
        self.streams.clear();
        if dropped > 0 {
            debug!("Cleared {} pending streams", dropped);
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
