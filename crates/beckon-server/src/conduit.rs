//! Bidirectional byte relay between a matched pair of connections.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const COPY_BUF_SIZE: usize = 8192;

/// An active relay failed on one of its legs.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("Relay {direction} failed: {source}")]
    Io {
        direction: &'static str,
        source: std::io::Error,
    },
}

/// Shuttle bytes between `client` and `agent` until either side ends.
///
/// Both directions run as concurrently-polled copy loops. The first
/// direction to terminate, by EOF or by error, ends the relay; both
/// sockets are closed on return. Half-close is not carried through:
/// one side finishing takes the whole relay down.
///
/// Returns the byte count of the direction that terminated first.
pub async fn splice(client: TcpStream, agent: TcpStream) -> Result<u64, ConduitError> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut agent_read, mut agent_write) = agent.into_split();

    let client_to_agent = async move {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut copied = 0u64;
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("Client closed connection");
                    let _ = agent_write.shutdown().await;
                    return Ok(copied);
                }
                Ok(n) => {
                    agent_write.write_all(&buf[..n]).await?;
                    copied += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
    };

    let agent_to_client = async move {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut copied = 0u64;
        loop {
            match agent_read.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("Agent closed connection");
                    let _ = client_write.shutdown().await;
                    return Ok(copied);
                }
                Ok(n) => {
                    client_write.write_all(&buf[..n]).await?;
                    copied += n as u64;
                }
                Err(e) => return Err(e),
            }
        }
    };

    // Whichever direction finishes first wins; the loser is dropped,
    // which closes the remaining halves.
    let (direction, result) = tokio::select! {
        r = client_to_agent => ("client to agent", r),
        r = agent_to_client => ("agent to client", r),
    };

    result.map_err(|source| ConduitError::Io { direction, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_splice_forwards_both_directions() {
        let (mut client, client_leg) = socket_pair().await;
        let (mut agent, agent_leg) = socket_pair().await;

        let relay = tokio::spawn(splice(client_leg, agent_leg));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        agent.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        let copied = timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(copied, 4);
    }

    #[tokio::test]
    async fn test_one_side_closing_closes_the_other() {
        let (client, client_leg) = socket_pair().await;
        let (mut agent, agent_leg) = socket_pair().await;

        let relay = tokio::spawn(splice(client_leg, agent_leg));

        // Client goes away without sending anything.
        drop(client);

        timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The agent side observes EOF once the relay tears down.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), agent.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_splice_reports_first_closed_direction_count() {
        let (mut client, client_leg) = socket_pair().await;
        let (mut agent, agent_leg) = socket_pair().await;

        let relay = tokio::spawn(splice(client_leg, agent_leg));

        client.write_all(b"0123456789").await.unwrap();
        let mut buf = [0u8; 10];
        agent.read_exact(&mut buf).await.unwrap();

        drop(client);
        let copied = timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(copied, 10);
    }

    #[tokio::test]
    async fn test_splice_moves_large_payload_intact() {
        let (mut client, client_leg) = socket_pair().await;
        let (mut agent, agent_leg) = socket_pair().await;

        let _relay = tokio::spawn(splice(client_leg, agent_leg));

        // Larger than one copy buffer, so the loop runs several times.
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let to_send = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&to_send).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::with_capacity(payload.len());
        timeout(Duration::from_secs(5), agent.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(received, payload);
        writer.await.unwrap();
    }
}
