//! Link handshake.
//!
//! Immediately after the connection is established each side writes
//! `magic(u32) ‖ node_id<0..2^8-1>` and reads the peer's. The node id read
//! here is the neighbor identity the rest of the stack trusts; a TLS layer
//! in front of this would take the identity from the peer certificate
//! instead.

use crate::error::SessionError;
use bytes::BytesMut;
use reload_wire::{FieldWidth, NodeId};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// First four bytes of a link handshake ("RELD")
pub const HANDSHAKE_MAGIC: u32 = 0x5245_4C44;

/// Default time allowed for the handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Send our identity
pub async fn send_hello<W: AsyncWrite + Unpin>(
    writer: &mut W,
    local: &NodeId,
) -> Result<(), SessionError> {
    let mut buf = BytesMut::with_capacity(5 + local.len());
    buf.extend_from_slice(&HANDSHAKE_MAGIC.to_be_bytes());
    reload_wire::codec::write_opaque(&mut buf, FieldWidth::U8, local.as_bytes())?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    debug!(node_id = %local, "sent link hello");
    Ok(())
}

/// Read the peer's identity
pub async fn recv_hello<R: AsyncRead + Unpin>(reader: &mut R) -> Result<NodeId, SessionError> {
    let magic = reader.read_u32().await?;
    if magic != HANDSHAKE_MAGIC {
        return Err(SessionError::Handshake(format!("bad magic {:#010x}", magic)));
    }
    let len = reader.read_u8().await? as usize;
    if len == 0 {
        return Err(SessionError::Handshake("empty node id".to_string()));
    }
    let mut id = vec![0u8; len];
    reader.read_exact(&mut id).await?;
    Ok(NodeId::new(id))
}

/// Exchange identities over `stream`; returns the neighbor's node id
pub async fn perform_handshake<S>(
    stream: &mut S,
    local: &NodeId,
    timeout: Duration,
) -> Result<NodeId, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        send_hello(stream, local).await?;
        recv_hello(stream).await
    };
    let neighbor = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| SessionError::HandshakeTimeout)??;

    if &neighbor == local {
        return Err(SessionError::SelfConnection);
    }
    debug!(neighbor = %neighbor, "link handshake complete");
    Ok(neighbor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_exchanges_ids() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id_a = NodeId::new(vec![0xA; 16]);
        let id_b = NodeId::new(vec![0xB; 16]);

        let (ra, rb) = tokio::join!(
            perform_handshake(&mut a, &id_a, DEFAULT_HANDSHAKE_TIMEOUT),
            perform_handshake(&mut b, &id_b, DEFAULT_HANDSHAKE_TIMEOUT),
        );
        assert_eq!(ra.unwrap(), id_b);
        assert_eq!(rb.unwrap(), id_a);
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);
        b.write_all(&[0, 0, 0, 0, 1, 7]).await.unwrap();
        let err = recv_hello(&mut a).await.unwrap_err();
        assert!(matches!(err, SessionError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);
        b.write_all(&HANDSHAKE_MAGIC.to_be_bytes()).await.unwrap();
        b.write_all(&[0]).await.unwrap();
        assert!(matches!(
            recv_hello(&mut a).await,
            Err(SessionError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id = NodeId::new(vec![1; 16]);
        let (ra, _) = tokio::join!(
            perform_handshake(&mut a, &id, DEFAULT_HANDSHAKE_TIMEOUT),
            perform_handshake(&mut b, &id, DEFAULT_HANDSHAKE_TIMEOUT),
        );
        assert!(matches!(ra, Err(SessionError::SelfConnection)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (mut a, _b) = tokio::io::duplex(256);
        let id = NodeId::new(vec![1; 16]);
        assert!(matches!(
            perform_handshake(&mut a, &id, Duration::from_millis(100)).await,
            Err(SessionError::HandshakeTimeout)
        ));
    }
}
