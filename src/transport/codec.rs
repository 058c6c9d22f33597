//! Wire framing: 4-byte big-endian length prefix followed by a serialised
//! `Message` (spec.md §4.3/§6). The handshake's first frame-less write is a
//! bare 4-byte big-endian `raft_id`, handled by `peer.rs` before this
//! codec's framed loop begins.
//!
//! Grounded on the teacher's `NodeConnection::send_raw`/read loop in
//! `network/cluster_network.rs` (length-prefix then payload, `AsyncWriteExt`/
//! `AsyncReadExt`), generalized from the teacher's bincode `ClusterMessage`
//! payload to this crate's `serde_json`-encoded Raft `Message` (matching the
//! rest of this crate's persisted/observer encodings).

use crate::error::{RaftError, Result};
use crate::raft::types::{Message, RaftNodeId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Messages above this size are rejected rather than allocated for, mirroring
/// the teacher's `MAX_REQUEST_SIZE` guard against unbounded allocation from
/// an adversarial or corrupt length prefix.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Generic over `AsyncWrite` (rather than pinned to `TcpStream`) so the
/// connection table can split a socket into owned read/write halves
/// (`peer.rs`'s per-connection write mutex guards only the write half) while
/// the handshake still runs over the whole, unsplit stream before the split.
pub async fn write_handshake<W: AsyncWrite + Unpin>(stream: &mut W, local_id: RaftNodeId) -> Result<()> {
    let id = local_id as u32;
    stream.write_all(&id.to_be_bytes()).await?;
    Ok(())
}

pub async fn read_handshake<R: AsyncRead + Unpin>(stream: &mut R) -> Result<RaftNodeId> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf) as RaftNodeId)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> Result<()> {
    let payload = serde_json::to_vec(msg)?;
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RaftError::Transport(format!(
            "frame of {} bytes exceeds max {}",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    let msg: Message = serde_json::from_slice(&payload)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::types::{MessageBody, VoteRequest};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frame_round_trips_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let id = read_handshake(&mut sock).await.unwrap();
            assert_eq!(id, 7);
            read_frame(&mut sock).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_handshake(&mut client, 7).await.unwrap();
        let msg = Message {
            from: 7,
            to: 1,
            body: MessageBody::VoteRequest(VoteRequest {
                term: 1,
                candidate_id: 7,
                last_log_index: 0,
                last_log_term: 0,
                pre_vote: false,
            }),
        };
        write_frame(&mut client, &msg).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.from, 7);
        assert!(matches!(received.body, MessageBody::VoteRequest(_)));
    }
}
