//! The fixed 68-byte BitTorrent handshake exchanged before any framed
//! message traffic.
//!
//! A handshake is the first message exchanged between peers and contains:
//! - Protocol identifier length and literal ("BitTorrent protocol")
//! - Reserved bytes for protocol extensions (all zero here)
//! - Info hash identifying the torrent
//! - Peer ID identifying the client
use super::{PeerError, PeerId, PeerResult, HANDSHAKE_TIMEOUT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes the handshake into its 68-byte wire form:
    /// `19 "BitTorrent protocol" <8 reserved zero bytes> info_hash peer_id`.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&[0u8; 8]);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    fn deserialize(buf: &[u8; HANDSHAKE_LEN]) -> PeerResult<Self> {
        if buf[0] != 19 {
            return Err(PeerError::HandshakeMismatch(format!(
                "protocol length {} (expected 19)",
                buf[0]
            )));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(PeerError::HandshakeMismatch(
                "protocol identifier mismatch".into(),
            ));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Sends our handshake, reads the peer's, and validates the protocol
    /// prefix and info-hash. The peer-id is not validated (any value is
    /// accepted). The entire exchange is bounded by [`HANDSHAKE_TIMEOUT`].
    #[instrument(skip(stream), level = "debug")]
    pub async fn exchange<S>(stream: &mut S, info_hash: [u8; 20], peer_id: PeerId) -> PeerResult<Handshake>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        timeout(HANDSHAKE_TIMEOUT, async {
            let ours = Handshake::new(info_hash, peer_id);
            stream.write_all(&ours.serialize()).await?;

            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await?;
            let theirs = Handshake::deserialize(&buf)?;

            if theirs.info_hash != info_hash {
                return Err(PeerError::HandshakeMismatch(
                    "info hash mismatch".into(),
                ));
            }
            Ok(theirs)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exchange_succeeds_with_matching_info_hash() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let info_hash = [7u8; 20];
        let a_id = [1u8; 20];
        let b_id = [2u8; 20];

        let b_task = tokio::spawn(async move { Handshake::exchange(&mut b, info_hash, b_id).await });
        let a_result = Handshake::exchange(&mut a, info_hash, a_id).await.unwrap();
        let b_result = b_task.await.unwrap().unwrap();

        assert_eq!(a_result.peer_id, b_id);
        assert_eq!(b_result.peer_id, a_id);
    }

    #[tokio::test]
    async fn exchange_rejects_info_hash_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let a_id = [1u8; 20];
        let b_id = [2u8; 20];

        let b_task = tokio::spawn(async move { Handshake::exchange(&mut b, [9u8; 20], b_id).await });
        let a_result = Handshake::exchange(&mut a, [1u8; 20], a_id).await;
        assert!(a_result.is_err());
        let _ = b_task.await;
    }

    #[test]
    fn serialize_round_trips_through_deserialize() {
        let h = Handshake::new([3u8; 20], [4u8; 20]);
        let bytes = h.serialize();
        let parsed = Handshake::deserialize(&bytes).unwrap();
        assert_eq!(parsed, h);
    }

    #[tokio::test]
    async fn exchange_rejects_wrong_protocol_identifier() {
        let info_hash = [6u8; 20];
        let our_id = [1u8; 20];
        let ours = Handshake::new(info_hash, our_id);

        let mut bogus = [0u8; HANDSHAKE_LEN];
        bogus[0] = 19;
        bogus[1..20].copy_from_slice(b"NotBitTorrent proto");
        bogus[28..48].copy_from_slice(&info_hash);
        bogus[48..68].copy_from_slice(&[2u8; 20]);

        let mut mock = tokio_test::io::Builder::new()
            .write(&ours.serialize())
            .read(&bogus)
            .build();

        let result = Handshake::exchange(&mut mock, info_hash, our_id).await;
        assert!(matches!(result, Err(PeerError::HandshakeMismatch(_))));
    }
}
