//! Per-peer connection state, owned exclusively by the worker task that
//! created it for the lifetime of the session.
use super::{
    message::{self, Message, MessageId},
    Bitfield, Handshake, PeerError, PeerId, PeerResult, BITFIELD_TIMEOUT, CONNECT_TIMEOUT,
};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

/// A live connection to one peer: the handshake has completed and the
/// initial bitfield has been read. `S` is generic so sessions can be driven
/// over an in-memory `tokio::io::DuplexStream` in tests without touching a
/// real socket.
pub struct PeerSession<S> {
    stream: S,
    pub am_choked: bool,
    pub peer_bitfield: Bitfield,
    pub peer_id: PeerId,
    pub info_hash: [u8; 20],
}

impl PeerSession<TcpStream> {
    /// Opens a TCP connection to `addr` (3 s connect timeout), performs the
    /// handshake, and reads the peer's initial bitfield (5 s timeout).
    #[instrument(skip(our_peer_id), fields(%addr), level = "info")]
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: PeerId,
    ) -> PeerResult<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Self::from_stream(stream, info_hash, our_peer_id).await
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drives the handshake and initial-bitfield exchange over an
    /// already-established stream.
    #[instrument(skip(stream, our_peer_id), level = "debug")]
    pub async fn from_stream(mut stream: S, info_hash: [u8; 20], our_peer_id: PeerId) -> PeerResult<Self> {
        let theirs = Handshake::exchange(&mut stream, info_hash, our_peer_id).await?;

        let first = timeout(BITFIELD_TIMEOUT, message::read_frame(&mut stream))
            .await
            .map_err(|_| PeerError::Timeout)??;
        let first = first.ok_or_else(|| {
            PeerError::UnexpectedMessage("expected Bitfield, got keep-alive".into())
        })?;
        match first.id() {
            Ok(MessageId::Bitfield) => {}
            _ => {
                return Err(PeerError::UnexpectedMessage(format!(
                    "expected Bitfield (id 5) as first message, got id {}",
                    first.id
                )))
            }
        }

        Ok(Self {
            stream,
            am_choked: true,
            peer_bitfield: Bitfield::from_payload(first.payload),
            peer_id: theirs.peer_id,
            info_hash,
        })
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.peer_bitfield.has_piece(index as usize)
    }

    pub async fn send_interested(&mut self) -> PeerResult<()> {
        message::write_frame(&mut self.stream, Some(&Message::interested())).await
    }

    pub async fn send_unchoke(&mut self) -> PeerResult<()> {
        message::write_frame(&mut self.stream, Some(&Message::unchoke())).await
    }

    pub async fn send_not_interested(&mut self) -> PeerResult<()> {
        message::write_frame(&mut self.stream, Some(&Message::not_interested())).await
    }

    pub async fn send_have(&mut self, index: u32) -> PeerResult<()> {
        message::write_frame(&mut self.stream, Some(&Message::have(index))).await
    }

    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> PeerResult<()> {
        message::write_frame(&mut self.stream, Some(&Message::request(index, begin, length))).await
    }

    /// Reads the next framed message, or `None` for a keep-alive.
    pub async fn read_message(&mut self) -> PeerResult<Option<Message>> {
        message::read_frame(&mut self.stream).await
    }

    /// Applies the state transitions of §4.5 for any message that is not a
    /// `Piece` (pieces are handled by the caller, which owns the in-progress
    /// piece buffer). Returns `true` if the message was recognized.
    pub fn apply_state_update(&mut self, msg: &Message) -> PeerResult<bool> {
        match msg.id() {
            Ok(MessageId::Choke) => {
                self.am_choked = true;
                Ok(true)
            }
            Ok(MessageId::Unchoke) => {
                self.am_choked = false;
                Ok(true)
            }
            Ok(MessageId::Have) => {
                let index = message::parse_have(msg)?;
                self.peer_bitfield.set_piece(index as usize);
                Ok(true)
            }
            Ok(MessageId::Bitfield) => {
                self.peer_bitfield = Bitfield::from_payload(msg.payload.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
