//! Length-prefixed message framing for the post-handshake wire protocol.
//!
//! Every frame is `<u32 length><payload>`. A `length` of zero is a
//! keep-alive with no id and no body; otherwise the first payload byte is
//! the message id and the rest is the message-specific payload.
use super::{PeerError, PeerResult};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_PAYLOAD_LEN: u32 = 1 << 20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> PeerResult<Self> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            other => {
                return Err(PeerError::MalformedPayload(format!(
                    "unknown message id {other}"
                )))
            }
        })
    }
}

/// A framed wire message, or `None` for a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Message {
    fn with_id(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id: id as u8, payload }
    }

    pub fn choke() -> Self {
        Self::with_id(MessageId::Choke, Vec::new())
    }

    pub fn unchoke() -> Self {
        Self::with_id(MessageId::Unchoke, Vec::new())
    }

    pub fn interested() -> Self {
        Self::with_id(MessageId::Interested, Vec::new())
    }

    pub fn not_interested() -> Self {
        Self::with_id(MessageId::NotInterested, Vec::new())
    }

    pub fn have(index: u32) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.write_u32::<BigEndian>(index).expect("write to Vec never fails");
        Self::with_id(MessageId::Have, payload)
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.write_u32::<BigEndian>(index).unwrap();
        payload.write_u32::<BigEndian>(begin).unwrap();
        payload.write_u32::<BigEndian>(length).unwrap();
        Self::with_id(MessageId::Request, payload)
    }

    pub fn bitfield(payload: Vec<u8>) -> Self {
        Self::with_id(MessageId::Bitfield, payload)
    }

    pub fn piece(index: u32, begin: u32, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.write_u32::<BigEndian>(index).unwrap();
        payload.write_u32::<BigEndian>(begin).unwrap();
        payload.extend_from_slice(data);
        Self::with_id(MessageId::Piece, payload)
    }

    pub fn id(&self) -> PeerResult<MessageId> {
        MessageId::try_from(self.id)
    }
}

/// Writes a single frame (or a keep-alive when `message` is `None`).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: Option<&Message>,
) -> PeerResult<()> {
    match message {
        None => {
            writer.write_u32(0).await?;
        }
        Some(msg) => {
            let len = 1 + msg.payload.len() as u32;
            writer.write_u32(len).await?;
            writer.write_u8(msg.id).await?;
            writer.write_all(&msg.payload).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Reads a single frame, returning `None` for a keep-alive.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> PeerResult<Option<Message>> {
    let len = reader.read_u32().await?;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(PeerError::MalformedPayload(format!(
            "frame of length {len} exceeds maximum of {MAX_PAYLOAD_LEN}"
        )));
    }
    let id = reader.read_u8().await?;
    let mut payload = vec![0u8; (len - 1) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Message { id, payload }))
}

/// Validates and applies a `Piece` message to an in-progress piece buffer,
/// returning the number of bytes copied.
pub fn apply_piece(msg: &Message, expected_index: u32, buf: &mut [u8]) -> PeerResult<usize> {
    if msg.id != MessageId::Piece as u8 {
        return Err(PeerError::UnexpectedMessage(format!(
            "expected Piece (id 7), got id {}",
            msg.id
        )));
    }
    if msg.payload.len() < 8 {
        return Err(PeerError::MalformedPayload(
            "Piece payload shorter than 8 bytes".into(),
        ));
    }
    let index = BigEndian::read_u32(&msg.payload[0..4]);
    let begin = BigEndian::read_u32(&msg.payload[4..8]) as usize;
    let data = &msg.payload[8..];

    if index != expected_index {
        return Err(PeerError::UnexpectedMessage(format!(
            "Piece for index {index}, expected {expected_index}"
        )));
    }
    if begin >= buf.len() || begin + data.len() > buf.len() {
        return Err(PeerError::MalformedPayload(format!(
            "Piece block [{begin}, {}) out of bounds for buffer of length {}",
            begin + data.len(),
            buf.len()
        )));
    }

    buf[begin..begin + data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Parses a `Have` message's piece index. The payload must be exactly 4 bytes.
pub fn parse_have(msg: &Message) -> PeerResult<u32> {
    if msg.id != MessageId::Have as u8 {
        return Err(PeerError::UnexpectedMessage(format!(
            "expected Have (id 4), got id {}",
            msg.id
        )));
    }
    if msg.payload.len() != 4 {
        return Err(PeerError::MalformedPayload(format!(
            "Have payload must be 4 bytes, got {}",
            msg.payload.len()
        )));
    }
    Ok(BigEndian::read_u32(&msg.payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_request_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Message::request(3, 16384, 16384);
        write_frame(&mut client, Some(&msg)).await.unwrap();
        let received = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn keep_alive_round_trips_to_none() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, None).await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, None);
    }

    #[test]
    fn apply_piece_rejects_wrong_index() {
        let msg = Message {
            id: MessageId::Piece as u8,
            payload: {
                let mut p = Vec::new();
                p.write_u32::<BigEndian>(5).unwrap();
                p.write_u32::<BigEndian>(0).unwrap();
                p.extend_from_slice(b"data");
                p
            },
        };
        let mut buf = vec![0u8; 16];
        assert!(apply_piece(&msg, 1, &mut buf).is_err());
    }

    #[test]
    fn apply_piece_copies_into_buffer_at_begin() {
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(0).unwrap();
        payload.write_u32::<BigEndian>(4).unwrap();
        payload.extend_from_slice(b"abcd");
        let msg = Message { id: MessageId::Piece as u8, payload };

        let mut buf = vec![0u8; 8];
        let n = apply_piece(&msg, 0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[4..8], b"abcd");
    }

    #[test]
    fn apply_piece_rejects_out_of_bounds() {
        let mut payload = Vec::new();
        payload.write_u32::<BigEndian>(0).unwrap();
        payload.write_u32::<BigEndian>(6).unwrap();
        payload.extend_from_slice(b"abcd");
        let msg = Message { id: MessageId::Piece as u8, payload };

        let mut buf = vec![0u8; 8];
        assert!(apply_piece(&msg, 0, &mut buf).is_err());
    }
}
