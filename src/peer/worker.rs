//! The piece worker: one per peer, pulling piece-work items from the shared
//! queue and driving a single [`PeerSession`] to fetch and verify them.
use super::message::{self, MessageId};
use super::session::PeerSession;
use super::{PeerError, PeerId, PeerResult, BLOCK_SIZE, MAX_BACKLOG, PIECE_TIMEOUT};
use crate::torrent::descriptor::sha1;
use crate::torrent::PieceWork;
use bytes::Bytes;
use kanal::{AsyncReceiver, AsyncSender};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// A fully downloaded and hash-verified piece, ready for the coordinator to
/// splice into the output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    pub index: u32,
    pub bytes: Bytes,
}

/// Runs one worker for the session's entire lifetime: connect, announce
/// interest, then loop pulling work items until the queue closes, the
/// coordinator's result channel closes, or this session hits an
/// unrecoverable error.
///
/// Every exit path that leaves a work item unhandled pushes it back onto
/// `work_tx` first — the queue, not this function's caller, is what gives
/// another worker a chance at it.
#[instrument(skip(our_peer_id, info_hash, work_tx, work_rx, result_tx), fields(%addr), level = "info")]
pub async fn run_worker(
    addr: SocketAddr,
    our_peer_id: PeerId,
    info_hash: [u8; 20],
    work_tx: AsyncSender<PieceWork>,
    work_rx: AsyncReceiver<PieceWork>,
    result_tx: mpsc::Sender<PieceResult>,
) {
    let mut session = match PeerSession::connect(addr, info_hash, our_peer_id).await {
        Ok(session) => session,
        Err(err) => {
            debug!(%addr, error = %err, "peer session failed to establish, worker exiting");
            return;
        }
    };

    if session.send_unchoke().await.is_err() || session.send_interested().await.is_err() {
        debug!(%addr, "failed to announce intent, worker exiting");
        return;
    }

    while let Ok(work) = work_rx.recv().await {
        if !session.has_piece(work.index) {
            if work_tx.send(work).await.is_err() {
                return;
            }
            continue;
        }

        let index = work.index;
        match download_piece(&mut session, &work).await {
            Ok(bytes) => {
                // Courtesy Have; the download already succeeded regardless
                // of whether this peer hears about it.
                let _ = session.send_have(index).await;
                let bytes = Bytes::from(bytes);
                if result_tx.send(PieceResult { index, bytes }).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(%addr, piece = index, error = %err, "piece download failed, requeuing and exiting");
                let _ = work_tx.send(work).await;
                return;
            }
        }
    }
}

/// Downloads and verifies a single piece, pipelining up to [`MAX_BACKLOG`]
/// block requests at a time. The whole operation — every request and every
/// read across the entire piece — is bounded by [`PIECE_TIMEOUT`].
async fn download_piece<S>(session: &mut PeerSession<S>, work: &PieceWork) -> PeerResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; work.length as usize];
    match timeout(PIECE_TIMEOUT, pipeline_blocks(session, work, &mut buf)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(_) => return Err(PeerError::Timeout),
    }

    let actual = sha1(&buf);
    if actual != work.hash {
        return Err(PeerError::HashMismatch(work.index));
    }
    Ok(buf)
}

async fn pipeline_blocks<S>(
    session: &mut PeerSession<S>,
    work: &PieceWork,
    buf: &mut [u8],
) -> PeerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut requested: u32 = 0;
    let mut downloaded: u32 = 0;
    let mut backlog: usize = 0;

    while downloaded < work.length {
        if !session.am_choked {
            while backlog < MAX_BACKLOG && requested < work.length {
                let block_len = (work.length - requested).min(BLOCK_SIZE);
                session.send_request(work.index, requested, block_len).await?;
                requested += block_len;
                backlog += 1;
            }
        }

        let msg = match session.read_message().await? {
            Some(msg) => msg,
            None => continue, // keep-alive
        };

        match msg.id() {
            Ok(MessageId::Piece) => {
                let n = message::apply_piece(&msg, work.index, buf)?;
                downloaded += n as u32;
                backlog = backlog.saturating_sub(1);
            }
            _ => {
                session.apply_state_update(&msg)?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{message::Message, Handshake};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Drives the "peer" end of a duplex pair through handshake, bitfield,
    /// unchoke/interested, and then serves every block request for one
    /// piece from `content`.
    async fn cooperative_peer(
        mut stream: DuplexStream,
        info_hash: [u8; 20],
        piece_index: u32,
        content: Vec<u8>,
        corrupt: bool,
    ) {
        let our_id = [9u8; 20];
        Handshake::exchange(&mut stream, info_hash, our_id).await.unwrap();
        message::write_frame(&mut stream, Some(&Message::bitfield(vec![0xFF])))
            .await
            .unwrap();

        // Consume Unchoke + Interested from the worker.
        let _ = message::read_frame(&mut stream).await.unwrap();
        let _ = message::read_frame(&mut stream).await.unwrap();

        // Tell the worker it may request.
        message::write_frame(&mut stream, Some(&Message::unchoke()))
            .await
            .unwrap();

        let mut served = 0usize;
        while served < content.len() {
            let req = message::read_frame(&mut stream).await.unwrap().unwrap();
            let begin = u32::from_be_bytes(req.payload[4..8].try_into().unwrap()) as usize;
            let length = u32::from_be_bytes(req.payload[8..12].try_into().unwrap()) as usize;
            let mut block = content[begin..begin + length].to_vec();
            if corrupt {
                block[0] ^= 0xFF;
            }
            message::write_frame(&mut stream, Some(&Message::piece(piece_index, begin as u32, &block)))
                .await
                .unwrap();
            served += length;
        }

        let _ = stream.shutdown().await;
    }

    #[tokio::test]
    async fn download_piece_succeeds_against_cooperative_peer() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let info_hash = [1u8; 20];
        let content = vec![0xABu8; (BLOCK_SIZE as usize) * 3 + 1234];
        let piece_hash = sha1(&content);

        tokio::spawn(cooperative_peer(server, info_hash, 0, content.clone(), false));

        let mut session = PeerSession::from_stream(client, info_hash, [2u8; 20])
            .await
            .unwrap();
        session.send_unchoke().await.unwrap();
        session.send_interested().await.unwrap();

        let work = PieceWork {
            index: 0,
            hash: piece_hash,
            length: content.len() as u32,
        };
        let downloaded = download_piece(&mut session, &work).await.unwrap();
        assert_eq!(downloaded, content);
    }

    #[tokio::test]
    async fn download_piece_rejects_hash_mismatch() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let info_hash = [1u8; 20];
        let content = vec![0xCDu8; 4096];
        let piece_hash = sha1(&content);

        tokio::spawn(cooperative_peer(server, info_hash, 0, content.clone(), true));

        let mut session = PeerSession::from_stream(client, info_hash, [2u8; 20])
            .await
            .unwrap();
        session.send_unchoke().await.unwrap();
        session.send_interested().await.unwrap();

        let work = PieceWork {
            index: 0,
            hash: piece_hash,
            length: content.len() as u32,
        };
        let result = download_piece(&mut session, &work).await;
        assert!(matches!(result, Err(PeerError::HashMismatch(0))));
    }
}
