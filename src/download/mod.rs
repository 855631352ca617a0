//! The download coordinator: owns the work queue and result channel, spawns
//! one worker per peer, and reassembles pieces into a contiguous buffer.
use crate::peer::worker::{run_worker, PieceResult};
use crate::peer::{PeerError, PeerId, PeerResult};
use crate::torrent::TorrentFile;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument};

/// Downloads every piece of `torrent` from `peers`, returning the assembled
/// content as a single contiguous buffer of length `torrent.length()`.
///
/// Spawns one worker task per peer endpoint; workers communicate only
/// through the shared work queue and the result channel, never directly
/// with each other or with this function.
#[instrument(skip(torrent, our_peer_id, peers), fields(num_peers = peers.len()), level = "info")]
pub async fn download(
    torrent: &TorrentFile,
    our_peer_id: PeerId,
    peers: &[SocketAddr],
) -> PeerResult<Vec<u8>> {
    let num_pieces = torrent.num_pieces();
    let piece_length = torrent.piece_length as usize;
    let mut buf = vec![0u8; torrent.length() as usize];

    let (work_tx, work_rx) = kanal::bounded_async::<crate::torrent::PieceWork>(num_pieces.max(1));
    for item in torrent.piece_work_items() {
        work_tx
            .send(item)
            .await
            .expect("work queue has capacity for every piece at startup");
    }

    let (result_tx, mut result_rx) = mpsc::channel::<PieceResult>(peers.len().max(1));

    let mut workers = Vec::with_capacity(peers.len());
    for &addr in peers {
        let handle = tokio::spawn(run_worker(
            addr,
            our_peer_id,
            torrent.info_hash,
            work_tx.clone(),
            work_rx.clone(),
            result_tx.clone(),
        ));
        workers.push(handle);
    }
    // The coordinator holds no sending half of its own; dropping these lets
    // the result channel close once every worker has exited.
    drop(result_tx);
    drop(work_tx);
    drop(work_rx);

    let mut done = 0usize;
    let mut progress_interval = tokio::time::interval(Duration::from_secs(5));
    progress_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if done == num_pieces {
            break;
        }
        tokio::select! {
            result = result_rx.recv() => {
                match result {
                    Some(PieceResult { index, bytes }) => {
                        let offset = index as usize * piece_length;
                        buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
                        done += 1;
                    }
                    None => {
                        return Err(PeerError::NoPeersRemaining {
                            done,
                            total: num_pieces,
                        });
                    }
                }
            }
            _ = progress_interval.tick() => {
                info!(
                    percent = format!("{:.1}", done as f64 / num_pieces as f64 * 100.0),
                    active_workers = workers.iter().filter(|h| !h.is_finished()).count(),
                    "download progress"
                );
            }
        }
    }

    for handle in workers {
        handle.abort();
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::{self, Message};
    use crate::torrent::descriptor::sha1;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Serves one complete, single-piece torrent download to whatever client
    /// connects, then closes the connection.
    async fn cooperative_seed(mut stream: DuplexStream, info_hash: [u8; 20], content: Vec<u8>) {
        let peer_id = [9u8; 20];
        crate::peer::Handshake::exchange(&mut stream, info_hash, peer_id)
            .await
            .unwrap();
        message::write_frame(&mut stream, Some(&Message::bitfield(vec![0xFF])))
            .await
            .unwrap();
        let _ = message::read_frame(&mut stream).await.unwrap(); // unchoke
        let _ = message::read_frame(&mut stream).await.unwrap(); // interested
        message::write_frame(&mut stream, Some(&Message::unchoke()))
            .await
            .unwrap();

        let mut served = 0usize;
        while served < content.len() {
            let req = message::read_frame(&mut stream).await.unwrap().unwrap();
            let begin = u32::from_be_bytes(req.payload[4..8].try_into().unwrap()) as usize;
            let length = u32::from_be_bytes(req.payload[8..12].try_into().unwrap()) as usize;
            let block = &content[begin..begin + length];
            message::write_frame(&mut stream, Some(&Message::piece(0, begin as u32, block)))
                .await
                .unwrap();
            served += length;
        }
        let _ = stream.shutdown().await;
    }

    /// Bridges an in-memory duplex pair onto a real loopback TCP listener so
    /// `PeerSession::connect` can be exercised without mocking its signature.
    async fn spawn_seed_listener(info_hash: [u8; 20], content: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut inbound, _) = listener.accept().await.unwrap();
            let (mut sim_client, sim_server) = tokio::io::duplex(1 << 20);
            let seed = tokio::spawn(cooperative_seed(sim_server, info_hash, content));
            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut sim_client).await;
            let _ = seed.await;
        });
        addr
    }

    /// Serves one complete, single-piece torrent download, but flips a bit
    /// in every block it sends — the resulting piece fails its SHA-1 check.
    async fn malicious_seed(mut stream: DuplexStream, info_hash: [u8; 20], content: Vec<u8>) {
        let peer_id = [8u8; 20];
        crate::peer::Handshake::exchange(&mut stream, info_hash, peer_id)
            .await
            .unwrap();
        message::write_frame(&mut stream, Some(&Message::bitfield(vec![0xFF])))
            .await
            .unwrap();
        let _ = message::read_frame(&mut stream).await.unwrap(); // unchoke
        let _ = message::read_frame(&mut stream).await.unwrap(); // interested
        message::write_frame(&mut stream, Some(&Message::unchoke()))
            .await
            .unwrap();

        let mut served = 0usize;
        while served < content.len() {
            let req = message::read_frame(&mut stream).await.unwrap().unwrap();
            let begin = u32::from_be_bytes(req.payload[4..8].try_into().unwrap()) as usize;
            let length = u32::from_be_bytes(req.payload[8..12].try_into().unwrap()) as usize;
            let mut block = content[begin..begin + length].to_vec();
            block[0] ^= 0xFF;
            message::write_frame(&mut stream, Some(&Message::piece(0, begin as u32, &block)))
                .await
                .unwrap();
            served += length;
        }
        let _ = stream.shutdown().await;
    }

    /// Bridges a simulated peer onto a real loopback listener, same as
    /// `spawn_seed_listener`, but delays the moment the connection starts
    /// carrying bytes by `delay`. Giving one peer a delay and the other
    /// none makes which peer claims the lone work item first deterministic
    /// instead of a scheduling race, so tests can exercise "peer A fails
    /// and requeues, peer B picks the requeued item up" reliably.
    async fn spawn_peer_listener<F, Fut>(delay: Duration, serve: F) -> SocketAddr
    where
        F: FnOnce(DuplexStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut inbound, _) = listener.accept().await.unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let (mut sim_client, sim_server) = tokio::io::duplex(1 << 20);
            let seed = tokio::spawn(serve(sim_server));
            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut sim_client).await;
            let _ = seed.await;
        });
        addr
    }

    #[tokio::test]
    async fn download_single_piece_from_one_peer() {
        let content = vec![0x42u8; 4096];
        let piece_hash = sha1(&content);
        let info_hash = [3u8; 20];

        let torrent = TorrentFile {
            announce: "http://tracker.example/announce".into(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            name: "sample".into(),
            piece_length: content.len() as i64,
            files: vec![crate::torrent::FileEntry {
                length: content.len() as i64,
                path: vec!["sample".into()],
            }],
            info_hash,
            piece_hashes: vec![piece_hash],
        };

        let addr = spawn_seed_listener(info_hash, content.clone()).await;
        let result = download(&torrent, [1u8; 20], &[addr]).await.unwrap();
        assert_eq!(result, content);
    }

    #[tokio::test]
    async fn reports_no_peers_remaining_when_queue_never_drains() {
        let content = vec![0x11u8; 16];
        let torrent = TorrentFile {
            announce: "http://tracker.example/announce".into(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            name: "sample".into(),
            piece_length: content.len() as i64,
            files: vec![crate::torrent::FileEntry {
                length: content.len() as i64,
                path: vec!["sample".into()],
            }],
            info_hash: [4u8; 20],
            piece_hashes: vec![sha1(&content)],
        };

        // No listener bound at this address: connect fails immediately and
        // the lone worker exits without ever taking the piece.
        let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = download(&torrent, [1u8; 20], &[unreachable]).await;
        assert!(matches!(result, Err(PeerError::NoPeersRemaining { done: 0, .. })));
    }

    #[tokio::test]
    async fn malicious_peer_is_dropped_and_piece_is_redownloaded_by_second_peer() {
        let content = vec![0x7Au8; 4096];
        let piece_hash = sha1(&content);
        let info_hash = [5u8; 20];

        let torrent = TorrentFile {
            announce: "http://tracker.example/announce".into(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            name: "sample".into(),
            piece_length: content.len() as i64,
            files: vec![crate::torrent::FileEntry {
                length: content.len() as i64,
                path: vec!["sample".into()],
            }],
            info_hash,
            piece_hashes: vec![piece_hash],
        };

        // The malicious peer's connection is bridged immediately, so its
        // worker claims the torrent's one work item first, corrupts it, and
        // requeues it on exit. The cooperative peer's connection is bridged
        // only after a delay, so its worker is still waiting on the
        // handshake when that happens and picks the requeued item up next.
        let malicious_addr = spawn_peer_listener(Duration::ZERO, {
            let content = content.clone();
            move |stream| malicious_seed(stream, info_hash, content)
        })
        .await;
        let cooperative_addr = spawn_peer_listener(Duration::from_millis(150), {
            let content = content.clone();
            move |stream| cooperative_seed(stream, info_hash, content)
        })
        .await;

        let result = download(&torrent, [1u8; 20], &[malicious_addr, cooperative_addr])
            .await
            .unwrap();
        assert_eq!(result, content);
    }
}
