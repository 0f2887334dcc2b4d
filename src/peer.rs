use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{ensure, Context, Error, Result};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    time::timeout,
};

use crate::message::{self, Feature, Handshake};

pub const OUTBOUND_QUEUE: usize = 64;
const WRITER_KEEPALIVE: Duration = Duration::from_secs(120);

/// Session-owned state of a live peer. The reader and writer tasks hold
/// the split connection; everything here is mutated from the session loop
/// only.
pub struct Peer {
    pub addr: SocketAddr,
    pub id: [u8; 20],
    pub reserved: [u8; 8],
    /// Extension name to code mapping learned from their extension
    /// handshake.
    pub extensions: BTreeMap<String, u8>,
    pub last_read: Option<Instant>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl Peer {
    pub fn new(addr: SocketAddr, handshake: &Handshake, outbound: mpsc::Sender<Vec<u8>>) -> Peer {
        Peer {
            addr,
            id: handshake.peer_id,
            reserved: handshake.reserved,
            extensions: BTreeMap::new(),
            last_read: None,
            outbound,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        Feature::Extension.enabled(&self.reserved)
    }

    pub fn supports_dht(&self) -> bool {
        Feature::Dht.enabled(&self.reserved)
    }

    /// Queue a frame payload. The queue is bounded: a peer that cannot
    /// keep up is dropped rather than blocking the session.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .try_send(frame)
            .map_err(|_| Error::msg("outbound queue overflow"))
    }
}

/// A connection that passed the handshake exchange, ready for admission.
pub struct Connected {
    pub addr: SocketAddr,
    pub handshake: Handshake,
    pub stream: TcpStream,
}

pub async fn connect_peer(
    addr: SocketAddr,
    local: Handshake,
    connect_timeout: Duration,
) -> Result<Connected> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .context("connect timeout")?
        .context("connect error")?;
    let handshake = exchange(&mut stream, &local).await?;
    Ok(Connected { addr, handshake, stream })
}

/// Send our 68 bytes, read theirs, validate. Used for both directions;
/// both sides send eagerly so the order does not matter.
async fn exchange(stream: &mut TcpStream, local: &Handshake) -> Result<Handshake> {
    let packet: Vec<u8> = local.into();
    stream.write_all(&packet).await.context("handshake write error")?;
    let mut reply = [0u8; message::HANDSHAKE_LEN];
    stream.read_exact(&mut reply).await.context("handshake read error")?;
    let theirs = Handshake::try_from(&reply[..])?;
    ensure!(theirs.peer_id != local.peer_id, "connected to self");
    Ok(theirs)
}

/// Accept inbound connections, run the handshake exchange off the accept
/// path, and hand admitted connections to the session.
pub async fn accept_loop(listener: TcpListener, local: Handshake, conns: mpsc::Sender<Connected>) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept error: {e:#}");
                continue;
            }
        };
        let local = local.clone();
        let conns = conns.clone();
        tokio::spawn(async move {
            match exchange(&mut stream, &local).await {
                Ok(handshake) => {
                    let _ = conns.send(Connected { addr, handshake, stream }).await;
                }
                Err(e) => debug!("inbound handshake {addr}: {e:#}"),
            }
        });
    }
}

/// Reader half: one frame per iteration into the session's inbound
/// channel. EOF or a read error pushes the `None` sentinel so the session
/// drops the peer.
pub fn spawn_reader(
    addr: SocketAddr,
    mut stream: OwnedReadHalf,
    inbound: mpsc::Sender<(SocketAddr, Option<Vec<u8>>)>,
) {
    tokio::spawn(async move {
        loop {
            match message::read_frame(&mut stream).await {
                Ok(frame) => {
                    if inbound.send((addr, Some(frame))).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    trace!("peer {addr} read: {e:#}");
                    let _ = inbound.send((addr, None)).await;
                    return;
                }
            }
        }
    });
}

/// Writer half: drains the outbound queue; an idle stretch emits a
/// keep-alive. Ends when the session drops the queue sender.
pub fn spawn_writer(addr: SocketAddr, mut stream: OwnedWriteHalf, mut outbound: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        loop {
            let frame = match timeout(WRITER_KEEPALIVE, outbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(_) => Vec::new(),
            };
            if let Err(e) = message::write_frame(&mut stream, &frame).await {
                trace!("peer {addr} write: {e:#}");
                return;
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn should_exchange_handshakes() {
        let (mut a, mut b) = stream_pair().await;
        let ours = Handshake::local([1u8; 20], [2u8; 20]);
        let theirs = Handshake::local([1u8; 20], [3u8; 20]);
        let ours_clone = ours.clone();
        let remote = tokio::spawn(async move { exchange(&mut b, &ours_clone).await });
        let got = exchange(&mut a, &theirs).await.unwrap();
        assert_eq!(got.peer_id, [2u8; 20]);
        assert_eq!(remote.await.unwrap().unwrap().peer_id, [3u8; 20]);
    }

    #[tokio::test]
    async fn should_refuse_self_connection() {
        let (mut a, mut b) = stream_pair().await;
        let ours = Handshake::local([1u8; 20], [2u8; 20]);
        let same = ours.clone();
        let remote = tokio::spawn(async move { exchange(&mut b, &same).await });
        assert!(exchange(&mut a, &ours).await.is_err());
        assert!(remote.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn should_forward_frames_and_sentinel() {
        let (a, b) = stream_pair().await;
        let addr = a.peer_addr().unwrap();
        let (rd, _wr_keep) = a.into_split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        spawn_reader(addr, rd, inbound_tx);

        let (_rd_b, mut wr_b) = b.into_split();
        message::write_frame(&mut wr_b, &[20, 1, 2, 3]).await.unwrap();
        message::write_frame(&mut wr_b, &[]).await.unwrap();
        assert_eq!(inbound_rx.recv().await, Some((addr, Some(vec![20, 1, 2, 3]))));
        assert_eq!(inbound_rx.recv().await, Some((addr, Some(vec![]))));

        drop(wr_b);
        drop(_rd_b);
        assert_eq!(inbound_rx.recv().await, Some((addr, None)));
    }

    #[tokio::test]
    async fn should_write_queued_frames() {
        let (a, b) = stream_pair().await;
        let addr = a.peer_addr().unwrap();
        let (_rd_a, wr) = a.into_split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        spawn_writer(addr, wr, out_rx);

        let (mut rd_b, _wr_b) = b.into_split();
        out_tx.send(vec![20, 0, b'x']).await.unwrap();
        assert_eq!(message::read_frame(&mut rd_b).await.unwrap(), vec![20, 0, b'x']);
        out_tx.send(Vec::new()).await.unwrap();
        assert_eq!(message::read_frame(&mut rd_b).await.unwrap(), Vec::<u8>::new());
    }
}
