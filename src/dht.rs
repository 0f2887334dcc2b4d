use std::{
    cmp,
    collections::{BTreeSet, HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Error, Result};
use futures::{stream::FuturesUnordered, StreamExt};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde_bencode::value::Value;
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};

const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];
const QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// One batch of peers found for a lookup target.
#[derive(Clone, Debug, PartialEq)]
pub struct DhtPeers {
    pub info_hash: [u8; 20],
    pub peers: Vec<SocketAddr>,
}

enum Command {
    PeersRequest { target: [u8; 20], announce: bool },
    AddNode(SocketAddr),
    Stop,
}

/// Handle to the DHT task. Lookups and node seeding go through a command
/// channel; results come back on the receiver returned by `spawn`.
pub struct Dht {
    cmds: mpsc::Sender<Command>,
}

impl Dht {
    pub fn spawn(
        node_id: [u8; 20],
        chunk: usize,
        min_peers: usize,
    ) -> (Dht, mpsc::Receiver<DhtPeers>) {
        let (cmds_tx, cmds_rx) = mpsc::channel(16);
        let (peers_tx, peers_rx) = mpsc::channel(16);
        tokio::spawn(dht_loop(node_id, cmds_rx, peers_tx, chunk, min_peers));
        (Dht { cmds: cmds_tx }, peers_rx)
    }

    /// Look up peers for a hex-encoded swarm key. `announce` asks the task
    /// to also advertise our presence; announcing is accepted but not yet
    /// issued.
    pub fn peers_request(&self, public_id: &str, announce: bool) {
        let Ok(bytes) = hex::decode(public_id) else {
            warn!("dht lookup for non-hex id {public_id}");
            return;
        };
        let Ok(target) = <[u8; 20]>::try_from(bytes.as_slice()) else {
            warn!("dht lookup for {}-byte id", bytes.len() / 2);
            return;
        };
        let _ = self.cmds.try_send(Command::PeersRequest { target, announce });
    }

    pub fn add_node(&self, addr: SocketAddr) {
        let _ = self.cmds.try_send(Command::AddNode(addr));
    }

    pub fn stop(&self) {
        let _ = self.cmds.try_send(Command::Stop);
    }
}

async fn dht_loop(
    node_id: [u8; 20],
    mut cmds: mpsc::Receiver<Command>,
    peers_tx: mpsc::Sender<DhtPeers>,
    chunk: usize,
    min_peers: usize,
) {
    let mut candidates: BTreeSet<SocketAddr> = BTreeSet::new();
    for node in BOOTSTRAP_NODES {
        match tokio::net::lookup_host(node).await {
            Ok(addrs) => candidates.extend(addrs),
            Err(e) => debug!("bootstrap node {node}: {e:#}"),
        }
    }
    loop {
        match cmds.recv().await {
            Some(Command::AddNode(addr)) => {
                candidates.insert(addr);
            }
            Some(Command::PeersRequest { target, announce }) => {
                if announce {
                    trace!("announce requested for {}", hex::encode(target));
                }
                let nodes = candidates.iter().copied().collect();
                let responsive =
                    lookup(node_id, target, nodes, chunk, min_peers, &peers_tx).await;
                // responsive nodes seed the next lookup
                candidates.extend(responsive);
            }
            Some(Command::Stop) | None => return,
        }
    }
}

/// Iterative lookup: query the candidate queue in bounded chunks until
/// enough peers were found or the queue runs dry.
async fn lookup(
    node_id: [u8; 20],
    target: [u8; 20],
    nodes: Vec<SocketAddr>,
    chunk: usize,
    min_peers: usize,
    peers_tx: &mpsc::Sender<DhtPeers>,
) -> BTreeSet<SocketAddr> {
    let mut seen: BTreeSet<SocketAddr> = nodes.iter().copied().collect();
    let mut queue = VecDeque::from(nodes);
    let mut responsive = BTreeSet::new();
    let mut found = 0usize;
    while found < min_peers {
        let batch: Vec<_> = queue.drain(..cmp::min(queue.len(), chunk)).collect();
        if batch.is_empty() {
            break;
        }
        debug!("dht lookup round: {} nodes, {} found", batch.len(), found);
        let mut queries = batch
            .into_iter()
            .map(|node| query_node(node_id, target, node))
            .collect::<FuturesUnordered<_>>();
        while let Some(res) = queries.next().await {
            match res {
                Ok((node, QueryResult::Peers(peers))) => {
                    responsive.insert(node);
                    found += peers.len();
                    let _ = peers_tx.send(DhtPeers { info_hash: target, peers }).await;
                }
                Ok((node, QueryResult::Nodes(more))) => {
                    responsive.insert(node);
                    for n in more {
                        if seen.insert(n) {
                            queue.push_back(n);
                        }
                    }
                }
                Err(e) => trace!("dht query: {e:#}"),
            }
        }
    }
    debug!("dht lookup done: {found} peers, {} responsive nodes", responsive.len());
    responsive
}

enum QueryResult {
    Peers(Vec<SocketAddr>),
    Nodes(Vec<SocketAddr>),
}

async fn query_node(
    node_id: [u8; 20],
    target: [u8; 20],
    node: SocketAddr,
) -> Result<(SocketAddr, QueryResult)> {
    let packet = get_peers_packet(&node_id, &target)?;
    let resp = timeout(QUERY_TIMEOUT, send_udp(node, &packet))
        .await
        .context("dht query timeout")??;
    Ok((node, parse_get_peers(&resp)?))
}

fn get_peers_packet(node_id: &[u8; 20], target: &[u8; 20]) -> Result<Vec<u8>> {
    let tx_id: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(2)
        .map(char::from)
        .collect();
    let args = Value::Dict(HashMap::from([
        (b"id".to_vec(), Value::Bytes(node_id.to_vec())),
        (b"info_hash".to_vec(), Value::Bytes(target.to_vec())),
    ]));
    let req = Value::Dict(HashMap::from([
        (b"t".to_vec(), Value::Bytes(tx_id.into_bytes())),
        (b"y".to_vec(), Value::Bytes(b"q".to_vec())),
        (b"q".to_vec(), Value::Bytes(b"get_peers".to_vec())),
        (b"a".to_vec(), args),
    ]));
    serde_bencode::to_bytes(&req).context("krpc encode error")
}

fn parse_get_peers(resp: &[u8]) -> Result<QueryResult> {
    let dict = match serde_bencode::from_bytes(resp).context("krpc decode error")? {
        Value::Dict(d) => d,
        _ => return Err(Error::msg("krpc response is not a dict")),
    };
    if matches!(dict.get(b"y".as_slice()), Some(Value::Bytes(y)) if y == b"e") {
        return Err(Error::msg("krpc error response"));
    }
    let r = match dict.get(b"r".as_slice()) {
        Some(Value::Dict(r)) => r,
        _ => return Err(Error::msg("no response dict")),
    };

    if let Some(Value::List(values)) = r.get(b"values".as_slice()) {
        let peers = values
            .iter()
            .filter_map(|v| match v {
                Value::Bytes(blob) => compact_to_addr(blob).ok(),
                _ => None,
            })
            .collect();
        return Ok(QueryResult::Peers(peers));
    }

    if let Some(Value::Bytes(nodes)) = r.get(b"nodes".as_slice()) {
        // 26-byte entries: 20-byte node id then a compact IPv4 endpoint
        let nodes = nodes
            .chunks_exact(26)
            .filter_map(|c| compact_to_addr(&c[20..]).ok())
            .collect();
        return Ok(QueryResult::Nodes(nodes));
    }

    Err(Error::msg("malformed get_peers response"))
}

/// Decode a compact endpoint: 6 bytes for IPv4:port, 18 for IPv6:port.
fn compact_to_addr(blob: &[u8]) -> Result<SocketAddr> {
    match blob.len() {
        6 => {
            let ip = Ipv4Addr::new(blob[0], blob[1], blob[2], blob[3]);
            let port = u16::from_be_bytes([blob[4], blob[5]]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&blob[..16]);
            let port = u16::from_be_bytes([blob[16], blob[17]]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        n => Err(Error::msg(format!("bad compact endpoint length {n}"))),
    }
}

async fn send_udp(addr: SocketAddr, packet: &[u8]) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    socket.send(packet).await?;
    let mut buf = vec![0u8; 1 << 16];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}
