use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    net::SocketAddr,
    path::Path,
    process,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use sha1::{Digest, Sha1};
use tokio::{
    net::TcpListener,
    sync::mpsc::{self, error::TryRecvError},
    time,
};

use crate::{
    config::Config,
    dht::{Dht, DhtPeers},
    identity::{self, ShareId},
    message::{self, ExtensionHandshake, Handshake, IhInfo, IhMessage},
    peer::{self, Connected, Peer},
    tracker::{self, AnnounceParams, TrackerEvent, TrackerResponse},
};

pub const MAX_NUM_PEERS: usize = 60;
pub const EXT_PEX: &str = "ut_pex";
pub const EXT_CURRENT: &str = "bs_metadata";

const CURRENT_MARKER: &str = "current";
const INITIAL_RETRACKER: Duration = Duration::from_secs(20);
const MIN_ANNOUNCE_INTERVAL: i64 = 120;
const MAX_ANNOUNCE_INTERVAL: i64 = 86400;
const RECHOKE_TICK: Duration = Duration::from_secs(1);
const VERBOSE_TICK: Duration = Duration::from_secs(10);
const KEEPALIVE_TICK: Duration = Duration::from_secs(60);
const DEADLOCK_TICK: Duration = Duration::from_secs(15);
const PEER_HUNT_WAIT: Duration = Duration::from_secs(10);

/// Swarm switch gossiped by a peer: a revised info-hash and the endpoint
/// serving it. The containing application decides whether to follow.
#[derive(Clone, Debug, PartialEq)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer: SocketAddr,
}

/// The control session. Peer discovery and per-peer I/O fan out to tasks;
/// the peer table, `current_ih` and `rev` are mutated from the event loop
/// only.
pub struct Session {
    share: ShareId,
    peer_id: [u8; 20],
    config: Config,
    announce_urls: Vec<String>,
    current_ih: Option<[u8; 20]>,
    rev: String,
    peers: HashMap<SocketAddr, Peer>,
    /// Addresses with an outstanding outbound dial; checked alongside the
    /// peer table so one address delivered twice gets one connection.
    pending_dials: HashSet<SocketAddr>,
    our_extensions: BTreeMap<u8, String>,
    dht: Dht,
    dht_rx: Option<mpsc::Receiver<DhtPeers>>,
    inbound_tx: mpsc::Sender<(SocketAddr, Option<Vec<u8>>)>,
    inbound_rx: Option<mpsc::Receiver<(SocketAddr, Option<Vec<u8>>)>>,
    conns_tx: mpsc::Sender<Connected>,
    conns_rx: Option<mpsc::Receiver<Connected>>,
    dials_tx: mpsc::Sender<(SocketAddr, Option<Connected>)>,
    dials_rx: Option<mpsc::Receiver<(SocketAddr, Option<Connected>)>>,
    tracker_tx: mpsc::Sender<TrackerResponse>,
    tracker_rx: Option<mpsc::Receiver<TrackerResponse>>,
    torrents_tx: mpsc::Sender<Announce>,
    heartbeat_tx: mpsc::Sender<()>,
    heartbeat_rx: Option<mpsc::Receiver<()>>,
    last_peer_hunt: Option<Instant>,
    announced_started: bool,
}

impl Session {
    /// Restores the persisted `current` marker from `{dir}/current` and
    /// spawns the DHT task. Swarm announcements arrive on the returned
    /// receiver.
    pub fn new(
        share: ShareId,
        announce_urls: Vec<String>,
        config: Config,
    ) -> Result<(Session, mpsc::Receiver<Announce>)> {
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("cannot create state directory {:?}", config.dir))?;
        let peer_id = identity::generate_peer_id();

        let mut current_ih = None;
        let mut rev = "0-".to_string();
        if let Some(msg) = read_current(&config.dir) {
            if let Ok(ih) = <[u8; 20]>::try_from(msg.info.infohash.as_slice()) {
                current_ih = Some(ih);
            }
            if parse_rev(&msg.info.rev).is_some() {
                rev = msg.info.rev;
            }
            debug!("restored current marker, rev {rev}");
        }

        let node_id: [u8; 20] = rand::random();
        let (dht, dht_rx) = Dht::spawn(node_id, config.dht_chunk, config.dht_min_peers);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (conns_tx, conns_rx) = mpsc::channel(16);
        let (dials_tx, dials_rx) = mpsc::channel(16);
        let (tracker_tx, tracker_rx) = mpsc::channel(8);
        let (torrents_tx, torrents_rx) = mpsc::channel(16);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);

        let session = Session {
            share,
            peer_id,
            config,
            announce_urls,
            current_ih,
            rev,
            peers: HashMap::new(),
            pending_dials: HashSet::new(),
            our_extensions: BTreeMap::from([
                (1, EXT_PEX.to_string()),
                (2, EXT_CURRENT.to_string()),
            ]),
            dht,
            dht_rx: Some(dht_rx),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            conns_tx,
            conns_rx: Some(conns_rx),
            dials_tx,
            dials_rx: Some(dials_rx),
            tracker_tx,
            tracker_rx: Some(tracker_rx),
            torrents_tx,
            heartbeat_tx,
            heartbeat_rx: Some(heartbeat_rx),
            last_peer_hunt: None,
            announced_started: false,
        };
        Ok((session, torrents_rx))
    }

    pub fn current(&self) -> Option<[u8; 20]> {
        self.current_ih
    }

    pub fn rev(&self) -> &str {
        &self.rev
    }

    /// Advance to a new tracked info-hash: bump the revision, persist the
    /// marker, gossip to every peer that negotiated the extension.
    pub fn set_current(&mut self, ih: [u8; 20]) -> Result<()> {
        self.rev = advance_rev(&self.rev, &ih);
        self.current_ih = Some(ih);
        let msg = self.ih_message();
        write_current(&self.config.dir, &msg).context("cannot persist current marker")?;
        info!("current {} rev {}", hex::encode(ih), self.rev);

        let body = serde_bencode::to_bytes(&msg).context("current message encode error")?;
        for peer in self.peers.values() {
            if let Some(&code) = peer.extensions.get(EXT_CURRENT) {
                if let Err(e) = peer.send(message::extension_frame(code, &body)) {
                    debug!("peer {}: {e:#}", peer.addr);
                }
            }
        }
        Ok(())
    }

    /// The session event loop. All peer-table mutation happens here.
    pub async fn run(mut self, mut quit: mpsc::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("cannot listen on port {}", self.config.port))?;
        tokio::spawn(peer::accept_loop(
            listener,
            self.local_handshake(),
            self.conns_tx.clone(),
        ));

        let mut dht_rx = self.dht_rx.take().context("session already running")?;
        let mut inbound_rx = self.inbound_rx.take().context("session already running")?;
        let mut conns_rx = self.conns_rx.take().context("session already running")?;
        let mut dials_rx = self.dials_rx.take().context("session already running")?;
        let mut tracker_rx = self.tracker_rx.take().context("session already running")?;
        let heartbeat_rx = self.heartbeat_rx.take().context("session already running")?;
        spawn_deadlock_detector(heartbeat_rx);

        self.dht.peers_request(&self.share.public_id(), true);
        let mut tracker_wait = INITIAL_RETRACKER;
        let retracker = time::sleep(tracker_wait);
        tokio::pin!(retracker);
        let mut rechoke = time::interval(RECHOKE_TICK);
        let mut verbose = time::interval(VERBOSE_TICK);
        let mut keepalive = time::interval(KEEPALIVE_TICK);

        loop {
            tokio::select! {
                () = &mut retracker => {
                    self.announce();
                    retracker.as_mut().reset(time::Instant::now() + tracker_wait);
                }
                Some(batch) = dht_rx.recv() => {
                    trace!("{} peers from dht", batch.peers.len());
                    for addr in batch.peers {
                        self.connect_unknown(addr);
                    }
                }
                Some(resp) = tracker_rx.recv() => {
                    trace!("{} peers from tracker", resp.peers.len());
                    if let Some(interval) = resp.interval {
                        tracker_wait = clamp_interval(interval);
                    }
                    for addr in resp.peers {
                        self.connect_unknown(addr);
                    }
                }
                Some(conn) = conns_rx.recv() => self.admit(conn),
                Some((addr, conn)) = dials_rx.recv() => self.on_dial_done(addr, conn),
                Some((addr, frame)) = inbound_rx.recv() => match frame {
                    Some(payload) => {
                        if let Some(peer) = self.peers.get_mut(&addr) {
                            peer.last_read = Some(Instant::now());
                        }
                        if let Err(e) = self.dispatch(addr, &payload) {
                            warn!("peer {addr}: {e:#}");
                            self.close_peer(addr);
                        }
                    }
                    None => self.close_peer(addr),
                },
                _ = rechoke.tick() => {
                    let _ = self.heartbeat_tx.try_send(());
                    self.hunt_peers();
                }
                _ = verbose.tick() => {
                    info!(
                        "{} peers, current {}, rev {}",
                        self.peers.len(),
                        self.current_ih.map(hex::encode).unwrap_or_else(|| "-".into()),
                        self.rev
                    );
                }
                _ = keepalive.tick() => self.sweep_idle(),
                _ = quit.recv() => break,
            }
        }

        info!("session shutting down");
        self.peers.clear();
        self.dht.stop();
        Ok(())
    }

    fn local_handshake(&self) -> Handshake {
        Handshake::local(*self.share.as_bytes(), self.peer_id)
    }

    fn ih_message(&self) -> IhMessage {
        IhMessage {
            info: IhInfo {
                infohash: self.current_ih.map(|ih| ih.to_vec()).unwrap_or_default(),
                rev: self.rev.clone(),
            },
            port: self.config.port as i64,
            sig: vec![],
        }
    }

    fn extension_handshake(&self) -> ExtensionHandshake {
        ExtensionHandshake {
            m: self
                .our_extensions
                .iter()
                .map(|(code, name)| (name.clone(), *code))
                .collect(),
        }
    }

    fn announce(&mut self) {
        if self.announce_urls.is_empty() {
            return;
        }
        let params = AnnounceParams {
            info_hash: *self.share.as_bytes(),
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: (!self.announced_started).then_some(TrackerEvent::Started),
        };
        self.announced_started = true;
        let urls = self.announce_urls.clone();
        let tx = self.tracker_tx.clone();
        tokio::spawn(async move {
            match tracker::announce(&urls, &params).await {
                Ok(resp) => {
                    let _ = tx.send(resp).await;
                }
                Err(e) => debug!("tracker announce: {e:#}"),
            }
        });
    }

    /// Below the peer target, ask DHT and tracker for more, rate-limited.
    fn hunt_peers(&mut self) {
        if self.peers.len() >= self.config.target_peers {
            return;
        }
        if self.last_peer_hunt.is_some_and(|t| t.elapsed() < PEER_HUNT_WAIT) {
            return;
        }
        self.last_peer_hunt = Some(Instant::now());
        self.dht.peers_request(&self.share.public_id(), true);
        self.announce();
    }

    /// Dial a discovered address. DHT and tracker routinely deliver the
    /// same address more than once; known peers and in-flight dials are
    /// suppressed.
    fn connect_unknown(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr)
            || self.pending_dials.contains(&addr)
            || self.peers.len() >= MAX_NUM_PEERS
        {
            return;
        }
        self.pending_dials.insert(addr);
        let local = self.local_handshake();
        let dials = self.dials_tx.clone();
        let wait = self.config.peer_connect_timeout;
        tokio::spawn(async move {
            match peer::connect_peer(addr, local, wait).await {
                Ok(conn) => {
                    let _ = dials.send((addr, Some(conn))).await;
                }
                Err(e) => {
                    trace!("connect {addr}: {e:#}");
                    let _ = dials.send((addr, None)).await;
                }
            }
        });
    }

    fn on_dial_done(&mut self, addr: SocketAddr, conn: Option<Connected>) {
        self.pending_dials.remove(&addr);
        if let Some(conn) = conn {
            self.admit(conn);
        }
    }

    fn may_admit(&self, handshake: &Handshake) -> bool {
        if handshake.peer_id == self.peer_id {
            debug!("dropping connection to self");
            return false;
        }
        if self.peers.values().any(|p| p.id == handshake.peer_id) {
            debug!("duplicate peer id {}", hex::encode(handshake.peer_id));
            return false;
        }
        if self.peers.len() >= MAX_NUM_PEERS {
            debug!("peer table full");
            return false;
        }
        true
    }

    fn admit(&mut self, conn: Connected) {
        if !self.may_admit(&conn.handshake) {
            return;
        }
        let (out_tx, out_rx) = mpsc::channel(peer::OUTBOUND_QUEUE);
        let peer = Peer::new(conn.addr, &conn.handshake, out_tx);
        let (rd, wr) = conn.stream.into_split();
        peer::spawn_reader(conn.addr, rd, self.inbound_tx.clone());
        peer::spawn_writer(conn.addr, wr, out_rx);

        if peer.supports_dht() {
            self.dht.add_node(conn.addr);
        }
        if peer.supports_extensions() {
            match serde_bencode::to_bytes(&self.extension_handshake()) {
                Ok(body) => {
                    let _ = peer.send(message::extension_frame(message::EXT_HANDSHAKE_ID, &body));
                }
                Err(e) => warn!("extension handshake encode error: {e:#}"),
            }
        }
        info!("peer {} joined ({} total)", conn.addr, self.peers.len() + 1);
        self.peers.insert(conn.addr, peer);
    }

    fn close_peer(&mut self, addr: SocketAddr) {
        // dropping the entry closes the outbound queue, which ends the
        // writer; the reader ends with the connection
        if self.peers.remove(&addr).is_some() {
            debug!("peer {addr} closed ({} left)", self.peers.len());
        }
    }

    /// Close peers idle beyond the cutoff, nudge the rest with keep-alives.
    fn sweep_idle(&mut self) {
        let cutoff = self.config.peer_idle_cutoff;
        let idle: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| p.last_read.is_some_and(|t| t.elapsed() > cutoff))
            .map(|p| p.addr)
            .collect();
        for addr in idle {
            info!("closing idle peer {addr}");
            self.close_peer(addr);
        }
        for peer in self.peers.values() {
            if peer.last_read.is_some() {
                let _ = peer.send(Vec::new());
            }
        }
    }

    /// Route one inbound frame. Only extension-protocol messages reach the
    /// session; anything else is a protocol error that drops the peer.
    fn dispatch(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if payload[0] != message::MSG_EXTENSION {
            return Err(anyhow!("invalid message type {}", payload[0]));
        }
        if payload.len() < 2 {
            return Err(anyhow!("truncated extension message"));
        }
        let ext_id = payload[1];
        let body = &payload[2..];
        if ext_id == message::EXT_HANDSHAKE_ID {
            return self.on_extension_handshake(addr, body);
        }
        match self.our_extensions.get(&ext_id).map(String::as_str) {
            Some(EXT_PEX) => Ok(()),
            Some(EXT_CURRENT) => self.on_current(addr, body),
            _ => Err(anyhow!("unknown extension id {ext_id}")),
        }
    }

    fn on_extension_handshake(&mut self, addr: SocketAddr, body: &[u8]) -> Result<()> {
        let handshake: ExtensionHandshake =
            serde_bencode::from_bytes(body).context("extension handshake decode error")?;
        let reply = serde_bencode::to_bytes(&self.ih_message())
            .context("current message encode error")?;
        let peer = self.peers.get_mut(&addr).context("unknown peer")?;
        debug!("peer {addr} extensions: {:?}", handshake.m);
        peer.extensions = handshake.m;
        if let Some(&code) = peer.extensions.get(EXT_CURRENT) {
            peer.send(message::extension_frame(code, &reply))?;
        }
        Ok(())
    }

    /// A peer gossiped its current info-hash. The swarm endpoint combines
    /// the observed remote address with the advertised port; self-reported
    /// addresses are not trusted.
    fn on_current(&mut self, addr: SocketAddr, body: &[u8]) -> Result<()> {
        let msg: IhMessage =
            serde_bencode::from_bytes(body).context("current message decode error")?;
        if msg.info.infohash.is_empty() {
            return Ok(());
        }
        let ih = <[u8; 20]>::try_from(msg.info.infohash.as_slice())
            .map_err(|_| anyhow!("invalid info hash length {}", msg.info.infohash.len()))?;
        if Some(ih) == self.current_ih {
            return Ok(());
        }
        let port = u16::try_from(msg.port)
            .map_err(|_| anyhow!("invalid advertised port {}", msg.port))?;
        let endpoint = SocketAddr::new(addr.ip(), port);
        debug!("peer {addr} advertises {} rev {}", hex::encode(ih), msg.info.rev);
        let _ = self.torrents_tx.try_send(Announce { info_hash: ih, peer: endpoint });
        Ok(())
    }
}

fn parse_rev(rev: &str) -> Option<(u64, &str)> {
    let (counter, hash) = rev.split_once('-')?;
    Some((counter.parse().ok()?, hash))
}

fn advance_rev(rev: &str, ih: &[u8; 20]) -> String {
    let (counter, old_hash) = parse_rev(rev).unwrap_or((0, ""));
    let mut sha = Sha1::default();
    sha.update(ih);
    sha.update(old_hash.as_bytes());
    format!("{}-{}", counter + 1, hex::encode(sha.finalize()))
}

fn clamp_interval(interval: i64) -> Duration {
    Duration::from_secs(interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL) as u64)
}

fn write_current(dir: &Path, msg: &IhMessage) -> Result<()> {
    let bytes = serde_bencode::to_bytes(msg).context("current marker encode error")?;
    let tmp = dir.join("current.tmp");
    fs::write(&tmp, &bytes).with_context(|| format!("cannot write {tmp:?}"))?;
    fs::rename(&tmp, dir.join(CURRENT_MARKER)).context("cannot replace current marker")?;
    Ok(())
}

fn read_current(dir: &Path) -> Option<IhMessage> {
    let bytes = fs::read(dir.join(CURRENT_MARKER)).ok()?;
    serde_bencode::from_bytes(&bytes).ok()
}

/// Aborts the process when the event loop stops emitting heartbeats; the
/// protocol relies on bounded dispatch latency.
fn spawn_deadlock_detector(mut heartbeat: mpsc::Receiver<()>) {
    tokio::spawn(async move {
        let mut last_beat = Instant::now();
        let mut tick = time::interval(DEADLOCK_TICK);
        tick.tick().await;
        loop {
            tick.tick().await;
            loop {
                match heartbeat.try_recv() {
                    Ok(()) => last_beat = Instant::now(),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            if last_beat.elapsed() > DEADLOCK_TICK {
                error!("event loop stalled for {:?}, aborting", last_beat.elapsed());
                process::abort();
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn test_config(dir: &Path) -> Config {
        Config {
            port: 6881,
            dir: dir.to_path_buf(),
            store_root: dir.join("download"),
            target_peers: 5,
            peer_connect_timeout: Duration::from_secs(1),
            peer_idle_cutoff: Duration::from_secs(180),
            dht_chunk: 10,
            dht_min_peers: 5,
        }
    }

    fn test_session(dir: &Path) -> (Session, mpsc::Receiver<Announce>) {
        Session::new(ShareId::new([7u8; 20]), vec![], test_config(dir)).unwrap()
    }

    fn dummy_peer(
        session: &mut Session,
        addr: SocketAddr,
        id: [u8; 20],
        extensions: BTreeMap<String, u8>,
    ) -> mpsc::Receiver<Vec<u8>> {
        let (out_tx, out_rx) = mpsc::channel(8);
        let mut handshake = Handshake::local([7u8; 20], id);
        handshake.reserved = [0u8; 8];
        let mut peer = Peer::new(addr, &handshake, out_tx);
        peer.extensions = extensions;
        session.peers.insert(addr, peer);
        out_rx
    }

    #[test]
    fn should_parse_and_advance_revisions() {
        assert_eq!(parse_rev("0-"), Some((0, "")));
        assert_eq!(parse_rev("12-abcd"), Some((12, "abcd")));
        assert_eq!(parse_rev("nope"), None);
        assert_eq!(parse_rev("x-abcd"), None);

        let ih = [0xde; 20];
        let rev1 = advance_rev("0-", &ih);
        let mut sha = Sha1::default();
        sha.update(ih);
        assert_eq!(rev1, format!("1-{}", hex::encode(sha.finalize())));

        let ih2 = [0xca; 20];
        let rev2 = advance_rev(&rev1, &ih2);
        let mut sha = Sha1::default();
        sha.update(ih2);
        sha.update(rev1.split_once('-').unwrap().1.as_bytes());
        assert_eq!(rev2, format!("2-{}", hex::encode(sha.finalize())));
    }

    #[test]
    fn should_clamp_announce_intervals() {
        assert_eq!(clamp_interval(10), Duration::from_secs(120));
        assert_eq!(clamp_interval(1800), Duration::from_secs(1800));
        assert_eq!(clamp_interval(1_000_000), Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn should_persist_and_restore_current_marker() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut session, _torrents) = test_session(dir.path());
            assert_eq!(session.current(), None);
            assert_eq!(session.rev(), "0-");
            session.set_current([0xde; 20]).unwrap();
            session.set_current([0xca; 20]).unwrap();
            assert!(session.rev().starts_with("2-"));
        }
        let (session, _torrents) = test_session(dir.path());
        assert_eq!(session.current(), Some([0xca; 20]));
        assert!(session.rev().starts_with("2-"));
    }

    #[tokio::test]
    async fn should_count_revisions_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());
        for i in 1..=5u8 {
            session.set_current([i; 20]).unwrap();
            assert!(session.rev().starts_with(&format!("{i}-")));
        }
    }

    #[tokio::test]
    async fn should_enforce_admission_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());

        // self-connections are refused
        assert!(!session.may_admit(&Handshake::local([7u8; 20], session.peer_id)));

        let _rx = dummy_peer(&mut session, "10.0.0.1:1000".parse().unwrap(), [1u8; 20], BTreeMap::new());
        // duplicate peer id, different address
        assert!(!session.may_admit(&Handshake::local([7u8; 20], [1u8; 20])));
        assert!(session.may_admit(&Handshake::local([7u8; 20], [2u8; 20])));

        let mut queues = vec![];
        for i in 1..MAX_NUM_PEERS {
            let addr: SocketAddr = format!("10.0.1.{}:1000", i).parse().unwrap();
            let mut id = [0xbb; 20];
            id[0] = i as u8;
            queues.push(dummy_peer(&mut session, addr, id, BTreeMap::new()));
        }
        assert_eq!(session.peers.len(), MAX_NUM_PEERS);
        assert!(!session.may_admit(&Handshake::local([7u8; 20], [0xcc; 20])));
    }

    #[tokio::test]
    async fn should_dial_duplicate_addresses_once() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());

        // the same address delivered by dht and tracker in one iteration
        let addr: SocketAddr = "203.0.113.1:6881".parse().unwrap();
        session.connect_unknown(addr);
        session.connect_unknown(addr);
        assert_eq!(session.pending_dials.len(), 1);

        // an already admitted peer is not dialed again
        let known: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let _rx = dummy_peer(&mut session, known, [1u8; 20], BTreeMap::new());
        session.connect_unknown(known);
        assert!(!session.pending_dials.contains(&known));

        // a finished dial frees the address for the next delivery
        session.on_dial_done(addr, None);
        assert!(session.pending_dials.is_empty());
    }

    #[tokio::test]
    async fn should_reply_to_extension_handshake_with_current() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());
        session.set_current([0xde; 20]).unwrap();

        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let mut rx = dummy_peer(&mut session, addr, [1u8; 20], BTreeMap::new());

        let theirs = ExtensionHandshake { m: BTreeMap::from([(EXT_CURRENT.to_string(), 7)]) };
        let body = serde_bencode::to_bytes(&theirs).unwrap();
        let payload = message::extension_frame(message::EXT_HANDSHAKE_ID, &body);
        session.dispatch(addr, &payload).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[0], message::MSG_EXTENSION);
        assert_eq!(frame[1], 7);
        let msg: IhMessage = serde_bencode::from_bytes(&frame[2..]).unwrap();
        assert_eq!(msg.info.infohash, vec![0xde; 20]);
        assert_eq!(msg.port, 6881);
        assert_eq!(msg.info.rev, session.rev());
    }

    #[tokio::test]
    async fn should_broadcast_current_to_negotiated_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1000".parse().unwrap();
        let mut rx_a = dummy_peer(
            &mut session,
            a,
            [1u8; 20],
            BTreeMap::from([(EXT_CURRENT.to_string(), 9)]),
        );
        let mut rx_b = dummy_peer(&mut session, b, [2u8; 20], BTreeMap::new());

        session.set_current([0xab; 20]).unwrap();
        let frame = rx_a.try_recv().unwrap();
        assert_eq!(&frame[..2], &[message::MSG_EXTENSION, 9]);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_announce_foreign_current_with_observed_ip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, mut torrents) = test_session(dir.path());
        session.set_current([0x11; 20]).unwrap();

        let addr: SocketAddr = "10.0.0.9:50000".parse().unwrap();
        let _rx = dummy_peer(
            &mut session,
            addr,
            [1u8; 20],
            BTreeMap::from([(EXT_CURRENT.to_string(), 3)]),
        );
        let msg = IhMessage {
            info: IhInfo { infohash: vec![0x22; 20], rev: "4-beef".into() },
            port: 7000,
            sig: vec![],
        };
        let body = serde_bencode::to_bytes(&msg).unwrap();
        // code 2 is what we assigned to the gossip extension
        session.dispatch(addr, &message::extension_frame(2, &body)).unwrap();

        let announce = torrents.try_recv().unwrap();
        assert_eq!(announce.info_hash, [0x22; 20]);
        assert_eq!(announce.peer, "10.0.0.9:7000".parse().unwrap());

        // matching info-hash is not re-announced
        let same = IhMessage {
            info: IhInfo { infohash: vec![0x11; 20], rev: "9-aa".into() },
            port: 7000,
            sig: vec![],
        };
        let body = serde_bencode::to_bytes(&same).unwrap();
        session.dispatch(addr, &message::extension_frame(2, &body)).unwrap();
        assert!(torrents.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_reject_non_extension_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let _rx = dummy_peer(&mut session, addr, [1u8; 20], BTreeMap::new());

        // keep-alive is fine
        session.dispatch(addr, &[]).unwrap();
        // a bitfield message must not reach the control layer
        assert!(session.dispatch(addr, &[5, 0xff]).is_err());
        // unknown extension code
        assert!(session.dispatch(addr, &[20, 99, b'x']).is_err());
        // pex is accepted as a no-op
        session.dispatch(addr, &[20, 1, b'x']).unwrap();
    }

    #[tokio::test]
    async fn should_close_idle_peers_and_keep_alive_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _torrents) = test_session(dir.path());
        let idle: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let fresh: SocketAddr = "10.0.0.2:1000".parse().unwrap();
        let _rx_idle = dummy_peer(&mut session, idle, [1u8; 20], BTreeMap::new());
        let mut rx_fresh = dummy_peer(&mut session, fresh, [2u8; 20], BTreeMap::new());

        let Some(long_ago) = Instant::now().checked_sub(Duration::from_secs(400)) else {
            return;
        };
        session.peers.get_mut(&idle).unwrap().last_read = Some(long_ago);
        session.peers.get_mut(&fresh).unwrap().last_read = Some(Instant::now());
        session.sweep_idle();

        assert!(!session.peers.contains_key(&idle));
        assert!(session.peers.contains_key(&fresh));
        assert_eq!(rx_fresh.try_recv().unwrap(), Vec::<u8>::new());
    }
}
