use std::{path::PathBuf, time::Duration};

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    /// State directory holding the `current` marker and saved descriptors.
    pub dir: PathBuf,
    /// Directory the reconstructed file tree is rooted at.
    pub store_root: PathBuf,
    pub target_peers: usize,
    pub peer_connect_timeout: Duration,
    pub peer_idle_cutoff: Duration,
    pub dht_chunk: usize,
    pub dht_min_peers: usize,
}
