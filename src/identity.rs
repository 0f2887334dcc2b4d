use core::fmt;
use std::process;

use anyhow::{ensure, Result};
use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Swarm identity of the local share. The public form keys DHT lookups
/// and fills the info-hash field of outgoing handshakes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareId([u8; 20]);

impl ShareId {
    pub fn new(bytes: [u8; 20]) -> ShareId {
        ShareId(bytes)
    }

    pub fn from_hex(s: &str) -> Result<ShareId> {
        let bytes = hex::decode(s)?;
        ensure!(bytes.len() == 20, "share id must be 20 bytes, got {}", bytes.len());
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(ShareId(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Hex form, shareable and usable as the DHT swarm key.
    pub fn public_id(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareId({})", self.public_id())
    }
}

/// 20 ASCII bytes: vendor prefix, process id, random fill.
pub fn generate_peer_id() -> [u8; 20] {
    let prefix = format!("-BS0001-{:06}", process::id() % 1_000_000);
    let suffix = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20 - prefix.len())
        .map(char::from)
        .collect::<String>();
    let mut id = [0u8; 20];
    id.copy_from_slice(format!("{prefix}{suffix}").as_bytes());
    id
}
