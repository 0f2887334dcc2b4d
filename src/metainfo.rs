use core::fmt;
use std::{fs, path::Path};

use anyhow::{ensure, Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Decoded torrent descriptor.
///
/// Serde field order matches bencode key order, so re-encoding a parsed
/// dictionary reproduces the canonical bytes the info-hash is computed over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metainfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<String>,
    #[serde(default, rename = "announce-list", skip_serializing_if = "Option::is_none")]
    pub announce_list: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, rename = "created by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, rename = "creation date", skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Info>,
    /// SHA-1 over the bencoded `info` dictionary, cached during parse.
    #[serde(skip)]
    pub info_hash: [u8; 20],
    /// Canonical bencoded bytes of `info`.
    #[serde(skip)]
    pub raw_info: Vec<u8>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileDict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("piece_length", &self.piece_length)
            .field("pieces", &format!("<{} hidden>", self.piece_count()))
            .field("length", &self.length)
            .field("files", &self.files)
            .finish()
    }
}

impl Metainfo {
    /// Resolve a source designator: magnet URI, HTTP(S) URL, raw bencoded
    /// content, or a filesystem path. A string that is both valid content
    /// and a valid path resolves as content first.
    pub async fn from_source(src: &str) -> Result<Metainfo> {
        if src.starts_with("magnet:") {
            return Self::from_magnet(src);
        }
        if src.starts_with("http:") || src.starts_with("https:") {
            let resp = reqwest::get(src).await.context("torrent fetch error")?;
            let bytes = resp.bytes().await.context("torrent fetch body error")?;
            return Self::from_bytes(&bytes);
        }
        match Self::from_bytes(src.as_bytes()) {
            Ok(metainfo) => Ok(metainfo),
            Err(_) => {
                let bytes = fs::read(src).with_context(|| format!("no torrent file: {src}"))?;
                Self::from_bytes(&bytes)
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Metainfo> {
        let mut metainfo: Metainfo =
            serde_bencode::from_bytes(bytes).context("metainfo decode error")?;
        let info = metainfo.info.as_ref().context("no 'info' dict")?;
        info.validate()?;
        metainfo.raw_info = serde_bencode::to_bytes(info).context("info encode error")?;
        let mut sha = Sha1::default();
        sha.update(&metainfo.raw_info);
        metainfo.info_hash = sha.finalize().into();
        Ok(metainfo)
    }

    /// Magnet URIs carry only the info-hash (plus optional trackers); the
    /// rest of the metadata has to be obtained from the swarm later.
    pub fn from_magnet(uri: &str) -> Result<Metainfo> {
        let uri = Url::parse(uri).context("magnet uri parse error")?;
        let xt = uri
            .query_pairs()
            .find(|(k, _)| k == "xt")
            .context("no 'xt' query param")?
            .1
            .to_string();
        let hex_ih = xt.split("urn:btih:").last().context("invalid magnet")?.to_lowercase();
        let bytes = hex::decode(&hex_ih).context("invalid magnet info hash")?;
        ensure!(bytes.len() == 20, "magnet info hash must be 20 bytes, got {}", bytes.len());
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes);
        let trackers: Vec<String> = uri
            .query_pairs()
            .filter(|(k, _)| k == "tr")
            .map(|(_, v)| v.to_string())
            .collect();
        Ok(Metainfo {
            announce: trackers.first().cloned(),
            announce_list: (trackers.len() > 1).then(|| vec![trackers]),
            comment: None,
            created_by: None,
            creation_date: None,
            encoding: None,
            info: None,
            info_hash,
            raw_info: vec![],
        })
    }

    /// Primary announce followed by the fallback tiers, deduplicated.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls = vec![];
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        for tier in self.announce_list.iter().flatten() {
            for url in tier {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }

    /// Persist the descriptor at `{dir}/{hex-info-hash}`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_bencode::to_bytes(self).context("metainfo encode error")?;
        let path = dir.join(hex::encode(self.info_hash));
        fs::write(&path, bytes).with_context(|| format!("cannot write {path:?}"))?;
        Ok(())
    }

    pub fn load(dir: &Path, info_hash: &[u8; 20]) -> Result<Metainfo> {
        let path = dir.join(hex::encode(info_hash));
        let bytes = fs::read(&path).with_context(|| format!("no saved metainfo at {path:?}"))?;
        Self::from_bytes(&bytes)
    }
}

impl Info {
    fn validate(&self) -> Result<()> {
        ensure!(self.piece_length > 0, "'piece length' must be positive");
        ensure!(
            self.pieces.len() % 20 == 0,
            "'pieces' length {} is not a multiple of 20",
            self.pieces.len()
        );
        if let Some(files) = &self.files {
            // an empty 'files' list with a 'length' is single-file mode
            if !files.is_empty() {
                ensure!(self.length.is_none(), "both 'files' and 'length' present");
                for file in files {
                    ensure!(file.length >= 0, "negative file length");
                    ensure!(!file.path.is_empty(), "empty 'path' in 'files' entry");
                }
            }
        }
        if self.files.as_ref().map_or(true, |f| f.is_empty()) {
            ensure!(self.length.is_some(), "neither 'files' nor 'length' present");
        }
        let expected = self.total_size().div_ceil(self.piece_length as u64);
        ensure!(
            self.piece_count() as u64 == expected,
            "{} pieces for {} bytes, expected {}",
            self.piece_count(),
            self.total_size(),
            expected
        );
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        match &self.files {
            Some(files) if !files.is_empty() => files.iter().map(|f| f.length as u64).sum(),
            _ => self.length.unwrap_or(0) as u64,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.pieces
            .chunks_exact(20)
            .map(|c| c.try_into().expect("chunks_exact yields 20 bytes"))
            .collect()
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        let piece_length = self.piece_length as u64;
        let offset = index as u64 * piece_length;
        (self.total_size() - offset).min(piece_length)
    }
}
