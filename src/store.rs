use std::{
    cmp,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use sha1::{Digest, Sha1};

use crate::metainfo::Info;

const PART_SUFFIX: &str = ".part";
const MAX_NAME_CHARS: usize = 60;

/// One backing file of the store. While the covering pieces are not yet
/// known-good the file lives under its `.part` name.
#[derive(Debug)]
struct FileEntry {
    length: u64,
    path: PathBuf,
    staging: bool,
}

impl FileEntry {
    fn active_path(&self) -> PathBuf {
        if self.staging {
            part_path(&self.path)
        } else {
            self.path.clone()
        }
    }
}

/// Maps the linear byte range `[0, total_size)` across an ordered list of
/// backing files. Backing files are opened per operation, so reads and
/// writes on distinct pieces can proceed in parallel without a shared
/// cursor.
#[derive(Debug)]
pub struct FileStore {
    entries: Vec<FileEntry>,
    offsets: Vec<u64>,
    total_size: u64,
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Append `raw` to `path` keeping only normal components. Traversal and
/// absolute segments are dropped rather than rejected, matching how peers
/// must not dictate our tree layout.
fn push_clean(path: &mut PathBuf, raw: &str) {
    for component in Path::new(raw).components() {
        if let Component::Normal(c) = component {
            path.push(c);
        }
    }
}

/// Filesystems cap name length; long base names get an ellipsis in the
/// middle so head and extension both survive.
fn shorten_name(name: &str) -> String {
    let count = name.chars().count();
    if count <= MAX_NAME_CHARS {
        return name.to_string();
    }
    let head: String = name.chars().take(MAX_NAME_CHARS / 2).collect();
    let tail: String = name.chars().skip(count - (MAX_NAME_CHARS / 2 - 1)).collect();
    format!("{head}\u{2026}{tail}")
}

impl FileStore {
    pub fn new(info: &Info, root: &Path) -> Result<FileStore> {
        let files: Vec<(u64, Vec<String>)> = match &info.files {
            Some(files) if !files.is_empty() => files
                .iter()
                .map(|f| (f.length as u64, f.path.clone()))
                .collect(),
            _ => vec![(info.total_size(), vec![])],
        };

        let mut entries = Vec::with_capacity(files.len());
        let mut offsets = Vec::with_capacity(files.len());
        let mut total_size = 0u64;
        for (length, subpath) in files {
            let mut path = root.to_path_buf();
            push_clean(&mut path, &info.name);
            for segment in &subpath {
                push_clean(&mut path, segment);
            }
            ensure!(
                path.starts_with(root) && path != root,
                "file path {path:?} escapes store root {root:?}"
            );
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let short = shorten_name(name);
                if short != name {
                    path.set_file_name(short);
                }
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {parent:?}"))?;
            }
            let staging = stage_entry(&path, length)?;
            offsets.push(total_size);
            total_size += length;
            entries.push(FileEntry { length, path, staging });
        }

        Ok(FileStore { entries, offsets, total_size })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn entry_index(&self, offset: u64) -> usize {
        self.offsets.partition_point(|&o| o <= offset) - 1
    }

    /// Fill `buf` from logical `offset`. Bytes past the end of the store
    /// are zero-filled; the return value counts only backed bytes.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut filled = 0usize;
        let mut pos = offset;
        while filled < buf.len() && pos < self.total_size {
            let i = self.entry_index(pos);
            let entry = &self.entries[i];
            let within = pos - self.offsets[i];
            let n = cmp::min((entry.length - within) as usize, buf.len() - filled);
            let path = entry.active_path();
            let mut file =
                File::open(&path).with_context(|| format!("cannot open {path:?}"))?;
            file.seek(SeekFrom::Start(within))?;
            file.read_exact(&mut buf[filled..filled + n])
                .with_context(|| format!("short read from {path:?}"))?;
            filled += n;
            pos += n as u64;
        }
        for b in &mut buf[filled..] {
            *b = 0;
        }
        Ok(filled)
    }

    /// Write `buf` at logical `offset`. A remainder past the end of the
    /// store models the protocol's zero-padding of the final piece: it must
    /// be all zero and is discarded.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut written = 0usize;
        let mut pos = offset;
        while written < buf.len() && pos < self.total_size {
            let i = self.entry_index(pos);
            let entry = &self.entries[i];
            let within = pos - self.offsets[i];
            let n = cmp::min((entry.length - within) as usize, buf.len() - written);
            let path = entry.active_path();
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("cannot open {path:?}"))?;
            file.seek(SeekFrom::Start(within))?;
            file.write_all(&buf[written..written + n])
                .with_context(|| format!("short write to {path:?}"))?;
            written += n;
            pos += n as u64;
        }
        ensure!(
            buf[written..].iter().all(|b| *b == 0),
            "non-zero write past end of store at offset {}",
            offset + written as u64
        );
        Ok(written)
    }

    /// Revert every entry from the one containing `from_offset` through the
    /// end of the store to staging, preserving contents. Called when piece
    /// hash verification fails.
    pub fn set_bad(&mut self, from_offset: u64) -> Result<()> {
        if from_offset >= self.total_size {
            return Ok(());
        }
        let start = self.entry_index(from_offset);
        for entry in &mut self.entries[start..] {
            if entry.staging {
                continue;
            }
            let part = part_path(&entry.path);
            fs::copy(&entry.path, &part)
                .with_context(|| format!("cannot stage {:?}", entry.path))?;
            fs::remove_file(&entry.path)
                .with_context(|| format!("cannot remove {:?}", entry.path))?;
            entry.staging = true;
        }
        Ok(())
    }

    /// Promote every staging entry to its final name. Best-effort: failures
    /// are logged per entry and only the last error is returned.
    pub fn cleanup(&mut self) -> Result<()> {
        let mut last_err = None;
        for entry in &mut self.entries {
            if !entry.staging {
                continue;
            }
            let part = part_path(&entry.path);
            let res = fs::copy(&part, &entry.path)
                .with_context(|| format!("cannot promote {part:?}"))
                .and_then(|_| {
                    fs::remove_file(&part).with_context(|| format!("cannot remove {part:?}"))
                });
            match res {
                Ok(()) => entry.staging = false,
                Err(e) => {
                    warn!("cleanup: {e:#}");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hash every piece against the descriptor digests. The store reverts
    /// to staging from the first bad piece onward.
    pub fn check_pieces(&mut self, info: &Info) -> Result<Vec<bool>> {
        let piece_length = info.piece_length as u64;
        let mut good = Vec::with_capacity(info.piece_count());
        let mut buf = vec![0u8; piece_length as usize];
        let mut bad_from = None;
        for (index, expected) in info.piece_hashes().into_iter().enumerate() {
            let offset = index as u64 * piece_length;
            let len = info.piece_size(index) as usize;
            self.read_at(&mut buf[..len], offset)?;
            let mut sha = Sha1::default();
            sha.update(&buf[..len]);
            let digest: [u8; 20] = sha.finalize().into();
            let ok = digest == expected;
            if !ok && bad_from.is_none() {
                bad_from = Some(offset);
            }
            good.push(ok);
        }
        if let Some(offset) = bad_from {
            self.set_bad(offset)?;
        }
        Ok(good)
    }
}

fn stage_entry(path: &Path, length: u64) -> Result<bool> {
    let part = part_path(path);
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == length => {
            // the final file is authoritative; drop any stale staging copy
            if part.exists() {
                fs::remove_file(&part)
                    .with_context(|| format!("cannot remove stale {part:?}"))?;
            }
            Ok(false)
        }
        _ => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&part)
                .with_context(|| format!("cannot create {part:?}"))?;
            file.set_len(length)
                .with_context(|| format!("cannot size {part:?}"))?;
            Ok(true)
        }
    }
}
