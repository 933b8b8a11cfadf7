//! On-disk snapshot store.
//!
//! The store owns one `snapshot-<index>-<term>.snap` file per saved snapshot
//! plus a single `snapshot.meta` pointer (24 bytes:
//! `lastIncludedIndex | lastIncludedTerm | size`). Save writes and fsyncs the
//! snapshot file first, then swaps the pointer atomically, so a crash at any
//! point leaves either the old snapshot or the new one — never a torn mix.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::LogId;

const META_FILE: &str = "snapshot.meta";
const META_LEN: usize = 24;

/// Metadata of the latest snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included: LogId,
    pub size: u64,
}

/// A fully loaded snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub last_included: LogId,
    pub data: Vec<u8>,
}

pub(crate) struct SnapshotStore {
    dir: PathBuf,
    meta: Mutex<Option<SnapshotMeta>>,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        let meta_path = dir.join(META_FILE);
        let meta = if meta_path.exists() {
            let mut raw = [0u8; META_LEN];
            let mut f = File::open(&meta_path)?;
            f.read_exact(&mut raw)?;
            Some(SnapshotMeta {
                last_included: LogId {
                    index: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
                    term: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
                },
                size: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            })
        } else {
            None
        };
        Ok(Self { dir: dir.to_path_buf(), meta: Mutex::new(meta) })
    }

    pub fn meta(&self) -> Option<SnapshotMeta> {
        *self.meta.lock().unwrap()
    }

    fn snap_path(&self, last: LogId) -> PathBuf {
        self.dir.join(format!("snapshot-{}-{}.snap", last.index, last.term))
    }

    /// Persist a new snapshot and swing the meta pointer to it.
    pub fn save(&self, last: LogId, data: &[u8]) -> std::io::Result<()> {
        let path = self.snap_path(last);
        {
            let mut f = File::create(&path)?;
            f.write_all(&last.index.to_le_bytes())?;
            f.write_all(&last.term.to_le_bytes())?;
            f.write_all(&(data.len() as u64).to_le_bytes())?;
            f.write_all(data)?;
            f.sync_all()?;
        }

        let meta = SnapshotMeta { last_included: last, size: data.len() as u64 };
        let tmp = self.dir.join("snapshot.meta.tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&last.index.to_le_bytes())?;
            f.write_all(&last.term.to_le_bytes())?;
            f.write_all(&meta.size.to_le_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(META_FILE))?;

        let old = self.meta.lock().unwrap().replace(meta);

        // Best-effort cleanup of the superseded snapshot file.
        if let Some(old) = old {
            if old.last_included != last {
                let _ = std::fs::remove_file(self.snap_path(old.last_included));
            }
        }
        Ok(())
    }

    /// Load the snapshot the meta pointer references. An absent meta file
    /// means "no snapshot".
    pub fn load(&self) -> std::io::Result<Option<SnapshotData>> {
        let meta = match self.meta() {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let mut f = File::open(self.snap_path(meta.last_included))?;
        let mut header = [0u8; 24];
        f.read_exact(&mut header)?;
        let index = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let term = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let len = u64::from_le_bytes(header[16..24].try_into().unwrap());
        if (LogId { index, term }) != meta.last_included || len != meta.size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "snapshot file disagrees with snapshot.meta",
            ));
        }
        let mut data = vec![0u8; len as usize];
        f.read_exact(&mut data)?;
        Ok(Some(SnapshotData { last_included: meta.last_included, data }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn absent_meta_means_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.meta(), None);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save(LogId::new(3, 40), b"state bytes").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_included, LogId::new(3, 40));
        assert_eq!(loaded.data, b"state bytes");

        // Pointer survives reopen.
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.meta().unwrap().last_included, LogId::new(3, 40));
        assert_eq!(store.load().unwrap().unwrap().data, b"state bytes");
    }

    #[test]
    fn newer_snapshot_replaces_older() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        store.save(LogId::new(1, 10), b"old").unwrap();
        store.save(LogId::new(2, 25), b"new").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_included, LogId::new(2, 25));
        assert_eq!(loaded.data, b"new");
        assert!(!dir.path().join("snapshot-10-1.snap").exists());
    }
}
