//! The append-only Raft log file.
//!
//! Entries are stored back to back in their wire encoding
//! (`index | term | type | payloadLen | payload`); an in-memory copy plus
//! per-entry file offsets make random access and suffix truncation cheap.
//! Reopening scans the file and truncates back to the last complete entry —
//! a torn tail is safe to drop because such entries were never acknowledged.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bytes::BytesMut;

use crate::entry::LogEntry;
use crate::wire::Reader;
use crate::LogId;

pub(crate) const LOG_FILE: &str = "raft.log";

pub(crate) struct RaftLog {
    path: PathBuf,
    file: File,
    /// Entries currently held, starting right after the snapshot boundary.
    entries: Vec<LogEntry>,
    /// File offset of each entry in `entries`.
    offsets: Vec<u64>,
    /// The log id covered by the latest snapshot; `(0,0)` when none.
    snapshot_last: LogId,
}

impl RaftLog {
    /// Open (or create) the log file and rebuild the in-memory index.
    pub fn open(dir: &Path, snapshot_last: LogId) -> std::io::Result<Self> {
        let path = dir.join(LOG_FILE);
        let mut file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut r = Reader::new(&raw);
        let mut good = 0u64;
        while !r.is_empty() {
            match LogEntry::decode(&mut r) {
                Ok(entry) => {
                    offsets.push(good);
                    good = (raw.len() - r.remaining()) as u64;
                    entries.push(entry);
                }
                Err(err) => {
                    tracing::warn!(error=%err, offset=good, "truncating torn tail of raft log");
                    break;
                }
            }
        }
        // `good` is the end of the last complete entry; anything beyond is a
        // torn write from a crash mid-append.
        if good < raw.len() as u64 {
            file.set_len(good)?;
            file.sync_all()?;
        }

        // Drop any entries the snapshot already covers; they can linger if
        // the process died between snapshot save and log compaction.
        let retained: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.index > snapshot_last.index)
            .map(|(i, _)| i)
            .collect();
        if retained.len() != entries.len() {
            let keep: Vec<LogEntry> =
                retained.iter().map(|&i| entries[i].clone()).collect();
            let mut log = Self { path, file, entries: Vec::new(), offsets: Vec::new(), snapshot_last };
            log.rewrite(keep)?;
            return Ok(log);
        }

        Ok(Self { path, file, entries, offsets, snapshot_last })
    }

    pub fn snapshot_last(&self) -> LogId {
        self.snapshot_last
    }

    /// Number of entries currently held (excluding those folded into the
    /// snapshot).
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_log_id(&self) -> LogId {
        self.entries.last().map(|e| e.log_id()).unwrap_or(self.snapshot_last)
    }

    /// The term at `index`. Index 0 is the zero sentinel; the snapshot
    /// boundary answers with the snapshot's term; indexes outside the held
    /// range return `None`.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last.index {
            return Some(self.snapshot_last.term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        let first = self.first_index()?;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    fn first_index(&self) -> Option<u64> {
        self.entries.first().map(|e| e.index)
    }

    /// The suffix starting at `index`, capped at `max` entries.
    pub fn get_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let first = match self.first_index() {
            Some(f) => f,
            None => return Vec::new(),
        };
        let start = index.max(first);
        let last = self.last_log_id().index;
        if start > last {
            return Vec::new();
        }
        let lo = (start - first) as usize;
        let hi = self.entries.len().min(lo + max);
        self.entries[lo..hi].to_vec()
    }

    /// The first index in the held log carrying `term`, for conflict hints.
    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.term == term).map(|e| e.index)
    }

    /// The last index in the held log carrying `term`, for the leader-side
    /// conflict fast path.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries.iter().rev().find(|e| e.term == term).map(|e| e.index)
    }

    /// Append entries and make them durable before returning.
    pub fn append(&mut self, entries: &[LogEntry]) -> std::io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        let mut offset = self.file_len();
        for entry in entries {
            self.offsets.push(offset);
            let before = buf.len();
            entry.encode_into(&mut buf);
            offset += (buf.len() - before) as u64;
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn file_len(&self) -> u64 {
        match (self.offsets.last(), self.entries.last()) {
            // 21 bytes of fixed header ahead of each payload.
            (Some(&off), Some(entry)) => off + 21 + entry.payload.len() as u64,
            _ => 0,
        }
    }

    /// Delete `index..` from the log, durably.
    pub fn truncate_from(&mut self, index: u64) -> std::io::Result<()> {
        let first = match self.first_index() {
            Some(f) => f,
            None => return Ok(()),
        };
        if index > self.last_log_id().index {
            return Ok(());
        }
        let keep = index.saturating_sub(first) as usize;
        let cut_at = self.offsets.get(keep).copied().unwrap_or(0);
        self.file.set_len(cut_at)?;
        self.file.sync_all()?;
        self.file.seek(SeekFrom::End(0))?;
        self.entries.truncate(keep);
        self.offsets.truncate(keep);
        Ok(())
    }

    /// Drop every entry at or below `snapshot_last.index` and record the new
    /// snapshot boundary. The file is rewritten and swapped atomically.
    pub fn compact(&mut self, snapshot_last: LogId) -> std::io::Result<()> {
        self.snapshot_last = snapshot_last;
        let keep: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|e| e.index > snapshot_last.index)
            .cloned()
            .collect();
        self.rewrite(keep)
    }

    fn rewrite(&mut self, entries: Vec<LogEntry>) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let mut buf = BytesMut::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            offsets.push(buf.len() as u64);
            entry.encode_into(&mut buf);
        }
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.entries = entries;
        self.offsets = offsets;
        Ok(())
    }
}
