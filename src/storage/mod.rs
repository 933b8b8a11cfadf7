//! Durable Raft state: term/vote, the log, apply progress and snapshots.
//!
//! File layout inside the node's data dir:
//!
//! ```text
//! {data_dir}/
//! ├── term.dat           # currentTerm:u64 | votedFor:u64 (0 = none)
//! ├── last_applied.dat   # lastApplied:u64, written via tmp + rename
//! ├── raft.log           # append-only log entries
//! ├── snapshot.meta      # pointer to the latest snapshot
//! └── snapshot-<i>-<t>.snap
//! ```

mod log;
mod snapshot;

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::RwLock;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::entry::LogEntry;
use crate::LogId;
use crate::NodeId;

pub use snapshot::SnapshotData;
pub use snapshot::SnapshotMeta;

const TERM_FILE: &str = "term.dat";
const LAST_APPLIED_FILE: &str = "last_applied.dat";

/// The hard state of a Raft node: what must be durable before any reply
/// that depends on it leaves the node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Everything a node recovers from disk at startup.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub hard_state: HardState,
    pub last_log_id: LogId,
    pub last_applied: u64,
    pub snapshot: Option<SnapshotMeta>,
}

/// The node's persistent store.
///
/// Log access takes its own lock so appends and reads never contend with
/// term/vote persistence.
pub struct RaftStore {
    data_dir: PathBuf,
    log: RwLock<log::RaftLog>,
    hard_state: Mutex<HardState>,
    last_applied: Mutex<u64>,
    snapshots: snapshot::SnapshotStore,
}

impl RaftStore {
    /// Open the store, recovering all persistent state.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;

        let hard_state = read_term_file(&data_dir.join(TERM_FILE))
            .context("reading term.dat")?;
        let last_applied = read_u64_file(&data_dir.join(LAST_APPLIED_FILE))
            .context("reading last_applied.dat")?
            .unwrap_or(0);
        let snapshots = snapshot::SnapshotStore::open(data_dir).context("opening snapshot store")?;
        let snapshot_last = snapshots.meta().map(|m| m.last_included).unwrap_or_default();
        let log = log::RaftLog::open(data_dir, snapshot_last).context("opening raft log")?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            log: RwLock::new(log),
            hard_state: Mutex::new(hard_state),
            last_applied: Mutex::new(last_applied),
            snapshots,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn initial_state(&self) -> InitialState {
        InitialState {
            hard_state: self.hard_state(),
            last_log_id: self.last_log_id(),
            last_applied: self.last_applied(),
            snapshot: self.snapshots.meta(),
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Term and vote.

    pub fn hard_state(&self) -> HardState {
        *self.hard_state.lock().unwrap()
    }

    pub fn save_hard_state(&self, hs: &HardState) -> anyhow::Result<()> {
        let mut guard = self.hard_state.lock().unwrap();
        let path = self.data_dir.join(TERM_FILE);
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&hs.current_term.to_le_bytes());
        raw[8..16].copy_from_slice(&hs.voted_for.unwrap_or(0).to_le_bytes());
        let mut f = File::create(&path).context("writing term.dat")?;
        f.write_all(&raw)?;
        f.sync_all()?;
        *guard = *hs;
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Apply progress.

    pub fn last_applied(&self) -> u64 {
        *self.last_applied.lock().unwrap()
    }

    /// Persist `last_applied` atomically: a torn write can never advance it
    /// past committed state.
    pub fn save_last_applied(&self, value: u64) -> anyhow::Result<()> {
        let mut guard = self.last_applied.lock().unwrap();
        let tmp = self.data_dir.join("last_applied.tmp");
        {
            let mut f = File::create(&tmp).context("writing last_applied.tmp")?;
            f.write_all(&value.to_le_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, self.data_dir.join(LAST_APPLIED_FILE))
            .context("renaming last_applied.dat")?;
        *guard = value;
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Log.

    pub fn append(&self, entries: &[LogEntry]) -> anyhow::Result<()> {
        self.log.write().unwrap().append(entries).context("appending to raft log")
    }

    /// The entry at `index`; index 0 answers with the zero sentinel.
    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return Some(LogEntry::sentinel());
        }
        self.log.read().unwrap().get(index).cloned()
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.log.read().unwrap().term_at(index)
    }

    pub fn last_log_id(&self) -> LogId {
        self.log.read().unwrap().last_log_id()
    }

    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        self.log.read().unwrap().get_from(index, max)
    }

    pub fn log_len(&self) -> u64 {
        self.log.read().unwrap().len()
    }

    pub fn first_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.read().unwrap().first_index_of_term(term)
    }

    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log.read().unwrap().last_index_of_term(term)
    }

    pub fn truncate_from(&self, index: u64) -> anyhow::Result<()> {
        self.log.write().unwrap().truncate_from(index).context("truncating raft log suffix")
    }

    //////////////////////////////////////////////////////////////////////////
    // Snapshots.

    pub fn snapshot_last(&self) -> LogId {
        self.log.read().unwrap().snapshot_last()
    }

    pub fn snapshot_meta(&self) -> Option<SnapshotMeta> {
        self.snapshots.meta()
    }

    pub fn load_snapshot(&self) -> anyhow::Result<Option<SnapshotData>> {
        self.snapshots.load().context("loading snapshot")
    }

    /// Persist a snapshot taken locally and prefix-truncate the log at its
    /// boundary.
    pub fn save_snapshot(&self, last: LogId, data: &[u8]) -> anyhow::Result<()> {
        self.snapshots.save(last, data).context("saving snapshot")?;
        self.log.write().unwrap().compact(last).context("compacting raft log")
    }

    /// Record a snapshot received from the leader: save it, drop every log
    /// entry it covers, and jump `last_applied` forward to its boundary.
    pub fn install_snapshot(&self, last: LogId, data: &[u8]) -> anyhow::Result<()> {
        self.snapshots.save(last, data).context("saving installed snapshot")?;
        self.log.write().unwrap().compact(last).context("compacting raft log")?;
        self.save_last_applied(last.index)
    }
}

fn read_term_file(path: &Path) -> anyhow::Result<HardState> {
    if !path.exists() {
        return Ok(HardState::default());
    }
    let mut raw = [0u8; 16];
    let mut f = File::open(path)?;
    f.read_exact(&mut raw)?;
    let voted_for = u64::from_le_bytes(raw[8..16].try_into().unwrap());
    Ok(HardState {
        current_term: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
        voted_for: if voted_for == 0 { None } else { Some(voted_for) },
    })
}

fn read_u64_file(path: &Path) -> anyhow::Result<Option<u64>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut raw = [0u8; 8];
    let mut f = File::open(path)?;
    f.read_exact(&mut raw)?;
    Ok(Some(u64::from_le_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::EntryKind;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, EntryKind::Command, vec![index as u8])
    }

    #[test]
    fn pristine_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RaftStore::open(dir.path()).unwrap();
        let init = store.initial_state();
        assert_eq!(init.hard_state, HardState::default());
        assert_eq!(init.last_log_id, LogId::default());
        assert_eq!(init.last_applied, 0);
        assert!(init.snapshot.is_none());
        assert_eq!(store.entry(0), Some(LogEntry::sentinel()));
    }

    #[test]
    fn hard_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RaftStore::open(dir.path()).unwrap();
            store
                .save_hard_state(&HardState { current_term: 5, voted_for: Some(2) })
                .unwrap();
        }
        let store = RaftStore::open(dir.path()).unwrap();
        assert_eq!(
            store.hard_state(),
            HardState { current_term: 5, voted_for: Some(2) }
        );
    }

    #[test]
    fn last_applied_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RaftStore::open(dir.path()).unwrap();
            store.save_last_applied(17).unwrap();
        }
        let store = RaftStore::open(dir.path()).unwrap();
        assert_eq!(store.last_applied(), 17);
    }

    #[test]
    fn install_snapshot_jumps_applied_and_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = RaftStore::open(dir.path()).unwrap();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        store.install_snapshot(LogId::new(2, 5), b"machine state").unwrap();

        assert_eq!(store.last_applied(), 5);
        assert_eq!(store.snapshot_last(), LogId::new(2, 5));
        assert_eq!(store.entry(3), None);
        assert_eq!(store.term_at(5), Some(2));
        assert_eq!(store.last_log_id(), LogId::new(2, 5));

        // Recovery sees the snapshot, the applied jump, and no stale log.
        drop(store);
        let store = RaftStore::open(dir.path()).unwrap();
        let init = store.initial_state();
        assert_eq!(init.last_applied, 5);
        assert_eq!(init.snapshot.unwrap().last_included, LogId::new(2, 5));
        assert_eq!(store.log_len(), 0);
        assert_eq!(store.load_snapshot().unwrap().unwrap().data, b"machine state");
    }
}
