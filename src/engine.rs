//! The local storage engine the state machine materializes into.
//!
//! The production engine (B-tree over a WAL) lives outside this crate; the
//! core consumes it through [`StorageEngine`]. [`MemoryEngine`] is an
//! in-process engine for tests and for tooling that does not need
//! durability.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::command::DirEntry;

/// Search scope relative to a base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// The base entry only.
    Base,
    /// Direct children of the base, excluding the base itself.
    OneLevel,
    /// The base and everything under it. An empty base selects the whole
    /// tree.
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no such entry: {0}")]
    NoSuchEntry(String),
    #[error("attribute `{attr}` must be unique, value already held by {dn}")]
    NotUnique { attr: String, dn: String },
    #[error("invalid entry: {0}")]
    InvalidEntry(String),
    #[error("engine is closed")]
    Closed,
}

/// A transactional key-value/document store keyed by DN.
///
/// All write operations stage into a transaction and become visible at
/// `commit`; `rollback` discards. Implementations must be safe for
/// concurrent transactions.
pub trait StorageEngine: Send + Sync + 'static {
    type Tx: Send;

    fn begin(&self) -> Result<Self::Tx, EngineError>;
    fn commit(&self, tx: Self::Tx) -> Result<(), EngineError>;
    fn rollback(&self, tx: Self::Tx) -> Result<(), EngineError>;

    fn get(&self, tx: &mut Self::Tx, dn: &str) -> Result<Option<DirEntry>, EngineError>;
    fn put(&self, tx: &mut Self::Tx, entry: DirEntry) -> Result<(), EngineError>;
    fn delete(&self, tx: &mut Self::Tx, dn: &str) -> Result<(), EngineError>;

    /// All entries within `scope` of `base_dn`, in DN order.
    fn search_by_dn(
        &self,
        tx: &mut Self::Tx,
        base_dn: &str,
        scope: Scope,
    ) -> Result<Vec<DirEntry>, EngineError>;

    fn close(&self) {}
}

/// Whether `dn` falls within `scope` of `base`.
///
/// DNs are opaque case-sensitive byte strings; hierarchy is the usual
/// comma-separated RDN suffixing.
pub fn dn_in_scope(dn: &str, base: &str, scope: Scope) -> bool {
    match scope {
        Scope::Base => dn == base,
        Scope::OneLevel => match strip_base(dn, base) {
            Some(rest) => !rest.is_empty() && !rest.contains(','),
            None => false,
        },
        Scope::Subtree => dn == base || strip_base(dn, base).is_some(),
    }
}

fn strip_base<'a>(dn: &'a str, base: &str) -> Option<&'a str> {
    if base.is_empty() {
        return Some(dn);
    }
    dn.strip_suffix(base).and_then(|rest| rest.strip_suffix(','))
}

//////////////////////////////////////////////////////////////////////////////////////////////////

enum TxOp {
    Put(DirEntry),
    Delete(String),
}

/// A staged transaction against a [`MemoryEngine`].
pub struct MemoryTx {
    ops: Vec<TxOp>,
}

/// An in-memory [`StorageEngine`] over a DN-ordered map.
#[derive(Default)]
pub struct MemoryEngine {
    entries: RwLock<BTreeMap<String, DirEntry>>,
    closed: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// The effective view of `dn` under a transaction: staged ops win over
    /// committed state, last write wins within the transaction.
    fn view(&self, tx: &MemoryTx, dn: &str) -> Option<DirEntry> {
        for op in tx.ops.iter().rev() {
            match op {
                TxOp::Put(entry) if entry.dn == dn => return Some(entry.clone()),
                TxOp::Delete(deleted) if deleted == dn => return None,
                _ => {}
            }
        }
        self.entries.read().unwrap().get(dn).cloned()
    }

    fn uid_of(entry: &DirEntry) -> Option<&[u8]> {
        entry.get_attr("uid").and_then(|values| values.first()).map(|v| v.as_slice())
    }

    /// Reject a Put whose `uid` value is already held by a different DN.
    fn check_uid_unique(&self, tx: &MemoryTx, candidate: &DirEntry) -> Result<(), EngineError> {
        let uid = match Self::uid_of(candidate) {
            Some(uid) => uid,
            None => return Ok(()),
        };
        for existing in self.snapshot_view(tx) {
            if existing.dn != candidate.dn && Self::uid_of(&existing) == Some(uid) {
                return Err(EngineError::NotUnique { attr: "uid".into(), dn: existing.dn });
            }
        }
        Ok(())
    }

    fn snapshot_view(&self, tx: &MemoryTx) -> Vec<DirEntry> {
        let mut merged: BTreeMap<String, Option<DirEntry>> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(dn, entry)| (dn.clone(), Some(entry.clone())))
            .collect();
        for op in &tx.ops {
            match op {
                TxOp::Put(entry) => {
                    merged.insert(entry.dn.clone(), Some(entry.clone()));
                }
                TxOp::Delete(dn) => {
                    merged.insert(dn.clone(), None);
                }
            }
        }
        merged.into_values().flatten().collect()
    }
}

impl StorageEngine for MemoryEngine {
    type Tx = MemoryTx;

    fn begin(&self) -> Result<MemoryTx, EngineError> {
        self.check_open()?;
        Ok(MemoryTx { ops: Vec::new() })
    }

    fn commit(&self, tx: MemoryTx) -> Result<(), EngineError> {
        self.check_open()?;
        let mut entries = self.entries.write().unwrap();
        for op in tx.ops {
            match op {
                TxOp::Put(entry) => {
                    entries.insert(entry.dn.clone(), entry);
                }
                TxOp::Delete(dn) => {
                    entries.remove(&dn);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, _tx: MemoryTx) -> Result<(), EngineError> {
        Ok(())
    }

    fn get(&self, tx: &mut MemoryTx, dn: &str) -> Result<Option<DirEntry>, EngineError> {
        self.check_open()?;
        Ok(self.view(tx, dn))
    }

    fn put(&self, tx: &mut MemoryTx, entry: DirEntry) -> Result<(), EngineError> {
        self.check_open()?;
        if entry.dn.is_empty() {
            return Err(EngineError::InvalidEntry("empty dn".into()));
        }
        self.check_uid_unique(tx, &entry)?;
        tx.ops.push(TxOp::Put(entry));
        Ok(())
    }

    fn delete(&self, tx: &mut MemoryTx, dn: &str) -> Result<(), EngineError> {
        self.check_open()?;
        if self.view(tx, dn).is_none() {
            return Err(EngineError::NoSuchEntry(dn.into()));
        }
        tx.ops.push(TxOp::Delete(dn.into()));
        Ok(())
    }

    fn search_by_dn(
        &self,
        tx: &mut MemoryTx,
        base_dn: &str,
        scope: Scope,
    ) -> Result<Vec<DirEntry>, EngineError> {
        self.check_open()?;
        Ok(self
            .snapshot_view(tx)
            .into_iter()
            .filter(|entry| dn_in_scope(&entry.dn, base_dn, scope))
            .collect())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
