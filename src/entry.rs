//! Raft log entries and their on-wire/on-disk encoding.

use bytes::BufMut;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;

use crate::error::WireError;
use crate::wire::Reader;
use crate::LogId;
use crate::MessageSummary;

/// The kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An empty entry; appended by a new leader to establish its term.
    Noop,
    /// A serialized directory [`Command`](crate::command::Command).
    Command,
    /// A cluster configuration entry. The peer set is static in this
    /// release, so these are accepted and skipped on apply.
    Config,
}

impl EntryKind {
    fn as_u8(self) -> u8 {
        match self {
            EntryKind::Noop => 0,
            EntryKind::Command => 1,
            EntryKind::Config => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(EntryKind::Noop),
            1 => Ok(EntryKind::Command),
            2 => Ok(EntryKind::Config),
            _ => Err(WireError::Corrupt("unknown log entry type")),
        }
    }
}

/// A single Raft log entry.
///
/// Indexes are 1-based and contiguous; index 0 is reserved for the
/// [`sentinel`](LogEntry::sentinel) used by `prevLogIndex = 0` checks.
/// Terms are non-decreasing along the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self { index, term, kind, payload }
    }

    /// The synthetic zero entry standing in for index 0.
    pub fn sentinel() -> Self {
        Self::new(0, 0, EntryKind::Noop, Vec::new())
    }

    pub fn log_id(&self) -> LogId {
        LogId { term: self.term, index: self.index }
    }

    /// Encoded layout: `index:u64 | term:u64 | type:u8 | payloadLen:u32 | payload`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(21 + self.payload.len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.index);
        buf.put_u64_le(self.term);
        buf.put_u8(self.kind.as_u8());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let index = r.u64_le()?;
        let term = r.u64_le()?;
        let kind = EntryKind::from_u8(r.u8()?)?;
        let len = r.u32_le()? as usize;
        let payload = r.bytes(len)?.to_vec();
        Ok(Self { index, term, kind, payload })
    }
}

impl MessageSummary for LogEntry {
    fn summary(&self) -> String {
        let kind = match self.kind {
            EntryKind::Noop => "noop",
            EntryKind::Command => "command",
            EntryKind::Config => "config",
        };
        format!("{}:{}", self.log_id(), kind)
    }
}

impl MessageSummary for &[LogEntry] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.summary()).collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let entry = LogEntry::new(42, 7, EntryKind::Command, b"some payload".to_vec());
        let raw = entry.encode();
        let decoded = LogEntry::decode(&mut Reader::new(&raw)).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn sentinel_is_all_zero() {
        let s = LogEntry::sentinel();
        assert_eq!(s.index, 0);
        assert_eq!(s.term, 0);
        assert_eq!(s.kind, EntryKind::Noop);
        let decoded = LogEntry::decode(&mut Reader::new(&s.encode())).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let entry = LogEntry::new(1, 1, EntryKind::Command, vec![1, 2, 3, 4]);
        let mut raw = entry.encode();
        raw.truncate(raw.len() - 2);
        assert!(LogEntry::decode(&mut Reader::new(&raw)).is_err());
    }
}
