//! Fixed-layout binary wire codec.
//!
//! All integers are little-endian. Strings and byte blobs are carried with a
//! length prefix: `lp16` is a `u16` length followed by the bytes, `lp32`
//! likewise with a `u32` prefix; an empty string encodes as a zero prefix.
//!
//! RPCs travel in frames of `msgType:u8 | bodyLen:u32 | body`. Replies use
//! the same framing. Bodies larger than [`MAX_BODY_LEN`] are rejected to
//! bound memory; bodies shorter than their fixed header fail with a
//! corruption error, which callers treat as a protocol error on that
//! connection and never as a state change.

use bytes::BufMut;
use bytes::BytesMut;

use crate::entry::LogEntry;
use crate::error::WireError;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;

/// Upper bound on a frame body.
pub const MAX_BODY_LEN: u64 = 64 * 1024 * 1024;

/// Length of the frame header: message type byte plus body length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Message type numbers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    RequestVote = 0,
    RequestVoteReply = 1,
    AppendEntries = 2,
    AppendEntriesReply = 3,
    InstallSnapshot = 4,
    InstallSnapshotReply = 5,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(MsgType::RequestVote),
            1 => Ok(MsgType::RequestVoteReply),
            2 => Ok(MsgType::AppendEntries),
            3 => Ok(MsgType::AppendEntriesReply),
            4 => Ok(MsgType::InstallSnapshot),
            5 => Ok(MsgType::InstallSnapshotReply),
            other => Err(WireError::UnknownMsgType(other)),
        }
    }

    /// The reply type paired with a request type.
    pub fn reply_type(self) -> MsgType {
        match self {
            MsgType::RequestVote => MsgType::RequestVoteReply,
            MsgType::AppendEntries => MsgType::AppendEntriesReply,
            MsgType::InstallSnapshot => MsgType::InstallSnapshotReply,
            other => other,
        }
    }
}

/// Encode a frame header for a body of the given length.
pub fn encode_frame_header(msg: MsgType, body_len: usize) -> [u8; FRAME_HEADER_LEN] {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    hdr[0] = msg as u8;
    hdr[1..5].copy_from_slice(&(body_len as u32).to_le_bytes());
    hdr
}

/// Decode a frame header, enforcing the body length bound.
pub fn decode_frame_header(hdr: &[u8; FRAME_HEADER_LEN]) -> Result<(MsgType, usize), WireError> {
    let msg = MsgType::from_u8(hdr[0])?;
    let len = u32::from_le_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as u64;
    if len > MAX_BODY_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    Ok((msg, len as usize))
}

/// A bounds-checked cursor over a message body.
///
/// Every accessor fails with a corruption error instead of panicking when
/// the buffer is shorter than the layout requires.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Corrupt("body shorter than its fixed layout"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_le(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_le(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    pub fn lp16_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u16_le()? as usize;
        self.take(len)
    }

    pub fn lp16_str(&mut self) -> Result<String, WireError> {
        let raw = self.lp16_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Corrupt("invalid utf-8 string"))
    }

    pub fn lp32_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32_le()? as usize;
        self.take(len)
    }
}

pub(crate) fn put_lp16(buf: &mut BytesMut, raw: &[u8]) {
    debug_assert!(raw.len() <= u16::MAX as usize);
    buf.put_u16_le(raw.len() as u16);
    buf.put_slice(raw);
}

pub(crate) fn put_lp32(buf: &mut BytesMut, raw: &[u8]) {
    debug_assert!(raw.len() <= u32::MAX as usize);
    buf.put_u32_le(raw.len() as u32);
    buf.put_slice(raw);
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// RPC bodies.

impl VoteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.candidate_id);
        buf.put_u64_le(self.last_log_index);
        buf.put_u64_le(self.last_log_term);
        buf.to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(Self {
            term: r.u64_le()?,
            candidate_id: r.u64_le()?,
            last_log_index: r.u64_le()?,
            last_log_term: r.u64_le()?,
        })
    }
}

impl VoteResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64_le(self.term);
        buf.put_u8(self.vote_granted as u8);
        buf.to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(Self {
            term: r.u64_le()?,
            vote_granted: r.u8()? != 0,
        })
    }
}

impl AppendEntriesRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(48);
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.leader_id);
        buf.put_u64_le(self.prev_log_index);
        buf.put_u64_le(self.prev_log_term);
        buf.put_u64_le(self.entries.len() as u64);
        buf.put_u64_le(self.leader_commit);
        for entry in &self.entries {
            let raw = entry.encode();
            put_lp32(&mut buf, &raw);
        }
        buf.to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        let term = r.u64_le()?;
        let leader_id = r.u64_le()?;
        let prev_log_index = r.u64_le()?;
        let prev_log_term = r.u64_le()?;
        let count = r.u64_le()?;
        let leader_commit = r.u64_le()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let raw = r.lp32_bytes()?;
            entries.push(LogEntry::decode(&mut Reader::new(raw))?);
        }
        Ok(Self {
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        })
    }
}

impl AppendEntriesResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(25);
        buf.put_u64_le(self.term);
        buf.put_u8(self.success as u8);
        buf.put_u64_le(self.conflict_term);
        buf.put_u64_le(self.conflict_index);
        buf.to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(Self {
            term: r.u64_le()?,
            success: r.u8()? != 0,
            conflict_term: r.u64_le()?,
            conflict_index: r.u64_le()?,
        })
    }
}

impl InstallSnapshotRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(36 + self.data.len());
        buf.put_u64_le(self.term);
        buf.put_u64_le(self.leader_id);
        buf.put_u64_le(self.last_included_index);
        buf.put_u64_le(self.last_included_term);
        put_lp32(&mut buf, &self.data);
        buf.to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(Self {
            term: r.u64_le()?,
            leader_id: r.u64_le()?,
            last_included_index: r.u64_le()?,
            last_included_term: r.u64_le()?,
            data: r.lp32_bytes()?.to_vec(),
        })
    }
}

impl InstallSnapshotResponse {
    pub fn encode(&self) -> Vec<u8> {
        self.term.to_le_bytes().to_vec()
    }

    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(body);
        Ok(Self { term: r.u64_le()? })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::EntryKind;

    #[test]
    fn vote_request_round_trip() {
        let rpc = VoteRequest {
            term: 7,
            candidate_id: 2,
            last_log_index: 19,
            last_log_term: 6,
        };
        let decoded = VoteRequest::decode(&rpc.encode()).unwrap();
        assert_eq!(rpc, decoded);
    }

    #[test]
    fn vote_response_round_trip() {
        for granted in [true, false] {
            let rpc = VoteResponse { term: 3, vote_granted: granted };
            assert_eq!(rpc, VoteResponse::decode(&rpc.encode()).unwrap());
        }
    }

    #[test]
    fn append_entries_round_trip() {
        let rpc = AppendEntriesRequest {
            term: 4,
            leader_id: 1,
            prev_log_index: 11,
            prev_log_term: 3,
            entries: vec![
                LogEntry::new(12, 4, EntryKind::Noop, Vec::new()),
                LogEntry::new(13, 4, EntryKind::Command, b"payload".to_vec()),
            ],
            leader_commit: 11,
        };
        let decoded = AppendEntriesRequest::decode(&rpc.encode()).unwrap();
        assert_eq!(rpc, decoded);
    }

    #[test]
    fn empty_heartbeat_round_trip() {
        let rpc = AppendEntriesRequest {
            term: 2,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        };
        let decoded = AppendEntriesRequest::decode(&rpc.encode()).unwrap();
        assert_eq!(rpc, decoded);
    }

    #[test]
    fn append_entries_response_round_trip() {
        let rpc = AppendEntriesResponse {
            term: 9,
            success: false,
            conflict_term: 4,
            conflict_index: 17,
        };
        assert_eq!(rpc, AppendEntriesResponse::decode(&rpc.encode()).unwrap());
    }

    #[test]
    fn install_snapshot_round_trip() {
        let rpc = InstallSnapshotRequest {
            term: 5,
            leader_id: 1,
            last_included_index: 100,
            last_included_term: 4,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        assert_eq!(rpc, InstallSnapshotRequest::decode(&rpc.encode()).unwrap());
        let reply = InstallSnapshotResponse { term: 5 };
        assert_eq!(reply, InstallSnapshotResponse::decode(&reply.encode()).unwrap());
    }

    #[test]
    fn short_body_is_corruption_not_panic() {
        assert!(matches!(
            VoteRequest::decode(&[1, 2, 3]),
            Err(WireError::Corrupt(_))
        ));
        assert!(matches!(
            AppendEntriesResponse::decode(&[0; 8]),
            Err(WireError::Corrupt(_))
        ));
        // A truncated entry list inside an otherwise well-formed header.
        let mut body = AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, EntryKind::Noop, Vec::new())],
            leader_commit: 0,
        }
        .encode();
        body.truncate(body.len() - 3);
        assert!(matches!(
            AppendEntriesRequest::decode(&body),
            Err(WireError::Corrupt(_))
        ));
    }

    #[test]
    fn frame_header_bounds() {
        let hdr = encode_frame_header(MsgType::AppendEntries, 42);
        let (msg, len) = decode_frame_header(&hdr).unwrap();
        assert_eq!(msg, MsgType::AppendEntries);
        assert_eq!(len, 42);

        let mut big = encode_frame_header(MsgType::AppendEntries, 0);
        big[1..5].copy_from_slice(&(MAX_BODY_LEN as u32 + 1).to_le_bytes());
        assert!(matches!(decode_frame_header(&big), Err(WireError::FrameTooLarge(_))));

        let mut bad = hdr;
        bad[0] = 99;
        assert!(matches!(decode_frame_header(&bad), Err(WireError::UnknownMsgType(99))));
    }
}
