//! Directory commands carried in the Raft log, and their payload types.
//!
//! A command is the unit of replication: the leader serializes one of these
//! into a log entry payload, and every node's state machine deserializes and
//! applies it in commit order.

use std::collections::BTreeMap;

use bytes::BufMut;
use bytes::BytesMut;

use crate::error::WireError;
use crate::wire::put_lp16;
use crate::wire::put_lp32;
use crate::wire::Reader;

/// Which local storage engine a Put/Delete targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseId {
    /// The main directory tree.
    Main,
    /// The optional log/audit database. Nodes without a second engine
    /// configured apply these commands as no-ops.
    Log,
}

impl DatabaseId {
    fn as_u8(self) -> u8 {
        match self {
            DatabaseId::Main => 0,
            DatabaseId::Log => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(DatabaseId::Main),
            1 => Ok(DatabaseId::Log),
            _ => Err(WireError::Corrupt("unknown database id")),
        }
    }
}

/// A directory entry: a DN plus a map from attribute name to an ordered
/// sequence of values.
///
/// DNs are opaque, case-sensitive byte strings. Attribute names are
/// compared case-insensitively by every consumer, and the encoding does not
/// depend on the map's iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    pub dn: String,
    pub attrs: BTreeMap<String, Vec<Vec<u8>>>,
}

impl DirEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self { dn: dn.into(), attrs: BTreeMap::new() }
    }

    /// Builder-style attribute insertion with string values.
    pub fn attr(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.attrs.insert(
            name.into(),
            values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        );
        self
    }

    /// Look up an attribute by case-insensitive name.
    pub fn get_attr(&self, name: &str) -> Option<&Vec<Vec<u8>>> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Layout: `dnLen:u16 | dn | attrCount:u16 |
    /// (nameLen:u16 | name | valueCount:u16 | (valueLen:u32 | value)*)*`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        put_lp16(&mut buf, self.dn.as_bytes());
        buf.put_u16_le(self.attrs.len() as u16);
        for (name, values) in &self.attrs {
            put_lp16(&mut buf, name.as_bytes());
            buf.put_u16_le(values.len() as u16);
            for value in values {
                put_lp32(&mut buf, value);
            }
        }
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(raw);
        let dn = r.lp16_str()?;
        let attr_count = r.u16_le()?;
        let mut attrs = BTreeMap::new();
        for _ in 0..attr_count {
            let name = r.lp16_str()?;
            let value_count = r.u16_le()?;
            let mut values = Vec::with_capacity(value_count as usize);
            for _ in 0..value_count {
                values.push(r.lp32_bytes()?.to_vec());
            }
            attrs.insert(name, values);
        }
        Ok(Self { dn, attrs })
    }
}

/// A configuration update distributed through the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChange {
    pub section: String,
    pub version: u64,
    pub data: BTreeMap<String, String>,
}

impl ConfigChange {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(32);
        put_lp16(&mut buf, self.section.as_bytes());
        buf.put_u64_le(self.version);
        buf.put_u16_le(self.data.len() as u16);
        for (key, value) in &self.data {
            put_lp16(&mut buf, key.as_bytes());
            put_lp16(&mut buf, value.as_bytes());
        }
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(raw);
        let section = r.lp16_str()?;
        let version = r.u64_le()?;
        let count = r.u16_le()?;
        let mut data = BTreeMap::new();
        for _ in 0..count {
            let key = r.lp16_str()?;
            let value = r.lp16_str()?;
            data.insert(key, value);
        }
        Ok(Self { section, version, data })
    }
}

/// The access granted by an ACL rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    None,
    Read,
    Write,
    Full,
}

impl AccessLevel {
    fn as_u8(self) -> u8 {
        match self {
            AccessLevel::None => 0,
            AccessLevel::Read => 1,
            AccessLevel::Write => 2,
            AccessLevel::Full => 3,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(AccessLevel::None),
            1 => Ok(AccessLevel::Read),
            2 => Ok(AccessLevel::Write),
            3 => Ok(AccessLevel::Full),
            _ => Err(WireError::Corrupt("unknown access level")),
        }
    }
}

/// A single access-control rule: `subject` gets `access` on the subtree at
/// `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub id: u64,
    pub target: String,
    pub subject: String,
    pub access: AccessLevel,
}

impl AclRule {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        put_lp16(buf, self.target.as_bytes());
        put_lp16(buf, self.subject.as_bytes());
        buf.put_u8(self.access.as_u8());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            id: r.u64_le()?,
            target: r.lp16_str()?,
            subject: r.lp16_str()?,
            access: AccessLevel::from_u8(r.u8()?)?,
        })
    }
}

/// A replicated directory command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Put { db: DatabaseId, entry: DirEntry },
    Delete { db: DatabaseId, dn: String },
    ModifyDn { old_dn: String, entry: DirEntry },
    ConfigUpdate(ConfigChange),
    AclFullUpdate(Vec<AclRule>),
    AclAddRule(AclRule),
    AclUpdateRule(AclRule),
    AclDeleteRule(u64),
    AclSetDefault(AccessLevel),
}

const CMD_PUT: u8 = 0;
const CMD_DELETE: u8 = 1;
const CMD_MODIFY_DN: u8 = 2;
const CMD_CONFIG_UPDATE: u8 = 3;
const CMD_ACL_FULL_UPDATE: u8 = 4;
const CMD_ACL_ADD_RULE: u8 = 5;
const CMD_ACL_UPDATE_RULE: u8 = 6;
const CMD_ACL_DELETE_RULE: u8 = 7;
const CMD_ACL_SET_DEFAULT: u8 = 8;

impl Command {
    /// Fixed record layout shared by all variants:
    /// `type:u8 | databaseId:u8 | dn:lp16 | oldDn:lp16 | entryDn:lp16 |
    /// entryData:lp32`. Fields a variant does not use encode empty.
    pub fn encode(&self) -> Vec<u8> {
        let (ty, db, dn, old_dn, entry_dn, data): (u8, DatabaseId, &str, &str, &str, Vec<u8>) =
            match self {
                Command::Put { db, entry } => {
                    (CMD_PUT, *db, entry.dn.as_str(), "", "", entry.encode())
                }
                Command::Delete { db, dn } => (CMD_DELETE, *db, dn.as_str(), "", "", Vec::new()),
                Command::ModifyDn { old_dn, entry } => (
                    CMD_MODIFY_DN,
                    DatabaseId::Main,
                    "",
                    old_dn.as_str(),
                    entry.dn.as_str(),
                    entry.encode(),
                ),
                Command::ConfigUpdate(change) => {
                    (CMD_CONFIG_UPDATE, DatabaseId::Main, "", "", "", change.encode())
                }
                Command::AclFullUpdate(rules) => {
                    let mut buf = BytesMut::with_capacity(16);
                    buf.put_u16_le(rules.len() as u16);
                    for rule in rules {
                        rule.encode_into(&mut buf);
                    }
                    (CMD_ACL_FULL_UPDATE, DatabaseId::Main, "", "", "", buf.to_vec())
                }
                Command::AclAddRule(rule) => {
                    let mut buf = BytesMut::with_capacity(32);
                    rule.encode_into(&mut buf);
                    (CMD_ACL_ADD_RULE, DatabaseId::Main, "", "", "", buf.to_vec())
                }
                Command::AclUpdateRule(rule) => {
                    let mut buf = BytesMut::with_capacity(32);
                    rule.encode_into(&mut buf);
                    (CMD_ACL_UPDATE_RULE, DatabaseId::Main, "", "", "", buf.to_vec())
                }
                Command::AclDeleteRule(id) => (
                    CMD_ACL_DELETE_RULE,
                    DatabaseId::Main,
                    "",
                    "",
                    "",
                    id.to_le_bytes().to_vec(),
                ),
                Command::AclSetDefault(access) => (
                    CMD_ACL_SET_DEFAULT,
                    DatabaseId::Main,
                    "",
                    "",
                    "",
                    vec![access.as_u8()],
                ),
            };

        let mut buf = BytesMut::with_capacity(12 + dn.len() + old_dn.len() + data.len());
        buf.put_u8(ty);
        buf.put_u8(db.as_u8());
        put_lp16(&mut buf, dn.as_bytes());
        put_lp16(&mut buf, old_dn.as_bytes());
        put_lp16(&mut buf, entry_dn.as_bytes());
        put_lp32(&mut buf, &data);
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(raw);
        let ty = r.u8()?;
        let db = DatabaseId::from_u8(r.u8()?)?;
        let dn = r.lp16_str()?;
        let old_dn = r.lp16_str()?;
        let _entry_dn = r.lp16_str()?;
        let data = r.lp32_bytes()?;

        match ty {
            CMD_PUT => Ok(Command::Put { db, entry: DirEntry::decode(data)? }),
            CMD_DELETE => Ok(Command::Delete { db, dn }),
            CMD_MODIFY_DN => Ok(Command::ModifyDn { old_dn, entry: DirEntry::decode(data)? }),
            CMD_CONFIG_UPDATE => Ok(Command::ConfigUpdate(ConfigChange::decode(data)?)),
            CMD_ACL_FULL_UPDATE => {
                let mut r = Reader::new(data);
                let count = r.u16_le()?;
                let mut rules = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rules.push(AclRule::decode(&mut r)?);
                }
                Ok(Command::AclFullUpdate(rules))
            }
            CMD_ACL_ADD_RULE => Ok(Command::AclAddRule(AclRule::decode(&mut Reader::new(data))?)),
            CMD_ACL_UPDATE_RULE => {
                Ok(Command::AclUpdateRule(AclRule::decode(&mut Reader::new(data))?))
            }
            CMD_ACL_DELETE_RULE => {
                Ok(Command::AclDeleteRule(Reader::new(data).u64_le()?))
            }
            CMD_ACL_SET_DEFAULT => Ok(Command::AclSetDefault(AccessLevel::from_u8(
                Reader::new(data).u8()?,
            )?)),
            _ => Err(WireError::Corrupt("unknown command type")),
        }
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_entry() -> DirEntry {
        DirEntry::new("cn=alice,dc=example,dc=org")
            .attr("cn", &["alice"])
            .attr("uid", &["alice"])
            .attr("objectClass", &["person", "inetOrgPerson"])
    }

    #[test]
    fn dir_entry_round_trip() {
        let entry = sample_entry();
        assert_eq!(entry, DirEntry::decode(&entry.encode()).unwrap());
    }

    #[test]
    fn dir_entry_empty_round_trip() {
        let entry = DirEntry::new("");
        assert_eq!(entry, DirEntry::decode(&entry.encode()).unwrap());
    }

    #[test]
    fn attr_lookup_is_case_insensitive() {
        let entry = sample_entry();
        assert!(entry.get_attr("UID").is_some());
        assert!(entry.get_attr("ObjectClass").is_some());
        assert!(entry.get_attr("missing").is_none());
    }

    #[test]
    fn command_round_trips() {
        let rule = AclRule {
            id: 3,
            target: "ou=people,dc=example,dc=org".into(),
            subject: "cn=admin,dc=example,dc=org".into(),
            access: AccessLevel::Write,
        };
        let commands = vec![
            Command::Put { db: DatabaseId::Main, entry: sample_entry() },
            Command::Put { db: DatabaseId::Log, entry: sample_entry() },
            Command::Delete { db: DatabaseId::Main, dn: "cn=alice,dc=example,dc=org".into() },
            Command::Delete { db: DatabaseId::Log, dn: "cn=audit-1".into() },
            Command::ModifyDn {
                old_dn: "cn=alice,dc=example,dc=org".into(),
                entry: DirEntry::new("cn=alice,ou=people,dc=example,dc=org").attr("cn", &["alice"]),
            },
            Command::ConfigUpdate(ConfigChange {
                section: "limits".into(),
                version: 12,
                data: btreemap! {
                    "max_connections".to_string() => "512".to_string(),
                    "idle_timeout".to_string() => "30s".to_string(),
                },
            }),
            Command::AclFullUpdate(vec![rule.clone(), AclRule { id: 4, ..rule.clone() }]),
            Command::AclAddRule(rule.clone()),
            Command::AclUpdateRule(rule),
            Command::AclDeleteRule(3),
            Command::AclSetDefault(AccessLevel::Read),
        ];
        for cmd in commands {
            let decoded = Command::decode(&cmd.encode()).unwrap();
            assert_eq!(cmd, decoded);
        }
    }

    #[test]
    fn short_command_body_is_corrupt() {
        let raw = Command::Delete { db: DatabaseId::Main, dn: "cn=a".into() }.encode();
        for cut in 1..raw.len() {
            assert!(Command::decode(&raw[..cut]).is_err());
        }
    }
}
