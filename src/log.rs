//! The append-only audit trail of an entity.
//!
//! Every committed change to an entity is one [`LogEntry`]. Entries chain:
//! an update records the value it replaced, which must equal what the log
//! projects for that field, and every entry carries a BLAKE3 hash over its
//! content and the previous entry's hash. The log is the source of truth and
//! keeps its own projection, the [`EntityRecord`], up to date as it grows.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;

use crate::datatype::Value;
use crate::error::{KeepsakeError, Result};
use crate::identity::{Fields, Uid};
use crate::record::EntityRecord;

// hash preceding the first entry of every log
const GENESIS: &str = "";

// ------------- Changes -------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "what", rename_all = "snake_case")]
pub enum Change {
    Created { kind: String, scale: u32, key: Fields, fields: Fields },
    Updated { field: String, old: Value, new: Value },
    Linked { target: Uid, role: String },
    Unlinked { target: Uid, role: String },
    Retired,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Change::Created { kind, .. } => write!(f, "created {}", kind),
            Change::Updated { field, old, new } => write!(f, "{}: {} -> {}", field, old, new),
            Change::Linked { target, role } => write!(f, "linked {:?} as {}", target, role),
            Change::Unlinked { target, role } => write!(f, "unlinked {:?} ({})", target, role),
            Change::Retired => write!(f, "retired"),
        }
    }
}

/// Who performed a change, and optionally why.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribution {
    who: String,
    why: Option<String>,
}

impl Attribution {
    pub fn new(who: impl Into<String>) -> Self {
        Self { who: who.into(), why: None }
    }
    pub fn because(mut self, why: impl Into<String>) -> Self {
        self.why = Some(why.into());
        self
    }
    pub fn who(&self) -> &str {
        &self.who
    }
    pub fn why(&self) -> Option<&str> {
        self.why.as_deref()
    }
}

// ------------- Entries -------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    version: u64,
    when: DateTime<Utc>,
    who: String,
    why: Option<String>,
    change: Change,
    hash: String,
}

impl LogEntry {
    pub fn version(&self) -> u64 {
        self.version
    }
    pub fn when(&self) -> &DateTime<Utc> {
        &self.when
    }
    pub fn who(&self) -> &str {
        &self.who
    }
    pub fn why(&self) -> Option<&str> {
        self.why.as_deref()
    }
    pub fn change(&self) -> &Change {
        &self.change
    }
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

// the part of an entry its hash covers
#[derive(Serialize)]
struct Sealed<'a> {
    previous: &'a str,
    version: u64,
    when: &'a DateTime<Utc>,
    who: &'a str,
    why: Option<&'a str>,
    change: &'a Change,
}

fn seal(previous: &str, version: u64, when: &DateTime<Utc>, who: &str, why: Option<&str>, change: &Change) -> Result<String> {
    let bytes = serde_json::to_vec(&Sealed { previous, version, when, who, why, change })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// An entry that passed every check against the log but is not appended
/// yet, together with the record it would produce.
#[derive(Debug)]
pub(crate) struct Staged {
    entry: LogEntry,
    record: EntityRecord,
}

impl Staged {
    pub(crate) fn entry(&self) -> &LogEntry {
        &self.entry
    }
    pub(crate) fn record(&self) -> &EntityRecord {
        &self.record
    }
}

// ------------- Entity Log -------------
#[derive(Debug, Clone)]
pub struct EntityLog {
    uid: Uid,
    entries: Vec<LogEntry>,
    projection: Option<EntityRecord>,
}

impl EntityLog {
    pub(crate) fn new(uid: Uid) -> Self {
        Self { uid, entries: Vec::new(), projection: None }
    }

    /// Rebuilds a log from persisted entries, checking every link of the
    /// chain as if the entries were appended one by one.
    pub(crate) fn restore(uid: Uid, entries: Vec<LogEntry>) -> Result<Self> {
        let mut log = Self::new(uid);
        for entry in entries {
            let record = log.project(entry.version, &entry.change)?;
            let expected = seal(log.head(), entry.version, &entry.when, &entry.who, entry.why.as_deref(), &entry.change)?;
            if expected != entry.hash {
                return Err(KeepsakeError::LogConflict {
                    uid,
                    message: format!("hash mismatch at version {}", entry.version),
                });
            }
            log.entries.push(entry);
            log.projection = Some(record);
        }
        Ok(log)
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn version(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.version)
    }
    /// Hash of the latest entry; empty for a log without entries.
    pub fn head(&self) -> &str {
        self.entries.last().map_or(GENESIS, |e| e.hash.as_str())
    }
    /// The record as projected by the entries so far.
    pub fn record(&self) -> Option<&EntityRecord> {
        self.projection.as_ref()
    }

    /// Checks a change against the current projection and seals it into the
    /// next entry, without appending it.
    pub(crate) fn stage(&self, attribution: &Attribution, change: Change) -> Result<Staged> {
        let version = self.version() + 1;
        let record = self.project(version, &change)?;
        let when = Utc::now();
        let hash = seal(self.head(), version, &when, attribution.who(), attribution.why(), &change)?;
        let entry = LogEntry {
            version,
            when,
            who: attribution.who().to_owned(),
            why: attribution.why().map(str::to_owned),
            change,
            hash,
        };
        Ok(Staged { entry, record })
    }

    pub(crate) fn commit(&mut self, staged: Staged) -> &LogEntry {
        let Staged { entry, record } = staged;
        self.projection = Some(record);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn append(&mut self, attribution: &Attribution, change: Change) -> Result<&LogEntry> {
        let staged = self.stage(attribution, change)?;
        Ok(self.commit(staged))
    }

    /// Folds every entry from the start into a fresh record, verifying the
    /// hash chain on the way.
    pub fn replay(&self) -> Result<EntityRecord> {
        let rebuilt = Self::restore(self.uid, self.entries.clone())?;
        rebuilt.projection.ok_or_else(|| KeepsakeError::LogConflict {
            uid: self.uid,
            message: "log has no entries".into(),
        })
    }

    // The record that results from applying `change` as entry `version`.
    fn project(&self, version: u64, change: &Change) -> Result<EntityRecord> {
        let conflict = |message: String| KeepsakeError::LogConflict { uid: self.uid, message };
        if version != self.version() + 1 {
            return Err(conflict(format!("expected version {}, got {}", self.version() + 1, version)));
        }
        let current = match (&self.projection, change) {
            (None, Change::Created { kind, scale, key, fields }) => {
                return Ok(EntityRecord::created(self.uid, kind, *scale, key.clone(), fields.clone()));
            }
            (None, _) => return Err(conflict("the first entry must be a creation".into())),
            (Some(current), _) => current,
        };
        if current.is_retired() {
            return Err(KeepsakeError::RetiredEntity(self.uid));
        }
        let mut next = current.clone();
        match change {
            Change::Created { .. } => return Err(conflict("entity was already created".into())),
            Change::Updated { field, old, new } => {
                if current.field(field) != old {
                    return Err(conflict(format!(
                        "'{}' was {} but the entry replaces {}",
                        field,
                        current.field(field),
                        old
                    )));
                }
                next.set_field(field, new.clone());
            }
            Change::Linked { target, role } => {
                if current.depends_on(target) {
                    return Err(conflict(format!("already linked to {:?}", target)));
                }
                next.insert_link(*target, role);
            }
            Change::Unlinked { target, .. } if current.is_key_reference(target) => {
                return Err(conflict(format!("{:?} is referenced by the key", target)));
            }
            Change::Unlinked { target, role } => match current.links().get(target) {
                Some(linked_as) if linked_as == role => {
                    next.remove_link(target);
                }
                _ => return Err(conflict(format!("no link to {:?} as {}", target, role))),
            },
            Change::Retired => next.retire(),
        }
        next.set_version(version);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(n: u8) -> Uid {
        Uid::from_bytes([n; 32])
    }

    fn created() -> Change {
        let mut key = Fields::new();
        key.insert("name".into(), "Brokerage".into());
        Change::Created { kind: "account".into(), scale: 2, key, fields: Fields::new() }
    }

    fn update(field: &str, old: Value, new: Value) -> Change {
        Change::Updated { field: field.into(), old, new }
    }

    #[test]
    fn updates_must_chain() {
        let who = Attribution::new("test");
        let mut log = EntityLog::new(uid(1));
        log.append(&who, created()).unwrap();
        let hundred = Value::decimal("100.00").unwrap();
        let other = Value::decimal("120.00").unwrap();
        log.append(&who, update("balance", Value::Null, hundred.clone())).unwrap();
        // skips the 100.00 the log already holds
        let err = log.append(&who, update("balance", Value::Null, other.clone())).unwrap_err();
        assert!(matches!(err, KeepsakeError::LogConflict { .. }));
        assert_eq!(log.len(), 2);
        log.append(&who, update("balance", hundred, other.clone())).unwrap();
        assert_eq!(log.record().unwrap().field("balance"), &other);
    }

    #[test]
    fn first_entry_must_be_created() {
        let mut log = EntityLog::new(uid(1));
        let err = log.append(&Attribution::new("test"), Change::Retired).unwrap_err();
        assert!(matches!(err, KeepsakeError::LogConflict { .. }));
        assert!(log.is_empty());
    }

    #[test]
    fn retired_logs_refuse_entries() {
        let who = Attribution::new("test");
        let mut log = EntityLog::new(uid(1));
        log.append(&who, created()).unwrap();
        log.append(&who, Change::Retired).unwrap();
        let err = log.append(&who, update("balance", Value::Null, Value::Integer(1))).unwrap_err();
        assert!(matches!(err, KeepsakeError::RetiredEntity(_)));
    }

    #[test]
    fn replay_matches_projection() {
        let who = Attribution::new("test").because("import");
        let mut log = EntityLog::new(uid(1));
        log.append(&who, created()).unwrap();
        log.append(&who, update("description", Value::Null, "main".into())).unwrap();
        log.append(&who, Change::Linked { target: uid(2), role: "custodian".into() }).unwrap();
        log.append(&who, Change::Unlinked { target: uid(2), role: "custodian".into() }).unwrap();
        log.append(&who, Change::Linked { target: uid(3), role: "owner".into() }).unwrap();
        let replayed = log.replay().unwrap();
        assert_eq!(&replayed, log.record().unwrap());
        assert_eq!(replayed.version(), 5);
        assert!(replayed.depends_on(&uid(3)));
        assert_eq!(log.entries()[1].why(), Some("import"));
    }

    #[test]
    fn key_references_stay_linked() {
        let who = Attribution::new("test");
        let mut key = Fields::new();
        key.insert("account".into(), Value::Reference(uid(2)));
        key.insert("reference".into(), "T-1".into());
        let mut log = EntityLog::new(uid(1));
        log.append(&who, Change::Created { kind: "transaction".into(), scale: 2, key, fields: Fields::new() })
            .unwrap();
        assert_eq!(log.record().unwrap().links().get(&uid(2)).map(String::as_str), Some("account"));
        let err = log.append(&who, Change::Unlinked { target: uid(2), role: "account".into() }).unwrap_err();
        assert!(matches!(err, KeepsakeError::LogConflict { .. }));
        // retiring lets go of them with everything else
        log.append(&who, Change::Retired).unwrap();
        assert!(log.record().unwrap().links().is_empty());
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let who = Attribution::new("test");
        let mut log = EntityLog::new(uid(1));
        log.append(&who, created()).unwrap();
        log.append(&who, update("description", Value::Null, "main".into())).unwrap();
        let mut entries = log.entries().to_vec();
        entries[1].who = "mallory".into();
        let err = EntityLog::restore(uid(1), entries).unwrap_err();
        assert!(matches!(err, KeepsakeError::LogConflict { .. }));
    }

    #[test]
    fn entries_survive_json() {
        let who = Attribution::new("test");
        let mut log = EntityLog::new(uid(1));
        log.append(&who, created()).unwrap();
        log.append(&who, update("balance", Value::Null, Value::decimal("1.50").unwrap())).unwrap();
        let json = serde_json::to_string(log.entries()).unwrap();
        let entries: Vec<LogEntry> = serde_json::from_str(&json).unwrap();
        let restored = EntityLog::restore(uid(1), entries).unwrap();
        assert_eq!(restored.head(), log.head());
        assert_eq!(restored.record(), log.record());
    }
}
