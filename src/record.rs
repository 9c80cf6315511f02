//! The durable snapshot of an entity.
//!
//! An [`EntityRecord`] is the projection of an entity's log: folding the log
//! from its created entry yields exactly the record. It is what gets written
//! to storage after every committed change and read back on startup.
use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;

use crate::datatype::Value;
use crate::identity::{Fields, Uid};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    Retired,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Retired => write!(f, "retired"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    uid: Uid,
    kind: String,
    // decimal scale in force when the entity was created
    scale: u32,
    version: u64,
    state: Lifecycle,
    key: Fields,
    fields: Fields,
    // outgoing dependency edges, target -> role
    links: BTreeMap<Uid, String>,
}

impl EntityRecord {
    // Every reference in the key is a dependency from the start, in the role
    // of its field.
    pub(crate) fn created(uid: Uid, kind: &str, scale: u32, key: Fields, fields: Fields) -> Self {
        let links = key
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|target| (target, name.clone())))
            .collect();
        Self {
            uid,
            kind: kind.to_owned(),
            scale,
            version: 1,
            state: Lifecycle::Active,
            key,
            fields,
            links,
        }
    }
    // Records are immutable outside of the log, so everything is read
    // through getters.
    pub fn uid(&self) -> Uid {
        self.uid
    }
    pub fn kind(&self) -> &str {
        &self.kind
    }
    pub fn scale(&self) -> u32 {
        self.scale
    }
    pub fn version(&self) -> u64 {
        self.version
    }
    pub fn state(&self) -> Lifecycle {
        self.state
    }
    pub fn is_retired(&self) -> bool {
        self.state == Lifecycle::Retired
    }
    pub fn key(&self) -> &Fields {
        &self.key
    }
    pub fn fields(&self) -> &Fields {
        &self.fields
    }
    /// The current value of a mutable field; unset fields read as null.
    pub fn field(&self, name: &str) -> &Value {
        const NULL: &Value = &Value::Null;
        self.fields.get(name).unwrap_or(NULL)
    }
    pub fn links(&self) -> &BTreeMap<Uid, String> {
        &self.links
    }
    pub fn depends_on(&self, uid: &Uid) -> bool {
        self.links.contains_key(uid)
    }
    /// Whether `uid` is referenced by a key field. Such links last as long
    /// as the entity does.
    pub fn is_key_reference(&self, uid: &Uid) -> bool {
        self.key.values().any(|v| v.as_reference() == Some(*uid))
    }

    pub(crate) fn set_field(&mut self, name: &str, value: Value) {
        if value.is_null() {
            self.fields.remove(name);
        } else {
            self.fields.insert(name.to_owned(), value);
        }
    }
    pub(crate) fn insert_link(&mut self, target: Uid, role: &str) {
        self.links.insert(target, role.to_owned());
    }
    pub(crate) fn remove_link(&mut self, target: &Uid) -> Option<String> {
        self.links.remove(target)
    }
    // A retired entity keeps its fields but lets go of everything it
    // depended on.
    pub(crate) fn retire(&mut self) {
        self.state = Lifecycle::Retired;
        self.links.clear();
    }
    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl fmt::Display for EntityRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fields: Vec<String> = self
            .key
            .iter()
            .chain(self.fields.iter())
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect();
        write!(f, "{}@{} v{} {{{}}}", self.kind, self.uid, self.version, fields.join(", "))
    }
}
