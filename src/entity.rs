//! The in-memory domain object that client code interacts with.
//!
//! An [`Entity`] composes its identity, its kind, and a log that projects
//! its record. Every change follows the same path: check the change against
//! the kind and the log, persist the commit, and only then apply it to the
//! log (and to the dependency graph for link changes). A failed save leaves
//! the entity exactly as it was.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};

use crate::datatype::Value;
use crate::dependents::Dependents;
use crate::error::{KeepsakeError, Result};
use crate::identity::{is_valid_name, CanonicalKey, Fields, Uid};
use crate::kind::{check_field, DependencyEvent, EntityKind};
use crate::log::{Attribution, Change, EntityLog, LogEntry, Staged};
use crate::persist::{Commit, EdgeDelta};
use crate::record::{EntityRecord, Lifecycle};
use crate::store::Shared;

pub type EntityRef = Arc<Entity>;

pub struct Entity {
    uid: Uid,
    kind: Arc<dyn EntityKind>,
    log: Mutex<EntityLog>,
    shared: Arc<Shared>,
}

impl Entity {
    // Builds the entity and persists its created entry. Registration is up
    // to the store.
    pub(crate) fn create(
        kind: Arc<dyn EntityKind>,
        key: CanonicalKey,
        fields: Fields,
        attribution: &Attribution,
        shared: Arc<Shared>,
    ) -> Result<Self> {
        let uid = key.uid();
        let scale = key.scale();
        let mut log = EntityLog::new(uid);
        let staged = log.stage(
            attribution,
            Change::Created {
                kind: kind.tag().to_owned(),
                scale,
                key: key.into_fields(),
                fields,
            },
        )?;
        // references in the key are dependencies from the first entry on
        let edges = staged
            .record()
            .links()
            .iter()
            .map(|(to, role)| EdgeDelta::Added { from: uid, to: *to, role: role.clone() })
            .collect();
        save(&shared, &staged, edges)?;
        log.commit(staged);
        info!(%uid, kind = kind.tag(), scale, "entity created");
        Ok(Self { uid, kind, log: Mutex::new(log), shared })
    }

    pub(crate) fn restored(kind: Arc<dyn EntityKind>, log: EntityLog, shared: Arc<Shared>) -> Self {
        Self { uid: log.uid(), kind, log: Mutex::new(log), shared }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }
    pub fn kind(&self) -> &dyn EntityKind {
        self.kind.as_ref()
    }

    /// A copy of the current record.
    pub fn record(&self) -> Result<EntityRecord> {
        let log = self.log.lock()?;
        projection(&log).cloned()
    }
    /// A copy of every log entry so far, oldest first.
    pub fn log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.lock()?.entries().to_vec())
    }
    pub fn replay(&self) -> Result<EntityRecord> {
        self.log.lock()?.replay()
    }
    pub fn state(&self) -> Result<Lifecycle> {
        let log = self.log.lock()?;
        Ok(projection(&log)?.state())
    }
    pub fn is_retired(&self) -> Result<bool> {
        Ok(self.state()? == Lifecycle::Retired)
    }
    pub fn field(&self, name: &str) -> Result<Value> {
        let log = self.log.lock()?;
        let record = projection(&log)?;
        Ok(record.key().get(name).unwrap_or_else(|| record.field(name)).clone())
    }
    pub fn version(&self) -> Result<u64> {
        Ok(self.log.lock()?.version())
    }
    /// Both directions of this entity's dependencies. Retired entities have
    /// none.
    pub fn dependents(&self) -> Result<Dependents> {
        let graph = self.shared.graph.lock()?;
        Ok(graph.dependents(&self.uid).cloned().unwrap_or_default())
    }

    // ------------- Mutation -------------
    pub fn mutate(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        self.mutate_as(&self.shared.attribution(), field, value)
    }

    /// Sets `field` to `value` on behalf of `attribution`. Setting a field to
    /// the value it already has appends nothing.
    pub fn mutate_as(&self, attribution: &Attribution, field: &str, value: impl Into<Value>) -> Result<()> {
        let mut log = self.log.lock()?;
        let record = active(&log, self.uid)?;
        let new = check_field(self.kind.as_ref(), field, value.into(), record.scale())?;
        let old = record.field(field).clone();
        if old == new {
            debug!(uid = %self.uid, field, "unchanged value ignored");
            return Ok(());
        }
        let staged = log.stage(attribution, Change::Updated { field: field.to_owned(), old, new })?;
        save(&self.shared, &staged, Vec::new())?;
        let source = staged.record().clone();
        let entry = log.commit(staged);
        debug!(uid = %self.uid, field, version = entry.version(), "field updated");
        drop(log);
        self.notify_dependents(&DependencyEvent::Updated { field: field.to_owned() }, &source);
        Ok(())
    }

    // ------------- Links -------------
    pub fn link(&self, other: &Entity, role: &str) -> Result<()> {
        self.link_as(&self.shared.attribution(), other, role)
    }

    /// Records that this entity depends on `other` in the given role.
    pub fn link_as(&self, attribution: &Attribution, other: &Entity, role: &str) -> Result<()> {
        if other.uid == self.uid && !self.kind.allows_self_reference() {
            return Err(KeepsakeError::SelfReference(self.uid));
        }
        if !is_valid_name(role) {
            return Err(KeepsakeError::validation("role", format!("'{}' is not a valid role", role)));
        }
        if !Arc::ptr_eq(&self.shared, &other.shared) {
            return Err(KeepsakeError::validation("target", "entity belongs to another store"));
        }
        let mut log = self.log.lock()?;
        let record = active(&log, self.uid)?;
        if record.depends_on(&other.uid) {
            return Err(KeepsakeError::validation("target", format!("already linked to {:?}", other.uid)));
        }
        let mut graph = self.shared.graph.lock()?;
        // retired entities leave the graph
        if !graph.contains(&other.uid) {
            return Err(KeepsakeError::RetiredEntity(other.uid));
        }
        // every entity on the cycle this link would close must tolerate it
        let cycle = graph.between(other.uid, self.uid);
        if !cycle.is_empty() {
            let directory = self.shared.directory.lock()?;
            let strict = cycle.iter().copied().find(|uid| match *uid {
                uid if uid == self.uid => !self.kind.allows_cycles(),
                uid if uid == other.uid => !other.kind.allows_cycles(),
                uid => directory.get(&uid).and_then(Weak::upgrade).is_some_and(|e| !e.kind.allows_cycles()),
            });
            if let Some(strict) = strict {
                return Err(KeepsakeError::validation(
                    "target",
                    format!("linking to {:?} would put {:?} on a cycle", other.uid, strict),
                ));
            }
        }
        let staged = log.stage(attribution, Change::Linked { target: other.uid, role: role.to_owned() })?;
        let edge = EdgeDelta::Added { from: self.uid, to: other.uid, role: role.to_owned() };
        save(&self.shared, &staged, vec![edge])?;
        graph.add_edge(self.uid, other.uid);
        log.commit(staged);
        debug!(from = %self.uid, to = %other.uid, role, "linked");
        Ok(())
    }

    pub fn unlink(&self, other: &Entity) -> Result<()> {
        self.unlink_as(&self.shared.attribution(), other)
    }

    pub fn unlink_as(&self, attribution: &Attribution, other: &Entity) -> Result<()> {
        let mut log = self.log.lock()?;
        let record = active(&log, self.uid)?;
        if record.is_key_reference(&other.uid) {
            return Err(KeepsakeError::validation("target", format!("{:?} is referenced by the key", other.uid)));
        }
        let role = record
            .links()
            .get(&other.uid)
            .cloned()
            .ok_or(KeepsakeError::NoSuchLink { from: self.uid, to: other.uid })?;
        let staged = log.stage(attribution, Change::Unlinked { target: other.uid, role })?;
        let mut graph = self.shared.graph.lock()?;
        save(&self.shared, &staged, vec![EdgeDelta::Removed { from: self.uid, to: other.uid }])?;
        graph.remove_edge(self.uid, other.uid);
        log.commit(staged);
        debug!(from = %self.uid, to = %other.uid, "unlinked");
        Ok(())
    }

    // ------------- Retirement -------------
    // Called by the store with its registry locked, so nothing can look the
    // entity up while it retires. Returns the retired record and the
    // entities it no longer depends on.
    pub(crate) fn retire(&self, attribution: &Attribution) -> Result<(EntityRecord, Vec<Uid>)> {
        let mut log = self.log.lock()?;
        let record = active(&log, self.uid)?;
        let targets: Vec<Uid> = record.links().keys().copied().collect();
        let mut graph = self.shared.graph.lock()?;
        let dependents = graph
            .dependents(&self.uid)
            .map_or(0, |d| d.depended_by().iter().filter(|uid| **uid != self.uid).count());
        if dependents > 0 {
            return Err(KeepsakeError::ReferentialIntegrity { uid: self.uid, dependents });
        }
        let staged = log.stage(attribution, Change::Retired)?;
        let edges = targets.iter().map(|to| EdgeDelta::Removed { from: self.uid, to: *to }).collect();
        save(&self.shared, &staged, edges)?;
        for to in &targets {
            graph.remove_edge(self.uid, *to);
        }
        graph.remove_node(&self.uid);
        let source = staged.record().clone();
        log.commit(staged);
        info!(uid = %self.uid, kind = self.kind.tag(), "entity retired");
        Ok((source, targets))
    }

    // ------------- Events -------------
    fn notify_dependents(&self, event: &DependencyEvent, source: &EntityRecord) {
        let dependents = match self.shared.graph.lock() {
            Ok(graph) => graph.dependents(&self.uid).map(|d| d.depended_by().clone()).unwrap_or_default(),
            Err(e) => {
                warn!(uid = %self.uid, %event, error = %e, "dependency graph poisoned, event dropped");
                return;
            }
        };
        self.notify(event, source, dependents);
    }

    // Hands `event` to the kind of every recipient except this entity. Must
    // be called without holding any lock.
    pub(crate) fn notify(&self, event: &DependencyEvent, source: &EntityRecord, recipients: impl IntoIterator<Item = Uid>) {
        let recipients: Vec<EntityRef> = match self.shared.directory.lock() {
            Ok(directory) => recipients
                .into_iter()
                .filter(|uid| *uid != self.uid)
                .filter_map(|uid| directory.get(&uid).and_then(Weak::upgrade))
                .collect(),
            Err(e) => {
                warn!(uid = %self.uid, %event, error = %e, "entity directory poisoned, event dropped");
                return;
            }
        };
        for recipient in recipients {
            debug!(from = %self.uid, to = %recipient.uid, %event, "dependency event");
            if let Err(e) = recipient.kind.on_dependency_event(&recipient, event, source) {
                warn!(from = %self.uid, to = %recipient.uid, %event, error = %e, "dependency event handler failed");
            }
        }
    }

    // ------------- Sessions -------------
    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    pub(crate) fn lock_log(&self) -> Result<MutexGuard<'_, EntityLog>> {
        Ok(self.log.lock()?)
    }

    // Applies `edits` in order to a copy of `log`. Edits that change nothing
    // are skipped; `None` when none are left.
    pub(crate) fn draft(
        &self,
        log: &EntityLog,
        attribution: &Attribution,
        edits: &[(String, Value)],
    ) -> Result<Option<Draft>> {
        let mut draft = log.clone();
        let mut changed = BTreeSet::new();
        for (field, value) in edits {
            let record = active(&draft, self.uid)?;
            let new = check_field(self.kind.as_ref(), field, value.clone(), record.scale())?;
            let old = record.field(field).clone();
            if old == new {
                continue;
            }
            let staged = draft.stage(attribution, Change::Updated { field: field.clone(), old, new })?;
            draft.commit(staged);
            changed.insert(field.clone());
        }
        if changed.is_empty() {
            return Ok(None);
        }
        let commit = Commit {
            record: projection(&draft)?.clone(),
            entries: draft.entries()[log.len()..].to_vec(),
            edges: Vec::new(),
        };
        Ok(Some(Draft { log: draft, commit, changed }))
    }

    // Events for the fields a committed draft changed.
    pub(crate) fn announce(&self, changed: &BTreeSet<String>, source: &EntityRecord) {
        for field in changed {
            self.notify_dependents(&DependencyEvent::Updated { field: field.clone() }, source);
        }
    }
}

/// A log with uncommitted updates, and the commit that persists them.
pub(crate) struct Draft {
    pub(crate) log: EntityLog,
    pub(crate) commit: Commit,
    pub(crate) changed: BTreeSet<String>,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Entity").field("uid", &self.uid).field("kind", &self.kind.tag()).finish()
    }
}

fn projection(log: &EntityLog) -> Result<&EntityRecord> {
    log.record()
        .ok_or_else(|| KeepsakeError::LogConflict { uid: log.uid(), message: "entity has no created entry".into() })
}

fn active(log: &EntityLog, uid: Uid) -> Result<&EntityRecord> {
    let record = projection(log)?;
    if record.is_retired() {
        return Err(KeepsakeError::RetiredEntity(uid));
    }
    Ok(record)
}

fn save(shared: &Shared, staged: &Staged, edges: Vec<EdgeDelta>) -> Result<()> {
    let commit = Commit {
        record: staged.record().clone(),
        entries: vec![staged.entry().clone()],
        edges,
    };
    shared.persistor.save(&commit)
}
