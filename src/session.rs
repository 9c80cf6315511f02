//! Batches of field updates that are committed or dropped as a unit.
//!
//! A [`Session`] collects updates for any number of entities on behalf of
//! one attribution. Nothing changes until [`Session::commit`], which checks
//! every update against its entity's log, saves all resulting entries in a
//! single call to [`Persistor::save_all`](crate::persist::Persistor::save_all)
//! and only then applies them. If anything fails, no entity changes.
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::datatype::Value;
use crate::entity::EntityRef;
use crate::error::{KeepsakeError, Result};
use crate::identity::Uid;
use crate::kind::check_field;
use crate::log::Attribution;
use crate::store::Shared;

pub struct Session<'s> {
    shared: &'s Arc<Shared>,
    attribution: Attribution,
    edits: Vec<(EntityRef, String, Value)>,
}

impl<'s> Session<'s> {
    pub(crate) fn new(shared: &'s Arc<Shared>, attribution: Attribution) -> Self {
        debug!(who = attribution.who(), why = attribution.why(), "session started");
        Self { shared, attribution, edits: Vec::new() }
    }

    pub fn attribution(&self) -> &Attribution {
        &self.attribution
    }
    pub fn len(&self) -> usize {
        self.edits.len()
    }
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Queues `field = value` for `entity`. The value is checked against the
    /// kind right away and against the log when the session commits.
    pub fn update(&mut self, entity: &EntityRef, field: &str, value: impl Into<Value>) -> Result<()> {
        if !entity.belongs_to(self.shared) {
            return Err(KeepsakeError::validation("entity", "entity belongs to another store"));
        }
        let record = entity.record()?;
        if record.is_retired() {
            return Err(KeepsakeError::RetiredEntity(entity.uid()));
        }
        let value = check_field(entity.kind(), field, value.into(), record.scale())?;
        self.edits.push((Arc::clone(entity), field.to_owned(), value));
        Ok(())
    }

    /// Drops every queued update.
    pub fn abort(self) {
        debug!(who = self.attribution.who(), edits = self.edits.len(), "session aborted");
    }

    /// Applies every queued update or none of them. Updates of one entity
    /// apply in the order they were queued. Returns the number of log
    /// entries appended, which leaves out updates that changed nothing.
    pub fn commit(self) -> Result<usize> {
        let mut batches: BTreeMap<Uid, (EntityRef, Vec<(String, Value)>)> = BTreeMap::new();
        for (entity, field, value) in self.edits {
            batches.entry(entity.uid()).or_insert_with(|| (Arc::clone(&entity), Vec::new())).1.push((field, value));
        }
        let batches: Vec<(EntityRef, Vec<(String, Value)>)> = batches.into_values().collect();

        // entities are locked in uid order
        let mut logs = Vec::with_capacity(batches.len());
        for (entity, _) in &batches {
            logs.push(entity.lock_log()?);
        }
        let mut drafts = Vec::new();
        for (index, ((entity, edits), log)) in batches.iter().zip(&logs).enumerate() {
            if let Some(draft) = entity.draft(log, &self.attribution, edits)? {
                drafts.push((index, draft));
            }
        }
        if drafts.is_empty() {
            debug!(who = self.attribution.who(), "session changed nothing");
            return Ok(0);
        }
        let commits: Vec<_> = drafts.iter().map(|(_, draft)| draft.commit.clone()).collect();
        self.shared.persistor.save_all(&commits)?;

        let appended = commits.iter().map(|c| c.entries.len()).sum();
        let mut announcements = Vec::with_capacity(drafts.len());
        for (index, draft) in drafts {
            *logs[index] = draft.log;
            announcements.push((index, draft.changed, draft.commit.record));
        }
        drop(logs);
        info!(
            who = self.attribution.who(),
            why = self.attribution.why(),
            entities = announcements.len(),
            entries = appended,
            "session committed"
        );
        for (index, changed, source) in &announcements {
            batches[*index].0.announce(changed, source);
        }
        Ok(appended)
    }
}
