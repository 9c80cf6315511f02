// used for persistence
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::dependents::Dependents;
use crate::error::{KeepsakeError, Result};
use crate::identity::Uid;
use crate::log::LogEntry;
use crate::record::EntityRecord;

// ------------- Units of Persistence -------------
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "edge", rename_all = "snake_case")]
pub enum EdgeDelta {
    Added { from: Uid, to: Uid, role: String },
    Removed { from: Uid, to: Uid },
}

/// Everything one committed change writes: the new snapshot of the entity,
/// the log entries it appended and the dependency edges it touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub record: EntityRecord,
    pub entries: Vec<LogEntry>,
    pub edges: Vec<EdgeDelta>,
}

impl Commit {
    pub fn uid(&self) -> Uid {
        self.record.uid()
    }
    pub fn kind(&self) -> &str {
        self.record.kind()
    }
}

/// What was persisted for one entity, as handed to `Store::hydrate_all`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntity {
    pub record: EntityRecord,
    pub log: Vec<LogEntry>,
    pub dependents: Dependents,
}

pub trait Persistor: Send + Sync {
    fn load(&self) -> Result<Vec<PersistedEntity>>;
    /// Must either store every commit or none of them.
    fn save_all(&self, commits: &[Commit]) -> Result<()>;
    fn save(&self, commit: &Commit) -> Result<()> {
        self.save_all(std::slice::from_ref(commit))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

impl PersistenceMode {
    pub fn from_location(location: &str) -> Self {
        match location.trim() {
            "" | ":memory:" => PersistenceMode::InMemory,
            path => PersistenceMode::File(path.to_owned()),
        }
    }
}

pub fn open(mode: &PersistenceMode) -> Result<Arc<dyn Persistor>> {
    Ok(match mode {
        PersistenceMode::InMemory => Arc::new(MemoryPersistor::new()),
        PersistenceMode::File(path) => Arc::new(SqlitePersistor::open(path)?),
    })
}

// ------------- Memory -------------
#[derive(Debug, Default)]
struct Kept {
    entities: BTreeMap<Uid, PersistedEntity>,
    commits: usize,
    failing: bool,
}

/// Keeps commits in memory. Loading yields what an SQLite database would
/// hold after the same commits.
#[derive(Debug, Default)]
pub struct MemoryPersistor {
    kept: Mutex<Kept>,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn commits(&self) -> usize {
        self.kept.lock().map_or(0, |k| k.commits)
    }
    /// Makes every following save fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut kept) = self.kept.lock() {
            kept.failing = failing;
        }
    }
}

impl Persistor for MemoryPersistor {
    fn load(&self) -> Result<Vec<PersistedEntity>> {
        Ok(self.kept.lock()?.entities.values().cloned().collect())
    }
    fn save_all(&self, commits: &[Commit]) -> Result<()> {
        let mut kept = self.kept.lock()?;
        if kept.failing {
            return Err(KeepsakeError::Persistence("memory persistor set to fail".into()));
        }
        for commit in commits {
            kept.apply(commit);
        }
        Ok(())
    }
}

impl Kept {
    fn apply(&mut self, commit: &Commit) {
        let uid = commit.uid();
        let entity = self.entities.entry(uid).or_insert_with(|| PersistedEntity {
            record: commit.record.clone(),
            log: Vec::new(),
            dependents: Dependents::default(),
        });
        entity.record = commit.record.clone();
        entity.log.extend(commit.entries.iter().cloned());
        for edge in &commit.edges {
            let (from, to, added) = match edge {
                EdgeDelta::Added { from, to, .. } => (*from, *to, true),
                EdgeDelta::Removed { from, to } => (*from, *to, false),
            };
            for (uid, outgoing) in [(from, true), (to, false)] {
                if let Some(entity) = self.entities.get_mut(&uid) {
                    let mut depends_on = entity.dependents.depends_on().clone();
                    let mut depended_by = entity.dependents.depended_by().clone();
                    let (set, other) = if outgoing { (&mut depends_on, to) } else { (&mut depended_by, from) };
                    if added {
                        set.insert(other);
                    } else {
                        set.remove(&other);
                    }
                    entity.dependents = Dependents::new(depends_on, depended_by);
                }
            }
        }
        self.commits += 1;
    }
}

// ------------- SQLite -------------
pub struct SqlitePersistor {
    db: Mutex<Connection>,
}

impl SqlitePersistor {
    pub fn open(path: &str) -> Result<Self> {
        info!(path, "opening entity database");
        Self::with_connection(Connection::open(path)?)
    }
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }
    pub fn with_connection(connection: Connection) -> Result<Self> {
        // The "STRICT" keyword introduced in 3.37.0 breaks JDBC connections, which makes
        // debugging using an external tool like DBeaver impossible
        connection.execute_batch(
            "
            create table if not exists Entity (
                Entity_Identity text not null,
                Kind text not null,
                Version integer not null,
                Retired integer not null,
                Record text not null,
                constraint referenceable_Entity_Identity primary key (
                    Entity_Identity
                )
            );-- STRICT;
            create table if not exists EntityLog (
                Entity_Identity text not null,
                Version integer not null,
                Entry text not null,
                Hash text not null,
                constraint EntityLog_of_Entity foreign key (
                    Entity_Identity
                ) references Entity(Entity_Identity),
                constraint unique_EntityLog_Version primary key (
                    Entity_Identity,
                    Version
                )
            );-- STRICT;
            create table if not exists EntityLink (
                From_Identity text not null,
                To_Identity text not null,
                Role text not null,
                constraint From_is_Entity foreign key (
                    From_Identity
                ) references Entity(Entity_Identity),
                constraint To_is_Entity foreign key (
                    To_Identity
                ) references Entity(Entity_Identity),
                constraint unique_EntityLink primary key (
                    From_Identity,
                    To_Identity
                )
            );-- STRICT;
            ",
        )?;
        Ok(Self { db: Mutex::new(connection) })
    }

    /// Hash of the latest log entry written for `uid`, if any.
    pub fn head(&self, uid: &Uid) -> Result<Option<String>> {
        let db = self.db.lock()?;
        let head = db
            .prepare_cached(
                "
                select Hash
                    from EntityLog
                    where Entity_Identity = ?
                    order by Version desc
                    limit 1
            ",
            )?
            .query_row(params![uid.to_hex()], |row| row.get(0))
            .optional()?;
        Ok(head)
    }
}

impl Persistor for SqlitePersistor {
    fn save_all(&self, commits: &[Commit]) -> Result<()> {
        let mut db = self.db.lock()?;
        let tx = db.transaction()?;
        for commit in commits {
            write(&tx, commit)?;
        }
        tx.commit()?;
        debug!(commits = commits.len(), "commits persisted");
        Ok(())
    }

    fn load(&self) -> Result<Vec<PersistedEntity>> {
        let db = self.db.lock()?;
        let mut records = Vec::new();
        {
            let mut all_entities = db.prepare_cached(
                "
                select Record
                    from Entity
                    order by Entity_Identity
            ",
            )?;
            let mut rows = all_entities.query([])?;
            while let Some(row) = rows.next()? {
                let text: String = row.get(0)?;
                records.push(serde_json::from_str::<EntityRecord>(&text)?);
            }
        }
        let mut logs: BTreeMap<Uid, Vec<LogEntry>> = BTreeMap::new();
        {
            let mut all_entries = db.prepare_cached(
                "
                select Entity_Identity, Entry
                    from EntityLog
                    order by Entity_Identity, Version
            ",
            )?;
            let mut rows = all_entries.query([])?;
            while let Some(row) = rows.next()? {
                let uid: String = row.get(0)?;
                let text: String = row.get(1)?;
                logs.entry(uid.parse()?).or_default().push(serde_json::from_str(&text)?);
            }
        }
        let mut depends_on: BTreeMap<Uid, BTreeSet<Uid>> = BTreeMap::new();
        let mut depended_by: BTreeMap<Uid, BTreeSet<Uid>> = BTreeMap::new();
        {
            let mut all_links = db.prepare_cached(
                "
                select From_Identity, To_Identity
                    from EntityLink
            ",
            )?;
            let mut rows = all_links.query([])?;
            while let Some(row) = rows.next()? {
                let from: Uid = row.get::<_, String>(0)?.parse()?;
                let to: Uid = row.get::<_, String>(1)?.parse()?;
                depends_on.entry(from).or_default().insert(to);
                depended_by.entry(to).or_default().insert(from);
            }
        }
        let loaded: Vec<PersistedEntity> = records
            .into_iter()
            .map(|record| {
                let uid = record.uid();
                PersistedEntity {
                    log: logs.remove(&uid).unwrap_or_default(),
                    dependents: Dependents::new(
                        depends_on.remove(&uid).unwrap_or_default(),
                        depended_by.remove(&uid).unwrap_or_default(),
                    ),
                    record,
                }
            })
            .collect();
        // log rows or links without an entity row are corruption too
        if let Some(orphan) = logs.keys().chain(depends_on.keys()).chain(depended_by.keys()).next() {
            return Err(KeepsakeError::corrupt(format!("rows for {} without an entity", orphan)));
        }
        debug!(entities = loaded.len(), "entities loaded");
        Ok(loaded)
    }
}

// Writes one commit within the transaction `tx`.
fn write(tx: &Connection, commit: &Commit) -> Result<()> {
    let uid = commit.uid().to_hex();
    tx.prepare_cached(
        "
        insert into Entity (
            Entity_Identity,
            Kind,
            Version,
            Retired,
            Record
        ) values (?, ?, ?, ?, ?)
        on conflict (Entity_Identity) do update set
            Version = excluded.Version,
            Retired = excluded.Retired,
            Record = excluded.Record
    ",
    )?
    .execute(params![
        &uid,
        commit.kind(),
        commit.record.version() as i64,
        commit.record.is_retired(),
        serde_json::to_string(&commit.record)?
    ])?;
    for entry in &commit.entries {
        tx.prepare_cached(
            "
            insert into EntityLog (
                Entity_Identity,
                Version,
                Entry,
                Hash
            ) values (?, ?, ?, ?)
        ",
        )?
        .execute(params![&uid, entry.version() as i64, serde_json::to_string(entry)?, entry.hash()])?;
    }
    for edge in &commit.edges {
        match edge {
            EdgeDelta::Added { from, to, role } => {
                tx.prepare_cached(
                    "
                    insert into EntityLink (
                        From_Identity,
                        To_Identity,
                        Role
                    ) values (?, ?, ?)
                ",
                )?
                .execute(params![from.to_hex(), to.to_hex(), role])?;
            }
            EdgeDelta::Removed { from, to } => {
                tx.prepare_cached(
                    "
                    delete from EntityLink
                        where From_Identity = ?
                        and To_Identity = ?
                ",
                )?
                .execute(params![from.to_hex(), to.to_hex()])?;
            }
        }
    }
    debug!(uid = %commit.uid(), entries = commit.entries.len(), edges = commit.edges.len(), "commit written");
    Ok(())
}
