//! The registry of live entities.
//!
//! A [`Store`] maps every [`Uid`] to the one live [`Entity`] carrying it and
//! owns the dependency graph between them. It is an ordinary value: create
//! one with [`Store::new`] or [`Store::open`] and pass it to whoever needs
//! it.
//!
//! Locks are always taken in the order registry, entity, graph, directory.
//! Entities only ever take their own lock and then the graph, so a graph
//! lock is never held while waiting for an entity. Dependency events are
//! delivered once every lock is released.
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::dependents::{Dependents, DependencyGraph, UidHasher};
use crate::entity::{Entity, EntityRef};
use crate::error::{KeepsakeError, Result};
use crate::identity::{CanonicalKey, Fields, Uid};
use crate::kind::{check_initial, DependencyEvent, EntityKind, KindRegistry};
use crate::log::{Attribution, EntityLog};
use crate::persist::{PersistedEntity, Persistor};
use crate::session::Session;

pub const DEFAULT_SCALE: u32 = 8;
pub const DEFAULT_ACTOR: &str = "system";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Decimal scale given to kinds that have no entities yet.
    pub decimal_scale: u32,
    /// Who changes are attributed to when no attribution is given.
    pub actor: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { decimal_scale: DEFAULT_SCALE, actor: DEFAULT_ACTOR.to_owned() }
    }
}

// What a store shares with its entities.
pub(crate) struct Shared {
    pub(crate) graph: Mutex<DependencyGraph>,
    // live entities by uid, for what only knows the uid
    pub(crate) directory: Mutex<HashMap<Uid, Weak<Entity>, UidHasher>>,
    pub(crate) persistor: Arc<dyn Persistor>,
    pub(crate) config: StoreConfig,
}

impl Shared {
    pub(crate) fn attribution(&self) -> Attribution {
        Attribution::new(self.config.actor.clone())
    }
}

// ------------- Entity Keeper -------------
#[derive(Debug, Default)]
pub struct EntityKeeper {
    kept: HashMap<Uid, EntityRef, UidHasher>,
    // uids of retired entities, which may never come back
    retired: HashSet<Uid, UidHasher>,
    // the decimal scale each kind was first created with
    scales: HashMap<String, u32>,
}
impl EntityKeeper {
    pub fn new() -> Self {
        Self::default()
    }
    // Returns the kept entity and whether it was newly kept.
    pub fn keep(&mut self, entity: Entity) -> (EntityRef, bool) {
        match self.kept.entry(entity.uid()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => (Arc::clone(e.insert(Arc::new(entity))), true),
        }
    }
    pub fn get(&self, uid: &Uid) -> Option<EntityRef> {
        self.kept.get(uid).map(Arc::clone)
    }
    pub fn is_retired(&self, uid: &Uid) -> bool {
        self.retired.contains(uid)
    }
    pub fn scale(&self, kind: &str) -> Option<u32> {
        self.scales.get(kind).copied()
    }
    pub fn len(&self) -> usize {
        self.kept.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }
    fn bury(&mut self, uid: &Uid) {
        self.kept.remove(uid);
        self.retired.insert(*uid);
    }
}

// ------------- Store -------------
pub struct Store {
    kinds: KindRegistry,
    keeper: Mutex<EntityKeeper>,
    shared: Arc<Shared>,
}

impl Store {
    pub fn new(config: StoreConfig, kinds: KindRegistry, persistor: Arc<dyn Persistor>) -> Self {
        Self {
            kinds,
            keeper: Mutex::new(EntityKeeper::new()),
            shared: Arc::new(Shared {
                graph: Mutex::new(DependencyGraph::new()),
                directory: Mutex::new(HashMap::default()),
                persistor,
                config,
            }),
        }
    }

    /// Creates a store and hydrates it with everything `persistor` holds.
    pub fn open(config: StoreConfig, kinds: KindRegistry, persistor: Arc<dyn Persistor>) -> Result<Self> {
        let store = Self::new(config, kinds, persistor);
        let persisted = store.shared.persistor.load()?;
        let hydrated = store.hydrate_all(persisted)?;
        info!(entities = hydrated, "store opened");
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }
    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    fn kind(&self, tag: &str) -> Result<Arc<dyn EntityKind>> {
        self.kinds.get(tag).ok_or_else(|| KeepsakeError::UnknownKind(tag.to_owned()))
    }

    pub fn get_or_create(&self, kind: &str, key: Fields, initial: Fields) -> Result<EntityRef> {
        self.get_or_create_as(&self.shared.attribution(), kind, key, initial)
    }

    /// Returns the live entity of `kind` with the logical key `key`, creating
    /// it with `initial` fields if there is none. An existing entity wins
    /// and `initial` is then ignored.
    ///
    /// References in the key must name live entities of this store. The new
    /// entity depends on each of them for as long as it lives.
    pub fn get_or_create_as(
        &self,
        attribution: &Attribution,
        kind: &str,
        key: Fields,
        initial: Fields,
    ) -> Result<EntityRef> {
        let kind = self.kind(kind)?;
        let mut keeper = self.keeper.lock()?;
        let scale = keeper.scale(kind.tag()).unwrap_or(self.shared.config.decimal_scale);
        let key = CanonicalKey::new(kind.as_ref(), &key, scale)?;
        let uid = key.uid();
        if let Some(entity) = keeper.get(&uid) {
            debug!(%uid, kind = kind.tag(), "entity found");
            return Ok(entity);
        }
        if keeper.is_retired(&uid) {
            return Err(KeepsakeError::RetiredEntity(uid));
        }
        let mut targets = Vec::new();
        for (field, value) in key.fields() {
            let Some(target) = value.as_reference() else { continue };
            if keeper.get(&target).is_none() {
                let state = if keeper.is_retired(&target) { "retired" } else { "unknown" };
                return Err(KeepsakeError::InvalidKey(format!("'{}' refers to {} entity {:?}", field, state, target)));
            }
            targets.push(target);
        }
        let fields = check_initial(kind.as_ref(), initial, scale)?;
        let entity = Entity::create(Arc::clone(&kind), key, fields, attribution, Arc::clone(&self.shared))?;
        {
            let mut graph = self.shared.graph.lock()?;
            graph.insert_node(uid);
            for target in targets {
                graph.add_edge(uid, target);
            }
        }
        keeper.scales.entry(kind.tag().to_owned()).or_insert(scale);
        let (entity, _) = keeper.keep(entity);
        self.shared.directory.lock()?.insert(uid, Arc::downgrade(&entity));
        Ok(entity)
    }

    /// The live entity carrying `uid`. A poisoned registry is logged and
    /// reads as empty.
    pub fn get(&self, uid: &Uid) -> Option<EntityRef> {
        match self.keeper.lock() {
            Ok(keeper) => keeper.get(uid),
            Err(e) => {
                warn!(%uid, error = %e, "entity registry poisoned");
                None
            }
        }
    }

    pub fn retire(&self, uid: &Uid) -> Result<()> {
        self.retire_as(&self.shared.attribution(), uid)
    }

    /// Retires the entity, provided nothing depends on it. Its uid becomes a
    /// tombstone that can never be created again.
    pub fn retire_as(&self, attribution: &Attribution, uid: &Uid) -> Result<()> {
        let mut keeper = self.keeper.lock()?;
        let entity = match keeper.get(uid) {
            Some(entity) => entity,
            None if keeper.is_retired(uid) => return Err(KeepsakeError::RetiredEntity(*uid)),
            None => return Err(KeepsakeError::NotFound(*uid)),
        };
        let (source, released) = entity.retire(attribution)?;
        keeper.bury(uid);
        self.shared.directory.lock()?.remove(uid);
        drop(keeper);
        entity.notify(&DependencyEvent::Retired, &source, released);
        Ok(())
    }

    /// Number of live entities. Like [`Store::get`], a poisoned registry is
    /// logged and reads as empty.
    pub fn len(&self) -> usize {
        match self.keeper.lock() {
            Ok(keeper) => keeper.len(),
            Err(e) => {
                warn!(error = %e, "entity registry poisoned");
                0
            }
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Uids of every live entity, in order.
    pub fn uids(&self) -> Result<Vec<Uid>> {
        let keeper = self.keeper.lock()?;
        let mut uids: Vec<Uid> = keeper.kept.keys().copied().collect();
        uids.sort_unstable();
        Ok(uids)
    }
    pub fn dependents(&self, uid: &Uid) -> Result<Option<Dependents>> {
        Ok(self.shared.graph.lock()?.dependents(uid).cloned())
    }
    /// Number of live entities per kind tag.
    pub fn census(&self) -> Result<BTreeMap<String, usize>> {
        let keeper = self.keeper.lock()?;
        let mut census = BTreeMap::new();
        for entity in keeper.kept.values() {
            *census.entry(entity.kind().tag().to_owned()).or_insert(0) += 1;
        }
        Ok(census)
    }

    // ------------- Sessions -------------
    pub fn session(&self) -> Session<'_> {
        self.session_as(self.shared.attribution())
    }
    /// Starts a batch of updates attributed to `attribution`, committed in
    /// one save. See [`Session`].
    pub fn session_as(&self, attribution: Attribution) -> Session<'_> {
        Session::new(&self.shared, attribution)
    }

    // ------------- Sweeping -------------
    /// Uids of every live entity reachable from `roots` along `depends_on`
    /// edges, the live roots included.
    pub fn reachable(&self, roots: &[Uid]) -> Result<BTreeSet<Uid>> {
        Ok(self.shared.graph.lock()?.reachable(roots.iter().copied()))
    }

    pub fn sweep(&self, roots: &[Uid]) -> Result<usize> {
        self.sweep_as(&self.shared.attribution().because("sweep"), roots)
    }

    /// Retires every live entity that cannot be reached from `roots`,
    /// dependents before what they depend on. Unreachable entities kept
    /// alive by a cycle among themselves stay. Every retirement is its own
    /// commit, so on error those already retired stay retired. Returns the
    /// number of entities retired.
    pub fn sweep_as(&self, attribution: &Attribution, roots: &[Uid]) -> Result<usize> {
        let mut keeper = self.keeper.lock()?;
        let reachable = self.shared.graph.lock()?.reachable(roots.iter().copied());
        let mut pending: BTreeSet<Uid> = keeper.kept.keys().filter(|uid| !reachable.contains(*uid)).copied().collect();
        let mut retired = Vec::new();
        loop {
            let ready: Vec<Uid> = {
                let graph = self.shared.graph.lock()?;
                pending
                    .iter()
                    .filter(|uid| graph.dependents(uid).is_none_or(|d| d.depended_by().iter().all(|by| by == *uid)))
                    .copied()
                    .collect()
            };
            if ready.is_empty() {
                break;
            }
            for uid in ready {
                pending.remove(&uid);
                let Some(entity) = keeper.get(&uid) else { continue };
                let (source, released) = entity.retire(attribution)?;
                keeper.bury(&uid);
                self.shared.directory.lock()?.remove(&uid);
                retired.push((entity, source, released));
            }
        }
        drop(keeper);
        if !pending.is_empty() {
            warn!(entities = pending.len(), "unreachable entities on cycles were kept");
        }
        for (entity, source, released) in &retired {
            entity.notify(&DependencyEvent::Retired, source, released.iter().copied());
        }
        info!(retired = retired.len(), roots = roots.len(), "store swept");
        Ok(retired.len())
    }

    /// Replays the log of every live entity against its record and checks
    /// that the dependency graph is symmetric. Returns the number of
    /// entities verified.
    pub fn verify(&self) -> Result<usize> {
        let entities: Vec<EntityRef> = self.keeper.lock()?.kept.values().cloned().collect();
        for entity in &entities {
            if entity.replay()? != entity.record()? {
                return Err(KeepsakeError::LogConflict {
                    uid: entity.uid(),
                    message: "replay differs from the record".into(),
                });
            }
        }
        let asymmetries = self.shared.graph.lock()?.asymmetries();
        if let Some(first) = asymmetries.first() {
            return Err(KeepsakeError::corrupt(format!(
                "{} one-sided dependencies, first {:?} -> {:?}",
                asymmetries.len(),
                first.from,
                first.to
            )));
        }
        debug!(entities = entities.len(), "store verified");
        Ok(entities.len())
    }

    // ------------- Hydration -------------
    /// Registers persisted entities. The whole batch is checked before
    /// anything is registered, so a failure leaves the store untouched and
    /// the same batch can be retried. Entities that are already live (or
    /// already retired) are skipped. Returns the number of entities newly
    /// registered, live or retired.
    pub fn hydrate_all(&self, batch: Vec<PersistedEntity>) -> Result<usize> {
        let mut keeper = self.keeper.lock()?;
        let mut graph = self.shared.graph.lock()?;
        let mut directory = self.shared.directory.lock()?;

        let mut fresh: BTreeMap<Uid, PersistedEntity> = BTreeMap::new();
        for persisted in batch {
            let uid = persisted.record.uid();
            if keeper.get(&uid).is_some() || keeper.is_retired(&uid) {
                continue;
            }
            if fresh.insert(uid, persisted).is_some() {
                return Err(KeepsakeError::corrupt(format!("{:?} appears twice", uid)));
            }
        }

        let mut scales: HashMap<String, u32> = keeper.scales.clone();
        let mut restored: Vec<(Arc<dyn EntityKind>, EntityLog)> = Vec::with_capacity(fresh.len());
        for (uid, persisted) in &fresh {
            let record = &persisted.record;
            let kind = self
                .kinds
                .get(record.kind())
                .ok_or_else(|| KeepsakeError::corrupt(format!("{:?} has unknown kind '{}'", uid, record.kind())))?;
            let recomputed = CanonicalKey::new(kind.as_ref(), record.key(), record.scale())
                .map_err(|e| KeepsakeError::corrupt(format!("key of {:?} is invalid: {}", uid, e)))?
                .uid();
            if recomputed != *uid {
                return Err(KeepsakeError::corrupt(format!("key of {:?} derives {:?}", uid, recomputed)));
            }
            match scales.entry(record.kind().to_owned()) {
                Entry::Occupied(e) if *e.get() != record.scale() => {
                    return Err(KeepsakeError::corrupt(format!(
                        "{:?} has scale {} but {} uses {}",
                        uid,
                        record.scale(),
                        record.kind(),
                        e.get()
                    )));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(e) => {
                    e.insert(record.scale());
                }
            }
            let log = EntityLog::restore(*uid, persisted.log.clone())
                .map_err(|e| KeepsakeError::corrupt(format!("log of {:?} does not replay: {}", uid, e)))?;
            if log.record() != Some(record) {
                return Err(KeepsakeError::corrupt(format!("log of {:?} does not match its record", uid)));
            }
            restored.push((kind, log));
        }

        // dependencies as the records claim them, references in keys included
        let mut depended_by: BTreeMap<Uid, BTreeSet<Uid>> = BTreeMap::new();
        for (uid, persisted) in &fresh {
            for target in persisted.record.links().keys() {
                let known = match fresh.get(target) {
                    Some(other) => !other.record.is_retired(),
                    None => graph.contains(target),
                };
                if !known {
                    return Err(KeepsakeError::corrupt(format!("{:?} depends on missing {:?}", uid, target)));
                }
                depended_by.entry(*target).or_default().insert(*uid);
            }
        }
        for (uid, persisted) in &fresh {
            let expected = Dependents::new(
                persisted.record.links().keys().copied().collect(),
                depended_by.remove(uid).unwrap_or_default(),
            );
            if persisted.dependents != expected {
                return Err(KeepsakeError::corrupt(format!("dependents of {:?} disagree with the links", uid)));
            }
        }

        let hydrated = restored.len();
        let mut edges = Vec::new();
        for (kind, log) in restored {
            let uid = log.uid();
            match log.record() {
                Some(record) if record.is_retired() => {
                    keeper.retired.insert(uid);
                }
                Some(record) => {
                    edges.extend(record.links().keys().map(|to| (uid, *to)));
                    graph.insert_node(uid);
                    let (entity, _) = keeper.keep(Entity::restored(kind, log, Arc::clone(&self.shared)));
                    directory.insert(uid, Arc::downgrade(&entity));
                }
                None => {}
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        keeper.scales = scales;
        debug!(entities = hydrated, "entities hydrated");
        Ok(hydrated)
    }
}
