//! Keepsake – an entity identity & audit store for financial records.
//!
//! Keepsake keeps exactly one live instance of every logical record, such as
//! an account, an instrument, a ledger position or a transaction, and keeps
//! an append-only trail of everything that ever happened to it:
//! * An [`identity::Uid`] is derived deterministically from the kind of an
//!   entity and its normalized key fields, so logically identical requests
//!   always meet the same entity.
//! * An [`entity::Entity`] owns an [`log::EntityLog`] whose entries are
//!   hash-chained. The log is the source of truth and projects the
//!   [`record::EntityRecord`], the snapshot that gets persisted.
//! * A [`dependents::DependencyGraph`] tracks which entities depend on which,
//!   in both directions, so nothing can be retired while others still rely
//!   on it. References in a key are dependencies too, and kinds can react
//!   to changes of the entities they depend on through
//!   [`kind::EntityKind::on_dependency_event`].
//!
//! All of these are owned by a [`store::Store`], which is created explicitly
//! and passed around rather than reached through a global.
//!
//! ## Modules
//! * [`identity`] – Uids, canonical keys and name rules.
//! * [`datatype`] – The [`datatype::Value`]s fields carry and how they are normalized.
//! * [`kind`] – The [`kind::EntityKind`] trait plus the financial kinds.
//! * [`record`], [`log`], [`dependents`] – What an entity is made of.
//! * [`entity`], [`store`] – The live objects and their registry.
//! * [`session`] – Updates of several entities committed as one.
//! * [`persist`] – The [`persist::Persistor`] trait with SQLite and in-memory backends.
//! * [`settings`], [`telemetry`] – Configuration and logging bootstrap.
//!
//! ## Decimal Scale
//! Decimals are rounded half-even to a fixed scale before they are hashed or
//! stored. The scale comes from the settings, but only for kinds that have
//! no entities yet: every record remembers the scale it was created with and
//! later normalization for that kind keeps using it, so changing the setting
//! never changes an existing Uid.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use keepsake::{Fields, KindRegistry, MemoryPersistor, Store, StoreConfig, Value};
//!
//! let store = Store::new(StoreConfig::default(), KindRegistry::financial(), Arc::new(MemoryPersistor::new()));
//! let mut key = Fields::new();
//! key.insert("name".into(), "Brokerage".into());
//! key.insert("currency".into(), "USD".into());
//! let account = store.get_or_create("account", key, Fields::new()).unwrap();
//! account.mutate("balance", Value::decimal("100.00").unwrap()).unwrap();
//! assert_eq!(account.log().unwrap().len(), 2);
//! assert_eq!(account.replay().unwrap(), account.record().unwrap());
//! ```

pub mod datatype;
pub mod dependents;
pub mod entity;
pub mod error;
pub mod identity;
pub mod kind;
pub mod log;
pub mod persist;
pub mod record;
pub mod session;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use datatype::{Value, ValueType};
pub use dependents::Dependents;
pub use entity::{Entity, EntityRef};
pub use error::{KeepsakeError, Result};
pub use identity::{Fields, Uid};
pub use kind::{DependencyEvent, EntityKind, FieldSpec, KindRegistry};
pub use log::{Attribution, Change, LogEntry};
pub use persist::{MemoryPersistor, PersistenceMode, Persistor, SqlitePersistor};
pub use record::{EntityRecord, Lifecycle};
pub use session::Session;
pub use settings::Settings;
pub use store::{Store, StoreConfig};
