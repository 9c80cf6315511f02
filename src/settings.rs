//! Settings are layered: built-in defaults, then an optional settings file
//! (any format the `config` crate understands, `keepsake.toml` by default),
//! then `KEEPSAKE_*` environment variables.
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{KeepsakeError, Result};
use crate::persist::PersistenceMode;
use crate::store::{StoreConfig, DEFAULT_ACTOR, DEFAULT_SCALE};

pub const DEFAULT_FILE: &str = "keepsake";
pub const ENV_PREFIX: &str = "KEEPSAKE";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Path of the SQLite database, or `:memory:` for no durable storage.
    pub database: String,
    pub decimal_scale: u32,
    pub actor: String,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: ":memory:".into(),
            decimal_scale: DEFAULT_SCALE,
            actor: DEFAULT_ACTOR.into(),
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    /// Loads settings from `file` (without extension), or from `keepsake`
    /// in the working directory when none is given. A missing file is fine.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let defaults = Settings::default();
        let settings: Settings = Config::builder()
            .set_default("database", defaults.database)?
            .set_default("decimal_scale", i64::from(defaults.decimal_scale))?
            .set_default("actor", defaults.actor)?
            .set_default("log_filter", defaults.log_filter)?
            .add_source(File::with_name(file.unwrap_or(DEFAULT_FILE)).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<()> {
        if self.actor.trim().is_empty() {
            return Err(KeepsakeError::Config("actor must not be empty".into()));
        }
        // wider scales than this make little sense for money
        if self.decimal_scale > 18 {
            return Err(KeepsakeError::Config(format!(
                "decimal_scale {} is out of range 0..=18",
                self.decimal_scale
            )));
        }
        Ok(())
    }

    pub fn persistence_mode(&self) -> PersistenceMode {
        PersistenceMode::from_location(&self.database)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig { decimal_scale: self.decimal_scale, actor: self.actor.trim().to_owned() }
    }
}
