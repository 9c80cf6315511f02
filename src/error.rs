use thiserror::Error;

use crate::identity::Uid;

#[derive(Error, Debug)]
pub enum KeepsakeError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },
    #[error("Entity {0} is retired")]
    RetiredEntity(Uid),
    #[error("Entity {uid} is still depended on by {dependents} other entities")]
    ReferentialIntegrity { uid: Uid, dependents: usize },
    #[error("Entity {0} cannot reference itself")]
    SelfReference(Uid),
    #[error("No link from {from} to {to}")]
    NoSuchLink { from: Uid, to: Uid },
    #[error("Log conflict on {uid}: {message}")]
    LogConflict { uid: Uid, message: String },
    #[error("Corrupt state: {message}")]
    CorruptState { message: String },
    #[error("No entity with uid {0}")]
    NotFound(Uid),
    #[error("Unknown entity kind: {0}")]
    UnknownKind(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, KeepsakeError>;

impl KeepsakeError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptState { message: message.into() }
    }
}

// Helper conversions
impl From<rusqlite::Error> for KeepsakeError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<serde_json::Error> for KeepsakeError {
    fn from(e: serde_json::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<config::ConfigError> for KeepsakeError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for KeepsakeError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
