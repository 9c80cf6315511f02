//! Entity kinds: the field declarations and domain rules of each kind of
//! entity the store keeps.
//!
//! A kind declares its key fields (which determine identity and can never
//! change), its mutable fields, and its rules for values and links. The
//! financial kinds shipped here are [`Account`], [`Instrument`], [`Ledger`]
//! (a position of an instrument held in an account) and [`Transaction`].
use bigdecimal::BigDecimal;
use lazy_static::lazy_static;
use regex::Regex;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::datatype::{Value, ValueType};
use crate::entity::Entity;
use crate::error::{KeepsakeError, Result};
use crate::identity::Fields;
use crate::record::EntityRecord;

lazy_static! {
    static ref CURRENCY: Regex = Regex::new(r"^[A-Z]{3}$").expect("valid currency pattern");
    static ref ISIN: Regex = Regex::new(r"^[A-Z]{2}[A-Z0-9]{9}[0-9]$").expect("valid isin pattern");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub value_type: ValueType,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, value_type: ValueType) -> Self {
        Self { name, value_type, required: true }
    }
    pub const fn optional(name: &'static str, value_type: ValueType) -> Self {
        Self { name, value_type, required: false }
    }
}

/// What happened to a related entity. Events are delivered after the change
/// is committed and never to the entity that changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencyEvent {
    /// A field of an entity this one depends on changed.
    Updated { field: String },
    /// An entity that depended on this one was retired.
    Retired,
}

impl fmt::Display for DependencyEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DependencyEvent::Updated { field } => write!(f, "updated {}", field),
            DependencyEvent::Retired => write!(f, "retired"),
        }
    }
}

pub trait EntityKind: fmt::Debug + Send + Sync {
    fn tag(&self) -> &'static str;
    fn key_fields(&self) -> &'static [FieldSpec];
    fn fields(&self) -> &'static [FieldSpec];
    /// Rules spanning the whole (normalized) key.
    fn validate_key(&self, _key: &Fields) -> Result<()> {
        Ok(())
    }
    /// Rules for a single normalized, correctly typed field value.
    fn validate(&self, _field: &str, _value: &Value) -> Result<()> {
        Ok(())
    }
    fn allows_self_reference(&self) -> bool {
        false
    }
    fn allows_cycles(&self) -> bool {
        true
    }
    /// Called on the kind of `entity` when the related entity `source` has
    /// committed a change. No locks are held, so the handler may change
    /// `entity` in turn. Errors are logged and do not undo the change.
    fn on_dependency_event(&self, _entity: &Entity, _event: &DependencyEvent, _source: &EntityRecord) -> Result<()> {
        Ok(())
    }
}

/// Normalizes `value` for the mutable field `field` and runs the kind's rules.
pub(crate) fn check_field(kind: &dyn EntityKind, field: &str, value: Value, scale: u32) -> Result<Value> {
    if kind.key_fields().iter().any(|f| f.name == field) {
        return Err(KeepsakeError::validation(field, "key fields are immutable"));
    }
    let spec = kind.fields().iter().find(|f| f.name == field).ok_or_else(|| {
        KeepsakeError::validation(field, format!("not a field of {}", kind.tag()))
    })?;
    let value = value
        .normalize(spec.value_type, scale)
        .ok_or_else(|| KeepsakeError::validation(field, format!("must be {}", spec.value_type)))?;
    if value.is_null() {
        if spec.required {
            return Err(KeepsakeError::validation(field, "is required"));
        }
        return Ok(value);
    }
    kind.validate(field, &value)?;
    Ok(value)
}

/// Checks and normalizes the initial fields of a new entity. Required fields
/// that are not given must be supplied up front.
pub(crate) fn check_initial(kind: &dyn EntityKind, initial: Fields, scale: u32) -> Result<Fields> {
    let mut checked = Fields::new();
    for (field, value) in initial {
        let value = check_field(kind, &field, value, scale)?;
        if !value.is_null() {
            checked.insert(field, value);
        }
    }
    if let Some(missing) = kind.fields().iter().find(|f| f.required && !checked.contains_key(f.name)) {
        return Err(KeepsakeError::validation(missing.name, "is required"));
    }
    Ok(checked)
}

fn non_negative(field: &str, value: &Value) -> Result<()> {
    match value.as_decimal() {
        Some(d) if *d < BigDecimal::from(0) => Err(KeepsakeError::validation(field, "must not be negative")),
        _ => Ok(()),
    }
}

fn currency(field: &str, value: &Value) -> Result<()> {
    match value.as_text() {
        Some(code) if !CURRENCY.is_match(code) => {
            Err(KeepsakeError::validation(field, format!("'{}' is not an ISO 4217 code", code)))
        }
        _ => Ok(()),
    }
}

fn one_of(field: &str, value: &Value, allowed: &[&str]) -> Result<()> {
    match value.as_text() {
        Some(s) if !allowed.contains(&s) => Err(KeepsakeError::validation(
            field,
            format!("'{}' is not one of {}", s, allowed.join(", ")),
        )),
        _ => Ok(()),
    }
}

// ------------- Account -------------
#[derive(Debug, Clone, Copy, Default)]
pub struct Account;

impl EntityKind for Account {
    fn tag(&self) -> &'static str {
        "account"
    }
    fn key_fields(&self) -> &'static [FieldSpec] {
        const KEY: &[FieldSpec] = &[
            FieldSpec::required("name", ValueType::Text),
            FieldSpec::required("currency", ValueType::Text),
        ];
        KEY
    }
    fn fields(&self) -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[
            FieldSpec::optional("balance", ValueType::Decimal),
            FieldSpec::optional("description", ValueType::Text),
            FieldSpec::optional("closed", ValueType::Boolean),
        ];
        FIELDS
    }
    fn validate_key(&self, key: &Fields) -> Result<()> {
        key.get("currency").map_or(Ok(()), |v| currency("currency", v))
    }
}

// ------------- Instrument -------------
pub const INSTRUMENT_TYPES: &[&str] = &["equity", "bond", "fund", "option", "cash"];

#[derive(Debug, Clone, Copy, Default)]
pub struct Instrument;

impl EntityKind for Instrument {
    fn tag(&self) -> &'static str {
        "instrument"
    }
    fn key_fields(&self) -> &'static [FieldSpec] {
        const KEY: &[FieldSpec] = &[
            FieldSpec::optional("isin", ValueType::Text),
            FieldSpec::optional("ticker", ValueType::Text),
            FieldSpec::required("currency", ValueType::Text),
        ];
        KEY
    }
    fn fields(&self) -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[
            FieldSpec::optional("name", ValueType::Text),
            FieldSpec::optional("instrument_type", ValueType::Text),
        ];
        FIELDS
    }
    fn validate_key(&self, key: &Fields) -> Result<()> {
        if !key.contains_key("isin") && !key.contains_key("ticker") {
            return Err(KeepsakeError::InvalidKey("an instrument needs an isin or a ticker".into()));
        }
        if let Some(Value::Text(isin)) = key.get("isin") {
            if !ISIN.is_match(isin) {
                return Err(KeepsakeError::validation("isin", format!("'{}' is not an ISIN", isin)));
            }
        }
        key.get("currency").map_or(Ok(()), |v| currency("currency", v))
    }
    fn validate(&self, field: &str, value: &Value) -> Result<()> {
        match field {
            "instrument_type" => one_of(field, value, INSTRUMENT_TYPES),
            _ => Ok(()),
        }
    }
}

// ------------- Ledger -------------
// The position of one instrument within one account.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ledger;

impl EntityKind for Ledger {
    fn tag(&self) -> &'static str {
        "ledger"
    }
    fn key_fields(&self) -> &'static [FieldSpec] {
        const KEY: &[FieldSpec] = &[
            FieldSpec::required("account", ValueType::Reference),
            FieldSpec::required("instrument", ValueType::Reference),
        ];
        KEY
    }
    fn fields(&self) -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[
            FieldSpec::optional("quantity", ValueType::Decimal),
            FieldSpec::optional("cost_basis", ValueType::Decimal),
        ];
        FIELDS
    }
    fn validate(&self, field: &str, value: &Value) -> Result<()> {
        match field {
            "cost_basis" => non_negative(field, value),
            _ => Ok(()),
        }
    }
}

// ------------- Transaction -------------
pub const TRANSACTION_TYPES: &[&str] = &["buy", "sell", "dividend", "interest", "fee"];

#[derive(Debug, Clone, Copy, Default)]
pub struct Transaction;

impl EntityKind for Transaction {
    fn tag(&self) -> &'static str {
        "transaction"
    }
    fn key_fields(&self) -> &'static [FieldSpec] {
        const KEY: &[FieldSpec] = &[
            FieldSpec::required("account", ValueType::Reference),
            FieldSpec::required("reference", ValueType::Text),
            FieldSpec::required("date", ValueType::Date),
        ];
        KEY
    }
    fn fields(&self) -> &'static [FieldSpec] {
        const FIELDS: &[FieldSpec] = &[
            FieldSpec::optional("type", ValueType::Text),
            FieldSpec::optional("quantity", ValueType::Decimal),
            FieldSpec::optional("consideration", ValueType::Decimal),
            FieldSpec::optional("fees", ValueType::Decimal),
            FieldSpec::optional("currency", ValueType::Text),
        ];
        FIELDS
    }
    fn validate(&self, field: &str, value: &Value) -> Result<()> {
        match field {
            "type" => one_of(field, value, TRANSACTION_TYPES),
            "fees" => non_negative(field, value),
            "currency" => currency(field, value),
            _ => Ok(()),
        }
    }
    // a transaction only ever points at things it settles against
    fn allows_cycles(&self) -> bool {
        false
    }
}

// ------------- Kinds -------------
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: HashMap<&'static str, Arc<dyn EntityKind>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// The financial kinds: account, instrument, ledger and transaction.
    pub fn financial() -> Self {
        let mut registry = Self::new();
        registry.register(Account);
        registry.register(Instrument);
        registry.register(Ledger);
        registry.register(Transaction);
        registry
    }
    // Registering a tag twice replaces the earlier kind.
    pub fn register<K: EntityKind + 'static>(&mut self, kind: K) -> Arc<dyn EntityKind> {
        let kind: Arc<dyn EntityKind> = Arc::new(kind);
        self.kinds.insert(kind.tag(), Arc::clone(&kind));
        kind
    }
    pub fn get(&self, tag: &str) -> Option<Arc<dyn EntityKind>> {
        self.kinds.get(tag).map(Arc::clone)
    }
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.kinds.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
    pub fn len(&self) -> usize {
        self.kinds.len()
    }
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_fields_cannot_be_mutated() {
        let err = check_field(&Account, "name", "Other".into(), 8).unwrap_err();
        assert!(matches!(err, KeepsakeError::Validation { .. }));
    }

    #[test]
    fn undeclared_and_mistyped_fields_are_rejected() {
        assert!(check_field(&Account, "colour", "blue".into(), 8).is_err());
        assert!(check_field(&Account, "balance", "lots".into(), 8).is_err());
    }

    #[test]
    fn kind_rules_apply() {
        assert!(check_field(&Transaction, "type", "buy".into(), 8).is_ok());
        assert!(check_field(&Transaction, "type", "gift".into(), 8).is_err());
        assert!(check_field(&Transaction, "fees", Value::decimal("-1").unwrap(), 8).is_err());
        assert!(check_field(&Instrument, "instrument_type", "bond".into(), 8).is_ok());
    }

    #[test]
    fn instruments_need_an_isin_or_ticker() {
        let mut key = Fields::new();
        key.insert("currency".into(), "USD".into());
        assert!(Instrument.validate_key(&key).is_err());
        key.insert("isin".into(), "US0378331005".into());
        assert!(Instrument.validate_key(&key).is_ok());
    }

    #[test]
    fn registry_knows_the_financial_kinds() {
        let registry = KindRegistry::financial();
        assert_eq!(registry.tags(), vec!["account", "instrument", "ledger", "transaction"]);
        assert!(registry.get("transaction").is_some_and(|k| !k.allows_cycles()));
        assert!(registry.get("portfolio").is_none());
    }
}
