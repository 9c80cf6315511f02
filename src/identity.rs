//! Deterministic identities derived from the logical key of an entity.
//!
//! A [`Uid`] is the BLAKE3 hash of a canonical encoding of the kind tag and
//! the normalized key fields, sorted by name. Deriving it is pure: the only
//! input besides the key is the decimal scale, which is passed explicitly so
//! that identities never follow ambient configuration.
use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::datatype::Value;
use crate::error::{KeepsakeError, Result};
use crate::kind::EntityKind;

pub type Fields = BTreeMap<String, Value>;

// bumped if the canonical encoding ever has to change
const DOMAIN: &[u8] = b"keepsake/uid/v1";

lazy_static! {
    static ref NAME_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9@_#-]+$").expect("valid name pattern");
}

/// Kind tags, field names and link roles share one naming rule.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

// ------------- Uid -------------
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid([u8; 32]);

impl Uid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}
impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", &self.to_hex()[..12])
    }
}
impl FromStr for Uid {
    type Err = KeepsakeError;
    fn from_str(s: &str) -> Result<Self> {
        blake3::Hash::from_hex(s)
            .map(|hash| Uid(*hash.as_bytes()))
            .map_err(|e| KeepsakeError::InvalidKey(format!("'{}' is not a uid: {}", s, e)))
    }
}
impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}
impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Uid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

// ------------- Canonical Key -------------
/// The normalized key of an entity of a given kind, from which its
/// [`Uid`] is derived.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CanonicalKey {
    kind: &'static str,
    fields: Fields,
    scale: u32,
}

impl CanonicalKey {
    /// Checks `raw` against the key declaration of `kind` and normalizes it.
    ///
    /// Fails with [`KeepsakeError::InvalidKey`] when a required key field is
    /// missing, an undeclared field is present, or a value has the wrong
    /// logical type. Domain rules on the key itself are the kind's business
    /// and surface as validation errors.
    pub fn new(kind: &dyn EntityKind, raw: &Fields, scale: u32) -> Result<Self> {
        let tag = kind.tag();
        if !is_valid_name(tag) {
            return Err(KeepsakeError::InvalidKey(format!("kind tag '{}' is not valid", tag)));
        }
        if let Some(unknown) = raw.keys().find(|name| !kind.key_fields().iter().any(|f| f.name == name.as_str())) {
            return Err(KeepsakeError::InvalidKey(format!(
                "'{}' is not a key field of {}",
                unknown, tag
            )));
        }
        let mut fields = Fields::new();
        for spec in kind.key_fields() {
            let value = raw.get(spec.name).cloned().unwrap_or(Value::Null);
            let normalized = value.normalize(spec.value_type, scale).ok_or_else(|| {
                KeepsakeError::InvalidKey(format!(
                    "key field '{}' of {} must be {}",
                    spec.name, tag, spec.value_type
                ))
            })?;
            // empty text carries no identity either
            let missing = match &normalized {
                Value::Null => true,
                Value::Text(s) => s.is_empty(),
                _ => false,
            };
            if missing {
                if spec.required {
                    return Err(KeepsakeError::InvalidKey(format!(
                        "key field '{}' of {} is missing",
                        spec.name, tag
                    )));
                }
                continue;
            }
            fields.insert(spec.name.to_owned(), normalized);
        }
        kind.validate_key(&fields)?;
        Ok(Self { kind: tag, fields, scale })
    }
    pub fn kind(&self) -> &'static str {
        self.kind
    }
    pub fn fields(&self) -> &Fields {
        &self.fields
    }
    pub fn into_fields(self) -> Fields {
        self.fields
    }
    pub fn scale(&self) -> u32 {
        self.scale
    }
    pub fn uid(&self) -> Uid {
        uid_of(self.kind, &self.fields)
    }
}

// Length prefixes keep distinct field sets from sharing an encoding.
fn uid_of(kind: &str, fields: &Fields) -> Uid {
    fn write(hasher: &mut Hasher, bytes: &[u8]) {
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN);
    write(&mut hasher, kind.as_bytes());
    hasher.update(&(fields.len() as u64).to_le_bytes());
    // BTreeMap iterates in lexicographic order of the field names
    for (name, value) in fields {
        write(&mut hasher, name.as_bytes());
        hasher.update(&[value.value_type().map_or(0, |t| t.identifier())]);
        write(&mut hasher, value.canonical().as_bytes());
    }
    Uid(hasher.finalize().into())
}

/// Derives the identity of an entity of `kind` with the key `raw`.
pub fn derive(kind: &dyn EntityKind, raw: &Fields, scale: u32) -> Result<Uid> {
    CanonicalKey::new(kind, raw, scale).map(|key| key.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{Account, Instrument};

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn whitespace_and_order_do_not_matter() {
        let a = fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]);
        let b = fields(&[("currency", "USD".into()), ("name", "Brokerage ".into())]);
        assert_eq!(derive(&Account, &a, 8).unwrap(), derive(&Account, &b, 8).unwrap());
    }

    #[test]
    fn different_keys_give_different_uids() {
        let a = fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]);
        let b = fields(&[("name", "Brokerage".into()), ("currency", "EUR".into())]);
        assert_ne!(derive(&Account, &a, 8).unwrap(), derive(&Account, &b, 8).unwrap());
    }

    #[test]
    fn missing_required_key_is_invalid() {
        let a = fields(&[("name", "Brokerage".into())]);
        assert!(matches!(derive(&Account, &a, 8), Err(KeepsakeError::InvalidKey(_))));
        let blank = fields(&[("name", "   ".into()), ("currency", "USD".into())]);
        assert!(matches!(derive(&Account, &blank, 8), Err(KeepsakeError::InvalidKey(_))));
    }

    #[test]
    fn wrong_type_and_unknown_fields_are_invalid() {
        let a = fields(&[("name", Value::Integer(7)), ("currency", "USD".into())]);
        assert!(matches!(derive(&Account, &a, 8), Err(KeepsakeError::InvalidKey(_))));
        let b = fields(&[
            ("name", "Brokerage".into()),
            ("currency", "USD".into()),
            ("colour", "blue".into()),
        ]);
        assert!(matches!(derive(&Account, &b, 8), Err(KeepsakeError::InvalidKey(_))));
    }

    #[test]
    fn optional_key_fields_may_be_absent() {
        let a = fields(&[("ticker", "AAPL".into()), ("currency", "USD".into())]);
        let b = fields(&[("ticker", "AAPL".into()), ("currency", "USD".into()), ("isin", Value::Null)]);
        assert_eq!(derive(&Instrument, &a, 8).unwrap(), derive(&Instrument, &b, 8).unwrap());
    }

    #[test]
    fn uid_hex_round_trips() {
        let a = fields(&[("name", "Brokerage".into()), ("currency", "USD".into())]);
        let uid = derive(&Account, &a, 8).unwrap();
        assert_eq!(uid.to_hex().len(), 64);
        assert_eq!(uid.to_hex().parse::<Uid>().unwrap(), uid);
        assert!("not-hex".parse::<Uid>().is_err());
    }
}
