// used for decimal numbers
use bigdecimal::{BigDecimal, RoundingMode};
// used for dates
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// used when parsing a string to a decimal
use std::str::FromStr;
// used to print out readable forms of a value
use std::fmt;

use crate::identity::Uid;

// ------------- Value Types --------------
// The logical type of a field. The identifier takes part in identity
// hashing, so existing numbers must never be reassigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Reference,
}

impl ValueType {
    pub fn identifier(&self) -> u8 {
        match self {
            ValueType::Text => 1,
            ValueType::Integer => 2,
            ValueType::Decimal => 3,
            ValueType::Boolean => 4,
            ValueType::Date => 5,
            ValueType::Reference => 6,
        }
    }
    pub fn data_type(&self) -> &'static str {
        match self {
            ValueType::Text => "Text",
            ValueType::Integer => "Integer",
            ValueType::Decimal => "Decimal",
            ValueType::Boolean => "Boolean",
            ValueType::Date => "Date",
            ValueType::Reference => "Reference",
        }
    }
}
impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.data_type())
    }
}

// ------------- Values --------------
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(BigDecimal),
    Boolean(bool),
    Date(NaiveDate),
    Reference(Uid),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }
    // Returns None when the string is not a decimal number.
    pub fn decimal(s: &str) -> Option<Self> {
        BigDecimal::from_str(s.trim()).ok().map(Value::Decimal)
    }
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(ValueType::Text),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Decimal(_) => Some(ValueType::Decimal),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::Date(_) => Some(ValueType::Date),
            Value::Reference(_) => Some(ValueType::Reference),
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            Value::Decimal(d) => Some(d),
            _ => None,
        }
    }
    pub fn as_reference(&self) -> Option<Uid> {
        match self {
            Value::Reference(uid) => Some(*uid),
            _ => None,
        }
    }

    /// Converts the value into the representation stored for a field of
    /// type `target`, or `None` if the value has another logical type.
    ///
    /// Integers are accepted where decimals are expected. Text loses
    /// surrounding whitespace and decimals are rounded half-even to `scale`
    /// fractional digits, so that logically equal inputs end up equal.
    pub fn normalize(self, target: ValueType, scale: u32) -> Option<Value> {
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Text(s), ValueType::Text) => Some(Value::Text(s.trim().to_owned())),
            (Value::Integer(i), ValueType::Integer) => Some(Value::Integer(i)),
            (Value::Integer(i), ValueType::Decimal) => {
                Some(Value::Decimal(round(&BigDecimal::from(i), scale)))
            }
            (Value::Decimal(d), ValueType::Decimal) => Some(Value::Decimal(round(&d, scale))),
            (Value::Boolean(b), ValueType::Boolean) => Some(Value::Boolean(b)),
            (Value::Date(d), ValueType::Date) => Some(Value::Date(d)),
            (Value::Reference(u), ValueType::Reference) => Some(Value::Reference(u)),
            _ => None,
        }
    }

    // The textual form hashed into identities. Only meaningful for
    // values that went through normalize first.
    pub(crate) fn canonical(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Decimal(d) => d.to_plain_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Reference(u) => u.to_hex(),
        }
    }
}

fn round(d: &BigDecimal, scale: u32) -> BigDecimal {
    d.with_scale_round(i64::from(scale), RoundingMode::HalfEven)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Decimal(d) => write!(f, "{}", d.to_plain_string()),
            other => write!(f, "{}", other.canonical()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Self {
        Value::Decimal(d)
    }
}
impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}
impl From<Uid> for Value {
    fn from(u: Uid) -> Self {
        Value::Reference(u)
    }
}
