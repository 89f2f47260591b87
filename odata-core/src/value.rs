use std::fmt::Display;

use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Wire-format generation of the target service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolRevision {
    V2,
    V3,
    V4,
}

impl ProtocolRevision {
    /// V2 and V3 share the older literal and function dialect.
    pub fn is_legacy(&self) -> bool {
        *self != ProtocolRevision::V4
    }
}

impl Default for ProtocolRevision {
    fn default() -> Self {
        ProtocolRevision::V4
    }
}

impl Display for ProtocolRevision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolRevision::V2 => write!(f, "V2"),
            ProtocolRevision::V3 => write!(f, "V3"),
            ProtocolRevision::V4 => write!(f, "V4"),
        }
    }
}

/// A typed scalar (or an opaque structured value) that can appear as a literal
/// in a filter, a key segment or a function argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(u8),
    SByte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Single(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Duration(chrono::Duration),
    Guid(Uuid),
    Binary(Vec<u8>),
    /// Compound value, e.g. a captured object or a constructed projection.
    /// It is not literal-formattable and must be decomposed by the caller.
    Structured(serde_json::Value),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "Edm.Boolean",
            Value::Byte(_) => "Edm.Byte",
            Value::SByte(_) => "Edm.SByte",
            Value::Int16(_) => "Edm.Int16",
            Value::Int32(_) => "Edm.Int32",
            Value::Int64(_) => "Edm.Int64",
            Value::Single(_) => "Edm.Single",
            Value::Double(_) => "Edm.Double",
            Value::Decimal(_) => "Edm.Decimal",
            Value::String(_) => "Edm.String",
            Value::DateTime(_) => "Edm.DateTime",
            Value::DateTimeOffset(_) => "Edm.DateTimeOffset",
            Value::Duration(_) => "Edm.Duration",
            Value::Guid(_) => "Edm.Guid",
            Value::Binary(_) => "Edm.Binary",
            Value::Structured(_) => "structured value",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::Byte(_) | Value::SByte(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_)
        )
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Value::Structured(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Converts a JSON scalar. Whole numbers become `Int32` when they fit, otherwise `Int64`.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(i) => Value::Int32(i),
                        Err(_) => Value::Int64(i),
                    }
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::Structured(other.clone()),
        }
    }

    /// JSON representation used in request bodies.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Byte(x) => Json::from(*x),
            Value::SByte(x) => Json::from(*x),
            Value::Int16(x) => Json::from(*x),
            Value::Int32(x) => Json::from(*x),
            Value::Int64(x) => Json::from(*x),
            Value::Single(x) => float_to_json(*x as f64),
            Value::Double(x) => float_to_json(*x),
            Value::Decimal(d) => Json::String(d.to_string()),
            Value::String(s) => Json::String(s.clone()),
            Value::DateTime(dt) => Json::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::DateTimeOffset(dt) => {
                Json::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Duration(d) => Json::String(format_duration(d)),
            Value::Guid(g) => Json::String(g.hyphenated().to_string()),
            Value::Binary(b) => {
                Json::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Structured(v) => v.clone(),
        }
    }
}

fn float_to_json(x: f64) -> serde_json::Value {
    match serde_json::Number::from_f64(x) {
        Some(n) => serde_json::Value::Number(n),
        None => serde_json::Value::String(x.to_string()),
    }
}

/// ISO 8601 duration, e.g. `PT1H30M` or `-P1DT2.5S`.
pub(crate) fn format_duration(duration: &chrono::Duration) -> String {
    let negative = *duration < chrono::Duration::zero();
    let duration = if negative { -*duration } else { *duration };
    let days = duration.num_days();
    let hours = duration.num_hours() % 24;
    let minutes = duration.num_minutes() % 60;
    let seconds = duration.num_seconds() % 60;
    let nanos = (duration - chrono::Duration::seconds(duration.num_seconds()))
        .num_nanoseconds()
        .unwrap_or(0);

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    text.push('P');
    if days > 0 {
        text.push_str(&format!("{}D", days));
    }
    if hours > 0 || minutes > 0 || seconds > 0 || nanos > 0 || days == 0 {
        text.push('T');
        if hours > 0 {
            text.push_str(&format!("{}H", hours));
        }
        if minutes > 0 {
            text.push_str(&format!("{}M", minutes));
        }
        if nanos > 0 {
            let fraction = format!("{:09}", nanos);
            text.push_str(&format!("{}.{}S", seconds, fraction.trim_end_matches('0')));
        } else if seconds > 0 || (hours == 0 && minutes == 0) {
            text.push_str(&format!("{}S", seconds));
        }
    }
    text
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<u8> for Value {
    fn from(x: u8) -> Self {
        Value::Byte(x)
    }
}
impl From<i8> for Value {
    fn from(x: i8) -> Self {
        Value::SByte(x)
    }
}
impl From<i16> for Value {
    fn from(x: i16) -> Self {
        Value::Int16(x)
    }
}
impl From<i32> for Value {
    fn from(x: i32) -> Self {
        Value::Int32(x)
    }
}
impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Int64(x)
    }
}
impl From<f32> for Value {
    fn from(x: f32) -> Self {
        Value::Single(x)
    }
}
impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Double(x)
    }
}
impl From<Decimal> for Value {
    fn from(x: Decimal) -> Self {
        Value::Decimal(x)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}
impl From<NaiveDateTime> for Value {
    fn from(x: NaiveDateTime) -> Self {
        Value::DateTime(x)
    }
}
impl From<DateTime<FixedOffset>> for Value {
    fn from(x: DateTime<FixedOffset>) -> Self {
        Value::DateTimeOffset(x)
    }
}
impl From<chrono::Duration> for Value {
    fn from(x: chrono::Duration) -> Self {
        Value::Duration(x)
    }
}
impl From<Uuid> for Value {
    fn from(x: Uuid) -> Self {
        Value::Guid(x)
    }
}
impl From<Vec<u8>> for Value {
    fn from(x: Vec<u8>) -> Self {
        Value::Binary(x)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(x: Option<T>) -> Self {
        match x {
            Some(x) => x.into(),
            None => Value::Null,
        }
    }
}
