//! Literal formatting.
//!
//! Converts a [Value] into the literal text of a given [ProtocolRevision].
//! The revision differences are kept in two static [LiteralRules] tables;
//! [format_literal] is the only dispatch over them.
//! Formatting never depends on the process locale.

use base64::Engine;
use chrono::SecondsFormat;

use crate::error::Error;
use crate::value::{format_duration, ProtocolRevision, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryEncoding {
    Hex,
    Base64,
}

#[derive(Debug)]
struct LiteralRules {
    int64_suffix: &'static str,
    single_suffix: &'static str,
    double_suffix: &'static str,
    decimal_suffix: &'static str,
    datetime_prefix: Option<&'static str>,
    datetimeoffset_prefix: Option<&'static str>,
    duration_prefix: &'static str,
    guid_prefix: Option<&'static str>,
    binary: BinaryEncoding,
}

static LEGACY_RULES: LiteralRules = LiteralRules {
    int64_suffix: "L",
    single_suffix: "f",
    double_suffix: "d",
    decimal_suffix: "M",
    datetime_prefix: Some("datetime"),
    datetimeoffset_prefix: Some("datetimeoffset"),
    duration_prefix: "time",
    guid_prefix: Some("guid"),
    binary: BinaryEncoding::Hex,
};

static V4_RULES: LiteralRules = LiteralRules {
    int64_suffix: "",
    single_suffix: "",
    double_suffix: "",
    decimal_suffix: "",
    datetime_prefix: None,
    datetimeoffset_prefix: None,
    duration_prefix: "duration",
    guid_prefix: None,
    binary: BinaryEncoding::Base64,
};

fn rules(revision: ProtocolRevision) -> &'static LiteralRules {
    if revision.is_legacy() {
        &LEGACY_RULES
    } else {
        &V4_RULES
    }
}

/// Quote a string literal, doubling embedded quotes.
pub fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn prefixed(prefix: Option<&str>, body: String) -> String {
    match prefix {
        Some(prefix) => format!("{}'{}'", prefix, body),
        None => body,
    }
}

fn format_float(text: String, suffix: &str) -> String {
    match text.as_str() {
        "NaN" => "NaN".to_owned(),
        "inf" => "INF".to_owned(),
        "-inf" => "-INF".to_owned(),
        _ => {
            if text.contains('.') || text.contains('e') || text.contains('E') {
                format!("{}{}", text, suffix)
            } else {
                format!("{}.0{}", text, suffix)
            }
        }
    }
}

/// Format a value as protocol literal text.
///
/// Structured values are rejected; a caller holding one must decompose it first.
pub fn format_literal(value: &Value, revision: ProtocolRevision) -> Result<String, Error> {
    let rules = rules(revision);
    let text = match value {
        Value::Null => "null".to_owned(),
        Value::Boolean(b) => b.to_string(),
        Value::Byte(x) => x.to_string(),
        Value::SByte(x) => x.to_string(),
        Value::Int16(x) => x.to_string(),
        Value::Int32(x) => x.to_string(),
        Value::Int64(x) => format!("{}{}", x, rules.int64_suffix),
        Value::Single(x) => format_float(x.to_string(), rules.single_suffix),
        Value::Double(x) => format_float(x.to_string(), rules.double_suffix),
        Value::Decimal(d) => format!("{}{}", d, rules.decimal_suffix),
        Value::String(s) => quote_string(s),
        Value::DateTime(dt) => {
            let body = dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string();
            match rules.datetime_prefix {
                Some(prefix) => prefixed(Some(prefix), body),
                None => format!("{}Z", body),
            }
        }
        Value::DateTimeOffset(dt) => prefixed(
            rules.datetimeoffset_prefix,
            dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
        Value::Duration(d) => format!("{}'{}'", rules.duration_prefix, format_duration(d)),
        Value::Guid(g) => prefixed(rules.guid_prefix, g.hyphenated().to_string()),
        Value::Binary(bytes) => match rules.binary {
            BinaryEncoding::Hex => format!("X'{}'", hex::encode_upper(bytes)),
            BinaryEncoding::Base64 => format!(
                "binary'{}'",
                base64::engine::general_purpose::URL_SAFE.encode(bytes)
            ),
        },
        Value::Structured(_) => {
            return Err(Error::invalid_argument(format!(
                "A {} can't be formatted as a literal, decompose it into scalar values",
                value.type_name()
            )))
        }
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn strings_double_embedded_quotes() -> Result<(), Error> {
        let v = Value::from("O'Neil");
        assert_eq!(format_literal(&v, ProtocolRevision::V3)?, "'O''Neil'");
        assert_eq!(format_literal(&v, ProtocolRevision::V4)?, "'O''Neil'");
        Ok(())
    }

    #[test]
    fn int64_suffix_only_in_legacy() -> Result<(), Error> {
        assert_eq!(format_literal(&Value::Int64(1), ProtocolRevision::V2)?, "1L");
        assert_eq!(format_literal(&Value::Int64(1), ProtocolRevision::V3)?, "1L");
        assert_eq!(format_literal(&Value::Int64(1), ProtocolRevision::V4)?, "1");
        assert_eq!(format_literal(&Value::Int32(-7), ProtocolRevision::V2)?, "-7");
        Ok(())
    }

    #[test]
    fn floats_are_invariant() -> Result<(), Error> {
        assert_eq!(format_literal(&Value::Double(1.0), ProtocolRevision::V3)?, "1.0d");
        assert_eq!(format_literal(&Value::Double(1.25), ProtocolRevision::V4)?, "1.25");
        assert_eq!(format_literal(&Value::Single(0.5), ProtocolRevision::V2)?, "0.5f");
        assert_eq!(format_literal(&Value::Double(f64::NAN), ProtocolRevision::V4)?, "NaN");
        assert_eq!(
            format_literal(&Value::Double(f64::NEG_INFINITY), ProtocolRevision::V4)?,
            "-INF"
        );
        assert_eq!(
            format_literal(&Value::Decimal("1.5".parse().unwrap()), ProtocolRevision::V2)?,
            "1.5M"
        );
        Ok(())
    }

    #[test]
    fn dates_per_revision() -> Result<(), Error> {
        let dt = NaiveDate::from_ymd_opt(2014, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            format_literal(&Value::DateTime(dt), ProtocolRevision::V3)?,
            "datetime'2014-01-02T03:04:05'"
        );
        assert_eq!(
            format_literal(&Value::DateTime(dt), ProtocolRevision::V4)?,
            "2014-01-02T03:04:05Z"
        );
        let offset = chrono::FixedOffset::east_opt(3600).unwrap();
        let dto = offset.with_ymd_and_hms(2014, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            format_literal(&Value::DateTimeOffset(dto), ProtocolRevision::V2)?,
            "datetimeoffset'2014-01-02T03:04:05+01:00'"
        );
        assert_eq!(
            format_literal(&Value::Duration(chrono::Duration::minutes(90)), ProtocolRevision::V4)?,
            "duration'PT1H30M'"
        );
        Ok(())
    }

    #[test]
    fn guid_and_binary() -> Result<(), Error> {
        let g: uuid::Uuid = "0f8fad5b-d9cb-469f-a165-70867728950e".parse().unwrap();
        assert_eq!(
            format_literal(&Value::Guid(g), ProtocolRevision::V3)?,
            "guid'0f8fad5b-d9cb-469f-a165-70867728950e'"
        );
        assert_eq!(
            format_literal(&Value::Guid(g), ProtocolRevision::V4)?,
            "0f8fad5b-d9cb-469f-a165-70867728950e"
        );
        let b = Value::Binary(vec![0x0a, 0x0b]);
        assert_eq!(format_literal(&b, ProtocolRevision::V2)?, "X'0A0B'");
        assert_eq!(format_literal(&b, ProtocolRevision::V4)?, "binary'Cgs='");
        Ok(())
    }

    #[test]
    fn structured_values_are_rejected() {
        let v = Value::Structured(serde_json::json!({"Name": "x"}));
        let e = format_literal(&v, ProtocolRevision::V4).unwrap_err();
        assert_eq!(e.error_type, crate::error::ErrorType::InvalidArgument);
    }
}
