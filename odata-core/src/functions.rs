//! Supported filter functions.
//!
//! A static table maps canonical function names (and their aliases) to the
//! protocol names of each revision, the expected argument kinds and the
//! argument order. Lookups ignore case and underscores, so `starts_with`,
//! `StartsWith` and `startswith` all resolve to the same entry.

use crate::error::Error;
use crate::expression::Expression;
use crate::value::{ProtocolRevision, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    String,
    Integer,
    Any,
}

impl ArgumentKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgumentKind::String => value.is_string(),
            ArgumentKind::Integer => value.is_integer(),
            ArgumentKind::Any => !value.is_structured(),
        }
    }
}

#[derive(Debug)]
pub struct FunctionMapping {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
    pub legacy_name: Option<&'static str>,
    pub v4_name: Option<&'static str>,
    /// Arguments after the target.
    pub arguments: &'static [ArgumentKind],
    /// How many trailing arguments may be omitted.
    pub optional_arguments: usize,
    /// The legacy dialect puts the target after the arguments (`substringof('a',Name)`).
    pub target_last_in_legacy: bool,
}

const fn simple(canonical: &'static str, aliases: &'static [&'static str], name: &'static str) -> FunctionMapping {
    FunctionMapping {
        canonical,
        aliases,
        legacy_name: Some(name),
        v4_name: Some(name),
        arguments: &[],
        optional_arguments: 0,
        target_last_in_legacy: false,
    }
}

const fn with_string(canonical: &'static str, aliases: &'static [&'static str], name: &'static str) -> FunctionMapping {
    FunctionMapping {
        canonical,
        aliases,
        legacy_name: Some(name),
        v4_name: Some(name),
        arguments: &[ArgumentKind::String],
        optional_arguments: 0,
        target_last_in_legacy: false,
    }
}

static FUNCTIONS: &[FunctionMapping] = &[
    FunctionMapping {
        canonical: "contains",
        aliases: &[],
        legacy_name: Some("substringof"),
        v4_name: Some("contains"),
        arguments: &[ArgumentKind::String],
        optional_arguments: 0,
        target_last_in_legacy: true,
    },
    with_string("starts_with", &[], "startswith"),
    with_string("ends_with", &[], "endswith"),
    simple("len", &["length"], "length"),
    with_string("index_of", &["find"], "indexof"),
    FunctionMapping {
        canonical: "substring",
        aliases: &[],
        legacy_name: Some("substring"),
        v4_name: Some("substring"),
        arguments: &[ArgumentKind::Integer, ArgumentKind::Integer],
        optional_arguments: 1,
        target_last_in_legacy: false,
    },
    simple("to_lowercase", &["to_lower"], "tolower"),
    simple("to_uppercase", &["to_upper"], "toupper"),
    simple("trim", &[], "trim"),
    with_string("concat", &[], "concat"),
    FunctionMapping {
        canonical: "replace",
        aliases: &[],
        legacy_name: Some("replace"),
        v4_name: None,
        arguments: &[ArgumentKind::String, ArgumentKind::String],
        optional_arguments: 0,
        target_last_in_legacy: false,
    },
    simple("year", &[], "year"),
    simple("month", &[], "month"),
    simple("day", &[], "day"),
    simple("hour", &[], "hour"),
    simple("minute", &[], "minute"),
    simple("second", &[], "second"),
    FunctionMapping {
        canonical: "fractional_seconds",
        aliases: &[],
        legacy_name: None,
        v4_name: Some("fractionalseconds"),
        arguments: &[],
        optional_arguments: 0,
        target_last_in_legacy: false,
    },
    simple("round", &[], "round"),
    simple("floor", &[], "floor"),
    simple("ceiling", &["ceil"], "ceiling"),
];

/// Lower-case and drop underscores.
pub(crate) fn homogenize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Find a function by canonical name or alias, regardless of revision.
pub fn lookup(name: &str) -> Option<&'static FunctionMapping> {
    let name = homogenize(name);
    FUNCTIONS.iter().find(|f| {
        homogenize(f.canonical) == name || f.aliases.iter().any(|a| homogenize(a) == name)
    })
}

/// Canonical spelling of a known function name; unknown names are returned unchanged.
pub fn canonical_name(name: &str) -> String {
    lookup(name)
        .map(|f| f.canonical.to_owned())
        .unwrap_or_else(|| name.to_owned())
}

/// Find a function by the name it has on the wire in the given revision.
pub fn from_protocol_name(name: &str, revision: ProtocolRevision) -> Option<&'static FunctionMapping> {
    FUNCTIONS.iter().find(|f| f.protocol_name(revision) == Some(name))
}

/// Resolve a function for rendering in the given revision.
pub fn resolve(name: &str, revision: ProtocolRevision) -> Result<&'static FunctionMapping, Error> {
    match lookup(name) {
        Some(mapping) if mapping.protocol_name(revision).is_some() => Ok(mapping),
        _ => Err(Error::unsupported_function(name, revision)),
    }
}

impl FunctionMapping {
    pub fn protocol_name(&self, revision: ProtocolRevision) -> Option<&'static str> {
        if revision.is_legacy() {
            self.legacy_name
        } else {
            self.v4_name
        }
    }

    /// Zero-argument functions may also be written as member access (`Name.Length`).
    pub fn is_property_like(&self) -> bool {
        self.arguments.is_empty()
    }

    pub fn target_last(&self, revision: ProtocolRevision) -> bool {
        self.target_last_in_legacy && revision.is_legacy()
    }

    /// Check arity and the kinds of literal arguments.
    pub fn check_arguments(&self, args: &[Expression]) -> Result<(), Error> {
        let max = self.arguments.len();
        let min = max - self.optional_arguments;
        if args.len() < min || args.len() > max {
            return Err(Error::invalid_argument(format!(
                "Function '{}' expects {} argument(s), {} given",
                self.canonical,
                if min == max {
                    max.to_string()
                } else {
                    format!("{} to {}", min, max)
                },
                args.len()
            )));
        }
        for (i, (arg, kind)) in args.iter().zip(self.arguments.iter()).enumerate() {
            if let Expression::Literal(value) = arg {
                if !value.is_null() && !kind.accepts(value) {
                    return Err(Error::invalid_argument(format!(
                        "Argument #{} of function '{}' must be {:?}, got {}",
                        i + 1,
                        self.canonical,
                        kind,
                        value.type_name()
                    )));
                }
            }
        }
        Ok(())
    }
}
