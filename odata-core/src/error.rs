use itertools::Itertools;

use std::error;
use std::fmt;
use std::fmt::Display;

use crate::value::ProtocolRevision;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum ErrorType {
    UnsupportedExpression,
    UnknownMember,
    UnsupportedFunction,
    InvalidArgument,
    AmbiguousKeyCollapse,
    Cancelled,
    MetadataResolution,
    ParseError,
    ConfigurationError,
    SerializationError,
    TransportError,
    General,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Error {
    pub error_type: ErrorType,
    pub message: String,
    pub collection: Option<String>,
    pub command: Option<String>,
}

impl Error {
    pub fn new(error_type: ErrorType, message: String) -> Self {
        Error {
            error_type,
            message,
            collection: None,
            command: None,
        }
    }

    pub fn from_error<E: Display>(error_type: ErrorType, error: E) -> Self {
        Error::new(error_type, error.to_string())
    }

    pub fn from_result<T, E: Display>(error_type: ErrorType, result: Result<T, E>) -> Result<T, Self> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(Error::from_error(error_type, e)),
        }
    }

    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_owned());
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_owned());
        self
    }

    /// The front end met an expression shape it cannot translate.
    pub fn unsupported_expression<K: Display>(kind: K) -> Self {
        Error::new(
            ErrorType::UnsupportedExpression,
            format!("Not supported expression of type {}", kind),
        )
    }

    pub fn unsupported_expression_with_message(message: String) -> Self {
        Error::new(ErrorType::UnsupportedExpression, message)
    }

    pub fn unknown_member(collection: &str, path: &[String]) -> Self {
        Error {
            error_type: ErrorType::UnknownMember,
            message: format!(
                "Member '{}' not found in '{}'",
                path.iter().join("."),
                collection
            ),
            collection: Some(collection.to_owned()),
            command: None,
        }
    }

    pub fn unknown_collection(name: &str) -> Self {
        Error {
            error_type: ErrorType::UnknownMember,
            message: format!("Collection '{}' not found", name),
            collection: Some(name.to_owned()),
            command: None,
        }
    }

    pub fn unsupported_function(name: &str, revision: ProtocolRevision) -> Self {
        Error::new(
            ErrorType::UnsupportedFunction,
            format!("Function '{}' is not supported in protocol {}", name, revision),
        )
    }

    pub fn invalid_argument(message: String) -> Self {
        Error::new(ErrorType::InvalidArgument, message)
    }

    pub fn ambiguous_key_collapse(key: &str) -> Self {
        Error::new(
            ErrorType::AmbiguousKeyCollapse,
            format!("Key property '{}' is bound to conflicting values", key),
        )
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorType::Cancelled, "Operation was cancelled".to_string())
    }

    pub fn metadata_resolution(url_base: &str, message: &(impl Display + ?Sized)) -> Self {
        Error::new(
            ErrorType::MetadataResolution,
            format!("Failed to resolve metadata for '{}': {}", url_base, message),
        )
    }

    pub fn parse_error(text: &str, err: &str, offset: usize) -> Self {
        Error::new(
            ErrorType::ParseError,
            format!("Can't parse '{}' at position {}: {}", text, offset, err),
        )
    }

    pub fn configuration_error(message: String) -> Self {
        Error::new(ErrorType::ConfigurationError, message)
    }

    pub fn serialization_error<E: Display>(what: &str, error: E) -> Self {
        Error::new(
            ErrorType::SerializationError,
            format!("Can't serialize {}: {}", what, error),
        )
    }

    pub fn transport_error(message: String) -> Self {
        Error::new(ErrorType::TransportError, message)
    }

    pub fn general_error(message: String) -> Self {
        Error::new(ErrorType::General, message)
    }

    /// Returns true if the operation was abandoned by its caller,
    /// as opposed to failing in transport or in the protocol.
    pub fn is_cancelled(&self) -> bool {
        self.error_type == ErrorType::Cancelled
    }

    pub fn is_unsupported_expression(&self) -> bool {
        self.error_type == ErrorType::UnsupportedExpression
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} (command '{}')", self.message, command),
            None => write!(f, "{}", self.message),
        }
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_command() {
        let e = Error::unknown_member("Products", &["Category".to_owned(), "Nmae".to_owned()])
            .with_command("Products?$filter=...");
        assert_eq!(e.error_type, ErrorType::UnknownMember);
        assert_eq!(e.collection.as_deref(), Some("Products"));
        assert_eq!(
            e.to_string(),
            "Member 'Category.Nmae' not found in 'Products' (command 'Products?$filter=...')"
        );
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(Error::cancelled().is_cancelled());
        assert!(!Error::transport_error("timeout".to_owned()).is_cancelled());
    }
}
