//! Client settings.
//!
//! [ClientSettings] holds what a session needs to reach a service: the url
//! base, credentials and a few protocol options. Settings can be loaded from
//! YAML, JSON or (with the `toml` feature) TOML. The url base and the
//! credentials may refer to environment variables with `${VAR_NAME}`, see
//! [ClientSettings::expand_env_vars].
//!
//! # Example (YAML)
//! ```yaml
//! url_base: https://services.odata.org/V4/Northwind/Northwind.svc/
//! credentials:
//!   token: ${NORTHWIND_TOKEN}
//! protocol_revision: V4
//! include_annotations: true
//! ```

use crate::error::{Error, ErrorType};
use crate::value::ProtocolRevision;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Json,
    Atom,
}

impl Default for PayloadFormat {
    fn default() -> Self {
        PayloadFormat::Json
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Credentials {
    Basic { user: String, password: String },
    Token { token: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { user, .. } => write!(f, "Basic({}, ***)", user),
            Credentials::Token { .. } => write!(f, "Token(***)"),
        }
    }
}

fn default_boundary_prefix() -> String {
    "batch".to_owned()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub url_base: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Overrides the revision reported by the metadata.
    #[serde(default)]
    pub protocol_revision: Option<ProtocolRevision>,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    #[serde(default)]
    pub include_annotations: bool,
    #[serde(default = "default_boundary_prefix")]
    pub batch_boundary_prefix: String,
}

impl ClientSettings {
    pub fn new(url_base: &str) -> Self {
        ClientSettings {
            url_base: url_base.to_owned(),
            credentials: None,
            protocol_revision: None,
            payload_format: PayloadFormat::Json,
            include_annotations: false,
            batch_boundary_prefix: default_boundary_prefix(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_protocol_revision(mut self, revision: ProtocolRevision) -> Self {
        self.protocol_revision = Some(revision);
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::new(
                ErrorType::ConfigurationError,
                format!("Failed to parse YAML settings: {}", e),
            )
        })
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::new(
                ErrorType::ConfigurationError,
                format!("Failed to parse JSON settings: {}", e),
            )
        })
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(toml: &str) -> Result<Self, Error> {
        toml::from_str(toml).map_err(|e| {
            Error::new(
                ErrorType::ConfigurationError,
                format!("Failed to parse TOML settings: {}", e),
            )
        })
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization_error("settings to YAML", e))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::serialization_error("settings to JSON", e))
    }

    /// Expand `${VAR}` references in the url base and the credentials.
    ///
    /// Nothing is changed unless every reference resolves.
    pub fn expand_env_vars(&mut self) -> Result<(), Error> {
        let url_base = expand_field("url_base", &self.url_base)?;
        let credentials = match &self.credentials {
            Some(Credentials::Basic { user, password }) => Some(Credentials::Basic {
                user: expand_field("credentials.user", user)?,
                password: expand_field("credentials.password", password)?,
            }),
            Some(Credentials::Token { token }) => Some(Credentials::Token {
                token: expand_field("credentials.token", token)?,
            }),
            None => None,
        };
        self.url_base = url_base;
        self.credentials = credentials;
        Ok(())
    }

    /// Checked before a request writer is built from the settings.
    pub fn validate(&self) -> Result<(), Error> {
        if self.url_base.trim().is_empty() {
            return Err(Error::configuration_error("url_base is empty".to_owned()));
        }
        if self.batch_boundary_prefix.is_empty()
            || !self
                .batch_boundary_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::configuration_error(format!(
                "Invalid batch boundary prefix '{}'",
                self.batch_boundary_prefix
            )));
        }
        Ok(())
    }
}

/// Substitute `${NAME}` references in a settings field.
///
/// Errors name the field, never the value, since the value may be a secret.
fn expand_field(field: &str, input: &str) -> Result<String, Error> {
    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let reference = &rest[start + 2..];
        let end = reference.find('}').ok_or_else(|| {
            Error::configuration_error(format!(
                "Setting '{}' has an unclosed ${{...}} reference",
                field
            ))
        })?;
        let name = &reference[..end];
        let value = std::env::var(name).map_err(|_| {
            Error::configuration_error(format!(
                "Setting '{}' refers to the environment variable '{}', which is not set",
                field, name
            ))
        })?;
        expanded.push_str(&value);
        rest = &reference[end + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}
