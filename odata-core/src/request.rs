//! Request descriptors and the request writer.
//!
//! The compiler produces a [RequestDescriptor]: method, command text relative
//! to the service root, optional JSON body. A [RequestWriter] turns
//! descriptors into [TransportRequest]s and batches into a single
//! `multipart/mixed` request.

use std::fmt::Display;

use tracing::trace;
use url::Url;
use uuid::Uuid;

use crate::command::ContentRef;
use crate::error::{Error, ErrorType};
use crate::settings::{ClientSettings, PayloadFormat};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Merge,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Merge => "MERGE",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compiled request, relative to the service root.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    pub command_text: String,
    pub body: Option<serde_json::Value>,
    pub content_id: Option<ContentRef>,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, command_text: String) -> Self {
        RequestDescriptor {
            method,
            command_text,
            body: None,
            content_id: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_content_id(mut self, content_id: Option<ContentRef>) -> Self {
        self.content_id = content_id;
        self
    }
}

/// Request ready to be sent by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl TransportRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Batch request with the content-ids of its items, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub request: TransportRequest,
    pub content_ids: Vec<ContentRef>,
}

pub trait RequestWriter: Send + Sync {
    fn create_request(&self, descriptor: &RequestDescriptor) -> Result<TransportRequest, Error>;

    /// One changeset holding all the items; every item must carry a content-id.
    fn create_batch(&self, items: &[RequestDescriptor]) -> Result<BatchRequest, Error>;
}

/// Writes JSON requests against a service root.
#[derive(Debug, Clone)]
pub struct DefaultRequestWriter {
    url_base: Url,
    payload_format: PayloadFormat,
    include_annotations: bool,
    boundary_prefix: String,
}

impl DefaultRequestWriter {
    pub fn new(url_base: &str) -> Result<Self, Error> {
        Ok(DefaultRequestWriter {
            url_base: parse_base(url_base)?,
            payload_format: PayloadFormat::Json,
            include_annotations: false,
            boundary_prefix: "batch".to_owned(),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, Error> {
        settings.validate()?;
        Ok(DefaultRequestWriter {
            url_base: parse_base(&settings.url_base)?,
            payload_format: settings.payload_format,
            include_annotations: settings.include_annotations,
            boundary_prefix: settings.batch_boundary_prefix.clone(),
        })
    }

    /// Absolute URL of a command.
    pub fn create_request_url(&self, command_text: &str) -> Result<String, Error> {
        let url = self.url_base.join(command_text).map_err(|e| {
            Error::new(
                ErrorType::InvalidArgument,
                format!("Invalid command text '{}': {}", command_text, e),
            )
        })?;
        Ok(url.to_string())
    }

    fn content_type(&self) -> &'static str {
        match self.payload_format {
            PayloadFormat::Json => "application/json",
            PayloadFormat::Atom => "application/atom+xml",
        }
    }

    fn accept(&self) -> String {
        match (self.payload_format, self.include_annotations) {
            (PayloadFormat::Json, true) => {
                "application/json;odata.metadata=minimal;odata.include-annotations=\"*\"".to_owned()
            }
            (PayloadFormat::Json, false) => "application/json".to_owned(),
            (PayloadFormat::Atom, _) => "application/atom+xml".to_owned(),
        }
    }

    fn body_text(&self, descriptor: &RequestDescriptor) -> Result<Option<String>, Error> {
        match &descriptor.body {
            Some(body) => serde_json::to_string(body)
                .map(Some)
                .map_err(|e| Error::serialization_error("request body", e)),
            None => Ok(None),
        }
    }
}

fn parse_base(url_base: &str) -> Result<Url, Error> {
    // without the trailing slash `join` would replace the last segment
    let normalized = if url_base.ends_with('/') {
        url_base.to_owned()
    } else {
        format!("{}/", url_base)
    };
    Url::parse(&normalized).map_err(|e| {
        Error::configuration_error(format!("Invalid url base '{}': {}", url_base, e))
    })
}

impl RequestWriter for DefaultRequestWriter {
    fn create_request(&self, descriptor: &RequestDescriptor) -> Result<TransportRequest, Error> {
        let body = self.body_text(descriptor)?;
        let mut headers = vec![("Accept".to_owned(), self.accept())];
        if body.is_some() {
            headers.push(("Content-Type".to_owned(), self.content_type().to_owned()));
        }
        Ok(TransportRequest {
            method: descriptor.method,
            url: self.create_request_url(&descriptor.command_text)?,
            headers,
            body,
        })
    }

    fn create_batch(&self, items: &[RequestDescriptor]) -> Result<BatchRequest, Error> {
        let batch_boundary = format!("{}_{}", self.boundary_prefix, Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", Uuid::new_v4());
        let mut content_ids = Vec::new();
        let mut changeset = String::new();
        for item in items {
            let content_id = item.content_id.ok_or_else(|| {
                Error::invalid_argument(format!(
                    "Batch item '{}' has no content-id",
                    item.command_text
                ))
            })?;
            trace!("Batch part {} for {} {}", content_id.0, item.method, item.command_text);
            let url = if item.command_text.starts_with('$') {
                item.command_text.clone()
            } else {
                self.create_request_url(&item.command_text)?
            };
            changeset.push_str(&format!("--{}\r\n", changeset_boundary));
            changeset.push_str("Content-Type: application/http\r\n");
            changeset.push_str("Content-Transfer-Encoding: binary\r\n");
            changeset.push_str(&format!("Content-ID: {}\r\n\r\n", content_id.0));
            changeset.push_str(&format!("{} {} HTTP/1.1\r\n", item.method, url));
            match self.body_text(item)? {
                Some(body) => {
                    changeset.push_str(&format!("Content-Type: {}\r\n\r\n", self.content_type()));
                    changeset.push_str(&body);
                    changeset.push_str("\r\n");
                }
                None => changeset.push_str("\r\n"),
            }
            content_ids.push(content_id);
        }
        changeset.push_str(&format!("--{}--\r\n", changeset_boundary));

        let mut body = String::new();
        body.push_str(&format!("--{}\r\n", batch_boundary));
        body.push_str(&format!(
            "Content-Type: multipart/mixed; boundary={}\r\n\r\n",
            changeset_boundary
        ));
        body.push_str(&changeset);
        body.push_str(&format!("--{}--\r\n", batch_boundary));

        Ok(BatchRequest {
            request: TransportRequest {
                method: HttpMethod::Post,
                url: self.create_request_url("$batch")?,
                headers: vec![
                    ("Accept".to_owned(), self.accept()),
                    (
                        "Content-Type".to_owned(),
                        format!("multipart/mixed; boundary={}", batch_boundary),
                    ),
                ],
                body: Some(body),
            },
            content_ids,
        })
    }
}
