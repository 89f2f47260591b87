//! Batch assembly.
//!
//! [BatchAssembler] compiles a sequence of mutations into one changeset.
//! Every item gets the next content-id (1, 2, 3, ...); a later item refers to
//! the pending result of an earlier one with a [ContentRef], which the
//! compiler renders as a `$n` back-reference instead of a key.

#[cfg(feature = "async_session")]
use std::collections::BTreeMap;

#[cfg(feature = "async_session")]
use async_trait::async_trait;
#[cfg(feature = "async_session")]
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::command::{CommandModel, CommandTarget, ContentRef, EntityRef};
use crate::compiler::{CommandCompiler, Mutation};
use crate::error::Error;
use crate::metadata::MetadataProvider;
use crate::request::{BatchRequest, RequestDescriptor, RequestWriter};
use crate::value::ProtocolRevision;

/// Result of one batch item as reported by the service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchItemOutcome {
    pub content_id: ContentRef,
    pub status: u16,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl BatchItemOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends an assembled batch and splits the response into item outcomes.
#[cfg(feature = "async_session")]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(
        &self,
        request: BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchItemOutcome>, Error>;
}

pub struct BatchAssembler<'a> {
    compiler: CommandCompiler<'a>,
    items: Vec<RequestDescriptor>,
}

fn referenced_contents(command: &CommandModel, found: &mut Vec<ContentRef>) {
    if let CommandTarget::Content { content, .. } = &command.target {
        found.push(*content);
    }
    if let Some(parent) = &command.parent {
        referenced_contents(parent, found);
    }
}

impl<'a> BatchAssembler<'a> {
    pub fn new(metadata: &'a dyn MetadataProvider) -> Self {
        BatchAssembler {
            compiler: CommandCompiler::new(metadata),
            items: Vec::new(),
        }
    }

    pub fn with_revision(mut self, revision: ProtocolRevision) -> Self {
        self.compiler = self.compiler.with_revision(revision);
        self
    }

    /// Compile a mutation into the batch and return its content-id.
    pub fn add(&mut self, command: CommandModel, mutation: Mutation) -> Result<ContentRef, Error> {
        let content_id = ContentRef(self.items.len() + 1);
        let mut references = Vec::new();
        referenced_contents(&command, &mut references);
        match &mutation {
            Mutation::Link {
                target: EntityRef::Content(content),
                ..
            }
            | Mutation::Unlink {
                target: Some(EntityRef::Content(content)),
                ..
            } => references.push(*content),
            _ => {}
        }
        if let Some(unknown) = references
            .iter()
            .find(|r| r.0 == 0 || r.0 >= content_id.0)
        {
            return Err(Error::invalid_argument(format!(
                "{} does not refer to an earlier item of the batch",
                unknown
            ))
            .with_command(&command.describe()));
        }
        let descriptor = self
            .compiler
            .compile_request(&command.batch_content(content_id), mutation)?;
        trace!(
            "Batch item {} assigned to {} {}",
            content_id,
            descriptor.method,
            descriptor.command_text
        );
        self.items.push(descriptor);
        Ok(content_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[RequestDescriptor] {
        &self.items
    }

    pub fn assemble(&self, writer: &dyn RequestWriter) -> Result<BatchRequest, Error> {
        if self.items.is_empty() {
            return Err(Error::invalid_argument("The batch is empty".to_owned()));
        }
        writer.create_batch(&self.items)
    }

    /// Send the changeset as one transport call.
    ///
    /// Outcomes are returned as reported, keyed by content-id; a failed item
    /// is not turned into an error here.
    #[cfg(feature = "async_session")]
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        writer: &dyn RequestWriter,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<ContentRef, BatchItemOutcome>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let request = self.assemble(writer)?;
        let outcomes = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            outcomes = transport.send_batch(request, cancel) => outcomes?,
        };
        Ok(outcomes.into_iter().map(|o| (o.content_id, o)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;
    use crate::metadata::northwind;
    use crate::request::{DefaultRequestWriter, HttpMethod};

    #[test]
    fn content_ids_and_back_references() -> Result<(), Error> {
        let model = northwind();
        let mut batch = BatchAssembler::new(&model);
        let product = batch.add(
            CommandModel::for_collection("Products").data(serde_json::json!({"ProductName": "Test"})),
            Mutation::Insert,
        )?;
        assert_eq!(product, ContentRef(1));
        let link = batch.add(
            CommandModel::for_collection("Categories").key(1),
            Mutation::Link {
                navigation: "Products".to_owned(),
                target: EntityRef::Content(product),
            },
        )?;
        assert_eq!(link, ContentRef(2));
        let update = batch.add(
            CommandModel::for_content(product, "Products").data(serde_json::json!({"UnitPrice": 5})),
            Mutation::Update { full: false },
        )?;
        assert_eq!(update, ContentRef(3));

        let items = batch.items();
        assert_eq!(items[1].command_text, "Categories(1)/Products/$ref");
        assert_eq!(items[1].body, Some(serde_json::json!({"@odata.id": "$1"})));
        assert_eq!(items[1].content_id, Some(ContentRef(2)));
        assert_eq!((items[2].method, items[2].command_text.as_str()), (HttpMethod::Patch, "$1"));
        Ok(())
    }

    #[test]
    fn forward_references_are_rejected() -> Result<(), Error> {
        let model = northwind();
        let mut batch = BatchAssembler::new(&model);
        let e = batch
            .add(
                CommandModel::for_content(ContentRef(1), "Products"),
                Mutation::Delete,
            )
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::InvalidArgument);
        assert!(batch.is_empty());
        batch.add(CommandModel::for_collection("Products").key(7), Mutation::Delete)?;
        let e = batch
            .add(
                CommandModel::for_collection("Categories").key(1),
                Mutation::Link {
                    navigation: "Products".to_owned(),
                    target: EntityRef::Content(ContentRef(2)),
                },
            )
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::InvalidArgument);
        assert_eq!(batch.len(), 1);
        Ok(())
    }

    #[test]
    fn assembled_request() -> Result<(), Error> {
        let model = northwind();
        let writer = DefaultRequestWriter::new("http://localhost/northwind.svc/")?;
        let mut batch = BatchAssembler::new(&model);
        assert!(batch.assemble(&writer).is_err());
        batch.add(CommandModel::for_collection("Products").key(1), Mutation::Delete)?;
        batch.add(CommandModel::for_collection("Products").key(2), Mutation::Delete)?;
        let request = batch.assemble(&writer)?;
        assert_eq!(request.content_ids, vec![ContentRef(1), ContentRef(2)]);
        let body = request.request.body.unwrap_or_default();
        assert!(body.contains("DELETE http://localhost/northwind.svc/Products(2) HTTP/1.1"));
        Ok(())
    }
}
