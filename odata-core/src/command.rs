//! Per-request command state.
//!
//! A [CommandModel] is built by a consuming fluent chain and handed to the
//! [crate::compiler::CommandCompiler]. Builder methods never fail; a problem
//! with an argument (e.g. an untranslatable filter) is kept in the command and
//! reported by the compiler before any request text is produced.

use std::fmt::Display;

use crate::error::Error;
use crate::expression::{Expression, ExpressionSource};
use crate::typed::Lambda;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandTarget {
    Collection(String),
    Function(String),
    Action(String),
    /// Navigation property followed from the parent command.
    Navigation(String),
    /// The pending result of an earlier item of the same batch,
    /// an entity of `collection`.
    Content {
        content: ContentRef,
        collection: String,
    },
}

/// Explicit key of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySpec {
    /// Single-valued key given without a property name.
    Single(Value),
    Named(Vec<(String, Value)>),
}

/// Content-ID of a batch item.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentRef(pub usize);

impl Display for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Entity addressed by a link operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef {
    Key { collection: String, key: KeySpec },
    Content(ContentRef),
}

impl EntityRef {
    pub fn key(collection: &str, value: impl Into<Value>) -> Self {
        EntityRef::Key {
            collection: collection.to_owned(),
            key: KeySpec::Single(value.into()),
        }
    }
}

/// Select lists keep the first occurrence of a name.
fn add_selected(select: &mut Vec<String>, columns: impl IntoIterator<Item = String>) {
    for column in columns {
        if !select.contains(&column) {
            select.push(column);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpandOptions {
    pub select: Vec<String>,
    pub expand: Vec<ExpandItem>,
}

impl ExpandOptions {
    pub fn new() -> Self {
        ExpandOptions::default()
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        add_selected(&mut self.select, columns.iter().map(|c| c.to_string()));
        self
    }

    pub fn expand(mut self, path: &str) -> Self {
        self.expand.push(ExpandItem::new(path));
        self
    }

    pub fn expand_nested(mut self, path: &str, options: ExpandOptions) -> Self {
        self.expand.push(ExpandItem {
            path: path_segments(path),
            options,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.select.is_empty() && self.expand.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandItem {
    pub path: Vec<String>,
    pub options: ExpandOptions,
}

impl ExpandItem {
    pub fn new(path: &str) -> Self {
        ExpandItem {
            path: path_segments(path),
            options: ExpandOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub path: Vec<String>,
    pub descending: bool,
}

pub(crate) fn path_segments(path: &str) -> Vec<String> {
    path.split(|c: char| c == '.' || c == '/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandModel {
    pub target: CommandTarget,
    /// Command this one navigates from; rendered as the path prefix.
    pub parent: Option<Box<CommandModel>>,
    pub key: Option<KeySpec>,
    pub filter: Option<Expression>,
    pub filter_text: Option<String>,
    pub derived_type: Option<String>,
    pub select: Vec<String>,
    pub expand: Vec<ExpandItem>,
    pub order: Vec<OrderItem>,
    pub skip: Option<u64>,
    pub top: Option<u64>,
    pub count: bool,
    pub inline_count: bool,
    pub arguments: Vec<(String, Value)>,
    pub data: Option<serde_json::Value>,
    pub batch_content: Option<ContentRef>,
    pub errors: Vec<Error>,
}

impl CommandModel {
    fn with_target(target: CommandTarget) -> Self {
        CommandModel {
            target,
            parent: None,
            key: None,
            filter: None,
            filter_text: None,
            derived_type: None,
            select: Vec::new(),
            expand: Vec::new(),
            order: Vec::new(),
            skip: None,
            top: None,
            count: false,
            inline_count: false,
            arguments: Vec::new(),
            data: None,
            batch_content: None,
            errors: Vec::new(),
        }
    }

    pub fn for_collection(name: &str) -> Self {
        CommandModel::with_target(CommandTarget::Collection(name.to_owned()))
    }

    pub fn for_function(name: &str) -> Self {
        CommandModel::with_target(CommandTarget::Function(name.to_owned()))
    }

    pub fn for_action(name: &str) -> Self {
        CommandModel::with_target(CommandTarget::Action(name.to_owned()))
    }

    /// Address the entity produced by an earlier item of the same batch.
    pub fn for_content(content: ContentRef, collection: &str) -> Self {
        CommandModel::with_target(CommandTarget::Content {
            content,
            collection: collection.to_owned(),
        })
    }

    pub fn key(mut self, value: impl Into<Value>) -> Self {
        self.key = Some(KeySpec::Single(value.into()));
        self
    }

    pub fn key_values<S, V>(mut self, values: impl IntoIterator<Item = (S, V)>) -> Self
    where
        S: Into<String>,
        V: Into<Value>,
    {
        self.key = Some(KeySpec::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ));
        self
    }

    /// Add a filter; a second filter is AND-combined with the first.
    pub fn filter(mut self, source: impl ExpressionSource) -> Self {
        match source.to_expression() {
            Ok(e) => {
                self.filter = Some(match self.filter.take() {
                    Some(existing) => existing.and(e),
                    None => e,
                })
            }
            Err(e) => self.errors.push(e),
        }
        self
    }

    /// Filter already in protocol syntax, passed through verbatim.
    pub fn filter_text(mut self, text: &str) -> Self {
        self.filter_text = Some(text.to_owned());
        self
    }

    pub fn as_type(mut self, name: &str) -> Self {
        self.derived_type = Some(name.to_owned());
        self
    }

    /// New command for a navigation property of the entity this command addresses.
    ///
    /// The current command is cloned into the parent of the new one.
    pub fn navigate_to(&self, navigation: &str) -> CommandModel {
        let mut command =
            CommandModel::with_target(CommandTarget::Navigation(navigation.to_owned()));
        command.parent = Some(Box::new(self.clone()));
        command
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        add_selected(&mut self.select, columns.iter().map(|c| c.to_string()));
        self
    }

    /// Select the member paths of a projection, e.g. `|x| P { a: x.A, b: x.B.C }`.
    pub fn select_projection(mut self, projection: &Lambda) -> Self {
        match projection.projection() {
            Ok(paths) => add_selected(&mut self.select, paths),
            Err(e) => self.errors.push(e),
        }
        self
    }

    pub fn expand(mut self, path: &str) -> Self {
        self.expand.push(ExpandItem::new(path));
        self
    }

    pub fn expand_nested(mut self, path: &str, options: ExpandOptions) -> Self {
        self.expand.push(ExpandItem {
            path: path_segments(path),
            options,
        });
        self
    }

    pub fn order_by(mut self, path: &str) -> Self {
        self.order.push(OrderItem {
            path: path_segments(path),
            descending: false,
        });
        self
    }

    pub fn order_by_descending(mut self, path: &str) -> Self {
        self.order.push(OrderItem {
            path: path_segments(path),
            descending: true,
        });
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn top(mut self, n: u64) -> Self {
        self.top = Some(n);
        self
    }

    /// Request only the number of matching entities (`/$count`).
    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    /// Request the total count along with the results.
    pub fn inline_count(mut self) -> Self {
        self.inline_count = true;
        self
    }

    pub fn function_args<S, V>(mut self, args: impl IntoIterator<Item = (S, V)>) -> Self
    where
        S: Into<String>,
        V: Into<Value>,
    {
        self.arguments
            .extend(args.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn action_args<S, V>(self, args: impl IntoIterator<Item = (S, V)>) -> Self
    where
        S: Into<String>,
        V: Into<Value>,
    {
        self.function_args(args)
    }

    /// Entry payload for insert and update.
    pub fn data(mut self, entry: serde_json::Value) -> Self {
        self.data = Some(entry);
        self
    }

    pub fn batch_content(mut self, content: ContentRef) -> Self {
        self.batch_content = Some(content);
        self
    }

    /// First problem recorded while building the command.
    pub fn check(&self) -> Result<(), Error> {
        if let Some(e) = self.errors.first() {
            return Err(e.clone());
        }
        if let Some(parent) = &self.parent {
            parent.check()?;
        }
        Ok(())
    }

    /// Name the command was created for, used in error context.
    pub fn describe(&self) -> String {
        let own = match &self.target {
            CommandTarget::Collection(name)
            | CommandTarget::Function(name)
            | CommandTarget::Action(name)
            | CommandTarget::Navigation(name) => name.clone(),
            CommandTarget::Content { content, .. } => content.to_string(),
        };
        match &self.parent {
            Some(parent) => format!("{}/{}", parent.describe(), own),
            None => own,
        }
    }
}
