//! Command compiler.
//!
//! Turns a [CommandModel] into request text using a [MetadataProvider]:
//!
//! 1. the target path is resolved (collection, navigation, function or batch
//!    content reference) with names normalised to their declared spelling,
//! 2. a filter that binds exactly the full declared key by equalities is
//!    collapsed into a key segment (`Products(1)`, `Order_Details(OrderID=1,ProductID=2)`),
//! 3. the derived type segment and the remaining query options are rendered
//!    in protocol order, every option value percent-encoded.
//!
//! All validation (unknown members, unsupported functions, invalid arguments)
//! happens here, before any request is produced.

use itertools::Itertools;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use tracing::debug;

use crate::command::{
    path_segments, CommandModel, CommandTarget, EntityRef, ExpandItem, KeySpec,
};
use crate::error::{Error, ErrorType};
use crate::expression::{BinaryOp, Expression, UnaryOp};
use crate::functions;
use crate::literal::format_literal;
use crate::metadata::{FunctionKind, FunctionSignature, Member, MetadataProvider};
use crate::request::{HttpMethod, RequestDescriptor};
use crate::value::{ProtocolRevision, Value};

/// Query option values keep only the unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'\\');

pub fn encode_query_value(text: &str) -> String {
    utf8_percent_encode(text, QUERY_VALUE).to_string()
}

fn encode_path(text: &str) -> String {
    utf8_percent_encode(text, PATH_SEGMENT).to_string()
}

/// What a compiled request does.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Get,
    Insert,
    /// Full replacement (`PUT`) or partial update (`MERGE`/`PATCH`).
    Update { full: bool },
    Delete,
    Link {
        navigation: String,
        target: EntityRef,
    },
    /// The target is required for collection-valued navigations.
    Unlink {
        navigation: String,
        target: Option<EntityRef>,
    },
    InvokeFunction,
    InvokeAction,
}

/// Resolved resource path of a command.
#[derive(Debug)]
struct Target {
    path: String,
    /// Collection whose members the options refer to, if known.
    collection: Option<String>,
    /// True if the path addresses a single entity.
    single: bool,
    /// Filter left after key collapse, with declared member names.
    filter: Option<Expression>,
    /// Function parameters rendered as query options (legacy revisions).
    query_args: Vec<String>,
}

pub struct CommandCompiler<'a> {
    metadata: &'a dyn MetadataProvider,
    revision: ProtocolRevision,
}

impl<'a> CommandCompiler<'a> {
    pub fn new(metadata: &'a dyn MetadataProvider) -> Self {
        CommandCompiler {
            metadata,
            revision: metadata.protocol_revision(),
        }
    }

    /// Override the revision reported by the metadata.
    pub fn with_revision(mut self, revision: ProtocolRevision) -> Self {
        self.revision = revision;
        self
    }

    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    /// Request text of a read command, relative to the service root.
    pub fn compile_text(&self, command: &CommandModel) -> Result<String, Error> {
        self.compile_text_unchecked(command)
            .map_err(|e| with_context(e, command))
    }

    fn compile_text_unchecked(&self, command: &CommandModel) -> Result<String, Error> {
        command.check()?;
        let mut target = self.resolve_target(command)?;
        if command.count {
            target.path.push_str("/$count");
        }
        let mut params = std::mem::take(&mut target.query_args);
        params.extend(self.query_options(command, &target)?);
        let text = if params.is_empty() {
            target.path
        } else {
            format!("{}?{}", target.path, params.join("&"))
        };
        debug!("Compiled command {}", text);
        Ok(text)
    }

    /// Request descriptor of a command for the given verb.
    pub fn compile_request(
        &self,
        command: &CommandModel,
        mutation: Mutation,
    ) -> Result<RequestDescriptor, Error> {
        let descriptor = self
            .compile_request_unchecked(command, mutation)
            .map_err(|e| with_context(e, command))?;
        debug!(
            "Compiled {} request {}",
            descriptor.method, descriptor.command_text
        );
        Ok(descriptor.with_content_id(command.batch_content))
    }

    fn compile_request_unchecked(
        &self,
        command: &CommandModel,
        mutation: Mutation,
    ) -> Result<RequestDescriptor, Error> {
        command.check()?;
        let legacy = self.revision.is_legacy();
        match mutation {
            Mutation::Get => Ok(RequestDescriptor::new(
                HttpMethod::Get,
                self.compile_text_unchecked(command)?,
            )),
            Mutation::Insert => {
                let target = self.resolve_target(command)?;
                if target.single && !matches!(command.target, CommandTarget::Navigation(_)) {
                    return Err(Error::invalid_argument(format!(
                        "Can't insert into '{}', it addresses a single entity",
                        target.path
                    )));
                }
                Ok(RequestDescriptor::new(HttpMethod::Post, target.path).with_body(entry(command)?))
            }
            Mutation::Update { full } => {
                let target = self.addressable(command)?;
                let method = match (full, legacy) {
                    (true, _) => HttpMethod::Put,
                    (false, true) => HttpMethod::Merge,
                    (false, false) => HttpMethod::Patch,
                };
                Ok(RequestDescriptor::new(method, target.path).with_body(entry(command)?))
            }
            Mutation::Delete => {
                let target = self.addressable(command)?;
                Ok(RequestDescriptor::new(HttpMethod::Delete, target.path))
            }
            Mutation::Link { navigation, target } => {
                let source = self.addressable(command)?;
                let (name, multiple) = self.link_navigation(&source, &navigation)?;
                let uri = self.entity_uri(&target)?;
                let body = if legacy {
                    serde_json::json!({ "uri": uri })
                } else {
                    serde_json::json!({ "@odata.id": uri })
                };
                let method = if multiple {
                    HttpMethod::Post
                } else {
                    HttpMethod::Put
                };
                Ok(RequestDescriptor::new(method, self.link_path(&source.path, &name)).with_body(body))
            }
            Mutation::Unlink { navigation, target } => {
                let source = self.addressable(command)?;
                let (name, multiple) = self.link_navigation(&source, &navigation)?;
                let path = match (multiple, target) {
                    (false, _) => self.link_path(&source.path, &name),
                    (true, None) => {
                        return Err(Error::invalid_argument(format!(
                            "Unlinking from collection-valued '{}' needs the linked entity",
                            name
                        )))
                    }
                    (true, Some(linked)) if legacy => match &linked {
                        EntityRef::Key { collection, key } => {
                            let collection = self.metadata.resolve_collection(collection)?;
                            format!(
                                "{}{}",
                                self.link_path(&source.path, &name),
                                self.key_segment(&collection, key)?
                            )
                        }
                        EntityRef::Content(content) => {
                            return Err(Error::invalid_argument(format!(
                                "Batch reference {} can't address a link in protocol {}",
                                content, self.revision
                            )))
                        }
                    },
                    (true, Some(linked)) => format!(
                        "{}?$id={}",
                        self.link_path(&source.path, &name),
                        encode_query_value(&self.entity_uri(&linked)?)
                    ),
                };
                Ok(RequestDescriptor::new(HttpMethod::Delete, path))
            }
            Mutation::InvokeFunction => match &command.target {
                CommandTarget::Function(_) => Ok(RequestDescriptor::new(
                    HttpMethod::Get,
                    self.compile_text_unchecked(command)?,
                )),
                _ => Err(Error::invalid_argument(
                    "Only a function command can be invoked as a function".to_owned(),
                )),
            },
            Mutation::InvokeAction => match &command.target {
                CommandTarget::Action(name) => {
                    let signature = self.function_signature(name, FunctionKind::Action)?;
                    let mut body = serde_json::Map::new();
                    for (name, value) in bind_arguments(&signature, &command.arguments)? {
                        body.insert(name, value.to_json());
                    }
                    Ok(RequestDescriptor::new(HttpMethod::Post, signature.name.clone())
                        .with_body(serde_json::Value::Object(body)))
                }
                _ => Err(Error::invalid_argument(
                    "Only an action command can be invoked as an action".to_owned(),
                )),
            },
        }
    }

    fn resolve_target(&self, command: &CommandModel) -> Result<Target, Error> {
        let mut target = match &command.target {
            CommandTarget::Collection(name) => {
                let collection = self.metadata.resolve_collection(name)?;
                Target {
                    path: encode_path(&collection),
                    collection: Some(collection),
                    single: false,
                    filter: None,
                    query_args: Vec::new(),
                }
            }
            CommandTarget::Navigation(navigation) => {
                let parent = command.parent.as_deref().ok_or_else(|| {
                    Error::invalid_argument(format!("Navigation '{}' has no parent", navigation))
                })?;
                let parent = self.resolve_target(parent)?;
                if !parent.single || parent.filter.is_some() {
                    return Err(Error::invalid_argument(format!(
                        "'{}' can only be navigated from a single entity, '{}' is not one",
                        navigation, parent.path
                    )));
                }
                match &parent.collection {
                    Some(collection) => match self.metadata.resolve_member(collection, navigation)? {
                        Member::Navigation {
                            name,
                            target,
                            multiple,
                        } => Target {
                            path: format!("{}/{}", parent.path, name),
                            collection: Some(target),
                            single: !multiple,
                            filter: None,
                            query_args: Vec::new(),
                        },
                        Member::Structural { name } => {
                            return Err(Error::new(
                                ErrorType::UnknownMember,
                                format!("'{}' is not a navigation property of '{}'", name, collection),
                            )
                            .with_collection(collection))
                        }
                    },
                    None => Target {
                        path: format!("{}/{}", parent.path, navigation),
                        collection: None,
                        single: false,
                        filter: None,
                        query_args: Vec::new(),
                    },
                }
            }
            CommandTarget::Function(name) => {
                let signature = self.function_signature(name, FunctionKind::Function)?;
                let arguments = bind_arguments(&signature, &command.arguments)?;
                let mut target = Target {
                    path: encode_path(&signature.name),
                    collection: signature.returns.clone(),
                    single: false,
                    filter: None,
                    query_args: Vec::new(),
                };
                let formatted = arguments
                    .iter()
                    .map(|(name, value)| Ok((name, format_literal(value, self.revision)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                if self.revision.is_legacy() {
                    target.query_args = formatted
                        .iter()
                        .map(|(name, text)| format!("{}={}", name, encode_query_value(text)))
                        .collect();
                } else {
                    target.path = format!(
                        "{}({})",
                        target.path,
                        formatted
                            .iter()
                            .map(|(name, text)| format!("{}={}", name, encode_path(text)))
                            .join(",")
                    );
                }
                target
            }
            CommandTarget::Action(name) => {
                let signature = self.function_signature(name, FunctionKind::Action)?;
                Target {
                    path: encode_path(&signature.name),
                    collection: signature.returns.clone(),
                    single: false,
                    filter: None,
                    query_args: Vec::new(),
                }
            }
            CommandTarget::Content {
                content,
                collection,
            } => Target {
                path: content.to_string(),
                collection: Some(self.metadata.resolve_collection(collection)?),
                single: true,
                filter: None,
                query_args: Vec::new(),
            },
        };

        if let Some(filter) = &command.filter {
            target.filter = Some(self.resolve_expression(filter, target.collection.as_deref())?);
        }

        if let Some(key) = &command.key {
            let collection = target.collection.clone().ok_or_else(|| {
                Error::invalid_argument(format!("A key can't be applied to '{}'", target.path))
            })?;
            if target.single {
                return Err(Error::invalid_argument(format!(
                    "'{}' already addresses a single entity",
                    target.path
                )));
            }
            target.path.push_str(&self.key_segment(&collection, key)?);
            target.single = true;
        } else if !target.single && command.filter_text.is_none() {
            // raw filter text is an extra clause, so only a pure key filter collapses
            if let (Some(filter), Some(collection)) = (&target.filter, &target.collection) {
                let keys = self.metadata.get_declared_key_names(collection)?;
                match collapse_key(filter, &keys) {
                    Ok(Some(values)) => {
                        let segment = self.format_key(&keys, &values)?;
                        debug!("Filter on '{}' collapsed into key {}", collection, segment);
                        target.path.push_str(&segment);
                        target.single = true;
                        target.filter = None;
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Filter on '{}' not collapsed: {}", collection, e),
                }
            }
        }

        if let Some(derived) = &command.derived_type {
            let collection = target.collection.as_deref().ok_or_else(|| {
                Error::invalid_argument(format!("A type cast can't be applied to '{}'", target.path))
            })?;
            let qualified = self.metadata.resolve_derived_type(collection, derived)?;
            target.path = format!("{}/{}", target.path, qualified);
        }
        Ok(target)
    }

    fn addressable(&self, command: &CommandModel) -> Result<Target, Error> {
        let target = self.resolve_target(command)?;
        if !target.single || target.filter.is_some() {
            return Err(Error::invalid_argument(format!(
                "'{}' does not address a single entity",
                target.path
            )));
        }
        Ok(target)
    }

    fn link_navigation(&self, source: &Target, navigation: &str) -> Result<(String, bool), Error> {
        let collection = source.collection.as_deref().ok_or_else(|| {
            Error::invalid_argument(format!("Links of '{}' are unknown", source.path))
        })?;
        match self.metadata.resolve_member(collection, navigation)? {
            Member::Navigation { name, multiple, .. } => Ok((name, multiple)),
            Member::Structural { name } => Err(Error::invalid_argument(format!(
                "'{}' is not a navigation property of '{}'",
                name, collection
            ))),
        }
    }

    fn link_path(&self, source: &str, navigation: &str) -> String {
        if self.revision.is_legacy() {
            format!("{}/$links/{}", source, navigation)
        } else {
            format!("{}/{}/$ref", source, navigation)
        }
    }

    fn entity_uri(&self, entity: &EntityRef) -> Result<String, Error> {
        match entity {
            EntityRef::Key { collection, key } => {
                let collection = self.metadata.resolve_collection(collection)?;
                Ok(format!(
                    "{}{}",
                    encode_path(&collection),
                    self.key_segment(&collection, key)?
                ))
            }
            EntityRef::Content(content) => Ok(content.to_string()),
        }
    }

    fn key_segment(&self, collection: &str, key: &KeySpec) -> Result<String, Error> {
        let keys = self.metadata.get_declared_key_names(collection)?;
        let values = match key {
            KeySpec::Single(value) => {
                if keys.len() > 1 {
                    return Err(Error::invalid_argument(format!(
                        "'{}' has the compound key ({}), a single key value was given",
                        collection,
                        keys.join(",")
                    )));
                }
                vec![value.clone()]
            }
            KeySpec::Named(pairs) => {
                let mut bound: Vec<Option<&Value>> = vec![None; keys.len()];
                for (name, value) in pairs {
                    let declared = self.metadata.resolve_member(collection, name)?;
                    let position = keys
                        .iter()
                        .position(|k| k == declared.name())
                        .ok_or_else(|| {
                            Error::invalid_argument(format!(
                                "'{}' is not a key property of '{}'",
                                name, collection
                            ))
                        })?;
                    bound[position] = Some(value);
                }
                let mut values = Vec::with_capacity(keys.len());
                for (name, value) in keys.iter().zip(bound) {
                    values.push(
                        value
                            .ok_or_else(|| {
                                Error::invalid_argument(format!(
                                    "Key property '{}' of '{}' has no value",
                                    name, collection
                                ))
                            })?
                            .clone(),
                    );
                }
                values
            }
        };
        self.format_key(&keys, &values)
    }

    /// `(v)` for a single key, `(k1=v1,k2=v2)` in declared order otherwise.
    fn format_key(&self, keys: &[String], values: &[Value]) -> Result<String, Error> {
        let mut parts = Vec::with_capacity(values.len());
        for value in values {
            if value.is_null() || value.is_structured() {
                return Err(Error::invalid_argument(format!(
                    "A {} can't be used as a key value",
                    value.type_name()
                )));
            }
            parts.push(encode_path(&format_literal(value, self.revision)?));
        }
        if parts.len() == 1 {
            Ok(format!("({})", parts[0]))
        } else {
            Ok(format!(
                "({})",
                keys.iter()
                    .zip(parts.iter())
                    .map(|(k, v)| format!("{}={}", k, v))
                    .join(",")
            ))
        }
    }

    fn function_signature(&self, name: &str, kind: FunctionKind) -> Result<FunctionSignature, Error> {
        let signature = self.metadata.get_function_signature(name).ok_or_else(|| {
            Error::new(
                ErrorType::UnknownMember,
                format!("Function or action '{}' not found", name),
            )
        })?;
        if signature.kind != kind {
            return Err(Error::invalid_argument(format!(
                "'{}' is a {:?}, not a {:?}",
                signature.name, signature.kind, kind
            )));
        }
        Ok(signature)
    }

    /// Resolve member names and check functions of a filter expression.
    fn resolve_expression(
        &self,
        expression: &Expression,
        collection: Option<&str>,
    ) -> Result<Expression, Error> {
        match expression {
            Expression::Reference(path) => match collection {
                Some(collection) => Ok(Expression::Reference(
                    self.resolve_member_path(collection, path)?.0,
                )),
                None => Ok(expression.clone()),
            },
            Expression::Literal(value) => {
                if value.is_structured() {
                    return Err(Error::invalid_argument(format!(
                        "A {} can't be used in a filter, compare its members instead",
                        value.type_name()
                    )));
                }
                Ok(expression.clone())
            }
            Expression::Function { name, target, args } => {
                let mapping = functions::resolve(name, self.revision)?;
                mapping.check_arguments(args)?;
                Ok(Expression::function(
                    mapping.canonical,
                    self.resolve_expression(target, collection)?,
                    args.iter()
                        .map(|a| self.resolve_expression(a, collection))
                        .collect::<Result<Vec<_>, _>>()?,
                ))
            }
            Expression::Unary { op, operand } => Ok(Expression::unary(
                *op,
                self.resolve_expression(operand, collection)?,
            )),
            Expression::Binary { op, left, right } => Ok(Expression::binary(
                *op,
                self.resolve_expression(left, collection)?,
                self.resolve_expression(right, collection)?,
            )),
        }
    }

    /// Declared names of a member path and the collection it ends in, if it ends in a navigation.
    fn resolve_member_path(
        &self,
        collection: &str,
        path: &[String],
    ) -> Result<(Vec<String>, Option<String>), Error> {
        if path.is_empty() {
            return Err(Error::unknown_member(collection, path));
        }
        let mut current = Some(collection.to_owned());
        let mut resolved = Vec::with_capacity(path.len());
        for segment in path {
            let owner = current
                .take()
                .ok_or_else(|| Error::unknown_member(collection, path))?;
            match self
                .metadata
                .resolve_member(&owner, segment)
                .map_err(|_| Error::unknown_member(collection, path))?
            {
                Member::Structural { name } => resolved.push(name),
                Member::Navigation { name, target, .. } => {
                    resolved.push(name);
                    current = Some(target);
                }
            }
        }
        Ok((resolved, current))
    }

    fn resolve_path_text(&self, collection: Option<&str>, path: &[String]) -> Result<String, Error> {
        match collection {
            Some(collection) => Ok(self.resolve_member_path(collection, path)?.0.join("/")),
            None => Ok(path.join("/")),
        }
    }

    /// Like [Self::resolve_member_path], but every segment must be a navigation.
    fn resolve_navigation_path(
        &self,
        collection: Option<&str>,
        path: &[String],
    ) -> Result<(Vec<String>, Option<String>), Error> {
        let collection = match collection {
            Some(c) => c,
            None => return Ok((path.to_vec(), None)),
        };
        let (resolved, target) = self.resolve_member_path(collection, path)?;
        if target.is_none() {
            return Err(Error::invalid_argument(format!(
                "'{}' can't be expanded, it is not a navigation property of '{}'",
                path.join("/"),
                collection
            )));
        }
        Ok((resolved, target))
    }

    fn query_options(&self, command: &CommandModel, target: &Target) -> Result<Vec<String>, Error> {
        let collection = target.collection.as_deref();
        let mut params = Vec::new();

        let mut filters = Vec::new();
        if let Some(filter) = &target.filter {
            filters.push(render_filter(filter, self.revision)?);
        }
        if let Some(text) = &command.filter_text {
            filters.push(text.clone());
        }
        match filters.len() {
            0 => {}
            1 => params.push(format!("$filter={}", encode_query_value(&filters[0]))),
            _ => params.push(format!(
                "$filter={}",
                encode_query_value(&filters.iter().map(|f| format!("({})", f)).join(" and "))
            )),
        }

        let mut select = command
            .select
            .iter()
            .map(|s| self.resolve_path_text(collection, &path_segments(s)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut expand = Vec::new();
        if self.revision.is_legacy() {
            let mut nested_select = Vec::new();
            for item in &command.expand {
                self.flatten_expand(collection, item, &[], &mut expand, &mut nested_select)?;
            }
            if select.is_empty() && !nested_select.is_empty() {
                select.push("*".to_owned());
            }
            select.extend(nested_select);
        } else {
            for item in &command.expand {
                expand.push(self.render_expand(collection, item)?);
            }
        }
        if !select.is_empty() {
            params.push(format!("$select={}", encode_query_value(&select.join(","))));
        }
        if !expand.is_empty() {
            params.push(format!("$expand={}", encode_query_value(&expand.join(","))));
        }

        if !command.order.is_empty() {
            let order = command
                .order
                .iter()
                .map(|item| {
                    let path = self.resolve_path_text(collection, &item.path)?;
                    Ok(if item.descending {
                        format!("{} desc", path)
                    } else {
                        path
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            params.push(format!("$orderby={}", encode_query_value(&order.join(","))));
        }
        if let Some(skip) = command.skip {
            params.push(format!("$skip={}", skip));
        }
        if let Some(top) = command.top {
            params.push(format!("$top={}", top));
        }
        if command.inline_count {
            if self.revision.is_legacy() {
                params.push("$inlinecount=allpages".to_owned());
            } else {
                params.push("$count=true".to_owned());
            }
        }
        Ok(params)
    }

    /// Nested expand in V4 syntax, `Orders($select=OrderDate;$expand=Order_Details)`.
    fn render_expand(&self, collection: Option<&str>, item: &ExpandItem) -> Result<String, Error> {
        let (path, target) = self.resolve_navigation_path(collection, &item.path)?;
        let mut nested = Vec::new();
        if !item.options.select.is_empty() {
            let select = item
                .options
                .select
                .iter()
                .map(|s| self.resolve_path_text(target.as_deref(), &path_segments(s)))
                .collect::<Result<Vec<_>, _>>()?;
            nested.push(format!("$select={}", select.join(",")));
        }
        if !item.options.expand.is_empty() {
            let expand = item
                .options
                .expand
                .iter()
                .map(|child| self.render_expand(target.as_deref(), child))
                .collect::<Result<Vec<_>, _>>()?;
            nested.push(format!("$expand={}", expand.join(",")));
        }
        if nested.is_empty() {
            Ok(path.join("/"))
        } else {
            Ok(format!("{}({})", path.join("/"), nested.join(";")))
        }
    }

    /// Nested expand flattened into paths, `Orders/Order_Details`, with nested
    /// selects prefixed by their expand path.
    fn flatten_expand(
        &self,
        collection: Option<&str>,
        item: &ExpandItem,
        prefix: &[String],
        expand: &mut Vec<String>,
        select: &mut Vec<String>,
    ) -> Result<(), Error> {
        let (path, target) = self.resolve_navigation_path(collection, &item.path)?;
        let mut full = prefix.to_vec();
        full.extend(path);
        for s in &item.options.select {
            select.push(format!(
                "{}/{}",
                full.join("/"),
                self.resolve_path_text(target.as_deref(), &path_segments(s))?
            ));
        }
        if item.options.expand.is_empty() {
            expand.push(full.join("/"));
        } else {
            for child in &item.options.expand {
                self.flatten_expand(target.as_deref(), child, &full, expand, select)?;
            }
        }
        Ok(())
    }
}

fn with_context(error: Error, command: &CommandModel) -> Error {
    if error.command.is_some() {
        error
    } else {
        error.with_command(&command.describe())
    }
}

fn entry(command: &CommandModel) -> Result<serde_json::Value, Error> {
    match &command.data {
        Some(data @ serde_json::Value::Object(_)) => Ok(data.clone()),
        Some(other) => Err(Error::invalid_argument(format!(
            "Entry data must be an object, got {}",
            other
        ))),
        None => Err(Error::invalid_argument(format!(
            "No entry data given for '{}'",
            command.describe()
        ))),
    }
}

/// Arguments in declared parameter order, checked against the signature.
fn bind_arguments(
    signature: &FunctionSignature,
    arguments: &[(String, Value)],
) -> Result<Vec<(String, Value)>, Error> {
    let mut bound: Vec<Option<&Value>> = vec![None; signature.parameters.len()];
    for (name, value) in arguments {
        let position = signature
            .parameters
            .iter()
            .position(|p| Some(p) == signature.parameter(name))
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "'{}' has no parameter '{}'",
                    signature.name, name
                ))
            })?;
        let parameter = &signature.parameters[position];
        if !parameter.param_type.accepts(value) {
            return Err(Error::invalid_argument(format!(
                "Parameter '{}' of '{}' expects {:?}, got {}",
                parameter.name,
                signature.name,
                parameter.param_type,
                value.type_name()
            )));
        }
        bound[position] = Some(value);
    }
    let mut result = Vec::new();
    for (parameter, value) in signature.parameters.iter().zip(bound) {
        match value {
            Some(value) => result.push((parameter.name.clone(), value.clone())),
            None if parameter.optional => {}
            None => {
                return Err(Error::invalid_argument(format!(
                    "Missing parameter '{}' of '{}'",
                    parameter.name, signature.name
                )))
            }
        }
    }
    Ok(result)
}

fn equality_binding(clause: &Expression) -> Option<(&str, &Value)> {
    match clause {
        Expression::Binary {
            op: BinaryOp::Eq,
            left,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expression::Reference(path), Expression::Literal(value))
            | (Expression::Literal(value), Expression::Reference(path))
                if path.len() == 1 && !value.is_null() && !value.is_structured() =>
            {
                Some((path[0].as_str(), value))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Key values in declared order, if the filter binds exactly the full key.
///
/// The filter must be a conjunction of `Key == literal` comparisons covering
/// every declared key and nothing else. Repeated bindings of a key to the same
/// value are allowed; bindings to different values give
/// [ErrorType::AmbiguousKeyCollapse], which callers treat as "not collapsible".
pub fn collapse_key(filter: &Expression, keys: &[String]) -> Result<Option<Vec<Value>>, Error> {
    if keys.is_empty() {
        return Ok(None);
    }
    let mut bound: Vec<Option<&Value>> = vec![None; keys.len()];
    for clause in filter.conjuncts() {
        let (name, value) = match equality_binding(clause) {
            Some(binding) => binding,
            None => return Ok(None),
        };
        let position = match keys.iter().position(|k| k == name) {
            Some(position) => position,
            None => return Ok(None),
        };
        match bound[position] {
            Some(existing) if existing != value => {
                return Err(Error::ambiguous_key_collapse(name))
            }
            _ => bound[position] = Some(value),
        }
    }
    if bound.iter().any(|b| b.is_none()) {
        return Ok(None);
    }
    Ok(Some(bound.into_iter().flatten().cloned().collect()))
}

/// Render a filter expression in the protocol syntax of a revision (not percent-encoded).
pub fn render_filter(expression: &Expression, revision: ProtocolRevision) -> Result<String, Error> {
    let mut out = String::new();
    render(expression, revision, &mut out)?;
    Ok(out)
}

fn needs_parentheses(parent: BinaryOp, child: &Expression, right: bool) -> bool {
    match child {
        Expression::Binary { op, .. } => {
            let (p, c) = (parent.precedence(), op.precedence());
            c < p
                || (c == p && (right || parent.is_comparison()))
                || (parent.is_logical() && op.is_logical() && parent != *op)
        }
        _ => false,
    }
}

fn render(expression: &Expression, revision: ProtocolRevision, out: &mut String) -> Result<(), Error> {
    match expression {
        Expression::Reference(path) => {
            if path.is_empty() {
                return Err(Error::unsupported_expression("empty member path"));
            }
            out.push_str(&path.join("/"));
        }
        Expression::Literal(value) => out.push_str(&format_literal(value, revision)?),
        Expression::Function { name, target, args } => {
            let mapping = functions::resolve(name, revision)?;
            mapping.check_arguments(args)?;
            let mut operands: Vec<&Expression> = Vec::with_capacity(args.len() + 1);
            if mapping.target_last(revision) {
                operands.extend(args.iter());
                operands.push(target);
            } else {
                operands.push(target);
                operands.extend(args.iter());
            }
            // resolve() checked the name exists in this revision
            out.push_str(mapping.protocol_name(revision).unwrap_or(mapping.canonical));
            out.push('(');
            for (i, operand) in operands.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(operand, revision, out)?;
            }
            out.push(')');
        }
        Expression::Unary {
            op: UnaryOp::Not,
            operand,
        } => {
            out.push_str("not(");
            render(operand, revision, out)?;
            out.push(')');
        }
        Expression::Unary {
            op: UnaryOp::Negate,
            operand,
        } => match operand.as_ref() {
            // `-5` is the literal -5, a negated literal keeps its parentheses
            Expression::Reference(_) | Expression::Function { .. } => {
                out.push('-');
                render(operand, revision, out)?;
            }
            _ => {
                out.push_str("-(");
                render(operand, revision, out)?;
                out.push(')');
            }
        },
        Expression::Binary { op, left, right } => {
            for (operand, is_right) in [(left, false), (right, true)] {
                if is_right {
                    out.push(' ');
                    out.push_str(op.keyword());
                    out.push(' ');
                }
                if needs_parentheses(*op, operand, is_right) {
                    out.push('(');
                    render(operand, revision, out)?;
                    out.push(')');
                } else {
                    render(operand, revision, out)?;
                }
            }
        }
    }
    Ok(())
}

/// Filter part of a command text such as `Products?$filter=ProductID%20eq%201`.
///
/// The `Collection?$filter=` prefix is matched case-insensitively; text without
/// it is taken to be a filter already.
pub fn extract_filter(collection: &str, command_text: &str) -> String {
    let lower = command_text.to_lowercase();
    let prefixes = [
        format!("{}?$filter=", collection.to_lowercase()),
        "$filter=".to_owned(),
    ];
    for prefix in prefixes.iter() {
        if lower.starts_with(prefix.as_str()) {
            let rest = &command_text[prefix.len()..];
            return percent_decode_str(rest).decode_utf8_lossy().into_owned();
        }
    }
    command_text.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ExpandOptions;
    use crate::dynamic::expression;
    use crate::metadata::northwind;

    #[test]
    fn filter_rendering() -> Result<(), Error> {
        let x = expression();
        let e = x.member("ProductID").equal(1).and(x.member("ProductName").equal("abc"));
        assert_eq!(
            render_filter(&e.expression()?, ProtocolRevision::V4)?,
            "ProductID eq 1 and ProductName eq 'abc'"
        );
        let e = (x.member("A").equal(1) | x.member("B").equal(2)) & x.member("C").equal(3);
        assert_eq!(
            render_filter(&e.expression()?, ProtocolRevision::V4)?,
            "(A eq 1 or B eq 2) and C eq 3"
        );
        let e = (x.member("UnitPrice") - (x.member("Discount") + 1)).greater_than(5);
        assert_eq!(
            render_filter(&e.expression()?, ProtocolRevision::V4)?,
            "UnitPrice sub (Discount add 1) gt 5"
        );
        let e = -(x.member("A") + x.member("B"));
        assert_eq!(render_filter(&e.expression()?, ProtocolRevision::V4)?, "-(A add B)");
        let e = Expression::reference("Stock").greater_than(-Expression::literal(5));
        assert_eq!(render_filter(&e, ProtocolRevision::V4)?, "Stock gt -(5)");
        assert_eq!(
            render_filter(&Expression::literal(-5).less_than(-Expression::reference("A")), ProtocolRevision::V4)?,
            "-5 lt -A"
        );
        Ok(())
    }

    #[test]
    fn function_rendering_per_revision() -> Result<(), Error> {
        let e = Expression::reference("ProductName").call("contains", vec![Expression::literal("ai")]);
        assert_eq!(
            render_filter(&e, ProtocolRevision::V3)?,
            "substringof('ai',ProductName)"
        );
        assert_eq!(render_filter(&e, ProtocolRevision::V4)?, "contains(ProductName,'ai')");
        let e = Expression::reference("ProductName")
            .call("to_lower", vec![])
            .call("len", vec![])
            .equal(4);
        assert_eq!(
            render_filter(&e, ProtocolRevision::V4)?,
            "length(tolower(ProductName)) eq 4"
        );
        let e = Expression::reference("ProductName").call("frobnicate", vec![]);
        assert_eq!(
            render_filter(&e, ProtocolRevision::V4).unwrap_err().error_type,
            ErrorType::UnsupportedFunction
        );
        Ok(())
    }

    #[test]
    fn collapse_rules() -> Result<(), Error> {
        let keys = vec!["OrderID".to_owned(), "ProductID".to_owned()];
        let full = Expression::reference("ProductID")
            .equal(2)
            .and(Expression::reference("OrderID").equal(1));
        assert_eq!(
            collapse_key(&full, &keys)?,
            Some(vec![Value::Int32(1), Value::Int32(2)])
        );
        let partial = Expression::reference("OrderID").equal(1);
        assert_eq!(collapse_key(&partial, &keys)?, None);
        let extra = full.clone().and(Expression::reference("Quantity").greater_than(5));
        assert_eq!(collapse_key(&extra, &keys)?, None);
        let conflicting = full.clone().and(Expression::reference("OrderID").equal(3));
        assert_eq!(
            collapse_key(&conflicting, &keys).unwrap_err().error_type,
            ErrorType::AmbiguousKeyCollapse
        );
        let reversed = Expression::literal(1).equal(Expression::reference("ProductID"));
        assert_eq!(
            collapse_key(&reversed, &["ProductID".to_owned()])?,
            Some(vec![Value::Int32(1)])
        );
        Ok(())
    }

    #[test]
    fn key_collapse_examples() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let x = expression();
        let text = |cmd: CommandModel| compiler.compile_text(&cmd);

        assert_eq!(
            text(CommandModel::for_collection("Products").filter(x.member("ProductID").equal(1)))?,
            "Products(1)"
        );
        assert_eq!(
            text(CommandModel::for_collection("Products").filter(x.member("ProductID").not_equal(1)))?,
            "Products?$filter=ProductID%20ne%201"
        );
        assert_eq!(
            text(CommandModel::for_collection("Products").filter(!x.member("ProductID").equal(1)))?,
            "Products?$filter=not%28ProductID%20eq%201%29"
        );
        assert_eq!(
            text(CommandModel::for_collection("OrderDetails")
                .filter(x.member("OrderID").equal(1) & x.member("ProductID").equal(2)))?,
            "Order_Details(OrderID=1,ProductID=2)"
        );
        assert_eq!(
            text(CommandModel::for_collection("Transport")
                .as_type("Ship")
                .filter(x.member("TransportID").equal(1)))?,
            "Transport(1)/NorthwindModel.Ships"
        );
        Ok(())
    }

    #[test]
    fn long_keys_in_legacy_revisions() -> Result<(), Error> {
        let model = northwind().with_revision(ProtocolRevision::V3);
        let compiler = CommandCompiler::new(&model);
        let cmd = CommandModel::for_collection("Products")
            .filter(expression().member("ProductID").equal(1i64));
        assert_eq!(compiler.compile_text(&cmd)?, "Products(1L)");
        let compiler = CommandCompiler::new(&model).with_revision(ProtocolRevision::V4);
        assert_eq!(compiler.compile_text(&cmd)?, "Products(1)");
        Ok(())
    }

    #[test]
    fn explicit_keys() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        assert_eq!(
            compiler.compile_text(&CommandModel::for_collection("Customers").key("ALFKI"))?,
            "Customers('ALFKI')"
        );
        assert_eq!(
            compiler.compile_text(
                &CommandModel::for_collection("Order_Details")
                    .key_values(vec![("ProductID", 2), ("OrderID", 1)])
            )?,
            "Order_Details(OrderID=1,ProductID=2)"
        );
        let e = compiler
            .compile_text(&CommandModel::for_collection("Order_Details").key(1))
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::InvalidArgument);
        let e = compiler
            .compile_text(&CommandModel::for_collection("Order_Details").key_values(vec![("OrderID", 1)]))
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::InvalidArgument);
        Ok(())
    }

    #[test]
    fn query_options_in_protocol_order() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let cmd = CommandModel::for_collection("Products")
            .top(5)
            .order_by_descending("unit_price")
            .skip(10)
            .expand("Category")
            .select(&["ProductName", "UnitPrice"])
            .filter(expression().member("UnitPrice").greater_than(20))
            .inline_count();
        assert_eq!(
            compiler.compile_text(&cmd)?,
            "Products?$filter=UnitPrice%20gt%2020&$select=ProductName%2CUnitPrice\
             &$expand=Category&$orderby=UnitPrice%20desc&$skip=10&$top=5&$count=true"
        );
        let legacy = northwind().with_revision(ProtocolRevision::V2);
        let compiler = CommandCompiler::new(&legacy);
        assert_eq!(
            compiler.compile_text(&CommandModel::for_collection("Products").inline_count())?,
            "Products?$inlinecount=allpages"
        );
        assert_eq!(
            compiler.compile_text(&CommandModel::for_collection("Products").count())?,
            "Products/$count"
        );
        Ok(())
    }

    #[test]
    fn nested_expand() -> Result<(), Error> {
        let cmd = CommandModel::for_collection("Customers").expand_nested(
            "Orders",
            ExpandOptions::new()
                .select(&["OrderDate"])
                .expand("Order_Details"),
        );
        let model = northwind();
        assert_eq!(
            CommandCompiler::new(&model).compile_text(&cmd)?,
            format!(
                "Customers?$expand={}",
                encode_query_value("Orders($select=OrderDate;$expand=Order_Details)")
            )
        );
        let legacy = northwind().with_revision(ProtocolRevision::V3);
        assert_eq!(
            CommandCompiler::new(&legacy).compile_text(&cmd)?,
            format!(
                "Customers?$select={}&$expand={}",
                encode_query_value("*,Orders/OrderDate"),
                encode_query_value("Orders/Order_Details")
            )
        );
        Ok(())
    }

    #[test]
    fn navigation() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let x = expression();
        let cmd = CommandModel::for_collection("Employees")
            .filter(x.member("EmployeeID").equal(1))
            .navigate_to("Superior");
        assert_eq!(compiler.compile_text(&cmd)?, "Employees(1)/Superior");
        let cmd = CommandModel::for_collection("Customers")
            .filter(x.member("CustomerID").equal("ALFKI"))
            .navigate_to("Orders");
        assert_eq!(compiler.compile_text(&cmd)?, "Customers('ALFKI')/Orders");
        let cmd = CommandModel::for_collection("Orders")
            .filter(x.member("OrderID").equal(10952))
            .navigate_to("OrderDetails");
        assert_eq!(compiler.compile_text(&cmd)?, "Orders(10952)/Order_Details");

        let cmd = CommandModel::for_collection("Products")
            .filter(x.member("UnitPrice").greater_than(1))
            .navigate_to("Category");
        assert_eq!(
            compiler.compile_text(&cmd).unwrap_err().error_type,
            ErrorType::InvalidArgument
        );
        Ok(())
    }

    #[test]
    fn validation_errors() {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let x = expression();
        let e = compiler
            .compile_text(&CommandModel::for_collection("Products").filter(x.member("Nmae").equal(1)))
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::UnknownMember);
        assert_eq!(e.command.as_deref(), Some("Products"));

        let e = compiler
            .compile_text(
                &CommandModel::for_collection("Products")
                    .filter(x.member("ProductName").call("replace", vec!["a".into(), "b".into()])),
            )
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::UnsupportedFunction);

        let e = compiler
            .compile_text(
                &CommandModel::for_collection("Products")
                    .filter(x.member("ProductName").call("substring", vec!["a".into()])),
            )
            .unwrap_err();
        assert_eq!(e.error_type, ErrorType::InvalidArgument);
    }

    #[test]
    fn mutations() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let legacy_model = northwind().with_revision(ProtocolRevision::V3);
        let legacy = CommandCompiler::new(&legacy_model);

        let insert = CommandModel::for_collection("Products").data(serde_json::json!({"ProductName": "Test"}));
        let request = compiler.compile_request(&insert, Mutation::Insert)?;
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.command_text, "Products");
        assert_eq!(request.body, Some(serde_json::json!({"ProductName": "Test"})));

        let update = CommandModel::for_collection("Products")
            .key(1)
            .data(serde_json::json!({"UnitPrice": 10}));
        assert_eq!(
            compiler.compile_request(&update, Mutation::Update { full: false })?.method,
            HttpMethod::Patch
        );
        assert_eq!(
            legacy.compile_request(&update, Mutation::Update { full: false })?.method,
            HttpMethod::Merge
        );
        assert_eq!(
            compiler.compile_request(&update, Mutation::Update { full: true })?.method,
            HttpMethod::Put
        );

        let delete = CommandModel::for_collection("Products").filter(expression().member("ProductID").equal(1));
        let request = compiler.compile_request(&delete, Mutation::Delete)?;
        assert_eq!((request.method, request.command_text.as_str()), (HttpMethod::Delete, "Products(1)"));

        let unkeyed = CommandModel::for_collection("Products").data(serde_json::json!({}));
        assert_eq!(
            compiler.compile_request(&unkeyed, Mutation::Delete).unwrap_err().error_type,
            ErrorType::InvalidArgument
        );
        Ok(())
    }

    #[test]
    fn links() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let legacy_model = northwind().with_revision(ProtocolRevision::V3);
        let legacy = CommandCompiler::new(&legacy_model);
        let product = CommandModel::for_collection("Products").key(1);

        let link = Mutation::Link {
            navigation: "Category".to_owned(),
            target: EntityRef::key("Categories", 2),
        };
        let request = compiler.compile_request(&product, link.clone())?;
        assert_eq!(request.method, HttpMethod::Put);
        assert_eq!(request.command_text, "Products(1)/Category/$ref");
        assert_eq!(request.body, Some(serde_json::json!({"@odata.id": "Categories(2)"})));
        let request = legacy.compile_request(&product, link)?;
        assert_eq!(request.command_text, "Products(1)/$links/Category");
        assert_eq!(request.body, Some(serde_json::json!({"uri": "Categories(2)"})));

        let category = CommandModel::for_collection("Categories").key(2);
        let request = compiler.compile_request(
            &category,
            Mutation::Link {
                navigation: "Products".to_owned(),
                target: EntityRef::key("Products", 1),
            },
        )?;
        assert_eq!(request.method, HttpMethod::Post);

        let unlink = Mutation::Unlink {
            navigation: "Products".to_owned(),
            target: Some(EntityRef::key("Products", 1)),
        };
        let request = compiler.compile_request(&category, unlink.clone())?;
        assert_eq!(request.method, HttpMethod::Delete);
        assert_eq!(
            request.command_text,
            "Categories(2)/Products/$ref?$id=Products%281%29"
        );
        assert_eq!(
            legacy.compile_request(&category, unlink)?.command_text,
            "Categories(2)/$links/Products(1)"
        );
        assert!(compiler
            .compile_request(
                &category,
                Mutation::Unlink {
                    navigation: "Products".to_owned(),
                    target: None
                }
            )
            .is_err());
        Ok(())
    }

    #[test]
    fn functions_and_actions() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let legacy_model = northwind().with_revision(ProtocolRevision::V2);
        let legacy = CommandCompiler::new(&legacy_model);

        let cmd = CommandModel::for_function("ParseInt").function_args(vec![("number", "1")]);
        assert_eq!(compiler.compile_text(&cmd)?, "ParseInt(number='1')");
        assert_eq!(legacy.compile_text(&cmd)?, "ParseInt?number=%271%27");
        assert_eq!(
            compiler.compile_request(&cmd, Mutation::InvokeFunction)?.method,
            HttpMethod::Get
        );

        let cmd = CommandModel::for_function("GetCustomersByCity")
            .function_args(vec![("city", "London")])
            .top(2);
        assert_eq!(
            compiler.compile_text(&cmd)?,
            "GetCustomersByCity(city='London')?$top=2"
        );

        let missing = CommandModel::for_function("ParseInt");
        assert_eq!(
            compiler.compile_text(&missing).unwrap_err().error_type,
            ErrorType::InvalidArgument
        );
        let wrong = CommandModel::for_function("ParseInt").function_args(vec![("number", 1)]);
        assert!(compiler.compile_text(&wrong).is_err());

        let action = CommandModel::for_action("DiscontinueProduct").action_args(vec![("productID", 1)]);
        let request = compiler.compile_request(&action, Mutation::InvokeAction)?;
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.command_text, "DiscontinueProduct");
        assert_eq!(request.body, Some(serde_json::json!({"productID": 1})));
        Ok(())
    }

    #[test]
    fn filter_text_is_passed_through() -> Result<(), Error> {
        let model = northwind();
        let compiler = CommandCompiler::new(&model);
        let cmd = CommandModel::for_collection("Products").filter_text("UnitPrice gt 5");
        assert_eq!(compiler.compile_text(&cmd)?, "Products?$filter=UnitPrice%20gt%205");
        assert_eq!(
            extract_filter("Products", "products?$filter=UnitPrice%20gt%205"),
            "UnitPrice gt 5"
        );
        assert_eq!(extract_filter("Products", "UnitPrice gt 5"), "UnitPrice gt 5");

        let cmd = CommandModel::for_collection("Products")
            .filter(Expression::reference("ProductID").equal(1))
            .filter_text("UnitPrice gt 5");
        assert_eq!(
            compiler.compile_text(&cmd)?,
            "Products?$filter=%28ProductID%20eq%201%29%20and%20%28UnitPrice%20gt%205%29"
        );
        Ok(())
    }
}
