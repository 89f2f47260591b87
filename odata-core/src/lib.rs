//!
//! # OData core
//!
//! Query construction and compilation core of an OData client. It turns
//! predicates written against entity types into protocol request text for
//! the V2, V3 and V4 revisions of the protocol.
//!
//! ## Glossary
//!
//! **[Expression](crate::expression::Expression)** - the query expression tree:
//! member references, literals, function calls, unary and binary operators.
//! Both front ends produce it and the compiler consumes it.
//!
//! **Typed front end** - a [Lambda](crate::typed::Lambda) over an [Expr](crate::typed::Expr)
//! tree, normally produced by the `lambda!` macro of the `odata-macro` crate from
//! a Rust closure such as `|x| x.ProductID == 1`.
//!
//! **Dynamic front end** - a [DynamicExpression](crate::dynamic::DynamicExpression)
//! proxy that records member chains at run time: `x.member("ProductID").equal(1)`.
//!
//! **[Value](crate::value::Value)** - a typed literal. How it is written on the
//! wire depends on the [protocol revision](crate::value::ProtocolRevision), see [literal].
//!
//! **[Command](crate::command::CommandModel)** - everything a single request is
//! made of: target collection, key, filter, select, expand, ordering, paging.
//!
//! **[Compiler](crate::compiler::CommandCompiler)** - validates a command against
//! the [metadata](crate::metadata::MetadataProvider) and renders its request text.
//! A filter that binds exactly the declared key of a collection is collapsed into
//! a key segment: `Products(1)` instead of `Products?$filter=ProductID eq 1`.
//!
//! **[Batch](crate::batch::BatchAssembler)** - several mutations sent as one
//! changeset; items refer to each other through content-ids (`$1`).
//!
//! **Session** - lazily resolved metadata shared by concurrent callers
//! (`session` module, feature `async_session`).
//!
//! **[Settings](crate::settings::ClientSettings)** - url base, credentials and
//! protocol options, loadable from YAML, JSON or TOML.
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod batch;
pub mod command;
pub mod compiler;
pub mod dynamic;
pub mod error;
pub mod expression;
pub mod functions;
pub mod literal;
pub mod metadata;
pub mod parse;
pub mod request;
#[cfg(feature = "async_session")]
pub mod session;
pub mod settings;
pub mod typed;
pub mod value;
