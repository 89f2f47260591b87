//! Typed front end.
//!
//! [Expr] is the host-side expression tree of a single-parameter closure, as
//! produced by the `lambda!` macro of `odata-macro` (or built by hand). A
//! [Lambda] wraps such a tree and translates it into an [Expression]:
//!
//! * member chains rooted at the parameter become [Expression::Reference] paths,
//! * parameter-independent sub-trees (constants, captured values, member access
//!   on captured values, struct construction) are evaluated to literals,
//! * method and function calls become [Expression::Function] nodes,
//! * operators map one to one.
//!
//! A captured value that converts into [Value] keeps its literal type, so a
//! captured `i64` is still an `Int64` and a `Uuid` still a guid. Any other
//! captured value only needs `Serialize`; it is held in its `serde_json` form,
//! which is what member access on it walks through. The `lambda!` macro picks
//! between the two with [Capture].

use serde::Serialize;

use crate::error::Error;
use crate::expression::{BinaryOp, Expression, ExpressionSource};
use crate::functions;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Not,
    Negate,
    /// Type conversion (`as`); widening conversions pass through.
    Convert,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Parameter(String),
    Constant(Value),
    Captured(serde_json::Value),
    /// A captured value that could not be serialized.
    Unevaluable(String),
    Member {
        target: Box<Expr>,
        member: String,
    },
    Call {
        receiver: Option<Box<Expr>>,
        method: String,
        args: Vec<Expr>,
    },
    Unary {
        kind: UnaryKind,
        operand: Box<Expr>,
        /// Target type of a conversion.
        type_name: Option<String>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    New {
        type_name: String,
        fields: Vec<(String, Expr)>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    pub fn parameter(name: &str) -> Expr {
        Expr::Parameter(name.to_owned())
    }

    pub fn constant(value: impl Into<Value>) -> Expr {
        Expr::Constant(value.into())
    }

    pub fn captured<T: Serialize + ?Sized>(value: &T) -> Expr {
        match serde_json::to_value(value) {
            Ok(v) => Expr::Captured(v),
            Err(e) => Expr::Unevaluable(e.to_string()),
        }
    }

    pub fn member(target: Expr, member: &str) -> Expr {
        Expr::Member {
            target: Box::new(target),
            member: member.to_owned(),
        }
    }

    pub fn call(receiver: Option<Expr>, method: &str, args: Vec<Expr>) -> Expr {
        Expr::Call {
            receiver: receiver.map(Box::new),
            method: method.to_owned(),
            args,
        }
    }

    pub fn not(operand: Expr) -> Expr {
        Expr::Unary {
            kind: UnaryKind::Not,
            operand: Box::new(operand),
            type_name: None,
        }
    }

    pub fn negate(operand: Expr) -> Expr {
        Expr::Unary {
            kind: UnaryKind::Negate,
            operand: Box::new(operand),
            type_name: None,
        }
    }

    pub fn convert(operand: Expr, type_name: &str) -> Expr {
        Expr::Unary {
            kind: UnaryKind::Convert,
            operand: Box::new(operand),
            type_name: Some(type_name.to_owned()),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn new_object(type_name: &str, fields: Vec<(&str, Expr)>) -> Expr {
        Expr::New {
            type_name: type_name.to_owned(),
            fields: fields
                .into_iter()
                .map(|(name, e)| (name.to_owned(), e))
                .collect(),
        }
    }

    pub fn index(target: Expr, index: Expr) -> Expr {
        Expr::Index {
            target: Box::new(target),
            index: Box::new(index),
        }
    }

    pub fn conditional(condition: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Conditional {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Parameter(_) => "Parameter",
            Expr::Constant(_) => "Constant",
            Expr::Captured(_) => "Captured",
            Expr::Unevaluable(_) => "Unevaluable",
            Expr::Member { .. } => "MemberAccess",
            Expr::Call { .. } => "Call",
            Expr::Unary { .. } => "Unary",
            Expr::Binary { .. } => "Binary",
            Expr::New { .. } => "New",
            Expr::Index { .. } => "Index",
            Expr::Conditional { .. } => "Conditional",
        }
    }

    /// True if the value of the expression depends on the lambda parameter.
    pub fn depends_on_parameter(&self) -> bool {
        match self {
            Expr::Parameter(_) => true,
            Expr::Constant(_) | Expr::Captured(_) | Expr::Unevaluable(_) => false,
            Expr::Member { target, .. } => target.depends_on_parameter(),
            Expr::Call { receiver, args, .. } => {
                receiver.as_ref().map(|r| r.depends_on_parameter()).unwrap_or(false)
                    || args.iter().any(|a| a.depends_on_parameter())
            }
            Expr::Unary { operand, .. } => operand.depends_on_parameter(),
            Expr::Binary { left, right, .. } => {
                left.depends_on_parameter() || right.depends_on_parameter()
            }
            Expr::New { fields, .. } => fields.iter().any(|(_, e)| e.depends_on_parameter()),
            Expr::Index { target, index } => {
                target.depends_on_parameter() || index.depends_on_parameter()
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                condition.depends_on_parameter()
                    || then.depends_on_parameter()
                    || otherwise.depends_on_parameter()
            }
        }
    }
}

/// A captured value, as wrapped by the `lambda!` macro.
///
/// `(&Capture(&value)).capture()` resolves to [CaptureLiteral] when the value
/// converts into [Value] and falls back to [CaptureSerialized] otherwise;
/// both traits have to be in scope.
pub struct Capture<'a, T: ?Sized>(pub &'a T);

pub trait CaptureLiteral {
    fn capture(&self) -> Expr;
}

impl<T: Clone + Into<Value>> CaptureLiteral for Capture<'_, T> {
    fn capture(&self) -> Expr {
        Expr::Constant(self.0.clone().into())
    }
}

pub trait CaptureSerialized {
    fn capture(&self) -> Expr;
}

impl<T: Serialize + ?Sized> CaptureSerialized for &Capture<'_, T> {
    fn capture(&self) -> Expr {
        Expr::captured(self.0)
    }
}

/// A single-parameter closure over an entity, e.g. `|x| x.ProductID == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub parameter: String,
    pub body: Expr,
}

impl Lambda {
    pub fn new(parameter: &str, body: Expr) -> Self {
        Lambda {
            parameter: parameter.to_owned(),
            body,
        }
    }

    /// Translate the body as a predicate.
    pub fn parse(&self) -> Result<Expression, Error> {
        parse_expr(&self.body)
    }

    /// Member paths selected by a projection body.
    ///
    /// The body is either a single member path (`|x| x.ProductName`) or a
    /// struct whose fields are member paths (`|x| P { name: x.ProductName }`).
    pub fn projection(&self) -> Result<Vec<String>, Error> {
        match &self.body {
            Expr::New { fields, .. } => fields
                .iter()
                .map(|(_, e)| projected_path(e))
                .collect::<Result<Vec<_>, _>>(),
            other => Ok(vec![projected_path(other)?]),
        }
    }
}

impl ExpressionSource for Lambda {
    fn to_expression(&self) -> Result<Expression, Error> {
        self.parse()
    }
}

fn projected_path(expr: &Expr) -> Result<String, Error> {
    match parse_expr(expr)? {
        Expression::Reference(path) => Ok(path.join("/")),
        _ => Err(Error::unsupported_expression_with_message(format!(
            "Projection member must be a member path, got {}",
            expr.kind_name()
        ))),
    }
}

fn parse_expr(expr: &Expr) -> Result<Expression, Error> {
    if !expr.depends_on_parameter() {
        return match expr {
            // construction is for projections; a struct in a filter is an error at rendering
            Expr::Constant(_)
            | Expr::Captured(_)
            | Expr::Member { .. }
            | Expr::New { .. }
            | Expr::Unevaluable(_) => Ok(Expression::Literal(evaluate(expr)?)),
            Expr::Unary {
                kind: UnaryKind::Negate | UnaryKind::Convert,
                ..
            } => Ok(Expression::Literal(evaluate(expr)?)),
            Expr::Unary {
                kind: UnaryKind::Not,
                operand,
                ..
            } => Ok(!parse_expr(operand)?),
            Expr::Binary { op, left, right } => Ok(Expression::binary(
                *op,
                parse_expr(left)?,
                parse_expr(right)?,
            )),
            other => Err(Error::unsupported_expression(other.kind_name())),
        };
    }
    match expr {
        Expr::Parameter(name) => Err(Error::unsupported_expression_with_message(format!(
            "Parameter '{}' can't be used on its own",
            name
        ))),
        Expr::Member { target, member } => parse_member(target, member),
        Expr::Call {
            receiver: None,
            method,
            args,
        } => {
            let (first, rest) = match args.split_first() {
                Some(x) => x,
                None => return Err(Error::unsupported_expression("Call without arguments")),
            };
            if !first.depends_on_parameter() {
                return Err(Error::unsupported_expression_with_message(format!(
                    "The first argument of '{}' must refer to the parameter",
                    method
                )));
            }
            let target = parse_expr(first)?;
            Ok(Expression::function(
                &functions::canonical_name(method),
                target,
                constant_arguments(method, rest)?,
            ))
        }
        Expr::Call {
            receiver: Some(receiver),
            method,
            args,
        } => {
            if !receiver.depends_on_parameter() {
                return Err(Error::unsupported_expression_with_message(format!(
                    "Method '{}' called on a value that does not refer to the parameter",
                    method
                )));
            }
            let target = parse_expr(receiver)?;
            Ok(Expression::function(
                &functions::canonical_name(method),
                target,
                constant_arguments(method, args)?,
            ))
        }
        Expr::Unary { kind, operand, .. } => match kind {
            UnaryKind::Not => Ok(!parse_expr(operand)?),
            UnaryKind::Negate => Ok(-parse_expr(operand)?),
            UnaryKind::Convert => parse_expr(operand),
        },
        Expr::Binary { op, left, right } => Ok(Expression::binary(
            *op,
            parse_expr(left)?,
            parse_expr(right)?,
        )),
        Expr::New { .. } => Err(Error::unsupported_expression_with_message(
            "Struct construction referring to the parameter is only valid as a projection"
                .to_owned(),
        )),
        other => Err(Error::unsupported_expression(other.kind_name())),
    }
}

fn parse_member(target: &Expr, member: &str) -> Result<Expression, Error> {
    if let Expr::Parameter(_) = target {
        return Ok(Expression::Reference(vec![member.to_owned()]));
    }
    let target = parse_expr(target)?;
    match functions::lookup(member) {
        Some(f) if f.is_property_like() => {
            return Ok(Expression::function(f.canonical, target, Vec::new()))
        }
        _ => {}
    }
    match target {
        Expression::Reference(mut path) => {
            path.push(member.to_owned());
            Ok(Expression::Reference(path))
        }
        other => Err(Error::unsupported_expression_with_message(format!(
            "Member '{}' accessed on a non-member expression {:?}",
            member, other
        ))),
    }
}

fn constant_arguments(method: &str, args: &[Expr]) -> Result<Vec<Expression>, Error> {
    args.iter()
        .map(|a| {
            if a.depends_on_parameter() {
                Err(Error::unsupported_expression_with_message(format!(
                    "Arguments of '{}' can't refer to the parameter",
                    method
                )))
            } else {
                Ok(Expression::Literal(evaluate(a)?))
            }
        })
        .collect()
}

/// Evaluate a parameter-independent expression.
fn evaluate(expr: &Expr) -> Result<Value, Error> {
    match expr {
        Expr::Constant(v) => Ok(v.clone()),
        Expr::Captured(json) => Ok(Value::from_json(json)),
        Expr::Unevaluable(message) => Err(Error::invalid_argument(format!(
            "Captured value can't be evaluated: {}",
            message
        ))),
        Expr::Member { .. } => {
            // walk down to the root, collecting member names
            let mut members = Vec::new();
            let mut current = expr;
            while let Expr::Member { target, member } = current {
                members.push(member.as_str());
                current = &**target;
            }
            let mut json = evaluate(current)?.to_json();
            for member in members.iter().rev() {
                json = json.get(*member).cloned().ok_or_else(|| {
                    Error::invalid_argument(format!("Captured value has no member '{}'", member))
                })?;
            }
            Ok(Value::from_json(&json))
        }
        Expr::New { fields, .. } => {
            let mut map = serde_json::Map::new();
            for (name, e) in fields {
                map.insert(name.clone(), evaluate(e)?.to_json());
            }
            Ok(Value::Structured(serde_json::Value::Object(map)))
        }
        Expr::Unary {
            kind: UnaryKind::Negate,
            operand,
            ..
        } => negate(evaluate(operand)?),
        Expr::Unary {
            kind: UnaryKind::Convert,
            operand,
            type_name,
        } => convert(evaluate(operand)?, type_name.as_deref().unwrap_or("")),
        other => Err(Error::unsupported_expression(other.kind_name())),
    }
}

fn negate(value: Value) -> Result<Value, Error> {
    let negated = match &value {
        Value::SByte(x) => x.checked_neg().map(Value::SByte),
        Value::Int16(x) => x.checked_neg().map(Value::Int16),
        Value::Int32(x) => x.checked_neg().map(Value::Int32),
        Value::Int64(x) => x.checked_neg().map(Value::Int64),
        Value::Single(x) => Some(Value::Single(-x)),
        Value::Double(x) => Some(Value::Double(-x)),
        Value::Decimal(x) => Some(Value::Decimal(-*x)),
        Value::Duration(x) => chrono::Duration::zero().checked_sub(x).map(Value::Duration),
        other => {
            return Err(Error::invalid_argument(format!(
                "Can't negate a value of type {}",
                other.type_name()
            )))
        }
    };
    negated.ok_or_else(|| {
        Error::invalid_argument(format!("Negating {:?} overflows {}", value, value.type_name()))
    })
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Byte(x) => Some(*x as i64),
        Value::SByte(x) => Some(*x as i64),
        Value::Int16(x) => Some(*x as i64),
        Value::Int32(x) => Some(*x as i64),
        Value::Int64(x) => Some(*x),
        _ => None,
    }
}

fn float_of(value: &Value) -> Option<f64> {
    match value {
        Value::Single(x) => Some(*x as f64),
        Value::Double(x) => Some(*x),
        other => integer_of(other).map(|x| x as f64),
    }
}

fn convert(value: Value, type_name: &str) -> Result<Value, Error> {
    let out_of_range = || {
        Error::invalid_argument(format!(
            "Value {:?} can't be converted to {}",
            value, type_name
        ))
    };
    let converted = match type_name {
        "i64" => integer_of(&value).map(Value::Int64),
        "i32" => integer_of(&value)
            .map(|x| i32::try_from(x).map(Value::Int32).map_err(|_| out_of_range()))
            .transpose()?,
        "i16" => integer_of(&value)
            .map(|x| i16::try_from(x).map(Value::Int16).map_err(|_| out_of_range()))
            .transpose()?,
        "u8" => integer_of(&value)
            .map(|x| u8::try_from(x).map(Value::Byte).map_err(|_| out_of_range()))
            .transpose()?,
        "f64" => float_of(&value).map(Value::Double),
        "f32" => float_of(&value).map(|x| Value::Single(x as f32)),
        _ => None,
    };
    Ok(converted.unwrap_or(value))
}
