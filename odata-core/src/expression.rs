//! Query expression tree and its algebra.
//!
//! [Expression] is an immutable tree: every composition operator builds a new
//! node around (clones of) its operands, so one expression can be attached to
//! several commands. Rust can not overload `==` or `&&` to return a tree, so the
//! comparisons and boolean connectives are methods ([Expression::equal],
//! [Expression::and], ...), while `!`, unary `-`, `+ - * / %` and `& |` are
//! provided through the `std::ops` traits.

use std::ops::{Add, BitAnd, BitOr, Div, Mul, Neg, Not, Rem, Sub};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Error;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Protocol keyword of the operator.
    pub fn keyword(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "eq",
            BinaryOp::Ne => "ne",
            BinaryOp::Lt => "lt",
            BinaryOp::Le => "le",
            BinaryOp::Gt => "gt",
            BinaryOp::Ge => "ge",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<BinaryOp> {
        match keyword {
            "eq" => Some(BinaryOp::Eq),
            "ne" => Some(BinaryOp::Ne),
            "lt" => Some(BinaryOp::Lt),
            "le" => Some(BinaryOp::Le),
            "gt" => Some(BinaryOp::Gt),
            "ge" => Some(BinaryOp::Ge),
            "and" => Some(BinaryOp::And),
            "or" => Some(BinaryOp::Or),
            "add" => Some(BinaryOp::Add),
            "sub" => Some(BinaryOp::Sub),
            "mul" => Some(BinaryOp::Mul),
            "div" => Some(BinaryOp::Div),
            "mod" => Some(BinaryOp::Mod),
            _ => None,
        }
    }

    /// Binding strength, higher binds tighter.
    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 5,
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_comparison(&self) -> bool {
        self.precedence() == 3
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Property or navigation path, e.g. `["Category", "Name"]`.
    Reference(Vec<String>),
    Literal(Value),
    /// Call of a canonical function (see [crate::functions]) on `target`.
    Function {
        name: String,
        target: Box<Expression>,
        args: Vec<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
}

impl Expression {
    /// Reference from a path written with `.` or `/` separators.
    pub fn reference(path: &str) -> Expression {
        Expression::Reference(
            path.split(|c: char| c == '.' || c == '/')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_owned())
                .collect(),
        )
    }

    pub fn path<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Expression {
        Expression::Reference(segments.into_iter().map(|s| s.into()).collect())
    }

    pub fn literal(value: impl Into<Value>) -> Expression {
        Expression::Literal(value.into())
    }

    pub fn null() -> Expression {
        Expression::Literal(Value::Null)
    }

    pub fn function(name: &str, target: Expression, args: Vec<Expression>) -> Expression {
        Expression::Function {
            name: name.to_owned(),
            target: Box::new(target),
            args,
        }
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Expression {
        Expression::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equal(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Eq, self, other.into())
    }
    pub fn not_equal(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Ne, self, other.into())
    }
    pub fn less_than(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Lt, self, other.into())
    }
    pub fn less_or_equal(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Le, self, other.into())
    }
    pub fn greater_than(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Gt, self, other.into())
    }
    pub fn greater_or_equal(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Ge, self, other.into())
    }
    pub fn and(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::And, self, other.into())
    }
    pub fn or(self, other: impl Into<Expression>) -> Expression {
        Expression::binary(BinaryOp::Or, self, other.into())
    }

    /// Function call with this expression as the target.
    pub fn call(self, name: &str, args: Vec<Expression>) -> Expression {
        Expression::function(name, self, args)
    }

    pub fn as_reference(&self) -> Option<&[String]> {
        match self {
            Expression::Reference(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expression::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Top-level operands of a (possibly degenerate) conjunction, left to right.
    pub fn conjuncts(&self) -> Vec<&Expression> {
        match self {
            Expression::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let mut result = left.conjuncts();
                result.extend(right.conjuncts());
                result
            }
            other => vec![other],
        }
    }

    /// Visit every reference path in the tree.
    pub fn for_each_reference<F: FnMut(&[String])>(&self, f: &mut F) {
        match self {
            Expression::Reference(path) => f(path),
            Expression::Literal(_) => {}
            Expression::Function { target, args, .. } => {
                target.for_each_reference(f);
                for arg in args {
                    arg.for_each_reference(f);
                }
            }
            Expression::Unary { operand, .. } => operand.for_each_reference(f),
            Expression::Binary { left, right, .. } => {
                left.for_each_reference(f);
                right.for_each_reference(f);
            }
        }
    }
}

/// Anything a command filter can be built from.
///
/// Implemented by [Expression] itself and by both front ends
/// ([crate::dynamic::DynamicExpression] and [crate::typed::Lambda]).
pub trait ExpressionSource {
    fn to_expression(&self) -> Result<Expression, Error>;
}

impl ExpressionSource for Expression {
    fn to_expression(&self) -> Result<Expression, Error> {
        Ok(self.clone())
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Literal(value)
    }
}

impl From<&Expression> for Expression {
    fn from(e: &Expression) -> Self {
        e.clone()
    }
}

macro_rules! literal_expression_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Expression {
                fn from(x: $t) -> Self {
                    Expression::Literal(Value::from(x))
                }
            }
        )*
    };
}

literal_expression_from!(
    bool, u8, i8, i16, i32, i64, f32, f64, Decimal, &str, String, Uuid,
    chrono::NaiveDateTime, chrono::DateTime<chrono::FixedOffset>, chrono::Duration
);

impl Not for Expression {
    type Output = Expression;
    fn not(self) -> Expression {
        Expression::unary(UnaryOp::Not, self)
    }
}

impl Neg for Expression {
    type Output = Expression;
    fn neg(self) -> Expression {
        Expression::unary(UnaryOp::Negate, self)
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expression>> $trait<R> for Expression {
            type Output = Expression;
            fn $method(self, rhs: R) -> Expression {
                Expression::binary($op, self, rhs.into())
            }
        }
    };
}

binary_operator!(Add, add, BinaryOp::Add);
binary_operator!(Sub, sub, BinaryOp::Sub);
binary_operator!(Mul, mul, BinaryOp::Mul);
binary_operator!(Div, div, BinaryOp::Div);
binary_operator!(Rem, rem, BinaryOp::Mod);
binary_operator!(BitAnd, bitand, BinaryOp::And);
binary_operator!(BitOr, bitor, BinaryOp::Or);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_splits_paths() {
        assert_eq!(
            Expression::reference("Category.Name"),
            Expression::Reference(vec!["Category".to_owned(), "Name".to_owned()])
        );
        assert_eq!(Expression::reference("Category/Name"), Expression::reference("Category.Name"));
    }

    #[test]
    fn operators_build_new_nodes() {
        let id = Expression::reference("ProductID");
        let eq = id.clone().equal(1);
        let negated = !eq.clone();
        assert_eq!(
            negated,
            Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(eq.clone())
            }
        );
        // the operands are left untouched
        assert_eq!(id, Expression::reference("ProductID"));
        assert_eq!(
            eq,
            Expression::binary(BinaryOp::Eq, Expression::reference("ProductID"), Expression::literal(1))
        );
    }

    #[test]
    fn arithmetic_and_boolean_ops() {
        let price = Expression::reference("UnitPrice");
        let e = (price.clone() * 2 + 1).greater_than(10) & price.clone().less_than(100);
        match e {
            Expression::Binary { op: BinaryOp::And, left, .. } => match *left {
                Expression::Binary { op: BinaryOp::Gt, left, .. } => {
                    assert!(matches!(*left, Expression::Binary { op: BinaryOp::Add, .. }))
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(-price, Expression::Unary { op: UnaryOp::Negate, .. }));
    }

    #[test]
    fn conjuncts_flatten_nested_and() {
        let a = Expression::reference("A").equal(1);
        let b = Expression::reference("B").equal(2);
        let c = Expression::reference("C").equal(3);
        let all = a.clone().and(b.clone().and(c.clone()));
        assert_eq!(all.conjuncts(), vec![&a, &b, &c]);
        let single = a.clone();
        assert_eq!(single.conjuncts(), vec![&a]);
    }

    #[test]
    fn keywords_round_trip() {
        for op in [BinaryOp::Eq, BinaryOp::Le, BinaryOp::Or, BinaryOp::Mod] {
            assert_eq!(BinaryOp::from_keyword(op.keyword()), Some(op));
        }
    }
}
