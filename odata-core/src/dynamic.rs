//! Dynamic front end.
//!
//! [DynamicExpression] is a proxy for callers without a static entity type.
//! Member and index access record a reference path; the algebra methods and
//! operators combine proxies into the same [Expression] trees the typed front
//! end produces:
//!
//! ```
//! use odata_core::dynamic::expression;
//!
//! let x = expression();
//! let filter = x.member("ProductName").call("contains", vec!["ai".into()])
//!     & x.member("UnitPrice").greater_than(10);
//! ```
//!
//! A misuse (e.g. a member of a function result) is recorded and reported
//! when the proxy is turned into an expression.

use std::ops::{Add, BitAnd, BitOr, Div, Mul, Neg, Not, Rem, Sub};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::Error;
use crate::expression::{BinaryOp, Expression, ExpressionSource};
use crate::functions;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct DynamicExpression {
    inner: Result<Expression, Error>,
}

/// Root proxy; `expression().member("ProductID")` refers to the `ProductID` property.
pub fn expression() -> DynamicExpression {
    DynamicExpression::root()
}

impl DynamicExpression {
    pub fn root() -> Self {
        DynamicExpression {
            inner: Ok(Expression::Reference(Vec::new())),
        }
    }

    fn map<F>(&self, f: F) -> DynamicExpression
    where
        F: FnOnce(Expression) -> Result<Expression, Error>,
    {
        DynamicExpression {
            inner: self.inner.clone().and_then(f),
        }
    }

    fn combine(&self, op: BinaryOp, other: DynamicExpression) -> DynamicExpression {
        self.map(|left| Ok(Expression::binary(op, left, other.inner?)))
    }

    /// Member access. A zero-argument function name on a member path
    /// (`member("ProductName").member("Length")`) is a function call.
    pub fn member(&self, name: &str) -> DynamicExpression {
        let name = name.to_owned();
        self.map(move |e| match (e, functions::lookup(&name)) {
            (Expression::Reference(path), Some(f)) if f.is_property_like() && !path.is_empty() => {
                Ok(Expression::function(f.canonical, Expression::Reference(path), Vec::new()))
            }
            (Expression::Reference(mut path), _) => {
                path.push(name);
                Ok(Expression::Reference(path))
            }
            (target @ Expression::Function { .. }, Some(f)) if f.is_property_like() => {
                Ok(Expression::function(f.canonical, target, Vec::new()))
            }
            (_, _) => Err(Error::unsupported_expression_with_message(format!(
                "Member '{}' can only be accessed on a member path",
                name
            ))),
        })
    }

    /// Indexer access, `x["Category"]["CategoryName"]`; always a plain path segment.
    pub fn index(&self, name: &str) -> DynamicExpression {
        let name = name.to_owned();
        self.map(move |e| match e {
            Expression::Reference(mut path) => {
                path.push(name);
                Ok(Expression::Reference(path))
            }
            _ => Err(Error::unsupported_expression_with_message(format!(
                "Index '{}' can only be applied to a member path",
                name
            ))),
        })
    }

    /// Function call on this expression, e.g. `.call("starts_with", vec!["Ch".into()])`.
    pub fn call(&self, name: &str, args: Vec<DynamicExpression>) -> DynamicExpression {
        let name = functions::canonical_name(name);
        self.map(move |target| {
            let args = args
                .into_iter()
                .map(|a| a.inner)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expression::function(&name, target, args))
        })
    }

    pub fn equal(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Eq, other.into())
    }
    pub fn not_equal(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Ne, other.into())
    }
    pub fn less_than(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Lt, other.into())
    }
    pub fn less_or_equal(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Le, other.into())
    }
    pub fn greater_than(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Gt, other.into())
    }
    pub fn greater_or_equal(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Ge, other.into())
    }
    pub fn and(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::And, other.into())
    }
    pub fn or(&self, other: impl Into<DynamicExpression>) -> DynamicExpression {
        self.combine(BinaryOp::Or, other.into())
    }

    /// The recorded expression, or the first error met while recording.
    pub fn expression(&self) -> Result<Expression, Error> {
        let e = self.inner.clone()?;
        let mut empty = false;
        e.for_each_reference(&mut |path| empty |= path.is_empty());
        if empty {
            return Err(Error::unsupported_expression_with_message(
                "Dynamic expression root used without a member".to_owned(),
            ));
        }
        Ok(e)
    }
}

impl ExpressionSource for DynamicExpression {
    fn to_expression(&self) -> Result<Expression, Error> {
        self.expression()
    }
}

impl From<Expression> for DynamicExpression {
    fn from(e: Expression) -> Self {
        DynamicExpression { inner: Ok(e) }
    }
}

impl From<&DynamicExpression> for DynamicExpression {
    fn from(e: &DynamicExpression) -> Self {
        e.clone()
    }
}

macro_rules! literal_dynamic_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for DynamicExpression {
                fn from(x: $t) -> Self {
                    DynamicExpression { inner: Ok(Expression::Literal(Value::from(x))) }
                }
            }
        )*
    };
}

literal_dynamic_from!(
    Value, bool, u8, i8, i16, i32, i64, f32, f64, Decimal, &str, String, Uuid,
    chrono::NaiveDateTime, chrono::DateTime<chrono::FixedOffset>, chrono::Duration
);

impl Not for DynamicExpression {
    type Output = DynamicExpression;
    fn not(self) -> DynamicExpression {
        self.map(|e| Ok(!e))
    }
}

impl Neg for DynamicExpression {
    type Output = DynamicExpression;
    fn neg(self) -> DynamicExpression {
        self.map(|e| Ok(-e))
    }
}

macro_rules! dynamic_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<DynamicExpression>> $trait<R> for DynamicExpression {
            type Output = DynamicExpression;
            fn $method(self, rhs: R) -> DynamicExpression {
                self.combine($op, rhs.into())
            }
        }
    };
}

dynamic_operator!(Add, add, BinaryOp::Add);
dynamic_operator!(Sub, sub, BinaryOp::Sub);
dynamic_operator!(Mul, mul, BinaryOp::Mul);
dynamic_operator!(Div, div, BinaryOp::Div);
dynamic_operator!(Rem, rem, BinaryOp::Mod);
dynamic_operator!(BitAnd, bitand, BinaryOp::And);
dynamic_operator!(BitOr, bitor, BinaryOp::Or);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    #[test]
    fn members_record_paths() -> Result<(), Error> {
        let x = expression();
        assert_eq!(
            x.member("Category").member("CategoryName").expression()?,
            Expression::reference("Category.CategoryName")
        );
        assert_eq!(
            x.index("Category").index("CategoryName").expression()?,
            Expression::reference("Category.CategoryName")
        );
        Ok(())
    }

    #[test]
    fn same_tree_as_hand_built() -> Result<(), Error> {
        let x = expression();
        let filter = x.member("ProductID").equal(1) & !x.member("Discontinued").equal(true);
        let expected = Expression::reference("ProductID")
            .equal(1)
            .and(!Expression::reference("Discontinued").equal(true));
        assert_eq!(filter.expression()?, expected);
        Ok(())
    }

    #[test]
    fn functions_and_property_like_members() -> Result<(), Error> {
        let x = expression();
        let e = x.member("ProductName").member("Length").equal(4);
        assert_eq!(
            e.expression()?,
            Expression::reference("ProductName").call("len", vec![]).equal(4)
        );
        let e = x
            .member("ProductName")
            .call("ToLower", vec![])
            .member("Length")
            .greater_than(3);
        assert_eq!(
            e.expression()?,
            Expression::reference("ProductName")
                .call("to_lowercase", vec![])
                .call("len", vec![])
                .greater_than(3)
        );
        // an indexer never turns into a function
        assert_eq!(x.index("Length").expression()?, Expression::reference("Length"));
        Ok(())
    }

    #[test]
    fn errors_are_deferred() {
        let x = expression();
        let e = x
            .member("ProductName")
            .call("contains", vec!["a".into()])
            .member("Name")
            .equal(1);
        assert_eq!(
            e.to_expression().unwrap_err().error_type,
            ErrorType::UnsupportedExpression
        );
        assert!(x.equal(1).to_expression().is_err());
    }

    #[test]
    fn arithmetic() -> Result<(), Error> {
        let x = expression();
        let e = (x.member("UnitPrice") * 2).less_than(-x.member("Discount"));
        assert_eq!(
            e.expression()?,
            (Expression::reference("UnitPrice") * 2).less_than(-Expression::reference("Discount"))
        );
        Ok(())
    }
}
