//! A small bit-vector expression language.
//!
//! Memory contents, addresses and path constraints are all expressed in this
//! language. The terminals are `Constant` and `Scalar`, where a `Scalar` is a
//! free symbolic variable. Comparisons yield 1-bit expressions, which are
//! used as booleans throughout the crate.
//!
//! Constant folding and concrete evaluation live in `executor::eval`.

mod constant;
mod expression;
mod scalar;

pub use self::constant::*;
pub use self::expression::*;
pub use self::scalar::*;

/// A convenience function to create a new constant.
///
/// This is the preferred way to create a `Constant`.
pub fn const_(value: u64, bits: usize) -> Constant {
    Constant::new(value, bits)
}

/// A convenience function to create a new constant expression.
///
/// This is the preferred way to create an `Expression::Constant`.
pub fn expr_const(value: u64, bits: usize) -> Expression {
    Expression::constant(Constant::new(value, bits))
}

/// A convenience function to create a new scalar.
///
/// This is the preferred way to create a `Scalar`.
pub fn scalar<S>(name: S, bits: usize) -> Scalar
where
    S: Into<String>,
{
    Scalar::new(name, bits)
}

/// A convenience function to create a new scalar expression.
///
/// This is the preferred way to create an `Expression::Scalar`.
pub fn expr_scalar<S>(name: S, bits: usize) -> Expression
where
    S: Into<String>,
{
    Expression::scalar(Scalar::new(name, bits))
}

/// The 1-bit constant `true`.
pub fn expr_true() -> Expression {
    expr_const(1, 1)
}

/// The 1-bit constant `false`.
pub fn expr_false() -> Expression {
    expr_const(0, 1)
}
