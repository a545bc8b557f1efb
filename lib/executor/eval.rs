//! Concrete evaluation and constant folding of `il::Expression`.

use crate::il;
use crate::Error;

fn binop<F>(
    lhs: &il::Expression,
    rhs: &il::Expression,
    lookup: &dyn Fn(&il::Scalar) -> Option<il::Constant>,
    f: F,
) -> Result<il::Constant, Error>
where
    F: Fn(&il::Constant, &il::Constant) -> Result<u64, Error>,
{
    let l = eval_with(lhs, lookup)?;
    let r = eval_with(rhs, lookup)?;
    Ok(il::Constant::new(f(&l, &r)?, lhs.bits()))
}

fn cmp<F>(
    lhs: &il::Expression,
    rhs: &il::Expression,
    lookup: &dyn Fn(&il::Scalar) -> Option<il::Constant>,
    f: F,
) -> Result<il::Constant, Error>
where
    F: Fn(&il::Constant, &il::Constant) -> bool,
{
    let l = eval_with(lhs, lookup)?;
    let r = eval_with(rhs, lookup)?;
    Ok(il::Constant::new(u64::from(f(&l, &r)), 1))
}

/// Evaluate an expression which contains no scalars.
pub fn eval(expr: &il::Expression) -> Result<il::Constant, Error> {
    eval_with(expr, &|_| None)
}

/// Evaluate an expression, taking the values of scalars from `lookup`.
///
/// Returns `Error::UnboundScalar` if `lookup` has no value for a scalar.
pub fn eval_with(
    expr: &il::Expression,
    lookup: &dyn Fn(&il::Scalar) -> Option<il::Constant>,
) -> Result<il::Constant, Error> {
    match *expr {
        il::Expression::Scalar(ref scalar) => match lookup(scalar) {
            Some(constant) => Ok(il::Constant::new(constant.value(), scalar.bits())),
            None => Err(Error::UnboundScalar(scalar.name().to_string())),
        },
        il::Expression::Constant(ref constant) => Ok(constant.clone()),
        il::Expression::Add(ref lhs, ref rhs) => {
            binop(lhs, rhs, lookup, |l, r| Ok(l.value().wrapping_add(r.value())))
        }
        il::Expression::Sub(ref lhs, ref rhs) => {
            binop(lhs, rhs, lookup, |l, r| Ok(l.value().wrapping_sub(r.value())))
        }
        il::Expression::Mul(ref lhs, ref rhs) => {
            binop(lhs, rhs, lookup, |l, r| Ok(l.value().wrapping_mul(r.value())))
        }
        il::Expression::Divu(ref lhs, ref rhs) => binop(lhs, rhs, lookup, |l, r| {
            if r.is_zero() {
                Err(Error::Arithmetic("Division by zero".to_string()))
            } else {
                Ok(l.value() / r.value())
            }
        }),
        il::Expression::Modu(ref lhs, ref rhs) => binop(lhs, rhs, lookup, |l, r| {
            if r.is_zero() {
                Err(Error::Arithmetic("Division by zero".to_string()))
            } else {
                Ok(l.value() % r.value())
            }
        }),
        il::Expression::And(ref lhs, ref rhs) => {
            binop(lhs, rhs, lookup, |l, r| Ok(l.value() & r.value()))
        }
        il::Expression::Or(ref lhs, ref rhs) => {
            binop(lhs, rhs, lookup, |l, r| Ok(l.value() | r.value()))
        }
        il::Expression::Xor(ref lhs, ref rhs) => {
            binop(lhs, rhs, lookup, |l, r| Ok(l.value() ^ r.value()))
        }
        il::Expression::Shl(ref lhs, ref rhs) => binop(lhs, rhs, lookup, |l, r| {
            if r.value() >= l.bits() as u64 {
                Ok(0)
            } else {
                Ok(l.value() << r.value())
            }
        }),
        il::Expression::Shr(ref lhs, ref rhs) => binop(lhs, rhs, lookup, |l, r| {
            if r.value() >= l.bits() as u64 {
                Ok(0)
            } else {
                Ok(l.value() >> r.value())
            }
        }),
        il::Expression::Cmpeq(ref lhs, ref rhs) => cmp(lhs, rhs, lookup, |l, r| l == r),
        il::Expression::Cmpneq(ref lhs, ref rhs) => cmp(lhs, rhs, lookup, |l, r| l != r),
        il::Expression::Cmplts(ref lhs, ref rhs) => {
            cmp(lhs, rhs, lookup, |l, r| l.value_i64() < r.value_i64())
        }
        il::Expression::Cmpltu(ref lhs, ref rhs) => {
            cmp(lhs, rhs, lookup, |l, r| l.value() < r.value())
        }
        il::Expression::Zext(bits, ref src) => {
            Ok(il::Constant::new(eval_with(src, lookup)?.value(), bits))
        }
        il::Expression::Sext(bits, ref src) => Ok(il::Constant::new(
            eval_with(src, lookup)?.value_i64() as u64,
            bits,
        )),
        il::Expression::Trun(bits, ref src) => {
            Ok(il::Constant::new(eval_with(src, lookup)?.value(), bits))
        }
        il::Expression::Ite(ref cond, ref then, ref else_) => {
            if eval_with(cond, lookup)?.is_true() {
                eval_with(then, lookup)
            } else {
                eval_with(else_, lookup)
            }
        }
    }
}

/// Replace every scalar for which `lookup` has an expression.
pub fn substitute(
    expr: &il::Expression,
    lookup: &dyn Fn(&il::Scalar) -> Option<il::Expression>,
) -> Result<il::Expression, Error> {
    let s = |e: &il::Expression| substitute(e, lookup);
    Ok(match *expr {
        il::Expression::Scalar(ref scalar) => match lookup(scalar) {
            Some(replacement) => {
                if replacement.bits() != scalar.bits() {
                    return Err(Error::Sort);
                }
                replacement
            }
            None => expr.clone(),
        },
        il::Expression::Constant(_) => expr.clone(),
        il::Expression::Add(ref lhs, ref rhs) => il::Expression::add(s(lhs)?, s(rhs)?)?,
        il::Expression::Sub(ref lhs, ref rhs) => il::Expression::sub(s(lhs)?, s(rhs)?)?,
        il::Expression::Mul(ref lhs, ref rhs) => il::Expression::mul(s(lhs)?, s(rhs)?)?,
        il::Expression::Divu(ref lhs, ref rhs) => il::Expression::divu(s(lhs)?, s(rhs)?)?,
        il::Expression::Modu(ref lhs, ref rhs) => il::Expression::modu(s(lhs)?, s(rhs)?)?,
        il::Expression::And(ref lhs, ref rhs) => il::Expression::and(s(lhs)?, s(rhs)?)?,
        il::Expression::Or(ref lhs, ref rhs) => il::Expression::or(s(lhs)?, s(rhs)?)?,
        il::Expression::Xor(ref lhs, ref rhs) => il::Expression::xor(s(lhs)?, s(rhs)?)?,
        il::Expression::Shl(ref lhs, ref rhs) => il::Expression::shl(s(lhs)?, s(rhs)?)?,
        il::Expression::Shr(ref lhs, ref rhs) => il::Expression::shr(s(lhs)?, s(rhs)?)?,
        il::Expression::Cmpeq(ref lhs, ref rhs) => il::Expression::cmpeq(s(lhs)?, s(rhs)?)?,
        il::Expression::Cmpneq(ref lhs, ref rhs) => il::Expression::cmpneq(s(lhs)?, s(rhs)?)?,
        il::Expression::Cmplts(ref lhs, ref rhs) => il::Expression::cmplts(s(lhs)?, s(rhs)?)?,
        il::Expression::Cmpltu(ref lhs, ref rhs) => il::Expression::cmpltu(s(lhs)?, s(rhs)?)?,
        il::Expression::Zext(bits, ref src) => il::Expression::zext(bits, s(src)?)?,
        il::Expression::Sext(bits, ref src) => il::Expression::sext(bits, s(src)?)?,
        il::Expression::Trun(bits, ref src) => il::Expression::trun(bits, s(src)?)?,
        il::Expression::Ite(ref cond, ref then, ref else_) => {
            il::Expression::ite(s(cond)?, s(then)?, s(else_)?)?
        }
    })
}

fn is_const(expr: &il::Expression, value: u64) -> bool {
    expr.get_constant()
        .map(|c| c.value() == value)
        .unwrap_or(false)
}

/// Fold constants in an expression, bottom-up.
///
/// Sub-expressions without scalars are evaluated, `ite` with a constant
/// condition selects its branch, and a handful of identities are applied. The
/// result is semantically equal to the input.
pub fn simplify(expr: &il::Expression) -> Result<il::Expression, Error> {
    if expr.all_constants() {
        return Ok(eval(expr)?.into());
    }

    Ok(match *expr {
        il::Expression::Scalar(_) | il::Expression::Constant(_) => expr.clone(),
        il::Expression::Add(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if is_const(&rhs, 0) {
                lhs
            } else if is_const(&lhs, 0) {
                rhs
            } else {
                il::Expression::add(lhs, rhs)?
            }
        }
        il::Expression::Sub(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if is_const(&rhs, 0) {
                lhs
            } else if lhs == rhs {
                il::expr_const(0, lhs.bits())
            } else {
                il::Expression::sub(lhs, rhs)?
            }
        }
        il::Expression::Mul(ref lhs, ref rhs) => {
            il::Expression::mul(simplify(lhs)?, simplify(rhs)?)?
        }
        il::Expression::Divu(ref lhs, ref rhs) => {
            il::Expression::divu(simplify(lhs)?, simplify(rhs)?)?
        }
        il::Expression::Modu(ref lhs, ref rhs) => {
            il::Expression::modu(simplify(lhs)?, simplify(rhs)?)?
        }
        il::Expression::And(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if is_const(&lhs, 0) || is_const(&rhs, 0) {
                il::expr_const(0, lhs.bits())
            } else if lhs.bits() == 1 && is_const(&lhs, 1) {
                rhs
            } else if lhs.bits() == 1 && is_const(&rhs, 1) {
                lhs
            } else {
                il::Expression::and(lhs, rhs)?
            }
        }
        il::Expression::Or(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if is_const(&rhs, 0) {
                lhs
            } else if is_const(&lhs, 0) {
                rhs
            } else {
                il::Expression::or(lhs, rhs)?
            }
        }
        il::Expression::Xor(ref lhs, ref rhs) => {
            il::Expression::xor(simplify(lhs)?, simplify(rhs)?)?
        }
        il::Expression::Shl(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if is_const(&rhs, 0) {
                lhs
            } else {
                il::Expression::shl(lhs, rhs)?
            }
        }
        il::Expression::Shr(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if is_const(&rhs, 0) {
                lhs
            } else {
                il::Expression::shr(lhs, rhs)?
            }
        }
        il::Expression::Cmpeq(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if lhs == rhs {
                il::expr_true()
            } else {
                il::Expression::cmpeq(lhs, rhs)?
            }
        }
        il::Expression::Cmpneq(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if lhs == rhs {
                il::expr_false()
            } else {
                il::Expression::cmpneq(lhs, rhs)?
            }
        }
        il::Expression::Cmplts(ref lhs, ref rhs) => {
            il::Expression::cmplts(simplify(lhs)?, simplify(rhs)?)?
        }
        il::Expression::Cmpltu(ref lhs, ref rhs) => {
            let (lhs, rhs) = (simplify(lhs)?, simplify(rhs)?);
            if lhs == rhs || is_const(&rhs, 0) {
                il::expr_false()
            } else {
                il::Expression::cmpltu(lhs, rhs)?
            }
        }
        il::Expression::Zext(bits, ref src) => {
            let src = simplify(src)?;
            if src.bits() == bits {
                src
            } else {
                il::Expression::zext(bits, src)?
            }
        }
        il::Expression::Sext(bits, ref src) => {
            let src = simplify(src)?;
            if src.bits() == bits {
                src
            } else {
                il::Expression::sext(bits, src)?
            }
        }
        il::Expression::Trun(bits, ref src) => {
            let src = simplify(src)?;
            if src.bits() == bits {
                src
            } else {
                match src {
                    // trun(zext(x)) where x is exactly the truncated width
                    il::Expression::Zext(_, ref inner) if inner.bits() == bits => {
                        inner.as_ref().clone()
                    }
                    src => il::Expression::trun(bits, src)?,
                }
            }
        }
        il::Expression::Ite(ref cond, ref then, ref else_) => {
            let cond = simplify(cond)?;
            match cond.get_constant() {
                Some(c) if c.is_true() => simplify(then)?,
                Some(_) => simplify(else_)?,
                None => {
                    let (then, else_) = (simplify(then)?, simplify(else_)?);
                    if then == else_ {
                        then
                    } else {
                        il::Expression::ite(cond, then, else_)?
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod eval_tests {
    use super::*;

    #[test]
    fn evaluates_with_assignment() {
        let expr = il::Expression::add(il::expr_scalar("x", 32), il::expr_const(0x10, 32)).unwrap();
        let value = eval_with(&expr, &|scalar| {
            if scalar.name() == "x" {
                Some(il::const_(0xfffffff8, 32))
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(value, il::const_(0x8, 32));
        assert!(eval(&expr).is_err());
    }

    #[test]
    fn comparisons() {
        let lt = il::Expression::cmplts(il::expr_const(0xff, 8), il::expr_const(1, 8)).unwrap();
        assert!(eval(&lt).unwrap().is_true());
        let ltu = il::Expression::cmpltu(il::expr_const(0xff, 8), il::expr_const(1, 8)).unwrap();
        assert!(!eval(&ltu).unwrap().is_true());
        let div = il::Expression::divu(il::expr_const(1, 8), il::expr_const(0, 8)).unwrap();
        assert!(eval(&div).is_err());
    }

    #[test]
    fn folds_constants() {
        let expr = il::Expression::add(
            il::Expression::add(il::expr_const(100, 32), il::expr_const(50, 32)).unwrap(),
            il::expr_scalar("test", 32),
        )
        .unwrap();
        let expr = simplify(&expr).unwrap();
        if let il::Expression::Add(lhs, _) = expr {
            assert_eq!(lhs.get_constant().unwrap().value(), 150);
        } else {
            panic!("expected an add");
        }
    }

    #[test]
    fn folds_ite() {
        let x = il::expr_scalar("x", 8);
        let expr = il::Expression::ite(
            il::Expression::cmpeq(il::expr_const(3, 64), il::expr_const(3, 64)).unwrap(),
            x.clone(),
            il::expr_const(0, 8),
        )
        .unwrap();
        assert_eq!(simplify(&expr).unwrap(), x);
    }
}
