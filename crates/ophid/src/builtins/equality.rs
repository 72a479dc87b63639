//! `eq`: structural equality as an integer.

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalResult, Evaluator},
    store::{Value, ValueTag},
    types::TypeInfo,
};

/// `(eq a b)` -- 1 when structurally equal, 0 otherwise. Cross-type
/// comparisons (including int vs real) are 0; lambdas compare by
/// identity; list shape is part of identity.
pub(crate) fn eval_eq(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("eq", args, 2)?;
    let left = ev.eval_value(&args[0])?;
    let right = ev.eval_value(&args[1])?;
    Ok(Value::create_int(i64::from(left.structural_eq(&right)), ev.symbols()))
}

pub(crate) fn check_eq(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "eq requires two arguments"));
    }
    ck.check_value(&args[0])?;
    ck.check_value(&args[1])?;
    Ok(TypeInfo::of(ValueTag::Integer))
}
