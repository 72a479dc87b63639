//! `eval` and `at`.

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow},
    parse::parse,
    store::{Value, ValueTag},
    types::TypeInfo,
};

/// `(eval string)` -- parse and evaluate the string in the current
/// scope.
pub(crate) fn eval_eval(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("eval", args, 1)?;
    let source = ev.eval_value(&args[0])?;
    let Ok(text) = source.as_string() else {
        return Err(ev.raise("eval expects a string"));
    };
    let parsed = match parse(&text, ev.symbols()) {
        Ok(parsed) => parsed,
        Err(e) => return Err(ev.raise(e.to_string())),
    };
    ev.eval_value(&parsed.value)
}

pub(crate) fn check_eval(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 1 {
        return Err(ck.error(call, "eval requires a string"));
    }
    let source = ck.check_value(&args[0])?;
    if !source.compatible(&TypeInfo::of(ValueTag::DqList)) {
        return Err(ck.error(&args[0], "eval expects a string"));
    }
    Ok(TypeInfo::any())
}

/// `(at index)` reads an object-storage slot (none when unset);
/// `(at index value)` writes it and yields none.
pub(crate) fn eval_at(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    if args.is_empty() || args.len() > 2 {
        return Err(Flow::Fatal(EvalError::Malformed { head: "at", detail: "requires: index [value]".to_string() }));
    }
    let index_value = ev.eval_value(&args[0])?;
    let Ok(index) = index_value.as_int() else {
        return Err(ev.raise("at index must be an integer"));
    };
    if let Some(value_expr) = args.get(1) {
        let value = ev.eval_value(value_expr)?;
        ev.storage.insert(index, value);
        Ok(Value::create_none(ev.symbols()))
    } else {
        Ok(ev
            .storage
            .get(&index)
            .cloned()
            .unwrap_or_else(|| Value::create_none(ev.symbols())))
    }
}

pub(crate) fn check_at(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.is_empty() || args.len() > 2 {
        return Err(ck.error(call, "at requires: index [value]"));
    }
    let index = ck.check_value(&args[0])?;
    if !index.compatible(&TypeInfo::of(ValueTag::Integer)) {
        return Err(ck.error(&args[0], "at index must be an integer"));
    }
    if let Some(value_expr) = args.get(1) {
        ck.check_value(value_expr)?;
    }
    Ok(TypeInfo::any())
}
