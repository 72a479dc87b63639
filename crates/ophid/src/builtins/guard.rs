//! `try`, `recover`, and `assert`: the structured-exception surface.

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalResult, Evaluator, Flow},
    scope::{Binding, Frame},
    store::{Value, ValueTag},
    types::TypeInfo,
};

/// Name the recover handler sees the raised payload under.
const EXCEPTION_BINDING: &str = "$exception";

/// `(try expr handler)` -- if `expr` raises, evaluate `handler`.
pub(crate) fn eval_try(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("try", args, 2)?;
    match ev.eval_value(&args[0]) {
        Err(Flow::Raise(_)) => ev.eval_value(&args[1]),
        other => other,
    }
}

pub(crate) fn check_try(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "try requires: expression handler"));
    }
    let tried = ck.check_value(&args[0])?;
    let handler = ck.check_value(&args[1])?;
    if !tried.compatible(&handler) {
        return Err(ck.error_with_signatures(
            &args[1],
            "try handler must produce the tried expression's type",
            Some(tried.to_string()),
            Some(handler.to_string()),
        ));
    }
    Ok(tried)
}

/// `(recover [body] [handler])` -- like `try`, but the handler runs
/// with `$exception` bound to the raised payload.
pub(crate) fn eval_recover(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("recover", args, 2)?;
    match ev.eval_value(&args[0]) {
        Err(Flow::Raise(payload)) => {
            let frame = Frame::child(&ev.current);
            Frame::define(
                &frame,
                EXCEPTION_BINDING,
                Binding::new(TypeInfo::of(ValueTag::Error), payload),
            );
            let saved = std::mem::replace(&mut ev.current, frame);
            let result = ev.eval_value(&args[1]);
            ev.current = saved;
            result
        }
        other => other,
    }
}

pub(crate) fn check_recover(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "recover requires: body handler"));
    }
    let body = ck.check_value(&args[0])?;
    ck.push_scope();
    ck.define(EXCEPTION_BINDING, TypeInfo::of(ValueTag::Error));
    let handler = ck.check_value(&args[1]);
    ck.pop_scope();
    let handler = handler?;
    if !body.compatible(&handler) {
        return Err(ck.error_with_signatures(
            &args[1],
            "recover handler must produce the body's type",
            Some(body.to_string()),
            Some(handler.to_string()),
        ));
    }
    Ok(body)
}

/// `(assert cond message-string)` -- raises with the message when the
/// condition is zero.
pub(crate) fn eval_assert(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("assert", args, 2)?;
    let cond = ev.eval_value(&args[0])?;
    let Ok(flag) = cond.as_int() else {
        return Err(ev.raise("assert condition must evaluate to an integer"));
    };
    if flag != 0 {
        return Ok(Value::create_none(ev.symbols()));
    }
    let message = ev.eval_value(&args[1])?;
    let rendered = message.as_string().unwrap_or_else(|_| message.to_string());
    Err(ev.raise(rendered))
}

pub(crate) fn check_assert(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "assert requires: condition message"));
    }
    let cond = ck.check_value(&args[0])?;
    if !cond.compatible(&TypeInfo::of(ValueTag::Integer)) {
        return Err(ck.error(&args[0], "assert condition must be an integer"));
    }
    let message = ck.check_value(&args[1])?;
    if !message.compatible(&TypeInfo::of(ValueTag::DqList)) {
        return Err(ck.error(&args[1], "assert message must be a string"));
    }
    Ok(TypeInfo::any())
}
