//! `if`, `match`, `reflect`, `do`, and `done`.

use std::str::FromStr;

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow},
    store::{Value, ValueTag},
    types::{TypeInfo, TypeName},
};

/// `(if cond then else)` -- cond must evaluate to INTEGER; non-zero
/// selects `then`. The else branch is optional and defaults to none.
pub(crate) fn eval_if(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    if args.len() != 2 && args.len() != 3 {
        return Err(Flow::Fatal(EvalError::Malformed {
            head: "if",
            detail: "requires: condition then [else]".to_string(),
        }));
    }
    let cond = ev.eval_value(&args[0])?;
    let Ok(flag) = cond.as_int() else {
        return Err(ev.raise("if condition must evaluate to an integer"));
    };
    if flag != 0 {
        ev.eval_value(&args[1])
    } else if let Some(alternative) = args.get(2) {
        ev.eval_value(alternative)
    } else {
        Ok(Value::create_none(ev.symbols()))
    }
}

pub(crate) fn check_if(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 && args.len() != 3 {
        return Err(ck.error(call, "if requires: condition then [else]"));
    }
    let cond = ck.check_value(&args[0])?;
    if !cond.compatible(&TypeInfo::of(ValueTag::Integer)) {
        return Err(ck.error_with_signatures(
            &args[0],
            "if condition must be an integer",
            Some(":int".to_string()),
            Some(cond.to_string()),
        ));
    }
    let then_type = ck.check_value(&args[1])?;
    if let Some(alternative) = args.get(2) {
        let else_type = ck.check_value(alternative)?;
        if !then_type.compatible(&else_type) {
            return Err(ck.error_with_signatures(
                alternative,
                "if branches disagree",
                Some(then_type.to_string()),
                Some(else_type.to_string()),
            ));
        }
    }
    Ok(then_type)
}

/// `(match x (lit₁ body₁) …)` -- structural equality against literal
/// patterns; first match wins; no match yields none.
pub(crate) fn eval_match(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    if args.is_empty() {
        return Err(Flow::Fatal(EvalError::Malformed { head: "match", detail: "requires a subject".to_string() }));
    }
    let subject = ev.eval_value(&args[0])?;
    for arm in &args[1..] {
        let (pattern, body) = split_arm(arm, "match")?;
        if subject.structural_eq(&pattern) {
            return ev.eval_value(&body);
        }
    }
    Ok(Value::create_none(ev.symbols()))
}

pub(crate) fn check_match(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.is_empty() {
        return Err(ck.error(call, "match requires a subject"));
    }
    ck.check_value(&args[0])?;
    for arm in &args[1..] {
        let Ok((_pattern, body)) = split_arm(arm, "match") else {
            return Err(ck.error(arm, "match arm must be (pattern body)"));
        };
        ck.check_value(&body)?;
    }
    // A missing arm yields none, so the overall type is open.
    Ok(TypeInfo::any())
}

/// `(reflect x (:type₁ body₁) …)` -- dispatches on the runtime tag of
/// `x`; `:any` arms match every tag.
pub(crate) fn eval_reflect(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    if args.is_empty() {
        return Err(Flow::Fatal(EvalError::Malformed { head: "reflect", detail: "requires a subject".to_string() }));
    }
    let subject = ev.eval_value(&args[0])?;
    for arm in &args[1..] {
        let (pattern, body) = split_arm(arm, "reflect")?;
        let name = arm_type_name(&pattern).ok_or_else(|| {
            Flow::Fatal(EvalError::Malformed { head: "reflect", detail: "arm pattern must be a type symbol".to_string() })
        })?;
        if name == TypeName::Any || name.tag() == subject.tag() {
            return ev.eval_value(&body);
        }
    }
    Ok(Value::create_none(ev.symbols()))
}

pub(crate) fn check_reflect(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.is_empty() {
        return Err(ck.error(call, "reflect requires a subject"));
    }
    ck.check_value(&args[0])?;
    for arm in &args[1..] {
        let Ok((pattern, body)) = split_arm(arm, "reflect") else {
            return Err(ck.error(arm, "reflect arm must be (:type body)"));
        };
        if arm_type_name(&pattern).is_none() {
            return Err(ck.error(&pattern, "reflect arm pattern must be a base type symbol"));
        }
        ck.check_value(&body)?;
    }
    Ok(TypeInfo::any())
}

/// `(do [body])` -- the body evaluates repeatedly until `done`; the
/// loop's value is whatever was passed to `done`.
pub(crate) fn eval_do(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("do", args, 1)?;
    if args[0].tag() != ValueTag::BracketList {
        return Err(Flow::Fatal(EvalError::Malformed { head: "do", detail: "body must be a block".to_string() }));
    }
    ev.loop_depth += 1;
    let result = loop {
        match ev.eval_value(&args[0]) {
            Ok(_) => {}
            Err(Flow::Done(value)) => break Ok(value),
            Err(other) => break Err(other),
        }
    };
    ev.loop_depth -= 1;
    result
}

pub(crate) fn check_do(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 1 || args[0].tag() != ValueTag::BracketList {
        return Err(ck.error(call, "do requires a block body"));
    }
    ck.loop_depth += 1;
    let body = ck.check_value(&args[0]);
    ck.loop_depth -= 1;
    body?;
    // The result is whatever reaches done.
    Ok(TypeInfo::any())
}

/// `(done value)` -- unwind to the innermost `do`. Fatal outside a
/// loop.
pub(crate) fn eval_done(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("done", args, 1)?;
    if ev.loop_depth == 0 {
        return Err(Flow::Fatal(EvalError::DoneOutsideLoop));
    }
    let value = ev.eval_value(&args[0])?;
    Err(Flow::Done(value))
}

pub(crate) fn check_done(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 1 {
        return Err(ck.error(call, "done requires a value"));
    }
    if ck.loop_depth == 0 {
        return Err(ck.error(call, "done outside of a do loop"));
    }
    ck.check_value(&args[0])?;
    Ok(TypeInfo::any())
}

/// Splits a `(pattern body)` arm.
fn split_arm(arm: &Value, head: &'static str) -> Result<(Value, Value), Flow> {
    let malformed = || Flow::Fatal(EvalError::Malformed { head, detail: "arm must be (pattern body)".to_string() });
    if arm.tag() != ValueTag::ParenList {
        return Err(malformed());
    }
    let items = arm.as_list()?;
    if items.len() != 2 {
        return Err(malformed());
    }
    Ok((items.get(0).expect("len 2"), items.get(1).expect("len 2")))
}

fn arm_type_name(pattern: &Value) -> Option<TypeName> {
    let text = pattern.symbol_text().ok()?;
    TypeName::from_str(text.strip_prefix(':')?).ok()
}
