//! `cast`: the value-forging builtin.
//!
//! Supported conversions: numeric widenings and narrowings between
//! `:int` and `:real` (real to int truncates toward zero), `:int` and
//! `:rune` in both directions, and the byte-list/string round trips.
//! Casting a list to `:str` interprets integer elements mod 256,
//! concatenates embedded strings, and keeps runes; casting a string to
//! a list shape yields its code points as integers. A `SOME` wrapper
//! is unwrapped once before the conversion. Anything else raises.

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow},
    store::{Value, ValueTag},
    types::{TypeInfo, resolve_type_symbol},
};

pub(crate) fn eval_cast(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("cast", args, 2)?;
    let target = cast_target(ev, &args[0]).map_err(|detail| Flow::Fatal(EvalError::Malformed { head: "cast", detail }))?;
    let value = ev.eval_value(&args[1])?;
    // Nested SOME unwraps once before conversion.
    let value = if value.tag() == ValueTag::Some {
        value.unwrap_inner()?
    } else {
        value
    };
    perform(ev, target, &value)
}

pub(crate) fn check_cast(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "cast requires: target-type expression"));
    }
    let target = ck.resolve_type(&args[0])?;
    if target.is_variadic {
        return Err(ck.error(&args[0], "cast target cannot be variadic"));
    }
    ck.check_value(&args[1])?;
    Ok(target)
}

fn cast_target(ev: &Evaluator, value: &Value) -> Result<ValueTag, String> {
    let text = value
        .symbol_text()
        .map_err(|_| "target must be a type symbol".to_string())?;
    let info = resolve_type_symbol(&text, &ev.forms()).ok_or_else(|| format!("unknown type symbol '{text}'"))?;
    if info.is_variadic {
        return Err("cast target cannot be variadic".to_string());
    }
    Ok(info.base)
}

fn perform(ev: &mut Evaluator, target: ValueTag, value: &Value) -> EvalResult {
    let symbols = ev.symbols().clone();
    let from = value.tag();
    if from == target {
        return Ok(value.clone());
    }
    let incompatible = |ev: &Evaluator| ev.raise(format!("cannot cast {from} to {target}"));

    match (from, target) {
        (ValueTag::Integer, ValueTag::Real) => Ok(Value::create_real(value.as_int()? as f64, &symbols)),
        (ValueTag::Real, ValueTag::Integer) => Ok(Value::create_int(value.as_real()?.trunc() as i64, &symbols)),
        (ValueTag::Integer, ValueTag::Rune) => {
            let raw = value.as_int()?;
            let rune = u32::try_from(raw).ok().and_then(char::from_u32);
            match rune {
                Some(c) => Ok(Value::create_rune(c, &symbols)),
                None => Err(ev.raise(format!("{raw} is not a valid rune"))),
            }
        }
        (ValueTag::Rune, ValueTag::Integer) => Ok(Value::create_int(i64::from(u32::from(value.as_rune()?)), &symbols)),
        (ValueTag::Rune, ValueTag::DqList) => {
            Ok(Value::create_string(&value.as_rune()?.to_string(), &symbols))
        }
        (ValueTag::ParenList | ValueTag::BracketList | ValueTag::BraceList, ValueTag::DqList) => {
            let text = forge_string(ev, value)?;
            Ok(Value::create_string(&text, &symbols))
        }
        (ValueTag::DqList, ValueTag::ParenList | ValueTag::BracketList | ValueTag::BraceList) => {
            let items: Vec<Value> = value
                .as_runes()?
                .into_iter()
                .map(|r| Value::create_int(i64::from(r), &symbols))
                .collect();
            let rebuilt = match target {
                ValueTag::ParenList => Value::create_paren_list(&items, &symbols),
                ValueTag::BracketList => Value::create_bracket_list(&items, &symbols),
                _ => Value::create_brace_list(&items, &symbols),
            };
            Ok(rebuilt?)
        }
        (
            ValueTag::ParenList | ValueTag::BracketList | ValueTag::BraceList,
            ValueTag::ParenList | ValueTag::BracketList | ValueTag::BraceList,
        ) => {
            // Reshaping between list kinds keeps the items.
            let items: Vec<Value> = value.as_list()?.iter().collect();
            let rebuilt = match target {
                ValueTag::ParenList => Value::create_paren_list(&items, &symbols),
                ValueTag::BracketList => Value::create_bracket_list(&items, &symbols),
                _ => Value::create_brace_list(&items, &symbols),
            };
            Ok(rebuilt?)
        }
        _ => Err(incompatible(ev)),
    }
}

/// String forging from a list: integers mod 256, embedded strings
/// concatenated, runes kept, one more SOME unwrap allowed per element.
fn forge_string(ev: &Evaluator, list: &Value) -> Result<String, Flow> {
    let items = list.as_list()?;
    let mut out = String::new();
    for item in items.iter() {
        let item = if item.tag() == ValueTag::Some { item.unwrap_inner()? } else { item };
        match item.tag() {
            ValueTag::Integer => {
                let byte = (item.as_int()?.rem_euclid(256)) as u8;
                out.push(char::from(byte));
            }
            ValueTag::DqList => out.push_str(&item.as_string()?),
            ValueTag::Rune => out.push(item.as_rune()?),
            other => return Err(ev.raise(format!("cannot forge a string from a {other} element"))),
        }
    }
    Ok(out)
}
