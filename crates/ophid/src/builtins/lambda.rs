//! `fn` and `apply`.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow, LambdaDef, LambdaParam},
    store::{AberrantKind, Value, ValueTag},
    types::{Signature, TypeInfo, resolve_type_symbol},
};

/// `(fn (name₁ :type₁ …) :ret [body])` -- construct a closure over the
/// current scope, register a fresh lambda id, and return the ABERRANT
/// value carrying that id.
pub(crate) fn eval_fn(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("fn", args, 3)?;
    let (params, variadic) = parse_params(&args[0], ev).map_err(malformed)?;
    let return_type = parse_type(&args[1], ev).map_err(malformed)?;
    if args[2].tag() != ValueTag::BracketList {
        return Err(malformed("body must be a block".to_string()));
    }

    let def = LambdaDef {
        params,
        variadic,
        return_type: return_type.clone(),
        body: args[2].clone(),
        captured: Rc::clone(&ev.current),
    };
    let signature = Signature::new(
        def.params.iter().map(|p| p.type_info.clone()).collect(),
        return_type,
        variadic,
    );
    let id = ev.register_lambda(def, signature);
    Ok(Value::create_aberrant(AberrantKind::Lambda, id, ev.symbols()))
}

pub(crate) fn check_fn(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 3 {
        return Err(ck.error(call, "fn requires: parameters return-type body"));
    }
    if args[0].tag() != ValueTag::ParenList {
        return Err(ck.error(&args[0], "fn parameters must be a paren list"));
    }
    let pairs = ck.symbol_type_pairs(&args[0])?;
    let return_type = ck.resolve_type(&args[1])?;
    if args[2].tag() != ValueTag::BracketList {
        return Err(ck.error(&args[2], "fn body must be a block"));
    }

    let mut variadic = false;
    for (index, (_, type_info)) in pairs.iter().enumerate() {
        if type_info.is_variadic && index + 1 != pairs.len() {
            return Err(ck.error(&args[0], "only the final parameter may be variadic"));
        }
        variadic |= type_info.is_variadic;
    }

    ck.push_scope();
    for (name, type_info) in &pairs {
        // A variadic tail arrives packed as a brace list.
        let bound = if type_info.is_variadic {
            TypeInfo::of(ValueTag::BraceList)
        } else {
            type_info.clone()
        };
        ck.define(name, bound);
    }
    let body_type = ck.check_value(&args[2]);
    ck.pop_scope();
    let body_type = body_type?;

    if !return_type.compatible(&body_type) {
        return Err(ck.error_with_signatures(
            &args[2],
            "fn body does not produce the declared return type",
            Some(return_type.to_string()),
            Some(body_type.to_string()),
        ));
    }

    let id = ck.fresh_lambda_id();
    let signature = Signature::new(pairs.into_iter().map(|(_, t)| t).collect(), return_type, variadic);
    ck.register_signature(id, signature);
    Ok(TypeInfo::lambda(id))
}

/// `(apply lambda brace-list)` -- call the lambda with the items of
/// the brace list as arguments.
pub(crate) fn eval_apply(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("apply", args, 2)?;
    let target = ev.eval_value(&args[0])?;
    if target.aberrant_kind() != Ok(AberrantKind::Lambda) {
        return Err(ev.raise("apply expects a lambda"));
    }
    let packed = ev.eval_value(&args[1])?;
    if packed.tag() != ValueTag::BraceList {
        return Err(ev.raise("apply expects a brace list of arguments"));
    }
    let call_args: SmallVec<[Value; 4]> = packed.as_list()?.iter().collect();
    let id = target.aberrant_id()?;
    ev.call_lambda("apply", id, call_args)
}

pub(crate) fn check_apply(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "apply requires: lambda arguments"));
    }
    let target = ck.check_value(&args[0])?;
    if target.base != ValueTag::Aberrant && !target.is_any() {
        return Err(ck.error(&args[0], "apply target must be a lambda"));
    }
    let packed = ck.check_value(&args[1])?;
    if packed.base != ValueTag::BraceList && !packed.is_any() {
        return Err(ck.error(&args[1], "apply arguments must be a brace list"));
    }
    if target.lambda_id != 0 {
        if let Some(signature) = ck.signature_of(target.lambda_id) {
            // Element types are only known for brace literals; a brace
            // of unknown shape defers the argument check to runtime.
            if !packed.form_elements.is_empty() {
                if let Err(mismatch) = signature.accepts(&packed.form_elements) {
                    return Err(ck.error(&args[1], format!("apply: {mismatch}")));
                }
            }
            return Ok(signature.return_type.clone());
        }
    }
    Ok(TypeInfo::any())
}

fn malformed(detail: String) -> Flow {
    Flow::Fatal(EvalError::Malformed { head: "fn", detail })
}

/// Parses `(name :type …)` pairs at eval time.
fn parse_params(list: &Value, ev: &Evaluator) -> Result<(Vec<LambdaParam>, bool), String> {
    if list.tag() != ValueTag::ParenList {
        return Err("parameters must be a paren list".to_string());
    }
    let items = list.as_list().map_err(|e| e.to_string())?;
    if items.len() % 2 != 0 {
        return Err("parameters must be name/type pairs".to_string());
    }
    let mut params = Vec::new();
    let mut variadic = false;
    let pair_count = items.len() / 2;
    for pair in 0..pair_count {
        let name = items
            .get(pair * 2)
            .and_then(|v| v.symbol_text().ok())
            .ok_or_else(|| "parameter name must be a symbol".to_string())?;
        let type_info = parse_type(&items.get(pair * 2 + 1).expect("pair bound checked"), ev)?;
        if type_info.is_variadic {
            if pair + 1 != pair_count {
                return Err("only the final parameter may be variadic".to_string());
            }
            variadic = true;
        }
        params.push(LambdaParam { name: name.to_string(), type_info });
    }
    Ok((params, variadic))
}

fn parse_type(value: &Value, ev: &Evaluator) -> Result<TypeInfo, String> {
    let text = value
        .symbol_text()
        .map_err(|_| "expected a type symbol".to_string())?;
    resolve_type_symbol(&text, &ev.forms()).ok_or_else(|| format!("unknown type symbol '{text}'"))
}
