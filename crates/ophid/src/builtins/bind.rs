//! `def` and `export`.

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow, runtime_type},
    scope::{Binding, Frame},
    store::{Value, ValueTag},
    types::TypeInfo,
};

/// `(def sym expr)` -- bind `sym` to the evaluated `expr` in the
/// current scope. Redefinition in the same scope is fatal.
pub(crate) fn eval_def(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("def", args, 2)?;
    let name = plain_symbol(&args[0]).ok_or_else(|| {
        Flow::Fatal(EvalError::Malformed { head: "def", detail: "first argument must be a symbol".to_string() })
    })?;
    let value = ev.eval_value(&args[1])?;
    let binding = Binding::new(runtime_type(&value), value.clone());
    if !Frame::define(&ev.current, &name, binding) {
        return Err(Flow::Fatal(EvalError::Redefinition(name)));
    }
    Ok(value)
}

pub(crate) fn check_def(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "def requires: name expression"));
    }
    let Some(name) = plain_symbol(&args[0]) else {
        return Err(ck.error(&args[0], "def name must be a symbol"));
    };
    let value_type = ck.check_value(&args[1])?;
    if !ck.define(&name, value_type.clone()) {
        return Err(ck.error(&args[0], format!("'{name}' is already defined in this scope")));
    }
    Ok(value_type)
}

/// `(export sym expr)` -- in an imported module only: publish a
/// binding to the host scope.
pub(crate) fn eval_export(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("export", args, 2)?;
    let name = plain_symbol(&args[0]).ok_or_else(|| {
        Flow::Fatal(EvalError::Malformed { head: "export", detail: "first argument must be a symbol".to_string() })
    })?;
    let value = ev.eval_value(&args[1])?;
    let binding = Binding::new(runtime_type(&value), value);
    let Some(exports) = ev.exports.as_mut() else {
        return Err(Flow::Fatal(EvalError::ExportOutsideModule));
    };
    exports.insert(name, binding);
    Ok(Value::create_none(ev.symbols()))
}

pub(crate) fn check_export(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "export requires: name expression"));
    }
    let Some(name) = plain_symbol(&args[0]) else {
        return Err(ck.error(&args[0], "export name must be a symbol"));
    };
    let value_type = ck.check_value(&args[1])?;
    ck.record_export(call, &name, value_type)?;
    Ok(TypeInfo::any())
}

/// Symbol text, rejecting `:type` ascriptions.
fn plain_symbol(value: &Value) -> Option<String> {
    if value.tag() != ValueTag::Symbol {
        return None;
    }
    let text = value.symbol_text().ok()?;
    if crate::types::is_type_symbol(&text) {
        return None;
    }
    Some(text.to_string())
}
