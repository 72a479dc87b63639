//! `load` and `import`: the two heads that reach outside the current
//! file. Both normally appear in datum position (`#(load …)`,
//! `#(import …)`).

use crate::{
    builtins::expect_arity,
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow},
    store::{Value, ValueTag},
    types::TypeInfo,
};

/// `(load "kernel")` -- resolve, declare, and link a native kernel.
/// Loading a linked kernel is a no-op.
pub(crate) fn eval_load(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("load", args, 1)?;
    let name_value = ev.eval_value(&args[0])?;
    let Ok(name) = name_value.as_string() else {
        return Err(Flow::Fatal(EvalError::Malformed { head: "load", detail: "kernel name must be a string".to_string() }));
    };
    ev.kernels()
        .load(&name)
        .map_err(|e| Flow::Fatal(EvalError::Kernel(e)))?;
    ev.adopt_kernel_forms()?;
    Ok(Value::create_none(ev.symbols()))
}

/// Checking a load runs phase one only: the manifest declarations
/// (signatures, forms) register with the compiler context, and the
/// dylib stays closed until evaluation.
pub(crate) fn check_load(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 1 {
        return Err(ck.error(call, "load requires a kernel name"));
    }
    if args[0].tag() == ValueTag::DqList {
        let name = args[0].as_string().map_err(|e| ck.error(&args[0], e.to_string()))?;
        ck.declare_kernel(call, &name)?;
    } else {
        let name_type = ck.check_value(&args[0])?;
        if !name_type.compatible(&TypeInfo::of(ValueTag::DqList)) {
            return Err(ck.error(&args[0], "load kernel name must be a string"));
        }
    }
    Ok(TypeInfo::any())
}

/// `(import prefix "path")` -- load another source file as a sibling
/// evaluator and expose its exports as `prefix/sym`.
pub(crate) fn eval_import(ev: &mut Evaluator, args: &[Value]) -> EvalResult {
    expect_arity("import", args, 2)?;
    let Ok(prefix) = args[0].symbol_text() else {
        return Err(Flow::Fatal(EvalError::Malformed { head: "import", detail: "prefix must be a symbol".to_string() }));
    };
    let path_value = ev.eval_value(&args[1])?;
    let Ok(path) = path_value.as_string() else {
        return Err(Flow::Fatal(EvalError::Malformed { head: "import", detail: "path must be a string".to_string() }));
    };
    ev.run_import(&prefix, &path)
}

pub(crate) fn check_import(ck: &mut Checker, call: &Value, args: &[Value]) -> Result<TypeInfo, CheckError> {
    if args.len() != 2 {
        return Err(ck.error(call, "import requires: prefix path"));
    }
    let Ok(prefix) = args[0].symbol_text() else {
        return Err(ck.error(&args[0], "import prefix must be a symbol"));
    };
    if args[1].tag() == ValueTag::DqList {
        let path = args[1].as_string().map_err(|e| ck.error(&args[1], e.to_string()))?;
        ck.check_import(call, &prefix, &path)?;
    } else {
        return Err(ck.error(&args[1], "import path must be a string literal"));
    }
    Ok(TypeInfo::any())
}
