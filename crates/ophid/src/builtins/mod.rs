//! Core head symbols.
//!
//! Every builtin is one record -- name, eval function, typecheck
//! function -- in a single map keyed by name; dispatch is one lookup.
//! Eval functions receive their arguments unevaluated: every core head
//! is a special form and controls evaluation of its own operands.

use std::sync::LazyLock;

use ahash::AHashMap;

use crate::{
    check::{CheckError, Checker},
    eval::{EvalError, EvalResult, Evaluator, Flow},
    store::Value,
    types::TypeInfo,
};

mod bind;
mod cast;
mod equality;
mod flow;
mod guard;
mod lambda;
mod meta;
mod modules;

pub(crate) type EvalFn = fn(&mut Evaluator, &[Value]) -> EvalResult;
pub(crate) type CheckFn = fn(&mut Checker, &Value, &[Value]) -> Result<TypeInfo, CheckError>;

/// One registered head symbol.
pub(crate) struct Builtin {
    pub name: &'static str,
    pub eval: EvalFn,
    pub typecheck: CheckFn,
}

pub(crate) struct BuiltinTable {
    map: AHashMap<&'static str, Builtin>,
}

impl BuiltinTable {
    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.map.get(name)
    }
}

/// The builtin registry.
pub(crate) fn table() -> &'static BuiltinTable {
    static TABLE: LazyLock<BuiltinTable> = LazyLock::new(|| {
        let builtins = [
            Builtin { name: "def", eval: bind::eval_def, typecheck: bind::check_def },
            Builtin { name: "export", eval: bind::eval_export, typecheck: bind::check_export },
            Builtin { name: "fn", eval: lambda::eval_fn, typecheck: lambda::check_fn },
            Builtin { name: "apply", eval: lambda::eval_apply, typecheck: lambda::check_apply },
            Builtin { name: "if", eval: flow::eval_if, typecheck: flow::check_if },
            Builtin { name: "match", eval: flow::eval_match, typecheck: flow::check_match },
            Builtin { name: "reflect", eval: flow::eval_reflect, typecheck: flow::check_reflect },
            Builtin { name: "do", eval: flow::eval_do, typecheck: flow::check_do },
            Builtin { name: "done", eval: flow::eval_done, typecheck: flow::check_done },
            Builtin { name: "try", eval: guard::eval_try, typecheck: guard::check_try },
            Builtin { name: "recover", eval: guard::eval_recover, typecheck: guard::check_recover },
            Builtin { name: "assert", eval: guard::eval_assert, typecheck: guard::check_assert },
            Builtin { name: "cast", eval: cast::eval_cast, typecheck: cast::check_cast },
            Builtin { name: "eq", eval: equality::eval_eq, typecheck: equality::check_eq },
            Builtin { name: "eval", eval: meta::eval_eval, typecheck: meta::check_eval },
            Builtin { name: "at", eval: meta::eval_at, typecheck: meta::check_at },
            Builtin { name: "load", eval: modules::eval_load, typecheck: modules::check_load },
            Builtin { name: "import", eval: modules::eval_import, typecheck: modules::check_import },
        ];
        let map = builtins.into_iter().map(|b| (b.name, b)).collect();
        BuiltinTable { map }
    });
    &TABLE
}

/// Exact-arity guard shared by the eval halves.
pub(crate) fn expect_arity(head: &'static str, args: &[Value], expected: usize) -> Result<(), Flow> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(Flow::Fatal(EvalError::Arity {
            callable: head.to_string(),
            detail: format!("expected {expected} arguments, received {}", args.len()),
        }))
    }
}
