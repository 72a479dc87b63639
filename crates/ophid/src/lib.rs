#![doc = include_str!("../../../README.md")]

mod abi;
mod builtins;
mod check;
mod eval;
mod imports;
mod intern;
mod kernel;
mod parse;
mod resolve;
mod scope;
mod store;
mod types;

pub use crate::{
    abi::{AbiTable, KernelFn, KernelInitFn, KernelShutdownFn, SxValue, abi_table},
    check::{CheckError, Checker},
    eval::{DEFAULT_MAX_CALL_DEPTH, EvalError, Evaluator},
    imports::ImportError,
    intern::{SymbolId, SymbolTable},
    kernel::{KernelError, KernelManager, KernelState},
    parse::{ParseError, Parsed, Spans, line_col, parse},
    resolve::{KERNEL_MANIFEST, SourcePaths},
    store::{AberrantKind, ListView, Store, StoreBuilder, StoreError, UNIT_SIZE, Value, ValueTag},
    types::{
        FormError, FormRegistry, Signature, SignatureMismatch, SignatureTable, TypeInfo, TypeName, is_type_symbol,
        resolve_type_symbol,
    },
};
