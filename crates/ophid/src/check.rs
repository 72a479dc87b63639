//! The static type-and-form checker.
//!
//! A recursive walk that computes a [`TypeInfo`] per node and
//! side-effects the compiler context: user forms, lambda signatures,
//! and kernel declarations register as they are encountered. Builtins
//! supply their own typecheck callbacks (the same registry the
//! evaluator dispatches through), so special forms check their own
//! shapes.
//!
//! The first incompatibility wins: checking stops at it and the error
//! carries a message, the source position, and -- when available --
//! the expected and received signatures. There is no inference or
//! unification across branches beyond equality.

use std::{collections::HashSet, fmt, path::PathBuf, sync::Arc};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    builtins,
    intern::SymbolTable,
    kernel::KernelManager,
    parse::{Parsed, Spans, line_col, parse},
    resolve::SourcePaths,
    store::{Value, ValueTag},
    types::{FormRegistry, Signature, SignatureTable, TypeInfo, is_type_symbol, resolve_type_symbol},
};

/// A type error with source position and, when available, the
/// expected-vs-received signatures.
#[derive(Debug, Clone)]
pub struct CheckError {
    pub message: String,
    /// Byte offset in the checked source, when the node has a span.
    pub offset: Option<usize>,
    /// 1-based line; 0 when the position is unknown.
    pub line: u32,
    /// 1-based column; 0 when the position is unknown.
    pub column: u32,
    pub expected: Option<String>,
    pub received: Option<String>,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "type error at {}:{}: {}", self.line, self.column, self.message)?;
        } else {
            write!(f, "type error: {}", self.message)?;
        }
        if let (Some(expected), Some(received)) = (&self.expected, &self.received) {
            write!(f, " (expected {expected}, received {received})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CheckError {}

/// Source context for position rendering; swapped while an imported
/// file is being checked.
#[derive(Debug, Default, Clone)]
struct SourceCtx {
    text: String,
    spans: Spans,
}

/// The checker context.
pub struct Checker {
    symbols: Arc<SymbolTable>,
    kernels: Arc<KernelManager>,
    paths: SourcePaths,
    scopes: Vec<AHashMap<String, TypeInfo>>,
    forms: FormRegistry,
    signatures: SignatureTable,
    next_lambda_id: u64,
    pub(crate) loop_depth: u32,
    /// Files currently being checked, for import cycle detection.
    checking: HashSet<PathBuf>,
    /// Export types of fully checked imports, by canonical path.
    import_cache: AHashMap<PathBuf, IndexMap<String, TypeInfo>>,
    /// Prefix bindings visible to the file being checked.
    import_types: AHashMap<String, IndexMap<String, TypeInfo>>,
    /// `Some` while a module file is being checked; collects exports.
    export_types: Option<IndexMap<String, TypeInfo>>,
    src: SourceCtx,
}

impl Checker {
    #[must_use]
    pub fn new(symbols: Arc<SymbolTable>, kernels: Arc<KernelManager>, paths: SourcePaths) -> Self {
        Self {
            symbols,
            kernels,
            paths,
            scopes: vec![AHashMap::new()],
            forms: FormRegistry::default(),
            signatures: SignatureTable::default(),
            next_lambda_id: 0,
            loop_depth: 0,
            checking: HashSet::new(),
            import_cache: AHashMap::new(),
            import_types: AHashMap::new(),
            export_types: None,
            src: SourceCtx::default(),
        }
    }

    /// Checks a parse result against its source text.
    pub fn check(&mut self, parsed: &Parsed, source: &str) -> Result<TypeInfo, CheckError> {
        self.src = SourceCtx { text: source.to_string(), spans: parsed.spans.clone() };
        self.check_value(&parsed.value)
    }

    // --- errors ---------------------------------------------------------

    pub(crate) fn error(&self, node: &Value, message: impl Into<String>) -> CheckError {
        self.error_with_signatures(node, message, None, None)
    }

    pub(crate) fn error_with_signatures(
        &self,
        node: &Value,
        message: impl Into<String>,
        expected: Option<String>,
        received: Option<String>,
    ) -> CheckError {
        let offset = self.src.spans.get(node.get_root_offset());
        let (line, column) = offset.map_or((0, 0), |at| line_col(&self.src.text, at));
        CheckError { message: message.into(), offset, line, column, expected, received }
    }

    // --- scopes ---------------------------------------------------------

    pub(crate) fn push_scope(&mut self) {
        self.scopes.push(AHashMap::new());
    }

    pub(crate) fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Defines in the innermost scope; `false` when already bound
    /// there.
    pub(crate) fn define(&mut self, name: &str, type_info: TypeInfo) -> bool {
        let scope = self.scopes.last_mut().expect("at least the root scope");
        if scope.contains_key(name) {
            return false;
        }
        scope.insert(name.to_string(), type_info);
        true
    }

    fn lookup(&self, name: &str) -> Option<TypeInfo> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).cloned())
    }

    // --- registration ---------------------------------------------------

    pub(crate) fn fresh_lambda_id(&mut self) -> u64 {
        self.next_lambda_id += 1;
        self.next_lambda_id
    }

    pub(crate) fn register_signature(&mut self, id: u64, signature: Signature) {
        self.signatures.register(id, signature);
    }

    pub(crate) fn signature_of(&self, id: u64) -> Option<Signature> {
        self.signatures.get(id).cloned()
    }

    /// Resolves a `:name` node against base types and registered
    /// forms. Unknown type symbols are fatal.
    pub(crate) fn resolve_type(&mut self, node: &Value) -> Result<TypeInfo, CheckError> {
        let Ok(text) = node.symbol_text() else {
            return Err(self.error(node, "expected a type symbol"));
        };
        resolve_type_symbol(&text, &self.forms)
            .ok_or_else(|| self.error(node, format!("unknown type symbol '{text}'")))
    }

    /// Parses `(name :type …)` pairs, as in `fn` parameter lists.
    pub(crate) fn symbol_type_pairs(&mut self, list: &Value) -> Result<Vec<(String, TypeInfo)>, CheckError> {
        let items = list.as_list().map_err(|e| self.error(list, e.to_string()))?;
        if items.len() % 2 != 0 {
            return Err(self.error(list, "parameters must be name/type pairs"));
        }
        let mut pairs = Vec::new();
        for pair in 0..items.len() / 2 {
            let name_node = items.get(pair * 2).expect("pair bound checked");
            let Ok(name) = name_node.symbol_text() else {
                return Err(self.error(&name_node, "parameter name must be a symbol"));
            };
            if is_type_symbol(&name) {
                return Err(self.error(&name_node, "parameter name must be a plain symbol"));
            }
            let type_info = self.resolve_type(&items.get(pair * 2 + 1).expect("pair bound checked"))?;
            pairs.push((name.to_string(), type_info));
        }
        Ok(pairs)
    }

    /// Records an `export` binding; only valid inside an imported
    /// module.
    pub(crate) fn record_export(&mut self, node: &Value, name: &str, type_info: TypeInfo) -> Result<(), CheckError> {
        match self.export_types.as_mut() {
            Some(exports) => {
                exports.insert(name.to_string(), type_info);
                Ok(())
            }
            None => Err(self.error(node, "export is only valid inside an imported module")),
        }
    }

    /// Phase one of a kernel load: declarations only, dylib untouched.
    pub(crate) fn declare_kernel(&mut self, node: &Value, name: &str) -> Result<(), CheckError> {
        self.kernels
            .declare(name)
            .map_err(|e| self.error(node, e.to_string()))?;
        for (form_name, elements) in self.kernels.declared_forms() {
            self.forms
                .register(&form_name, elements)
                .map_err(|e| self.error(node, e.to_string()))?;
        }
        Ok(())
    }

    /// Checks an imported file in a child context and exposes its
    /// export types under `prefix`.
    pub(crate) fn check_import(&mut self, node: &Value, prefix: &str, path: &str) -> Result<(), CheckError> {
        let resolved = self
            .paths
            .resolve_file(path)
            .ok_or_else(|| self.error(node, format!("failed to import '{path}': not found")))?;
        let canonical = std::fs::canonicalize(&resolved).unwrap_or(resolved);

        if let Some(exports) = self.import_cache.get(&canonical) {
            self.import_types.insert(prefix.to_string(), exports.clone());
            return Ok(());
        }
        if !self.checking.insert(canonical.clone()) {
            return Err(self.error(node, format!("failed to import '{path}': import cycle")));
        }

        let outcome = self.check_module_file(&canonical);
        self.checking.remove(&canonical);
        let exports = outcome.map_err(|e| self.error(node, format!("failed to import '{path}': {e}")))?;

        self.import_cache.insert(canonical, exports.clone());
        self.import_types.insert(prefix.to_string(), exports);
        Ok(())
    }

    fn check_module_file(&mut self, canonical: &std::path::Path) -> Result<IndexMap<String, TypeInfo>, CheckError> {
        let text = std::fs::read_to_string(canonical).map_err(|e| CheckError {
            message: e.to_string(),
            offset: None,
            line: 0,
            column: 0,
            expected: None,
            received: None,
        })?;
        let parsed = parse(&text, &self.symbols).map_err(|e| CheckError {
            message: e.to_string(),
            offset: Some(e.offset),
            line: e.line,
            column: e.column,
            expected: None,
            received: None,
        })?;

        // The module checks in a fresh file context on the same
        // shared tables (forms, signatures, kernel declarations).
        let saved_scopes = std::mem::replace(&mut self.scopes, vec![AHashMap::new()]);
        let saved_exports = self.export_types.replace(IndexMap::new());
        let saved_imports = std::mem::take(&mut self.import_types);
        let saved_src = std::mem::replace(&mut self.src, SourceCtx { text, spans: parsed.spans.clone() });
        let saved_loop = std::mem::replace(&mut self.loop_depth, 0);

        let result = self.check_value(&parsed.value);

        self.scopes = saved_scopes;
        let exports = std::mem::replace(&mut self.export_types, saved_exports).unwrap_or_default();
        self.import_types = saved_imports;
        self.src = saved_src;
        self.loop_depth = saved_loop;

        result?;
        Ok(exports)
    }

    // --- the walk -------------------------------------------------------

    pub(crate) fn check_value(&mut self, value: &Value) -> Result<TypeInfo, CheckError> {
        match value.tag() {
            ValueTag::None => Ok(TypeInfo::any()),
            ValueTag::Integer => Ok(TypeInfo::of(ValueTag::Integer)),
            ValueTag::Real => Ok(TypeInfo::of(ValueTag::Real)),
            ValueTag::Rune => Ok(TypeInfo::of(ValueTag::Rune)),
            ValueTag::DqList => Ok(TypeInfo::of(ValueTag::DqList)),
            ValueTag::Error => Ok(TypeInfo::of(ValueTag::Error)),
            ValueTag::Some => Ok(TypeInfo::of(ValueTag::Some)),
            ValueTag::Aberrant => {
                let id = value.aberrant_id().map_err(|e| self.error(value, e.to_string()))?;
                Ok(if id != 0 { TypeInfo::lambda(id) } else { TypeInfo::of(ValueTag::Aberrant) })
            }
            ValueTag::Symbol => self.check_symbol(value),
            ValueTag::BraceList => self.check_brace(value),
            ValueTag::BracketList => self.check_block(value),
            ValueTag::ParenList => self.check_instruction(value),
            ValueTag::Datum => self.check_datum(value),
        }
    }

    fn check_symbol(&mut self, value: &Value) -> Result<TypeInfo, CheckError> {
        let text = value.symbol_text().map_err(|e| self.error(value, e.to_string()))?;
        if is_type_symbol(&text) {
            // Validate the ascription even though the expression
            // itself stays a symbol.
            self.resolve_type(value)?;
            return Ok(TypeInfo::of(ValueTag::Symbol));
        }
        if let Some(found) = self.lookup(&text) {
            return Ok(found);
        }
        if let Some((prefix, name)) = text.split_once('/') {
            if let Some(exports) = self.import_types.get(prefix) {
                if let Some(found) = exports.get(name) {
                    return Ok(found.clone());
                }
            }
        }
        // Unbound symbols remain names.
        Ok(TypeInfo::of(ValueTag::Symbol))
    }

    fn check_brace(&mut self, value: &Value) -> Result<TypeInfo, CheckError> {
        // Brace lists are passthrough data: elements are typed by
        // shape, never treated as instructions.
        let list = value.as_list().map_err(|e| self.error(value, e.to_string()))?;
        let elements = list.iter().map(|item| crate::eval::runtime_type(&item)).collect();
        Ok(TypeInfo::brace(elements))
    }

    fn check_block(&mut self, value: &Value) -> Result<TypeInfo, CheckError> {
        let list = value.as_list().map_err(|e| self.error(value, e.to_string()))?;
        let items: Vec<Value> = list.iter().collect();
        self.push_scope();
        let mut last = TypeInfo::any();
        for item in &items {
            match self.check_value(item) {
                Ok(found) => last = found,
                Err(e) => {
                    self.pop_scope();
                    return Err(e);
                }
            }
        }
        self.pop_scope();
        Ok(last)
    }

    fn check_instruction(&mut self, value: &Value) -> Result<TypeInfo, CheckError> {
        let list = value.as_list().map_err(|e| self.error(value, e.to_string()))?;
        // `()` is the none value, not a call.
        if list.is_empty() {
            return Ok(TypeInfo::any());
        }
        let head = list.get(0).expect("non-empty");
        let Ok(name) = head.symbol_text() else {
            return Err(self.error(&head, "instruction head must be a symbol"));
        };
        let args: Vec<Value> = (1..list.len()).filter_map(|i| list.get(i)).collect();

        if let Some(builtin) = builtins::table().get(&name) {
            return (builtin.typecheck)(self, value, &args);
        }

        if let Some(local) = self.lookup(&name) {
            return self.check_call_against(value, &name, &local, &args);
        }

        if let Some((prefix, fname)) = name.split_once('/') {
            if let Some(exports) = self.import_types.get(prefix) {
                let Some(exported) = exports.get(fname).cloned() else {
                    return Err(self.error(&head, format!("'{name}' is not exported")));
                };
                return self.check_call_against(value, &name, &exported, &args);
            }
            if self.kernels.is_declared(prefix) {
                let Some(signature) = self.kernels.signature(prefix, fname) else {
                    return Err(self.error(&head, format!("kernel '{prefix}' has no function '{fname}'")));
                };
                return self.check_args_against(value, &name, &signature, &args);
            }
        }

        Err(self.error(value, format!("unknown callable '{name}'")))
    }

    fn check_call_against(
        &mut self,
        call: &Value,
        name: &str,
        callee: &TypeInfo,
        args: &[Value],
    ) -> Result<TypeInfo, CheckError> {
        if callee.is_any() {
            for arg in args {
                self.check_value(arg)?;
            }
            return Ok(TypeInfo::any());
        }
        if callee.base != ValueTag::Aberrant {
            return Err(self.error(call, format!("'{name}' is not callable")));
        }
        if callee.lambda_id == 0 {
            for arg in args {
                self.check_value(arg)?;
            }
            return Ok(TypeInfo::any());
        }
        let Some(signature) = self.signature_of(callee.lambda_id) else {
            return Err(self.error(call, format!("'{name}' has no registered signature")));
        };
        self.check_args_against(call, name, &signature, args)
    }

    fn check_args_against(
        &mut self,
        call: &Value,
        name: &str,
        signature: &Signature,
        args: &[Value],
    ) -> Result<TypeInfo, CheckError> {
        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args {
            arg_types.push(self.check_value(arg)?);
        }
        if let Err(mismatch) = signature.accepts(&arg_types) {
            let received = arg_types.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
            return Err(self.error_with_signatures(
                call,
                format!("calling '{name}': {mismatch}"),
                Some(signature.to_string()),
                Some(format!("({received})")),
            ));
        }
        Ok(signature.return_type.clone())
    }

    fn check_datum(&mut self, value: &Value) -> Result<TypeInfo, CheckError> {
        let inner = value.unwrap_inner().map_err(|e| self.error(value, e.to_string()))?;
        if inner.tag() == ValueTag::ParenList {
            let list = inner.as_list().map_err(|e| self.error(&inner, e.to_string()))?;
            if let Some(head) = list.get(0) {
                if let Ok(name) = head.symbol_text() {
                    if let Some(builtin) = builtins::table().get(&name) {
                        let args: Vec<Value> = (1..list.len()).filter_map(|i| list.get(i)).collect();
                        return (builtin.typecheck)(self, &inner, &args);
                    }
                }
            }
        }
        Ok(TypeInfo::of(ValueTag::Datum))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn checker() -> Checker {
        let paths = SourcePaths::default();
        let symbols = SymbolTable::new();
        let kernels = Arc::new(KernelManager::new(paths.clone()));
        Checker::new(symbols, kernels, paths)
    }

    fn check_src(src: &str) -> Result<TypeInfo, CheckError> {
        let mut ck = checker();
        let parsed = parse(src, &SymbolTable::new()).unwrap();
        ck.check(&parsed, src)
    }

    #[test]
    fn literals_type_as_their_tags() {
        assert_eq!(check_src("42").unwrap().base, ValueTag::Integer);
        assert_eq!(check_src("4.5").unwrap().base, ValueTag::Real);
        assert_eq!(check_src("\"s\"").unwrap().base, ValueTag::DqList);
        assert_eq!(check_src("'3").unwrap().base, ValueTag::Some);
        assert!(check_src("()").unwrap().is_any());
    }

    #[test]
    fn unbound_symbols_stay_symbols() {
        assert_eq!(check_src("mystery").unwrap().base, ValueTag::Symbol);
    }

    #[test]
    fn unknown_type_symbols_are_fatal() {
        let err = check_src(":mystery").unwrap_err();
        assert!(err.message.contains("unknown type symbol"));
    }

    #[test]
    fn def_registers_and_blocks_redefinition() {
        assert_eq!(check_src("[ (def x 1) x ]").unwrap().base, ValueTag::Integer);
        let err = check_src("[ (def x 1) (def x 2) ]").unwrap_err();
        assert!(err.message.contains("already defined"));
    }

    #[test]
    fn block_scope_does_not_leak() {
        // x is defined in the inner block only; outside it is a bare
        // symbol again.
        assert_eq!(check_src("[ [ (def x 1) ] x ]").unwrap().base, ValueTag::Symbol);
    }

    #[test]
    fn lambda_signatures_check_call_sites() {
        let ok = check_src("[ (def f (fn (a :int b :int) :int [ a ])) (f 1 2) ]").unwrap();
        assert_eq!(ok.base, ValueTag::Integer);

        let arity = check_src("[ (def f (fn (a :int) :int [ a ])) (f 1 2) ]").unwrap_err();
        assert!(arity.message.contains("expected 1 arguments"));

        let types = check_src("[ (def f (fn (a :int) :int [ a ])) (f \"no\") ]").unwrap_err();
        assert!(types.message.contains("argument 0"));
        assert_eq!(types.expected.as_deref(), Some("(:int) -> :int"));
    }

    #[test]
    fn fn_body_must_match_return_type() {
        let err = check_src("(fn (a :int) :str [ a ])").unwrap_err();
        assert!(err.message.contains("declared return type"));
        assert_eq!(err.expected.as_deref(), Some(":str"));
        assert_eq!(err.received.as_deref(), Some(":int"));
    }

    #[test]
    fn variadic_parameters_are_uniformly_typed() {
        let ok = check_src("[ (def f (fn (xs :int..) :int [ 0 ])) (f) (f 1 2 3) ]").unwrap();
        assert_eq!(ok.base, ValueTag::Integer);
        let err = check_src("[ (def f (fn (xs :int..) :int [ 0 ])) (f 1 \"no\") ]").unwrap_err();
        assert!(err.message.contains("argument 1"));
    }

    #[test]
    fn unknown_callables_are_fatal() {
        let err = check_src("(mystery 1 2)").unwrap_err();
        assert!(err.message.contains("unknown callable"));
    }

    #[test]
    fn if_condition_must_be_integer() {
        assert!(check_src("(if 1 2 3)").is_ok());
        let err = check_src("(if \"s\" 2 3)").unwrap_err();
        assert!(err.message.contains("condition"));
        let err = check_src("(if 1 2 \"s\")").unwrap_err();
        assert!(err.message.contains("branches"));
    }

    #[test]
    fn done_outside_do_fails_the_check() {
        let err = check_src("(done 1)").unwrap_err();
        assert!(err.message.contains("outside"));
        assert!(check_src("(do [ (done 1) ])").is_ok());
    }

    #[test]
    fn datum_without_callable_head_is_datum() {
        assert_eq!(check_src("#(1 2 3)").unwrap().base, ValueTag::Datum);
    }

    #[test]
    fn errors_carry_positions() {
        let err = check_src("[\n  (def x 1)\n  (mystery)\n]").unwrap_err();
        assert_eq!(err.line, 3);
        assert_eq!(err.column, 3);
    }

    #[test]
    fn brace_literals_carry_element_types() {
        let found = check_src("{1 \"a\"}").unwrap();
        assert_eq!(found.base, ValueTag::BraceList);
        assert_eq!(found.form_elements.len(), 2);
        assert_eq!(found.form_elements[0].base, ValueTag::Integer);
    }
}
