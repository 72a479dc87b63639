//! The evaluator: reduces values in a lexical scope stack.
//!
//! Strictly single-threaded within one session; equal inputs yield
//! equal outputs (there is no source of non-determinism inside).
//!
//! Errors are values: anything raised during evaluation travels as an
//! [`crate::store::ValueTag::Error`]-tagged value and is catchable by
//! `try`/`recover`. A small set of conditions is fatal instead --
//! `done` outside a loop, redefinition, arity mismatch, import
//! violations -- and surfaces as [`EvalError`] from the root entry
//! points.

use std::{
    cell::{Cell, RefCell},
    path::Path,
    rc::Rc,
    sync::Arc,
};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    abi::{self, KernelCallOutcome},
    builtins,
    imports::{ImportError, ImportState, ModuleExports},
    intern::SymbolTable,
    kernel::{KernelError, KernelManager},
    parse::{ParseError, parse},
    resolve::SourcePaths,
    scope::{Binding, Frame, ScopeRef},
    store::{AberrantKind, StoreError, Value, ValueTag},
    types::{FormRegistry, Signature, SignatureTable, TypeInfo, is_type_symbol},
};

/// Call-nesting bound; beyond it evaluation fails fatally instead of
/// overflowing the host stack.
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 512;

/// Fatal evaluation failure reported to the embedder.
#[derive(Debug, Clone)]
pub enum EvalError {
    /// `eval_source` input failed to parse.
    Parse(ParseError),
    /// An ERROR value reached the top of the evaluation stack.
    Unhandled(String),
    /// `done` evaluated outside any `do`.
    DoneOutsideLoop,
    /// Wrong number of arguments for a callable.
    Arity { callable: String, detail: String },
    /// Head of an instruction does not name anything callable.
    NotCallable(String),
    /// `def` of a name already bound in the current scope.
    Redefinition(String),
    /// Call nesting exceeded [`DEFAULT_MAX_CALL_DEPTH`].
    RecursionLimit(u32),
    /// `export` outside an imported module.
    ExportOutsideModule,
    /// `import` after the first non-import instruction.
    ImportAfterLock(String),
    Import(ImportError),
    Kernel(KernelError),
    /// A special form was applied to arguments of the wrong shape.
    Malformed { head: &'static str, detail: String },
    Store(StoreError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "{e}"),
            Self::Unhandled(rendered) => write!(f, "unhandled error: {rendered}"),
            Self::DoneOutsideLoop => write!(f, "done outside of a do loop"),
            Self::Arity { callable, detail } => write!(f, "arity mismatch calling '{callable}': {detail}"),
            Self::NotCallable(head) => write!(f, "'{head}' is not callable"),
            Self::Redefinition(name) => write!(f, "'{name}' is already defined in this scope"),
            Self::RecursionLimit(limit) => write!(f, "call depth exceeded {limit}"),
            Self::ExportOutsideModule => write!(f, "export is only valid inside an imported module"),
            Self::ImportAfterLock(path) => {
                write!(f, "import of '{path}' after the first non-import instruction")
            }
            Self::Import(e) => write!(f, "{e}"),
            Self::Kernel(e) => write!(f, "{e}"),
            Self::Malformed { head, detail } => write!(f, "malformed {head}: {detail}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ParseError> for EvalError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<StoreError> for EvalError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ImportError> for EvalError {
    fn from(e: ImportError) -> Self {
        Self::Import(e)
    }
}

impl From<KernelError> for EvalError {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

/// Non-local control flow inside the evaluator.
#[derive(Debug)]
pub(crate) enum Flow {
    /// A raised ERROR value; catchable by `try`/`recover`.
    Raise(Value),
    /// Unwinding to the innermost `do` with the loop result.
    Done(Value),
    /// Uncatchable failure.
    Fatal(EvalError),
}

impl Flow {
    /// Collapses any flow into an ERROR value (used at the C ABI
    /// boundary, where host errors must not unwind through kernels).
    pub fn into_error_value(self, symbols: &Arc<SymbolTable>) -> Value {
        match self {
            Self::Raise(v) => v,
            Self::Done(_) => error_value("done outside of a do loop", symbols),
            Self::Fatal(e) => error_value(&e.to_string(), symbols),
        }
    }
}

impl From<StoreError> for Flow {
    fn from(e: StoreError) -> Self {
        Self::Fatal(EvalError::Store(e))
    }
}

pub(crate) type EvalResult = Result<Value, Flow>;

/// Builds the standard raised-error payload: an ERROR list carrying
/// the message string.
pub(crate) fn error_value(message: &str, symbols: &Arc<SymbolTable>) -> Value {
    let items = [Value::create_string(message, symbols)];
    Value::create_error(&items, symbols).unwrap_or_else(|_| Value::create_none(symbols))
}

/// The runtime type of an evaluated value, for argument checks.
pub(crate) fn runtime_type(value: &Value) -> TypeInfo {
    match value.tag() {
        ValueTag::Aberrant => match value.aberrant_id() {
            Ok(id) if id != 0 => TypeInfo::lambda(id),
            _ => TypeInfo::of(ValueTag::Aberrant),
        },
        ValueTag::BraceList => match value.as_list() {
            Ok(list) => TypeInfo::brace(list.iter().map(|v| runtime_type(&v)).collect()),
            Err(_) => TypeInfo::of(ValueTag::BraceList),
        },
        tag => TypeInfo::of(tag),
    }
}

/// One `fn` closure: typed parameters, body, and the scope frame that
/// was on top at creation time.
#[derive(Debug)]
pub(crate) struct LambdaDef {
    pub params: Vec<LambdaParam>,
    pub variadic: bool,
    pub return_type: TypeInfo,
    pub body: Value,
    pub captured: ScopeRef,
}

#[derive(Debug, Clone)]
pub(crate) struct LambdaParam {
    pub name: String,
    pub type_info: TypeInfo,
}

/// State shared between a root evaluator and the sibling evaluators
/// its imports spawn: the symbol table, the kernel manager, and the
/// tables whose ids must stay valid across module boundaries.
pub(crate) struct SharedCtx {
    pub symbols: Arc<SymbolTable>,
    pub kernels: Arc<KernelManager>,
    pub paths: SourcePaths,
    pub lambdas: RefCell<AHashMap<u64, Rc<LambdaDef>>>,
    pub signatures: RefCell<SignatureTable>,
    pub forms: RefCell<FormRegistry>,
    pub next_lambda_id: Cell<u64>,
    pub imports: RefCell<ImportState>,
}

/// A single-session evaluator.
pub struct Evaluator {
    shared: Rc<SharedCtx>,
    pub(crate) current: ScopeRef,
    pub(crate) loop_depth: u32,
    call_depth: u32,
    /// Object storage backing `at`.
    pub(crate) storage: AHashMap<i64, Value>,
    /// Modules bound by this evaluator's imports, by prefix.
    pub(crate) imports_in_scope: AHashMap<String, Rc<ModuleExports>>,
    pub(crate) first_non_import_reached: bool,
    /// `Some` while this evaluator runs an imported module; collects
    /// `export` bindings.
    pub(crate) exports: Option<ModuleExports>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(SourcePaths::default())
    }
}

impl Evaluator {
    /// Evaluator with its own symbol table and kernel manager.
    #[must_use]
    pub fn new(paths: SourcePaths) -> Self {
        let kernels = Arc::new(KernelManager::new(paths.clone()));
        Self::with_kernels(SymbolTable::new(), kernels, paths)
    }

    /// Evaluator over an injected symbol table and kernel manager.
    #[must_use]
    pub fn with_kernels(symbols: Arc<SymbolTable>, kernels: Arc<KernelManager>, paths: SourcePaths) -> Self {
        let shared = Rc::new(SharedCtx {
            symbols,
            kernels,
            paths,
            lambdas: RefCell::new(AHashMap::new()),
            signatures: RefCell::new(SignatureTable::default()),
            forms: RefCell::new(FormRegistry::default()),
            next_lambda_id: Cell::new(0),
            imports: RefCell::new(ImportState::default()),
        });
        Self::over(shared)
    }

    fn over(shared: Rc<SharedCtx>) -> Self {
        Self {
            shared,
            current: Frame::root(),
            loop_depth: 0,
            call_depth: 0,
            storage: AHashMap::new(),
            imports_in_scope: AHashMap::new(),
            first_non_import_reached: false,
            exports: None,
        }
    }

    /// Sibling evaluator for an imported module: shares the tables,
    /// starts on a fresh scope chain, and collects exports.
    pub(crate) fn for_module(&self) -> Self {
        let mut module = Self::over(Rc::clone(&self.shared));
        module.exports = Some(ModuleExports::new());
        module
    }

    #[must_use]
    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.shared.symbols
    }

    #[must_use]
    pub fn kernels(&self) -> &Arc<KernelManager> {
        &self.shared.kernels
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.shared.paths.working_dir
    }

    /// Evaluates a value at the root of the stack.
    pub fn eval(&mut self, value: &Value) -> Result<Value, EvalError> {
        match self.eval_value(value) {
            Ok(v) => Ok(v),
            Err(Flow::Raise(v)) => Err(EvalError::Unhandled(v.to_string())),
            Err(Flow::Done(_)) => Err(EvalError::DoneOutsideLoop),
            Err(Flow::Fatal(e)) => Err(e),
        }
    }

    /// Parses and evaluates source text at the root of the stack.
    pub fn eval_source(&mut self, source: &str) -> Result<Value, EvalError> {
        let parsed = parse(source, self.symbols())?;
        self.eval(&parsed.value)
    }

    // --- core walk ------------------------------------------------------

    pub(crate) fn eval_value(&mut self, value: &Value) -> EvalResult {
        match value.tag() {
            ValueTag::None
            | ValueTag::Integer
            | ValueTag::Real
            | ValueTag::Rune
            | ValueTag::DqList
            | ValueTag::BraceList
            | ValueTag::Some
            | ValueTag::Error
            | ValueTag::Aberrant => Ok(value.clone()),
            ValueTag::Symbol => self.eval_symbol(value),
            ValueTag::ParenList => self.eval_paren(value),
            ValueTag::BracketList => self.eval_block(value),
            ValueTag::Datum => self.eval_datum(value),
        }
    }

    fn eval_symbol(&mut self, value: &Value) -> EvalResult {
        let text = value.symbol_text()?;
        if is_type_symbol(&text) {
            return Ok(value.clone());
        }
        if let Some(binding) = Frame::lookup(&self.current, &text) {
            return Ok(binding.value);
        }
        if let Some((prefix, name)) = text.split_once('/') {
            if let Some(module) = self.imports_in_scope.get(prefix) {
                if let Some(binding) = module.get(name) {
                    return Ok(binding.value.clone());
                }
            }
        }
        // Unbound symbols remain names.
        Ok(value.clone())
    }

    fn eval_block(&mut self, value: &Value) -> EvalResult {
        let list = value.as_list()?;
        let saved = Rc::clone(&self.current);
        self.current = Frame::child(&saved);
        let mut result = Ok(Value::create_none(self.symbols()));
        for item in list.iter() {
            match self.eval_value(&item) {
                Ok(v) => result = Ok(v),
                Err(flow) => {
                    result = Err(flow);
                    break;
                }
            }
        }
        self.current = saved;
        result
    }

    fn eval_paren(&mut self, value: &Value) -> EvalResult {
        let list = value.as_list()?;
        // Empty list head: `()` is the none value, not a call.
        if list.is_empty() {
            return Ok(Value::create_none(self.symbols()));
        }
        let head = list.get(0).expect("non-empty list");
        let Ok(name) = head.symbol_text() else {
            return Err(Flow::Fatal(EvalError::NotCallable(head.to_string())));
        };
        if name.as_ref() != "import" {
            self.first_non_import_reached = true;
        }

        let args: SmallVec<[Value; 4]> = (1..list.len()).filter_map(|i| list.get(i)).collect();

        if let Some(builtin) = builtins::table().get(&name) {
            return (builtin.eval)(self, &args);
        }

        if let Some(binding) = Frame::lookup(&self.current, &name) {
            return self.call_value(&name, &binding.value, &args);
        }

        if let Some((prefix, fname)) = name.split_once('/') {
            if let Some(module) = self.imports_in_scope.get(prefix) {
                let Some(binding) = module.get(fname) else {
                    return Err(Flow::Fatal(EvalError::NotCallable(name.to_string())));
                };
                let target = binding.value.clone();
                return self.call_value(&name, &target, &args);
            }
            return self.call_kernel(prefix, fname, &args);
        }

        Err(Flow::Fatal(EvalError::NotCallable(name.to_string())))
    }

    fn eval_datum(&mut self, value: &Value) -> EvalResult {
        let inner = value.unwrap_inner()?;
        if inner.tag() == ValueTag::ParenList {
            let list = inner.as_list()?;
            if let Some(head) = list.get(0) {
                if let Ok(name) = head.symbol_text() {
                    let callable = builtins::table().get(&name).is_some()
                        || name.contains('/')
                        || Frame::lookup(&self.current, &name)
                            .is_some_and(|b| b.value.aberrant_kind() == Ok(AberrantKind::Lambda));
                    if callable {
                        return self.eval_value(&inner);
                    }
                }
            }
        }
        // Anything else stays inert data.
        Ok(value.clone())
    }

    // --- calls ----------------------------------------------------------

    /// Calls a scope- or module-bound value: must be a lambda.
    fn call_value(&mut self, name: &str, target: &Value, raw_args: &[Value]) -> EvalResult {
        if target.aberrant_kind() != Ok(AberrantKind::Lambda) {
            return Err(Flow::Fatal(EvalError::NotCallable(name.to_string())));
        }
        let id = target.aberrant_id()?;
        let mut args = SmallVec::with_capacity(raw_args.len());
        for raw in raw_args {
            args.push(self.eval_value(raw)?);
        }
        self.call_lambda(name, id, args)
    }

    /// Invokes a lambda with already-evaluated arguments.
    pub(crate) fn call_lambda(&mut self, name: &str, id: u64, args: SmallVec<[Value; 4]>) -> EvalResult {
        let Some(def) = self.shared.lambdas.borrow().get(&id).cloned() else {
            return Err(Flow::Fatal(EvalError::NotCallable(name.to_string())));
        };

        let fixed = def.params.len() - usize::from(def.variadic);
        let arity_ok = if def.variadic { args.len() >= fixed } else { args.len() == fixed };
        if !arity_ok {
            return Err(Flow::Fatal(EvalError::Arity {
                callable: name.to_string(),
                detail: format!(
                    "expected {}{} arguments, received {}",
                    if def.variadic { "at least " } else { "" },
                    fixed,
                    args.len()
                ),
            }));
        }
        for (index, arg) in args.iter().take(fixed).enumerate() {
            let expected = &def.params[index].type_info;
            let received = runtime_type(arg);
            if !expected.compatible(&received) {
                return Err(self.raise(format!(
                    "calling '{name}': argument {index} expected {expected}, received {received}"
                )));
            }
        }
        if def.variadic {
            let tail_type = &def.params[fixed].type_info;
            for (index, arg) in args.iter().enumerate().skip(fixed) {
                let received = runtime_type(arg);
                if !tail_type.compatible(&received) {
                    return Err(self.raise(format!(
                        "calling '{name}': argument {index} expected {tail_type}, received {received}"
                    )));
                }
            }
        }

        if self.call_depth >= DEFAULT_MAX_CALL_DEPTH {
            return Err(Flow::Fatal(EvalError::RecursionLimit(DEFAULT_MAX_CALL_DEPTH)));
        }
        self.call_depth += 1;

        let frame = Frame::child(&def.captured);
        for (index, param) in def.params.iter().take(fixed).enumerate() {
            Frame::define(
                &frame,
                &param.name,
                Binding::new(param.type_info.clone(), args[index].clone()),
            );
        }
        if def.variadic {
            let rest: Vec<Value> = args[fixed..].to_vec();
            let packed = Value::create_brace_list(&rest, self.symbols()).map_err(Flow::from)?;
            let param = &def.params[fixed];
            Frame::define(&frame, &param.name, Binding::new(param.type_info.clone(), packed));
        }

        let saved = std::mem::replace(&mut self.current, frame);
        let result = self.eval_value(&def.body);
        self.current = saved;
        self.call_depth -= 1;
        result
    }

    /// Calls a linked kernel function, evaluating arguments first.
    fn call_kernel(&mut self, kernel: &str, function: &str, raw_args: &[Value]) -> EvalResult {
        let qualified = format!("{kernel}/{function}");
        let kernels = Arc::clone(&self.shared.kernels);
        let f = kernels
            .registered_fn(kernel, function)
            .map_err(|e| Flow::Fatal(EvalError::Kernel(e)))?;

        let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(raw_args.len());
        for raw in raw_args {
            args.push(self.eval_value(raw)?);
        }
        if let Some(signature) = kernels.signature(kernel, function) {
            let arg_types: Vec<TypeInfo> = args.iter().map(runtime_type).collect();
            if let Err(mismatch) = signature.accepts(&arg_types) {
                return Err(self.raise(format!("calling '{qualified}': {mismatch}")));
            }
        }

        match abi::invoke(self, f, &args) {
            KernelCallOutcome::Value(v) => Ok(v),
            KernelCallOutcome::ErrorValue(v) => Err(Flow::Raise(v)),
        }
    }

    // --- helpers for builtins -------------------------------------------

    /// A raised error value carrying `message`.
    pub(crate) fn raise(&self, message: impl Into<String>) -> Flow {
        Flow::Raise(error_value(&message.into(), self.symbols()))
    }

    /// Registers a lambda definition and signature under a fresh id.
    pub(crate) fn register_lambda(&mut self, def: LambdaDef, signature: Signature) -> u64 {
        let id = self.shared.next_lambda_id.get() + 1;
        self.shared.next_lambda_id.set(id);
        self.shared.lambdas.borrow_mut().insert(id, Rc::new(def));
        self.shared.signatures.borrow_mut().register(id, signature);
        id
    }

    /// The registered forms (kernel-declared) visible to this context.
    pub(crate) fn forms(&self) -> std::cell::Ref<'_, FormRegistry> {
        self.shared.forms.borrow()
    }

    /// Merges kernel-declared forms into the context registry.
    pub(crate) fn adopt_kernel_forms(&mut self) -> Result<(), Flow> {
        let declared = self.shared.kernels.declared_forms();
        let mut forms = self.shared.forms.borrow_mut();
        for (name, elements) in declared {
            forms
                .register(&name, elements)
                .map_err(|e| self.raise(e.to_string()))?;
        }
        Ok(())
    }

    /// Runs `#(import prefix "path")`.
    pub(crate) fn run_import(&mut self, prefix: &str, path: &str) -> EvalResult {
        if self.first_non_import_reached {
            return Err(Flow::Fatal(EvalError::ImportAfterLock(path.to_string())));
        }
        let resolved = self
            .shared
            .paths
            .resolve_file(path)
            .ok_or_else(|| Flow::Fatal(ImportError::NotFound(path.to_string()).into()))?;
        let canonical = std::fs::canonicalize(&resolved).unwrap_or(resolved);

        if let Some(cached) = self.shared.imports.borrow().cached(&canonical) {
            self.imports_in_scope.insert(prefix.to_string(), cached);
            return Ok(Value::create_none(self.symbols()));
        }
        if !self.shared.imports.borrow_mut().begin(&canonical) {
            return Err(Flow::Fatal(ImportError::Cycle(path.to_string()).into()));
        }

        let outcome = self.run_module_file(path, &canonical);
        self.shared.imports.borrow_mut().finish(&canonical);

        let exports = outcome?;
        self.shared.imports.borrow_mut().store(&canonical, Rc::clone(&exports));
        self.imports_in_scope.insert(prefix.to_string(), exports);
        Ok(Value::create_none(self.symbols()))
    }

    fn run_module_file(&mut self, path: &str, canonical: &Path) -> Result<Rc<ModuleExports>, Flow> {
        let text = std::fs::read_to_string(canonical)
            .map_err(|e| Flow::Fatal(ImportError::Unreadable(path.to_string(), e.to_string()).into()))?;
        let parsed = parse(&text, self.symbols())
            .map_err(|e| Flow::Fatal(ImportError::Load(path.to_string(), e.to_string()).into()))?;

        let mut module = self.for_module();
        match module.eval_value(&parsed.value) {
            Ok(_) => Ok(Rc::new(module.exports.take().expect("module evaluator has exports"))),
            Err(flow) => {
                let detail = flow.into_error_value(self.symbols()).to_string();
                Err(Flow::Fatal(ImportError::Load(path.to_string(), detail).into()))
            }
        }
    }
}
