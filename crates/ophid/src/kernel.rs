//! Two-phase loading of native kernel extensions.
//!
//! Phase one runs the kernel's `kernel.sxs` manifest under a
//! restricted meta-interpreter whose only callables are
//! `define-kernel`, `define-function`, and `define-form`; the effect
//! is purely declarative (dylib filename, exported function
//! signatures, forms). Phase two opens the shared object, resolves
//! `kernel_init` (required) and `kernel_shutdown` (optional), and
//! invokes `kernel_init` with the ABI table. The kernel must register
//! exactly the declared functions; any declared-vs-registered mismatch
//! is fatal and the dylib is closed again.
//!
//! Descriptor state machine:
//! `Unresolved -> Resolved -> Declared -> Linked -> Shutdown -> Closed`.
//!
//! The manager is process-scoped in spirit but dependency-injected in
//! practice: one `Arc<KernelManager>` shared by the evaluators that
//! need it, all mutation behind one mutex.

use std::{fmt, fs, path::PathBuf};

use ahash::AHashMap;
use indexmap::IndexMap;
use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    abi::{KernelFn, KernelInitFn, KernelShutdownFn, RegisteredFn, RegistrationSink, abi_table},
    intern::SymbolTable,
    parse::parse,
    resolve::{KERNEL_MANIFEST, SourcePaths},
    store::{Value, ValueTag},
    types::{FormRegistry, Signature, TypeInfo, resolve_type_symbol},
};

/// Lifecycle of one kernel descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Unresolved,
    Resolved,
    Declared,
    Linked,
    Shutdown,
    Closed,
}

/// Failure from the kernel manager APIs.
#[derive(Debug, Clone)]
pub enum KernelError {
    /// No kernel directory with a manifest was found for the name.
    NotFound(String),
    /// The manifest failed to parse or is not a valid declaration set.
    Manifest { kernel: String, detail: String },
    /// The shared object could not be opened.
    Open { kernel: String, detail: String },
    /// The dylib does not export `kernel_init`.
    MissingInit(String),
    /// `kernel_init` returned a non-zero code.
    InitFailed { kernel: String, code: i32 },
    /// Declared and registered function sets disagree.
    Mismatch {
        kernel: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    /// A call referenced a function the kernel never declared.
    UnknownFunction { kernel: String, function: String },
    /// The kernel is not linked (declared only, or already shut down).
    NotLinked(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "kernel '{name}' not found (no {KERNEL_MANIFEST})"),
            Self::Manifest { kernel, detail } => write!(f, "kernel '{kernel}' manifest: {detail}"),
            Self::Open { kernel, detail } => write!(f, "kernel '{kernel}' dylib: {detail}"),
            Self::MissingInit(name) => write!(f, "kernel '{name}' dylib has no kernel_init"),
            Self::InitFailed { kernel, code } => write!(f, "kernel '{kernel}' init returned {code}"),
            Self::Mismatch { kernel, missing, unexpected } => {
                write!(
                    f,
                    "kernel '{kernel}' registration mismatch: missing [{}], unexpected [{}]",
                    missing.join(", "),
                    unexpected.join(", ")
                )
            }
            Self::UnknownFunction { kernel, function } => {
                write!(f, "kernel '{kernel}' has no function '{function}'")
            }
            Self::NotLinked(name) => write!(f, "kernel '{name}' is not linked"),
        }
    }
}

impl std::error::Error for KernelError {}

/// One kernel descriptor.
#[derive(Debug)]
struct Kernel {
    name: String,
    directory: PathBuf,
    dylib_file: String,
    state: KernelState,
    functions: IndexMap<String, Signature>,
    forms: IndexMap<String, Vec<TypeInfo>>,
    registered: AHashMap<String, RegisteredFn>,
    library: Option<Library>,
}

#[derive(Debug, Default)]
struct ManagerInner {
    kernels: IndexMap<String, Kernel>,
}

/// Owner of every loaded kernel; serialized by one mutex.
#[derive(Debug)]
pub struct KernelManager {
    paths: SourcePaths,
    inner: Mutex<ManagerInner>,
}

impl KernelManager {
    #[must_use]
    pub fn new(paths: SourcePaths) -> Self {
        Self { paths, inner: Mutex::new(ManagerInner::default()) }
    }

    /// Phase one only: resolve the kernel directory and interpret its
    /// manifest. Idempotent; used by the checker so that declared
    /// signatures and forms exist before anything is linked.
    pub fn declare(&self, name: &str) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        self.declare_locked(&mut inner, name)
    }

    /// Both phases: declare if needed, then open and link the dylib.
    /// Loading an already-linked kernel is a no-op.
    pub fn load(&self, name: &str) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        self.declare_locked(&mut inner, name)?;
        let kernel = inner.kernels.get_mut(name).expect("declared above");
        match kernel.state {
            KernelState::Linked => return Ok(()),
            KernelState::Declared => {}
            state => {
                warn!(kernel = name, ?state, "load rejected in current state");
                return Err(KernelError::NotLinked(name.to_string()));
            }
        }

        let dylib_path = kernel.directory.join(&kernel.dylib_file);
        // SAFETY: loading a kernel runs its constructors; that is the
        // entire point of the extension mechanism, and the operator
        // controls the kernel search paths.
        let library = unsafe { Library::new(&dylib_path) }.map_err(|e| KernelError::Open {
            kernel: name.to_string(),
            detail: e.to_string(),
        })?;

        // SAFETY: kernel_init has the documented ABI type.
        let init = unsafe { library.get::<KernelInitFn>(b"kernel_init") }
            .map_err(|_| KernelError::MissingInit(name.to_string()))?;

        let mut sink = RegistrationSink::default();
        // SAFETY: the sink outlives the call and the ABI table is
        // 'static; kernel_init follows the documented contract.
        let code = unsafe { init(std::ptr::from_mut(&mut sink).cast(), abi_table()) };
        if code != 0 {
            return Err(KernelError::InitFailed { kernel: name.to_string(), code });
        }

        let registered_names: Vec<&str> = sink.entries.iter().map(|e| e.name.as_str()).collect();
        let declared_names: Vec<&str> = kernel.functions.keys().map(String::as_str).collect();
        if let Err((missing, unexpected)) = reconcile(&declared_names, &registered_names) {
            // Closing the handle drops every registered symbol with it.
            drop(library);
            return Err(KernelError::Mismatch { kernel: name.to_string(), missing, unexpected });
        }

        kernel.registered = sink.entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        kernel.library = Some(library);
        kernel.state = KernelState::Linked;
        debug!(kernel = name, functions = kernel.registered.len(), "kernel linked");
        Ok(())
    }

    fn declare_locked(&self, inner: &mut ManagerInner, name: &str) -> Result<(), KernelError> {
        if inner.kernels.contains_key(name) {
            return Ok(());
        }
        let directory = self
            .paths
            .resolve_kernel_dir(name)
            .ok_or_else(|| KernelError::NotFound(name.to_string()))?;
        let manifest = parse_manifest(name, &directory)?;
        if manifest.declared_name != name {
            warn!(
                requested = name,
                declared = manifest.declared_name.as_str(),
                "kernel manifest declares a different name; using the requested one"
            );
        }
        debug!(
            kernel = name,
            dylib = manifest.dylib_file.as_str(),
            functions = manifest.functions.len(),
            forms = manifest.forms.len(),
            "kernel declared"
        );
        inner.kernels.insert(
            name.to_string(),
            Kernel {
                name: name.to_string(),
                directory,
                dylib_file: manifest.dylib_file,
                state: KernelState::Declared,
                functions: manifest.functions,
                forms: manifest.forms,
                registered: AHashMap::new(),
                library: None,
            },
        );
        Ok(())
    }

    /// The declared signature of `kernel/function`, if any.
    #[must_use]
    pub fn signature(&self, kernel: &str, function: &str) -> Option<Signature> {
        self.inner.lock().kernels.get(kernel)?.functions.get(function).cloned()
    }

    /// True once `kernel` has at least been declared.
    #[must_use]
    pub fn is_declared(&self, kernel: &str) -> bool {
        self.inner.lock().kernels.contains_key(kernel)
    }

    /// Current descriptor state, or `Unresolved` for unknown names.
    #[must_use]
    pub fn state(&self, kernel: &str) -> KernelState {
        self.inner
            .lock()
            .kernels
            .get(kernel)
            .map_or(KernelState::Unresolved, |k| k.state)
    }

    /// Every form declared by every known kernel, in declaration order.
    #[must_use]
    pub fn declared_forms(&self) -> Vec<(String, Vec<TypeInfo>)> {
        self.inner
            .lock()
            .kernels
            .values()
            .flat_map(|k| k.forms.iter().map(|(n, e)| (n.clone(), e.clone())))
            .collect()
    }

    /// The linked implementation of `kernel/function`.
    ///
    /// The returned pointer stays callable until [`Self::shutdown`]
    /// closes the library; holders must not outlive the manager.
    pub(crate) fn registered_fn(&self, kernel: &str, function: &str) -> Result<KernelFn, KernelError> {
        let inner = self.inner.lock();
        let k = inner
            .kernels
            .get(kernel)
            .ok_or_else(|| KernelError::NotFound(kernel.to_string()))?;
        if k.state != KernelState::Linked {
            return Err(KernelError::NotLinked(kernel.to_string()));
        }
        k.registered
            .get(function)
            .map(|r| r.function)
            .ok_or_else(|| KernelError::UnknownFunction {
                kernel: kernel.to_string(),
                function: function.to_string(),
            })
    }

    /// Runs `kernel_shutdown` handlers in LIFO load order, then closes
    /// every handle. Safe to call more than once.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        for kernel in inner.kernels.values_mut().rev() {
            let Some(library) = kernel.library.take() else {
                continue;
            };
            // SAFETY: kernel_shutdown, when exported, has the
            // documented ABI type.
            if let Ok(shutdown) = unsafe { library.get::<KernelShutdownFn>(b"kernel_shutdown") } {
                debug!(kernel = kernel.name.as_str(), "running kernel_shutdown");
                // SAFETY: the library is still open and the table is 'static.
                unsafe { shutdown(abi_table()) };
            }
            kernel.state = KernelState::Shutdown;
            drop(library);
            kernel.state = KernelState::Closed;
        }
    }
}

impl Drop for KernelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Declared-vs-registered reconciliation: both directions must be
/// empty for the link to stand.
fn reconcile(declared: &[&str], registered: &[&str]) -> Result<(), (Vec<String>, Vec<String>)> {
    let missing: Vec<String> = declared
        .iter()
        .filter(|d| !registered.contains(d))
        .map(ToString::to_string)
        .collect();
    let unexpected: Vec<String> = registered
        .iter()
        .filter(|r| !declared.contains(r))
        .map(ToString::to_string)
        .collect();
    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err((missing, unexpected))
    }
}

/// Phase-one output.
#[derive(Debug)]
struct ManifestDecl {
    declared_name: String,
    dylib_file: String,
    functions: IndexMap<String, Signature>,
    forms: IndexMap<String, Vec<TypeInfo>>,
}

/// Interprets `kernel.sxs` under the restricted meta-interpreter.
fn parse_manifest(kernel: &str, directory: &std::path::Path) -> Result<ManifestDecl, KernelError> {
    let manifest_err = |detail: String| KernelError::Manifest { kernel: kernel.to_string(), detail };
    let path = directory.join(KERNEL_MANIFEST);
    let text = fs::read_to_string(&path).map_err(|e| manifest_err(format!("{}: {e}", path.display())))?;
    let symbols = SymbolTable::new();
    let parsed = parse(&text, &symbols).map_err(|e| manifest_err(e.to_string()))?;

    // Exactly one datum, or a bracket list of datums.
    let datums: Vec<Value> = match parsed.value.tag() {
        ValueTag::Datum => vec![parsed.value.clone()],
        ValueTag::BracketList => {
            let list = parsed.value.as_list().map_err(|e| manifest_err(e.to_string()))?;
            list.iter().collect()
        }
        other => return Err(manifest_err(format!("expected datum declarations, found {other}"))),
    };

    let mut forms = FormRegistry::default();
    let mut define_kernel: Option<Value> = None;
    for datum in &datums {
        if datum.tag() != ValueTag::Datum {
            warn!(kernel, "skipping non-datum manifest entry");
            continue;
        }
        let decl = datum.unwrap_inner().map_err(|e| manifest_err(e.to_string()))?;
        if decl.tag() != ValueTag::ParenList {
            warn!(kernel, "skipping non-instruction manifest datum");
            continue;
        }
        let items = decl.as_list().map_err(|e| manifest_err(e.to_string()))?;
        let head = items
            .get(0)
            .and_then(|h| h.symbol_text().ok())
            .ok_or_else(|| manifest_err("declaration without a head symbol".to_string()))?;
        match head.as_ref() {
            "define-form" => {
                let (name, elements) = parse_define_form(&decl, &forms).map_err(manifest_err)?;
                forms
                    .register(&name, elements)
                    .map_err(|e| manifest_err(e.to_string()))?;
            }
            "define-kernel" => {
                if define_kernel.is_some() {
                    return Err(manifest_err("more than one define-kernel".to_string()));
                }
                define_kernel = Some(decl.clone());
            }
            other => return Err(manifest_err(format!("unknown declaration '{other}'"))),
        }
    }

    let decl = define_kernel.ok_or_else(|| manifest_err("no define-kernel declaration".to_string()))?;
    let items = decl.as_list().map_err(|e| manifest_err(e.to_string()))?;
    if items.len() != 4 {
        return Err(manifest_err("define-kernel requires: name dylib functions".to_string()));
    }
    let declared_name = items
        .get(1)
        .and_then(|v| v.symbol_text().ok())
        .ok_or_else(|| manifest_err("kernel name must be a symbol".to_string()))?
        .to_string();
    let dylib_file = items
        .get(2)
        .and_then(|v| v.as_string().ok())
        .ok_or_else(|| manifest_err("dylib filename must be a string".to_string()))?;
    let fn_list = items.get(3).ok_or_else(|| manifest_err("missing function list".to_string()))?;
    if fn_list.tag() != ValueTag::BracketList {
        return Err(manifest_err("functions must be a bracket list".to_string()));
    }

    let mut functions = IndexMap::new();
    for entry in fn_list.as_list().map_err(|e| manifest_err(e.to_string()))?.iter() {
        let (name, signature) = parse_define_function(&entry, &forms).map_err(manifest_err)?;
        if functions.insert(name.clone(), signature).is_some() {
            return Err(manifest_err(format!("function '{name}' declared twice")));
        }
    }

    let forms = forms.iter().map(|(n, e)| (n.to_string(), e.to_vec())).collect();
    Ok(ManifestDecl { declared_name, dylib_file, functions, forms })
}

/// `(define-form name { :t₁ :t₂ … })`
fn parse_define_form(decl: &Value, forms: &FormRegistry) -> Result<(String, Vec<TypeInfo>), String> {
    let items = decl.as_list().map_err(|e| e.to_string())?;
    if items.len() != 3 {
        return Err("define-form requires: name elements".to_string());
    }
    let name = items
        .get(1)
        .and_then(|v| v.symbol_text().ok())
        .ok_or_else(|| "define-form name must be a symbol".to_string())?;
    let element_list = items.get(2).ok_or_else(|| "define-form missing elements".to_string())?;
    if element_list.tag() != ValueTag::BraceList {
        return Err("define-form elements must be a brace list".to_string());
    }
    let mut elements = Vec::new();
    for element in element_list.as_list().map_err(|e| e.to_string())?.iter() {
        elements.push(type_symbol(&element, forms)?);
    }
    Ok((name.to_string(), elements))
}

/// `(define-function name (p₁ :t₁ …) :ret)`
fn parse_define_function(entry: &Value, forms: &FormRegistry) -> Result<(String, Signature), String> {
    if entry.tag() != ValueTag::ParenList {
        return Err("function declarations must be instructions".to_string());
    }
    let items = entry.as_list().map_err(|e| e.to_string())?;
    if items.len() != 4 {
        return Err("define-function requires: name parameters return-type".to_string());
    }
    let head = items
        .get(0)
        .and_then(|v| v.symbol_text().ok())
        .ok_or_else(|| "function declaration without head".to_string())?;
    if head.as_ref() != "define-function" {
        return Err(format!("expected define-function, found '{head}'"));
    }
    let name = items
        .get(1)
        .and_then(|v| v.symbol_text().ok())
        .ok_or_else(|| "function name must be a symbol".to_string())?;

    let param_list = items.get(2).ok_or_else(|| "missing parameter list".to_string())?;
    if param_list.tag() != ValueTag::ParenList {
        return Err("function parameters must be a paren list".to_string());
    }
    let params = param_list.as_list().map_err(|e| e.to_string())?;
    if params.len() % 2 != 0 {
        return Err("parameters must be name/type pairs".to_string());
    }
    let mut parameters = Vec::new();
    let mut variadic = false;
    for pair in 0..params.len() / 2 {
        let ty = params.get(pair * 2 + 1).ok_or_else(|| "missing parameter type".to_string())?;
        let info = type_symbol(&ty, forms)?;
        if info.is_variadic && pair + 1 != params.len() / 2 {
            return Err("only the final parameter may be variadic".to_string());
        }
        variadic |= info.is_variadic;
        parameters.push(info);
    }

    let ret = items.get(3).ok_or_else(|| "missing return type".to_string())?;
    let return_type = type_symbol(&ret, forms)?;
    Ok((name.to_string(), Signature::new(parameters, return_type, variadic)))
}

fn type_symbol(value: &Value, forms: &FormRegistry) -> Result<TypeInfo, String> {
    let text = value
        .symbol_text()
        .map_err(|_| "expected a type symbol".to_string())?;
    resolve_type_symbol(&text, forms).ok_or_else(|| format!("invalid type symbol '{text}'"))
}
