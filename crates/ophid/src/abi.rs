//! The C-callable surface handed to every loaded kernel.
//!
//! A kernel receives one [`AbiTable`] -- a struct of function pointers
//! covering value accessors, value constructors, an eval callback into
//! the host, and function registration. Values cross the boundary as
//! opaque `*mut SxValue` handles.
//!
//! Ownership contract (part of the ABI):
//!
//! * Handles passed INTO a kernel (arguments, `list_at` results,
//!   `create_*` results) are owned by the host for the duration of the
//!   call; kernels never free them and must copy data they want to
//!   retain.
//! * The handle a registered function RETURNS transfers to the host.
//!   Returning null yields the none value.
//! * Pointers obtained from `as_string`/`as_symbol`/`get_system_info`
//!   are backed by a thread-local buffer and are overwritten by the
//!   next such call on the same thread; they must not be retained.
//!
//! The host enforces its side by keeping every handle it creates for a
//! call in a per-call arena and freeing the arena when the call
//! returns.

use std::{
    cell::RefCell,
    ffi::{CStr, CString, c_char, c_void},
    ptr,
};

use crate::{
    eval::Evaluator,
    store::{Value, ValueTag},
};

/// Opaque value handle as seen by kernels.
pub struct SxValue(pub(crate) Value);

/// A function a kernel registers with the host.
///
/// `ctx` is the evaluation context handle for the current call; it is
/// only valid for the duration of the call.
pub type KernelFn = unsafe extern "C" fn(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue;

/// Required entry point of every kernel dylib.
pub type KernelInitFn = unsafe extern "C" fn(registry: *mut c_void, api: *const AbiTable) -> i32;

/// Optional teardown entry point.
pub type KernelShutdownFn = unsafe extern "C" fn(api: *const AbiTable);

/// The table of host functions passed to `kernel_init`.
///
/// Field order is ABI: append, never reorder.
#[repr(C)]
pub struct AbiTable {
    pub register_function:
        unsafe extern "C" fn(registry: *mut c_void, name: *const c_char, function: KernelFn, return_tag: u8, variadic: u8) -> i32,
    pub eval: unsafe extern "C" fn(ctx: *mut c_void, value: *mut SxValue) -> *mut SxValue,
    pub as_int: unsafe extern "C" fn(value: *const SxValue) -> i64,
    pub as_real: unsafe extern "C" fn(value: *const SxValue) -> f64,
    pub as_string: unsafe extern "C" fn(value: *const SxValue) -> *const c_char,
    pub as_symbol: unsafe extern "C" fn(value: *const SxValue) -> *const c_char,
    pub list_size: unsafe extern "C" fn(value: *const SxValue) -> usize,
    pub list_at: unsafe extern "C" fn(ctx: *mut c_void, value: *const SxValue, index: usize) -> *mut SxValue,
    pub create_int: unsafe extern "C" fn(ctx: *mut c_void, value: i64) -> *mut SxValue,
    pub create_real: unsafe extern "C" fn(ctx: *mut c_void, value: f64) -> *mut SxValue,
    pub create_string: unsafe extern "C" fn(ctx: *mut c_void, text: *const c_char) -> *mut SxValue,
    pub create_symbol: unsafe extern "C" fn(ctx: *mut c_void, name: *const c_char) -> *mut SxValue,
    pub create_none: unsafe extern "C" fn(ctx: *mut c_void) -> *mut SxValue,
    pub create_paren_list: unsafe extern "C" fn(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue,
    pub create_bracket_list:
        unsafe extern "C" fn(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue,
    pub create_brace_list: unsafe extern "C" fn(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue,
    pub some_has_value: unsafe extern "C" fn(value: *const SxValue) -> i32,
    pub some_get_value: unsafe extern "C" fn(ctx: *mut c_void, value: *const SxValue) -> *mut SxValue,
    pub get_system_info: unsafe extern "C" fn(sys: *mut c_void) -> *const c_char,
}

/// The one table instance shared by every kernel.
#[must_use]
pub fn abi_table() -> &'static AbiTable {
    static TABLE: AbiTable = AbiTable {
        register_function: abi_register_function,
        eval: abi_eval,
        as_int: abi_as_int,
        as_real: abi_as_real,
        as_string: abi_as_string,
        as_symbol: abi_as_symbol,
        list_size: abi_list_size,
        list_at: abi_list_at,
        create_int: abi_create_int,
        create_real: abi_create_real,
        create_string: abi_create_string,
        create_symbol: abi_create_symbol,
        create_none: abi_create_none,
        create_paren_list: abi_create_paren_list,
        create_bracket_list: abi_create_bracket_list,
        create_brace_list: abi_create_brace_list,
        some_has_value: abi_some_has_value,
        some_get_value: abi_some_get_value,
        get_system_info: abi_get_system_info,
    };
    &TABLE
}

/// One function registration collected during `kernel_init`.
#[derive(Clone)]
pub(crate) struct RegisteredFn {
    pub name: String,
    pub function: KernelFn,
    pub return_tag: ValueTag,
    pub variadic: bool,
}

impl std::fmt::Debug for RegisteredFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFn")
            .field("name", &self.name)
            .field("return_tag", &self.return_tag)
            .field("variadic", &self.variadic)
            .finish_non_exhaustive()
    }
}

/// Registry handle passed to `kernel_init`; collects registrations for
/// the loader to reconcile against the manifest.
#[derive(Debug, Default)]
pub(crate) struct RegistrationSink {
    pub entries: Vec<RegisteredFn>,
}

/// Per-call context handle passed to kernel functions.
///
/// Owns the handle arena for one call; everything adopted here is
/// freed when the call completes.
pub(crate) struct AbiContext {
    evaluator: *mut Evaluator,
    handles: Vec<*mut SxValue>,
}

impl AbiContext {
    fn adopt(&mut self, value: Value) -> *mut SxValue {
        let handle = Box::into_raw(Box::new(SxValue(value)));
        self.handles.push(handle);
        handle
    }
}

/// Outcome of one kernel function invocation.
pub(crate) enum KernelCallOutcome {
    Value(Value),
    /// The kernel returned an ERROR-tagged value.
    ErrorValue(Value),
}

/// Invokes a registered kernel function with pre-evaluated arguments.
pub(crate) fn invoke(evaluator: &mut Evaluator, function: KernelFn, args: &[Value]) -> KernelCallOutcome {
    let symbols = evaluator.symbols().clone();
    let mut ctx = AbiContext { evaluator: ptr::from_mut(evaluator), handles: Vec::new() };
    let argv: Vec<*mut SxValue> = args.iter().map(|a| ctx.adopt(a.clone())).collect();

    // SAFETY: `ctx` outlives the call, the argv handles live in its
    // arena, and the function pointer was produced by a successfully
    // linked kernel following the ABI contract above.
    let returned = unsafe { function(ptr::from_mut(&mut ctx).cast::<c_void>(), argv.as_ptr(), argv.len()) };

    let result = if returned.is_null() {
        Value::create_none(&symbols)
    } else if ctx.handles.contains(&returned) {
        // The kernel handed back a host-owned handle; the arena still
        // frees the original.
        // SAFETY: the handle is in our arena, so it is a live box.
        unsafe { (*returned).0.clone() }
    } else {
        // SAFETY: a non-arena return transfers ownership to the host
        // per the ABI contract.
        unsafe { Box::from_raw(returned).0 }
    };

    for handle in ctx.handles.drain(..) {
        // SAFETY: arena handles were created by `adopt` and are freed
        // exactly once, here.
        drop(unsafe { Box::from_raw(handle) });
    }

    if result.tag() == ValueTag::Error {
        KernelCallOutcome::ErrorValue(result)
    } else {
        KernelCallOutcome::Value(result)
    }
}

thread_local! {
    /// Backing storage for string pointers crossing the boundary.
    static BOUNDARY_STRING: RefCell<CString> = RefCell::new(CString::default());
}

fn stash_string(text: &str) -> *const c_char {
    let owned = CString::new(text.replace('\0', "")).unwrap_or_default();
    BOUNDARY_STRING.with(|cell| {
        *cell.borrow_mut() = owned;
        cell.borrow().as_ptr()
    })
}

/// Reads a borrowed C string at the boundary; `None` on null or
/// invalid UTF-8.
unsafe fn read_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller (the kernel) passes a nul-terminated string per
    // the ABI contract.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe extern "C" fn abi_register_function(
    registry: *mut c_void,
    name: *const c_char,
    function: KernelFn,
    return_tag: u8,
    variadic: u8,
) -> i32 {
    if registry.is_null() {
        return 1;
    }
    // SAFETY: the loader passes a live `RegistrationSink` for the
    // duration of `kernel_init`.
    let sink = unsafe { &mut *registry.cast::<RegistrationSink>() };
    // SAFETY: name is a kernel-supplied nul-terminated string.
    let Some(name) = (unsafe { read_c_str(name) }) else {
        return 2;
    };
    let Some(return_tag) = ValueTag::from_repr(return_tag) else {
        return 3;
    };
    sink.entries.push(RegisteredFn {
        name: name.to_string(),
        function,
        return_tag,
        variadic: variadic != 0,
    });
    0
}

unsafe extern "C" fn abi_eval(ctx: *mut c_void, value: *mut SxValue) -> *mut SxValue {
    if ctx.is_null() || value.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: ctx is the live AbiContext for this call.
    let ctx = unsafe { &mut *ctx.cast::<AbiContext>() };
    // SAFETY: value is a live host-owned handle; we only borrow it.
    let input = unsafe { &(*value).0 }.clone();
    // SAFETY: the evaluator pointer is valid for the duration of the
    // kernel call that produced this context.
    let evaluator = unsafe { &mut *ctx.evaluator };
    let result = match evaluator.eval_value(&input) {
        Ok(v) => v,
        Err(flow) => flow.into_error_value(evaluator.symbols()),
    };
    ctx.adopt(result)
}

unsafe extern "C" fn abi_as_int(value: *const SxValue) -> i64 {
    // SAFETY: value is a live host-owned handle (or null).
    unsafe { value.as_ref() }.and_then(|v| v.0.as_int().ok()).unwrap_or(0)
}

unsafe extern "C" fn abi_as_real(value: *const SxValue) -> f64 {
    // SAFETY: value is a live host-owned handle (or null).
    unsafe { value.as_ref() }.and_then(|v| v.0.as_real().ok()).unwrap_or(0.0)
}

unsafe extern "C" fn abi_as_string(value: *const SxValue) -> *const c_char {
    // SAFETY: value is a live host-owned handle (or null).
    match unsafe { value.as_ref() }.and_then(|v| v.0.as_string().ok()) {
        Some(text) => stash_string(&text),
        None => ptr::null(),
    }
}

unsafe extern "C" fn abi_as_symbol(value: *const SxValue) -> *const c_char {
    // SAFETY: value is a live host-owned handle (or null).
    match unsafe { value.as_ref() }.and_then(|v| v.0.symbol_text().ok()) {
        Some(text) => stash_string(&text),
        None => ptr::null(),
    }
}

unsafe extern "C" fn abi_list_size(value: *const SxValue) -> usize {
    // SAFETY: value is a live host-owned handle (or null).
    unsafe { value.as_ref() }.and_then(|v| v.0.as_list().ok().map(|l| l.len())).unwrap_or(0)
}

unsafe extern "C" fn abi_list_at(ctx: *mut c_void, value: *const SxValue, index: usize) -> *mut SxValue {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: ctx is the live AbiContext for this call.
    let ctx = unsafe { &mut *ctx.cast::<AbiContext>() };
    // SAFETY: value is a live host-owned handle (or null).
    let Some(item) = unsafe { value.as_ref() }.and_then(|v| v.0.as_list().ok().and_then(|l| l.get(index))) else {
        return ptr::null_mut();
    };
    ctx.adopt(item)
}

fn with_ctx(ctx: *mut c_void, build: impl FnOnce(&mut AbiContext, &Evaluator) -> Value) -> *mut SxValue {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: ctx is the live AbiContext for this call, and its
    // evaluator pointer is valid for the call's duration.
    let ctx = unsafe { &mut *ctx.cast::<AbiContext>() };
    // SAFETY: as above.
    let evaluator = unsafe { &*ctx.evaluator };
    let value = build(ctx, evaluator);
    ctx.adopt(value)
}

unsafe extern "C" fn abi_create_int(ctx: *mut c_void, value: i64) -> *mut SxValue {
    with_ctx(ctx, |_, ev| Value::create_int(value, ev.symbols()))
}

unsafe extern "C" fn abi_create_real(ctx: *mut c_void, value: f64) -> *mut SxValue {
    with_ctx(ctx, |_, ev| Value::create_real(value, ev.symbols()))
}

unsafe extern "C" fn abi_create_string(ctx: *mut c_void, text: *const c_char) -> *mut SxValue {
    // SAFETY: text is a kernel-supplied nul-terminated string.
    let Some(text) = (unsafe { read_c_str(text) }) else {
        return ptr::null_mut();
    };
    with_ctx(ctx, |_, ev| Value::create_string(text, ev.symbols()))
}

unsafe extern "C" fn abi_create_symbol(ctx: *mut c_void, name: *const c_char) -> *mut SxValue {
    // SAFETY: name is a kernel-supplied nul-terminated string.
    let Some(name) = (unsafe { read_c_str(name) }) else {
        return ptr::null_mut();
    };
    with_ctx(ctx, |_, ev| Value::create_symbol(name, ev.symbols()))
}

unsafe extern "C" fn abi_create_none(ctx: *mut c_void) -> *mut SxValue {
    with_ctx(ctx, |_, ev| Value::create_none(ev.symbols()))
}

fn create_list(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize, tag: ValueTag) -> *mut SxValue {
    if ctx.is_null() || (argc > 0 && argv.is_null()) {
        return ptr::null_mut();
    }
    // SAFETY: ctx is the live AbiContext for this call.
    let ctx = unsafe { &mut *ctx.cast::<AbiContext>() };
    // SAFETY: as above.
    let evaluator = unsafe { &*ctx.evaluator };
    let mut items = Vec::with_capacity(argc);
    for i in 0..argc {
        // SAFETY: argv points at argc live handles per the ABI contract.
        let handle = unsafe { *argv.add(i) };
        if handle.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: handle is live; we borrow its value.
        items.push(unsafe { &(*handle).0 }.clone());
    }
    let built = match tag {
        ValueTag::ParenList => Value::create_paren_list(&items, evaluator.symbols()),
        ValueTag::BracketList => Value::create_bracket_list(&items, evaluator.symbols()),
        _ => Value::create_brace_list(&items, evaluator.symbols()),
    };
    match built {
        Ok(value) => ctx.adopt(value),
        Err(_) => ptr::null_mut(),
    }
}

unsafe extern "C" fn abi_create_paren_list(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue {
    create_list(ctx, argv, argc, ValueTag::ParenList)
}

unsafe extern "C" fn abi_create_bracket_list(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue {
    create_list(ctx, argv, argc, ValueTag::BracketList)
}

unsafe extern "C" fn abi_create_brace_list(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue {
    create_list(ctx, argv, argc, ValueTag::BraceList)
}

unsafe extern "C" fn abi_some_has_value(value: *const SxValue) -> i32 {
    // SAFETY: value is a live host-owned handle (or null).
    i32::from(unsafe { value.as_ref() }.is_some_and(|v| v.0.tag() == ValueTag::Some))
}

unsafe extern "C" fn abi_some_get_value(ctx: *mut c_void, value: *const SxValue) -> *mut SxValue {
    if ctx.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: ctx is the live AbiContext for this call.
    let ctx = unsafe { &mut *ctx.cast::<AbiContext>() };
    // SAFETY: value is a live host-owned handle (or null).
    let Some(inner) = unsafe { value.as_ref() }
        .filter(|v| v.0.tag() == ValueTag::Some)
        .and_then(|v| v.0.unwrap_inner().ok())
    else {
        return ptr::null_mut();
    };
    ctx.adopt(inner)
}

unsafe extern "C" fn abi_get_system_info(sys: *mut c_void) -> *const c_char {
    if sys.is_null() {
        return stash_string("");
    }
    // SAFETY: sys is the live AbiContext for this call.
    let ctx = unsafe { &mut *sys.cast::<AbiContext>() };
    // SAFETY: as above.
    let evaluator = unsafe { &*ctx.evaluator };
    stash_string(&evaluator.working_dir().display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_strings_are_overwritten_per_call() {
        let a = stash_string("first");
        // SAFETY: a points at the thread-local buffer we just set.
        let first = unsafe { CStr::from_ptr(a) }.to_str().unwrap().to_string();
        assert_eq!(first, "first");
        let _b = stash_string("second");
        // SAFETY: a still points at the buffer, now holding "second" --
        // exactly the staleness the ABI contract warns kernels about.
        let reread = unsafe { CStr::from_ptr(a) }.to_str().unwrap();
        assert_eq!(reread, "second");
    }

    /// A host-side stand-in for a native kernel function: adds its two
    /// integer arguments with the public table the way compiled
    /// kernels do.
    unsafe extern "C" fn fake_add(ctx: *mut c_void, argv: *const *mut SxValue, argc: usize) -> *mut SxValue {
        let api = abi_table();
        if argc != 2 {
            return ptr::null_mut();
        }
        // SAFETY: argv holds argc live handles per the ABI contract.
        let (a, b) = unsafe { ((api.as_int)(*argv), (api.as_int)(*argv.add(1))) };
        // SAFETY: ctx is the context handle the host passed us.
        unsafe { (api.create_int)(ctx, a + b) }
    }

    #[test]
    fn invoke_round_trips_through_the_table() {
        let mut evaluator = Evaluator::default();
        let symbols = evaluator.symbols().clone();
        let args = [Value::create_int(10, &symbols), Value::create_int(20, &symbols)];
        match invoke(&mut evaluator, fake_add, &args) {
            KernelCallOutcome::Value(v) => assert_eq!(v.as_int().unwrap(), 30),
            KernelCallOutcome::ErrorValue(v) => panic!("unexpected error value {v}"),
        }
    }

    #[test]
    fn null_return_becomes_none() {
        unsafe extern "C" fn nothing(_: *mut c_void, _: *const *mut SxValue, _: usize) -> *mut SxValue {
            ptr::null_mut()
        }
        let mut evaluator = Evaluator::default();
        match invoke(&mut evaluator, nothing, &[]) {
            KernelCallOutcome::Value(v) => assert_eq!(v.tag(), ValueTag::None),
            KernelCallOutcome::ErrorValue(v) => panic!("unexpected error value {v}"),
        }
    }
}
