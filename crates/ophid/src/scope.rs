//! Lexical scope frames.
//!
//! A frame maps symbol names to `(type info, runtime value)` pairs and
//! links to its parent; lookup walks from the innermost frame outward.
//! Frames are reference-counted because closures hold a strong
//! reference to the frame that was on top when `fn` ran -- the chain
//! stays alive as long as any closure captured it.

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;

use crate::{store::Value, types::TypeInfo};

/// One scope entry.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub type_info: TypeInfo,
    pub value: Value,
}

impl Binding {
    pub fn new(type_info: TypeInfo, value: Value) -> Self {
        Self { type_info, value }
    }
}

pub(crate) type ScopeRef = Rc<RefCell<Frame>>;

/// A frame in the scope chain.
#[derive(Debug)]
pub(crate) struct Frame {
    bindings: AHashMap<String, Binding>,
    parent: Option<ScopeRef>,
}

impl Frame {
    /// A chain root (module/file scope).
    pub fn root() -> ScopeRef {
        Rc::new(RefCell::new(Self { bindings: AHashMap::new(), parent: None }))
    }

    /// A new innermost frame on top of `parent`.
    pub fn child(parent: &ScopeRef) -> ScopeRef {
        Rc::new(RefCell::new(Self {
            bindings: AHashMap::new(),
            parent: Some(Rc::clone(parent)),
        }))
    }

    /// Defines `name` in exactly this frame.
    ///
    /// Returns `false` when the name is already bound here --
    /// redefinition in the same scope is the caller's error to raise.
    pub fn define(scope: &ScopeRef, name: &str, binding: Binding) -> bool {
        let mut frame = scope.borrow_mut();
        if frame.bindings.contains_key(name) {
            return false;
        }
        frame.bindings.insert(name.to_string(), binding);
        true
    }

    /// Walks the chain from `scope` outward.
    pub fn lookup(scope: &ScopeRef, name: &str) -> Option<Binding> {
        let mut cursor = Some(Rc::clone(scope));
        while let Some(frame) = cursor {
            let frame = frame.borrow();
            if let Some(binding) = frame.bindings.get(name) {
                return Some(binding.clone());
            }
            cursor = frame.parent.clone();
        }
        None
    }
}
