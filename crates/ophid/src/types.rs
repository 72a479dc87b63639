//! Type information layered onto the value model.
//!
//! A [`TypeInfo`] names a value tag plus the extras that distinguish
//! richer types: a lambda id for signatures that must survive being
//! passed as values, a form name and element list for user-declared
//! structural types, and a variadic flag for `:name..` ascriptions.
//! The `any` pseudo-type is `base = None` with no lambda id and
//! matches everything.

use std::{fmt, str::FromStr};

use ahash::AHashMap;
use indexmap::IndexMap;
use strum::{Display, EnumString, IntoStaticStr};

use crate::store::ValueTag;

/// Base type names reachable from `:name` ascription syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum TypeName {
    Int,
    Real,
    Rune,
    Str,
    Sym,
    #[strum(serialize = "list-p")]
    ListP,
    #[strum(serialize = "list-b")]
    ListB,
    #[strum(serialize = "list-c")]
    ListC,
    Some,
    Datum,
    Error,
    Fn,
    None,
    Any,
}

impl TypeName {
    /// The value tag this name denotes. `none` and `any` share the
    /// `None` tag: both are the match-everything pseudo-type.
    #[must_use]
    pub fn tag(self) -> ValueTag {
        match self {
            Self::Int => ValueTag::Integer,
            Self::Real => ValueTag::Real,
            Self::Rune => ValueTag::Rune,
            Self::Str => ValueTag::DqList,
            Self::Sym => ValueTag::Symbol,
            Self::ListP => ValueTag::ParenList,
            Self::ListB => ValueTag::BracketList,
            Self::ListC => ValueTag::BraceList,
            Self::Some => ValueTag::Some,
            Self::Datum => ValueTag::Datum,
            Self::Error => ValueTag::Error,
            Self::Fn => ValueTag::Aberrant,
            Self::None | Self::Any => ValueTag::None,
        }
    }
}

/// Computed type of one node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypeInfo {
    pub base: ValueTag,
    /// Non-zero when this is a lambda whose signature is registered in
    /// a [`SignatureTable`].
    pub lambda_id: u64,
    /// Set when this is a registered form.
    pub form_name: Option<String>,
    /// Element types of a form or of a brace-list literal.
    pub form_elements: Vec<TypeInfo>,
    pub is_variadic: bool,
}

impl TypeInfo {
    /// The `any` pseudo-type.
    #[must_use]
    pub fn any() -> Self {
        Self::of(ValueTag::None)
    }

    #[must_use]
    pub fn of(base: ValueTag) -> Self {
        Self {
            base,
            lambda_id: 0,
            form_name: None,
            form_elements: Vec::new(),
            is_variadic: false,
        }
    }

    /// A lambda type carrying the id its signature is registered under.
    #[must_use]
    pub fn lambda(id: u64) -> Self {
        Self { lambda_id: id, ..Self::of(ValueTag::Aberrant) }
    }

    /// A registered form over brace lists.
    #[must_use]
    pub fn form(name: impl Into<String>, elements: Vec<Self>) -> Self {
        Self {
            base: ValueTag::BraceList,
            lambda_id: 0,
            form_name: Some(name.into()),
            form_elements: elements,
            is_variadic: false,
        }
    }

    /// A brace-list literal with known element types.
    #[must_use]
    pub fn brace(elements: Vec<Self>) -> Self {
        Self { form_elements: elements, ..Self::of(ValueTag::BraceList) }
    }

    #[must_use]
    pub fn variadic(mut self) -> Self {
        self.is_variadic = true;
        self
    }

    /// True for the match-everything pseudo-type.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.base == ValueTag::None && self.lambda_id == 0
    }

    /// Compatibility for argument checking.
    ///
    /// `any` matches everything (in either position); two paren-list
    /// types match regardless of content; otherwise tags must be
    /// equal, and when both sides carry form elements the elements
    /// must be pairwise compatible.
    #[must_use]
    pub fn compatible(&self, other: &Self) -> bool {
        if self.is_any() || other.is_any() {
            return true;
        }
        if self.base != other.base {
            return false;
        }
        if self.base == ValueTag::ParenList {
            return true;
        }
        if !self.form_elements.is_empty() && !other.form_elements.is_empty() {
            return self.form_elements.len() == other.form_elements.len()
                && self
                    .form_elements
                    .iter()
                    .zip(&other.form_elements)
                    .all(|(a, b)| a.compatible(b));
        }
        true
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.form_name {
            write!(f, ":{name}")?;
        } else if self.is_any() {
            write!(f, ":any")?;
        } else if self.base == ValueTag::Aberrant {
            write!(f, ":fn")?;
        } else {
            let name = match self.base {
                ValueTag::Integer => "int",
                ValueTag::Real => "real",
                ValueTag::Rune => "rune",
                ValueTag::DqList => "str",
                ValueTag::Symbol => "sym",
                ValueTag::ParenList => "list-p",
                ValueTag::BracketList => "list-b",
                ValueTag::BraceList => "list-c",
                ValueTag::Some => "some",
                ValueTag::Datum => "datum",
                ValueTag::Error => "error",
                ValueTag::None | ValueTag::Aberrant => "any",
            };
            write!(f, ":{name}")?;
        }
        if self.is_variadic {
            write!(f, "..")?;
        }
        Ok(())
    }
}

/// Registry of user-declared forms, in registration order.
#[derive(Debug, Default, Clone)]
pub struct FormRegistry {
    forms: IndexMap<String, Vec<TypeInfo>>,
}

impl FormRegistry {
    /// Registers a form. Re-registering the same name with identical
    /// elements is a no-op; a conflicting redefinition is rejected.
    pub fn register(&mut self, name: &str, elements: Vec<TypeInfo>) -> Result<(), FormError> {
        if let Some(existing) = self.forms.get(name) {
            if *existing == elements {
                return Ok(());
            }
            return Err(FormError::Conflict(name.to_string()));
        }
        self.forms.insert(name.to_string(), elements);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.forms.contains_key(name)
    }

    /// The form's type, if registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TypeInfo> {
        self.forms
            .get(name)
            .map(|elements| TypeInfo::form(name, elements.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TypeInfo])> {
        self.forms.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Rejected form registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    /// The name is already registered with different elements.
    Conflict(String),
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(name) => write!(f, "form '{name}' is already registered with a different shape"),
        }
    }
}

impl std::error::Error for FormError {}

/// Resolves a `:name` / `:name..` ascription symbol against the base
/// type names and the registered forms. Returns `None` when the text
/// is not an ascription or names an unknown type.
#[must_use]
pub fn resolve_type_symbol(text: &str, forms: &FormRegistry) -> Option<TypeInfo> {
    let body = text.strip_prefix(':')?;
    let (body, variadic) = match body.strip_suffix("..") {
        Some(stripped) => (stripped, true),
        None => (body, false),
    };
    let info = match TypeName::from_str(body) {
        Ok(name) => TypeInfo::of(name.tag()),
        Err(_) => forms.get(body)?,
    };
    Some(if variadic { info.variadic() } else { info })
}

/// True when the text is shaped like an ascription symbol, whether or
/// not it resolves. Lets callers distinguish "unknown type symbol"
/// (fatal) from a plain symbol.
#[must_use]
pub fn is_type_symbol(text: &str) -> bool {
    text.starts_with(':') && text.len() > 1
}

/// A callable's parameter and return types.
///
/// A variadic signature's final parameter is the uniform element type
/// of the tail; it accepts any count from zero upward.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Signature {
    pub parameters: Vec<TypeInfo>,
    pub return_type: TypeInfo,
    pub variadic: bool,
}

impl Signature {
    #[must_use]
    pub fn new(parameters: Vec<TypeInfo>, return_type: TypeInfo, variadic: bool) -> Self {
        Self { parameters, return_type, variadic }
    }

    /// Shorthand for an `any..` signature.
    #[must_use]
    pub fn open(return_type: TypeInfo) -> Self {
        Self::new(vec![TypeInfo::any()], return_type, true)
    }

    /// Checks argument types, reporting the first mismatch.
    pub fn accepts(&self, args: &[TypeInfo]) -> Result<(), SignatureMismatch> {
        let fixed = if self.variadic { self.parameters.len() - 1 } else { self.parameters.len() };
        if args.len() < fixed || (!self.variadic && args.len() > fixed) {
            return Err(SignatureMismatch::Arity { expected: fixed, variadic: self.variadic, received: args.len() });
        }
        for (index, arg) in args.iter().enumerate() {
            let param = if index < fixed {
                &self.parameters[index]
            } else {
                &self.parameters[fixed]
            };
            if !param.compatible(arg) {
                return Err(SignatureMismatch::Argument {
                    index,
                    expected: param.clone(),
                    received: arg.clone(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{p}")?;
            if self.variadic && i + 1 == self.parameters.len() && !p.is_variadic {
                write!(f, "..")?;
            }
        }
        write!(f, ") -> {}", self.return_type)
    }
}

/// First point of disagreement between a signature and an argument
/// list.
#[derive(Debug, Clone, PartialEq)]
pub enum SignatureMismatch {
    Arity { expected: usize, variadic: bool, received: usize },
    Argument { index: usize, expected: TypeInfo, received: TypeInfo },
}

impl fmt::Display for SignatureMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arity { expected, variadic: true, received } => {
                write!(f, "expected at least {expected} arguments, received {received}")
            }
            Self::Arity { expected, variadic: false, received } => {
                write!(f, "expected {expected} arguments, received {received}")
            }
            Self::Argument { index, expected, received } => {
                write!(f, "argument {index} expected {expected}, received {received}")
            }
        }
    }
}

/// Lambda signatures keyed by lambda id.
///
/// An `Aberrant` value with a non-zero id resolves to its signature
/// here, so signatures survive the value being passed around.
#[derive(Debug, Default)]
pub struct SignatureTable {
    map: AHashMap<u64, Signature>,
}

impl SignatureTable {
    pub fn register(&mut self, id: u64, signature: Signature) {
        self.map.insert(id, signature);
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Signature> {
        self.map.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn type_symbols_resolve() {
        let forms = FormRegistry::default();
        assert_eq!(resolve_type_symbol(":int", &forms).unwrap().base, ValueTag::Integer);
        assert_eq!(resolve_type_symbol(":str", &forms).unwrap().base, ValueTag::DqList);
        assert!(resolve_type_symbol(":int..", &forms).unwrap().is_variadic);
        assert!(resolve_type_symbol(":any", &forms).unwrap().is_any());
        assert!(resolve_type_symbol(":mystery", &forms).is_none());
        assert!(resolve_type_symbol("plain", &forms).is_none());
    }

    #[test]
    fn forms_resolve_as_type_symbols() {
        let mut forms = FormRegistry::default();
        forms
            .register("person", vec![TypeInfo::of(ValueTag::DqList), TypeInfo::of(ValueTag::Integer)])
            .unwrap();
        let info = resolve_type_symbol(":person", &forms).unwrap();
        assert_eq!(info.base, ValueTag::BraceList);
        assert_eq!(info.form_name.as_deref(), Some("person"));
        assert_eq!(info.form_elements.len(), 2);
    }

    #[test]
    fn form_redefinition_rules() {
        let mut forms = FormRegistry::default();
        let elements = vec![TypeInfo::of(ValueTag::Integer)];
        forms.register("pair", elements.clone()).unwrap();
        forms.register("pair", elements).unwrap();
        let err = forms.register("pair", vec![TypeInfo::of(ValueTag::Real)]).unwrap_err();
        assert_eq!(err, FormError::Conflict("pair".to_string()));
    }

    #[test]
    fn any_matches_everything() {
        let any = TypeInfo::any();
        assert!(any.compatible(&TypeInfo::of(ValueTag::Integer)));
        assert!(TypeInfo::of(ValueTag::Integer).compatible(&any));
    }

    #[test]
    fn paren_lists_match_regardless_of_content() {
        let a = TypeInfo::of(ValueTag::ParenList);
        let b = TypeInfo::of(ValueTag::ParenList);
        assert!(a.compatible(&b));
        assert!(!a.compatible(&TypeInfo::of(ValueTag::BracketList)));
    }

    #[test]
    fn forms_compare_element_wise() {
        let person = TypeInfo::form("person", vec![TypeInfo::of(ValueTag::DqList), TypeInfo::of(ValueTag::Integer)]);
        let fits = TypeInfo::brace(vec![TypeInfo::of(ValueTag::DqList), TypeInfo::of(ValueTag::Integer)]);
        let wrong = TypeInfo::brace(vec![TypeInfo::of(ValueTag::Integer), TypeInfo::of(ValueTag::Integer)]);
        assert!(person.compatible(&fits));
        assert!(!person.compatible(&wrong));
    }

    #[test]
    fn signatures_check_arity_and_types() {
        let sig = Signature::new(
            vec![TypeInfo::of(ValueTag::Integer), TypeInfo::of(ValueTag::DqList)],
            TypeInfo::of(ValueTag::Integer),
            false,
        );
        assert!(sig.accepts(&[TypeInfo::of(ValueTag::Integer), TypeInfo::of(ValueTag::DqList)]).is_ok());
        assert!(matches!(
            sig.accepts(&[TypeInfo::of(ValueTag::Integer)]),
            Err(SignatureMismatch::Arity { .. })
        ));
        assert!(matches!(
            sig.accepts(&[TypeInfo::of(ValueTag::DqList), TypeInfo::of(ValueTag::DqList)]),
            Err(SignatureMismatch::Argument { index: 0, .. })
        ));
    }

    #[test]
    fn variadic_signatures_accept_zero_or_more() {
        let sig = Signature::new(vec![TypeInfo::of(ValueTag::Integer)], TypeInfo::of(ValueTag::Integer), true);
        assert!(sig.accepts(&[]).is_ok());
        let four = vec![TypeInfo::of(ValueTag::Integer); 4];
        assert!(sig.accepts(&four).is_ok());
        assert!(sig.accepts(&[TypeInfo::of(ValueTag::Real)]).is_err());
    }

    #[test]
    fn signature_renders_for_error_messages() {
        let sig = Signature::new(
            vec![TypeInfo::of(ValueTag::Integer), TypeInfo::of(ValueTag::Integer)],
            TypeInfo::of(ValueTag::Integer),
            false,
        );
        assert_eq!(sig.to_string(), "(:int :int) -> :int");
    }
}
