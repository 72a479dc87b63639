//! The lexical value store: a compact, self-describing binary encoding
//! of every value the runtime manipulates.
//!
//! A store is one contiguous byte buffer of fixed-size records
//! ("units"). A unit is ten bytes: a tag byte, an auxiliary byte (used
//! only by [`ValueTag::Aberrant`]), and an 8-byte little-endian
//! payload. Scalar tags hold their datum in the payload; list-shaped
//! tags hold the offset of a sequence block (`count` followed by
//! `count` unit offsets); [`ValueTag::DqList`] holds the offset of a
//! rune block (`count` followed by `count` code points); wrapper tags
//! hold the offset of the wrapped unit.
//!
//! Fixing one binary representation means the parser, checker,
//! evaluator, and kernel ABI all exchange identical byte layouts --
//! there is no encoder between parse and eval.
//!
//! Stores are immutable once built. [`StoreBuilder`] appends children
//! before parents, so an offset can only ever point backwards at an
//! already-finalized unit: upward references (and therefore cycles)
//! are unrepresentable. "Mutation" is building a new store, grafting
//! subtrees out of existing ones.

use std::{fmt, sync::Arc};

use strum::{Display, FromRepr, IntoStaticStr};

use crate::intern::{SymbolId, SymbolTable};

/// Size in bytes of one unit record: tag, aux, 8-byte payload.
pub const UNIT_SIZE: usize = 10;

/// Tag byte of a unit, naming the variant it encodes.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, IntoStaticStr, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ValueTag {
    /// The unit type.
    None = 0,
    /// 64-bit signed integer.
    Integer = 1,
    /// 64-bit IEEE float.
    Real = 2,
    /// 32-bit code point.
    Rune = 3,
    /// Interned, unbound name.
    Symbol = 4,
    /// `"…"` -- the string type, a sequence of runes.
    DqList = 5,
    /// `(…)` -- an instruction: when evaluated, the head must be callable.
    ParenList = 6,
    /// `[…]` -- a block: evaluated in order, result is the last element.
    BracketList = 7,
    /// `{…}` -- a passthrough: inert data list.
    BraceList = 8,
    /// `'x` -- optional wrapper.
    Some = 9,
    /// `#(…)` -- suppresses immediate evaluation; the evaluator decides.
    Datum = 10,
    /// `@(…)` -- carried-value error (structured exception payload).
    Error = 11,
    /// Opaque handle; carries a lambda id when produced by `fn`.
    Aberrant = 12,
}

impl ValueTag {
    /// True for tags whose payload is a sequence block of unit offsets.
    #[must_use]
    pub fn is_list_shaped(self) -> bool {
        matches!(self, Self::ParenList | Self::BracketList | Self::BraceList | Self::Error)
    }

    /// True for the wrapper tags holding a single inner unit.
    #[must_use]
    pub fn is_wrapper(self) -> bool {
        matches!(self, Self::Some | Self::Datum)
    }
}

/// Aberrant kind bits carried in the unit's auxiliary byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum AberrantKind {
    /// Host-defined opaque handle.
    Opaque = 0,
    /// Closure produced by `fn`; the payload is its lambda id.
    Lambda = 1,
}

/// Error raised by store accessors on malformed offsets or tag
/// mismatches.
///
/// Stores produced by [`StoreBuilder`] never trip these; they guard
/// `from_data` views over foreign buffers and `as_*` calls made with
/// the wrong expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An `as_*` accessor was called on a unit of a different tag.
    TagMismatch { expected: &'static str, found: ValueTag },
    /// An offset or block extends past the end of the buffer.
    Truncated { offset: u32 },
    /// The tag byte at an offset is not a known `ValueTag`.
    UnknownTag { offset: u32, tag: u8 },
    /// A symbol id is not present in the value's symbol table.
    UnknownSymbol(SymbolId),
    /// A rune payload is not a valid Unicode scalar value.
    InvalidRune(u64),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            Self::Truncated { offset } => write!(f, "store truncated at offset {offset}"),
            Self::UnknownTag { offset, tag } => write!(f, "unknown tag {tag} at offset {offset}"),
            Self::UnknownSymbol(id) => write!(f, "symbol id {} not in table", id.raw()),
            Self::InvalidRune(raw) => write!(f, "invalid rune payload {raw}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// One decoded unit record.
#[derive(Debug, Clone, Copy)]
struct Unit {
    tag: ValueTag,
    aux: u8,
    payload: u64,
}

/// Immutable byte buffer holding one or more value units.
#[derive(Debug)]
pub struct Store {
    bytes: Vec<u8>,
}

impl Store {
    /// Wraps an existing buffer; used by `Value::from_data`.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { bytes })
    }

    /// Raw buffer access (kernel ABI hands this across the boundary).
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn read_u32(&self, at: u32) -> Result<u32, StoreError> {
        let at = at as usize;
        let slice = self
            .bytes
            .get(at..at + 4)
            .ok_or(StoreError::Truncated { offset: at as u32 })?;
        Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
    }

    fn unit(&self, offset: u32) -> Result<Unit, StoreError> {
        let at = offset as usize;
        let slice = self.bytes.get(at..at + UNIT_SIZE).ok_or(StoreError::Truncated { offset })?;
        let tag = ValueTag::from_repr(slice[0]).ok_or(StoreError::UnknownTag { offset, tag: slice[0] })?;
        let payload = u64::from_le_bytes(slice[2..10].try_into().expect("8-byte slice"));
        Ok(Unit { tag, aux: slice[1], payload })
    }

    /// Reads the `count` header of a sequence or rune block.
    fn block_count(&self, offset: u32) -> Result<u32, StoreError> {
        self.read_u32(offset)
    }

    /// Reads entry `index` of a sequence or rune block.
    fn block_entry(&self, offset: u32, index: u32) -> Result<u32, StoreError> {
        self.read_u32(offset + 4 + index * 4)
    }
}

/// Write-side of the store: appends units and blocks, children before
/// parents, then freezes into a [`Value`].
#[derive(Debug)]
pub struct StoreBuilder {
    bytes: Vec<u8>,
    symbols: Arc<SymbolTable>,
}

impl StoreBuilder {
    #[must_use]
    pub fn new(symbols: &Arc<SymbolTable>) -> Self {
        Self { bytes: Vec::new(), symbols: Arc::clone(symbols) }
    }

    fn push_unit(&mut self, tag: ValueTag, aux: u8, payload: u64) -> u32 {
        let offset = u32::try_from(self.bytes.len()).expect("store overflow");
        self.bytes.push(tag as u8);
        self.bytes.push(aux);
        self.bytes.extend_from_slice(&payload.to_le_bytes());
        offset
    }

    fn push_block(&mut self, entries: &[u32]) -> u32 {
        let offset = u32::try_from(self.bytes.len()).expect("store overflow");
        let count = u32::try_from(entries.len()).expect("block overflow");
        self.bytes.extend_from_slice(&count.to_le_bytes());
        for entry in entries {
            self.bytes.extend_from_slice(&entry.to_le_bytes());
        }
        offset
    }

    pub fn push_none(&mut self) -> u32 {
        self.push_unit(ValueTag::None, 0, 0)
    }

    pub fn push_int(&mut self, v: i64) -> u32 {
        self.push_unit(ValueTag::Integer, 0, v as u64)
    }

    pub fn push_real(&mut self, v: f64) -> u32 {
        self.push_unit(ValueTag::Real, 0, v.to_bits())
    }

    pub fn push_rune(&mut self, c: char) -> u32 {
        self.push_unit(ValueTag::Rune, 0, u64::from(u32::from(c)))
    }

    pub fn push_symbol(&mut self, name: &str) -> u32 {
        let id = self.symbols.intern(name);
        self.push_unit(ValueTag::Symbol, 0, u64::from(id.raw()))
    }

    pub fn push_symbol_id(&mut self, id: SymbolId) -> u32 {
        self.push_unit(ValueTag::Symbol, 0, u64::from(id.raw()))
    }

    /// Appends a string as a rune block plus a `DqList` unit.
    pub fn push_string(&mut self, s: &str) -> u32 {
        let runes: Vec<u32> = s.chars().map(u32::from).collect();
        self.push_runes(&runes)
    }

    pub fn push_runes(&mut self, runes: &[u32]) -> u32 {
        let block = self.push_block(runes);
        self.push_unit(ValueTag::DqList, 0, u64::from(block))
    }

    /// Appends a sequence block of already-pushed unit offsets plus the
    /// list unit itself.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is not list-shaped.
    pub fn push_list(&mut self, tag: ValueTag, items: &[u32]) -> u32 {
        assert!(tag.is_list_shaped(), "push_list on non-list tag {tag}");
        let block = self.push_block(items);
        self.push_unit(tag, 0, u64::from(block))
    }

    /// Wraps an already-pushed unit in a `Some`.
    pub fn push_some(&mut self, inner: u32) -> u32 {
        self.push_unit(ValueTag::Some, 0, u64::from(inner))
    }

    /// Wraps an already-pushed unit in a `Datum`.
    pub fn push_datum(&mut self, inner: u32) -> u32 {
        self.push_unit(ValueTag::Datum, 0, u64::from(inner))
    }

    pub fn push_aberrant(&mut self, kind: AberrantKind, id: u64) -> u32 {
        self.push_unit(ValueTag::Aberrant, kind as u8, id)
    }

    /// Deep-copies `value`'s subtree into this builder and returns the
    /// offset of the copied root.
    ///
    /// When `value` shares this builder's symbol table, symbol ids copy
    /// straight through; otherwise they are re-interned by name.
    pub fn graft(&mut self, value: &Value) -> Result<u32, StoreError> {
        let unit = value.store.unit(value.root)?;
        match unit.tag {
            ValueTag::None | ValueTag::Integer | ValueTag::Real | ValueTag::Rune | ValueTag::Aberrant => {
                Ok(self.push_unit(unit.tag, unit.aux, unit.payload))
            }
            ValueTag::Symbol => {
                if Arc::ptr_eq(&self.symbols, &value.symbols) {
                    Ok(self.push_unit(unit.tag, 0, unit.payload))
                } else {
                    let id = SymbolId::from_raw(unit.payload as u32);
                    let name = value.symbols.resolve(id).ok_or(StoreError::UnknownSymbol(id))?;
                    Ok(self.push_symbol(&name))
                }
            }
            ValueTag::DqList => {
                let block = unit.payload as u32;
                let count = value.store.block_count(block)?;
                let mut runes = Vec::with_capacity(count as usize);
                for i in 0..count {
                    runes.push(value.store.block_entry(block, i)?);
                }
                Ok(self.push_runes(&runes))
            }
            ValueTag::ParenList | ValueTag::BracketList | ValueTag::BraceList | ValueTag::Error => {
                let block = unit.payload as u32;
                let count = value.store.block_count(block)?;
                let mut items = Vec::with_capacity(count as usize);
                for i in 0..count {
                    let child = value.at_offset(value.store.block_entry(block, i)?);
                    items.push(self.graft(&child)?);
                }
                Ok(self.push_list(unit.tag, &items))
            }
            ValueTag::Some | ValueTag::Datum => {
                let inner = self.graft(&value.at_offset(unit.payload as u32))?;
                Ok(self.push_unit(unit.tag, 0, u64::from(inner)))
            }
        }
    }

    /// Freezes the buffer into an immutable value rooted at `root`.
    #[must_use]
    pub fn finish(self, root: u32) -> Value {
        Value {
            store: Store::from_bytes(self.bytes),
            symbols: self.symbols,
            root,
        }
    }
}

/// A runtime value: a shared store buffer, a shared symbol table, and
/// the offset of the root unit.
///
/// Cloning is cheap (two `Arc` bumps and a `u32`); list access hands
/// out sibling `Value`s over the same buffer at different roots.
#[derive(Debug, Clone)]
pub struct Value {
    store: Arc<Store>,
    symbols: Arc<SymbolTable>,
    root: u32,
}

impl Value {
    // --- construction primitives ---------------------------------------

    #[must_use]
    pub fn create_none(symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_none();
        b.finish(root)
    }

    #[must_use]
    pub fn create_int(v: i64, symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_int(v);
        b.finish(root)
    }

    #[must_use]
    pub fn create_real(v: f64, symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_real(v);
        b.finish(root)
    }

    #[must_use]
    pub fn create_rune(c: char, symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_rune(c);
        b.finish(root)
    }

    #[must_use]
    pub fn create_string(s: &str, symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_string(s);
        b.finish(root)
    }

    #[must_use]
    pub fn create_symbol(name: &str, symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_symbol(name);
        b.finish(root)
    }

    pub fn create_paren_list(items: &[Self], symbols: &Arc<SymbolTable>) -> Result<Self, StoreError> {
        Self::create_list(ValueTag::ParenList, items, symbols)
    }

    pub fn create_bracket_list(items: &[Self], symbols: &Arc<SymbolTable>) -> Result<Self, StoreError> {
        Self::create_list(ValueTag::BracketList, items, symbols)
    }

    pub fn create_brace_list(items: &[Self], symbols: &Arc<SymbolTable>) -> Result<Self, StoreError> {
        Self::create_list(ValueTag::BraceList, items, symbols)
    }

    pub fn create_error(items: &[Self], symbols: &Arc<SymbolTable>) -> Result<Self, StoreError> {
        Self::create_list(ValueTag::Error, items, symbols)
    }

    fn create_list(tag: ValueTag, items: &[Self], symbols: &Arc<SymbolTable>) -> Result<Self, StoreError> {
        let mut b = StoreBuilder::new(symbols);
        let mut offsets = Vec::with_capacity(items.len());
        for item in items {
            offsets.push(b.graft(item)?);
        }
        let root = b.push_list(tag, &offsets);
        Ok(b.finish(root))
    }

    pub fn create_some(inner: &Self) -> Result<Self, StoreError> {
        let mut b = StoreBuilder::new(&inner.symbols);
        let copied = b.graft(inner)?;
        let root = b.push_some(copied);
        Ok(b.finish(root))
    }

    pub fn create_datum(inner: &Self) -> Result<Self, StoreError> {
        let mut b = StoreBuilder::new(&inner.symbols);
        let copied = b.graft(inner)?;
        let root = b.push_datum(copied);
        Ok(b.finish(root))
    }

    #[must_use]
    pub fn create_aberrant(kind: AberrantKind, id: u64, symbols: &Arc<SymbolTable>) -> Self {
        let mut b = StoreBuilder::new(symbols);
        let root = b.push_aberrant(kind, id);
        b.finish(root)
    }

    /// Builds a view over an existing buffer at a given offset.
    ///
    /// The root unit is decoded eagerly so a bad offset fails here
    /// rather than on first access.
    pub fn from_data(store: Arc<Store>, symbols: Arc<SymbolTable>, offset: u32) -> Result<Self, StoreError> {
        store.unit(offset)?;
        Ok(Self { store, symbols, root: offset })
    }

    /// Sibling view over the same buffer at a different root.
    #[must_use]
    pub(crate) fn at_offset(&self, offset: u32) -> Self {
        Self {
            store: Arc::clone(&self.store),
            symbols: Arc::clone(&self.symbols),
            root: offset,
        }
    }

    // --- accessors ------------------------------------------------------

    /// The root unit's tag.
    ///
    /// # Panics
    ///
    /// Never panics for values built by [`StoreBuilder`] or validated by
    /// [`Value::from_data`]; both guarantee a decodable root unit.
    #[must_use]
    pub fn tag(&self) -> ValueTag {
        self.store.unit(self.root).map(|u| u.tag).expect("validated root unit")
    }

    pub fn as_int(&self) -> Result<i64, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Integer => Ok(unit.payload as i64),
            found => Err(StoreError::TagMismatch { expected: "integer", found }),
        }
    }

    pub fn as_real(&self) -> Result<f64, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Real => Ok(f64::from_bits(unit.payload)),
            found => Err(StoreError::TagMismatch { expected: "real", found }),
        }
    }

    pub fn as_rune(&self) -> Result<char, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Rune => {
                let raw = u32::try_from(unit.payload).map_err(|_| StoreError::InvalidRune(unit.payload))?;
                char::from_u32(raw).ok_or(StoreError::InvalidRune(unit.payload))
            }
            found => Err(StoreError::TagMismatch { expected: "rune", found }),
        }
    }

    pub fn as_symbol(&self) -> Result<SymbolId, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Symbol => Ok(SymbolId::from_raw(unit.payload as u32)),
            found => Err(StoreError::TagMismatch { expected: "symbol", found }),
        }
    }

    /// Resolves the symbol payload to its text.
    pub fn symbol_text(&self) -> Result<Arc<str>, StoreError> {
        let id = self.as_symbol()?;
        self.symbols.resolve(id).ok_or(StoreError::UnknownSymbol(id))
    }

    /// Decodes a `DqList` into an owned string.
    pub fn as_string(&self) -> Result<String, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::DqList => {
                let block = unit.payload as u32;
                let count = self.store.block_count(block)?;
                let mut out = String::with_capacity(count as usize);
                for i in 0..count {
                    let raw = self.store.block_entry(block, i)?;
                    out.push(char::from_u32(raw).ok_or(StoreError::InvalidRune(u64::from(raw)))?);
                }
                Ok(out)
            }
            found => Err(StoreError::TagMismatch { expected: "string", found }),
        }
    }

    /// Raw code points of a `DqList`.
    pub fn as_runes(&self) -> Result<Vec<u32>, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::DqList => {
                let block = unit.payload as u32;
                let count = self.store.block_count(block)?;
                let mut out = Vec::with_capacity(count as usize);
                for i in 0..count {
                    out.push(self.store.block_entry(block, i)?);
                }
                Ok(out)
            }
            found => Err(StoreError::TagMismatch { expected: "string", found }),
        }
    }

    /// View over a list-shaped unit's elements.
    pub fn as_list(&self) -> Result<ListView<'_>, StoreError> {
        let unit = self.store.unit(self.root)?;
        if !unit.tag.is_list_shaped() {
            return Err(StoreError::TagMismatch { expected: "list", found: unit.tag });
        }
        let block = unit.payload as u32;
        let count = self.store.block_count(block)?;
        Ok(ListView { value: self, block, count })
    }

    /// Inner value of a `Some` or `Datum` wrapper.
    pub fn unwrap_inner(&self) -> Result<Self, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Some | ValueTag::Datum => Ok(self.at_offset(unit.payload as u32)),
            found => Err(StoreError::TagMismatch { expected: "some or datum", found }),
        }
    }

    pub fn aberrant_kind(&self) -> Result<AberrantKind, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Aberrant => {
                AberrantKind::from_repr(unit.aux).ok_or(StoreError::UnknownTag { offset: self.root, tag: unit.aux })
            }
            found => Err(StoreError::TagMismatch { expected: "aberrant", found }),
        }
    }

    pub fn aberrant_id(&self) -> Result<u64, StoreError> {
        let unit = self.store.unit(self.root)?;
        match unit.tag {
            ValueTag::Aberrant => Ok(unit.payload),
            found => Err(StoreError::TagMismatch { expected: "aberrant", found }),
        }
    }

    #[must_use]
    pub fn get_data(&self) -> &Arc<Store> {
        &self.store
    }

    #[must_use]
    pub fn get_symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    #[must_use]
    pub fn get_root_offset(&self) -> u32 {
        self.root
    }

    // --- structural equality --------------------------------------------

    /// Structural equality with list shape as part of identity.
    ///
    /// Cross-type comparisons (including integer vs real) are unequal.
    /// Aberrants compare by id. Datum wrappers compare by their inner
    /// value after one level of unwrap.
    #[must_use]
    pub fn structural_eq(&self, other: &Self) -> bool {
        let a = self.peel_datum();
        let b = other.peel_datum();
        let (Ok(ua), Ok(ub)) = (a.store.unit(a.root), b.store.unit(b.root)) else {
            return false;
        };
        if ua.tag != ub.tag {
            return false;
        }
        match ua.tag {
            ValueTag::None => true,
            ValueTag::Integer | ValueTag::Real | ValueTag::Rune => ua.payload == ub.payload,
            ValueTag::Aberrant => ua.aux == ub.aux && ua.payload == ub.payload,
            ValueTag::Symbol => {
                if Arc::ptr_eq(&a.symbols, &b.symbols) {
                    ua.payload == ub.payload
                } else {
                    matches!((a.symbol_text(), b.symbol_text()), (Ok(x), Ok(y)) if x == y)
                }
            }
            ValueTag::DqList => matches!((a.as_runes(), b.as_runes()), (Ok(x), Ok(y)) if x == y),
            // Doubly-wrapped datums survive the single peel above and
            // compare one level further in, same as SOME.
            ValueTag::Some | ValueTag::Datum => match (a.unwrap_inner(), b.unwrap_inner()) {
                (Ok(x), Ok(y)) => x.structural_eq(&y),
                _ => false,
            },
            ValueTag::ParenList | ValueTag::BracketList | ValueTag::BraceList | ValueTag::Error => {
                let (Ok(la), Ok(lb)) = (a.as_list(), b.as_list()) else {
                    return false;
                };
                la.len() == lb.len()
                    && la
                        .iter()
                        .zip(lb.iter())
                        .all(|(x, y)| x.structural_eq(&y))
            }
        }
    }

    fn peel_datum(&self) -> Self {
        if self.tag() == ValueTag::Datum {
            if let Ok(inner) = self.unwrap_inner() {
                return inner;
            }
        }
        self.clone()
    }
}

/// Borrowed view over the elements of a list-shaped value.
#[derive(Debug)]
pub struct ListView<'a> {
    value: &'a Value,
    block: u32,
    count: u32,
}

impl ListView<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Element `index` as a sibling value, or `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        if index >= self.count as usize {
            return None;
        }
        let offset = self.value.store.block_entry(self.block, index as u32).ok()?;
        Some(self.value.at_offset(offset))
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            ValueTag::None => write!(f, "none"),
            ValueTag::Integer => write!(f, "{}", self.as_int().map_err(|_| fmt::Error)?),
            ValueTag::Real => {
                let v = self.as_real().map_err(|_| fmt::Error)?;
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            ValueTag::Rune => write!(f, "{}", self.as_rune().map_err(|_| fmt::Error)?),
            ValueTag::Symbol => write!(f, "{}", self.symbol_text().map_err(|_| fmt::Error)?),
            ValueTag::DqList => {
                let s = self.as_string().map_err(|_| fmt::Error)?;
                write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
            ValueTag::Some => write!(f, "'{}", self.unwrap_inner().map_err(|_| fmt::Error)?),
            ValueTag::Datum => write!(f, "#{}", self.unwrap_inner().map_err(|_| fmt::Error)?),
            ValueTag::Aberrant => {
                let id = self.aberrant_id().map_err(|_| fmt::Error)?;
                match self.aberrant_kind() {
                    Ok(AberrantKind::Lambda) => write!(f, "<fn {id}>"),
                    _ => write!(f, "<aberrant {id}>"),
                }
            }
            tag => {
                let (open, close) = match tag {
                    ValueTag::ParenList => ("(", ")"),
                    ValueTag::BracketList => ("[", "]"),
                    ValueTag::BraceList => ("{", "}"),
                    ValueTag::Error => ("@(", ")"),
                    _ => unreachable!("scalar tags handled above"),
                };
                let list = self.as_list().map_err(|_| fmt::Error)?;
                write!(f, "{open}")?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}
