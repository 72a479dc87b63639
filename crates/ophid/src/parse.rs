//! Text -> value store.
//!
//! The grammar is small: integer and real literals (optional sign),
//! double-quoted strings with `\"` and `\\` escapes, bare symbols,
//! `:name`/`:name..` type symbols (plain symbols to the parser; the
//! checker gives them meaning), quoted forms `'expr`, datums `#(…)`,
//! error values `@(…)`, and the three list shapes `(…)` `[…]` `{…}`.
//! Token boundaries are whitespace and the delimiter characters; the
//! longest token wins; a leading `-`/`+` immediately followed by a
//! digit belongs to a numeric literal, otherwise it starts a symbol.
//!
//! The output is the root value plus a span table mapping every unit
//! offset to its byte offset in the source, so later phases can render
//! `line:column` context for any node.

use std::{fmt, sync::Arc};

use ahash::AHashMap;

use crate::{
    intern::SymbolTable,
    store::{StoreBuilder, Value, ValueTag},
};

/// Structured parse failure with source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    /// Byte offset of the offending character.
    pub offset: usize,
    /// 1-based line.
    pub line: u32,
    /// 1-based column (in characters).
    pub column: u32,
}

impl ParseError {
    fn at(source: &str, offset: usize, message: impl Into<String>) -> Self {
        let (line, column) = line_col(source, offset);
        Self { message: message.into(), offset, line, column }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Computes the 1-based line and character column of a byte offset.
#[must_use]
pub fn line_col(source: &str, offset: usize) -> (u32, u32) {
    let clamped = offset.min(source.len());
    let mut line = 1u32;
    let mut col = 1u32;
    for (i, c) in source.char_indices() {
        if i >= clamped {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Unit offset -> source byte offset, for every node the parser built.
#[derive(Debug, Default, Clone)]
pub struct Spans {
    map: AHashMap<u32, u32>,
}

impl Spans {
    fn record(&mut self, unit: u32, byte: usize) {
        self.map.insert(unit, byte as u32);
    }

    /// Byte offset of the unit at `offset`, if the parser produced it.
    #[must_use]
    pub fn get(&self, unit: u32) -> Option<usize> {
        self.map.get(&unit).map(|b| *b as usize)
    }
}

/// Successful parse: the root value and the node span table.
///
/// A source text with exactly one top-level form parses to that form;
/// multiple forms are wrapped in a bracket block, matching how a file
/// evaluates (in order, result is the last element). Empty input
/// parses to an empty block.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub value: Value,
    pub spans: Spans,
}

/// Parses `source` into a new store sharing `symbols`.
pub fn parse(source: &str, symbols: &Arc<SymbolTable>) -> Result<Parsed, ParseError> {
    let mut parser = Parser {
        source,
        bytes: source.as_bytes(),
        pos: 0,
        builder: StoreBuilder::new(symbols),
        spans: Spans::default(),
    };
    let mut roots = Vec::new();
    loop {
        parser.skip_whitespace();
        if parser.at_end() {
            break;
        }
        roots.push(parser.expr()?);
    }
    let root = if roots.len() == 1 {
        roots[0]
    } else {
        let root = parser.builder.push_list(ValueTag::BracketList, &roots);
        parser.spans.record(root, 0);
        root
    };
    Ok(Parsed {
        value: parser.builder.finish(root),
        spans: parser.spans,
    })
}

struct Parser<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    builder: StoreBuilder,
    spans: Spans,
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'"' | b'\'')
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ParseError {
        ParseError::at(self.source, offset, message)
    }

    fn expr(&mut self) -> Result<u32, ParseError> {
        let start = self.pos;
        match self.peek().expect("caller checked at_end") {
            b'(' => self.group(ValueTag::ParenList, b')'),
            b'[' => self.group(ValueTag::BracketList, b']'),
            b'{' => self.group(ValueTag::BraceList, b'}'),
            b')' | b']' | b'}' => Err(self.error(start, "unmatched closing delimiter")),
            b'"' => self.string(),
            b'\'' => {
                self.pos += 1;
                self.skip_whitespace();
                if self.at_end() {
                    return Err(self.error(start, "quote at end of input"));
                }
                let inner = self.expr()?;
                let unit = self.builder.push_some(inner);
                self.spans.record(unit, start);
                Ok(unit)
            }
            b'#' if self.peek_at(1) == Some(b'(') => {
                self.pos += 1;
                let inner = self.group(ValueTag::ParenList, b')')?;
                let unit = self.builder.push_datum(inner);
                self.spans.record(unit, start);
                Ok(unit)
            }
            b'@' if self.peek_at(1) == Some(b'(') => {
                self.pos += 1;
                self.group(ValueTag::Error, b')')
            }
            _ => self.atom(),
        }
    }

    fn group(&mut self, tag: ValueTag, close: u8) -> Result<u32, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => {
                    return Err(self.error(start, format!("missing closing '{}'", close as char)));
                }
                Some(b) if b == close => {
                    self.pos += 1;
                    let unit = self.builder.push_list(tag, &items);
                    self.spans.record(unit, start);
                    return Ok(unit);
                }
                Some(_) => items.push(self.expr()?),
            }
        }
    }

    fn string(&mut self) -> Result<u32, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(start, "unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    let unit = self.builder.push_string(&out);
                    self.spans.record(unit, start);
                    return Ok(unit);
                }
                Some(b'\\') => {
                    let esc_at = self.pos;
                    self.pos += 1;
                    match self.peek() {
                        Some(b'"') => out.push('"'),
                        Some(b'\\') => out.push('\\'),
                        _ => return Err(self.error(esc_at, "invalid escape in string")),
                    }
                    self.pos += 1;
                }
                Some(_) => {
                    // Consume one full character, not one byte.
                    let rest = &self.source[self.pos..];
                    let c = rest.chars().next().expect("non-empty rest");
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn atom(&mut self) -> Result<u32, ParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() || is_delimiter(b) {
                break;
            }
            self.pos += 1;
        }
        let token = &self.source[start..self.pos];
        debug_assert!(!token.is_empty(), "atom called off whitespace");

        let unit = if let Some(v) = classify_int(token) {
            self.builder.push_int(v)
        } else if let Some(v) = classify_real(token) {
            self.builder.push_real(v)
        } else {
            self.builder.push_symbol(token)
        };
        self.spans.record(unit, start);
        Ok(unit)
    }
}

/// `[+-]?[0-9]+`, rejecting lone signs.
fn classify_int(token: &str) -> Option<i64> {
    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// `[+-]?[0-9]+.[0-9]+` exactly; anything else stays a symbol.
fn classify_real(token: &str) -> Option<f64> {
    let unsigned = token.strip_prefix(['+', '-']).unwrap_or(token);
    let (whole, frac) = unsigned.split_once('.')?;
    if whole.is_empty() || frac.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_one(src: &str) -> Value {
        parse(src, &SymbolTable::new()).unwrap().value
    }

    #[test]
    fn scalars() {
        assert_eq!(parse_one("42").as_int().unwrap(), 42);
        assert_eq!(parse_one("-42").as_int().unwrap(), -42);
        assert_eq!(parse_one("+7").as_int().unwrap(), 7);
        assert_eq!(parse_one("3.25").as_real().unwrap(), 3.25);
        assert_eq!(parse_one("-0.5").as_real().unwrap(), -0.5);
        assert_eq!(parse_one("\"hi\\\"there\\\\\"").as_string().unwrap(), "hi\"there\\");
    }

    #[test]
    fn sign_without_digit_is_a_symbol() {
        assert_eq!(parse_one("-").symbol_text().unwrap().as_ref(), "-");
        assert_eq!(parse_one("+x").symbol_text().unwrap().as_ref(), "+x");
        // Not a valid real literal, so the whole token stays symbolic.
        assert_eq!(parse_one("1.2.3").symbol_text().unwrap().as_ref(), "1.2.3");
    }

    #[test]
    fn type_symbols_stay_symbols() {
        assert_eq!(parse_one(":int").symbol_text().unwrap().as_ref(), ":int");
        assert_eq!(parse_one(":int..").symbol_text().unwrap().as_ref(), ":int..");
    }

    #[test]
    fn list_shapes() {
        let v = parse_one("(def x [1 2 {3 4}])");
        assert_eq!(v.tag(), ValueTag::ParenList);
        let items = v.as_list().unwrap();
        assert_eq!(items.get(0).unwrap().symbol_text().unwrap().as_ref(), "def");
        let block = items.get(2).unwrap();
        assert_eq!(block.tag(), ValueTag::BracketList);
        assert_eq!(block.as_list().unwrap().get(2).unwrap().tag(), ValueTag::BraceList);
    }

    #[test]
    fn wrappers() {
        let some = parse_one("'(1 2)");
        assert_eq!(some.tag(), ValueTag::Some);
        assert_eq!(some.unwrap_inner().unwrap().tag(), ValueTag::ParenList);

        let datum = parse_one("#(load \"math\")");
        assert_eq!(datum.tag(), ValueTag::Datum);
        let inner = datum.unwrap_inner().unwrap();
        assert_eq!(inner.as_list().unwrap().get(0).unwrap().symbol_text().unwrap().as_ref(), "load");

        let err = parse_one("@(\"boom\" 2)");
        assert_eq!(err.tag(), ValueTag::Error);
        assert_eq!(err.as_list().unwrap().get(0).unwrap().as_string().unwrap(), "boom");
    }

    #[test]
    fn hash_without_paren_is_symbolic() {
        assert_eq!(parse_one("#x").symbol_text().unwrap().as_ref(), "#x");
    }

    #[test]
    fn multiple_top_level_forms_become_a_block() {
        let v = parse_one("(def x 1) (def y 2)");
        assert_eq!(v.tag(), ValueTag::BracketList);
        assert_eq!(v.as_list().unwrap().len(), 2);
        // And empty input is an empty block.
        assert_eq!(parse_one("").tag(), ValueTag::BracketList);
        assert!(parse_one("   ").as_list().unwrap().is_empty());
    }

    #[test]
    fn errors_carry_position() {
        let err = parse("(def x\n  \"oops", &SymbolTable::new()).unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 3);
        assert!(err.message.contains("unterminated"));

        let err = parse("]", &SymbolTable::new()).unwrap_err();
        assert_eq!((err.line, err.column), (1, 1));

        let err = parse("(a b", &SymbolTable::new()).unwrap_err();
        assert!(err.message.contains("missing closing"));
    }

    #[test]
    fn spans_cover_every_node() {
        let parsed = parse("(def x 10)", &SymbolTable::new()).unwrap();
        let list = parsed.value.as_list().unwrap();
        assert_eq!(parsed.spans.get(parsed.value.get_root_offset()), Some(0));
        assert_eq!(parsed.spans.get(list.get(0).unwrap().get_root_offset()), Some(1));
        assert_eq!(parsed.spans.get(list.get(2).unwrap().get_root_offset()), Some(7));
    }

    #[test]
    fn render_parse_round_trip() {
        let src = "(def x [1 2.5 \"s\" {a b} '7 #(load \"k\")])";
        let v = parse_one(src);
        let reparsed = parse(&v.to_string(), &SymbolTable::new()).unwrap().value;
        assert!(v.structural_eq(&reparsed));
    }
}
