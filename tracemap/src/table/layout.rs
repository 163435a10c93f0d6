//! Key/leaf byte layouts and their text form
//!
//! BPF compilers describe the C type behind each map key and leaf with a small
//! JSON descriptor:
//!
//! ```text
//! "unsigned int"
//! ["key_t", [["pid", "unsigned int"], ["comm", "char", [16]]], "struct"]
//! ```
//!
//! A [`Layout`] built from such a descriptor renders bytes as text and scans
//! text back into bytes. Integers print as `0x` hex, structs as `{ a b }`,
//! arrays as `[ a b ]` and `char` arrays as quoted strings. Compilers insert
//! explicit padding fields, so struct members are laid out back to back.
//!
//! Tables without a descriptor use [`RawHex`].

use std::fmt::Write as _;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("expected {expected} bytes, got {actual}")]
    Size { expected: usize, actual: usize },

    #[error("unsupported type {0:?}")]
    UnknownType(String),

    #[error("malformed descriptor: {0}")]
    Descriptor(String),

    #[error("{reason} at byte {pos}")]
    Syntax { reason: String, pos: usize },

    #[error("value {value} does not fit in {size} byte(s)")]
    OutOfRange { value: String, size: usize },
}

/// Renders and scans one side (key or leaf) of a table entry
pub trait FieldFormatter: Send + Sync {
    /// Render `bytes` as text
    ///
    /// # Errors
    /// Returns an error if `bytes` does not match the expected layout
    fn format(&self, bytes: &[u8]) -> Result<String, LayoutError>;

    /// Scan `text` back into bytes
    ///
    /// # Errors
    /// Returns an error on malformed input or out-of-range values
    fn parse(&self, text: &str) -> Result<Vec<u8>, LayoutError>;

    /// The descriptor this formatter was built from, if any
    fn descriptor(&self) -> Option<&str> {
        None
    }
}

/// Fallback formatter: space separated hex bytes (`01 00 00 00`)
#[derive(Debug, Clone, Copy, Default)]
pub struct RawHex;

impl FieldFormatter for RawHex {
    fn format(&self, bytes: &[u8]) -> Result<String, LayoutError> {
        let mut out = String::with_capacity(bytes.len() * 3);
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{b:02x}");
        }
        Ok(out)
    }

    fn parse(&self, text: &str) -> Result<Vec<u8>, LayoutError> {
        let digits: String = text.split_whitespace().collect();
        let digits = digits.strip_prefix("0x").unwrap_or(&digits);
        if !digits.is_ascii() || digits.len() % 2 != 0 {
            return Err(LayoutError::Syntax {
                reason: "expected an even number of hex digits".to_string(),
                pos: text.len(),
            });
        }
        (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16).map_err(|e| LayoutError::Syntax {
                    reason: e.to_string(),
                    pos: i,
                })
            })
            .collect()
    }
}

/// Key and leaf descriptors for one table, as stored in a layout file
#[derive(Debug, Clone, Deserialize)]
pub struct LayoutSpec {
    pub key: Value,
    pub leaf: Value,
}

impl LayoutSpec {
    /// Build the key and leaf layouts
    ///
    /// # Errors
    /// Returns an error if either descriptor is malformed
    pub fn build(&self) -> Result<(Layout, Layout), LayoutError> {
        Ok((Layout::from_value(&self.key)?, Layout::from_value(&self.leaf)?))
    }
}

/// A C type layout together with the descriptor it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    source: String,
    root: TypeNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TypeNode {
    Int { size: usize, signed: bool },
    Char,
    Array { elem: Box<TypeNode>, len: usize },
    Struct { fields: Vec<TypeNode>, union: bool },
}

impl Layout {
    /// Parse a descriptor string (JSON, or a bare C scalar type name)
    ///
    /// # Errors
    /// Returns an error for malformed JSON or unsupported types
    pub fn from_descriptor(text: &str) -> Result<Self, LayoutError> {
        let trimmed = text.trim();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Self::from_value(&value),
            Err(e) if trimmed.starts_with('[') || trimmed.starts_with('"') => {
                Err(LayoutError::Descriptor(e.to_string()))
            }
            Err(_) => Ok(Self { source: trimmed.to_string(), root: scalar(trimmed)? }),
        }
    }

    /// Build a layout from an already parsed descriptor
    ///
    /// # Errors
    /// Returns an error for malformed descriptors or unsupported types
    pub fn from_value(value: &Value) -> Result<Self, LayoutError> {
        let source = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(Self { source, root: node_from_value(value)? })
    }

    /// Size in bytes of a value with this layout
    #[must_use]
    pub fn size(&self) -> usize {
        self.root.size()
    }
}

impl FieldFormatter for Layout {
    fn format(&self, bytes: &[u8]) -> Result<String, LayoutError> {
        let expected = self.size();
        if bytes.len() != expected {
            return Err(LayoutError::Size { expected, actual: bytes.len() });
        }
        let mut out = String::with_capacity(bytes.len() * 8);
        self.root.format_into(bytes, &mut out);
        Ok(out)
    }

    fn parse(&self, text: &str) -> Result<Vec<u8>, LayoutError> {
        let mut tokens = Tokens { src: text, pos: 0 };
        let mut out = Vec::with_capacity(self.size());
        self.root.parse_from(&mut tokens, &mut out)?;
        if let Some(extra) = tokens.next_token()? {
            return Err(LayoutError::Syntax {
                reason: format!("unexpected trailing {extra:?}"),
                pos: tokens.pos,
            });
        }
        Ok(out)
    }

    fn descriptor(&self) -> Option<&str> {
        Some(&self.source)
    }
}

fn node_from_value(value: &Value) -> Result<TypeNode, LayoutError> {
    match value {
        Value::String(name) => scalar(name),
        Value::Array(items) => struct_from(items),
        other => Err(LayoutError::Descriptor(format!("unexpected {other}"))),
    }
}

fn struct_from(items: &[Value]) -> Result<TypeNode, LayoutError> {
    let fields = items
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| LayoutError::Descriptor("struct without field list".to_string()))?;
    let union = match items.get(2).and_then(Value::as_str).unwrap_or("struct") {
        "struct" | "struct_packed" => false,
        "union" => true,
        other => return Err(LayoutError::Descriptor(format!("unknown aggregate kind {other}"))),
    };

    let fields = fields.iter().map(field_from).collect::<Result<Vec<_>, _>>()?;
    if !union {
        fields
            .iter()
            .try_fold(0usize, |total, f| total.checked_add(f.size()))
            .ok_or_else(|| LayoutError::Descriptor("struct size overflows".to_string()))?;
    }
    Ok(TypeNode::Struct { fields, union })
}

fn field_from(field: &Value) -> Result<TypeNode, LayoutError> {
    let parts = field
        .as_array()
        .filter(|p| p.len() >= 2)
        .ok_or_else(|| LayoutError::Descriptor(format!("bad field {field}")))?;
    let mut node = node_from_value(&parts[1])?;

    match parts.get(2) {
        None => {}
        Some(Value::Array(dims)) => {
            for dim in dims.iter().rev() {
                let len = dim
                    .as_u64()
                    .and_then(|d| usize::try_from(d).ok())
                    .ok_or_else(|| LayoutError::Descriptor(format!("bad array length {dim}")))?;
                if node.size().checked_mul(len).is_none() {
                    return Err(LayoutError::Descriptor(format!("array of {len} elements overflows")));
                }
                node = TypeNode::Array { elem: Box::new(node), len };
            }
        }
        Some(other) => {
            return Err(LayoutError::Descriptor(format!("bitfield {other} not supported")));
        }
    }
    Ok(node)
}

fn scalar(name: &str) -> Result<TypeNode, LayoutError> {
    let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.ends_with('*') {
        return Ok(TypeNode::Int { size: 8, signed: false });
    }
    let (size, signed) = match normalized.as_str() {
        "char" => return Ok(TypeNode::Char),
        "signed char" | "s8" | "__s8" | "int8_t" => (1, true),
        "unsigned char" | "_Bool" | "bool" | "u8" | "__u8" | "uint8_t" => (1, false),
        "short" | "short int" | "s16" | "__s16" | "int16_t" => (2, true),
        "unsigned short" | "unsigned short int" | "u16" | "__u16" | "uint16_t" => (2, false),
        "int" | "s32" | "__s32" | "int32_t" | "pid_t" => (4, true),
        "unsigned int" | "unsigned" | "u32" | "__u32" | "uint32_t" => (4, false),
        "long" | "long int" | "long long" | "long long int" | "s64" | "__s64" | "int64_t" => {
            (8, true)
        }
        "unsigned long" | "unsigned long int" | "unsigned long long"
        | "unsigned long long int" | "u64" | "__u64" | "uint64_t" | "size_t" | "uintptr_t" => {
            (8, false)
        }
        "__int128" => (16, true),
        "unsigned __int128" => (16, false),
        _ => return Err(LayoutError::UnknownType(name.to_string())),
    };
    Ok(TypeNode::Int { size, signed })
}

impl TypeNode {
    /// Cannot overflow: construction rejects layouts whose size does not
    /// fit in `usize`
    fn size(&self) -> usize {
        match self {
            Self::Int { size, .. } => *size,
            Self::Char => 1,
            Self::Array { elem, len } => elem.size() * len,
            Self::Struct { fields, union: false } => fields.iter().map(TypeNode::size).sum(),
            Self::Struct { fields, union: true } => {
                fields.iter().map(TypeNode::size).max().unwrap_or(0)
            }
        }
    }

    /// `bytes.len()` is always `self.size()`
    fn format_into(&self, bytes: &[u8], out: &mut String) {
        match self {
            Self::Int { signed, .. } => format_int(bytes, *signed, out),
            Self::Char => format_int(bytes, false, out),
            Self::Array { elem, .. } if **elem == Self::Char => format_c_string(bytes, out),
            Self::Array { elem, len } => {
                let step = elem.size();
                out.push('[');
                for i in 0..*len {
                    out.push(' ');
                    elem.format_into(&bytes[i * step..(i + 1) * step], out);
                }
                out.push_str(" ]");
            }
            Self::Struct { fields, union } => {
                let mut offset = 0;
                out.push('{');
                for field in fields {
                    let size = field.size();
                    out.push(' ');
                    field.format_into(&bytes[offset..offset + size], out);
                    if !union {
                        offset += size;
                    }
                }
                out.push_str(" }");
            }
        }
    }

    fn parse_from(&self, tokens: &mut Tokens<'_>, out: &mut Vec<u8>) -> Result<(), LayoutError> {
        match self {
            Self::Int { size, signed } => {
                let word = tokens.expect_word()?;
                out.extend(parse_int(&word, *size, *signed)?);
            }
            Self::Char => {
                let word = tokens.expect_word()?;
                out.extend(parse_int(&word, 1, false)?);
            }
            Self::Array { elem, len } if **elem == Self::Char => {
                let pos = tokens.pos;
                let mut text = tokens.expect_string()?;
                if text.len() > *len {
                    return Err(LayoutError::Syntax {
                        reason: format!("string longer than {len} bytes"),
                        pos,
                    });
                }
                text.resize(*len, 0);
                out.extend(text);
            }
            Self::Array { elem, len } => {
                tokens.expect_open('[')?;
                for _ in 0..*len {
                    elem.parse_from(tokens, out)?;
                }
                tokens.expect_close(']')?;
            }
            Self::Struct { fields, union: false } => {
                tokens.expect_open('{')?;
                for field in fields {
                    field.parse_from(tokens, out)?;
                }
                tokens.expect_close('}')?;
            }
            Self::Struct { fields, union: true } => {
                let mut slot = vec![0u8; self.size()];
                tokens.expect_open('{')?;
                for field in fields {
                    let mut member = Vec::with_capacity(field.size());
                    field.parse_from(tokens, &mut member)?;
                    slot[..member.len()].copy_from_slice(&member);
                }
                tokens.expect_close('}')?;
                out.extend(slot);
            }
        }
        Ok(())
    }
}

fn read_uint(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    if cfg!(target_endian = "little") {
        buf[..bytes.len()].copy_from_slice(bytes);
        u128::from_le_bytes(buf)
    } else {
        buf[16 - bytes.len()..].copy_from_slice(bytes);
        u128::from_be_bytes(buf)
    }
}

fn write_uint(value: u128, size: usize) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        value.to_le_bytes()[..size].to_vec()
    } else {
        value.to_be_bytes()[16 - size..].to_vec()
    }
}

fn format_int(bytes: &[u8], signed: bool, out: &mut String) {
    let value = read_uint(bytes);
    let bits = bytes.len() * 8;
    let sign_bit = 1u128 << (bits - 1);
    if signed && value & sign_bit != 0 {
        let magnitude = if bits == 128 { value.wrapping_neg() } else { (1u128 << bits) - value };
        let _ = write!(out, "-0x{magnitude:x}");
    } else {
        let _ = write!(out, "0x{value:x}");
    }
}

fn parse_int(word: &str, size: usize, signed: bool) -> Result<Vec<u8>, LayoutError> {
    let out_of_range = || LayoutError::OutOfRange { value: word.to_string(), size };
    let (negative, digits) = match word.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, word),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u128::from_str_radix(hex, 16),
        None => digits.parse::<u128>(),
    }
    .map_err(|e| LayoutError::Syntax { reason: format!("bad integer {word:?}: {e}"), pos: 0 })?;

    let bits = size * 8;
    let unsigned_max = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    let value = if negative {
        if !signed || magnitude > 1u128 << (bits - 1) {
            return Err(out_of_range());
        }
        if magnitude == 0 {
            0
        } else if bits == 128 {
            magnitude.wrapping_neg()
        } else {
            (1u128 << bits) - magnitude
        }
    } else {
        if magnitude > unsigned_max {
            return Err(out_of_range());
        }
        magnitude
    };
    Ok(write_uint(value, size))
}

fn format_c_string(bytes: &[u8], out: &mut String) {
    out.push('"');
    for &b in bytes.iter().take_while(|&&b| b != 0) {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push('"');
}

#[derive(Debug)]
enum Token {
    Open(char),
    Close(char),
    Str(Vec<u8>),
    Word(String),
}

struct Tokens<'a> {
    src: &'a str,
    pos: usize,
}

impl Tokens<'_> {
    fn syntax(&self, reason: impl Into<String>) -> LayoutError {
        LayoutError::Syntax { reason: reason.into(), pos: self.pos }
    }

    fn next_token(&mut self) -> Result<Option<Token>, LayoutError> {
        let src = self.src;
        let rest = &src[self.pos..];
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();

        let Some(c) = trimmed.chars().next() else {
            return Ok(None);
        };
        match c {
            '{' | '[' => {
                self.pos += 1;
                Ok(Some(Token::Open(c)))
            }
            '}' | ']' => {
                self.pos += 1;
                Ok(Some(Token::Close(c)))
            }
            '"' => self.string().map(|s| Some(Token::Str(s))),
            _ => {
                let len = trimmed
                    .find(|c: char| c.is_whitespace() || "{}[]\"".contains(c))
                    .unwrap_or(trimmed.len());
                self.pos += len;
                Ok(Some(Token::Word(trimmed[..len].to_string())))
            }
        }
    }

    fn string(&mut self) -> Result<Vec<u8>, LayoutError> {
        let src = self.src;
        let bytes = src.as_bytes();
        let mut out = Vec::new();
        let mut i = self.pos + 1;
        while i < bytes.len() {
            match bytes[i] {
                b'"' => {
                    self.pos = i + 1;
                    return Ok(out);
                }
                b'\\' => {
                    let escaped = bytes.get(i + 1).copied();
                    match escaped {
                        Some(b'x') => {
                            let hex =
                                src.get(i + 2..i + 4).ok_or_else(|| self.syntax("short \\x escape"))?;
                            let b = u8::from_str_radix(hex, 16)
                                .map_err(|e| self.syntax(format!("bad \\x escape: {e}")))?;
                            out.push(b);
                            i += 4;
                            continue;
                        }
                        Some(b'n') => out.push(b'\n'),
                        Some(b't') => out.push(b'\t'),
                        Some(b'0') => out.push(0),
                        Some(c @ (b'"' | b'\\')) => out.push(c),
                        _ => return Err(self.syntax("unknown escape")),
                    }
                    i += 2;
                }
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }
        Err(self.syntax("unterminated string"))
    }

    fn expect_word(&mut self) -> Result<String, LayoutError> {
        match self.next_token()? {
            Some(Token::Word(w)) => Ok(w),
            other => Err(self.syntax(format!("expected a number, found {other:?}"))),
        }
    }

    fn expect_string(&mut self) -> Result<Vec<u8>, LayoutError> {
        match self.next_token()? {
            Some(Token::Str(s)) => Ok(s),
            other => Err(self.syntax(format!("expected a string, found {other:?}"))),
        }
    }

    fn expect_open(&mut self, open: char) -> Result<(), LayoutError> {
        match self.next_token()? {
            Some(Token::Open(c)) if c == open => Ok(()),
            other => Err(self.syntax(format!("expected '{open}', found {other:?}"))),
        }
    }

    fn expect_close(&mut self, close: char) -> Result<(), LayoutError> {
        match self.next_token()? {
            Some(Token::Close(c)) if c == close => Ok(()),
            other => Err(self.syntax(format!("expected '{close}', found {other:?}"))),
        }
    }
}
