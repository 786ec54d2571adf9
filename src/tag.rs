//! Tag layer: the schema-annotation vocabulary attached to struct fields.
//!
//! A field tag like `"maxlen:4/opaque"` is a list of per-layer modifiers.
//! Parsing walks the field's type description one layer per `/`-separated
//! token and produces a packed [`TagSeq`]: a byte sequence whose value is a
//! stable equality key, usable directly as part of a codec-cache index.
//!
//! Each packed entry is a kind byte, optionally followed by big-endian
//! 32-bit values. The entry class lives in the top two bits of the kind:
//!
//! ```text
//! 0b00...  bare flag                      (1 byte)
//! 0b10...  flag with one value            (1 + 4 bytes)
//! 0b11...  flag with a counted value list (1 + 4 + 4n bytes)
//! ```
//!
//! Trailing `Noop` entries are always stripped, so two inputs describing
//! the same schema pack to identical bytes.

use std::fmt;

use crate::shape::{Kind, Shape};
use crate::{Error, Result};

/// Kinds of tag entry. Union-related entries always occupy position zero
/// of a sequence; `Skip`, when present, is the sole entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Leaves a layer unmodified. Required to skip a level of nesting.
    Noop = 0x00,
    /// The field takes no part in encoding or decoding.
    Skip = 0x01,
    /// The layer (an `Option`) uses the RFC 4506 optional form.
    Opt = 0x02,
    /// The byte layer is encoded densely, without per-element widening.
    Opaque = 0x03,
    /// The field is the discriminant of the enclosing union.
    UnionSwitch = 0x04,
    /// The field is the default arm of the enclosing union.
    UnionDefault = 0x05,
    /// Fixed length for a string layer.
    Len = 0x80,
    /// Maximum length for a string, sequence, or map layer.
    MaxLen = 0x81,
    /// The discriminant values selecting this union arm.
    UnionCases = 0xC0,
}

impl TagKind {
    fn from_byte(b: u8) -> TagKind {
        match b {
            0x00 => TagKind::Noop,
            0x01 => TagKind::Skip,
            0x02 => TagKind::Opt,
            0x03 => TagKind::Opaque,
            0x04 => TagKind::UnionSwitch,
            0x05 => TagKind::UnionDefault,
            0x80 => TagKind::Len,
            0x81 => TagKind::MaxLen,
            0xC0 => TagKind::UnionCases,
            other => unreachable!("corrupt tag sequence (kind byte {other:#04x})"),
        }
    }
}

/// An owned, packed tag sequence.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct TagSeq(Vec<u8>);

impl TagSeq {
    pub const fn new() -> TagSeq {
        TagSeq(Vec::new())
    }

    /// The sequence consisting of the sole `Skip` entry.
    pub fn skip() -> TagSeq {
        TagSeq(vec![TagKind::Skip as u8])
    }

    /// Borrowed view positioned at the first entry.
    pub fn as_tag(&self) -> Tag<'_> {
        Tag(&self.0)
    }

    /// The packed byte form; the cache-key equality witness.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Appends a bare entry.
    pub fn push(&mut self, kind: TagKind) {
        debug_assert!((kind as u8) < 0x80, "kind {kind:?} carries values");
        self.0.push(kind as u8);
    }

    /// Appends a single-value entry.
    pub fn push_value(&mut self, kind: TagKind, value: u32) {
        debug_assert!((0x80..0xC0).contains(&(kind as u8)));
        self.0.push(kind as u8);
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a multi-value entry.
    pub fn push_values(&mut self, kind: TagKind, values: &[u32]) {
        debug_assert!((kind as u8) >= 0xC0);
        self.0.push(kind as u8);
        self.0.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for v in values {
            self.0.extend_from_slice(&v.to_be_bytes());
        }
    }

    /// Strips trailing `Noop` entries in place.
    pub fn trim(&mut self) {
        let mark = self.as_tag().trimmed_len();
        self.0.truncate(mark);
    }
}

impl fmt::Debug for TagSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_tag(), f)
    }
}

/// A borrowed view into a packed tag sequence, positioned at one entry.
/// Advancing with [`next`](Tag::next) walks the layers.
#[derive(Clone, Copy)]
pub struct Tag<'a>(&'a [u8]);

impl<'a> Tag<'a> {
    /// The empty sequence: every layer unmodified.
    pub const EMPTY: Tag<'static> = Tag(&[]);

    pub fn is_empty(self) -> bool {
        self.0.is_empty()
    }

    /// The kind of the current entry; an exhausted view reads as `Noop`.
    pub fn kind(self) -> TagKind {
        if self.0.is_empty() {
            TagKind::Noop
        } else {
            TagKind::from_byte(self.0[0])
        }
    }

    pub fn bytes(self) -> &'a [u8] {
        self.0
    }

    fn val_at(self, offset: usize) -> u32 {
        let b = [
            self.0[offset],
            self.0[offset + 1],
            self.0[offset + 2],
            self.0[offset + 3],
        ];
        u32::from_be_bytes(b)
    }

    /// Packed length of the current entry.
    fn this_len(self) -> usize {
        match self.0.first() {
            None => 0,
            Some(&b) if b < 0x80 => 1,
            Some(&b) if b < 0xC0 => 5,
            Some(_) => 5 + self.val_at(1) as usize * 4,
        }
    }

    /// View advanced past the current entry.
    pub fn next(self) -> Tag<'a> {
        Tag(&self.0[self.this_len()..])
    }

    /// The value of a single-value entry.
    pub fn only_value(self) -> u32 {
        self.val_at(1)
    }

    /// The values of a multi-value entry.
    pub fn values(self) -> TagValues<'a> {
        TagValues {
            tag: self,
            index: 0,
            count: self.val_at(1),
        }
    }

    /// Length in bytes of this sequence with trailing `Noop`s stripped.
    fn trimmed_len(self) -> usize {
        let mut walked = 0;
        let mut mark = 0;
        let mut cursor = self;
        while !cursor.is_empty() {
            walked += cursor.this_len();
            if cursor.kind() != TagKind::Noop {
                mark = walked;
            }
            cursor = cursor.next();
        }
        mark
    }

    /// View with trailing `Noop` entries stripped.
    pub fn trimmed(self) -> Tag<'a> {
        Tag(&self.0[..self.trimmed_len()])
    }

    /// Owned copy of this view, with a leading entry prepended.
    pub fn prepend(self, kind: TagKind) -> TagSeq {
        let mut seq = TagSeq::new();
        seq.push(kind);
        seq.0.extend_from_slice(self.0);
        seq
    }
}

impl fmt::Debug for Tag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        let mut cursor = *self;
        let mut sep = "";
        while !cursor.is_empty() {
            write!(f, "{sep}{:?}", cursor.kind())?;
            match cursor.kind() {
                TagKind::Len | TagKind::MaxLen => write!(f, "({})", cursor.only_value())?,
                TagKind::UnionCases => {
                    let values: Vec<u32> = cursor.values().collect();
                    write!(f, "{values:?}")?;
                }
                _ => {}
            }
            sep = ";";
            cursor = cursor.next();
        }
        Ok(())
    }
}

/// Iterator over the values of a multi-value tag entry.
pub struct TagValues<'a> {
    tag: Tag<'a>,
    index: u32,
    count: u32,
}

impl Iterator for TagValues<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.index >= self.count {
            return None;
        }
        let v = self.tag.val_at(5 + self.index as usize * 4);
        self.index += 1;
        Some(v)
    }
}

/// Whether the parser is working inside a union declaration. Starts as
/// `Maybe` for a struct's first field and is pinned by the first
/// indicative tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnionCtx {
    Maybe,
    No,
    Yes,
}

fn bad_tag(shape: &Shape, detail: impl Into<String>) -> Error {
    Error::InvalidTagForType {
        ty: shape.name,
        detail: detail.into(),
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_u32_list(s: &str) -> Option<Vec<u32>> {
    s.split(',').map(parse_u32).collect()
}

fn switch_capable(shape: &Shape) -> bool {
    matches!(
        shape.kind,
        Kind::Bool | Kind::I8 | Kind::I16 | Kind::I32 | Kind::U8 | Kind::U16 | Kind::U32
    )
}

/// Parses a tag in isolation (outside any struct); `union:` tokens are
/// rejected here since there is no enclosing union.
pub fn parse(shape: &'static Shape, input: &str) -> Result<TagSeq> {
    let mut ctx = UnionCtx::No;
    parse_field(shape, input, &mut ctx)
}

/// Parses the tag of one struct field against the field's type description.
pub(crate) fn parse_field(
    shape: &'static Shape,
    input: &str,
    ctx: &mut UnionCtx,
) -> Result<TagSeq> {
    let input = input.trim();
    if input == "-" {
        return Ok(TagSeq::skip());
    }

    let mut seq = TagSeq::new();
    let parts: Vec<&str> = input.split('/').collect();
    let mut cursor = shape;
    let mut start = 0;

    // Union tokens come first in the packed form and bind to the enclosing
    // struct rather than a layer of this field's type, so the cursor does
    // not move here.
    if let Some(spec) = parts[0].strip_prefix("union:") {
        start = 1;
        match spec {
            "switch" => {
                if *ctx != UnionCtx::Maybe {
                    return Err(bad_tag(
                        shape,
                        "`union:switch` is only legal on the first field of a struct \
                         that is not already a union",
                    ));
                }
                if !switch_capable(cursor) {
                    return Err(bad_tag(shape, "type not legal for a union switch"));
                }
                *ctx = UnionCtx::Yes;
                seq.push(TagKind::UnionSwitch);
            }
            _ if *ctx != UnionCtx::Yes => {
                return Err(bad_tag(shape, format!("`union:{spec}` outside a union")));
            }
            "false" => seq.push_values(TagKind::UnionCases, &[0]),
            "true" => seq.push_values(TagKind::UnionCases, &[1]),
            "default" => seq.push(TagKind::UnionDefault),
            _ => match parse_u32_list(spec) {
                Some(values) => seq.push_values(TagKind::UnionCases, &values),
                None => {
                    return Err(bad_tag(shape, format!("bad `union:` values '{spec}'")));
                }
            },
        }
    } else if *ctx == UnionCtx::Yes {
        return Err(bad_tag(
            shape,
            "every field inside a union must carry a `union:` tag",
        ));
    } else {
        *ctx = UnionCtx::No;
    }

    for i in start..parts.len() {
        let part = parts[i].trim();
        match part {
            "" => seq.push(TagKind::Noop),

            "opt" => {
                if !matches!(cursor.kind, Kind::Opt { .. }) {
                    return Err(bad_tag(cursor, "'opt' requires an Option layer"));
                }
                seq.push(TagKind::Opt);
            }

            "opaque" => {
                // 'opaque' directly on a byte container is shorthand for
                // '/opaque': record a noop for the container layer and
                // apply it to the element.
                match cursor.kind {
                    Kind::Array { elem, .. } | Kind::Seq { elem, .. } => {
                        seq.push(TagKind::Noop);
                        cursor = elem();
                    }
                    _ => {}
                }
                match cursor.kind {
                    Kind::U8 => seq.push(TagKind::Opaque),
                    _ => {
                        return Err(bad_tag(cursor, "'opaque' applies only to bytes"));
                    }
                }
            }

            _ if part.starts_with("len:") => {
                let value = parse_u32(&part[4..])
                    .ok_or_else(|| bad_tag(cursor, format!("bad `len:` value in '{part}'")))?;
                match cursor.kind {
                    Kind::Array { .. } => {
                        return Err(bad_tag(
                            cursor,
                            "`len:` cannot apply to a fixed-size array; the length is \
                             already part of the type",
                        ));
                    }
                    Kind::Str { .. } | Kind::Seq { .. } => seq.push_value(TagKind::Len, value),
                    _ => {
                        return Err(bad_tag(
                            cursor,
                            "`len:` applies only to strings and sequences",
                        ));
                    }
                }
            }

            _ if part.starts_with("maxlen:") => {
                let value = parse_u32(&part[7..])
                    .ok_or_else(|| bad_tag(cursor, format!("bad `maxlen:` value in '{part}'")))?;
                match cursor.kind {
                    Kind::Str { .. } | Kind::Seq { .. } | Kind::Map { .. } => {
                        seq.push_value(TagKind::MaxLen, value)
                    }
                    _ => {
                        return Err(bad_tag(
                            cursor,
                            "`maxlen:` applies only to strings, sequences, and maps",
                        ));
                    }
                }
            }

            _ => return Err(bad_tag(cursor, format!("unknown tag '{part}'"))),
        }

        // Descend one layer for the next token.
        if i + 1 != parts.len() {
            cursor = match cursor.kind {
                Kind::Array { elem, .. } | Kind::Seq { elem, .. } => elem(),
                Kind::Map { value, .. } => value(),
                Kind::Opt { inner, .. } | Kind::Ptr { inner, .. } => inner(),
                _ => {
                    return Err(bad_tag(
                        cursor,
                        format!("trailing tags ({:?}) after an indivisible type", &parts[i + 1..]),
                    ));
                }
            };
        }
    }

    seq.trim();
    Ok(seq)
}
