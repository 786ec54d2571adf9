//! The codec tree: one immutable encode/decode plan per `(type, tag)` pair.
//!
//! Codecs are composed bottom-up by the builders in this module, driven by
//! a type's [`Shape`](crate::shape::Shape) and the current layer of its tag
//! sequence. Once published by the registry they are shared, re-entrant,
//! and free of locks on the execution path; the only blocking codec is the
//! [`DeferredCodec`] placeholder used while a recursive or contended
//! construction is still in flight.

use std::any::Any;
use std::sync::{Arc, OnceLock};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};

use crate::registry::Registry;
use crate::shape::{
    expect_mut, expect_ref, ArrayVtable, Complex32Vtable, Complex64Vtable, CustomVtable, FieldDef,
    Kind, MapVtable, OptVtable, PtrVtable, SeqVtable, Shape, ShapeFn, StrVtable,
};
use crate::tag::{self, Tag, TagKind, UnionCtx};
use crate::wire::{WireRead, WireWrite};
use crate::{Error, Result};

/// A paired encoder/decoder for one `(type, tag)` combination.
///
/// The erased value must be the concrete type the codec was built for;
/// handing a codec a value of any other type is a programming error and
/// panics. [`Writer::encode`](crate::Writer::encode) and
/// [`Reader::decode`](crate::Reader::decode) are statically matched and
/// cannot misfire.
pub trait Codec: Send + Sync {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()>;
    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()>;
}

/// Largest byte or element count addressable on this host. Schema maxima
/// above it are clamped for encoding; received lengths beyond it decode to
/// `LengthExceedsPlatformLimit`.
pub(crate) const PLATFORM_MAX: u64 = isize::MAX as u64;

fn clamp_len(schema_max: u32) -> usize {
    (schema_max as u64).min(PLATFORM_MAX) as usize
}

/// Length error against the schema maximum: over-max wins, otherwise the
/// value only overflows this platform.
fn len_err(actual: u64, schema_max: u32) -> Error {
    if actual > schema_max as u64 {
        Error::LengthExceedsMax {
            actual,
            max: schema_max as u64,
        }
    } else {
        Error::LengthExceedsPlatformLimit { actual }
    }
}

/// Rewrites a wire-layer length error (checked against the clamped limit)
/// in terms of the schema maximum.
fn remap_len_err(err: Error, schema_max: u32) -> Error {
    match err {
        Error::LengthExceedsMax { actual, .. } => len_err(actual, schema_max),
        other => other,
    }
}

fn invalid_tag(shape: &Shape, detail: impl Into<String>) -> Error {
    Error::InvalidTagForType {
        ty: shape.name,
        detail: detail.into(),
    }
}

fn error_codec(err: Error) -> Arc<dyn Codec> {
    Arc::new(ErrorCodec(err))
}

// --- primitives ---

struct BoolCodec;

impl Codec for BoolCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        w.emit_bool(*expect_ref::<bool>(value))
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        *expect_mut::<bool>(value) = r.take_bool()?;
        Ok(())
    }
}

/// Integer codecs: narrower types widen to the 4- or 8-byte wire word on
/// encode and truncate back on decode.
macro_rules! int_codec {
    ($codec:ident, $ty:ty, $emit:ident, $take:ident, $wire:ty) => {
        struct $codec;

        impl Codec for $codec {
            fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
                w.$emit(*expect_ref::<$ty>(value) as $wire)
            }

            fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
                *expect_mut::<$ty>(value) = r.$take()? as $ty;
                Ok(())
            }
        }
    };
}

int_codec!(I8Codec, i8, emit_i32, take_i32, i32);
int_codec!(I16Codec, i16, emit_i32, take_i32, i32);
int_codec!(I32Codec, i32, emit_i32, take_i32, i32);
int_codec!(U8Codec, u8, emit_u32, take_u32, u32);
int_codec!(U16Codec, u16, emit_u32, take_u32, u32);
int_codec!(U32Codec, u32, emit_u32, take_u32, u32);
int_codec!(HyperCodec, i64, emit_i64, take_i64, i64);
int_codec!(UhyperCodec, u64, emit_u64, take_u64, u64);

struct FloatCodec;

impl Codec for FloatCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        w.emit_f32(*expect_ref::<f32>(value))
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        *expect_mut::<f32>(value) = r.take_f32()?;
        Ok(())
    }
}

struct DoubleCodec;

impl Codec for DoubleCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        w.emit_f64(*expect_ref::<f64>(value))
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        *expect_mut::<f64>(value) = r.take_f64()?;
        Ok(())
    }
}

struct Complex32Codec {
    vt: Complex32Vtable,
}

impl Codec for Complex32Codec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let (re, im) = (self.vt.get)(value);
        w.emit_f32(re)?;
        w.emit_f32(im)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let re = r.take_f32()?;
        let im = r.take_f32()?;
        (self.vt.set)(value, re, im);
        Ok(())
    }
}

struct Complex64Codec {
    vt: Complex64Vtable,
}

impl Codec for Complex64Codec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let (re, im) = (self.vt.get)(value);
        w.emit_f64(re)?;
        w.emit_f64(im)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let re = r.take_f64()?;
        let im = r.take_f64()?;
        (self.vt.set)(value, re, im);
        Ok(())
    }
}

// --- strings ---

struct FixedStringCodec {
    len: usize,
    vt: StrVtable,
}

impl Codec for FixedStringCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let s = (self.vt.get)(value);
        if s.len() != self.len {
            return Err(Error::LengthIncorrect);
        }
        w.emit_fixed_string(s)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let s = r.take_fixed_string(self.len)?;
        (self.vt.set)(value, s);
        Ok(())
    }
}

struct VarStringCodec {
    limit: usize,
    schema_max: u32,
    vt: StrVtable,
}

impl Codec for VarStringCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let s = (self.vt.get)(value);
        if s.len() > self.limit {
            return Err(len_err(s.len() as u64, self.schema_max));
        }
        w.emit_string(s)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let s = r
            .take_string(self.limit)
            .map_err(|e| remap_len_err(e, self.schema_max))?;
        (self.vt.set)(value, s);
        Ok(())
    }
}

fn build_string_codec(shape: &'static Shape, t: Tag<'_>, vt: StrVtable) -> Arc<dyn Codec> {
    if !t.next().is_empty() {
        return error_codec(invalid_tag(shape, "trailing tags after a string layer"));
    }

    match t.kind() {
        TagKind::Len => {
            let len = t.only_value();
            if len as u64 > PLATFORM_MAX {
                // A fixed length beyond the platform can never round-trip;
                // clamping it would change the wire format.
                return error_codec(Error::LengthExceedsPlatformLimit { actual: len as u64 });
            }
            Arc::new(FixedStringCodec {
                len: len as usize,
                vt,
            })
        }
        TagKind::MaxLen => {
            let schema_max = t.only_value();
            Arc::new(VarStringCodec {
                limit: clamp_len(schema_max),
                schema_max,
                vt,
            })
        }
        TagKind::Noop => Arc::new(VarStringCodec {
            limit: clamp_len(u32::MAX),
            schema_max: u32::MAX,
            vt,
        }),
        _ => error_codec(invalid_tag(shape, "tag not applicable to a string")),
    }
}

// --- arrays and sequences ---

struct OpaqueArrayCodec {
    vt: ArrayVtable,
}

impl Codec for OpaqueArrayCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        match (self.vt.bytes)(value) {
            Some(bytes) => w.emit_fixed_opaque(bytes),
            None => Err(Error::InvalidType("opaque array of non-byte elements")),
        }
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        match (self.vt.bytes_mut)(value) {
            Some(bytes) => r.take_fixed_opaque(bytes),
            None => Err(Error::NotPointer),
        }
    }
}

struct ArrayCodec {
    len: usize,
    elem: Arc<dyn Codec>,
    vt: ArrayVtable,
}

impl Codec for ArrayCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        for i in 0..self.len {
            self.elem.encode(w, (self.vt.get)(value, i))?;
        }
        Ok(())
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        for i in 0..self.len {
            self.elem.decode(r, (self.vt.get_mut)(value, i))?;
        }
        Ok(())
    }
}

fn build_array_codec(
    registry: &Registry,
    shape: &'static Shape,
    t: Tag<'_>,
    elem: ShapeFn,
    vt: ArrayVtable,
) -> Arc<dyn Codec> {
    if t.kind() != TagKind::Noop {
        return error_codec(invalid_tag(shape, "tag not applicable to a fixed array"));
    }
    let len = match shape.kind {
        Kind::Array { len, .. } => len,
        _ => return error_codec(Error::InvalidType(shape.name)),
    };
    if t.next().kind() == TagKind::Opaque {
        Arc::new(OpaqueArrayCodec { vt })
    } else {
        Arc::new(ArrayCodec {
            len,
            elem: registry.codec_for_shape(elem(), t.next()),
            vt,
        })
    }
}

struct OpaqueSeqCodec {
    limit: usize,
    schema_max: u32,
    vt: SeqVtable,
}

impl Codec for OpaqueSeqCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let bytes = match (self.vt.bytes)(value) {
            Some(bytes) => bytes,
            None => return Err(Error::InvalidType("opaque sequence of non-byte elements")),
        };
        if bytes.len() > self.limit {
            return Err(len_err(bytes.len() as u64, self.schema_max));
        }
        w.emit_opaque(bytes)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        if (self.vt.bytes)(value).is_none() {
            return Err(Error::NotPointer);
        }
        let bytes = r
            .take_var_opaque(self.limit)
            .map_err(|e| remap_len_err(e, self.schema_max))?;
        (self.vt.set_bytes)(value, bytes);
        Ok(())
    }
}

struct SeqCodec {
    elem: Arc<dyn Codec>,
    limit: usize,
    schema_max: u32,
    vt: SeqVtable,
}

impl Codec for SeqCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let len = (self.vt.len)(value);
        if len > self.limit {
            return Err(len_err(len as u64, self.schema_max));
        }
        w.emit_u32(len as u32)?;
        for i in 0..len {
            self.elem.encode(w, (self.vt.get)(value, i))?;
        }
        Ok(())
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let len = r.take_u32()?;
        if len as u64 > self.limit as u64 {
            return Err(len_err(len as u64, self.schema_max));
        }
        (self.vt.resize_default)(value, len as usize);
        for i in 0..len as usize {
            self.elem.decode(r, (self.vt.get_mut)(value, i))?;
        }
        Ok(())
    }
}

fn build_seq_codec(
    registry: &Registry,
    shape: &'static Shape,
    t: Tag<'_>,
    elem: ShapeFn,
    vt: SeqVtable,
) -> Arc<dyn Codec> {
    let schema_max = match t.kind() {
        TagKind::MaxLen => t.only_value(),
        TagKind::Noop => u32::MAX,
        _ => return error_codec(invalid_tag(shape, "tag not applicable to a sequence")),
    };
    let limit = clamp_len(schema_max);

    if t.next().kind() == TagKind::Opaque {
        Arc::new(OpaqueSeqCodec {
            limit,
            schema_max,
            vt,
        })
    } else {
        Arc::new(SeqCodec {
            elem: registry.codec_for_shape(elem(), t.next()),
            limit,
            schema_max,
            vt,
        })
    }
}

// --- maps ---

/// Entries are written in the map's own iteration order; the wire order is
/// not otherwise specified, and decoding rebuilds a fresh map from
/// whatever order arrives.
struct MapCodec {
    key: Arc<dyn Codec>,
    value: Arc<dyn Codec>,
    limit: usize,
    schema_max: u32,
    vt: MapVtable,
}

impl Codec for MapCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let len = (self.vt.len)(value);
        if len > self.limit {
            return Err(len_err(len as u64, self.schema_max));
        }
        w.emit_u32(len as u32)?;
        (self.vt.visit)(value, &mut |k, v| {
            self.key.encode(&mut *w, k)?;
            self.value.encode(&mut *w, v)
        })
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let len = r.take_u32()?;
        if len as u64 > self.limit as u64 {
            return Err(len_err(len as u64, self.schema_max));
        }
        (self.vt.clear)(value);
        for _ in 0..len {
            let mut k = (self.vt.new_key)();
            let mut v = (self.vt.new_value)();
            self.key.decode(r, &mut *k)?;
            self.value.decode(r, &mut *v)?;
            (self.vt.insert)(value, k, v);
        }
        Ok(())
    }
}

fn build_map_codec(
    registry: &Registry,
    shape: &'static Shape,
    t: Tag<'_>,
    key: ShapeFn,
    value: ShapeFn,
    vt: MapVtable,
) -> Arc<dyn Codec> {
    let schema_max = match t.kind() {
        TagKind::MaxLen => t.only_value(),
        TagKind::Noop => u32::MAX,
        _ => return error_codec(invalid_tag(shape, "tag not applicable to a map")),
    };

    Arc::new(MapCodec {
        key: registry.codec_for_shape(key(), Tag::EMPTY),
        value: registry.codec_for_shape(value(), t.next()),
        limit: clamp_len(schema_max),
        schema_max,
        vt,
    })
}

// --- optionals and pointers ---

/// The RFC 4506 optional form: a presence word, then the value.
struct OptCodec {
    elem: Arc<dyn Codec>,
    vt: OptVtable,
}

impl Codec for OptCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let present = (self.vt.is_some)(value);
        w.emit_bool(present)?;
        if present {
            self.elem.encode(w, value)
        } else {
            Ok(())
        }
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        (self.vt.set_none)(value);
        if r.take_bool()? {
            self.elem.decode(r, value)
        } else {
            Ok(())
        }
    }
}

/// A bare `Option` layer without the `opt` tag: transparent indirection.
/// `None` cannot be represented on the wire and fails to encode.
struct NullableCodec {
    elem: Arc<dyn Codec>,
    vt: OptVtable,
}

impl Codec for NullableCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        if !(self.vt.is_some)(value) {
            return Err(Error::NilPointer);
        }
        self.elem.encode(w, (self.vt.get)(value))
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        (self.vt.set_default)(value);
        self.elem.decode(r, (self.vt.get_mut)(value))
    }
}

struct PtrCodec {
    elem: Arc<dyn Codec>,
    vt: PtrVtable,
}

impl Codec for PtrCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        self.elem.encode(w, (self.vt.get)(value))
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        self.elem.decode(r, (self.vt.get_mut)(value))
    }
}

fn build_opt_codec(registry: &Registry, shape: &'static Shape, t: Tag<'_>) -> Arc<dyn Codec> {
    let vt = match shape.kind {
        Kind::Opt { vt, .. } => vt,
        _ => return error_codec(invalid_tag(shape, "'opt' requires an Option layer")),
    };

    // Replace the leading Opt with a Noop and resolve the remainder against
    // the same type; that yields the transparent codec for the body.
    let inner = t.next().prepend(TagKind::Noop);
    let elem = registry.codec_for_shape(shape, inner.as_tag().trimmed());
    Arc::new(OptCodec { elem, vt })
}

// --- structs and unions ---

struct FieldRec {
    name: &'static str,
    codec: Arc<dyn Codec>,
    get: fn(&dyn Any) -> &dyn Any,
    get_mut: fn(&mut dyn Any) -> &mut dyn Any,
}

fn make_field(registry: &Registry, def: &'static FieldDef, t: Tag<'_>) -> FieldRec {
    FieldRec {
        name: def.name,
        codec: registry.codec_for_shape((def.shape)(), t),
        get: def.get,
        get_mut: def.get_mut,
    }
}

struct StructCodec {
    name: &'static str,
    fields: Vec<FieldRec>,
}

impl Codec for StructCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        for f in &self.fields {
            f.codec
                .encode(w, (f.get)(value))
                .map_err(|e| e.at(format!("{}.{}", self.name, f.name)))?;
        }
        Ok(())
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        for f in &self.fields {
            f.codec
                .decode(r, (f.get_mut)(value))
                .map_err(|e| e.at(format!("{}.{}", self.name, f.name)))?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum SwitchKind {
    Bool,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
}

struct UnionCodec {
    name: &'static str,
    switch: FieldRec,
    switch_kind: SwitchKind,
    /// Dense table indexed by declaration position; only case and default
    /// arms are populated.
    body: Vec<Option<FieldRec>>,
    cases: FxHashMap<u32, usize>,
    default_arm: Option<usize>,
}

impl UnionCodec {
    /// The discriminant as its 32-bit wire word: sign-extension for signed
    /// switches, zero-extension for unsigned, 0/1 for booleans.
    fn switch_value(&self, field: &dyn Any) -> u32 {
        match self.switch_kind {
            SwitchKind::Bool => *expect_ref::<bool>(field) as u32,
            SwitchKind::I8 => *expect_ref::<i8>(field) as i32 as u32,
            SwitchKind::I16 => *expect_ref::<i16>(field) as i32 as u32,
            SwitchKind::I32 => *expect_ref::<i32>(field) as u32,
            SwitchKind::U8 => *expect_ref::<u8>(field) as u32,
            SwitchKind::U16 => *expect_ref::<u16>(field) as u32,
            SwitchKind::U32 => *expect_ref::<u32>(field),
        }
    }

    fn arm(&self, switch: u32) -> Option<&FieldRec> {
        let index = self.cases.get(&switch).copied().or(self.default_arm)?;
        self.body[index].as_ref()
    }
}

impl Codec for UnionCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let switch_field = (self.switch.get)(value);
        self.switch
            .codec
            .encode(w, switch_field)
            .map_err(|e| e.at(format!("{}.{}(union:switch)", self.name, self.switch.name)))?;

        let switch = self.switch_value(switch_field);
        let f = self.arm(switch).ok_or_else(|| {
            Error::UnionSwitchArmUndefined.at(format!("{}.?(union:{switch:#x})", self.name))
        })?;
        f.codec
            .encode(w, (f.get)(value))
            .map_err(|e| e.at(format!("{}.{}(union:{switch:#x})", self.name, f.name)))
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        self.switch
            .codec
            .decode(r, (self.switch.get_mut)(value))
            .map_err(|e| e.at(format!("{}.{}(union:switch)", self.name, self.switch.name)))?;

        let switch = self.switch_value((self.switch.get)(value));
        let f = self.arm(switch).ok_or_else(|| {
            Error::UnionSwitchArmUndefined.at(format!("{}.?(union:{switch:#x})", self.name))
        })?;
        f.codec
            .decode(r, (f.get_mut)(value))
            .map_err(|e| e.at(format!("{}.{}(union:{switch:#x})", self.name, f.name)))
    }
}

/// Classifies the record as struct or union by its first non-skipped field
/// and builds the corresponding codec. Tag errors become error codecs so
/// every later use of this `(type, tag)` pair reports the same failure.
fn build_struct_codec(
    registry: &Registry,
    shape: &'static Shape,
    fields: &'static [FieldDef],
) -> Arc<dyn Codec> {
    let mut ctx = UnionCtx::Maybe;
    let mut first = None;

    let mut index = 0;
    while index < fields.len() {
        let def = &fields[index];
        let t = match tag::parse_field((def.shape)(), def.tag, &mut ctx) {
            Ok(t) => t,
            Err(e) => return error_codec(e.at(format!("{}.{}", shape.name, def.name))),
        };
        index += 1;
        if t.as_tag().kind() == TagKind::Skip {
            continue;
        }
        first = Some((index - 1, t));
        break;
    }

    let (first_index, first_tag) = match first {
        // No unskipped fields at all: a void record.
        None => {
            return Arc::new(StructCodec {
                name: shape.name,
                fields: Vec::new(),
            })
        }
        Some(first) => first,
    };

    if ctx != UnionCtx::Yes {
        let mut recs = Vec::with_capacity(fields.len());
        recs.push(make_field(registry, &fields[first_index], first_tag.as_tag()));

        for def in &fields[first_index + 1..] {
            let t = match tag::parse_field((def.shape)(), def.tag, &mut ctx) {
                Ok(t) => t,
                Err(e) => return error_codec(e.at(format!("{}.{}", shape.name, def.name))),
            };
            if t.as_tag().kind() == TagKind::Skip {
                continue;
            }
            recs.push(make_field(registry, def, t.as_tag()));
        }

        return Arc::new(StructCodec {
            name: shape.name,
            fields: recs,
        });
    }

    // Union: the first field is the switch, every following field an arm.
    let switch_def = &fields[first_index];
    let switch_kind = match (switch_def.shape)().kind {
        Kind::Bool => SwitchKind::Bool,
        Kind::I8 => SwitchKind::I8,
        Kind::I16 => SwitchKind::I16,
        Kind::I32 => SwitchKind::I32,
        Kind::U8 => SwitchKind::U8,
        Kind::U16 => SwitchKind::U16,
        Kind::U32 => SwitchKind::U32,
        _ => {
            return error_codec(invalid_tag(
                shape,
                "union switch must be bool or an 8/16/32-bit integer",
            ))
        }
    };

    let switch = make_field(registry, switch_def, first_tag.as_tag().next());
    let mut body: Vec<Option<FieldRec>> = fields.iter().map(|_| None).collect();
    let mut cases = FxHashMap::default();
    let mut default_arm = None;

    for (position, def) in fields.iter().enumerate().skip(first_index + 1) {
        let t = match tag::parse_field((def.shape)(), def.tag, &mut ctx) {
            Ok(t) => t,
            Err(e) => return error_codec(e.at(format!("{}.{}", shape.name, def.name))),
        };
        let t = t.as_tag();
        if t.kind() == TagKind::Skip {
            continue;
        }

        body[position] = Some(make_field(registry, def, t.next()));

        match t.kind() {
            TagKind::UnionCases => {
                for case in t.values() {
                    if cases.insert(case, position).is_some() {
                        return error_codec(invalid_tag(
                            shape,
                            format!("union case {case:#010x} duplicated"),
                        ));
                    }
                }
            }
            TagKind::UnionDefault => {
                if default_arm.replace(position).is_some() {
                    return error_codec(invalid_tag(shape, "union default arm duplicated"));
                }
            }
            _ => {
                return error_codec(invalid_tag(
                    shape,
                    format!("field '{}' in a union carries no case", def.name),
                ))
            }
        }
    }

    Arc::new(UnionCodec {
        name: shape.name,
        switch,
        switch_kind,
        body,
        cases,
        default_arm,
    })
}

// --- special codecs ---

/// A memoized construction failure: every use re-raises the same error,
/// so repeated probes of a bad `(type, tag)` pair see a consistent result.
pub(crate) struct ErrorCodec(pub(crate) Error);

impl Codec for ErrorCodec {
    fn encode(&self, _w: &mut dyn WireWrite, _value: &dyn Any) -> Result<()> {
        Err(self.0.clone())
    }

    fn decode(&self, _r: &mut dyn WireRead, _value: &mut dyn Any) -> Result<()> {
        Err(self.0.clone())
    }
}

/// Placeholder installed in the registry before construction begins.
///
/// A lookup that finds one either blocks until the real codec is published
/// (a concurrent first use) or embeds it as a child (a recursive type
/// resolving through its own construction). Calls through it after
/// resolution are a single atomic load.
pub(crate) struct DeferredCodec {
    cell: OnceLock<Arc<dyn Codec>>,
    lock: Mutex<()>,
    ready: Condvar,
}

impl DeferredCodec {
    pub(crate) fn new() -> Self {
        DeferredCodec {
            cell: OnceLock::new(),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn resolve(&self, codec: Arc<dyn Codec>) {
        let _ = self.cell.set(codec);
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    fn get(&self) -> Arc<dyn Codec> {
        if let Some(codec) = self.cell.get() {
            return codec.clone();
        }
        let mut guard = self.lock.lock();
        loop {
            if let Some(codec) = self.cell.get() {
                return codec.clone();
            }
            self.ready.wait(&mut guard);
        }
    }
}

impl Codec for DeferredCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        self.get().encode(w, value)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        self.get().decode(r, value)
    }
}

/// Delegates to the type's own [`Marshal`](crate::Marshal) implementation.
struct CustomCodec {
    vt: CustomVtable,
}

impl Codec for CustomCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        (self.vt.encode)(value, w)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        (self.vt.decode)(value, r)
    }
}

/// Selects and runs the builder for a `(shape, tag)` pair.
///
/// `opt` wraps first; container kinds handle their own tag layer; every
/// remaining kind admits only the empty tag.
pub(crate) fn build_codec(
    registry: &Registry,
    shape: &'static Shape,
    t: Tag<'_>,
) -> Arc<dyn Codec> {
    if t.kind() == TagKind::Opt {
        return build_opt_codec(registry, shape, t);
    }

    match shape.kind {
        Kind::Ptr { inner, vt } => Arc::new(PtrCodec {
            elem: registry.codec_for_shape(inner(), t.next()),
            vt,
        }),
        Kind::Opt { inner, vt } => Arc::new(NullableCodec {
            elem: registry.codec_for_shape(inner(), t.next()),
            vt,
        }),
        Kind::Str { vt } => build_string_codec(shape, t, vt),
        Kind::Array { elem, vt, .. } => build_array_codec(registry, shape, t, elem, vt),
        Kind::Seq { elem, vt } => build_seq_codec(registry, shape, t, elem, vt),
        Kind::Map { key, value, vt } => build_map_codec(registry, shape, t, key, value, vt),

        _ if !t.is_empty() => error_codec(invalid_tag(shape, "no tags apply to this type")),

        Kind::Custom { vt } => Arc::new(CustomCodec { vt }),
        Kind::Bool => Arc::new(BoolCodec),
        Kind::I8 => Arc::new(I8Codec),
        Kind::I16 => Arc::new(I16Codec),
        Kind::I32 => Arc::new(I32Codec),
        Kind::U8 => Arc::new(U8Codec),
        Kind::U16 => Arc::new(U16Codec),
        Kind::U32 => Arc::new(U32Codec),
        Kind::I64 => Arc::new(HyperCodec),
        Kind::U64 => Arc::new(UhyperCodec),
        Kind::F32 => Arc::new(FloatCodec),
        Kind::F64 => Arc::new(DoubleCodec),
        Kind::Complex32 { vt } => Arc::new(Complex32Codec { vt }),
        Kind::Complex64 { vt } => Arc::new(Complex64Codec { vt }),
        Kind::Struct { fields } => build_struct_codec(registry, shape, fields),
    }
}
