//! # xdr-wire
//!
//! Encoding and decoding of the XDR (External Data Representation) format
//! specified in RFC 4506: the wire format of ONC RPC protocols such as NFS.
//! All values are big-endian and every encoded object occupies a multiple of
//! four bytes, padded with zeroes.
//!
//! The crate is a type-directed codec engine. A `#[derive(Xdr)]` on your
//! struct produces a static type description; the engine compiles that
//! description, together with per-field schema tags, into a cached codec
//! tree and executes it against a [`Writer`] or [`Reader`].
//!
//! ```rust
//! use xdr_wire::{Xdr, marshal, unmarshal};
//!
//! #[derive(Xdr, Default, PartialEq, Debug)]
//! struct FileHandle {
//!     inode: u64,
//!     generation: u32,
//!     flags: u32,
//! }
//!
//! let fh = FileHandle { inode: 7, generation: 42, flags: 0 };
//! let bytes = marshal(&fh).unwrap();
//! assert_eq!(bytes.len(), 16); // 8 + 4 + 4
//! let decoded: FileHandle = unmarshal(&bytes).unwrap();
//! assert_eq!(fh, decoded);
//! ```
//!
//! ## Type mapping
//!
//! | Rust                        | XDR                        |
//! | --------------------------- | -------------------------- |
//! | `bool`                      | bool                       |
//! | `i8`, `i16`, `i32`          | int                        |
//! | `u8`, `u16`, `u32`          | unsigned int               |
//! | `i64` / `u64`               | hyper / unsigned hyper     |
//! | `f32` / `f64`               | float / double             |
//! | `String`                    | string ident<>             |
//! | `Box<T>`                    | T (transparent)            |
//! | `Option<T>`                 | T, or T* with `opt`        |
//! | `Vec<T>`                    | T ident<>                  |
//! | `[T; N]`                    | T ident[N]                 |
//! | maps                        | length-prefixed (k, v)     |
//! | named struct                | struct (or union, tagged)  |
//!
//! XDR enumerations have no direct Rust analogue here; declare the field as
//! `u32` (or `i32`). Rust `enum`s are not supported: XDR unions are
//! declared as structs carrying `union:` tags (see below).
//!
//! ## Field tags
//!
//! Some XDR types cannot be expressed by the mapping alone; those are
//! selected with the `#[xdr("...")]` field attribute. A tag is a sequence
//! of `/`-separated modifiers applied layer by layer from the outermost
//! type inward; an empty position leaves that layer unmodified.
//!
//! - `-` — skip this field entirely.
//! - `opt` — at an `Option` layer: encode the RFC 4506 optional form
//!   (4-byte presence word, then the value). Without `opt`, `Option` is
//!   transparent indirection and `None` fails to encode.
//! - `opaque` — at a byte layer: encode the bytes densely (one byte per
//!   element) instead of one 4-byte word per element. `opaque` directly on
//!   `Vec<u8>` / `[u8; N]` is shorthand for `/opaque`.
//! - `len:N` — fixed-width string of exactly N bytes.
//! - `maxlen:N` — maximum length of a string, sequence, or map.
//!
//! ```text
//! XDR                  Rust
//! ------------------   ----------------------------------------
//! T *ident             Option<T>   #[xdr("opt")]
//! T ident<N>           Vec<T>      #[xdr("maxlen:N")]
//! string ident[N]      String      #[xdr("len:N")]
//! opaque ident<>       Vec<u8>     #[xdr("opaque")]
//! opaque ident[N]      [u8; N]     #[xdr("opaque")]
//! opaque ident<N>      Vec<u8>     #[xdr("maxlen:N/opaque")]
//! ```
//!
//! ## Unions
//!
//! An XDR union is a struct whose first field carries `union:switch` and
//! whose remaining fields each carry a case tag:
//!
//! ```text
//! union u switch (int s) {        #[derive(Xdr, Default)]
//!   case 0:  type_a a;            struct U {
//!   case 1:  type_b *b;               #[xdr("union:switch")]  s: i32,
//!   default: type_c c;                #[xdr("union:0")]       a: TypeA,
//! }                                   #[xdr("union:1/opt")]   b: Option<TypeB>,
//!                                     #[xdr("union:default")] c: TypeC,
//!                                 }
//! ```
//!
//! The switch must be `bool` or an 8/16/32-bit integer; the discriminant is
//! always a 32-bit word on the wire. Case values are decimal or `0x` hex,
//! comma-separated; `union:true` / `union:false` serve boolean switches.
//! Only the selected arm is read or written.
//!
//! Types with custom wire forms implement [`Marshal`]; third-party types
//! can be covered by registering a [`Codec`] with a [`Registry`].

pub mod codec;
pub mod registry;
pub mod shape;
pub mod tag;
pub mod wire;

mod features;

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error as ThisError;

pub use codec::Codec;
pub use registry::{default_registry, Registry};
pub use shape::{Marshal, XdrType};
pub use wire::{OpaqueChunk, Reader, WireRead, WireWrite, Writer};
pub use xdr_wire_derive::Xdr;

/// Error type for all encoding and decoding operations in this crate.
///
/// Errors raised inside a struct or union are wrapped in [`Error::Field`]
/// with a dotted path for diagnostics; [`Error::kind`] sees through the
/// wrapper so callers can still match on the underlying condition.
#[derive(Debug, Clone, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// A wire byte violated its domain (boolean or optional presence word
    /// that is neither 0 nor 1, or string bytes that are not UTF-8).
    #[error("invalid value for type")]
    InvalidValue,
    /// A variable-length object was longer than the schema permits.
    #[error("variable length object too long ({actual} > {max})")]
    LengthExceedsMax { actual: u64, max: u64 },
    /// A received length fits the schema but not this host's addressable
    /// range. Only reachable on 32-bit hosts.
    #[error("variable length object too long for platform ({actual})")]
    LengthExceedsPlatformLimit { actual: u64 },
    /// A fixed-length value did not have exactly the declared length.
    #[error("length of fixed length object incorrect")]
    LengthIncorrect,
    /// A union discriminant selected no arm and the union has no default.
    #[error("union switch arm undefined")]
    UnionSwitchArmUndefined,
    /// A bare (non-`opt`) `Option` was `None` on encode.
    #[error("unexpected absent value at a non-optional layer")]
    NilPointer,
    /// A decode target slot could not be written (an erased target that
    /// does not accept the decoded representation).
    #[error("decode target is not a writable slot")]
    NotPointer,
    /// The type cannot be serialized as XDR.
    #[error("type '{0}' unsupported")]
    InvalidType(&'static str),
    /// A tag modifier does not apply to the type at its layer.
    #[error("tag invalid for type '{ty}': {detail}")]
    InvalidTagForType { ty: &'static str, detail: String },
    /// A nested field failed; `path` names the field chain.
    #[error("{source} (at {path})")]
    Field { path: String, source: Box<Error> },
    /// The underlying byte sink or source failed.
    #[error("i/o: {0}")]
    Io(Arc<std::io::Error>),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of [`Error`], ignoring field-path wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidValue,
    LengthExceedsMax,
    LengthExceedsPlatformLimit,
    LengthIncorrect,
    UnionSwitchArmUndefined,
    NilPointer,
    NotPointer,
    InvalidType,
    InvalidTagForType,
    Io,
}

impl Error {
    /// The kind of the underlying error, unwrapping any field-path context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidValue => ErrorKind::InvalidValue,
            Error::LengthExceedsMax { .. } => ErrorKind::LengthExceedsMax,
            Error::LengthExceedsPlatformLimit { .. } => ErrorKind::LengthExceedsPlatformLimit,
            Error::LengthIncorrect => ErrorKind::LengthIncorrect,
            Error::UnionSwitchArmUndefined => ErrorKind::UnionSwitchArmUndefined,
            Error::NilPointer => ErrorKind::NilPointer,
            Error::NotPointer => ErrorKind::NotPointer,
            Error::InvalidType(_) => ErrorKind::InvalidType,
            Error::InvalidTagForType { .. } => ErrorKind::InvalidTagForType,
            Error::Field { source, .. } => source.kind(),
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Wraps the error with field-path context. An already wrapped error
    /// gets the new path prepended, so the outermost frame comes first.
    pub(crate) fn at(self, path: impl Into<String>) -> Error {
        match self {
            Error::Field { path: inner, source } => Error::Field {
                path: format!("{} {}", path.into(), inner),
                source,
            },
            other => Error::Field {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

/// Marshals `value` into a freshly allocated buffer using the process-wide
/// default registry.
pub fn marshal<T: XdrType>(value: &T) -> Result<Bytes> {
    default_registry().marshal(value)
}

/// Unmarshals a value of type `T` from `buf` using the default registry.
pub fn unmarshal<T: XdrType + Default>(buf: &[u8]) -> Result<T> {
    default_registry().unmarshal(buf)
}

/// Unmarshals from `buf` into an existing value using the default registry.
pub fn unmarshal_into<T: XdrType>(buf: &[u8], out: &mut T) -> Result<()> {
    default_registry().unmarshal_into(buf, out)
}

/// Marshals `value` into `sink` (buffered) using the default registry.
pub fn write_to<W: Write, T: XdrType>(sink: W, value: &T) -> Result<()> {
    default_registry().write(sink, value)
}

/// Unmarshals from `source` into `out` using the default registry.
pub fn read_from<R: Read, T: XdrType>(source: R, out: &mut T) -> Result<()> {
    default_registry().read(source, out)
}
