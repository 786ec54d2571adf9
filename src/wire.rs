//! Wire layer: stateful endpoints that move XDR primitive forms between
//! program values and an underlying byte sink or source.
//!
//! [`Writer`] and [`Reader`] own their `io::Write` / `io::Read` endpoint.
//! Codecs operate against the object-safe [`WireWrite`] / [`WireRead`]
//! traits, so a single codec tree serves every sink and source type.

use std::any::TypeId;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::codec::Codec;
use crate::registry::Registry;
use crate::shape::XdrType;
use crate::tag::Tag;
use crate::{Error, Result};

const PAD: [u8; 4] = [0; 4];

/// Number of zero bytes required after a body of `n` bytes.
pub(crate) fn pad_for(n: usize) -> usize {
    (4 - (n & 3)) & 3
}

/// Primitive emission operations of the XDR wire format.
///
/// All integers are written big-endian; opaque and string forms are padded
/// with zero bytes to a multiple of four. Implemented by [`Writer`]; custom
/// [`Marshal`](crate::Marshal) impls and codecs write through this trait.
pub trait WireWrite {
    fn emit_i32(&mut self, v: i32) -> Result<()>;
    fn emit_u32(&mut self, v: u32) -> Result<()>;
    fn emit_i64(&mut self, v: i64) -> Result<()>;
    fn emit_u64(&mut self, v: u64) -> Result<()>;
    fn emit_f32(&mut self, v: f32) -> Result<()>;
    fn emit_f64(&mut self, v: f64) -> Result<()>;
    fn emit_bool(&mut self, v: bool) -> Result<()>;

    /// Writes a variable-length opaque: 4-byte length, body, padding.
    /// Bodies over `u32::MAX` bytes fail before any output.
    fn emit_opaque(&mut self, bytes: &[u8]) -> Result<()>;

    /// Writes a fixed-length opaque: body and padding, no length prefix.
    fn emit_fixed_opaque(&mut self, bytes: &[u8]) -> Result<()>;

    /// Writes a variable-length string; identical to [`emit_opaque`]
    /// over the string's bytes.
    ///
    /// [`emit_opaque`]: WireWrite::emit_opaque
    fn emit_string(&mut self, s: &str) -> Result<()>;

    /// Writes a fixed-length string; identical to [`emit_fixed_opaque`]
    /// over the string's bytes.
    ///
    /// [`emit_fixed_opaque`]: WireWrite::emit_fixed_opaque
    fn emit_fixed_string(&mut self, s: &str) -> Result<()>;
}

/// Primitive consumption operations of the XDR wire format, symmetric to
/// [`WireWrite`].
pub trait WireRead {
    fn take_i32(&mut self) -> Result<i32>;
    fn take_u32(&mut self) -> Result<u32>;
    fn take_i64(&mut self) -> Result<i64>;
    fn take_u64(&mut self) -> Result<u64>;
    fn take_f32(&mut self) -> Result<f32>;
    fn take_f64(&mut self) -> Result<f64>;

    /// Reads a boolean word; anything other than 0 or 1 is
    /// [`Error::InvalidValue`].
    fn take_bool(&mut self) -> Result<bool>;

    /// Reads a variable-length opaque of at most `max` bytes. Consumes the
    /// padded body, returns the unpadded bytes.
    fn take_var_opaque(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Reads a fixed-length opaque into `buf` and consumes its padding.
    fn take_fixed_opaque(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Reads a variable-length string of at most `max` bytes.
    fn take_string(&mut self, max: usize) -> Result<String>;

    /// Reads a fixed-length string of exactly `len` bytes.
    fn take_fixed_string(&mut self, len: usize) -> Result<String>;
}

/// Small direct-mapped cache of the codecs most recently used by a writer.
///
/// Typically a handful of types are written repeatedly through one writer;
/// this avoids a registry lookup per value. Replacement is round-robin.
pub(crate) struct InlineCache {
    slots: [Option<(TypeId, Arc<dyn Codec>)>; 4],
    next: usize,
}

impl InlineCache {
    pub(crate) fn new() -> Self {
        InlineCache {
            slots: [None, None, None, None],
            next: 3,
        }
    }

    fn get(&self, type_id: TypeId) -> Option<Arc<dyn Codec>> {
        for slot in self.slots.iter().flatten() {
            if slot.0 == type_id {
                return Some(slot.1.clone());
            }
        }
        None
    }

    fn put(&mut self, type_id: TypeId, codec: Arc<dyn Codec>) {
        self.next = (self.next + 1) & (self.slots.len() - 1);
        self.slots[self.next] = Some((type_id, codec));
    }
}

/// An encoding endpoint owning a byte sink.
///
/// Writers are single-threaded, single-use handles; the registry they were
/// created from may be shared freely. Within one writer, emitted bytes
/// preserve the order of emit calls.
pub struct Writer<W: Write> {
    sink: W,
    registry: Arc<Registry>,
    cache: InlineCache,
}

impl<W: Write> Writer<W> {
    /// Creates a writer over `sink`, resolving codecs from `registry`.
    pub fn new(registry: Arc<Registry>, sink: W) -> Self {
        Writer {
            sink,
            registry,
            cache: InlineCache::new(),
        }
    }

    pub(crate) fn with_cache(registry: Arc<Registry>, sink: W, cache: InlineCache) -> Self {
        Writer {
            sink,
            registry,
            cache,
        }
    }

    pub(crate) fn into_cache(self) -> InlineCache {
        self.cache
    }

    /// Encodes `value` onto the sink.
    pub fn encode<T: XdrType>(&mut self, value: &T) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let codec = match self.cache.get(type_id) {
            Some(codec) => codec,
            None => {
                let codec = self.registry.codec_for_shape(T::shape(), Tag::EMPTY);
                self.cache.put(type_id, codec.clone());
                codec
            }
        };
        codec.encode(self, value)
    }

    /// Consumes the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.sink
    }
}

impl<W: Write> WireWrite for Writer<W> {
    fn emit_i32(&mut self, v: i32) -> Result<()> {
        self.sink.write_all(&v.to_be_bytes()).map_err(Error::from)
    }

    fn emit_u32(&mut self, v: u32) -> Result<()> {
        self.sink.write_all(&v.to_be_bytes()).map_err(Error::from)
    }

    fn emit_i64(&mut self, v: i64) -> Result<()> {
        self.sink.write_all(&v.to_be_bytes()).map_err(Error::from)
    }

    fn emit_u64(&mut self, v: u64) -> Result<()> {
        self.sink.write_all(&v.to_be_bytes()).map_err(Error::from)
    }

    fn emit_f32(&mut self, v: f32) -> Result<()> {
        self.emit_u32(v.to_bits())
    }

    fn emit_f64(&mut self, v: f64) -> Result<()> {
        self.emit_u64(v.to_bits())
    }

    fn emit_bool(&mut self, v: bool) -> Result<()> {
        self.emit_i32(v as i32)
    }

    fn emit_opaque(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > u32::MAX as u64 {
            return Err(Error::LengthExceedsMax {
                actual: bytes.len() as u64,
                max: u32::MAX as u64,
            });
        }
        self.emit_u32(bytes.len() as u32)?;
        self.emit_fixed_opaque(bytes)
    }

    fn emit_fixed_opaque(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes)?;
        self.sink
            .write_all(&PAD[..pad_for(bytes.len())])
            .map_err(Error::from)
    }

    fn emit_string(&mut self, s: &str) -> Result<()> {
        self.emit_opaque(s.as_bytes())
    }

    fn emit_fixed_string(&mut self, s: &str) -> Result<()> {
        self.emit_fixed_opaque(s.as_bytes())
    }
}

/// A decoding endpoint owning a byte source.
///
/// Readers are single-threaded, single-use handles. Premature end of input
/// surfaces as the underlying read error.
pub struct Reader<R: Read> {
    source: R,
    registry: Arc<Registry>,
}

impl<R: Read> Reader<R> {
    /// Creates a reader over `source`, resolving codecs from `registry`.
    pub fn new(registry: Arc<Registry>, source: R) -> Self {
        Reader { source, registry }
    }

    /// Decodes a value from the source into `out`.
    pub fn decode<T: XdrType>(&mut self, out: &mut T) -> Result<()> {
        let codec = self.registry.codec_for_shape(T::shape(), Tag::EMPTY);
        codec.decode(self, out)
    }

    /// Begins a streaming read of a variable-length opaque of at most
    /// `max` bytes. Returns the body length and a bounded sub-stream of
    /// exactly that many bytes.
    ///
    /// The chunk's [`finish`](OpaqueChunk::finish) must be called before
    /// this reader is used again: it consumes any unread body bytes plus
    /// the padding. Merely draining the stream is not sufficient.
    pub fn opaque_chunk(&mut self, max: u32) -> Result<(u32, OpaqueChunk<'_, R>)> {
        let n = self.take_u32()?;
        if n > max {
            return Err(Error::LengthExceedsMax {
                actual: n as u64,
                max: max as u64,
            });
        }
        Ok((n, OpaqueChunk::new(&mut self.source, n)))
    }

    /// Begins a streaming read of a fixed-length opaque of exactly `len`
    /// bytes, with the same close contract as
    /// [`opaque_chunk`](Reader::opaque_chunk).
    pub fn fixed_opaque_chunk(&mut self, len: u32) -> OpaqueChunk<'_, R> {
        OpaqueChunk::new(&mut self.source, len)
    }

    /// Consumes the reader, returning the underlying source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: Read> WireRead for Reader<R> {
    fn take_i32(&mut self) -> Result<i32> {
        Ok(self.take_u32()? as i32)
    }

    fn take_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.source.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn take_i64(&mut self) -> Result<i64> {
        Ok(self.take_u64()? as i64)
    }

    fn take_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.source.read_exact(&mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn take_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.take_u32()?))
    }

    fn take_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.take_u64()?))
    }

    fn take_bool(&mut self) -> Result<bool> {
        match self.take_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidValue),
        }
    }

    fn take_var_opaque(&mut self, max: usize) -> Result<Vec<u8>> {
        let n = self.take_u32()?;
        if n == 0 {
            return Ok(Vec::new());
        }
        if n as u64 > max as u64 {
            return Err(Error::LengthExceedsMax {
                actual: n as u64,
                max: max as u64,
            });
        }
        let padded = (n as usize + 3) & !3;
        let mut buf = vec![0u8; padded];
        self.source.read_exact(&mut buf)?;
        buf.truncate(n as usize);
        Ok(buf)
    }

    fn take_fixed_opaque(&mut self, buf: &mut [u8]) -> Result<()> {
        self.source.read_exact(buf)?;
        let pad = pad_for(buf.len());
        if pad != 0 {
            let mut discard = [0u8; 4];
            self.source.read_exact(&mut discard[..pad])?;
        }
        Ok(())
    }

    fn take_string(&mut self, max: usize) -> Result<String> {
        let bytes = self.take_var_opaque(max)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidValue)
    }

    fn take_fixed_string(&mut self, len: usize) -> Result<String> {
        let mut bytes = vec![0u8; len];
        self.take_fixed_opaque(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidValue)
    }
}

/// A bounded sub-stream over the body of an opaque being read in streaming
/// fashion.
///
/// Yields exactly the body bytes; [`finish`](OpaqueChunk::finish) consumes
/// whatever the caller did not read, plus the trailing padding, and must be
/// called before the parent reader is touched again.
pub struct OpaqueChunk<'a, R: Read> {
    source: &'a mut R,
    remaining: u64,
    pad: u8,
}

impl<'a, R: Read> std::fmt::Debug for OpaqueChunk<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueChunk")
            .field("remaining", &self.remaining)
            .field("pad", &self.pad)
            .finish()
    }
}

impl<'a, R: Read> OpaqueChunk<'a, R> {
    fn new(source: &'a mut R, len: u32) -> Self {
        OpaqueChunk {
            source,
            remaining: len as u64,
            pad: pad_for(len as usize) as u8,
        }
    }

    /// Consumes the unread remainder of the body and the padding.
    pub fn finish(mut self) -> Result<()> {
        let mut total = self.remaining + self.pad as u64;
        let mut scratch = [0u8; 512];
        while total > 0 {
            let n = total.min(scratch.len() as u64) as usize;
            self.source.read_exact(&mut scratch[..n])?;
            total -= n as u64;
        }
        Ok(())
    }
}

impl<R: Read> Read for OpaqueChunk<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = self.remaining.min(buf.len() as u64) as usize;
        let n = self.source.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}
