//! The registry: per-instance memoization of codecs, construction of
//! Readers and Writers, and the one-shot marshal/unmarshal helpers.
//!
//! Codecs are built lazily on the first use of a `(type, tag)` pair and
//! shared by every later use. A construction in flight is represented by a
//! deferred placeholder, so concurrent first uses block instead of racing
//! and recursive types resolve through their own placeholder.

use std::any::TypeId;
use std::io::{BufWriter, Read, Write};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::codec::{build_codec, Codec, DeferredCodec};
use crate::shape::{Kind, Shape, XdrType};
use crate::tag::{self, Tag};
use crate::wire::{InlineCache, Reader, Writer};
use crate::{Error, Result};

#[derive(Clone, PartialEq, Eq, Hash)]
struct CodecKey {
    type_id: TypeId,
    tag: Box<[u8]>,
}

struct Scratch {
    buf: Vec<u8>,
    cache: InlineCache,
}

/// A shared repository of codecs.
///
/// Registries are multi-reader/multi-writer; the Readers and Writers they
/// hand out are single-threaded handles. Most programs use the process
/// [`default_registry`]; separate instances isolate custom registrations.
pub struct Registry {
    /// Fast path for untagged lookups, keyed by bare type.
    base: RwLock<FxHashMap<TypeId, Arc<dyn Codec>>>,
    codecs: RwLock<FxHashMap<CodecKey, Arc<dyn Codec>>>,
    scratch: Mutex<Vec<Scratch>>,
    /// The default registry refuses registrations.
    open: bool,
}

impl Registry {
    /// Creates a fresh registry.
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::instance(true))
    }

    fn instance(open: bool) -> Registry {
        Registry {
            base: RwLock::new(FxHashMap::default()),
            codecs: RwLock::new(FxHashMap::default()),
            scratch: Mutex::new(Vec::new()),
            open,
        }
    }

    /// The codec for `T` with no tag in force.
    pub fn codec_for<T: XdrType>(&self) -> Arc<dyn Codec> {
        self.codec_for_shape(T::shape(), Tag::EMPTY)
    }

    /// The codec for `T` under a textual tag, e.g. `"maxlen:4/opaque"`.
    pub fn codec_with_tag<T: XdrType>(&self, input: &str) -> Result<Arc<dyn Codec>> {
        let seq = tag::parse(T::shape(), input)?;
        Ok(self.codec_for_shape(T::shape(), seq.as_tag()))
    }

    pub(crate) fn codec_for_shape(&self, shape: &'static Shape, t: Tag<'_>) -> Arc<dyn Codec> {
        if t.is_empty() {
            if let Some(codec) = self.base.read().get(&shape.id()) {
                return codec.clone();
            }
        }

        let key = CodecKey {
            type_id: shape.id(),
            tag: Box::from(t.bytes()),
        };
        if let Some(codec) = self.codecs.read().get(&key) {
            return codec.clone();
        }

        self.build_and_publish(key, shape, t)
    }

    /// Installs a deferred placeholder, builds the codec outside any lock,
    /// then replaces the placeholder. A racing thread that got its
    /// placeholder in first wins; ours is discarded.
    fn build_and_publish(
        &self,
        key: CodecKey,
        shape: &'static Shape,
        t: Tag<'_>,
    ) -> Arc<dyn Codec> {
        let deferred = Arc::new(DeferredCodec::new());
        {
            let mut codecs = self.codecs.write();
            if let Some(existing) = codecs.get(&key) {
                return existing.clone();
            }
            let placeholder: Arc<dyn Codec> = deferred.clone();
            codecs.insert(key.clone(), placeholder);
        }

        debug!(ty = shape.name, tag = ?t, "building codec");
        let built = build_codec(self, shape, t);

        self.codecs.write().insert(key, built.clone());
        if t.is_empty() {
            self.base.write().insert(shape.id(), built.clone());
        }
        deferred.resolve(built.clone());
        built
    }

    /// Registers `codec` as the handler for `T`.
    ///
    /// Only struct and custom-marshal types may be registered: overriding
    /// primitives, strings, containers, or pointers would contradict tag
    /// modifiers. Registering the same codec twice is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `T` is of a prohibited kind, if a different codec is
    /// already present for `T`, or if this is the default registry.
    pub fn register<T: XdrType>(&self, codec: Arc<dyn Codec>) {
        let shape = T::shape();
        if !self.open {
            panic!("cannot register codecs with the default registry");
        }
        match shape.kind {
            Kind::Struct { .. } | Kind::Custom { .. } => {}
            _ => panic!(
                "cannot register a codec for type '{}' of a prohibited kind",
                shape.name
            ),
        }

        let key = CodecKey {
            type_id: shape.id(),
            tag: Box::from(&[][..]),
        };
        {
            let mut codecs = self.codecs.write();
            if let Some(existing) = codecs.get(&key) {
                if Arc::ptr_eq(existing, &codec) {
                    return;
                }
                panic!("a codec is already present for type '{}'", shape.name);
            }
            codecs.insert(key, codec.clone());
        }
        self.base.write().insert(shape.id(), codec);
        debug!(ty = shape.name, "registered custom codec");
    }

    /// A writer over `sink`, wired to this registry.
    pub fn writer<W: Write>(self: &Arc<Self>, sink: W) -> Writer<W> {
        Writer::new(Arc::clone(self), sink)
    }

    /// A reader over `source`, wired to this registry.
    pub fn reader<R: Read>(self: &Arc<Self>, source: R) -> Reader<R> {
        Reader::new(Arc::clone(self), source)
    }

    /// Marshals `value` into a freshly allocated buffer.
    ///
    /// The working buffer and the writer's codec cache are pooled on this
    /// registry and reused across calls.
    pub fn marshal<T: XdrType>(self: &Arc<Self>, value: &T) -> Result<Bytes> {
        let mut scratch = self.take_scratch();
        let outcome = {
            let cache = std::mem::replace(&mut scratch.cache, InlineCache::new());
            let mut w = Writer::with_cache(Arc::clone(self), &mut scratch.buf, cache);
            let outcome = w.encode(value);
            scratch.cache = w.into_cache();
            outcome
        };
        let bytes = Bytes::copy_from_slice(&scratch.buf);
        self.put_scratch(scratch);
        outcome.map(|()| bytes)
    }

    /// Unmarshals a value of type `T` from `buf`.
    pub fn unmarshal<T: XdrType + Default>(self: &Arc<Self>, buf: &[u8]) -> Result<T> {
        let mut value = T::default();
        self.unmarshal_into(buf, &mut value)?;
        Ok(value)
    }

    /// Unmarshals from `buf` into an existing value.
    pub fn unmarshal_into<T: XdrType>(self: &Arc<Self>, buf: &[u8], out: &mut T) -> Result<()> {
        self.reader(buf).decode(out)
    }

    /// Marshals `value` into `sink` through a buffered writer.
    pub fn write<W: Write, T: XdrType>(self: &Arc<Self>, sink: W, value: &T) -> Result<()> {
        let mut buffered = BufWriter::new(sink);
        {
            let mut w = Writer::new(Arc::clone(self), &mut buffered);
            w.encode(value)?;
        }
        buffered.flush().map_err(Error::from)
    }

    /// Unmarshals from `source` into `out`.
    pub fn read<R: Read, T: XdrType>(self: &Arc<Self>, source: R, out: &mut T) -> Result<()> {
        self.reader(source).decode(out)
    }

    fn take_scratch(&self) -> Scratch {
        self.scratch.lock().pop().unwrap_or_else(|| Scratch {
            buf: Vec::new(),
            cache: InlineCache::new(),
        })
    }

    /// Contents are cleared; capacity and the codec cache are kept.
    fn put_scratch(&self, mut scratch: Scratch) {
        scratch.buf.clear();
        self.scratch.lock().push(scratch);
    }
}

/// The process-wide registry backing the top-level convenience functions.
///
/// Custom codecs cannot be registered here; packages that need overrides
/// create their own [`Registry`] so they cannot conflict with each other.
pub fn default_registry() -> &'static Arc<Registry> {
    static DEFAULT: OnceLock<Arc<Registry>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(Registry::instance(false)))
}
