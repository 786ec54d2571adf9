//! Registry behavior: codec memoization and coherence, concurrent
//! first-use of recursive types, custom registration, self-marshaling
//! types, streaming opaque reads, and the writer/reader factories.

use std::any::Any;
use std::io::{Cursor, Read};
use std::sync::{Arc, Barrier};
use std::thread;

use xdr_wire::shape::{self, Shape};
use xdr_wire::{
    default_registry, Codec, ErrorKind, Marshal, Registry, Result, WireRead, WireWrite, Xdr,
    XdrType,
};

#[derive(Xdr, Default, PartialEq, Debug)]
struct Node {
    value: u32,
    #[xdr("opt")]
    next: Option<Box<Node>>,
}

#[derive(Xdr, Default, PartialEq, Debug, Clone)]
struct Timestamp {
    seconds: u64,
    nanos: u32,
}

#[test]
fn codec_lookups_are_coherent() {
    let registry = Registry::new();
    let a = registry.codec_for::<Node>();
    let b = registry.codec_for::<Node>();
    assert!(Arc::ptr_eq(&a, &b));

    let tagged_a = registry.codec_with_tag::<String>("maxlen:8").unwrap();
    let tagged_b = registry.codec_with_tag::<String>("maxlen:8").unwrap();
    assert!(Arc::ptr_eq(&tagged_a, &tagged_b));
    assert!(!Arc::ptr_eq(&a, &tagged_a));
}

#[test]
fn concurrent_first_use_of_a_recursive_type() {
    let registry = Registry::new();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // A loser of the construction race may receive the blocking
                // placeholder; it must still encode correctly.
                let codec = registry.codec_for::<Node>();
                let list = Node {
                    value: i,
                    next: Some(Box::new(Node {
                        value: i + 1,
                        next: None,
                    })),
                };
                let mut sink = Vec::new();
                {
                    let mut w = registry.writer(&mut sink);
                    codec.encode(&mut w, &list).unwrap();
                }

                assert_eq!(&sink[..], &registry.marshal(&list).unwrap()[..]);
                let out: Node = registry.unmarshal(&sink).unwrap();
                assert_eq!(out, list);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // The cache converges on exactly one codec.
    let a = registry.codec_for::<Node>();
    let b = registry.codec_for::<Node>();
    assert!(Arc::ptr_eq(&a, &b));
}

/// Encodes a `Timestamp` as a single hyper of nanoseconds.
struct NanosCodec;

impl Codec for NanosCodec {
    fn encode(&self, w: &mut dyn WireWrite, value: &dyn Any) -> Result<()> {
        let ts = shape::expect_ref::<Timestamp>(value);
        w.emit_u64(ts.seconds * 1_000_000_000 + ts.nanos as u64)
    }

    fn decode(&self, r: &mut dyn WireRead, value: &mut dyn Any) -> Result<()> {
        let total = r.take_u64()?;
        let ts = shape::expect_mut::<Timestamp>(value);
        ts.seconds = total / 1_000_000_000;
        ts.nanos = (total % 1_000_000_000) as u32;
        Ok(())
    }
}

#[test]
fn registered_codecs_replace_the_derived_layout() {
    let registry = Registry::new();
    let codec: Arc<dyn Codec> = Arc::new(NanosCodec);
    registry.register::<Timestamp>(codec.clone());
    // Same codec again is a no-op.
    registry.register::<Timestamp>(codec);

    let ts = Timestamp {
        seconds: 1,
        nanos: 5,
    };
    let bytes = registry.marshal(&ts).unwrap();
    assert_eq!(bytes.len(), 8);
    assert_eq!(&bytes[..], 1_000_000_005u64.to_be_bytes());

    let out: Timestamp = registry.unmarshal(&bytes).unwrap();
    assert_eq!(out, ts);
}

#[test]
#[should_panic(expected = "already present")]
fn conflicting_registration_panics() {
    let registry = Registry::new();
    registry.register::<Timestamp>(Arc::new(NanosCodec));
    registry.register::<Timestamp>(Arc::new(NanosCodec));
}

#[test]
#[should_panic(expected = "prohibited kind")]
fn registering_a_primitive_panics() {
    struct NopCodec;
    impl Codec for NopCodec {
        fn encode(&self, _: &mut dyn WireWrite, _: &dyn Any) -> Result<()> {
            Ok(())
        }
        fn decode(&self, _: &mut dyn WireRead, _: &mut dyn Any) -> Result<()> {
            Ok(())
        }
    }
    Registry::new().register::<u32>(Arc::new(NopCodec));
}

#[test]
#[should_panic(expected = "default registry")]
fn registering_with_the_default_registry_panics() {
    default_registry().register::<Timestamp>(Arc::new(NanosCodec));
}

#[derive(Default, PartialEq, Debug)]
struct Verifier {
    id: [u8; 8],
}

impl Marshal for Verifier {
    fn marshal_xdr(&self, w: &mut dyn WireWrite) -> Result<()> {
        w.emit_fixed_opaque(&self.id)
    }

    fn unmarshal_xdr(&mut self, r: &mut dyn WireRead) -> Result<()> {
        r.take_fixed_opaque(&mut self.id)
    }
}

impl XdrType for Verifier {
    fn shape() -> &'static Shape {
        shape::intern::<Verifier>(|| Shape::custom::<Verifier>("Verifier"))
    }
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Handshake {
    session: u32,
    verifier: Verifier,
}

#[test]
fn self_marshaling_types_take_over_their_wire_form() {
    let hs = Handshake {
        session: 3,
        verifier: Verifier {
            id: [1, 2, 3, 4, 5, 6, 7, 8],
        },
    };
    let bytes = xdr_wire::marshal(&hs).unwrap();
    assert_eq!(&bytes[..], [0, 0, 0, 3, 1, 2, 3, 4, 5, 6, 7, 8]);

    let out: Handshake = xdr_wire::unmarshal(&bytes).unwrap();
    assert_eq!(out, hs);
}

#[test]
fn streaming_opaque_reader_consumes_padding_on_finish() {
    let registry = Registry::new();
    let wire = [
        0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0, 0, 0, // opaque<5>
        0xDE, 0xAD, 0xBE, 0xEF, // trailing word
    ];
    let mut reader = registry.reader(&wire[..]);

    let (len, mut chunk) = reader.opaque_chunk(100).unwrap();
    assert_eq!(len, 5);
    let mut body = Vec::new();
    chunk.read_to_end(&mut body).unwrap();
    assert_eq!(&body, b"hello");
    chunk.finish().unwrap();

    assert_eq!(reader.take_u32().unwrap(), 0xDEAD_BEEF);
}

#[test]
fn streaming_opaque_reader_discards_unread_body() {
    let registry = Registry::new();
    let wire = [
        0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0, 0, 0, 0x00, 0x00, 0x00, 0x2A,
    ];
    let mut reader = registry.reader(&wire[..]);

    let (_, mut chunk) = reader.opaque_chunk(100).unwrap();
    let mut two = [0u8; 2];
    chunk.read_exact(&mut two).unwrap();
    assert_eq!(&two, b"he");
    chunk.finish().unwrap();

    assert_eq!(reader.take_u32().unwrap(), 42);
}

#[test]
fn streaming_opaque_reader_enforces_the_maximum() {
    let registry = Registry::new();
    let wire = [0x00, 0x00, 0x00, 0x09];
    let mut reader = registry.reader(&wire[..]);
    let err = reader.opaque_chunk(8).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LengthExceedsMax);
}

#[test]
fn writer_and_reader_factories_roundtrip_through_io() {
    let registry = Registry::new();
    let node = Node {
        value: 11,
        next: None,
    };

    let mut sink = Vec::new();
    {
        let mut w = registry.writer(&mut sink);
        w.encode(&node).unwrap();
        w.encode(&node.value).unwrap();
    }

    let mut source = Cursor::new(sink);
    let mut reader = registry.reader(&mut source);
    let mut out = Node::default();
    reader.decode(&mut out).unwrap();
    assert_eq!(out, node);
    let mut n = 0u32;
    reader.decode(&mut n).unwrap();
    assert_eq!(n, 11);
}

#[test]
fn pooled_marshal_buffers_produce_stable_output() {
    let registry = Registry::new();
    let node = Node {
        value: 1,
        next: Some(Box::new(Node {
            value: 2,
            next: None,
        })),
    };

    let first = registry.marshal(&node).unwrap();
    // Second call reuses the pooled scratch buffer and codec cache.
    let second = registry.marshal(&node).unwrap();
    assert_eq!(first, second);

    let err = registry.marshal(&Option::<i32>::None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NilPointer);
    // A failed marshal returns its scratch too; the pool stays usable.
    let third = registry.marshal(&node).unwrap();
    assert_eq!(first, third);
}

#[test]
fn write_and_read_helpers_buffer_the_stream() {
    let registry = Registry::new();
    let node = Node {
        value: 5,
        next: None,
    };

    let mut sink = Vec::new();
    registry.write(&mut sink, &node).unwrap();

    let mut out = Node::default();
    registry.read(&sink[..], &mut out).unwrap();
    assert_eq!(out, node);
}
