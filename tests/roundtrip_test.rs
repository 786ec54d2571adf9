//! Round-trip coverage across the supported type mapping: nested structs,
//! containers, optionals, pointers, recursion, and float edge cases.

use std::collections::{BTreeMap, HashMap};

use xdr_wire::{marshal, unmarshal, Xdr};

#[derive(Xdr, Default, PartialEq, Debug, Clone)]
struct Attr {
    key: String,
    value: u32,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Entry {
    name: String,
    size: u64,
    attrs: Vec<Attr>,
    #[xdr("maxlen:64/opaque")]
    digest: Vec<u8>,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Skipped {
    kept: u32,
    #[xdr("-")]
    dropped: u32,
    also_kept: u32,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Numbers {
    float: f32,
    double: f64,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Node {
    value: u32,
    #[xdr("opt")]
    next: Option<Box<Node>>,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Boxed {
    inner: Box<u32>,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Counters {
    #[xdr("maxlen:8")]
    by_name: BTreeMap<String, u32>,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Unordered {
    by_id: HashMap<u32, String>,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct Matrix {
    rows: [[i16; 2]; 2],
}

fn roundtrip<T: xdr_wire::XdrType + Default + PartialEq + std::fmt::Debug>(value: &T) -> T {
    let bytes = marshal(value).unwrap();
    let out: T = unmarshal(&bytes).unwrap();
    assert_eq!(&out, value);
    out
}

#[test]
fn nested_struct_roundtrips() {
    roundtrip(&Entry {
        name: "README".into(),
        size: 8192,
        attrs: vec![
            Attr {
                key: "mode".into(),
                value: 0o644,
            },
            Attr {
                key: "uid".into(),
                value: 1000,
            },
        ],
        digest: vec![0xde, 0xad, 0xbe, 0xef, 0x01],
    });
}

#[test]
fn empty_containers_roundtrip() {
    roundtrip(&Entry::default());
    roundtrip(&Counters::default());
}

#[test]
fn skipped_fields_take_no_wire_space() {
    let value = Skipped {
        kept: 1,
        dropped: 99,
        also_kept: 2,
    };
    let bytes = marshal(&value).unwrap();
    assert_eq!(bytes.len(), 8);
    let out: Skipped = unmarshal(&bytes).unwrap();
    assert_eq!(out.kept, 1);
    assert_eq!(out.also_kept, 2);
    assert_eq!(out.dropped, 0);
}

#[test]
fn floats_roundtrip_including_infinities() {
    roundtrip(&Numbers {
        float: f32::MIN_POSITIVE,
        double: f64::MAX,
    });
    roundtrip(&Numbers {
        float: f32::NEG_INFINITY,
        double: f64::INFINITY,
    });
}

#[test]
fn nan_roundtrips_semantically() {
    let bytes = marshal(&Numbers {
        float: f32::NAN,
        double: f64::NAN,
    })
    .unwrap();
    let out: Numbers = unmarshal(&bytes).unwrap();
    assert!(out.float.is_nan());
    assert!(out.double.is_nan());
}

#[test]
fn recursive_list_roundtrips() {
    let list = Node {
        value: 1,
        next: Some(Box::new(Node {
            value: 2,
            next: Some(Box::new(Node { value: 3, next: None })),
        })),
    };
    let bytes = marshal(&list).unwrap();
    // Three (value, presence) pairs: 6 words.
    assert_eq!(bytes.len(), 24);
    let out: Node = unmarshal(&bytes).unwrap();
    assert_eq!(out, list);
}

#[test]
fn box_is_transparent_on_the_wire() {
    let bytes = marshal(&Boxed { inner: Box::new(9) }).unwrap();
    assert_eq!(&bytes[..], [0, 0, 0, 9]);
    roundtrip(&Boxed { inner: Box::new(9) });
}

#[test]
fn btree_map_roundtrips_with_deterministic_order() {
    let mut by_name = BTreeMap::new();
    by_name.insert("alpha".to_string(), 1);
    by_name.insert("beta".to_string(), 2);
    let value = Counters { by_name };

    let first = marshal(&value).unwrap();
    let second = marshal(&value).unwrap();
    assert_eq!(first, second);

    // alpha sorts first: length word, then ("alpha", 1), then ("beta", 2).
    assert_eq!(&first[..8], [0, 0, 0, 2, 0, 0, 0, 5]);

    let out: Counters = unmarshal(&first).unwrap();
    assert_eq!(out, value);
}

#[test]
fn hash_map_roundtrips_regardless_of_order() {
    let mut by_id = HashMap::new();
    for i in 0..16u32 {
        by_id.insert(i, format!("name-{i}"));
    }
    roundtrip(&Unordered { by_id });
}

#[test]
fn nested_fixed_arrays_roundtrip() {
    let value = Matrix {
        rows: [[1, -2], [3, -4]],
    };
    let bytes = marshal(&value).unwrap();
    // Every i16 is its own word.
    assert_eq!(bytes.len(), 16);
    let out: Matrix = unmarshal(&bytes).unwrap();
    assert_eq!(out, value);
}

#[test]
fn decode_overwrites_previous_contents() {
    let bytes = marshal(&Entry {
        name: "short".into(),
        size: 1,
        attrs: Vec::new(),
        digest: Vec::new(),
    })
    .unwrap();

    let mut out = Entry {
        name: "previous-name".into(),
        size: 99,
        attrs: vec![Attr::default(); 4],
        digest: vec![1, 2, 3],
    };
    xdr_wire::unmarshal_into(&bytes, &mut out).unwrap();
    assert_eq!(out.name, "short");
    assert_eq!(out.size, 1);
    assert!(out.attrs.is_empty());
    assert!(out.digest.is_empty());
}
