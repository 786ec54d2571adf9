//! Type descriptions: the static mirror of a Rust type that the codec
//! compiler consumes.
//!
//! Every encodable type implements [`XdrType`] and exposes a `&'static`
//! [`Shape`]: its kind, plus erased accessor tables (plain function
//! pointers over `&dyn Any`) for composite kinds. `#[derive(Xdr)]` emits
//! the impl for user structs; the impls for primitives and standard
//! containers live here.
//!
//! Edges between shapes are lazy (`fn() -> &'static Shape`), so recursive
//! types describe themselves without recursing at construction time.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::OnceLock;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::wire::{WireRead, WireWrite};
use crate::Result;

/// A lazy edge to another type's shape.
pub type ShapeFn = fn() -> &'static Shape;

/// Types that can be encoded to and decoded from XDR.
///
/// Usually implemented with `#[derive(Xdr)]`. Manual implementations
/// return a shape built with [`Shape::custom`] for types that marshal
/// themselves (see [`Marshal`]).
pub trait XdrType: 'static {
    fn shape() -> &'static Shape;
}

/// Static description of one type.
pub struct Shape {
    /// Short name used in diagnostics and error paths.
    pub name: &'static str,
    /// Produces the `TypeId` of the described type.
    pub type_id: fn() -> TypeId,
    pub kind: Kind,
}

impl Shape {
    pub fn id(&self) -> TypeId {
        (self.type_id)()
    }

    /// Shape of a self-marshaling type.
    pub fn custom<T: Marshal>(name: &'static str) -> Shape {
        Shape {
            name,
            type_id: type_id_of::<T>,
            kind: Kind::Custom {
                vt: CustomVtable {
                    encode: custom_encode::<T>,
                    decode: custom_decode::<T>,
                },
            },
        }
    }
}

/// The kind of a type, with erased accessors for composite kinds.
#[derive(Clone, Copy)]
pub enum Kind {
    Bool,
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// An ordered (re, im) pair of 32-bit floats.
    Complex32 { vt: Complex32Vtable },
    /// An ordered (re, im) pair of 64-bit floats.
    Complex64 { vt: Complex64Vtable },
    Str { vt: StrVtable },
    /// Fixed-size array of `len` elements.
    Array { len: usize, elem: ShapeFn, vt: ArrayVtable },
    /// Growable sequence.
    Seq { elem: ShapeFn, vt: SeqVtable },
    Map { key: ShapeFn, value: ShapeFn, vt: MapVtable },
    /// Nullable indirection (`Option`).
    Opt { inner: ShapeFn, vt: OptVtable },
    /// Non-null indirection (`Box`).
    Ptr { inner: ShapeFn, vt: PtrVtable },
    Struct { fields: &'static [FieldDef] },
    /// A type that marshals itself through [`Marshal`].
    Custom { vt: CustomVtable },
}

/// One field of a struct shape.
pub struct FieldDef {
    pub name: &'static str,
    /// The raw `#[xdr("...")]` tag text; parsed when the codec is built.
    pub tag: &'static str,
    pub shape: ShapeFn,
    pub get: fn(&dyn Any) -> &dyn Any,
    pub get_mut: fn(&mut dyn Any) -> &mut dyn Any,
}

#[derive(Clone, Copy)]
pub struct StrVtable {
    pub get: fn(&dyn Any) -> &str,
    pub set: fn(&mut dyn Any, String),
}

#[derive(Clone, Copy)]
pub struct ArrayVtable {
    pub get: fn(&dyn Any, usize) -> &dyn Any,
    pub get_mut: fn(&mut dyn Any, usize) -> &mut dyn Any,
    /// Dense byte view; `Some` only for `[u8; N]`.
    pub bytes: fn(&dyn Any) -> Option<&[u8]>,
    pub bytes_mut: fn(&mut dyn Any) -> Option<&mut [u8]>,
}

#[derive(Clone, Copy)]
pub struct SeqVtable {
    pub len: fn(&dyn Any) -> usize,
    pub get: fn(&dyn Any, usize) -> &dyn Any,
    pub get_mut: fn(&mut dyn Any, usize) -> &mut dyn Any,
    /// Clears and refills with `len` default elements.
    pub resize_default: fn(&mut dyn Any, usize),
    /// Dense byte view; `Some` only for `Vec<u8>`.
    pub bytes: fn(&dyn Any) -> Option<&[u8]>,
    pub set_bytes: fn(&mut dyn Any, Vec<u8>),
}

#[derive(Clone, Copy)]
pub struct MapVtable {
    pub len: fn(&dyn Any) -> usize,
    /// Visits entries in the map's own iteration order.
    pub visit: fn(&dyn Any, &mut dyn FnMut(&dyn Any, &dyn Any) -> Result<()>) -> Result<()>,
    pub clear: fn(&mut dyn Any),
    pub new_key: fn() -> Box<dyn Any>,
    pub new_value: fn() -> Box<dyn Any>,
    pub insert: fn(&mut dyn Any, Box<dyn Any>, Box<dyn Any>),
}

#[derive(Clone, Copy)]
pub struct OptVtable {
    pub is_some: fn(&dyn Any) -> bool,
    pub get: fn(&dyn Any) -> &dyn Any,
    pub get_mut: fn(&mut dyn Any) -> &mut dyn Any,
    /// Replaces the slot with `Some(Default::default())`.
    pub set_default: fn(&mut dyn Any),
    pub set_none: fn(&mut dyn Any),
}

#[derive(Clone, Copy)]
pub struct PtrVtable {
    pub get: fn(&dyn Any) -> &dyn Any,
    pub get_mut: fn(&mut dyn Any) -> &mut dyn Any,
}

#[derive(Clone, Copy)]
pub struct Complex32Vtable {
    pub get: fn(&dyn Any) -> (f32, f32),
    pub set: fn(&mut dyn Any, f32, f32),
}

#[derive(Clone, Copy)]
pub struct Complex64Vtable {
    pub get: fn(&dyn Any) -> (f64, f64),
    pub set: fn(&mut dyn Any, f64, f64),
}

#[derive(Clone, Copy)]
pub struct CustomVtable {
    pub encode: fn(&dyn Any, &mut dyn WireWrite) -> Result<()>,
    pub decode: fn(&mut dyn Any, &mut dyn WireRead) -> Result<()>,
}

/// Types that define their own XDR wire form.
///
/// A `Marshal` type replaces the derived layout entirely: `marshal_xdr`
/// and `unmarshal_xdr` speak to the wire layer directly. Pair it with a
/// manual [`XdrType`] impl returning [`Shape::custom`].
pub trait Marshal: 'static {
    fn marshal_xdr(&self, w: &mut dyn WireWrite) -> Result<()>;
    fn unmarshal_xdr(&mut self, r: &mut dyn WireRead) -> Result<()>;
}

fn custom_encode<T: Marshal>(value: &dyn Any, w: &mut dyn WireWrite) -> Result<()> {
    expect_ref::<T>(value).marshal_xdr(w)
}

fn custom_decode<T: Marshal>(value: &mut dyn Any, r: &mut dyn WireRead) -> Result<()> {
    expect_mut::<T>(value).unmarshal_xdr(r)
}

/// `TypeId` of `T`, as a plain function usable in shape tables.
pub fn type_id_of<T: 'static>() -> TypeId {
    TypeId::of::<T>()
}

/// Downcasts an erased value reference.
///
/// Panics on mismatch: shapes and codecs are constructed per concrete
/// type, so a mismatch here is a bug in the caller of the erased API.
#[track_caller]
pub fn expect_ref<T: 'static>(value: &dyn Any) -> &T {
    match value.downcast_ref::<T>() {
        Some(concrete) => concrete,
        None => panic!(
            "value does not match codec (expected {})",
            std::any::type_name::<T>()
        ),
    }
}

/// Mutable counterpart of [`expect_ref`].
#[track_caller]
pub fn expect_mut<T: 'static>(value: &mut dyn Any) -> &mut T {
    match value.downcast_mut::<T>() {
        Some(concrete) => concrete,
        None => panic!(
            "value does not match codec (expected {})",
            std::any::type_name::<T>()
        ),
    }
}

/// Interns the shape of a generic type instantiation.
///
/// Generic impls cannot carry one `static` per instantiation, so their
/// shapes are built once and leaked into a process-wide table keyed by
/// `TypeId`. `build` must not look up other shapes (edges are lazy).
pub fn intern<T: 'static>(build: impl FnOnce() -> Shape) -> &'static Shape {
    static TABLE: OnceLock<Mutex<FxHashMap<TypeId, &'static Shape>>> = OnceLock::new();
    let table = TABLE.get_or_init(|| Mutex::new(FxHashMap::default()));
    let mut table = table.lock();
    if let Some(shape) = table.get(&TypeId::of::<T>()) {
        return *shape;
    }
    let shape: &'static Shape = Box::leak(Box::new(build()));
    table.insert(TypeId::of::<T>(), shape);
    shape
}

macro_rules! primitive_shapes {
    ($($ty:ty => $name:literal, $kind:expr;)*) => {
        $(
            impl XdrType for $ty {
                fn shape() -> &'static Shape {
                    static SHAPE: Shape = Shape {
                        name: $name,
                        type_id: type_id_of::<$ty>,
                        kind: $kind,
                    };
                    &SHAPE
                }
            }
        )*
    };
}

primitive_shapes! {
    bool => "bool", Kind::Bool;
    i8   => "i8",   Kind::I8;
    i16  => "i16",  Kind::I16;
    i32  => "i32",  Kind::I32;
    u8   => "u8",   Kind::U8;
    u16  => "u16",  Kind::U16;
    u32  => "u32",  Kind::U32;
    i64  => "i64",  Kind::I64;
    u64  => "u64",  Kind::U64;
    f32  => "f32",  Kind::F32;
    f64  => "f64",  Kind::F64;
}

impl XdrType for String {
    fn shape() -> &'static Shape {
        fn get(value: &dyn Any) -> &str {
            expect_ref::<String>(value).as_str()
        }
        fn set(value: &mut dyn Any, s: String) {
            *expect_mut::<String>(value) = s;
        }
        static SHAPE: Shape = Shape {
            name: "String",
            type_id: type_id_of::<String>,
            kind: Kind::Str {
                vt: StrVtable { get, set },
            },
        };
        &SHAPE
    }
}

fn seq_len<T: 'static>(value: &dyn Any) -> usize {
    expect_ref::<Vec<T>>(value).len()
}

fn seq_get<T: 'static>(value: &dyn Any, index: usize) -> &dyn Any {
    &expect_ref::<Vec<T>>(value)[index]
}

fn seq_get_mut<T: 'static>(value: &mut dyn Any, index: usize) -> &mut dyn Any {
    &mut expect_mut::<Vec<T>>(value)[index]
}

fn seq_resize_default<T: Default + 'static>(value: &mut dyn Any, len: usize) {
    let seq = expect_mut::<Vec<T>>(value);
    seq.clear();
    seq.resize_with(len, T::default);
}

fn vec_bytes(value: &dyn Any) -> Option<&[u8]> {
    value.downcast_ref::<Vec<u8>>().map(Vec::as_slice)
}

fn vec_set_bytes(value: &mut dyn Any, bytes: Vec<u8>) {
    *expect_mut::<Vec<u8>>(value) = bytes;
}

impl<T: XdrType + Default> XdrType for Vec<T> {
    fn shape() -> &'static Shape {
        intern::<Vec<T>>(|| Shape {
            name: "Vec",
            type_id: type_id_of::<Vec<T>>,
            kind: Kind::Seq {
                elem: T::shape,
                vt: SeqVtable {
                    len: seq_len::<T>,
                    get: seq_get::<T>,
                    get_mut: seq_get_mut::<T>,
                    resize_default: seq_resize_default::<T>,
                    bytes: vec_bytes,
                    set_bytes: vec_set_bytes,
                },
            },
        })
    }
}

fn arr_get<T: 'static, const N: usize>(value: &dyn Any, index: usize) -> &dyn Any {
    &expect_ref::<[T; N]>(value)[index]
}

fn arr_get_mut<T: 'static, const N: usize>(value: &mut dyn Any, index: usize) -> &mut dyn Any {
    &mut expect_mut::<[T; N]>(value)[index]
}

fn arr_bytes<const N: usize>(value: &dyn Any) -> Option<&[u8]> {
    value.downcast_ref::<[u8; N]>().map(|a| a.as_slice())
}

fn arr_bytes_mut<const N: usize>(value: &mut dyn Any) -> Option<&mut [u8]> {
    value.downcast_mut::<[u8; N]>().map(|a| a.as_mut_slice())
}

impl<T: XdrType + Default, const N: usize> XdrType for [T; N] {
    fn shape() -> &'static Shape {
        intern::<[T; N]>(|| Shape {
            name: "array",
            type_id: type_id_of::<[T; N]>,
            kind: Kind::Array {
                len: N,
                elem: T::shape,
                vt: ArrayVtable {
                    get: arr_get::<T, N>,
                    get_mut: arr_get_mut::<T, N>,
                    bytes: arr_bytes::<N>,
                    bytes_mut: arr_bytes_mut::<N>,
                },
            },
        })
    }
}

fn opt_is_some<T: 'static>(value: &dyn Any) -> bool {
    expect_ref::<Option<T>>(value).is_some()
}

fn opt_get<T: 'static>(value: &dyn Any) -> &dyn Any {
    match expect_ref::<Option<T>>(value) {
        Some(inner) => inner,
        None => panic!("optional value unexpectedly absent"),
    }
}

fn opt_get_mut<T: 'static>(value: &mut dyn Any) -> &mut dyn Any {
    match expect_mut::<Option<T>>(value) {
        Some(inner) => inner,
        None => panic!("optional value unexpectedly absent"),
    }
}

fn opt_set_default<T: Default + 'static>(value: &mut dyn Any) {
    *expect_mut::<Option<T>>(value) = Some(T::default());
}

fn opt_set_none<T: 'static>(value: &mut dyn Any) {
    *expect_mut::<Option<T>>(value) = None;
}

impl<T: XdrType + Default> XdrType for Option<T> {
    fn shape() -> &'static Shape {
        intern::<Option<T>>(|| Shape {
            name: "Option",
            type_id: type_id_of::<Option<T>>,
            kind: Kind::Opt {
                inner: T::shape,
                vt: OptVtable {
                    is_some: opt_is_some::<T>,
                    get: opt_get::<T>,
                    get_mut: opt_get_mut::<T>,
                    set_default: opt_set_default::<T>,
                    set_none: opt_set_none::<T>,
                },
            },
        })
    }
}

fn ptr_get<T: 'static>(value: &dyn Any) -> &dyn Any {
    &**expect_ref::<Box<T>>(value)
}

fn ptr_get_mut<T: 'static>(value: &mut dyn Any) -> &mut dyn Any {
    &mut **expect_mut::<Box<T>>(value)
}

impl<T: XdrType + Default> XdrType for Box<T> {
    fn shape() -> &'static Shape {
        intern::<Box<T>>(|| Shape {
            name: "Box",
            type_id: type_id_of::<Box<T>>,
            kind: Kind::Ptr {
                inner: T::shape,
                vt: PtrVtable {
                    get: ptr_get::<T>,
                    get_mut: ptr_get_mut::<T>,
                },
            },
        })
    }
}

fn hash_map_len<K: 'static, V: 'static>(value: &dyn Any) -> usize {
    expect_ref::<HashMap<K, V>>(value).len()
}

fn hash_map_visit<K: 'static, V: 'static>(
    value: &dyn Any,
    f: &mut dyn FnMut(&dyn Any, &dyn Any) -> Result<()>,
) -> Result<()> {
    for (k, v) in expect_ref::<HashMap<K, V>>(value) {
        f(k, v)?;
    }
    Ok(())
}

fn hash_map_clear<K: 'static, V: 'static>(value: &mut dyn Any) {
    expect_mut::<HashMap<K, V>>(value).clear();
}

fn boxed_default<T: Default + 'static>() -> Box<dyn Any> {
    Box::new(T::default())
}

fn unbox<T: 'static>(value: Box<dyn Any>) -> T {
    match value.downcast::<T>() {
        Ok(concrete) => *concrete,
        Err(_) => panic!(
            "value does not match codec (expected {})",
            std::any::type_name::<T>()
        ),
    }
}

fn hash_map_insert<K: Eq + Hash + 'static, V: 'static>(
    value: &mut dyn Any,
    key: Box<dyn Any>,
    val: Box<dyn Any>,
) {
    expect_mut::<HashMap<K, V>>(value).insert(unbox::<K>(key), unbox::<V>(val));
}

impl<K, V> XdrType for HashMap<K, V>
where
    K: XdrType + Default + Eq + Hash,
    V: XdrType + Default,
{
    fn shape() -> &'static Shape {
        intern::<HashMap<K, V>>(|| Shape {
            name: "HashMap",
            type_id: type_id_of::<HashMap<K, V>>,
            kind: Kind::Map {
                key: K::shape,
                value: V::shape,
                vt: MapVtable {
                    len: hash_map_len::<K, V>,
                    visit: hash_map_visit::<K, V>,
                    clear: hash_map_clear::<K, V>,
                    new_key: boxed_default::<K>,
                    new_value: boxed_default::<V>,
                    insert: hash_map_insert::<K, V>,
                },
            },
        })
    }
}

fn btree_map_len<K: 'static, V: 'static>(value: &dyn Any) -> usize {
    expect_ref::<BTreeMap<K, V>>(value).len()
}

fn btree_map_visit<K: 'static, V: 'static>(
    value: &dyn Any,
    f: &mut dyn FnMut(&dyn Any, &dyn Any) -> Result<()>,
) -> Result<()> {
    for (k, v) in expect_ref::<BTreeMap<K, V>>(value) {
        f(k, v)?;
    }
    Ok(())
}

fn btree_map_clear<K: 'static, V: 'static>(value: &mut dyn Any) {
    expect_mut::<BTreeMap<K, V>>(value).clear();
}

fn btree_map_insert<K: Ord + 'static, V: 'static>(
    value: &mut dyn Any,
    key: Box<dyn Any>,
    val: Box<dyn Any>,
) {
    expect_mut::<BTreeMap<K, V>>(value).insert(unbox::<K>(key), unbox::<V>(val));
}

impl<K, V> XdrType for BTreeMap<K, V>
where
    K: XdrType + Default + Ord,
    V: XdrType + Default,
{
    fn shape() -> &'static Shape {
        intern::<BTreeMap<K, V>>(|| Shape {
            name: "BTreeMap",
            type_id: type_id_of::<BTreeMap<K, V>>,
            kind: Kind::Map {
                key: K::shape,
                value: V::shape,
                vt: MapVtable {
                    len: btree_map_len::<K, V>,
                    visit: btree_map_visit::<K, V>,
                    clear: btree_map_clear::<K, V>,
                    new_key: boxed_default::<K>,
                    new_value: boxed_default::<V>,
                    insert: btree_map_insert::<K, V>,
                },
            },
        })
    }
}
