//! Feature-gated [`XdrType`] impls for popular ecosystem types.
//!
//! - `complex` — `num_complex::Complex<f32>` / `Complex<f64>`, encoded as
//!   the XDR pair-of-floats form (re, then im).
//! - `smol-str` — `smol_str::SmolStr` as an XDR string.
//! - `indexmap` — `indexmap::IndexMap`, encoded in insertion order.

#![allow(unused_imports)]

use std::any::Any;
use std::hash::Hash;

#[cfg(feature = "indexmap")]
use indexmap::IndexMap;
#[cfg(feature = "complex")]
use num_complex::Complex;
#[cfg(feature = "smol-str")]
use smol_str::SmolStr;

use crate::shape::{
    expect_mut, expect_ref, intern, type_id_of, Complex32Vtable, Complex64Vtable, Kind, MapVtable,
    Shape, StrVtable, XdrType,
};
use crate::Result;

#[cfg(feature = "complex")]
impl XdrType for Complex<f32> {
    fn shape() -> &'static Shape {
        fn get(value: &dyn Any) -> (f32, f32) {
            let c = expect_ref::<Complex<f32>>(value);
            (c.re, c.im)
        }
        fn set(value: &mut dyn Any, re: f32, im: f32) {
            *expect_mut::<Complex<f32>>(value) = Complex::new(re, im);
        }
        static SHAPE: Shape = Shape {
            name: "Complex<f32>",
            type_id: type_id_of::<Complex<f32>>,
            kind: Kind::Complex32 {
                vt: Complex32Vtable { get, set },
            },
        };
        &SHAPE
    }
}

#[cfg(feature = "complex")]
impl XdrType for Complex<f64> {
    fn shape() -> &'static Shape {
        fn get(value: &dyn Any) -> (f64, f64) {
            let c = expect_ref::<Complex<f64>>(value);
            (c.re, c.im)
        }
        fn set(value: &mut dyn Any, re: f64, im: f64) {
            *expect_mut::<Complex<f64>>(value) = Complex::new(re, im);
        }
        static SHAPE: Shape = Shape {
            name: "Complex<f64>",
            type_id: type_id_of::<Complex<f64>>,
            kind: Kind::Complex64 {
                vt: Complex64Vtable { get, set },
            },
        };
        &SHAPE
    }
}

#[cfg(feature = "smol-str")]
impl XdrType for SmolStr {
    fn shape() -> &'static Shape {
        fn get(value: &dyn Any) -> &str {
            expect_ref::<SmolStr>(value).as_str()
        }
        fn set(value: &mut dyn Any, s: String) {
            *expect_mut::<SmolStr>(value) = SmolStr::from(s);
        }
        static SHAPE: Shape = Shape {
            name: "SmolStr",
            type_id: type_id_of::<SmolStr>,
            kind: Kind::Str {
                vt: StrVtable { get, set },
            },
        };
        &SHAPE
    }
}

#[cfg(feature = "indexmap")]
fn index_map_len<K: 'static, V: 'static>(value: &dyn Any) -> usize {
    expect_ref::<IndexMap<K, V>>(value).len()
}

#[cfg(feature = "indexmap")]
fn index_map_visit<K: 'static, V: 'static>(
    value: &dyn Any,
    f: &mut dyn FnMut(&dyn Any, &dyn Any) -> Result<()>,
) -> Result<()> {
    for (k, v) in expect_ref::<IndexMap<K, V>>(value) {
        f(k, v)?;
    }
    Ok(())
}

#[cfg(feature = "indexmap")]
fn index_map_clear<K: 'static, V: 'static>(value: &mut dyn Any) {
    expect_mut::<IndexMap<K, V>>(value).clear();
}

#[cfg(feature = "indexmap")]
fn boxed_default<T: Default + 'static>() -> Box<dyn Any> {
    Box::new(T::default())
}

#[cfg(feature = "indexmap")]
fn index_map_insert<K: Eq + Hash + 'static, V: 'static>(
    value: &mut dyn Any,
    key: Box<dyn Any>,
    val: Box<dyn Any>,
) {
    fn unbox<T: 'static>(value: Box<dyn Any>) -> T {
        match value.downcast::<T>() {
            Ok(concrete) => *concrete,
            Err(_) => panic!("value does not match codec"),
        }
    }
    expect_mut::<IndexMap<K, V>>(value).insert(unbox::<K>(key), unbox::<V>(val));
}

#[cfg(feature = "indexmap")]
impl<K, V> XdrType for IndexMap<K, V>
where
    K: XdrType + Default + Eq + Hash,
    V: XdrType + Default,
{
    fn shape() -> &'static Shape {
        intern::<IndexMap<K, V>>(|| Shape {
            name: "IndexMap",
            type_id: type_id_of::<IndexMap<K, V>>,
            kind: Kind::Map {
                key: K::shape,
                value: V::shape,
                vt: MapVtable {
                    len: index_map_len::<K, V>,
                    visit: index_map_visit::<K, V>,
                    clear: index_map_clear::<K, V>,
                    new_key: boxed_default::<K>,
                    new_value: boxed_default::<V>,
                    insert: index_map_insert::<K, V>,
                },
            },
        })
    }
}
