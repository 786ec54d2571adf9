//! Union declaration, discriminant handling, arm selection, and the
//! rejection rules for malformed union schemas.

use xdr_wire::{marshal, unmarshal, unmarshal_into, ErrorKind, Xdr};

#[derive(Xdr, Default, PartialEq, Debug)]
struct Value {
    #[xdr("union:switch")]
    sw: i32,
    #[xdr("union:0")]
    number: i32,
    #[xdr("union:1")]
    flag: bool,
    #[xdr("union:2,3")]
    text: String,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct WithDefault {
    #[xdr("union:switch")]
    kind: u32,
    #[xdr("union:0x10")]
    narrow: u32,
    #[xdr("union:default")]
    fallback: u64,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct BoolSwitch {
    #[xdr("union:switch")]
    ok: bool,
    #[xdr("union:true")]
    result: u32,
    #[xdr("union:false")]
    error: String,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct NarrowSwitch {
    #[xdr("union:switch")]
    sw: i16,
    #[xdr("union:0xffffffff")]
    minus_one: u32,
    #[xdr("union:default")]
    other: u32,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct SkippedMember {
    #[xdr("-")]
    local_only: u32,
    #[xdr("union:switch")]
    sw: i32,
    #[xdr("union:0")]
    a: u32,
    #[xdr("-")]
    also_local: u32,
    #[xdr("union:1")]
    b: u32,
}

#[test]
fn discriminant_then_selected_arm() {
    let bytes = marshal(&Value {
        sw: 0,
        number: 0x1234_5678,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(&bytes[..], [0x00, 0x00, 0x00, 0x00, 0x12, 0x34, 0x56, 0x78]);
}

#[test]
fn arms_roundtrip() {
    for value in [
        Value {
            sw: 0,
            number: -5,
            ..Default::default()
        },
        Value {
            sw: 1,
            flag: true,
            ..Default::default()
        },
        Value {
            sw: 2,
            text: "shared".into(),
            ..Default::default()
        },
        Value {
            sw: 3,
            text: "arm".into(),
            ..Default::default()
        },
    ] {
        let bytes = marshal(&value).unwrap();
        let out: Value = unmarshal(&bytes).unwrap();
        assert_eq!(out, value);
    }
}

#[test]
fn multi_case_arm_accepts_each_value() {
    let a = marshal(&Value {
        sw: 2,
        text: "x".into(),
        ..Default::default()
    })
    .unwrap();
    let b = marshal(&Value {
        sw: 3,
        text: "x".into(),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(&a[4..], &b[4..]);
    assert_ne!(&a[..4], &b[..4]);
}

#[test]
fn default_arm_catches_unknown_discriminants() {
    let value = WithDefault {
        kind: 999,
        fallback: 77,
        ..Default::default()
    };
    let bytes = marshal(&value).unwrap();
    assert_eq!(bytes.len(), 12);
    let out: WithDefault = unmarshal(&bytes).unwrap();
    assert_eq!(out, value);
}

#[test]
fn unknown_discriminant_without_default_fails() {
    let err = marshal(&Value {
        sw: 9,
        ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnionSwitchArmUndefined);

    let err = unmarshal::<Value>(&[0, 0, 0, 9]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnionSwitchArmUndefined);
}

#[test]
fn boolean_switch_uses_true_false_cases() {
    let ok = marshal(&BoolSwitch {
        ok: true,
        result: 7,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(&ok[..], [0, 0, 0, 1, 0, 0, 0, 7]);

    let failed = BoolSwitch {
        ok: false,
        error: "nope".into(),
        ..Default::default()
    };
    let bytes = marshal(&failed).unwrap();
    let out: BoolSwitch = unmarshal(&bytes).unwrap();
    assert_eq!(out, failed);
}

#[test]
fn narrow_switch_widens_to_a_word() {
    let value = NarrowSwitch {
        sw: -1,
        minus_one: 1,
        ..Default::default()
    };
    let bytes = marshal(&value).unwrap();
    // Two's-complement bit pattern of the i16 as a 32-bit word.
    assert_eq!(&bytes[..4], [0xff, 0xff, 0xff, 0xff]);
    let out: NarrowSwitch = unmarshal(&bytes).unwrap();
    assert_eq!(out, value);
}

#[test]
fn skipped_fields_are_ignored_in_unions() {
    let value = SkippedMember {
        local_only: 123,
        sw: 1,
        a: 0,
        also_local: 456,
        b: 9,
    };
    let bytes = marshal(&value).unwrap();
    assert_eq!(&bytes[..], [0, 0, 0, 1, 0, 0, 0, 9]);

    let out: SkippedMember = unmarshal(&bytes).unwrap();
    assert_eq!(out.sw, 1);
    assert_eq!(out.b, 9);
    assert_eq!(out.local_only, 0);
}

#[test]
fn decode_leaves_unselected_arms_untouched() {
    let bytes = marshal(&Value {
        sw: 1,
        flag: true,
        ..Default::default()
    })
    .unwrap();

    let mut out = Value {
        sw: 0,
        number: 42,
        flag: false,
        text: "stale".into(),
    };
    unmarshal_into(&bytes, &mut out).unwrap();
    assert_eq!(out.sw, 1);
    assert!(out.flag);
    assert_eq!(out.number, 42);
    assert_eq!(out.text, "stale");
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct DuplicateCase {
    #[xdr("union:switch")]
    sw: u32,
    #[xdr("union:1")]
    a: u32,
    #[xdr("union:1")]
    b: u32,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct DoubleDefault {
    #[xdr("union:switch")]
    sw: u32,
    #[xdr("union:default")]
    a: u32,
    #[xdr("union:default")]
    b: u32,
}

#[derive(Xdr, Default, PartialEq, Debug)]
struct MissingCase {
    #[xdr("union:switch")]
    sw: u32,
    untagged: u32,
}

#[test]
fn duplicate_case_values_are_rejected() {
    let err = marshal(&DuplicateCase::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTagForType);
}

#[test]
fn two_default_arms_are_rejected() {
    let err = marshal(&DoubleDefault::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTagForType);
}

#[test]
fn union_members_must_carry_a_case() {
    let err = marshal(&MissingCase::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTagForType);
}

#[test]
fn construction_failures_repeat_consistently() {
    let first = marshal(&DuplicateCase::default()).unwrap_err();
    let second = marshal(&DuplicateCase::default()).unwrap_err();
    assert_eq!(first.kind(), second.kind());
    assert_eq!(first.to_string(), second.to_string());
}
