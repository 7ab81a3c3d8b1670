mod common;

use std::sync::Arc;

use common::{decode, encode, hex, sessions, strukt};
use thriftjit::{CodecError, DefaultValue, Error, ErrorCode, Options, TypeDescriptor, Value};

fn flag() -> Arc<TypeDescriptor> {
    TypeDescriptor::structure("Flag")
        .field(0, "a", TypeDescriptor::bool())
        .required(16, "p", TypeDescriptor::i64())
        .build()
        .unwrap()
}

fn flag_value() -> Value {
    strukt(vec![Some(Value::Bool(true)), Some(Value::I64(5))])
}

fn codec_error(r: Result<impl std::fmt::Debug, Error>) -> CodecError {
    match r {
        Err(Error::Codec(e)) => e,
        other => panic!("expected a codec error, got {other:?}"),
    }
}

#[test]
fn bool_and_i64_encode_to_the_reference_bytes() {
    let ty = flag();
    for (backend, s) in sessions(Options::default()) {
        let bytes = encode(&s, &ty, &flag_value()).unwrap();
        insta::allow_duplicates! {
            insta::assert_snapshot!(hex(&bytes), @"02 00 00 01 0a 00 10 00 00 00 00 00 00 00 05 00");
        }

        let (back, consumed) = decode(&s, &ty, &bytes).unwrap();
        assert_eq!(back, flag_value(), "{backend:?}");
        assert_eq!(consumed, 16);
    }
}

#[test]
fn trailing_input_is_not_consumed() {
    let ty = flag();
    for (_, s) in sessions(Options::default()) {
        let mut bytes = encode(&s, &ty, &flag_value()).unwrap();
        bytes.extend_from_slice(&[0xaa, 0xbb]);
        let (_, consumed) = decode(&s, &ty, &bytes).unwrap();
        assert_eq!(consumed, 16);
    }
}

#[test]
fn missing_required_field_is_rejected() {
    let ty = flag();
    for (_, s) in sessions(Options::default()) {
        let e = codec_error(decode(&s, &ty, &[0x02, 0x00, 0x00, 0x01, 0x00]));
        assert_eq!(e.code, ErrorCode::MissingRequiredField);
    }
}

#[test]
fn truncated_value_reports_where_it_starts() {
    let ty = flag();
    for (backend, s) in sessions(Options::default()) {
        let e = codec_error(decode(&s, &ty, &[0x0a, 0x00, 0x10, 0x00, 0x00]));
        assert_eq!(e, CodecError { code: ErrorCode::UnexpectedEof, offset: 3 }, "{backend:?}");

        let e = codec_error(decode(&s, &ty, &[]));
        assert_eq!(e, CodecError { code: ErrorCode::UnexpectedEof, offset: 0 });
    }
}

#[test]
fn unknown_and_mistyped_fields_are_skipped() {
    let ty = flag();
    let input = [
        0x08, 0x00, 0x05, 0x00, 0x00, 0x00, 0x07, // i32 id 5
        0x0f, 0x00, 0x06, 0x08, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x09, // list<i32> id 6
        0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // id 0 with the wrong tag
        0x0a, 0x00, 0x10, 0, 0, 0, 0, 0, 0, 0, 0x05, //
        0x00,
    ];
    for (_, s) in sessions(Options::default()) {
        let (back, consumed) = decode(&s, &ty, &input).unwrap();
        assert_eq!(back, strukt(vec![Some(Value::Bool(false)), Some(Value::I64(5))]));
        assert_eq!(consumed, input.len());
    }
}

#[test]
fn repeated_field_id_is_rejected() {
    let ty = flag();
    let p = [0x0a, 0x00, 0x10, 0, 0, 0, 0, 0, 0, 0, 0x05];
    let input: Vec<u8> = p.iter().chain(&p).copied().chain([0x00]).collect();
    for (_, s) in sessions(Options::default()) {
        let e = codec_error(decode(&s, &ty, &input));
        assert_eq!(e.code, ErrorCode::DuplicateField);
    }
}

#[test]
fn unknown_wire_tag_is_rejected() {
    let ty = flag();
    for (_, s) in sessions(Options::default()) {
        let e = codec_error(decode(&s, &ty, &[0x07, 0x00, 0x05, 0x00]));
        assert_eq!(e.code, ErrorCode::InvalidTag);
    }
}

#[test]
fn negative_lengths_are_rejected() {
    let ty = TypeDescriptor::structure("Named")
        .field(1, "name", TypeDescriptor::string())
        .field(2, "ids", TypeDescriptor::list(TypeDescriptor::i32()))
        .build()
        .unwrap();
    for (_, s) in sessions(Options::default()) {
        let e = codec_error(decode(&s, &ty, &[0x0b, 0x00, 0x01, 0xff, 0xff, 0xff, 0xff, 0x00]));
        assert_eq!(e.code, ErrorCode::InvalidLength);

        let e = codec_error(decode(&s, &ty, &[0x0f, 0x00, 0x02, 0x08, 0x80, 0x00, 0x00, 0x00, 0x00]));
        assert_eq!(e.code, ErrorCode::InvalidLength);
    }
}

fn bag() -> Arc<TypeDescriptor> {
    TypeDescriptor::structure("Bag")
        .field(1, "ids", TypeDescriptor::list(TypeDescriptor::i32()))
        .field(2, "attrs", TypeDescriptor::map(TypeDescriptor::string(), TypeDescriptor::i64()))
        .build()
        .unwrap()
}

#[test]
fn container_element_tags_must_match_the_schema() {
    let ty = bag();
    let cases: [(&str, &[u8]); 3] = [
        // list<i32> announced as holding strings
        ("element", &[0x0f, 0x00, 0x01, 0x0b, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x00]),
        // map key announced as i32
        (
            "key",
            &[0x0d, 0x00, 0x02, 0x08, 0x0a, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0x02, 0x00],
        ),
        // map value announced as i32
        (
            "value",
            &[0x0d, 0x00, 0x02, 0x0b, 0x08, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'k', 0x00, 0x00, 0x00, 0x02, 0x00],
        ),
    ];
    for (backend, s) in sessions(Options::default()) {
        for (what, input) in cases {
            let e = codec_error(decode(&s, &ty, input));
            assert_eq!(e.code, ErrorCode::InvalidTag, "{what} on {backend:?}");
        }
    }
}

#[test]
fn empty_containers_accept_any_element_tag() {
    let ty = bag();
    let input = [
        0x0f, 0x00, 0x01, 0x0c, 0x00, 0x00, 0x00, 0x00, // list of structs, none
        0x0d, 0x00, 0x02, 0x02, 0x03, 0x00, 0x00, 0x00, 0x00, // map<bool, i8>, none
        0x00,
    ];
    for (backend, s) in sessions(Options::default()) {
        let (back, consumed) = decode(&s, &ty, &input).unwrap();
        assert_eq!(back, strukt(vec![Some(Value::List(vec![])), Some(Value::Map(vec![]))]), "{backend:?}");
        assert_eq!(consumed, input.len());
    }
}

#[test]
fn sets_reject_duplicate_elements() {
    let ty = TypeDescriptor::structure("Tags")
        .field(1, "tags", TypeDescriptor::set(TypeDescriptor::i32()))
        .build()
        .unwrap();
    let dup = [
        0x0e, 0x00, 0x01, 0x08, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x07, 0x00,
    ];
    let mut distinct = dup;
    distinct[15] = 0x08;
    for (_, s) in sessions(Options::default()) {
        let e = codec_error(decode(&s, &ty, &dup));
        assert_eq!(e.code, ErrorCode::DuplicateSetElement);

        let (back, _) = decode(&s, &ty, &distinct).unwrap();
        assert_eq!(back, strukt(vec![Some(Value::Set(vec![Value::I32(7), Value::I32(8)]))]));

        let repeated = strukt(vec![Some(Value::Set(vec![Value::I32(7), Value::I32(7)]))]);
        let e = codec_error(encode(&s, &ty, &repeated));
        assert_eq!(e.code, ErrorCode::DuplicateSetElement);
    }
}

#[test]
fn absent_optionals_and_default_values_are_omitted() {
    let ty = TypeDescriptor::structure("Opts")
        .optional(1, "x", TypeDescriptor::i32())
        .optional_default(2, "y", TypeDescriptor::i16(), DefaultValue::I16(7))
        .optional(3, "label", TypeDescriptor::string())
        .build()
        .unwrap();
    for (_, s) in sessions(Options::default()) {
        let defaults = strukt(vec![None, Some(Value::I16(7)), None]);
        let bytes = encode(&s, &ty, &defaults).unwrap();
        assert_eq!(bytes, [0x00]);
        let (back, _) = decode(&s, &ty, &bytes).unwrap();
        assert_eq!(back, defaults);

        let set = strukt(vec![Some(Value::I32(1)), Some(Value::I16(3)), Some(Value::String(String::new()))]);
        let bytes = encode(&s, &ty, &set).unwrap();
        assert_eq!(
            hex(&bytes),
            "08 00 01 00 00 00 01 06 00 02 00 03 0b 00 03 00 00 00 00 00"
        );
        let (back, _) = decode(&s, &ty, &bytes).unwrap();
        assert_eq!(back, set);
    }
}

#[test]
fn containers_round_trip() {
    let point = TypeDescriptor::structure("Point")
        .required(1, "x", TypeDescriptor::double())
        .required(2, "y", TypeDescriptor::double())
        .build()
        .unwrap();
    let ty = TypeDescriptor::structure("Shape")
        .field(1, "name", TypeDescriptor::string())
        .field(2, "points", TypeDescriptor::list(point.clone()))
        .field(3, "attrs", TypeDescriptor::map(TypeDescriptor::string(), TypeDescriptor::i64()))
        .field(4, "blob", TypeDescriptor::binary())
        .field(5, "origin", point)
        .field(6, "flags", TypeDescriptor::list(TypeDescriptor::i8()))
        .build()
        .unwrap();
    let pt = |x: f64, y: f64| strukt(vec![Some(Value::Double(x)), Some(Value::Double(y))]);
    let value = strukt(vec![
        Some(Value::String("triangle".into())),
        Some(Value::List(vec![pt(0.0, 0.0), pt(1.5, -2.0), pt(f64::MAX, f64::MIN_POSITIVE)])),
        Some(Value::Map(vec![
            (Value::String("sides".into()), Value::I64(3)),
            (Value::String("".into()), Value::I64(-1)),
        ])),
        Some(Value::Binary(vec![0, 1, 2, 0xff])),
        Some(pt(0.25, 0.5)),
        Some(Value::List(vec![Value::I8(-1), Value::I8(0), Value::I8(127)])),
    ]);
    for (backend, s) in sessions(Options::default()) {
        let bytes = encode(&s, &ty, &value).unwrap();
        let (back, consumed) = decode(&s, &ty, &bytes).unwrap();
        assert_eq!(back, value, "{backend:?}");
        assert_eq!(consumed, bytes.len());
    }
}

#[test]
fn output_buffer_must_fit_the_encoding() {
    let ty = flag();
    for (_, s) in sessions(Options::default()) {
        let mut heap = thriftjit::Heap::new();
        let root = thriftjit::value::alloc_value(&mut heap, &ty, &flag_value()).unwrap();
        let mut out = [0u8; 15];
        let e = codec_error(s.encode(&ty, &mut heap, root, &mut out));
        assert_eq!(e.code, ErrorCode::BufferTooSmall);

        let mut out = [0u8; 16];
        assert_eq!(s.encode(&ty, &mut heap, root, &mut out).unwrap(), 16);
    }
}
