#![allow(dead_code)]

use std::fmt::Write;
use std::sync::Arc;

use thriftjit::{Backend, Error, Heap, Options, Session, TypeDescriptor, Value, value};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One session per backend. Hosts without native support run the emulator twice.
pub fn sessions(options: Options) -> Vec<(Backend, Session)> {
    init_tracing();
    [Backend::Native, Backend::Interpreter]
        .into_iter()
        .map(|b| (b, Session::new(options.clone().backend(b))))
        .collect()
}

pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write!(out, "{b:02x}").unwrap();
    }
    out
}

pub fn encode(s: &Session, ty: &Arc<TypeDescriptor>, v: &Value) -> Result<Vec<u8>, Error> {
    let mut heap = Heap::new();
    let root = value::alloc_value(&mut heap, ty, v).unwrap();
    s.encode_to_vec(ty, &mut heap, root)
}

pub fn decode(s: &Session, ty: &Arc<TypeDescriptor>, bytes: &[u8]) -> Result<(Value, usize), Error> {
    let mut heap = Heap::new();
    let d = s.decode_new(ty, bytes, &mut heap)?;
    Ok((value::read_value(&heap, d.root, ty).unwrap(), d.consumed))
}

pub fn strukt(fields: Vec<Option<Value>>) -> Value {
    Value::Struct(thriftjit::StructValue::new(fields))
}
