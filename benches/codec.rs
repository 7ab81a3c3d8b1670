use divan::{Bencher, black_box};
use std::sync::{Arc, LazyLock};
use thriftjit::{Backend, Heap, Options, Session, StructValue, TypeDescriptor, Value, value};

fn main() {
    divan::main();
}

// ── Sessions ────────────────────────────────────────────────────────────────

static NATIVE: LazyLock<Session> = LazyLock::new(|| Session::new(Options::default()));
static EMULATED: LazyLock<Session> =
    LazyLock::new(|| Session::new(Options::default().backend(Backend::Interpreter)));

// ── Shared types ────────────────────────────────────────────────────────────

static FRIEND: LazyLock<Arc<TypeDescriptor>> = LazyLock::new(|| {
    TypeDescriptor::structure("Friend")
        .required(1, "age", TypeDescriptor::i32())
        .field(2, "name", TypeDescriptor::string())
        .build()
        .unwrap()
});

static ROSTER: LazyLock<Arc<TypeDescriptor>> = LazyLock::new(|| {
    TypeDescriptor::structure("Roster")
        .field(1, "friends", TypeDescriptor::list(FRIEND.clone()))
        .field(2, "scores", TypeDescriptor::map(TypeDescriptor::string(), TypeDescriptor::double()))
        .field(3, "ids", TypeDescriptor::list(TypeDescriptor::i64()))
        .build()
        .unwrap()
});

fn friend(i: usize) -> Value {
    Value::Struct(StructValue::new(vec![
        Some(Value::I32(20 + i as i32)),
        Some(Value::String(format!("friend number {i}"))),
    ]))
}

fn roster() -> Value {
    Value::Struct(StructValue::new(vec![
        Some(Value::List((0..64).map(friend).collect())),
        Some(Value::Map(
            (0..32).map(|i| (Value::String(format!("k{i}")), Value::Double(i as f64 / 3.0))).collect(),
        )),
        Some(Value::List((0..256).map(Value::I64).collect())),
    ]))
}

/// A heap holding `v`, and the offset of its root.
fn load(ty: &Arc<TypeDescriptor>, v: &Value) -> (Heap, u32) {
    let mut heap = Heap::new();
    let root = value::alloc_value(&mut heap, ty, v).unwrap();
    (heap, root)
}

static FRIEND_ENCODED: LazyLock<Vec<u8>> = LazyLock::new(|| {
    let (mut heap, root) = load(&FRIEND, &friend(7));
    NATIVE.encode_to_vec(&FRIEND, &mut heap, root).unwrap()
});

static ROSTER_ENCODED: LazyLock<Vec<u8>> = LazyLock::new(|| {
    let (mut heap, root) = load(&ROSTER, &roster());
    NATIVE.encode_to_vec(&ROSTER, &mut heap, root).unwrap()
});

fn bench_decode(bencher: Bencher, session: &Session, ty: &Arc<TypeDescriptor>, data: &[u8]) {
    session.pretouch(ty).unwrap();
    bencher.bench_local(|| {
        let mut heap = Heap::with_capacity(4096);
        black_box(session.decode_new(ty, black_box(data), &mut heap).unwrap())
    });
}

fn bench_encode(bencher: Bencher, session: &Session, ty: &Arc<TypeDescriptor>, v: &Value) {
    let (mut heap, root) = load(ty, v);
    let mut out = vec![0u8; session.encoded_size(ty, &mut heap, root).unwrap()];
    bencher.bench_local(|| black_box(session.encode(ty, &mut heap, root, black_box(&mut out)).unwrap()));
}

// ── Benchmarks: flat struct ─────────────────────────────────────────────────

mod flat_struct {
    use super::*;

    #[divan::bench]
    fn decode_native(bencher: Bencher) {
        bench_decode(bencher, &NATIVE, &FRIEND, &FRIEND_ENCODED);
    }

    #[divan::bench]
    fn decode_emulated(bencher: Bencher) {
        bench_decode(bencher, &EMULATED, &FRIEND, &FRIEND_ENCODED);
    }

    #[divan::bench]
    fn encode_native(bencher: Bencher) {
        bench_encode(bencher, &NATIVE, &FRIEND, &friend(7));
    }

    #[divan::bench]
    fn encode_emulated(bencher: Bencher) {
        bench_encode(bencher, &EMULATED, &FRIEND, &friend(7));
    }
}

// ── Benchmarks: containers ──────────────────────────────────────────────────

mod containers {
    use super::*;

    #[divan::bench]
    fn decode_native(bencher: Bencher) {
        bench_decode(bencher, &NATIVE, &ROSTER, &ROSTER_ENCODED);
    }

    #[divan::bench]
    fn decode_emulated(bencher: Bencher) {
        bench_decode(bencher, &EMULATED, &ROSTER, &ROSTER_ENCODED);
    }

    #[divan::bench]
    fn encode_native(bencher: Bencher) {
        bench_encode(bencher, &NATIVE, &ROSTER, &roster());
    }

    #[divan::bench]
    fn measure_native(bencher: Bencher) {
        let (mut heap, root) = load(&ROSTER, &roster());
        bencher.bench_local(|| black_box(NATIVE.encoded_size(&ROSTER, &mut heap, root).unwrap()));
    }
}

// ── Benchmarks: compilation ─────────────────────────────────────────────────

#[divan::bench]
fn compile_roster(bencher: Bencher) {
    bencher.bench_local(|| {
        let session = Session::new(Options::default());
        black_box(session.lookup(&ROSTER).unwrap());
    });
}
