//! The barrier flag is process-wide, so everything touching it lives in
//! this one test binary and one test.

mod common;

use std::sync::Arc;

use thriftjit::{Backend, Heap, Options, RecordingBarrier, Session, TypeDescriptor, barrier};

#[test]
fn pointer_stores_report_to_the_sink_only_while_active() {
    common::init_tracing();
    let ty = TypeDescriptor::structure("Named")
        .field(1, "name", TypeDescriptor::string())
        .build()
        .unwrap();
    let input = [0x0b, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, b'h', b'i', 0x00];

    for backend in [Backend::Native, Backend::Interpreter] {
        let sink = Arc::new(RecordingBarrier::new());
        let session = Session::with_sink(Options::default().backend(backend), sink.clone());

        let mut heap = Heap::new();
        let root = heap.alloc(ty.size as usize).unwrap();
        barrier::set_active(false);
        session.decode(&ty, &input, &mut heap, root).unwrap();
        assert!(sink.calls().is_empty(), "{backend:?}");

        let mut heap = Heap::new();
        let root = heap.alloc(ty.size as usize).unwrap();
        barrier::set_active(true);
        let result = session.decode(&ty, &input, &mut heap, root);
        barrier::set_active(false);
        assert_eq!(result.unwrap(), input.len());

        let data = heap.read_u32(root);
        assert_eq!(heap.bytes(data, 2), b"hi");
        assert_eq!(sink.calls(), [(root, 0, data)], "{backend:?}");
    }
}
