// crates/slave-core/benches/pool_throughput.rs
//
// One Criterion group: warm_throughput — dispatches `Deliver` envelopes
// through the full `dispatcher::on_deliver` pipeline against a pre-warmed,
// single-slot `InterpreterPool`, so the VM spin-up cost (one RustPython
// interpreter + script load) is paid once outside the measured loop,
// mirroring the teacher's `warm_throughput` group.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use slave_core::codec::message_to_body;
use slave_core::storage::NullStorage;
use slave_core::transport::ChannelTransport;
use slave_core::types::{MessageType, Scheme, Tag};
use slave_core::{dispatcher, InterpreterPool, Message, Transport, Value};

fn echo_script() -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("slave_core_bench_{}.py", std::process::id()));
    let mut f = std::fs::File::create(&path).expect("create bench script");
    f.write_all(
        b"def __init__():\n\
          \treturn 0\n\
          def __message__(sid, body):\n\
          \tnet.reply({'echo': body.get('7')})\n",
    )
    .expect("write bench script");
    path
}

fn warm_throughput(c: &mut Criterion) {
    let script = echo_script();
    let (tcp_tx, _tcp_rx) = tokio::sync::mpsc::unbounded_channel();
    let (dg_tx, _dg_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(tcp_tx, dg_tx));
    let storage = Arc::new(NullStorage);
    let pool = InterpreterPool::new(1, script.to_str().unwrap(), storage.clone(), transport.clone());

    let mut inner_body = BTreeMap::new();
    inner_body.insert(7, Value::Str("ping".to_string()));
    let inner = Message::new(MessageType::Deliver).with_session_id(vec![7]).with_body(inner_body);
    let outer = Message::new(MessageType::Deliver)
        .with_tag(Tag::Slave)
        .with_scheme(Scheme::S2S)
        .with_session_id(vec![1001])
        .with_body(message_to_body(&inner));

    let mut group = c.benchmark_group("warm_throughput");
    group.sample_size(50);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));
    group.throughput(Throughput::Elements(1));

    group.bench_function("message_dispatch", |b| {
        b.iter(|| black_box(dispatcher::on_deliver(black_box(&outer), &pool, storage.as_ref(), transport.as_ref())))
    });

    group.finish();
    let _ = std::fs::remove_file(&script);
}

criterion_group!(benches, warm_throughput);
criterion_main!(benches);
