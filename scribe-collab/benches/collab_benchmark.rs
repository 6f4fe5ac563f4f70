use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use scribe_collab::broadcast::{DocUpdate, ListenerSet};
use scribe_collab::client::DocMirror;
use scribe_collab::config::ModelOptions;
use scribe_collab::doc::OpData;
use scribe_collab::model::Model;
use scribe_collab::protocol::{decode_message, encode_frame, remote_op, Message};
use scribe_ot::{Component, Op};
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

fn typing_op(v: u64) -> OpData {
    OpData::new(Op::from(Component::insert(v as usize, "x")), v)
}

fn bench_model_apply_sequential(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("model_apply_100_ops", |b| {
        b.iter(|| {
            rt.block_on(async {
                let model = Model::new(ModelOptions::default());
                model.create("doc", "text", None, Default::default()).await.unwrap();
                for v in 0..100 {
                    black_box(model.apply_op("doc", typing_op(v)).await.unwrap());
                }
            })
        })
    });
}

fn bench_model_apply_rebased(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    // Every op is based 10 versions back and rebased over the gap.
    c.bench_function("model_apply_100_stale_ops", |b| {
        b.iter(|| {
            rt.block_on(async {
                let model = Model::new(ModelOptions::default());
                model.create("doc", "text", Some("y".repeat(64)), Default::default()).await.unwrap();
                for v in 0..100u64 {
                    let base = v.saturating_sub(10);
                    let data = OpData::new(Op::from(Component::insert(32, "x")), base);
                    black_box(model.apply_op("doc", data).await.unwrap());
                }
            })
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let mut set = ListenerSet::new();
    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel::<DocUpdate>();
        set.add(Arc::new(tx));
        receivers.push(rx);
    }
    let update = DocUpdate::Op {
        data: Arc::new(typing_op(0)),
        snapshot: None,
        old_snapshot: None,
    };

    c.bench_function("broadcast_100_listeners", |b| {
        b.iter(|| {
            set.notify(black_box(&update));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let msg: Message = remote_op("notes", &typing_op(42));

    c.bench_function("frame_roundtrip", |b| {
        b.iter(|| {
            let frame = encode_frame(black_box(&msg)).unwrap();
            black_box(decode_message(&frame[10..]).unwrap());
        })
    });
}

fn bench_mirror_remote_ops(c: &mut Criterion) {
    let open_reply: Message = [("open".to_string(), Value::Bool(true)), ("v".to_string(), Value::from(0))]
        .into_iter()
        .collect();

    c.bench_function("mirror_100_remote_ops_with_local_edits", |b| {
        b.iter(|| {
            let (out, _out_rx) = mpsc::unbounded_channel();
            let (mirror, _events) = DocMirror::new("doc", out);
            let mut mirror = mirror.with_snapshot("", 0);
            mirror.open(None).unwrap();
            mirror.handle_message(&open_reply).unwrap();
            mirror.submit_op(Component::insert(0, "local"), None).unwrap();
            for v in 0..100 {
                mirror.on_remote_op(Op::from(Component::insert(0, "r")), v).unwrap();
            }
            black_box(mirror.snapshot().map(str::len));
        })
    });
}

criterion_group!(
    benches,
    bench_model_apply_sequential,
    bench_model_apply_rebased,
    bench_broadcast_fanout,
    bench_frame_roundtrip,
    bench_mirror_remote_ops,
);
criterion_main!(benches);
