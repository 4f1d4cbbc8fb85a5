use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vssl_bridge::loopback::{self, HandshakeScript, PeerCertificate};
use vssl_bridge::{Connection, Context, HandleRegistry, VerifyMode};

static BENCH: HandleRegistry<u64> = HandleRegistry::new("bench");

fn bench_register_cycle(c: &mut Criterion) {
    let value = Arc::new(7u64);
    c.bench_function("register_resolve_unregister", |b| {
        b.iter(|| {
            let token = BENCH.register(Arc::clone(&value)).expect("register");
            let resolved = BENCH.resolve(black_box(token)).expect("resolve");
            black_box(*resolved);
            BENCH.unregister(token);
        })
    });
}

fn bench_resolve_hot(c: &mut Criterion) {
    let tokens: Vec<_> = (0..1024u64)
        .map(|n| BENCH.register(Arc::new(n)).expect("register"))
        .collect();
    c.bench_function("resolve_1024_live", |b| {
        b.iter(|| {
            for token in &tokens {
                black_box(BENCH.resolve(*token).expect("resolve"));
            }
        })
    });
    for token in tokens {
        BENCH.unregister(token);
    }
}

fn bench_verified_handshake(c: &mut Criterion) {
    let engine = loopback::install().expect("loopback engine");
    let context = Context::new().expect("context");
    let conn = Connection::new(&context).expect("connection");
    conn.set_verify_callback(VerifyMode::PEER, |ok, _| ok);
    conn.set_msg_callback(|_, record| {
        black_box(record.content.len());
    });
    let script = HandshakeScript::new().peer(PeerCertificate::new("CN=bench"));

    c.bench_function("loopback_handshake_with_callbacks", |b| {
        b.iter(|| black_box(engine.accept(&conn, &script)))
    });
}

criterion_group!(
    benches,
    bench_register_cycle,
    bench_resolve_hot,
    bench_verified_handshake
);
criterion_main!(benches);
