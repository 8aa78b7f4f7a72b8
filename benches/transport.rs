//! Transceiver performance benchmarks
//!
//! Measures envelope lifecycle and full send/dispatch cycles over the
//! in-memory bus.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nlsock::protocol::{ErrorReply, encode};
use nlsock::{
    Action, Address, CallbackKind, Envelope, HeaderFlags, MemoryBus, MessageHeader, MessageType,
    Socket,
};

/// Benchmark envelope retain/release
fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");

    group.bench_function("retain_release", |b| {
        let envelope = Envelope::new(MessageType::Other(0x10), HeaderFlags::new());
        b.iter(|| {
            let shared = envelope.retain().unwrap();
            shared.release().unwrap();
        });
    });

    group.bench_function("allocate_append_encode", |b| {
        b.iter(|| {
            let envelope = Envelope::new(MessageType::Other(0x10), HeaderFlags::new());
            envelope.append(&[0u8; 64]).unwrap();
            black_box(envelope.encode().unwrap());
            envelope.release().unwrap();
        });
    });

    group.finish();
}

/// Benchmark send followed by dispatch of a dump reply and its ack
fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for parts in [1usize, 16, 64] {
        group.throughput(Throughput::Elements(parts as u64));
        group.bench_with_input(BenchmarkId::from_parameter(parts), &parts, |b, &parts| {
            let bus = MemoryBus::new();
            let kernel = bus.socket();
            let mut socket = Socket::new();
            socket.attach(nlsock::NETLINK_ROUTE, kernel.clone()).unwrap();
            socket.bind(0, 0).unwrap();
            socket
                .callbacks_mut()
                .set(CallbackKind::Valid, |_, _| Action::Proceed);
            let port = socket.local().port;

            b.iter(|| {
                let seq = socket
                    .send_simple(MessageType::Other(0x12), HeaderFlags::new(), b"")
                    .unwrap();
                let mut reply = Vec::new();
                for _ in 0..parts {
                    let mut header =
                        MessageHeader::new(MessageType::Other(0x10), HeaderFlags::new());
                    header.set_seq(seq);
                    header.set_port(port);
                    reply.extend_from_slice(&encode(&header, &[0u8; 64]).unwrap());
                }
                let mut ack = MessageHeader::new(MessageType::Error, HeaderFlags::new());
                ack.set_seq(seq);
                ack.set_port(port);
                reply.extend_from_slice(
                    &encode(&ack, &ErrorReply::new(0, None).to_payload()).unwrap(),
                );
                kernel.push(reply, Address::KERNEL);
                kernel.take_sent();

                black_box(socket.receive_and_dispatch().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_envelope, bench_round_trip);
criterion_main!(benches);
