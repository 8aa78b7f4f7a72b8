use std::sync::Arc;
use std::time::Duration;

use nlsock::protocol::{ErrorReply, encode};
use nlsock::transport::{PacketSocket, PortAllocator, RecvOptions, PORT_SLOTS};
use nlsock::{
    Action, Address, CallbackKind, Completion, Credentials, Envelope, FlowState, HeaderFlags,
    MemoryBus, MemorySocket, MessageHeader, MessageType, Socket, TransportError,
};

const GETTHING: MessageType = MessageType::Other(0x20);
const NEWTHING: MessageType = MessageType::Other(0x21);

fn frame(msg_type: MessageType, flags: u16, seq: u32, port: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = MessageHeader::new(msg_type, HeaderFlags::from_bits(flags));
    header.set_seq(seq);
    header.set_port(port);
    encode(&header, payload).unwrap().to_vec()
}

fn ack(seq: u32, port: u32) -> Vec<u8> {
    error(0, seq, port)
}

fn error(code: i32, seq: u32, port: u32) -> Vec<u8> {
    let payload = ErrorReply::new(code, None).to_payload();
    frame(MessageType::Error, 0, seq, port, &payload)
}

fn client(bus: &MemoryBus, base: u32) -> (Socket, MemorySocket) {
    let handle = bus.socket();
    let mut socket = Socket::new().with_port_allocator(Arc::new(PortAllocator::new(base)));
    socket.attach(nlsock::NETLINK_GENERIC, handle.clone()).unwrap();
    socket.bind(0, 0).unwrap();
    (socket, handle)
}

fn count_valid(socket: &mut Socket) {
    socket
        .callbacks_mut()
        .set_with_arg(CallbackKind::Valid, Vec::<u32>::new(), |envelope, _, seen| {
            seen.push(envelope.header().unwrap().seq());
            Action::Proceed
        });
}

fn valid_seen(socket: &Socket) -> Vec<u32> {
    socket
        .callbacks()
        .arg::<Vec<u32>>(CallbackKind::Valid)
        .cloned()
        .unwrap_or_default()
}

#[test]
fn auto_bind_twice_yields_distinct_ports() {
    let bus = MemoryBus::new();
    let mut first = Socket::new();
    let mut second = Socket::new();
    first.attach(nlsock::NETLINK_ROUTE, bus.socket()).unwrap();
    second.attach(nlsock::NETLINK_ROUTE, bus.socket()).unwrap();

    first.bind(0, 0).unwrap();
    second.bind(0, 0).unwrap();

    assert_ne!(first.local().port, 0);
    assert_ne!(second.local().port, 0);
    assert_ne!(first.local().port, second.local().port);
}

#[test]
fn port_exhaustion_reports_address_in_use() {
    let bus = MemoryBus::new();
    for slot in 0..PORT_SLOTS as u32 {
        bus.reserve(9 | (slot << 22));
    }
    let mut socket = Socket::new().with_port_allocator(Arc::new(PortAllocator::new(9)));
    socket.attach(nlsock::NETLINK_ROUTE, bus.socket()).unwrap();

    let err = socket.bind(0, 0).unwrap_err();
    assert!(matches!(err, TransportError::AddressInUse { attempts } if attempts == PORT_SLOTS));
    assert!(!socket.is_bound());
}

#[test]
fn multipart_batch_reaches_done_after_last_part() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 300);
    let port = socket.local().port;

    socket.callbacks_mut().set_with_arg(
        CallbackKind::Valid,
        Vec::<FlowState>::new(),
        |_, ctx, states| {
            states.push(ctx.state());
            Action::Proceed
        },
    );

    let request = Envelope::new(GETTHING, HeaderFlags::new());
    request.modify(|body| body.header_mut().set_seq(5)).unwrap();
    assert_eq!(socket.send(&request).unwrap(), 5);
    request.release().unwrap();

    kernel.push(frame(NEWTHING, HeaderFlags::MULTI, 5, port, b"a"), Address::KERNEL);
    kernel.push(frame(NEWTHING, HeaderFlags::MULTI, 5, port, b"b"), Address::KERNEL);
    kernel.push(frame(NEWTHING, 0, 5, port, b"c"), Address::KERNEL);

    let outcome = socket.receive_and_dispatch().unwrap();

    assert_eq!(outcome.delivered, 3);
    assert_eq!(outcome.completion, Completion::Drained);
    assert_eq!(socket.flow_state(), FlowState::Done);
    assert_eq!(kernel.pending(), 0);
    assert_eq!(
        socket.callbacks().arg::<Vec<FlowState>>(CallbackKind::Valid),
        Some(&vec![FlowState::Receiving; 3])
    );
}

#[test]
fn ack_dispatches_ack_stage() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 301);
    let port = socket.local().port;
    socket
        .callbacks_mut()
        .set_with_arg(CallbackKind::Ack, false, |_, ctx, seen| {
            *seen = ctx.stage() == CallbackKind::Ack;
            Action::Stop
        });

    let seq = socket.send_simple(NEWTHING, HeaderFlags::new(), b"x").unwrap();
    kernel.push(ack(seq, port), Address::KERNEL);

    let outcome = socket.receive_and_dispatch().unwrap();
    assert_eq!(outcome.completion, Completion::Ack);
    assert_eq!(socket.callbacks().arg::<bool>(CallbackKind::Ack), Some(&true));
}

#[test]
fn error_handler_receives_exact_code() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 302);
    let port = socket.local().port;
    socket
        .callbacks_mut()
        .set_error_handler_with_arg(Vec::<i32>::new(), |reply, _, codes| {
            codes.push(reply.code());
            Action::Skip
        });

    let seq = socket.send_simple(NEWTHING, HeaderFlags::new(), b"x").unwrap();
    let mut datagram = error(-libc::EBUSY, seq, port);
    datagram.extend(ack(seq, port));
    kernel.push(datagram, Address::KERNEL);

    let outcome = socket.receive_and_dispatch().unwrap();
    assert_eq!(outcome.completion, Completion::Ack);
    assert_eq!(
        socket.callbacks().error_arg::<Vec<i32>>(),
        Some(&vec![-libc::EBUSY])
    );
}

#[test]
fn sequence_mismatch_is_discarded_by_default() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 303);
    let port = socket.local().port;
    count_valid(&mut socket);

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    let stale = seq.wrapping_add(100);
    let mut datagram = frame(NEWTHING, 0, stale, port, b"stale");
    datagram.extend(frame(NEWTHING, 0, seq, port, b"fresh"));
    datagram.extend(ack(seq, port));
    kernel.push(datagram, Address::KERNEL);

    let outcome = socket.receive_and_dispatch().unwrap();
    assert_eq!(outcome.received, 3);
    assert_eq!(outcome.completion, Completion::Ack);
    assert_eq!(valid_seen(&socket), vec![seq]);
}

#[test]
fn stale_datagram_does_not_end_outstanding_flow() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 312);
    let port = socket.local().port;
    count_valid(&mut socket);

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    kernel.push(frame(NEWTHING, 0, seq.wrapping_add(100), port, b"stale"), Address::KERNEL);
    kernel.push(error(-libc::EPERM, seq, port), Address::KERNEL);

    let err = socket.receive_and_dispatch().unwrap_err();
    assert_eq!(err.protocol_code(), Some(-libc::EPERM));
    assert_eq!(socket.flow_state(), FlowState::Failed);
    assert_eq!(kernel.pending(), 0);
    assert!(valid_seen(&socket).is_empty());
}

#[test]
fn skipped_datagram_does_not_end_outstanding_flow() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 313);
    let port = socket.local().port;
    count_valid(&mut socket);
    socket.callbacks_mut().set(CallbackKind::MessageIn, |envelope, _| {
        match envelope.payload() {
            Ok(payload) if payload.starts_with(b"drop") => Action::Skip,
            _ => Action::Proceed,
        }
    });

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    kernel.push(frame(NEWTHING, 0, seq, port, b"drop"), Address::KERNEL);
    let mut reply = frame(NEWTHING, 0, seq, port, b"keep");
    reply.extend(ack(seq, port));
    kernel.push(reply, Address::KERNEL);

    let outcome = socket.receive_and_dispatch().unwrap();
    assert_eq!(outcome.received, 3);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.completion, Completion::Ack);
    assert_eq!(valid_seen(&socket), vec![seq]);
}

#[test]
fn sequence_mismatch_handler_can_fail_flow() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 304);
    let port = socket.local().port;
    socket.callbacks_mut().set(CallbackKind::SequenceMismatch, |_, _| {
        Action::Fail(nlsock::FailReason::SequenceMismatch)
    });

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    kernel.push(frame(NEWTHING, 0, seq.wrapping_add(1), port, b""), Address::KERNEL);

    let err = socket.receive_and_dispatch().unwrap_err();
    assert!(matches!(
        err,
        TransportError::SequenceMismatch { expected, found }
            if expected == seq && found == seq.wrapping_add(1)
    ));
}

#[test]
fn disabled_seq_check_accepts_any_reply() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 305);
    let port = socket.local().port;
    socket.disable_seq_check();
    count_valid(&mut socket);

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    kernel.push(frame(NEWTHING, 0, seq.wrapping_add(7), port, b""), Address::KERNEL);

    socket.receive_and_dispatch().unwrap();
    assert_eq!(valid_seen(&socket), vec![seq.wrapping_add(7)]);
}

#[test]
fn zero_deadline_on_empty_socket_times_out() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 306);

    let err = socket.receive_within(Duration::ZERO).unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
    assert_eq!(socket.flow_state(), FlowState::Failed);

    // The socket survives the failed flow.
    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    kernel.push(ack(seq, socket.local().port), Address::KERNEL);
    let outcome = socket.receive_within(Duration::ZERO).unwrap();
    assert_eq!(outcome.completion, Completion::Ack);
}

#[test]
fn operations_after_close_fail_fast() {
    let bus = MemoryBus::new();
    let (mut socket, _kernel) = client(&bus, 307);
    socket.close();
    socket.close();

    assert!(matches!(
        socket.send_simple(GETTHING, HeaderFlags::new(), b""),
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        socket.receive_and_dispatch(),
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(socket.receive(), Err(TransportError::NotConnected)));
}

#[test]
fn request_reply_between_bus_peers() {
    let bus = MemoryBus::new();
    let (mut socket, _handle) = client(&bus, 308);
    let mut responder = bus.socket();
    responder.bind(Address::new(77, 0)).unwrap();
    socket.set_peer_port(77);
    count_valid(&mut socket);

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"ping").unwrap();

    let mut buf = [0u8; 256];
    let info = responder.recv_from(&mut buf, RecvOptions::default()).unwrap();
    assert_eq!(info.source, socket.local());
    let request = MessageHeader::from_bytes(&buf[..info.len]).unwrap();
    assert_eq!(request.seq(), seq);
    assert_eq!(&buf[16..20], b"ping");

    let mut reply = frame(NEWTHING, 0, request.seq(), request.port(), b"pong");
    reply.extend(ack(request.seq(), request.port()));
    responder.send_to(&reply, info.source, None).unwrap();

    let outcome = socket.receive_and_dispatch().unwrap();
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.completion, Completion::Ack);
    assert_eq!(valid_seen(&socket), vec![seq]);
}

#[test]
fn multicast_notification_skips_sequence_check() {
    let bus = MemoryBus::new();
    let (mut listener, _handle) = client(&bus, 309);
    listener.disable_auto_ack();
    listener.add_membership(2).unwrap();
    count_valid(&mut listener);

    let mut publisher = bus.socket();
    publisher.bind(Address::new(55, 0)).unwrap();
    publisher
        .send_to(&frame(NEWTHING, 0, 1234, 0, b"event"), Address::new(0, 0b10), None)
        .unwrap();

    let outcome = listener.receive_and_dispatch().unwrap();
    assert_eq!(outcome.completion, Completion::Drained);
    assert_eq!(valid_seen(&listener), vec![1234]);
}

#[test]
fn credentials_travel_with_datagram() {
    let bus = MemoryBus::new();
    let (mut socket, _handle) = client(&bus, 310);
    let mut responder = bus.socket();
    responder.bind(Address::new(78, 0)).unwrap();
    responder.set_passcred(true).unwrap();
    socket.set_peer_port(78);

    let creds = Credentials::current();
    let envelope = Envelope::new(GETTHING, HeaderFlags::new());
    envelope.set_credentials(creds).unwrap();
    socket.send(&envelope).unwrap();
    envelope.release().unwrap();

    let mut buf = [0u8; 64];
    let info = responder.recv_from(&mut buf, RecvOptions::default()).unwrap();
    assert_eq!(info.credentials, Some(creds));
}

#[test]
fn counters_track_flows() {
    let bus = MemoryBus::new();
    let (mut socket, kernel) = client(&bus, 311);
    let before = nlsock::metrics_snapshot();

    let seq = socket.send_simple(GETTHING, HeaderFlags::new(), b"").unwrap();
    kernel.push(ack(seq, socket.local().port), Address::KERNEL);
    socket.receive_and_dispatch().unwrap();

    let after = nlsock::metrics_snapshot();
    assert!(after.sent_messages > before.sent_messages);
    assert!(after.acks > before.acks);
}
