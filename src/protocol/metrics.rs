use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::MessageType;

/// Track netlink transceiver metrics without external dependencies.
pub(crate) struct Metrics;

static TOTAL_MESSAGES: AtomicU64 = AtomicU64::new(0);
static SENT_MESSAGES: AtomicU64 = AtomicU64::new(0);
static RECEIVED_MESSAGES: AtomicU64 = AtomicU64::new(0);
static ACK_COUNT: AtomicU64 = AtomicU64::new(0);
static PROTOCOL_ERROR_COUNT: AtomicU64 = AtomicU64::new(0);
static SEQ_MISMATCH_COUNT: AtomicU64 = AtomicU64::new(0);
static FAILED_FLOWS: AtomicU64 = AtomicU64::new(0);
static OPEN_SOCKETS: AtomicU64 = AtomicU64::new(0);
static SEND_LATENCY_TOTAL_NS: AtomicU64 = AtomicU64::new(0);
static SEND_LATENCY_MAX_NS: AtomicU64 = AtomicU64::new(0);
static RECV_LATENCY_TOTAL_NS: AtomicU64 = AtomicU64::new(0);
static RECV_LATENCY_MAX_NS: AtomicU64 = AtomicU64::new(0);

const NANOSECONDS_PER_MICROSECOND: u128 = 1_000;

struct MessageTypeCounters {
    noop: AtomicU64,
    error: AtomicU64,
    done: AtomicU64,
    overrun: AtomicU64,
    data: AtomicU64,
}

static MESSAGE_COUNTERS: MessageTypeCounters = MessageTypeCounters::new();

impl MessageTypeCounters {
    const fn new() -> Self {
        Self {
            noop: AtomicU64::new(0),
            error: AtomicU64::new(0),
            done: AtomicU64::new(0),
            overrun: AtomicU64::new(0),
            data: AtomicU64::new(0),
        }
    }

    fn increment(&self, msg_type: MessageType) {
        let counter = match msg_type {
            MessageType::Noop => &self.noop,
            MessageType::Error => &self.error,
            MessageType::Done => &self.done,
            MessageType::Overrun => &self.overrun,
            MessageType::Other(_) => &self.data,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Direction of observed latency measurement.
#[derive(Clone, Copy)]
pub(crate) enum LatencyKind {
    Send,
    Receive,
}

/// Direction of message flow for counting.
#[derive(Clone, Copy)]
pub(crate) enum MessageDirection {
    Sent,
    Received,
}

impl Metrics {
    #[inline]
    pub(crate) fn record_message(direction: MessageDirection, msg_type: MessageType) {
        TOTAL_MESSAGES.fetch_add(1, Ordering::Relaxed);
        match direction {
            MessageDirection::Sent => {
                SENT_MESSAGES.fetch_add(1, Ordering::Relaxed);
            }
            MessageDirection::Received => {
                RECEIVED_MESSAGES.fetch_add(1, Ordering::Relaxed);
            }
        }
        MESSAGE_COUNTERS.increment(msg_type);
    }

    #[inline]
    pub(crate) fn record_ack() {
        ACK_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_protocol_error() {
        PROTOCOL_ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_seq_mismatch() {
        SEQ_MISMATCH_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_failed_flow() {
        FAILED_FLOWS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_socket_open() {
        OPEN_SOCKETS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_socket_close() {
        OPEN_SOCKETS.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_latency(kind: LatencyKind, duration: Duration) {
        let nanos = duration
            .as_nanos()
            .min(u128::from(u64::MAX))
            .try_into()
            .unwrap_or(u64::MAX);

        match kind {
            LatencyKind::Send => {
                SEND_LATENCY_TOTAL_NS.fetch_add(nanos, Ordering::Relaxed);
                update_max(&SEND_LATENCY_MAX_NS, nanos);
            }
            LatencyKind::Receive => {
                RECV_LATENCY_TOTAL_NS.fetch_add(nanos, Ordering::Relaxed);
                update_max(&RECV_LATENCY_MAX_NS, nanos);
            }
        }
    }

    #[inline]
    pub(crate) fn totals() -> MetricsSnapshot {
        MetricsSnapshot {
            total_messages: TOTAL_MESSAGES.load(Ordering::Relaxed),
            sent_messages: SENT_MESSAGES.load(Ordering::Relaxed),
            received_messages: RECEIVED_MESSAGES.load(Ordering::Relaxed),
            data_messages: MESSAGE_COUNTERS.data.load(Ordering::Relaxed),
            error_messages: MESSAGE_COUNTERS.error.load(Ordering::Relaxed),
            done_messages: MESSAGE_COUNTERS.done.load(Ordering::Relaxed),
            noop_messages: MESSAGE_COUNTERS.noop.load(Ordering::Relaxed),
            overrun_messages: MESSAGE_COUNTERS.overrun.load(Ordering::Relaxed),
            acks: ACK_COUNT.load(Ordering::Relaxed),
            protocol_errors: PROTOCOL_ERROR_COUNT.load(Ordering::Relaxed),
            seq_mismatches: SEQ_MISMATCH_COUNT.load(Ordering::Relaxed),
            failed_flows: FAILED_FLOWS.load(Ordering::Relaxed),
            open_sockets: OPEN_SOCKETS.load(Ordering::Relaxed),
            send_latency_total_ns: SEND_LATENCY_TOTAL_NS.load(Ordering::Relaxed),
            send_latency_max_ns: SEND_LATENCY_MAX_NS.load(Ordering::Relaxed),
            recv_latency_total_ns: RECV_LATENCY_TOTAL_NS.load(Ordering::Relaxed),
            recv_latency_max_ns: RECV_LATENCY_MAX_NS.load(Ordering::Relaxed),
        }
    }
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Process-wide snapshot of transceiver counters.
#[allow(missing_docs)]
#[derive(Default, Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub total_messages: u64,
    pub sent_messages: u64,
    pub received_messages: u64,
    pub data_messages: u64,
    pub error_messages: u64,
    pub done_messages: u64,
    pub noop_messages: u64,
    pub overrun_messages: u64,
    pub acks: u64,
    pub protocol_errors: u64,
    pub seq_mismatches: u64,
    pub failed_flows: u64,
    pub open_sockets: u64,
    pub send_latency_total_ns: u64,
    pub send_latency_max_ns: u64,
    pub recv_latency_total_ns: u64,
    pub recv_latency_max_ns: u64,
}

impl MetricsSnapshot {
    /// Average send latency in microseconds.
    #[must_use]
    pub fn avg_send_latency_us(&self) -> Option<u64> {
        average_microseconds(self.send_latency_total_ns, self.sent_messages)
    }

    /// Average receive latency in microseconds.
    #[must_use]
    pub fn avg_receive_latency_us(&self) -> Option<u64> {
        average_microseconds(self.recv_latency_total_ns, self.received_messages)
    }
}

/// Read the current process-wide counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    Metrics::totals()
}

fn average_microseconds(total_ns: u64, count: u64) -> Option<u64> {
    if count == 0 {
        return None;
    }

    let total_ns_u128 = u128::from(total_ns);
    Some((total_ns_u128 / (u128::from(count) * NANOSECONDS_PER_MICROSECOND)) as u64)
}
