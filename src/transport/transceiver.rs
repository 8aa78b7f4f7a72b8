//! Request/reply transceiver: sequence stamping, datagram reads with size
//! probing, and per-message callback dispatch.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, instrument, trace, warn};

use crate::protocol::metrics::{LatencyKind, MessageDirection, Metrics};
use crate::protocol::{
    Address, Envelope, EnvelopeFlags, ErrorReply, HEADER_SIZE, HeaderFlags, MessageHeader,
    MessageType, PROTOCOL_UNSPEC, frames,
};

use super::callback::{Action, CallbackKind, DispatchContext, FailReason};
#[cfg(feature = "debug-tools")]
use super::debug::Direction;
use super::error::TransportError;
use super::socket::{Datagram, RecvOptions};
use super::transport::{FlowState, Socket, SocketFlags};

/// Peeked reads allowed per datagram before giving up on a growing datagram.
const MAX_PROBES: usize = 4;

/// How a receive flow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// An acknowledgment ended the flow.
    Ack,
    /// A `DONE` message ended a multi-part batch.
    Finish,
    /// A handler stopped the flow.
    Stopped,
    /// The last datagram was read and no further parts were announced.
    Drained,
}

/// Summary of one receive flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Messages parsed from all datagrams of the flow.
    pub received: usize,
    /// Messages dispatched to the `valid-message` stage.
    pub delivered: usize,
    /// How the flow ended.
    pub completion: Completion,
}

enum Step {
    Continue,
    Next,
    Done(Completion),
}

#[derive(Default)]
struct FlowProgress {
    received: usize,
    delivered: usize,
    multipart: bool,
    interrupted: bool,
    /// A message got past the sequence check.
    matched: bool,
}

impl FailReason {
    /// `aborted` is the error reported for [`FailReason::Aborted`].
    fn into_error(
        self,
        aborted: TransportError,
        expected: Option<u32>,
        found: u32,
    ) -> TransportError {
        match self {
            Self::Invalid => TransportError::Invalid,
            Self::Overrun => TransportError::Overrun { required: None },
            Self::SequenceMismatch => TransportError::SequenceMismatch {
                expected: expected.unwrap_or_default(),
                found,
            },
            Self::Protocol(code) => TransportError::Protocol { code },
            Self::DumpInterrupted => TransportError::DumpInterrupted,
            Self::Aborted => aborted,
        }
    }
}

impl Socket {
    /// Stamp and send `envelope`, returning its sequence number.
    ///
    /// Unset fields are filled in from the socket: protocol, source, header
    /// port, sequence number, and destination. The envelope must not be
    /// shared while it is stamped.
    #[instrument(level = "debug", skip(self, envelope), fields(local = %self.local))]
    pub fn send(&mut self, envelope: &Envelope) -> Result<u32, TransportError> {
        if self.io.is_none() {
            return Err(TransportError::NotConnected);
        }
        match self.send_inner(envelope) {
            Ok(seq) => Ok(seq),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn send_inner(&mut self, envelope: &Envelope) -> Result<u32, TransportError> {
        let header = self.stamp(envelope)?;
        let destination = envelope.destination()?;

        let ctx = DispatchContext::new(
            CallbackKind::MessageOut,
            self.state,
            self.seq_expect,
            destination,
            0,
        );
        match self.callbacks.invoke(CallbackKind::MessageOut, envelope, &ctx) {
            Action::Proceed => self.transmit(envelope, header.message_type())?,
            Action::Skip | Action::Stop => {
                debug!(seq = header.seq(), "transmission suppressed by message-out handler");
            }
            Action::Fail(reason) => {
                return Err(reason.into_error(
                    TransportError::Aborted {
                        stage: CallbackKind::MessageOut,
                    },
                    self.seq_expect,
                    header.seq(),
                ));
            }
        }

        self.state = FlowState::Sent;
        if !self.flags.has(SocketFlags::NO_AUTO_ACK) {
            self.seq_expect = Some(header.seq());
        }
        debug!(seq = header.seq(), %destination, "request sent");
        Ok(header.seq())
    }

    fn stamp(&mut self, envelope: &Envelope) -> Result<MessageHeader, TransportError> {
        let local = self.local;
        let peer = self.peer;
        let protocol = self.protocol;
        let auto_ack = !self.flags.has(SocketFlags::NO_AUTO_ACK);

        let header = envelope.modify(|body| {
            if body.protocol() == PROTOCOL_UNSPEC {
                body.set_protocol(protocol);
            }
            body.set_source(local);
            if body.destination() == Address::default() {
                body.set_destination(peer);
            }
            let header = body.header_mut();
            if header.port() == 0 {
                header.set_port(local.port);
            }
            // Numbers are only consumed once the envelope is known to be writable.
            if header.seq() == 0 {
                header.set_seq(self.use_seq());
            }
            let mut flags = header.flags();
            flags.insert(HeaderFlags::REQUEST);
            if auto_ack {
                flags.insert(HeaderFlags::ACK);
            }
            header.set_flags(flags);
            *header
        })?;
        Ok(header)
    }

    fn transmit(&mut self, envelope: &Envelope, msg_type: MessageType) -> Result<(), TransportError> {
        let io = self.io.as_deref_mut().ok_or(TransportError::NotConnected)?;
        let bytes = envelope.encode()?;
        let started = Instant::now();

        let written = if let Some(hook) = self.callbacks.send_override_mut() {
            hook(io, envelope)?
        } else {
            let (destination, credentials) = envelope.read(|body| {
                let credentials = body
                    .flags()
                    .has(EnvelopeFlags::CRED_PRESENT)
                    .then(|| body.credentials())
                    .flatten();
                (body.destination(), credentials)
            })?;
            io.send_to(&bytes, destination, credentials.as_ref())
                .map_err(TransportError::Send)?
        };

        if written < bytes.len() {
            return Err(TransportError::ShortWrite {
                sent: written,
                expected: bytes.len(),
            });
        }

        #[cfg(feature = "debug-tools")]
        if let Some(recorder) = &self.pcap_send {
            if let Err(err) = recorder.record(Direction::Outbound, self.protocol, &bytes) {
                debug!(error = ?err, "failed to record outbound datagram");
            }
        }

        Metrics::record_latency(LatencyKind::Send, started.elapsed());
        Metrics::record_message(MessageDirection::Sent, msg_type);
        trace!(len = written, "datagram written");
        Ok(())
    }

    /// Build, send, and release a message with the given payload.
    pub fn send_simple(
        &mut self,
        msg_type: MessageType,
        flags: HeaderFlags,
        payload: &[u8],
    ) -> Result<u32, TransportError> {
        let envelope = Envelope::new(msg_type, flags);
        let result = match envelope.append(payload) {
            Ok(()) => self.send(&envelope),
            Err(err) => Err(err.into()),
        };
        envelope.release()?;
        result
    }

    /// Send `envelope`, release it, and wait for the acknowledgment when
    /// auto-ack is enabled.
    pub fn send_sync(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let sent = self.send(&envelope);
        envelope.release()?;
        sent?;
        if self.flags.has(SocketFlags::NO_AUTO_ACK) {
            return Ok(());
        }
        self.wait_for_ack()
    }

    /// Read and dispatch replies until the outstanding request is
    /// acknowledged or a handler ends the flow.
    #[instrument(level = "debug", skip(self))]
    pub fn wait_for_ack(&mut self) -> Result<(), TransportError> {
        loop {
            let outcome = self.receive_and_dispatch()?;
            if outcome.completion != Completion::Drained {
                return Ok(());
            }
        }
    }

    /// Read one raw datagram using the configured deadline.
    pub fn receive(&mut self) -> Result<Datagram, TransportError> {
        let timeout = self.config.recv_timeout;
        self.recv_datagram(timeout).map_err(|err| self.fail(err))
    }

    /// Read and dispatch one flow using the configured deadline.
    pub fn receive_and_dispatch(&mut self) -> Result<Outcome, TransportError> {
        let timeout = self.config.recv_timeout;
        self.run_flow(timeout)
    }

    /// Read and dispatch one flow, waiting at most `timeout` per datagram.
    pub fn receive_within(&mut self, timeout: Duration) -> Result<Outcome, TransportError> {
        self.run_flow(Some(timeout))
    }

    #[instrument(level = "debug", skip(self), fields(local = %self.local))]
    fn run_flow(&mut self, timeout: Option<Duration>) -> Result<Outcome, TransportError> {
        if self.io.is_none() {
            return Err(TransportError::NotConnected);
        }

        if let Some(mut hook) = self.callbacks.take_recvmsgs_override() {
            trace!("receive loop replaced by override");
            let result = hook(self, timeout);
            self.callbacks.restore_recvmsgs_override(hook);
            return result.map_err(|err| {
                if self.state == FlowState::Failed {
                    err
                } else {
                    self.fail(err)
                }
            });
        }

        self.state = FlowState::Receiving;
        let mut progress = FlowProgress::default();

        let completion = loop {
            let datagram = match self.recv_datagram(timeout) {
                Ok(datagram) => datagram,
                Err(err) => return Err(self.fail(err)),
            };
            match self.dispatch_datagram(&datagram, &mut progress) {
                Ok(Some(completion)) => break completion,
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }
        };

        if progress.interrupted {
            return Err(self.fail(TransportError::DumpInterrupted));
        }

        self.state = FlowState::Done;
        if completion != Completion::Drained {
            self.seq_expect = None;
        }
        debug!(
            received = progress.received,
            delivered = progress.delivered,
            ?completion,
            "flow complete"
        );
        Ok(Outcome {
            received: progress.received,
            delivered: progress.delivered,
            completion,
        })
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        self.state = FlowState::Failed;
        self.seq_expect = None;
        Metrics::record_failed_flow();
        debug!(error = %err, "flow failed");
        err
    }

    fn recv_datagram(&mut self, timeout: Option<Duration>) -> Result<Datagram, TransportError> {
        let io = self.io.as_deref_mut().ok_or(TransportError::NotConnected)?;
        let started = Instant::now();

        let datagram = if let Some(hook) = self.callbacks.recv_override_mut() {
            let options = RecvOptions {
                peek: false,
                timeout,
            };
            hook(io, &options)?
        } else {
            let mut peek = self.flags.has(SocketFlags::MSG_PEEK);
            let mut buf = BytesMut::zeroed(self.config.msg_buf_size.max(HEADER_SIZE));
            let mut probes = 0;
            loop {
                let info = io
                    .recv_from(&mut buf, RecvOptions { peek, timeout })
                    .map_err(TransportError::from_recv)?;

                if info.truncated(buf.len()) {
                    probes += 1;
                    if !peek || info.len > self.config.max_msg_size || probes > MAX_PROBES {
                        warn!(len = info.len, capacity = buf.len(), "datagram does not fit");
                        return Err(TransportError::Overrun {
                            required: Some(info.len),
                        });
                    }
                    trace!(len = info.len, "growing receive buffer");
                    buf.resize(info.len, 0);
                    continue;
                }

                if peek {
                    peek = false;
                    continue;
                }

                buf.truncate(info.len);
                break Datagram {
                    data: buf.freeze(),
                    source: info.source,
                    credentials: info.credentials,
                };
            }
        };

        #[cfg(feature = "debug-tools")]
        if let Some(recorder) = &self.pcap_recv {
            if let Err(err) = recorder.record(Direction::Inbound, self.protocol, &datagram.data) {
                debug!(error = ?err, "failed to record inbound datagram");
            }
        }

        Metrics::record_latency(LatencyKind::Receive, started.elapsed());
        trace!(len = datagram.data.len(), source = %datagram.source, "datagram read");
        Ok(datagram)
    }

    fn dispatch_datagram(
        &mut self,
        datagram: &Datagram,
        progress: &mut FlowProgress,
    ) -> Result<Option<Completion>, TransportError> {
        for frame in frames(datagram.data.clone()) {
            let envelope = match frame {
                Ok(frame) => {
                    Envelope::from_frame(self.protocol, frame, datagram.source, datagram.credentials)
                }
                Err(err) => {
                    warn!(error = %err, "malformed message");
                    let envelope = Envelope::allocate(self.protocol, EnvelopeFlags::new());
                    let step = self.dispatch_invalid(&envelope, datagram.source, progress.received);
                    envelope.release()?;
                    return match step? {
                        Step::Done(completion) => Ok(Some(completion)),
                        // Nothing after a broken frame can be located.
                        Step::Continue | Step::Next => Ok(self.drained(progress)),
                    };
                }
            };

            progress.received += 1;
            let step = self.dispatch_message(&envelope, datagram.source, progress);
            envelope.release()?;
            if let Step::Done(completion) = step? {
                return Ok(Some(completion));
            }
        }

        Ok(self.drained(progress))
    }

    /// Completion after the last message of a datagram, `None` to keep reading.
    ///
    /// While a request is outstanding the flow stays open until one of its
    /// replies has been seen, so stale or skipped datagrams do not end it.
    fn drained(&self, progress: &FlowProgress) -> Option<Completion> {
        let awaiting_reply = self.seq_expect.is_some() && !progress.matched;
        (!progress.multipart && !awaiting_reply).then_some(Completion::Drained)
    }

    fn dispatch_invalid(
        &mut self,
        envelope: &Envelope,
        source: Address,
        index: usize,
    ) -> Result<Step, TransportError> {
        let ctx = DispatchContext::new(
            CallbackKind::Invalid,
            self.state,
            self.seq_expect,
            source,
            index,
        );
        let action = self.callbacks.invoke(CallbackKind::Invalid, envelope, &ctx);
        self.verdict(action, CallbackKind::Invalid, 0, Completion::Stopped)
    }

    fn verdict(
        &self,
        action: Action,
        stage: CallbackKind,
        seq: u32,
        on_stop: Completion,
    ) -> Result<Step, TransportError> {
        match action {
            Action::Proceed => Ok(Step::Continue),
            Action::Skip => Ok(Step::Next),
            Action::Stop => Ok(Step::Done(on_stop)),
            Action::Fail(reason) => Err(reason.into_error(
                TransportError::Aborted { stage },
                self.seq_expect,
                seq,
            )),
        }
    }

    fn run_stage(
        &mut self,
        stage: CallbackKind,
        envelope: &Envelope,
        ctx: &DispatchContext,
        seq: u32,
        on_stop: Completion,
    ) -> Result<Step, TransportError> {
        let action = self.callbacks.invoke(stage, envelope, ctx);
        self.verdict(action, stage, seq, on_stop)
    }

    fn dispatch_message(
        &mut self,
        envelope: &Envelope,
        source: Address,
        progress: &mut FlowProgress,
    ) -> Result<Step, TransportError> {
        let header = envelope.header()?;
        let seq = header.seq();
        let msg_type = header.message_type();
        let flags = header.flags();
        let ctx = DispatchContext::new(
            CallbackKind::MessageIn,
            self.state,
            self.seq_expect,
            source,
            progress.received - 1,
        );

        Metrics::record_message(MessageDirection::Received, msg_type);
        trace!(%msg_type, %flags, seq, port = header.port(), "dispatching message");

        if let step @ (Step::Next | Step::Done(_)) =
            self.run_stage(CallbackKind::MessageIn, envelope, &ctx, seq, Completion::Stopped)?
        {
            return Ok(step);
        }

        if let Some(expected) = self.seq_expect {
            if header.port() == self.local.port && seq != expected {
                Metrics::record_seq_mismatch();
                warn!(expected, found = seq, "sequence mismatch");
                if let step @ (Step::Next | Step::Done(_)) = self.run_stage(
                    CallbackKind::SequenceMismatch,
                    envelope,
                    &ctx,
                    seq,
                    Completion::Stopped,
                )? {
                    return Ok(step);
                }
            }
        }

        progress.matched = true;
        progress.multipart = flags.is_multi();

        if flags.is_dump_interrupted() {
            if self.callbacks.is_set(CallbackKind::DumpInterrupted) {
                if let step @ (Step::Next | Step::Done(_)) = self.run_stage(
                    CallbackKind::DumpInterrupted,
                    envelope,
                    &ctx,
                    seq,
                    Completion::Stopped,
                )? {
                    return Ok(step);
                }
            } else {
                // Keep draining the dump; the flow reports the inconsistency at the end.
                progress.interrupted = true;
            }
        }

        if flags.requests_ack() {
            if let step @ (Step::Next | Step::Done(_)) =
                self.run_stage(CallbackKind::SendAck, envelope, &ctx, seq, Completion::Stopped)?
            {
                return Ok(step);
            }
        }

        match msg_type {
            MessageType::Done => {
                progress.multipart = false;
                self.run_stage(CallbackKind::Finish, envelope, &ctx, seq, Completion::Finish)
                    .map(next_on_continue)
            }
            MessageType::Noop => self
                .run_stage(CallbackKind::Skipped, envelope, &ctx, seq, Completion::Stopped)
                .map(next_on_continue),
            MessageType::Overrun => self
                .run_stage(CallbackKind::Overrun, envelope, &ctx, seq, Completion::Stopped)
                .map(next_on_continue),
            MessageType::Error => self.dispatch_error(envelope, &ctx, seq),
            MessageType::Other(_) => {
                progress.delivered += 1;
                self.run_stage(CallbackKind::Valid, envelope, &ctx, seq, Completion::Stopped)
                    .map(next_on_continue)
            }
        }
    }

    fn dispatch_error(
        &mut self,
        envelope: &Envelope,
        ctx: &DispatchContext,
        seq: u32,
    ) -> Result<Step, TransportError> {
        let reply = match envelope.read(|body| ErrorReply::parse(body.payload()))? {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "truncated error reply");
                return self
                    .run_stage(CallbackKind::Invalid, envelope, ctx, seq, Completion::Stopped)
                    .map(next_on_continue);
            }
        };

        if reply.is_ack() {
            Metrics::record_ack();
            return self
                .run_stage(CallbackKind::Ack, envelope, ctx, seq, Completion::Ack)
                .map(next_on_continue);
        }

        Metrics::record_protocol_error();
        debug!(code = reply.code(), "error reply");
        match self.callbacks.invoke_error(&reply, ctx) {
            None => Err(TransportError::Protocol { code: reply.code() }),
            Some(Action::Proceed | Action::Skip) => Ok(Step::Next),
            Some(Action::Stop) => Ok(Step::Done(Completion::Stopped)),
            Some(Action::Fail(reason)) => Err(reason.into_error(
                TransportError::ErrorHandlerAborted { code: reply.code() },
                self.seq_expect,
                seq,
            )),
        }
    }
}

fn next_on_continue(step: Step) -> Step {
    match step {
        Step::Continue => Step::Next,
        other => other,
    }
}
