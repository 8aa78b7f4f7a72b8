//! Callback table driving message dispatch.
//!
//! Each [`CallbackKind`] owns at most one handler plus an optional bound
//! argument. Stages without a handler fall back to
//! [`CallbackKind::default_action`].

use std::any::Any;
use std::fmt;
use std::time::Duration;

use tracing::{debug, trace};

use super::error::TransportError;
use super::socket::{Datagram, PacketSocket, RecvOptions};
use super::transceiver::Outcome;
use super::transport::{FlowState, Socket};
use crate::protocol::{Address, Envelope, ErrorReply};

/// Dispatch stage a handler is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// A message arrived, before any validation.
    MessageIn,
    /// A message is about to be sent.
    MessageOut,
    /// A message passed validation and carries data for the caller.
    Valid,
    /// A message failed validation.
    Invalid,
    /// A reply carried an unexpected sequence number.
    SequenceMismatch,
    /// An acknowledgment (error code 0) arrived.
    Ack,
    /// A multi-part batch ended.
    Finish,
    /// The kernel reported lost data.
    Overrun,
    /// A `NOOP` message arrived.
    Skipped,
    /// An inbound message asks for an acknowledgment.
    SendAck,
    /// A dump was interrupted by a concurrent change.
    DumpInterrupted,
}

impl CallbackKind {
    /// Every stage, in table order.
    pub const ALL: [Self; 11] = [
        Self::MessageIn,
        Self::MessageOut,
        Self::Valid,
        Self::Invalid,
        Self::SequenceMismatch,
        Self::Ack,
        Self::Finish,
        Self::Overrun,
        Self::Skipped,
        Self::SendAck,
        Self::DumpInterrupted,
    ];

    const COUNT: usize = Self::ALL.len();

    const fn index(self) -> usize {
        self as usize
    }

    /// Verdict applied when no handler is registered for this stage.
    #[must_use]
    pub const fn default_action(self) -> Action {
        match self {
            Self::MessageIn | Self::MessageOut | Self::Valid | Self::SendAck => Action::Proceed,
            Self::SequenceMismatch | Self::Skipped => Action::Skip,
            Self::Ack | Self::Finish => Action::Stop,
            Self::Invalid => Action::Fail(FailReason::Invalid),
            Self::Overrun => Action::Fail(FailReason::Overrun),
            Self::DumpInterrupted => Action::Fail(FailReason::DumpInterrupted),
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MessageIn => "message-in",
            Self::MessageOut => "message-out",
            Self::Valid => "valid-message",
            Self::Invalid => "invalid-message",
            Self::SequenceMismatch => "sequence-mismatch",
            Self::Ack => "ack-received",
            Self::Finish => "finish",
            Self::Overrun => "overrun",
            Self::Skipped => "skip",
            Self::SendAck => "send-ack",
            Self::DumpInterrupted => "dump-interrupted",
        };
        write!(f, "{name}")
    }
}

/// Verdict returned by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Continue with the next stage or message.
    Proceed,
    /// Drop the current message and move on to the next one.
    Skip,
    /// End the flow successfully.
    Stop,
    /// End the flow with an error.
    Fail(FailReason),
}

/// Error a handler can end a flow with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The message is malformed.
    Invalid,
    /// Data was lost.
    Overrun,
    /// The message does not belong to the outstanding request.
    SequenceMismatch,
    /// Surface the given negative errno to the caller.
    Protocol(i32),
    /// The dump is inconsistent.
    DumpInterrupted,
    /// Handler-specific failure.
    Aborted,
}

/// Context passed to every handler invocation.
///
/// `stage` always names the stage that triggered the running handler, so a
/// handler shared between stages can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    stage: CallbackKind,
    state: FlowState,
    expected_seq: Option<u32>,
    peer: Address,
    index: usize,
}

impl DispatchContext {
    pub(crate) const fn new(
        stage: CallbackKind,
        state: FlowState,
        expected_seq: Option<u32>,
        peer: Address,
        index: usize,
    ) -> Self {
        Self {
            stage,
            state,
            expected_seq,
            peer,
            index,
        }
    }

    const fn at(self, stage: CallbackKind) -> Self {
        Self { stage, ..self }
    }

    /// Stage that triggered the running handler.
    #[must_use]
    pub const fn stage(&self) -> CallbackKind {
        self.stage
    }

    /// State of the flow the message belongs to.
    #[must_use]
    pub const fn state(&self) -> FlowState {
        self.state
    }

    /// Sequence number of the outstanding request, if any.
    #[must_use]
    pub const fn expected_seq(&self) -> Option<u32> {
        self.expected_seq
    }

    /// Endpoint the message came from (or goes to, for `message-out`).
    #[must_use]
    pub const fn peer(&self) -> Address {
        self.peer
    }

    /// Position of the message within the current flow, starting at 0.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

type BoundArg = Box<dyn Any + Send>;

type ArgRef<'a> = Option<&'a mut (dyn Any + Send + 'static)>;

type Handler = Box<dyn FnMut(&Envelope, &DispatchContext, ArgRef<'_>) -> Action + Send>;

type ErrorHandler = Box<dyn FnMut(&ErrorReply, &DispatchContext, ArgRef<'_>) -> Action + Send>;

/// Replacement for the default transmit path.
///
/// Returns the number of message bytes written.
pub type SendOverride =
    Box<dyn FnMut(&mut dyn PacketSocket, &Envelope) -> Result<usize, TransportError> + Send>;

/// Replacement for the default datagram read.
pub type RecvOverride =
    Box<dyn FnMut(&mut dyn PacketSocket, &RecvOptions) -> Result<Datagram, TransportError> + Send>;

/// Replacement for the whole receive-and-dispatch loop.
///
/// The hook runs with itself detached from the socket, so calling
/// [`Socket::receive_and_dispatch`] from inside it runs the default loop.
/// The second argument is the per-datagram deadline.
pub type RecvmsgsOverride =
    Box<dyn FnMut(&mut Socket, Option<Duration>) -> Result<Outcome, TransportError> + Send>;

/// Per-socket callback configuration.
pub struct Callbacks {
    handlers: [Option<Handler>; CallbackKind::COUNT],
    args: [Option<BoundArg>; CallbackKind::COUNT],
    error_handler: Option<ErrorHandler>,
    error_arg: Option<BoundArg>,
    send_override: Option<SendOverride>,
    recv_override: Option<RecvOverride>,
    recvmsgs_override: Option<RecvmsgsOverride>,
}

impl Callbacks {
    /// Create a table with no handlers registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: std::array::from_fn(|_| None),
            args: std::array::from_fn(|_| None),
            error_handler: None,
            error_arg: None,
            send_override: None,
            recv_override: None,
            recvmsgs_override: None,
        }
    }

    /// Create a table that logs every inbound and outbound message header.
    #[must_use]
    pub fn with_logging() -> Self {
        let mut callbacks = Self::new();
        for kind in [CallbackKind::MessageIn, CallbackKind::MessageOut] {
            callbacks.set(kind, |envelope, ctx| {
                if let Ok(header) = envelope.header() {
                    debug!(
                        stage = %ctx.stage(),
                        peer = %ctx.peer(),
                        msg_type = %header.message_type(),
                        flags = %header.flags(),
                        seq = header.seq(),
                        port = header.port(),
                        len = header.len(),
                        "netlink message"
                    );
                }
                Action::Proceed
            });
        }
        callbacks
    }

    /// Register or replace the handler for `kind`, dropping any bound argument.
    pub fn set<F>(&mut self, kind: CallbackKind, mut handler: F)
    where
        F: FnMut(&Envelope, &DispatchContext) -> Action + Send + 'static,
    {
        self.handlers[kind.index()] = Some(Box::new(
            move |envelope: &Envelope, ctx: &DispatchContext, _: ArgRef<'_>| handler(envelope, ctx),
        ));
        self.args[kind.index()] = None;
    }

    /// Register or replace the handler for `kind` together with its argument.
    pub fn set_with_arg<A, F>(&mut self, kind: CallbackKind, arg: A, mut handler: F)
    where
        A: Any + Send,
        F: FnMut(&Envelope, &DispatchContext, &mut A) -> Action + Send + 'static,
    {
        self.handlers[kind.index()] = Some(Box::new(
            move |envelope: &Envelope, ctx: &DispatchContext, arg: ArgRef<'_>| match arg
                .and_then(|arg| arg.downcast_mut::<A>())
            {
                Some(arg) => handler(envelope, ctx, arg),
                None => kind.default_action(),
            },
        ));
        self.args[kind.index()] = Some(Box::new(arg));
    }

    /// Remove the handler for `kind`, restoring its default verdict.
    pub fn clear(&mut self, kind: CallbackKind) {
        self.handlers[kind.index()] = None;
        self.args[kind.index()] = None;
    }

    /// Check whether a handler is registered for `kind`.
    #[must_use]
    pub fn is_set(&self, kind: CallbackKind) -> bool {
        self.handlers[kind.index()].is_some()
    }

    /// Argument bound to the handler for `kind`.
    #[must_use]
    pub fn arg<A: Any>(&self, kind: CallbackKind) -> Option<&A> {
        self.args[kind.index()].as_deref()?.downcast_ref::<A>()
    }

    /// Mutable argument bound to the handler for `kind`.
    pub fn arg_mut<A: Any>(&mut self, kind: CallbackKind) -> Option<&mut A> {
        self.args[kind.index()].as_deref_mut()?.downcast_mut::<A>()
    }

    /// Register the handler for kernel error replies.
    pub fn set_error_handler<F>(&mut self, mut handler: F)
    where
        F: FnMut(&ErrorReply, &DispatchContext) -> Action + Send + 'static,
    {
        self.error_handler = Some(Box::new(
            move |reply: &ErrorReply, ctx: &DispatchContext, _: ArgRef<'_>| handler(reply, ctx),
        ));
        self.error_arg = None;
    }

    /// Register the handler for kernel error replies together with its argument.
    pub fn set_error_handler_with_arg<A, F>(&mut self, arg: A, mut handler: F)
    where
        A: Any + Send,
        F: FnMut(&ErrorReply, &DispatchContext, &mut A) -> Action + Send + 'static,
    {
        self.error_handler = Some(Box::new(
            move |reply: &ErrorReply, ctx: &DispatchContext, arg: ArgRef<'_>| match arg
                .and_then(|arg| arg.downcast_mut::<A>())
            {
                Some(arg) => handler(reply, ctx, arg),
                None => Action::Fail(FailReason::Protocol(reply.code())),
            },
        ));
        self.error_arg = Some(Box::new(arg));
    }

    /// Remove the error handler so error replies reach the caller.
    pub fn clear_error_handler(&mut self) {
        self.error_handler = None;
        self.error_arg = None;
    }

    /// Argument bound to the error handler.
    #[must_use]
    pub fn error_arg<A: Any>(&self) -> Option<&A> {
        self.error_arg.as_deref()?.downcast_ref::<A>()
    }

    /// Replace the transmit path.
    pub fn set_send_override<F>(&mut self, hook: F)
    where
        F: FnMut(&mut dyn PacketSocket, &Envelope) -> Result<usize, TransportError>
            + Send
            + 'static,
    {
        self.send_override = Some(Box::new(hook));
    }

    /// Replace the datagram read.
    pub fn set_recv_override<F>(&mut self, hook: F)
    where
        F: FnMut(&mut dyn PacketSocket, &RecvOptions) -> Result<Datagram, TransportError>
            + Send
            + 'static,
    {
        self.recv_override = Some(Box::new(hook));
    }

    /// Replace the receive-and-dispatch loop.
    pub fn set_recvmsgs_override<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Socket, Option<Duration>) -> Result<Outcome, TransportError>
            + Send
            + 'static,
    {
        self.recvmsgs_override = Some(Box::new(hook));
    }

    /// Restore the default receive-and-dispatch loop.
    pub fn clear_recvmsgs_override(&mut self) {
        self.recvmsgs_override = None;
    }

    pub(crate) fn take_recvmsgs_override(&mut self) -> Option<RecvmsgsOverride> {
        self.recvmsgs_override.take()
    }

    /// Put a detached hook back unless it was replaced while it ran.
    pub(crate) fn restore_recvmsgs_override(&mut self, hook: RecvmsgsOverride) {
        if self.recvmsgs_override.is_none() {
            self.recvmsgs_override = Some(hook);
        }
    }

    /// Restore the default transmit path.
    pub fn clear_send_override(&mut self) {
        self.send_override = None;
    }

    /// Restore the default datagram read.
    pub fn clear_recv_override(&mut self) {
        self.recv_override = None;
    }

    pub(crate) fn send_override_mut(&mut self) -> Option<&mut SendOverride> {
        self.send_override.as_mut()
    }

    pub(crate) fn recv_override_mut(&mut self) -> Option<&mut RecvOverride> {
        self.recv_override.as_mut()
    }

    /// Run the handler for `kind`, or its default verdict when none is set.
    pub fn invoke(
        &mut self,
        kind: CallbackKind,
        envelope: &Envelope,
        ctx: &DispatchContext,
    ) -> Action {
        let ctx = ctx.at(kind);
        let index = kind.index();
        let action = match self.handlers[index].as_mut() {
            Some(handler) => handler(envelope, &ctx, self.args[index].as_deref_mut()),
            None => kind.default_action(),
        };
        trace!(stage = %kind, ?action, "callback");
        action
    }

    /// Run the error handler; `None` when no handler is registered.
    pub fn invoke_error(&mut self, reply: &ErrorReply, ctx: &DispatchContext) -> Option<Action> {
        let handler = self.error_handler.as_mut()?;
        let action = handler(reply, ctx, self.error_arg.as_deref_mut());
        trace!(code = reply.code(), ?action, "error callback");
        Some(action)
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<CallbackKind> = CallbackKind::ALL
            .into_iter()
            .filter(|kind| self.is_set(*kind))
            .collect();
        f.debug_struct("Callbacks")
            .field("handlers", &set)
            .field("error_handler", &self.error_handler.is_some())
            .field("send_override", &self.send_override.is_some())
            .field("recv_override", &self.recv_override.is_some())
            .field("recvmsgs_override", &self.recvmsgs_override.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeaderFlags, MessageType};

    fn ctx() -> DispatchContext {
        DispatchContext::new(
            CallbackKind::MessageIn,
            FlowState::Receiving,
            Some(5),
            Address::KERNEL,
            0,
        )
    }

    fn envelope() -> Envelope {
        Envelope::new(MessageType::Other(0x10), HeaderFlags::new())
    }

    #[test]
    fn test_defaults_per_stage() {
        let mut callbacks = Callbacks::new();
        let msg = envelope();

        assert_eq!(
            callbacks.invoke(CallbackKind::Valid, &msg, &ctx()),
            Action::Proceed
        );
        assert_eq!(
            callbacks.invoke(CallbackKind::Invalid, &msg, &ctx()),
            Action::Fail(FailReason::Invalid)
        );
        assert_eq!(
            callbacks.invoke(CallbackKind::Overrun, &msg, &ctx()),
            Action::Fail(FailReason::Overrun)
        );
        assert_eq!(callbacks.invoke(CallbackKind::Ack, &msg, &ctx()), Action::Stop);
        assert_eq!(
            callbacks.invoke(CallbackKind::Finish, &msg, &ctx()),
            Action::Stop
        );
        assert_eq!(
            callbacks.invoke(CallbackKind::SequenceMismatch, &msg, &ctx()),
            Action::Skip
        );
    }

    #[test]
    fn test_last_registration_wins() {
        let mut callbacks = Callbacks::new();
        callbacks.set(CallbackKind::Valid, |_, _| Action::Skip);
        callbacks.set(CallbackKind::Valid, |_, _| Action::Stop);

        assert_eq!(
            callbacks.invoke(CallbackKind::Valid, &envelope(), &ctx()),
            Action::Stop
        );
        callbacks.clear(CallbackKind::Valid);
        assert!(!callbacks.is_set(CallbackKind::Valid));
    }

    #[test]
    fn test_active_stage_visible_to_handler() {
        let mut callbacks = Callbacks::new();
        callbacks.set_with_arg(
            CallbackKind::Finish,
            Vec::<CallbackKind>::new(),
            |_, ctx, seen| {
                seen.push(ctx.stage());
                Action::Proceed
            },
        );

        callbacks.invoke(CallbackKind::Finish, &envelope(), &ctx());
        assert_eq!(
            callbacks.arg::<Vec<CallbackKind>>(CallbackKind::Finish),
            Some(&vec![CallbackKind::Finish])
        );
    }

    #[test]
    fn test_bound_argument_mutation() {
        let mut callbacks = Callbacks::new();
        callbacks.set_with_arg(CallbackKind::Valid, 0usize, |_, _, count| {
            *count += 1;
            Action::Proceed
        });

        for _ in 0..3 {
            callbacks.invoke(CallbackKind::Valid, &envelope(), &ctx());
        }
        assert_eq!(callbacks.arg::<usize>(CallbackKind::Valid), Some(&3));
        assert_eq!(callbacks.arg::<u32>(CallbackKind::Valid), None);

        *callbacks.arg_mut::<usize>(CallbackKind::Valid).unwrap() = 0;
        assert_eq!(callbacks.arg::<usize>(CallbackKind::Valid), Some(&0));
    }

    #[test]
    fn test_error_handler_receives_code() {
        let mut callbacks = Callbacks::new();
        let reply = ErrorReply::new(-libc::EPERM, None);
        assert!(callbacks.invoke_error(&reply, &ctx()).is_none());

        callbacks.set_error_handler_with_arg(None::<i32>, |reply, _, seen| {
            *seen = Some(reply.code());
            Action::Skip
        });
        assert_eq!(callbacks.invoke_error(&reply, &ctx()), Some(Action::Skip));
        assert_eq!(callbacks.error_arg::<Option<i32>>(), Some(&Some(-libc::EPERM)));
    }
}
