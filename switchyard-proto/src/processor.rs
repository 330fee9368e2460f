//! The per-connection state machine: lifecycle, dispatch through the layer
//! chain, and the strict and lenient error policies.

use crate::{
    CommandSpec, CommandToken, Expiry, Framing, HandlerError, Message, Outcome, Protocol,
    ProcessorError, SendError, TimerBackend, Timeout, TimeoutError, TranslateError, Translator,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const UNKNOWN_MESSAGE_REASON: &str = "Unexistent or unavailable message";
const FORMAT_ERROR_REASON: &str = "Message format error";
const INTERNAL_ERROR_REASON: &str = "Cannot fulfill request: Internal server error";

/// A close code as sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: CloseCode = CloseCode(1000);
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(1002);
    pub const UNSUPPORTED_DATA: CloseCode = CloseCode(1003);
    pub const INTERNAL_ERROR: CloseCode = CloseCode(1011);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The transport primitive the processor writes through.
pub trait Connection {
    fn send(&mut self, data: Vec<u8>, framing: Framing) -> Result<(), crate::ConnectionError>;
    fn close(&mut self, code: CloseCode, reason: &str);
}

/// What a hook asks the processor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Close,
}

pub type HookResult = Result<Control, HandlerError>;

/// Where an unexpected failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Hello,
    Message,
    Goodbye,
    UnknownMessage,
    SerializerException,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Hello => "hello",
            Stage::Message => "message handling",
            Stage::Goodbye => "goodbye",
            Stage::UnknownMessage => "unknown message hook",
            Stage::SerializerException => "serializer exception hook",
        })
    }
}

/// How failures are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Every failure closes the connection with a fixed code.
    Strict,
    /// Failures are handed to the session's hooks.
    #[default]
    Lenient,
}

impl ErrorPolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            ErrorPolicy::Strict
        } else {
            ErrorPolicy::Lenient
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Unopened,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessorState::Unopened => "unopened",
            ProcessorState::Open => "open",
            ProcessorState::Closing => "closing",
            ProcessorState::Closed => "closed",
        })
    }
}

/// What handlers and hooks may touch while they run.
pub struct Context<'a> {
    translator: &'a Translator,
    connection: &'a mut dyn Connection,
    timers: Option<&'a Arc<dyn TimerBackend>>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        translator: &'a Translator,
        connection: &'a mut dyn Connection,
        timers: Option<&'a Arc<dyn TimerBackend>>,
    ) -> Self {
        Self {
            translator,
            connection,
            timers,
        }
    }

    pub fn translator(&self) -> &Translator {
        self.translator
    }

    pub fn message(&self, namespace: &CommandSpec, code: &CommandSpec) -> Result<Message, TranslateError> {
        self.translator.message(namespace, code)
    }

    pub fn message_for(&self, token: &CommandToken) -> Result<Message, TranslateError> {
        self.translator.message_for(token)
    }

    /// Sends a message to the peer. Messages that may not travel to the
    /// client are refused before anything is written.
    pub fn send(&mut self, message: &Message) -> Result<(), SendError> {
        if !message.direction().to_client() {
            return Err(SendError::Direction(message.to_string()));
        }

        let data = self.translator.serialize(message)?;
        debug!("Sending {}", message);
        self.connection.send(data, self.translator.encoding().framing())?;
        Ok(())
    }

    /// Creates an unstarted timeout on this connection's timer backend.
    pub fn timeout<F>(&self, delay: Duration, on_reach: F) -> Result<Timeout, TimeoutError>
    where
        F: Fn(Expiry) + Send + Sync + 'static,
    {
        let timers = self.timers.ok_or(TimeoutError::NoBackend)?;
        Ok(Timeout::new(Arc::clone(timers), delay, on_reach))
    }
}

/// Per-connection callbacks. Every method has a do-nothing default.
pub trait Hooks {
    fn on_hello(&mut self, _ctx: &mut Context<'_>) -> HookResult {
        Ok(Control::Continue)
    }

    fn on_goodbye(&mut self, _ctx: &mut Context<'_>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Lenient policy only.
    fn on_unknown_message(&mut self, _ctx: &mut Context<'_>, _message: &Message) -> HookResult {
        Ok(Control::Continue)
    }

    /// Lenient policy only.
    fn on_serializer_exception(&mut self, _ctx: &mut Context<'_>, _error: &TranslateError) -> HookResult {
        Ok(Control::Continue)
    }

    /// Lenient policy only. A failure here closes the connection with 1011.
    fn on_unknown_exception(&mut self, _ctx: &mut Context<'_>, _error: &HandlerError, _stage: Stage) -> HookResult {
        Ok(Control::Continue)
    }

    /// Runs right before a forceful close reaches the transport.
    fn on_forceful_close(&mut self, _code: CloseCode, _reason: &str) {}
}

impl Hooks for () {}

/// Drives one connection through its lifecycle.
///
/// Events must be delivered one at a time; every method runs to completion,
/// handlers included, before returning.
pub struct MessageProcessor<S, C> {
    protocol: Arc<Protocol<S>>,
    session: S,
    connection: C,
    policy: ErrorPolicy,
    timers: Option<Arc<dyn TimerBackend>>,
    state: ProcessorState,
}

impl<S: Hooks, C: Connection> MessageProcessor<S, C> {
    pub fn new(protocol: Arc<Protocol<S>>, session: S, connection: C, policy: ErrorPolicy) -> Self {
        Self {
            protocol,
            session,
            connection,
            policy,
            timers: None,
            state: ProcessorState::Unopened,
        }
    }

    pub fn with_timers(mut self, timers: Arc<dyn TimerBackend>) -> Self {
        self.timers = Some(timers);
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.state == ProcessorState::Closed
    }

    pub fn connection_established(&mut self) -> Result<(), ProcessorError> {
        if self.state != ProcessorState::Unopened {
            return Err(ProcessorError::AlreadyEstablished(self.state));
        }
        self.state = ProcessorState::Open;
        info!("Connection established");

        let protocol = Arc::clone(&self.protocol);
        let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());
        let result = self.session.on_hello(&mut ctx);
        self.follow_hook(result, Stage::Hello);
        Ok(())
    }

    /// Handles one inbound payload. `framing` is what the transport saw, if
    /// it can tell text from binary.
    pub fn connection_message(&mut self, data: &[u8], framing: Option<Framing>) -> Result<(), ProcessorError> {
        if self.state != ProcessorState::Open {
            return Err(ProcessorError::NotOpen(self.state));
        }

        let protocol = Arc::clone(&self.protocol);
        let message = match protocol.translator().parse(data, framing) {
            Ok(message) => message,
            Err(e) => {
                self.serializer_exception(e);
                return Ok(());
            }
        };

        match self.dispatch(&protocol, &message) {
            Ok(Outcome::Handled) => {}
            Ok(Outcome::Close) => self.close_gracefully(),
            Ok(Outcome::TryNext | Outcome::Reject) => self.unknown_message(&message),
            Err(e) => self.unknown_exception(&e, Stage::Message),
        }
        Ok(())
    }

    /// The peer is gone; nothing more can be sent or closed.
    pub fn connection_lost(&mut self) {
        if self.state != ProcessorState::Closed {
            info!("Connection lost while {}", self.state);
            self.state = ProcessorState::Closed;
        }
    }

    /// Closes gracefully: runs the goodbye hook, then closes with 1000.
    pub fn terminate(&mut self) -> Result<(), ProcessorError> {
        if self.state != ProcessorState::Open {
            return Err(ProcessorError::NotOpen(self.state));
        }
        self.close_gracefully();
        Ok(())
    }

    /// Closes immediately with the given code, skipping the goodbye hook.
    pub fn force_close(&mut self, code: CloseCode, reason: &str) {
        self.forceful_close(code, reason);
    }

    pub fn send_message(&mut self, message: &Message) -> Result<(), SendError> {
        if !matches!(self.state, ProcessorState::Open | ProcessorState::Closing) {
            return Err(SendError::NotOpen(self.state));
        }
        let protocol = Arc::clone(&self.protocol);
        let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());
        ctx.send(message)
    }

    /// Offers the message to each layer in order until one settles it. A
    /// chain where every layer declines ends as a rejection.
    fn dispatch(&mut self, protocol: &Protocol<S>, message: &Message) -> Result<Outcome, HandlerError> {
        debug!("Dispatching {}", message);
        let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());

        for layer in protocol.layers() {
            match layer.process(&mut self.session, &mut ctx, message)? {
                Outcome::TryNext => continue,
                outcome => {
                    debug!("Layer {} answered {:?}", layer.name(), outcome);
                    return Ok(outcome);
                }
            }
        }
        Ok(Outcome::Reject)
    }

    fn follow_hook(&mut self, result: HookResult, stage: Stage) {
        match result {
            Ok(Control::Continue) => {}
            Ok(Control::Close) => self.close_gracefully(),
            Err(e) => self.unknown_exception(&e, stage),
        }
    }

    fn unknown_message(&mut self, message: &Message) {
        warn!("No layer accepted {}", message);
        match self.policy {
            ErrorPolicy::Strict => self.forceful_close(CloseCode::PROTOCOL_ERROR, UNKNOWN_MESSAGE_REASON),
            ErrorPolicy::Lenient => {
                let protocol = Arc::clone(&self.protocol);
                let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());
                let result = self.session.on_unknown_message(&mut ctx, message);
                self.follow_hook(result, Stage::UnknownMessage);
            }
        }
    }

    fn serializer_exception(&mut self, error: TranslateError) {
        warn!("Rejected inbound payload: {}", error);
        match self.policy {
            ErrorPolicy::Strict if error.is_protocol_violation() => {
                self.forceful_close(CloseCode::PROTOCOL_ERROR, UNKNOWN_MESSAGE_REASON)
            }
            ErrorPolicy::Strict => self.forceful_close(CloseCode::UNSUPPORTED_DATA, FORMAT_ERROR_REASON),
            ErrorPolicy::Lenient => {
                let protocol = Arc::clone(&self.protocol);
                let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());
                let result = self.session.on_serializer_exception(&mut ctx, &error);
                self.follow_hook(result, Stage::SerializerException);
            }
        }
    }

    /// Failures of this hook are not fed back into it.
    fn unknown_exception(&mut self, error: &HandlerError, stage: Stage) {
        error!("Failure during {}: {:#}", stage, error);
        match self.policy {
            ErrorPolicy::Strict => self.forceful_close(CloseCode::INTERNAL_ERROR, INTERNAL_ERROR_REASON),
            ErrorPolicy::Lenient => {
                let protocol = Arc::clone(&self.protocol);
                let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());
                let result = self.session.on_unknown_exception(&mut ctx, error, stage);
                match result {
                    Ok(Control::Continue) => {}
                    Ok(Control::Close) => self.close_gracefully(),
                    Err(e) => {
                        error!("Unknown exception hook failed: {:#}", e);
                        self.forceful_close(CloseCode::INTERNAL_ERROR, INTERNAL_ERROR_REASON);
                    }
                }
            }
        }
    }

    fn close_gracefully(&mut self) {
        if self.state != ProcessorState::Open {
            return;
        }
        self.state = ProcessorState::Closing;
        info!("Closing connection gracefully");

        let protocol = Arc::clone(&self.protocol);
        let mut ctx = Context::new(protocol.translator(), &mut self.connection, self.timers.as_ref());
        let result = self.session.on_goodbye(&mut ctx);
        if let Err(e) = result {
            self.unknown_exception(&e, Stage::Goodbye);
        }

        // A failing goodbye may already have closed it forcefully.
        if self.state == ProcessorState::Closing {
            self.connection.close(CloseCode::NORMAL, "");
            self.state = ProcessorState::Closed;
        }
    }

    fn forceful_close(&mut self, code: CloseCode, reason: &str) {
        if self.state == ProcessorState::Closed {
            return;
        }
        warn!("Closing connection forcefully: {} {}", code, reason);
        self.session.on_forceful_close(code, reason);
        self.connection.close(code, reason);
        self.state = ProcessorState::Closed;
    }
}

impl<S, C> fmt::Debug for MessageProcessor<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish()
    }
}
