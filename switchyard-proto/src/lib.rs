//! Transport-agnostic message protocol engine.
//!
//! Raw payloads are decoded by a [`Translator`] into directional [`Message`]s,
//! routed through an ordered chain of [`ProtocolLayer`]s, and the lifetime of
//! each connection is governed by a [`MessageProcessor`].

pub mod command;
pub mod config;
pub mod formats;
pub mod framing;
pub mod layers;
pub mod messages;
pub mod processor;
pub mod protocol;
pub mod timeout;
pub mod translator;

pub use command::*;
pub use config::ProtocolConfig;
pub use formats::*;
pub use framing::*;
pub use layers::*;
pub use messages::*;
pub use processor::*;
pub use protocol::*;
pub use timeout::*;
pub use translator::*;

/// Errors raised while building the addressing space. These are setup-time
/// failures and always surface to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressingError {
    #[error("the wildcard command cannot be registered as a namespace or code")]
    WildcardRegistration,

    #[error("a wildcard namespace requires a wildcard code, got {0}")]
    WildcardNamespace(String),

    #[error("command {0} already exists")]
    DuplicateCommand(String),

    #[error("wire code of {requested} is already taken by {existing}")]
    CodeConflict { existing: String, requested: String },

    #[error("cannot register {0} into an unknown namespace")]
    UnknownNamespace(String),

    #[error("{0} has no numeric code, which the compact encoding requires")]
    MissingCode(String),

    #[error("invalid command token: {0}")]
    InvalidToken(String),
}

/// Failures while decoding, validating or encoding a wire message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("binary payload requested, but this translator uses a text format")]
    UnexpectedBinary,

    #[error("text payload requested, but this translator uses a binary format")]
    UnexpectedText,

    #[error("payload could not be decoded: {0}")]
    Decode(String),

    #[error("received data is not a map")]
    ExpectedMap,

    #[error("received data has no `code` member")]
    MissingCode,

    #[error("`code` member has the wrong type: {0}")]
    InvalidCode(String),

    #[error("command token is not a dotted string: {0}")]
    MalformedCommand(String),

    #[error("unexpected member in message: {0}")]
    UnexpectedField(String),

    #[error("expected message args as a list")]
    ArgsNotList,

    #[error("expected message kwargs as a map")]
    KwargsNotMap,

    #[error("expected message kwargs keys as strings")]
    KwargsKeysNotStrings,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("command {0} cannot travel in this direction")]
    WrongDirection(String),

    #[error("message could not be encoded: {0}")]
    Encode(String),

    #[error(transparent)]
    Addressing(#[from] AddressingError),
}

impl TranslateError {
    /// Whether the payload was well formed but addressed a command the
    /// peer may not use.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TranslateError::UnknownCommand(_) | TranslateError::WrongDirection(_)
        )
    }
}

/// Failures reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("connection I/O error: {0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("command {0} cannot be sent to the client")]
    Direction(String),

    #[error("cannot send while the connection is {0}")]
    NotOpen(ProcessorState),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("timeout already running")]
    AlreadyRunning,

    #[error("timeout still running")]
    StillRunning,

    #[error("timeout not running")]
    NotRunning,

    #[error("could not arm timer: {0}")]
    CouldNotArm(String),

    #[error("no timer backend is available for this connection")]
    NoBackend,
}

/// Lifecycle misuse of a [`MessageProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("connection was already established (state: {0})")]
    AlreadyEstablished(ProcessorState),

    #[error("connection is not open (state: {0})")]
    NotOpen(ProcessorState),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),
}
