use thiserror::Error;

use crate::protocol::ProtocolVersion;

/// An error raised by the remote side and delivered through the terminal
/// `ERROR` stderr frame. These are the only errors that leave a connection
/// usable: the stream is still in sync after one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DaemonError {
    pub kind: DaemonErrorKind,
    pub message: String,
    /// Exit status carried by the pre-1.26 error form.
    pub status: u64,
    pub traces: Vec<String>,
}

impl DaemonError {
    pub fn new(kind: DaemonErrorKind, message: impl Into<String>) -> Self {
        DaemonError {
            kind,
            message: message.into(),
            status: 1,
            traces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonErrorKind {
    InvalidPath,
    BadStorePath,
    Permission,
    BuildFailure,
    OutputRejected,
    NotDeterministic,
    Interrupted,
    Unsupported,
    Misc,
}

impl DaemonErrorKind {
    /// The `name` field of the structured error frame.
    pub fn name(&self) -> &'static str {
        match self {
            DaemonErrorKind::InvalidPath => "InvalidPath",
            DaemonErrorKind::BadStorePath => "BadStorePath",
            DaemonErrorKind::Permission => "Permission",
            DaemonErrorKind::BuildFailure => "BuildFailure",
            DaemonErrorKind::OutputRejected => "OutputRejected",
            DaemonErrorKind::NotDeterministic => "NotDeterministic",
            DaemonErrorKind::Interrupted => "Interrupted",
            DaemonErrorKind::Unsupported => "Unsupported",
            DaemonErrorKind::Misc => "Error",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "InvalidPath" => DaemonErrorKind::InvalidPath,
            "BadStorePath" => DaemonErrorKind::BadStorePath,
            "Permission" => DaemonErrorKind::Permission,
            "BuildFailure" => DaemonErrorKind::BuildFailure,
            "OutputRejected" => DaemonErrorKind::OutputRejected,
            "NotDeterministic" => DaemonErrorKind::NotDeterministic,
            "Interrupted" => DaemonErrorKind::Interrupted,
            "Unsupported" => DaemonErrorKind::Unsupported,
            _ => DaemonErrorKind::Misc,
        }
    }
}

impl std::fmt::Display for DaemonErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected end of stream: {context}")]
    UnexpectedEof { context: String },

    #[error("invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("peer protocol version {peer} is outside the supported range {min}-{max}")]
    IncompatibleVersion {
        peer: ProtocolVersion,
        min: ProtocolVersion,
        max: ProtocolVersion,
    },

    #[error("peer announced effective version {announced} but negotiation yields {computed}")]
    EffectiveVersionMismatch {
        announced: ProtocolVersion,
        computed: ProtocolVersion,
    },

    #[error("string too long: {length} exceeds maximum {max}")]
    StringTooLong { length: u64, max: u64 },

    #[error("list too long: {length} exceeds maximum {max}")]
    ListTooLong { length: u64, max: u64 },

    #[error("invalid operation code: {0}")]
    InvalidOpCode(u64),

    #[error("operation {op} requires protocol {required}, negotiated {negotiated}")]
    OpCodeTooNew {
        op: u64,
        required: ProtocolVersion,
        negotiated: ProtocolVersion,
    },

    #[error("unknown stderr message tag: {0:#x}")]
    InvalidMsgCode(u64),

    #[error("invalid UTF-8 in string data: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("bad store path on the wire: {0}")]
    BadStorePath(String),

    #[error("invalid {what} on the wire: {value}")]
    BadValue { what: &'static str, value: String },

    #[error("framed stream ended before its terminating chunk")]
    FrameTruncated,

    #[error("stderr frame {0:#x} arrived without a matching sink or source")]
    UnexpectedDataFrame(u64),

    #[error("connection is poisoned and must not be reused")]
    Poisoned,

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

impl ProtocolError {
    /// Create an IO error with context. Short reads are folded into
    /// [`ProtocolError::UnexpectedEof`] so callers can tell a truncated
    /// peer from a broken transport.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::UnexpectedEof {
                context: context.into(),
            }
        } else {
            Self::Io {
                context: context.into(),
                source,
            }
        }
    }

    pub fn bad_value(what: &'static str, value: impl std::fmt::Display) -> Self {
        Self::BadValue {
            what,
            value: value.to_string(),
        }
    }

    /// Whether the stream is still in sync after this error. Only errors
    /// raised after a cleanly-read frame qualify; anything touching the
    /// transport or the framing poisons the connection.
    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            ProtocolError::Daemon(_) | ProtocolError::BadStorePath(_) | ProtocolError::BadValue { .. }
        )
    }

    /// Convert into the error form sent over the `ERROR` frame.
    pub fn into_daemon_error(self) -> DaemonError {
        match self {
            ProtocolError::Daemon(e) => e,
            ProtocolError::BadStorePath(msg) => {
                DaemonError::new(DaemonErrorKind::BadStorePath, msg)
            }
            other => DaemonError::new(DaemonErrorKind::Misc, other.to_string()),
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(source: std::io::Error) -> Self {
        ProtocolError::io("IO error", source)
    }
}

/// Extension trait for adding context to IO errors.
pub trait IoErrorContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|e| ProtocolError::io(context, e))
    }
}

impl<T> IoErrorContext<T> for Result<T, ProtocolError> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|e| match e {
            ProtocolError::Io {
                context: inner,
                source,
            } => ProtocolError::Io {
                context: format!("{}: {}", context.into(), inner),
                source,
            },
            ProtocolError::UnexpectedEof { context: inner } => ProtocolError::UnexpectedEof {
                context: format!("{}: {}", context.into(), inner),
            },
            other => other,
        })
    }
}
