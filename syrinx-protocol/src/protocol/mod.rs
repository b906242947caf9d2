pub mod messages;
pub mod opcodes;
pub mod version;

pub use messages::{
    ActivityType, LoggerField, Msg, ResultType, StderrError, Trace, Verbosity, FIELD_TYPE_INT,
    FIELD_TYPE_STRING,
};
pub use opcodes::OpCode;
pub use version::{ProtocolVersion, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// The outcome of version and feature negotiation: the minimum of the two
/// announced versions, and the intersection of the two feature sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: ProtocolVersion,
    pub features: std::collections::BTreeSet<String>,
}

/// First magic of the handshake, sent by the client.
pub const CLIENT_MAGIC: u64 = 0x6e697863;
/// Second magic of the handshake, sent by the server.
pub const SERVER_MAGIC: u64 = 0x6478696f;

/// Sanity bound for a single length-prefixed string.
pub const MAX_STRING_SIZE: u64 = 0x1000000; // 16M
/// Sanity bound for element counts of sequences, sets and maps.
pub const MAX_LIST_SIZE: u64 = 0x10000; // 64K
/// Chunk size requested from a client-side source via `READ` frames.
pub const TUNNEL_READ_CHUNK: u64 = 0x10000; // 64K
/// Cap on NAR payloads that must be buffered whole (pre-framing clients).
pub const MAX_BUFFERED_NAR: u64 = 0x10000000; // 256M

/// Feature token enabling the credential side-channel.
pub const FEATURE_AUTH_FORWARDING: &str = "auth-forwarding";
