use num_enum::{FromPrimitive, IntoPrimitive};

use crate::error::ProtocolError;

/// Stderr frame tags, interleaved between a request and its reply. Each is
/// a 32-bit magic carried as a u64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    Next = 0x6f6c6d67,
    Read = 0x64617461,
    Write = 0x64617416,
    Last = 0x616c7473,
    Error = 0x63787470,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
}

impl TryFrom<u64> for Msg {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0x6f6c6d67 => Ok(Self::Next),
            0x64617461 => Ok(Self::Read),
            0x64617416 => Ok(Self::Write),
            0x616c7473 => Ok(Self::Last),
            0x63787470 => Ok(Self::Error),
            0x53545254 => Ok(Self::StartActivity),
            0x53544f50 => Ok(Self::StopActivity),
            0x52534c54 => Ok(Self::Result),
            _ => Err(ProtocolError::InvalidMsgCode(value)),
        }
    }
}

/// Log levels. A client requests a verbosity via `SetOptions`; the server
/// drops anything chattier before it reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Verbosity {
    Error = 0,
    Warn = 1,
    Notice = 2,
    Info = 3,
    Talkative = 4,
    Chatty = 5,
    Debug = 6,
    // Unknown levels from newer peers clamp to the chattiest.
    #[num_enum(default)]
    Vomit = 7,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Info
    }
}

/// Activity kinds reported through `START_ACTIVITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ActivityType {
    #[num_enum(default)]
    Unknown = 0,
    CopyPath = 100,
    FileTransfer = 101,
    Realise = 102,
    CopyPaths = 103,
    Builds = 104,
    Build = 105,
    OptimiseStore = 106,
    VerifyPaths = 107,
    Substitute = 108,
    QueryPathInfo = 109,
    PostBuildHook = 110,
    BuildWaiting = 111,
}

/// Result kinds reported through `RESULT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ResultType {
    #[num_enum(default)]
    Unknown = 0,
    FileLinked = 100,
    BuildLogLine = 101,
    UntrustedPath = 102,
    CorruptedPath = 103,
    SetPhase = 104,
    Progress = 105,
    SetExpected = 106,
    PostBuildLogLine = 107,
}

/// A typed field of an activity or result frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerField {
    Int(u64),
    String(String),
}

pub const FIELD_TYPE_INT: u64 = 1;
pub const FIELD_TYPE_STRING: u64 = 2;

/// The structured error payload of an `ERROR` frame (v1.26 and later).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrError {
    pub typ: String,
    pub level: u64,
    pub name: String,
    pub message: String,
    pub traces: Vec<Trace>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for tag in [
            Msg::Next,
            Msg::Read,
            Msg::Write,
            Msg::Last,
            Msg::Error,
            Msg::StartActivity,
            Msg::StopActivity,
            Msg::Result,
        ] {
            assert_eq!(Msg::try_from(tag as u64).unwrap(), tag);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            Msg::try_from(0xdeadbeef),
            Err(ProtocolError::InvalidMsgCode(0xdeadbeef))
        ));
    }

    #[test]
    fn verbosity_is_ordered() {
        assert!(Verbosity::Error < Verbosity::Info);
        assert!(Verbosity::Info < Verbosity::Debug);
    }
}
