use std::fmt;

/// A protocol version, packed on the wire as `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn from_parts(major: u8, minor: u8) -> Self {
        ProtocolVersion { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl From<u64> for ProtocolVersion {
    fn from(x: u64) -> Self {
        ProtocolVersion {
            major: ((x >> 8) & 0xff) as u8,
            minor: (x & 0xff) as u8,
        }
    }
}

impl From<ProtocolVersion> for u64 {
    fn from(version: ProtocolVersion) -> Self {
        ((version.major as u64) << 8) | version.minor as u64
    }
}

/// The newest version this implementation speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::from_parts(1, 38);
/// The oldest version this implementation accepts.
pub const MIN_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::from_parts(1, 10);
