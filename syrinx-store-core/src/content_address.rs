//! Content addresses: how a store object's contents determine its path.

use std::fmt;

use thiserror::Error;

use crate::hash::{Hash, HashAlgo, ParseHashError};

/// The ingestion method part of a content address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddressMethod {
    /// Plain text, hashed flat. Used for derivation files.
    Text,
    /// A regular file, hashed flat.
    Flat,
    /// An archive serialisation of a filesystem object.
    NixArchive,
    /// A git tree object.
    Git,
}

impl ContentAddressMethod {
    /// The prefix rendered in front of the algorithm, e.g. `fixed:r:` for
    /// [`ContentAddressMethod::NixArchive`].
    fn render_prefix(&self) -> &'static str {
        match self {
            ContentAddressMethod::Text => "text:",
            ContentAddressMethod::Flat => "fixed:",
            ContentAddressMethod::NixArchive => "fixed:r:",
            ContentAddressMethod::Git => "fixed:git:",
        }
    }

    fn parse_prefix(s: &str) -> Result<(Self, &str), ContentAddressError> {
        if let Some(rest) = s.strip_prefix("text:") {
            Ok((ContentAddressMethod::Text, rest))
        } else if let Some(rest) = s.strip_prefix("fixed:r:") {
            Ok((ContentAddressMethod::NixArchive, rest))
        } else if let Some(rest) = s.strip_prefix("fixed:git:") {
            Ok((ContentAddressMethod::Git, rest))
        } else if let Some(rest) = s.strip_prefix("fixed:") {
            Ok((ContentAddressMethod::Flat, rest))
        } else {
            Err(ContentAddressError::UnknownMethod(s.to_owned()))
        }
    }
}

/// A content address pairs a method with the digest of the contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentAddress {
    pub method: ContentAddressMethod,
    pub hash: Hash,
}

impl ContentAddress {
    /// Parse the textual form, e.g. `fixed:r:sha256:<base32>`.
    pub fn parse(s: &str) -> Result<Self, ContentAddressError> {
        let (method, rest) = ContentAddressMethod::parse_prefix(s)?;
        let hash = Hash::parse(rest)?;
        Ok(ContentAddress { method, hash })
    }

    /// Parse a `<method>:<algo>` pair without a digest, as sent by clients
    /// that upload contents for the daemon to hash.
    pub fn parse_method_algo(s: &str) -> Result<(ContentAddressMethod, HashAlgo), ContentAddressError> {
        let (method, rest) = ContentAddressMethod::parse_prefix(s)?;
        Ok((method, HashAlgo::from_name(rest)?))
    }

    pub fn render_method_algo(method: ContentAddressMethod, algo: HashAlgo) -> String {
        format!("{}{}", method.render_prefix(), algo)
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.method.render_prefix(), self.hash.to_prefixed_hex())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentAddressError {
    #[error("unknown content address method in '{0}'")]
    UnknownMethod(String),
    #[error(transparent)]
    Hash(#[from] ParseHashError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "1b8e0b6a0bdc2a4ec18d1fe7e6b8f06e1b7b6e0e0b0f0a0a0b0c0d0e0f101112";

    #[test]
    fn round_trip_text() {
        let ca = ContentAddress::parse(&format!("text:sha256:{DIGEST}")).unwrap();
        assert_eq!(ca.method, ContentAddressMethod::Text);
        assert_eq!(ca.to_string(), format!("text:sha256:{DIGEST}"));
    }

    #[test]
    fn round_trip_nar() {
        let ca = ContentAddress::parse(&format!("fixed:r:sha256:{DIGEST}")).unwrap();
        assert_eq!(ca.method, ContentAddressMethod::NixArchive);
        assert_eq!(ca.to_string(), format!("fixed:r:sha256:{DIGEST}"));
    }

    #[test]
    fn flat_has_no_marker() {
        let ca = ContentAddress::parse(&format!("fixed:sha256:{DIGEST}")).unwrap();
        assert_eq!(ca.method, ContentAddressMethod::Flat);
    }

    #[test]
    fn method_algo_pair() {
        let (m, a) = ContentAddress::parse_method_algo("fixed:r:sha256").unwrap();
        assert_eq!(m, ContentAddressMethod::NixArchive);
        assert_eq!(a, HashAlgo::Sha256);
        assert_eq!(ContentAddress::render_method_algo(m, a), "fixed:r:sha256");
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(ContentAddress::parse("blob:sha256:00").is_err());
    }
}
