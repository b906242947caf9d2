//! Hash values as they appear in path metadata and on the wire.
//!
//! Digests arrive pre-computed; this module only parses and renders them.
//! Three textual digest encodings are accepted (hex, base32, base64,
//! distinguished by length), plus the SRI form `<algo>-<base64>`.

use std::fmt;

use data_encoding::{BASE64, HEXLOWER, HEXLOWER_PERMISSIVE};
use thiserror::Error;

use crate::base32;

#[derive(derive_more::Display, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgo {
    #[display("md5")]
    Md5,
    #[display("sha1")]
    Sha1,
    #[display("sha256")]
    Sha256,
    #[display("sha512")]
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub const fn base16_len(&self) -> usize {
        self.digest_size_const() * 2
    }

    pub const fn base32_len(&self) -> usize {
        base32::encode_len(self.digest_size_const())
    }

    pub const fn base64_len(&self) -> usize {
        self.digest_size_const().div_ceil(3) * 4
    }

    const fn digest_size_const(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ParseHashError> {
        match name {
            "md5" => Ok(HashAlgo::Md5),
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(name.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash {
    algo: HashAlgo,
    digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                algo,
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Parse `<algo>:<digest>` or the SRI form `<algo>-<base64>`. The digest
    /// encoding is recognised by its length.
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let (algo, rest, sri) = match (s.find(':'), s.find('-')) {
            (Some(i), _) => (HashAlgo::from_name(&s[..i])?, &s[i + 1..], false),
            (None, Some(i)) => (HashAlgo::from_name(&s[..i])?, &s[i + 1..], true),
            (None, None) => return Err(ParseHashError::MissingAlgorithm(s.to_owned())),
        };
        Self::parse_digest(algo, rest, sri)
    }

    /// Parse a bare digest whose algorithm is known from context.
    pub fn parse_with_algo(algo: HashAlgo, digest: &str) -> Result<Self, ParseHashError> {
        Self::parse_digest(algo, digest, false)
    }

    fn parse_digest(algo: HashAlgo, digest: &str, sri: bool) -> Result<Self, ParseHashError> {
        let bytes = digest.as_bytes();
        let decoded = if sri || bytes.len() == algo.base64_len() {
            BASE64
                .decode(bytes)
                .map_err(|e| ParseHashError::InvalidDigest(algo, e.to_string()))?
        } else if bytes.len() == algo.base16_len() {
            HEXLOWER_PERMISSIVE
                .decode(bytes)
                .map_err(|e| ParseHashError::InvalidDigest(algo, e.to_string()))?
        } else if bytes.len() == algo.base32_len() {
            base32::decode(bytes).map_err(|e| ParseHashError::InvalidDigest(algo, e.to_string()))?
        } else {
            return Err(ParseHashError::InvalidDigestLength {
                algo,
                actual: bytes.len(),
            });
        };
        Self::new(algo, decoded)
    }

    /// `<algo>:<hex>`, the form used for NAR hashes on the wire.
    pub fn to_prefixed_hex(&self) -> String {
        format!("{}:{}", self.algo, HEXLOWER.encode(&self.digest))
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.digest)
    }

    pub fn to_base32(&self) -> String {
        base32::encode_string(&self.digest)
    }

    /// The SRI form `<algo>-<base64>` used in the JSON realisation format.
    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algo, BASE64.encode(&self.digest))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_prefixed_hex())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("unknown hash algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("hash '{0}' does not name its algorithm")]
    MissingAlgorithm(String),
    #[error("invalid {0} digest: {1}")]
    InvalidDigest(HashAlgo, String),
    #[error("{algo} digest has invalid length {actual}")]
    InvalidDigestLength { algo: HashAlgo, actual: usize },
    #[error("{algo} digest must be {expected} bytes, got {actual}")]
    InvalidDigestSize {
        algo: HashAlgo,
        expected: usize,
        actual: usize,
    },
}
