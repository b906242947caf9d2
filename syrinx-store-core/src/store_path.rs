//! Store directories and store paths.
//!
//! A store path basename has the form `<hash>-<name>` where `<hash>` is 32
//! base32 characters and `<name>` is a restricted suffix. On the wire a
//! path always travels as the absolute form `<store-dir>/<basename>`; the
//! [`StoreDir`] does the prefix handling.

use std::fmt;

use thiserror::Error;

use crate::base32;

pub const STORE_PATH_HASH_CHARS: usize = 32;
const MAX_NAME_LEN: usize = 211;

/// The store directory a connection operates under, e.g. `/nix/store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir(String);

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Result<Self, ParseStorePathError> {
        let dir = dir.into();
        if !dir.starts_with('/') || dir.ends_with('/') {
            return Err(ParseStorePathError::BadStoreDir(dir));
        }
        Ok(StoreDir(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render `path` as an absolute path under this directory.
    pub fn display_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// Parse an absolute path, stripping this directory.
    pub fn parse_path(&self, s: &str) -> Result<StorePath, ParseStorePathError> {
        let rest = s
            .strip_prefix(self.0.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| ParseStorePathError::NotInStore {
                path: s.to_owned(),
                store_dir: self.0.clone(),
            })?;
        StorePath::from_base_name(rest)
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir("/nix/store".to_owned())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store path basename, `<hash>-<name>`. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    base_name: String,
}

impl StorePath {
    pub fn from_base_name(base_name: &str) -> Result<Self, ParseStorePathError> {
        let bytes = base_name.as_bytes();
        if bytes.len() < STORE_PATH_HASH_CHARS + 1 || bytes[STORE_PATH_HASH_CHARS] != b'-' {
            return Err(ParseStorePathError::BadBaseName(base_name.to_owned()));
        }
        if !base32::is_valid(&bytes[..STORE_PATH_HASH_CHARS]) {
            return Err(ParseStorePathError::BadHashPart(base_name.to_owned()));
        }
        let name = &bytes[STORE_PATH_HASH_CHARS + 1..];
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ParseStorePathError::BadName(base_name.to_owned()));
        }
        if !name.iter().all(|&b| {
            b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
        }) {
            return Err(ParseStorePathError::BadName(base_name.to_owned()));
        }
        Ok(StorePath {
            base_name: base_name.to_owned(),
        })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// The 32-character base32 hash part.
    pub fn hash_part(&self) -> &str {
        &self.base_name[..STORE_PATH_HASH_CHARS]
    }

    /// The name suffix after the dash.
    pub fn name(&self) -> &str {
        &self.base_name[STORE_PATH_HASH_CHARS + 1..]
    }

    /// Whether this path names a derivation.
    pub fn is_derivation(&self) -> bool {
        self.name().ends_with(".drv")
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_name)
    }
}

// In JSON documents a store path appears as its basename.
impl serde::Serialize for StorePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.base_name)
    }
}

impl<'de> serde::Deserialize<'de> for StorePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;
        let s = String::deserialize(deserializer)?;
        StorePath::from_base_name(&s).map_err(D::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseStorePathError {
    #[error("store directory '{0}' must be an absolute path without trailing slash")]
    BadStoreDir(String),
    #[error("path '{path}' is not in the store directory '{store_dir}'")]
    NotInStore { path: String, store_dir: String },
    #[error("'{0}' is not a <hash>-<name> store path basename")]
    BadBaseName(String),
    #[error("store path '{0}' has an invalid hash part")]
    BadHashPart(String),
    #[error("store path '{0}' has an invalid name part")]
    BadName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo";

    #[test]
    fn parse_base_name() {
        let p = StorePath::from_base_name(BASE).unwrap();
        assert_eq!(p.hash_part(), "g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q");
        assert_eq!(p.name(), "foo");
        assert!(!p.is_derivation());
    }

    #[test]
    fn round_trip_through_store_dir() {
        let dir = StoreDir::default();
        let p = StorePath::from_base_name(BASE).unwrap();
        let abs = dir.display_path(&p);
        assert_eq!(abs, format!("/nix/store/{BASE}"));
        assert_eq!(dir.parse_path(&abs).unwrap(), p);
    }

    #[test]
    fn rejects_foreign_dir() {
        let dir = StoreDir::default();
        assert!(matches!(
            dir.parse_path(&format!("/gnu/store/{BASE}")),
            Err(ParseStorePathError::NotInStore { .. })
        ));
    }

    #[test]
    fn rejects_bad_hash_part() {
        // 'e' is not in the store-path base32 alphabet.
        assert!(StorePath::from_base_name("e1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").is_err());
        assert!(StorePath::from_base_name("short-foo").is_err());
    }

    #[test]
    fn rejects_bad_name() {
        assert!(StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-").is_err());
        assert!(StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-a b").is_err());
    }

    #[test]
    fn derivation_suffix() {
        let p = StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar.drv").unwrap();
        assert!(p.is_derivation());
    }
}
