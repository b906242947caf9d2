//! Core store semantics.
//!
//! This crate provides the fundamental types for working with a
//! content-addressed store: store directories and paths, hashes,
//! content addresses, derived paths, realisations and build results.
//! It is intentionally IO-free - all operations are pure functions
//! that operate on values, enabling easy testing and composition.
//!
//! # Key Modules
//!
//! - `hash` - hash types, parsing and rendering in hex/nixbase32/base64
//! - `store_path` - store path types, parsing, validation
//! - `content_address` - content addressing methods
//! - `derived_path` - references to existing paths or derivation outputs
//! - `realisation` - the mapping from derivation outputs to store paths
//! - `derivation` - the minimal derivation form that travels over the wire
//! - `build` - build modes, statuses and results

pub mod base32;
pub mod build;
pub mod content_address;
pub mod derivation;
pub mod derived_path;
pub mod hash;
pub mod realisation;
pub mod store_path;

pub use build::{BuildMode, BuildOutcome, BuildResult, BuildStatus, KeyedBuildResult, TrustedFlag};
pub use content_address::{ContentAddress, ContentAddressError, ContentAddressMethod};
pub use derivation::{BasicDerivation, DerivationOutput};
pub use derived_path::{DerivedPath, OutputsSpec};
pub use hash::{Hash, HashAlgo, ParseHashError};
pub use realisation::{DrvOutput, Realisation};
pub use store_path::{ParseStorePathError, StoreDir, StorePath};

/// Byte strings as they appear on the wire: arbitrary bytes, usually but
/// not necessarily UTF-8.
pub type ByteString = bytes::Bytes;
