//! The minimal derivation form that travels over the wire: everything a
//! builder needs, with input derivations already resolved to store paths.

use std::collections::{BTreeMap, BTreeSet};

use crate::hash::HashAlgo;
use crate::store_path::StorePath;

/// One output of a derivation.
///
/// Input-addressed outputs carry their pre-computed path; floating
/// content-addressed outputs carry no path and instead the hash algorithm
/// the builder must use. Fixed outputs carry both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DerivationOutput {
    pub path: Option<StorePath>,
    pub hash_algo: Option<(crate::content_address::ContentAddressMethod, HashAlgo)>,
    pub hash: Option<String>,
}

/// A derivation with resolved inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicDerivation {
    pub name: String,
    pub outputs: BTreeMap<String, DerivationOutput>,
    pub input_srcs: BTreeSet<StorePath>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl BasicDerivation {
    /// The names of all declared outputs.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}
