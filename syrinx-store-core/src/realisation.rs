//! Realisations: the mapping from an abstract derivation output to the
//! concrete store path a build produced.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::hash::{Hash, ParseHashError};
use crate::store_path::{ParseStorePathError, StorePath};

/// Identifies one output of one derivation, rendered `<drv-hash>!<output>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DrvOutput {
    pub drv_hash: Hash,
    pub output_name: String,
}

impl DrvOutput {
    pub fn parse(s: &str) -> Result<Self, ParseRealisationError> {
        let (hash, output) = s
            .split_once('!')
            .ok_or_else(|| ParseRealisationError::BadDrvOutput(s.to_owned()))?;
        Ok(DrvOutput {
            drv_hash: Hash::parse(hash)?,
            output_name: output.to_owned(),
        })
    }
}

impl fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_hash.to_sri(), self.output_name)
    }
}

impl Serialize for DrvOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DrvOutput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DrvOutput::parse(&s).map_err(D::Error::custom)
    }
}

/// A signed claim that a derivation output resolves to a store path,
/// together with the realisations of its (content-addressed) dependencies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Realisation {
    pub id: DrvOutput,
    #[serde(rename = "outPath")]
    pub out_path: StorePath,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub signatures: BTreeSet<String>,
    #[serde(
        rename = "dependentRealisations",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub dependent_realisations: BTreeMap<DrvOutput, StorePath>,
}

impl Realisation {
    /// The JSON document form used on the wire and in registries.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("realisation serialisation cannot fail")
    }

    pub fn from_json_str(s: &str) -> Result<Self, ParseRealisationError> {
        serde_json::from_str(s).map_err(|e| ParseRealisationError::BadJson(e.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseRealisationError {
    #[error("'{0}' is not a <drv-hash>!<output> pair")]
    BadDrvOutput(String),
    #[error(transparent)]
    Hash(#[from] ParseHashError),
    #[error(transparent)]
    StorePath(#[from] ParseStorePathError),
    #[error("invalid realisation document: {0}")]
    BadJson(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> DrvOutput {
        DrvOutput::parse("sha256-FePFYIlMuycIXPZbWi7LGEiMmZSX9FMbaQenWBzm1Sc=!baz").unwrap()
    }

    #[test]
    fn drv_output_round_trip() {
        let id = sample_id();
        assert_eq!(id.output_name, "baz");
        assert_eq!(DrvOutput::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn json_round_trip() {
        let r = Realisation {
            id: sample_id(),
            out_path: StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").unwrap(),
            signatures: ["asdf".to_owned(), "qwer".to_owned()].into(),
            dependent_realisations: BTreeMap::new(),
        };
        let json = r.to_json_string();
        assert_eq!(Realisation::from_json_str(&json).unwrap(), r);
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(matches!(
            DrvOutput::parse("sha256-FePFYIlMuycIXPZbWi7LGEiMmZSX9FMbaQenWBzm1Sc="),
            Err(ParseRealisationError::BadDrvOutput(_))
        ));
    }
}
