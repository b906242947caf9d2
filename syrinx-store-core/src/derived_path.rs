//! Derived paths: a reference to an existing store path or to the outputs
//! of a derivation that may not have been built yet.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::store_path::{ParseStorePathError, StoreDir, StorePath};

/// Which outputs of a derivation are requested.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputsSpec {
    All,
    Names(BTreeSet<String>),
}

impl OutputsSpec {
    /// Parse the `*` / comma-separated-names rendering.
    pub fn parse(s: &str) -> Result<Self, ParseDerivedPathError> {
        if s == "*" {
            return Ok(OutputsSpec::All);
        }
        let names: BTreeSet<String> = s
            .split(',')
            .map(|n| {
                if n.is_empty() {
                    Err(ParseDerivedPathError::EmptyOutputName(s.to_owned()))
                } else {
                    Ok(n.to_owned())
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(OutputsSpec::Names(names))
    }
}

impl fmt::Display for OutputsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputsSpec::All => f.write_str("*"),
            OutputsSpec::Names(names) => {
                let mut first = true;
                for name in names {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    f.write_str(name)?;
                }
                Ok(())
            }
        }
    }
}

/// Either a plain store path or outputs to be built from a derivation.
///
/// The derivation reference of a `Built` node may itself be a derived path,
/// which is how builds of dynamically produced derivations are expressed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DerivedPath {
    Opaque {
        path: StorePath,
    },
    Built {
        drv_path: Box<DerivedPath>,
        outputs: OutputsSpec,
    },
}

impl DerivedPath {
    pub fn opaque(path: StorePath) -> Self {
        DerivedPath::Opaque { path }
    }

    pub fn built(drv_path: StorePath, outputs: OutputsSpec) -> Self {
        DerivedPath::Built {
            drv_path: Box::new(DerivedPath::opaque(drv_path)),
            outputs,
        }
    }

    /// Render as `<abs-path>[!<outputs>[!<outputs>...]]`.
    pub fn display(&self, store_dir: &StoreDir) -> String {
        match self {
            DerivedPath::Opaque { path } => store_dir.display_path(path),
            DerivedPath::Built { drv_path, outputs } => {
                format!("{}!{}", drv_path.display(store_dir), outputs)
            }
        }
    }

    /// Parse the rendering produced by [`DerivedPath::display`].
    pub fn parse(store_dir: &StoreDir, s: &str) -> Result<Self, ParseDerivedPathError> {
        match s.split_once('!') {
            None => Ok(DerivedPath::Opaque {
                path: store_dir.parse_path(s)?,
            }),
            Some((base, outputs)) => {
                // Nested `!` segments belong to the inner derived path.
                let (drv, spec) = match outputs.rsplit_once('!') {
                    None => (
                        DerivedPath::Opaque {
                            path: store_dir.parse_path(base)?,
                        },
                        outputs,
                    ),
                    Some((inner, last)) => (
                        DerivedPath::parse(store_dir, &format!("{base}!{inner}"))?,
                        last,
                    ),
                };
                Ok(DerivedPath::Built {
                    drv_path: Box::new(drv),
                    outputs: OutputsSpec::parse(spec)?,
                })
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseDerivedPathError {
    #[error(transparent)]
    StorePath(#[from] ParseStorePathError),
    #[error("output spec '{0}' contains an empty output name")]
    EmptyOutputName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drv() -> StorePath {
        StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar.drv").unwrap()
    }

    #[test]
    fn outputs_spec_rendering() {
        assert_eq!(OutputsSpec::All.to_string(), "*");
        let spec = OutputsSpec::parse("y,x").unwrap();
        assert_eq!(spec.to_string(), "x,y");
        assert!(OutputsSpec::parse("x,,y").is_err());
    }

    #[test]
    fn opaque_round_trip() {
        let dir = StoreDir::default();
        let p = DerivedPath::opaque(
            StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").unwrap(),
        );
        let s = p.display(&dir);
        assert_eq!(DerivedPath::parse(&dir, &s).unwrap(), p);
    }

    #[test]
    fn built_round_trip() {
        let dir = StoreDir::default();
        let p = DerivedPath::built(drv(), OutputsSpec::parse("out").unwrap());
        let s = p.display(&dir);
        assert_eq!(s, format!("/nix/store/{}!out", drv()));
        assert_eq!(DerivedPath::parse(&dir, &s).unwrap(), p);
    }

    #[test]
    fn nested_round_trip() {
        let dir = StoreDir::default();
        let inner = DerivedPath::built(drv(), OutputsSpec::parse("out").unwrap());
        let p = DerivedPath::Built {
            drv_path: Box::new(inner),
            outputs: OutputsSpec::All,
        };
        let s = p.display(&dir);
        assert_eq!(DerivedPath::parse(&dir, &s).unwrap(), p);
    }
}
