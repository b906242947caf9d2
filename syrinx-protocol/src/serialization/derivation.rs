//! Wire form of the derivation sent with `BuildDerivation`.
//!
//! Outputs carry `(name, path, hash-algo, hash)` with empty strings for
//! the fields a floating content-addressed output leaves open.

use std::collections::{BTreeMap, BTreeSet};

use syrinx_store_core::{BasicDerivation, ContentAddress, DerivationOutput, StoreDir};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::store_types::{read_opt_store_path, write_opt_store_path};
use crate::serialization::{Deserialize, Serialize};

impl Serialize for BasicDerivation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (self.outputs.len() as u64)
            .serialize(writer, version, store_dir)
            .await?;
        for (name, output) in &self.outputs {
            name.serialize(writer, version, store_dir).await?;
            write_opt_store_path(writer, output.path.as_ref(), version, store_dir).await?;
            match &output.hash_algo {
                Some((method, algo)) => {
                    ContentAddress::render_method_algo(*method, *algo)
                        .serialize(writer, version, store_dir)
                        .await?
                }
                None => "".serialize(writer, version, store_dir).await?,
            }
            output
                .hash
                .as_deref()
                .unwrap_or("")
                .serialize(writer, version, store_dir)
                .await?;
        }
        self.input_srcs.serialize(writer, version, store_dir).await?;
        self.platform.serialize(writer, version, store_dir).await?;
        self.builder.serialize(writer, version, store_dir).await?;
        self.args.serialize(writer, version, store_dir).await?;
        self.env.serialize(writer, version, store_dir).await?;
        Ok(())
    }
}

impl Deserialize for BasicDerivation {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let count = u64::deserialize(reader, version, store_dir).await?;
        if count > crate::protocol::MAX_LIST_SIZE {
            return Err(ProtocolError::ListTooLong {
                length: count,
                max: crate::protocol::MAX_LIST_SIZE,
            });
        }
        let mut outputs = BTreeMap::new();
        let mut name = String::new();
        for _ in 0..count {
            let output_name = String::deserialize(reader, version, store_dir).await?;
            let path = read_opt_store_path(reader, version, store_dir).await?;
            let method_algo = String::deserialize(reader, version, store_dir).await?;
            let hash = String::deserialize(reader, version, store_dir).await?;
            let hash_algo = if method_algo.is_empty() {
                None
            } else {
                Some(
                    ContentAddress::parse_method_algo(&method_algo)
                        .map_err(|e| ProtocolError::bad_value("derivation output", e))?,
                )
            };
            // Derive the derivation's name from any concrete output path.
            if let Some(path) = &path {
                if name.is_empty() {
                    name = path.name().strip_suffix(".drv").unwrap_or(path.name()).to_owned();
                }
            }
            outputs.insert(
                output_name,
                DerivationOutput {
                    path,
                    hash_algo,
                    hash: if hash.is_empty() { None } else { Some(hash) },
                },
            );
        }
        let input_srcs = BTreeSet::deserialize(reader, version, store_dir).await?;
        let platform = String::deserialize(reader, version, store_dir).await?;
        let builder = String::deserialize(reader, version, store_dir).await?;
        let args = Vec::<String>::deserialize(reader, version, store_dir).await?;
        let env = BTreeMap::deserialize(reader, version, store_dir).await?;
        Ok(BasicDerivation {
            name,
            outputs,
            input_srcs,
            platform,
            builder,
            args,
            env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;
    use syrinx_store_core::StorePath;

    #[tokio::test]
    async fn derivation_round_trip() {
        let dir = StoreDir::default();
        let drv = BasicDerivation {
            name: "foo".into(),
            outputs: [(
                "out".to_owned(),
                DerivationOutput {
                    path: Some(
                        StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").unwrap(),
                    ),
                    hash_algo: None,
                    hash: None,
                },
            )]
            .into(),
            input_srcs: [StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-dep")
                .unwrap()]
            .into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec!["-c".into(), "echo hi > $out".into()],
            env: [("out".to_owned(), "/nix/store/...".to_owned())].into(),
        };
        let mut buf = Vec::new();
        drv.serialize(&mut buf, PROTOCOL_VERSION, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let back = BasicDerivation::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert_eq!(back, drv);
    }
}
