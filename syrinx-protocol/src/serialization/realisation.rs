//! Wire forms of derivation outputs and realisations.
//!
//! A `DrvOutput` is the string `<hash>!<output>`. Realisations travel as
//! JSON documents from 1.31; before that only the bare output path is
//! exchanged.

use syrinx_store_core::{DrvOutput, Realisation, StoreDir};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

impl Serialize for DrvOutput {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.to_string().serialize(writer, version, store_dir).await
    }
}

impl Deserialize for DrvOutput {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, version, store_dir).await?;
        DrvOutput::parse(&s).map_err(|e| ProtocolError::bad_value("derivation output id", e))
    }
}

impl Serialize for Realisation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.to_json_string()
            .serialize(writer, version, store_dir)
            .await
    }
}

impl Deserialize for Realisation {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, version, store_dir).await?;
        Realisation::from_json_str(&s).map_err(|e| ProtocolError::bad_value("realisation", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use syrinx_store_core::StorePath;

    #[tokio::test]
    async fn realisation_round_trip() {
        let dir = StoreDir::default();
        let r = Realisation {
            id: DrvOutput::parse("sha256-FePFYIlMuycIXPZbWi7LGEiMmZSX9FMbaQenWBzm1Sc=!baz")
                .unwrap(),
            out_path: StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").unwrap(),
            signatures: ["asdf".to_owned()].into(),
            dependent_realisations: BTreeMap::new(),
        };
        let mut buf = Vec::new();
        r.serialize(&mut buf, PROTOCOL_VERSION, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            Realisation::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap(),
            r
        );
    }
}
