//! Wire form of the `QueryMissing` reply.

use std::collections::BTreeSet;

use syrinx_store_core::{StoreDir, StorePath};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Missing {
    pub will_build: BTreeSet<StorePath>,
    pub will_substitute: BTreeSet<StorePath>,
    pub unknown: BTreeSet<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
}

impl Serialize for Missing {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.will_build.serialize(writer, version, store_dir).await?;
        self.will_substitute
            .serialize(writer, version, store_dir)
            .await?;
        self.unknown.serialize(writer, version, store_dir).await?;
        self.download_size
            .serialize(writer, version, store_dir)
            .await?;
        self.nar_size.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for Missing {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        Ok(Missing {
            will_build: BTreeSet::deserialize(reader, version, store_dir).await?,
            will_substitute: BTreeSet::deserialize(reader, version, store_dir).await?,
            unknown: BTreeSet::deserialize(reader, version, store_dir).await?,
            download_size: u64::deserialize(reader, version, store_dir).await?,
            nar_size: u64::deserialize(reader, version, store_dir).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    #[tokio::test]
    async fn missing_round_trip() {
        let dir = StoreDir::default();
        let missing = Missing {
            will_build: [StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo")
                .unwrap()]
            .into(),
            will_substitute: BTreeSet::new(),
            unknown: BTreeSet::new(),
            download_size: 1234,
            nar_size: 5678,
        };
        let mut buf = Vec::new();
        missing
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            Missing::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap(),
            missing
        );
    }
}
