//! Wire forms of substituter information.

use std::collections::{BTreeMap, BTreeSet};

use syrinx_store_core::{StoreDir, StorePath};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::store_types::{read_opt_store_path, write_opt_store_path};
use crate::serialization::{Deserialize, Serialize};

/// What a substituter could provide for one path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubstitutablePathInfo {
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
}

impl Serialize for SubstitutablePathInfo {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_opt_store_path(writer, self.deriver.as_ref(), version, store_dir).await?;
        self.references.serialize(writer, version, store_dir).await?;
        self.download_size
            .serialize(writer, version, store_dir)
            .await?;
        self.nar_size.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for SubstitutablePathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        Ok(SubstitutablePathInfo {
            deriver: read_opt_store_path(reader, version, store_dir).await?,
            references: BTreeSet::deserialize(reader, version, store_dir).await?,
            download_size: u64::deserialize(reader, version, store_dir).await?,
            nar_size: u64::deserialize(reader, version, store_dir).await?,
        })
    }
}

pub type SubstitutablePathInfos = BTreeMap<StorePath, SubstitutablePathInfo>;
