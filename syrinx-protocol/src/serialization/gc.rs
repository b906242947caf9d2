//! Wire forms of the garbage-collector operations.

use std::collections::{BTreeMap, BTreeSet};

use num_enum::TryFromPrimitive;
use syrinx_store_core::{StoreDir, StorePath};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
#[repr(u64)]
pub enum GcAction {
    ReturnLive = 0,
    ReturnDead = 1,
    #[default]
    DeleteDead = 2,
    DeleteSpecific = 3,
}

/// The request of `CollectGarbage`. Three obsolete zero words trail it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcOptions {
    pub action: GcAction,
    pub paths_to_delete: BTreeSet<StorePath>,
    pub ignore_liveness: bool,
    pub max_freed: u64,
}

impl Serialize for GcOptions {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (self.action as u64).serialize(writer, version, store_dir).await?;
        self.paths_to_delete
            .serialize(writer, version, store_dir)
            .await?;
        self.ignore_liveness
            .serialize(writer, version, store_dir)
            .await?;
        self.max_freed.serialize(writer, version, store_dir).await?;
        for _ in 0..3 {
            0u64.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl Deserialize for GcOptions {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let raw_action = u64::deserialize(reader, version, store_dir).await?;
        let action = GcAction::try_from(raw_action)
            .map_err(|_| ProtocolError::bad_value("GC action", raw_action))?;
        let paths_to_delete = BTreeSet::deserialize(reader, version, store_dir).await?;
        let ignore_liveness = bool::deserialize(reader, version, store_dir).await?;
        let max_freed = u64::deserialize(reader, version, store_dir).await?;
        for _ in 0..3 {
            u64::deserialize(reader, version, store_dir).await?;
        }
        Ok(GcOptions {
            action,
            paths_to_delete,
            ignore_liveness,
            max_freed,
        })
    }
}

/// The reply of `CollectGarbage`. Deleted paths are reported as plain
/// strings because dead paths are no longer store paths by the time the
/// reply is written. An obsolete zero word trails it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcResult {
    pub deleted_paths: Vec<String>,
    pub bytes_freed: u64,
}

impl Serialize for GcResult {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.deleted_paths
            .serialize(writer, version, store_dir)
            .await?;
        self.bytes_freed.serialize(writer, version, store_dir).await?;
        0u64.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for GcResult {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let deleted_paths = Vec::<String>::deserialize(reader, version, store_dir).await?;
        let bytes_freed = u64::deserialize(reader, version, store_dir).await?;
        u64::deserialize(reader, version, store_dir).await?;
        Ok(GcResult {
            deleted_paths,
            bytes_freed,
        })
    }
}

/// The reply of `FindRoots`: a map from symlink to its store path target.
pub type Roots = BTreeMap<String, StorePath>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    #[tokio::test]
    async fn gc_options_round_trip() {
        let dir = StoreDir::default();
        let options = GcOptions {
            action: GcAction::DeleteSpecific,
            paths_to_delete: [StorePath::from_base_name(
                "g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo",
            )
            .unwrap()]
            .into(),
            ignore_liveness: false,
            max_freed: 1 << 30,
        };
        let mut buf = Vec::new();
        options
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            GcOptions::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap(),
            options
        );
    }

    #[tokio::test]
    async fn gc_result_round_trip() {
        let dir = StoreDir::default();
        let result = GcResult {
            deleted_paths: vec!["/nix/store/g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo".to_owned()],
            bytes_freed: 4096,
        };
        let mut buf = Vec::new();
        result
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            GcResult::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap(),
            result
        );
    }
}
