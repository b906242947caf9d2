//! The `SetOptions` payload: per-connection settings.
//!
//! Several words in the middle are obsolete but still occupy wire space;
//! they are written as constants and discarded on read. The override map
//! exists from 1.12.

use std::collections::BTreeMap;

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::{ProtocolVersion, Verbosity};
use crate::serialization::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub keep_failed: bool,
    pub keep_going: bool,
    pub try_fallback: bool,
    pub verbosity: Verbosity,
    pub max_build_jobs: u64,
    pub max_silent_time: u64,
    pub verbose_build: bool,
    pub build_cores: u64,
    pub use_substitutes: bool,
    pub overrides: BTreeMap<String, String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            verbosity: Verbosity::Info,
            max_build_jobs: 1,
            max_silent_time: 0,
            verbose_build: true,
            build_cores: 0,
            use_substitutes: true,
            overrides: BTreeMap::new(),
        }
    }
}

impl Serialize for ClientOptions {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.keep_failed.serialize(writer, version, store_dir).await?;
        self.keep_going.serialize(writer, version, store_dir).await?;
        self.try_fallback
            .serialize(writer, version, store_dir)
            .await?;
        u64::from(self.verbosity)
            .serialize(writer, version, store_dir)
            .await?;
        self.max_build_jobs
            .serialize(writer, version, store_dir)
            .await?;
        self.max_silent_time
            .serialize(writer, version, store_dir)
            .await?;
        1u64.serialize(writer, version, store_dir).await?; // obsolete useBuildHook
        // Build output is verbose when the build verbosity is the error level.
        let build_verbosity: u64 = if self.verbose_build {
            Verbosity::Error.into()
        } else {
            Verbosity::Vomit.into()
        };
        build_verbosity.serialize(writer, version, store_dir).await?;
        0u64.serialize(writer, version, store_dir).await?; // obsolete logType
        0u64.serialize(writer, version, store_dir).await?; // obsolete printBuildTrace
        self.build_cores.serialize(writer, version, store_dir).await?;
        self.use_substitutes
            .serialize(writer, version, store_dir)
            .await?;
        if version.minor >= 12 {
            self.overrides.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl Deserialize for ClientOptions {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let keep_failed = bool::deserialize(reader, version, store_dir).await?;
        let keep_going = bool::deserialize(reader, version, store_dir).await?;
        let try_fallback = bool::deserialize(reader, version, store_dir).await?;
        let verbosity = Verbosity::from(u64::deserialize(reader, version, store_dir).await?);
        let max_build_jobs = u64::deserialize(reader, version, store_dir).await?;
        let max_silent_time = u64::deserialize(reader, version, store_dir).await?;
        u64::deserialize(reader, version, store_dir).await?; // obsolete useBuildHook
        let build_verbosity = u64::deserialize(reader, version, store_dir).await?;
        let verbose_build = Verbosity::from(build_verbosity) == Verbosity::Error;
        u64::deserialize(reader, version, store_dir).await?; // obsolete logType
        u64::deserialize(reader, version, store_dir).await?; // obsolete printBuildTrace
        let build_cores = u64::deserialize(reader, version, store_dir).await?;
        let use_substitutes = bool::deserialize(reader, version, store_dir).await?;
        let overrides = if version.minor >= 12 {
            BTreeMap::deserialize(reader, version, store_dir).await?
        } else {
            BTreeMap::new()
        };
        Ok(ClientOptions {
            keep_failed,
            keep_going,
            try_fallback,
            verbosity,
            max_build_jobs,
            max_silent_time,
            verbose_build,
            build_cores,
            use_substitutes,
            overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    #[tokio::test]
    async fn options_round_trip() {
        let dir = StoreDir::default();
        let options = ClientOptions {
            keep_failed: true,
            verbosity: Verbosity::Debug,
            max_build_jobs: 8,
            overrides: [("narinfo-cache-ttl".to_owned(), "0".to_owned())].into(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        options
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            ClientOptions::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap(),
            options
        );
    }

    #[tokio::test]
    async fn pre_1_12_has_no_overrides() {
        let dir = StoreDir::default();
        let v11 = ProtocolVersion::from_parts(1, 11);
        let options = ClientOptions {
            overrides: [("k".to_owned(), "v".to_owned())].into(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        options.serialize(&mut buf, v11, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let back = ClientOptions::deserialize(&mut cursor, v11, &dir).await.unwrap();
        assert!(back.overrides.is_empty());
    }
}
