//! Post-handshake connection metadata.

use syrinx_store_core::{StoreDir, TrustedFlag};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

/// Information the server sends the client once the version is settled.
/// Empty at 1.30; 1.33 adds the daemon version string, 1.35 the trust flag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHandshakeInfo {
    pub daemon_version: Option<String>,
    pub remote_trusts_us: Option<TrustedFlag>,
}

impl Serialize for ClientHandshakeInfo {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        if version.minor >= 33 {
            self.daemon_version
                .serialize(writer, version, store_dir)
                .await?;
        }
        if version.minor >= 35 {
            write_opt_trusted_flag(writer, self.remote_trusts_us, version, store_dir).await?;
        }
        Ok(())
    }
}

impl Deserialize for ClientHandshakeInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let daemon_version = if version.minor >= 33 {
            Option::<String>::deserialize(reader, version, store_dir).await?
        } else {
            None
        };
        let remote_trusts_us = if version.minor >= 35 {
            read_opt_trusted_flag(reader, version, store_dir).await?
        } else {
            None
        };
        Ok(ClientHandshakeInfo {
            daemon_version,
            remote_trusts_us,
        })
    }
}

/// The optional trust flag is a three-valued word: 0 unknown, 1 trusted,
/// 2 not trusted.
pub async fn write_opt_trusted_flag<W: AsyncWrite + Unpin>(
    writer: &mut W,
    flag: Option<TrustedFlag>,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<(), ProtocolError> {
    let word: u64 = match flag {
        None => 0,
        Some(TrustedFlag::Trusted) => 1,
        Some(TrustedFlag::NotTrusted) => 2,
    };
    word.serialize(writer, version, store_dir).await
}

pub async fn read_opt_trusted_flag<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<Option<TrustedFlag>, ProtocolError> {
    match u64::deserialize(reader, version, store_dir).await? {
        0 => Ok(None),
        1 => Ok(Some(TrustedFlag::Trusted)),
        2 => Ok(Some(TrustedFlag::NotTrusted)),
        other => Err(ProtocolError::bad_value("trust flag", other)),
    }
}
