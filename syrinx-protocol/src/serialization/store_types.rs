//! Wire forms of store paths, content addresses and path metadata.

use std::collections::BTreeSet;

use syrinx_store_core::{ContentAddress, Hash, StoreDir, StorePath};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{read_bytes, Deserialize, Serialize};

/// A store path travels as its absolute rendering under the connection's
/// store directory.
impl Serialize for StorePath {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        store_dir
            .display_path(self)
            .serialize(writer, version, store_dir)
            .await
    }
}

impl Deserialize for StorePath {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let buf = read_bytes(reader).await?;
        let s = std::str::from_utf8(&buf)?;
        store_dir
            .parse_path(s)
            .map_err(|e| ProtocolError::BadStorePath(e.to_string()))
    }
}

/// Optional store paths inside path metadata use an empty string for
/// "absent" rather than the discriminator-word encoding.
pub async fn write_opt_store_path<W: AsyncWrite + Unpin>(
    writer: &mut W,
    path: Option<&StorePath>,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<(), ProtocolError> {
    match path {
        Some(path) => path.serialize(writer, version, store_dir).await,
        None => "".serialize(writer, version, store_dir).await,
    }
}

pub async fn read_opt_store_path<R: AsyncRead + Unpin>(
    reader: &mut R,
    _version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<Option<StorePath>, ProtocolError> {
    let buf = read_bytes(reader).await?;
    if buf.is_empty() {
        return Ok(None);
    }
    let s = std::str::from_utf8(&buf)?;
    store_dir
        .parse_path(s)
        .map(Some)
        .map_err(|e| ProtocolError::BadStorePath(e.to_string()))
}

impl Serialize for ContentAddress {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.to_string().serialize(writer, version, store_dir).await
    }
}

impl Deserialize for ContentAddress {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, version, store_dir).await?;
        ContentAddress::parse(&s).map_err(|e| ProtocolError::bad_value("content address", e))
    }
}

/// Content addresses inside path metadata also use the empty-string form
/// for "absent".
pub async fn write_opt_content_address<W: AsyncWrite + Unpin>(
    writer: &mut W,
    ca: Option<&ContentAddress>,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<(), ProtocolError> {
    match ca {
        Some(ca) => ca.serialize(writer, version, store_dir).await,
        None => "".serialize(writer, version, store_dir).await,
    }
}

pub async fn read_opt_content_address<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<Option<ContentAddress>, ProtocolError> {
    let s = String::deserialize(reader, version, store_dir).await?;
    if s.is_empty() {
        return Ok(None);
    }
    ContentAddress::parse(&s)
        .map(Some)
        .map_err(|e| ProtocolError::bad_value("content address", e))
}

/// Hashes travel as algorithm-prefixed lowercase hex.
impl Serialize for Hash {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.to_prefixed_hex()
            .serialize(writer, version, store_dir)
            .await
    }
}

impl Deserialize for Hash {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, version, store_dir).await?;
        Hash::parse(&s).map_err(|e| ProtocolError::bad_value("hash", e))
    }
}

/// Path metadata without the path it describes, as returned by
/// `QueryPathInfo`. The trailing three fields exist from 1.16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnkeyedValidPathInfo {
    pub deriver: Option<StorePath>,
    pub nar_hash: Hash,
    pub references: BTreeSet<StorePath>,
    pub registration_time: u64,
    pub nar_size: u64,
    pub ultimate: bool,
    pub sigs: BTreeSet<String>,
    pub ca: Option<ContentAddress>,
}

impl UnkeyedValidPathInfo {
    pub fn new(nar_hash: Hash) -> Self {
        UnkeyedValidPathInfo {
            deriver: None,
            nar_hash,
            references: BTreeSet::new(),
            registration_time: 0,
            nar_size: 0,
            ultimate: false,
            sigs: BTreeSet::new(),
            ca: None,
        }
    }
}

impl Serialize for UnkeyedValidPathInfo {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_opt_store_path(writer, self.deriver.as_ref(), version, store_dir).await?;
        self.nar_hash.serialize(writer, version, store_dir).await?;
        self.references.serialize(writer, version, store_dir).await?;
        self.registration_time
            .serialize(writer, version, store_dir)
            .await?;
        self.nar_size.serialize(writer, version, store_dir).await?;
        if version.minor >= 16 {
            self.ultimate.serialize(writer, version, store_dir).await?;
            self.sigs.serialize(writer, version, store_dir).await?;
            write_opt_content_address(writer, self.ca.as_ref(), version, store_dir).await?;
        }
        Ok(())
    }
}

impl Deserialize for UnkeyedValidPathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let deriver = read_opt_store_path(reader, version, store_dir).await?;
        let nar_hash = Hash::deserialize(reader, version, store_dir).await?;
        let references = BTreeSet::deserialize(reader, version, store_dir).await?;
        let registration_time = u64::deserialize(reader, version, store_dir).await?;
        let nar_size = u64::deserialize(reader, version, store_dir).await?;
        let (ultimate, sigs, ca) = if version.minor >= 16 {
            (
                bool::deserialize(reader, version, store_dir).await?,
                BTreeSet::deserialize(reader, version, store_dir).await?,
                read_opt_content_address(reader, version, store_dir).await?,
            )
        } else {
            (false, BTreeSet::new(), None)
        };
        Ok(UnkeyedValidPathInfo {
            deriver,
            nar_hash,
            references,
            registration_time,
            nar_size,
            ultimate,
            sigs,
            ca,
        })
    }
}

/// Path metadata keyed by the path it describes, as used by path imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    pub info: UnkeyedValidPathInfo,
}

impl Serialize for ValidPathInfo {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.path.serialize(writer, version, store_dir).await?;
        self.info.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for ValidPathInfo {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        Ok(ValidPathInfo {
            path: StorePath::deserialize(reader, version, store_dir).await?,
            info: UnkeyedValidPathInfo::deserialize(reader, version, store_dir).await?,
        })
    }
}
