//! The framing codec: unsigned 64-bit little-endian words, length-prefixed
//! byte strings padded to 8 bytes, and counted collections built on top.

use std::collections::{BTreeMap, BTreeSet};

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IoErrorContext, ProtocolError};
use crate::protocol::{ProtocolVersion, MAX_LIST_SIZE, MAX_STRING_SIZE};
use crate::serialization::{Deserialize, Serialize};

const ZEROS: [u8; 8] = [0u8; 8];

/// Write a length-prefixed byte string with zero padding to the next
/// multiple of 8.
pub async fn write_bytes<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    let len = bytes.len() as u64;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .io_context("writing string length")?;
    writer
        .write_all(bytes)
        .await
        .io_context("writing string data")?;
    let padding = (8 - len % 8) % 8;
    if padding > 0 {
        writer
            .write_all(&ZEROS[..padding as usize])
            .await
            .io_context("writing string padding")?;
    }
    Ok(())
}

/// Read a length-prefixed byte string, enforcing `max` on the length field
/// before any allocation. Padding bytes are skipped without inspection.
pub async fn read_bytes_bounded<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 8];
    reader
        .read_exact(&mut len_buf)
        .await
        .io_context("reading string length")?;
    let len = u64::from_le_bytes(len_buf);
    if len > max {
        return Err(ProtocolError::StringTooLong { length: len, max });
    }
    let aligned = len
        .checked_add((8 - len % 8) % 8)
        .ok_or(ProtocolError::StringTooLong { length: len, max })?;
    let mut buf = vec![0u8; aligned as usize];
    reader
        .read_exact(&mut buf)
        .await
        .io_context("reading string data")?;
    buf.truncate(len as usize);
    Ok(buf)
}

/// Read a byte string under the default 16 MiB sanity bound.
pub async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    read_bytes_bounded(reader, MAX_STRING_SIZE).await
}

impl Serialize for u64 {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        writer
            .write_all(&self.to_le_bytes())
            .await
            .io_context("writing u64")
    }
}

impl Deserialize for u64 {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.io_context("reading u64")?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Serialize for bool {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (*self as u64).serialize(writer, version, store_dir).await
    }
}

impl Deserialize for bool {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        // Any nonzero word reads as true.
        Ok(u64::deserialize(reader, version, store_dir).await? != 0)
    }
}

impl Serialize for str {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        write_bytes(writer, self.as_bytes()).await
    }
}

impl Serialize for String {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.as_str().serialize(writer, version, store_dir).await
    }
}

impl Deserialize for String {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
        _store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let buf = read_bytes(reader).await?;
        Ok(std::str::from_utf8(&buf)?.to_owned())
    }
}

async fn read_count<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<u64, ProtocolError> {
    let count = u64::deserialize(reader, version, store_dir).await?;
    if count > MAX_LIST_SIZE {
        return Err(ProtocolError::ListTooLong {
            length: count,
            max: MAX_LIST_SIZE,
        });
    }
    Ok(count)
}

impl<T: Serialize> Serialize for Vec<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (self.len() as u64)
            .serialize(writer, version, store_dir)
            .await?;
        for item in self {
            item.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let count = read_count(reader, version, store_dir).await?;
        let mut result = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            result.push(T::deserialize(reader, version, store_dir).await?);
        }
        Ok(result)
    }
}

impl<T: Serialize + Ord> Serialize for BTreeSet<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (self.len() as u64)
            .serialize(writer, version, store_dir)
            .await?;
        for item in self {
            item.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl<T: Deserialize + Ord> Deserialize for BTreeSet<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let count = read_count(reader, version, store_dir).await?;
        let mut result = BTreeSet::new();
        for _ in 0..count {
            result.insert(T::deserialize(reader, version, store_dir).await?);
        }
        Ok(result)
    }
}

impl<K: Serialize + Ord, V: Serialize> Serialize for BTreeMap<K, V> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        (self.len() as u64)
            .serialize(writer, version, store_dir)
            .await?;
        for (key, value) in self {
            key.serialize(writer, version, store_dir).await?;
            value.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl<K: Deserialize + Ord, V: Deserialize> Deserialize for BTreeMap<K, V> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let count = read_count(reader, version, store_dir).await?;
        let mut result = BTreeMap::new();
        for _ in 0..count {
            let key = K::deserialize(reader, version, store_dir).await?;
            let value = V::deserialize(reader, version, store_dir).await?;
            result.insert(key, value);
        }
        Ok(result)
    }
}

/// The general optional encoding: a 0/1 discriminator word, then the
/// payload if present. Store paths and content addresses inside path
/// metadata use an empty-string convention instead; see `store_types`.
impl<T: Serialize> Serialize for Option<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        match self {
            None => 0u64.serialize(writer, version, store_dir).await,
            Some(value) => {
                1u64.serialize(writer, version, store_dir).await?;
                value.serialize(writer, version, store_dir).await
            }
        }
    }
}

impl<T: Deserialize> Deserialize for Option<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        if u64::deserialize(reader, version, store_dir).await? == 0 {
            Ok(None)
        } else {
            Ok(Some(T::deserialize(reader, version, store_dir).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    async fn round_trip<T: Serialize + Deserialize + PartialEq + std::fmt::Debug>(value: T) {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        value
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert_eq!(buf.len() % 8, 0, "output must be 8-byte aligned");
        let mut cursor = Cursor::new(buf);
        let back = T::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn primitive_round_trips() {
        round_trip(0u64).await;
        round_trip(u64::MAX).await;
        round_trip(true).await;
        round_trip(false).await;
        round_trip(String::new()).await;
        round_trip("white rabbit".to_owned()).await;
        round_trip("大白兔".to_owned()).await;
        round_trip("oh no \0\0\0 what was that!".to_owned()).await;
        round_trip(vec!["".to_owned(), "foo".to_owned(), "bar".to_owned()]).await;
        round_trip(BTreeSet::from(["a".to_owned(), "b".to_owned()])).await;
        round_trip(BTreeMap::from([("k".to_owned(), "v".to_owned())])).await;
        round_trip(Option::<String>::None).await;
        round_trip(Some("x".to_owned())).await;
    }

    #[tokio::test]
    async fn string_layout() {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        "test"
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        // 8 bytes length + 4 bytes data + 4 bytes padding.
        assert_eq!(
            buf,
            [4, 0, 0, 0, 0, 0, 0, 0, b't', b'e', b's', b't', 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn oversized_string_is_rejected() {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        (MAX_STRING_SIZE + 1)
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_bytes(&mut cursor).await,
            Err(ProtocolError::StringTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_string_is_eof() {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        40u64
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        buf.extend_from_slice(&[0u8; 32]);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_bytes(&mut cursor).await,
            Err(ProtocolError::UnexpectedEof { .. })
        ));
    }

    #[tokio::test]
    async fn nonzero_bool_reads_true() {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        7u64.serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(
            bool::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap()
        );
    }
}
