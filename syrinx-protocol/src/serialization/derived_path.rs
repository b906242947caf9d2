//! Wire form of derived paths.
//!
//! A derived path is a single string. Up to 1.29 only a plain derivation
//! path may appear before the `!`; from 1.30 the part before the last `!`
//! may itself be a derived path, which is how builds of dynamically
//! produced derivations travel.

use syrinx_store_core::{DerivedPath, StoreDir};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

fn nests(path: &DerivedPath) -> bool {
    match path {
        DerivedPath::Opaque { .. } => false,
        DerivedPath::Built { drv_path, .. } => !matches!(**drv_path, DerivedPath::Opaque { .. }),
    }
}

impl Serialize for DerivedPath {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        if version.minor < 30 && nests(self) {
            return Err(ProtocolError::bad_value(
                "derived path",
                "nested derivation references require protocol 1.30",
            ));
        }
        self.display(store_dir)
            .serialize(writer, version, store_dir)
            .await
    }
}

impl Deserialize for DerivedPath {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, version, store_dir).await?;
        let path = DerivedPath::parse(store_dir, &s)
            .map_err(|e| ProtocolError::bad_value("derived path", e))?;
        if version.minor < 30 && nests(&path) {
            return Err(ProtocolError::bad_value("derived path", s));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syrinx_store_core::{OutputsSpec, StorePath};
    use std::io::Cursor;

    fn drv() -> StorePath {
        StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-bar.drv").unwrap()
    }

    async fn round_trip_at(value: DerivedPath, version: ProtocolVersion) {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        value.serialize(&mut buf, version, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            DerivedPath::deserialize(&mut cursor, version, &dir)
                .await
                .unwrap(),
            value
        );
    }

    #[tokio::test]
    async fn round_trips() {
        let v29 = ProtocolVersion::from_parts(1, 29);
        let v30 = ProtocolVersion::from_parts(1, 30);
        let opaque = DerivedPath::opaque(
            StorePath::from_base_name("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-foo").unwrap(),
        );
        round_trip_at(opaque.clone(), v29).await;
        round_trip_at(opaque, v30).await;
        round_trip_at(DerivedPath::built(drv(), OutputsSpec::All), v29).await;
        round_trip_at(
            DerivedPath::built(drv(), OutputsSpec::parse("x,y").unwrap()),
            v30,
        )
        .await;
    }

    #[tokio::test]
    async fn nesting_requires_1_30() {
        let dir = StoreDir::default();
        let nested = DerivedPath::Built {
            drv_path: Box::new(DerivedPath::built(drv(), OutputsSpec::parse("out").unwrap())),
            outputs: OutputsSpec::All,
        };
        let mut buf = Vec::new();
        assert!(
            nested
                .serialize(&mut buf, ProtocolVersion::from_parts(1, 29), &dir)
                .await
                .is_err()
        );
        round_trip_at(nested, ProtocolVersion::from_parts(1, 30)).await;
    }
}
