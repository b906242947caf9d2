//! Shared pieces of the stderr frame encoding: typed field lists and the
//! structured error payload.

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{DaemonError, DaemonErrorKind, ProtocolError};
use crate::protocol::{
    LoggerField, ProtocolVersion, StderrError, Trace, FIELD_TYPE_INT, FIELD_TYPE_STRING,
};
use crate::serialization::{Deserialize, Serialize};

impl Serialize for LoggerField {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        match self {
            LoggerField::Int(n) => {
                FIELD_TYPE_INT.serialize(writer, version, store_dir).await?;
                n.serialize(writer, version, store_dir).await
            }
            LoggerField::String(s) => {
                FIELD_TYPE_STRING
                    .serialize(writer, version, store_dir)
                    .await?;
                s.serialize(writer, version, store_dir).await
            }
        }
    }
}

impl Deserialize for LoggerField {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let tag = u64::deserialize(reader, version, store_dir).await?;
        match tag {
            FIELD_TYPE_INT => Ok(LoggerField::Int(
                u64::deserialize(reader, version, store_dir).await?,
            )),
            FIELD_TYPE_STRING => Ok(LoggerField::String(
                String::deserialize(reader, version, store_dir).await?,
            )),
            other => Err(ProtocolError::bad_value("logger field tag", other)),
        }
    }
}

/// The structured error of an `ERROR` frame, v1.26 and later. Position
/// information never crosses the wire; the have-position words are written
/// as zero and their payload skipped if a peer ever sets them.
impl Serialize for StderrError {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.typ.serialize(writer, version, store_dir).await?;
        self.level.serialize(writer, version, store_dir).await?;
        self.name.serialize(writer, version, store_dir).await?;
        self.message.serialize(writer, version, store_dir).await?;
        0u64.serialize(writer, version, store_dir).await?; // havePos
        (self.traces.len() as u64)
            .serialize(writer, version, store_dir)
            .await?;
        for trace in &self.traces {
            0u64.serialize(writer, version, store_dir).await?; // havePos
            trace.message.serialize(writer, version, store_dir).await?;
        }
        Ok(())
    }
}

impl Deserialize for StderrError {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        let typ = String::deserialize(reader, version, store_dir).await?;
        let level = u64::deserialize(reader, version, store_dir).await?;
        let name = String::deserialize(reader, version, store_dir).await?;
        let message = String::deserialize(reader, version, store_dir).await?;
        u64::deserialize(reader, version, store_dir).await?; // havePos
        let count = u64::deserialize(reader, version, store_dir).await?;
        if count > crate::protocol::MAX_LIST_SIZE {
            return Err(ProtocolError::ListTooLong {
                length: count,
                max: crate::protocol::MAX_LIST_SIZE,
            });
        }
        let mut traces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            u64::deserialize(reader, version, store_dir).await?; // havePos
            traces.push(Trace {
                message: String::deserialize(reader, version, store_dir).await?,
            });
        }
        Ok(StderrError {
            typ,
            level,
            name,
            message,
            traces,
        })
    }
}

impl StderrError {
    pub fn from_daemon_error(err: &DaemonError) -> Self {
        StderrError {
            typ: "Error".to_owned(),
            level: 0,
            name: err.kind.name().to_owned(),
            message: err.message.clone(),
            traces: err
                .traces
                .iter()
                .map(|t| Trace { message: t.clone() })
                .collect(),
        }
    }

    pub fn into_daemon_error(self) -> DaemonError {
        DaemonError {
            kind: DaemonErrorKind::from_name(&self.name),
            message: self.message,
            status: 1,
            traces: self.traces.into_iter().map(|t| t.message).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    #[tokio::test]
    async fn fields_round_trip() {
        let dir = StoreDir::default();
        for field in [
            LoggerField::Int(42),
            LoggerField::String("building".to_owned()),
        ] {
            let mut buf = Vec::new();
            field
                .serialize(&mut buf, PROTOCOL_VERSION, &dir)
                .await
                .unwrap();
            let mut cursor = Cursor::new(buf);
            assert_eq!(
                LoggerField::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                    .await
                    .unwrap(),
                field
            );
        }
    }

    #[tokio::test]
    async fn error_round_trips_through_wire_form() {
        let dir = StoreDir::default();
        let err = DaemonError {
            kind: DaemonErrorKind::InvalidPath,
            message: "path is not valid".to_owned(),
            status: 1,
            traces: vec!["while doing a thing".to_owned()],
        };
        let wire = StderrError::from_daemon_error(&err);
        let mut buf = Vec::new();
        wire.serialize(&mut buf, PROTOCOL_VERSION, &dir).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let back = StderrError::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        assert_eq!(back.into_daemon_error(), err);
    }

    #[tokio::test]
    async fn unknown_field_tag_is_rejected() {
        let dir = StoreDir::default();
        let mut buf = Vec::new();
        9u64.serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(
            LoggerField::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .is_err()
        );
    }
}
