//! The credential side-channel.
//!
//! When the daemon needs credentials it does not hold (a fetcher pulling
//! under the client's identity), it asks the client over a dedicated
//! socket pair established right after the handshake; see `server::auth`
//! and `client::auth` for the two ends. This module holds the shared
//! request/response vocabulary.

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use crate::serialization::{Deserialize, Serialize};

/// Operations the daemon sends down the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum CallbackOp {
    FillAuth = 0,
    RejectAuth = 1,
}

impl TryFrom<u64> for CallbackOp {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(CallbackOp::FillAuth),
            1 => Ok(CallbackOp::RejectAuth),
            other => Err(ProtocolError::bad_value("callback operation", other)),
        }
    }
}

/// What the daemon knows about the credential it needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthRequest {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub username: Option<String>,
}

impl Serialize for AuthRequest {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.protocol.serialize(writer, version, store_dir).await?;
        self.host.serialize(writer, version, store_dir).await?;
        self.path.serialize(writer, version, store_dir).await?;
        self.username.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for AuthRequest {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        Ok(AuthRequest {
            protocol: Option::deserialize(reader, version, store_dir).await?,
            host: Option::deserialize(reader, version, store_dir).await?,
            path: Option::deserialize(reader, version, store_dir).await?,
            username: Option::deserialize(reader, version, store_dir).await?,
        })
    }
}

/// A credential produced by the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthData {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Serialize for AuthData {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError> {
        self.username.serialize(writer, version, store_dir).await?;
        self.password.serialize(writer, version, store_dir).await
    }
}

impl Deserialize for AuthData {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError> {
        Ok(AuthData {
            username: Option::deserialize(reader, version, store_dir).await?,
            password: Option::deserialize(reader, version, store_dir).await?,
        })
    }
}

/// Answers credential queries on the client side. Implementations usually
/// front a keychain or an interactive prompt.
pub trait CredentialSource: Send + Sync + 'static {
    /// Produce a credential for `request`, or `None` if unavailable.
    fn fill(&self, request: &AuthRequest, required: bool) -> Option<AuthData>;

    /// The daemon observed `data` being rejected; forget it.
    fn reject(&self, data: &AuthData);
}

/// A source that never has credentials.
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn fill(&self, _request: &AuthRequest, _required: bool) -> Option<AuthData> {
        None
    }

    fn reject(&self, _data: &AuthData) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_VERSION;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_round_trip() {
        let dir = StoreDir::default();
        let request = AuthRequest {
            protocol: Some("https".to_owned()),
            host: Some("cache.example.org".to_owned()),
            path: None,
            username: None,
        };
        let mut buf = Vec::new();
        request
            .serialize(&mut buf, PROTOCOL_VERSION, &dir)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            AuthRequest::deserialize(&mut cursor, PROTOCOL_VERSION, &dir)
                .await
                .unwrap(),
            request
        );
    }
}
