//! The daemon end of the credential side-channel.
//!
//! After the handshake on an fd-capable transport, the daemon announces
//! the callback channel, passes one end of a fresh socket pair to the
//! client, and from then on asks over that socket whenever a handler
//! needs credentials. Tunnel failures degrade to "no credentials"; they
//! never poison the main connection.

use std::sync::Arc;

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::auth::{AuthData, AuthRequest, CallbackOp};
use crate::error::ProtocolError;
use crate::protocol::{OpCode, ProtocolVersion};
use crate::serialization::{Deserialize, Serialize};

/// Announce the tunnel on the main channel and hand the client its end.
/// Runs on the raw socket, before buffering is layered on.
pub(crate) async fn establish_tunnel(
    stream: &mut UnixStream,
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<TunneledCredentials, ProtocolError> {
    (OpCode::InitCallback as u64)
        .serialize(stream, version, store_dir)
        .await?;
    stream
        .flush()
        .await
        .map_err(|e| ProtocolError::io("flushing callback announcement", e))?;

    let mut ack = [0u8; 1];
    stream
        .read_exact(&mut ack)
        .await
        .map_err(|e| ProtocolError::io("reading callback acknowledgement", e))?;

    let (ours, theirs) = crate::fd::tunnel_pair()?;
    crate::fd::send_fd(stream, &theirs).await?;
    drop(theirs);
    debug!("credential tunnel established");
    Ok(TunneledCredentials::new(ours, version, store_dir.clone()))
}

/// Asks the client for credentials. One exchange runs at a time; the
/// internal mutex serializes concurrent helper tasks.
pub struct TunneledCredentials {
    io: tokio::sync::Mutex<UnixStream>,
    version: ProtocolVersion,
    store_dir: StoreDir,
}

impl TunneledCredentials {
    fn new(stream: UnixStream, version: ProtocolVersion, store_dir: StoreDir) -> Self {
        TunneledCredentials {
            io: tokio::sync::Mutex::new(stream),
            version,
            store_dir,
        }
    }

    /// Ask the client to fill `request`.
    pub async fn fill(
        &self,
        request: &AuthRequest,
        required: bool,
    ) -> Result<Option<AuthData>, ProtocolError> {
        let mut io = self.io.lock().await;
        (CallbackOp::FillAuth as u64)
            .serialize(&mut *io, self.version, &self.store_dir)
            .await?;
        request
            .serialize(&mut *io, self.version, &self.store_dir)
            .await?;
        required
            .serialize(&mut *io, self.version, &self.store_dir)
            .await?;
        io.flush()
            .await
            .map_err(|e| ProtocolError::io("flushing credential request", e))?;
        u64::deserialize(&mut *io, self.version, &self.store_dir).await?;
        Option::<AuthData>::deserialize(&mut *io, self.version, &self.store_dir).await
    }

    /// Like [`TunneledCredentials::fill`], but a dead tunnel reads as
    /// "no credentials".
    pub async fn fill_or_none(&self, request: &AuthRequest, required: bool) -> Option<AuthData> {
        match self.fill(request, required).await {
            Ok(data) => data,
            Err(err) => {
                debug!("credential tunnel unavailable: {err}");
                None
            }
        }
    }

    /// Tell the client a credential was rejected upstream.
    pub async fn reject(&self, data: &AuthData) -> Result<(), ProtocolError> {
        let mut io = self.io.lock().await;
        (CallbackOp::RejectAuth as u64)
            .serialize(&mut *io, self.version, &self.store_dir)
            .await?;
        data.serialize(&mut *io, self.version, &self.store_dir)
            .await?;
        io.flush()
            .await
            .map_err(|e| ProtocolError::io("flushing rejection", e))?;
        u64::deserialize(&mut *io, self.version, &self.store_dir).await?;
        Ok(())
    }
}

// Kept alive by OpContext clones across helper tasks.
pub type SharedCredentials = Option<Arc<TunneledCredentials>>;
