//! The client end of the credential side-channel: accept the descriptor
//! the daemon passes after the handshake and answer its queries until the
//! tunnel closes.

use std::sync::Arc;

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::auth::{AuthData, AuthRequest, CallbackOp, CredentialSource};
use crate::error::ProtocolError;
use crate::protocol::{OpCode, ProtocolVersion};
use crate::serialization::{Deserialize, Serialize};

/// Complete the tunnel establishment on the client side: read the
/// `InitCallback` marker, acknowledge, receive the descriptor, and spawn
/// the answer loop.
pub(crate) async fn accept_tunnel(
    stream: &mut UnixStream,
    version: ProtocolVersion,
    store_dir: &StoreDir,
    source: Arc<dyn CredentialSource>,
) -> Result<(), ProtocolError> {
    let marker = u64::deserialize(stream, version, store_dir).await?;
    if marker != OpCode::InitCallback as u64 {
        return Err(ProtocolError::InvalidMsgCode(marker));
    }
    stream
        .write_all(&[1u8])
        .await
        .map_err(|e| ProtocolError::io("acknowledging callback setup", e))?;
    let fd = crate::fd::receive_fd(stream).await?;
    let tunnel = crate::fd::stream_from_fd(fd)?;
    spawn_answerer(tunnel, version, store_dir.clone(), source);
    Ok(())
}

/// Answer `FillAuth`/`RejectAuth` queries until the daemon drops its end.
/// Failures are logged and end the loop; they never surface on the main
/// connection.
pub(crate) fn spawn_answerer(
    tunnel: UnixStream,
    version: ProtocolVersion,
    store_dir: StoreDir,
    source: Arc<dyn CredentialSource>,
) {
    tokio::spawn(async move {
        if let Err(err) = answer_loop(tunnel, version, &store_dir, source).await {
            debug!("credential tunnel closed: {err}");
        }
    });
}

async fn answer_loop(
    tunnel: UnixStream,
    version: ProtocolVersion,
    store_dir: &StoreDir,
    source: Arc<dyn CredentialSource>,
) -> Result<(), ProtocolError> {
    let (mut reader, writer) = tunnel.into_split();
    let mut writer = BufWriter::new(writer);
    loop {
        let mut op_buf = [0u8; 8];
        match reader.read_exact(&mut op_buf).await {
            Ok(_) => {}
            // The daemon hanging up is the normal end of the tunnel.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(ProtocolError::io("reading callback operation", e)),
        }
        match CallbackOp::try_from(u64::from_le_bytes(op_buf))? {
            CallbackOp::FillAuth => {
                let request = AuthRequest::deserialize(&mut reader, version, store_dir).await?;
                let required = bool::deserialize(&mut reader, version, store_dir).await?;
                let reply = source.fill(&request, required);
                if reply.is_none() && required {
                    warn!(host = ?request.host, "no credential available for required request");
                }
                1u64.serialize(&mut writer, version, store_dir).await?;
                reply.serialize(&mut writer, version, store_dir).await?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ProtocolError::io("flushing credential reply", e))?;
            }
            CallbackOp::RejectAuth => {
                let data = AuthData::deserialize(&mut reader, version, store_dir).await?;
                source.reject(&data);
                1u64.serialize(&mut writer, version, store_dir).await?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ProtocolError::io("flushing rejection ack", e))?;
            }
        }
    }
}
