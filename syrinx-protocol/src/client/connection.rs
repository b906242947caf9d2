//! The client half of a connection: handshake, the stderr pump, and the
//! poisoning discipline.

use std::collections::BTreeSet;

use syrinx_store_core::{StoreDir, StorePath};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tracing::{debug, info, trace};

use crate::error::{DaemonError, DaemonErrorKind, ProtocolError};
use crate::protocol::{
    ActivityType, LoggerField, Msg, Negotiated, OpCode, ProtocolVersion, ResultType, StderrError,
    CLIENT_MAGIC, MIN_PROTOCOL_VERSION, SERVER_MAGIC,
};
use crate::serialization::{read_bytes, write_bytes, Deserialize, Serialize};

/// Exchange magics, versions and feature sets, client side. Runs on the
/// raw stream before any buffering is layered on.
pub async fn client_handshake<S>(
    stream: &mut S,
    local_version: ProtocolVersion,
    local_features: &BTreeSet<String>,
) -> Result<Negotiated, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let store_dir = StoreDir::default(); // not consulted by handshake values
    CLIENT_MAGIC
        .serialize(stream, local_version, &store_dir)
        .await?;
    u64::from(local_version)
        .serialize(stream, local_version, &store_dir)
        .await?;
    stream.flush().await?;

    let magic = u64::deserialize(stream, local_version, &store_dir).await?;
    if magic != SERVER_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: SERVER_MAGIC,
            actual: magic,
        });
    }
    let server_version =
        ProtocolVersion::from(u64::deserialize(stream, local_version, &store_dir).await?);
    if server_version.major != local_version.major || server_version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::IncompatibleVersion {
            peer: server_version,
            min: MIN_PROTOCOL_VERSION,
            max: local_version,
        });
    }
    let version = server_version.min(local_version);
    u64::from(version)
        .serialize(stream, version, &store_dir)
        .await?;

    let features = if version.minor >= 33 {
        local_features.serialize(stream, version, &store_dir).await?;
        stream.flush().await?;
        let server_features =
            BTreeSet::<String>::deserialize(stream, version, &store_dir).await?;
        local_features
            .intersection(&server_features)
            .cloned()
            .collect()
    } else {
        stream.flush().await?;
        BTreeSet::new()
    };

    debug!(%version, ?features, "client handshake complete");
    Ok(Negotiated { version, features })
}

/// The post-handshake exchange: two legacy words out, connection metadata
/// back.
pub async fn client_post_handshake<S>(
    stream: &mut S,
    negotiated: &Negotiated,
    store_dir: &StoreDir,
) -> Result<crate::serialization::handshake::ClientHandshakeInfo, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = negotiated.version;
    if version.minor >= 14 {
        0u64.serialize(stream, version, store_dir).await?; // obsolete CPU affinity
    }
    if version.minor >= 11 {
        false.serialize(stream, version, store_dir).await?; // obsolete reserveSpace
    }
    stream.flush().await?;
    crate::serialization::handshake::ClientHandshakeInfo::deserialize(stream, version, store_dir)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Ready,
    Poisoned,
}

/// One negotiated connection. Owns the buffered transport halves; every
/// request flows through [`Connection::process_stderr_with`] before its
/// typed reply is read. Any failure other than a daemon-reported error
/// poisons the connection for good.
#[derive(Debug)]
pub struct Connection<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    version: ProtocolVersion,
    features: BTreeSet<String>,
    store_dir: StoreDir,
    state: ConnectionState,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, negotiated: Negotiated, store_dir: StoreDir) -> Self {
        Connection {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            version: negotiated.version,
            features: negotiated.features,
            store_dir,
            state: ConnectionState::Ready,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == ConnectionState::Poisoned
    }

    /// Refuse to start a request on a poisoned connection.
    pub fn check_ready(&self) -> Result<(), ProtocolError> {
        if self.is_poisoned() {
            return Err(ProtocolError::Poisoned);
        }
        Ok(())
    }

    /// Classify the outcome of a request: daemon-reported errors leave the
    /// stream in sync, everything else poisons it.
    pub fn settle<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if let Err(err) = &result {
            if !matches!(err, ProtocolError::Daemon(_)) {
                self.state = ConnectionState::Poisoned;
            }
        }
        result
    }

    pub async fn write_op(&mut self, op: OpCode) -> Result<(), ProtocolError> {
        op.check_version(self.version)?;
        (op as u64)
            .serialize(&mut self.writer, self.version, &self.store_dir)
            .await
    }

    pub async fn write_value<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), ProtocolError> {
        value
            .serialize(&mut self.writer, self.version, &self.store_dir)
            .await
    }

    pub async fn read_value<T: Deserialize>(&mut self) -> Result<T, ProtocolError> {
        T::deserialize(&mut self.reader, self.version, &self.store_dir).await
    }

    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        self.writer.flush().await.map_err(ProtocolError::from)
    }

    /// Read an optional store path in its empty-string-for-absent form.
    pub async fn read_opt_store_path(&mut self) -> Result<Option<StorePath>, ProtocolError> {
        crate::serialization::store_types::read_opt_store_path(
            &mut self.reader,
            self.version,
            &self.store_dir,
        )
        .await
    }

    /// Read the reply of `QueryDerivationOutputMap`: output names to
    /// optionally-known paths.
    pub async fn read_output_map(
        &mut self,
    ) -> Result<std::collections::BTreeMap<String, Option<StorePath>>, ProtocolError> {
        let count = u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
        if count > crate::protocol::MAX_LIST_SIZE {
            return Err(ProtocolError::ListTooLong {
                length: count,
                max: crate::protocol::MAX_LIST_SIZE,
            });
        }
        let mut map = std::collections::BTreeMap::new();
        for _ in 0..count {
            let name = String::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
            let path = crate::serialization::store_types::read_opt_store_path(
                &mut self.reader,
                self.version,
                &self.store_dir,
            )
            .await?;
            map.insert(name, path);
        }
        Ok(map)
    }

    /// Stream `source` through the framed encoding on the main channel.
    pub async fn send_framed<S: AsyncRead + Unpin>(
        &mut self,
        source: S,
    ) -> Result<(), ProtocolError> {
        let mut sink = crate::framed::FramedSink::new(&mut self.writer);
        crate::framed::copy_to_framed(source, &mut sink).await?;
        sink.finish().await?;
        self.flush().await
    }

    /// Half-close the outbound direction to signal orderly shutdown.
    pub async fn close_write(&mut self) -> Result<(), ProtocolError> {
        self.writer.flush().await?;
        self.writer.shutdown().await.map_err(ProtocolError::from)
    }

    /// Pump stderr frames with neither sink nor source attached.
    pub async fn process_stderr(&mut self) -> Result<(), ProtocolError> {
        self.process_stderr_with(Option::<&mut Vec<u8>>::None, Option::<&mut &[u8]>::None)
            .await
    }

    /// Pump stderr frames until the server terminates the exchange.
    ///
    /// `sink` receives `WRITE` payloads; `source` answers `READ` requests.
    /// A data frame arriving with no matching attachment poisons the
    /// stream, because its payload cannot be consumed coherently.
    pub async fn process_stderr_with<SK, SR>(
        &mut self,
        mut sink: Option<&mut SK>,
        mut source: Option<&mut SR>,
    ) -> Result<(), ProtocolError>
    where
        SK: AsyncWrite + Unpin,
        SR: AsyncRead + Unpin,
    {
        self.flush().await?;
        loop {
            let tag = u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
            match Msg::try_from(tag)? {
                Msg::Write => {
                    let data = read_bytes(&mut self.reader).await?;
                    match sink.as_mut() {
                        Some(sink) => sink
                            .write_all(&data)
                            .await
                            .map_err(|e| ProtocolError::io("writing to sink", e))?,
                        None => return Err(ProtocolError::UnexpectedDataFrame(tag)),
                    }
                }
                Msg::Read => {
                    let want =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    let source = source
                        .as_mut()
                        .ok_or(ProtocolError::UnexpectedDataFrame(tag))?;
                    let mut chunk = vec![0u8; want.min(crate::protocol::MAX_STRING_SIZE) as usize];
                    let n = source
                        .read(&mut chunk)
                        .await
                        .map_err(|e| ProtocolError::io("reading from source", e))?;
                    write_bytes(&mut self.writer, &chunk[..n]).await?;
                    self.flush().await?;
                }
                Msg::Next => {
                    let line = read_bytes(&mut self.reader).await?;
                    let line = String::from_utf8_lossy(&line);
                    info!(target: "syrinx_protocol::remote", "{}", line.trim_end_matches('\n'));
                }
                Msg::StartActivity => {
                    let act =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    let level =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    let typ =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    let text = read_bytes(&mut self.reader).await?;
                    let fields = Vec::<LoggerField>::deserialize(
                        &mut self.reader,
                        self.version,
                        &self.store_dir,
                    )
                    .await?;
                    let parent =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    debug!(
                        target: "syrinx_protocol::remote",
                        act,
                        level,
                        parent,
                        activity = ?ActivityType::from(typ),
                        ?fields,
                        "start activity: {}",
                        String::from_utf8_lossy(&text)
                    );
                }
                Msg::StopActivity => {
                    let act =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    debug!(target: "syrinx_protocol::remote", act, "stop activity");
                }
                Msg::Result => {
                    let act =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    let typ =
                        u64::deserialize(&mut self.reader, self.version, &self.store_dir).await?;
                    let fields = Vec::<LoggerField>::deserialize(
                        &mut self.reader,
                        self.version,
                        &self.store_dir,
                    )
                    .await?;
                    trace!(
                        target: "syrinx_protocol::remote",
                        act,
                        result = ?ResultType::from(typ),
                        ?fields,
                        "activity result"
                    );
                }
                Msg::Error => {
                    let err = if self.version.minor >= 26 {
                        StderrError::deserialize(&mut self.reader, self.version, &self.store_dir)
                            .await?
                            .into_daemon_error()
                    } else {
                        let message =
                            String::deserialize(&mut self.reader, self.version, &self.store_dir)
                                .await?;
                        let status =
                            u64::deserialize(&mut self.reader, self.version, &self.store_dir)
                                .await?;
                        DaemonError {
                            kind: DaemonErrorKind::Misc,
                            message,
                            status,
                            traces: Vec::new(),
                        }
                    };
                    return Err(ProtocolError::Daemon(err));
                }
                Msg::Last => return Ok(()),
            }
        }
    }
}
