//! The server half of a connection: handshake and the request dispatcher.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use syrinx_store_core::{BasicDerivation, BuildMode, DerivedPath, DrvOutput, StorePath};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::error::{DaemonError, DaemonErrorKind, ProtocolError};
use crate::framed::FramedSource;
use crate::protocol::{
    Msg, Negotiated, OpCode, ProtocolVersion, Verbosity, CLIENT_MAGIC, MAX_BUFFERED_NAR,
    MIN_PROTOCOL_VERSION, SERVER_MAGIC, TUNNEL_READ_CHUNK,
};
use crate::serialization::gc::GcOptions;
use crate::serialization::handshake::ClientHandshakeInfo;
use crate::serialization::options::ClientOptions;
use crate::serialization::store_types::{write_opt_store_path, ValidPathInfo};
use crate::serialization::{read_bytes_bounded, write_bytes, Deserialize, Serialize};
use crate::server::auth::SharedCredentials;
use crate::server::handler::{DaemonStore, OpContext, TrustLevel};
use crate::server::logger::{SharedSink, TunnelLogger};
use crate::server::ServerConfig;

/// Exchange magics, versions and feature sets, server side. Runs on the
/// raw stream before any buffering is layered on.
pub async fn server_handshake<S>(
    stream: &mut S,
    config: &ServerConfig,
) -> Result<Negotiated, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let store_dir = &config.store_dir;
    let local_version = config.max_version;

    let magic = u64::deserialize(stream, local_version, store_dir).await?;
    if magic != CLIENT_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: CLIENT_MAGIC,
            actual: magic,
        });
    }
    let client_version =
        ProtocolVersion::from(u64::deserialize(stream, local_version, store_dir).await?);

    (SERVER_MAGIC).serialize(stream, local_version, store_dir).await?;
    u64::from(local_version)
        .serialize(stream, local_version, store_dir)
        .await?;
    stream.flush().await?;

    if client_version.major != local_version.major || client_version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::IncompatibleVersion {
            peer: client_version,
            min: MIN_PROTOCOL_VERSION,
            max: local_version,
        });
    }
    let version = client_version.min(local_version);
    let announced =
        ProtocolVersion::from(u64::deserialize(stream, version, store_dir).await?);
    if announced != version {
        return Err(ProtocolError::EffectiveVersionMismatch {
            announced,
            computed: version,
        });
    }

    let features = if version.minor >= 33 {
        let client_features = BTreeSet::<String>::deserialize(stream, version, store_dir).await?;
        config
            .features
            .serialize(stream, version, store_dir)
            .await?;
        stream.flush().await?;
        config
            .features
            .intersection(&client_features)
            .cloned()
            .collect()
    } else {
        BTreeSet::new()
    };

    debug!(%version, ?features, "server handshake complete");
    Ok(Negotiated { version, features })
}

/// The server's post-handshake: swallow the legacy words, send connection
/// metadata.
pub async fn server_post_handshake<S>(
    stream: &mut S,
    config: &ServerConfig,
    negotiated: &Negotiated,
    trust: TrustLevel,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = negotiated.version;
    let store_dir = &config.store_dir;
    if version.minor >= 14 {
        // Obsolete CPU affinity: old clients send a flag word and, when
        // nonzero, the affinity value itself.
        if u64::deserialize(stream, version, store_dir).await? != 0 {
            u64::deserialize(stream, version, store_dir).await?;
        }
    }
    if version.minor >= 11 {
        u64::deserialize(stream, version, store_dir).await?; // obsolete reserveSpace
    }
    let info = ClientHandshakeInfo {
        daemon_version: Some(config.daemon_version.clone()),
        remote_trusts_us: Some(match trust {
            TrustLevel::Trusted => syrinx_store_core::TrustedFlag::Trusted,
            TrustLevel::NotTrusted => syrinx_store_core::TrustedFlag::NotTrusted,
        }),
    };
    info.serialize(stream, version, store_dir).await?;
    stream.flush().await?;
    Ok(())
}

/// One accepted connection, post-handshake. Strictly request-serial; the
/// write half is shared with the [`TunnelLogger`] behind a mutex.
pub struct ServerConnection<R> {
    reader: BufReader<R>,
    sink: SharedSink,
    version: ProtocolVersion,
    trust: TrustLevel,
    options: ClientOptions,
    logger: TunnelLogger,
    credentials: SharedCredentials,
    config: Arc<ServerConfig>,
    interrupt: Arc<AtomicBool>,
}

impl<R> ServerConnection<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        negotiated: Negotiated,
        trust: TrustLevel,
        credentials: SharedCredentials,
        config: Arc<ServerConfig>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(writer));
        let logger = TunnelLogger::new(
            sink.clone(),
            negotiated.version,
            config.store_dir.clone(),
        );
        ServerConnection {
            reader: BufReader::new(reader),
            sink,
            version: negotiated.version,
            trust,
            options: ClientOptions::default(),
            logger,
            credentials,
            config,
            interrupt,
        }
    }

    /// Run the dispatcher until the client hangs up or the stream breaks.
    pub async fn process_requests<S: DaemonStore>(
        mut self,
        store: Arc<S>,
    ) -> Result<(), ProtocolError> {
        loop {
            let op_word = match self.read_value::<u64>().await {
                Ok(word) => word,
                Err(ProtocolError::UnexpectedEof { .. }) => {
                    debug!("client closed the connection");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            let op = OpCode::try_from(op_word)?;
            if op.is_removed() {
                return Err(ProtocolError::InvalidOpCode(op_word));
            }
            op.check_version(self.version)?;
            trace!(?op, "dispatching operation");

            match self.perform_op(op, store.as_ref()).await {
                Ok(()) => {}
                Err(err) if err.can_recover() => {
                    // The frame boundary is intact; report and carry on.
                    self.logger.start_work().await?;
                    self.logger.stop_work_err(&err.into_daemon_error()).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn perform_op<S: DaemonStore>(
        &mut self,
        op: OpCode,
        store: &S,
    ) -> Result<(), ProtocolError> {
        let ctx = self.op_context();
        ctx.check_interrupt().map_err(ProtocolError::Daemon)?;

        match op {
            OpCode::IsValidPath => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let valid = store.is_valid_path(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&valid).await
            }

            OpCode::HasSubstitutes => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let result = store.has_substitutes(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&result).await
            }

            OpCode::QueryReferrers => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let referrers = store.query_referrers(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&referrers).await
            }

            OpCode::QueryValidDerivers => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let derivers = store.query_valid_derivers(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&derivers).await
            }

            OpCode::QueryValidPaths => {
                let paths: BTreeSet<StorePath> = self.read_value().await?;
                let substitute = if self.version.minor >= 27 {
                    self.read_value().await?
                } else {
                    false
                };
                self.logger.start_work().await?;
                let valid = store.query_valid_paths(&ctx, paths, substitute).await?;
                self.logger.stop_work().await?;
                self.write_reply(&valid).await
            }

            OpCode::QueryAllValidPaths => {
                self.logger.start_work().await?;
                let paths = store.query_all_valid_paths(&ctx).await?;
                self.logger.stop_work().await?;
                self.write_reply(&paths).await
            }

            OpCode::QueryPathInfo => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let info = store.query_path_info(&ctx, path.clone()).await?;
                if self.version.minor >= 17 {
                    self.logger.stop_work().await?;
                    self.write_reply(&info).await
                } else {
                    // Old clients expect a bare record or an error.
                    let info = info.ok_or_else(|| {
                        DaemonError::new(
                            DaemonErrorKind::InvalidPath,
                            format!(
                                "path '{}' is not valid",
                                self.config.store_dir.display_path(&path)
                            ),
                        )
                    })?;
                    self.logger.stop_work().await?;
                    self.write_reply(&info).await
                }
            }

            OpCode::QueryPathFromHashPart => {
                let hash_part: String = self.read_value().await?;
                self.logger.start_work().await?;
                let path = store.query_path_from_hash_part(&ctx, hash_part).await?;
                self.logger.stop_work().await?;
                let mut sink = self.sink.lock().await;
                write_opt_store_path(
                    &mut *sink,
                    path.as_ref(),
                    self.version,
                    &self.config.store_dir,
                )
                .await?;
                sink.flush().await.map_err(ProtocolError::from)
            }

            OpCode::QuerySubstitutablePaths => {
                let paths: BTreeSet<StorePath> = self.read_value().await?;
                self.logger.start_work().await?;
                let result = store.query_substitutable_paths(&ctx, paths).await?;
                self.logger.stop_work().await?;
                self.write_reply(&result).await
            }

            OpCode::QuerySubstitutablePathInfo => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let info = store.query_substitutable_path_info(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&info).await
            }

            OpCode::QuerySubstitutablePathInfos => {
                let paths: BTreeSet<StorePath> = self.read_value().await?;
                self.logger.start_work().await?;
                let infos = store.query_substitutable_path_infos(&ctx, paths).await?;
                self.logger.stop_work().await?;
                self.write_reply(&infos).await
            }

            OpCode::QueryDerivationOutputMap => {
                let drv_path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let map = store.query_derivation_output_map(&ctx, drv_path).await?;
                self.logger.stop_work().await?;
                self.write_output_map(&map).await
            }

            OpCode::QueryMissing => {
                let targets: Vec<DerivedPath> = self.read_value().await?;
                self.logger.start_work().await?;
                let missing = store.query_missing(&ctx, targets).await?;
                self.logger.stop_work().await?;
                self.write_reply(&missing).await
            }

            OpCode::QueryRealisation => {
                let raw: String = self.read_value().await?;
                let id = DrvOutput::parse(&raw)
                    .map_err(|e| ProtocolError::bad_value("derivation output id", e))?;
                self.logger.start_work().await?;
                let realisations = store.query_realisation(&ctx, id).await?;
                self.logger.stop_work().await?;
                if self.version.minor >= 31 {
                    self.write_reply(&realisations).await
                } else {
                    let paths: BTreeSet<StorePath> =
                        realisations.into_iter().map(|r| r.out_path).collect();
                    self.write_reply(&paths).await
                }
            }

            OpCode::RegisterDrvOutput => {
                let realisation = if self.version.minor >= 31 {
                    self.read_value().await?
                } else {
                    let raw: String = self.read_value().await?;
                    let id = DrvOutput::parse(&raw)
                        .map_err(|e| ProtocolError::bad_value("derivation output id", e))?;
                    let out_path: StorePath = self.read_value().await?;
                    syrinx_store_core::Realisation {
                        id,
                        out_path,
                        signatures: Default::default(),
                        dependent_realisations: Default::default(),
                    }
                };
                self.logger.start_work().await?;
                store.register_drv_output(&ctx, realisation).await?;
                self.logger.stop_work().await?;
                self.flush_sink().await
            }

            OpCode::AddToStore => {
                let name: String = self.read_value().await?;
                let method_algo: String = self.read_value().await?;
                let references: BTreeSet<StorePath> = self.read_value().await?;
                let repair: bool = self.read_value().await?;
                self.logger.start_work().await?;
                // The payload must leave the stream before any error can
                // be reported, or the frame boundary is lost.
                let nar = self.read_framed_payload().await?;
                self.require_trusted_for(repair, "repairing")?;
                syrinx_store_core::ContentAddress::parse_method_algo(&method_algo)
                    .map_err(|e| ProtocolError::bad_value("content address method", e))?;
                let info = store
                    .add_to_store(&ctx, name, method_algo, references, repair, nar)
                    .await?;
                self.logger.stop_work().await?;
                self.write_reply(&info).await
            }

            OpCode::AddToStoreNar => {
                let info: ValidPathInfo = self.read_value().await?;
                let repair: bool = self.read_value().await?;
                let mut dont_check_sigs: bool = self.read_value().await?;
                if self.trust != TrustLevel::Trusted {
                    dont_check_sigs = false;
                }
                self.logger.start_work().await?;
                let nar = if self.version.minor >= 21 {
                    let nar = self.read_framed_payload().await?;
                    self.require_trusted_for(repair, "repairing")?;
                    nar
                } else {
                    // Nothing is in flight yet on old clients: refuse
                    // before pulling the payload.
                    self.require_trusted_for(repair, "repairing")?;
                    self.read_tunnel_payload().await?
                };
                store
                    .add_to_store_nar(&ctx, info, nar, repair, dont_check_sigs)
                    .await?;
                self.logger.stop_work().await?;
                self.flush_sink().await
            }

            OpCode::AddMultipleToStore => {
                let _repair: bool = self.read_value().await?;
                let _dont_check_sigs: bool = self.read_value().await?;
                self.logger.start_work().await?;
                // Decoding the interior of this payload needs an archive
                // parser; drain it to keep the stream usable, then refuse.
                let mut source = FramedSource::new(&mut self.reader);
                source.consume_to_end().await?;
                Err(ProtocolError::Daemon(DaemonError::new(
                    DaemonErrorKind::Unsupported,
                    "bulk imports are not supported by this daemon",
                )))
            }

            OpCode::AddBuildLog => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let log = self.read_framed_payload().await?;
                store.add_build_log(&ctx, path, log).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::NarFromPath => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                let nar = store.nar_from_path(&ctx, path).await?;
                self.write_data_frames(&nar).await?;
                self.logger.stop_work().await?;
                self.flush_sink().await
            }

            OpCode::BuildPaths => {
                let paths: Vec<DerivedPath> = self.read_value().await?;
                let mode = if self.version.minor >= 15 {
                    self.read_value().await?
                } else {
                    BuildMode::Normal
                };
                self.require_trusted_for(mode == BuildMode::Repair, "repairing")?;
                self.logger.start_work().await?;
                store.build_paths(&ctx, paths, mode).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::BuildPathsWithResults => {
                let paths: Vec<DerivedPath> = self.read_value().await?;
                let mode: BuildMode = self.read_value().await?;
                self.require_trusted_for(mode == BuildMode::Repair, "repairing")?;
                self.logger.start_work().await?;
                let results = store.build_paths_with_results(&ctx, paths, mode).await?;
                self.logger.stop_work().await?;
                self.write_reply(&results).await
            }

            OpCode::BuildDerivation => {
                let drv_path: StorePath = self.read_value().await?;
                let mut drv: BasicDerivation = self.read_value().await?;
                let mode: BuildMode = self.read_value().await?;
                drv.name = drv_path
                    .name()
                    .strip_suffix(".drv")
                    .unwrap_or(drv_path.name())
                    .to_owned();
                self.require_trusted_for(mode == BuildMode::Repair, "repairing")?;
                self.logger.start_work().await?;
                let result = store.build_derivation(&ctx, drv_path, drv, mode).await?;
                self.logger.stop_work().await?;
                self.write_reply(&result).await
            }

            OpCode::EnsurePath => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                store.ensure_path(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::AddTempRoot => {
                let path: StorePath = self.read_value().await?;
                self.logger.start_work().await?;
                store.add_temp_root(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::AddIndirectRoot => {
                let path: String = self.read_value().await?;
                if !path.starts_with('/') {
                    return Err(ProtocolError::Daemon(DaemonError::new(
                        DaemonErrorKind::Misc,
                        format!("indirect root '{path}' is not an absolute path"),
                    )));
                }
                self.logger.start_work().await?;
                store.add_indirect_root(&ctx, path).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::AddPermRoot => {
                let path: StorePath = self.read_value().await?;
                let gc_root: String = self.read_value().await?;
                if !gc_root.starts_with('/') {
                    return Err(ProtocolError::Daemon(DaemonError::new(
                        DaemonErrorKind::Misc,
                        format!("garbage collector root '{gc_root}' is not an absolute path"),
                    )));
                }
                self.logger.start_work().await?;
                let link = store.add_perm_root(&ctx, path, gc_root).await?;
                self.logger.stop_work().await?;
                self.write_reply(&link).await
            }

            OpCode::SyncWithGC => {
                self.logger.start_work().await?;
                store.sync_with_gc(&ctx).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::FindRoots => {
                self.logger.start_work().await?;
                let roots = store.find_roots(&ctx).await?;
                self.logger.stop_work().await?;
                self.write_reply(&roots).await
            }

            OpCode::CollectGarbage => {
                let options: GcOptions = self.read_value().await?;
                if options.ignore_liveness && self.trust != TrustLevel::Trusted {
                    return Err(ProtocolError::Daemon(DaemonError::new(
                        DaemonErrorKind::Permission,
                        "you are not allowed to ignore liveness",
                    )));
                }
                self.logger.start_work().await?;
                let result = store.collect_garbage(&ctx, options).await?;
                self.logger.stop_work().await?;
                self.write_reply(&result).await
            }

            OpCode::OptimiseStore => {
                self.logger.start_work().await?;
                store.optimise_store(&ctx).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::VerifyStore => {
                let check_contents: bool = self.read_value().await?;
                let repair: bool = self.read_value().await?;
                self.require_trusted_for(repair, "repairing")?;
                self.logger.start_work().await?;
                let errors = store.verify_store(&ctx, check_contents, repair).await?;
                self.logger.stop_work().await?;
                self.write_reply(&errors).await
            }

            OpCode::AddSignatures => {
                let path: StorePath = self.read_value().await?;
                let signatures: BTreeSet<String> = self.read_value().await?;
                if self.trust != TrustLevel::Trusted {
                    return Err(ProtocolError::Daemon(DaemonError::new(
                        DaemonErrorKind::Permission,
                        "you are not privileged to add signatures",
                    )));
                }
                self.logger.start_work().await?;
                store.add_signatures(&ctx, path, signatures).await?;
                self.logger.stop_work().await?;
                self.write_reply(&1u64).await
            }

            OpCode::SetOptions => {
                let incoming: ClientOptions = self.read_value().await?;
                self.logger.start_work().await?;
                self.apply_options(incoming).await?;
                self.logger.stop_work().await?;
                self.flush_sink().await
            }

            // The callback channel is announced by the daemon, never
            // requested; removed opcodes were filtered above.
            OpCode::InitCallback
            | OpCode::QueryPathHash
            | OpCode::QueryReferences
            | OpCode::AddTextToStore
            | OpCode::ExportPath
            | OpCode::QueryDeriver
            | OpCode::QueryDerivationOutputs
            | OpCode::QueryFailedPaths
            | OpCode::ClearFailedPaths
            | OpCode::ImportPaths
            | OpCode::QueryDerivationOutputNames => {
                Err(ProtocolError::InvalidOpCode(op as u64))
            }
        }
    }

    fn op_context(&self) -> OpContext {
        OpContext::new(
            self.logger.clone(),
            self.trust,
            self.options.clone(),
            self.credentials.clone(),
            self.interrupt.clone(),
        )
    }

    fn require_trusted_for(
        &self,
        requested: bool,
        what: &str,
    ) -> Result<(), ProtocolError> {
        if requested && self.trust != TrustLevel::Trusted {
            return Err(ProtocolError::Daemon(DaemonError::new(
                DaemonErrorKind::Permission,
                format!("{what} is not allowed because you are not in 'trusted-users'"),
            )));
        }
        Ok(())
    }

    /// Apply `SetOptions` under the trust policy: untrusted clients may
    /// only touch a small whitelist, and may only select substituters the
    /// daemon already trusts.
    async fn apply_options(&mut self, incoming: ClientOptions) -> Result<(), ProtocolError> {
        let trusted = self.trust == TrustLevel::Trusted;
        let mut accepted = BTreeMap::new();
        for (name, value) in &incoming.overrides {
            if name == "ssh-auth-sock" {
                continue; // obsolete
            }
            if trusted
                || name == "build-timeout"
                || name == "connect-timeout"
                || (name == "builders" && value.is_empty())
            {
                accepted.insert(name.clone(), value.clone());
            } else if name == "substituters" || name == "extra-substituters" {
                let mut kept = Vec::new();
                for sub in value.split_whitespace() {
                    if self.config.substituters.contains(sub)
                        || self.config.trusted_substituters.contains(sub)
                    {
                        kept.push(sub);
                    } else {
                        self.logger
                            .log(
                                Verbosity::Warn,
                                &format!("ignoring untrusted substituter '{sub}'"),
                            )
                            .await?;
                    }
                }
                accepted.insert(name.clone(), kept.join(" "));
            } else {
                self.logger
                    .log(
                        Verbosity::Warn,
                        &format!(
                            "ignoring the user-specified setting '{name}', \
                             because it is a restricted setting and you are not a trusted user"
                        ),
                    )
                    .await?;
            }
        }
        self.options = ClientOptions {
            overrides: accepted,
            ..incoming
        };
        self.logger.set_verbosity(self.options.verbosity);
        Ok(())
    }

    async fn read_value<T: Deserialize>(&mut self) -> Result<T, ProtocolError> {
        T::deserialize(&mut self.reader, self.version, &self.config.store_dir).await
    }

    async fn write_reply<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let mut sink = self.sink.lock().await;
        value
            .serialize(&mut *sink, self.version, &self.config.store_dir)
            .await?;
        sink.flush().await.map_err(ProtocolError::from)
    }

    async fn flush_sink(&mut self) -> Result<(), ProtocolError> {
        let mut sink = self.sink.lock().await;
        sink.flush().await.map_err(ProtocolError::from)
    }

    async fn write_output_map(
        &mut self,
        map: &BTreeMap<String, Option<StorePath>>,
    ) -> Result<(), ProtocolError> {
        let mut sink = self.sink.lock().await;
        (map.len() as u64)
            .serialize(&mut *sink, self.version, &self.config.store_dir)
            .await?;
        for (name, path) in map {
            name.serialize(&mut *sink, self.version, &self.config.store_dir)
                .await?;
            write_opt_store_path(&mut *sink, path.as_ref(), self.version, &self.config.store_dir)
                .await?;
        }
        sink.flush().await.map_err(ProtocolError::from)
    }

    /// Emit `data` as a run of `WRITE` stderr frames.
    async fn write_data_frames(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut sink = self.sink.lock().await;
        for chunk in data.chunks(TUNNEL_READ_CHUNK as usize) {
            (Msg::Write as u64)
                .serialize(&mut *sink, self.version, &self.config.store_dir)
                .await?;
            write_bytes(&mut *sink, chunk).await?;
        }
        Ok(())
    }

    /// Buffer a framed payload, keeping the stream in sync even when the
    /// payload exceeds the cap.
    async fn read_framed_payload(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut source = FramedSource::new(&mut self.reader);
        let mut payload = Vec::new();
        let mut chunk = vec![0u8; TUNNEL_READ_CHUNK as usize];
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                return Ok(payload);
            }
            if payload.len() as u64 + n as u64 > MAX_BUFFERED_NAR {
                source.consume_to_end().await?;
                return Err(ProtocolError::Daemon(DaemonError::new(
                    DaemonErrorKind::Misc,
                    "archive exceeds the daemon's buffering limit",
                )));
            }
            payload.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pull a payload from the client's source via `READ` frames, 64 KiB
    /// at a time. An empty reply means end of stream.
    async fn read_tunnel_payload(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = Vec::new();
        loop {
            {
                let mut sink = self.sink.lock().await;
                (Msg::Read as u64)
                    .serialize(&mut *sink, self.version, &self.config.store_dir)
                    .await?;
                TUNNEL_READ_CHUNK
                    .serialize(&mut *sink, self.version, &self.config.store_dir)
                    .await?;
                sink.flush().await.map_err(ProtocolError::from)?;
            }
            let chunk = read_bytes_bounded(&mut self.reader, TUNNEL_READ_CHUNK).await?;
            if chunk.is_empty() {
                return Ok(payload);
            }
            if payload.len() as u64 + chunk.len() as u64 > MAX_BUFFERED_NAR {
                return Err(ProtocolError::Daemon(DaemonError::new(
                    DaemonErrorKind::Misc,
                    "archive exceeds the daemon's buffering limit",
                )));
            }
            payload.extend_from_slice(&chunk);
        }
    }
}
