//! The daemon client: typed request methods over one connection.

pub mod auth;
pub mod connection;
pub mod metrics;
pub mod pool;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use syrinx_store_core::{
    BasicDerivation, BuildMode, BuildResult, DerivedPath, DrvOutput, KeyedBuildResult, Realisation,
    StoreDir, StorePath,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

pub use crate::protocol::Negotiated;
pub use connection::{client_handshake, client_post_handshake, Connection};
pub use metrics::PoolMetrics;
pub use pool::{ConnectionPool, PoolConfig, PooledConnectionGuard};

use crate::auth::{CredentialSource, NoCredentials};
use crate::error::{DaemonErrorKind, ProtocolError};
use crate::protocol::{OpCode, ProtocolVersion, FEATURE_AUTH_FORWARDING, PROTOCOL_VERSION};
use crate::serialization::gc::{GcOptions, GcResult, Roots};
use crate::serialization::handshake::ClientHandshakeInfo;
use crate::serialization::missing::Missing;
use crate::serialization::options::ClientOptions;
use crate::serialization::store_types::{UnkeyedValidPathInfo, ValidPathInfo};
use crate::serialization::substitutable::{SubstitutablePathInfo, SubstitutablePathInfos};
use crate::serialization::{Deserialize, Serialize};
use syrinx_store_core::TrustedFlag;

/// Configures and establishes daemon connections.
pub struct DaemonClientBuilder {
    socket_path: PathBuf,
    store_dir: StoreDir,
    local_version: ProtocolVersion,
    features: BTreeSet<String>,
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl Default for DaemonClientBuilder {
    fn default() -> Self {
        DaemonClientBuilder {
            socket_path: PathBuf::from("/nix/var/nix/daemon-socket/socket"),
            store_dir: StoreDir::default(),
            local_version: PROTOCOL_VERSION,
            features: BTreeSet::new(),
            credentials: None,
        }
    }
}

impl DaemonClientBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.socket_path = path.as_ref().to_owned();
        self
    }

    pub fn store_dir(mut self, store_dir: StoreDir) -> Self {
        self.store_dir = store_dir;
        self
    }

    pub fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.local_version = version;
        self
    }

    /// Offer the credential side-channel during negotiation and answer
    /// its queries from `source`.
    pub fn forward_credentials(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.features.insert(FEATURE_AUTH_FORWARDING.to_owned());
        self.credentials = Some(source);
        self
    }

    /// Connect over the Unix socket and negotiate.
    pub async fn connect(self) -> Result<UnixDaemonClient, ProtocolError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| {
                ProtocolError::io(format!("connecting to {:?}", self.socket_path), e)
            })?;
        self.handshake_unix(stream).await
    }

    /// Negotiate over an already-connected Unix stream.
    pub async fn handshake_unix(
        self,
        mut stream: UnixStream,
    ) -> Result<UnixDaemonClient, ProtocolError> {
        let negotiated =
            client_handshake(&mut stream, self.local_version, &self.features).await?;
        let info = client_post_handshake(&mut stream, &negotiated, &self.store_dir).await?;
        debug!(daemon_version = ?info.daemon_version, "connected");

        // The credential tunnel is established while the raw socket is
        // still whole; descriptors cannot cross buffered readers.
        if negotiated.version.minor >= 38
            && negotiated.features.contains(FEATURE_AUTH_FORWARDING)
            && info.remote_trusts_us == Some(TrustedFlag::Trusted)
        {
            let source = self
                .credentials
                .clone()
                .unwrap_or_else(|| Arc::new(NoCredentials));
            auth::accept_tunnel(&mut stream, negotiated.version, &self.store_dir, source).await?;
        }

        let (reader, writer) = stream.into_split();
        Ok(DaemonClient {
            conn: Connection::new(reader, writer, negotiated, self.store_dir),
            handshake_info: info,
        })
    }

    /// Negotiate over an existing transport, e.g. the stdio of an SSH
    /// tunnel. Feature gating disables fd passing on such transports.
    pub async fn handshake_io<R, W>(
        self,
        mut reader: R,
        mut writer: W,
    ) -> Result<DaemonClient<R, W>, ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let negotiated = {
            let mut duplex = crate::io::Duplex::new(&mut reader, &mut writer);
            client_handshake(&mut duplex, self.local_version, &self.features).await?
        };
        let info = {
            let mut duplex = crate::io::Duplex::new(&mut reader, &mut writer);
            client_post_handshake(&mut duplex, &negotiated, &self.store_dir).await?
        };
        Ok(DaemonClient {
            conn: Connection::new(reader, writer, negotiated, self.store_dir),
            handshake_info: info,
        })
    }
}

pub type UnixDaemonClient = DaemonClient<OwnedReadHalf, OwnedWriteHalf>;

/// A negotiated client. One request runs at a time; requests are strictly
/// serial on the wire.
#[derive(Debug)]
pub struct DaemonClient<R, W> {
    conn: Connection<R, W>,
    handshake_info: ClientHandshakeInfo,
}

macro_rules! request {
    ($self:ident, $body:expr) => {{
        $self.conn.check_ready()?;
        let result = $body.await;
        $self.conn.settle(result)
    }};
}

impl<R, W> DaemonClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn version(&self) -> ProtocolVersion {
        self.conn.version()
    }

    pub fn handshake_info(&self) -> &ClientHandshakeInfo {
        &self.handshake_info
    }

    pub fn is_poisoned(&self) -> bool {
        self.conn.is_poisoned()
    }

    pub fn store_dir(&self) -> &StoreDir {
        self.conn.store_dir()
    }

    /// Signal orderly shutdown by half-closing the outbound direction.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.conn.close_write().await
    }

    /// The plain request shape: opcode, arguments, stderr pump, one typed
    /// reply.
    async fn simple_call<Req, Resp>(&mut self, op: OpCode, args: &Req) -> Result<Resp, ProtocolError>
    where
        Req: Serialize + ?Sized,
        Resp: Deserialize,
    {
        self.conn.check_ready()?;
        let result = async {
            self.conn.write_op(op).await?;
            self.conn.write_value(args).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        }
        .await;
        self.conn.settle(result)
    }

    pub async fn set_options(&mut self, options: &ClientOptions) -> Result<(), ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::SetOptions).await?;
            self.conn.write_value(options).await?;
            self.conn.process_stderr().await
        })
    }

    pub async fn is_valid_path(&mut self, path: &StorePath) -> Result<bool, ProtocolError> {
        self.simple_call(OpCode::IsValidPath, path).await
    }

    pub async fn has_substitutes(&mut self, path: &StorePath) -> Result<bool, ProtocolError> {
        self.simple_call(OpCode::HasSubstitutes, path).await
    }

    pub async fn query_referrers(
        &mut self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        self.simple_call(OpCode::QueryReferrers, path).await
    }

    pub async fn query_valid_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
        substitute: bool,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::QueryValidPaths).await?;
            self.conn.write_value(paths).await?;
            if self.conn.version().minor >= 27 {
                self.conn.write_value(&substitute).await?;
            }
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn query_all_valid_paths(&mut self) -> Result<BTreeSet<StorePath>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::QueryAllValidPaths).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn query_path_info(
        &mut self,
        path: &StorePath,
    ) -> Result<Option<UnkeyedValidPathInfo>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::QueryPathInfo).await?;
            self.conn.write_value(path).await?;
            if self.conn.version().minor >= 17 {
                self.conn.process_stderr().await?;
                self.conn.read_value().await
            } else {
                // Older servers report a missing path as an error.
                match self.conn.process_stderr().await {
                    Ok(()) => Ok(Some(self.conn.read_value().await?)),
                    Err(ProtocolError::Daemon(e)) if e.kind == DaemonErrorKind::InvalidPath => {
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        })
    }

    pub async fn query_path_from_hash_part(
        &mut self,
        hash_part: &str,
    ) -> Result<Option<StorePath>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::QueryPathFromHashPart).await?;
            self.conn.write_value(hash_part).await?;
            self.conn.process_stderr().await?;
            self.conn.read_opt_store_path().await
        })
    }

    pub async fn query_substitutable_paths(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        self.simple_call(OpCode::QuerySubstitutablePaths, paths).await
    }

    pub async fn query_substitutable_path_info(
        &mut self,
        path: &StorePath,
    ) -> Result<Option<SubstitutablePathInfo>, ProtocolError> {
        self.simple_call(OpCode::QuerySubstitutablePathInfo, path)
            .await
    }

    pub async fn query_substitutable_path_infos(
        &mut self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<SubstitutablePathInfos, ProtocolError> {
        self.simple_call(OpCode::QuerySubstitutablePathInfos, paths)
            .await
    }

    pub async fn query_valid_derivers(
        &mut self,
        path: &StorePath,
    ) -> Result<BTreeSet<StorePath>, ProtocolError> {
        self.simple_call(OpCode::QueryValidDerivers, path).await
    }

    pub async fn query_derivation_output_map(
        &mut self,
        drv_path: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::QueryDerivationOutputMap).await?;
            self.conn.write_value(drv_path).await?;
            self.conn.process_stderr().await?;
            self.conn.read_output_map().await
        })
    }

    pub async fn query_missing(
        &mut self,
        targets: &[DerivedPath],
    ) -> Result<Missing, ProtocolError> {
        self.simple_call(OpCode::QueryMissing, &targets.to_vec()).await
    }

    pub async fn register_drv_output(
        &mut self,
        realisation: &Realisation,
    ) -> Result<(), ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::RegisterDrvOutput).await?;
            if self.conn.version().minor >= 31 {
                self.conn.write_value(realisation).await?;
            } else {
                self.conn.write_value(&realisation.id).await?;
                self.conn.write_value(&realisation.out_path).await?;
            }
            self.conn.process_stderr().await
        })
    }

    pub async fn query_realisation(
        &mut self,
        id: &DrvOutput,
    ) -> Result<BTreeSet<Realisation>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::QueryRealisation).await?;
            self.conn.write_value(&id.to_string()).await?;
            self.conn.process_stderr().await?;
            if self.conn.version().minor >= 31 {
                self.conn.read_value().await
            } else {
                let paths: BTreeSet<StorePath> = self.conn.read_value().await?;
                Ok(paths
                    .into_iter()
                    .map(|out_path| Realisation {
                        id: id.clone(),
                        out_path,
                        signatures: Default::default(),
                        dependent_realisations: Default::default(),
                    })
                    .collect())
            }
        })
    }

    /// Upload a content-addressed object. The payload streams through the
    /// framed encoding; requires 1.25.
    pub async fn add_to_store<S>(
        &mut self,
        name: &str,
        method_algo: &str,
        references: &BTreeSet<StorePath>,
        repair: bool,
        source: S,
    ) -> Result<ValidPathInfo, ProtocolError>
    where
        S: AsyncRead + Unpin,
    {
        request!(self, async {
            self.conn.write_op(OpCode::AddToStore).await?;
            self.conn.write_value(name).await?;
            self.conn.write_value(method_algo).await?;
            self.conn.write_value(references).await?;
            self.conn.write_value(&repair).await?;
            self.conn.flush().await?;
            self.conn.send_framed(source).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    /// Import a store object with pre-computed metadata. From 1.21 the
    /// archive streams through the framed encoding; before that the server
    /// pulls it through `READ` frames.
    pub async fn add_to_store_nar<S>(
        &mut self,
        info: &ValidPathInfo,
        mut source: S,
        repair: bool,
        dont_check_sigs: bool,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + Unpin,
    {
        request!(self, async {
            self.conn.write_op(OpCode::AddToStoreNar).await?;
            self.conn.write_value(&info.path).await?;
            self.conn.write_value(&info.info).await?;
            self.conn.write_value(&repair).await?;
            self.conn.write_value(&dont_check_sigs).await?;
            if self.conn.version().minor >= 21 {
                self.conn.flush().await?;
                self.conn.send_framed(source).await?;
                self.conn.process_stderr().await
            } else {
                self.conn
                    .process_stderr_with(Option::<&mut Vec<u8>>::None, Some(&mut source))
                    .await
            }
        })
    }

    pub async fn build_paths(
        &mut self,
        paths: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<(), ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::BuildPaths).await?;
            self.conn.write_value(&paths.to_vec()).await?;
            if self.conn.version().minor >= 15 {
                self.conn.write_value(&mode).await?;
            }
            self.conn.process_stderr().await?;
            let _: u64 = self.conn.read_value().await?;
            Ok(())
        })
    }

    pub async fn build_paths_with_results(
        &mut self,
        paths: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<Vec<KeyedBuildResult>, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::BuildPathsWithResults).await?;
            self.conn.write_value(&paths.to_vec()).await?;
            self.conn.write_value(&mode).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn build_derivation(
        &mut self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        mode: BuildMode,
    ) -> Result<BuildResult, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::BuildDerivation).await?;
            self.conn.write_value(drv_path).await?;
            self.conn.write_value(drv).await?;
            self.conn.write_value(&mode).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn ensure_path(&mut self, path: &StorePath) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_call(OpCode::EnsurePath, path).await?;
        Ok(())
    }

    pub async fn add_temp_root(&mut self, path: &StorePath) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_call(OpCode::AddTempRoot, path).await?;
        Ok(())
    }

    /// Register an indirect root. `path` must be absolute.
    pub async fn add_indirect_root(&mut self, path: &str) -> Result<(), ProtocolError> {
        let _: u64 = self.simple_call(OpCode::AddIndirectRoot, path).await?;
        Ok(())
    }

    pub async fn add_perm_root(
        &mut self,
        path: &StorePath,
        gc_root: &str,
    ) -> Result<String, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::AddPermRoot).await?;
            self.conn.write_value(path).await?;
            self.conn.write_value(gc_root).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn sync_with_gc(&mut self) -> Result<(), ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::SyncWithGC).await?;
            self.conn.process_stderr().await?;
            let _: u64 = self.conn.read_value().await?;
            Ok(())
        })
    }

    pub async fn find_roots(&mut self) -> Result<Roots, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::FindRoots).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn collect_garbage(&mut self, options: &GcOptions) -> Result<GcResult, ProtocolError> {
        self.simple_call(OpCode::CollectGarbage, options).await
    }

    pub async fn optimise_store(&mut self) -> Result<(), ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::OptimiseStore).await?;
            self.conn.process_stderr().await?;
            let _: u64 = self.conn.read_value().await?;
            Ok(())
        })
    }

    pub async fn verify_store(
        &mut self,
        check_contents: bool,
        repair: bool,
    ) -> Result<bool, ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::VerifyStore).await?;
            self.conn.write_value(&check_contents).await?;
            self.conn.write_value(&repair).await?;
            self.conn.process_stderr().await?;
            self.conn.read_value().await
        })
    }

    pub async fn add_signatures(
        &mut self,
        path: &StorePath,
        signatures: &BTreeSet<String>,
    ) -> Result<(), ProtocolError> {
        request!(self, async {
            self.conn.write_op(OpCode::AddSignatures).await?;
            self.conn.write_value(path).await?;
            self.conn.write_value(signatures).await?;
            self.conn.process_stderr().await?;
            let _: u64 = self.conn.read_value().await?;
            Ok(())
        })
    }

    /// Upload a build log for `path`; the body streams framed.
    pub async fn add_build_log<S>(&mut self, path: &StorePath, source: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + Unpin,
    {
        request!(self, async {
            self.conn.write_op(OpCode::AddBuildLog).await?;
            self.conn.write_value(path).await?;
            self.conn.flush().await?;
            self.conn.send_framed(source).await?;
            self.conn.process_stderr().await?;
            let _: u64 = self.conn.read_value().await?;
            Ok(())
        })
    }

    /// Stream the archive serialisation of `path` into `sink`.
    pub async fn nar_from_path<SK>(
        &mut self,
        path: &StorePath,
        sink: &mut SK,
    ) -> Result<(), ProtocolError>
    where
        SK: AsyncWrite + Unpin,
    {
        request!(self, async {
            self.conn.write_op(OpCode::NarFromPath).await?;
            self.conn.write_value(path).await?;
            self.conn
                .process_stderr_with(Some(sink), Option::<&mut &[u8]>::None)
                .await
        })
    }
}

