//! The daemon side of the protocol: handshake, dispatcher, tunnel logger
//! and the credential side-channel.

pub mod auth;
pub mod connection;
pub mod handler;
pub mod logger;

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncWrite, BufWriter};
use tokio::net::unix::UCred;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

pub use auth::TunneledCredentials;
pub use connection::{server_handshake, server_post_handshake, ServerConnection};
pub use handler::{DaemonStore, OpContext, TrustLevel};
pub use logger::TunnelLogger;

use crate::error::ProtocolError;
use crate::protocol::{ProtocolVersion, FEATURE_AUTH_FORWARDING, PROTOCOL_VERSION};

/// Static configuration of a serving daemon.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub store_dir: StoreDir,
    pub max_version: ProtocolVersion,
    pub features: BTreeSet<String>,
    /// Reported to clients in the post-handshake metadata.
    pub daemon_version: String,
    /// Substituters the daemon uses by default.
    pub substituters: BTreeSet<String>,
    /// Substituters untrusted clients may additionally select.
    pub trusted_substituters: BTreeSet<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            store_dir: StoreDir::default(),
            max_version: PROTOCOL_VERSION,
            features: [FEATURE_AUTH_FORWARDING.to_owned()].into(),
            daemon_version: format!("syrinx-daemon {}", env!("CARGO_PKG_VERSION")),
            substituters: BTreeSet::new(),
            trusted_substituters: BTreeSet::new(),
        }
    }
}

/// Decides, from peer credentials, whether a connection may proceed and
/// with which trust level. Returning `Err` rejects the connection with
/// the given message.
pub trait TrustPolicy: Send + Sync + 'static {
    fn decide(&self, peer: &UCred) -> Result<TrustLevel, String>;
}

impl<F> TrustPolicy for F
where
    F: Fn(&UCred) -> Result<TrustLevel, String> + Send + Sync + 'static,
{
    fn decide(&self, peer: &UCred) -> Result<TrustLevel, String> {
        self(peer)
    }
}

/// Accepts connections and runs one dispatcher per client. The store is
/// shared; per-connection state never is.
pub struct DaemonServer<S> {
    store: Arc<S>,
    config: Arc<ServerConfig>,
    interrupt: Arc<AtomicBool>,
}

impl<S: DaemonStore> DaemonServer<S> {
    pub fn new(store: S, config: ServerConfig) -> Self {
        DaemonServer {
            store: Arc::new(store),
            config: Arc::new(config),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The flag handlers poll at their interrupt checkpoints. Setting it
    /// makes in-flight operations fail with an interruption error.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Accept loop: one task per connection, trust decided at accept time
    /// from `SO_PEERCRED`.
    pub async fn serve(
        &self,
        listener: UnixListener,
        policy: Arc<dyn TrustPolicy>,
    ) -> Result<(), ProtocolError> {
        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .map_err(|e| ProtocolError::io("accepting connection", e))?;
            let peer = stream
                .peer_cred()
                .map_err(|e| ProtocolError::io("reading peer credentials", e))?;
            let trust = match policy.decide(&peer) {
                Ok(trust) => trust,
                Err(reason) => {
                    warn!("{reason}");
                    continue;
                }
            };
            info!(
                pid = peer.pid().unwrap_or(0),
                uid = peer.uid(),
                trusted = trust == TrustLevel::Trusted,
                "accepted connection"
            );
            let store = self.store.clone();
            let config = self.config.clone();
            let interrupt = self.interrupt.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    serve_unix_connection(stream, store, config, trust, interrupt).await
                {
                    warn!("connection failed: {err}");
                }
            });
        }
    }

    /// Serve one already-accepted Unix stream with a pre-decided trust
    /// level.
    pub async fn serve_unix(
        &self,
        stream: UnixStream,
        trust: TrustLevel,
    ) -> Result<(), ProtocolError> {
        serve_unix_connection(
            stream,
            self.store.clone(),
            self.config.clone(),
            trust,
            self.interrupt.clone(),
        )
        .await
    }

    /// Serve a single bidirectional byte stream, e.g. stdio under an SSH
    /// session. No descriptors can pass here, so the credential channel
    /// is not offered.
    pub async fn serve_io<R, W>(
        &self,
        reader: R,
        writer: W,
        trust: TrustLevel,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut config = (*self.config).clone();
        config.features.remove(FEATURE_AUTH_FORWARDING);
        serve_split_connection(
            reader,
            writer,
            Arc::new(config),
            self.store.clone(),
            trust,
            self.interrupt.clone(),
        )
        .await
    }
}

async fn serve_unix_connection<S: DaemonStore>(
    mut stream: UnixStream,
    store: Arc<S>,
    config: Arc<ServerConfig>,
    trust: TrustLevel,
    interrupt: Arc<AtomicBool>,
) -> Result<(), ProtocolError> {
    let negotiated = server_handshake(&mut stream, &config).await?;
    server_post_handshake(&mut stream, &config, &negotiated, trust).await?;

    let credentials = if negotiated.version.minor >= 38
        && negotiated.features.contains(FEATURE_AUTH_FORWARDING)
        && trust == TrustLevel::Trusted
    {
        match auth::establish_tunnel(&mut stream, negotiated.version, &config.store_dir).await {
            Ok(tunnel) => Some(Arc::new(tunnel)),
            Err(err) => {
                // Credentials degrade to absent; the connection goes on.
                debug!("credential tunnel setup failed: {err}");
                None
            }
        }
    } else {
        None
    };

    let (reader, writer) = stream.into_split();
    let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(BufWriter::new(writer));
    let conn = ServerConnection::new(
        reader,
        writer,
        negotiated,
        trust,
        credentials,
        config,
        interrupt,
    );
    conn.process_requests(store).await
}

async fn serve_split_connection<S, R, W>(
    mut reader: R,
    mut writer: W,
    config: Arc<ServerConfig>,
    store: Arc<S>,
    trust: TrustLevel,
    interrupt: Arc<AtomicBool>,
) -> Result<(), ProtocolError>
where
    S: DaemonStore,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let negotiated = {
        let mut duplex = crate::io::Duplex::new(&mut reader, &mut writer);
        server_handshake(&mut duplex, &config).await?
    };
    {
        let mut duplex = crate::io::Duplex::new(&mut reader, &mut writer);
        server_post_handshake(&mut duplex, &config, &negotiated, trust).await?;
    }
    let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(BufWriter::new(writer));
    let conn = ServerConnection::new(reader, writer, negotiated, trust, None, config, interrupt);
    conn.process_requests(store).await
}
