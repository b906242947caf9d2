//! End-to-end tests: a real client against a real dispatcher over
//! in-memory transports, plus a scripted server for failure injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use syrinx_store_core::{
    BasicDerivation, BuildMode, BuildOutcome, BuildResult, BuildStatus, Hash, StoreDir, StorePath,
};
use tokio::io::{duplex, split, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::auth::{AuthData, AuthRequest, CredentialSource};
use crate::client::connection::{client_handshake, Connection};
use crate::client::{DaemonClient, DaemonClientBuilder};
use crate::error::{DaemonError, DaemonErrorKind, ProtocolError};
use crate::protocol::{Msg, ProtocolVersion, Verbosity, PROTOCOL_VERSION};
use crate::serialization::store_types::{UnkeyedValidPathInfo, ValidPathInfo};
use crate::serialization::Serialize;
use crate::server::{
    DaemonServer, DaemonStore, OpContext, ServerConfig, TrustLevel,
};

fn sample_path(name: &str) -> StorePath {
    StorePath::from_base_name(&format!("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-{name}")).unwrap()
}

fn sample_hash() -> Hash {
    Hash::parse("sha256-FePFYIlMuycIXPZbWi7LGEiMmZSX9FMbaQenWBzm1Sc=").unwrap()
}

/// A store over a mutex-guarded map, enough to exercise the dispatcher.
#[derive(Default)]
struct TestStore {
    paths: Mutex<BTreeMap<StorePath, UnkeyedValidPathInfo>>,
    nars: Mutex<BTreeMap<StorePath, Vec<u8>>>,
}

impl TestStore {
    fn with_path(path: StorePath, nar: &[u8]) -> Self {
        let store = TestStore::default();
        let mut info = UnkeyedValidPathInfo::new(sample_hash());
        info.nar_size = nar.len() as u64;
        store.paths.lock().unwrap().insert(path.clone(), info);
        store.nars.lock().unwrap().insert(path, nar.to_vec());
        store
    }
}

impl DaemonStore for TestStore {
    async fn is_valid_path(
        &self,
        _ctx: &OpContext,
        path: StorePath,
    ) -> Result<bool, DaemonError> {
        Ok(self.paths.lock().unwrap().contains_key(&path))
    }

    async fn query_path_info(
        &self,
        _ctx: &OpContext,
        path: StorePath,
    ) -> Result<Option<UnkeyedValidPathInfo>, DaemonError> {
        Ok(self.paths.lock().unwrap().get(&path).cloned())
    }

    async fn query_valid_paths(
        &self,
        _ctx: &OpContext,
        paths: BTreeSet<StorePath>,
        _substitute: bool,
    ) -> Result<BTreeSet<StorePath>, DaemonError> {
        let known = self.paths.lock().unwrap();
        Ok(paths.into_iter().filter(|p| known.contains_key(p)).collect())
    }

    async fn nar_from_path(
        &self,
        _ctx: &OpContext,
        path: StorePath,
    ) -> Result<Vec<u8>, DaemonError> {
        self.nars.lock().unwrap().get(&path).cloned().ok_or_else(|| {
            DaemonError::new(DaemonErrorKind::InvalidPath, format!("path '{path}' is not valid"))
        })
    }

    async fn add_to_store_nar(
        &self,
        _ctx: &OpContext,
        info: ValidPathInfo,
        nar: Vec<u8>,
        _repair: bool,
        _dont_check_sigs: bool,
    ) -> Result<(), DaemonError> {
        self.paths
            .lock()
            .unwrap()
            .insert(info.path.clone(), info.info);
        self.nars.lock().unwrap().insert(info.path, nar);
        Ok(())
    }

    async fn build_derivation(
        &self,
        ctx: &OpContext,
        _drv_path: StorePath,
        drv: BasicDerivation,
        _mode: BuildMode,
    ) -> Result<BuildResult, DaemonError> {
        ctx.logger
            .log(Verbosity::Info, &format!("building '{}'", drv.name))
            .await
            .map_err(|e| DaemonError::new(DaemonErrorKind::Misc, e.to_string()))?;
        Ok(BuildResult::new(BuildOutcome::failure(
            BuildStatus::OutputRejected,
            "no idea why",
        )))
    }

    async fn ensure_path(&self, ctx: &OpContext, path: StorePath) -> Result<(), DaemonError> {
        // Exercises the credential side-channel when it is attached.
        if let Some(credentials) = &ctx.credentials {
            let request = AuthRequest {
                protocol: Some("https".to_owned()),
                host: Some("cache.example.org".to_owned()),
                ..Default::default()
            };
            let data = credentials.fill_or_none(&request, true).await;
            if data.and_then(|d| d.password) != Some("hunter2".to_owned()) {
                return Err(DaemonError::new(
                    DaemonErrorKind::Permission,
                    "substituter rejected our credentials",
                ));
            }
            return Ok(());
        }
        if self.paths.lock().unwrap().contains_key(&path) {
            Ok(())
        } else {
            Err(DaemonError::new(
                DaemonErrorKind::InvalidPath,
                format!("cannot substitute '{path}'"),
            ))
        }
    }
}

type IoClient = DaemonClient<
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
>;

/// Run a store behind an in-memory transport and hand back a negotiated
/// client for it.
async fn connected_pair(
    store: TestStore,
    trust: TrustLevel,
    client_version: ProtocolVersion,
) -> IoClient {
    let (client_io, server_io) = duplex(1 << 20);
    let (server_read, server_write) = split(server_io);
    let server = DaemonServer::new(store, ServerConfig::default());
    tokio::spawn(async move {
        let _ = server.serve_io(server_read, server_write, trust).await;
    });
    let (client_read, client_write) = split(client_io);
    DaemonClientBuilder::new()
        .max_version(client_version)
        .handshake_io(client_read, client_write)
        .await
        .expect("handshake")
}

#[tokio::test]
async fn handshake_settles_on_min_version() {
    let client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        ProtocolVersion::from_parts(1, 30),
    )
    .await;
    assert_eq!(client.version(), ProtocolVersion::from_parts(1, 30));
}

#[tokio::test]
async fn handshake_reports_daemon_version() {
    let client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    let info = client.handshake_info();
    assert!(info.daemon_version.as_deref().unwrap().starts_with("syrinx-daemon"));
}

#[tokio::test]
async fn is_valid_path_round_trip() {
    let path = sample_path("foo");
    let mut client = connected_pair(
        TestStore::with_path(path.clone(), b"nar"),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    assert!(client.is_valid_path(&path).await.unwrap());
    assert!(!client.is_valid_path(&sample_path("missing")).await.unwrap());
    assert!(!client.is_poisoned());
}

#[tokio::test]
async fn query_path_info_missing_is_none() {
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    let info = client.query_path_info(&sample_path("absent")).await.unwrap();
    assert_eq!(info, None);
    assert!(!client.is_poisoned());
}

#[tokio::test]
async fn build_derivation_failure_carries_status() {
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        ProtocolVersion::from_parts(1, 29),
    )
    .await;
    let drv = BasicDerivation {
        name: "foo".into(),
        outputs: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        platform: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: Vec::new(),
        env: BTreeMap::new(),
    };
    let result = client
        .build_derivation(&sample_path("foo.drv"), &drv, BuildMode::Normal)
        .await
        .unwrap();
    match result.outcome {
        BuildOutcome::Failure {
            status, error_msg, ..
        } => {
            assert_eq!(status, BuildStatus::OutputRejected);
            assert_eq!(error_msg, "no idea why");
        }
        BuildOutcome::Success { .. } => panic!("expected failure"),
    }
    assert_eq!(result.times_built, 0);
}

#[tokio::test]
async fn daemon_errors_do_not_poison() {
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    // The default store does not implement garbage collection.
    let err = client
        .collect_garbage(&Default::default())
        .await
        .unwrap_err();
    match err {
        ProtocolError::Daemon(e) => assert_eq!(e.kind, DaemonErrorKind::Unsupported),
        other => panic!("unexpected error: {other}"),
    }
    // The connection survives and serves the next request.
    assert!(!client.is_poisoned());
    assert!(!client.is_valid_path(&sample_path("foo")).await.unwrap());
}

#[tokio::test]
async fn untrusted_repair_is_refused() {
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    let err = client
        .build_paths(&[], BuildMode::Repair)
        .await
        .unwrap_err();
    match err {
        ProtocolError::Daemon(e) => assert_eq!(e.kind, DaemonErrorKind::Permission),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!client.is_poisoned());
}

#[tokio::test]
async fn trusted_repair_reaches_the_store() {
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::Trusted,
        PROTOCOL_VERSION,
    )
    .await;
    // The permission gate passes; the default store then reports the
    // operation as unsupported.
    let err = client
        .build_paths(&[], BuildMode::Repair)
        .await
        .unwrap_err();
    match err {
        ProtocolError::Daemon(e) => assert_eq!(e.kind, DaemonErrorKind::Unsupported),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn nar_streams_through_write_frames() {
    let path = sample_path("foo");
    let nar = vec![0xabu8; 200_000];
    let mut client = connected_pair(
        TestStore::with_path(path.clone(), &nar),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    let mut sink = Vec::new();
    client.nar_from_path(&path, &mut sink).await.unwrap();
    assert_eq!(sink, nar);
}

#[tokio::test]
async fn add_to_store_nar_framed_round_trip() {
    let path = sample_path("imported");
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    let nar = b"pretend this is an archive".to_vec();
    let info = ValidPathInfo {
        path: path.clone(),
        info: UnkeyedValidPathInfo::new(sample_hash()),
    };
    client
        .add_to_store_nar(&info, nar.as_slice(), false, false)
        .await
        .unwrap();
    assert!(client.is_valid_path(&path).await.unwrap());
    let mut fetched = Vec::new();
    client.nar_from_path(&path, &mut fetched).await.unwrap();
    assert_eq!(fetched, nar);
}

#[tokio::test]
async fn add_to_store_nar_via_read_frames() {
    // Below 1.21 the server pulls the archive through READ requests.
    let path = sample_path("old-style");
    let mut client = connected_pair(
        TestStore::default(),
        TrustLevel::NotTrusted,
        ProtocolVersion::from_parts(1, 20),
    )
    .await;
    let nar = vec![7u8; 100_000];
    let info = ValidPathInfo {
        path: path.clone(),
        info: UnkeyedValidPathInfo::new(sample_hash()),
    };
    client
        .add_to_store_nar(&info, nar.as_slice(), false, false)
        .await
        .unwrap();
    assert!(client.is_valid_path(&path).await.unwrap());
}

#[tokio::test]
async fn query_valid_paths_filters() {
    let known = sample_path("known");
    let mut client = connected_pair(
        TestStore::with_path(known.clone(), b"x"),
        TrustLevel::NotTrusted,
        PROTOCOL_VERSION,
    )
    .await;
    let asked: BTreeSet<_> = [known.clone(), sample_path("unknown")].into();
    let got = client.query_valid_paths(&asked, false).await.unwrap();
    assert_eq!(got, [known].into());
}

struct StaticCredentials;

impl CredentialSource for StaticCredentials {
    fn fill(&self, request: &AuthRequest, _required: bool) -> Option<AuthData> {
        assert_eq!(request.host.as_deref(), Some("cache.example.org"));
        Some(AuthData {
            username: Some("builder".to_owned()),
            password: Some("hunter2".to_owned()),
        })
    }

    fn reject(&self, _data: &AuthData) {}
}

#[tokio::test]
async fn credentials_flow_through_the_tunnel() {
    let (client_stream, server_stream) = UnixStream::pair().unwrap();
    let server = DaemonServer::new(TestStore::default(), ServerConfig::default());
    tokio::spawn(async move {
        let _ = server.serve_unix(server_stream, TrustLevel::Trusted).await;
    });
    let mut client = DaemonClientBuilder::new()
        .forward_credentials(Arc::new(StaticCredentials))
        .handshake_unix(client_stream)
        .await
        .unwrap();
    // ensure_path asks the tunnel for credentials and succeeds only when
    // the right password comes back.
    client.ensure_path(&sample_path("fetched")).await.unwrap();
}

#[tokio::test]
async fn tunnel_failure_degrades_to_no_credentials() {
    let (client_stream, server_stream) = UnixStream::pair().unwrap();
    let server = DaemonServer::new(TestStore::default(), ServerConfig::default());
    tokio::spawn(async move {
        let _ = server.serve_unix(server_stream, TrustLevel::Trusted).await;
    });
    // This client never offers auth forwarding, so the server must fall
    // back to treating credentials as absent.
    let mut client = DaemonClientBuilder::new()
        .handshake_unix(client_stream)
        .await
        .unwrap();
    let err = client.ensure_path(&sample_path("fetched")).await.unwrap_err();
    match err {
        ProtocolError::Daemon(e) => assert_eq!(e.kind, DaemonErrorKind::InvalidPath),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn server_hangup_poisons_the_client() {
    let (client_io, server_io) = duplex(1 << 16);
    let config = ServerConfig::default();
    // A scripted server: complete the handshake, then answer one request
    // with LAST and drop the connection before the typed reply.
    tokio::spawn(async move {
        let (mut reader, mut writer) = split(server_io);
        let negotiated = {
            let mut stream = crate::io::Duplex::new(&mut reader, &mut writer);
            crate::server::server_handshake(&mut stream, &config)
                .await
                .unwrap()
        };
        let mut stream = crate::io::Duplex::new(&mut reader, &mut writer);
        crate::server::server_post_handshake(
            &mut stream,
            &config,
            &negotiated,
            TrustLevel::NotTrusted,
        )
        .await
        .unwrap();
        let _op: u64 = <u64 as crate::serialization::Deserialize>::deserialize(
            &mut stream,
            negotiated.version,
            &config.store_dir,
        )
        .await
        .unwrap();
        let _path: Vec<u8> = crate::serialization::read_bytes(&mut stream).await.unwrap();
        (Msg::Last as u64)
            .serialize(&mut stream, negotiated.version, &config.store_dir)
            .await
            .unwrap();
        stream.flush().await.unwrap();
        // Dropping here truncates the reply.
    });

    let (client_read, client_write) = split(client_io);
    let mut client = DaemonClientBuilder::new()
        .handshake_io(client_read, client_write)
        .await
        .unwrap();
    let err = client.is_valid_path(&sample_path("foo")).await.unwrap_err();
    assert!(matches!(err, ProtocolError::UnexpectedEof { .. }));
    assert!(client.is_poisoned());
    // A poisoned connection refuses further requests outright.
    let err = client.is_valid_path(&sample_path("foo")).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Poisoned));
}

#[tokio::test]
async fn unknown_stderr_tag_poisons_the_client() {
    let (client_io, server_io) = duplex(1 << 16);
    let config = ServerConfig::default();
    tokio::spawn(async move {
        let (mut reader, mut writer) = split(server_io);
        let negotiated = {
            let mut stream = crate::io::Duplex::new(&mut reader, &mut writer);
            crate::server::server_handshake(&mut stream, &config)
                .await
                .unwrap()
        };
        let mut stream = crate::io::Duplex::new(&mut reader, &mut writer);
        crate::server::server_post_handshake(
            &mut stream,
            &config,
            &negotiated,
            TrustLevel::NotTrusted,
        )
        .await
        .unwrap();
        let _op: u64 = <u64 as crate::serialization::Deserialize>::deserialize(
            &mut stream,
            negotiated.version,
            &config.store_dir,
        )
        .await
        .unwrap();
        let _path: Vec<u8> = crate::serialization::read_bytes(&mut stream).await.unwrap();
        0xdead_beefu64
            .serialize(&mut stream, negotiated.version, &config.store_dir)
            .await
            .unwrap();
        stream.flush().await.unwrap();
    });

    let (client_read, client_write) = split(client_io);
    let mut client = DaemonClientBuilder::new()
        .handshake_io(client_read, client_write)
        .await
        .unwrap();
    let err = client.is_valid_path(&sample_path("foo")).await.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidMsgCode(0xdead_beef)));
    assert!(client.is_poisoned());
}

#[tokio::test]
async fn truncated_request_closes_the_connection() {
    // A raw client sends a path whose length field promises more bytes
    // than it delivers; the server must give up on the stream.
    let (client_io, server_io) = duplex(1 << 16);
    let (server_read, server_write) = split(server_io);
    let server = DaemonServer::new(TestStore::default(), ServerConfig::default());
    let server_task = tokio::spawn(async move {
        server
            .serve_io(server_read, server_write, TrustLevel::NotTrusted)
            .await
    });

    let (mut reader, mut writer) = split(client_io);
    let negotiated = {
        let mut stream = crate::io::Duplex::new(&mut reader, &mut writer);
        client_handshake(&mut stream, PROTOCOL_VERSION, &BTreeSet::new())
            .await
            .unwrap()
    };
    {
        let mut stream = crate::io::Duplex::new(&mut reader, &mut writer);
        crate::client::client_post_handshake(&mut stream, &negotiated, &StoreDir::default())
            .await
            .unwrap();
    }
    let mut conn = Connection::new(reader, writer, negotiated, StoreDir::default());
    // opcode 26 (QueryPathInfo), then a lying length prefix: the field
    // says 40 bytes but only 8 follow before EOF.
    let raw = async {
        conn.write_op(crate::protocol::OpCode::QueryPathInfo).await?;
        conn.write_value(&40u64).await?;
        conn.write_value(&0u64).await?;
        conn.flush().await
    }
    .await;
    raw.unwrap();
    drop(conn);

    let outcome = server_task.await.unwrap();
    assert!(matches!(
        outcome,
        Err(ProtocolError::UnexpectedEof { .. })
    ));
}
