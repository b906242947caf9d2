//! End-to-end daemon tests over a real Unix socket.

use std::sync::Arc;

use syrinx_daemon::config::Config;
use syrinx_daemon::peer::decide_trust;
use syrinx_daemon::store::MemoryStore;
use syrinx_protocol::client::DaemonClientBuilder;
use syrinx_protocol::serialization::store_types::{UnkeyedValidPathInfo, ValidPathInfo};
use syrinx_protocol::server::{DaemonServer, ServerConfig};
use syrinx_store_core::{Hash, StoreDir, StorePath};
use tokio::net::UnixListener;

fn sample_path(name: &str) -> StorePath {
    StorePath::from_base_name(&format!("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-{name}")).unwrap()
}

fn sample_info() -> UnkeyedValidPathInfo {
    UnkeyedValidPathInfo::new(
        Hash::parse("sha256-FePFYIlMuycIXPZbWi7LGEiMmZSX9FMbaQenWBzm1Sc=").unwrap(),
    )
}

#[tokio::test]
async fn serves_over_a_real_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = DaemonServer::new(
        MemoryStore::new(StoreDir::default()),
        ServerConfig::default(),
    );
    let config = Config::default();
    let policy = Arc::new(move |peer: &tokio::net::unix::UCred| decide_trust(&config, peer));
    tokio::spawn(async move {
        let _ = server.serve(listener, policy).await;
    });

    let mut client = DaemonClientBuilder::new()
        .socket_path(&socket_path)
        .connect()
        .await
        .unwrap();

    let path = sample_path("hello");
    assert!(!client.is_valid_path(&path).await.unwrap());

    let info = ValidPathInfo {
        path: path.clone(),
        info: sample_info(),
    };
    client
        .add_to_store_nar(&info, &b"hello archive"[..], false, false)
        .await
        .unwrap();
    assert!(client.is_valid_path(&path).await.unwrap());

    let fetched = client.query_path_info(&path).await.unwrap().unwrap();
    assert_eq!(fetched.nar_hash, sample_info().nar_hash);

    let mut nar = Vec::new();
    client.nar_from_path(&path, &mut nar).await.unwrap();
    assert_eq!(nar, b"hello archive");

    client.close().await.unwrap();
}

#[tokio::test]
async fn gc_roots_persist_across_requests() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = DaemonServer::new(
        MemoryStore::new(StoreDir::default()),
        ServerConfig::default(),
    );
    // Trust everyone in this test; root registration is not gated anyway.
    let policy = Arc::new(
        |_: &tokio::net::unix::UCred| -> Result<syrinx_protocol::TrustLevel, String> {
            Ok(syrinx_protocol::TrustLevel::Trusted)
        },
    );
    tokio::spawn(async move {
        let _ = server.serve(listener, policy).await;
    });

    let mut client = DaemonClientBuilder::new()
        .socket_path(&socket_path)
        .connect()
        .await
        .unwrap();

    let path = sample_path("rooted");
    let info = ValidPathInfo {
        path: path.clone(),
        info: sample_info(),
    };
    client
        .add_to_store_nar(&info, &b"x"[..], false, false)
        .await
        .unwrap();
    let link = client
        .add_perm_root(&path, "/home/alice/result")
        .await
        .unwrap();
    assert_eq!(link, "/home/alice/result");

    let roots = client.find_roots().await.unwrap();
    assert_eq!(roots.get("/home/alice/result"), Some(&path));

    // Relative indirect roots are refused outright.
    let err = client.add_indirect_root("result").await.unwrap_err();
    assert!(matches!(err, syrinx_protocol::ProtocolError::Daemon(_)));
    assert!(!client.is_poisoned());
}

#[tokio::test]
async fn pool_reuses_connections() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = DaemonServer::new(
        MemoryStore::new(StoreDir::default()),
        ServerConfig::default(),
    );
    let policy = Arc::new(
        |_: &tokio::net::unix::UCred| -> Result<syrinx_protocol::TrustLevel, String> {
            Ok(syrinx_protocol::TrustLevel::NotTrusted)
        },
    );
    tokio::spawn(async move {
        let _ = server.serve(listener, policy).await;
    });

    let pool = syrinx_protocol::ConnectionPool::new(
        &socket_path,
        StoreDir::default(),
        syrinx_protocol::PoolConfig {
            max_size: 2,
            ..Default::default()
        },
    );

    let path = sample_path("pooled");
    {
        let mut guard = pool.acquire().await.unwrap();
        assert!(!guard.client().is_valid_path(&path).await.unwrap());
    }
    // The slot returned; a second acquire reuses the same connection.
    {
        let mut guard = pool.acquire().await.unwrap();
        assert!(!guard.client().is_valid_path(&path).await.unwrap());
    }
    // Two concurrent guards still fit the capacity.
    let mut first = pool.acquire().await.unwrap();
    let mut second = pool.acquire().await.unwrap();
    assert!(!first.client().is_valid_path(&path).await.unwrap());
    assert!(!second.client().is_valid_path(&path).await.unwrap());
}
