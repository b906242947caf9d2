//! Handshake laws: agreement, truncation, corruption and feature
//! negotiation.

use std::collections::BTreeSet;

use syrinx_protocol::client::{client_handshake, Negotiated};
use syrinx_protocol::error::ProtocolError;
use syrinx_protocol::io::Duplex;
use syrinx_protocol::protocol::{ProtocolVersion, PROTOCOL_VERSION};
use syrinx_protocol::server::{server_handshake, ServerConfig};
use tokio::io::{duplex, split, AsyncWriteExt};

async fn run_handshake(
    client_version: ProtocolVersion,
    server_version: ProtocolVersion,
    client_features: &BTreeSet<String>,
    server_features: &BTreeSet<String>,
) -> (Negotiated, Negotiated) {
    let (client_io, server_io) = duplex(1 << 16);
    let server_features = server_features.clone();
    let server_task = tokio::spawn(async move {
        let (mut reader, mut writer) = split(server_io);
        let mut stream = Duplex::new(&mut reader, &mut writer);
        let config = ServerConfig {
            max_version: server_version,
            features: server_features,
            ..Default::default()
        };
        server_handshake(&mut stream, &config).await
    });
    let (mut reader, mut writer) = split(client_io);
    let mut stream = Duplex::new(&mut reader, &mut writer);
    let client = client_handshake(&mut stream, client_version, client_features)
        .await
        .expect("client handshake");
    let server = server_task.await.unwrap().expect("server handshake");
    (client, server)
}

#[tokio::test]
async fn both_sides_agree_on_the_minimum() {
    for client_minor in [10u8, 14, 21, 26, 30, 33, 35, 38] {
        for server_minor in [10u8, 14, 21, 26, 30, 33, 35, 38] {
            let cv = ProtocolVersion::from_parts(1, client_minor);
            let sv = ProtocolVersion::from_parts(1, server_minor);
            let (client, server) =
                run_handshake(cv, sv, &BTreeSet::new(), &BTreeSet::new()).await;
            let expected = cv.min(sv);
            assert_eq!(client.version, expected);
            assert_eq!(server.version, expected);
        }
    }
}

#[tokio::test]
async fn features_intersect() {
    let client_features: BTreeSet<String> =
        ["bar", "aap", "mies", "xyzzy"].map(str::to_owned).into();
    let server_features: BTreeSet<String> = ["foo", "bar", "xyzzy"].map(str::to_owned).into();
    let (client, server) = run_handshake(
        PROTOCOL_VERSION,
        PROTOCOL_VERSION,
        &client_features,
        &server_features,
    )
    .await;
    let expected: BTreeSet<String> = ["bar", "xyzzy"].map(str::to_owned).into();
    assert_eq!(client.features, expected);
    assert_eq!(server.features, expected);
}

#[tokio::test]
async fn no_features_below_1_33() {
    let features: BTreeSet<String> = ["xyzzy".to_owned()].into();
    let (client, server) = run_handshake(
        ProtocolVersion::from_parts(1, 32),
        PROTOCOL_VERSION,
        &features,
        &features,
    )
    .await;
    assert!(client.features.is_empty());
    assert!(server.features.is_empty());
}

/// The full server→client handshake prefix at 1.30: magic, then version.
fn server_reply_bytes(version: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x6478696fu64.to_le_bytes());
    bytes.extend_from_slice(&version.to_le_bytes());
    bytes
}

async fn client_against_canned(reply: &[u8]) -> Result<Negotiated, ProtocolError> {
    let mut reader = std::io::Cursor::new(reply.to_vec());
    let mut writer = Vec::new();
    let mut stream = Duplex::new(&mut reader, &mut writer);
    client_handshake(&mut stream, ProtocolVersion::from_parts(1, 30), &BTreeSet::new()).await
}

#[tokio::test]
async fn truncated_magic_is_eof() {
    let reply = server_reply_bytes(0x11e);
    for cut in 0..8 {
        let err = client_against_canned(&reply[..cut]).await.unwrap_err();
        assert!(
            matches!(err, ProtocolError::UnexpectedEof { .. }),
            "cut at {cut}: {err}"
        );
    }
}

#[tokio::test]
async fn truncated_version_is_eof() {
    let reply = server_reply_bytes(0x11e);
    for cut in 8..16 {
        let err = client_against_canned(&reply[..cut]).await.unwrap_err();
        assert!(
            matches!(err, ProtocolError::UnexpectedEof { .. }),
            "cut at {cut}: {err}"
        );
    }
}

#[tokio::test]
async fn complete_reply_negotiates() {
    // An older server: the client degrades to its version.
    let negotiated = client_against_canned(&server_reply_bytes(0x114)).await.unwrap();
    assert_eq!(negotiated.version, ProtocolVersion::from_parts(1, 20));
}

#[tokio::test]
async fn corrupted_magic_is_a_protocol_error() {
    let reply = server_reply_bytes(0x11e);
    for bit in 0..64 {
        let mut corrupted = reply.clone();
        corrupted[bit / 8] ^= 1 << (bit % 8);
        let err = client_against_canned(&corrupted).await.unwrap_err();
        assert!(
            matches!(err, ProtocolError::InvalidMagic { .. }),
            "bit {bit}: {err}"
        );
    }
}

#[tokio::test]
async fn corrupted_version_negotiates_or_rejects() {
    let reply = server_reply_bytes(0x11e);
    for bit in 64..128 {
        let mut corrupted = reply.clone();
        corrupted[bit / 8] ^= 1 << (bit % 8);
        match client_against_canned(&corrupted).await {
            // Still major 1 and at least 1.10: the min rule applies.
            Ok(negotiated) => {
                assert!(negotiated.version <= ProtocolVersion::from_parts(1, 30));
                assert!(negotiated.version >= ProtocolVersion::from_parts(1, 10));
            }
            Err(ProtocolError::IncompatibleVersion { .. }) => {}
            Err(other) => panic!("bit {bit}: unexpected error {other}"),
        }
    }
}

#[tokio::test]
async fn wrong_client_magic_is_rejected_by_the_server() {
    let (client_io, server_io) = duplex(1 << 16);
    let server_task = tokio::spawn(async move {
        let (mut reader, mut writer) = split(server_io);
        let mut stream = Duplex::new(&mut reader, &mut writer);
        server_handshake(&mut stream, &ServerConfig::default()).await
    });
    let (_reader, mut writer) = split(client_io);
    writer.write_all(&0xdeadbeefu64.to_le_bytes()).await.unwrap();
    writer.write_all(&0x11eu64.to_le_bytes()).await.unwrap();
    writer.flush().await.unwrap();
    let err = server_task.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidMagic { .. }));
}

#[tokio::test]
async fn ancient_client_is_rejected() {
    let (client_io, server_io) = duplex(1 << 16);
    let server_task = tokio::spawn(async move {
        let (mut reader, mut writer) = split(server_io);
        let mut stream = Duplex::new(&mut reader, &mut writer);
        server_handshake(&mut stream, &ServerConfig::default()).await
    });
    let (_reader, mut writer) = split(client_io);
    writer.write_all(&0x6e697863u64.to_le_bytes()).await.unwrap();
    // 1.9 predates the supported range.
    writer.write_all(&0x109u64.to_le_bytes()).await.unwrap();
    writer.flush().await.unwrap();
    let err = server_task.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::IncompatibleVersion { .. }));
}

#[tokio::test]
async fn client_emits_the_documented_bytes() {
    // Scenario: both sides at 1.30, no features.
    let reply = server_reply_bytes(0x11e);
    let mut reader = std::io::Cursor::new(reply);
    let mut writer = Vec::new();
    {
        let mut stream = Duplex::new(&mut reader, &mut writer);
        client_handshake(
            &mut stream,
            ProtocolVersion::from_parts(1, 30),
            &BTreeSet::new(),
        )
        .await
        .unwrap();
    }
    let mut expected = Vec::new();
    expected.extend_from_slice(&0x6e697863u64.to_le_bytes());
    expected.extend_from_slice(&0x11eu64.to_le_bytes());
    expected.extend_from_slice(&0x11eu64.to_le_bytes()); // effective = min
    assert_eq!(writer, expected);
}
