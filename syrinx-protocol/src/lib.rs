//! The worker protocol: the length-prefixed binary RPC spoken between an
//! unprivileged client and the privileged store daemon over a Unix-domain
//! socket, or over any bidirectional byte stream (stdio under SSH).
//!
//! # Layout
//!
//! - [`serialization`] - the framing codec and the versioned value codecs
//! - [`protocol`] - magics, versions, opcodes and stderr frame tags
//! - [`framed`] - the self-delimiting chunk stream for large payloads
//! - [`client`] - typed client, connection pool, credential answering
//! - [`server`] - dispatcher, tunnel logger, trust enforcement
//! - [`auth`] / [`fd`] - the credential side-channel and `SCM_RIGHTS`
//!   descriptor passing it rides on
//!
//! # Basic example
//!
//! ```ignore
//! use syrinx_protocol::client::DaemonClientBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = DaemonClientBuilder::new().connect().await?;
//!     let valid = client.is_valid_path(&path).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod fd;
pub mod framed;
pub mod io;
pub mod protocol;
pub mod serialization;
pub mod server;

#[cfg(test)]
mod tests;

pub use client::{ConnectionPool, DaemonClient, DaemonClientBuilder, PoolConfig, UnixDaemonClient};
pub use error::{DaemonError, DaemonErrorKind, ProtocolError};
pub use protocol::{OpCode, ProtocolVersion, Verbosity, PROTOCOL_VERSION};
pub use server::{DaemonServer, DaemonStore, ServerConfig, TrustLevel, TrustPolicy};
