pub mod build;
pub mod derivation;
pub mod derived_path;
pub mod gc;
pub mod handshake;
pub mod missing;
pub mod options;
pub mod primitives;
pub mod realisation;
pub mod stderr;
pub mod store_types;
pub mod substitutable;

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;

pub use primitives::{read_bytes, read_bytes_bounded, write_bytes};

/// Encoders are parameterized by the negotiated protocol version and the
/// connection's store directory; both are fixed at handshake time.
#[allow(async_fn_in_trait)]
pub trait Serialize {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError>;
}

#[allow(async_fn_in_trait)]
pub trait Deserialize: Sized {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError>;
}
