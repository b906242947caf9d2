//! The store capability the dispatcher calls into.
//!
//! Implementations back the daemon with a real store; every method has a
//! default body that reports the operation as unsupported, so partial
//! stores stay small. Methods receive an [`OpContext`] for logging,
//! interruption and the credential side-channel.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use syrinx_store_core::{
    BasicDerivation, BuildMode, BuildResult, DerivedPath, DrvOutput, KeyedBuildResult, Realisation,
    StorePath,
};

use crate::error::{DaemonError, DaemonErrorKind};
use crate::serialization::gc::{GcOptions, GcResult, Roots};
use crate::serialization::missing::Missing;
use crate::serialization::options::ClientOptions;
use crate::serialization::store_types::{UnkeyedValidPathInfo, ValidPathInfo};
use crate::serialization::substitutable::{SubstitutablePathInfo, SubstitutablePathInfos};
use crate::server::auth::TunneledCredentials;
use crate::server::logger::TunnelLogger;

/// The trust classification decided at accept time from peer credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    Trusted,
    #[default]
    NotTrusted,
}

/// Per-operation context handed to store methods.
#[derive(Clone)]
pub struct OpContext {
    pub logger: TunnelLogger,
    pub trust: TrustLevel,
    pub options: ClientOptions,
    pub credentials: Option<Arc<TunneledCredentials>>,
    interrupt: Arc<AtomicBool>,
}

impl OpContext {
    pub(crate) fn new(
        logger: TunnelLogger,
        trust: TrustLevel,
        options: ClientOptions,
        credentials: Option<Arc<TunneledCredentials>>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        OpContext {
            logger,
            trust,
            options,
            credentials,
            interrupt,
        }
    }

    /// Long-running handlers call this at their checkpoints.
    pub fn check_interrupt(&self) -> Result<(), DaemonError> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(DaemonError::new(DaemonErrorKind::Interrupted, "interrupted"));
        }
        Ok(())
    }
}

fn unsupported<T>(op: &'static str) -> Result<T, DaemonError> {
    Err(DaemonError::new(
        DaemonErrorKind::Unsupported,
        format!("operation '{op}' is not supported by this store"),
    ))
}

macro_rules! default_op {
    ($name:literal) => {
        async move { unsupported($name) }
    };
}

/// The store behind the daemon. Shared across connections; must be
/// internally thread-safe.
pub trait DaemonStore: Send + Sync + 'static {
    fn is_valid_path(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<bool, DaemonError>> + Send {
        default_op!("is_valid_path")
    }

    fn query_valid_paths(
        &self,
        _ctx: &OpContext,
        _paths: BTreeSet<StorePath>,
        _substitute: bool,
    ) -> impl Future<Output = Result<BTreeSet<StorePath>, DaemonError>> + Send {
        default_op!("query_valid_paths")
    }

    fn query_all_valid_paths(
        &self,
        _ctx: &OpContext,
    ) -> impl Future<Output = Result<BTreeSet<StorePath>, DaemonError>> + Send {
        default_op!("query_all_valid_paths")
    }

    fn query_path_info(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<Option<UnkeyedValidPathInfo>, DaemonError>> + Send {
        default_op!("query_path_info")
    }

    fn query_path_from_hash_part(
        &self,
        _ctx: &OpContext,
        _hash_part: String,
    ) -> impl Future<Output = Result<Option<StorePath>, DaemonError>> + Send {
        default_op!("query_path_from_hash_part")
    }

    fn query_referrers(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<BTreeSet<StorePath>, DaemonError>> + Send {
        default_op!("query_referrers")
    }

    fn query_valid_derivers(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<BTreeSet<StorePath>, DaemonError>> + Send {
        default_op!("query_valid_derivers")
    }

    fn has_substitutes(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<bool, DaemonError>> + Send {
        default_op!("has_substitutes")
    }

    fn query_substitutable_paths(
        &self,
        _ctx: &OpContext,
        _paths: BTreeSet<StorePath>,
    ) -> impl Future<Output = Result<BTreeSet<StorePath>, DaemonError>> + Send {
        default_op!("query_substitutable_paths")
    }

    fn query_substitutable_path_info(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<Option<SubstitutablePathInfo>, DaemonError>> + Send {
        default_op!("query_substitutable_path_info")
    }

    fn query_substitutable_path_infos(
        &self,
        _ctx: &OpContext,
        _paths: BTreeSet<StorePath>,
    ) -> impl Future<Output = Result<SubstitutablePathInfos, DaemonError>> + Send {
        default_op!("query_substitutable_path_infos")
    }

    fn query_derivation_output_map(
        &self,
        _ctx: &OpContext,
        _drv_path: StorePath,
    ) -> impl Future<Output = Result<BTreeMap<String, Option<StorePath>>, DaemonError>> + Send
    {
        default_op!("query_derivation_output_map")
    }

    fn query_missing(
        &self,
        _ctx: &OpContext,
        _targets: Vec<DerivedPath>,
    ) -> impl Future<Output = Result<Missing, DaemonError>> + Send {
        default_op!("query_missing")
    }

    fn query_realisation(
        &self,
        _ctx: &OpContext,
        _id: DrvOutput,
    ) -> impl Future<Output = Result<BTreeSet<Realisation>, DaemonError>> + Send {
        default_op!("query_realisation")
    }

    fn register_drv_output(
        &self,
        _ctx: &OpContext,
        _realisation: Realisation,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("register_drv_output")
    }

    /// Ingest a content-addressed object; the archive arrives buffered.
    fn add_to_store(
        &self,
        _ctx: &OpContext,
        _name: String,
        _method_algo: String,
        _references: BTreeSet<StorePath>,
        _repair: bool,
        _nar: Vec<u8>,
    ) -> impl Future<Output = Result<ValidPathInfo, DaemonError>> + Send {
        default_op!("add_to_store")
    }

    /// Import an object with pre-computed metadata.
    fn add_to_store_nar(
        &self,
        _ctx: &OpContext,
        _info: ValidPathInfo,
        _nar: Vec<u8>,
        _repair: bool,
        _dont_check_sigs: bool,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("add_to_store_nar")
    }

    /// Produce the archive serialisation of a valid path.
    fn nar_from_path(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<Vec<u8>, DaemonError>> + Send {
        default_op!("nar_from_path")
    }

    fn build_paths(
        &self,
        _ctx: &OpContext,
        _paths: Vec<DerivedPath>,
        _mode: BuildMode,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("build_paths")
    }

    fn build_paths_with_results(
        &self,
        _ctx: &OpContext,
        _paths: Vec<DerivedPath>,
        _mode: BuildMode,
    ) -> impl Future<Output = Result<Vec<KeyedBuildResult>, DaemonError>> + Send {
        default_op!("build_paths_with_results")
    }

    fn build_derivation(
        &self,
        _ctx: &OpContext,
        _drv_path: StorePath,
        _drv: BasicDerivation,
        _mode: BuildMode,
    ) -> impl Future<Output = Result<BuildResult, DaemonError>> + Send {
        default_op!("build_derivation")
    }

    fn ensure_path(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("ensure_path")
    }

    fn add_temp_root(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("add_temp_root")
    }

    /// `path` is an absolute path outside the store.
    fn add_indirect_root(
        &self,
        _ctx: &OpContext,
        _path: String,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("add_indirect_root")
    }

    fn add_perm_root(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
        _gc_root: String,
    ) -> impl Future<Output = Result<String, DaemonError>> + Send {
        default_op!("add_perm_root")
    }

    fn sync_with_gc(
        &self,
        _ctx: &OpContext,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("sync_with_gc")
    }

    fn find_roots(
        &self,
        _ctx: &OpContext,
    ) -> impl Future<Output = Result<Roots, DaemonError>> + Send {
        default_op!("find_roots")
    }

    fn collect_garbage(
        &self,
        _ctx: &OpContext,
        _options: GcOptions,
    ) -> impl Future<Output = Result<GcResult, DaemonError>> + Send {
        default_op!("collect_garbage")
    }

    fn optimise_store(
        &self,
        _ctx: &OpContext,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("optimise_store")
    }

    fn verify_store(
        &self,
        _ctx: &OpContext,
        _check_contents: bool,
        _repair: bool,
    ) -> impl Future<Output = Result<bool, DaemonError>> + Send {
        default_op!("verify_store")
    }

    fn add_signatures(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
        _signatures: BTreeSet<String>,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("add_signatures")
    }

    fn add_build_log(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
        _log: Vec<u8>,
    ) -> impl Future<Output = Result<(), DaemonError>> + Send {
        default_op!("add_build_log")
    }
}
