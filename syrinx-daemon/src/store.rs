//! An in-memory store implementation.
//!
//! Backs the daemon in tests and demo deployments; production setups
//! implement [`DaemonStore`] against their real storage instead. All
//! state lives behind one mutex, which also makes the store safe to
//! share across connection workers.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use syrinx_protocol::error::{DaemonError, DaemonErrorKind};
use syrinx_protocol::serialization::gc::{GcAction, GcOptions, GcResult, Roots};
use syrinx_protocol::serialization::missing::Missing;
use syrinx_protocol::serialization::store_types::{UnkeyedValidPathInfo, ValidPathInfo};
use syrinx_protocol::server::{DaemonStore, OpContext};
use syrinx_store_core::{DerivedPath, DrvOutput, Realisation, StoreDir, StorePath};

struct PathEntry {
    info: UnkeyedValidPathInfo,
    nar: Vec<u8>,
    build_log: Option<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    paths: BTreeMap<StorePath, PathEntry>,
    roots: BTreeMap<String, StorePath>,
    indirect_roots: BTreeSet<String>,
    temp_roots: BTreeSet<StorePath>,
    realisations: BTreeMap<String, Realisation>,
}

impl Inner {
    /// Paths kept alive by a root, directly or through references.
    fn live_closure(&self) -> BTreeSet<StorePath> {
        let mut live = BTreeSet::new();
        let mut queue: VecDeque<StorePath> = self
            .roots
            .values()
            .chain(self.temp_roots.iter())
            .cloned()
            .collect();
        while let Some(path) = queue.pop_front() {
            if !live.insert(path.clone()) {
                continue;
            }
            if let Some(entry) = self.paths.get(&path) {
                for reference in &entry.info.references {
                    if !live.contains(reference) {
                        queue.push_back(reference.clone());
                    }
                }
            }
        }
        live
    }
}

pub struct MemoryStore {
    store_dir: StoreDir,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(store_dir: StoreDir) -> Self {
        MemoryStore {
            store_dir,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn invalid_path(&self, path: &StorePath) -> DaemonError {
        DaemonError::new(
            DaemonErrorKind::InvalidPath,
            format!("path '{}' is not valid", self.store_dir.display_path(path)),
        )
    }
}

impl DaemonStore for MemoryStore {
    async fn is_valid_path(&self, _ctx: &OpContext, path: StorePath) -> Result<bool, DaemonError> {
        Ok(self.inner.lock().unwrap().paths.contains_key(&path))
    }

    async fn query_valid_paths(
        &self,
        _ctx: &OpContext,
        paths: BTreeSet<StorePath>,
        _substitute: bool,
    ) -> Result<BTreeSet<StorePath>, DaemonError> {
        let inner = self.inner.lock().unwrap();
        Ok(paths
            .into_iter()
            .filter(|p| inner.paths.contains_key(p))
            .collect())
    }

    async fn query_all_valid_paths(
        &self,
        _ctx: &OpContext,
    ) -> Result<BTreeSet<StorePath>, DaemonError> {
        Ok(self.inner.lock().unwrap().paths.keys().cloned().collect())
    }

    async fn query_path_info(
        &self,
        _ctx: &OpContext,
        path: StorePath,
    ) -> Result<Option<UnkeyedValidPathInfo>, DaemonError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .paths
            .get(&path)
            .map(|entry| entry.info.clone()))
    }

    async fn query_path_from_hash_part(
        &self,
        _ctx: &OpContext,
        hash_part: String,
    ) -> Result<Option<StorePath>, DaemonError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .paths
            .keys()
            .find(|p| p.hash_part() == hash_part)
            .cloned())
    }

    async fn query_referrers(
        &self,
        _ctx: &OpContext,
        path: StorePath,
    ) -> Result<BTreeSet<StorePath>, DaemonError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .paths
            .iter()
            .filter(|(_, entry)| entry.info.references.contains(&path))
            .map(|(p, _)| p.clone())
            .collect())
    }

    async fn has_substitutes(
        &self,
        _ctx: &OpContext,
        _path: StorePath,
    ) -> Result<bool, DaemonError> {
        // No substituters are wired into the in-memory store.
        Ok(false)
    }

    async fn query_substitutable_paths(
        &self,
        _ctx: &OpContext,
        _paths: BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>, DaemonError> {
        Ok(BTreeSet::new())
    }

    async fn query_missing(
        &self,
        _ctx: &OpContext,
        targets: Vec<DerivedPath>,
    ) -> Result<Missing, DaemonError> {
        let inner = self.inner.lock().unwrap();
        let mut missing = Missing::default();
        for target in targets {
            match target {
                DerivedPath::Opaque { path } => {
                    if !inner.paths.contains_key(&path) {
                        missing.unknown.insert(path);
                    }
                }
                DerivedPath::Built { drv_path, .. } => {
                    if let DerivedPath::Opaque { path } = *drv_path {
                        if inner.paths.contains_key(&path) {
                            missing.will_build.insert(path);
                        } else {
                            missing.unknown.insert(path);
                        }
                    }
                }
            }
        }
        Ok(missing)
    }

    async fn add_to_store_nar(
        &self,
        _ctx: &OpContext,
        info: ValidPathInfo,
        nar: Vec<u8>,
        repair: bool,
        _dont_check_sigs: bool,
    ) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().unwrap();
        if !repair && inner.paths.contains_key(&info.path) {
            return Ok(()); // already valid
        }
        inner.paths.insert(
            info.path,
            PathEntry {
                info: info.info,
                nar,
                build_log: None,
            },
        );
        Ok(())
    }

    async fn nar_from_path(
        &self,
        _ctx: &OpContext,
        path: StorePath,
    ) -> Result<Vec<u8>, DaemonError> {
        self.inner
            .lock()
            .unwrap()
            .paths
            .get(&path)
            .map(|entry| entry.nar.clone())
            .ok_or_else(|| self.invalid_path(&path))
    }

    async fn ensure_path(&self, _ctx: &OpContext, path: StorePath) -> Result<(), DaemonError> {
        if self.inner.lock().unwrap().paths.contains_key(&path) {
            Ok(())
        } else {
            Err(DaemonError::new(
                DaemonErrorKind::InvalidPath,
                format!(
                    "path '{}' does not exist and cannot be substituted",
                    self.store_dir.display_path(&path)
                ),
            ))
        }
    }

    async fn add_temp_root(&self, _ctx: &OpContext, path: StorePath) -> Result<(), DaemonError> {
        self.inner.lock().unwrap().temp_roots.insert(path);
        Ok(())
    }

    async fn add_indirect_root(&self, _ctx: &OpContext, path: String) -> Result<(), DaemonError> {
        // The client owns the symlink; the daemon only remembers it.
        self.inner.lock().unwrap().indirect_roots.insert(path);
        Ok(())
    }

    async fn add_perm_root(
        &self,
        _ctx: &OpContext,
        path: StorePath,
        gc_root: String,
    ) -> Result<String, DaemonError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.paths.contains_key(&path) {
            return Err(self.invalid_path(&path));
        }
        inner.roots.insert(gc_root.clone(), path);
        Ok(gc_root)
    }

    async fn sync_with_gc(&self, _ctx: &OpContext) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn find_roots(&self, _ctx: &OpContext) -> Result<Roots, DaemonError> {
        Ok(self.inner.lock().unwrap().roots.clone())
    }

    async fn collect_garbage(
        &self,
        _ctx: &OpContext,
        options: GcOptions,
    ) -> Result<GcResult, DaemonError> {
        let mut inner = self.inner.lock().unwrap();
        let live = inner.live_closure();
        let mut result = GcResult::default();
        match options.action {
            GcAction::ReturnLive => {
                result.deleted_paths = live
                    .iter()
                    .map(|p| self.store_dir.display_path(p))
                    .collect();
            }
            GcAction::ReturnDead => {
                result.deleted_paths = inner
                    .paths
                    .keys()
                    .filter(|p| !live.contains(p))
                    .map(|p| self.store_dir.display_path(p))
                    .collect();
            }
            GcAction::DeleteDead | GcAction::DeleteSpecific => {
                let victims: Vec<StorePath> = match options.action {
                    GcAction::DeleteSpecific => options.paths_to_delete.iter().cloned().collect(),
                    _ => inner
                        .paths
                        .keys()
                        .filter(|p| !live.contains(p))
                        .cloned()
                        .collect(),
                };
                for path in victims {
                    if live.contains(&path) && !options.ignore_liveness {
                        return Err(DaemonError::new(
                            DaemonErrorKind::Misc,
                            format!(
                                "cannot delete path '{}' since it is still alive",
                                self.store_dir.display_path(&path)
                            ),
                        ));
                    }
                    if let Some(entry) = inner.paths.remove(&path) {
                        result.bytes_freed += entry.info.nar_size;
                        result.deleted_paths.push(self.store_dir.display_path(&path));
                    }
                    if options.max_freed > 0 && result.bytes_freed >= options.max_freed {
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    async fn register_drv_output(
        &self,
        _ctx: &OpContext,
        realisation: Realisation,
    ) -> Result<(), DaemonError> {
        self.inner
            .lock()
            .unwrap()
            .realisations
            .insert(realisation.id.to_string(), realisation);
        Ok(())
    }

    async fn query_realisation(
        &self,
        _ctx: &OpContext,
        id: DrvOutput,
    ) -> Result<BTreeSet<Realisation>, DaemonError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .realisations
            .get(&id.to_string())
            .cloned()
            .into_iter()
            .collect())
    }

    async fn add_signatures(
        &self,
        _ctx: &OpContext,
        path: StorePath,
        signatures: BTreeSet<String>,
    ) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.paths.get_mut(&path) {
            Some(entry) => {
                entry.info.sigs.extend(signatures);
                Ok(())
            }
            None => Err(self.invalid_path(&path)),
        }
    }

    async fn add_build_log(
        &self,
        _ctx: &OpContext,
        path: StorePath,
        log: Vec<u8>,
    ) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.paths.get_mut(&path) {
            Some(entry) => {
                entry.build_log = Some(log);
                Ok(())
            }
            None => Err(self.invalid_path(&path)),
        }
    }

    async fn optimise_store(&self, _ctx: &OpContext) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn verify_store(
        &self,
        _ctx: &OpContext,
        _check_contents: bool,
        _repair: bool,
    ) -> Result<bool, DaemonError> {
        // Nothing can go stale in memory.
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syrinx_store_core::Hash;

    fn sample_path(name: &str) -> StorePath {
        StorePath::from_base_name(&format!("g1w7hy3qg1w7hy3qg1w7hy3qg1w7hy3q-{name}")).unwrap()
    }

    fn sample_info(nar_size: u64) -> UnkeyedValidPathInfo {
        let mut info = UnkeyedValidPathInfo::new(
            Hash::parse("sha256-FePFYIlMuycIXPZbWi7LGEiMmZSX9FMbaQenWBzm1Sc=").unwrap(),
        );
        info.nar_size = nar_size;
        info
    }

    fn store_with(entries: &[(&str, u64)]) -> MemoryStore {
        let store = MemoryStore::new(StoreDir::default());
        {
            let mut inner = store.inner.lock().unwrap();
            for (name, size) in entries {
                inner.paths.insert(
                    sample_path(name),
                    PathEntry {
                        info: sample_info(*size),
                        nar: vec![0; *size as usize],
                        build_log: None,
                    },
                );
            }
        }
        store
    }

    #[test]
    fn gc_spares_the_live_closure() {
        let store = store_with(&[("rooted", 10), ("dep", 20), ("dead", 30)]);
        {
            let mut inner = store.inner.lock().unwrap();
            let mut info = sample_info(10);
            info.references = [sample_path("dep")].into();
            inner.paths.get_mut(&sample_path("rooted")).unwrap().info = info;
            inner
                .roots
                .insert("/home/alice/result".to_owned(), sample_path("rooted"));
            let live = inner.live_closure();
            assert!(live.contains(&sample_path("rooted")));
            assert!(live.contains(&sample_path("dep")));
            assert!(!live.contains(&sample_path("dead")));
        }
    }
}
