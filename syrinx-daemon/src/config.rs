use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path to bind the daemon socket.
    pub socket_path: PathBuf,

    /// The store directory served to clients.
    pub store_dir: PathBuf,

    /// Users (or `@group` references, or `*`) whose connections are
    /// trusted. Trusted clients may repair paths, import unsigned paths
    /// and override any setting.
    pub trusted_users: Vec<String>,

    /// Users allowed to connect at all. Defaults to everyone.
    pub allowed_users: Vec<String>,

    /// Members of this group run builds and must never connect.
    pub build_users_group: Option<String>,

    /// Substituters used by default.
    pub substituters: BTreeSet<String>,

    /// Substituters untrusted clients may additionally select.
    pub trusted_substituters: BTreeSet<String>,

    /// Trust level granted in stdio mode, where no peer credentials
    /// exist and access control happened at the transport (e.g. SSH).
    pub stdio_trusted: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: PathBuf::from("/nix/var/nix/daemon-socket/socket"),
            store_dir: PathBuf::from("/nix/store"),
            trusted_users: vec!["root".to_owned()],
            allowed_users: vec!["*".to_owned()],
            build_users_group: Some("nixbld".to_owned()),
            substituters: BTreeSet::new(),
            trusted_substituters: BTreeSet::new(),
            stdio_trusted: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ServerError::io(format!("Failed to read config file at {}", path.display()), e)
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn store_dir(&self) -> Result<syrinx_store_core::StoreDir, ServerError> {
        let dir = self
            .store_dir
            .to_str()
            .ok_or_else(|| ServerError::config("store_dir is not valid UTF-8"))?;
        syrinx_store_core::StoreDir::new(dir).map_err(|e| ServerError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.trusted_users, ["root"]);
        assert_eq!(config.allowed_users, ["*"]);
        assert!(!config.stdio_trusted);
        config.store_dir().unwrap();
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            socket_path = "/run/syrinx/socket"
            trusted_users = ["root", "@wheel"]
            substituters = ["https://cache.example.org"]
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/syrinx/socket"));
        assert_eq!(config.trusted_users, ["root", "@wheel"]);
        assert_eq!(config.store_dir, PathBuf::from("/nix/store"));
        assert!(config.substituters.contains("https://cache.example.org"));
    }
}
