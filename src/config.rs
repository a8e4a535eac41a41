use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::write_atomic;

/// user agent sent with every http request
pub const USER_AGENT: &str = concat!("pvr/", env!("CARGO_PKG_VERSION"));

/// redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 15;

pub const DEFAULT_BASE_URL: &str = "https://api.pantahub.com";
pub const DEFAULT_REPO_BASE_URL: &str = "https://pvr.pantahub.com";

/// per-repository configuration stored in `.pvr/config`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepoConfig {
    /// remote used by `get`/`fetch` when none is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_get_url: Option<String>,
    /// remote used by `post` when none is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_put_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_post_url: Option<String>,
    /// object pool override, shared between repositories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects_dir: Option<PathBuf>,
}

impl RepoConfig {
    /// load config from file; absent means defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::json(path.display().to_string(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_path(path),
        }
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(self).map_err(|e| Error::json("repo config", e))?;
        write_atomic(path, &content)
    }
}

/// process-wide settings in `<config-dir>/config.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlobalConfig {
    pub spec: String,
    #[serde(default)]
    pub auto_upgrade: bool,
    #[serde(default = "default_distribution_tag")]
    pub distribution_tag: String,
}

fn default_distribution_tag() -> String {
    "stable".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            spec: "1".to_string(),
            auto_upgrade: false,
            distribution_tag: default_distribution_tag(),
        }
    }
}

impl GlobalConfig {
    pub fn path(config_dir: &Path) -> PathBuf {
        config_dir.join("config.json")
    }

    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = Self::path(config_dir);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::json(path.display().to_string(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_path(&path),
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir).with_path(config_dir)?;
        let content =
            serde_json::to_vec_pretty(self).map_err(|e| Error::json("global config", e))?;
        write_atomic(&Self::path(config_dir), &content)
    }
}

/// how outgoing http requests pick a proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    /// honour the usual proxy environment variables
    System,
    /// connect directly
    None,
    Url(String),
}

impl ProxyMode {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "system" => ProxyMode::System,
            "no" | "none" => ProxyMode::None,
            url => ProxyMode::Url(url.to_string()),
        }
    }
}

/// settings derived from `PVR_*` environment variables
#[derive(Clone, Debug)]
pub struct EnvConfig {
    pub base_url: String,
    pub repo_base_url: String,
    pub config_dir: PathBuf,
    /// access token that bypasses the auth store
    pub access_token: Option<String>,
    /// accept invalid tls certificates
    pub insecure: bool,
    pub debug: bool,
    pub proxy: ProxyMode,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let flag = |key: &str| {
            non_empty(key)
                .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
                .unwrap_or(false)
        };

        let config_dir = non_empty("PVR_CONFIG_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs_next::home_dir().map(|home| home.join(".pvr")))
            .unwrap_or_else(|| PathBuf::from(".pvr"));

        Self {
            base_url: non_empty("PVR_BASEURL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            repo_base_url: non_empty("PVR_REPO_BASEURL")
                .unwrap_or_else(|| DEFAULT_REPO_BASE_URL.to_string()),
            config_dir,
            access_token: non_empty("PVR_AUTH"),
            insecure: flag("PVR_INSECURE"),
            debug: flag("PVR_DEBUG"),
            proxy: non_empty("PVR_HTTP_PROXY")
                .map(|v| ProxyMode::parse(&v))
                .unwrap_or(ProxyMode::System),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_env_defaults() {
        let cfg = env(&[]);
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.repo_base_url, DEFAULT_REPO_BASE_URL);
        assert!(cfg.config_dir.ends_with(".pvr"));
        assert!(cfg.access_token.is_none());
        assert!(!cfg.insecure);
        assert_eq!(cfg.proxy, ProxyMode::System);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = env(&[
            ("PVR_BASEURL", "http://localhost:12365"),
            ("PVR_CONFIG_DIR", "/tmp/pvrcfg"),
            ("PVR_AUTH", "tok"),
            ("PVR_INSECURE", "1"),
            ("PVR_DEBUG", "false"),
            ("PVR_HTTP_PROXY", "no"),
        ]);
        assert_eq!(cfg.base_url, "http://localhost:12365");
        assert_eq!(cfg.config_dir, PathBuf::from("/tmp/pvrcfg"));
        assert_eq!(cfg.access_token.as_deref(), Some("tok"));
        assert!(cfg.insecure);
        assert!(!cfg.debug);
        assert_eq!(cfg.proxy, ProxyMode::None);
    }

    #[test]
    fn test_proxy_url() {
        assert_eq!(
            ProxyMode::parse("http://proxy:3128"),
            ProxyMode::Url("http://proxy:3128".into())
        );
    }

    #[test]
    fn test_repo_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config");
        assert_eq!(RepoConfig::load(&path).unwrap(), RepoConfig::default());

        let cfg = RepoConfig {
            default_get_url: Some("https://pvr.example/user/dev".into()),
            objects_dir: Some("/srv/objects".into()),
            ..Default::default()
        };
        cfg.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["DefaultGetUrl"], "https://pvr.example/user/dev");
        assert_eq!(RepoConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn test_global_config_defaults() {
        let dir = tempdir().unwrap();
        let cfg = GlobalConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.spec, "1");
        assert_eq!(cfg.distribution_tag, "stable");

        let cfg = GlobalConfig {
            auto_upgrade: true,
            ..cfg
        };
        cfg.save(dir.path()).unwrap();
        assert!(GlobalConfig::load(dir.path()).unwrap().auto_upgrade);
    }
}
