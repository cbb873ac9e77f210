//! Node configuration: defaults, optional TOML file, `GALENA__`-prefixed
//! environment overrides. Command-line flags are merged on top by the node
//! binary.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use galena_core::{DEFAULT_CACHE_KB, DEFAULT_DIFFICULTY_SHIFT, DEFAULT_MAX_MINING};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8989;

#[cfg(unix)]
pub const DEFAULT_SOCKET_PATH: &str = "./node_socket";
#[cfg(windows)]
pub const DEFAULT_SOCKET_PATH: &str = r"\\.\pipe\node_socket";

fn default_host() -> String {
    DEFAULT_HOST.into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.into()
}

fn default_max_neighbors() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

fn default_cache_kb() -> u64 {
    DEFAULT_CACHE_KB
}

fn default_difficulty_shift() -> u32 {
    DEFAULT_DIFFICULTY_SHIFT
}

fn default_max_mining() -> usize {
    DEFAULT_MAX_MINING
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCfg {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bootstrap peers as `<ip>:<port>`.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Control socket: unix socket path, or pipe name on windows.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NetworkCfg {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            seeds: Vec::new(),
            socket_path: default_socket_path(),
            max_neighbors: default_max_neighbors(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCfg {
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_true")]
    pub mining: bool,
    #[serde(default)]
    pub full_node: bool,
    /// In-memory block budget for non-full nodes, in kilobytes.
    #[serde(default = "default_cache_kb")]
    pub cache_kb: u64,
    #[serde(default = "default_difficulty_shift")]
    pub difficulty_shift: u32,
    #[serde(default = "default_max_mining")]
    pub max_mining: usize,
}

impl Default for GlobalCfg {
    fn default() -> Self {
        Self {
            debug: false,
            mining: true,
            full_node: false,
            cache_kb: default_cache_kb(),
            difficulty_shift: default_difficulty_shift(),
            max_mining: default_max_mining(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerCfg {
    #[serde(default = "default_true")]
    pub logging: bool,
    /// Log to this file instead of stderr when set.
    #[serde(default)]
    pub filename: Option<String>,
}

impl Default for LoggerCfg {
    fn default() -> Self {
        Self {
            logging: true,
            filename: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseCfg {
    /// SQLite file backing the optional block store; unset disables it.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GalenaConfig {
    #[serde(default)]
    pub network: NetworkCfg,
    #[serde(default)]
    pub global: GlobalCfg,
    #[serde(default)]
    pub logger: LoggerCfg,
    #[serde(default)]
    pub database: DatabaseCfg,
    /// Key directory; the wallet default is used when unset.
    #[serde(default)]
    pub wallet_dir: Option<String>,
}

impl GalenaConfig {
    /// Defaults, then the file at `path` (when given), then `GALENA__`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("GALENA").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GalenaConfig::default();
        assert_eq!(cfg.network.port, DEFAULT_PORT);
        assert_eq!(cfg.network.max_neighbors, 2);
        assert!(cfg.global.mining);
        assert!(!cfg.global.full_node);
        assert_eq!(cfg.global.cache_kb, DEFAULT_CACHE_KB);
        assert!(cfg.logger.logging);
        assert!(cfg.database.path.is_none());
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = GalenaConfig::default();
        let text = cfg.to_toml().unwrap();
        let back: GalenaConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.network.port, cfg.network.port);
        assert_eq!(back.global.difficulty_shift, cfg.global.difficulty_shift);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = std::env::temp_dir().join(format!("galena-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.toml");
        std::fs::write(
            &path,
            "[network]\nhost = \"0.0.0.0\"\nport = 7000\nseeds = [\"1.2.3.4:8989\"]\n",
        )
        .unwrap();
        let cfg = GalenaConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.network.host, "0.0.0.0");
        assert_eq!(cfg.network.port, 7000);
        assert_eq!(cfg.network.seeds, vec!["1.2.3.4:8989".to_string()]);
        assert_eq!(cfg.network.max_neighbors, 2);
        assert!(cfg.global.mining);
        std::fs::remove_dir_all(&dir).ok();
    }
}
