//! Declarative stack configuration
//!
//! A STRATAFS deployment is described by a TOML file with a small top-level
//! vocabulary (`root`, `log_mode`, `services`) where every other key names
//! a layer and its table carries a `type` tag plus type-specific
//! parameters:
//!
//! ```toml
//! root = "cache"
//! log_mode = "info"
//!
//! [cache]
//! type = "read_cache"
//! next = "crypt"
//! block_size = 4096
//! num_blocks = 100
//!
//! [crypt]
//! type = "encryption"
//! next = "store"
//! block_size = 4096
//! encryption_key = "..."
//!
//! [store]
//! type = "local"
//! root = "/srv/strata"
//! ```
//!
//! Parsing validates shape and per-kind parameter constraints; reference
//! resolution, cycle detection and instantiation happen in [`builder`].

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub mod builder;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("No layer definitions found")]
    NoLayers,

    #[error("Layer {name}: {reason}")]
    InvalidLayer { name: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_block_size() -> u64 {
    4096
}

fn default_num_blocks() -> usize {
    100
}

fn default_local_root() -> String {
    "/".to_owned()
}

fn default_remote_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_remote_port() -> u16 {
    5000
}

/// Logging mode selected by the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Disabled,
    /// Log to stdout at info verbosity.
    Screen,
    Error,
    Warn,
    Info,
    Debug,
}

impl LogMode {
    /// Level filter for the `log` facade.
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            LogMode::Disabled => log::LevelFilter::Off,
            LogMode::Screen => log::LevelFilter::Info,
            LogMode::Error => log::LevelFilter::Error,
            LogMode::Warn => log::LevelFilter::Warn,
            LogMode::Info => log::LevelFilter::Info,
            LogMode::Debug => log::LevelFilter::Debug,
        }
    }

    /// Whether log lines go to stdout instead of stderr.
    pub fn to_stdout(self) -> bool {
        matches!(self, LogMode::Screen)
    }
}

/// Optional service configuration (`[services]` table).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceConfig {
    Metadata {
        /// Directory for the embedded key-value store.
        #[serde(default = "MetadataParams::default_path")]
        path: String,
        /// Cache capacity in bytes for the store.
        #[serde(default)]
        cache_size: Option<u64>,
        /// Background thread count; accepted and recorded, the embedded
        /// store manages its own flusher.
        #[serde(default)]
        threads: Option<usize>,
    },
}

/// Namespacing helper for metadata defaults.
pub struct MetadataParams;

impl MetadataParams {
    fn default_path() -> String {
        "./strata-metadata".to_owned()
    }
}

/// Demultiplexer routing options.
///
/// Each list names member layers; membership is translated into the
/// per-child boolean masks at build time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DemultiplexerOptions {
    #[serde(default)]
    pub passthrough_reads: Vec<String>,
    #[serde(default)]
    pub passthrough_writes: Vec<String>,
    #[serde(default)]
    pub enforced_layers: Vec<String>,
}

/// One layer definition: the `type` tag plus its parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerConfig {
    Local {
        #[serde(default = "default_local_root")]
        root: String,
    },
    Remote {
        #[serde(default = "default_remote_host")]
        host: String,
        #[serde(default = "default_remote_port")]
        port: u16,
    },
    BlockAlign {
        next: String,
        #[serde(default = "default_block_size")]
        block_size: u64,
    },
    Benchmark {
        next: String,
        reps: u64,
    },
    ReadCache {
        next: String,
        #[serde(default = "default_block_size")]
        block_size: u64,
        #[serde(default = "default_num_blocks")]
        num_blocks: usize,
    },
    Encryption {
        next: String,
        #[serde(default = "default_block_size")]
        block_size: u64,
        #[serde(default)]
        encryption_key: Option<String>,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        vault_addr: Option<String>,
        #[serde(default)]
        secret_path: Option<String>,
    },
    Demultiplexer {
        layers: Vec<String>,
        #[serde(default)]
        options: DemultiplexerOptions,
    },
    AntiTampering {
        data_layer: String,
        hash_layer: String,
        hashes_storage: String,
        #[serde(default = "default_block_size")]
        block_size: u64,
    },
    Compression {
        next: String,
        #[serde(default)]
        algorithm: Option<String>,
        #[serde(default)]
        level: Option<i64>,
    },
    S3Opendal {
        endpoint: String,
        access_key_id: String,
        secret_access_key: String,
        region: String,
        bucket: String,
        root: String,
    },
    IpfsOpendal {
        api_endpoint: String,
        root: String,
    },
    Solana {
        keypair_path: String,
        rpc_url: String,
    },
}

impl LayerConfig {
    /// The `type` tag this definition was parsed from.
    pub fn kind(&self) -> &'static str {
        match self {
            LayerConfig::Local { .. } => "local",
            LayerConfig::Remote { .. } => "remote",
            LayerConfig::BlockAlign { .. } => "block_align",
            LayerConfig::Benchmark { .. } => "benchmark",
            LayerConfig::ReadCache { .. } => "read_cache",
            LayerConfig::Encryption { .. } => "encryption",
            LayerConfig::Demultiplexer { .. } => "demultiplexer",
            LayerConfig::AntiTampering { .. } => "anti_tampering",
            LayerConfig::Compression { .. } => "compression",
            LayerConfig::S3Opendal { .. } => "s3_opendal",
            LayerConfig::IpfsOpendal { .. } => "ipfs_opendal",
            LayerConfig::Solana { .. } => "solana",
        }
    }

    /// Names of the layers this definition depends on, in build order.
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            LayerConfig::BlockAlign { next, .. }
            | LayerConfig::Benchmark { next, .. }
            | LayerConfig::ReadCache { next, .. }
            | LayerConfig::Encryption { next, .. }
            | LayerConfig::Compression { next, .. } => vec![next.as_str()],
            LayerConfig::Demultiplexer { layers, .. } => {
                layers.iter().map(String::as_str).collect()
            }
            LayerConfig::AntiTampering {
                data_layer,
                hash_layer,
                ..
            } => vec![data_layer.as_str(), hash_layer.as_str()],
            _ => Vec::new(),
        }
    }

    fn validate(&self, name: &str) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidLayer {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };

        match self {
            LayerConfig::ReadCache { block_size, .. }
            | LayerConfig::BlockAlign { block_size, .. }
            | LayerConfig::Encryption { block_size, .. }
            | LayerConfig::AntiTampering { block_size, .. }
                if *block_size < 1 =>
            {
                Err(invalid("block_size must be at least 1"))
            }
            LayerConfig::Benchmark { reps, .. } if *reps == 0 => {
                Err(invalid("reps must be greater than 0"))
            }
            LayerConfig::Demultiplexer { layers, options } => {
                if layers.is_empty() {
                    return Err(invalid("must have at least one layer"));
                }
                for listed in options
                    .passthrough_reads
                    .iter()
                    .chain(&options.passthrough_writes)
                    .chain(&options.enforced_layers)
                {
                    if !layers.contains(listed) {
                        return Err(invalid(&format!(
                            "option references {listed}, which is not a member layer"
                        )));
                    }
                }
                Ok(())
            }
            LayerConfig::Encryption {
                encryption_key,
                api_key,
                vault_addr,
                secret_path,
                ..
            } => {
                if encryption_key.is_none() && api_key.is_none() {
                    return Err(invalid(
                        "either encryption_key or api_key must be provided",
                    ));
                }
                if api_key.is_some() && vault_addr.is_none() {
                    return Err(invalid("vault_addr must be provided when using api_key"));
                }
                if api_key.is_some() && secret_path.is_none() {
                    return Err(invalid("secret_path must be provided when using api_key"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    root: String,
    #[serde(default)]
    log_mode: LogMode,
    #[serde(default)]
    services: Option<ServiceConfig>,
    #[serde(flatten)]
    layers: BTreeMap<String, LayerConfig>,
}

/// Parsed and validated stack configuration.
#[derive(Debug)]
pub struct Config {
    pub root_layer: String,
    pub log_mode: LogMode,
    pub services: Option<ServiceConfig>,
    pub layers: BTreeMap<String, LayerConfig>,
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        let raw: RawConfig = toml::from_str(text)?;
        if raw.layers.is_empty() {
            return Err(ConfigError::NoLayers);
        }
        for (name, layer) in &raw.layers {
            layer.validate(name)?;
        }
        Ok(Config {
            root_layer: raw.root,
            log_mode: raw.log_mode,
            services: raw.services,
            layers: raw.layers,
        })
    }

    /// Load a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Layer definition by name.
    pub fn layer(&self, name: &str) -> Option<&LayerConfig> {
        self.layers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
        root = "cache"
        log_mode = "debug"

        [cache]
        type = "read_cache"
        next = "store"
        num_blocks = 4

        [store]
        type = "local"
        root = "/tmp/strata"
    "#;

    #[test]
    fn parses_basic_stack() {
        let config = Config::from_toml(BASIC).unwrap();
        assert_eq!(config.root_layer, "cache");
        assert_eq!(config.log_mode, LogMode::Debug);
        assert_eq!(config.layers.len(), 2);

        match config.layer("cache").unwrap() {
            LayerConfig::ReadCache {
                next,
                block_size,
                num_blocks,
            } => {
                assert_eq!(next, "store");
                assert_eq!(*block_size, 4096);
                assert_eq!(*num_blocks, 4);
            }
            other => panic!("unexpected layer kind {}", other.kind()),
        }
    }

    #[test]
    fn log_mode_defaults_to_disabled() {
        let text = r#"
            root = "store"

            [store]
            type = "local"
        "#;
        let config = Config::from_toml(text).unwrap();
        assert_eq!(config.log_mode, LogMode::Disabled);
    }

    #[test]
    fn rejects_unknown_layer_type() {
        let text = r#"
            root = "x"

            [x]
            type = "teleport"
        "#;
        assert!(matches!(
            Config::from_toml(text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_empty_config() {
        let text = r#"root = "x""#;
        assert!(matches!(Config::from_toml(text), Err(ConfigError::NoLayers)));
    }

    #[test]
    fn encryption_requires_some_key_source() {
        let text = r#"
            root = "crypt"

            [crypt]
            type = "encryption"
            next = "store"

            [store]
            type = "local"
        "#;
        assert!(matches!(
            Config::from_toml(text),
            Err(ConfigError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn encryption_vault_params_must_be_complete() {
        let text = r#"
            root = "crypt"

            [crypt]
            type = "encryption"
            next = "store"
            api_key = "tok"
            vault_addr = "https://vault.example"

            [store]
            type = "local"
        "#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("secret_path"));
    }

    #[test]
    fn demultiplexer_options_must_reference_members() {
        let text = r#"
            root = "mux"

            [mux]
            type = "demultiplexer"
            layers = ["a", "b"]

            [mux.options]
            enforced_layers = ["c"]

            [a]
            type = "local"

            [b]
            type = "local"
        "#;
        let err = Config::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("not a member layer"));
    }

    #[test]
    fn services_table_is_parsed() {
        let text = r#"
            root = "store"

            [services]
            type = "metadata"
            cache_size = 1048576
            threads = 2

            [store]
            type = "local"
        "#;
        let config = Config::from_toml(text).unwrap();
        match config.services.unwrap() {
            ServiceConfig::Metadata {
                cache_size, threads, ..
            } => {
                assert_eq!(cache_size, Some(1_048_576));
                assert_eq!(threads, Some(2));
            }
        }
    }

    #[test]
    fn dependencies_follow_the_layer_shape() {
        let config = Config::from_toml(BASIC).unwrap();
        assert_eq!(config.layer("cache").unwrap().dependencies(), vec!["store"]);
        assert!(config.layer("store").unwrap().dependencies().is_empty());
    }
}
