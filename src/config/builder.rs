//! Stack builder
//!
//! Transforms a validated [`Config`] into the instantiated layer DAG. The
//! build is a memoized post-order walk: every layer is instantiated exactly
//! once and a sub-DAG referenced by several parents is shared, so stateful
//! layers (cache, encryption) never get duplicate instances. Cycles are
//! detected with an in-progress stack and reported with the offending
//! chain. Any initialization failure aborts the build and tears down the
//! layers that were already constructed.
//!
//! Invisible-storage kinds and compression are instantiated through
//! factories registered on the builder; an unregistered kind is a build
//! error naming the layer and its kind.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::cache::LruBlockCache;
use crate::config::{Config, DemultiplexerOptions, LayerConfig};
use crate::layer::{LayerError, LayerRef};
use crate::layers::{
    AntiTamperingLayer, BenchmarkLayer, BlockAlignLayer, DemultiplexerLayer, EncryptionLayer,
    LocalLayer, ReadCacheLayer, RemoteLayer,
};
use crate::secrets::{self, SecretsError};
use crate::services::Services;

/// Build errors
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Layer dependency cycle: {0}")]
    Cycle(String),

    #[error("Layer {name}: no factory registered for kind {kind}")]
    MissingFactory { name: String, kind: &'static str },

    #[error("Layer {name}: invalid configuration: {reason}")]
    InvalidParams { name: String, reason: String },

    #[error("Layer {name}: initialization failed: {source}")]
    Init {
        name: String,
        #[source]
        source: LayerError,
    },

    #[error("Layer {name}: secrets fetch failed: {source}")]
    Secrets {
        name: String,
        #[source]
        source: SecretsError,
    },

    #[error("Layer {name}: factory failed: {reason}")]
    Factory { name: String, reason: String },
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Factory for layer kinds whose implementations live outside the core
/// (invisible storage backends, compression).
pub trait LayerFactory: Send + Sync {
    /// Instantiate a layer from its parsed definition. `children` carries
    /// the already-built dependencies in the order reported by
    /// [`LayerConfig::dependencies`].
    fn build(
        &self,
        name: &str,
        config: &LayerConfig,
        children: Vec<LayerRef>,
        services: &Services,
    ) -> Result<LayerRef, String>;
}

/// Registry of external layer factories, keyed by kind name.
#[derive(Default)]
pub struct LayerRegistry {
    factories: HashMap<&'static str, Arc<dyn LayerFactory>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory handling `kind`. Later registrations replace
    /// earlier ones.
    pub fn register(&mut self, kind: &'static str, factory: Arc<dyn LayerFactory>) {
        self.factories.insert(kind, factory);
    }

    fn get(&self, kind: &str) -> Option<&Arc<dyn LayerFactory>> {
        self.factories.get(kind)
    }
}

/// Build the stack described by `config`, returning the root layer.
pub fn build_stack(config: &Config, services: &Services) -> BuildResult<LayerRef> {
    build_stack_with_registry(config, services, &LayerRegistry::new())
}

/// [`build_stack`] with external factories available.
pub fn build_stack_with_registry(
    config: &Config,
    services: &Services,
    registry: &LayerRegistry,
) -> BuildResult<LayerRef> {
    let mut builder = Builder {
        config,
        services,
        registry,
        built: HashMap::new(),
        in_progress: Vec::new(),
    };

    match builder.build_layer(&config.root_layer) {
        Ok(root) => {
            log::info!(
                "[BUILDER] stack ready: {} layer(s), root {}",
                builder.built.len(),
                config.root_layer
            );
            Ok(root)
        }
        Err(err) => {
            // fail fast, but release whatever was already constructed;
            // destroy is idempotent so shared sub-DAGs tolerate the sweep
            for (name, layer) in builder.built.drain() {
                log::debug!("[BUILDER] tearing down partially built layer {name}");
                layer.destroy();
            }
            Err(err)
        }
    }
}

struct Builder<'a> {
    config: &'a Config,
    services: &'a Services,
    registry: &'a LayerRegistry,
    built: HashMap<String, LayerRef>,
    in_progress: Vec<String>,
}

impl Builder<'_> {
    fn build_layer(&mut self, name: &str) -> BuildResult<LayerRef> {
        // memoization: a layer referenced twice is built once and shared
        if let Some(existing) = self.built.get(name) {
            return Ok(existing.clone());
        }

        if self.in_progress.iter().any(|n| n == name) {
            let mut chain = self.in_progress.join(" -> ");
            chain.push_str(" -> ");
            chain.push_str(name);
            return Err(BuildError::Cycle(chain));
        }

        let layer_config = self
            .config
            .layer(name)
            .ok_or_else(|| BuildError::LayerNotFound(name.to_owned()))?;

        self.in_progress.push(name.to_owned());
        let result = self.instantiate(name, layer_config);
        self.in_progress.pop();

        let layer = result?;
        self.built.insert(name.to_owned(), layer.clone());
        log::debug!("[BUILDER] built layer {name} ({})", layer_config.kind());
        Ok(layer)
    }

    fn instantiate(&mut self, name: &str, layer_config: &LayerConfig) -> BuildResult<LayerRef> {
        match layer_config {
            LayerConfig::Local { root } => Ok(Arc::new(LocalLayer::new(root.clone()))),

            LayerConfig::Remote { host, port } => {
                let layer = RemoteLayer::connect(host, *port).map_err(|source| {
                    BuildError::Init {
                        name: name.to_owned(),
                        source,
                    }
                })?;
                Ok(Arc::new(layer))
            }

            LayerConfig::BlockAlign { next, block_size } => {
                let next = self.build_layer(next)?;
                Ok(Arc::new(BlockAlignLayer::new(next, *block_size)))
            }

            LayerConfig::Benchmark { next, reps } => {
                let next = self.build_layer(next)?;
                Ok(Arc::new(BenchmarkLayer::new(next, *reps)))
            }

            LayerConfig::ReadCache {
                next,
                block_size,
                num_blocks,
            } => {
                let next = self.build_layer(next)?;
                let cache = Arc::new(LruBlockCache::new(*num_blocks));
                Ok(Arc::new(ReadCacheLayer::new(next, *block_size, cache)))
            }

            LayerConfig::Encryption {
                next,
                block_size,
                encryption_key,
                api_key,
                vault_addr,
                secret_path,
            } => {
                let next = self.build_layer(next)?;
                let key = self.resolve_key(
                    name,
                    encryption_key.as_deref(),
                    api_key.as_deref(),
                    vault_addr.as_deref(),
                    secret_path.as_deref(),
                )?;
                Ok(Arc::new(EncryptionLayer::new(next, *block_size, &key)))
            }

            LayerConfig::Demultiplexer { layers, options } => {
                let mut children = Vec::with_capacity(layers.len());
                for child_name in layers {
                    children.push(self.build_layer(child_name)?);
                }
                let (reads, writes, enforced) = Self::masks(layers, options);
                Ok(Arc::new(DemultiplexerLayer::new(
                    children, reads, writes, enforced,
                )))
            }

            LayerConfig::AntiTampering {
                data_layer,
                hash_layer,
                hashes_storage,
                block_size,
            } => {
                let data = self.build_layer(data_layer)?;
                let hash = self.build_layer(hash_layer)?;
                Ok(Arc::new(AntiTamperingLayer::new(
                    data,
                    hash,
                    hashes_storage.clone(),
                    *block_size,
                )))
            }

            external @ (LayerConfig::Compression { .. }
            | LayerConfig::S3Opendal { .. }
            | LayerConfig::IpfsOpendal { .. }
            | LayerConfig::Solana { .. }) => {
                let kind = external.kind();
                let factory =
                    self.registry
                        .get(kind)
                        .cloned()
                        .ok_or_else(|| BuildError::MissingFactory {
                            name: name.to_owned(),
                            kind,
                        })?;
                let mut children = Vec::new();
                for dep in external.dependencies() {
                    children.push(self.build_layer(dep)?);
                }
                factory
                    .build(name, external, children, self.services)
                    .map_err(|reason| BuildError::Factory {
                        name: name.to_owned(),
                        reason,
                    })
            }
        }
    }

    /// Membership lists -> per-child boolean masks, aligned to `layers`.
    fn masks(
        layers: &[String],
        options: &DemultiplexerOptions,
    ) -> (Vec<bool>, Vec<bool>, Vec<bool>) {
        let contains = |list: &[String], name: &String| list.iter().any(|l| l == name);
        let reads = layers
            .iter()
            .map(|n| contains(&options.passthrough_reads, n))
            .collect();
        let writes = layers
            .iter()
            .map(|n| contains(&options.passthrough_writes, n))
            .collect();
        let enforced = layers
            .iter()
            .map(|n| contains(&options.enforced_layers, n))
            .collect();
        (reads, writes, enforced)
    }

    fn resolve_key(
        &self,
        name: &str,
        encryption_key: Option<&str>,
        api_key: Option<&str>,
        vault_addr: Option<&str>,
        secret_path: Option<&str>,
    ) -> BuildResult<Zeroizing<[u8; crate::layers::encryption::KEY_LEN]>> {
        let material = match (encryption_key, api_key) {
            // the fetched key takes the same formats as an inline one
            (_, Some(api_key)) => {
                let addr = vault_addr.unwrap_or_default();
                let path = secret_path.unwrap_or_default();
                Zeroizing::new(secrets::fetch_key(addr, api_key, path).map_err(|source| {
                    BuildError::Secrets {
                        name: name.to_owned(),
                        source,
                    }
                })?)
            }
            (Some(inline), None) => Zeroizing::new(inline.to_owned()),
            (None, None) => {
                return Err(BuildError::InvalidParams {
                    name: name.to_owned(),
                    reason: "either encryption_key or api_key must be provided".to_owned(),
                })
            }
        };

        crate::layers::encryption::parse_key(&material).map_err(|reason| {
            BuildError::InvalidParams {
                name: name.to_owned(),
                reason,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn local_stack_config(dir: &std::path::Path) -> Config {
        let text = format!(
            r#"
            root = "cache"

            [cache]
            type = "read_cache"
            next = "align"
            num_blocks = 8

            [align]
            type = "block_align"
            next = "store"

            [store]
            type = "local"
            root = "{}"
            "#,
            dir.display()
        );
        Config::from_toml(&text).unwrap()
    }

    #[test]
    fn builds_a_linear_stack() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_stack_config(dir.path());
        let root = build_stack(&config, &Services::none()).unwrap();

        assert_eq!(root.kind(), "read_cache");
        assert_eq!(root.children()[0].kind(), "block_align");
        assert_eq!(root.children()[0].children()[0].kind(), "local");
        root.destroy();
    }

    #[test]
    fn missing_layer_is_named_in_the_error() {
        let text = r#"
            root = "cache"

            [cache]
            type = "read_cache"
            next = "ghost"
        "#;
        let config = Config::from_toml(text).unwrap();
        let err = build_stack(&config, &Services::none()).unwrap_err();
        assert!(matches!(err, BuildError::LayerNotFound(ref n) if n == "ghost"));
    }

    #[test]
    fn cycles_are_detected() {
        let text = r#"
            root = "a"

            [a]
            type = "block_align"
            next = "b"

            [b]
            type = "block_align"
            next = "a"
        "#;
        let config = Config::from_toml(text).unwrap();
        let err = build_stack(&config, &Services::none()).unwrap_err();
        match err {
            BuildError::Cycle(chain) => {
                assert!(chain.contains("a -> b -> a"), "chain was {chain}");
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn self_cycle_is_detected() {
        let text = r#"
            root = "a"

            [a]
            type = "block_align"
            next = "a"
        "#;
        let config = Config::from_toml(text).unwrap();
        assert!(matches!(
            build_stack(&config, &Services::none()),
            Err(BuildError::Cycle(_))
        ));
    }

    #[test]
    fn shared_subgraphs_are_built_once() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            r#"
            root = "mux"

            [mux]
            type = "demultiplexer"
            layers = ["left", "right"]

            [left]
            type = "block_align"
            next = "store"

            [right]
            type = "block_align"
            next = "store"

            [store]
            type = "local"
            root = "{}"
            "#,
            dir.path().display()
        );
        let config = Config::from_toml(&text).unwrap();
        let root = build_stack(&config, &Services::none()).unwrap();

        let left_store = root.children()[0].children()[0].clone();
        let right_store = root.children()[1].children()[0].clone();
        assert!(
            Arc::ptr_eq(&left_store, &right_store),
            "shared sub-DAG must be a single instance"
        );
        root.destroy();
    }

    #[test]
    fn unregistered_external_kind_fails_with_diagnostic() {
        let text = r#"
            root = "s3"

            [s3]
            type = "s3_opendal"
            endpoint = "http://localhost:9000"
            access_key_id = "ak"
            secret_access_key = "sk"
            region = "eu-west-1"
            bucket = "data"
            root = "/"
        "#;
        let config = Config::from_toml(text).unwrap();
        let err = build_stack(&config, &Services::none()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::MissingFactory { ref kind, .. } if *kind == "s3_opendal"
        ));
    }

    #[test]
    fn bad_encryption_key_aborts_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            r#"
            root = "crypt"

            [crypt]
            type = "encryption"
            next = "store"
            encryption_key = "way-too-short"

            [store]
            type = "local"
            root = "{}"
            "#,
            dir.path().display()
        );
        let config = Config::from_toml(&text).unwrap();
        assert!(matches!(
            build_stack(&config, &Services::none()),
            Err(BuildError::InvalidParams { .. })
        ));
    }
}
