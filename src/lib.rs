//! # STRATAFS - Modular Layered File System
//!
//! A user-space file system built as a configurable stack of pluggable
//! layers. Each layer implements the same file-operation interface and
//! forwards, transforms, or terminates requests issued by a host (a FUSE
//! bridge in the reference deployment). A declarative TOML configuration
//! names the layers, their parameters, and their composition; the builder
//! instantiates that graph at startup.
//!
//! ## Architecture
//!
//! - `layer`: the operation trait every layer implements, plus the shared
//!   request types (context, flags, stat records, errors)
//! - `layers`: the concrete layer implementations (read cache, encryption,
//!   demultiplexer, block-align, benchmark, local and remote terminals,
//!   anti-tampering)
//! - `config`: declarative configuration model and the DAG builder
//! - `cache`: the cache plug-in boundary and its LRU implementation
//! - `services`: explicit handles for process-wide collaborators
//!   (metadata key-value store)
//! - `secrets`: encryption key fetch from a Vault-style endpoint
//! - `logging`: log facade initialization driven by the config

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod layer;
pub mod layers;
pub mod logging;
pub mod secrets;
pub mod services;

// Re-export commonly used types
pub use config::builder::{build_stack, build_stack_with_registry, BuildError, LayerRegistry};
pub use config::{Config, ConfigError, LayerConfig, LogMode};
pub use layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};
pub use services::Services;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
