//! Layer implementations
//!
//! The concrete layers that a configuration can compose:
//!
//! - Terminals: [`local`] (host file system), [`remote`] (framed TCP peer)
//! - Transforms: [`encryption`] (block-addressed AES-XTS),
//!   [`block_align`] (alignment shim), [`read_cache`] (block cache),
//!   [`anti_tampering`] (digest verification)
//! - Routing: [`demultiplexer`] (fan-out with per-child policy)
//! - Instrumentation: [`benchmark`]
//!
//! Invisible-storage kinds (S3, IPFS, Solana) and compression are reached
//! through factory registration on the builder; their implementations live
//! outside the core.

pub mod anti_tampering;
pub mod benchmark;
pub mod block_align;
pub mod demultiplexer;
pub mod encryption;
pub mod local;
pub mod read_cache;
pub mod remote;

pub use anti_tampering::AntiTamperingLayer;
pub use benchmark::BenchmarkLayer;
pub use block_align::BlockAlignLayer;
pub use demultiplexer::DemultiplexerLayer;
pub use encryption::EncryptionLayer;
pub use local::LocalLayer;
pub use read_cache::ReadCacheLayer;
pub use remote::RemoteLayer;
