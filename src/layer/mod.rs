//! Layer abstraction for the STRATAFS stack
//!
//! Every layer in the stack implements the same file-operation interface
//! ([`Layer`]) and either terminates requests (terminal layers) or forwards
//! them, possibly transformed, to one or more child layers. Layers compose
//! into a DAG with a single root; the host issues operations against the
//! root.
//!
//! Two contracts every non-terminal layer honors:
//!
//! - The per-request [`OpContext`] received from the parent is passed to
//!   every child invocation. The host relies on this to carry the logical
//!   pathname alongside a numeric descriptor.
//! - A layer never retains a reference to a child's internal state across
//!   operations; children are reached only through the trait.

use std::sync::Arc;
use thiserror::Error;

pub mod stat;

pub use stat::{DirEntry, FileStat};

/// File descriptor as assigned by a terminal layer (or by a fan-out layer
/// for its aggregates) and forwarded unchanged by wrapping layers.
pub type Fd = u64;

/// Shared handle to a layer instance. A sub-DAG referenced by more than one
/// parent is a shared `Arc`, built exactly once.
pub type LayerRef = Arc<dyn Layer>;

/// Layer operation errors
///
/// Every variant maps onto an errno-style code via [`LayerError::errno`],
/// which the FUSE host negates and returns to the kernel.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Underlying I/O failure from a terminal layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Descriptor is not known to the layer that received it
    #[error("Bad file descriptor: {0}")]
    BadDescriptor(Fd),

    /// Caller violated an argument contract (alignment, minimum size, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not supported by this layer
    #[error("Operation {0} not supported by the {1} layer")]
    Unsupported(&'static str, &'static str),

    /// Remote terminal transport failure, narrowed to EIO
    #[error("Remote transport error: {0}")]
    Remote(String),

    /// Error code reported by the remote peer
    #[error("Remote peer reported errno {0}")]
    RemoteErrno(i32),

    /// Data failed an integrity or decryption check
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// The layer was destroyed and can no longer serve operations
    #[error("Layer {0} has been destroyed")]
    Destroyed(&'static str),
}

pub type LayerResult<T> = Result<T, LayerError>;

impl LayerError {
    /// Errno-style code for this error, suitable for `-errno` replies.
    pub fn errno(&self) -> i32 {
        match self {
            LayerError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            LayerError::BadDescriptor(_) => libc::EBADF,
            LayerError::InvalidArgument(_) => libc::EINVAL,
            LayerError::Unsupported(_, _) => libc::ENOSYS,
            LayerError::Remote(_) => libc::EIO,
            LayerError::RemoteErrno(code) => *code,
            LayerError::Integrity(_) => libc::EIO,
            LayerError::Destroyed(_) => libc::EIO,
        }
    }

    /// True when the error denotes a missing file (`ENOENT`).
    pub fn is_not_found(&self) -> bool {
        self.errno() == libc::ENOENT
    }
}

/// Per-request application context, passed explicitly to every operation.
///
/// The host attaches the logical pathname of an operation executing against
/// a numeric descriptor so that lower layers (e.g. the remote terminal) can
/// use names they would not otherwise see. The value is only meaningful for
/// the duration of the operation it was created for.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    path: Option<String>,
}

impl OpContext {
    /// Context with no attached pathname.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context carrying the logical pathname of the operation.
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// The logical pathname attached by the host, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

/// Open flags, carried as the host's raw `O_*` bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);

    /// Raw bit set.
    pub fn bits(self) -> i32 {
        self.0
    }

    /// Add flag bits, builder style.
    pub fn with(self, bits: i32) -> Self {
        OpenFlags(self.0 | bits)
    }

    pub fn has_create(self) -> bool {
        self.0 & libc::O_CREAT != 0
    }

    pub fn has_trunc(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    pub fn has_excl(self) -> bool {
        self.0 & libc::O_EXCL != 0
    }

    pub fn has_append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }

    /// Access mode bits (`O_RDONLY` / `O_WRONLY` / `O_RDWR`).
    pub fn access_mode(self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    /// True when the descriptor may be read from.
    pub fn readable(self) -> bool {
        self.access_mode() != libc::O_WRONLY
    }

    /// True when the descriptor may be written to.
    pub fn writable(self) -> bool {
        self.access_mode() != libc::O_RDONLY
    }

    /// True when the open itself mutates the target (creation/truncation),
    /// which fan-out layers treat as a write-type operation.
    pub fn is_mutating(self) -> bool {
        self.has_create() || self.has_trunc()
    }
}

/// The uniform file-operation interface implemented by every layer.
///
/// Operations mirror their POSIX counterparts. `pread` returns the number
/// of bytes produced (0 at end of file); `pwrite` returns the number of
/// bytes written and extends the file when writing past its end. Errors are
/// returned as [`LayerError`] values; layers never panic on bad input.
pub trait Layer: Send + Sync + std::fmt::Debug {
    /// Stable kind name, used in logs and build diagnostics.
    fn kind(&self) -> &'static str;

    /// Children of this layer, in order. Empty for terminal layers.
    fn children(&self) -> &[LayerRef];

    fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd>;

    fn close(&self, ctx: &OpContext, fd: Fd) -> LayerResult<()>;

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize>;

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize>;

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()>;

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()>;

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat>;

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat>;

    fn unlink(&self, ctx: &OpContext, path: &str) -> LayerResult<()>;

    fn fsync(&self, ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()>;

    fn readdir(&self, ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>>;

    fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> LayerResult<()>;

    fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()>;

    /// Release all layer-local state, then destroy children.
    ///
    /// Must be idempotent: teardown of a partially built graph may reach
    /// the same shared sub-DAG more than once. Layer-local state is
    /// released before the recursion so the teardown order is root-to-leaf.
    fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_classification() {
        let ro = OpenFlags::RDONLY;
        assert!(ro.readable());
        assert!(!ro.writable());
        assert!(!ro.is_mutating());

        let creating = OpenFlags::RDWR.with(libc::O_CREAT);
        assert!(creating.has_create());
        assert!(creating.is_mutating());
        assert!(creating.readable() && creating.writable());

        let truncating = OpenFlags::WRONLY.with(libc::O_TRUNC);
        assert!(truncating.has_trunc());
        assert!(truncating.is_mutating());
        assert!(!truncating.readable());
    }

    #[test]
    fn errno_mapping() {
        let err = LayerError::InvalidArgument("misaligned".into());
        assert_eq!(err.errno(), libc::EINVAL);

        let err = LayerError::Io(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(err.is_not_found());

        let err = LayerError::Remote("connection reset".into());
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn op_context_path() {
        assert_eq!(OpContext::new().path(), None);
        assert_eq!(OpContext::with_path("/a/b").path(), Some("/a/b"));
    }
}
