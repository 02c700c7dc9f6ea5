//! Anti-tampering layer
//!
//! Splits traffic between a data child and a hash child: file content goes
//! to the data layer, while a SHA-256 digest of every whole written block
//! is stored through the hash layer in a sidecar file under the configured
//! `hashes_storage` prefix (digest of block `i` at offset `i * 32`). Reads
//! recompute the digest of each whole block and compare against the stored
//! one; a mismatch fails with `EIO`.
//!
//! Digests cover whole `block_size` blocks only; a trailing partial block
//! is written but not verified. Offsets must be block-aligned, the same
//! contract the encryption layer imposes, and satisfied by stacking a
//! block-align layer above.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

const DIGEST_LEN: usize = 32;

/// Digest-verifying fan-out over a data layer and a hash layer.
#[derive(Debug)]
pub struct AntiTamperingLayer {
    children: [LayerRef; 2],
    hashes_storage: String,
    block_size: u64,
    /// data descriptor -> descriptor of the digest sidecar
    hash_fds: DashMap<Fd, Fd>,
    destroyed: AtomicBool,
}

impl AntiTamperingLayer {
    pub fn new(
        data_layer: LayerRef,
        hash_layer: LayerRef,
        hashes_storage: impl Into<String>,
        block_size: u64,
    ) -> Self {
        AntiTamperingLayer {
            children: [data_layer, hash_layer],
            hashes_storage: hashes_storage.into(),
            block_size: block_size.max(1),
            hash_fds: DashMap::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    fn data(&self) -> &LayerRef {
        &self.children[0]
    }

    fn hash(&self) -> &LayerRef {
        &self.children[1]
    }

    /// Sidecar path for a data path.
    fn digest_path(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.hashes_storage.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn digest_fd(&self, fd: Fd) -> LayerResult<Fd> {
        self.hash_fds
            .get(&fd)
            .map(|entry| *entry)
            .ok_or(LayerError::BadDescriptor(fd))
    }

    fn check_alignment(&self, offset: u64) -> LayerResult<()> {
        if offset % self.block_size != 0 {
            return Err(LayerError::InvalidArgument(format!(
                "offset {offset} is not aligned to the {}-byte digest block",
                self.block_size
            )));
        }
        Ok(())
    }

    fn block_digest(block: &[u8]) -> [u8; DIGEST_LEN] {
        Sha256::digest(block).into()
    }
}

impl Layer for AntiTamperingLayer {
    fn kind(&self) -> &'static str {
        "anti_tampering"
    }

    fn children(&self) -> &[LayerRef] {
        &self.children
    }

    fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        let fd = self.data().open(ctx, path, flags, mode)?;

        // the sidecar is always opened read-write: reads need the stored
        // digests, writes update them
        let sidecar = OpenFlags::RDWR.with(libc::O_CREAT);
        match self.hash().open(ctx, &self.digest_path(path), sidecar, 0o600) {
            Ok(hash_fd) => {
                self.hash_fds.insert(fd, hash_fd);
                Ok(fd)
            }
            Err(err) => {
                let _ = self.data().close(ctx, fd);
                Err(err)
            }
        }
    }

    fn close(&self, ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        if let Some((_, hash_fd)) = self.hash_fds.remove(&fd) {
            if let Err(err) = self.hash().close(ctx, hash_fd) {
                log::warn!("[ANTI_TAMPERING] closing digest sidecar failed: {err}");
            }
        }
        self.data().close(ctx, fd)
    }

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_alignment(offset)?;

        let got = self.data().pread(ctx, fd, buf, offset)?;
        if got == 0 {
            return Ok(0);
        }

        let hash_fd = self.digest_fd(fd)?;
        let bs = self.block_size as usize;
        let first_block = offset / self.block_size;

        let mut consumed = 0;
        let mut block = first_block;
        while consumed + bs <= got {
            let mut stored = [0u8; DIGEST_LEN];
            let read = self
                .hash()
                .pread(ctx, hash_fd, &mut stored, block * DIGEST_LEN as u64)?;
            if read == DIGEST_LEN {
                let actual = Self::block_digest(&buf[consumed..consumed + bs]);
                if actual != stored {
                    log::error!(
                        "[ANTI_TAMPERING] digest mismatch on block {block} (offset {})",
                        block * self.block_size
                    );
                    return Err(LayerError::Integrity(format!(
                        "block {block} failed digest verification"
                    )));
                }
            }
            // a short or missing digest means the block was never written
            // through this layer; nothing to verify
            consumed += bs;
            block += 1;
        }

        Ok(got)
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_alignment(offset)?;

        let written = self.data().pwrite(ctx, fd, buf, offset)?;
        if written == 0 {
            return Ok(0);
        }

        let hash_fd = self.digest_fd(fd)?;
        let bs = self.block_size as usize;
        let first_block = offset / self.block_size;

        let mut consumed = 0;
        let mut block = first_block;
        while consumed + bs <= written {
            let digest = Self::block_digest(&buf[consumed..consumed + bs]);
            self.hash()
                .pwrite(ctx, hash_fd, &digest, block * DIGEST_LEN as u64)?;
            consumed += bs;
            block += 1;
        }

        Ok(written)
    }

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        self.data().ftruncate(ctx, fd, len)?;
        // digests past the new end are stale; the partial last block (if
        // any) is dropped too since its content changed
        let hash_fd = self.digest_fd(fd)?;
        self.hash()
            .ftruncate(ctx, hash_fd, (len / self.block_size) * DIGEST_LEN as u64)
    }

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        self.data().truncate(ctx, path, len)?;
        self.hash().truncate(
            ctx,
            &self.digest_path(path),
            (len / self.block_size) * DIGEST_LEN as u64,
        )
    }

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        self.data().lstat(ctx, path)
    }

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        self.data().fstat(ctx, fd)
    }

    fn unlink(&self, ctx: &OpContext, path: &str) -> LayerResult<()> {
        self.data().unlink(ctx, path)?;
        match self.hash().unlink(ctx, &self.digest_path(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn fsync(&self, ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()> {
        self.data().fsync(ctx, fd, datasync)?;
        let hash_fd = self.digest_fd(fd)?;
        self.hash().fsync(ctx, hash_fd, datasync)
    }

    fn readdir(&self, ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>> {
        self.data().readdir(ctx, path)
    }

    fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        self.data().rename(ctx, from, to)?;
        match self
            .hash()
            .rename(ctx, &self.digest_path(from), &self.digest_path(to))
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        self.data().chmod(ctx, path, mode)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.hash_fds.clear();
        self.data().destroy();
        self.hash().destroy();
    }
}
