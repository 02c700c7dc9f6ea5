//! Block alignment layer
//!
//! Presents arbitrary `(offset, len)` requests to its child as
//! block-aligned ones: the requested range is rounded outward to
//! `block_size` boundaries, a single aligned downstream request is issued,
//! and the result is trimmed for the caller. Unaligned writes are completed
//! by read-modify-write of the boundary blocks. Layers below (encryption,
//! anti-tampering) rely on this to see aligned traffic only.

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

/// Purely arithmetic alignment shim; no state beyond the block size.
#[derive(Debug)]
pub struct BlockAlignLayer {
    next: [LayerRef; 1],
    block_size: u64,
}

impl BlockAlignLayer {
    pub fn new(next: LayerRef, block_size: u64) -> Self {
        BlockAlignLayer {
            next: [next],
            block_size: block_size.max(1),
        }
    }

    fn next(&self) -> &LayerRef {
        &self.next[0]
    }

    fn is_aligned(&self, len: usize, offset: u64) -> bool {
        offset % self.block_size == 0 && len as u64 % self.block_size == 0
    }

    /// Aligned window `[lo, hi)` covering `[offset, offset + len)`.
    fn window(&self, len: usize, offset: u64) -> (u64, u64) {
        let bs = self.block_size;
        let lo = offset - offset % bs;
        let end = offset + len as u64;
        let hi = end.div_ceil(bs) * bs;
        (lo, hi)
    }
}

impl Layer for BlockAlignLayer {
    fn kind(&self) -> &'static str {
        "block_align"
    }

    fn children(&self) -> &[LayerRef] {
        &self.next
    }

    fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        self.next().open(ctx, path, flags, mode)
    }

    fn close(&self, ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        self.next().close(ctx, fd)
    }

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.is_aligned(buf.len(), offset) {
            return self.next().pread(ctx, fd, buf, offset);
        }

        let (lo, hi) = self.window(buf.len(), offset);
        let mut window = vec![0u8; (hi - lo) as usize];
        let got = self.next().pread(ctx, fd, &mut window, lo)?;

        let lead = (offset - lo) as usize;
        if got <= lead {
            return Ok(0);
        }
        let avail = got - lead;
        let copy = avail.min(buf.len());
        buf[..copy].copy_from_slice(&window[lead..lead + copy]);
        Ok(copy)
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.is_aligned(buf.len(), offset) {
            return self.next().pwrite(ctx, fd, buf, offset);
        }

        // read-modify-write: fetch the aligned window, overlay the caller
        // bytes, write the window back in one aligned request
        let (lo, hi) = self.window(buf.len(), offset);
        let mut window = vec![0u8; (hi - lo) as usize];
        let got = self.next().pread(ctx, fd, &mut window, lo)?;

        let lead = (offset - lo) as usize;
        window[lead..lead + buf.len()].copy_from_slice(buf);

        // preserve pre-existing bytes past the overlay, but never write
        // beyond what the file and the overlay together cover
        let effective = got.max(lead + buf.len());
        let written = self.next().pwrite(ctx, fd, &window[..effective], lo)?;
        if written < effective {
            return Err(LayerError::Io(std::io::Error::from_raw_os_error(
                libc::EIO,
            )));
        }
        Ok(buf.len())
    }

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        self.next().ftruncate(ctx, fd, len)
    }

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        self.next().truncate(ctx, path, len)
    }

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        self.next().lstat(ctx, path)
    }

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        self.next().fstat(ctx, fd)
    }

    fn unlink(&self, ctx: &OpContext, path: &str) -> LayerResult<()> {
        self.next().unlink(ctx, path)
    }

    fn fsync(&self, ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()> {
        self.next().fsync(ctx, fd, datasync)
    }

    fn readdir(&self, ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>> {
        self.next().readdir(ctx, path)
    }

    fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        self.next().rename(ctx, from, to)
    }

    fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        self.next().chmod(ctx, path, mode)
    }

    fn destroy(&self) {
        self.next().destroy();
    }
}
