//! Read cache layer
//!
//! Serves `pread` from an in-memory block cache and keeps cached entries
//! coherent across `pwrite`, `ftruncate` and `unlink`. Entries are keyed by
//! `"<inode>/<block_index>"` — keying by inode rather than pathname keeps
//! the cache valid across renames and hard links. Eviction policy is wholly
//! delegated to the cache plug-in ([`BlockCache`]); this layer only decides
//! *which* keys must go when the underlying bytes stop being authoritative.
//!
//! The cache assumes block-aligned request offsets (which the FUSE host
//! delivers). A misaligned `pread` is forwarded uncached and a misaligned
//! `pwrite` invalidates the touched blocks instead of updating them, so
//! coherence survives either way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::BlockCache;
use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerRef, LayerResult, OpContext, OpenFlags,
};

#[derive(Debug)]
struct InodeInfo {
    /// Number of descriptors currently open against the inode.
    counter: u64,
    /// Set when the name was unlinked while descriptors were still open;
    /// the last close performs the deferred eviction.
    unlinked: bool,
}

/// Block cache with inode-scoped lifecycle management.
pub struct ReadCacheLayer {
    next: [LayerRef; 1],
    block_size: u64,
    cache: Arc<dyn BlockCache>,
    fd_to_inode: DashMap<Fd, u64>,
    inode_to_info: DashMap<u64, InodeInfo>,
    hits: AtomicU64,
    misses: AtomicU64,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for ReadCacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCacheLayer")
            .field("block_size", &self.block_size)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl ReadCacheLayer {
    /// Wrap `next` with a cache of `block_size`-byte blocks stored in the
    /// given plug-in.
    pub fn new(next: LayerRef, block_size: u64, cache: Arc<dyn BlockCache>) -> Self {
        ReadCacheLayer {
            next: [next],
            block_size: block_size.max(1),
            cache,
            fd_to_inode: DashMap::new(),
            inode_to_info: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    fn next(&self) -> &LayerRef {
        &self.next[0]
    }

    fn block_key(inode: u64, index: u64) -> String {
        format!("{inode}/{index}")
    }

    /// Open-descriptor count and unlinked flag for an inode, when the
    /// layer is tracking it. Diagnostics only.
    pub fn inode_state(&self, inode: u64) -> Option<(u64, bool)> {
        self.inode_to_info
            .get(&inode)
            .map(|info| (info.counter, info.unlinked))
    }

    /// Hit/miss counters, for diagnostics and tests.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn inode_of(&self, fd: Fd) -> Option<u64> {
        self.fd_to_inode.get(&fd).map(|entry| *entry)
    }

    /// Drop every cached block of `inode` in `[start, end]` (inclusive).
    fn evict_range(&self, inode: u64, start: u64, end: u64) {
        let mut index = start;
        while index <= end {
            self.cache.remove(&Self::block_key(inode, index));
            index += 1;
        }
    }

    /// Flush a run of `count` consecutive missed blocks starting at
    /// `first_block` with a single coalesced downstream read, filling the
    /// caller buffer at `*total` and inserting the fetched blocks.
    ///
    /// A fetched block enters the cache only when its full extent was seen:
    /// either the whole `block_size` bytes, or a shorter tail that the
    /// downstream read proved to be end-of-file. A block cut short by the
    /// request window alone is not cached, since a later full-block read
    /// would otherwise be served truncated.
    fn fill_misses(
        &self,
        ctx: &OpContext,
        fd: Fd,
        inode: u64,
        buf: &mut [u8],
        offset: u64,
        total: &mut usize,
        first_block: u64,
        count: u64,
    ) -> LayerResult<usize> {
        let bs = self.block_size as usize;
        let want = (count as usize * bs).min(buf.len() - *total);
        let window = &mut buf[*total..*total + want];
        let got = self
            .next()
            .pread(ctx, fd, window, offset + *total as u64)?;

        let eof_inside = got < want;
        let mut consumed = 0;
        let mut block = first_block;
        while consumed < got {
            let len = (got - consumed).min(bs);
            let is_tail = consumed + len == got;
            if len == bs || (is_tail && eof_inside) {
                self.cache
                    .insert(&Self::block_key(inode, block), &window[consumed..consumed + len]);
            }
            consumed += len;
            block += 1;
        }

        *total += got;
        Ok(got)
    }

    /// Cache maintenance shared by `ftruncate` and `truncate`.
    fn apply_truncate(&self, inode: u64, old_len: u64, new_len: u64) {
        let bs = self.block_size;
        if new_len > old_len {
            // the file grew: the block that used to be last gains zeros up
            // to the block boundary; newly covered blocks are not
            // materialized
            if old_len == 0 {
                return;
            }
            let last = (old_len - 1) / bs;
            let key = Self::block_key(inode, last);
            if let Some(mut block) = self.cache.get(&key) {
                let have = block.len();
                let room = (bs as usize).saturating_sub(have);
                let added = (new_len - old_len) as usize;
                let zeros = room.min(added);
                if zeros > 0 {
                    block.resize(have + zeros, 0);
                    self.cache.insert(&key, &block);
                }
            }
        } else {
            if old_len == 0 {
                return;
            }
            let last_old = (old_len - 1) / bs;
            if new_len % bs == 0 {
                self.evict_range(inode, new_len / bs, last_old);
            } else {
                // the new last block survives, trimmed to the residue
                let keep = new_len / bs;
                let key = Self::block_key(inode, keep);
                if let Some(block) = self.cache.get(&key) {
                    let residue = (new_len % bs) as usize;
                    let trimmed = &block[..residue.min(block.len())];
                    self.cache.insert(&key, trimmed);
                }
                if keep + 1 <= last_old {
                    self.evict_range(inode, keep + 1, last_old);
                }
            }
        }
    }

    /// Overlay a write onto the blocks it covers. Only blocks already in
    /// cache are updated; absent blocks stay absent. A partial slice is
    /// merged over the existing entry so a cached full block never shrinks
    /// to the write's tail.
    fn apply_write(&self, inode: u64, buf: &[u8], offset: u64) {
        let bs = self.block_size as usize;
        let start = offset / self.block_size;
        let end = (offset + buf.len() as u64 - 1) / self.block_size;

        for (j, index) in (start..=end).enumerate() {
            let key = Self::block_key(inode, index);
            if !self.cache.contains(&key) {
                continue;
            }
            let lo = j * bs;
            let hi = ((j + 1) * bs).min(buf.len());
            let slice = &buf[lo..hi];
            if slice.len() == bs {
                self.cache.insert(&key, slice);
            } else if let Some(mut existing) = self.cache.get(&key) {
                if existing.len() < slice.len() {
                    existing.resize(slice.len(), 0);
                }
                existing[..slice.len()].copy_from_slice(slice);
                self.cache.insert(&key, &existing);
            }
        }
    }
}

impl Layer for ReadCacheLayer {
    fn kind(&self) -> &'static str {
        "read_cache"
    }

    fn children(&self) -> &[LayerRef] {
        &self.next
    }

    fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        let trunc = flags.has_trunc();
        let create = flags.has_create();

        // pre-open lstat: learn the inode and prior size; a missing file is
        // only acceptable when the open may create it
        let pre = self.next().lstat(ctx, path);
        let (mut inode, prior_size) = match pre {
            Ok(st) => (Some(st.ino), st.size),
            Err(err) => {
                if !create {
                    return Err(err);
                }
                (None, 0)
            }
        };

        let fd = self.next().open(ctx, path, flags, mode)?;

        // freshly created file: fstat the descriptor to learn the inode
        let inode = match inode.take() {
            Some(ino) => ino,
            None => match self.next().fstat(ctx, fd) {
                Ok(st) => st.ino,
                Err(err) => {
                    let _ = self.next().close(ctx, fd);
                    return Err(err);
                }
            },
        };

        self.fd_to_inode.insert(fd, inode);
        self.inode_to_info
            .entry(inode)
            .and_modify(|info| info.counter += 1)
            .or_insert(InodeInfo {
                counter: 1,
                unlinked: false,
            });

        // O_TRUNC wiped the prior content; its cached blocks are stale
        if trunc && prior_size > 0 {
            self.evict_range(inode, 0, (prior_size - 1) / self.block_size);
        }

        Ok(fd)
    }

    fn close(&self, ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        let inode = match self.inode_of(fd) {
            Some(ino) => ino,
            None => {
                log::error!("[READ_CACHE] close of untracked descriptor {fd}");
                return self.next().close(ctx, fd);
            }
        };

        let last_unlinked = self
            .inode_to_info
            .get(&inode)
            .map(|info| info.unlinked && info.counter == 1)
            .unwrap_or(false);

        if last_unlinked {
            // last descriptor of an unlinked file: evict before the
            // descriptor (and with it the inode) goes away
            let st = self.next().fstat(ctx, fd)?;
            self.evict_range(inode, 0, st.size / self.block_size);
            self.next().close(ctx, fd)?;
            self.fd_to_inode.remove(&fd);
            self.inode_to_info.remove(&inode);
        } else {
            self.next().close(ctx, fd)?;
            self.fd_to_inode.remove(&fd);
            if let Some(mut info) = self.inode_to_info.get_mut(&inode) {
                if info.counter == 0 {
                    log::error!("[READ_CACHE] descriptor counter underflow for inode {inode}");
                } else {
                    info.counter -= 1;
                }
            }
        }

        Ok(())
    }

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let inode = match self.inode_of(fd) {
            Some(ino) => ino,
            None => {
                log::error!("[READ_CACHE] pread on untracked descriptor {fd}");
                return self.next().pread(ctx, fd, buf, offset);
            }
        };

        // misaligned requests bypass the cache entirely
        if offset % self.block_size != 0 {
            return self.next().pread(ctx, fd, buf, offset);
        }

        let bs = self.block_size as usize;
        let start = offset / self.block_size;
        let end = (offset + buf.len() as u64 - 1) / self.block_size;

        let mut total = 0usize;
        let mut pending = 0u64;

        for index in start..=end {
            let key = Self::block_key(inode, index);
            let cached = self.cache.get(&key);

            match cached {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    pending += 1;
                }
                Some(block) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);

                    // coalesce the accumulated misses into one downstream
                    // read before consuming the hit
                    if pending > 0 {
                        let want = (pending as usize * bs).min(buf.len() - total);
                        let got =
                            self.fill_misses(ctx, fd, inode, buf, offset, &mut total, index - pending, pending)?;
                        pending = 0;
                        if got < want {
                            // downstream ended early; the bytes after the
                            // gap cannot be placed
                            return Ok(total);
                        }
                    }

                    let avail = buf.len() - total;
                    let copy = block.len().min(avail);
                    buf[total..total + copy].copy_from_slice(&block[..copy]);
                    total += copy;

                    if copy == avail {
                        return Ok(total);
                    }
                    if block.len() < bs {
                        // short cached block marks end of file
                        return Ok(total);
                    }
                }
            }
        }

        if pending > 0 {
            self.fill_misses(ctx, fd, inode, buf, offset, &mut total, end + 1 - pending, pending)?;
        }

        Ok(total)
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        let written = self.next().pwrite(ctx, fd, buf, offset)?;
        if written == 0 {
            return Ok(0);
        }

        let inode = match self.inode_of(fd) {
            Some(ino) => ino,
            None => {
                log::error!("[READ_CACHE] pwrite on untracked descriptor {fd}");
                return Ok(written);
            }
        };

        if offset % self.block_size == 0 {
            self.apply_write(inode, &buf[..written], offset);
        } else {
            // a misaligned write cannot be sliced onto block boundaries;
            // invalidate instead of going stale
            let start = offset / self.block_size;
            let end = (offset + written as u64 - 1) / self.block_size;
            self.evict_range(inode, start, end);
        }

        Ok(written)
    }

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        let old_len = self.next().fstat(ctx, fd)?.size;
        self.next().ftruncate(ctx, fd, len)?;
        if let Some(inode) = self.inode_of(fd) {
            self.apply_truncate(inode, old_len, len);
        } else {
            log::error!("[READ_CACHE] ftruncate on untracked descriptor {fd}");
        }
        Ok(())
    }

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        let st = self.next().lstat(ctx, path)?;
        self.next().truncate(ctx, path, len)?;
        self.apply_truncate(st.ino, st.size, len);
        Ok(())
    }

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        self.next().lstat(ctx, path)
    }

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        self.next().fstat(ctx, fd)
    }

    fn unlink(&self, ctx: &OpContext, path: &str) -> LayerResult<()> {
        let st = self.next().lstat(ctx, path)?;
        self.next().unlink(ctx, path)?;

        let no_open_descriptors = self
            .inode_to_info
            .get(&st.ino)
            .map(|info| info.counter == 0);

        match no_open_descriptors {
            // never opened through this layer: nothing can be cached
            None => {}
            Some(true) => {
                self.evict_range(st.ino, 0, st.size / self.block_size);
                self.inode_to_info.remove(&st.ino);
            }
            Some(false) => {
                // descriptors are still open: the last close evicts
                if let Some(mut info) = self.inode_to_info.get_mut(&st.ino) {
                    info.unlinked = true;
                }
            }
        }

        Ok(())
    }

    fn fsync(&self, ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()> {
        self.next().fsync(ctx, fd, datasync)
    }

    fn readdir(&self, ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>> {
        self.next().readdir(ctx, path)
    }

    fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        // entries are keyed by inode, which survives the rename
        self.next().rename(ctx, from, to)
    }

    fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        self.next().chmod(ctx, path, mode)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (hits, misses) = self.stats();
        log::info!("[READ_CACHE] destroy: {hits} hits, {misses} misses");
        self.fd_to_inode.clear();
        self.inode_to_info.clear();
        self.next().destroy();
    }
}
