//! Demultiplexer layer
//!
//! Fans requests out to an ordered list of children under a per-child
//! policy expressed as three boolean masks:
//!
//! - `passthrough_reads[i]` — reads may be served from child `i` without
//!   consulting the others; flagged children are tried in order and the
//!   first success wins. With no flag set, reads go to child 0.
//! - `passthrough_writes[i]` — `pwrite` is delivered to child `i`. With no
//!   flag set, writes broadcast to every child.
//! - `enforced[i]` — a write-type operation (`pwrite`, `ftruncate`,
//!   `truncate`, `unlink`, `rename`, `chmod`, `fsync`, and `open` with
//!   create/trunc) must succeed on child `i` for the aggregate to succeed.
//!   Failures of non-enforced children are logged and recorded, never
//!   propagated.
//!
//! Descriptors returned by `open` are aggregate handles owned by this
//! layer, mapped to the per-child descriptors behind them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

/// Fan-out layer with per-child passthrough/enforcement policy.
#[derive(Debug)]
pub struct DemultiplexerLayer {
    children: Vec<LayerRef>,
    passthrough_reads: Vec<bool>,
    passthrough_writes: Vec<bool>,
    enforced: Vec<bool>,
    /// Aggregate descriptor -> per-child descriptors. `None` marks a child
    /// whose open failed non-fatally; operations skip it.
    tables: DashMap<Fd, Vec<Option<Fd>>>,
    next_fd: AtomicU64,
    destroyed: AtomicBool,
}

impl DemultiplexerLayer {
    /// Create a fan-out over `children` with the given policy masks. The
    /// masks must be as long as the child list.
    pub fn new(
        children: Vec<LayerRef>,
        passthrough_reads: Vec<bool>,
        passthrough_writes: Vec<bool>,
        enforced: Vec<bool>,
    ) -> Self {
        debug_assert_eq!(children.len(), passthrough_reads.len());
        debug_assert_eq!(children.len(), passthrough_writes.len());
        debug_assert_eq!(children.len(), enforced.len());
        DemultiplexerLayer {
            children,
            passthrough_reads,
            passthrough_writes,
            enforced,
            tables: DashMap::new(),
            next_fd: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }

    fn child_fds(&self, fd: Fd) -> LayerResult<Vec<Option<Fd>>> {
        self.tables
            .get(&fd)
            .map(|entry| entry.clone())
            .ok_or(LayerError::BadDescriptor(fd))
    }

    /// Child indexes consulted for reads, in priority order.
    fn read_order(&self) -> Vec<usize> {
        let flagged: Vec<usize> = (0..self.children.len())
            .filter(|&i| self.passthrough_reads[i])
            .collect();
        if flagged.is_empty() {
            vec![0]
        } else {
            flagged
        }
    }

    /// Child indexes receiving a `pwrite`.
    fn write_targets(&self) -> Vec<usize> {
        let flagged: Vec<usize> = (0..self.children.len())
            .filter(|&i| self.passthrough_writes[i])
            .collect();
        if flagged.is_empty() {
            (0..self.children.len()).collect()
        } else {
            flagged
        }
    }

    /// Fold one child result into the running aggregate under the
    /// enforcement rule.
    fn absorb<T>(
        &self,
        op: &'static str,
        index: usize,
        result: LayerResult<T>,
        first_error: &mut Option<LayerError>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                if self.enforced[index] {
                    log::error!("[DEMUX] enforced child {index} failed {op}: {err}");
                    if first_error.is_none() {
                        *first_error = Some(err);
                    }
                } else {
                    log::warn!("[DEMUX] child {index} failed {op} (not enforced): {err}");
                }
                None
            }
        }
    }

    /// Broadcast a path-based write-type operation to every child.
    fn broadcast_path_op(
        &self,
        op: &'static str,
        mut call: impl FnMut(&LayerRef) -> LayerResult<()>,
    ) -> LayerResult<()> {
        let mut first_error = None;
        for (index, child) in self.children.iter().enumerate() {
            let result = call(child);
            self.absorb(op, index, result, &mut first_error);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Layer for DemultiplexerLayer {
    fn kind(&self) -> &'static str {
        "demultiplexer"
    }

    fn children(&self) -> &[LayerRef] {
        &self.children
    }

    fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        let mutating = flags.is_mutating();
        let mut fds: Vec<Option<Fd>> = Vec::with_capacity(self.children.len());
        let mut first_error = None;
        let mut enforced_failure = None;

        for (index, child) in self.children.iter().enumerate() {
            match child.open(ctx, path, flags, mode) {
                Ok(fd) => fds.push(Some(fd)),
                Err(err) => {
                    if mutating && self.enforced[index] {
                        log::error!("[DEMUX] enforced child {index} failed open: {err}");
                        enforced_failure = Some(err);
                        fds.push(None);
                    } else {
                        log::warn!("[DEMUX] child {index} failed open: {err}");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        fds.push(None);
                    }
                }
            }
        }

        let all_failed = fds.iter().all(Option::is_none);
        if enforced_failure.is_some() || all_failed {
            // roll back whatever did open
            for (index, fd) in fds.iter().enumerate() {
                if let Some(fd) = fd {
                    if let Err(err) = self.children[index].close(ctx, *fd) {
                        log::warn!("[DEMUX] rollback close failed on child {index}: {err}");
                    }
                }
            }
            return Err(enforced_failure
                .or(first_error)
                .unwrap_or(LayerError::Remote("open failed on every child".into())));
        }

        let aggregate = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.tables.insert(aggregate, fds);
        Ok(aggregate)
    }

    fn close(&self, ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        let fds = match self.tables.remove(&fd) {
            Some((_, fds)) => fds,
            None => return Err(LayerError::BadDescriptor(fd)),
        };
        let mut first_error = None;
        for (index, child_fd) in fds.iter().enumerate() {
            if let Some(child_fd) = child_fd {
                if let Err(err) = self.children[index].close(ctx, *child_fd) {
                    log::warn!("[DEMUX] child {index} failed close: {err}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        let fds = self.child_fds(fd)?;
        let mut last_error = None;
        for index in self.read_order() {
            let Some(child_fd) = fds[index] else { continue };
            match self.children[index].pread(ctx, child_fd, buf, offset) {
                Ok(n) => return Ok(n),
                Err(err) => {
                    log::warn!("[DEMUX] child {index} failed pread: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(LayerError::BadDescriptor(fd)))
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        let fds = self.child_fds(fd)?;
        let mut first_error = None;
        let mut counts: Vec<(usize, usize)> = Vec::new();

        for index in self.write_targets() {
            let Some(child_fd) = fds[index] else {
                if self.enforced[index] && first_error.is_none() {
                    first_error = Some(LayerError::BadDescriptor(fd));
                }
                continue;
            };
            let result = self.children[index].pwrite(ctx, child_fd, buf, offset);
            if let Some(n) = self.absorb("pwrite", index, result, &mut first_error) {
                counts.push((index, n));
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        // the aggregate count is the first enforced child's; child 0 (or
        // the first responder) when nothing is enforced
        let chosen = counts
            .iter()
            .find(|(index, _)| self.enforced[*index])
            .or_else(|| counts.iter().find(|(index, _)| *index == 0))
            .or_else(|| counts.first());
        match chosen {
            Some((_, n)) => Ok(*n),
            None => Err(LayerError::BadDescriptor(fd)),
        }
    }

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        let fds = self.child_fds(fd)?;
        let mut first_error = None;
        for (index, child_fd) in fds.iter().enumerate() {
            if let Some(child_fd) = child_fd {
                let result = self.children[index].ftruncate(ctx, *child_fd, len);
                self.absorb("ftruncate", index, result, &mut first_error);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        self.broadcast_path_op("truncate", |child| child.truncate(ctx, path, len))
    }

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        let mut last_error = None;
        for index in self.read_order() {
            match self.children[index].lstat(ctx, path) {
                Ok(st) => return Ok(st),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            LayerError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
        }))
    }

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        let fds = self.child_fds(fd)?;
        let mut last_error = None;
        for index in self.read_order() {
            let Some(child_fd) = fds[index] else { continue };
            match self.children[index].fstat(ctx, child_fd) {
                Ok(st) => return Ok(st),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or(LayerError::BadDescriptor(fd)))
    }

    fn unlink(&self, ctx: &OpContext, path: &str) -> LayerResult<()> {
        self.broadcast_path_op("unlink", |child| child.unlink(ctx, path))
    }

    fn fsync(&self, ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()> {
        let fds = self.child_fds(fd)?;
        let mut first_error = None;
        for (index, child_fd) in fds.iter().enumerate() {
            if let Some(child_fd) = child_fd {
                let result = self.children[index].fsync(ctx, *child_fd, datasync);
                self.absorb("fsync", index, result, &mut first_error);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn readdir(&self, ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>> {
        let mut last_error = None;
        for index in self.read_order() {
            match self.children[index].readdir(ctx, path) {
                Ok(entries) => return Ok(entries),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            LayerError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
        }))
    }

    fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        self.broadcast_path_op("rename", |child| child.rename(ctx, from, to))
    }

    fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        self.broadcast_path_op("chmod", |child| child.chmod(ctx, path, mode))
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tables.clear();
        for child in &self.children {
            child.destroy();
        }
    }
}
