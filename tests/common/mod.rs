//! Shared test fixtures for the integration tests.
//!
//! `MemoryLayer` is an in-memory terminal layer that records every
//! operation it serves, so tests can assert not only on results but on the
//! exact downstream traffic a wrapping layer produced (read coalescing,
//! fan-out, alignment windows).

// not every test crate uses every fixture
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use stratafs::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

/// One recorded downstream operation: name, offset, length.
pub type OpRecord = (&'static str, u64, usize);

#[derive(Debug)]
struct FileData {
    ino: u64,
    mode: u32,
    content: Vec<u8>,
}

type SharedFile = Arc<Mutex<FileData>>;

/// In-memory terminal layer with operation recording and fault injection.
#[derive(Debug)]
pub struct MemoryLayer {
    files: Mutex<HashMap<String, SharedFile>>,
    handles: Mutex<HashMap<Fd, SharedFile>>,
    ops: Mutex<Vec<OpRecord>>,
    next_fd: AtomicU64,
    next_ino: AtomicU64,
    fail_writes: AtomicBool,
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLayer {
    pub fn new() -> Self {
        MemoryLayer {
            files: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            next_fd: AtomicU64::new(1),
            next_ino: AtomicU64::new(100),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `pwrite` fail with `EIO`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drain the recorded operations.
    pub fn take_ops(&self) -> Vec<OpRecord> {
        std::mem::take(&mut self.ops.lock())
    }

    /// Recorded `pread`s as (offset, len) pairs, in order.
    pub fn preads(&self) -> Vec<(u64, usize)> {
        self.ops
            .lock()
            .iter()
            .filter(|(op, _, _)| *op == "pread")
            .map(|(_, offset, len)| (*offset, *len))
            .collect()
    }

    /// Raw stored bytes of a file, for ciphertext inspection.
    pub fn raw_content(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .map(|file| file.lock().content.clone())
    }

    /// Overwrite stored bytes in place, bypassing the stack (tamper tool).
    pub fn corrupt(&self, path: &str, offset: usize, bytes: &[u8]) {
        let files = self.files.lock();
        let file = files.get(path).expect("corrupt: no such file");
        let mut data = file.lock();
        data.content[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn record(&self, op: &'static str, offset: u64, len: usize) {
        self.ops.lock().push((op, offset, len));
    }

    fn handle(&self, fd: Fd) -> LayerResult<SharedFile> {
        self.handles
            .lock()
            .get(&fd)
            .cloned()
            .ok_or(LayerError::BadDescriptor(fd))
    }

    fn not_found() -> LayerError {
        LayerError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
    }
}

impl Layer for MemoryLayer {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn children(&self) -> &[LayerRef] {
        &[]
    }

    fn open(&self, _ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        self.record("open", 0, 0);
        let mut files = self.files.lock();
        let file = match files.get(path) {
            Some(existing) => {
                if flags.has_trunc() && flags.writable() {
                    existing.lock().content.clear();
                }
                existing.clone()
            }
            None => {
                if !flags.has_create() {
                    return Err(Self::not_found());
                }
                let file = Arc::new(Mutex::new(FileData {
                    ino: self.next_ino.fetch_add(1, Ordering::Relaxed),
                    mode: mode | libc::S_IFREG,
                    content: Vec::new(),
                }));
                files.insert(path.to_owned(), file.clone());
                file
            }
        };
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fd, file);
        Ok(fd)
    }

    fn close(&self, _ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        self.record("close", 0, 0);
        self.handles
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or(LayerError::BadDescriptor(fd))
    }

    fn pread(&self, _ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        self.record("pread", offset, buf.len());
        let file = self.handle(fd)?;
        let data = file.lock();
        let offset = offset as usize;
        if offset >= data.content.len() {
            return Ok(0);
        }
        let avail = data.content.len() - offset;
        let copy = avail.min(buf.len());
        buf[..copy].copy_from_slice(&data.content[offset..offset + copy]);
        Ok(copy)
    }

    fn pwrite(&self, _ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        self.record("pwrite", offset, buf.len());
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LayerError::Io(std::io::Error::from_raw_os_error(
                libc::EIO,
            )));
        }
        let file = self.handle(fd)?;
        let mut data = file.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.content.len() < end {
            data.content.resize(end, 0);
        }
        data.content[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn ftruncate(&self, _ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        self.record("ftruncate", len, 0);
        let file = self.handle(fd)?;
        file.lock().content.resize(len as usize, 0);
        Ok(())
    }

    fn truncate(&self, _ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        self.record("truncate", len, 0);
        let files = self.files.lock();
        let file = files.get(path).ok_or_else(Self::not_found)?;
        file.lock().content.resize(len as usize, 0);
        Ok(())
    }

    fn lstat(&self, _ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        self.record("lstat", 0, 0);
        let files = self.files.lock();
        let file = files.get(path).ok_or_else(Self::not_found)?;
        let data = file.lock();
        Ok(FileStat {
            ino: data.ino,
            size: data.content.len() as u64,
            mode: data.mode,
            nlink: 1,
            blksize: 512,
            ..FileStat::default()
        })
    }

    fn fstat(&self, _ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        self.record("fstat", 0, 0);
        let file = self.handle(fd)?;
        let data = file.lock();
        Ok(FileStat {
            ino: data.ino,
            size: data.content.len() as u64,
            mode: data.mode,
            nlink: 1,
            blksize: 512,
            ..FileStat::default()
        })
    }

    fn unlink(&self, _ctx: &OpContext, path: &str) -> LayerResult<()> {
        self.record("unlink", 0, 0);
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(Self::not_found)
    }

    fn fsync(&self, _ctx: &OpContext, fd: Fd, _datasync: bool) -> LayerResult<()> {
        self.record("fsync", 0, 0);
        self.handle(fd).map(|_| ())
    }

    fn readdir(&self, _ctx: &OpContext, _path: &str) -> LayerResult<Vec<DirEntry>> {
        self.record("readdir", 0, 0);
        let files = self.files.lock();
        Ok(files
            .iter()
            .map(|(path, file)| DirEntry {
                name: path.trim_start_matches('/').to_owned(),
                ino: file.lock().ino,
                file_type: libc::S_IFREG,
            })
            .collect())
    }

    fn rename(&self, _ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        self.record("rename", 0, 0);
        let mut files = self.files.lock();
        let file = files.remove(from).ok_or_else(Self::not_found)?;
        files.insert(to.to_owned(), file);
        Ok(())
    }

    fn chmod(&self, _ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        self.record("chmod", 0, 0);
        let files = self.files.lock();
        let file = files.get(path).ok_or_else(Self::not_found)?;
        let mut data = file.lock();
        data.mode = (data.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
        Ok(())
    }

    fn destroy(&self) {
        self.record("destroy", 0, 0);
    }
}

/// RDWR | O_CREAT, the flags most scenarios open with.
pub fn rdwr_create() -> OpenFlags {
    OpenFlags::RDWR.with(libc::O_CREAT)
}

/// Deterministic pseudo-random buffer for round-trip checks.
pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
