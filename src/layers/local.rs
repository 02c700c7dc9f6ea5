//! Local terminal layer
//!
//! Executes operations directly against the host file system, rooted at a
//! configurable directory. Descriptors are layer-assigned handles over open
//! `File` objects; positioned I/O uses `read_at`/`write_at` so concurrent
//! operations on distinct descriptors never contend on a shared cursor.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirEntryExt, FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

/// Terminal layer over host file primitives.
#[derive(Debug)]
pub struct LocalLayer {
    root: PathBuf,
    handles: DashMap<Fd, File>,
    next_fd: AtomicU64,
    destroyed: AtomicBool,
}

impl LocalLayer {
    /// Create a local terminal serving paths beneath `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalLayer {
            root: root.into(),
            handles: DashMap::new(),
            // descriptor 0 is reserved so an all-zero frame is never valid
            next_fd: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Map a stack-absolute path onto the configured root.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn file(&self, fd: Fd) -> LayerResult<dashmap::mapref::one::Ref<'_, Fd, File>> {
        self.handles.get(&fd).ok_or(LayerError::BadDescriptor(fd))
    }

    fn open_options(flags: OpenFlags, mode: u32) -> OpenOptions {
        let mut options = OpenOptions::new();
        // creation bits go through custom_flags: unlike OpenOptions'
        // create()/truncate(), the kernel accepts them with any access mode
        let creation = flags.bits() & (libc::O_CREAT | libc::O_TRUNC | libc::O_EXCL);
        options
            .read(flags.readable())
            .write(flags.writable())
            .append(flags.has_append())
            .custom_flags(creation)
            .mode(mode);
        options
    }
}

fn file_type_bits(ft: &fs::FileType) -> u32 {
    if ft.is_dir() {
        libc::S_IFDIR
    } else if ft.is_symlink() {
        libc::S_IFLNK
    } else if ft.is_block_device() {
        libc::S_IFBLK
    } else if ft.is_char_device() {
        libc::S_IFCHR
    } else if ft.is_fifo() {
        libc::S_IFIFO
    } else if ft.is_socket() {
        libc::S_IFSOCK
    } else {
        libc::S_IFREG
    }
}

impl Layer for LocalLayer {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn children(&self) -> &[LayerRef] {
        &[]
    }

    fn open(&self, _ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        let file = Self::open_options(flags, mode).open(self.resolve(path))?;
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(fd, file);
        Ok(fd)
    }

    fn close(&self, _ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        match self.handles.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(LayerError::BadDescriptor(fd)),
        }
    }

    fn pread(&self, _ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        let file = self.file(fd)?;
        let mut total = 0;
        // read_at may return short on signals; loop until EOF or full
        while total < buf.len() {
            match file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    fn pwrite(&self, _ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        let file = self.file(fd)?;
        file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    fn ftruncate(&self, _ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        let file = self.file(fd)?;
        file.set_len(len)?;
        Ok(())
    }

    fn truncate(&self, _ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        let file = OpenOptions::new().write(true).open(self.resolve(path))?;
        file.set_len(len)?;
        Ok(())
    }

    fn lstat(&self, _ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        let md = fs::symlink_metadata(self.resolve(path))?;
        Ok(FileStat::from(&md))
    }

    fn fstat(&self, _ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        let file = self.file(fd)?;
        let md = file.metadata()?;
        Ok(FileStat::from(&md))
    }

    fn unlink(&self, _ctx: &OpContext, path: &str) -> LayerResult<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    fn fsync(&self, _ctx: &OpContext, fd: Fd, datasync: bool) -> LayerResult<()> {
        let file = self.file(fd)?;
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    fn readdir(&self, _ctx: &OpContext, path: &str) -> LayerResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                ino: entry.ino(),
                file_type: file_type_bits(&file_type),
            });
        }
        Ok(entries)
    }

    fn rename(&self, _ctx: &OpContext, from: &str, to: &str) -> LayerResult<()> {
        fs::rename(self.resolve(from), self.resolve(to))?;
        Ok(())
    }

    fn chmod(&self, _ctx: &OpContext, path: &str, mode: u32) -> LayerResult<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let open = self.handles.len();
        if open > 0 {
            log::warn!("[LOCAL] destroy with {open} descriptors still open");
        }
        self.handles.clear();
    }
}

impl LocalLayer {
    /// Root directory this terminal serves.
    pub fn root(&self) -> &Path {
        &self.root
    }
}
