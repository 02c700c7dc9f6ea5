// Stat records exchanged between layers.
//
// The crate owns its stat shape instead of passing raw libc structs around;
// terminal layers fill it from host metadata and the remote protocol
// marshals it field by field.

use std::os::unix::fs::MetadataExt;

/// File attributes as reported by a terminal layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub atime_nsec: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
    pub blksize: u64,
    pub blocks: u64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

impl From<&std::fs::Metadata> for FileStat {
    fn from(md: &std::fs::Metadata) -> Self {
        FileStat {
            ino: md.ino(),
            size: md.size(),
            mode: md.mode(),
            nlink: md.nlink(),
            uid: md.uid(),
            gid: md.gid(),
            atime: md.atime(),
            atime_nsec: md.atime_nsec(),
            mtime: md.mtime(),
            mtime_nsec: md.mtime_nsec(),
            ctime: md.ctime(),
            ctime_nsec: md.ctime_nsec(),
            blksize: md.blksize(),
            blocks: md.blocks(),
        }
    }
}

/// One directory entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    /// File-type bits (`S_IFMT` portion of the mode).
    pub file_type: u32,
}
