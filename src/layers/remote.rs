//! Remote terminal layer
//!
//! Ships each operation to a peer over a persistent TCP connection as a
//! fixed-size, C-layout frame and waits for the echoed frame carrying the
//! result. Framing is exact-size: both sides always transfer
//! `size_of::<WireMessage>()` bytes per message. The connection is
//! serialized under a mutex (one request in flight per layer instance),
//! matching the synchronous per-descriptor model of the host.
//!
//! Payloads larger than the inline buffer are split into several frames.
//! Transport failures are narrowed to `EIO`; error codes reported by the
//! peer come back verbatim in `res`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

/// Inline payload capacity of one frame.
pub const WIRE_DATA_SIZE: usize = 4096;
/// Path capacity of one frame (NUL padded).
pub const WIRE_PATH_SIZE: usize = 512;

pub const OP_READ: i32 = 0;
pub const OP_WRITE: i32 = 1;
pub const OP_STAT: i32 = 2;
pub const OP_OPEN: i32 = 3;
pub const OP_UNLINK: i32 = 4;
pub const OP_CLOSE: i32 = 5;

/// Stat record as marshalled on the wire. Field order keeps the struct
/// free of padding so it can be cast to bytes directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct WireStat {
    pub ino: u64,
    pub size: u64,
    pub nlink: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub atime_nsec: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub reserved: u32,
}

impl From<WireStat> for FileStat {
    fn from(w: WireStat) -> Self {
        FileStat {
            ino: w.ino,
            size: w.size,
            mode: w.mode,
            nlink: w.nlink,
            uid: w.uid,
            gid: w.gid,
            atime: w.atime,
            atime_nsec: w.atime_nsec,
            mtime: w.mtime,
            mtime_nsec: w.mtime_nsec,
            ctime: w.ctime,
            ctime_nsec: w.ctime_nsec,
            blksize: w.blksize,
            blocks: w.blocks,
        }
    }
}

/// One protocol frame. 64-bit fields lead, then 32-bit fields, then the
/// byte arrays, so the C layout has no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct WireMessage {
    pub offset: i64,
    pub size: u64,
    pub res: i64,
    pub op: i32,
    pub flags: i32,
    pub fd: i32,
    pub mode: u32,
    pub stat: WireStat,
    pub path: [u8; WIRE_PATH_SIZE],
    pub data: [u8; WIRE_DATA_SIZE],
}

impl WireMessage {
    fn new(op: i32) -> Self {
        let mut msg = Self::zeroed();
        msg.op = op;
        msg
    }

    fn set_path(&mut self, path: &str) -> LayerResult<()> {
        let bytes = path.as_bytes();
        if bytes.len() >= WIRE_PATH_SIZE {
            return Err(LayerError::InvalidArgument(format!(
                "path of {} bytes exceeds the {} byte wire limit",
                bytes.len(),
                WIRE_PATH_SIZE
            )));
        }
        self.path[..bytes.len()].copy_from_slice(bytes);
        self.path[bytes.len()..].fill(0);
        Ok(())
    }
}

/// Terminal layer speaking the framed protocol to `host:port`.
#[derive(Debug)]
pub struct RemoteLayer {
    peer: String,
    conn: Mutex<Option<TcpStream>>,
    destroyed: AtomicBool,
}

impl RemoteLayer {
    /// Connect to the peer. Connection failure is fatal to initialization.
    pub fn connect(host: &str, port: u16) -> LayerResult<Self> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect(&peer)
            .map_err(|err| LayerError::Remote(format!("connect to {peer} failed: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| LayerError::Remote(format!("configuring {peer} failed: {err}")))?;
        log::info!("[REMOTE] connected to {peer}");
        Ok(RemoteLayer {
            peer,
            conn: Mutex::new(Some(stream)),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Send one frame and read the echoed reply.
    fn call(&self, msg: &WireMessage) -> LayerResult<WireMessage> {
        let mut guard = self.conn.lock();
        let stream = guard
            .as_mut()
            .ok_or(LayerError::Destroyed("remote"))?;

        stream
            .write_all(bytemuck::bytes_of(msg))
            .map_err(|err| LayerError::Remote(format!("send to {} failed: {err}", self.peer)))?;

        let mut reply = WireMessage::zeroed();
        stream
            .read_exact(bytemuck::bytes_of_mut(&mut reply))
            .map_err(|err| LayerError::Remote(format!("recv from {} failed: {err}", self.peer)))?;
        Ok(reply)
    }

    /// Interpret the peer's `res` field as a count or an errno.
    fn check_res(reply: &WireMessage) -> LayerResult<i64> {
        if reply.res < 0 {
            Err(LayerError::RemoteErrno(
                i32::try_from(-reply.res).unwrap_or(libc::EIO),
            ))
        } else {
            Ok(reply.res)
        }
    }

    fn path_from(ctx: &OpContext) -> &str {
        ctx.path().unwrap_or("")
    }
}

impl Layer for RemoteLayer {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn children(&self) -> &[LayerRef] {
        &[]
    }

    fn open(&self, _ctx: &OpContext, path: &str, flags: OpenFlags, mode: u32) -> LayerResult<Fd> {
        let mut msg = WireMessage::new(OP_OPEN);
        msg.set_path(path)?;
        msg.flags = flags.bits();
        msg.mode = mode;
        let reply = self.call(&msg)?;
        let fd = Self::check_res(&reply)?;
        Ok(fd as Fd)
    }

    fn close(&self, _ctx: &OpContext, fd: Fd) -> LayerResult<()> {
        let mut msg = WireMessage::new(OP_CLOSE);
        msg.fd = fd as i32;
        let reply = self.call(&msg)?;
        Self::check_res(&reply)?;
        Ok(())
    }

    fn pread(&self, ctx: &OpContext, fd: Fd, buf: &mut [u8], offset: u64) -> LayerResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(WIRE_DATA_SIZE);
            let mut msg = WireMessage::new(OP_READ);
            msg.set_path(Self::path_from(ctx))?;
            msg.fd = fd as i32;
            msg.offset = (offset + total as u64) as i64;
            msg.size = chunk as u64;

            let reply = self.call(&msg)?;
            let got = Self::check_res(&reply)? as usize;
            if got > chunk {
                return Err(LayerError::Remote(format!(
                    "peer returned {got} bytes for a {chunk} byte read"
                )));
            }
            buf[total..total + got].copy_from_slice(&reply.data[..got]);
            total += got;
            if got < chunk {
                break; // end of file on the peer
            }
        }
        Ok(total)
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(WIRE_DATA_SIZE);
            let mut msg = WireMessage::new(OP_WRITE);
            msg.set_path(Self::path_from(ctx))?;
            msg.fd = fd as i32;
            msg.offset = (offset + total as u64) as i64;
            msg.size = chunk as u64;
            msg.data[..chunk].copy_from_slice(&buf[total..total + chunk]);

            let reply = self.call(&msg)?;
            let wrote = Self::check_res(&reply)? as usize;
            total += wrote;
            if wrote < chunk {
                break; // peer accepted a short write
            }
        }
        Ok(total)
    }

    fn ftruncate(&self, _ctx: &OpContext, _fd: Fd, _len: u64) -> LayerResult<()> {
        Err(LayerError::Unsupported("ftruncate", "remote"))
    }

    fn truncate(&self, _ctx: &OpContext, _path: &str, _len: u64) -> LayerResult<()> {
        Err(LayerError::Unsupported("truncate", "remote"))
    }

    fn lstat(&self, _ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        let mut msg = WireMessage::new(OP_STAT);
        msg.set_path(path)?;
        let reply = self.call(&msg)?;
        Self::check_res(&reply)?;
        Ok(reply.stat.into())
    }

    fn fstat(&self, ctx: &OpContext, fd: Fd) -> LayerResult<FileStat> {
        // the protocol has a single STAT opcode; the peer resolves by path
        // when one is attached, by descriptor otherwise
        let mut msg = WireMessage::new(OP_STAT);
        msg.set_path(Self::path_from(ctx))?;
        msg.fd = fd as i32;
        let reply = self.call(&msg)?;
        Self::check_res(&reply)?;
        Ok(reply.stat.into())
    }

    fn unlink(&self, _ctx: &OpContext, path: &str) -> LayerResult<()> {
        let mut msg = WireMessage::new(OP_UNLINK);
        msg.set_path(path)?;
        let reply = self.call(&msg)?;
        Self::check_res(&reply)?;
        Ok(())
    }

    fn fsync(&self, _ctx: &OpContext, _fd: Fd, _datasync: bool) -> LayerResult<()> {
        Err(LayerError::Unsupported("fsync", "remote"))
    }

    fn readdir(&self, _ctx: &OpContext, _path: &str) -> LayerResult<Vec<DirEntry>> {
        Err(LayerError::Unsupported("readdir", "remote"))
    }

    fn rename(&self, _ctx: &OpContext, _from: &str, _to: &str) -> LayerResult<()> {
        Err(LayerError::Unsupported("rename", "remote"))
    }

    fn chmod(&self, _ctx: &OpContext, _path: &str, _mode: u32) -> LayerResult<()> {
        Err(LayerError::Unsupported("chmod", "remote"))
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = self.conn.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
