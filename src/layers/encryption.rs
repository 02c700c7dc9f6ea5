//! Encryption layer
//!
//! AES-256-XTS over fixed-size blocks. The cipher works on `block_size`
//! data units; the XTS tweak for a unit is its absolute index in the file
//! (`offset / block_size`) encoded little-endian in the low bytes of the
//! 16-byte tweak. Deriving the tweak from the file position (rather than
//! restarting a counter per request) makes ciphertext position-stable, so
//! reads and writes round-trip at any block-aligned offset.
//!
//! Contracts: request offsets must be multiples of `block_size`, and the
//! data must cover at least 16 bytes at the trailing partial unit — XTS
//! refuses smaller inputs. Both violations fail with `EINVAL`; a
//! block-align layer below the caller usually guarantees the former.
//! Ciphertext length equals plaintext length, so every metadata operation
//! forwards unchanged.

use std::sync::atomic::{AtomicBool, Ordering};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::KeyInit;
use aes::Aes256;
use parking_lot::RwLock;
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use crate::layer::{
    DirEntry, Fd, FileStat, Layer, LayerError, LayerRef, LayerResult, OpContext, OpenFlags,
};

/// Length of the XTS master key: two concatenated AES-256 subkeys.
pub const KEY_LEN: usize = 64;

/// Smallest input XTS can process.
const XTS_MIN_LEN: usize = 16;

/// Block-addressed AES-256-XTS transform.
pub struct EncryptionLayer {
    next: [LayerRef; 1],
    block_size: u64,
    /// Taken on destroy so the cipher schedules are dropped with the layer
    /// still alive; later operations fail instead of panicking.
    cipher: RwLock<Option<Xts128<Aes256>>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for EncryptionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionLayer")
            .field("block_size", &self.block_size)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Decode a configured or fetched key into the 64-byte master key.
///
/// Accepts exactly 64 raw bytes or 128 hex characters.
pub fn parse_key(material: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, String> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    let bytes = material.as_bytes();
    if bytes.len() == KEY_LEN {
        key.copy_from_slice(bytes);
        return Ok(key);
    }
    if bytes.len() == KEY_LEN * 2 {
        let decoded = hex::decode(bytes)
            .map_err(|err| format!("encryption key is not valid hex: {err}"))?;
        key.copy_from_slice(&decoded);
        return Ok(key);
    }
    Err(format!(
        "encryption key must be {} raw bytes or {} hex characters, got {} bytes",
        KEY_LEN,
        KEY_LEN * 2,
        bytes.len()
    ))
}

impl EncryptionLayer {
    /// Wrap `next` with AES-256-XTS using the 64-byte master key.
    ///
    /// The key is only read during construction; callers keep it in a
    /// zeroizing container so no copy outlives this call.
    pub fn new(next: LayerRef, block_size: u64, key: &[u8; KEY_LEN]) -> Self {
        let data_cipher = Aes256::new(GenericArray::from_slice(&key[..32]));
        let tweak_cipher = Aes256::new(GenericArray::from_slice(&key[32..]));
        EncryptionLayer {
            next: [next],
            block_size: block_size.max(1),
            cipher: RwLock::new(Some(Xts128::new(data_cipher, tweak_cipher))),
            destroyed: AtomicBool::new(false),
        }
    }

    fn next(&self) -> &LayerRef {
        &self.next[0]
    }

    /// Validate the (offset, len) contract shared by reads and writes.
    fn check_request(&self, len: usize, offset: u64) -> LayerResult<()> {
        if offset % self.block_size != 0 {
            return Err(LayerError::InvalidArgument(format!(
                "offset {offset} is not aligned to the {}-byte cipher block",
                self.block_size
            )));
        }
        let tail = len % self.block_size as usize;
        if len < XTS_MIN_LEN || (tail != 0 && tail < XTS_MIN_LEN) {
            return Err(LayerError::InvalidArgument(format!(
                "XTS requires at least {XTS_MIN_LEN} bytes in the trailing block, got {len} bytes total"
            )));
        }
        Ok(())
    }

    /// Run the cipher over `data` in place. `data` must satisfy
    /// [`check_request`]; the trailing partial unit (>= 16 bytes) is
    /// handled with ciphertext stealing.
    fn crypt_area(&self, data: &mut [u8], offset: u64, encrypt: bool) -> LayerResult<()> {
        let guard = self.cipher.read();
        let xts = guard
            .as_ref()
            .ok_or(LayerError::Destroyed("encryption"))?;
        let first_block = (offset / self.block_size) as u128;
        let bs = self.block_size as usize;
        if encrypt {
            xts.encrypt_area(data, bs, first_block, get_tweak_default);
        } else {
            xts.decrypt_area(data, bs, first_block, get_tweak_default);
        }
        Ok(())
    }
}

impl Layer for EncryptionLayer {
    fn kind(&self) -> &'static str {
        "encryption"
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
        self.check_request(buf.len(), offset)?;

        let got = self.next().pread(ctx, fd, buf, offset)?;
        if got == 0 {
            return Ok(0);
        }

        // a short downstream read may tear the trailing cipher unit; what
        // came back cannot be decrypted in that case
        let tail = got % self.block_size as usize;
        if got < XTS_MIN_LEN || (tail != 0 && tail < XTS_MIN_LEN) {
            return Err(LayerError::Integrity(format!(
                "downstream returned {got} bytes, not decryptable as whole cipher units"
            )));
        }

        self.crypt_area(&mut buf[..got], offset, false)?;
        Ok(got)
    }

    fn pwrite(&self, ctx: &OpContext, fd: Fd, buf: &[u8], offset: u64) -> LayerResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_request(buf.len(), offset)?;

        let mut ciphertext = buf.to_vec();
        self.crypt_area(&mut ciphertext, offset, true)?;
        self.next().pwrite(ctx, fd, &ciphertext, offset)
    }

    fn ftruncate(&self, ctx: &OpContext, fd: Fd, len: u64) -> LayerResult<()> {
        self.next().ftruncate(ctx, fd, len)
    }

    fn truncate(&self, ctx: &OpContext, path: &str, len: u64) -> LayerResult<()> {
        self.next().truncate(ctx, path, len)
    }

    fn lstat(&self, ctx: &OpContext, path: &str) -> LayerResult<FileStat> {
        // ciphertext length equals plaintext length; sizes pass through
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
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // drop the cipher schedules before recursing; key bytes were
        // zeroized at construction time
        self.cipher.write().take();
        self.next().destroy();
    }
}
