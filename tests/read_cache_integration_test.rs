// Integration tests for the read cache layer: the end-to-end coherence
// scenarios (hit after miss, coalesced misses, truncate, unlink-while-open)
// against an instrumented in-memory terminal.

mod common;

use std::sync::Arc;

use common::{patterned, rdwr_create, MemoryLayer};
use stratafs::cache::{BlockCache, LruBlockCache};
use stratafs::layers::ReadCacheLayer;
use stratafs::{Layer, OpContext};

const BS: u64 = 4096;

struct Fixture {
    cache: Arc<LruBlockCache>,
    mem: Arc<MemoryLayer>,
    layer: ReadCacheLayer,
    ctx: OpContext,
}

fn fixture(num_blocks: usize) -> Fixture {
    let cache = Arc::new(LruBlockCache::new(num_blocks));
    let mem = Arc::new(MemoryLayer::new());
    let layer = ReadCacheLayer::new(mem.clone(), BS, cache.clone());
    Fixture {
        cache,
        mem,
        layer,
        ctx: OpContext::with_path("/a"),
    }
}

fn key(ino: u64, index: u64) -> String {
    format!("{ino}/{index}")
}

#[test]
fn cache_hit_after_miss() {
    let f = fixture(4);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    let block = vec![b'A'; BS as usize];
    assert_eq!(f.layer.pwrite(&f.ctx, fd, &block, 0).unwrap(), BS as usize);

    // first read misses and populates
    let mut buf = vec![0u8; BS as usize];
    assert_eq!(f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap(), BS as usize);
    assert_eq!(buf, block);
    assert!(f.cache.contains(&key(ino, 0)));

    // second read is served from cache: no downstream pread
    f.mem.take_ops();
    buf.fill(0);
    assert_eq!(f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap(), BS as usize);
    assert_eq!(buf, block);
    assert!(f.mem.preads().is_empty(), "hit must not reach the terminal");

    let (hits, misses) = f.layer.stats();
    assert_eq!((hits, misses), (1, 1));

    f.layer.close(&f.ctx, fd).unwrap();
}

#[test]
fn coalesced_miss_issues_minimal_downstream_reads() {
    let f = fixture(4);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    let content = patterned(4 * BS as usize, 7);
    f.layer.pwrite(&f.ctx, fd, &content, 0).unwrap();

    // pre-populate block 2 only
    let mut block2 = vec![0u8; BS as usize];
    f.layer.pread(&f.ctx, fd, &mut block2, 2 * BS).unwrap();
    assert!(f.cache.contains(&key(ino, 2)));
    f.mem.take_ops();

    // one read across blocks 0..3 coalesces into two downstream reads:
    // blocks 0-1 in one request, block 3 in another
    let mut buf = vec![0u8; 4 * BS as usize];
    assert_eq!(
        f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap(),
        4 * BS as usize
    );
    assert_eq!(buf, content);
    assert_eq!(
        f.mem.preads(),
        vec![(0, 2 * BS as usize), (3 * BS, BS as usize)]
    );

    for index in 0..4 {
        assert!(f.cache.contains(&key(ino, index)), "block {index} cached");
    }

    f.layer.close(&f.ctx, fd).unwrap();
}

#[test]
fn truncate_shrinks_cached_blocks() {
    let f = fixture(4);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    let content = patterned(4 * BS as usize, 3);
    f.layer.pwrite(&f.ctx, fd, &content, 0).unwrap();

    // populate blocks 0..3
    let mut buf = vec![0u8; 4 * BS as usize];
    f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap();

    f.layer.ftruncate(&f.ctx, fd, 6144).unwrap();

    // block 0 intact, block 1 trimmed to 2048 bytes, blocks 2 and 3 gone
    assert_eq!(f.cache.get(&key(ino, 0)).unwrap(), &content[..BS as usize]);
    let partial = f.cache.get(&key(ino, 1)).unwrap();
    assert_eq!(partial.len(), 2048);
    assert_eq!(partial, &content[BS as usize..BS as usize + 2048]);
    assert!(!f.cache.contains(&key(ino, 2)));
    assert!(!f.cache.contains(&key(ino, 3)));

    // the shortened file reads back coherently through the cache
    let mut after = vec![0u8; 4 * BS as usize];
    assert_eq!(f.layer.pread(&f.ctx, fd, &mut after, 0).unwrap(), 6144);
    assert_eq!(&after[..6144], &content[..6144]);

    f.layer.close(&f.ctx, fd).unwrap();
}

#[test]
fn truncate_extension_zero_fills_former_last_block() {
    let f = fixture(4);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    // 1000-byte file; a block-sized read proves end of file, so the short
    // block is cached with its real length
    let content = patterned(1000, 9);
    f.layer.pwrite(&f.ctx, fd, &content, 0).unwrap();
    let mut buf = vec![0u8; BS as usize];
    assert_eq!(f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap(), 1000);
    assert_eq!(f.cache.get(&key(ino, 0)).unwrap().len(), 1000);

    // growing the file pads the cached block with zeros up to the boundary
    f.layer.ftruncate(&f.ctx, fd, 2 * BS).unwrap();
    let padded = f.cache.get(&key(ino, 0)).unwrap();
    assert_eq!(padded.len(), BS as usize);
    assert_eq!(&padded[..1000], &content[..]);
    assert!(padded[1000..].iter().all(|&b| b == 0));

    // the newly covered block is not materialized
    assert!(!f.cache.contains(&key(ino, 1)));

    f.layer.close(&f.ctx, fd).unwrap();
}

#[test]
fn unlink_while_open_defers_eviction_to_last_close() {
    let f = fixture(4);
    let fd1 = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let fd2 = f
        .layer
        .open(&f.ctx, "/a", stratafs::OpenFlags::RDWR, 0o644)
        .unwrap();
    let ino = f.layer.fstat(&f.ctx, fd1).unwrap().ino;

    let content = patterned(2 * BS as usize, 1);
    f.layer.pwrite(&f.ctx, fd1, &content, 0).unwrap();
    let mut buf = vec![0u8; 2 * BS as usize];
    f.layer.pread(&f.ctx, fd1, &mut buf, 0).unwrap();
    assert!(f.cache.contains(&key(ino, 0)));

    f.layer.unlink(&f.ctx, "/a").unwrap();
    assert_eq!(f.layer.inode_state(ino), Some((2, true)));
    assert!(f.cache.contains(&key(ino, 0)), "cache survives the unlink");

    f.layer.close(&f.ctx, fd1).unwrap();
    assert_eq!(f.layer.inode_state(ino), Some((1, true)));
    assert!(f.cache.contains(&key(ino, 0)), "cache survives first close");

    f.layer.close(&f.ctx, fd2).unwrap();
    assert_eq!(f.layer.inode_state(ino), None);
    assert!(!f.cache.contains(&key(ino, 0)));
    assert!(!f.cache.contains(&key(ino, 1)));
    assert!(f.cache.is_empty(), "no key mentioning the inode remains");
}

#[test]
fn unlink_without_open_descriptors_evicts_immediately() {
    let f = fixture(4);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    f.layer.pwrite(&f.ctx, fd, &patterned(BS as usize, 5), 0).unwrap();
    let mut buf = vec![0u8; BS as usize];
    f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap();
    f.layer.close(&f.ctx, fd).unwrap();
    assert!(f.cache.contains(&key(ino, 0)));

    f.layer.unlink(&f.ctx, "/a").unwrap();
    assert!(!f.cache.contains(&key(ino, 0)));
    assert_eq!(f.layer.inode_state(ino), None);
}

#[test]
fn open_with_trunc_evicts_stale_blocks() {
    let f = fixture(4);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    f.layer
        .pwrite(&f.ctx, fd, &patterned(2 * BS as usize, 2), 0)
        .unwrap();
    let mut buf = vec![0u8; 2 * BS as usize];
    f.layer.pread(&f.ctx, fd, &mut buf, 0).unwrap();
    f.layer.close(&f.ctx, fd).unwrap();
    assert!(f.cache.contains(&key(ino, 0)));

    let fd = f
        .layer
        .open(&f.ctx, "/a", rdwr_create().with(libc::O_TRUNC), 0o644)
        .unwrap();
    assert!(!f.cache.contains(&key(ino, 0)));
    assert!(!f.cache.contains(&key(ino, 1)));
    assert_eq!(f.layer.fstat(&f.ctx, fd).unwrap().size, 0);
    f.layer.close(&f.ctx, fd).unwrap();
}

#[test]
fn pwrite_updates_only_cached_blocks() {
    let f = fixture(8);
    let fd = f.layer.open(&f.ctx, "/a", rdwr_create(), 0o644).unwrap();
    let ino = f.layer.fstat(&f.ctx, fd).unwrap().ino;

    let content = patterned(3 * BS as usize, 4);
    f.layer.pwrite(&f.ctx, fd, &content, 0).unwrap();

    // cache only block 1
    let mut one = vec![0u8; BS as usize];
    f.layer.pread(&f.ctx, fd, &mut one, BS).unwrap();
    assert!(!f.cache.contains(&key(ino, 0)));
    assert!(f.cache.contains(&key(ino, 1)));

    // overwrite all three blocks; only block 1 gets refreshed in cache
    let rewritten = patterned(3 * BS as usize, 42);
    f.layer.pwrite(&f.ctx, fd, &rewritten, 0).unwrap();
    assert!(!f.cache.contains(&key(ino, 0)));
    assert_eq!(
        f.cache.get(&key(ino, 1)).unwrap(),
        &rewritten[BS as usize..2 * BS as usize]
    );
    assert!(!f.cache.contains(&key(ino, 2)));

    // read of block 1 is a hit with the fresh content
    f.mem.take_ops();
    f.layer.pread(&f.ctx, fd, &mut one, BS).unwrap();
    assert!(f.mem.preads().is_empty());
    assert_eq!(one, &rewritten[BS as usize..2 * BS as usize]);

    f.layer.close(&f.ctx, fd).unwrap();
}

#[test]
fn open_without_create_propagates_missing_file() {
    let f = fixture(4);
    let err = f
        .layer
        .open(&f.ctx, "/nope", stratafs::OpenFlags::RDONLY, 0)
        .unwrap_err();
    assert!(err.is_not_found());
}
