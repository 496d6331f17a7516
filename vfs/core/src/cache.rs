//! Lazily populated, dirty-tracked block cache.
//!
//! The cache owns one contiguous buffer of `total_blocks * block_size`
//! bytes and two bit-vectors. A block is fetched from storage the first
//! time any byte of it is touched, and written back only by an explicit
//! flush. `dirty[i]` always implies `loaded[i]`.

use std::ops::Range;

use fixedbitset::FixedBitSet;
use tracing::{debug, trace};

use crate::{BlockStorage, VfsError, VfsErrorKind, VfsResult};

pub struct BlockCache<S> {
    block_size: usize,
    total_blocks: u64,
    data: Vec<u8>,
    loaded: FixedBitSet,
    dirty: FixedBitSet,
    storage: S,
}

impl<S: BlockStorage> BlockCache<S> {
    pub fn new(block_size: usize, total_blocks: u64, storage: S) -> VfsResult<Self> {
        if block_size == 0 {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "cache.new")
                .with_message("block size must be non-zero"));
        }
        let blocks = to_usize(total_blocks, "cache.new")?;
        let capacity = blocks.checked_mul(block_size).ok_or_else(|| {
            VfsError::new(VfsErrorKind::InvalidInput, "cache.new")
                .with_message(format!("{total_blocks} blocks of {block_size} bytes overflow"))
        })?;

        Ok(Self {
            block_size,
            total_blocks,
            data: vec![0; capacity],
            loaded: FixedBitSet::with_capacity(blocks),
            dirty: FixedBitSet::with_capacity(blocks),
            storage,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Capacity in bytes, always `block_size * total_blocks`.
    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_loaded(&self, index: u64) -> bool {
        self.loaded.contains(index as usize)
    }

    pub fn is_dirty(&self, index: u64) -> bool {
        self.dirty.contains(index as usize)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.count_ones(..)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Gives the storage back. Dirty blocks that were not flushed are lost.
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// View of `count` blocks starting at `start`, loading missing blocks
    /// first. The view must not be used to bypass `write`.
    pub fn get_slice(&mut self, start: u64, count: u64) -> VfsResult<&[u8]> {
        let blocks = self.check_block_range(start, count, "cache.get_slice")?;
        self.ensure_loaded(blocks.clone())?;
        Ok(&self.data[blocks.start * self.block_size..blocks.end * self.block_size])
    }

    /// Copy `buf.len()` bytes starting at byte `offset` out of the cache.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> VfsResult<()> {
        let bytes = self.check_byte_range(offset, buf.len(), "cache.read")?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_loaded(self.covering_blocks(&bytes))?;
        buf.copy_from_slice(&self.data[bytes]);
        Ok(())
    }

    /// Copy `data` into the cache at byte `offset` and mark every covered
    /// block dirty.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        let bytes = self.check_byte_range(offset, data.len(), "cache.write")?;
        if bytes.is_empty() {
            return Ok(());
        }
        let blocks = self.covering_blocks(&bytes);
        // Every covered block is loaded first, fully overwritten ones too.
        self.ensure_loaded(blocks.clone())?;
        self.data[bytes].copy_from_slice(data);
        self.dirty.set_range(blocks, true);
        Ok(())
    }

    pub fn load_all(&mut self) -> VfsResult<()> {
        self.ensure_loaded(0..self.loaded.len())
    }

    pub fn flush_all(&mut self) -> VfsResult<()> {
        self.flush_blocks(0..self.dirty.len())
    }

    /// Flush the dirty blocks among `count` blocks starting at `start`.
    pub fn flush_range(&mut self, start: u64, count: u64) -> VfsResult<()> {
        let blocks = self.check_block_range(start, count, "cache.flush_range")?;
        self.flush_blocks(blocks)
    }

    /// Change the number of blocks.
    ///
    /// The storage is asked first and may refuse; only then is local state
    /// touched. Existing bytes are kept, new blocks are zeroed and marked
    /// loaded and dirty so the zeros eventually reach storage. Shrinking
    /// drops trailing blocks without writing them.
    pub fn resize(&mut self, new_total_blocks: u64) -> VfsResult<()> {
        let new_blocks = to_usize(new_total_blocks, "cache.resize")?;
        let new_capacity = new_blocks.checked_mul(self.block_size).ok_or_else(|| {
            VfsError::new(VfsErrorKind::InvalidInput, "cache.resize")
                .with_message(format!("{new_total_blocks} blocks overflow"))
        })?;
        if let Some(extra) = new_capacity.checked_sub(self.data.len()) {
            self.data.try_reserve_exact(extra).map_err(|err| {
                VfsError::new(VfsErrorKind::NoSpace, "cache.resize")
                    .with_message(format!("{new_total_blocks} blocks do not fit in memory"))
                    .with_source(err)
            })?;
        }

        self.storage.resize(new_total_blocks)?;

        let old_blocks = self.loaded.len();
        debug!(old_blocks, new_blocks, "resizing block cache");

        self.data.resize(new_capacity, 0);
        self.data.shrink_to_fit();

        let mut loaded = FixedBitSet::with_capacity(new_blocks);
        let mut dirty = FixedBitSet::with_capacity(new_blocks);
        let kept = old_blocks.min(new_blocks);
        for index in 0..kept {
            loaded.set(index, self.loaded.contains(index));
            dirty.set(index, self.dirty.contains(index));
        }
        if new_blocks > old_blocks {
            loaded.set_range(old_blocks..new_blocks, true);
            dirty.set_range(old_blocks..new_blocks, true);
        }

        self.loaded = loaded;
        self.dirty = dirty;
        self.total_blocks = new_total_blocks;
        Ok(())
    }

    /// Validate that `count` blocks starting at `start` lie inside the cache.
    pub fn check_bounds(&self, start: u64, count: u64) -> VfsResult<()> {
        self.check_block_range(start, count, "cache.bounds").map(|_| ())
    }

    fn ensure_loaded(&mut self, blocks: Range<usize>) -> VfsResult<()> {
        for index in blocks {
            if !self.loaded.contains(index) {
                self.load_block(index)?;
            }
        }
        Ok(())
    }

    // One fetch per block, never batched.
    fn load_block(&mut self, index: usize) -> VfsResult<()> {
        trace!(index, "fetching block");
        let range = index * self.block_size..(index + 1) * self.block_size;
        self.storage
            .fetch_block(index as u64, &mut self.data[range])?;
        self.loaded.insert(index);
        Ok(())
    }

    fn flush_blocks(&mut self, blocks: Range<usize>) -> VfsResult<()> {
        for index in blocks {
            if !self.dirty.contains(index) {
                continue;
            }
            trace!(index, "flushing block");
            let range = index * self.block_size..(index + 1) * self.block_size;
            self.storage.flush_block(index as u64, &self.data[range])?;
            // Cleared per block so a failed flush can be resumed.
            self.dirty.set(index, false);
        }
        Ok(())
    }

    fn covering_blocks(&self, bytes: &Range<usize>) -> Range<usize> {
        bytes.start / self.block_size..bytes.end.div_ceil(self.block_size)
    }

    fn check_block_range(
        &self,
        start: u64,
        count: u64,
        context: &'static str,
    ) -> VfsResult<Range<usize>> {
        match start.checked_add(count) {
            Some(end) if end <= self.total_blocks => Ok(start as usize..end as usize),
            _ => Err(
                VfsError::new(VfsErrorKind::InvalidInput, context).with_message(format!(
                    "blocks {start}+{count} outside 0..{}",
                    self.total_blocks
                )),
            ),
        }
    }

    fn check_byte_range(
        &self,
        offset: u64,
        len: usize,
        context: &'static str,
    ) -> VfsResult<Range<usize>> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.capacity() => Ok(offset as usize..end as usize),
            _ => Err(
                VfsError::new(VfsErrorKind::InvalidInput, context).with_message(format!(
                    "bytes {offset}+{len} outside capacity {}",
                    self.capacity()
                )),
            ),
        }
    }
}

impl<S> std::fmt::Debug for BlockCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("loaded", &self.loaded.count_ones(..))
            .field("dirty", &self.dirty.count_ones(..))
            .finish()
    }
}

fn to_usize(blocks: u64, context: &'static str) -> VfsResult<usize> {
    usize::try_from(blocks).map_err(|_| {
        VfsError::new(VfsErrorKind::InvalidInput, context)
            .with_message(format!("{blocks} blocks do not fit in memory"))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// In-memory storage that records every callback.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingStorage {
        pub blocks: Vec<Vec<u8>>,
        pub block_size: usize,
        pub fetches: Vec<u64>,
        pub flushes: Vec<u64>,
        pub fail_flush_at: Option<u64>,
        pub max_blocks: Option<u64>,
    }

    impl RecordingStorage {
        pub fn new(block_size: usize, blocks: usize) -> Self {
            Self {
                blocks: (0..blocks)
                    .map(|i| vec![i as u8; block_size])
                    .collect(),
                block_size,
                ..Default::default()
            }
        }
    }

    impl BlockStorage for RecordingStorage {
        fn fetch_block(&mut self, index: u64, buf: &mut [u8]) -> VfsResult<()> {
            self.fetches.push(index);
            buf.copy_from_slice(&self.blocks[index as usize]);
            Ok(())
        }

        fn flush_block(&mut self, index: u64, data: &[u8]) -> VfsResult<()> {
            if self.fail_flush_at == Some(index) {
                return Err(VfsError::new(VfsErrorKind::Io, "test.flush"));
            }
            self.flushes.push(index);
            self.blocks[index as usize].copy_from_slice(data);
            Ok(())
        }

        fn resize(&mut self, new_total_blocks: u64) -> VfsResult<()> {
            if self.max_blocks.is_some_and(|max| new_total_blocks > max) {
                return Err(VfsError::new(VfsErrorKind::NoSpace, "test.resize"));
            }
            self.blocks
                .resize(new_total_blocks as usize, vec![0xee; self.block_size]);
            Ok(())
        }
    }

    fn cache(blocks: usize) -> BlockCache<RecordingStorage> {
        BlockCache::new(4, blocks as u64, RecordingStorage::new(4, blocks)).unwrap()
    }

    fn assert_dirty_implies_loaded<S: BlockStorage>(cache: &BlockCache<S>) {
        for index in 0..cache.total_blocks() {
            if cache.is_dirty(index) {
                assert!(cache.is_loaded(index), "block {index} dirty but not loaded");
            }
        }
    }

    #[test]
    fn get_slice_fetches_each_missing_block_once() {
        let mut cache = cache(4);
        let slice = cache.get_slice(1, 2).unwrap();
        assert_eq!(slice, &[1, 1, 1, 1, 2, 2, 2, 2]);
        cache.get_slice(0, 3).unwrap();
        assert_eq!(cache.storage().fetches, vec![1, 2, 0]);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn unaligned_write_then_read() {
        let mut cache = cache(4);
        cache.write(3, &[0xaa, 0xbb, 0xcc]).unwrap();
        assert!(cache.is_dirty(0));
        assert!(cache.is_dirty(1));
        assert!(!cache.is_dirty(2));
        assert_dirty_implies_loaded(&cache);

        let mut buf = [0u8; 6];
        cache.read(2, &mut buf).unwrap();
        assert_eq!(buf, [0, 0xaa, 0xbb, 0xcc, 1, 1]);
    }

    #[test]
    fn flush_writes_back_only_dirty_blocks() {
        let mut cache = cache(4);
        cache.write(9, &[5]).unwrap();
        cache.read(0, &mut [0u8; 16]).unwrap();
        cache.flush_all().unwrap();

        assert_eq!(cache.storage().flushes, vec![2]);
        assert_eq!(cache.storage().blocks[2], vec![2, 5, 2, 2]);
        assert_eq!(cache.dirty_count(), 0);
        assert!(cache.is_loaded(2));
    }

    #[test]
    fn failed_flush_is_resumable() {
        let mut cache = cache(4);
        cache.write(0, &[1u8; 16]).unwrap();
        cache.storage_mut().fail_flush_at = Some(2);

        let err = cache.flush_all().unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::Io);
        assert!(!cache.is_dirty(0));
        assert!(!cache.is_dirty(1));
        assert!(cache.is_dirty(2));
        assert!(cache.is_dirty(3));

        cache.storage_mut().fail_flush_at = None;
        cache.flush_all().unwrap();
        assert_eq!(cache.storage().flushes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn flush_range_leaves_other_blocks_dirty() {
        let mut cache = cache(4);
        cache.write(0, &[9u8; 16]).unwrap();
        cache.flush_range(1, 2).unwrap();
        assert_eq!(cache.storage().flushes, vec![1, 2]);
        assert!(cache.is_dirty(0));
        assert!(cache.is_dirty(3));
    }

    #[test]
    fn grow_marks_new_blocks_loaded_dirty_and_zero() {
        let mut cache = cache(2);
        cache.write(0, &[7]).unwrap();
        cache.resize(4).unwrap();

        assert_eq!(cache.capacity(), 16);
        assert_eq!(cache.total_blocks(), 4);
        assert!(cache.is_dirty(0));
        assert!(!cache.is_loaded(1));
        assert!(cache.is_loaded(2) && cache.is_dirty(2));
        assert!(cache.is_loaded(3) && cache.is_dirty(3));
        assert_dirty_implies_loaded(&cache);

        // The storage filled new blocks with 0xee; the cache must not
        // fetch them.
        assert_eq!(cache.get_slice(2, 2).unwrap(), &[0u8; 8]);
        cache.flush_all().unwrap();
        assert_eq!(cache.storage().blocks[3], vec![0; 4]);
        assert_eq!(cache.storage().fetches, vec![0]);
    }

    #[test]
    fn shrink_drops_trailing_blocks() {
        let mut cache = cache(4);
        cache.write(0, &[3u8; 16]).unwrap();
        cache.resize(1).unwrap();
        assert_eq!(cache.capacity(), 4);
        assert_eq!(cache.dirty_count(), 1);
        cache.flush_all().unwrap();
        assert_eq!(cache.storage().flushes, vec![0]);
    }

    #[test]
    fn rejected_resize_leaves_cache_untouched() {
        let mut cache = cache(2);
        cache.storage_mut().max_blocks = Some(3);
        cache.write(0, &[1]).unwrap();

        let err = cache.resize(5).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NoSpace);
        assert_eq!(cache.total_blocks(), 2);
        assert_eq!(cache.capacity(), 8);
        assert!(cache.is_dirty(0));
    }

    #[test]
    fn unaffordable_growth_is_no_space() {
        let mut cache = cache(2);
        cache.write(0, &[1]).unwrap();

        let err = cache.resize(1 << 58).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::NoSpace);
        assert_eq!(cache.total_blocks(), 2);
        assert_eq!(cache.storage().blocks.len(), 2);
        assert!(cache.is_dirty(0));
        assert_dirty_implies_loaded(&cache);
    }

    #[test]
    fn out_of_bounds_access_reports_range() {
        let mut cache = cache(2);
        let err = cache.get_slice(1, 2).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::InvalidInput);
        assert_eq!(err.message(), Some("blocks 1+2 outside 0..2"));

        let err = cache.write(6, &[0; 3]).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::InvalidInput);
        assert!(cache.storage().fetches.is_empty());

        assert!(cache.check_bounds(0, 2).is_ok());
        assert!(cache.check_bounds(u64::MAX, 2).is_err());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let err = BlockCache::new(0, 4, RecordingStorage::default()).unwrap_err();
        assert_eq!(err.kind(), VfsErrorKind::InvalidInput);
    }
}
