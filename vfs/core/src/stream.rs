//! Seekable byte view over a block cache.

use std::io::{self, SeekFrom};

use tracing::trace;

use crate::{
    BlockCache, BlockStorage, ObjectHandle, ObjectStorage, OpenFlags, VfsError, VfsErrorKind,
    VfsResult,
};

/// Something a [`ByteStream`] can reach a block cache through: the cache
/// itself or a mutable borrow of one.
pub trait CacheRef {
    type Storage: BlockStorage;

    fn cache(&self) -> &BlockCache<Self::Storage>;

    fn cache_mut(&mut self) -> &mut BlockCache<Self::Storage>;
}

impl<S: BlockStorage> CacheRef for BlockCache<S> {
    type Storage = S;

    fn cache(&self) -> &BlockCache<S> {
        self
    }

    fn cache_mut(&mut self) -> &mut BlockCache<S> {
        self
    }
}

impl<S: BlockStorage> CacheRef for &mut BlockCache<S> {
    type Storage = S;

    fn cache(&self) -> &BlockCache<S> {
        self
    }

    fn cache_mut(&mut self) -> &mut BlockCache<S> {
        self
    }
}

/// An open file: cursor, declared size and open mode over one cache.
///
/// Nothing is flushed on drop. Call [`close`](Self::close) or
/// [`sync`](Self::sync) to persist writes.
#[derive(Debug)]
pub struct ByteStream<C> {
    cache: C,
    position: u64,
    size: u64,
    flags: OpenFlags,
}

/// A stream over one backend object.
pub type ObjectStream<H> = ByteStream<BlockCache<ObjectStorage<H>>>;

impl<C: CacheRef> ByteStream<C> {
    pub fn new(cache: C, size: u64, flags: OpenFlags) -> VfsResult<Self> {
        let capacity = cache.cache().capacity();
        if size > capacity {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "stream.new")
                .with_message(format!("size {size} exceeds cache capacity {capacity}")));
        }
        Ok(Self {
            cache,
            position: 0,
            size,
            flags,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn cache(&self) -> &BlockCache<C::Storage> {
        self.cache.cache()
    }

    /// Hand back the cache without flushing it.
    pub fn into_cache(self) -> C {
        self.cache
    }

    /// Split a byte offset into a block index and an offset in that block.
    pub fn convert_linear_addr(&self, offset: u64) -> (u64, usize) {
        let block_size = self.cache.cache().block_size() as u64;
        (offset / block_size, (offset % block_size) as usize)
    }

    /// Read at the cursor and advance it. Returns 0 at or past the end.
    pub fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let read = self.read_at(buf, self.position)?;
        self.position += read as u64;
        Ok(read)
    }

    /// Read without moving the cursor. Never reads past the declared size.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.require(OpenFlags::READ, "stream.read")?;
        if offset >= self.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.size - offset) as usize;
        self.cache.cache_mut().read(offset, &mut buf[..len])?;
        Ok(len)
    }

    /// Write at the cursor, or at the end in append mode, and advance.
    pub fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.require(OpenFlags::WRITE, "stream.write")?;
        if self.flags.contains(OpenFlags::APPEND) {
            self.position = self.size;
        }
        let written = self.write_inner(data, self.position)?;
        self.position += written as u64;
        Ok(written)
    }

    /// Write without moving the cursor. Rejected in append mode.
    pub fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.require(OpenFlags::WRITE, "stream.write_at")?;
        if self.flags.contains(OpenFlags::APPEND) {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "stream.write_at")
                .with_message("positional writes are not allowed in append mode"));
        }
        self.write_inner(data, offset)
    }

    /// Move the cursor. Past-the-end positions are allowed; negative ones
    /// fail and leave the cursor where it was.
    pub fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let new = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            VfsError::new(VfsErrorKind::InvalidInput, "stream.seek")
                .with_message(format!("{pos:?} from {} is out of range", self.position))
        })?;
        self.position = new;
        Ok(new)
    }

    /// Set the declared size, growing or shrinking the cache to match.
    pub fn truncate(&mut self, new_size: u64) -> VfsResult<()> {
        self.require(OpenFlags::WRITE, "stream.truncate")?;
        self.resize_to(new_size)?;
        if self.flags.contains(OpenFlags::SYNC) {
            self.cache.cache_mut().flush_all()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> VfsResult<()> {
        self.cache.cache_mut().flush_all()
    }

    pub fn close(mut self) -> VfsResult<()> {
        self.sync()
    }

    fn write_inner(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset.checked_add(data.len() as u64).ok_or_else(|| {
            VfsError::new(VfsErrorKind::InvalidInput, "stream.write")
                .with_message(format!("{} bytes at {offset} overflow", data.len()))
        })?;
        if end > self.size {
            self.resize_to(end)?;
        }
        self.cache.cache_mut().write(offset, data)?;

        if self.flags.contains(OpenFlags::SYNC) {
            let (first, _) = self.convert_linear_addr(offset);
            let (last, _) = self.convert_linear_addr(end - 1);
            self.cache.cache_mut().flush_range(first, last - first + 1)?;
        }
        Ok(data.len())
    }

    fn resize_to(&mut self, new_size: u64) -> VfsResult<()> {
        let old_size = self.size;
        let cache = self.cache.cache_mut();
        let block_size = cache.block_size() as u64;
        trace!(old_size, new_size, "resizing stream");

        // Bytes between the old end and the end of its last block may hold
        // stale data; growth must expose zeros there.
        let stale_end = new_size.min(cache.capacity());
        if stale_end > old_size {
            let zeros = vec![0u8; (stale_end - old_size) as usize];
            cache.write(old_size, &zeros)?;
        }

        let new_blocks = new_size.div_ceil(block_size);
        if new_blocks != cache.total_blocks() {
            cache.resize(new_blocks)?;
        }
        cache.storage_mut().set_len(new_size)?;
        self.size = new_size;
        Ok(())
    }

    fn require(&self, access: OpenFlags, context: &'static str) -> VfsResult<()> {
        if self.flags.contains(access) {
            Ok(())
        } else {
            Err(VfsError::new(VfsErrorKind::BadHandle, context))
        }
    }
}

impl<H: ObjectHandle> ObjectStream<H> {
    /// Open a stream over an object's current content.
    pub fn from_object(handle: H, block_size: usize, flags: OpenFlags) -> VfsResult<Self> {
        let size = handle.stat()?.size;
        let blocks = size.div_ceil(block_size.max(1) as u64);
        let cache = BlockCache::new(block_size, blocks, ObjectStorage::new(handle, block_size))?;
        Self::new(cache, size, flags)
    }

    pub fn handle(&self) -> &H {
        self.cache.storage().handle()
    }
}

impl<C: CacheRef> io::Read for ByteStream<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ByteStream::read(self, buf).map_err(Into::into)
    }
}

impl<C: CacheRef> io::Write for ByteStream<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ByteStream::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(Into::into)
    }
}

impl<C: CacheRef> io::Seek for ByteStream<C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        ByteStream::seek(self, pos).map_err(Into::into)
    }
}
