//! Backing storage for a [`BlockCache`](crate::BlockCache).

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::trace;

use crate::{VfsError, VfsErrorKind, VfsResult};

/// The callbacks a block cache uses to reach persistent storage.
///
/// Buffers handed to `fetch_block`/`flush_block` are exactly one block long
/// and the index is always inside the current bounds.
pub trait BlockStorage {
    fn fetch_block(&mut self, index: u64, buf: &mut [u8]) -> VfsResult<()>;

    fn flush_block(&mut self, index: u64, data: &[u8]) -> VfsResult<()>;

    /// Change the number of blocks. Called before the cache touches any of
    /// its own state, so returning an error aborts the resize.
    fn resize(&mut self, new_total_blocks: u64) -> VfsResult<()>;

    /// Exact logical length in bytes after a byte-granular truncate.
    fn set_len(&mut self, _len: u64) -> VfsResult<()> {
        Ok(())
    }
}

impl<S: BlockStorage + ?Sized> BlockStorage for Box<S> {
    fn fetch_block(&mut self, index: u64, buf: &mut [u8]) -> VfsResult<()> {
        (**self).fetch_block(index, buf)
    }

    fn flush_block(&mut self, index: u64, data: &[u8]) -> VfsResult<()> {
        (**self).flush_block(index, data)
    }

    fn resize(&mut self, new_total_blocks: u64) -> VfsResult<()> {
        (**self).resize(new_total_blocks)
    }

    fn set_len(&mut self, len: u64) -> VfsResult<()> {
        (**self).set_len(len)
    }
}

/// Anything seekable can back an image: a file, an in-memory cursor, a
/// partition window over a larger device.
pub trait ImageDevice: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ImageDevice for T {}

/// Maps block `i` to bytes `base + i * block_size` of a seekable device.
#[derive(Debug)]
pub struct DeviceStorage<D> {
    device: D,
    block_size: usize,
    base: u64,
    max_blocks: Option<u64>,
}

impl<D: ImageDevice> DeviceStorage<D> {
    pub fn new(device: D, block_size: usize) -> Self {
        Self {
            device,
            block_size,
            base: 0,
            max_blocks: None,
        }
    }

    /// Byte offset of block 0 on the device.
    pub fn with_base(mut self, base: u64) -> Self {
        self.base = base;
        self
    }

    /// Refuse to grow past `max_blocks` blocks.
    pub fn with_max_blocks(mut self, max_blocks: u64) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    fn seek_to(&mut self, index: u64) -> VfsResult<()> {
        let offset = index
            .checked_mul(self.block_size as u64)
            .and_then(|offset| offset.checked_add(self.base))
            .ok_or_else(|| {
                VfsError::new(VfsErrorKind::InvalidInput, "device.seek")
                    .with_message(format!("block {index} overflows the device"))
            })?;
        self.device.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl<D: ImageDevice> BlockStorage for DeviceStorage<D> {
    fn fetch_block(&mut self, index: u64, buf: &mut [u8]) -> VfsResult<()> {
        trace!(index, "device fetch");
        self.seek_to(index)?;
        // Images may be shorter than their declared geometry; missing tail
        // bytes read as zero.
        let mut filled = 0;
        while filled < buf.len() {
            match self.device.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn flush_block(&mut self, index: u64, data: &[u8]) -> VfsResult<()> {
        trace!(index, "device flush");
        self.seek_to(index)?;
        self.device.write_all(data)?;
        self.device.flush()?;
        Ok(())
    }

    fn resize(&mut self, new_total_blocks: u64) -> VfsResult<()> {
        match self.max_blocks {
            Some(max) if new_total_blocks > max => {
                Err(VfsError::new(VfsErrorKind::NoSpace, "device.resize")
                    .with_message(format!("{new_total_blocks} blocks exceed device size {max}")))
            }
            _ => Ok(()),
        }
    }
}
