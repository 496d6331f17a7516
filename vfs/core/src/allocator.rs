//! One-bit-per-unit allocator for blocks, clusters or inodes.
//!
//! Allocation is strictly lowest-index first-fit so that results are
//! bit-exact against reference images.

use fixedbitset::FixedBitSet;
use tracing::trace;

use crate::{VfsError, VfsErrorKind, VfsResult};

/// What a set bit means in an on-disk bitmap image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapPolarity {
    /// A set bit marks a unit in use.
    InUse,
    /// A set bit marks a free unit.
    Free,
}

/// Tracks allocation state with one bit per unit; a set bit is allocated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitmapAllocator {
    bits: FixedBitSet,
}

impl BitmapAllocator {
    /// All units start free.
    pub fn new(total_units: usize) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(total_units),
        }
    }

    /// Seed from an on-disk bitmap image. Bits are read LSB-first within
    /// each byte; bytes past `total_units` bits are ignored.
    pub fn from_bitmap(
        image: &[u8],
        total_units: usize,
        polarity: BitmapPolarity,
    ) -> VfsResult<Self> {
        if image.len().saturating_mul(8) < total_units {
            return Err(VfsError::new(VfsErrorKind::InvalidInput, "allocator.seed")
                .with_message(format!(
                    "{} bitmap bytes cannot describe {total_units} units",
                    image.len()
                )));
        }

        let mut bits = FixedBitSet::with_capacity(total_units);
        for unit in 0..total_units {
            let set = image[unit / 8] & (1 << (unit % 8)) != 0;
            let allocated = match polarity {
                BitmapPolarity::InUse => set,
                BitmapPolarity::Free => !set,
            };
            if allocated {
                bits.insert(unit);
            }
        }
        Ok(Self { bits })
    }

    pub fn from_in_use_bitmap(image: &[u8], total_units: usize) -> VfsResult<Self> {
        Self::from_bitmap(image, total_units, BitmapPolarity::InUse)
    }

    pub fn from_free_bitmap(image: &[u8], total_units: usize) -> VfsResult<Self> {
        Self::from_bitmap(image, total_units, BitmapPolarity::Free)
    }

    /// Seed from several redundant copies of the same table. Copies that
    /// disagree are reported as corruption, never reconciled.
    pub fn from_redundant_copies(
        copies: &[&[u8]],
        total_units: usize,
        polarity: BitmapPolarity,
    ) -> VfsResult<Self> {
        let (first, rest) = copies.split_first().ok_or_else(|| {
            VfsError::new(VfsErrorKind::InvalidInput, "allocator.seed.copies")
                .with_message("no bitmap copies given")
        })?;

        let allocator = Self::from_bitmap(first, total_units, polarity)?;
        for (index, copy) in rest.iter().enumerate() {
            let other = Self::from_bitmap(copy, total_units, polarity)?;
            if other != allocator {
                return Err(
                    VfsError::new(VfsErrorKind::Corrupted, "allocator.seed.copies").with_message(
                        format!("bitmap copy {} disagrees with copy 0", index + 1),
                    ),
                );
            }
        }
        Ok(allocator)
    }

    /// Export as a bitmap image in the given polarity, LSB-first.
    pub fn to_bitmap(&self, polarity: BitmapPolarity) -> Vec<u8> {
        let mut image = vec![0u8; self.bits.len().div_ceil(8)];
        for unit in 0..self.bits.len() {
            let set = match polarity {
                BitmapPolarity::InUse => self.bits.contains(unit),
                BitmapPolarity::Free => !self.bits.contains(unit),
            };
            if set {
                image[unit / 8] |= 1 << (unit % 8);
            }
        }
        image
    }

    pub fn total_units(&self) -> usize {
        self.bits.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn free_count(&self) -> usize {
        self.total_units() - self.allocated_count()
    }

    pub fn is_allocated(&self, unit: usize) -> bool {
        self.bits.contains(unit)
    }

    /// Allocate the lowest free unit.
    pub fn allocate_single(&mut self) -> VfsResult<usize> {
        let unit = (0..self.bits.len())
            .find(|&unit| !self.bits.contains(unit))
            .ok_or_else(|| VfsError::new(VfsErrorKind::NoSpace, "allocator.allocate_single"))?;
        self.bits.insert(unit);
        trace!(unit, "allocated unit");
        Ok(unit)
    }

    pub fn free_single(&mut self, unit: usize) -> VfsResult<()> {
        self.check_range(unit, 1, "allocator.free_single")?;
        if !self.bits.contains(unit) {
            return Err(VfsError::new(VfsErrorKind::AlreadyFree, "allocator.free_single")
                .with_message(format!("unit {unit} is not allocated")));
        }
        self.bits.set(unit, false);
        trace!(unit, "freed unit");
        Ok(())
    }

    /// First index of a run of `count` consecutive units whose state equals
    /// `value` (`true` = allocated).
    pub fn find_contiguous_values(&self, value: bool, count: usize) -> Option<usize> {
        if count == 0 || count > self.bits.len() {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for unit in 0..self.bits.len() {
            if self.bits.contains(unit) == value {
                if run_len == 0 {
                    run_start = unit;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Whether `count` units starting at `start` all equal `value`.
    /// Ranges reaching past the end never match.
    pub fn has_contiguous_values_at(&self, start: usize, value: bool, count: usize) -> bool {
        match start.checked_add(count) {
            Some(end) if end <= self.bits.len() => {
                (start..end).all(|unit| self.bits.contains(unit) == value)
            }
            _ => false,
        }
    }

    /// Allocate the lowest run of `count` free units.
    pub fn allocate_contiguous(&mut self, count: usize) -> VfsResult<usize> {
        if count == 0 {
            return Err(VfsError::new(
                VfsErrorKind::InvalidInput,
                "allocator.allocate_contiguous",
            )
            .with_message("cannot allocate an empty run"));
        }
        let start = self.find_contiguous_values(false, count).ok_or_else(|| {
            VfsError::new(VfsErrorKind::NoSpace, "allocator.allocate_contiguous")
                .with_message(format!("no free run of {count} units"))
        })?;
        self.bits.set_range(start..start + count, true);
        trace!(start, count, "allocated run");
        Ok(start)
    }

    /// Free a run. Nothing is modified unless every unit in the range is
    /// currently allocated.
    pub fn free_contiguous(&mut self, start: usize, count: usize) -> VfsResult<()> {
        self.check_range(start, count, "allocator.free_contiguous")?;
        if !self.has_contiguous_values_at(start, true, count) {
            return Err(
                VfsError::new(VfsErrorKind::AlreadyFree, "allocator.free_contiguous")
                    .with_message(format!(
                        "units {start}..{} are not all allocated",
                        start + count
                    )),
            );
        }
        self.bits.set_range(start..start + count, false);
        trace!(start, count, "freed run");
        Ok(())
    }

    /// Mark a range allocated regardless of its current state, e.g. to
    /// reserve metadata regions at mount time.
    pub fn mark_allocated(&mut self, start: usize, count: usize) -> VfsResult<()> {
        self.check_range(start, count, "allocator.mark_allocated")?;
        self.bits.set_range(start..start + count, true);
        Ok(())
    }

    fn check_range(&self, start: usize, count: usize, context: &'static str) -> VfsResult<()> {
        let in_range = count > 0
            && start
                .checked_add(count)
                .is_some_and(|end| end <= self.bits.len());
        if in_range {
            Ok(())
        } else {
            Err(VfsError::new(VfsErrorKind::InvalidInput, context).with_message(format!(
                "units {start}+{count} outside 0..{}",
                self.bits.len()
            )))
        }
    }
}
