//! Power-of-two arithmetic and the translation of a `(size, alignment)` request into a buddy
//! block size.
//!
//! Blocks handed out by a [`BufferUnit`] always have a power-of-two size and start at a multiple
//! of that size. Alignments requested by the caller on the other hand can be anything, for
//! example the 96-byte stride of a vertex format. To serve such a request, the alignment is split
//! into its largest power-of-two factor (the *base alignment*), which the block address itself
//! satisfies, and a *residual* which is added to the requested size so that the offset can be
//! pushed forward inside the block.
//!
//! [`BufferUnit`]: crate::BufferUnit

use crate::DeviceSize;
use std::cmp;

/// The largest power of two representable by a [`DeviceSize`].
pub const MAX_POWER_OF_TWO: DeviceSize = 1 << (DeviceSize::BITS - 1);

/// Returns the largest power of two smaller or equal to the input, or zero if the input is zero.
#[inline]
pub const fn prev_power_of_two(val: DeviceSize) -> DeviceSize {
    if val == 0 {
        0
    } else {
        // This can't overflow because `val` is non-zero, which means it has fewer leading zeroes
        // than the total number of bits.
        MAX_POWER_OF_TWO >> val.leading_zeros()
    }
}

/// Returns the smallest power of two greater or equal to the input, or [`None`] if that isn't
/// representable.
#[inline]
pub const fn next_power_of_two(val: DeviceSize) -> Option<DeviceSize> {
    val.checked_next_power_of_two()
}

/// Returns whether `offset` is a multiple of `alignment`, which doesn't need to be a power of
/// two.
#[inline]
pub const fn is_aligned(offset: DeviceSize, alignment: DeviceSize) -> bool {
    if alignment.is_power_of_two() {
        offset & (alignment - 1) == 0
    } else {
        offset % alignment == 0
    }
}

/// A suballocation request, already inflated to the size of the buddy block that will back it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    size: DeviceSize,
    alignment: DeviceSize,
    base_alignment: DeviceSize,
    block_size: DeviceSize,
}

impl BlockRequest {
    /// Creates a new `BlockRequest`.
    ///
    /// The block size is the requested `size` plus the residual of `alignment`, at least
    /// `min_block_size`, rounded up to the next power of two.
    ///
    /// Returns [`None`] if the block size is not representable.
    ///
    /// # Panics
    ///
    /// - Panics if `size` or `alignment` is zero.
    /// - Panics if `min_block_size` is not a power of two.
    pub fn new(
        size: DeviceSize,
        alignment: DeviceSize,
        min_block_size: DeviceSize,
    ) -> Option<Self> {
        assert_ne!(size, 0);
        assert_ne!(alignment, 0);
        assert!(min_block_size.is_power_of_two());

        let base_alignment = prev_power_of_two(alignment);
        let residual = alignment - base_alignment;
        let block_size = next_power_of_two(size.checked_add(residual)?.max(min_block_size))?;

        Some(BlockRequest {
            size,
            alignment,
            base_alignment,
            block_size,
        })
    }

    /// Returns the size that was requested.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the alignment that was requested.
    #[inline]
    pub const fn alignment(&self) -> DeviceSize {
        self.alignment
    }

    /// Returns the largest power of two not exceeding the requested alignment.
    #[inline]
    pub const fn base_alignment(&self) -> DeviceSize {
        self.base_alignment
    }

    /// Returns the part of the requested alignment that is not covered by the base alignment.
    #[inline]
    pub const fn residual(&self) -> DeviceSize {
        self.alignment - self.base_alignment
    }

    /// Returns the size of the buddy block needed to satisfy the request.
    #[inline]
    pub const fn block_size(&self) -> DeviceSize {
        self.block_size
    }

    /// Returns the offset at or after `address` that satisfies the requested alignment, or
    /// [`None`] if there is no such offset.
    #[inline]
    pub fn corrected_offset(&self, address: DeviceSize) -> Option<DeviceSize> {
        address.checked_next_multiple_of(self.alignment)
    }

    /// Returns the alignment-corrected offset of the request inside a block of [`block_size`]
    /// starting at `address`, or [`None`] if the block can't hold the request.
    ///
    /// The block address must be a multiple of the base alignment, and the requested size must
    /// still fit in the block after the offset has been pushed forward to the requested
    /// alignment.
    ///
    /// [`block_size`]: Self::block_size
    pub fn placement(&self, address: DeviceSize) -> Option<DeviceSize> {
        if !is_aligned(address, self.base_alignment) {
            return None;
        }

        // `block_size >= size` always holds, so this can't underflow.
        let slack = self.block_size - self.size;
        let offset = self.corrected_offset(address)?;

        (offset - address <= slack).then_some(offset)
    }

    /// Returns the address of the first sub-block of [`block_size`] inside the free block of
    /// `span` bytes at `address` that can hold the request, together with the corrected offset
    /// inside it.
    ///
    /// `span` must be a power of two no smaller than the block size, and `address` a multiple of
    /// `span`.
    ///
    /// [`block_size`]: Self::block_size
    pub fn placement_within(
        &self,
        address: DeviceSize,
        span: DeviceSize,
    ) -> Option<(DeviceSize, DeviceSize)> {
        debug_assert!(span.is_power_of_two() && span >= self.block_size);
        debug_assert!(is_aligned(address, span));

        // Sub-blocks not aligned to the base alignment are never suitable.
        let stride = cmp::max(self.block_size, self.base_alignment);
        let end = address.checked_add(span)?;
        let mut target = address.checked_next_multiple_of(stride)?;

        // `stride` is a multiple of the alignment's power-of-two factor, so after this many
        // strides the target is in the same position relative to the alignment again.
        let period = self.alignment >> self.alignment.trailing_zeros();

        for _ in 0..period {
            if target >= end {
                break;
            }

            if let Some(offset) = self.placement(target) {
                return Some((target, offset));
            }

            target = target.checked_add(stride)?;
        }

        None
    }
}
