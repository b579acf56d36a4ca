//! A single backing region and the buddy blocks it has been divided into.

use crate::{backing::BackingRegion, layout::BlockRequest, DeviceSize};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{cmp, ffi::c_void, ptr::NonNull};

/// One backing region of a [`Pool`], divided into power-of-two sized blocks.
///
/// # Algorithm
///
/// A fresh unit consists of a single free block spanning the whole region. To serve a request,
/// the allocator looks for the smallest free block that is large enough and contains a suitably
/// aligned sub-block of the requested size. If that block is larger than needed, it is halved
/// repeatedly: the half containing the sub-block is kept and the other half goes back on the
/// free-list, until the block has the requested size. This is the lower half unless the alignment
/// doesn't work out at the start of the block. The two halves of a split are called *buddies*.
///
/// When a block is freed, the allocator checks whether its buddy is free as well. If so, the two
/// are merged back into their parent, and the check is repeated one level up. Since every block
/// was produced by halving an aligned power-of-two parent, a block of size *s* at offset *o*
/// always has its buddy at *o*&nbsp;XOR&nbsp;*s*.
///
/// Each possible block size has an *order*, the smallest (the pool's minimum allocation size)
/// being of order 0. Every order has its own free-list, sorted by offset so that the first fit is
/// also the lowest one, which keeps the upper end of the region free for as long as possible.
///
/// Allocating and freeing are both *O*(*m*) in the number of orders, plus the length of the
/// free-lists that are scanned.
///
/// [`Pool`]: crate::Pool
#[derive(Debug)]
pub struct BufferUnit<R> {
    id: u64,
    region: R,
    size: DeviceSize,
    min_block_size: DeviceSize,
    host_ptr: Option<NonNull<c_void>>,
    // Total size of the free blocks, which excludes alignment padding and other internal
    // fragmentation.
    free_size: DeviceSize,
    free_list: SmallVec<[Vec<DeviceSize>; 16]>,
    // Keyed by the alignment-corrected offset that was handed out.
    used: HashMap<DeviceSize, UsedBlock>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct UsedBlock {
    size: DeviceSize,
    padding: DeviceSize,
}

// SAFETY: The host pointer refers to a mapping that is owned exclusively by the unit.
unsafe impl<R: Send> Send for BufferUnit<R> {}

impl<R: Copy> BufferUnit<R> {
    /// Creates a unit covering the whole of `backing`, which is `size` bytes large. `id` must be
    /// unique within the pool for as long as the pool exists.
    ///
    /// # Panics
    ///
    /// - Panics if `size` or `min_block_size` is not a power of two.
    /// - Panics if `size` is smaller than `min_block_size`.
    pub(crate) fn new(
        id: u64,
        backing: BackingRegion<R>,
        size: DeviceSize,
        min_block_size: DeviceSize,
    ) -> Self {
        assert!(size.is_power_of_two());
        assert!(min_block_size.is_power_of_two());
        assert!(size >= min_block_size);

        let max_order = (size / min_block_size).trailing_zeros() as usize;
        let mut free_list: SmallVec<[Vec<DeviceSize>; 16]> =
            (0..=max_order).map(|_| Vec::new()).collect();
        // The root block has the lowest offset and highest order, so it's the whole region.
        free_list[max_order].push(0);

        BufferUnit {
            id,
            region: backing.region,
            size,
            min_block_size,
            host_ptr: backing.host_ptr,
            free_size: size,
            free_list,
            used: HashMap::default(),
        }
    }

    /// Returns the ID the pool assigned to the unit. IDs increase in creation order and are never
    /// reused, unlike region handles.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the handle of the backing region.
    #[inline]
    pub fn region(&self) -> R {
        self.region
    }

    /// Returns the total size of the unit.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the start of the host mapping, if the unit is mapped.
    #[inline]
    pub fn host_ptr(&self) -> Option<NonNull<c_void>> {
        self.host_ptr
    }

    /// Returns the total size of the free blocks.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    /// Returns the total size of the blocks that are handed out, including the padding and
    /// rounding that went into them.
    #[inline]
    pub fn used_size(&self) -> DeviceSize {
        self.size - self.free_size
    }

    /// Returns the number of live allocations in the unit.
    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.used.len()
    }

    /// Returns `true` if there are no live allocations in the unit.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Returns an iterator over the free blocks, from the smallest order to the largest.
    pub fn free_blocks(&self) -> impl Iterator<Item = BlockNode> + '_ {
        self.free_list
            .iter()
            .enumerate()
            .flat_map(move |(order, free_list)| {
                let size = self.block_size(order);

                free_list.iter().map(move |&offset| BlockNode {
                    offset,
                    size,
                    state: BlockState::Free,
                })
            })
    }

    /// Returns an iterator over the blocks that are handed out, in no particular order.
    pub fn used_blocks(&self) -> impl Iterator<Item = BlockNode> + '_ {
        self.used
            .iter()
            .map(|(&offset, &UsedBlock { size, padding })| BlockNode {
                offset: offset - padding,
                size,
                state: BlockState::Used { padding },
            })
    }

    /// Returns all blocks of the unit, sorted by offset.
    pub fn blocks(&self) -> Vec<BlockNode> {
        let mut blocks: Vec<_> = self.free_blocks().chain(self.used_blocks()).collect();
        blocks.sort_unstable_by_key(|block| block.offset);

        blocks
    }

    /// Returns the host pointer corresponding to `offset`, if the unit is mapped.
    pub(crate) fn host_ptr_at(&self, offset: DeviceSize) -> Option<NonNull<c_void>> {
        debug_assert!(offset < self.size);

        let ptr = self.host_ptr?;
        let offset = usize::try_from(offset).ok();
        debug_assert!(offset.is_some(), "the host mapping exceeds the address space");

        // SAFETY: `offset` lies within the unit, and the `BackingStore` contract guarantees that
        // the mapping spans the whole unit.
        Some(unsafe { ptr.byte_add(offset?) })
    }

    /// Carves a block for `request` out of the unit and returns the alignment-corrected offset,
    /// or [`None`] if no free block can hold the request.
    pub(crate) fn allocate(&mut self, request: &BlockRequest) -> Option<DeviceSize> {
        let block_size = request.block_size();

        debug_assert!(block_size >= self.min_block_size);

        if block_size > self.size {
            return None;
        }

        let min_order = self.order_of(block_size);

        // Start searching at the lowest possible order going up.
        for order in min_order..self.free_list.len() {
            let span = self.block_size(order);
            let Some((index, target, offset)) = self.free_list[order]
                .iter()
                .enumerate()
                .find_map(|(index, &address)| {
                    let (target, offset) = request.placement_within(address, span)?;

                    Some((index, target, offset))
                })
            else {
                continue;
            };

            let mut address = self.free_list[order].remove(index);

            // Go in the opposite direction, splitting blocks from higher orders. The half
            // containing `target` is kept each time. The lowest order doesn't need any splitting.
            for order in (min_order..order).rev() {
                // This can't overflow because the upper half lies within the unit.
                let upper_half = address + self.block_size(order);
                let (kept, released) = if target < upper_half {
                    (address, upper_half)
                } else {
                    (upper_half, address)
                };
                let free_list = &mut self.free_list[order];

                let (Ok(index) | Err(index)) = free_list.binary_search(&released);
                free_list.insert(index, released);
                address = kept;
            }

            debug_assert_eq!(address, target);

            self.used.insert(
                offset,
                UsedBlock {
                    size: block_size,
                    padding: offset - address,
                },
            );
            self.free_size -= block_size;

            return Some(offset);
        }

        None
    }

    /// Frees the block that was handed out at `offset`, coalescing it with its buddies, and
    /// returns the size of the freed block. Returns [`None`] if nothing is allocated at `offset`.
    pub(crate) fn deallocate(&mut self, offset: DeviceSize) -> Option<DeviceSize> {
        let UsedBlock { size, padding } = self.used.remove(&offset)?;
        let mut address = offset - padding;
        let min_order = self.order_of(size);

        // Try to coalesce blocks while incrementing the order.
        for order in min_order..self.free_list.len() {
            let buddy = address ^ self.block_size(order);
            let free_list = &mut self.free_list[order];

            match free_list.binary_search(&buddy) {
                // If the buddy is in the free-list, we can coalesce.
                Ok(index) => {
                    free_list.remove(index);
                    address = cmp::min(address, buddy);
                }
                // Otherwise free the block. The root block never has a buddy, so we always end
                // up here eventually.
                Err(_) => {
                    let (Ok(index) | Err(index)) = free_list.binary_search(&address);
                    free_list.insert(index, address);

                    break;
                }
            }
        }

        self.free_size += size;

        Some(size)
    }

    #[inline]
    fn order_of(&self, block_size: DeviceSize) -> usize {
        (block_size / self.min_block_size).trailing_zeros() as usize
    }

    #[inline]
    fn block_size(&self, order: usize) -> DeviceSize {
        // This can't discard any bits because `order` is confined to the range
        // [0, log(size / min_block_size)].
        self.min_block_size << order
    }
}

/// A block within a [`BufferUnit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockNode {
    /// The offset of the block within the unit. For used blocks, this is the start of the block
    /// itself, not the alignment-corrected offset that was handed out.
    pub offset: DeviceSize,

    /// The size of the block, always a power of two.
    pub size: DeviceSize,

    /// Whether the block is free.
    pub state: BlockState,
}

/// Tells whether a [`BlockNode`] is free, and if not, how much of it was skipped to satisfy the
/// alignment of the allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// The block is free.
    Free,

    /// The block is handed out. The allocation starts `padding` bytes into the block.
    Used { padding: DeviceSize },
}
