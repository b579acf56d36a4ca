//! The pool that grows and shrinks a set of [`BufferUnit`]s on demand.

use crate::{
    backing::{BackingRegion, BackingStore, MemoryKind, RegionError},
    barrier::RegionBarrier,
    layout::{self, BlockRequest},
    unit::BufferUnit,
    DeviceSize, NonExhaustive,
};
use ash::vk;
use log::{debug, trace, warn};
use smallvec::SmallVec;
use std::{
    cmp,
    error::Error,
    ffi::c_void,
    fmt::{self, Display},
    ptr::NonNull,
};

const K: DeviceSize = 1024;
const M: DeviceSize = 1024 * K;

/// A buddy allocator spanning any number of backing regions of one usage and memory kind.
///
/// No memory is allocated when the pool is created. The first call to [`suballocate`] creates
/// the first [`BufferUnit`], and more units are created whenever none of the existing ones has a
/// suitable free block left. A unit is destroyed as soon as its last allocation is freed, unless
/// the [`UnitRetention`] policy says otherwise.
///
/// See [`BufferUnit`] for details about the allocation algorithm.
///
/// # Locking behavior
///
/// The pool never locks. If it is shared between threads, every call must be serialized by the
/// caller, for example by putting the pool in a mutex. Having one pool per memory kind, or even
/// per thread, is perfectly fine as pools don't share any state.
///
/// [`suballocate`]: Self::suballocate
#[derive(Debug)]
pub struct Pool<B: BackingStore> {
    store: B,
    usage: vk::BufferUsageFlags,
    memory_kind: MemoryKind,
    unit_size: DeviceSize,
    min_allocation_size: DeviceSize,
    unit_retention: UnitRetention,
    // Searched front to back; new units are appended at the end, so this is sorted by ID.
    units: Vec<BufferUnit<B::Region>>,
    next_unit_id: u64,
}

impl<B: BackingStore> Pool<B> {
    /// Creates a new, empty `Pool` that gets its backing regions from `store`.
    ///
    /// `create_info.initial_unit_size` is rounded up to the next power of two and
    /// `create_info.min_allocation_size` is rounded down to the previous power of two.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.initial_unit_size` is zero.
    /// - Panics if `create_info.initial_unit_size` is greater than 2<sup>63</sup>.
    /// - Panics if `create_info.min_allocation_size` is zero.
    pub fn new(store: B, create_info: PoolCreateInfo) -> Self {
        Self::validate_new(&create_info);

        let PoolCreateInfo {
            usage,
            memory_kind,
            initial_unit_size,
            min_allocation_size,
            unit_retention,
            _ne: _,
        } = create_info;

        let min_allocation_size = layout::prev_power_of_two(min_allocation_size);
        let unit_size = cmp::max(initial_unit_size.next_power_of_two(), min_allocation_size);

        Pool {
            store,
            usage,
            memory_kind,
            unit_size,
            min_allocation_size,
            unit_retention,
            units: Vec::new(),
            next_unit_id: 0,
        }
    }

    fn validate_new(create_info: &PoolCreateInfo) {
        let &PoolCreateInfo {
            usage: _,
            memory_kind: _,
            initial_unit_size,
            min_allocation_size,
            unit_retention: _,
            _ne: _,
        } = create_info;

        assert!(initial_unit_size != 0, "the initial unit size must not be zero");
        assert!(
            initial_unit_size <= layout::MAX_POWER_OF_TWO,
            "the initial unit size must not exceed 2^63",
        );
        assert!(
            min_allocation_size != 0,
            "the minimum allocation size must not be zero",
        );
    }

    /// Returns the buffer usage that backing regions are created with.
    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Returns the memory kind that backing regions are created with.
    #[inline]
    pub fn memory_kind(&self) -> MemoryKind {
        self.memory_kind
    }

    /// Returns the size new units are created with, unless a request needs a bigger one.
    #[inline]
    pub fn unit_size(&self) -> DeviceSize {
        self.unit_size
    }

    /// Returns the smallest block size the pool hands out.
    #[inline]
    pub fn min_allocation_size(&self) -> DeviceSize {
        self.min_allocation_size
    }

    /// Returns the policy for units that become empty.
    #[inline]
    pub fn unit_retention(&self) -> UnitRetention {
        self.unit_retention
    }

    /// Returns the backing store.
    #[inline]
    pub fn backing_store(&self) -> &B {
        &self.store
    }

    /// Returns the backing store mutably.
    #[inline]
    pub fn backing_store_mut(&mut self) -> &mut B {
        &mut self.store
    }

    /// Returns an iterator over the units of the pool, in the order they are searched.
    #[inline]
    pub fn units(&self) -> impl ExactSizeIterator<Item = &BufferUnit<B::Region>> {
        self.units.iter()
    }

    /// Returns the number of units, which is the number of live backing regions.
    #[inline]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Returns the total free size of all units.
    pub fn free_size(&self) -> DeviceSize {
        self.units.iter().map(BufferUnit::free_size).sum()
    }

    /// Returns the total size of all blocks that are handed out.
    pub fn allocated_size(&self) -> DeviceSize {
        self.units.iter().map(BufferUnit::used_size).sum()
    }

    /// Allocates `size` bytes at an offset that is a multiple of `alignment`.
    ///
    /// `alignment` doesn't need to be a power of two. Pass `1` if there is no alignment
    /// requirement.
    ///
    /// # Panics
    ///
    /// - Panics if `size` is zero.
    /// - Panics if `alignment` is zero.
    ///
    /// # Errors
    ///
    /// - Returns [`AlignmentOverflow`] if `size` inflated by the alignment can't be represented as
    ///   a power-of-two block size.
    /// - Returns [`AllocationExhausted`] if none of the units could satisfy the request and
    ///   creating a new backing region failed. Freeing other allocations and trying again may
    ///   succeed.
    ///
    /// [`AlignmentOverflow`]: PoolError::AlignmentOverflow
    /// [`AllocationExhausted`]: PoolError::AllocationExhausted
    pub fn suballocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Result<Allocation<B::Region>, PoolError> {
        assert!(size != 0, "the allocation size must not be zero");
        assert!(alignment != 0, "the alignment must not be zero");

        let request = BlockRequest::new(size, alignment, self.min_allocation_size)
            .ok_or(PoolError::AlignmentOverflow)?;

        for unit in &mut self.units {
            if let Some(offset) = unit.allocate(&request) {
                trace!(
                    "suballocated {} bytes (alignment {}) at offset {} of {:?}",
                    size,
                    alignment,
                    offset,
                    unit.region(),
                );

                return Ok(Allocation::new(unit, offset, size));
            }
        }

        // None of the units has a suitable block left, so we need a new one.
        let mut unit = self.create_unit(cmp::max(request.block_size(), self.unit_size))?;

        let Some(offset) = unit.allocate(&request) else {
            // The unit is at least as large as the block, and offset 0 satisfies any alignment.
            unreachable!();
        };

        trace!(
            "suballocated {} bytes (alignment {}) at offset {} of new unit {:?}",
            size,
            alignment,
            offset,
            unit.region(),
        );

        let allocation = Allocation::new(&unit, offset, size);
        self.units.push(unit);

        Ok(allocation)
    }

    /// Frees `allocation`, destroying its unit if that was the unit's last allocation.
    ///
    /// # Errors
    ///
    /// - Returns [`InvalidFree`] if `allocation` is not currently allocated from `self`, for
    ///   example because it was already freed. The pool is left untouched in that case. This also
    ///   holds when the backing store has since handed out the same region handle again.
    ///
    /// [`InvalidFree`]: PoolError::InvalidFree
    pub fn free(&mut self, allocation: Allocation<B::Region>) -> Result<(), PoolError> {
        let Some(index) = self
            .units
            .binary_search_by_key(&allocation.unit_id, BufferUnit::id)
            .ok()
            .filter(|&index| self.units[index].region() == allocation.region)
        else {
            warn!(
                "rejected free at offset {}: unit {} with {:?} is not part of this pool",
                allocation.offset, allocation.unit_id, allocation.region,
            );

            return Err(PoolError::InvalidFree);
        };

        let unit = &mut self.units[index];

        let Some(block_size) = unit.deallocate(allocation.offset) else {
            warn!(
                "rejected free at offset {} of {:?}: nothing is allocated there",
                allocation.offset, allocation.region,
            );

            return Err(PoolError::InvalidFree);
        };

        trace!(
            "freed a {} byte block at offset {} of {:?}",
            block_size,
            allocation.offset,
            allocation.region,
        );

        if unit.is_empty() {
            if self.unit_retention == UnitRetention::KeepLast && self.units.len() == 1 {
                debug!("keeping empty unit {:?}", allocation.region);
            } else {
                let unit = self.units.remove(index);
                Self::destroy_unit(&mut self.store, &unit);
            }
        }

        Ok(())
    }

    /// Destroys every unit that has no live allocations, regardless of the [`UnitRetention`]
    /// policy.
    pub fn trim(&mut self) {
        let Pool { store, units, .. } = self;

        units.retain(|unit| {
            if unit.is_empty() {
                Self::destroy_unit(store, unit);

                false
            } else {
                true
            }
        });
    }

    /// Returns a memory dependency for every live backing region, for use around bulk transfers
    /// that touch the pool's memory as a whole.
    pub fn region_barriers(
        &self,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> SmallVec<[RegionBarrier<B::Region>; 4]> {
        self.units
            .iter()
            .map(|unit| RegionBarrier {
                region: unit.region(),
                size: unit.size(),
                src_access,
                dst_access,
            })
            .collect()
    }

    fn create_unit(&mut self, size: DeviceSize) -> Result<BufferUnit<B::Region>, PoolError> {
        let backing = self
            .store
            .create_region(size, self.usage, self.memory_kind)
            .map_err(|err| {
                warn!("failed to create a backing region of {} bytes: {}", size, err);

                PoolError::AllocationExhausted(err)
            })?;

        let backing = match (self.memory_kind.is_host_visible(), backing.host_ptr) {
            (true, Some(_)) | (false, None) => backing,
            (true, None) => {
                warn!(
                    "backing region {:?} of a {:?} pool is not mapped",
                    backing.region, self.memory_kind,
                );
                self.store.destroy_region(backing.region);

                return Err(PoolError::AllocationExhausted(RegionError::MemoryMapFailed));
            }
            (false, Some(_)) => {
                // Device-only memory is never accessed through the host.
                self.store.unmap_region(backing.region);

                BackingRegion::unmapped(backing.region)
            }
        };

        debug!(
            "created unit {:?} of {} bytes ({} units in the pool)",
            backing.region,
            size,
            self.units.len() + 1,
        );

        let id = self.next_unit_id;
        self.next_unit_id += 1;

        Ok(BufferUnit::new(id, backing, size, self.min_allocation_size))
    }

    fn destroy_unit(store: &mut B, unit: &BufferUnit<B::Region>) {
        if unit.host_ptr().is_some() {
            store.unmap_region(unit.region());
        }

        store.destroy_region(unit.region());

        debug!("destroyed unit {:?} of {} bytes", unit.region(), unit.size());
    }
}

impl<B: BackingStore> Drop for Pool<B> {
    fn drop(&mut self) {
        let live: usize = self.units.iter().map(BufferUnit::allocation_count).sum();

        if live != 0 {
            warn!("dropping a pool with {} live allocations", live);
        }

        for unit in self.units.drain(..) {
            Self::destroy_unit(&mut self.store, &unit);
        }
    }
}

/// Parameters to create a new [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolCreateInfo {
    /// The buffer usage that backing regions are created with.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::BufferUsageFlags,

    /// The kind of memory that backing regions are created in.
    ///
    /// The default value is [`MemoryKind::DeviceOnly`].
    pub memory_kind: MemoryKind,

    /// The size of the units the pool creates, unless a single request needs a larger one. Rounded
    /// up to the next power of two.
    ///
    /// The default value is 64MiB.
    pub initial_unit_size: DeviceSize,

    /// The smallest block the pool hands out. Rounded down to the previous power of two.
    ///
    /// Smaller values waste less memory on small allocations but make the free-lists longer.
    ///
    /// The default value is `32`.
    pub min_allocation_size: DeviceSize,

    /// What to do with units whose last allocation was freed.
    ///
    /// The default value is [`UnitRetention::Release`].
    pub unit_retention: UnitRetention,

    pub _ne: NonExhaustive,
}

impl Default for PoolCreateInfo {
    #[inline]
    fn default() -> Self {
        PoolCreateInfo {
            usage: vk::BufferUsageFlags::empty(),
            memory_kind: MemoryKind::DeviceOnly,
            initial_unit_size: 64 * M,
            min_allocation_size: 32,
            unit_retention: UnitRetention::Release,
            _ne: NonExhaustive(()),
        }
    }
}

/// Decides what happens to a [`BufferUnit`] whose last allocation was freed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum UnitRetention {
    /// The unit is destroyed right away.
    ///
    /// This keeps the memory footprint minimal, at the cost of recreating a backing region when
    /// a pool repeatedly goes from empty to non-empty.
    #[default]
    Release,

    /// The unit is kept if it is the only unit of the pool. Other units are still destroyed
    /// right away. Use [`Pool::trim`] to release it.
    KeepLast,
}

/// A suballocation made by a [`Pool`].
///
/// This is a plain handle that doesn't own anything: it stays valid until it is passed to
/// [`Pool::free`], which must happen before the pool is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Allocation<R> {
    unit_id: u64,
    region: R,
    offset: DeviceSize,
    size: DeviceSize,
    host_ptr: Option<NonNull<c_void>>,
}

// SAFETY: The host pointer is only handed out, never dereferenced by the allocation itself.
unsafe impl<R: Send> Send for Allocation<R> {}
unsafe impl<R: Sync> Sync for Allocation<R> {}

impl<R: Copy> Allocation<R> {
    fn new(unit: &BufferUnit<R>, offset: DeviceSize, size: DeviceSize) -> Self {
        Allocation {
            unit_id: unit.id(),
            region: unit.region(),
            offset,
            size,
            host_ptr: unit.host_ptr_at(offset),
        }
    }

    /// Returns the ID of the [`BufferUnit`] the allocation lives in.
    #[inline]
    pub fn unit_id(&self) -> u64 {
        self.unit_id
    }

    /// Returns the backing region the allocation lives in.
    #[inline]
    pub fn region(&self) -> R {
        self.region
    }

    /// Returns the offset of the allocation within the backing region. This is aligned to the
    /// requested alignment.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size that was requested.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns a pointer to the start of the allocation in host memory, if the pool's memory kind
    /// is host-visible.
    #[inline]
    pub fn host_ptr(&self) -> Option<NonNull<c_void>> {
        self.host_ptr
    }
}

/// Error that can be returned by a [`Pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// None of the units could satisfy the request, and creating a new backing region failed.
    AllocationExhausted(RegionError),

    /// The allocation passed to [`Pool::free`] is not currently allocated from the pool.
    InvalidFree,

    /// The requested size, inflated to satisfy the alignment, doesn't fit in a block size.
    AlignmentOverflow,
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AllocationExhausted(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AllocationExhausted(_) => "the pool is exhausted and could not grow",
            Self::InvalidFree => "the allocation is not allocated from this pool",
            Self::AlignmentOverflow => "the allocation size overflows when aligned",
        };

        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tests::{check_disjoint, check_invariants, MockStore},
        unit::{BlockNode, BlockState},
    };
    use ash::vk::Handle;
    use crossbeam_queue::ArrayQueue;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::{iter, thread};

    fn create_info(
        initial_unit_size: DeviceSize,
        min_allocation_size: DeviceSize,
    ) -> PoolCreateInfo {
        PoolCreateInfo {
            usage: vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            initial_unit_size,
            min_allocation_size,
            ..Default::default()
        }
    }

    fn free_blocks<B: BackingStore>(pool: &Pool<B>) -> Vec<(DeviceSize, DeviceSize)> {
        let mut blocks: Vec<_> = pool
            .units()
            .flat_map(BufferUnit::free_blocks)
            .map(|block| (block.size, block.offset))
            .collect();
        blocks.sort_unstable();

        blocks
    }

    #[test]
    fn create_info_is_normalized() {
        let pool = Pool::new(MockStore::default(), create_info(300, 48));

        assert_eq!(pool.unit_size(), 512);
        assert_eq!(pool.min_allocation_size(), 32);
        assert_eq!(pool.unit_count(), 0);
        assert!(pool.backing_store().created.is_empty());

        let pool = Pool::new(MockStore::default(), create_info(8, 64));
        assert_eq!(pool.unit_size(), 64);

        let pool = Pool::new(MockStore::default(), PoolCreateInfo::default());
        assert_eq!(pool.unit_size(), 64 * M);
        assert_eq!(pool.min_allocation_size(), 32);
        assert_eq!(pool.unit_retention(), UnitRetention::Release);
    }

    #[test]
    #[should_panic]
    fn zero_min_allocation_size() {
        Pool::new(MockStore::default(), create_info(256, 0));
    }

    #[test]
    #[should_panic]
    fn zero_size() {
        let mut pool = Pool::new(MockStore::default(), create_info(256, 16));
        let _ = pool.suballocate(0, 1);
    }

    #[test]
    fn full_coalescence() {
        let mut store = MockStore::default();

        {
            let mut pool = Pool::new(&mut store, create_info(256, 16));

            let a = pool.suballocate(16, 1).unwrap();
            assert_eq!(a.offset(), 0);
            let b = pool.suballocate(16, 1).unwrap();
            assert_eq!(b.offset(), 16);
            assert_eq!(pool.unit_count(), 1);

            pool.free(a).unwrap();
            assert!(free_blocks(&pool).contains(&(16, 0)));
            assert_eq!(pool.unit_count(), 1);
            check_invariants(&pool);

            pool.free(b).unwrap();
            assert_eq!(pool.unit_count(), 0);
            assert_eq!(pool.backing_store().destroyed, [a.region()]);
        }

        assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn full_coalescence_keeping_last_unit() {
        let mut pool = Pool::new(
            MockStore::default(),
            PoolCreateInfo {
                unit_retention: UnitRetention::KeepLast,
                ..create_info(256, 16)
            },
        );

        let a = pool.suballocate(16, 1).unwrap();
        let b = pool.suballocate(16, 1).unwrap();
        pool.free(a).unwrap();
        pool.free(b).unwrap();

        let unit = pool.units().next().unwrap();
        assert_eq!(
            unit.blocks(),
            [BlockNode {
                offset: 0,
                size: 256,
                state: BlockState::Free,
            }],
        );
        assert!(pool.backing_store().destroyed.is_empty());

        // Alternating between one allocation and none doesn't recreate the region.
        for _ in 0..10 {
            let alloc = pool.suballocate(100, 4).unwrap();
            pool.free(alloc).unwrap();
        }

        assert_eq!(pool.backing_store().created.len(), 1);

        pool.trim();
        assert_eq!(pool.unit_count(), 0);
        assert_eq!(pool.backing_store().live_count(), 0);
    }

    #[test]
    fn release_recreates_units() {
        let mut pool = Pool::new(MockStore::default(), create_info(256, 16));

        for _ in 0..3 {
            let alloc = pool.suballocate(100, 4).unwrap();
            pool.free(alloc).unwrap();
        }

        assert_eq!(pool.backing_store().created.len(), 3);
        assert_eq!(pool.backing_store().live_count(), 0);
    }

    #[test]
    fn growth() {
        let mut pool = Pool::new(MockStore::default(), create_info(256, 16));

        let a = pool.suballocate(100, 1).unwrap();
        assert_eq!(pool.backing_store().created.len(), 1);

        // Larger than any free block, and larger than the configured unit size.
        let b = pool.suballocate(1000, 1).unwrap();
        assert_ne!(a.region(), b.region());
        assert_eq!(b.offset(), 0);
        assert_eq!(
            pool.backing_store()
                .created
                .iter()
                .map(|&(_, size)| size)
                .collect::<Vec<_>>(),
            [256, 1024],
        );

        // The first unit still has room, and it is searched first.
        let c = pool.suballocate(16, 1).unwrap();
        assert_eq!(c.region(), a.region());
        assert_eq!(c.offset(), 128);
        assert_eq!(pool.unit_count(), 2);
        check_invariants(&pool);

        pool.free(a).unwrap();
        assert_eq!(pool.unit_count(), 2);
        pool.free(c).unwrap();
        assert_eq!(pool.unit_count(), 1);
        pool.free(b).unwrap();
        assert_eq!(pool.unit_count(), 0);
    }

    #[test]
    fn respects_alignment() {
        let mut pool = Pool::new(MockStore::default(), create_info(4096, 16));
        let mut allocs = Vec::new();

        for alignment in [1, 2, 3, 7, 16, 24, 96, 100, 255, 256, 1000] {
            for size in [1, 17, 64, 333] {
                let alloc = pool.suballocate(size, alignment).unwrap();
                assert_eq!(alloc.offset() % alignment, 0);
                allocs.push(alloc);
            }
        }

        check_invariants(&pool);
        check_disjoint(&allocs);

        for alloc in allocs {
            pool.free(alloc).unwrap();
        }

        assert_eq!(pool.unit_count(), 0);
    }

    #[test]
    fn host_pointers() {
        let mut store = MockStore::default();

        {
            let mut pool = Pool::new(
                &mut store,
                PoolCreateInfo {
                    memory_kind: MemoryKind::HostVisible,
                    ..create_info(1024, 32)
                },
            );

            let a = pool.suballocate(64, 1).unwrap();
            let b = pool.suballocate(4, 96).unwrap();
            let base = pool.units().next().unwrap().host_ptr().unwrap();

            for alloc in [a, b] {
                let ptr = alloc.host_ptr().unwrap();
                assert_eq!(
                    ptr.as_ptr() as usize - base.as_ptr() as usize,
                    alloc.offset() as usize,
                );
            }

            unsafe { b.host_ptr().unwrap().cast::<u8>().write_bytes(0xAB, 4) };
            let memory = pool.backing_store().memory(b.region()).unwrap();
            let offset = b.offset() as usize;
            assert_eq!(memory[offset..offset + 4], [0xAB; 4]);
            assert_eq!(memory[offset - 1], 0);

            pool.free(a).unwrap();
            pool.free(b).unwrap();
        }

        assert_eq!(store.unmapped.len(), 1);
        assert_eq!(store.unmapped, store.destroyed);
    }

    #[test]
    fn device_only_has_no_host_pointers() {
        let mut pool = Pool::new(MockStore::default(), create_info(1024, 32));

        let alloc = pool.suballocate(64, 1).unwrap();
        assert!(alloc.host_ptr().is_none());
        assert!(pool.units().all(|unit| unit.host_ptr().is_none()));

        pool.free(alloc).unwrap();
        assert!(pool.backing_store().unmapped.is_empty());
    }

    #[test]
    fn unmapped_host_visible_region() {
        let mut store = MockStore {
            skip_mapping: true,
            ..Default::default()
        };
        let mut pool = Pool::new(
            &mut store,
            PoolCreateInfo {
                memory_kind: MemoryKind::HostToDevice,
                ..create_info(1024, 32)
            },
        );

        assert_eq!(
            pool.suballocate(64, 1),
            Err(PoolError::AllocationExhausted(RegionError::MemoryMapFailed)),
        );
        assert_eq!(pool.unit_count(), 0);
        assert_eq!(pool.backing_store().live_count(), 0);
    }

    #[test]
    fn exhausted_store() {
        let store = MockStore {
            remaining_regions: Some(1),
            ..Default::default()
        };
        let mut pool = Pool::new(store, create_info(256, 16));

        let a = pool.suballocate(128, 1).unwrap();
        let b = pool.suballocate(128, 1).unwrap();

        let err = pool.suballocate(128, 1).unwrap_err();
        assert_eq!(
            err,
            PoolError::AllocationExhausted(RegionError::OutOfDeviceMemory),
        );
        assert!(err.source().is_some());
        check_invariants(&pool);

        // Freeing makes room again without needing a new region.
        pool.free(a).unwrap();
        let c = pool.suballocate(128, 1).unwrap();
        assert_eq!(c.offset(), 0);
        assert_eq!(pool.backing_store().created.len(), 1);

        pool.free(b).unwrap();
        pool.free(c).unwrap();
    }

    #[test]
    fn invalid_free() {
        let mut pool = Pool::new(MockStore::default(), create_info(256, 16));

        let a = pool.suballocate(16, 1).unwrap();
        let b = pool.suballocate(40, 8).unwrap();
        pool.free(a).unwrap();

        // Freed twice.
        assert_eq!(pool.free(a), Err(PoolError::InvalidFree));
        check_invariants(&pool);

        // Region that isn't part of the pool.
        let fabricated = Allocation {
            region: vk::Buffer::from_raw(0xDEAD),
            ..b
        };
        assert_eq!(pool.free(fabricated), Err(PoolError::InvalidFree));

        // Offset that was never handed out.
        let garbage = Allocation {
            offset: b.offset() + 8,
            ..b
        };
        assert_eq!(pool.free(garbage), Err(PoolError::InvalidFree));
        check_invariants(&pool);

        assert_eq!(pool.unit_count(), 1);
        pool.free(b).unwrap();
        assert_eq!(pool.unit_count(), 0);
        assert_eq!(pool.free(b), Err(PoolError::InvalidFree));
    }

    #[test]
    fn stale_allocation_in_reused_region() {
        let store = MockStore {
            reuse_handles: true,
            ..Default::default()
        };
        let mut pool = Pool::new(store, create_info(256, 16));

        let a = pool.suballocate(16, 1).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.unit_count(), 0);

        // The store hands out the same handle again, so only the unit tells the two apart.
        let b = pool.suballocate(16, 1).unwrap();
        assert_eq!(b.region(), a.region());
        assert_eq!(b.offset(), a.offset());
        assert_ne!(b.unit_id(), a.unit_id());

        assert_eq!(pool.free(a), Err(PoolError::InvalidFree));
        assert_eq!(pool.unit_count(), 1);
        assert_eq!(pool.allocated_size(), 16);
        check_invariants(&pool);

        pool.free(b).unwrap();
        assert_eq!(pool.unit_count(), 0);
        assert_eq!(pool.backing_store().live_count(), 0);
    }

    #[test]
    fn aligned_sub_block_avoids_growth() {
        let mut pool = Pool::new(MockStore::default(), create_info(32, 4));

        let a = pool.suballocate(16, 1).unwrap();
        let b = pool.suballocate(3, 5).unwrap();
        assert_eq!(b.region(), a.region());
        assert_eq!(b.offset(), 20);
        assert_eq!(pool.backing_store().created.len(), 1);
        check_invariants(&pool);

        pool.free(a).unwrap();
        pool.free(b).unwrap();
        assert_eq!(pool.unit_count(), 0);
    }

    #[test]
    fn alignment_overflow() {
        let mut pool = Pool::new(MockStore::default(), create_info(256, 16));

        assert_eq!(
            pool.suballocate(DeviceSize::MAX, 3),
            Err(PoolError::AlignmentOverflow),
        );
        assert_eq!(
            pool.suballocate(2, DeviceSize::MAX),
            Err(PoolError::AlignmentOverflow),
        );
        assert_eq!(pool.unit_count(), 0);
        assert!(pool.backing_store().created.is_empty());
    }

    #[test]
    fn region_barriers() {
        let mut pool = Pool::new(MockStore::default(), create_info(256, 16));
        assert!(pool
            .region_barriers(vk::AccessFlags::HOST_WRITE, vk::AccessFlags::TRANSFER_READ)
            .is_empty());

        let a = pool.suballocate(256, 1).unwrap();
        let b = pool.suballocate(512, 1).unwrap();

        let barriers =
            pool.region_barriers(vk::AccessFlags::HOST_WRITE, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(barriers.len(), 2);
        assert_eq!(barriers[0].region, a.region());
        assert_eq!(barriers[0].size, 256);
        assert_eq!(barriers[1].region, b.region());
        assert_eq!(barriers[1].size, 512);
        assert_eq!(barriers[1].to_vk().buffer, b.region());

        pool.free(a).unwrap();
        pool.free(b).unwrap();
    }

    #[test]
    fn drop_destroys_remaining_units() {
        let mut store = MockStore::default();

        {
            let mut pool = Pool::new(
                &mut store,
                PoolCreateInfo {
                    memory_kind: MemoryKind::HostVisible,
                    ..create_info(256, 16)
                },
            );
            pool.suballocate(16, 1).unwrap();
            pool.suballocate(1024, 1).unwrap();
        }

        assert_eq!(store.live_count(), 0);
        assert_eq!(store.destroyed.len(), 2);
        assert_eq!(store.unmapped.len(), 2);
    }

    #[test]
    fn randomized_order() {
        const THREADS: DeviceSize = 8;
        const ALLOCATIONS_PER_THREAD: DeviceSize = 50;
        const ALLOCATION_STEP: DeviceSize = 24;

        let mut store = MockStore::default();
        let pool = Mutex::new(Pool::new(&mut store, create_info(4096, 32)));
        let allocs = ArrayQueue::new((ALLOCATIONS_PER_THREAD * THREADS) as usize);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for i in 1..=THREADS {
                let (pool, allocs) = (&pool, &allocs);

                scope.spawn(move || {
                    for j in 0..ALLOCATIONS_PER_THREAD {
                        let alignment = 1 + (i * j) % 40;
                        let alloc = pool
                            .lock()
                            .suballocate(i * ALLOCATION_STEP, alignment)
                            .unwrap();
                        assert_eq!(alloc.offset() % alignment, 0);
                        allocs.push(alloc).unwrap();
                    }
                });
            }
        });

        let mut pool = pool.into_inner();
        let allocs: Vec<_> = iter::from_fn(|| allocs.pop()).collect();

        check_invariants(&pool);
        check_disjoint(&allocs);

        let requested: DeviceSize = allocs.iter().map(Allocation::size).sum();
        assert!(pool.allocated_size() >= requested);

        for alloc in allocs {
            pool.free(alloc).unwrap();
        }

        assert_eq!(pool.unit_count(), 0);
        assert_eq!(pool.free_size(), 0);
        drop(pool);

        assert_eq!(store.live_count(), 0);
    }

    proptest! {
        #[test]
        fn random_sequences_preserve_invariants(
            ops in prop::collection::vec(
                (1..600 as DeviceSize, 1..200 as DeviceSize, any::<bool>(), any::<prop::sample::Index>()),
                1..64,
            ),
        ) {
            let mut pool = Pool::new(MockStore::default(), create_info(1024, 16));
            let mut live = Vec::new();

            for (size, alignment, free, index) in ops {
                if free && !live.is_empty() {
                    let alloc = live.swap_remove(index.index(live.len()));
                    prop_assert!(pool.free(alloc).is_ok());
                } else {
                    let alloc = pool.suballocate(size, alignment).unwrap();
                    prop_assert_eq!(alloc.offset() % alignment, 0);
                    let unit = pool.units().find(|unit| unit.region() == alloc.region()).unwrap();
                    prop_assert!(alloc.offset() + size <= unit.size());
                    live.push(alloc);
                }

                check_invariants(&pool);
                check_disjoint(&live);
            }

            for alloc in live {
                prop_assert!(pool.free(alloc).is_ok());
            }

            prop_assert_eq!(pool.unit_count(), 0);
            prop_assert_eq!(pool.backing_store().live_count(), 0);
        }

        #[test]
        fn round_trip_restores_free_size(
            existing in prop::collection::vec(1..300 as DeviceSize, 0..8),
            size in 1..5000 as DeviceSize,
            alignment in 1..512 as DeviceSize,
        ) {
            let mut pool = Pool::new(MockStore::default(), create_info(1024, 32));

            for &size in &existing {
                pool.suballocate(size, 1).unwrap();
            }

            let free_size = pool.free_size();
            let unit_count = pool.unit_count();

            let alloc = pool.suballocate(size, alignment).unwrap();
            pool.free(alloc).unwrap();

            prop_assert_eq!(pool.free_size(), free_size);
            prop_assert_eq!(pool.unit_count(), unit_count);
            check_invariants(&pool);
        }
    }
}
