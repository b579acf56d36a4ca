//! Memory dependencies covering whole backing regions.

use crate::DeviceSize;
use ash::vk::{self, Handle};

/// A memory dependency on one backing region of a [`Pool`], as returned by
/// [`Pool::region_barriers`].
///
/// Bulk transfers, such as streaming a level's worth of vertex data through a staging pool, touch
/// many allocations at once. Rather than declaring a barrier per allocation, the engine declares
/// one per backing region before and after the transfer.
///
/// [`Pool`]: crate::Pool
/// [`Pool::region_barriers`]: crate::Pool::region_barriers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionBarrier<R> {
    /// The backing region the dependency applies to.
    pub region: R,

    /// The size of the backing region.
    pub size: DeviceSize,

    /// The memory accesses that must complete before the barrier.
    pub src_access: vk::AccessFlags,

    /// The memory accesses that must wait for the barrier.
    pub dst_access: vk::AccessFlags,
}

impl<R: Handle + Copy> RegionBarrier<R> {
    /// Returns a buffer memory barrier covering the whole region, without a queue family
    /// ownership transfer.
    pub fn to_vk(&self) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(vk::Buffer::from_raw(self.region.as_raw()))
            .offset(0)
            .size(self.size)
    }
}
