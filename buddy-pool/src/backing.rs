//! The interface to whatever creates the backing regions that a [`Pool`] suballocates.
//!
//! The pool never talks to Vulkan itself. Instead the engine implements [`BackingStore`], which
//! typically creates a `VkBuffer`, allocates and binds `VkDeviceMemory` for it and, for mappable
//! memory kinds, maps the whole range for the lifetime of the region.
//!
//! [`Pool`]: crate::Pool

use crate::DeviceSize;
use ash::vk;
use std::{
    error::Error,
    ffi::c_void,
    fmt::{self, Debug, Display},
    hash::Hash,
    ptr::NonNull,
};

/// Creates and destroys the backing regions of a [`Pool`].
///
/// # Safety
///
/// - A region returned by `create_region` must be at least `size` bytes large.
/// - If `create_region` returns a host pointer, it must point to a mapping of the whole region
///   that stays valid until `unmap_region` or `destroy_region` is called for that region. The
///   mapping, like any host allocation, can't be larger than `isize::MAX` bytes.
/// - Region handles returned by `create_region` must be unique among the regions that have not
///   been destroyed yet.
///
/// [`Pool`]: crate::Pool
pub unsafe trait BackingStore {
    /// The handle identifying a backing region, for example a `vk::Buffer`.
    type Region: Copy + Eq + Hash + Debug;

    /// Creates a new backing region of `size` bytes.
    ///
    /// For memory kinds that are [host-visible], the returned region should carry a host pointer
    /// to the mapped region.
    ///
    /// [host-visible]: MemoryKind::is_host_visible
    fn create_region(
        &mut self,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_kind: MemoryKind,
    ) -> Result<BackingRegion<Self::Region>, RegionError>;

    /// Releases the host mapping of `region`.
    ///
    /// This is called right before `destroy_region` for regions that were returned with a host
    /// pointer. The default implementation does nothing, for stores that unmap on destruction.
    #[inline]
    fn unmap_region(&mut self, region: Self::Region) {
        let _ = region;
    }

    /// Destroys `region`, releasing its memory.
    fn destroy_region(&mut self, region: Self::Region);
}

unsafe impl<B> BackingStore for &mut B
where
    B: BackingStore + ?Sized,
{
    type Region = B::Region;

    #[inline]
    fn create_region(
        &mut self,
        size: DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_kind: MemoryKind,
    ) -> Result<BackingRegion<Self::Region>, RegionError> {
        (**self).create_region(size, usage, memory_kind)
    }

    #[inline]
    fn unmap_region(&mut self, region: Self::Region) {
        (**self).unmap_region(region)
    }

    #[inline]
    fn destroy_region(&mut self, region: Self::Region) {
        (**self).destroy_region(region)
    }
}

/// A region returned by [`BackingStore::create_region`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackingRegion<R> {
    /// The handle of the region.
    pub region: R,

    /// The start of the host mapping of the region, if it is mapped.
    pub host_ptr: Option<NonNull<c_void>>,
}

impl<R> BackingRegion<R> {
    /// Creates a `BackingRegion` that is not mapped.
    #[inline]
    pub const fn unmapped(region: R) -> Self {
        BackingRegion {
            region,
            host_ptr: None,
        }
    }

    /// Creates a `BackingRegion` that is mapped at `host_ptr`.
    #[inline]
    pub const fn mapped(region: R, host_ptr: NonNull<c_void>) -> Self {
        BackingRegion {
            region,
            host_ptr: Some(host_ptr),
        }
    }
}

/// Describes where the memory of a [`Pool`] lives and who can access it.
///
/// [`Pool`]: crate::Pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Memory that is only accessed by the device. Resources like render targets, static vertex
    /// data and textures go here.
    #[default]
    DeviceOnly,

    /// Memory that the host can map and that is coherent with it. Typically used for staging
    /// buffers and readback.
    HostVisible,

    /// Memory that the host writes and the device reads, preferably device-local. Typically used
    /// for data that is updated every frame, such as uniform buffers.
    HostToDevice,
}

impl MemoryKind {
    /// Returns whether regions of this kind are mapped into the host address space.
    #[inline]
    pub const fn is_host_visible(self) -> bool {
        matches!(self, MemoryKind::HostVisible | MemoryKind::HostToDevice)
    }

    /// Returns the memory property flags a memory type should have to back this kind.
    #[inline]
    pub fn property_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryKind::DeviceOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryKind::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryKind::HostToDevice => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
            }
        }
    }
}

/// Error that can be returned by [`BackingStore::create_region`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionError {
    /// There is not enough memory on the host.
    OutOfHostMemory,

    /// There is not enough memory on the device.
    OutOfDeviceMemory,

    /// Too many `DeviceMemory` allocations exist already.
    TooManyObjects,

    /// The region was created but mapping it failed.
    MemoryMapFailed,

    /// Any other error reported by the Vulkan implementation.
    Vulkan(vk::Result),
}

impl From<vk::Result> for RegionError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => RegionError::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => RegionError::OutOfDeviceMemory,
            vk::Result::ERROR_TOO_MANY_OBJECTS => RegionError::TooManyObjects,
            vk::Result::ERROR_MEMORY_MAP_FAILED => RegionError::MemoryMapFailed,
            result => RegionError::Vulkan(result),
        }
    }
}

impl Error for RegionError {}

impl Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfHostMemory => f.write_str("out of host memory"),
            Self::OutOfDeviceMemory => f.write_str("out of device memory"),
            Self::TooManyObjects => {
                f.write_str("too many `DeviceMemory` allocations exist already")
            }
            Self::MemoryMapFailed => f.write_str("failed to map memory"),
            Self::Vulkan(result) => write!(f, "region creation failed: {}", result),
        }
    }
}
