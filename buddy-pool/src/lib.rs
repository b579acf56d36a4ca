//! Buddy-system suballocation of large, growable GPU memory regions.
//!
//! Creating a Vulkan buffer or `DeviceMemory` object for every small resource is slow and quickly
//! runs into the implementation's allocation count limit. Instead, a renderer allocates a few big
//! *backing regions* and hands out aligned pieces of them. This crate implements that
//! bookkeeping.
//!
//! # Overview
//!
//! - A [`BackingStore`] is implemented by the engine. It creates and destroys backing regions of
//!   a given size and [`MemoryKind`], optionally returning a host pointer for mappable kinds.
//!
//! - A [`BufferUnit`] manages one such region. It keeps a free-list of power-of-two sized
//!   *blocks* and a ledger of the blocks that are currently handed out.
//!
//! - A [`Pool`] owns any number of units for one usage and memory kind. It creates a new unit
//!   whenever none of the existing ones can satisfy a request, and destroys a unit as soon as its
//!   last allocation is freed.
//!
//! # Example
//!
//! ```ignore
//! use buddy_pool::{MemoryKind, Pool, PoolCreateInfo};
//!
//! let mut pool = Pool::new(
//!     my_store,
//!     PoolCreateInfo {
//!         usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
//!         memory_kind: MemoryKind::HostVisible,
//!         initial_unit_size: 1 << 20,
//!         ..Default::default()
//!     },
//! );
//!
//! let alloc = pool.suballocate(192, 256)?;
//! assert_eq!(alloc.offset() % 256, 0);
//! pool.free(alloc)?;
//! ```
//!
//! # Thread safety
//!
//! A `Pool` does no locking of its own. Calls to [`Pool::suballocate`] and [`Pool::free`] must be
//! serialized by the caller, for example by wrapping the pool in a mutex.

pub use self::{
    backing::{BackingRegion, BackingStore, MemoryKind, RegionError},
    barrier::RegionBarrier,
    pool::{Allocation, Pool, PoolCreateInfo, PoolError, UnitRetention},
    unit::{BlockNode, BlockState, BufferUnit},
};

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

pub mod backing;
pub mod barrier;
pub mod layout;
pub mod pool;
pub mod unit;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());
