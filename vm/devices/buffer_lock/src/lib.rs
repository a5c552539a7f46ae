// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lending client memory to PCI devices for DMA.
//!
//! A client process asks the driver to lock a range of its own virtual memory
//! (a scatter-gather buffer) or to allocate a device-coherent contiguous
//! buffer. The driver keeps every locked buffer in a registry keyed by a
//! unique ID until the client unlocks it, the client disconnects, or the
//! driver shuts down. On disconnect, a list of per-device register writes
//! (cleanup commands) is applied so that the device stops DMA into memory the
//! client no longer owns.
//!
//! Platform specifics (pinning, IOMMU mapping, coherent allocation, register
//! access) sit behind the traits in this module. The [`emulated`] module
//! provides an in-process implementation of each, and [`linux`] provides a
//! user-mode Linux backend.

pub mod buffer;
pub mod config;
pub mod contiguous;
pub mod device;
pub mod driver;
pub mod emulated;
mod error;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod pin;
pub mod protocol;
pub mod registry;
pub mod sg;

pub use error::AllocError;
pub use error::BufferLockError;
pub use error::InvalidArgument;
pub use error::MapError;
pub use error::PinError;

use std::fmt;
use std::sync::Arc;

/// The size of a page, in bytes.
pub const PAGE_SIZE: usize = 4096;
/// [`PAGE_SIZE`] as a `u64`.
pub const PAGE_SIZE64: u64 = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// The ID of a locked buffer, unique within its buffer kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The ID of a client process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies the control channel a request arrived on. Each attached
/// device gets its own channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A pinned page, as handed out by a [`PagePinner`].
///
/// Not `Clone`: a page handle is returned to the pinner exactly once, via
/// [`PagePinner::unpin_pages`].
#[derive(Debug, PartialEq, Eq)]
pub struct PageHandle {
    pfn: u64,
    token: u64,
}

impl PageHandle {
    /// Creates a handle for page frame `pfn`. `token` is opaque to everyone
    /// but the pinner that created the handle.
    pub fn new(pfn: u64, token: u64) -> Self {
        Self { pfn, token }
    }

    /// The page frame number.
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    /// The pinner-private token.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// The physical address of the start of the page.
    pub fn physical_address(&self) -> u64 {
        self.pfn << PAGE_SHIFT
    }
}

/// Pins pages of a client's address space.
pub trait PagePinner: Send + Sync {
    /// Pins up to `count` pages starting with the page containing `start`.
    ///
    /// May pin fewer pages than requested. Returning an empty vector means
    /// the end of the mapping was reached; this is not an error by itself.
    fn pin_pages(&self, start: u64, count: usize) -> anyhow::Result<Vec<PageHandle>>;

    /// Unpins pages previously returned by [`Self::pin_pages`].
    fn unpin_pages(&self, pages: Vec<PageHandle>) -> anyhow::Result<()>;
}

/// A physically contiguous run of memory in a scatter-gather table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Segment {
    /// The physical address of the run.
    pub physical_address: u64,
    /// The length of the run, in bytes.
    pub len: usize,
}

/// A run of memory as seen by the device after mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaSegment {
    /// The address the device uses to access the run.
    pub dma_address: u64,
    /// The length of the run, in bytes.
    pub len: usize,
}

/// Maps scatter-gather tables for device access, e.g. by programming an
/// IOMMU.
pub trait DmaMapper: Send + Sync {
    /// Maps `segments` for bidirectional DMA.
    ///
    /// The mapper may merge adjacent segments, so the result can be shorter
    /// than the input.
    fn map_segments(&self, segments: &[Segment]) -> anyhow::Result<Vec<DmaSegment>>;

    /// Unmaps segments previously returned by [`Self::map_segments`].
    fn unmap_segments(&self, mapped: &[DmaSegment]) -> anyhow::Result<()>;
}

/// A device-coherent block returned by [`CoherentAllocator::alloc_coherent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CoherentBlock {
    /// The driver-visible address of the block.
    pub kernel_address: u64,
    /// The address the device uses to access the block.
    pub device_address: u64,
}

/// Allocates device-coherent, physically contiguous memory.
pub trait CoherentAllocator: Send + Sync {
    /// Allocates exactly `byte_size` bytes.
    fn alloc_coherent(&self, byte_size: usize) -> anyhow::Result<CoherentBlock>;

    /// Frees a block. All three values must match those recorded at
    /// allocation time.
    fn free_coherent(
        &self,
        kernel_address: u64,
        byte_size: usize,
        device_address: u64,
    ) -> anyhow::Result<()>;

    /// Maps a live block into the calling client's address space, returning
    /// the client address.
    fn map_into_client(
        &self,
        kernel_address: u64,
        device_address: u64,
        byte_size: usize,
    ) -> anyhow::Result<u64>;
}

/// Access to device registers.
pub trait DeviceRegisterIo: Send + Sync {
    /// Returns the length of the register space.
    fn len(&self) -> usize;
    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Reads a `u64` register.
    fn read_u64(&self, offset: usize) -> u64;
    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);
    /// Writes a `u64` register.
    fn write_u64(&self, offset: usize, data: u64);
}

/// An interface to the hardware behind one attached device.
pub trait DeviceBacking: 'static + Send + Sync {
    /// Returns a device ID for diagnostics.
    fn id(&self) -> &str;

    /// The mapper used to make scatter-gather buffers visible to the device.
    fn dma_mapper(&self) -> Arc<dyn DmaMapper>;

    /// The allocator for contiguous buffers.
    fn coherent_allocator(&self) -> Arc<dyn CoherentAllocator>;

    /// Maps the device's control registers (BAR0). The mapping is torn down
    /// when the returned object is dropped.
    fn map_control_registers(&self) -> anyhow::Result<Box<dyn DeviceRegisterIo>>;
}

#[cfg(test)]
pub(crate) mod test_helpers {
    /// Routes `tracing` output to the test harness.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    }
}
