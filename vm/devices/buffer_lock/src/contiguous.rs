// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-coherent contiguous buffers.

use crate::AllocError;
use crate::CoherentAllocator;
use std::sync::Arc;

/// A coherent block owned by the driver. When dropped, the block is freed.
pub struct ContiguousHandle {
    kernel_address: u64,
    device_address: u64,
    byte_size: usize,
    allocator: Arc<dyn CoherentAllocator>,
    freed: bool,
}

impl std::fmt::Debug for ContiguousHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContiguousHandle")
            .field("kernel_address", &format_args!("{:#x}", self.kernel_address))
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

impl ContiguousHandle {
    /// The driver-visible address of the block.
    pub fn kernel_address(&self) -> u64 {
        self.kernel_address
    }

    /// The address the device uses for the block.
    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    /// The size of the block, in bytes.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Maps the block into the client's address space.
    pub fn map_into_client(&self) -> anyhow::Result<u64> {
        self.allocator
            .map_into_client(self.kernel_address, self.device_address, self.byte_size)
    }

    /// Frees the block, reporting platform failures.
    pub fn free(mut self) -> anyhow::Result<()> {
        self.free_inner()
    }

    fn free_inner(&mut self) -> anyhow::Result<()> {
        if std::mem::replace(&mut self.freed, true) {
            return Ok(());
        }
        self.allocator
            .free_coherent(self.kernel_address, self.byte_size, self.device_address)
    }
}

impl Drop for ContiguousHandle {
    fn drop(&mut self) {
        if let Err(err) = self.free_inner() {
            tracing::error!(
                kernel_address = self.kernel_address,
                byte_size = self.byte_size,
                error = err.as_ref() as &dyn std::error::Error,
                "failed to free coherent block"
            );
        }
    }
}

/// Allocates a coherent block of exactly `byte_size` bytes.
pub fn allocate(
    allocator: &Arc<dyn CoherentAllocator>,
    byte_size: u64,
) -> Result<ContiguousHandle, AllocError> {
    let size = byte_size
        .try_into()
        .map_err(|_| AllocError::OutOfMemory {
            size: byte_size,
            source: anyhow::anyhow!("size does not fit in the address space"),
        })?;

    let block = allocator
        .alloc_coherent(size)
        .map_err(|source| AllocError::OutOfMemory {
            size: byte_size,
            source,
        })?;

    tracing::debug!(
        byte_size,
        kernel_address = block.kernel_address,
        device_address = block.device_address,
        "allocated coherent block"
    );

    Ok(ContiguousHandle {
        kernel_address: block.kernel_address,
        device_address: block.device_address,
        byte_size: size,
        allocator: allocator.clone(),
        freed: false,
    })
}
