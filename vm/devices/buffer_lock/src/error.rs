// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::BufferId;
use crate::ChannelId;
use thiserror::Error;

/// A rejected request parameter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidArgument {
    /// The buffer address is null.
    #[error("buffer address is null")]
    NullAddress,
    /// The buffer is empty.
    #[error("buffer size is zero")]
    ZeroSize,
    /// The buffer exceeds the configured maximum.
    #[error("buffer size {size} exceeds the maximum {max}")]
    TooLarge {
        /// The requested size, in bytes.
        size: u64,
        /// The maximum size, in bytes.
        max: u64,
    },
    /// The declared page count does not match the buffer size.
    #[error("page count {declared} does not match buffer size, expected {expected}")]
    PageCountMismatch {
        /// The page count the client declared.
        declared: u64,
        /// The page count implied by the size.
        expected: u64,
    },
    /// The buffer extends past the end of the address space.
    #[error("buffer at {address:#x} of {size} bytes wraps the address space")]
    AddressOverflow {
        /// The buffer address.
        address: u64,
        /// The buffer size, in bytes.
        size: u64,
    },
}

/// Failure to pin a client buffer. No pages remain pinned when this is
/// returned.
#[derive(Debug, Error)]
pub enum PinError {
    /// The page handle array could not be allocated.
    #[error("failed to allocate page array for {0} pages")]
    OutOfMemory(usize),
    /// A pin batch failed.
    #[error("pinning failed after {pinned} of {expected} pages")]
    Failed {
        /// Pages pinned before the failure.
        pinned: usize,
        /// Pages in the buffer.
        expected: usize,
        /// The platform error.
        #[source]
        source: anyhow::Error,
    },
    /// The mapping ended before the whole buffer was pinned.
    #[error("only {pinned} of {expected} pages could be pinned")]
    Incomplete {
        /// Pages pinned before the mapping ended.
        pinned: usize,
        /// Pages in the buffer.
        expected: usize,
    },
}

/// Failure to build or map a scatter-gather table.
#[derive(Debug, Error)]
pub enum MapError {
    /// The segment table could not be allocated.
    #[error("failed to allocate segment table for {0} pages")]
    OutOfMemory(usize),
    /// The device mapping failed.
    #[error("failed to map segment table for device")]
    Map(#[source] anyhow::Error),
}

/// Failure to allocate a contiguous buffer.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The coherent allocation failed.
    #[error("unable to allocate {size} bytes of coherent memory")]
    OutOfMemory {
        /// The requested size, in bytes.
        size: u64,
        /// The platform error.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors returned to clients of the driver.
#[derive(Debug, Error)]
pub enum BufferLockError {
    /// A request parameter was rejected.
    #[error("invalid argument")]
    InvalidArgument(#[from] InvalidArgument),
    /// Memory for bookkeeping, segment tables, or a coherent buffer could not
    /// be allocated.
    #[error("out of memory")]
    OutOfMemory(#[source] anyhow::Error),
    /// The buffer could not be pinned in full.
    #[error("failed to pin buffer")]
    PinFailure(#[source] PinError),
    /// The segment table could not be mapped for the device.
    #[error("failed to map buffer for device")]
    MapFailure(#[source] anyhow::Error),
    /// No buffer with this ID is registered.
    #[error("buffer {0} not found")]
    NotFound(BufferId),
    /// The request arrived on a channel with no attached device.
    #[error("no device bound to channel {0}")]
    DeviceLookupFailure(ChannelId),
    /// Too many devices with the same device ID are attached.
    #[error("device limit of {limit} reached for device id {device_id:#x}")]
    DeviceLimit {
        /// The PCI device ID.
        device_id: u16,
        /// The configured limit.
        limit: usize,
    },
}

impl From<PinError> for BufferLockError {
    fn from(err: PinError) -> Self {
        match err {
            PinError::OutOfMemory(_) => Self::OutOfMemory(err.into()),
            err => Self::PinFailure(err),
        }
    }
}

impl From<MapError> for BufferLockError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory(_) => Self::OutOfMemory(err.into()),
            MapError::Map(err) => Self::MapFailure(err),
        }
    }
}

impl From<AllocError> for BufferLockError {
    fn from(err: AllocError) -> Self {
        Self::OutOfMemory(err.into())
    }
}

impl BufferLockError {
    /// The (positive) errno value reported to clients for this error.
    pub fn errno(&self) -> i32 {
        match self {
            BufferLockError::InvalidArgument(_) => libc::EINVAL,
            BufferLockError::OutOfMemory(_) => libc::ENOMEM,
            BufferLockError::PinFailure(_) | BufferLockError::MapFailure(_) => libc::EFAULT,
            BufferLockError::NotFound(_) | BufferLockError::DeviceLookupFailure(_) => {
                libc::ENODATA
            }
            BufferLockError::DeviceLimit { .. } => libc::EBUSY,
        }
    }
}
