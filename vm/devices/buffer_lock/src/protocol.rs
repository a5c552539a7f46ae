// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed requests and responses carried by a client's control channel.
//!
//! The transport is not defined here; a transport decodes its messages into
//! [`Request`] and hands them to
//! [`ClientChannel::dispatch`](crate::driver::ClientChannel::dispatch).

use crate::BufferId;
use crate::BufferLockError;
use crate::device::CleanupCommand;

/// Parameters of a scatter-gather lock request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LockSgBufferRequest {
    /// The client address of the buffer.
    pub user_address: u64,
    /// The size of the buffer, in bytes.
    pub byte_size: u64,
    /// The number of pages the client expects the buffer to span.
    pub page_count: u64,
}

impl LockSgBufferRequest {
    /// Returns a request whose page count is derived from `byte_size`.
    pub fn new(user_address: u64, byte_size: u64) -> Self {
        Self {
            user_address,
            byte_size,
            page_count: byte_size.div_ceil(crate::PAGE_SIZE64),
        }
    }
}

/// The result of a successful scatter-gather lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgBufferInfo {
    /// The buffer ID.
    pub id: BufferId,
    /// The number of pages in the buffer.
    pub page_count: u64,
    /// One device address per page.
    pub physical_pages: Vec<u64>,
}

/// The result of a successful contiguous lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ContiguousBufferInfo {
    /// The buffer ID.
    pub id: BufferId,
    /// The driver-visible address of the block.
    pub kernel_address: u64,
    /// The address the device uses for the block.
    pub device_address: u64,
    /// The size of the block, in bytes.
    pub byte_size: u64,
}

/// A control-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Pin and map a client buffer.
    LockSgBuffer(LockSgBufferRequest),
    /// Release a scatter-gather buffer.
    UnlockSgBuffer(BufferId),
    /// Allocate a coherent buffer.
    LockContiguousBuffer {
        /// The size of the buffer, in bytes.
        byte_size: u64,
    },
    /// Release a coherent buffer.
    UnlockContiguousBuffer(BufferId),
    /// Map a coherent buffer into the client.
    MapContiguousBuffer(BufferId),
    /// Replace the device's cleanup commands.
    ConfigureCleanupCommands(Vec<CleanupCommand>),
}

/// The response to a successful [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Response to [`Request::LockSgBuffer`].
    SgBufferLocked(SgBufferInfo),
    /// Response to [`Request::UnlockSgBuffer`], acknowledging the ID.
    SgBufferUnlocked(BufferId),
    /// Response to [`Request::LockContiguousBuffer`].
    ContiguousBufferLocked(ContiguousBufferInfo),
    /// Response to [`Request::UnlockContiguousBuffer`], acknowledging the ID.
    ContiguousBufferUnlocked(BufferId),
    /// Response to [`Request::MapContiguousBuffer`], with the client address.
    ContiguousBufferMapped(u64),
    /// Response to [`Request::ConfigureCleanupCommands`], with the commands
    /// actually stored.
    CleanupCommandsConfigured(Vec<CleanupCommand>),
}

/// Converts a dispatch result into the status code a transport returns to
/// its caller: zero on success, a negative errno on failure.
pub fn status_code(result: &Result<Response, BufferLockError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => -err.errno(),
    }
}
