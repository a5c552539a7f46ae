// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two kinds of locked buffer.

use crate::BufferId;
use crate::ProcessId;
use crate::contiguous::ContiguousHandle;
use crate::device::DeviceContext;
use crate::pin::PinnedPages;
use crate::sg::SegmentTable;
use std::fmt;
use std::sync::Arc;

/// The kind of a locked buffer. Each kind has its own registry and ID space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferKind {
    /// Client memory pinned and mapped through a scatter-gather table.
    ScatterGather,
    /// Coherent memory allocated by the driver.
    Contiguous,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            BufferKind::ScatterGather => "sg",
            BufferKind::Contiguous => "contiguous",
        })
    }
}

/// Who a buffer belongs to. Fixed at creation.
#[derive(Clone)]
pub struct BufferOwner {
    /// The process that locked the buffer.
    pub pid: ProcessId,
    /// The device the buffer was locked for.
    pub device: Arc<DeviceContext>,
}

impl fmt::Debug for BufferOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferOwner")
            .field("pid", &self.pid)
            .field("device", &self.device.name())
            .finish()
    }
}

/// Behavior shared by both buffer kinds, used by the registry and sweeps.
pub trait LockedBuffer: Send {
    /// The kind of buffer.
    const KIND: BufferKind;

    /// The buffer's owner.
    fn owner(&self) -> &BufferOwner;

    /// Releases every resource held by the buffer.
    fn release(self, id: BufferId) -> anyhow::Result<()>;
}

/// A pinned client buffer mapped for a device.
#[derive(Debug)]
pub struct SgBuffer {
    owner: BufferOwner,
    user_address: u64,
    byte_size: u64,
    // Field order matters for the drop fallback: the table is unmapped
    // before the pages are unpinned.
    table: SegmentTable,
    pages: PinnedPages,
    physical_pages: Vec<u64>,
}

impl SgBuffer {
    pub(crate) fn new(
        owner: BufferOwner,
        user_address: u64,
        byte_size: u64,
        pages: PinnedPages,
        table: SegmentTable,
        physical_pages: Vec<u64>,
    ) -> Self {
        Self {
            owner,
            user_address,
            byte_size,
            table,
            pages,
            physical_pages,
        }
    }

    /// The client address of the buffer.
    pub fn user_address(&self) -> u64 {
        self.user_address
    }

    /// The size of the buffer, in bytes.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// The number of pages in the buffer.
    pub fn page_count(&self) -> usize {
        self.physical_pages.len()
    }

    /// The number of pinned pages backing the buffer.
    pub fn pinned_page_count(&self) -> usize {
        self.pages.len()
    }

    /// The mapped segment table.
    pub fn segment_table(&self) -> &SegmentTable {
        &self.table
    }

    /// One device address per page, as reported to the client.
    pub fn physical_pages(&self) -> &[u64] {
        &self.physical_pages
    }
}

impl LockedBuffer for SgBuffer {
    const KIND: BufferKind = BufferKind::ScatterGather;

    fn owner(&self) -> &BufferOwner {
        &self.owner
    }

    fn release(self, id: BufferId) -> anyhow::Result<()> {
        let Self {
            owner,
            user_address,
            byte_size,
            table,
            pages,
            physical_pages: _,
        } = self;

        tracing::info!(
            %id,
            user_address,
            byte_size,
            pid = %owner.pid,
            device = owner.device.name(),
            "releasing sg buffer"
        );

        // Unmap before unpinning, and unpin even if unmapping fails.
        let unmapped = table.unmap();
        let unpinned = pages.unpin();
        unmapped?;
        unpinned
    }
}

/// A coherent buffer allocated for a client.
#[derive(Debug)]
pub struct ContiguousBuffer {
    owner: BufferOwner,
    handle: ContiguousHandle,
}

impl ContiguousBuffer {
    pub(crate) fn new(owner: BufferOwner, handle: ContiguousHandle) -> Self {
        Self { owner, handle }
    }

    /// The coherent block.
    pub fn handle(&self) -> &ContiguousHandle {
        &self.handle
    }
}

impl LockedBuffer for ContiguousBuffer {
    const KIND: BufferKind = BufferKind::Contiguous;

    fn owner(&self) -> &BufferOwner {
        &self.owner
    }

    fn release(self, id: BufferId) -> anyhow::Result<()> {
        tracing::info!(
            %id,
            byte_size = self.handle.byte_size(),
            pid = %self.owner.pid,
            device = self.owner.device.name(),
            "releasing contiguous buffer"
        );
        self.handle.free()
    }
}
