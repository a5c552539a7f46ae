// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scatter-gather table assembly and device mapping.

use crate::DmaMapper;
use crate::DmaSegment;
use crate::MapError;
use crate::PAGE_SIZE;
use crate::Segment;
use crate::pin::PinnedPages;
use std::sync::Arc;

/// A segment table mapped for a device. When dropped, the table is unmapped.
pub struct SegmentTable {
    segments: Vec<Segment>,
    mapped: Vec<DmaSegment>,
    mapper: Arc<dyn DmaMapper>,
}

impl std::fmt::Debug for SegmentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentTable")
            .field("segments", &self.segments.len())
            .field("mapped", &self.mapped.len())
            .finish()
    }
}

impl SegmentTable {
    /// The segments built from the pinned pages.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The segments as mapped for the device.
    pub fn mapped(&self) -> &[DmaSegment] {
        &self.mapped
    }

    /// Unmaps and frees the table, reporting platform failures.
    pub fn unmap(mut self) -> anyhow::Result<()> {
        self.unmap_inner()
    }

    fn unmap_inner(&mut self) -> anyhow::Result<()> {
        let mapped = std::mem::take(&mut self.mapped);
        self.segments = Vec::new();
        if mapped.is_empty() {
            return Ok(());
        }
        self.mapper.unmap_segments(&mapped)
    }
}

impl Drop for SegmentTable {
    fn drop(&mut self) {
        if let Err(err) = self.unmap_inner() {
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "failed to unmap segment table"
            );
        }
    }
}

/// A mapped segment table and the per-page device addresses derived from it.
#[derive(Debug)]
pub struct AssembledBuffer {
    /// The mapped table.
    pub table: SegmentTable,
    /// One device address per page of the buffer.
    pub physical_pages: Vec<u64>,
}

/// Builds a segment table for `pages`, maps it with `mapper`, and derives a
/// device address for every page.
///
/// On failure nothing allocated here stays mapped. The pages remain pinned;
/// unpinning them is up to the caller.
pub fn assemble(
    pages: &PinnedPages,
    byte_size: u64,
    mapper: &Arc<dyn DmaMapper>,
) -> Result<AssembledBuffer, MapError> {
    let page_count = pages.len();
    let segments = build_segments(pages.pfns(), page_count, byte_size)?;
    tracing::debug!(
        pages = page_count,
        segments = segments.len(),
        "built segment table"
    );

    let mapped = mapper.map_segments(&segments).map_err(|err| {
        tracing::error!(
            error = err.as_ref() as &dyn std::error::Error,
            "failed to map segment table"
        );
        MapError::Map(err)
    })?;
    tracing::debug!(
        segments = segments.len(),
        mapped = mapped.len(),
        "mapped segment table"
    );

    let table = SegmentTable {
        segments,
        mapped,
        mapper: mapper.clone(),
    };

    let physical_pages = expand_to_pages(&table.mapped, page_count)?;
    Ok(AssembledBuffer {
        table,
        physical_pages,
    })
}

/// Coalesces physically adjacent pages into segments. The last segment is
/// trimmed so the table covers exactly `byte_size` bytes.
fn build_segments(
    pfns: impl Iterator<Item = u64>,
    page_count: usize,
    byte_size: u64,
) -> Result<Vec<Segment>, MapError> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut next_pfn = None;
    for pfn in pfns {
        if next_pfn == Some(pfn) {
            if let Some(last) = segments.last_mut() {
                last.len += PAGE_SIZE;
            }
        } else {
            segments
                .try_reserve(1)
                .map_err(|_| MapError::OutOfMemory(page_count))?;
            segments.push(Segment {
                physical_address: pfn * PAGE_SIZE as u64,
                len: PAGE_SIZE,
            });
        }
        next_pfn = Some(pfn + 1);
    }

    let covered = (page_count * PAGE_SIZE) as u64;
    if let Some(last) = segments.last_mut() {
        if covered > byte_size {
            last.len -= (covered - byte_size) as usize;
        }
    }
    Ok(segments)
}

/// Walks each mapped segment in page-sized strides, producing one address
/// per page of the buffer regardless of how the pages were
/// coalesced.
///
/// The result always has `page_count` entries. If the walk produces a
/// different number, the mismatch is logged and the table is truncated or
/// padded with zeroes.
fn expand_to_pages(mapped: &[DmaSegment], page_count: usize) -> Result<Vec<u64>, MapError> {
    let mut addresses = Vec::new();
    addresses
        .try_reserve_exact(page_count)
        .map_err(|_| MapError::OutOfMemory(page_count))?;

    let mut emitted = 0;
    for segment in mapped {
        for offset in (0..segment.len).step_by(PAGE_SIZE) {
            if emitted < page_count {
                addresses.push(segment.dma_address + offset as u64);
            }
            emitted += 1;
        }
    }

    if emitted != page_count {
        tracing::error!(
            emitted,
            page_count,
            "mapped segments do not match buffer page count"
        );
        addresses.resize(page_count, 0);
    }
    Ok(addresses)
}

/// A mapper for devices that see physical memory directly, with no IOMMU.
/// Adjacent segments are merged.
#[derive(Debug, Default)]
pub struct IdentityDmaMapper;

impl DmaMapper for IdentityDmaMapper {
    fn map_segments(&self, segments: &[Segment]) -> anyhow::Result<Vec<DmaSegment>> {
        Ok(merge_adjacent(segments.iter().map(|segment| DmaSegment {
            dma_address: segment.physical_address,
            len: segment.len,
        })))
    }

    fn unmap_segments(&self, _mapped: &[DmaSegment]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Merges runs that end exactly where the next one begins.
pub(crate) fn merge_adjacent(segments: impl Iterator<Item = DmaSegment>) -> Vec<DmaSegment> {
    let mut merged: Vec<DmaSegment> = Vec::new();
    for segment in segments {
        match merged.last_mut() {
            Some(last) if last.dma_address + last.len as u64 == segment.dma_address => {
                last.len += segment.len;
            }
            _ => merged.push(segment),
        }
    }
    merged
}
