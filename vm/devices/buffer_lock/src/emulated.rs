// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process implementation of the platform traits, for tests and for
//! hosts without DMA hardware.
//!
//! Each piece tracks what it has handed out so that tests can check that
//! everything is given back, and most can be told to fail on demand.

use crate::CoherentAllocator;
use crate::CoherentBlock;
use crate::DeviceBacking;
use crate::DeviceRegisterIo;
use crate::DmaMapper;
use crate::DmaSegment;
use crate::PAGE_SHIFT;
use crate::PAGE_SIZE64;
use crate::PageHandle;
use crate::PagePinner;
use crate::Segment;
use crate::sg::merge_adjacent;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// How the pages of an emulated region map to page frames.
#[derive(Debug, Copy, Clone)]
pub enum FrameLayout {
    /// Page `i` is frame `base_pfn + i`.
    Contiguous {
        /// The frame of the first page.
        base_pfn: u64,
    },
    /// Page `i` is frame `base_pfn + i * stride`.
    Scattered {
        /// The frame of the first page.
        base_pfn: u64,
        /// The distance between the frames of adjacent pages.
        stride: u64,
    },
}

impl FrameLayout {
    fn pfn(&self, index: u64) -> u64 {
        match *self {
            FrameLayout::Contiguous { base_pfn } => base_pfn + index,
            FrameLayout::Scattered { base_pfn, stride } => base_pfn + index * stride,
        }
    }
}

#[derive(Debug)]
struct Region {
    start: u64,
    len: u64,
    layout: FrameLayout,
}

#[derive(Debug, Default)]
struct AddressSpaceState {
    regions: Vec<Region>,
    pin_calls: Vec<(u64, usize)>,
    pin_counts: HashMap<u64, usize>,
    outstanding: HashMap<u64, u64>,
    next_token: u64,
    batch_limit: Option<usize>,
    fail_batch: Option<usize>,
    fail_next_unpin: bool,
}

impl AddressSpaceState {
    fn pfn_at(&self, address: u64) -> Option<u64> {
        self.regions
            .iter()
            .find(|region| {
                address
                    .checked_sub(region.start)
                    .is_some_and(|offset| offset < region.len)
            })
            .map(|region| region.layout.pfn((address - region.start) >> PAGE_SHIFT))
    }
}

/// An emulated client address space.
#[derive(Debug, Default)]
pub struct EmulatedAddressSpace {
    state: Mutex<AddressSpaceState>,
}

impl EmulatedAddressSpace {
    /// Creates an address space with nothing mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `[start, start + len)`, both rounded to pages, with frames laid
    /// out per `layout`.
    pub fn map_region(&self, start: u64, len: u64, layout: FrameLayout) {
        let start = start & !(PAGE_SIZE64 - 1);
        self.state.lock().regions.push(Region {
            start,
            len: len.next_multiple_of(PAGE_SIZE64),
            layout,
        });
    }

    /// Caps every pin call at `pages` pages.
    pub fn limit_batch_pages(&self, pages: usize) {
        self.state.lock().batch_limit = Some(pages);
    }

    /// Fails the pin call with zero-based index `index`.
    pub fn fail_batch(&self, index: usize) {
        self.state.lock().fail_batch = Some(index);
    }

    /// Fails the next unpin call. The pages stay pinned.
    pub fn fail_next_unpin(&self) {
        self.state.lock().fail_next_unpin = true;
    }

    /// The `(start, count)` of every pin call so far.
    pub fn pin_calls(&self) -> Vec<(u64, usize)> {
        self.state.lock().pin_calls.clone()
    }

    /// The number of page pins outstanding.
    pub fn pinned_page_count(&self) -> usize {
        self.state.lock().pin_counts.values().sum()
    }

    /// The number of outstanding pins of frame `pfn`.
    pub fn pin_count(&self, pfn: u64) -> usize {
        self.state
            .lock()
            .pin_counts
            .get(&pfn)
            .copied()
            .unwrap_or(0)
    }
}

impl PagePinner for EmulatedAddressSpace {
    fn pin_pages(&self, start: u64, count: usize) -> anyhow::Result<Vec<PageHandle>> {
        let mut state = self.state.lock();
        let call = state.pin_calls.len();
        state.pin_calls.push((start, count));
        if state.fail_batch == Some(call) {
            anyhow::bail!("injected failure on pin call {call}");
        }

        let count = state.batch_limit.map_or(count, |limit| count.min(limit));
        let first = start & !(PAGE_SIZE64 - 1);
        let mut pages = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let Some(pfn) = state.pfn_at(first + i * PAGE_SIZE64) else {
                break;
            };
            let token = state.next_token;
            state.next_token += 1;
            *state.pin_counts.entry(pfn).or_default() += 1;
            state.outstanding.insert(token, pfn);
            pages.push(PageHandle::new(pfn, token));
        }
        Ok(pages)
    }

    fn unpin_pages(&self, pages: Vec<PageHandle>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_unpin) {
            anyhow::bail!("injected unpin failure for {} pages", pages.len());
        }
        for page in pages {
            match state.outstanding.remove(&page.token()) {
                Some(pfn) if pfn == page.pfn() => {}
                _ => anyhow::bail!("page {:#x} was not pinned by this address space", page.pfn()),
            }
            let count = state
                .pin_counts
                .get_mut(&page.pfn())
                .context("pin count missing")?;
            *count -= 1;
            if *count == 0 {
                state.pin_counts.remove(&page.pfn());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DmaMapperState {
    live: Vec<DmaSegment>,
    next_iova: u64,
    merge_all: bool,
    fail_next: bool,
    fail_next_unmap: bool,
}

/// An emulated IOMMU.
///
/// By default a physical address maps to itself plus a fixed bias. In
/// merge-all mode every table is mapped into one contiguous run of fresh
/// device addresses, the way an IOMMU may coalesce a scattered table.
#[derive(Debug)]
pub struct EmulatedDmaMapper {
    iova_bias: u64,
    state: Mutex<DmaMapperState>,
}

const MERGED_IOVA_BASE: u64 = 0x8000_0000_0000;

impl EmulatedDmaMapper {
    /// Creates a mapper that adds `iova_bias` to physical addresses.
    pub fn new(iova_bias: u64) -> Self {
        Self {
            iova_bias,
            state: Mutex::new(DmaMapperState {
                next_iova: MERGED_IOVA_BASE,
                ..Default::default()
            }),
        }
    }

    /// Enables or disables merge-all mode.
    pub fn set_merge_all(&self, merge_all: bool) {
        self.state.lock().merge_all = merge_all;
    }

    /// Fails the next map call.
    pub fn fail_next_map(&self) {
        self.state.lock().fail_next = true;
    }

    /// Fails the next unmap call. The segments stay mapped.
    pub fn fail_next_unmap(&self) {
        self.state.lock().fail_next_unmap = true;
    }

    /// The number of device segments currently mapped.
    pub fn mapped_segment_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl DmaMapper for EmulatedDmaMapper {
    fn map_segments(&self, segments: &[Segment]) -> anyhow::Result<Vec<DmaSegment>> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            anyhow::bail!("injected map failure");
        }
        if segments.is_empty() {
            anyhow::bail!("empty segment table");
        }

        let mapped = if state.merge_all {
            let len = segments.iter().map(|segment| segment.len).sum::<usize>();
            let dma_address = state.next_iova;
            state.next_iova += (len as u64).next_multiple_of(PAGE_SIZE64);
            vec![DmaSegment { dma_address, len }]
        } else {
            merge_adjacent(segments.iter().map(|segment| DmaSegment {
                dma_address: segment.physical_address + self.iova_bias,
                len: segment.len,
            }))
        };
        state.live.extend(mapped.iter().copied());
        Ok(mapped)
    }

    fn unmap_segments(&self, mapped: &[DmaSegment]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_unmap) {
            anyhow::bail!("injected unmap failure");
        }
        for segment in mapped {
            let index = state
                .live
                .iter()
                .position(|live| live == segment)
                .with_context(|| {
                    format!("segment at {:#x} is not mapped", segment.dma_address)
                })?;
            state.live.swap_remove(index);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct CoherentAllocation {
    device_address: u64,
    byte_size: usize,
    first_page: usize,
    pages: usize,
}

#[derive(Debug)]
struct CoherentState {
    used: Vec<bool>,
    allocations: BTreeMap<u64, CoherentAllocation>,
    fail_next: bool,
    fail_next_free: bool,
}

/// An emulated pool of physically contiguous coherent memory.
#[derive(Debug)]
pub struct EmulatedCoherentAllocator {
    base_pfn: u64,
    state: Mutex<CoherentState>,
}

const KERNEL_DIRECT_MAP: u64 = 0xffff_8880_0000_0000;
const CLIENT_MAP_BASE: u64 = 0x7f00_0000_0000;

impl EmulatedCoherentAllocator {
    /// Creates a pool of `total_pages` pages starting at frame `base_pfn`.
    pub fn new(base_pfn: u64, total_pages: usize) -> Self {
        Self {
            base_pfn,
            state: Mutex::new(CoherentState {
                used: vec![false; total_pages],
                allocations: BTreeMap::new(),
                fail_next: false,
                fail_next_free: false,
            }),
        }
    }

    /// Fails the next allocation.
    pub fn fail_next_alloc(&self) {
        self.state.lock().fail_next = true;
    }

    /// Fails the next free. The block stays allocated.
    pub fn fail_next_free(&self) {
        self.state.lock().fail_next_free = true;
    }

    /// The number of blocks allocated and not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    fn find_live<'a>(
        state: &'a CoherentState,
        kernel_address: u64,
        device_address: u64,
        byte_size: usize,
    ) -> anyhow::Result<&'a CoherentAllocation> {
        let allocation = state
            .allocations
            .get(&kernel_address)
            .with_context(|| format!("no coherent block at {kernel_address:#x}"))?;
        if allocation.device_address != device_address || allocation.byte_size != byte_size {
            anyhow::bail!(
                "coherent block at {kernel_address:#x} is {:#x}/{} bytes, \
                 not {device_address:#x}/{byte_size} bytes",
                allocation.device_address,
                allocation.byte_size,
            );
        }
        Ok(allocation)
    }
}

impl CoherentAllocator for EmulatedCoherentAllocator {
    fn alloc_coherent(&self, byte_size: usize) -> anyhow::Result<CoherentBlock> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            anyhow::bail!("injected allocation failure");
        }
        let pages = byte_size.div_ceil(crate::PAGE_SIZE);
        if pages == 0 {
            anyhow::bail!("empty allocation");
        }

        let first_page = state
            .used
            .windows(pages)
            .position(|run| run.iter().all(|used| !used))
            .with_context(|| format!("no run of {pages} free pages"))?;
        state.used[first_page..first_page + pages].fill(true);

        let device_address = (self.base_pfn + first_page as u64) << PAGE_SHIFT;
        let kernel_address = KERNEL_DIRECT_MAP + device_address;
        state.allocations.insert(
            kernel_address,
            CoherentAllocation {
                device_address,
                byte_size,
                first_page,
                pages,
            },
        );
        Ok(CoherentBlock {
            kernel_address,
            device_address,
        })
    }

    fn free_coherent(
        &self,
        kernel_address: u64,
        byte_size: usize,
        device_address: u64,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_free) {
            anyhow::bail!("injected free failure at {kernel_address:#x}");
        }
        let allocation = Self::find_live(&state, kernel_address, device_address, byte_size)?;
        let (first_page, pages) = (allocation.first_page, allocation.pages);
        state.allocations.remove(&kernel_address);
        state.used[first_page..first_page + pages].fill(false);
        Ok(())
    }

    fn map_into_client(
        &self,
        kernel_address: u64,
        device_address: u64,
        byte_size: usize,
    ) -> anyhow::Result<u64> {
        let state = self.state.lock();
        Self::find_live(&state, kernel_address, device_address, byte_size)?;
        Ok(CLIENT_MAP_BASE + device_address)
    }
}

/// An emulated register space that records writes.
#[derive(Debug)]
pub struct EmulatedRegisters {
    values: Mutex<Vec<u32>>,
    writes: Mutex<Vec<(usize, u32)>>,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

impl EmulatedRegisters {
    /// Creates a register space of `len` bytes, all zero.
    pub fn new(len: usize) -> Self {
        Self {
            values: Mutex::new(vec![0; len / 4]),
            writes: Mutex::new(Vec::new()),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        }
    }

    /// The size of the register space, in bytes.
    pub fn len(&self) -> usize {
        self.values.lock().len() * 4
    }

    /// Whether the register space is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every 32-bit write so far, as `(offset, value)`.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.writes.lock().clone()
    }

    /// The number of times the registers were mapped.
    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    /// The number of times a mapping was dropped.
    pub fn unmap_count(&self) -> usize {
        self.unmaps.load(Ordering::SeqCst)
    }

    fn write(&self, offset: usize, data: u32) {
        self.values.lock()[offset / 4] = data;
        self.writes.lock().push((offset, data));
    }
}

struct EmulatedRegisterMapping {
    registers: Arc<EmulatedRegisters>,
}

impl DeviceRegisterIo for EmulatedRegisterMapping {
    fn len(&self) -> usize {
        self.registers.len()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.registers.values.lock()[offset / 4]
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let values = self.registers.values.lock();
        u64::from(values[offset / 4]) | (u64::from(values[offset / 4 + 1]) << 32)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.registers.write(offset, data);
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.registers.write(offset, data as u32);
        self.registers.write(offset + 4, (data >> 32) as u32);
    }
}

impl Drop for EmulatedRegisterMapping {
    fn drop(&mut self) {
        self.registers.unmaps.fetch_add(1, Ordering::SeqCst);
    }
}

/// An emulated device, bundling an emulated IOMMU, coherent pool, and
/// register space.
#[derive(Debug)]
pub struct EmulatedDevice {
    id: String,
    mapper: Arc<EmulatedDmaMapper>,
    allocator: Arc<EmulatedCoherentAllocator>,
    registers: Arc<EmulatedRegisters>,
    fail_register_mapping: AtomicBool,
}

const DEFAULT_POOL_BASE_PFN: u64 = 0x10_0000;
const DEFAULT_POOL_PAGES: usize = 1024;
const DEFAULT_REGISTER_SPACE: usize = 0x1000;

impl EmulatedDevice {
    /// Creates a device with an identity-mapping IOMMU, a 4MB coherent
    /// pool, and a 4KB register space.
    pub fn new(id: &str) -> Self {
        Self::with_parts(
            id,
            EmulatedDmaMapper::new(0),
            EmulatedCoherentAllocator::new(DEFAULT_POOL_BASE_PFN, DEFAULT_POOL_PAGES),
            EmulatedRegisters::new(DEFAULT_REGISTER_SPACE),
        )
    }

    /// Creates a device from the given parts.
    pub fn with_parts(
        id: &str,
        mapper: EmulatedDmaMapper,
        allocator: EmulatedCoherentAllocator,
        registers: EmulatedRegisters,
    ) -> Self {
        Self {
            id: id.to_owned(),
            mapper: Arc::new(mapper),
            allocator: Arc::new(allocator),
            registers: Arc::new(registers),
            fail_register_mapping: AtomicBool::new(false),
        }
    }

    /// The device's IOMMU.
    pub fn dma_mapper_state(&self) -> &Arc<EmulatedDmaMapper> {
        &self.mapper
    }

    /// The device's coherent pool.
    pub fn coherent_allocator_state(&self) -> &Arc<EmulatedCoherentAllocator> {
        &self.allocator
    }

    /// The device's registers.
    pub fn registers(&self) -> &Arc<EmulatedRegisters> {
        &self.registers
    }

    /// Makes register mapping fail until reset.
    pub fn fail_register_mapping(&self, fail: bool) {
        self.fail_register_mapping.store(fail, Ordering::SeqCst);
    }
}

impl DeviceBacking for EmulatedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn dma_mapper(&self) -> Arc<dyn DmaMapper> {
        self.mapper.clone()
    }

    fn coherent_allocator(&self) -> Arc<dyn CoherentAllocator> {
        self.allocator.clone()
    }

    fn map_control_registers(&self) -> anyhow::Result<Box<dyn DeviceRegisterIo>> {
        if self.fail_register_mapping.load(Ordering::SeqCst) {
            anyhow::bail!("injected register mapping failure");
        }
        self.registers.maps.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EmulatedRegisterMapping {
            registers: self.registers.clone(),
        }))
    }
}
