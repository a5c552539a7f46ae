// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A user-mode Linux backend.
//!
//! Pages are pinned with `mlock` and translated through `/proc/self/pagemap`,
//! which requires `CAP_SYS_ADMIN` to report frame numbers. BAR0 is mapped
//! through sysfs. Coherent buffers come from locked `memfd_secret` mappings
//! and are only handed out when the kernel happens to back them with
//! physically contiguous frames.
//!
//! `mlock` does not nest: unlocking one of two overlapping buffers unlocks
//! the shared pages for both.

#![expect(unsafe_code)]

use crate::CoherentAllocator;
use crate::CoherentBlock;
use crate::DeviceBacking;
use crate::DeviceRegisterIo;
use crate::DmaMapper;
use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use crate::PAGE_SIZE64;
use crate::PageHandle;
use crate::PagePinner;
use crate::device::PciLocation;
use crate::sg::IdentityDmaMapper;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::c_void;
use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::os::unix::prelude::*;
use std::sync::Arc;
use zerocopy::IntoBytes;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = 0x3f_ffff_ffff_ffff;

/// Reads the frame numbers of `count` pages starting at `address`.
fn read_pagemap(
    pagemap: &mut fs_err::File,
    address: u64,
    count: usize,
) -> anyhow::Result<Vec<u64>> {
    pagemap
        .seek(SeekFrom::Start(8 * (address >> PAGE_SHIFT)))
        .context("failed to seek")?;
    let mut pfns = vec![0u64; count];
    pagemap
        .read_exact(pfns.as_mut_bytes())
        .context("failed to read from pagemap")?;
    for pfn in &mut pfns {
        if *pfn & PAGEMAP_PRESENT == 0 {
            anyhow::bail!("page not present in RAM");
        }
        *pfn &= PAGEMAP_PFN_MASK;
        if *pfn == 0 {
            anyhow::bail!("frame numbers hidden, CAP_SYS_ADMIN is required");
        }
    }
    Ok(pfns)
}

fn mlock(address: u64, len: usize) -> std::io::Result<()> {
    // SAFETY: mlock does not access memory through the pointer. The kernel
    // validates the range.
    if unsafe { libc::mlock(address as *const c_void, len) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn munlock(address: u64, len: usize) -> std::io::Result<()> {
    // SAFETY: as for mlock.
    if unsafe { libc::munlock(address as *const c_void, len) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Unlocks `pages` pages at `first` while unwinding a failed pin.
fn unlock_after_failure(first: u64, pages: usize) {
    if let Err(err) = munlock(first, pages * PAGE_SIZE) {
        tracing::error!(
            address = first,
            pages,
            error = &err as &dyn std::error::Error,
            "failed to unlock pages after pin failure"
        );
    }
}

/// Pins pages of the calling process with `mlock`.
pub struct MlockPinner {
    pagemap: Mutex<fs_err::File>,
}

impl MlockPinner {
    /// Opens the process's pagemap.
    pub fn new() -> anyhow::Result<Self> {
        let pagemap = fs_err::File::open("/proc/self/pagemap")?;
        Ok(Self {
            pagemap: Mutex::new(pagemap),
        })
    }

    /// Locks as many pages as possible from `first`, one at a time, stopping
    /// at the first unmapped page.
    fn lock_prefix(&self, first: u64, count: usize) -> anyhow::Result<usize> {
        for i in 0..count {
            let address = first + i as u64 * PAGE_SIZE64;
            match mlock(address, PAGE_SIZE) {
                Ok(()) => {}
                Err(err) if err.raw_os_error() == Some(libc::ENOMEM) => return Ok(i),
                Err(err) => {
                    if i > 0 {
                        unlock_after_failure(first, i);
                    }
                    return Err(err).with_context(|| format!("failed to lock page {address:#x}"));
                }
            }
        }
        Ok(count)
    }
}

impl PagePinner for MlockPinner {
    fn pin_pages(&self, start: u64, count: usize) -> anyhow::Result<Vec<PageHandle>> {
        let first = start & !(PAGE_SIZE64 - 1);
        let locked = match mlock(first, count * PAGE_SIZE) {
            Ok(()) => count,
            // Part of the range is unmapped. Lock up to the hole.
            Err(err) if err.raw_os_error() == Some(libc::ENOMEM) => {
                self.lock_prefix(first, count)?
            }
            Err(err) => return Err(err).context("failed to lock pages"),
        };
        if locked == 0 {
            return Ok(Vec::new());
        }

        let pfns = match read_pagemap(&mut self.pagemap.lock(), first, locked) {
            Ok(pfns) => pfns,
            Err(err) => {
                unlock_after_failure(first, locked);
                return Err(err);
            }
        };

        Ok(pfns
            .into_iter()
            .enumerate()
            .map(|(i, pfn)| PageHandle::new(pfn, first + i as u64 * PAGE_SIZE64))
            .collect())
    }

    fn unpin_pages(&self, pages: Vec<PageHandle>) -> anyhow::Result<()> {
        let mut failure = None;
        for page in &pages {
            if let Err(err) = munlock(page.token(), PAGE_SIZE) {
                failure.get_or_insert_with(|| {
                    anyhow::Error::new(err)
                        .context(format!("failed to unlock page {:#x}", page.token()))
                });
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

/// A device's BAR0, mapped through sysfs.
pub struct SysfsBar {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for SysfsBar {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for SysfsBar {}

impl SysfsBar {
    /// Maps BAR0 of the device at `location`.
    pub fn map(location: PciLocation) -> anyhow::Result<Self> {
        let path = format!("/sys/bus/pci/devices/{location}/resource0");
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            anyhow::bail!("{path} is empty");
        }

        // SAFETY: No address is being passed. The result is being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to map {path}"));
        }
        tracing::debug!(%location, len, "mapped BAR0");
        Ok(Self { addr, len })
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        assert!(
            offset % size_of::<T>() == 0 && offset + size_of::<T>() <= self.len,
            "register access at {offset:#x} out of bounds"
        );
        // SAFETY: offset is within the mapping.
        unsafe { self.addr.cast::<u8>().add(offset).cast() }
    }
}

impl DeviceRegisterIo for SysfsBar {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: the pointer is in bounds and aligned.
        unsafe { self.ptr::<u32>(offset).read_volatile() }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        // SAFETY: the pointer is in bounds and aligned.
        unsafe { self.ptr::<u64>(offset).read_volatile() }
    }

    fn write_u32(&self, offset: usize, data: u32) {
        // SAFETY: the pointer is in bounds and aligned.
        unsafe { self.ptr::<u32>(offset).write_volatile(data) }
    }

    fn write_u64(&self, offset: usize, data: u64) {
        // SAFETY: the pointer is in bounds and aligned.
        unsafe { self.ptr::<u64>(offset).write_volatile(data) }
    }
}

impl Drop for SysfsBar {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::munmap(self.addr, self.len) } < 0 {
            tracing::error!(
                error = &std::io::Error::last_os_error() as &dyn std::error::Error,
                "failed to unmap BAR0"
            );
        }
    }
}

struct LockedMapping {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for LockedMapping {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for LockedMapping {}

impl LockedMapping {
    fn new(len: usize) -> anyhow::Result<Self> {
        // memfd_secret memory is unmovable, unlike ordinary anonymous
        // memory, even when mlocked.
        //
        // SAFETY: No pointers are passed. The result is validated before
        // being wrapped.
        let file = unsafe {
            let fd = libc::syscall(libc::SYS_memfd_secret, libc::O_CLOEXEC as usize);
            if fd < 0 {
                return Err(std::io::Error::last_os_error())
                    .context("failed to create memfd_secret file");
            }
            File::from_raw_fd(fd as i32)
        };
        file.set_len(len as u64)
            .context("failed to set memfd_secret file length")?;

        // SAFETY: No address is being passed. The result is being validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("failed to map memory");
        }
        let this = Self { addr, len };

        // MAP_POPULATE does not work for memfd_secret mappings, so touch every
        // page to populate the PTEs.
        //
        // SAFETY: The memory is valid for write.
        unsafe { addr.cast::<u8>().write_bytes(0, len) };
        Ok(this)
    }
}

impl Drop for LockedMapping {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result.
        if unsafe { libc::munmap(self.addr, self.len) } < 0 {
            tracing::error!(
                error = &std::io::Error::last_os_error() as &dyn std::error::Error,
                "failed to unmap coherent block"
            );
        }
    }
}

struct LockedBlock {
    _mapping: LockedMapping,
    byte_size: usize,
    device_address: u64,
}

/// Allocates coherent buffers from locked, physically contiguous mappings.
///
/// The driver and its clients share one address space in user mode, so a
/// block's driver address is also its client address.
#[derive(Default)]
pub struct LockedCoherentAllocator {
    blocks: Mutex<HashMap<u64, LockedBlock>>,
}

impl LockedCoherentAllocator {
    /// Creates an allocator with no live blocks.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoherentAllocator for LockedCoherentAllocator {
    fn alloc_coherent(&self, byte_size: usize) -> anyhow::Result<CoherentBlock> {
        let len = byte_size.next_multiple_of(PAGE_SIZE);
        if len == 0 {
            anyhow::bail!("empty allocation");
        }
        let mapping = LockedMapping::new(len)?;
        let pfns = read_pagemap(
            &mut fs_err::File::open("/proc/self/pagemap")?,
            mapping.addr as u64,
            len / PAGE_SIZE,
        )
        .context("failed to get pfns for coherent block")?;
        if pfns.windows(2).any(|pair| pair[1] != pair[0] + 1) {
            anyhow::bail!("no physically contiguous run of {len} bytes");
        }

        let block = CoherentBlock {
            kernel_address: mapping.addr as u64,
            device_address: pfns[0] << PAGE_SHIFT,
        };
        self.blocks.lock().insert(
            block.kernel_address,
            LockedBlock {
                _mapping: mapping,
                byte_size,
                device_address: block.device_address,
            },
        );
        Ok(block)
    }

    fn free_coherent(
        &self,
        kernel_address: u64,
        byte_size: usize,
        device_address: u64,
    ) -> anyhow::Result<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get(&kernel_address)
            .with_context(|| format!("no coherent block at {kernel_address:#x}"))?;
        if block.byte_size != byte_size || block.device_address != device_address {
            anyhow::bail!("coherent block at {kernel_address:#x} does not match free request");
        }
        blocks.remove(&kernel_address);
        Ok(())
    }

    fn map_into_client(
        &self,
        kernel_address: u64,
        device_address: u64,
        byte_size: usize,
    ) -> anyhow::Result<u64> {
        let blocks = self.blocks.lock();
        let block = blocks
            .get(&kernel_address)
            .with_context(|| format!("no coherent block at {kernel_address:#x}"))?;
        if block.byte_size != byte_size || block.device_address != device_address {
            anyhow::bail!("coherent block at {kernel_address:#x} does not match map request");
        }
        Ok(kernel_address)
    }
}

/// A PCI device accessed from user mode, with no IOMMU.
pub struct LinuxDevice {
    id: String,
    location: PciLocation,
    mapper: Arc<IdentityDmaMapper>,
    allocator: Arc<LockedCoherentAllocator>,
}

impl LinuxDevice {
    /// Opens the device at `location`. Fails if it is not present.
    pub fn new(location: PciLocation) -> anyhow::Result<Self> {
        let path = format!("/sys/bus/pci/devices/{location}");
        fs_err::metadata(&path)?;
        Ok(Self {
            id: location.to_string(),
            location,
            mapper: Arc::new(IdentityDmaMapper),
            allocator: Arc::new(LockedCoherentAllocator::new()),
        })
    }
}

impl DeviceBacking for LinuxDevice {
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
        Ok(Box::new(SysfsBar::map(self.location)?))
    }
}
