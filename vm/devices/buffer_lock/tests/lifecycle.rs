// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests of the buffer-lock driver over the emulated platform.

use buffer_lock::BufferId;
use buffer_lock::BufferLockError;
use buffer_lock::ChannelId;
use buffer_lock::PAGE_SIZE64;
use buffer_lock::PagePinner;
use buffer_lock::PinError;
use buffer_lock::ProcessId;
use buffer_lock::buffer::LockedBuffer;
use buffer_lock::config::BufferLockConfig;
use buffer_lock::device::CleanupCommand;
use buffer_lock::device::PciLocation;
use buffer_lock::driver::BufferLockDriver;
use buffer_lock::emulated::EmulatedAddressSpace;
use buffer_lock::emulated::EmulatedCoherentAllocator;
use buffer_lock::emulated::EmulatedDevice;
use buffer_lock::emulated::EmulatedDmaMapper;
use buffer_lock::emulated::EmulatedRegisters;
use buffer_lock::emulated::FrameLayout;
use buffer_lock::protocol::LockSgBufferRequest;
use buffer_lock::protocol::Request;
use buffer_lock::protocol::Response;
use buffer_lock::protocol::status_code;
use std::collections::BTreeSet;
use std::sync::Arc;

const BASE: u64 = 0x7f12_0000_0000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

struct Harness {
    driver: Arc<BufferLockDriver>,
    backing: Arc<EmulatedDevice>,
    channel: ChannelId,
}

impl Harness {
    fn new() -> Self {
        Self::with_device(EmulatedDevice::new("emu0"))
    }

    fn with_device(device: EmulatedDevice) -> Self {
        init_tracing();
        let driver = BufferLockDriver::new(BufferLockConfig::default()).unwrap();
        let backing = Arc::new(device);
        let channel = driver
            .on_device_attached(PciLocation::new(0, 0x3b, 0, 0), 0x6, backing.clone())
            .unwrap()
            .channel();
        Self {
            driver,
            backing,
            channel,
        }
    }
}

fn address_space(
    pages: u64,
    layout: FrameLayout,
) -> (Arc<EmulatedAddressSpace>, Arc<dyn PagePinner>) {
    let space = Arc::new(EmulatedAddressSpace::new());
    space.map_region(BASE, pages * PAGE_SIZE64, layout);
    let pinner: Arc<dyn PagePinner> = space.clone();
    (space, pinner)
}

fn contiguous(pages: u64) -> (Arc<EmulatedAddressSpace>, Arc<dyn PagePinner>) {
    address_space(pages, FrameLayout::Contiguous { base_pfn: 0x2000 })
}

#[test]
fn single_page_buffer() {
    let h = Harness::new();
    let (space, pinner) = contiguous(1);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let info = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 4096))
        .unwrap();
    assert_eq!(info.page_count, 1);
    assert_eq!(info.physical_pages, vec![0x2000 * PAGE_SIZE64]);
    assert_eq!(space.pin_calls(), vec![(BASE, 1)]);

    let second = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 4096))
        .unwrap();
    assert_ne!(info.id, second.id);
}

#[test]
fn full_batch_is_one_pin_call() {
    let h = Harness::new();
    let (space, pinner) = contiguous(512);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let info = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2_097_152))
        .unwrap();
    assert_eq!(info.page_count, 512);
    assert_eq!(info.physical_pages.len(), 512);
    assert_eq!(space.pin_calls().len(), 1);
}

#[test]
fn one_page_over_a_batch_is_two_pin_calls() {
    let h = Harness::new();
    let (space, pinner) = contiguous(513);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let info = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2_101_248))
        .unwrap();
    assert_eq!(info.page_count, 513);
    assert_eq!(
        space.pin_calls(),
        vec![(BASE, 512), (BASE + 512 * PAGE_SIZE64, 1)]
    );
    assert_eq!(space.pinned_page_count(), 513);
    assert_eq!(
        h.driver.find_sg_buffer(info.id, |b| b.pinned_page_count()),
        Some(513)
    );
}

#[test]
fn failed_second_batch_leaves_nothing() {
    let h = Harness::new();
    let (space, pinner) = contiguous(513);
    space.fail_batch(1);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let err = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2_101_248))
        .unwrap_err();
    assert!(matches!(
        err,
        BufferLockError::PinFailure(PinError::Failed {
            pinned: 512,
            expected: 513,
            ..
        })
    ));
    assert_eq!(err.errno(), libc::EFAULT);
    assert!(h.driver.sg_buffers().is_empty());
    assert_eq!(space.pinned_page_count(), 0);
}

#[test]
fn unmapped_tail_leaves_nothing() {
    let h = Harness::new();
    let (space, pinner) = contiguous(3);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let err = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 4 * PAGE_SIZE64))
        .unwrap_err();
    assert!(matches!(
        err,
        BufferLockError::PinFailure(PinError::Incomplete {
            pinned: 3,
            expected: 4
        })
    ));
    assert_eq!(h.driver.sg_buffer_count(), 0);
    assert_eq!(space.pinned_page_count(), 0);
}

#[test]
fn owner_sweep_spares_other_owners() {
    let h = Harness::new();
    let (space_a, pinner_a) = contiguous(2);
    let (space_b, pinner_b) = address_space(2, FrameLayout::Contiguous { base_pfn: 0x9000 });
    let client_a = h.driver.open(h.channel, ProcessId(100), pinner_a).unwrap();
    let client_b = h.driver.open(h.channel, ProcessId(200), pinner_b).unwrap();

    let a = client_a
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2 * PAGE_SIZE64))
        .unwrap();
    let a_contiguous = client_a.lock_contiguous_buffer(100).unwrap();
    let b = client_b
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2 * PAGE_SIZE64))
        .unwrap();
    let b_contiguous = client_b.lock_contiguous_buffer(100).unwrap();
    assert_eq!(h.driver.sg_buffer_count(), 2);
    assert_eq!(h.driver.contiguous_buffer_count(), 2);

    assert_eq!(client_a.close(), 2);

    assert!(h.driver.find_sg_buffer(a.id, |_| ()).is_none());
    assert!(h.driver.find_contiguous_buffer(a_contiguous.id, |_| ()).is_none());
    assert_eq!(
        h.driver.find_sg_buffer(b.id, |buffer| buffer.owner().pid),
        Some(ProcessId(200))
    );
    assert!(h.driver.find_contiguous_buffer(b_contiguous.id, |_| ()).is_some());
    assert_eq!(h.driver.sg_buffers_owned_by(ProcessId(200)), vec![b.id]);
    assert!(h.driver.sg_buffers_owned_by(ProcessId(100)).is_empty());
    assert_eq!(space_a.pinned_page_count(), 0);
    assert_eq!(space_b.pinned_page_count(), 2);
    assert_eq!(h.backing.coherent_allocator_state().live_allocations(), 1);

    drop(client_b);
    assert_eq!(space_b.pinned_page_count(), 0);
    assert_eq!(h.backing.coherent_allocator_state().live_allocations(), 0);
}

#[test]
fn cleanup_commands_applied_once_on_disconnect() {
    let h = Harness::new();
    let (_space, pinner) = contiguous(1);
    let client = h.driver.open(h.channel, ProcessId(7), pinner).unwrap();

    let commands = vec![
        CleanupCommand {
            register_offset: 0x40,
            value: 0,
        },
        CleanupCommand {
            register_offset: 0x10,
            value: 0xdead,
        },
        CleanupCommand {
            register_offset: 0x40,
            value: 1,
        },
    ];
    assert_eq!(
        client.dispatch(Request::ConfigureCleanupCommands(commands.clone())).unwrap(),
        Response::CleanupCommandsConfigured(commands)
    );
    assert!(h.backing.registers().writes().is_empty());

    client.close();
    assert_eq!(
        h.backing.registers().writes(),
        vec![(0x40, 0), (0x10, 0xdead), (0x40, 1)]
    );
    assert_eq!(h.backing.registers().map_count(), 1);
    assert_eq!(h.backing.registers().unmap_count(), 1);
}

#[test]
fn cleanup_commands_run_after_buffers_are_released() {
    let h = Harness::new();
    let (space, pinner) = contiguous(1);
    let client = h.driver.open(h.channel, ProcessId(7), pinner).unwrap();
    client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 1))
        .unwrap();
    client
        .configure_cleanup_commands(&[CleanupCommand {
            register_offset: 0,
            value: 1,
        }])
        .unwrap();
    // Disconnecting another client of the device applies the commands but
    // leaves this client's buffers alone.
    let (_other_space, other_pinner) = contiguous(1);
    let other = h.driver.open(h.channel, ProcessId(8), other_pinner).unwrap();
    assert_eq!(client.device().open_count(), 2);
    other.close();
    assert_eq!(space.pinned_page_count(), 1);
    assert_eq!(h.backing.registers().writes().len(), 1);

    drop(client);
    assert_eq!(space.pinned_page_count(), 0);
    assert_eq!(h.backing.registers().writes().len(), 2);
}

#[test]
fn pin_unpin_symmetry() {
    let h = Harness::new();
    let (space, pinner) = address_space(
        40,
        FrameLayout::Scattered {
            base_pfn: 0x100,
            stride: 3,
        },
    );
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let mut ids = Vec::new();
    let mut expected_pins = 0;
    for (offset, size) in [(0, 1), (1, 4096), (2, 3 * 4096 + 1), (6, 10 * 4096)] {
        let request = LockSgBufferRequest::new(BASE + offset * PAGE_SIZE64, size);
        let info = client.lock_sg_buffer(&request).unwrap();
        expected_pins += request.page_count as usize;
        assert_eq!(space.pinned_page_count(), expected_pins);
        assert_eq!(info.physical_pages.len() as u64, request.page_count);
        ids.push((info.id, request.page_count as usize));
    }

    for (id, pages) in ids {
        client.unlock_sg_buffer(id).unwrap();
        expected_pins -= pages;
        assert_eq!(space.pinned_page_count(), expected_pins);
    }
    assert_eq!(h.backing.dma_mapper_state().mapped_segment_count(), 0);
}

#[test]
fn unlock_unknown_id_is_success() {
    let h = Harness::new();
    let (_space, pinner) = contiguous(2);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();
    let info = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2 * PAGE_SIZE64))
        .unwrap();

    assert_eq!(
        client.unlock_sg_buffer(BufferId(1000)).unwrap(),
        BufferId(1000)
    );
    assert_eq!(
        client.unlock_contiguous_buffer(BufferId(1000)).unwrap(),
        BufferId(1000)
    );
    assert_eq!(h.driver.sg_buffers(), vec![info.id]);
}

#[test]
fn page_table_length_survives_iommu_coalescing() {
    let mapper = EmulatedDmaMapper::new(0);
    mapper.set_merge_all(true);
    let h = Harness::with_device(EmulatedDevice::with_parts(
        "iommu",
        mapper,
        EmulatedCoherentAllocator::new(0x40_0000, 16),
        EmulatedRegisters::new(0x100),
    ));
    let (_space, pinner) = address_space(
        17,
        FrameLayout::Scattered {
            base_pfn: 0x500,
            stride: 7,
        },
    );
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    let info = client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 17 * PAGE_SIZE64 - 5))
        .unwrap();
    assert_eq!(info.page_count, 17);
    assert_eq!(info.physical_pages.len(), 17);
    assert_eq!(
        h.driver.find_sg_buffer(info.id, |b| (
            b.segment_table().segments().len(),
            b.segment_table().mapped().len()
        )),
        Some((17, 1))
    );
    for pair in info.physical_pages.windows(2) {
        assert_eq!(pair[1] - pair[0], PAGE_SIZE64);
    }
}

#[test]
fn dispatch_round_trip() {
    let h = Harness::new();
    let (_space, pinner) = contiguous(4);
    let client = h.driver.open(h.channel, ProcessId(3), pinner).unwrap();

    let Response::SgBufferLocked(sg) = client
        .dispatch(Request::LockSgBuffer(LockSgBufferRequest::new(BASE, 4 * PAGE_SIZE64)))
        .unwrap()
    else {
        panic!("wrong response");
    };
    assert_eq!(sg.page_count, 4);

    let Response::ContiguousBufferLocked(block) = client
        .dispatch(Request::LockContiguousBuffer { byte_size: 8192 })
        .unwrap()
    else {
        panic!("wrong response");
    };
    assert_eq!(block.byte_size, 8192);

    let Response::ContiguousBufferMapped(address) = client
        .dispatch(Request::MapContiguousBuffer(block.id))
        .unwrap()
    else {
        panic!("wrong response");
    };
    assert_ne!(address, 0);

    assert_eq!(
        client.dispatch(Request::UnlockContiguousBuffer(block.id)).unwrap(),
        Response::ContiguousBufferUnlocked(block.id)
    );
    assert_eq!(
        client.dispatch(Request::UnlockSgBuffer(sg.id)).unwrap(),
        Response::SgBufferUnlocked(sg.id)
    );

    let result = client.dispatch(Request::MapContiguousBuffer(block.id));
    assert!(matches!(result, Err(BufferLockError::NotFound(id)) if id == block.id));
    assert_eq!(status_code(&result), -libc::ENODATA);

    let result = client.dispatch(Request::LockSgBuffer(LockSgBufferRequest {
        user_address: BASE,
        byte_size: 4096,
        page_count: 2,
    }));
    assert_eq!(status_code(&result), -libc::EINVAL);
}

#[test]
fn requests_after_shutdown_fail_lookup() {
    let h = Harness::new();
    let (space, pinner) = contiguous(1);
    let client = h.driver.open(h.channel, ProcessId(3), pinner).unwrap();
    client
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 10))
        .unwrap();

    assert_eq!(h.driver.on_subsystem_shutdown(), 1);
    assert_eq!(space.pinned_page_count(), 0);
    assert!(matches!(
        client.lock_contiguous_buffer(4096),
        Err(BufferLockError::DeviceLookupFailure(_))
    ));
    // Disconnecting after shutdown has nothing left to release.
    assert_eq!(client.close(), 0);
}

#[test]
fn disconnect_after_shutdown_skips_cleanup_commands() {
    let h = Harness::new();
    let (_space, pinner) = contiguous(1);
    let client = h.driver.open(h.channel, ProcessId(3), pinner).unwrap();
    client
        .configure_cleanup_commands(&[CleanupCommand {
            register_offset: 0,
            value: 1,
        }])
        .unwrap();
    let device = client.device().clone();
    assert!(device.is_attached());

    h.driver.on_subsystem_shutdown();
    assert!(!device.is_attached());
    assert_eq!(client.close(), 0);

    assert_eq!(h.backing.registers().map_count(), 0);
    assert!(h.backing.registers().writes().is_empty());
    assert_eq!(device.open_count(), 0);
}

#[test]
fn owner_sweep_continues_past_release_failures() {
    let h = Harness::new();
    let (space, pinner) = contiguous(6);
    let (other_space, other_pinner) =
        address_space(1, FrameLayout::Contiguous { base_pfn: 0x9000 });
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();
    let other = h.driver.open(h.channel, ProcessId(2), other_pinner).unwrap();

    for i in 0..3 {
        client
            .lock_sg_buffer(&LockSgBufferRequest::new(
                BASE + i * 2 * PAGE_SIZE64,
                2 * PAGE_SIZE64,
            ))
            .unwrap();
    }
    client.lock_contiguous_buffer(PAGE_SIZE64).unwrap();
    client.lock_contiguous_buffer(PAGE_SIZE64).unwrap();
    let kept = other
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, PAGE_SIZE64))
        .unwrap();
    assert_eq!(h.backing.dma_mapper_state().mapped_segment_count(), 4);

    // The first sg buffer fails to unmap and the first contiguous buffer
    // fails to free. Everything else is still released.
    h.backing.dma_mapper_state().fail_next_unmap();
    h.backing.coherent_allocator_state().fail_next_free();
    assert_eq!(client.close(), 5);

    assert_eq!(h.driver.sg_buffers(), vec![kept.id]);
    assert_eq!(h.driver.contiguous_buffer_count(), 0);
    // Pages are unpinned even when unmapping failed.
    assert_eq!(space.pinned_page_count(), 0);
    assert_eq!(other_space.pinned_page_count(), 1);
    // Only the failed unmap and the failed free leave anything behind.
    assert_eq!(h.backing.dma_mapper_state().mapped_segment_count(), 2);
    assert_eq!(h.backing.coherent_allocator_state().live_allocations(), 1);
}

#[test]
fn shutdown_continues_past_release_failures() {
    let h = Harness::new();
    let (space, pinner) = contiguous(4);
    let client_a = h.driver.open(h.channel, ProcessId(1), pinner.clone()).unwrap();
    let client_b = h.driver.open(h.channel, ProcessId(2), pinner).unwrap();
    client_a
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 2 * PAGE_SIZE64))
        .unwrap();
    client_b
        .lock_sg_buffer(&LockSgBufferRequest::new(BASE + 2 * PAGE_SIZE64, 2 * PAGE_SIZE64))
        .unwrap();
    client_a.lock_contiguous_buffer(PAGE_SIZE64).unwrap();
    client_b.lock_contiguous_buffer(PAGE_SIZE64).unwrap();

    space.fail_next_unpin();
    h.backing.coherent_allocator_state().fail_next_free();
    assert_eq!(h.driver.on_subsystem_shutdown(), 4);

    assert_eq!(h.driver.sg_buffer_count(), 0);
    assert_eq!(h.driver.contiguous_buffer_count(), 0);
    // One buffer's pages could not be unpinned. The other's were.
    assert_eq!(space.pinned_page_count(), 2);
    assert_eq!(h.backing.dma_mapper_state().mapped_segment_count(), 0);
    assert_eq!(h.backing.coherent_allocator_state().live_allocations(), 1);
}

#[test]
fn concurrent_locks_get_distinct_ids() {
    let h = Harness::new();
    let (space, pinner) = contiguous(64);

    let ids: Vec<BufferId> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let client = h.driver.open(h.channel, ProcessId(t), pinner.clone()).unwrap();
                s.spawn(move || {
                    let mut ids = Vec::new();
                    for i in 0..25u64 {
                        let address = BASE + ((u64::from(t) * 8 + i % 8) * PAGE_SIZE64);
                        let info = client
                            .lock_sg_buffer(&LockSgBufferRequest::new(address, PAGE_SIZE64))
                            .unwrap();
                        if i % 3 == 0 {
                            client.unlock_sg_buffer(info.id).unwrap();
                        }
                        ids.push(info.id);
                    }
                    // Keep the channel open until the main thread has
                    // counted the surviving buffers.
                    (ids, client)
                })
            })
            .collect();

        let mut all = Vec::new();
        let mut clients = Vec::new();
        for handle in handles {
            let (ids, client) = handle.join().unwrap();
            all.extend(ids);
            clients.push(client);
        }
        assert_eq!(h.driver.sg_buffer_count(), 8 * 16);
        drop(clients);
        all
    });

    let unique: BTreeSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
    assert_eq!(h.driver.sg_buffer_count(), 0);
    assert_eq!(space.pinned_page_count(), 0);
}

#[test]
fn concurrent_unlock_and_map_of_one_buffer() {
    let h = Harness::new();
    let (_space, pinner) = contiguous(1);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    for _ in 0..100 {
        let info = client.lock_contiguous_buffer(PAGE_SIZE64).unwrap();
        let (unlocked, mapped) = std::thread::scope(|s| {
            let unlock = s.spawn(|| client.unlock_contiguous_buffer(info.id));
            let map = s.spawn(|| client.map_contiguous_buffer(info.id));
            (unlock.join().unwrap(), map.join().unwrap())
        });
        assert_eq!(unlocked.unwrap(), info.id);
        match mapped {
            Ok(address) => assert_ne!(address, 0),
            Err(BufferLockError::NotFound(id)) => assert_eq!(id, info.id),
            Err(err) => panic!("unexpected error {err:?}"),
        }
        assert_eq!(h.backing.coherent_allocator_state().live_allocations(), 0);
    }
}

#[test]
fn concurrent_double_unlock_releases_once() {
    let h = Harness::new();
    let (space, pinner) = contiguous(4);
    let client = h.driver.open(h.channel, ProcessId(1), pinner).unwrap();

    for _ in 0..50 {
        let info = client
            .lock_sg_buffer(&LockSgBufferRequest::new(BASE, 4 * PAGE_SIZE64))
            .unwrap();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| client.unlock_sg_buffer(info.id).unwrap());
            }
        });
        assert_eq!(space.pinned_page_count(), 0);
        assert_eq!(h.driver.sg_buffer_count(), 0);
    }
}
