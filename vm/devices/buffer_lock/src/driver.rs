// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The buffer-lock driver: device table, lock and unlock paths, client
//! channels, and teardown sweeps.

use crate::BufferId;
use crate::BufferLockError;
use crate::ChannelId;
use crate::DeviceBacking;
use crate::InvalidArgument;
use crate::PAGE_SIZE64;
use crate::PagePinner;
use crate::ProcessId;
use crate::buffer::BufferOwner;
use crate::buffer::ContiguousBuffer;
use crate::buffer::LockedBuffer;
use crate::buffer::SgBuffer;
use crate::config::BufferLockConfig;
use crate::contiguous;
use crate::device::CleanupCommand;
use crate::device::DeviceContext;
use crate::device::PciLocation;
use crate::pin;
use crate::protocol::ContiguousBufferInfo;
use crate::protocol::LockSgBufferRequest;
use crate::protocol::Request;
use crate::protocol::Response;
use crate::protocol::SgBufferInfo;
use crate::registry::BufferRegistry;
use crate::sg;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

struct DeviceTable {
    next_channel: u32,
    devices: BTreeMap<ChannelId, Arc<DeviceContext>>,
}

/// The driver state shared by every attached device and client.
pub struct BufferLockDriver {
    config: BufferLockConfig,
    devices: Mutex<DeviceTable>,
    sg: BufferRegistry<SgBuffer>,
    contiguous: BufferRegistry<ContiguousBuffer>,
}

impl std::fmt::Debug for BufferLockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLockDriver")
            .field("config", &self.config)
            .field("devices", &self.devices.lock().devices.len())
            .field("sg_buffers", &self.sg.len())
            .field("contiguous_buffers", &self.contiguous.len())
            .finish()
    }
}

impl BufferLockDriver {
    /// Creates a driver with no devices attached.
    pub fn new(config: BufferLockConfig) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        tracing::info!(
            pin_batch_pages = config.pin_batch_pages,
            max_buffer_size = config.max_buffer_size,
            "buffer lock driver initialized"
        );
        Ok(Arc::new(Self {
            config,
            devices: Mutex::new(DeviceTable {
                next_channel: 0,
                devices: BTreeMap::new(),
            }),
            sg: BufferRegistry::new(),
            contiguous: BufferRegistry::new(),
        }))
    }

    /// The driver configuration.
    pub fn config(&self) -> &BufferLockConfig {
        &self.config
    }

    /// Attaches a device, binding it to a new control channel.
    ///
    /// Fails if the configured number of devices with `device_id` is already
    /// attached.
    pub fn on_device_attached(
        &self,
        location: PciLocation,
        device_id: u16,
        backing: Arc<dyn DeviceBacking>,
    ) -> Result<Arc<DeviceContext>, BufferLockError> {
        let mut table = self.devices.lock();
        let same_type = table
            .devices
            .values()
            .filter(|device| device.device_id() == device_id)
            .count();
        if same_type >= self.config.max_devices_per_type {
            tracing::error!(
                %location,
                device_id,
                limit = self.config.max_devices_per_type,
                "too many devices of this type"
            );
            return Err(BufferLockError::DeviceLimit {
                device_id,
                limit: self.config.max_devices_per_type,
            });
        }

        let channel = ChannelId(table.next_channel);
        table.next_channel += 1;
        let name = device_name(&self.config.device_name_prefix, device_id, location);
        let device = Arc::new(DeviceContext::new(
            channel,
            location,
            device_id,
            name,
            self.config.max_cleanup_commands,
            backing,
        ));
        table.devices.insert(channel, device.clone());
        tracing::info!(
            device = device.name(),
            %location,
            %channel,
            backing = device.backing().id(),
            "device attached"
        );
        Ok(device)
    }

    /// Looks up the device bound to `channel`.
    pub fn device(&self, channel: ChannelId) -> Result<Arc<DeviceContext>, BufferLockError> {
        self.devices
            .lock()
            .devices
            .get(&channel)
            .cloned()
            .ok_or(BufferLockError::DeviceLookupFailure(channel))
    }

    /// The attached devices, in channel order.
    pub fn devices(&self) -> Vec<Arc<DeviceContext>> {
        self.devices.lock().devices.values().cloned().collect()
    }

    /// Opens a control channel for client `pid`. `pinner` pins pages of the
    /// client's address space.
    ///
    /// Dropping the returned channel disconnects the client.
    pub fn open(
        self: &Arc<Self>,
        channel: ChannelId,
        pid: ProcessId,
        pinner: Arc<dyn PagePinner>,
    ) -> Result<ClientChannel, BufferLockError> {
        let device = self.device(channel)?;
        let open_count = device.add_ref();
        tracing::debug!(device = device.name(), %pid, open_count, "client opened device");
        Ok(ClientChannel {
            driver: self.clone(),
            device,
            pid,
            pinner,
            closed: false,
        })
    }

    /// Pins the client buffer described by `request`, maps it for the device
    /// bound to `channel`, and registers it.
    ///
    /// On failure nothing stays pinned, mapped, or registered.
    pub fn lock_sg_buffer(
        &self,
        channel: ChannelId,
        pid: ProcessId,
        pinner: &Arc<dyn PagePinner>,
        request: &LockSgBufferRequest,
    ) -> Result<SgBufferInfo, BufferLockError> {
        let device = self.device(channel)?;
        self.validate_sg_request(request)?;

        tracing::debug!(
            device = device.name(),
            %pid,
            user_address = request.user_address,
            byte_size = request.byte_size,
            "locking sg buffer"
        );

        let id = self.sg.create(pid);
        let buffer = match self.build_sg_buffer(&device, pid, pinner, request) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.sg.abandon(id);
                tracing::error!(
                    %id,
                    %pid,
                    device = device.name(),
                    error = &err as &dyn std::error::Error,
                    "failed to lock sg buffer"
                );
                return Err(err);
            }
        };

        let info = SgBufferInfo {
            id,
            page_count: request.page_count,
            physical_pages: buffer.physical_pages().to_vec(),
        };
        self.sg.publish(id, buffer);
        tracing::info!(
            %id,
            %pid,
            device = device.name(),
            user_address = request.user_address,
            byte_size = request.byte_size,
            page_count = request.page_count,
            "locked sg buffer"
        );
        Ok(info)
    }

    fn validate_sg_request(&self, request: &LockSgBufferRequest) -> Result<(), InvalidArgument> {
        if request.user_address == 0 {
            return Err(InvalidArgument::NullAddress);
        }
        self.validate_size(request.byte_size)?;
        if request.user_address.checked_add(request.byte_size).is_none() {
            return Err(InvalidArgument::AddressOverflow {
                address: request.user_address,
                size: request.byte_size,
            });
        }
        let expected = request.byte_size.div_ceil(PAGE_SIZE64);
        if request.page_count != expected {
            return Err(InvalidArgument::PageCountMismatch {
                declared: request.page_count,
                expected,
            });
        }
        Ok(())
    }

    fn validate_size(&self, byte_size: u64) -> Result<(), InvalidArgument> {
        if byte_size == 0 {
            return Err(InvalidArgument::ZeroSize);
        }
        if byte_size > self.config.max_buffer_size {
            return Err(InvalidArgument::TooLarge {
                size: byte_size,
                max: self.config.max_buffer_size,
            });
        }
        Ok(())
    }

    fn build_sg_buffer(
        &self,
        device: &Arc<DeviceContext>,
        pid: ProcessId,
        pinner: &Arc<dyn PagePinner>,
        request: &LockSgBufferRequest,
    ) -> Result<SgBuffer, BufferLockError> {
        let pages = pin::pin(
            pinner,
            request.user_address,
            request.byte_size,
            self.config.pin_batch_pages,
        )?;

        // The pages are unpinned when `pages` drops if assembly fails.
        let mapper = device.backing().dma_mapper();
        let sg::AssembledBuffer {
            table,
            physical_pages,
        } = sg::assemble(&pages, request.byte_size, &mapper)?;

        Ok(SgBuffer::new(
            BufferOwner {
                pid,
                device: device.clone(),
            },
            request.user_address,
            request.byte_size,
            pages,
            table,
            physical_pages,
        ))
    }

    /// Unmaps, unpins, and unregisters a scatter-gather buffer.
    ///
    /// An unknown ID is not an error: the buffer may already have been
    /// reclaimed by a sweep.
    pub fn unlock_sg_buffer(
        &self,
        channel: ChannelId,
        id: BufferId,
    ) -> Result<BufferId, BufferLockError> {
        self.device(channel)?;
        match self.sg.remove(id) {
            Some(buffer) => release_logged(id, buffer),
            None => tracing::info!(%id, "sg buffer not found, already released"),
        }
        Ok(id)
    }

    /// Allocates and registers a coherent buffer for the device bound to
    /// `channel`.
    pub fn lock_contiguous_buffer(
        &self,
        channel: ChannelId,
        pid: ProcessId,
        byte_size: u64,
    ) -> Result<ContiguousBufferInfo, BufferLockError> {
        let device = self.device(channel)?;
        self.validate_size(byte_size)?;

        let id = self.contiguous.create(pid);
        let allocator = device.backing().coherent_allocator();
        let handle = match contiguous::allocate(&allocator, byte_size) {
            Ok(handle) => handle,
            Err(err) => {
                self.contiguous.abandon(id);
                tracing::error!(
                    %id,
                    %pid,
                    device = device.name(),
                    byte_size,
                    error = &err as &dyn std::error::Error,
                    "failed to lock contiguous buffer"
                );
                return Err(err.into());
            }
        };

        let info = ContiguousBufferInfo {
            id,
            kernel_address: handle.kernel_address(),
            device_address: handle.device_address(),
            byte_size,
        };
        self.contiguous.publish(
            id,
            ContiguousBuffer::new(
                BufferOwner {
                    pid,
                    device: device.clone(),
                },
                handle,
            ),
        );
        tracing::info!(
            %id,
            %pid,
            device = device.name(),
            byte_size,
            device_address = info.device_address,
            "locked contiguous buffer"
        );
        Ok(info)
    }

    /// Frees and unregisters a coherent buffer. An unknown ID is not an
    /// error.
    pub fn unlock_contiguous_buffer(
        &self,
        channel: ChannelId,
        id: BufferId,
    ) -> Result<BufferId, BufferLockError> {
        self.device(channel)?;
        match self.contiguous.remove(id) {
            Some(buffer) => release_logged(id, buffer),
            None => tracing::info!(%id, "contiguous buffer not found, already released"),
        }
        Ok(id)
    }

    /// Maps a registered coherent buffer into the client, returning the
    /// client address.
    ///
    /// The buffer stays registered for the duration of the mapping, so a
    /// concurrent unlock of the same ID waits. Other IDs are not blocked.
    pub fn map_contiguous_buffer(
        &self,
        channel: ChannelId,
        id: BufferId,
    ) -> Result<u64, BufferLockError> {
        self.device(channel)?;
        let address = self
            .contiguous
            .with_buffer(id, |buffer| buffer.handle().map_into_client())
            .ok_or(BufferLockError::NotFound(id))?
            .map_err(BufferLockError::MapFailure)?;
        tracing::debug!(%id, address, "mapped contiguous buffer into client");
        Ok(address)
    }

    /// Replaces the cleanup commands of the device bound to `channel`,
    /// returning the commands stored.
    pub fn configure_cleanup_commands(
        &self,
        channel: ChannelId,
        commands: &[CleanupCommand],
    ) -> Result<Vec<CleanupCommand>, BufferLockError> {
        let device = self.device(channel)?;
        Ok(device.configure_cleanup_commands(commands))
    }

    /// Handles a client closing its channel to `device`: releases every
    /// buffer `pid` owns, then applies the device's cleanup commands.
    ///
    /// Returns the number of buffers released.
    ///
    /// Cleanup commands are skipped if the device was detached by shutdown.
    pub fn on_client_disconnect(&self, device: &DeviceContext, pid: ProcessId) -> usize {
        tracing::info!(
            device = device.name(),
            %pid,
            "client disconnected, releasing its buffers"
        );
        let released = release_all(self.sg.take_owned_by(pid))
            + release_all(self.contiguous.take_owned_by(pid));
        if released == 0 {
            tracing::debug!(%pid, "no buffers to release");
        }

        if !device.is_attached() {
            tracing::warn!(
                device = device.name(),
                "device detached, skipping cleanup commands"
            );
        } else if let Err(err) = device.apply_cleanup_commands() {
            tracing::error!(
                device = device.name(),
                error = err.as_ref() as &dyn std::error::Error,
                "failed to apply cleanup commands"
            );
        }

        let open_count = device.release_ref();
        tracing::debug!(
            device = device.name(),
            %pid,
            released,
            open_count,
            "client disconnect done"
        );
        released
    }

    /// Releases every buffer and detaches every device.
    ///
    /// Returns the number of buffers released.
    pub fn on_subsystem_shutdown(&self) -> usize {
        tracing::info!("shutting down, releasing all buffers");
        let released = release_all(self.sg.take_all()) + release_all(self.contiguous.take_all());
        let devices = std::mem::take(&mut self.devices.lock().devices);
        for device in devices.values() {
            device.detach();
            if device.open_count() != 0 {
                tracing::warn!(
                    device = device.name(),
                    open_count = device.open_count(),
                    "detaching device with open clients"
                );
            }
        }
        tracing::info!(released, devices = devices.len(), "shutdown complete");
        released
    }

    /// The number of registered scatter-gather buffers.
    pub fn sg_buffer_count(&self) -> usize {
        self.sg.len()
    }

    /// The number of registered contiguous buffers.
    pub fn contiguous_buffer_count(&self) -> usize {
        self.contiguous.len()
    }

    /// The IDs of all registered scatter-gather buffers.
    pub fn sg_buffers(&self) -> Vec<BufferId> {
        self.sg.each().collect()
    }

    /// The IDs of the scatter-gather buffers owned by `pid`.
    pub fn sg_buffers_owned_by(&self, pid: ProcessId) -> Vec<BufferId> {
        self.sg.each_owned_by(pid).collect()
    }

    /// The IDs of all registered contiguous buffers.
    pub fn contiguous_buffers(&self) -> Vec<BufferId> {
        self.contiguous.each().collect()
    }

    /// The IDs of the contiguous buffers owned by `pid`.
    pub fn contiguous_buffers_owned_by(&self, pid: ProcessId) -> Vec<BufferId> {
        self.contiguous.each_owned_by(pid).collect()
    }

    /// Runs `f` on a registered scatter-gather buffer.
    pub fn find_sg_buffer<R>(&self, id: BufferId, f: impl FnOnce(&SgBuffer) -> R) -> Option<R> {
        self.sg.find(id, f)
    }

    /// Runs `f` on a registered contiguous buffer.
    pub fn find_contiguous_buffer<R>(
        &self,
        id: BufferId,
        f: impl FnOnce(&ContiguousBuffer) -> R,
    ) -> Option<R> {
        self.contiguous.find(id, f)
    }
}

fn device_name(prefix: &str, device_id: u16, location: PciLocation) -> String {
    format!(
        "{prefix}_{device_id:02X}_{:02X}{:02X}{:02X}{:X}",
        location.domain, location.bus, location.device, location.function
    )
}

fn release_logged<B: LockedBuffer>(id: BufferId, buffer: B) {
    if let Err(err) = buffer.release(id) {
        tracing::error!(
            kind = %B::KIND,
            %id,
            error = err.as_ref() as &dyn std::error::Error,
            "failed to release buffer"
        );
    }
}

/// Releases buffers taken out of a registry, continuing past failures.
fn release_all<B: LockedBuffer>(buffers: Vec<(BufferId, B)>) -> usize {
    let count = buffers.len();
    for (id, buffer) in buffers {
        release_logged(id, buffer);
    }
    count
}

/// A client's open control channel to one device.
///
/// Dropping the channel disconnects the client, releasing its buffers and
/// applying the device's cleanup commands.
pub struct ClientChannel {
    driver: Arc<BufferLockDriver>,
    device: Arc<DeviceContext>,
    pid: ProcessId,
    pinner: Arc<dyn PagePinner>,
    closed: bool,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("device", &self.device.name())
            .field("pid", &self.pid)
            .finish()
    }
}

impl ClientChannel {
    /// The client process.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The device this channel is bound to.
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Locks a scatter-gather buffer.
    pub fn lock_sg_buffer(
        &self,
        request: &LockSgBufferRequest,
    ) -> Result<SgBufferInfo, BufferLockError> {
        self.driver
            .lock_sg_buffer(self.device.channel(), self.pid, &self.pinner, request)
    }

    /// Unlocks a scatter-gather buffer.
    pub fn unlock_sg_buffer(&self, id: BufferId) -> Result<BufferId, BufferLockError> {
        self.driver.unlock_sg_buffer(self.device.channel(), id)
    }

    /// Locks a contiguous buffer.
    pub fn lock_contiguous_buffer(
        &self,
        byte_size: u64,
    ) -> Result<ContiguousBufferInfo, BufferLockError> {
        self.driver
            .lock_contiguous_buffer(self.device.channel(), self.pid, byte_size)
    }

    /// Unlocks a contiguous buffer.
    pub fn unlock_contiguous_buffer(&self, id: BufferId) -> Result<BufferId, BufferLockError> {
        self.driver.unlock_contiguous_buffer(self.device.channel(), id)
    }

    /// Maps a contiguous buffer into the client.
    pub fn map_contiguous_buffer(&self, id: BufferId) -> Result<u64, BufferLockError> {
        self.driver.map_contiguous_buffer(self.device.channel(), id)
    }

    /// Replaces the device's cleanup commands.
    pub fn configure_cleanup_commands(
        &self,
        commands: &[CleanupCommand],
    ) -> Result<Vec<CleanupCommand>, BufferLockError> {
        self.driver
            .configure_cleanup_commands(self.device.channel(), commands)
    }

    /// Handles one decoded control-channel request.
    pub fn dispatch(&self, request: Request) -> Result<Response, BufferLockError> {
        tracing::trace!(device = self.device.name(), pid = %self.pid, ?request, "dispatch");
        let response = match request {
            Request::LockSgBuffer(request) => {
                Response::SgBufferLocked(self.lock_sg_buffer(&request)?)
            }
            Request::UnlockSgBuffer(id) => Response::SgBufferUnlocked(self.unlock_sg_buffer(id)?),
            Request::LockContiguousBuffer { byte_size } => {
                Response::ContiguousBufferLocked(self.lock_contiguous_buffer(byte_size)?)
            }
            Request::UnlockContiguousBuffer(id) => {
                Response::ContiguousBufferUnlocked(self.unlock_contiguous_buffer(id)?)
            }
            Request::MapContiguousBuffer(id) => {
                Response::ContiguousBufferMapped(self.map_contiguous_buffer(id)?)
            }
            Request::ConfigureCleanupCommands(commands) => {
                Response::CleanupCommandsConfigured(self.configure_cleanup_commands(&commands)?)
            }
        };
        Ok(response)
    }

    /// Closes the channel, disconnecting the client. Returns the number of
    /// buffers released.
    pub fn close(mut self) -> usize {
        self.disconnect()
    }

    fn disconnect(&mut self) -> usize {
        if std::mem::replace(&mut self.closed, true) {
            return 0;
        }
        self.driver.on_client_disconnect(&self.device, self.pid)
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
