// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attached devices and their cleanup commands.

use crate::ChannelId;
use crate::DeviceBacking;
use crate::config::MAX_CLEANUP_COMMANDS;
use anyhow::Context;
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// The bus location of a PCI function.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PciLocation {
    /// The PCI domain (segment).
    pub domain: u16,
    /// The bus number.
    pub bus: u8,
    /// The device number.
    pub device: u8,
    /// The function number.
    pub function: u8,
}

impl PciLocation {
    /// Returns a new location.
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// A register write applied when a client disconnects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCommand {
    /// The byte offset of the register in BAR0.
    pub register_offset: u32,
    /// The value to write.
    pub value: u32,
}

/// An attached device.
pub struct DeviceContext {
    channel: ChannelId,
    location: PciLocation,
    device_id: u16,
    name: String,
    max_cleanup_commands: usize,
    cleanup_commands: Mutex<ArrayVec<CleanupCommand, MAX_CLEANUP_COMMANDS>>,
    open_count: AtomicU32,
    detached: AtomicBool,
    backing: Arc<dyn DeviceBacking>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("channel", &self.channel)
            .field("location", &format_args!("{}", self.location))
            .field("device_id", &format_args!("{:#06x}", self.device_id))
            .field("name", &self.name)
            .field("backing", &self.backing.id())
            .field("open_count", &self.open_count())
            .finish()
    }
}

impl DeviceContext {
    /// Creates a device with no cleanup commands.
    ///
    /// `max_cleanup_commands` is clamped to [`MAX_CLEANUP_COMMANDS`].
    pub fn new(
        channel: ChannelId,
        location: PciLocation,
        device_id: u16,
        name: String,
        max_cleanup_commands: usize,
        backing: Arc<dyn DeviceBacking>,
    ) -> Self {
        Self {
            channel,
            location,
            device_id,
            name,
            max_cleanup_commands: max_cleanup_commands.min(MAX_CLEANUP_COMMANDS),
            cleanup_commands: Mutex::new(ArrayVec::new()),
            open_count: AtomicU32::new(0),
            detached: AtomicBool::new(false),
            backing,
        }
    }

    /// The control channel bound to this device.
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The bus location.
    pub fn location(&self) -> PciLocation {
        self.location
    }

    /// The PCI device ID.
    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// The device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hardware behind the device.
    pub fn backing(&self) -> &Arc<dyn DeviceBacking> {
        &self.backing
    }

    /// The number of open client channels.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Whether the device is still attached to the driver.
    pub fn is_attached(&self) -> bool {
        !self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.open_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn release_ref(&self) -> u32 {
        let prev = self
            .open_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .unwrap_or_else(|_| {
                tracing::warn!(device = self.name(), "open count underflow");
                0
            });
        prev.saturating_sub(1)
    }

    /// The stored cleanup commands, in application order.
    pub fn cleanup_commands(&self) -> Vec<CleanupCommand> {
        self.cleanup_commands.lock().to_vec()
    }

    /// Replaces the cleanup commands, returning the commands actually stored.
    ///
    /// Commands beyond the per-device limit are dropped.
    pub fn configure_cleanup_commands(&self, commands: &[CleanupCommand]) -> Vec<CleanupCommand> {
        let accepted = &commands[..commands.len().min(self.max_cleanup_commands)];
        if accepted.len() < commands.len() {
            tracing::warn!(
                device = self.name(),
                requested = commands.len(),
                limit = self.max_cleanup_commands,
                "too many cleanup commands, truncating"
            );
        }

        let mut stored = self.cleanup_commands.lock();
        stored.clear();
        stored.extend(accepted.iter().copied());
        tracing::debug!(
            device = self.name(),
            count = stored.len(),
            "configured cleanup commands"
        );
        stored.to_vec()
    }

    /// Writes every stored cleanup command to the device's control registers,
    /// in order. Returns the number of registers written.
    ///
    /// A device with no commands is left untouched; its registers are not
    /// mapped.
    pub fn apply_cleanup_commands(&self) -> anyhow::Result<usize> {
        let commands = self.cleanup_commands.lock().clone();
        if commands.is_empty() {
            tracing::debug!(device = self.name(), "no cleanup commands");
            return Ok(0);
        }

        tracing::debug!(
            device = self.name(),
            count = commands.len(),
            "applying cleanup commands"
        );

        let registers = self
            .backing
            .map_control_registers()
            .with_context(|| format!("failed to map control registers of {}", self.name))?;

        let mut written = 0;
        for command in &commands {
            let offset = command.register_offset as usize;
            if offset % 4 != 0 || offset.saturating_add(4) > registers.len() {
                tracing::warn!(
                    device = self.name(),
                    offset,
                    len = registers.len(),
                    "cleanup command outside register space, skipping"
                );
                continue;
            }
            tracing::trace!(
                device = self.name(),
                offset,
                value = command.value,
                "applying cleanup command"
            );
            registers.write_u32(offset, command.value);
            written += 1;
        }

        drop(registers);
        tracing::debug!(device = self.name(), written, "applied cleanup commands");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::CleanupCommand;
    use super::DeviceContext;
    use super::PciLocation;
    use crate::ChannelId;
    use crate::emulated::EmulatedDevice;
    use crate::test_helpers::init_tracing;
    use std::sync::Arc;

    fn command(register_offset: u32, value: u32) -> CleanupCommand {
        CleanupCommand {
            register_offset,
            value,
        }
    }

    fn context(backing: &Arc<EmulatedDevice>, max: usize) -> DeviceContext {
        DeviceContext::new(
            ChannelId(1),
            PciLocation::new(0, 0x3b, 0, 0),
            0x8,
            "test_dev".into(),
            max,
            backing.clone(),
        )
    }

    #[test]
    fn location_display() {
        assert_eq!(PciLocation::new(0, 0x3b, 0x1f, 7).to_string(), "0000:3b:1f.7");
    }

    #[test]
    fn no_commands_no_mapping() {
        init_tracing();
        let backing = Arc::new(EmulatedDevice::new("dev"));
        let device = context(&backing, 16);
        assert_eq!(device.apply_cleanup_commands().unwrap(), 0);
        assert_eq!(backing.registers().map_count(), 0);
    }

    #[test]
    fn applied_in_order() {
        init_tracing();
        let backing = Arc::new(EmulatedDevice::new("dev"));
        let device = context(&backing, 16);
        let commands = [command(0x10, 1), command(0x4, 2), command(0x10, 3)];
        assert_eq!(device.configure_cleanup_commands(&commands), commands);
        assert_eq!(device.apply_cleanup_commands().unwrap(), 3);
        assert_eq!(
            backing.registers().writes(),
            vec![(0x10, 1), (0x4, 2), (0x10, 3)]
        );
        assert_eq!(backing.registers().map_count(), 1);
        assert_eq!(backing.registers().unmap_count(), 1);
    }

    #[test]
    fn configure_replaces_and_truncates() {
        init_tracing();
        let backing = Arc::new(EmulatedDevice::new("dev"));
        let device = context(&backing, 16);
        let many: Vec<_> = (0..20).map(|i| command(i * 4, i)).collect();
        let stored = device.configure_cleanup_commands(&many);
        assert_eq!(stored.len(), 16);
        assert_eq!(stored, many[..16]);

        let stored = device.configure_cleanup_commands(&[command(0, 9)]);
        assert_eq!(stored, [command(0, 9)]);
        assert_eq!(device.cleanup_commands(), [command(0, 9)]);

        assert!(device.configure_cleanup_commands(&[]).is_empty());
        assert_eq!(device.apply_cleanup_commands().unwrap(), 0);
    }

    #[test]
    fn configured_limit_below_maximum() {
        let backing = Arc::new(EmulatedDevice::new("dev"));
        let device = context(&backing, 2);
        let stored =
            device.configure_cleanup_commands(&[command(0, 1), command(4, 2), command(8, 3)]);
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn bad_offsets_skipped() {
        init_tracing();
        let backing = Arc::new(EmulatedDevice::new("dev"));
        let len = backing.registers().len() as u32;
        let device = context(&backing, 16);
        device.configure_cleanup_commands(&[command(2, 1), command(len, 2), command(8, 3)]);
        assert_eq!(device.apply_cleanup_commands().unwrap(), 1);
        assert_eq!(backing.registers().writes(), vec![(8, 3)]);
    }

    #[test]
    fn map_failure_reported() {
        init_tracing();
        let backing = Arc::new(EmulatedDevice::new("dev"));
        backing.fail_register_mapping(true);
        let device = context(&backing, 16);
        device.configure_cleanup_commands(&[command(0, 1)]);
        assert!(device.apply_cleanup_commands().is_err());
        assert!(backing.registers().writes().is_empty());
    }

    #[test]
    fn open_count() {
        let backing = Arc::new(EmulatedDevice::new("dev"));
        let device = context(&backing, 16);
        assert_eq!(device.add_ref(), 1);
        assert_eq!(device.add_ref(), 2);
        assert_eq!(device.release_ref(), 1);
        assert_eq!(device.release_ref(), 0);
        assert_eq!(device.release_ref(), 0);
        assert_eq!(device.open_count(), 0);
    }
}
