// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver configuration.

use serde::Deserialize;

/// The largest cleanup command list a device can store.
pub const MAX_CLEANUP_COMMANDS: usize = 16;

/// Tunables for [`BufferLockDriver`](crate::driver::BufferLockDriver).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferLockConfig {
    /// The number of pages pinned per call into the platform pinner.
    pub pin_batch_pages: usize,
    /// The largest buffer, in bytes, a client may lock.
    pub max_buffer_size: u64,
    /// The number of cleanup commands stored per device. Longer lists are
    /// truncated.
    pub max_cleanup_commands: usize,
    /// The number of devices that may share one PCI device ID.
    pub max_devices_per_type: usize,
    /// The prefix of generated device names.
    pub device_name_prefix: String,
}

impl Default for BufferLockConfig {
    fn default() -> Self {
        Self {
            pin_batch_pages: 512,
            // Page descriptors carry a 32-bit byte count.
            max_buffer_size: u32::MAX.into(),
            max_cleanup_commands: MAX_CLEANUP_COMMANDS,
            max_devices_per_type: 8,
            device_name_prefix: "buflock".into(),
        }
    }
}

impl BufferLockConfig {
    /// Checks the configuration for values the driver cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pin_batch_pages == 0 {
            anyhow::bail!("pin batch size must be nonzero");
        }
        if self.max_buffer_size == 0 {
            anyhow::bail!("maximum buffer size must be nonzero");
        }
        if self.max_cleanup_commands > MAX_CLEANUP_COMMANDS {
            anyhow::bail!(
                "at most {MAX_CLEANUP_COMMANDS} cleanup commands are supported, got {}",
                self.max_cleanup_commands
            );
        }
        if self.max_devices_per_type == 0 {
            anyhow::bail!("maximum devices per type must be nonzero");
        }
        if self.device_name_prefix.is_empty() {
            anyhow::bail!("device name prefix must not be empty");
        }
        Ok(())
    }
}
