//! Datapath configuration.

use crate::backend::{BindFlags, ChecksumOffloads};
use crate::error::{DatapathError, Result};
use crate::frame::calculate_header_backfill;
use serde::{Deserialize, Serialize};

/// Smallest frame buffer that can hold an IPv6/TCP header and a minimum
/// QUIC datagram.
pub const MIN_FRAME_SIZE: usize = 1280 + 74;

/// Datapath configuration.
///
/// Missing JSON fields take their default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// Worker partitions (capped by the number of queues)
    pub partition_count: usize,
    /// RX frames per queue
    pub rx_buffer_count: usize,
    /// TX frames per queue
    pub tx_buffer_count: usize,
    /// Size of every frame buffer
    pub max_frame_size: usize,
    /// RX descriptors drained per queue per iteration
    pub rx_batch_size: usize,
    /// Idle time before a partition arms notifications and parks
    pub polling_idle_timeout_us: u64,
    /// Kick the TX ring after every submit
    pub tx_always_poke: bool,
    /// Checksums left to the NIC on transmit
    pub skip_checksum: ChecksumOffloads,
    /// Reserve ports with an auxiliary OS socket
    pub reserve_os_ports: bool,
    /// Pin partitions to CPUs (Linux)
    pub cpu_affinity: bool,
    /// Flags passed to the backend when binding queues
    pub bind_flags: BindFlags,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            partition_count: num_cpus::get(),
            rx_buffer_count: 4096,
            tx_buffer_count: 4096,
            max_frame_size: 2048,
            rx_batch_size: 64,
            polling_idle_timeout_us: 1000,
            tx_always_poke: false,
            skip_checksum: ChecksumOffloads::default(),
            reserve_os_ports: true,
            cpu_affinity: false,
            bind_flags: BindFlags::default(),
        }
    }
}

impl DatapathConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(DatapathError::InvalidConfig(
                "partition_count must be at least 1".into(),
            ));
        }

        if self.partition_count > usize::from(u16::MAX) {
            return Err(DatapathError::InvalidConfig(format!(
                "partition_count must be <= {}",
                u16::MAX
            )));
        }

        if self.rx_buffer_count == 0 || self.tx_buffer_count == 0 {
            return Err(DatapathError::InvalidConfig(
                "buffer counts must be non-zero".into(),
            ));
        }

        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(DatapathError::InvalidConfig(format!(
                "max_frame_size must be >= {MIN_FRAME_SIZE}"
            )));
        }

        if self.rx_batch_size == 0 {
            return Err(DatapathError::InvalidConfig(
                "rx_batch_size must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Largest payload a TX buffer can carry for the given framing.
    pub fn max_payload(&self, is_ipv6: bool, is_tcp: bool) -> usize {
        self.max_frame_size
            .saturating_sub(calculate_header_backfill(is_ipv6, is_tcp))
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DatapathError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| DatapathError::InvalidConfig(e.to_string()))
    }
}
