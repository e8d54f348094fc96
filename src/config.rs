//! Engine configuration parameters
//!
//! All tunable parameters for the OTA client and server engines.
//! Defaults carry the protocol constants; the host binary can override
//! them from a JSON file.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{FileId, OTA_MAX_MTU};

/// OTA client (device being upgraded) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    // --- Identity ---
    /// Application endpoint hosting the OTA client cluster
    pub endpoint: u8,
    /// Manufacturer code of the running image
    pub manufacturer_id: u16,
    /// Image type of the running image
    pub image_type: u16,
    /// Version of the running image
    pub current_file_version: u32,
    /// ZigBee stack version of the running image
    pub current_stack_version: u16,
    /// Hardware version sent with queries (None = omit)
    pub hardware_version: Option<u16>,
    /// Accept Image Notify commands
    pub permit: bool,

    // --- Block transfer ---
    /// Largest block requested (clamped to the MTU)
    pub max_data_size: u8,
    /// Advertise rate-limit support (minimum block period) in block requests
    pub rate_limit_support: bool,
    /// Initial minimum delay between block requests (ms)
    pub min_block_req_delay_ms: u16,
    /// Added to an adopted server block delay before the next request (ms)
    pub block_request_guard_ms: u32,
    /// Time to wait for an Image-Block Response (ms)
    pub block_rsp_timeout_ms: u32,
    /// Block timeouts tolerated before the transfer is aborted
    pub max_block_retries: u8,

    // --- Upgrade end ---
    /// Upgrade-End re-sends tolerated before applying anyway
    pub max_end_req_retries: u8,
    /// Period between Upgrade-End re-sends while waiting (seconds)
    pub upgrade_wait_secs: u32,
    /// Apply the staged image once the wait budget is spent
    pub apply_after_wait_exhausted: bool,

    // --- Discovery and polling ---
    /// Period of Query-Next-Image polling (ms); first poll is randomized
    pub query_rate_ms: u32,
    /// Time to wait for a Query-Next-Image Response (ms)
    pub query_timeout_ms: u32,
    /// Period of server discovery retries (ms)
    pub discovery_interval_ms: u32,
    /// Poll rate while a download is active (ms)
    pub fast_poll_rate_ms: u32,
    /// Poll rate when idle (ms)
    pub idle_poll_rate_ms: u32,
}

impl ClientConfig {
    /// File identifier of the running image.
    pub fn current_file_id(&self) -> FileId {
        FileId::new(self.manufacturer_id, self.image_type, self.current_file_version)
    }

    /// Block size actually requested.
    pub fn effective_max_data_size(&self) -> u8 {
        self.max_data_size.clamp(1, OTA_MAX_MTU)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            // Identity
            endpoint: 20,
            manufacturer_id: 0xBEBE,
            image_type: 0x0001,
            current_file_version: 0x0000_0001,
            current_stack_version: 0x0002,
            hardware_version: None,
            permit: true,

            // Block transfer
            max_data_size: OTA_MAX_MTU,
            rate_limit_support: true,
            min_block_req_delay_ms: 0,
            block_request_guard_ms: 300,
            block_rsp_timeout_ms: 5_000,
            max_block_retries: 10,

            // Upgrade end
            max_end_req_retries: 2,
            upgrade_wait_secs: 3_600,
            apply_after_wait_exhausted: true,

            // Discovery and polling
            query_rate_ms: 30_000,
            query_timeout_ms: 10_000,
            discovery_interval_ms: 5_000,
            fast_poll_rate_ms: 2_000,
            idle_poll_rate_ms: 60_000,
        }
    }
}

/// OTA server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Application endpoint hosting the OTA server cluster
    pub endpoint: u8,
    /// Service client requests
    pub permit: bool,
    /// Minimum block period every client must honour (ms)
    pub min_block_req_delay_ms: u16,
    /// Delay between Upgrade-End and the scheduled apply time (seconds)
    pub upgrade_delay_secs: u32,
    /// Wait sent when the file provider refuses a read (seconds)
    pub send_block_wait_secs: u32,
    /// Largest block served
    pub max_mtu: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: 20,
            permit: true,
            min_block_req_delay_ms: 0,
            upgrade_delay_secs: 60,
            send_block_wait_secs: 1,
            max_mtu: OTA_MAX_MTU,
        }
    }
}

/// Combined configuration loaded by the host runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl OtaConfig {
    /// Reject parameter combinations the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.client;
        if c.max_data_size == 0 {
            return Err(Error::Config("client max_data_size must be non-zero"));
        }
        if c.block_rsp_timeout_ms == 0 {
            return Err(Error::Config("client block_rsp_timeout_ms must be non-zero"));
        }
        if c.query_rate_ms == 0 || c.discovery_interval_ms == 0 {
            return Err(Error::Config("client polling periods must be non-zero"));
        }
        if c.upgrade_wait_secs == 0 {
            return Err(Error::Config("client upgrade_wait_secs must be non-zero"));
        }
        let s = &self.server;
        if s.max_mtu == 0 || s.max_mtu > OTA_MAX_MTU {
            return Err(Error::Config("server max_mtu must be within 1..=64"));
        }
        Ok(())
    }
}
