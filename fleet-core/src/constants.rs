//! Protocol Constants
//!
//! Default values shared by the registries, engines and protocol handlers.

// ============================================================================
// Environment Defaults
// ============================================================================

/// Default enroll endpoint path
pub const DEFAULT_ENROLL_PATH: &str = "enroll";

/// Default log endpoint path
pub const DEFAULT_LOG_PATH: &str = "log";

/// Default config endpoint path
pub const DEFAULT_CONFIG_PATH: &str = "config";

/// Default distributed query read endpoint path
pub const DEFAULT_QUERY_READ_PATH: &str = "read";

/// Default distributed query write endpoint path
pub const DEFAULT_QUERY_WRITE_PATH: &str = "write";

/// Default carver init endpoint path
pub const DEFAULT_CARVER_INIT_PATH: &str = "init";

/// Default carver block endpoint path
pub const DEFAULT_CARVER_BLOCK_PATH: &str = "block";

/// Default config refresh interval (seconds)
pub const DEFAULT_CONFIG_INTERVAL: u32 = 300;

/// Default log flush interval (seconds)
pub const DEFAULT_LOG_INTERVAL: u32 = 600;

/// Default distributed query polling interval (seconds)
pub const DEFAULT_QUERY_INTERVAL: u32 = 60;

/// Length of generated enroll secrets
pub const DEFAULT_SECRET_LENGTH: usize = 64;

/// Length of generated enroll/remove secret paths
pub const DEFAULT_SECRET_PATH_LENGTH: usize = 32;

/// Hours before an enroll/remove secret path expires
pub const DEFAULT_LINK_EXPIRE_HOURS: i64 = 24;

/// Default environment type
pub const DEFAULT_ENVIRONMENT_TYPE: &str = "osquery";

// ============================================================================
// Carver
// ============================================================================

/// Carve block size advertised to agents through the flags file
pub const DEFAULT_CARVER_BLOCK_SIZE: u64 = 5_120_000;

/// Magic bytes that mark a zstd-compressed carve archive
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Lifetime of pre-signed download links (seconds)
pub const PRESIGNED_URL_EXPIRY_SECS: u64 = 300;

// ============================================================================
// Settings Services
// ============================================================================

/// Settings service for the node-facing protocol
pub const SERVICE_TLS: &str = "tls";

/// Settings service for log dispatch
pub const SERVICE_LOGGING: &str = "logging";

/// Settings key toggling verbose request logging
pub const SETTING_DEBUG_HTTP: &str = "debug_http";
