// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const WS_PATH: &str = "ws";

// Session pump constants
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

// Separator between envelopes coalesced into one outbound frame
pub const BATCH_DELIMITER: char = '\n';
