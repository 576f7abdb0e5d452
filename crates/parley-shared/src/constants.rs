/// Application name
pub const APP_NAME: &str = "Parley";

/// Sender-side typing inactivity grace before `stop-typing` is emitted
pub const TYPING_DEBOUNCE_MS: u64 = 500;

/// Delay before an automatic ICE-restart retry after a connection failure
pub const CALL_RETRY_DELAY_SECS: u64 = 3;

/// Maximum number of automatic ICE-restart retries per call
pub const CALL_MAX_RETRIES: u32 = 3;

/// Capacity of the socket command / notification channels
pub const SOCKET_CHANNEL_CAPACITY: usize = 256;

/// ICE candidate pool size requested from the WebRTC stack
pub const ICE_CANDIDATE_POOL_SIZE: u8 = 10;
