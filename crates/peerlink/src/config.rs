//! Session settings.

use std::time::Duration;

/// How long a blocking call waits for its reply unless told otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Shadow count at which an imported handle flushes its references early.
///
/// Far below `u32::MAX`, and far above the count a handle reaches in normal use.
pub const DEFAULT_RELEASE_HIGH_WATER: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Used in log fields only.
    pub name: String,
    /// Deadline for blocking calls. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub release_high_water: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "peer".to_string(),
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            release_high_water: DEFAULT_RELEASE_HIGH_WATER,
        }
    }
}
