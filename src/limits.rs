//! Timing defaults shared across the device layer and the engine.
//!
//! Every value here is a default; the matching setting in
//! [`LabConfig`](crate::config::LabConfig) overrides it at runtime.

use std::time::Duration;

/// Maximum time to acquire a transport in `ConnectionManager::open`.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for a single request/response exchange on a line transport.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// First delay between reconnect attempts.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Upper bound on the reconnect backoff delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Reconnect attempts before giving up with `ReconnectExhausted`.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Step timeout applied when a step does not declare one.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Time granted to in-flight steps to observe cancellation before they are
/// force-aborted.
pub const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for a single safe-idle command during cleanup.
pub const SAFE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Polling period of `wait_stable` when the step does not set one.
pub const STABILITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// First delay of `RetryThenAbort` backoff when the method does not set one.
pub const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Largest volume a single aspirate or dispense may request (1 L).
pub const MAX_TRANSFER_VOLUME_UL: f64 = 1_000_000.0;

/// Number of finished run reports kept by the engine.
pub const RUN_HISTORY_CAPACITY: usize = 64;
