//! Database configuration.

use std::time::Duration;

/// Tunables for a database instance.
///
/// The defaults match the documented engine behavior; construct with
/// [`DatabaseConfig::default`] and override through the `with_*` builders.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Maximum serialized size, in bytes, for a child value to be stored
    /// inside its parent's record instead of a dedicated record. Raise it
    /// when the backend's per-record overhead is large; lower it when random
    /// access to small children dominates.
    pub max_inline_value_size: usize,
    /// Silently drop null properties from full set payloads instead of
    /// rejecting the write.
    pub remove_void_properties: bool,
    /// How long a granted lock may be held before it is forcibly removed.
    pub lock_timeout: Duration,
    /// Block writes until straddled indexes have processed the mutation.
    /// When disabled, index updates run detached.
    pub wait_for_index_updates: bool,
    /// Bound of each subscriber's event queue.
    pub event_queue_capacity: usize,
    /// Debug mode: much longer lock timeout for stepping through with a
    /// debugger attached.
    pub debug: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_inline_value_size: 50,
            remove_void_properties: false,
            lock_timeout: Duration::from_secs(90),
            wait_for_index_updates: true,
            event_queue_capacity: 64,
            debug: false,
        }
    }
}

impl DatabaseConfig {
    /// Sets the inline/dedicated threshold.
    pub fn with_max_inline_value_size(mut self, size: usize) -> Self {
        self.max_inline_value_size = size;
        self
    }

    /// Enables or disables dropping of null properties in set payloads.
    pub fn with_remove_void_properties(mut self, remove: bool) -> Self {
        self.remove_void_properties = remove;
        self
    }

    /// Overrides the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Controls whether writes wait for index updates.
    pub fn with_wait_for_index_updates(mut self, wait: bool) -> Self {
        self.wait_for_index_updates = wait;
        self
    }

    /// Overrides the per-subscriber event queue bound.
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Enables debug mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The lock timeout in effect: 15 minutes in debug mode, the configured
    /// timeout otherwise.
    pub fn effective_lock_timeout(&self) -> Duration {
        if self.debug {
            Duration::from_secs(15 * 60)
        } else {
            self.lock_timeout
        }
    }
}
