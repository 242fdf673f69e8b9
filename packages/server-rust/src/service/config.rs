use crate::network::config::ConnectionConfig;

/// Host-level configuration for dispatch, sessions and log retention.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Maximum number of in-flight requests before load shedding.
    pub max_concurrent_requests: u32,
    /// Interval between log compaction runs in milliseconds.
    pub compaction_interval_ms: u64,
    pub retention: RetentionConfig,
    /// Per-session outbound channel settings.
    pub connection: ConnectionConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 1000,
            compaction_interval_ms: 60_000,
            retention: RetentionConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// How much of the mutation log the host keeps for catch-up.
///
/// The log always keeps at least `min_retained` entries and everything a
/// connected session has not yet acknowledged, up to `max_retained`
/// entries. Sessions lagging further behind catch up from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub min_retained: u64,
    pub max_retained: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_retained: 1024,
            max_retained: 65_536,
        }
    }
}
