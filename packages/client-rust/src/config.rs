use std::time::Duration;

/// Per-client call defaults.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Routing hint sent with every request.
    pub window_id: Option<String>,
    /// Ask the host to omit mutation payloads; the cache then relies on
    /// [`HostClient::sync`](crate::HostClient::sync) or a mutation feed.
    pub compact_mode: bool,
    /// Fail calls that see no response in time. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}
