use std::time::Duration;

/// What to do when a portal's event queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the event and log an error. Keeps other portals live when one
    /// portal falls behind.
    Drop,
    /// Block the producer until the queue drains. Keeps every event at the
    /// cost of stalling whatever fans events out across portals.
    Block,
}

/// Runtime configuration of the bridge core.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Identifier of this bridge instance, used as the state key of bridge
    /// info events.
    pub bridge_id: String,
    /// Identifier of the bridged network, shown in bridge info.
    pub network_id: String,
    /// Display name of the bridged network.
    pub network_name: String,
    /// Capacity of each portal's event queue.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Cadence at which still-typing users are re-signalled to networks that
    /// require continuous typing notifications.
    pub typing_refresh_interval: Duration,
    /// Deadline for a single event handler. `None` disables the deadline.
    pub event_timeout: Option<Duration>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_id: "passerelle".to_string(),
            network_id: "passerelle".to_string(),
            network_name: "Passerelle".to_string(),
            queue_capacity: 64,
            overflow: OverflowPolicy::Drop,
            typing_refresh_interval: Duration::from_secs(5),
            event_timeout: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("PASSERELLE_BRIDGE_ID") {
            if !id.is_empty() {
                config.bridge_id = id;
            }
        }

        if let Ok(id) = std::env::var("PASSERELLE_NETWORK_ID") {
            if !id.is_empty() {
                config.network_id = id;
            }
        }

        if let Ok(name) = std::env::var("PASSERELLE_NETWORK_NAME") {
            if !name.is_empty() {
                config.network_name = name;
            }
        }

        if let Ok(val) = std::env::var("PASSERELLE_QUEUE_CAPACITY") {
            if let Ok(n) = val.parse::<usize>() {
                if n > 0 {
                    config.queue_capacity = n;
                }
            }
        }

        if let Ok(val) = std::env::var("PASSERELLE_QUEUE_OVERFLOW") {
            match val.as_str() {
                "drop" => config.overflow = OverflowPolicy::Drop,
                "block" => config.overflow = OverflowPolicy::Block,
                other => {
                    tracing::warn!(value = %other, "Invalid PASSERELLE_QUEUE_OVERFLOW, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("PASSERELLE_TYPING_REFRESH_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 {
                    config.typing_refresh_interval = Duration::from_secs(secs);
                }
            }
        }

        if let Ok(val) = std::env::var("PASSERELLE_EVENT_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.event_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        config
    }
}
