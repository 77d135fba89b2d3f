//! Protocol and configuration constants for mqtt-shell.

use std::time::Duration;

// =============================================================================
// Broker Topics
// =============================================================================

/// Topic prefix for all shell session traffic.
pub const TOPIC_PREFIX: &str = "/mqtt-shell/";

/// Well-known beacon discovery request topic.
pub const BEACON_REQUEST_TOPIC: &str = "/mqtt-shell/whoami";

/// Wildcard subscription matching every node's beacon topic.
pub const BEACON_RESPONSE_WILDCARD: &str = "/mqtt-shell/+/event";

/// Control topic a server receives on (clients transmit here).
pub fn control_topic(node_id: &str) -> String {
    format!("{TOPIC_PREFIX}{node_id}/cmd")
}

/// Control topic a server replies on (clients receive here).
pub fn control_reply_topic(node_id: &str) -> String {
    format!("{TOPIC_PREFIX}{node_id}/cmd/res")
}

/// Per-node beacon advertisement topic.
pub fn beacon_topic(node_id: &str) -> String {
    format!("{TOPIC_PREFIX}{node_id}/event")
}

/// MFT control topic a copy server receives on.
pub fn cp_topic(node_id: &str) -> String {
    format!("/mqtt-cp/{node_id}/cmd")
}

/// MFT control topic a copy server replies on.
pub fn cp_reply_topic(node_id: &str) -> String {
    format!("/mqtt-cp/{node_id}/cmd/res")
}

/// Per-transfer MFT data topic.
pub fn mft_data_topic(client_uuid: &str, transfer_uuid: &str) -> String {
    format!("/mft/{client_uuid}/{transfer_uuid}")
}

// =============================================================================
// Broker Adapter
// =============================================================================

/// Prefix of the random broker client id.
pub const CLIENT_ID_PREFIX: &str = "mqtt-shell-";

/// Length of the random suffix of the broker client id.
pub const CLIENT_ID_SUFFIX_LEN: usize = 14;

/// Default MQTT broker port.
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Interval of the re-dial loop while the first connect has not succeeded.
pub const REDIAL_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound for the reconnect delay after a lost connection.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(45);

// =============================================================================
// Session Layer
// =============================================================================

/// Default timeout for a single shell command execution.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Client keep-alive ping period.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between `whoami` attempts during the client handshake.
pub const HANDSHAKE_RETRY: Duration = Duration::from_secs(5);

/// How long the client completer waits for autocomplete options.
pub const AUTOCOMPLETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time after which a server-side client state is collected.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);

/// Period of the server inactivity collector.
pub const INACTIVITY_SWEEP: Duration = Duration::from_secs(60);

/// Capacity of the server output channel.
pub const OUTPUT_CHANNEL_SIZE: usize = 1000;

/// Maximum number of autocomplete options in a reply.
pub const MAX_AUTOCOMPLETE_OPTIONS: usize = 90;

/// Beacon scan duration.
pub const BEACON_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Bridge Plugins
// =============================================================================

/// Idle time after which a bridge connection is closed.
pub const BRIDGE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Period of the bridge idle collector.
pub const BRIDGE_SWEEP: Duration = Duration::from_secs(10);

/// Silence window after which the bridge flush buffer is drained.
pub const BRIDGE_FLUSH_WINDOW: Duration = Duration::from_millis(250);

/// Fixed size of the bridge flush buffer.
pub const BRIDGE_FLUSH_BUFFER: usize = 512;

// =============================================================================
// MFT
// =============================================================================

/// Pacing delay between two MFT frames.
pub const MFT_FRAME_DELAY: Duration = Duration::from_millis(50);

/// Maximum gap between two MFT frames before the transfer aborts.
pub const MFT_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for each MFT handshake step.
pub const MFT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for the final `end` verdict after transmission.
pub const MFT_END_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum concurrent transfers accepted by the copy server.
pub const MFT_MAX_TRANSFERS: usize = 5;

/// Lifetime of a stale transfer registry entry.
pub const MFT_TRANSFER_TTL: Duration = Duration::from_secs(3600);

/// Period of the copy server registry sweep.
pub const MFT_TRANSFER_SWEEP: Duration = Duration::from_secs(600);

// =============================================================================
// Client Shell
// =============================================================================

/// Default readline history file.
pub const HISTORY_FILE: &str = "/tmp/mqttchat_history.txt";

/// Default readline history cap.
pub const HISTORY_SIZE: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_embed_node_id() {
        assert_eq!(control_topic("n1"), "/mqtt-shell/n1/cmd");
        assert_eq!(control_reply_topic("n1"), "/mqtt-shell/n1/cmd/res");
        assert_eq!(beacon_topic("n1"), "/mqtt-shell/n1/event");
        assert_eq!(cp_topic("n1"), "/mqtt-cp/n1/cmd");
        assert_eq!(cp_reply_topic("n1"), "/mqtt-cp/n1/cmd/res");
        assert_eq!(mft_data_topic("c1", "t1"), "/mft/c1/t1");
    }

    #[test]
    fn beacon_wildcard_shares_prefix() {
        assert!(BEACON_RESPONSE_WILDCARD.starts_with(TOPIC_PREFIX));
        assert!(BEACON_REQUEST_TOPIC.starts_with(TOPIC_PREFIX));
    }

    #[test]
    fn timing_constants_are_ordered() {
        assert!(BRIDGE_SWEEP < BRIDGE_IDLE_TIMEOUT);
        assert!(INACTIVITY_SWEEP < INACTIVITY_TIMEOUT);
        assert!(MFT_FRAME_DELAY < MFT_FRAME_TIMEOUT);
        assert!(MFT_HANDSHAKE_TIMEOUT < MFT_END_TIMEOUT);
    }
}
