//! Bridge plugins: proxy a client session to an outbound telnet or SSH
//! target, streaming the remote byte traffic back through the broker.

pub mod ssh;
pub mod telnet;

pub use ssh::SshBridge;
pub use telnet::TelnetBridge;

/// Response when the global connection cap is hit.
pub(crate) const MAX_CONNECTIONS_MSG: &str = "max number of connection reached";

/// Prompt decoration for a bridge: `<keyword>` while idle,
/// `<keyword - host:port>` while connected.
pub(crate) fn bridge_prompt(keyword: &str, host: Option<&str>) -> String {
    match host {
        Some(host) => format!("<{keyword} - {host}>"),
        None => format!("<{keyword}>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_shapes() {
        assert_eq!(bridge_prompt("telnet", None), "<telnet>");
        assert_eq!(
            bridge_prompt("ssh", Some("10.0.0.1:22")),
            "<ssh - 10.0.0.1:22>"
        );
    }
}
