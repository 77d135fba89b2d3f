//! Plugin framework: per-client interceptors for shell traffic.
//!
//! A client selects at most one plugin at a time with `plugin <id> on`;
//! while active, every non-config line bypasses the shell executor and is
//! handed to the plugin.

use std::sync::Arc;

use async_trait::async_trait;

use mshell_core::protocol::Envelope;

/// Keyword that starts every plugin configuration command.
pub const PLUGIN_CMD_PREFIX: &str = "plugin";

pub(crate) const PLUGIN_HELP: &str = "Plugin Help: \n \
plugin list -> show all plugins available \n \
plugin {pluginName} on -> start plugin \n \
plugin off -> stop current plugin";

/// A server-side dispatcher that, when active for a client, receives all of
/// that client's non-config shell traffic.
///
/// Plugins always live behind an `Arc`; `on_data` takes the owning handle
/// so implementations can hand the envelope off to their own tasks.
#[async_trait]
pub trait ShellPlugin: Send + Sync {
    /// Identifier used in `plugin <id> on`.
    fn plugin_id(&self) -> &str;

    /// Display name used for the prompt decoration.
    fn name(&self) -> &str;

    /// Handle one envelope from a client with this plugin active.
    async fn on_data(self: Arc<Self>, envelope: Envelope);
}

/// Parse a line into plugin-config arguments, if it is one.
pub(crate) fn parse_plugin_config(line: &str) -> Option<Vec<String>> {
    let rest = line.strip_prefix(PLUGIN_CMD_PREFIX)?;
    let args: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
    if args.is_empty() {
        return None;
    }
    Some(args)
}

/// Prompt decoration for an active plugin id.
pub(crate) fn plugin_prompt(plugin_id: &str) -> String {
    format!("<{plugin_id}>")
}
