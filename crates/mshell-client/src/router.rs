//! Inbound envelope routing and prompt state for the client shell.
//!
//! Kept separate from the interactive loop so the routing rules are
//! directly testable: foreign client UUIDs are dropped without any state
//! change, pongs only stamp liveness, autocomplete replies feed the
//! completer channel and everything else renders to the terminal.

use std::sync::mpsc::SyncSender;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use mshell_core::protocol::{kind, Envelope};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct PromptState {
    current_path: String,
    custom_prompt: String,
}

/// Routes decoded envelopes into the client shell's channels.
pub struct ClientRouter {
    uuid: String,
    prompt: Mutex<PromptState>,
    last_server_activity: Mutex<Instant>,
    handshake_tx: Mutex<Option<oneshot::Sender<Envelope>>>,
    options_tx: Mutex<Option<SyncSender<String>>>,
    print_tx: mpsc::UnboundedSender<String>,
}

impl ClientRouter {
    pub fn new(uuid: impl Into<String>, print_tx: mpsc::UnboundedSender<String>) -> Self {
        ClientRouter {
            uuid: uuid.into(),
            prompt: Mutex::new(PromptState::default()),
            last_server_activity: Mutex::new(Instant::now()),
            handshake_tx: Mutex::new(None),
            options_tx: Mutex::new(None),
            print_tx,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Arm the one-shot handshake completion. A second reply arriving after
    /// completion is routed normally instead of blocking anyone.
    pub fn arm_handshake(&self) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        *self.handshake_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Wire the autocomplete reply channel consumed by the completer.
    pub fn set_options_sender(&self, tx: SyncSender<String>) {
        *self.options_tx.lock().unwrap() = Some(tx);
    }

    pub fn last_server_activity(&self) -> Instant {
        *self.last_server_activity.lock().unwrap()
    }

    /// Prompt string: `<currentPath> <customPrompt-or-">"> `.
    pub fn prompt(&self) -> String {
        let state = self.prompt.lock().unwrap();
        let marker = if state.custom_prompt.is_empty() {
            ">"
        } else {
            state.custom_prompt.as_str()
        };
        if state.current_path.is_empty() {
            format!("{marker} ")
        } else {
            format!("{} {marker} ", state.current_path)
        }
    }

    /// Route one inbound envelope.
    pub fn route(&self, envelope: Envelope) {
        if envelope.client_uuid != self.uuid {
            // Traffic for another client session on the same topics.
            return;
        }
        if envelope.cmd.is_empty() || envelope.cmd_uuid.is_empty() {
            debug!("dropping envelope with missing essential fields");
            return;
        }

        *self.last_server_activity.lock().unwrap() = Instant::now();

        if envelope.cmd == kind::PONG {
            return;
        }

        if envelope.data.is_empty() {
            return;
        }

        if let Some(tx) = self.handshake_tx.lock().unwrap().take() {
            self.update_prompt(&envelope);
            let _ = tx.send(envelope);
            return;
        }

        if envelope.cmd == kind::AUTOCOMPLETE {
            self.update_prompt(&envelope);
            let guard = self.options_tx.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let _ = tx.try_send(envelope.data);
            }
            return;
        }

        self.update_prompt(&envelope);
        let text = envelope.data.trim_end_matches('\n');
        let _ = self.print_tx.send(format!("{text}\n"));
    }

    fn update_prompt(&self, envelope: &Envelope) {
        let mut state = self.prompt.lock().unwrap();
        state.current_path = envelope.current_path.clone();
        state.custom_prompt = envelope.custom_prompt.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> (ClientRouter, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientRouter::new("C1", tx), rx)
    }

    fn envelope(client_uuid: &str, data: &str) -> Envelope {
        Envelope {
            cmd: kind::SHELL.into(),
            cmd_uuid: "U1".into(),
            client_uuid: client_uuid.into(),
            data: data.into(),
            current_path: "/tmp".into(),
            ..Default::default()
        }
    }

    #[test]
    fn foreign_client_uuid_changes_nothing() {
        let (router, mut rx) = router();
        let before = router.prompt();
        router.route(envelope("someone-else", "output"));
        assert_eq!(router.prompt(), before);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shell_output_is_printed_and_prompt_updated() {
        let (router, mut rx) = router();
        router.route(envelope("C1", "hello\n"));
        assert_eq!(rx.try_recv().unwrap(), "hello\n");
        assert_eq!(router.prompt(), "/tmp > ");
    }

    #[test]
    fn custom_prompt_overrides_marker() {
        let (router, _rx) = router();
        let mut env = envelope("C1", "out");
        env.custom_prompt = "<ssh>".into();
        router.route(env);
        assert_eq!(router.prompt(), "/tmp <ssh> ");
    }

    #[test]
    fn pong_stamps_liveness_without_output() {
        let (router, mut rx) = router();
        let before = router.last_server_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut env = envelope("C1", "");
        env.cmd = kind::PONG.into();
        router.route(env);
        assert!(router.last_server_activity() > before);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handshake_completes_once_without_deadlock() {
        let (router, mut rx) = router();
        let mut wait = router.arm_handshake();
        router.route(envelope("C1", "first"));
        assert!(wait.try_recv().is_ok());
        // A duplicate reply is rendered normally, nothing blocks.
        router.route(envelope("C1", "second"));
        assert_eq!(rx.try_recv().unwrap(), "second\n");
    }

    #[test]
    fn autocomplete_reply_feeds_completer_channel() {
        let (router, mut print_rx) = router();
        let (tx, options_rx) = std::sync::mpsc::sync_channel(4);
        router.set_options_sender(tx);
        let mut env = envelope("C1", "cs/\nwnloads/");
        env.cmd = kind::AUTOCOMPLETE.into();
        router.route(env);
        assert_eq!(options_rx.try_recv().unwrap(), "cs/\nwnloads/");
        assert!(print_rx.try_recv().is_err());
    }
}
