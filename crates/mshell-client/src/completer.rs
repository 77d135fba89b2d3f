//! Remote completion and prompt colouring for the line editor.
//!
//! On Tab the completer ships the last word of the line to the server,
//! waits briefly on a per-request channel and turns the returned options
//! (extensions beyond the typed prefix) into editor candidates.

use std::borrow::Cow;
use std::sync::mpsc::Receiver;
use std::sync::Mutex;

use rustyline::completion::Completer;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};
use tokio::sync::mpsc::UnboundedSender;

use mshell_core::constants::AUTOCOMPLETE_TIMEOUT;

/// Start of the last whitespace-separated word in `line`.
fn last_word_start(line: &str) -> usize {
    line.rfind(char::is_whitespace).map(|i| i + 1).unwrap_or(0)
}

/// Longest prefix shared by every option with the first one.
fn common_prefix(options: &[&str]) -> String {
    let Some(first) = options.first() else {
        return String::new();
    };
    let mut len = first.len();
    for option in &options[1..] {
        len = len.min(
            first
                .bytes()
                .zip(option.bytes())
                .take_while(|(a, b)| a == b)
                .count(),
        );
    }
    first[..len].to_string()
}

/// rustyline helper: remote completion plus optional red prompt.
pub struct RemoteHelper {
    request_tx: UnboundedSender<String>,
    options_rx: Mutex<Receiver<String>>,
    color_prompt: bool,
}

impl RemoteHelper {
    pub fn new(
        request_tx: UnboundedSender<String>,
        options_rx: Receiver<String>,
        color_prompt: bool,
    ) -> Self {
        RemoteHelper {
            request_tx,
            options_rx: Mutex::new(options_rx),
            color_prompt,
        }
    }

    fn fetch_options(&self, word: &str) -> Option<String> {
        let rx = self.options_rx.lock().unwrap();
        // Drain options of an earlier request that timed out.
        while rx.try_recv().is_ok() {}
        self.request_tx.send(word.to_string()).ok()?;
        rx.recv_timeout(AUTOCOMPLETE_TIMEOUT).ok()
    }
}

impl Completer for RemoteHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let start = last_word_start(&line[..pos]);
        let word = &line[start..pos];

        let Some(reply) = self.fetch_options(word) else {
            return Ok((start, Vec::new()));
        };
        let options: Vec<&str> = reply
            .split('\n')
            .filter(|o| !o.is_empty() && *o != "...")
            .collect();
        if options.is_empty() {
            return Ok((start, Vec::new()));
        }

        if options.len() == 1 {
            return Ok((start, vec![format!("{word}{}", options[0])]));
        }

        let extension = common_prefix(&options);
        if extension.is_empty() {
            // Nothing shared: surface every full candidate.
            return Ok((
                start,
                options.iter().map(|o| format!("{word}{o}")).collect(),
            ));
        }
        Ok((start, vec![format!("{word}{extension}")]))
    }
}

impl Hinter for RemoteHelper {
    type Hint = String;
}

impl Highlighter for RemoteHelper {
    fn highlight_prompt<'b, 's: 'b, 'p: 'b>(
        &'s self,
        prompt: &'p str,
        _default: bool,
    ) -> Cow<'b, str> {
        if self.color_prompt {
            Cow::Owned(format!("\x1b[1;31m{prompt}\x1b[0m"))
        } else {
            Cow::Borrowed(prompt)
        }
    }
}

impl Validator for RemoteHelper {}

impl Helper for RemoteHelper {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_word_of_command_line() {
        assert_eq!(last_word_start("cat /tm"), 4);
        assert_eq!(last_word_start("ls"), 0);
        assert_eq!(last_word_start(""), 0);
    }

    #[test]
    fn common_prefix_of_options() {
        assert_eq!(common_prefix(&["cs/", "cuments/"]), "c");
        assert_eq!(common_prefix(&["abc"]), "abc");
        assert_eq!(common_prefix(&["x", "y"]), "");
        assert_eq!(common_prefix(&[]), "");
    }

    #[test]
    fn single_option_completes_fully() {
        let (req_tx, _req_rx) = tokio::sync::mpsc::unbounded_channel();
        let (opt_tx, opt_rx) = std::sync::mpsc::sync_channel(4);
        let helper = RemoteHelper::new(req_tx, opt_rx, false);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let _ = opt_tx.send("tes.txt".to_string());
        });
        let (start, candidates) = helper
            .complete("cat no", 6, &Context::new(&rustyline::history::MemHistory::new()))
            .unwrap();
        assert_eq!(start, 4);
        assert_eq!(candidates, vec!["notes.txt".to_string()]);
    }

    #[test]
    fn multiple_options_insert_common_extension() {
        let (req_tx, _req_rx) = tokio::sync::mpsc::unbounded_channel();
        let (opt_tx, opt_rx) = std::sync::mpsc::sync_channel(4);
        let helper = RemoteHelper::new(req_tx, opt_rx, false);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let _ = opt_tx.send("cs/\ncuments/".to_string());
        });
        let (start, candidates) = helper
            .complete("do", 2, &Context::new(&rustyline::history::MemHistory::new()))
            .unwrap();
        assert_eq!(start, 0);
        assert_eq!(candidates, vec!["doc".to_string()]);
    }
}
