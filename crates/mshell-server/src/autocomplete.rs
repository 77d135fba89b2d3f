//! Server-side autocompletion over the client's working directory.
//!
//! Options are the *extensions* beyond the typed prefix, newline-joined,
//! capped at 90 entries. Directory names get a trailing `/`; the single
//! exact directory match collapses to just `"/"`.

use std::path::{Path, PathBuf};

use mshell_core::constants::MAX_AUTOCOMPLETE_OPTIONS;

/// Compute the autocomplete reply for `partial` typed in `cwd`.
pub fn options(partial: &str, cwd: &Path) -> String {
    if partial.is_empty() {
        return list_dir(cwd, "");
    }
    let (dir, prefix) = parse_input_path(partial, cwd);
    list_dir(&dir, &prefix)
}

/// Split the typed input into the directory to search and the name prefix
/// to match.
fn parse_input_path(partial: &str, cwd: &Path) -> (PathBuf, String) {
    let (dir, prefix) = split_token(partial, cwd);
    if dir.is_dir() {
        (dir, prefix)
    } else {
        (cwd.to_path_buf(), partial.to_string())
    }
}

fn split_token(partial: &str, cwd: &Path) -> (PathBuf, String) {
    if let Some(stripped) = partial.strip_prefix('/') {
        // Absolute path.
        if stripped.is_empty() || partial.ends_with('/') {
            return (PathBuf::from(partial), String::new());
        }
        let path = Path::new(partial);
        let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return (dir, prefix);
    }

    if let Some(idx) = partial.rfind('/') {
        // Relative path with directories.
        let dir = cwd.join(&partial[..idx]);
        return (dir, partial[idx + 1..].to_string());
    }

    if partial.contains(char::is_whitespace) {
        // Command with arguments: complete the last token.
        let last = partial.split_whitespace().last().unwrap_or("");
        return split_token(last, cwd);
    }

    (cwd.to_path_buf(), partial.to_string())
}

/// Entries of `dir` starting with `prefix`, prefix stripped, newline-joined.
fn list_dir(dir: &Path, prefix: &str) -> String {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return format!("Error reading directory: {e}"),
    };

    let mut names: Vec<(String, bool)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(prefix) {
                return None;
            }
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            Some((name, is_dir))
        })
        .collect();
    names.sort();

    let mut options = Vec::new();
    for (name, is_dir) in names {
        if is_dir {
            if name == prefix {
                return "/".to_string();
            }
            options.push(format!("{}/", &name[prefix.len()..]));
        } else {
            options.push(name[prefix.len()..].to_string());
        }
        if options.len() >= MAX_AUTOCOMPLETE_OPTIONS {
            options.push("...".to_string());
            break;
        }
    }

    options.join("\n")
}
