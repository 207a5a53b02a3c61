//! Operator shell surface (§6, SPEC_FULL.md §B): line editing, whitespace tokenization, and
//! command dispatch for the core commands named in §6 (`prov_scan`, `prov_conn`, `prov_invite`,
//! `prov_cap`, `prov_start`, `prov_set_pub_key`, `prov_pub_key`, `prov_set_auth`, `prov_cfm`,
//! `prov_random`, `help`, `reboot`, `shutdown`, `ls`, `nr`).
//!
//! Grounded in `common/meshx_cmd.c`/`meshx_cmd.h`: a bounded line buffer with backspace and
//! cursor-left/cursor-right editing, a 3-slot command history ring, and a linear dispatch table
//! matched by name. The actual TTY (reading raw bytes, writing the echoed prompt) is external to
//! this crate (§1); this module owns the editing state machine, the tokenizer, and the dispatch
//! table, so the core only ever hands a collaborator parsed, validated arguments, matching "core
//! functions are called with parsed, validated arguments" (§6).

use heapless::consts::{U160, U20, U3};
use heapless::{String, Vec};

use crate::error::Error;

/// Matches `MESHX_CMD_MAX_LEN` (160): the longest line the editor will accept.
pub type LineCapacity = U160;
/// Matches `MESHX_CMD_MAX_HISTORY_SIZE` (3).
pub type HistoryCapacity = U3;
/// Matches `MESHX_CMD_MAX_PARAMETERS` (20): the most whitespace-separated tokens one line yields.
pub type MaxTokens = U20;

/// One edit event fed to a [`LineEditor`]. A platform's TTY driver turns raw bytes into these
/// (the original used raw control characters; this crate leaves that mapping to the caller since
/// terminal conventions vary by platform).
/// `Key::Char` is assumed ASCII, matching the original's byte-oriented TTY protocol; the cursor is
/// tracked as a byte offset, which only stays a valid `str` boundary under that assumption.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Backspace,
    CursorLeft,
    CursorRight,
    HistoryPrev,
    HistoryNext,
    Enter,
}

/// What the caller should do in response to a [`LineEditor::feed`] call: an echo instruction for
/// the (external) TTY, or a completed, tokenizable line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditEvent<'a> {
    /// Echo this character at the cursor.
    Echo(char),
    /// Move the terminal cursor one column left (backspace without deleting past the start).
    MoveCursorLeft,
    /// Move the terminal cursor one column right.
    MoveCursorRight,
    /// Clear `count` characters backward from the cursor (used by backspace and history replace).
    ClearBack(u8),
    /// Redraw the line from `text` after a history recall.
    Redraw(&'a str),
    /// The line was submitted (Enter on a non-empty buffer). Carries the finished line.
    Submitted(&'a str),
    /// Enter on an empty buffer: nothing to submit, just start a fresh prompt line.
    Blank,
    /// The key had no effect in the current state (e.g. cursor-left at column 0).
    Noop,
}

/// A bounded, backspace/cursor/history-editable command line, grounded in
/// `meshx_user_cmd_info_t`.
pub struct LineEditor {
    buf: String<LineCapacity>,
    cursor: usize,
    history: Vec<String<LineCapacity>, HistoryCapacity>,
    traverse: Option<usize>,
    saved: String<LineCapacity>,
}

impl LineEditor {
    pub fn new() -> Self {
        LineEditor {
            buf: String::new(),
            cursor: 0,
            history: Vec::new(),
            traverse: None,
            saved: String::new(),
        }
    }

    /// The line as typed so far, cursor position included conceptually (not represented in the
    /// returned slice).
    pub fn current(&self) -> &str {
        &self.buf
    }

    fn push_history(&mut self) {
        if self.history.len() == self.history.capacity() {
            // Evict the oldest (FIFO) entry by shifting the rest down one slot, then popping the
            // now-duplicated tail. Avoids depending on a `Vec::remove` that shifts in place.
            for i in 1..self.history.len() {
                self.history[i - 1] = self.history[i].clone();
            }
            self.history.pop();
        }
        let _ = self.history.push(self.buf.clone());
    }

    /// Feeds one edit event, mutating the buffer and returning the effect the caller's TTY driver
    /// should apply.
    pub fn feed(&mut self, key: Key) -> EditEvent<'_> {
        match key {
            Key::Char(c) => {
                if self.buf.len() >= self.buf.capacity() {
                    return EditEvent::Noop;
                }
                // Insertion only ever happens at the end in this editor, matching the original's
                // "move forward" shuffle being reserved for backspace.
                if self.cursor == self.buf.len() {
                    if self.buf.push(c).is_err() {
                        return EditEvent::Noop;
                    }
                } else {
                    let mut rebuilt: String<LineCapacity> = String::new();
                    let _ = rebuilt.push_str(&self.buf[..self.cursor]);
                    let _ = rebuilt.push(c);
                    let _ = rebuilt.push_str(&self.buf[self.cursor..]);
                    self.buf = rebuilt;
                }
                self.cursor += 1;
                EditEvent::Echo(c)
            }
            Key::Backspace => {
                if self.cursor == 0 {
                    return EditEvent::Noop;
                }
                let mut rebuilt: String<LineCapacity> = String::new();
                let _ = rebuilt.push_str(&self.buf[..self.cursor - 1]);
                let _ = rebuilt.push_str(&self.buf[self.cursor..]);
                self.buf = rebuilt;
                self.cursor -= 1;
                EditEvent::ClearBack(1)
            }
            Key::CursorLeft => {
                if self.cursor == 0 {
                    return EditEvent::Noop;
                }
                self.cursor -= 1;
                EditEvent::MoveCursorLeft
            }
            Key::CursorRight => {
                if self.cursor >= self.buf.len() {
                    return EditEvent::Noop;
                }
                self.cursor += 1;
                EditEvent::MoveCursorRight
            }
            Key::HistoryPrev => self.recall(Direction::Prev),
            Key::HistoryNext => self.recall(Direction::Next),
            Key::Enter => {
                if self.buf.is_empty() {
                    return EditEvent::Blank;
                }
                self.push_history();
                self.traverse = None;
                EditEvent::Submitted(&self.history[self.history.len() - 1])
            }
        }
    }

    fn recall(&mut self, dir: Direction) -> EditEvent<'_> {
        if self.history.is_empty() {
            return EditEvent::Noop;
        }
        let next_index = match (self.traverse, dir) {
            (None, Direction::Prev) => {
                self.saved = self.buf.clone();
                Some(self.history.len() - 1)
            }
            (None, Direction::Next) => return EditEvent::Noop,
            (Some(i), Direction::Prev) => {
                if i == 0 {
                    return EditEvent::Noop;
                }
                Some(i - 1)
            }
            (Some(i), Direction::Next) => {
                if i + 1 >= self.history.len() {
                    self.traverse = None;
                    self.buf = self.saved.clone();
                    self.cursor = self.buf.len();
                    return EditEvent::Redraw(&self.buf);
                }
                Some(i + 1)
            }
        };
        self.traverse = next_index;
        self.buf = self.history[next_index.unwrap()].clone();
        self.cursor = self.buf.len();
        EditEvent::Redraw(&self.buf)
    }

    /// Resets the buffer for a new line, keeping history intact. Called once a submitted line has
    /// been parsed and dispatched.
    pub fn reset_line(&mut self) {
        self.buf.clear();
        self.cursor = 0;
    }
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction {
    Prev,
    Next,
}

/// A parsed command line: the command name plus its whitespace-separated arguments.
pub struct ParsedLine<'a> {
    pub cmd: &'a str,
    pub args: Vec<&'a str, MaxTokens>,
}

/// Splits a line into a command name and up to [`MaxTokens`] whitespace-separated arguments,
/// matching `meshx_cmd_parse`'s skip-space/find-word-end loop. Returns `None` for a line that is
/// empty or all whitespace.
pub fn parse_line(line: &str) -> Option<ParsedLine<'_>> {
    let mut tokens = line.split_whitespace();
    let cmd = tokens.next()?;
    let mut args = Vec::new();
    for tok in tokens {
        // Excess tokens past MaxTokens are silently dropped, matching the original's fixed-size
        // param_val/param_ptr arrays.
        if args.push(tok).is_err() {
            break;
        }
    }
    Some(ParsedLine { cmd, args })
}

/// Static metadata for one shell command, grounded in `meshx_cmd_t` (`pcmd`/`pusage`/`phelp`).
#[derive(Debug, Copy, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub usage: &'static str,
    pub help: &'static str,
}

/// The core commands named in spec.md §6, used to back `help [cmd|*]` and to validate that a
/// typed command name is one this crate recognizes before handing it to a [`Dispatch`].
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        usage: "help [cmd|*]",
        help: "list command usage and help; '*' lists every command",
    },
    CommandSpec {
        name: "reboot",
        usage: "reboot",
        help: "reboot the node",
    },
    CommandSpec {
        name: "shutdown",
        usage: "shutdown",
        help: "shut the node down",
    },
    CommandSpec {
        name: "ls",
        usage: "ls",
        help: "list node state (address, role, keys)",
    },
    CommandSpec {
        name: "nr",
        usage: "nr",
        help: "node reset: clear keys and return to the unprovisioned state",
    },
    CommandSpec {
        name: "prov_scan",
        usage: "prov_scan",
        help: "start scanning for unprovisioned device beacons",
    },
    CommandSpec {
        name: "prov_conn",
        usage: "prov_conn <uuid-hex>",
        help: "open a PB-ADV link to the device with the given UUID",
    },
    CommandSpec {
        name: "prov_invite",
        usage: "prov_invite <id> <attention>",
        help: "send the provisioning Invite PDU",
    },
    CommandSpec {
        name: "prov_cap",
        usage: "prov_cap",
        help: "record/announce provisioning capabilities",
    },
    CommandSpec {
        name: "prov_start",
        usage: "prov_start",
        help: "announce the provisioning authentication method",
    },
    CommandSpec {
        name: "prov_set_pub_key",
        usage: "prov_set_pub_key",
        help: "generate and send this side's ECDH public key",
    },
    CommandSpec {
        name: "prov_pub_key",
        usage: "prov_pub_key",
        help: "record the peer's ECDH public key and derive the shared secret",
    },
    CommandSpec {
        name: "prov_set_auth",
        usage: "prov_set_auth",
        help: "record the out-of-band authentication value",
    },
    CommandSpec {
        name: "prov_cfm",
        usage: "prov_cfm",
        help: "compute and send this side's confirmation value",
    },
    CommandSpec {
        name: "prov_random",
        usage: "prov_random",
        help: "send this side's random and verify the peer's confirmation",
    },
];

/// Looks up a command by name, as `help <cmd>` does.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Implemented by whatever owns the [`crate::node::Node`] (or equivalent) that a parsed command
/// should act on. The shell never touches `Node` directly — it only tokenizes and dispatches.
pub trait Dispatch {
    fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<(), Error>;
}

/// Formats a failed command's error the way the shell prints it: `execute command failed:
/// <code-string>` (§7).
pub fn format_error(buf: &mut String<U160>, err: Error) -> Result<(), Error> {
    buf.clear();
    buf.push_str("execute command failed: ")
        .map_err(|_| Error::Length)?;
    buf.push_str(err.code_str()).map_err(|_| Error::Length)
}

/// Feeds one submitted line through the tokenizer and a [`Dispatch`], returning its result.
/// Returns `Err(Error::NotFound)` for an unrecognized command name, matching the original's
/// `-MESHX_ERR_NOT_FOUND` default before the dispatch loop runs.
pub fn run_line<D: Dispatch>(dispatch: &mut D, line: &str) -> Result<(), Error> {
    let parsed = parse_line(line).ok_or(Error::Inval)?;
    if lookup(parsed.cmd).is_none() {
        return Err(Error::NotFound);
    }
    dispatch.execute(parsed.cmd, &parsed.args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_whitespace_separated_args() {
        let parsed = parse_line("prov_invite 1 5").unwrap();
        assert_eq!(parsed.cmd, "prov_invite");
        assert_eq!(&parsed.args[..], &["1", "5"][..]);
    }

    #[test]
    fn blank_line_has_no_command() {
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn editor_backspace_removes_last_char() {
        let mut editor = LineEditor::new();
        assert_eq!(editor.feed(Key::Char('l')), EditEvent::Echo('l'));
        assert_eq!(editor.feed(Key::Char('s')), EditEvent::Echo('s'));
        assert_eq!(editor.feed(Key::Backspace), EditEvent::ClearBack(1));
        assert_eq!(editor.current(), "l");
    }

    #[test]
    fn editor_cursor_left_at_start_is_noop() {
        let mut editor = LineEditor::new();
        assert_eq!(editor.feed(Key::CursorLeft), EditEvent::Noop);
    }

    #[test]
    fn editor_submits_and_records_history() {
        let mut editor = LineEditor::new();
        editor.feed(Key::Char('l'));
        editor.feed(Key::Char('s'));
        match editor.feed(Key::Enter) {
            EditEvent::Submitted(line) => assert_eq!(line, "ls"),
            other => panic!("unexpected {:?}", other),
        }
        editor.reset_line();
        assert_eq!(editor.current(), "");
    }

    #[test]
    fn history_ring_keeps_only_three_slots() {
        let mut editor = LineEditor::new();
        for cmd in &["ls", "help", "nr", "prov_scan"] {
            for c in cmd.chars() {
                editor.feed(Key::Char(c));
            }
            editor.feed(Key::Enter);
            editor.reset_line();
        }
        assert_eq!(editor.history.len(), 3);
        assert_eq!(editor.history[0].as_str(), "help");
        assert_eq!(editor.history[2].as_str(), "prov_scan");
    }

    #[test]
    fn history_prev_then_next_restores_in_progress_line() {
        let mut editor = LineEditor::new();
        for c in "ls".chars() {
            editor.feed(Key::Char(c));
        }
        editor.feed(Key::Enter);
        editor.reset_line();

        editor.feed(Key::Char('n'));
        match editor.feed(Key::HistoryPrev) {
            EditEvent::Redraw(line) => assert_eq!(line, "ls"),
            other => panic!("unexpected {:?}", other),
        }
        match editor.feed(Key::HistoryNext) {
            EditEvent::Redraw(line) => assert_eq!(line, "n"),
            other => panic!("unexpected {:?}", other),
        }
    }

    struct RecordingDispatch {
        last: Option<(heapless::String<U160>, u8)>,
    }

    impl Dispatch for RecordingDispatch {
        fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<(), Error> {
            if cmd == "nr" {
                let mut s = heapless::String::new();
                let _ = s.push_str(cmd);
                self.last = Some((s, args.len() as u8));
                Ok(())
            } else {
                Err(Error::NotFound)
            }
        }
    }

    #[test]
    fn run_line_rejects_unknown_command() {
        let mut dispatch = RecordingDispatch { last: None };
        assert_eq!(run_line(&mut dispatch, "frobnicate"), Err(Error::NotFound));
    }

    #[test]
    fn run_line_dispatches_known_command() {
        let mut dispatch = RecordingDispatch { last: None };
        run_line(&mut dispatch, "nr").unwrap();
        assert_eq!(dispatch.last.unwrap().0.as_str(), "nr");
    }

    #[test]
    fn format_error_matches_shell_contract() {
        let mut buf: String<U160> = String::new();
        format_error(&mut buf, Error::Busy).unwrap();
        assert_eq!(buf.as_str(), "execute command failed: EBUSY");
    }
}
