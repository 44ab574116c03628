//! Foreground process status tracking for a terminal.
//!
//! On every idle tick the terminal re-reads the foreground process group of
//! its pty, that process's attributes from /proc, and the terminal's termios
//! state. Changed keys accumulate in a map the terminal replicates to its
//! watches.

use std::collections::HashMap;
use std::os::fd::AsFd;

use crate::mux::reaper::WaitOutcome;
use crate::proto::attrs::{self, AttributeMap};

/// `proc.status` values.
pub const TERM_IDLE: u32 = 0;
pub const TERM_ACTIVE: u32 = 1;
pub const TERM_BUSY: u32 = 2;
pub const TERM_CLOSED: u32 = 3;

/// `profile.autoclose` settings.
pub const AUTOCLOSE_NEVER: u32 = 0;
pub const AUTOCLOSE_ALWAYS: u32 = 1;
pub const AUTOCLOSE_ON_SUCCESS: u32 = 2;

pub struct TermStatusTracker {
  environ: HashMap<String, String>,
  all: AttributeMap,
  changed: AttributeMap,
  status: u32,
  fg_pid: i32,
  outcome: Option<WaitOutcome>,
  outcome_str: String,
  termios_cache: String,
}

impl TermStatusTracker {
  /// Tracker with an owner-supplied environment for the child process.
  #[must_use]
  pub fn new(environ: HashMap<String, String>) -> Self {
    Self {
      environ,
      all: AttributeMap::new(),
      changed: AttributeMap::new(),
      status: TERM_CLOSED,
      fg_pid: 0,
      outcome: None,
      outcome_str: String::new(),
      termios_cache: String::new(),
    }
  }

  /// Tracker capturing this server's own environment.
  #[must_use]
  pub fn new_local() -> Self {
    Self::new(std::env::vars().collect())
  }

  #[must_use]
  pub fn environ(&self) -> &HashMap<String, String> {
    &self.environ
  }

  /// Replaces the child environment (ownership changes). Returns whether it
  /// differed.
  pub fn set_environ(&mut self, environ: HashMap<String, String>) -> bool {
    if environ == self.environ {
      return false;
    }
    self.environ = environ;
    true
  }

  /// Resets per-launch state before a fresh child starts.
  pub fn start(&mut self) {
    self.outcome = None;
    self.outcome_str.clear();
    self.status = TERM_CLOSED;
    self.fg_pid = 0;
    self.set(attrs::ATTR_PROC_STATUS, TERM_CLOSED.to_string());
  }

  fn set(&mut self, key: &str, value: String) {
    let stale = self.all.get(key).is_none_or(|old| *old != value);
    if stale {
      self.all.insert(key.to_string(), value.clone());
      self.changed.insert(key.to_string(), value);
    }
  }

  /// Takes the keys changed since the last call.
  #[must_use]
  pub fn changed_map(&mut self) -> AttributeMap {
    std::mem::take(&mut self.changed)
  }

  /// Re-probes the terminal. `fd` is the pty master (None once closed);
  /// `primary` is the immediate child pid. Returns whether anything changed.
  pub fn update(&mut self, fd: Option<&dyn AsFd>, primary: i32) -> bool {
    match fd {
      None => {
        self.status = TERM_CLOSED;
        self.fg_pid = primary;
        self.set(attrs::ATTR_PROC_STATUS, TERM_CLOSED.to_string());
      }
      Some(fd) => {
        let fg = nix::unistd::tcgetpgrp(fd.as_fd())
          .map(|pgrp| pgrp.as_raw())
          .unwrap_or(0);
        let status = if fg == 0 {
          TERM_IDLE
        } else if fg == primary {
          TERM_ACTIVE
        } else {
          TERM_BUSY
        };
        self.status = status;
        self.fg_pid = fg;
        self.set(attrs::ATTR_PROC_STATUS, status.to_string());
        if fg != 0 {
          self.set(attrs::ATTR_PROC_PID, fg.to_string());
          self.probe_process(fg);
        }
        self.probe_termios(fd);
      }
    }
    !self.changed.is_empty()
  }

  fn probe_process(&mut self, pid: i32) {
    if let Ok(cwd) = std::fs::read_link(format!("/proc/{pid}/cwd")) {
      self.set(attrs::ATTR_PROC_CWD, cwd.to_string_lossy().into_owned());
    }
    if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
      self.set(attrs::ATTR_PROC_COMM, comm.trim_end().to_string());
    }
    if let Ok(exe) = std::fs::read_link(format!("/proc/{pid}/exe")) {
      self.set(attrs::ATTR_PROC_EXE, exe.to_string_lossy().into_owned());
    }
    if let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) {
      let argv: Vec<String> = cmdline
        .split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
      if !argv.is_empty() {
        self.set(attrs::ATTR_PROC_ARGV, argv.join("\x1f"));
      }
    }
  }

  fn probe_termios(&mut self, fd: &dyn AsFd) {
    let Ok(termios) = nix::sys::termios::tcgetattr(fd.as_fd()) else {
      return;
    };
    let encoded = format!(
      "{:08x}{:08x}{:08x}",
      termios.input_flags.bits(),
      termios.output_flags.bits(),
      termios.local_flags.bits(),
    );
    if encoded != self.termios_cache {
      self.termios_cache = encoded.clone();
      self.set(attrs::ATTR_PROC_TERMIOS, encoded);
    }
  }

  /// Records how the child ended and derives the outcome attributes.
  pub fn set_outcome(&mut self, pid: i32, outcome: WaitOutcome) {
    self.outcome = Some(outcome);
    self.outcome_str = match outcome {
      WaitOutcome::Exited(code) => format!("Process {pid} exited with status {code}"),
      WaitOutcome::Signaled(signal) => format!("Process {pid} killed by signal {signal}"),
    };
    let (kind, code) = match outcome {
      WaitOutcome::Exited(code) => ("exited", code),
      WaitOutcome::Signaled(signal) => ("signaled", signal),
    };
    self.set(attrs::ATTR_PROC_OUTCOME, kind.to_string());
    self.set(attrs::ATTR_PROC_EXITCODE, code.to_string());
    self.set(attrs::ATTR_PROC_OUTCOME_STR, self.outcome_str.clone());
  }

  #[must_use]
  pub fn outcome(&self) -> Option<WaitOutcome> {
    self.outcome
  }

  #[must_use]
  pub fn outcome_str(&self) -> &str {
    &self.outcome_str
  }

  /// Whether the configured auto-close setting admits this outcome.
  #[must_use]
  pub fn auto_close(&self, setting: u32) -> bool {
    match setting {
      AUTOCLOSE_ALWAYS => true,
      AUTOCLOSE_ON_SUCCESS => self.outcome.is_some_and(|o| o.success()),
      _ => false,
    }
  }

  /// Delivers a signal to the foreground process group (falling back to the
  /// immediate child).
  pub fn send_signal(&self, child_pid: i32, signal: i32) {
    let target = if self.fg_pid > 0 { self.fg_pid } else { child_pid };
    if target <= 0 {
      return;
    }
    if let Ok(signal) = nix::sys::signal::Signal::try_from(signal) {
      let _ = nix::sys::signal::killpg(nix::unistd::Pid::from_raw(target), signal);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn outcome_strings_name_the_ending() {
    let mut tracker = TermStatusTracker::new(HashMap::new());
    tracker.set_outcome(100, WaitOutcome::Exited(2));
    assert_eq!(tracker.outcome_str(), "Process 100 exited with status 2");

    tracker.set_outcome(100, WaitOutcome::Signaled(9));
    assert!(tracker.outcome_str().contains("signal 9"));
  }

  #[test]
  fn changed_map_drains() {
    let mut tracker = TermStatusTracker::new(HashMap::new());
    tracker.set_outcome(1, WaitOutcome::Exited(0));
    assert!(!tracker.changed_map().is_empty());
    assert!(tracker.changed_map().is_empty());
  }

  #[test]
  fn repeated_values_do_not_rechange() {
    let mut tracker = TermStatusTracker::new(HashMap::new());
    tracker.set_outcome(1, WaitOutcome::Exited(0));
    let _ = tracker.changed_map();
    tracker.set_outcome(1, WaitOutcome::Exited(0));
    assert!(tracker.changed_map().is_empty());
  }

  #[test]
  fn auto_close_respects_setting_and_outcome() {
    let mut tracker = TermStatusTracker::new(HashMap::new());
    tracker.set_outcome(1, WaitOutcome::Exited(0));
    assert!(!tracker.auto_close(AUTOCLOSE_NEVER));
    assert!(tracker.auto_close(AUTOCLOSE_ALWAYS));
    assert!(tracker.auto_close(AUTOCLOSE_ON_SUCCESS));

    tracker.set_outcome(1, WaitOutcome::Exited(3));
    assert!(!tracker.auto_close(AUTOCLOSE_ON_SUCCESS));
    assert!(tracker.auto_close(AUTOCLOSE_ALWAYS));
  }

  #[test]
  fn closed_terminal_reports_closed_status() {
    let mut tracker = TermStatusTracker::new(HashMap::new());
    assert!(tracker.update(None, 42));
    let changed = tracker.changed_map();
    assert_eq!(
      changed.get(attrs::ATTR_PROC_STATUS).map(String::as_str),
      Some(TERM_CLOSED.to_string().as_str())
    );
  }
}
