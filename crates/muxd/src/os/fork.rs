//! Child process helpers.
//!
//! Children spawned here are never waited on directly; callers register the
//! pid with the reaper, which owns `waitpid` for the whole process.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

/// A spawned child: its pid and, unless running on /dev/null, the parent
/// side of its stdio socketpair.
pub struct ForkedChild {
  pub pid: i32,
  pub io: Option<OwnedFd>,
}

/// Environment entries packed as `KEY=VALUE` strings separated by unit
/// separators on the wire become a map here.
#[must_use]
pub fn parse_environ_block(block: &str) -> HashMap<String, String> {
  let mut env = HashMap::new();
  for entry in block.split('\x1f') {
    if let Some((key, value)) = entry.split_once('=') {
      env.insert(key.to_string(), value.to_string());
    }
  }
  env
}

/// Splits a command string whose arguments are separated by unit separators.
#[must_use]
pub fn parse_command_block(block: &str) -> Vec<String> {
  block.split('\x1f').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Spawns a command with its stdio bridged over a socketpair, or wired to
/// /dev/null when `devnull` is set (the caller asked for no output frames).
pub fn spawn_command(
  argv: &[String],
  env: &HashMap<String, String>,
  dir: &Path,
  devnull: bool,
) -> Result<ForkedChild> {
  let (program, args) = argv.split_first().context("empty command")?;

  let mut command = Command::new(program);
  command.args(args);
  if !dir.as_os_str().is_empty() {
    command.current_dir(dir);
  }
  for (key, value) in env {
    command.env(key, value);
  }

  let parent_io = if devnull {
    command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    None
  } else {
    let (parent, child) = socketpair(
      AddressFamily::Unix,
      SockType::Stream,
      None,
      SockFlag::SOCK_CLOEXEC,
    )
    .context("socketpair for child stdio")?;
    super::set_nonblocking(&parent)?;

    command.stdin(Stdio::from(child.try_clone().context("dup child stdio")?));
    command.stdout(Stdio::from(child.try_clone().context("dup child stdio")?));
    command.stderr(Stdio::from(child));
    Some(parent)
  };

  let child = command.spawn().with_context(|| format!("failed to spawn {program}"))?;
  let pid = child.id() as i32;
  // The reaper owns waitpid; dropping the handle must not reap.
  drop(child);

  Ok(ForkedChild { pid, io: parent_io })
}

/// Spawns a script whose stdout we read line-by-line (identity and
/// attribute scripts, the persistent monitor). Returns the pid, the read
/// side of its stdout, and the write side of its stdin.
pub fn spawn_line_source(argv: &[String]) -> Result<(i32, OwnedFd, OwnedFd)> {
  let (program, args) = argv.split_first().context("empty command")?;

  let mut child = Command::new(program)
    .args(args)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .spawn()
    .with_context(|| format!("failed to spawn {program}"))?;

  let stdout: OwnedFd = child.stdout.take().context("child stdout missing")?.into();
  let stdin: OwnedFd = child.stdin.take().context("child stdin missing")?.into();
  super::set_nonblocking(&stdout)?;

  let pid = child.id() as i32;
  drop(child);
  Ok((pid, stdout, stdin))
}

/// Sends SIGTERM to a process.
pub fn kill_process(pid: i32) {
  let _ = nix::sys::signal::kill(
    nix::unistd::Pid::from_raw(pid),
    nix::sys::signal::Signal::SIGTERM,
  );
}
