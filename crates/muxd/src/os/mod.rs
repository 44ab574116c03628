//! OS probing and policy helpers.
//!
//! Everything platform-shaped lives behind this module: attribute
//! restriction verdicts, peer credentials, process environment, and the
//! fork helpers in [`fork`]. The mux core calls these and respects the
//! answers without encoding platform detail itself.

pub mod fork;

use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sys::socket::{GetSockOpt, sockopt};

use crate::proto::attrs;

/// Whether a server attribute key is protected from external overwrite
/// unconditionally.
#[must_use]
pub fn restricted_server_attribute(key: &str) -> bool {
  matches!(
    key,
    attrs::ATTR_ID
      | attrs::ATTR_MACHINE_ID
      | attrs::ATTR_PID
      | attrs::ATTR_PRODUCT
      | attrs::ATTR_FLAVOR
      | attrs::ATTR_STARTED
  ) || key.starts_with("env.")
}

/// Whether a terminal attribute key is protected from the given writer.
/// Owners may touch `profile.` and `pref.` keys; nobody external touches the
/// identity and process namespaces.
#[must_use]
pub fn restricted_term_attribute(key: &str, from_owner: bool) -> bool {
  if key.starts_with("proc.") || key == attrs::ATTR_SESSION_ID || key == attrs::ATTR_SESSION_STARTED
  {
    return true;
  }
  if key.starts_with("owner.") || key.starts_with("sender.") {
    return true;
  }
  if !from_owner && (key.starts_with("profile.") || key.starts_with("pref.")) {
    return true;
  }
  false
}

/// Whether the monitor may not publish the given key.
#[must_use]
pub fn restricted_monitor_attribute(key: &str) -> bool {
  restricted_server_attribute(key) || key.starts_with("owner.") || key.starts_with("sender.")
}

/// Pid of the process on the other end of a unix socket.
pub fn local_creds(fd: &impl AsFd) -> Result<i32> {
  let creds = sockopt::PeerCredentials
    .get(fd)
    .context("failed to read peer credentials")?;
  Ok(creds.pid())
}

/// Reads a process's environment from /proc. Returns an empty map for
/// processes we cannot inspect.
#[must_use]
pub fn process_environment(pid: i32) -> HashMap<String, String> {
  let mut env = HashMap::new();
  let Ok(raw) = std::fs::read(format!("/proc/{pid}/environ")) else {
    return env;
  };
  for entry in raw.split(|&b| b == 0) {
    if entry.is_empty() {
      continue;
    }
    let text = String::from_utf8_lossy(entry);
    if let Some((key, value)) = text.split_once('=') {
      env.insert(key.to_string(), value.to_string());
    }
  }
  env
}

/// Resolves a possibly-relative directory against the user's home.
#[must_use]
pub fn relative_to_home(dir: &str) -> PathBuf {
  let path = PathBuf::from(dir);
  if path.is_absolute() || dir.is_empty() {
    return path;
  }
  match std::env::var("HOME") {
    Ok(home) => PathBuf::from(home).join(path),
    Err(_) => path,
  }
}

/// A stable machine identity mixed with the UID, so two users on the same
/// host register distinct server ids.
#[must_use]
pub fn machine_identity(standalone: bool) -> crate::id::InstanceId {
  let mut id = machine_id_seed();
  let uid = nix::unistd::getuid().as_raw();
  // Standalone servers perturb differently so they never collide with the
  // user-level instance.
  let mix = if standalone { !uid } else { uid };
  id.combine(mix);
  id
}

fn machine_id_seed() -> crate::id::InstanceId {
  for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
    if let Ok(text) = std::fs::read_to_string(path)
      && let Ok(id) = text.trim().parse::<crate::id::InstanceId>()
    {
      return id;
    }
  }
  crate::id::InstanceId::generate()
}

/// Marks a descriptor close-on-exec. Every descriptor the server holds gets
/// this before any fork can observe it.
pub fn set_cloexec(fd: &impl AsFd) -> Result<()> {
  use nix::fcntl::{F_SETFD, FdFlag, fcntl};
  fcntl(fd.as_fd(), F_SETFD(FdFlag::FD_CLOEXEC)).context("failed to set close-on-exec")?;
  Ok(())
}

/// Makes a descriptor non-blocking.
pub fn set_nonblocking(fd: &impl AsFd) -> Result<()> {
  use nix::fcntl::{F_GETFL, F_SETFL, OFlag, fcntl};
  let flags = fcntl(fd.as_fd(), F_GETFL).context("failed to read descriptor flags")?;
  let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
  fcntl(fd.as_fd(), F_SETFL(flags)).context("failed to set non-blocking")?;
  Ok(())
}

/// Blocks until the descriptor is writable again. Used by blocking write
/// loops to ride out `EAGAIN`.
pub fn wait_for_writable(fd: &impl AsFd) -> Result<()> {
  use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
  let pollfd = PollFd::new(fd.as_fd(), PollFlags::POLLOUT);
  poll(&mut [pollfd], PollTimeout::NONE).context("poll for writable")?;
  Ok(())
}

/// Writes all of `buf`, riding out `EAGAIN`/`EINTR`, checking `stopping`
/// between attempts so a stop request interrupts a long write.
pub fn write_all(fd: &impl AsFd, mut buf: &[u8], stopping: &dyn Fn() -> bool) -> Result<()> {
  while !buf.is_empty() {
    if stopping() {
      anyhow::bail!("write interrupted by stop");
    }
    match nix::unistd::write(fd.as_fd(), buf) {
      Ok(n) => buf = &buf[n..],
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {
        wait_for_writable(fd)?;
      }
      Err(e) => return Err(e).with_context(|| format!("write to fd {}", fd.as_fd().as_raw_fd())),
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn server_restrictions_protect_identity() {
    assert!(restricted_server_attribute(attrs::ATTR_ID));
    assert!(restricted_server_attribute("env.PATH"));
    assert!(!restricted_server_attribute("session.title"));
    assert!(!restricted_server_attribute("custom.key"));
  }

  #[test]
  fn term_restrictions_depend_on_ownership() {
    assert!(restricted_term_attribute("proc.pid", true));
    assert!(restricted_term_attribute("profile.command", false));
    assert!(!restricted_term_attribute("profile.command", true));
    assert!(!restricted_term_attribute("session.title", false));
    assert!(restricted_term_attribute("owner.user", true));
  }

  #[test]
  fn own_environment_is_readable() {
    // SAFETY: test-only mutation of this process's environment.
    unsafe { std::env::set_var("MUXD_TEST_MARKER", "1") };
    let env = process_environment(std::process::id() as i32);
    // /proc reflects the environment at exec time, so only assert shape.
    assert!(env.is_empty() || env.values().all(|v| !v.contains('\0')));
  }

  #[test]
  fn machine_identity_differs_by_flavor() {
    let a = machine_identity(false);
    let b = machine_identity(true);
    assert_ne!(a, b);
  }

  #[test]
  fn relative_paths_resolve_against_home() {
    let abs = relative_to_home("/tmp/x");
    assert_eq!(abs, PathBuf::from("/tmp/x"));
    if let Ok(home) = std::env::var("HOME") {
      assert_eq!(relative_to_home("work"), PathBuf::from(home).join("work"));
    }
  }
}
