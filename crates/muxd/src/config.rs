use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime tunables for the server.
///
/// Every threshold the workers consult lives here so that nothing in the mux
/// core carries compile-time magic numbers. Values come from an optional TOML
/// file merged over the built-in defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tunables {
  /// Output scheduler watermark in bytes. A submit that pushes the buffered
  /// amount past this returns false and the scheduler counts as throttled.
  pub buffer_warn_threshold: usize,
  /// Hard ceiling on a single frame body accepted from a peer.
  pub max_frame_length: usize,
  /// Hard ceiling on one attribute key/value pair.
  pub max_attribute_length: usize,
  /// Milliseconds of continuous output before a terminal enters the
  /// rate-limited state.
  pub ratelimit_threshold_ms: u64,
  /// Minimum milliseconds between watch activations while rate limited.
  pub ratelimit_interval_ms: u64,
  /// First idle timeout for connection keepalive probing, in milliseconds.
  /// Doubles on every subsequent fire up to `idle_last_timeout_ms`.
  pub idle_initial_timeout_ms: u64,
  pub idle_last_timeout_ms: u64,
  /// Default read chunk for terminal and task descriptors.
  pub read_buffer_size: usize,
  /// Number of reaped-but-unclaimed child statuses kept for late
  /// registration. Excess statuses are dropped.
  pub orphan_cap: usize,
  /// Default per-terminal file monitor entry limit.
  pub file_monitor_limit: usize,
  /// Initial scrollback capacity order (capacity = 1 << caporder).
  pub default_caporder: u8,
  /// Milliseconds a terminal must have run before auto-close is considered.
  pub auto_close_time_ms: u64,
  /// Identity and attribute scripts run at startup and on reload, in order.
  pub monitor_chain: Vec<Vec<String>>,
  /// Persistent monitor command whose stdout updates attributes live.
  pub monitor_command: Option<Vec<String>>,
}

impl Default for Tunables {
  fn default() -> Self {
    Self {
      buffer_warn_threshold: 4 * 1024 * 1024,
      max_frame_length: 16 * 1024 * 1024,
      max_attribute_length: 64 * 1024,
      ratelimit_threshold_ms: 150,
      ratelimit_interval_ms: 500,
      idle_initial_timeout_ms: 10_000,
      idle_last_timeout_ms: 320_000,
      read_buffer_size: 16 * 1024,
      orphan_cap: 128,
      file_monitor_limit: 250,
      default_caporder: 12,
      auto_close_time_ms: 5_000,
      monitor_chain: Vec::new(),
      monitor_command: None,
    }
  }
}

/// Load tunables, merging `$XDG_CONFIG_HOME/muxd/muxd.toml` over defaults
/// when present.
pub fn load_tunables() -> Result<Tunables> {
  let xdg = xdg::BaseDirectories::with_prefix("muxd");
  match xdg.find_config_file("muxd.toml") {
    Some(path) => load_tunables_from(&path),
    None => Ok(Tunables::default()),
  }
}

pub fn load_tunables_from(path: &Path) -> Result<Tunables> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  toml::from_str(&data).with_context(|| format!("invalid TOML in {}", path.display()))
}

/// Compute the listening socket path.
///
/// Precedence:
/// 1) `MUXD_SOCKET_PATH` environment variable
/// 2) `$XDG_RUNTIME_DIR/muxd.sock`
/// 3) Fallback to `~/.local/run/muxd.sock`
///
/// Ensures the parent directory exists with 0700 permissions.
#[must_use]
pub fn compute_socket_path() -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  fn prepare(path: PathBuf) -> PathBuf {
    if let Some(dir) = path.parent() {
      let _ = fs::create_dir_all(dir);
      let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    }
    path
  }

  if let Ok(env_path) = std::env::var("MUXD_SOCKET_PATH") {
    return prepare(PathBuf::from(env_path));
  }

  if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
    return prepare(PathBuf::from(runtime).join("muxd.sock"));
  }

  let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
  prepare(PathBuf::from(home).join(".local").join("run").join("muxd.sock"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_sane() {
    let t = Tunables::default();
    assert!(t.buffer_warn_threshold > 0);
    assert!(t.max_frame_length > t.buffer_warn_threshold / 4);
    assert_eq!(t.orphan_cap, 128);
    assert!(t.idle_last_timeout_ms > t.idle_initial_timeout_ms);
  }

  #[test]
  fn partial_file_overrides_only_named_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("muxd.toml");
    fs::write(&path, "orphan_cap = 16\nratelimit_interval_ms = 1000\n").unwrap();

    let t = load_tunables_from(&path).unwrap();
    assert_eq!(t.orphan_cap, 16);
    assert_eq!(t.ratelimit_interval_ms, 1000);
    assert_eq!(t.default_caporder, Tunables::default().default_caporder);
  }

  #[test]
  fn invalid_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("muxd.toml");
    fs::write(&path, "orphan_cap = [nope").unwrap();
    assert!(load_tunables_from(&path).is_err());
  }
}
