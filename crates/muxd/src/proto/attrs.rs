use std::collections::HashMap;

use crate::proto::wire::{Marshaler, ProtocolError, Unmarshaler};

/// Attribute maps are the universal metadata carrier: UTF-8 dotted keys to
/// UTF-8 values, marshaled as NUL-terminated pairs ended by an empty key.
pub type AttributeMap = HashMap<String, String>;

// Well-known keys.
pub const ATTR_ID: &str = "server.id";
pub const ATTR_MACHINE_ID: &str = "server.machine-id";
pub const ATTR_PRODUCT: &str = "server.product";
pub const ATTR_FLAVOR: &str = "server.flavor";
pub const ATTR_PID: &str = "server.pid";
pub const ATTR_STARTED: &str = "server.started";
pub const ATTR_PEER: &str = "server.peer";

pub const ATTR_SESSION_ID: &str = "session.id";
pub const ATTR_SESSION_COLS: &str = "session.cols";
pub const ATTR_SESSION_ROWS: &str = "session.rows";
pub const ATTR_SESSION_TITLE: &str = "session.title";
pub const ATTR_SESSION_ENCODING: &str = "session.encoding";
pub const ATTR_SESSION_STARTED: &str = "session.started";

pub const ATTR_PROC_PID: &str = "proc.pid";
pub const ATTR_PROC_CWD: &str = "proc.cwd";
pub const ATTR_PROC_COMM: &str = "proc.comm";
pub const ATTR_PROC_EXE: &str = "proc.exe";
pub const ATTR_PROC_ARGV: &str = "proc.argv";
pub const ATTR_PROC_STATUS: &str = "proc.status";
pub const ATTR_PROC_OUTCOME: &str = "proc.outcome";
pub const ATTR_PROC_OUTCOME_STR: &str = "proc.outcome-str";
pub const ATTR_PROC_EXITCODE: &str = "proc.exitcode";
pub const ATTR_PROC_DEV: &str = "proc.dev";
pub const ATTR_PROC_TERMIOS: &str = "proc.termios";

pub const ATTR_PROFILE_COMMAND: &str = "profile.command";
pub const ATTR_PROFILE_ENVIRON: &str = "profile.environ";
pub const ATTR_PROFILE_STARTDIR: &str = "profile.startdir";
pub const ATTR_PROFILE_CAPORDER: &str = "profile.caporder";
pub const ATTR_PROFILE_NFILES: &str = "profile.nfiles";
pub const ATTR_PROFILE_EXITACTION: &str = "profile.exitaction";
pub const ATTR_PROFILE_AUTOCLOSE: &str = "profile.autoclose";

pub const ATTR_OWNER_PREFIX: &str = "owner.";
pub const ATTR_OWNER_ID: &str = "owner.id";
pub const ATTR_SENDER_PREFIX: &str = "sender.";
pub const ATTR_SENDER_ID: &str = "sender.id";

pub const ATTR_COMMAND_COMMAND: &str = "command.command";
pub const ATTR_COMMAND_ENVIRON: &str = "command.environ";
pub const ATTR_COMMAND_STARTDIR: &str = "command.startdir";
pub const ATTR_COMMAND_KEEPALIVE: &str = "command.keepalive";

/// Reserved key prefixes. Keys outside these namespaces are free-form.
pub const RESERVED_PREFIXES: &[&str] = &[
  "server.",
  "session.",
  "profile.",
  "proc.",
  "pref.",
  "owner.",
  "sender.",
  "clipboard.",
  "region.",
  "content.",
  "env.",
  "command.",
];

/// A key starting with `_` is private to its originator and never forwarded.
#[must_use]
pub fn is_private(key: &str) -> bool {
  key.starts_with('_')
}

/// Appends a string map as NUL-terminated key/value pairs ended by an empty
/// key. Private keys are the caller's concern.
pub fn marshal_map(m: &mut Marshaler, map: &AttributeMap) {
  let mut keys: Vec<&String> = map.keys().collect();
  keys.sort();
  for key in keys {
    m.add_string(key);
    m.add_string(&map[key]);
  }
  m.add_string("");
}

/// The bare pair encoding without a frame around it, used for the initial
/// length-prefixed attribute map after the handshake.
#[must_use]
pub fn marshal_map_bytes(map: &AttributeMap) -> Vec<u8> {
  let mut keys: Vec<&String> = map.keys().collect();
  keys.sort();
  let mut out = Vec::new();
  for key in keys {
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.extend_from_slice(map[key].as_bytes());
    out.push(0);
  }
  out.push(0);
  out
}

/// Parses key/value pairs until an empty key or the end of the body.
pub fn parse_map(unm: &mut Unmarshaler<'_>, map: &mut AttributeMap) {
  while unm.remaining() > 0 {
    let key = unm.parse_string();
    if key.is_empty() {
      break;
    }
    map.insert(key, unm.parse_string());
  }
}

/// Parses a map after validating the body as UTF-8; used on external input.
pub fn parse_utf8_map(
  unm: &mut Unmarshaler<'_>,
  map: &mut AttributeMap,
) -> Result<(), ProtocolError> {
  unm.validate_utf8()?;
  parse_map(unm, map);
  Ok(())
}

/// Parses a map, dropping entries whose keys fail the given restriction
/// predicate. Used when a remote writer must not override protected keys.
pub fn parse_filtered_map(
  unm: &mut Unmarshaler<'_>,
  restricted: impl Fn(&str) -> bool,
) -> Result<AttributeMap, ProtocolError> {
  unm.validate_utf8()?;
  let mut result = AttributeMap::new();
  while unm.remaining() > 0 {
    let key = unm.parse_string();
    if key.is_empty() {
      break;
    }
    let value = unm.parse_string();
    if !restricted(&key) {
      result.insert(key, value);
    }
  }
  Ok(result)
}

/// Copies the source map's public entries under `owner.` and `sender.`
/// prefixes into `dst` and stamps both id keys. Used on ownership changes.
pub fn project_owner_attributes(id: &crate::id::InstanceId, src: &AttributeMap, dst: &mut AttributeMap) {
  for (key, value) in src {
    if !is_private(key) {
      dst.insert(format!("{ATTR_OWNER_PREFIX}{key}"), value.clone());
      dst.insert(format!("{ATTR_SENDER_PREFIX}{key}"), value.clone());
    }
  }
  let text = id.to_string();
  dst.insert(ATTR_OWNER_ID.to_string(), text.clone());
  dst.insert(ATTR_SENDER_ID.to_string(), text);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proto::FRAME_HEADER_SIZE;

  fn round_trip(map: &AttributeMap) -> AttributeMap {
    let mut m = Marshaler::new(0);
    marshal_map(&mut m, map);
    let frame = m.finish();
    let mut unm = Unmarshaler::new(&frame[FRAME_HEADER_SIZE..]);
    let mut out = AttributeMap::new();
    parse_map(&mut unm, &mut out);
    out
  }

  #[test]
  fn map_round_trips() {
    let mut map = AttributeMap::new();
    map.insert("session.rows".into(), "24".into());
    map.insert("session.cols".into(), "80".into());
    map.insert("custom".into(), "value with spaces".into());
    assert_eq!(round_trip(&map), map);
  }

  #[test]
  fn empty_key_terminates_early() {
    let mut m = Marshaler::new(0);
    m.add_string("a").add_string("1").add_string("").add_string("b").add_string("2");
    let frame = m.finish();
    let mut unm = Unmarshaler::new(&frame[FRAME_HEADER_SIZE..]);
    let mut out = AttributeMap::new();
    parse_map(&mut unm, &mut out);
    assert_eq!(out.len(), 1);
    assert_eq!(out.get("a").map(String::as_str), Some("1"));
  }

  #[test]
  fn filtered_parse_drops_restricted_keys() {
    let mut map = AttributeMap::new();
    map.insert("server.id".into(), "forged".into());
    map.insert("session.title".into(), "ok".into());
    let mut m = Marshaler::new(0);
    marshal_map(&mut m, &map);
    let frame = m.finish();

    let mut unm = Unmarshaler::new(&frame[FRAME_HEADER_SIZE..]);
    let out = parse_filtered_map(&mut unm, |k| k.starts_with("server.")).unwrap();
    assert_eq!(out.len(), 1);
    assert!(out.contains_key("session.title"));
  }

  #[test]
  fn owner_projection_skips_private_keys() {
    let id = crate::id::InstanceId::generate();
    let mut src = AttributeMap::new();
    src.insert("user".into(), "alice".into());
    src.insert("_secret".into(), "hidden".into());

    let mut dst = AttributeMap::new();
    project_owner_attributes(&id, &src, &mut dst);

    assert_eq!(dst.get("owner.user").map(String::as_str), Some("alice"));
    assert_eq!(dst.get("sender.user").map(String::as_str), Some("alice"));
    assert!(!dst.contains_key("owner._secret"));
    assert_eq!(dst.get(ATTR_OWNER_ID).map(String::as_str), Some(id.to_string().as_str()));
  }
}
