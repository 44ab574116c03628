use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit opaque identifier for servers, clients, terminals, and tasks.
///
/// Carries a 16-byte canonical wire form and a textual form. Freshly
/// generated ids are random (v4) and never collide with live ids in
/// practice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId([u8; 16]);

impl InstanceId {
  pub const SIZE: usize = 16;

  #[must_use]
  pub fn generate() -> Self {
    Self(*Uuid::new_v4().as_bytes())
  }

  #[must_use]
  pub const fn nil() -> Self {
    Self([0u8; 16])
  }

  #[must_use]
  pub const fn from_bytes(bytes: [u8; 16]) -> Self {
    Self(bytes)
  }

  /// Reads an id from the front of a wire buffer. Returns `None` if fewer
  /// than 16 bytes remain.
  #[must_use]
  pub fn parse(buf: &[u8]) -> Option<Self> {
    let bytes: [u8; 16] = buf.get(..16)?.try_into().ok()?;
    Some(Self(bytes))
  }

  #[must_use]
  pub const fn as_bytes(&self) -> &[u8; 16] {
    &self.0
  }

  /// Mixes another number into the id. Used to disambiguate the machine id
  /// by UID so that two users on one host produce distinct server ids.
  pub fn combine(&mut self, value: u32) {
    let mix = value.to_le_bytes();
    for (i, b) in self.0.iter_mut().enumerate() {
      *b ^= mix[i % 4];
    }
  }

  #[must_use]
  pub fn is_nil(&self) -> bool {
    self.0 == [0u8; 16]
  }
}

impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    Uuid::from_bytes(self.0).fmt(f)
  }
}

impl fmt::Debug for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "InstanceId({})", self)
  }
}

impl std::str::FromStr for InstanceId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(*Uuid::parse_str(s)?.as_bytes()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_ids_are_distinct() {
    let a = InstanceId::generate();
    let b = InstanceId::generate();
    assert_ne!(a, b);
  }

  #[test]
  fn combine_changes_id_deterministically() {
    let mut a = InstanceId::from_bytes([7u8; 16]);
    let mut b = InstanceId::from_bytes([7u8; 16]);
    a.combine(1000);
    b.combine(1000);
    assert_eq!(a, b);
    assert_ne!(a, InstanceId::from_bytes([7u8; 16]));
  }

  #[test]
  fn combine_is_uid_sensitive() {
    let mut a = InstanceId::from_bytes([7u8; 16]);
    let mut b = InstanceId::from_bytes([7u8; 16]);
    a.combine(1000);
    b.combine(1001);
    assert_ne!(a, b);
  }

  #[test]
  fn text_form_round_trips() {
    let id = InstanceId::generate();
    let text = id.to_string();
    assert_eq!(text.parse::<InstanceId>().unwrap(), id);
  }

  #[test]
  fn parse_requires_sixteen_bytes() {
    assert!(InstanceId::parse(&[0u8; 15]).is_none());
    assert!(InstanceId::parse(&[0u8; 16]).is_some());
  }
}
