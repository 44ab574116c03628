use thiserror::Error;

use crate::id::InstanceId;
use crate::proto::FRAME_HEADER_SIZE;

/// Errors raised by the framing layer and the unmarshaler.
#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("frame length {length} exceeds maximum {max}")]
  FrameTooLarge { length: usize, max: usize },
  #[error("frame body underruns required prefix fields")]
  ShortBody,
  #[error("malformed handshake message")]
  BadHandshake,
  #[error("attribute data is not valid UTF-8")]
  BadUtf8,
  #[error("unknown command class {0:#x}")]
  UnknownClass(u32),
}

/// Builds one protocol frame: 8-byte header followed by body fields, all
/// little-endian. `result` patches the length and hands back the bytes.
pub struct Marshaler {
  buf: Vec<u8>,
}

impl Marshaler {
  #[must_use]
  pub fn new(command: u32) -> Self {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&command.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    Self { buf }
  }

  pub fn add_number(&mut self, value: u32) -> &mut Self {
    self.buf.extend_from_slice(&value.to_le_bytes());
    self
  }

  pub fn add_number64(&mut self, value: u64) -> &mut Self {
    self.buf.extend_from_slice(&value.to_le_bytes());
    self
  }

  pub fn add_number_pair(&mut self, a: u32, b: u32) -> &mut Self {
    self.add_number(a);
    self.add_number(b)
  }

  pub fn add_id(&mut self, id: &InstanceId) -> &mut Self {
    self.buf.extend_from_slice(id.as_bytes());
    self
  }

  pub fn add_id_pair(&mut self, a: &InstanceId, b: &InstanceId) -> &mut Self {
    self.add_id(a);
    self.add_id(b)
  }

  pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
    self.buf.extend_from_slice(bytes);
    self
  }

  /// Appends a NUL-terminated string field.
  pub fn add_string(&mut self, s: &str) -> &mut Self {
    self.buf.extend_from_slice(s.as_bytes());
    self.buf.push(0);
    self
  }

  /// Appends a string padded with NULs to the next 4-byte boundary, always
  /// with at least one terminating NUL.
  pub fn add_padded_string(&mut self, s: &str) -> &mut Self {
    self.buf.extend_from_slice(s.as_bytes());
    let padding = 4 - (self.buf.len() - FRAME_HEADER_SIZE) % 4;
    self.buf.extend(std::iter::repeat_n(0u8, padding));
    self
  }

  /// Finalizes the length header and returns the frame.
  #[must_use]
  pub fn finish(mut self) -> Vec<u8> {
    let length = (self.buf.len() - FRAME_HEADER_SIZE) as u32;
    self.buf[4..8].copy_from_slice(&length.to_le_bytes());
    self.buf
  }
}

/// Reads fields back out of a frame body.
///
/// Field accessors return defaults (`0`, empty) past the end rather than
/// panicking: a short body is detected up front by the caller via
/// [`Unmarshaler::require`] where the protocol demands it.
pub struct Unmarshaler<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Unmarshaler<'a> {
  #[must_use]
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  #[must_use]
  pub fn remaining(&self) -> usize {
    self.buf.len().saturating_sub(self.pos)
  }

  #[must_use]
  pub fn position(&self) -> usize {
    self.pos
  }

  #[must_use]
  pub fn remaining_bytes(&self) -> &'a [u8] {
    &self.buf[self.pos.min(self.buf.len())..]
  }

  /// Fails unless at least `len` bytes remain.
  pub fn require(&self, len: usize) -> Result<(), ProtocolError> {
    if self.remaining() < len {
      Err(ProtocolError::ShortBody)
    } else {
      Ok(())
    }
  }

  pub fn parse_number(&mut self) -> u32 {
    if self.remaining() < 4 {
      self.pos = self.buf.len();
      return 0;
    }
    let value = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
    self.pos += 4;
    value
  }

  pub fn parse_number64(&mut self) -> u64 {
    if self.remaining() < 8 {
      self.pos = self.buf.len();
      return 0;
    }
    let value = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
    self.pos += 8;
    value
  }

  pub fn parse_id(&mut self) -> InstanceId {
    match InstanceId::parse(&self.buf[self.pos.min(self.buf.len())..]) {
      Some(id) => {
        self.pos += InstanceId::SIZE;
        id
      }
      None => {
        self.pos = self.buf.len();
        InstanceId::nil()
      }
    }
  }

  /// Reads bytes up to the next NUL (or end of body) as a UTF-8 string.
  /// Invalid UTF-8 is replaced lossily; wire-level validation happens in
  /// [`validate_utf8`](Self::validate_utf8).
  pub fn parse_string(&mut self) -> String {
    let rest = &self.buf[self.pos.min(self.buf.len())..];
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let s = String::from_utf8_lossy(&rest[..end]).into_owned();
    self.pos += end + usize::from(end < rest.len());
    s
  }

  /// Reads a NUL-terminated string then skips padding to the next 4-byte
  /// boundary.
  pub fn parse_padded_string(&mut self) -> String {
    let s = self.parse_string();
    let over = self.pos % 4;
    if over != 0 {
      self.pos = (self.pos + 4 - over).min(self.buf.len());
    }
    s
  }

  pub fn parse_bytes(&mut self, len: usize) -> &'a [u8] {
    let start = self.pos.min(self.buf.len());
    let end = (self.pos + len).min(self.buf.len());
    self.pos = end;
    &self.buf[start..end]
  }

  /// Rejects the remaining body unless it is valid UTF-8.
  pub fn validate_utf8(&self) -> Result<(), ProtocolError> {
    std::str::from_utf8(self.remaining_bytes()).map_err(|_| ProtocolError::BadUtf8)?;
    Ok(())
  }
}

/// Splits a frame header into `(command, body length)`.
#[must_use]
pub fn parse_header(header: &[u8; FRAME_HEADER_SIZE]) -> (u32, usize) {
  let command = u32::from_le_bytes(header[0..4].try_into().unwrap());
  let length = u32::from_le_bytes(header[4..8].try_into().unwrap());
  (command, length as usize)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn marshal_then_unmarshal_is_structural_identity() {
    let id = InstanceId::generate();
    let mut m = Marshaler::new(0x0200_0001);
    m.add_id(&id).add_number(42).add_number64(1 << 40).add_string("hello");
    let frame = m.finish();

    let (command, length) = parse_header(frame[..FRAME_HEADER_SIZE].try_into().unwrap());
    assert_eq!(command, 0x0200_0001);
    assert_eq!(length, frame.len() - FRAME_HEADER_SIZE);

    let mut unm = Unmarshaler::new(&frame[FRAME_HEADER_SIZE..]);
    assert_eq!(unm.parse_id(), id);
    assert_eq!(unm.parse_number(), 42);
    assert_eq!(unm.parse_number64(), 1 << 40);
    assert_eq!(unm.parse_string(), "hello");
    assert_eq!(unm.remaining(), 0);
  }

  #[test]
  fn padded_strings_align_to_four_bytes() {
    let mut m = Marshaler::new(0);
    m.add_padded_string("abc");
    let frame = m.finish();
    assert_eq!((frame.len() - FRAME_HEADER_SIZE) % 4, 0);

    let mut unm = Unmarshaler::new(&frame[FRAME_HEADER_SIZE..]);
    assert_eq!(unm.parse_padded_string(), "abc");
    assert_eq!(unm.position() % 4, 0);

    // A string already on the boundary still gets a terminator.
    let mut m = Marshaler::new(0);
    m.add_padded_string("abcd");
    let frame = m.finish();
    let mut unm = Unmarshaler::new(&frame[FRAME_HEADER_SIZE..]);
    assert_eq!(unm.parse_padded_string(), "abcd");
  }

  #[test]
  fn short_body_reads_yield_defaults() {
    let mut unm = Unmarshaler::new(&[1, 2]);
    assert_eq!(unm.parse_number(), 0);
    assert_eq!(unm.parse_number64(), 0);
    assert!(unm.parse_id().is_nil());
    assert!(unm.require(1).is_err());
  }

  #[test]
  fn unterminated_string_reads_to_end() {
    let mut unm = Unmarshaler::new(b"tail");
    assert_eq!(unm.parse_string(), "tail");
    assert_eq!(unm.remaining(), 0);
  }

  #[test]
  fn utf8_validation_rejects_bad_bytes() {
    let unm = Unmarshaler::new(&[0xFF, 0xFE]);
    assert!(unm.validate_utf8().is_err());
  }
}
