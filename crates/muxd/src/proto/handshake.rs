//! Fixed-form connection handshake.
//!
//! The server speaks first: a hello carrying the protocol version and the
//! server id. The client replies with its own id, a client version, and the
//! requested protocol type. A client version in the reserved range signals
//! rejection. Only the message boundary and result are contracted here; any
//! cryptographic wrapping happens in an outer transport.

use crate::id::InstanceId;
use crate::proto::wire::ProtocolError;
use crate::proto::{PROTOCOL_VERSION, VERSION_REJECT_BASE};

const HELLO_MAGIC: [u8; 4] = *b"\xc2\x9dMX";

/// Byte length of the server hello.
pub const HELLO_SIZE: usize = 4 + 4 + InstanceId::SIZE;
/// Byte length of the client response.
pub const RESPONSE_SIZE: usize = InstanceId::SIZE + 4 + 4;

/// Builds the server hello.
#[must_use]
pub fn hello(server_id: &InstanceId) -> Vec<u8> {
  let mut buf = Vec::with_capacity(HELLO_SIZE);
  buf.extend_from_slice(&HELLO_MAGIC);
  buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
  buf.extend_from_slice(server_id.as_bytes());
  buf
}

/// Builds the client response.
#[must_use]
pub fn response(client_id: &InstanceId, client_version: u32, protocol_type: u32) -> Vec<u8> {
  let mut buf = Vec::with_capacity(RESPONSE_SIZE);
  buf.extend_from_slice(client_id.as_bytes());
  buf.extend_from_slice(&client_version.to_le_bytes());
  buf.extend_from_slice(&protocol_type.to_le_bytes());
  buf
}

/// Parsed server hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
  pub protocol_version: u32,
  pub server_id: InstanceId,
}

/// Parsed client response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
  pub client_id: InstanceId,
  pub client_version: u32,
  pub protocol_type: u32,
}

impl Response {
  /// A client version in the reserved range is a rejection code.
  #[must_use]
  pub fn is_rejection(&self) -> bool {
    self.client_version >= VERSION_REJECT_BASE
  }
}

/// Incremental consumer for one handshake message of `SIZE` bytes.
///
/// Feed bytes as they arrive; once complete, the parsed form and any residual
/// bytes are available.
pub struct Collector {
  buf: Vec<u8>,
  want: usize,
}

/// Progress of a handshake collector.
pub enum Progress {
  /// Keep feeding bytes.
  Ongoing,
  /// The message is complete; `residual` bytes arrived after it.
  Complete,
}

impl Collector {
  #[must_use]
  pub fn hello() -> Self {
    Self { buf: Vec::with_capacity(HELLO_SIZE), want: HELLO_SIZE }
  }

  #[must_use]
  pub fn response() -> Self {
    Self { buf: Vec::with_capacity(RESPONSE_SIZE), want: RESPONSE_SIZE }
  }

  pub fn feed(&mut self, bytes: &[u8]) -> Progress {
    self.buf.extend_from_slice(bytes);
    if self.buf.len() >= self.want {
      Progress::Complete
    } else {
      Progress::Ongoing
    }
  }

  /// Bytes received beyond the handshake message.
  #[must_use]
  pub fn residual(&self) -> &[u8] {
    &self.buf[self.want.min(self.buf.len())..]
  }

  pub fn finish_hello(&self) -> Result<Hello, ProtocolError> {
    if self.buf.len() < HELLO_SIZE {
      return Err(ProtocolError::BadHandshake);
    }
    if self.buf[..4] != HELLO_MAGIC {
      return Err(ProtocolError::BadHandshake);
    }
    let protocol_version = u32::from_le_bytes(self.buf[4..8].try_into().unwrap());
    let server_id = InstanceId::parse(&self.buf[8..]).ok_or(ProtocolError::BadHandshake)?;
    Ok(Hello { protocol_version, server_id })
  }

  pub fn finish_response(&self) -> Result<Response, ProtocolError> {
    if self.buf.len() < RESPONSE_SIZE {
      return Err(ProtocolError::BadHandshake);
    }
    let client_id = InstanceId::parse(&self.buf).ok_or(ProtocolError::BadHandshake)?;
    let client_version = u32::from_le_bytes(self.buf[16..20].try_into().unwrap());
    let protocol_type = u32::from_le_bytes(self.buf[20..24].try_into().unwrap());
    Ok(Response { client_id, client_version, protocol_type })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proto::{CLIENT_VERSION, PROTOCOL_TERM, VERSION_PROTOCOL_MISMATCH};

  #[test]
  fn hello_round_trips_with_residual() {
    let id = InstanceId::generate();
    let mut bytes = hello(&id);
    bytes.extend_from_slice(b"extra");

    let mut c = Collector::hello();
    assert!(matches!(c.feed(&bytes), Progress::Complete));
    let parsed = c.finish_hello().unwrap();
    assert_eq!(parsed.server_id, id);
    assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    assert_eq!(c.residual(), b"extra");
  }

  #[test]
  fn hello_arrives_in_pieces() {
    let id = InstanceId::generate();
    let bytes = hello(&id);

    let mut c = Collector::hello();
    assert!(matches!(c.feed(&bytes[..10]), Progress::Ongoing));
    assert!(matches!(c.feed(&bytes[10..]), Progress::Complete));
    assert_eq!(c.finish_hello().unwrap().server_id, id);
  }

  #[test]
  fn bad_magic_is_rejected() {
    let id = InstanceId::generate();
    let mut bytes = hello(&id);
    bytes[0] ^= 0xFF;

    let mut c = Collector::hello();
    let _ = c.feed(&bytes);
    assert!(c.finish_hello().is_err());
  }

  #[test]
  fn response_rejection_range() {
    let id = InstanceId::generate();
    let ok = response(&id, CLIENT_VERSION, PROTOCOL_TERM);
    let bad = response(&id, VERSION_PROTOCOL_MISMATCH, PROTOCOL_TERM);

    let mut c = Collector::response();
    let _ = c.feed(&ok);
    assert!(!c.finish_response().unwrap().is_rejection());

    let mut c = Collector::response();
    let _ = c.feed(&bad);
    assert!(c.finish_response().unwrap().is_rejection());
  }
}
