//! Framing state machines.
//!
//! Three variants share one contract: consume raw bytes, produce fully formed
//! frames through a dispatcher callback. The body slice handed to the
//! dispatcher is valid only during the call; dispatchers copy what they keep.
//!
//! - [`FrameMachine`] is the shared framing core and doubles as the Raw
//!   variant for point-to-point peers.
//! - [`ServerMachine`] runs the server side of a fresh connection: hello out,
//!   response in, then the length-prefixed attribute map, then frames.
//! - [`ClientMachine`] runs the client side when this server dials a peer:
//!   hello in, response out, then frames.

use crate::id::InstanceId;
use crate::proto::handshake::{self, Collector, Progress, Response};
use crate::proto::wire::ProtocolError;
use crate::proto::{
  CLIENT_VERSION, FRAME_HEADER_SIZE, PROTOCOL_RAW, PROTOCOL_TERM, PROTOCOL_VERSION, CommandClass,
};

/// Dispatcher outcome: `true` keeps the connection reading.
pub type Dispatch<'a> = dyn FnMut(u32, &[u8]) -> Result<bool, ProtocolError> + 'a;

/// Length-prefixed frame assembly.
///
/// Complete frames contained in the input are dispatched without copying;
/// partial frames are buffered until the remainder arrives.
pub struct FrameMachine {
  accum: Vec<u8>,
  pending: Option<(u32, usize)>,
  max_length: usize,
}

impl FrameMachine {
  #[must_use]
  pub fn new(max_length: usize) -> Self {
    Self { accum: Vec::new(), pending: None, max_length }
  }

  fn parse_pending(&mut self) -> Result<bool, ProtocolError> {
    if self.accum.len() < FRAME_HEADER_SIZE {
      return Ok(false);
    }
    let header: [u8; FRAME_HEADER_SIZE] = self.accum[..FRAME_HEADER_SIZE].try_into().unwrap();
    let (command, length) = super::wire::parse_header(&header);
    if length > self.max_length {
      return Err(ProtocolError::FrameTooLarge { length, max: self.max_length });
    }
    let class = CommandClass::of(command).ok_or(ProtocolError::UnknownClass(command >> 24))?;
    if length < class.prefix_size() {
      return Err(ProtocolError::ShortBody);
    }
    self.pending = Some((command, length));
    Ok(true)
  }

  /// Feeds bytes, dispatching every complete frame. Returns `false` when the
  /// dispatcher asked to stop; remaining input is discarded in that case.
  pub fn feed(&mut self, bytes: &[u8], dispatch: &mut Dispatch<'_>) -> Result<bool, ProtocolError> {
    self.accum.extend_from_slice(bytes);

    loop {
      if self.pending.is_none() && !self.parse_pending()? {
        return Ok(true);
      }
      let (command, length) = self.pending.unwrap();
      if self.accum.len() < FRAME_HEADER_SIZE + length {
        return Ok(true);
      }

      let keep_going = dispatch(command, &self.accum[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length])?;
      self.accum.drain(..FRAME_HEADER_SIZE + length);
      self.pending = None;

      if !keep_going {
        self.accum.clear();
        return Ok(false);
      }
    }
  }
}

/// Connection lifecycle stages shared by the handshaking machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Handshaking,
  Attributing,
  Running,
}

/// What a handshaking machine wants its owner to do next.
pub enum Step {
  /// Nothing actionable yet; keep reading.
  Continue,
  /// Write these bytes to the peer.
  Send(Vec<u8>),
  /// Handshake concluded and the connection is running.
  Connected { peer: InstanceId, protocol_type: u32 },
  /// The initial attribute map arrived (server side only).
  Attributes(Vec<u8>),
  /// The peer rejected the connection with this version code.
  Rejected { client_version: u32 },
}

/// Server side: we spoke the hello, now collect the response and the initial
/// length-prefixed attribute map, then frame.
pub struct ServerMachine {
  stage: Stage,
  collector: Collector,
  attr_buf: Vec<u8>,
  attr_need: Option<usize>,
  response: Option<Response>,
  frames: FrameMachine,
}

impl ServerMachine {
  #[must_use]
  pub fn new(max_frame_length: usize) -> Self {
    Self {
      stage: Stage::Handshaking,
      collector: Collector::response(),
      attr_buf: Vec::new(),
      attr_need: None,
      response: None,
      frames: FrameMachine::new(max_frame_length),
    }
  }

  #[must_use]
  pub fn stage(&self) -> Stage {
    self.stage
  }

  #[must_use]
  pub fn peer(&self) -> Option<&Response> {
    self.response.as_ref()
  }

  /// Feeds bytes according to the current stage. Frames are dispatched only
  /// once Running; earlier stages surface [`Step`] values instead.
  pub fn feed(
    &mut self,
    bytes: &[u8],
    dispatch: &mut Dispatch<'_>,
  ) -> Result<Vec<Step>, ProtocolError> {
    let mut steps = Vec::new();
    match self.stage {
      Stage::Handshaking => {
        if let Progress::Complete = self.collector.feed(bytes) {
          let response = self.collector.finish_response()?;
          let residual = self.collector.residual().to_vec();
          if response.is_rejection() {
            steps.push(Step::Rejected { client_version: response.client_version });
            return Ok(steps);
          }
          self.response = Some(response);
          self.stage = Stage::Attributing;
          steps.push(Step::Connected {
            peer: response.client_id,
            protocol_type: response.protocol_type,
          });
          steps.extend(self.feed(&residual, dispatch)?);
        }
      }
      Stage::Attributing => {
        self.attr_buf.extend_from_slice(bytes);
        if self.attr_need.is_none() && self.attr_buf.len() >= 4 {
          let len = u32::from_le_bytes(self.attr_buf[..4].try_into().unwrap()) as usize;
          if len > self.frames.max_length {
            return Err(ProtocolError::FrameTooLarge { length: len, max: self.frames.max_length });
          }
          self.attr_buf.drain(..4);
          self.attr_need = Some(len);
        }
        if let Some(need) = self.attr_need
          && self.attr_buf.len() >= need
        {
          let residual = self.attr_buf.split_off(need);
          let map = std::mem::take(&mut self.attr_buf);
          self.stage = Stage::Running;
          steps.push(Step::Attributes(map));
          if !residual.is_empty() && !self.frames.feed(&residual, dispatch)? {
            return Ok(steps);
          }
        }
      }
      Stage::Running => {
        let _ = self.frames.feed(bytes, dispatch)?;
      }
    }
    Ok(steps)
  }
}

/// Client side: consume the peer's hello, answer it, then frame.
///
/// `check_peer` decides whether the offered server id is acceptable (it
/// rejects collisions with this server or an existing peer).
pub struct ClientMachine {
  stage: Stage,
  local_id: InstanceId,
  protocol_type: u32,
  collector: Collector,
  peer: Option<InstanceId>,
  frames: FrameMachine,
}

impl ClientMachine {
  #[must_use]
  pub fn new(local_id: InstanceId, protocol_type: u32, max_frame_length: usize) -> Self {
    Self {
      stage: Stage::Handshaking,
      local_id,
      protocol_type,
      collector: Collector::hello(),
      peer: None,
      frames: FrameMachine::new(max_frame_length),
    }
  }

  #[must_use]
  pub fn stage(&self) -> Stage {
    self.stage
  }

  pub fn feed(
    &mut self,
    bytes: &[u8],
    check_peer: &mut dyn FnMut(&InstanceId) -> bool,
    dispatch: &mut Dispatch<'_>,
  ) -> Result<Vec<Step>, ProtocolError> {
    let mut steps = Vec::new();
    match self.stage {
      Stage::Handshaking => {
        if let Progress::Complete = self.collector.feed(bytes) {
          let hello = self.collector.finish_hello()?;
          let residual = self.collector.residual().to_vec();

          let (client_version, protocol_type) = if hello.protocol_version != PROTOCOL_VERSION {
            (super::VERSION_PROTOCOL_MISMATCH, super::PROTOCOL_REJECT)
          } else if !check_peer(&hello.server_id) {
            (super::VERSION_DUPLICATE_CONN, super::PROTOCOL_REJECT)
          } else {
            (CLIENT_VERSION, self.protocol_type)
          };

          steps.push(Step::Send(handshake::response(&self.local_id, client_version, protocol_type)));

          if protocol_type == PROTOCOL_TERM || protocol_type == PROTOCOL_RAW {
            self.peer = Some(hello.server_id);
            self.stage = Stage::Running;
            steps.push(Step::Connected { peer: hello.server_id, protocol_type });
            if !residual.is_empty() && !self.frames.feed(&residual, dispatch)? {
              return Ok(steps);
            }
          } else {
            steps.push(Step::Rejected { client_version });
          }
        }
      }
      Stage::Attributing => unreachable!("client machine has no attribute stage"),
      Stage::Running => {
        let _ = self.frames.feed(bytes, dispatch)?;
      }
    }
    Ok(steps)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proto::wire::Marshaler;
  use crate::proto::{KEEPALIVE, TERM_INPUT};

  fn frame(command: u32, body: &[u8]) -> Vec<u8> {
    let mut m = Marshaler::new(command);
    m.add_bytes(body);
    m.finish()
  }

  #[test]
  fn frames_split_across_reads_are_assembled() {
    let mut machine = FrameMachine::new(1 << 20);
    let bytes = frame(KEEPALIVE, b"");
    let mut seen = Vec::new();

    let mut dispatch = |command: u32, body: &[u8]| {
      seen.push((command, body.to_vec()));
      Ok(true)
    };
    machine.feed(&bytes[..3], &mut dispatch).unwrap();
    assert!(seen.is_empty());
    machine.feed(&bytes[3..], &mut dispatch).unwrap();
    assert_eq!(seen, vec![(KEEPALIVE, Vec::new())]);
  }

  #[test]
  fn back_to_back_frames_dispatch_in_order() {
    let mut machine = FrameMachine::new(1 << 20);
    let mut bytes = frame(KEEPALIVE, b"");
    bytes.extend(frame(TERM_INPUT, &[0u8; 40]));
    let mut seen = Vec::new();

    machine
      .feed(&bytes, &mut |command, body| {
        seen.push((command, body.len()));
        Ok(true)
      })
      .unwrap();
    assert_eq!(seen, vec![(KEEPALIVE, 0), (TERM_INPUT, 40)]);
  }

  #[test]
  fn oversized_length_header_is_fatal() {
    let mut machine = FrameMachine::new(16);
    let bytes = frame(KEEPALIVE, &[0u8; 32]);
    let result = machine.feed(&bytes, &mut |_, _| Ok(true));
    assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
  }

  #[test]
  fn body_shorter_than_routing_prefix_is_fatal() {
    let mut machine = FrameMachine::new(1 << 20);
    // Term-class frame with a 4-byte body cannot hold the 32-byte prefix.
    let bytes = frame(TERM_INPUT, &[0u8; 4]);
    let result = machine.feed(&bytes, &mut |_, _| Ok(true));
    assert!(matches!(result, Err(ProtocolError::ShortBody)));
  }

  #[test]
  fn server_machine_walks_response_attributes_frames() {
    let mut machine = ServerMachine::new(1 << 20);
    let client = InstanceId::generate();

    // Response, then a 6-byte attribute map, then one frame, in one burst.
    let mut bytes = handshake::response(&client, CLIENT_VERSION, PROTOCOL_TERM);
    let map = b"k\0v\0\0\0";
    bytes.extend_from_slice(&(map.len() as u32).to_le_bytes());
    bytes.extend_from_slice(map);
    bytes.extend(frame(KEEPALIVE, b""));

    let mut seen = Vec::new();
    let steps = machine
      .feed(&bytes, &mut |command, _| {
        seen.push(command);
        Ok(true)
      })
      .unwrap();

    assert!(matches!(steps[0], Step::Connected { peer, .. } if peer == client));
    assert!(matches!(&steps[1], Step::Attributes(m) if m == map));
    assert_eq!(machine.stage(), Stage::Running);
    assert_eq!(seen, vec![KEEPALIVE]);
  }

  #[test]
  fn server_machine_surfaces_rejection() {
    let mut machine = ServerMachine::new(1 << 20);
    let client = InstanceId::generate();
    let bytes = handshake::response(&client, super::super::VERSION_PROTOCOL_MISMATCH, 0);

    let steps = machine.feed(&bytes, &mut |_, _| Ok(true)).unwrap();
    assert!(
      matches!(steps[0], Step::Rejected { client_version } if client_version == super::super::VERSION_PROTOCOL_MISMATCH)
    );
  }

  #[test]
  fn client_machine_answers_hello_and_runs() {
    let server = InstanceId::generate();
    let local = InstanceId::generate();
    let mut machine = ClientMachine::new(local, PROTOCOL_TERM, 1 << 20);

    let mut bytes = handshake::hello(&server);
    bytes.extend(frame(KEEPALIVE, b""));

    let mut seen = Vec::new();
    let steps = machine
      .feed(&bytes, &mut |_| true, &mut |command, _| {
        seen.push(command);
        Ok(true)
      })
      .unwrap();

    assert!(matches!(&steps[0], Step::Send(reply) if reply.len() == handshake::RESPONSE_SIZE));
    assert!(matches!(steps[1], Step::Connected { peer, .. } if peer == server));
    assert_eq!(seen, vec![KEEPALIVE]);
  }

  #[test]
  fn client_machine_rejects_duplicate_peer() {
    let server = InstanceId::generate();
    let local = InstanceId::generate();
    let mut machine = ClientMachine::new(local, PROTOCOL_TERM, 1 << 20);

    let bytes = handshake::hello(&server);
    let steps = machine.feed(&bytes, &mut |_| false, &mut |_, _| Ok(true)).unwrap();

    assert!(matches!(steps[0], Step::Send(_)));
    assert!(
      matches!(steps[1], Step::Rejected { client_version } if client_version == super::super::VERSION_DUPLICATE_CONN)
    );
  }
}
