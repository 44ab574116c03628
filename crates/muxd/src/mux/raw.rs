//! Raw peer connection worker.
//!
//! Dials another server over a unix socket, runs the client side of the
//! handshake, then speaks the framed protocol. Frames about any terminal or
//! client reached through this peer are forwarded transparently; announces
//! arriving here register proxies so the rest of the server can route to
//! them.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, warn};

use crate::id::InstanceId;
use crate::mux::commands::{CommandSource, PeerAction, handle_peer_frame};
use crate::mux::listener::{ConnRegistration, Listener, ListenerWork};
use crate::mux::output::{FdSink, OutputEvents, OutputScheduler};
use crate::proto::machine::{ClientMachine, Step};
use crate::proto::wire::Marshaler;
use crate::proto::{self, PROTOCOL_RAW};

pub enum ConnWork {
  Close(u32),
  Bytes(Vec<u8>),
  Eof,
}

pub struct RawInstance {
  id: InstanceId,
  listener: Arc<Listener>,
  work_rx: Receiver<ConnWork>,
  output: Arc<OutputScheduler>,
  output_join: Option<std::thread::JoinHandle<()>>,
  machine: ClientMachine,
  peer: Option<InstanceId>,
  keepalive_ms: Option<u64>,
  last_rx: Instant,
}

impl RawInstance {
  /// Dials a peer server and starts the connection worker.
  pub fn connect(listener: Arc<Listener>, path: &std::path::Path) -> Result<ConnRegistration> {
    let stream =
      UnixStream::connect(path).with_context(|| format!("connect to peer {}", path.display()))?;
    Self::start(listener, stream)
  }

  fn start(listener: Arc<Listener>, stream: UnixStream) -> Result<ConnRegistration> {
    let id = InstanceId::generate();
    let _ = crate::os::set_cloexec(&stream);
    let (work_tx, work_rx) = unbounded();
    let output = OutputScheduler::new(listener.tunables.buffer_warn_threshold);

    // Read pump: socket bytes into the work queue.
    let mut read_half = stream.try_clone().context("clone peer stream")?;
    let pump_tx = work_tx.clone();
    let bufsize = listener.tunables.read_buffer_size;
    std::thread::Builder::new()
      .name("conn-read".to_string())
      .spawn(move || {
        let mut buf = vec![0u8; bufsize];
        loop {
          match read_half.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
              if pump_tx.send(ConnWork::Bytes(buf[..n].to_vec())).is_err() {
                return;
              }
            }
          }
        }
        let _ = pump_tx.send(ConnWork::Eof);
      })
      .expect("failed to spawn conn read pump");

    let events = {
      let listener = Arc::clone(&listener);
      let id = id;
      OutputEvents {
        throttle_resumed: Box::new(move || {
          let mut m = Marshaler::new(proto::THROTTLE_RESUME);
          m.add_id(&id);
          let frame = m.finish();
          listener.resume_tasks(id);
          listener.forward_to_servers(&frame);
        }),
        input_sent: Box::new(|| {}),
      }
    };
    let output_join = output.start(Box::new(FdSink::new(stream.into())), events);

    let max_frame = listener.tunables.max_frame_length;
    let machine = ClientMachine::new(listener.id(), PROTOCOL_RAW, max_frame);

    let mut instance = Self {
      id,
      listener,
      work_rx,
      output: Arc::clone(&output),
      output_join: Some(output_join),
      machine,
      peer: None,
      keepalive_ms: None,
      last_rx: Instant::now(),
    };

    let join = std::thread::Builder::new()
      .name("conn".to_string())
      .spawn(move || instance.run())
      .expect("failed to spawn conn thread");

    Ok(ConnRegistration { id, work: work_tx, output, join })
  }

  fn run(&mut self) {
    let mut close_reason = proto::STATUS_LOST_CONN;

    loop {
      let timeout = match self.keepalive_ms {
        Some(ms) => Duration::from_millis(ms / 2),
        None => Duration::from_secs(60),
      };
      match self.work_rx.recv_timeout(timeout) {
        Ok(ConnWork::Close(reason)) => {
          close_reason = reason;
          break;
        }
        Ok(ConnWork::Bytes(bytes)) => {
          self.last_rx = Instant::now();
          match self.feed(&bytes) {
            Ok(true) => {}
            Ok(false) => {
              close_reason = proto::STATUS_NORMAL;
              break;
            }
            Err(e) => {
              error!("conn {}: {e:#}", self.id);
              close_reason = proto::STATUS_PROTOCOL_ERROR;
              break;
            }
          }
        }
        Ok(ConnWork::Eof) => {
          debug!("conn {}: peer EOF", self.id);
          break;
        }
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
          if let Some(ms) = self.keepalive_ms {
            if self.last_rx.elapsed() >= Duration::from_millis(ms) {
              debug!("conn {}: keepalive timed out", self.id);
              close_reason = proto::STATUS_IDLE_TIMEOUT;
              break;
            }
            let _ = self.output.submit_command(Marshaler::new(proto::KEEPALIVE).finish());
          }
        }
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
      }
    }

    self.handle_close(close_reason);
  }

  /// Feeds bytes to the handshake or framing machine.
  fn feed(&mut self, bytes: &[u8]) -> anyhow::Result<bool> {
    let listener = Arc::clone(&self.listener);
    let src = CommandSource { listener: &listener, writer: &self.output, conn_id: self.id };
    let peer = self.peer;
    let mut actions: Vec<PeerAction> = Vec::new();

    let steps = {
      let mut check = |candidate: &InstanceId| listener.check_server(candidate);
      let mut dispatch = |command: u32, body: &[u8]| {
        let peer_id = peer.unwrap_or_else(InstanceId::nil);
        match handle_peer_frame(&src, peer_id, command, body) {
          Ok(PeerAction::Continue) => Ok(true),
          Ok(action) => {
            actions.push(action);
            Ok(true)
          }
          Err(e) => Err(e),
        }
      };
      self.machine.feed(bytes, &mut check, &mut dispatch)?
    };

    for step in steps {
      match step {
        Step::Send(reply) => {
          let _ = self.output.submit_command(reply);
        }
        Step::Connected { peer, .. } => {
          debug!("conn {}: connected to server {peer}", self.id);
          self.peer = Some(peer);
          self.post_connect(peer);
        }
        Step::Rejected { client_version } => {
          warn!("conn {}: handshake rejected ({client_version:#x})", self.id);
          return Ok(false);
        }
        Step::Continue | Step::Attributes(_) => {}
      }
    }

    for action in actions {
      match action {
        PeerAction::Close(_) => return Ok(false),
        PeerAction::SetKeepalive(ms) => {
          self.keepalive_ms = Some(u64::from(ms).max(1000));
        }
        PeerAction::Continue => {}
      }
    }
    Ok(true)
  }

  /// Announces ourselves and registers the peer's proxy.
  fn post_connect(&mut self, peer: InstanceId) {
    // The initial attribute map: our public server attributes.
    let attributes = self.listener.attributes_snapshot();
    let map = crate::proto::attrs::marshal_map_bytes(&attributes);
    let mut prefixed = Vec::with_capacity(4 + map.len());
    prefixed.extend_from_slice(&(map.len() as u32).to_le_bytes());
    prefixed.extend_from_slice(&map);
    let _ = self.output.submit_command(prefixed);

    let link = crate::mux::proxy::ConnLink { conn_id: self.id, output: Arc::clone(&self.output) };
    let proxy =
      crate::mux::proxy::ServerProxy::new(peer, 1, link, crate::proto::attrs::AttributeMap::new());
    if self.listener.register_server(&proxy) {
      for frame in self.listener.announce_frames() {
        let _ = self.output.submit_command(frame);
      }
    }

    // Ask the peer to probe us at our idle cadence.
    let mut m = Marshaler::new(proto::CONFIGURE_KEEPALIVE);
    m.add_number(self.listener.tunables.idle_last_timeout_ms as u32);
    let _ = self.output.submit_command(m.finish());
  }

  fn handle_close(&mut self, reason: u32) {
    self.output.stop();
    if let Some(join) = self.output_join.take() {
      let _ = join.join();
    }

    if let Some(peer) = self.peer.take() {
      self.listener.unregister_server(&peer, reason);
      let mut m = Marshaler::new(proto::REMOVE_SERVER);
      m.add_id(&peer);
      m.add_number(reason);
      self.listener.forward_to_servers(&m.finish());
    }

    debug!("conn {}: goodbye", self.id);
    self.listener.send_work(ListenerWork::RemoveConn(self.id));
  }
}

