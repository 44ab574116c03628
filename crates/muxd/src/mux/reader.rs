//! Client reader worker.
//!
//! One per accepted connection. Speaks the server side of the handshake,
//! consumes the initial attribute map, registers the client, and then
//! dispatches framed commands. The paired output scheduler (the writer)
//! delivers everything client-bound; watches replicate entity state into
//! this worker, which turns it into frames.
//!
//! A connection that requests the raw protocol during the handshake is a
//! peer server dialing in: the reader then runs peer semantics instead of
//! registering a client.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, warn};

use crate::id::InstanceId;
use crate::mux::commands::{
  self, CommandSource, PeerAction, frame_of, handle_peer_frame,
};
use crate::mux::listener::{ClientInfo, Listener, ListenerWork, ReaderRegistration};
use crate::mux::output::{FdSink, OutputEvents, OutputScheduler};
use crate::mux::watch::{Watch, WatchTarget};
use crate::proto::machine::{ServerMachine, Step};
use crate::proto::wire::{Marshaler, ProtocolError, Unmarshaler};
use crate::proto::{self, CommandClass, attrs, handshake};

/// Term-state push flags.
const STATE_CLOSED: u32 = 1 << 0;
const STATE_BUFFER_SWITCHED: u32 = 1 << 1;
const STATE_SIZE_CHANGED: u32 = 1 << 2;
const STATE_CURSOR_CHANGED: u32 = 1 << 3;
const STATE_FLAGS_CHANGED: u32 = 1 << 4;

pub enum ReaderWork {
  Close(u32),
  Bytes(Vec<u8>),
  Eof,
  AddWatch(Arc<Watch>),
  WatchActivated(u64),
  PostConfirm,
}

pub struct Reader {
  id: InstanceId,
  listener: Arc<Listener>,
  work_rx: Receiver<ReaderWork>,
  writer: Arc<OutputScheduler>,
  writer_join: Option<std::thread::JoinHandle<()>>,
  machine: ServerMachine,
  environ: HashMap<String, String>,
  /// The handshake client (client mode).
  client: Option<InstanceId>,
  /// Additional clients announced through this connection.
  known_clients: HashSet<InstanceId>,
  /// Set when the peer requested the raw protocol.
  peer_server: Option<InstanceId>,
  watches: HashMap<u64, Arc<Watch>>,
  keepalive_ms: Option<u64>,
  last_rx: Instant,
}

impl Reader {
  /// Starts a reader for an accepted connection.
  pub fn spawn(
    listener: Arc<Listener>,
    stream: UnixStream,
    environ: HashMap<String, String>,
  ) -> Result<ReaderRegistration> {
    let id = InstanceId::generate();
    let _ = crate::os::set_cloexec(&stream);
    let (work_tx, work_rx) = unbounded();
    let writer = OutputScheduler::new(listener.tunables.buffer_warn_threshold);

    let mut read_half = stream.try_clone().context("clone client stream")?;
    let pump_tx = work_tx.clone();
    let bufsize = listener.tunables.read_buffer_size;
    std::thread::Builder::new()
      .name("reader-read".to_string())
      .spawn(move || {
        let mut buf = vec![0u8; bufsize];
        loop {
          match read_half.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
              if pump_tx.send(ReaderWork::Bytes(buf[..n].to_vec())).is_err() {
                return;
              }
            }
          }
        }
        let _ = pump_tx.send(ReaderWork::Eof);
      })
      .expect("failed to spawn reader read pump");

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
    let writer_join = writer.start(Box::new(FdSink::new(stream.into())), events);

    let max_frame = listener.tunables.max_frame_length;
    let machine = ServerMachine::new(max_frame);

    let mut reader = Self {
      id,
      listener,
      work_rx,
      writer: Arc::clone(&writer),
      writer_join: Some(writer_join),
      machine,
      environ,
      client: None,
      known_clients: HashSet::new(),
      peer_server: None,
      watches: HashMap::new(),
      keepalive_ms: None,
      last_rx: Instant::now(),
    };

    let join = std::thread::Builder::new()
      .name("reader".to_string())
      .spawn(move || reader.run())
      .expect("failed to spawn reader thread");

    Ok(ReaderRegistration { id, work: work_tx, join })
  }

  fn run(&mut self) {
    // The server speaks first.
    let hello = handshake::hello(&self.listener.id());
    let _ = self.writer.submit_command(hello);

    let mut close_reason = proto::STATUS_LOST_CONN;
    let mut announce_disconnect = true;

    loop {
      let timeout = match self.keepalive_ms {
        Some(ms) => Duration::from_millis((ms / 2).max(250)),
        None => Duration::from_secs(60),
      };
      match self.work_rx.recv_timeout(timeout) {
        Ok(ReaderWork::Close(reason)) => {
          close_reason = reason;
          break;
        }
        Ok(ReaderWork::Bytes(bytes)) => {
          self.last_rx = Instant::now();
          match self.feed(&bytes) {
            Ok(true) => {}
            Ok(false) => {
              close_reason = proto::STATUS_NORMAL;
              announce_disconnect = false;
              break;
            }
            Err(e) => {
              error!("reader {}: {e:#}", self.id);
              close_reason = proto::STATUS_PROTOCOL_ERROR;
              break;
            }
          }
        }
        Ok(ReaderWork::Eof) => {
          debug!("reader {}: connection closed", self.id);
          announce_disconnect = false;
          break;
        }
        Ok(ReaderWork::AddWatch(watch)) => {
          self.watches.insert(watch.id, Arc::clone(&watch));
          self.service_watch(&watch);
        }
        Ok(ReaderWork::WatchActivated(id)) => {
          if let Some(watch) = self.watches.get(&id).cloned() {
            self.service_watch(&watch);
          }
        }
        Ok(ReaderWork::PostConfirm) => self.push_server_attributes(),
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
          if let Some(ms) = self.keepalive_ms {
            if self.last_rx.elapsed() >= Duration::from_millis(ms) {
              debug!("reader {}: keepalive timed out", self.id);
              close_reason = proto::STATUS_IDLE_TIMEOUT;
              break;
            }
            let _ = self.writer.submit_command(Marshaler::new(proto::KEEPALIVE).finish());
          }
        }
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
      }
    }

    self.handle_close(close_reason, announce_disconnect);
  }

  /*
   * Handshake and dispatch
   */

  fn feed(&mut self, bytes: &[u8]) -> anyhow::Result<bool> {
    let listener = Arc::clone(&self.listener);
    let src = CommandSource { listener: &listener, writer: &self.writer, conn_id: self.id };

    let peer_server = self.peer_server;
    let client = self.client;
    let known = &self.known_clients;
    let mut announced: Vec<(InstanceId, Vec<u8>)> = Vec::new();
    let mut removed: Vec<InstanceId> = Vec::new();
    let mut actions: Vec<PeerAction> = Vec::new();

    let steps = {
      let mut dispatch = |command: u32, body: &[u8]| {
        if let Some(peer) = peer_server {
          match handle_peer_frame(&src, peer, command, body) {
            Ok(PeerAction::Continue) => Ok(true),
            Ok(action) => {
              actions.push(action);
              Ok(true)
            }
            Err(e) => Err(e),
          }
        } else {
          dispatch_client_frame(
            &src,
            client,
            known,
            command,
            body,
            &mut announced,
            &mut removed,
            &mut actions,
          )
        }
      };
      self.machine.feed(bytes, &mut dispatch)?
    };

    for (client_id, _announce) in announced {
      self.known_clients.insert(client_id);
    }
    for client_id in removed {
      self.known_clients.remove(&client_id);
    }

    for step in steps {
      match step {
        Step::Connected { peer, protocol_type } => {
          if !self.handle_connected(peer, protocol_type) {
            return Ok(false);
          }
        }
        Step::Attributes(map) => {
          if !self.handle_attributes(&map)? {
            return Ok(false);
          }
        }
        Step::Rejected { client_version } => {
          debug!("reader {}: client rejected handshake ({client_version:#x})", self.id);
          let reason = match client_version {
            proto::VERSION_PROTOCOL_MISMATCH => proto::STATUS_PROTOCOL_MISMATCH,
            proto::VERSION_DUPLICATE_CONN => proto::STATUS_DUPLICATE_CONN,
            _ => proto::STATUS_REJECT,
          };
          self.push_disconnect(reason);
          return Ok(false);
        }
        Step::Send(reply) => {
          let _ = self.writer.submit_command(reply);
        }
        Step::Continue => {}
      }
    }

    for action in actions {
      match action {
        PeerAction::Close(_) => return Ok(false),
        PeerAction::SetKeepalive(ms) => self.keepalive_ms = Some(u64::from(ms).max(1000)),
        PeerAction::Continue => {}
      }
    }
    Ok(true)
  }

  /// Handshake response arrived: sanity-check the client id.
  fn handle_connected(&mut self, peer: InstanceId, protocol_type: u32) -> bool {
    if protocol_type == proto::PROTOCOL_RAW {
      if !self.listener.check_server(&peer) {
        self.push_disconnect(proto::STATUS_DUPLICATE_CONN);
        return false;
      }
      debug!("reader {}: peer server {peer} connected", self.id);
      self.peer_server = Some(peer);
      return true;
    }

    if self.listener.known_client(&peer) {
      warn!("reader {}: duplicate client id {peer}", self.id);
      self.push_disconnect(proto::STATUS_DUPLICATE_CONN);
      return false;
    }
    debug!("reader {}: client {peer} connected", self.id);
    self.client = Some(peer);
    true
  }

  /// The initial attribute map completes registration.
  fn handle_attributes(&mut self, map_bytes: &[u8]) -> Result<bool, ProtocolError> {
    let mut unm = Unmarshaler::new(map_bytes);
    let mut attributes = attrs::AttributeMap::new();
    attrs::parse_utf8_map(&mut unm, &mut attributes)?;

    if let Some(peer) = self.peer_server {
      // Inbound peer: register its proxy and introduce ourselves.
      let link = crate::mux::proxy::ConnLink { conn_id: self.id, output: Arc::clone(&self.writer) };
      let proxy = crate::mux::proxy::ServerProxy::new(peer, 1, link, attributes);
      if !self.listener.register_server(&proxy) {
        self.push_disconnect(proto::STATUS_DUPLICATE_CONN);
        return Ok(false);
      }
      for frame in self.listener.announce_frames() {
        let _ = self.writer.submit_command(frame);
      }
      return Ok(true);
    }

    let Some(client_id) = self.client else {
      return Ok(false);
    };

    if let Some(value) = attributes.get(attrs::ATTR_COMMAND_KEEPALIVE)
      && let Ok(ms) = value.parse::<u64>()
    {
      self.keepalive_ms = Some((ms / 2).max(1000));
    }
    let flags = attributes
      .get("client.flags")
      .and_then(|v| v.parse().ok())
      .unwrap_or(proto::FLAG_TAKE_OWNERSHIP);

    let mut announce = Marshaler::new(proto::ANNOUNCE_CLIENT);
    announce.add_id(&client_id);
    announce.add_number(1);
    announce.add_number(flags);
    attrs::marshal_map(&mut announce, &attributes);
    let announce = announce.finish();

    let info = ClientInfo {
      hops: 0,
      flags,
      attributes,
      writer: Arc::clone(&self.writer),
      via: self.id,
      environ: self.environ.clone(),
      announce: announce.clone(),
    };
    if !self.listener.register_client(client_id, info) {
      self.push_disconnect(proto::STATUS_DUPLICATE_CONN);
      return Ok(false);
    }
    self.listener.forward_to_servers(&announce);
    self.listener.send_work(ListenerWork::ConfirmReader(self.id));
    Ok(true)
  }

  fn push_disconnect(&self, reason: u32) {
    let mut m = Marshaler::new(proto::DISCONNECT);
    m.add_number(reason);
    let _ = self.writer.submit_command(m.finish());
  }

  /// Sends the server's attribute snapshot after confirmation.
  fn push_server_attributes(&self) {
    let Some(client) = self.client else { return };
    let snapshot = self.listener.attributes_snapshot();
    for (key, value) in snapshot {
      if attrs::is_private(&key) {
        continue;
      }
      let mut m = Marshaler::new(proto::CLIENT_ATTRIBUTE);
      m.add_id(&client);
      m.add_id(&self.listener.id());
      m.add_string(&key);
      m.add_string(&value);
      let _ = self.writer.submit_command(m.finish());
    }
  }

  /*
   * Watch servicing
   */

  fn service_watch(&mut self, watch: &Arc<Watch>) {
    let Some(client) = self.client else {
      // Peer-mode readers carry no watches.
      return;
    };
    let state = watch.take_state();
    let source = watch.target.id();

    for (key, value) in &state.attributes {
      let mut m = Marshaler::new(proto::CLIENT_ATTRIBUTE);
      m.add_id(&client);
      m.add_id(&source);
      m.add_string(key);
      m.add_string(value);
      let _ = self.writer.submit_command(m.finish());
    }

    if let Some(owner) = state.ownership {
      let mut m = Marshaler::new(proto::CLIENT_OWNERSHIP);
      m.add_id(&client);
      m.add_id(&source);
      m.add_id(&owner);
      let _ = self.writer.submit_command(m.finish());
    }

    if let WatchTarget::Term { id: term_id, state: term_state } = &watch.target {
      if !state.changed_rows.is_empty() {
        let frames = {
          let term = term_state.lock();
          let mut frames = Vec::new();
          for &(bufid, index) in &state.changed_rows {
            if let Some(row) = term.buffers.get(bufid).row(index) {
              frames.push(commands::row_frame(&client, term_id, bufid, index, row));
            }
          }
          frames
        };
        for frame in frames {
          let _ = self.writer.submit_command(frame);
        }
      }

      for &(bufid, region_id) in &state.changed_regions {
        let frame = {
          let term = term_state.lock();
          match term.buffers.get(bufid).regions().get(region_id) {
            Some(region) => commands::region_frame(&client, term_id, bufid, region),
            None => commands::deleted_region_frame(&client, term_id, bufid, region_id),
          }
        };
        let _ = self.writer.submit_command(frame);
      }
    }

    for mut frame in state.frames {
      // Pre-built frames carry a nil destination; stamp in ours.
      if frame.len() >= 24 {
        frame[8..24].copy_from_slice(client.as_bytes());
      }
      let _ = self.writer.submit_command(frame);
    }

    let mut flags = 0u32;
    if state.buffer_switched {
      flags |= STATE_BUFFER_SWITCHED;
    }
    if state.size_changed {
      flags |= STATE_SIZE_CHANGED;
    }
    if state.cursor_changed {
      flags |= STATE_CURSOR_CHANGED;
    }
    if state.flags_changed {
      flags |= STATE_FLAGS_CHANGED;
    }
    if let Some(reason) = state.closed {
      flags |= STATE_CLOSED;
      let mut m = Marshaler::new(proto::CLIENT_TERM_STATE);
      m.add_id(&client);
      m.add_id(&source);
      m.add_number(flags);
      m.add_number(state.bell_count);
      m.add_number(reason);
      let _ = self.writer.submit_command(m.finish());

      watch.release_from_reader();
      self.watches.remove(&watch.id);
    } else if flags != 0 || state.bell_count > 0 {
      let mut m = Marshaler::new(proto::CLIENT_TERM_STATE);
      m.add_id(&client);
      m.add_id(&source);
      m.add_number(flags);
      m.add_number(state.bell_count);
      m.add_number(proto::STATUS_NORMAL);
      let _ = self.writer.submit_command(m.finish());
    }
  }

  /*
   * Teardown
   */

  fn handle_close(&mut self, reason: u32, announce: bool) {
    if announce {
      self.push_disconnect(reason);
    }

    // Unregister every client that arrived through this connection.
    let mut departing: Vec<InstanceId> = self.known_clients.drain().collect();
    if let Some(client) = self.client.take() {
      departing.push(client);
    }
    for client_id in departing {
      let mut m = Marshaler::new(proto::REMOVE_CLIENT);
      m.add_id(&client_id);
      self.listener.unregister_client(&client_id, m.finish());
    }

    if let Some(peer) = self.peer_server.take() {
      self.listener.unregister_server(&peer, reason);
      let mut m = Marshaler::new(proto::REMOVE_SERVER);
      m.add_id(&peer);
      m.add_number(reason);
      self.listener.forward_to_servers(&m.finish());
    }

    for (_, watch) in self.watches.drain() {
      watch.release_from_reader();
    }

    self.writer.stop();
    if let Some(join) = self.writer_join.take() {
      let _ = join.join();
    }

    debug!("reader {}: goodbye", self.id);
    self.listener.send_work(ListenerWork::RemoveReader(self.id));
  }
}

/// Dispatches one frame from a registered client.
#[allow(clippy::too_many_arguments)]
fn dispatch_client_frame(
  src: &CommandSource<'_>,
  client: Option<InstanceId>,
  known: &HashSet<InstanceId>,
  command: u32,
  body: &[u8],
  announced: &mut Vec<(InstanceId, Vec<u8>)>,
  removed: &mut Vec<InstanceId>,
  actions: &mut Vec<PeerAction>,
) -> Result<bool, ProtocolError> {
  let listener = src.listener;
  let class = CommandClass::of(command).ok_or(ProtocolError::UnknownClass(command >> 24))?;
  let mut unm = Unmarshaler::new(body);

  match class {
    CommandClass::Plain => match command {
      proto::KEEPALIVE | proto::CHANNEL_TEST => {}
      proto::CONFIGURE_KEEPALIVE => actions.push(PeerAction::SetKeepalive(unm.parse_number())),
      proto::DISCONNECT => return Ok(false),
      proto::THROTTLE_PAUSE => {
        let hop = unm.parse_id();
        let task = unm.parse_id();
        listener.throttle_task(&task, hop);
      }
      proto::THROTTLE_RESUME => {
        let hop = unm.parse_id();
        listener.resume_tasks(hop);
        listener.forward_to_servers(&frame_of(command, body));
      }
      proto::ANNOUNCE_CLIENT => {
        unm.require(InstanceId::SIZE + 8)?;
        let client_id = unm.parse_id();
        let hops = unm.parse_number();
        let flags = unm.parse_number();
        let attributes = attrs::parse_filtered_map(&mut unm, |_| false)?;

        let mut announce = Marshaler::new(proto::ANNOUNCE_CLIENT);
        announce.add_id(&client_id);
        announce.add_number(hops.saturating_add(1));
        announce.add_number(flags);
        attrs::marshal_map(&mut announce, &attributes);
        let announce = announce.finish();

        let info = ClientInfo {
          hops,
          flags,
          attributes,
          writer: Arc::clone(src.writer),
          via: src.conn_id,
          environ: HashMap::new(),
          announce: announce.clone(),
        };
        if listener.register_client(client_id, info) {
          listener.forward_to_servers(&announce);
          announced.push((client_id, announce));
        }
      }
      proto::REMOVE_CLIENT => {
        let client_id = unm.parse_id();
        if known.contains(&client_id) {
          listener.unregister_client(&client_id, frame_of(command, body));
          removed.push(client_id);
        }
      }
      _ => debug!("reader: unknown plain command {command:#010x}"),
    },
    CommandClass::Server => {
      unm.require(2 * InstanceId::SIZE)?;
      let dest = unm.parse_id();
      let mut sender = unm.parse_id();
      // The direct client cannot spoof another sender.
      if let Some(client) = client
        && !known.contains(&sender)
      {
        sender = client;
      }
      if dest == listener.id() {
        commands::handle_local_server_command(src, command, sender, &mut unm)?;
      } else {
        commands::forward_frame(src, class, &dest, None, frame_of(command, body));
      }
    }
    CommandClass::Term => {
      unm.require(2 * InstanceId::SIZE)?;
      let dest = unm.parse_id();
      let mut sender = unm.parse_id();
      if let Some(client) = client
        && !known.contains(&sender)
      {
        sender = client;
      }
      match listener.term_link(&dest) {
        Some(link) => commands::handle_local_term_command(src, &link, command, sender, &mut unm)?,
        None => {
          commands::forward_frame(src, class, &dest, None, frame_of(command, body));
        }
      }
    }
    CommandClass::Client => {
      unm.require(InstanceId::SIZE)?;
      let dest = unm.parse_id();
      commands::forward_frame(src, class, &dest, None, frame_of(command, body));
    }
  }
  Ok(true)
}
