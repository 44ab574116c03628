//! Frame dispatch shared by readers and peer connections.
//!
//! Frames are dispatched by command class. Plain frames act on arrival;
//! Server frames either run against this server or forward toward their
//! destination; Term frames run against a local terminal or forward toward
//! its proxy; Client frames forward toward the client. Forwarding that hits
//! a throttled scheduler earns the sender a throttle-pause carrying the hop.

use std::sync::Arc;

use log::{debug, warn};

use crate::id::InstanceId;
use crate::mux::listener::{ForwardResult, Listener, ListenerWork, TermLink};
use crate::mux::output::OutputScheduler;
use crate::mux::term::{TermInstance, TermWork};
use crate::proto::wire::{Marshaler, ProtocolError, Unmarshaler};
use crate::proto::{self, CommandClass, attrs};
use crate::tasks;

/// The sending side of a dispatch: where replies and throttle-pauses go.
pub struct CommandSource<'a> {
  pub listener: &'a Arc<Listener>,
  /// Scheduler reaching back toward the sender.
  pub writer: &'a Arc<OutputScheduler>,
  /// This connection's id; the hop identity for throttle signals.
  pub conn_id: InstanceId,
}

impl CommandSource<'_> {
  /// Reply directly to the peer on this connection.
  pub fn reply(&self, frame: Vec<u8>) {
    let _ = self.writer.submit_command(frame);
  }

  /// Emits a throttle-pause toward the sender for a throttled forward.
  pub fn push_throttle_pause(&self, hop: &InstanceId, task_or_dest: &InstanceId) {
    let mut m = Marshaler::new(proto::THROTTLE_PAUSE);
    m.add_id(hop);
    m.add_id(task_or_dest);
    m.add_number64(0);
    m.add_number64(0);
    self.reply(m.finish());
  }
}

/// Handles a Server-class frame addressed to this server.
pub fn handle_local_server_command(
  src: &CommandSource<'_>,
  command: u32,
  sender: InstanceId,
  unm: &mut Unmarshaler<'_>,
) -> Result<(), ProtocolError> {
  let listener = src.listener;
  match command {
    proto::GET_SERVER_ATTRIBUTE => {
      let key = unm.parse_string();
      let mut m = Marshaler::new(proto::CLIENT_ATTRIBUTE);
      m.add_id(&sender);
      m.add_id(&listener.id());
      m.add_string(&key);
      if let Some(value) = listener.get_attribute(&key) {
        m.add_string(&value);
      }
      let _ = listener.forward_to_client(&sender, m.finish());
    }
    proto::SET_SERVER_ATTRIBUTE => {
      unm.validate_utf8()?;
      let key = unm.parse_string();
      let value = unm.parse_string();
      listener.set_attribute(key, value, true);
    }
    proto::REMOVE_SERVER_ATTRIBUTE => {
      unm.validate_utf8()?;
      let key = unm.parse_string();
      listener.remove_attribute(&key, true);
    }
    proto::CREATE_TERM => {
      let term_id = unm.parse_id();
      let cols = unm.parse_number() as u16;
      let rows = unm.parse_number() as u16;
      let requested = attrs::parse_filtered_map(unm, |key| {
        crate::os::restricted_term_attribute(key, true)
      })?;
      let (owner_attributes, environ) = listener.owner_attributes(&sender);
      let registration = TermInstance::spawn(
        Arc::clone(listener),
        term_id,
        Some(sender),
        crate::emu::TermSize::new(cols.max(2), rows.max(2)),
        owner_attributes,
        environ,
        requested,
      );
      listener.send_work(ListenerWork::AddTerm(registration));
    }
    proto::MONITOR_INPUT => {
      listener.monitor_input(unm.remaining_bytes().to_vec());
    }
    proto::TASK_INPUT => {
      let task_id = unm.parse_id();
      listener.input_task(&task_id, unm.remaining_bytes().to_vec());
    }
    proto::TASK_ANSWER => {
      let task_id = unm.parse_id();
      let answer = unm.parse_number();
      listener.answer_task(&task_id, answer);
    }
    proto::TASK_CANCEL => {
      let task_id = unm.parse_id();
      listener.cancel_task(&task_id);
    }
    proto::TASK_FILE_DOWNLOAD
    | proto::TASK_FILE_UPLOAD
    | proto::TASK_PIPE_DOWNLOAD
    | proto::TASK_PIPE_UPLOAD
    | proto::TASK_RUN_COMMAND
    | proto::TASK_PORT_OUT
    | proto::TASK_PORT_IN
    | proto::TASK_MOUNT_RO
    | proto::TASK_MOUNT_RW
    | proto::TASK_FILE_DELETE
    | proto::TASK_FILE_RENAME => {
      launch_task(listener, command, sender, unm)?;
    }
    _ => debug!("unknown server command {command:#010x}"),
  }
  Ok(())
}

/// Parses a task launch frame and hands it to the listener for duplicate
/// checking and start.
pub fn launch_task(
  listener: &Arc<Listener>,
  command: u32,
  client_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
) -> Result<(), ProtocolError> {
  unm.require(InstanceId::SIZE)?;
  let task_id = unm.parse_id();

  let launch = match command {
    proto::TASK_FILE_DOWNLOAD => tasks::download::launch_file(listener, client_id, task_id, unm),
    proto::TASK_PIPE_DOWNLOAD => tasks::download::launch_pipe(listener, client_id, task_id, unm),
    proto::TASK_FILE_UPLOAD => tasks::upload::launch_file(listener, client_id, task_id, unm),
    proto::TASK_PIPE_UPLOAD => tasks::upload::launch_pipe(listener, client_id, task_id, unm),
    proto::TASK_RUN_COMMAND => tasks::run::launch(listener, client_id, task_id, unm),
    proto::TASK_PORT_OUT => tasks::port::launch_out(listener, client_id, task_id, unm),
    proto::TASK_PORT_IN => tasks::port::launch_in(listener, client_id, task_id, unm),
    proto::TASK_MOUNT_RO => tasks::mount::launch(listener, client_id, task_id, unm, true),
    proto::TASK_MOUNT_RW => tasks::mount::launch(listener, client_id, task_id, unm, false),
    proto::TASK_FILE_DELETE => tasks::misc::launch(listener, client_id, task_id, unm, false),
    proto::TASK_FILE_RENAME => tasks::misc::launch(listener, client_id, task_id, unm, true),
    _ => return Ok(()),
  };

  match launch {
    Ok(launch) => listener.send_work(ListenerWork::AddTask(Box::new(launch))),
    Err(e) => warn!("task launch failed: {e:#}"),
  }
  Ok(())
}

/// Handles a Term-class frame against a local terminal. Runs on the calling
/// worker's thread; reads lock the terminal state, mutations go through the
/// terminal's work queue.
pub fn handle_local_term_command(
  src: &CommandSource<'_>,
  link: &TermLink,
  command: u32,
  sender: InstanceId,
  unm: &mut Unmarshaler<'_>,
) -> Result<(), ProtocolError> {
  let listener = src.listener;
  match command {
    proto::TERM_INPUT => {
      let _ = link.output.submit_data(unm.remaining_bytes().to_vec());
    }
    proto::TERM_RESIZE => {
      let cols = unm.parse_number() as u16;
      let rows = unm.parse_number() as u16;
      let _ = link.work.send(TermWork::Resize { cols, rows });
    }
    proto::TERM_RESET => {
      let flags = unm.parse_number();
      let _ = link.work.send(TermWork::Reset(flags));
    }
    proto::TERM_SIGNAL => {
      let signal = unm.parse_number();
      let _ = link.work.send(TermWork::Signal(signal));
    }
    proto::TERM_MOUSE_MOVE => {
      let x = unm.parse_number();
      let y = unm.parse_number();
      let _ = link.work.send(TermWork::MouseMove { x, y });
    }
    proto::TERM_GET_ROWS => {
      let bufid = unm.parse_number() as u8;
      let start = unm.parse_number64();
      let end = unm.parse_number64();
      push_rows(listener, link, &sender, bufid, start, end);
    }
    proto::TERM_GET_REGION => {
      let bufid = unm.parse_number() as u8;
      let region_id = unm.parse_number();
      let frame = {
        let state = link.state.lock();
        state.buffers.get(bufid).regions().get(region_id).map(|region| {
          region_frame(&sender, &link.id, bufid, region)
        })
      };
      if let Some(frame) = frame {
        let _ = listener.forward_to_client(&sender, frame);
      }
    }
    proto::TERM_CREATE_REGION => {
      let _bufid = unm.parse_number() as u8;
      let start_row = unm.parse_number64();
      let start_col = unm.parse_number();
      let end_row = unm.parse_number64();
      let end_col = unm.parse_number();
      let mut attributes = attrs::AttributeMap::new();
      attrs::parse_utf8_map(unm, &mut attributes)?;
      let _ = link.work.send(TermWork::CreateUserRegion {
        start_row,
        start_col,
        end_row,
        end_col,
        attributes,
      });
    }
    proto::TERM_REMOVE_REGION => {
      let bufid = unm.parse_number() as u8;
      let region_id = unm.parse_number();
      let _ = link.work.send(TermWork::RemoveRegion { bufid, id: region_id });
    }
    proto::TERM_SET_ATTRIBUTE => {
      unm.validate_utf8()?;
      let key = unm.parse_string();
      let value = unm.parse_string();
      let from_owner = { link.state.lock().owner == Some(sender) };
      if !crate::os::restricted_term_attribute(&key, from_owner) {
        let _ = link.work.send(TermWork::SetAttribute { key, value });
      }
    }
    proto::TERM_REMOVE_ATTRIBUTE => {
      unm.validate_utf8()?;
      let key = unm.parse_string();
      let from_owner = { link.state.lock().owner == Some(sender) };
      if !crate::os::restricted_term_attribute(&key, from_owner) {
        let _ = link.work.send(TermWork::RemoveAttribute { key });
      }
    }
    proto::TERM_GET_ATTRIBUTE => {
      let key = unm.parse_string();
      let mut m = Marshaler::new(proto::CLIENT_ATTRIBUTE);
      m.add_id(&sender);
      m.add_id(&link.id);
      m.add_string(&key);
      if let Some(value) = { link.state.lock().attributes.get(&key).cloned() } {
        m.add_string(&value);
      }
      let _ = listener.forward_to_client(&sender, m.finish());
    }
    proto::TERM_RESIZE_BUFFER => {
      let bufid = unm.parse_number() as u8;
      let caporder = unm.parse_number() as u8;
      let _ = link.work.send(TermWork::ResizeBuffer { bufid, caporder });
    }
    proto::TERM_UPDATE_ENVIRON => {
      let mut map = attrs::AttributeMap::new();
      attrs::parse_utf8_map(unm, &mut map)?;
      let environ = map.into_iter().collect();
      let _ = link.work.send(TermWork::UpdateEnviron(environ));
    }
    proto::TERM_CLOSE => {
      let reason = unm.parse_number();
      let _ = link.work.send(TermWork::Close(if reason == 0 { proto::STATUS_NORMAL } else { reason }));
    }
    proto::TERM_DUPLICATE => {
      let new_id = unm.parse_id();
      let cols = unm.parse_number() as u16;
      let rows = unm.parse_number() as u16;
      duplicate_term(listener, link, new_id, sender, cols, rows);
    }
    proto::TERM_REQUEST_OWNERSHIP => {
      let (attributes, environ) = listener.owner_attributes(&sender);
      let from = { link.state.lock().owner };
      let change = crate::mux::listener::OwnershipChange { from, to: sender, attributes, environ };
      let _ = link.work.send(TermWork::ChangeOwner(Arc::new(change)));
    }
    proto::TERM_SCROLL_LOCK => {
      let hard = unm.parse_number() != 0;
      let enabled = unm.parse_number() != 0;
      let _ = link.work.send(TermWork::ScrollLock { hard, enabled });
    }
    proto::TERM_GET_CONTENT => {
      let task_id = unm.parse_id();
      let content_id = unm.parse_number64();
      let chunk_size = unm.parse_number();
      let window_size = unm.parse_number();
      let data = { link.state.lock().emulator.content(content_id) };
      match tasks::image::launch(listener, sender, task_id, content_id, data, chunk_size, window_size)
      {
        Ok(launch) => listener.send_work(ListenerWork::AddTask(Box::new(launch))),
        Err(e) => warn!("image task launch failed: {e:#}"),
      }
    }
    _ => debug!("unknown term command {command:#010x}"),
  }
  Ok(())
}

/// Builds a fresh terminal from an existing one: same public attributes,
/// new id and owner.
fn duplicate_term(
  listener: &Arc<Listener>,
  link: &TermLink,
  new_id: InstanceId,
  owner: InstanceId,
  cols: u16,
  rows: u16,
) {
  let inherited = {
    let state = link.state.lock();
    let mut map = attrs::AttributeMap::new();
    for (key, value) in &state.attributes {
      if !crate::os::restricted_term_attribute(key, false) && !attrs::is_private(key) {
        map.insert(key.clone(), value.clone());
      }
    }
    map
  };
  let (owner_attributes, environ) = listener.owner_attributes(&owner);
  let registration = TermInstance::spawn(
    Arc::clone(listener),
    new_id,
    Some(owner),
    crate::emu::TermSize::new(cols.max(2), rows.max(2)),
    owner_attributes,
    environ,
    inherited,
  );
  listener.send_work(ListenerWork::AddTerm(registration));
}

/// Streams a row range (and the regions intersecting it) to a client.
fn push_rows(
  listener: &Arc<Listener>,
  link: &TermLink,
  client: &InstanceId,
  bufid: u8,
  start: u64,
  end: u64,
) {
  let frames = {
    let state = link.state.lock();
    let sb = state.buffers.get(bufid);
    let mut frames = Vec::new();

    for region in sb.regions().in_range(start, end) {
      frames.push(region_frame(client, &link.id, bufid, region));
    }

    let lo = start.max(sb.origin());
    let hi = (end + 1).min(sb.end());
    for index in lo..hi {
      let Some(row) = sb.row(index) else { continue };
      frames.push(row_frame(client, &link.id, bufid, index, row));
    }
    frames
  };

  for frame in frames {
    if !listener.forward_to_client(client, frame).accepted() {
      break;
    }
  }
}

/// One row's content, flags, and ranges bound for a client.
pub(crate) fn row_frame(
  client: &InstanceId,
  term: &InstanceId,
  bufid: u8,
  index: u64,
  row: &crate::buffer::Row,
) -> Vec<u8> {
  let mut m = Marshaler::new(proto::CLIENT_ROW_DATA);
  m.add_id(client);
  m.add_id(term);
  m.add_number(u32::from(bufid));
  m.add_number64(index);
  m.add_number(row.flags);
  m.add_number(row.ranges.len() as u32);
  for range in &row.ranges {
    m.add_number(range.start);
    m.add_number(range.end);
    m.add_number(range.flags);
    m.add_number(range.fg);
    m.add_number(range.bg);
    m.add_number(range.link);
  }
  m.add_bytes(row.text.as_bytes());
  m.finish()
}

/// A tombstone for a region that no longer exists.
pub(crate) fn deleted_region_frame(
  client: &InstanceId,
  term: &InstanceId,
  bufid: u8,
  region_id: crate::buffer::RegionId,
) -> Vec<u8> {
  let mut m = Marshaler::new(proto::CLIENT_REGION_DATA);
  m.add_id(client);
  m.add_id(term);
  m.add_number(u32::from(bufid));
  m.add_number(region_id);
  m.add_number(u32::MAX);
  m.add_number(crate::buffer::region::REGION_DELETED);
  m.finish()
}

pub(crate) fn region_frame(
  client: &InstanceId,
  term: &InstanceId,
  bufid: u8,
  region: &crate::buffer::Region,
) -> Vec<u8> {
  let mut m = Marshaler::new(proto::CLIENT_REGION_DATA);
  m.add_id(client);
  m.add_id(term);
  m.add_number(u32::from(bufid));
  m.add_number(region.id);
  m.add_number(region.kind as u32);
  m.add_number(region.flags);
  m.add_number64(region.start_row);
  m.add_number(region.start_col);
  m.add_number64(region.end_row);
  m.add_number(region.end_col);
  attrs::marshal_map(&mut m, &region.attributes);
  m.finish()
}

/// What a peer frame asks of the owning connection worker.
pub enum PeerAction {
  Continue,
  Close(u32),
  SetKeepalive(u32),
}

/// Dispatches one frame arriving on a peer connection.
///
/// Announces register proxies and remote clients; registration dedup keeps
/// re-forwarding loop-free (a frame stops at the first server that already
/// knows its subject).
pub fn handle_peer_frame(
  src: &CommandSource<'_>,
  peer_id: InstanceId,
  command: u32,
  body: &[u8],
) -> Result<PeerAction, ProtocolError> {
  let listener = src.listener;
  let class = CommandClass::of(command).ok_or(ProtocolError::UnknownClass(command >> 24))?;
  let mut unm = Unmarshaler::new(body);

  match class {
    CommandClass::Plain => match command {
      proto::KEEPALIVE | proto::CHANNEL_TEST => {}
      proto::CONFIGURE_KEEPALIVE => {
        return Ok(PeerAction::SetKeepalive(unm.parse_number()));
      }
      proto::DISCONNECT => {
        let reason = unm.parse_number();
        debug!("peer {peer_id}: disconnect (reason {reason})");
        return Ok(PeerAction::Close(proto::STATUS_NORMAL));
      }
      proto::THROTTLE_PAUSE => {
        let hop = unm.parse_id();
        let task = unm.parse_id();
        listener.throttle_task(&task, hop);
      }
      proto::THROTTLE_RESUME => {
        let hop = unm.parse_id();
        listener.resume_tasks(hop);
      }
      proto::ANNOUNCE_SERVER => {
        unm.require(InstanceId::SIZE + 8)?;
        let server_id = unm.parse_id();
        let hops = unm.parse_number();
        let _nterms = unm.parse_number();
        let attributes = attrs::parse_filtered_map(&mut unm, |_| false)?;
        if listener.check_server(&server_id) {
          let link = crate::mux::proxy::ConnLink {
            conn_id: src.conn_id,
            output: Arc::clone(src.writer),
          };
          let proxy =
            crate::mux::proxy::ServerProxy::new(server_id, hops.saturating_add(1), link, attributes.clone());
          if listener.register_server(&proxy) {
            let mut m = Marshaler::new(proto::ANNOUNCE_SERVER);
            m.add_id(&server_id);
            m.add_number(hops.saturating_add(1));
            m.add_number(0);
            attrs::marshal_map(&mut m, &attributes);
            listener.forward_to_servers(&m.finish());
          }
        }
      }
      proto::REMOVE_SERVER => {
        let server_id = unm.parse_id();
        let reason = unm.parse_number();
        listener.unregister_server(&server_id, reason);
        let mut m = Marshaler::new(proto::REMOVE_SERVER);
        m.add_id(&server_id);
        m.add_number(reason);
        listener.forward_to_servers(&m.finish());
      }
      proto::ANNOUNCE_TERM => {
        unm.require(2 * InstanceId::SIZE)?;
        let term_id = unm.parse_id();
        let _owner_server = unm.parse_id();
        let attributes = attrs::parse_filtered_map(&mut unm, |_| false)?;
        if listener.term_link(&term_id).is_none() {
          let link = crate::mux::proxy::ConnLink {
            conn_id: src.conn_id,
            output: Arc::clone(src.writer),
          };
          let proxy = crate::mux::proxy::TermProxy::new(term_id, peer_id, link, attributes);
          if listener.register_proxy(&proxy) {
            listener.forward_to_servers(&frame_of(command, body));
          }
        }
      }
      proto::REMOVE_TERM => {
        let term_id = unm.parse_id();
        let reason = unm.parse_number();
        listener.unregister_proxy(&term_id, reason);
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

        let info = crate::mux::listener::ClientInfo {
          hops,
          flags,
          attributes,
          writer: Arc::clone(src.writer),
          via: src.conn_id,
          environ: Default::default(),
          announce: announce.clone(),
        };
        if listener.register_client(client_id, info) {
          listener.forward_to_servers(&announce);
        }
      }
      proto::REMOVE_CLIENT => {
        let client_id = unm.parse_id();
        listener.unregister_client(&client_id, frame_of(command, body));
      }
      _ => debug!("peer {peer_id}: unknown plain command {command:#010x}"),
    },
    CommandClass::Server => {
      unm.require(2 * InstanceId::SIZE)?;
      let dest = unm.parse_id();
      let sender = unm.parse_id();
      if dest == listener.id() {
        handle_local_server_command(src, command, sender, &mut unm)?;
      } else {
        forward_frame(src, class, &dest, None, frame_of(command, body));
      }
    }
    CommandClass::Term => {
      unm.require(2 * InstanceId::SIZE)?;
      let dest = unm.parse_id();
      let sender = unm.parse_id();
      match listener.term_link(&dest) {
        Some(link) => handle_local_term_command(src, &link, command, sender, &mut unm)?,
        None => {
          forward_frame(src, class, &dest, None, frame_of(command, body));
        }
      }
    }
    CommandClass::Client => {
      unm.require(InstanceId::SIZE)?;
      let dest = unm.parse_id();
      forward_frame(src, class, &dest, None, frame_of(command, body));
    }
  }
  Ok(PeerAction::Continue)
}

/// Rebuilds the full frame from a dispatched command and body.
#[must_use]
pub fn frame_of(command: u32, body: &[u8]) -> Vec<u8> {
  let mut m = Marshaler::new(command);
  m.add_bytes(body);
  m.finish()
}

/// Routes a Server/Term/Client frame that is not for this server. Returns
/// false when the recipient is unknown.
pub fn forward_frame(
  src: &CommandSource<'_>,
  class: CommandClass,
  dest: &InstanceId,
  task_hint: Option<&InstanceId>,
  frame: Vec<u8>,
) -> bool {
  let result = match class {
    CommandClass::Server => src.listener.forward_to_server(dest, frame),
    CommandClass::Term => src.listener.forward_to_term(dest, frame),
    CommandClass::Client => src.listener.forward_to_client(dest, frame),
    CommandClass::Plain => ForwardResult::Unknown,
  };
  match result {
    ForwardResult::Accepted => true,
    ForwardResult::Throttled(hop) => {
      src.push_throttle_pause(&hop, task_hint.unwrap_or(dest));
      true
    }
    ForwardResult::Unknown => false,
  }
}
