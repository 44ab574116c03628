//! Port forwarding: one multi-descriptor poll loop per task.
//!
//! Outbound tasks connect to a local TCP or unix endpoint per remote
//! subconnection, carrying the resolved-address iterator for deferred
//! connects. Inbound tasks bind locally and announce accepted connections.
//! Subconnection payloads are multiplexed as `(id, kind, bytes)` records;
//! window backpressure applies to the task's aggregate output.

use std::collections::{HashMap, VecDeque};
use std::net::ToSocketAddrs;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::poll::PollFlags;
use nix::sys::socket::{
  AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, UnixAddr, bind, connect,
  getsockopt, listen, socket, sockopt,
};

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::proto::wire::Unmarshaler;
use crate::proto::{self};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

/// Subconnection record kinds.
pub const PORT_DATA: u32 = 0;
pub const PORT_OPEN: u32 = 1;
pub const PORT_CLOSE: u32 = 2;
pub const PORT_ACK: u32 = 3;

struct SubConn {
  fd: OwnedFd,
  /// Deferred connect still pending; remaining candidate addresses follow.
  connecting: bool,
  candidates: Vec<std::net::SocketAddr>,
  next_candidate: usize,
  outdata: VecDeque<Vec<u8>>,
}

pub struct PortFwd {
  outbound: bool,
  fwd_type: u32,
  address: String,
  port: String,
  accept_fd: Option<OwnedFd>,
  conns: HashMap<u32, SubConn>,
  next_id: u32,
}

impl PortFwd {
  fn push_record(&self, ctx: &mut TaskCtx, id: u32, kind: u32, bytes: &[u8]) {
    let mut payload = Vec::with_capacity(8 + bytes.len());
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(&kind.to_le_bytes());
    payload.extend_from_slice(bytes);
    let frame = ctx.output_frame(&payload);
    ctx.sent += bytes.len() as u64;
    let _ = ctx.throttled_output(frame);
  }

  fn resolve(&self) -> Vec<std::net::SocketAddr> {
    format!("{}:{}", self.address, self.port)
      .to_socket_addrs()
      .map(Iterator::collect)
      .unwrap_or_default()
  }

  fn connect_next(conn: &mut SubConn) -> bool {
    while conn.next_candidate < conn.candidates.len() {
      let addr = conn.candidates[conn.next_candidate];
      conn.next_candidate += 1;

      let family =
        if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
      let Ok(fd) = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK, None)
      else {
        continue;
      };
      let storage = SockaddrStorage::from(addr);
      match connect(fd.as_raw_fd(), &storage) {
        Ok(()) => {
          conn.fd = fd;
          conn.connecting = false;
          return true;
        }
        Err(nix::errno::Errno::EINPROGRESS) => {
          conn.fd = fd;
          conn.connecting = true;
          return true;
        }
        Err(_) => continue,
      }
    }
    false
  }

  fn start_outbound(&mut self, ctx: &mut TaskCtx, id: u32) {
    if self.conns.contains_key(&id) {
      debug!("port-fwd {}: ignoring existing id {id}", ctx.task_id());
      return;
    }

    if self.fwd_type == proto::PORT_FORWARD_UNIX {
      match unix_connect(&self.address) {
        Ok(fd) => {
          self.conns.insert(
            id,
            SubConn { fd, connecting: false, candidates: Vec::new(), next_candidate: 0, outdata: VecDeque::new() },
          );
          self.push_record(ctx, id, PORT_OPEN, &[]);
        }
        Err(e) => {
          debug!("port-fwd {}: {id}: {e}", ctx.task_id());
          self.push_record(ctx, id, PORT_CLOSE, &[]);
        }
      }
      return;
    }

    let candidates = self.resolve();
    if candidates.is_empty() {
      debug!("port-fwd {}: {id}: no addresses for {}:{}", ctx.task_id(), self.address, self.port);
      self.push_record(ctx, id, PORT_CLOSE, &[]);
      return;
    }
    // Placeholder descriptor until connect_next installs the real one.
    let mut conn = SubConn {
      fd: match socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_CLOEXEC, None) {
        Ok(fd) => fd,
        Err(e) => {
          debug!("port-fwd {}: {id}: socket: {e}", ctx.task_id());
          self.push_record(ctx, id, PORT_CLOSE, &[]);
          return;
        }
      },
      connecting: false,
      candidates,
      next_candidate: 0,
      outdata: VecDeque::new(),
    };
    if Self::connect_next(&mut conn) {
      if !conn.connecting {
        self.push_record(ctx, id, PORT_OPEN, &[]);
      }
      self.conns.insert(id, conn);
    } else {
      debug!("port-fwd {}: {id}: failed to connect to any address", ctx.task_id());
      self.push_record(ctx, id, PORT_CLOSE, &[]);
    }
  }

  /// Resolution of a deferred connect: success opens, failure walks the
  /// remaining candidates.
  fn finish_connect(&mut self, ctx: &mut TaskCtx, id: u32) {
    let Some(conn) = self.conns.get_mut(&id) else { return };
    let error = getsockopt(&conn.fd, sockopt::SocketError).unwrap_or(0);
    if error == 0 {
      debug!("port-fwd {}: {id}: connected (deferred)", ctx.task_id());
      conn.connecting = false;
      self.push_record(ctx, id, PORT_OPEN, &[]);
      return;
    }
    if !Self::connect_next(conn) {
      debug!("port-fwd {}: {id}: failed to connect to any address", ctx.task_id());
      self.conns.remove(&id);
      self.push_record(ctx, id, PORT_CLOSE, &[]);
    }
  }

  fn accept_one(&mut self, ctx: &mut TaskCtx) {
    let Some(accept_fd) = &self.accept_fd else { return };
    match nix::sys::socket::accept4(
      accept_fd.as_raw_fd(),
      SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    ) {
      Ok(fd) => {
        let id = self.next_id;
        self.next_id += 1;
        // SAFETY: accept4 hands us a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        self.conns.insert(
          id,
          SubConn { fd, connecting: false, candidates: Vec::new(), next_candidate: 0, outdata: VecDeque::new() },
        );
        debug!("port-fwd {}: accepted subconnection {id}", ctx.task_id());
        self.push_record(ctx, id, PORT_OPEN, &[]);
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
      Err(e) => warn!("port-fwd {}: accept: {e}", ctx.task_id()),
    }
  }

  fn read_conn(&mut self, ctx: &mut TaskCtx, id: u32) {
    let Some(conn) = self.conns.get(&id) else { return };
    let mut buf = vec![0u8; ctx.chunk_size.max(1)];
    match nix::unistd::read(conn.fd.as_fd(), &mut buf) {
      Ok(0) => {
        self.conns.remove(&id);
        self.push_record(ctx, id, PORT_CLOSE, &[]);
      }
      Ok(n) => {
        let data = buf[..n].to_vec();
        self.push_record(ctx, id, PORT_DATA, &data);
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
      Err(_) => {
        self.conns.remove(&id);
        self.push_record(ctx, id, PORT_CLOSE, &[]);
      }
    }
  }

  fn write_conn(&mut self, ctx: &mut TaskCtx, id: u32) {
    let Some(conn) = self.conns.get_mut(&id) else { return };
    let Some(front) = conn.outdata.front_mut() else { return };
    match nix::unistd::write(conn.fd.as_fd(), front) {
      Ok(n) if n == front.len() => {
        conn.outdata.pop_front();
      }
      Ok(n) => {
        front.drain(..n);
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
      Err(e) => {
        debug!("port-fwd {}: {id}: write: {e}", ctx.task_id());
        self.conns.remove(&id);
        self.push_record(ctx, id, PORT_CLOSE, &[]);
      }
    }
  }

  /// Deterministic descriptor order shared by descriptors() and
  /// handle_fd(): the acceptor first, then subconnections by id.
  fn conn_order(&self) -> Vec<u32> {
    let mut ids: Vec<u32> = self.conns.keys().copied().collect();
    ids.sort_unstable();
    ids
  }
}

impl TaskVariant for PortFwd {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    ctx.timeout_ms = -1;
    ctx.running = true;

    if !self.outbound {
      let fd = match bind_local(self.fwd_type, &self.address, &self.port) {
        Ok(fd) => fd,
        Err(e) => {
          ctx.report_error(proto::TASK_ERROR_CONNECT_FAILED, &e.to_string());
          warn!("port-fwd {}: bind failed: {e:#}", ctx.task_id());
          return false;
        }
      };
      self.accept_fd = Some(fd);
    }

    match self.fwd_type {
      proto::PORT_FORWARD_TCP => {
        debug!("port-fwd {}: to tcp:{}:{}", ctx.task_id(), self.address, self.port);
      }
      proto::PORT_FORWARD_UNIX => {
        debug!("port-fwd {}: to unix:{}", ctx.task_id(), self.address);
      }
      other => {
        ctx.report_error(proto::TASK_ERROR_CONNECT_FAILED, &format!("invalid type code {other}"));
        return false;
      }
    }
    ctx.report_starting_name(&self.address);
    true
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        debug!("port-fwd {}: canceled (code {reason})", ctx.task_id());
        false
      }
      TaskWork::Input(data) => {
        let mut unm = Unmarshaler::new(&data);
        let id = unm.parse_number();
        let kind = unm.parse_number();
        match kind {
          PORT_ACK => {
            ctx.acked = unm.parse_number64();
            ctx.running = true;
          }
          PORT_OPEN if self.outbound => self.start_outbound(ctx, id),
          PORT_DATA => {
            if let Some(conn) = self.conns.get_mut(&id) {
              conn.outdata.push_back(unm.remaining_bytes().to_vec());
            }
          }
          PORT_CLOSE => {
            self.conns.remove(&id);
          }
          _ => {}
        }
        true
      }
      TaskWork::Pause => {
        ctx.throttled = true;
        debug!("port-fwd {}: throttled (remote)", ctx.task_id());
        true
      }
      TaskWork::Resume => {
        ctx.throttled = false;
        debug!("port-fwd {}: resumed", ctx.task_id());
        true
      }
      _ => true,
    }
  }

  fn handle_fd(&mut self, ctx: &mut TaskCtx, index: usize, revents: PollFlags) -> bool {
    let mut index = index;
    if self.accept_fd.is_some() {
      if index == 0 {
        self.accept_one(ctx);
        return true;
      }
      index -= 1;
    }
    let Some(&id) = self.conn_order().get(index) else { return true };

    if self.conns.get(&id).is_some_and(|c| c.connecting) {
      self.finish_connect(ctx, id);
      return true;
    }
    if revents.contains(PollFlags::POLLOUT) {
      self.write_conn(ctx, id);
    }
    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
      if !ctx.window_full() {
        self.read_conn(ctx, id);
      } else {
        ctx.running = false;
        if revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLIN) {
          // Peer hung up while the window is full; nothing left to relay.
          self.conns.remove(&id);
          self.push_record(ctx, id, PORT_CLOSE, &[]);
        }
      }
    }
    true
  }

  fn descriptors(&self, ctx: &TaskCtx) -> Vec<(BorrowedFd<'_>, PollFlags)> {
    let mut fds = Vec::new();
    if let Some(fd) = &self.accept_fd {
      fds.push((fd.as_fd(), PollFlags::POLLIN));
    }
    let read_ok = ctx.running && !ctx.throttled && !ctx.window_full();
    for id in self.conn_order() {
      let conn = &self.conns[&id];
      let mut events = PollFlags::empty();
      if conn.connecting {
        events |= PollFlags::POLLOUT;
      } else {
        if read_ok {
          events |= PollFlags::POLLIN;
        }
        if !conn.outdata.is_empty() {
          events |= PollFlags::POLLOUT;
        }
      }
      fds.push((conn.fd.as_fd(), events));
    }
    fds
  }
}

fn unix_connect(path: &str) -> Result<OwnedFd, nix::errno::Errno> {
  let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
  let addr = UnixAddr::new(path)?;
  connect(fd.as_raw_fd(), &addr)?;
  Ok(fd)
}

fn bind_local(fwd_type: u32, address: &str, port: &str) -> anyhow::Result<OwnedFd> {
  if fwd_type == proto::PORT_FORWARD_UNIX {
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    let _ = std::fs::remove_file(address);
    let addr = UnixAddr::new(address)?;
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(16)?)?;
    crate::os::set_nonblocking(&fd)?;
    return Ok(fd);
  }

  let target: std::net::SocketAddr = format!("{address}:{port}")
    .to_socket_addrs()?
    .next()
    .ok_or_else(|| anyhow::anyhow!("no address for {address}:{port}"))?;
  let family = if target.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
  let fd = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
  let storage = SockaddrStorage::from(target);
  bind(fd.as_raw_fd(), &storage)?;
  listen(&fd, Backlog::new(16)?)?;
  crate::os::set_nonblocking(&fd)?;
  Ok(fd)
}

/// `TASK_PORT_OUT` launch: chunk, window, type, address, port.
pub fn launch_out(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  build(listener, client_id, task_id, unm, true)
}

/// `TASK_PORT_IN` launch: chunk, window, type, address, port.
pub fn launch_in(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  build(listener, client_id, task_id, unm, false)
}

fn build(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
  outbound: bool,
) -> anyhow::Result<TaskLaunch> {
  let chunk_size = unm.parse_number() as usize;
  let window_size = u64::from(unm.parse_number());
  let fwd_type = unm.parse_number();
  let address = unm.parse_string();
  let port = unm.parse_string();

  let target = format!("{address}:{port}");
  let handle = make_handle(task_id, client_id, target, !outbound, true)?;
  let ctx =
    TaskCtx::new(Arc::clone(listener), handle.clone(), chunk_size.max(1), window_size.max(1));
  let variant = PortFwd {
    outbound,
    fwd_type,
    address,
    port,
    accept_fd: None,
    conns: HashMap::new(),
    next_id: 1,
  };
  let name = if outbound { "port-out" } else { "port-in" };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, name)),
    duplicate_report,
  })
}
