//! Command runner: a forked child bridged to the owning client.
//!
//! The child's stdio rides a socketpair. Reads obey the ack window like a
//! download; writes buffer like an upload, with acks carrying the received
//! counter so the peer can pace itself. The final report waits for both
//! exit events: the reaper's ProcessExited and read-side EOF.

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::poll::PollFlags;

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::mux::reaper::WaitOutcome;
use crate::os::fork;
use crate::proto::wire::Unmarshaler;
use crate::proto::{self, TaskStatus, attrs};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

pub struct RunCommand {
  params: attrs::AttributeMap,
  fd: Option<OwnedFd>,
  pid: i32,
  outdata: VecDeque<Vec<u8>>,
  received: u64,
  chunks: u64,
  write_open: bool,
  exited: Option<WaitOutcome>,
}

impl RunCommand {
  fn report_finished(&self, ctx: &TaskCtx) {
    let outcome = self.exited.unwrap_or(WaitOutcome::Exited(0));
    let (status, code) = match outcome {
      WaitOutcome::Exited(0) => (TaskStatus::Finished, 0),
      WaitOutcome::Exited(code) => (TaskStatus::Error, code),
      WaitOutcome::Signaled(signal) => (TaskStatus::Error, signal),
    };
    debug!("run-command {}: process ended ({outcome:?})", ctx.task_id());

    let mut m = crate::proto::wire::Marshaler::new(proto::CLIENT_TASK_OUTPUT);
    m.add_id_pair(&ctx.client_id(), &ctx.listener.id());
    m.add_id(&ctx.task_id());
    m.add_number(status as u32);
    m.add_number(code as u32);
    m.add_string(&match outcome {
      WaitOutcome::Exited(code) => format!("Process {} exited with status {code}", self.pid),
      WaitOutcome::Signaled(signal) => format!("Process {} killed by signal {signal}", self.pid),
    });
    let _ = ctx.listener.forward_to_client(&ctx.client_id(), m.finish());
  }

  fn bump_received(&mut self, ctx: &TaskCtx, written: usize) {
    self.received += written as u64;
    let chunk = ctx.chunk_size.max(1) as u64;
    if self.chunks < self.received / chunk {
      self.chunks = self.received / chunk;
      ctx.report_ack(self.received);
    }
  }

  /// Peer data frames: acks open our read window; running payloads feed the
  /// child's stdin.
  fn handle_data(&mut self, ctx: &mut TaskCtx, data: Vec<u8>) -> bool {
    let mut unm = Unmarshaler::new(&data);
    match unm.parse_number() {
      x if x == TaskStatus::Acking as u32 => {
        ctx.acked = unm.parse_number64();
        ctx.running = true;
      }
      x if x == TaskStatus::Running as u32 => {
        if self.write_open {
          self.outdata.push_back(unm.remaining_bytes().to_vec());
        }
      }
      other => debug!("run-command {}: unexpected input status {other}", ctx.task_id()),
    }
    true
  }

  fn flush_pending(&mut self, ctx: &mut TaskCtx) {
    let Some(front) = self.outdata.front_mut() else { return };

    if front.is_empty() {
      debug!("run-command {}: remote EOF", ctx.task_id());
      self.shutdown_write();
      self.outdata.pop_front();
      return;
    }

    let Some(fd) = &self.fd else { return };
    match nix::unistd::write(fd.as_fd(), front) {
      Ok(n) if n == front.len() => {
        self.outdata.pop_front();
        self.bump_received(ctx, n);
      }
      Ok(n) => {
        front.drain(..n);
        self.bump_received(ctx, n);
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => {}
      Err(e) => {
        warn!("run-command {}: write failed: {e}", ctx.task_id());
        self.shutdown_write();
        self.outdata.clear();
      }
    }
  }

  fn shutdown_write(&mut self) {
    if let Some(fd) = &self.fd
      && let Ok(dup) = fd.try_clone()
    {
      // Half-close through a dup; the socket state is shared.
      let stream = std::os::unix::net::UnixStream::from(dup);
      let _ = stream.shutdown(std::net::Shutdown::Write);
    }
    self.write_open = false;
  }

  fn read_chunk(&mut self, ctx: &mut TaskCtx) -> bool {
    if ctx.window_full() {
      ctx.running = false;
      return true;
    }
    let Some(fd) = &self.fd else { return true };

    let mut buf = vec![0u8; ctx.chunk_size.max(1)];
    match nix::unistd::read(fd.as_fd(), &mut buf) {
      Ok(n) if n > 0 => {
        let frame = ctx.output_frame(&buf[..n]);
        ctx.sent += n as u64;
        let _ = ctx.throttled_output(frame);
        true
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => true,
      Ok(_) | Err(_) => {
        // Local EOF: no zero-length output frame for commands.
        debug!("run-command {}: local EOF", ctx.task_id());
        self.fd = None;
        self.write_open = false;
        if self.exited.is_some() {
          self.report_finished(ctx);
          return false;
        }
        true
      }
    }
  }
}

impl TaskVariant for RunCommand {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    let argv_block = self.params.get(attrs::ATTR_COMMAND_COMMAND).cloned().unwrap_or_default();
    let argv = fork::parse_command_block(&argv_block);
    let env_block = self.params.get(attrs::ATTR_COMMAND_ENVIRON).cloned().unwrap_or_default();
    let env = fork::parse_environ_block(&env_block);
    let dir = self.params.get(attrs::ATTR_COMMAND_STARTDIR).cloned().unwrap_or_default();
    let dir = crate::os::relative_to_home(&dir);
    let devnull = ctx.chunk_size == 0;

    let child = match fork::spawn_command(&argv, &env, &dir, devnull) {
      Ok(child) => child,
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_FORK_FAILED, &e.to_string());
        debug!("run-command {}: {e:#}", ctx.task_id());
        return false;
      }
    };

    self.pid = child.pid;
    self.write_open = child.io.is_some();
    self.fd = child.io;

    debug!("run-command {}: started process (pid {})", ctx.task_id(), self.pid);
    let queue = Arc::clone(&ctx.handle.queue);
    ctx.listener.reaper.register_process(
      self.pid,
      Box::new(move |outcome| queue.send(TaskWork::ProcessExited(outcome))),
    );
    ctx.report_starting_pid(self.pid);
    true
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        fork::kill_process(self.pid);
        ctx.listener.reaper.abandon_process(self.pid);
        debug!("run-command {}: sent SIGTERM to pid {} (code {reason})", ctx.task_id(), self.pid);
        false
      }
      TaskWork::Input(data) => self.handle_data(ctx, data),
      TaskWork::Pause => {
        ctx.throttled = true;
        debug!("run-command {}: throttled (remote)", ctx.task_id());
        true
      }
      TaskWork::Resume => {
        ctx.throttled = false;
        debug!("run-command {}: resumed", ctx.task_id());
        true
      }
      TaskWork::ProcessExited(outcome) => {
        self.exited = Some(outcome);
        if self.fd.is_none() {
          self.report_finished(ctx);
          return false;
        }
        true
      }
      _ => true,
    }
  }

  fn handle_fd(&mut self, ctx: &mut TaskCtx, _index: usize, revents: PollFlags) -> bool {
    if revents.contains(PollFlags::POLLOUT) {
      self.flush_pending(ctx);
      if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
        return true;
      }
    }
    self.read_chunk(ctx)
  }

  fn descriptors(&self, ctx: &TaskCtx) -> Vec<(BorrowedFd<'_>, PollFlags)> {
    let Some(fd) = &self.fd else { return Vec::new() };
    let mut events = PollFlags::empty();
    if ctx.running && !ctx.throttled && !ctx.window_full() {
      events |= PollFlags::POLLIN;
    }
    if !self.outdata.is_empty() {
      events |= PollFlags::POLLOUT;
    }
    if events.is_empty() {
      // Paused: leave the descriptor out, or its hangup state would spin
      // the loop. EOF is discovered on resume; the exit event still
      // arrives through the work queue.
      return Vec::new();
    }
    vec![(fd.as_fd(), events)]
  }
}

/// `TASK_RUN_COMMAND` launch: chunk, window, command parameter map.
pub fn launch(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  let chunk_size = unm.parse_number() as usize;
  let window_size = u64::from(unm.parse_number());
  let mut params = attrs::AttributeMap::new();
  attrs::parse_map(unm, &mut params);

  let handle = make_handle(task_id, client_id, String::new(), false, true)?;
  let mut ctx = TaskCtx::new(Arc::clone(listener), handle.clone(), chunk_size, window_size.max(1));
  ctx.timeout_ms = -1;
  // Commands start with the window open; the first ack is optional.
  ctx.running = true;

  let variant = RunCommand {
    params,
    fd: None,
    pid: 0,
    outdata: VecDeque::new(),
    received: 0,
    chunks: 0,
    write_open: false,
    exited: None,
  };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, "run-command")),
    duplicate_report,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Tunables;
  use crate::mux::reaper::Reaper;

  fn harness(params: attrs::AttributeMap, chunk: usize, window: u64) -> (Arc<Listener>, TaskCtx, RunCommand) {
    let listener = Listener::new(
      InstanceId::generate(),
      false,
      Arc::new(Tunables::default()),
      Reaper::new(128),
    );
    let client_id = InstanceId::generate();
    let writer = crate::mux::output::OutputScheduler::new(1 << 20);
    let info = crate::mux::listener::ClientInfo {
      hops: 0,
      flags: 0,
      attributes: Default::default(),
      writer,
      via: InstanceId::generate(),
      environ: Default::default(),
      announce: Vec::new(),
    };
    assert!(listener.register_client(client_id, info));

    let handle = make_handle(InstanceId::generate(), client_id, String::new(), false, true).unwrap();
    let mut ctx = TaskCtx::new(Arc::clone(&listener), handle, chunk, window);
    ctx.running = true;
    ctx.timeout_ms = -1;
    let variant = RunCommand {
      params,
      fd: None,
      pid: 0,
      outdata: VecDeque::new(),
      received: 0,
      chunks: 0,
      write_open: false,
      exited: None,
    };
    (listener, ctx, variant)
  }

  fn command_params(argv: &str) -> attrs::AttributeMap {
    let mut params = attrs::AttributeMap::new();
    params.insert(attrs::ATTR_COMMAND_COMMAND.to_string(), argv.to_string());
    params
  }

  #[test]
  fn zero_chunk_size_runs_on_devnull() {
    let (_listener, mut ctx, mut variant) = harness(command_params("true"), 0, 1);
    assert!(variant.open(&mut ctx));
    assert!(variant.fd.is_none(), "devnull mode has no stdio descriptor");
    assert!(variant.descriptors(&ctx).is_empty());
    // Reap manually; this test has no reaper thread.
    let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(variant.pid), None);
  }

  #[test]
  fn final_report_needs_both_exit_events() {
    let (_listener, mut ctx, mut variant) = harness(command_params("true"), 4096, 4);
    assert!(variant.open(&mut ctx));
    assert!(variant.fd.is_some());

    // ProcessExited with the descriptor still open defers the report.
    assert!(variant.handle_work(&mut ctx, TaskWork::ProcessExited(WaitOutcome::Exited(0))));

    // Drain until EOF; now the task finishes.
    let mut done = false;
    for _ in 0..200 {
      if !variant.read_chunk(&mut ctx) {
        done = true;
        break;
      }
      std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(done, "EOF after exit completes the task");
    let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(variant.pid), None);
  }

  #[test]
  fn spawn_failure_is_reported() {
    let (_listener, mut ctx, mut variant) =
      harness(command_params("/definitely/not/a/command"), 4096, 4);
    assert!(!variant.open(&mut ctx));
  }
}
