//! File and pipe downloads: server file content streaming toward a client.
//!
//! The task reads `chunk_size` bytes at a time and emits them as Running
//! output frames. Reads pause when the unacked window fills or when the
//! output path throttles; acks arrive as Input work items carrying the new
//! acked counter.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use log::debug;
use nix::fcntl::OFlag;
use nix::poll::PollFlags;
use nix::sys::stat::Mode;

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::proto::{self};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

pub struct FileDownload {
  target: String,
  fd: Option<OwnedFd>,
  /// Pipe mode: the target is a fifo we create and unlink.
  fifo_mode: Option<u32>,
}

impl FileDownload {
  fn readable(&self, ctx: &TaskCtx) -> bool {
    self.fd.is_some() && ctx.running && !ctx.throttled
  }
}

impl TaskVariant for FileDownload {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    match self.fifo_mode {
      None => {
        let fd = match nix::fcntl::open(
          self.target.as_str(),
          OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
          Mode::empty(),
        ) {
          Ok(fd) => fd,
          Err(e) => {
            ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
            debug!("download {}: failed to open '{}': {e}", ctx.task_id(), self.target);
            return false;
          }
        };
        let (size, mode) = match nix::sys::stat::fstat(&fd) {
          Ok(stat) => (stat.st_size.max(0) as u64, stat.st_mode as u32 & 0o7777),
          Err(_) => (0, 0o644),
        };
        self.fd = Some(fd);
        ctx.report_starting_sized(mode, size);
        debug!("download {}: running ({mode:o} {size})", ctx.task_id());
      }
      Some(mode) => {
        let mode = Mode::from_bits_truncate(mode & 0o777);
        if let Err(e) = nix::unistd::mkfifo(self.target.as_str(), mode) {
          ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
          debug!("pipe-in {}: failed to create fifo: {e}", ctx.task_id());
          return false;
        }
        let fd = match nix::fcntl::open(
          self.target.as_str(),
          OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
          Mode::empty(),
        ) {
          Ok(fd) => fd,
          Err(e) => {
            ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
            return false;
          }
        };
        self.fd = Some(fd);
        ctx.report_starting_name(&self.target);
        debug!("pipe-in {}: running", ctx.task_id());
      }
    }
    true
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        debug!("download {}: canceled (code {reason})", ctx.task_id());
        false
      }
      TaskWork::Input(data) => {
        let mut unm = crate::proto::wire::Unmarshaler::new(&data);
        ctx.acked = unm.parse_number64();
        ctx.running = true;
        true
      }
      TaskWork::Pause => {
        ctx.throttled = true;
        debug!("download {}: throttled (remote)", ctx.task_id());
        true
      }
      TaskWork::Resume => {
        ctx.throttled = false;
        debug!("download {}: resumed", ctx.task_id());
        true
      }
      _ => true,
    }
  }

  fn handle_fd(&mut self, ctx: &mut TaskCtx, _index: usize, _revents: PollFlags) -> bool {
    if ctx.window_full() {
      // Stop and wait for an ack message.
      ctx.running = false;
      return true;
    }
    let Some(fd) = &self.fd else { return true };

    let mut buf = vec![0u8; ctx.chunk_size.max(1)];
    let n = match nix::unistd::read(fd.as_fd(), &mut buf) {
      Ok(n) => n,
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => return true,
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_READ_FAILED, e.desc());
        return false;
      }
    };

    let frame = ctx.output_frame(&buf[..n]);
    ctx.sent += n as u64;
    let _ = ctx.throttled_output(frame);

    if n == 0 {
      debug!("download {}: finished", ctx.task_id());
      ctx.report_finished();
      return false;
    }
    true
  }

  fn handle_idle(&mut self, ctx: &mut TaskCtx) -> bool {
    if self.fifo_mode.is_some() {
      return true;
    }
    ctx.report_error(proto::TASK_ERROR_TIMED_OUT, "idle timeout exceeded");
    false
  }

  fn descriptors(&self, ctx: &TaskCtx) -> Vec<(BorrowedFd<'_>, PollFlags)> {
    if !self.readable(ctx) || ctx.window_full() {
      return Vec::new();
    }
    match &self.fd {
      Some(fd) => vec![(fd.as_fd(), PollFlags::POLLIN)],
      None => Vec::new(),
    }
  }

  fn finish(&mut self, _ctx: &mut TaskCtx) {
    self.fd = None;
    if self.fifo_mode.is_some() {
      let _ = nix::unistd::unlink(self.target.as_str());
    }
  }
}

/// `TASK_FILE_DOWNLOAD` launch: chunk, window, target name.
pub fn launch_file(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut crate::proto::wire::Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  let chunk_size = unm.parse_number() as usize;
  let window_size = u64::from(unm.parse_number());
  let target = unm.parse_string();

  build(listener, client_id, task_id, chunk_size, window_size, target, None)
}

/// `TASK_PIPE_DOWNLOAD` launch: chunk, window, fifo mode, target name.
pub fn launch_pipe(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut crate::proto::wire::Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  let chunk_size = unm.parse_number() as usize;
  let window_size = u64::from(unm.parse_number());
  let mode = unm.parse_number();
  let target = unm.parse_string();

  build(listener, client_id, task_id, chunk_size, window_size, target, Some(mode))
}

fn build(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  chunk_size: usize,
  window_size: u64,
  target: String,
  fifo_mode: Option<u32>,
) -> anyhow::Result<TaskLaunch> {
  let handle = make_handle(task_id, client_id, target.clone(), false, true)?;
  let mut ctx = TaskCtx::new(Arc::clone(listener), handle.clone(), chunk_size.max(1), window_size.max(1));
  if fifo_mode.is_some() {
    ctx.timeout_ms = -1;
  }
  let variant = FileDownload { target, fd: None, fifo_mode };
  let name = if fifo_mode.is_some() { "pipe-in" } else { "download" };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, name)),
    duplicate_report,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Tunables;
  use crate::mux::reaper::Reaper;
  use crate::tasks::run_task;

  fn test_listener() -> Arc<Listener> {
    Listener::new(
      InstanceId::generate(),
      false,
      Arc::new(Tunables::default()),
      Reaper::new(128),
    )
  }

  /// Registers a capture client and returns its scheduler for inspection.
  fn capture_client(listener: &Arc<Listener>, client_id: InstanceId) -> Arc<crate::mux::output::OutputScheduler> {
    let writer = crate::mux::output::OutputScheduler::new(1 << 20);
    let info = crate::mux::listener::ClientInfo {
      hops: 0,
      flags: 0,
      attributes: Default::default(),
      writer: Arc::clone(&writer),
      via: InstanceId::generate(),
      environ: Default::default(),
      announce: Vec::new(),
    };
    assert!(listener.register_client(client_id, info));
    writer
  }

  #[test]
  fn missing_file_reports_open_error() {
    let listener = test_listener();
    let client_id = InstanceId::generate();
    let writer = capture_client(&listener, client_id);

    let task_id = InstanceId::generate();
    let handle = make_handle(task_id, client_id, "/nonexistent/zzz".into(), false, true).unwrap();
    let ctx = TaskCtx::new(Arc::clone(&listener), handle, 4096, 4);
    let variant =
      FileDownload { target: "/nonexistent/zzz".into(), fd: None, fifo_mode: None };

    run_task(Box::new(variant), ctx, "download");
    // One error frame was queued for the client.
    assert!(writer.buffered_amount() > 0);
  }

  #[test]
  fn window_gates_reading_until_acked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::write(&path, vec![7u8; 8192]).unwrap();

    let listener = test_listener();
    let client_id = InstanceId::generate();
    let _writer = capture_client(&listener, client_id);

    let task_id = InstanceId::generate();
    let handle = make_handle(task_id, client_id, String::new(), false, true).unwrap();
    let mut ctx = TaskCtx::new(Arc::clone(&listener), handle, 4096, 1);
    let mut variant = FileDownload {
      target: path.to_string_lossy().into_owned(),
      fd: None,
      fifo_mode: None,
    };

    assert!(variant.open(&mut ctx));
    // Not running until the first ack arrives.
    assert!(!variant.readable(&ctx));
    assert!(variant.handle_work(&mut ctx, TaskWork::Input(0u64.to_le_bytes().to_vec())));
    assert!(variant.readable(&ctx));

    // First chunk goes out; the window (1 chunk) is now exhausted.
    assert!(variant.handle_fd(&mut ctx, 0, PollFlags::POLLIN));
    assert_eq!(ctx.sent, 4096);
    assert!(ctx.window_full());
    assert!(variant.handle_fd(&mut ctx, 0, PollFlags::POLLIN));
    assert!(!ctx.running, "window exhaustion pauses reading");
    assert_eq!(ctx.sent, 4096, "no further reads while unacked");

    // Ack opens the window again.
    assert!(variant.handle_work(&mut ctx, TaskWork::Input(4096u64.to_le_bytes().to_vec())));
    assert!(variant.handle_fd(&mut ctx, 0, PollFlags::POLLIN));
    assert_eq!(ctx.sent, 8192);
  }

  #[test]
  fn eof_finishes_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    std::fs::write(&path, b"").unwrap();

    let listener = test_listener();
    let client_id = InstanceId::generate();
    let _writer = capture_client(&listener, client_id);

    let handle = make_handle(InstanceId::generate(), client_id, String::new(), false, true).unwrap();
    let mut ctx = TaskCtx::new(Arc::clone(&listener), handle, 4096, 4);
    let mut variant = FileDownload {
      target: path.to_string_lossy().into_owned(),
      fd: None,
      fifo_mode: None,
    };

    assert!(variant.open(&mut ctx));
    variant.handle_work(&mut ctx, TaskWork::Input(0u64.to_le_bytes().to_vec()));
    assert!(!variant.handle_fd(&mut ctx, 0, PollFlags::POLLIN), "zero read terminates");
  }
}
