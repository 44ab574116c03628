//! File and pipe uploads: client content streaming into a server file.
//!
//! Incoming data frames try a direct write first; a partial write or
//! `EAGAIN` buffers the remainder and enables write-side polling. Acks are
//! emitted whenever `received / chunk_size` crosses a new multiple. An
//! existing target raises a question and the task waits in the questioning
//! state for the answer.

use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::poll::PollFlags;
use nix::sys::stat::Mode;

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::proto::{self, TaskStatus};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

pub struct FileUpload {
  file_name: String,
  mode: u32,
  config: u32,
  /// Pipe mode: the target is a fifo we create and always unlink.
  fifo: bool,
  fd: Option<OwnedFd>,
  outdata: VecDeque<Vec<u8>>,
  received: u64,
  chunks: u64,
  succeeded: bool,
}

impl FileUpload {
  fn report_ack(&self, ctx: &TaskCtx) {
    ctx.report_ack(self.received);
  }

  fn open_file(&mut self, ctx: &mut TaskCtx) -> bool {
    if self.fifo {
      let mode = Mode::from_bits_truncate(self.mode & 0o777);
      if let Err(e) = nix::unistd::mkfifo(self.file_name.as_str(), mode) {
        ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
        warn!("pipe-out {}: failed to create fifo: {e}", ctx.task_id());
        return false;
      }
      match nix::fcntl::open(
        self.file_name.as_str(),
        OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
        Mode::empty(),
      ) {
        Ok(fd) => {
          self.fd = Some(fd);
          ctx.report_starting_name(&self.file_name);
          self.report_ack(ctx);
          debug!("pipe-out {}: running", ctx.task_id());
          return true;
        }
        Err(e) => {
          ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
          return false;
        }
      }
    }

    // Overwrite scenarios.
    if std::path::Path::new(&self.file_name).exists() {
      match self.config & 0xFFFF {
        proto::TASK_OVERWRITE => {}
        proto::TASK_ASK => {
          ctx.report_question(proto::QUESTION_OVERWRITE_RENAME);
          return true;
        }
        proto::TASK_RENAME => {
          return match open_renamed(&self.file_name, self.mode) {
            Ok((fd, name)) => {
              self.file_name = name;
              self.fd = Some(fd);
              ctx.report_starting_name(&self.file_name);
              self.report_ack(ctx);
              debug!("upload {}: running (renamed)", ctx.task_id());
              true
            }
            Err(e) => {
              ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, &e.to_string());
              false
            }
          };
        }
        _ => {
          ctx.report_error(proto::TASK_ERROR_FILE_EXISTS, "target file exists");
          debug!("upload {}: failed, target file exists", ctx.task_id());
          return false;
        }
      }
    } else if self.config & 0x8000_0000 != 0
      && let Some(parent) = std::path::Path::new(&self.file_name).parent()
    {
      let _ = std::fs::create_dir_all(parent);
    }

    match nix::fcntl::open(
      self.file_name.as_str(),
      OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
      Mode::from_bits_truncate(self.mode & 0o777),
    ) {
      Ok(fd) => {
        self.fd = Some(fd);
        self.report_ack(ctx);
        debug!("upload {}: running", ctx.task_id());
        true
      }
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
        warn!("upload {}: failed to open '{}' for writing: {e}", ctx.task_id(), self.file_name);
        false
      }
    }
  }

  fn bump_received(&mut self, ctx: &TaskCtx, written: usize) {
    self.received += written as u64;
    let chunk = ctx.chunk_size.max(1) as u64;
    if self.chunks < self.received / chunk {
      self.chunks = self.received / chunk;
      self.report_ack(ctx);
    }
  }

  /// Incoming data frame. A zero-length payload marks the end of upload.
  fn handle_data(&mut self, ctx: &mut TaskCtx, data: Vec<u8>) -> bool {
    let Some(fd) = &self.fd else {
      // No descriptor yet (questioning); hold the data until the answer.
      return self.push_pending(data);
    };

    if !self.outdata.is_empty() || data.is_empty() {
      return self.push_pending(data);
    }

    // Try a quick write.
    match nix::unistd::write(fd.as_fd(), &data) {
      Ok(n) if n == data.len() => {
        self.bump_received(ctx, n);
        true
      }
      Ok(n) => {
        self.bump_received(ctx, n);
        self.push_pending(data[n..].to_vec())
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => self.push_pending(data),
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_WRITE_FAILED, e.desc());
        warn!("upload {}: write failed: {e}", ctx.task_id());
        false
      }
    }
  }

  fn push_pending(&mut self, data: Vec<u8>) -> bool {
    self.outdata.push_back(data);
    true
  }

  /// Write-side readiness: drain one pending buffer.
  fn flush_pending(&mut self, ctx: &mut TaskCtx) -> bool {
    let Some(front) = self.outdata.front_mut() else { return true };

    if front.is_empty() {
      // Finished uploading.
      self.succeeded = true;
      ctx.report_status(TaskStatus::Finished);
      debug!("upload {}: finished", ctx.task_id());
      return false;
    }

    let Some(fd) = &self.fd else { return true };
    match nix::unistd::write(fd.as_fd(), front) {
      Ok(n) if n == front.len() => {
        self.outdata.pop_front();
        self.bump_received(ctx, n);
        true
      }
      Ok(n) => {
        front.drain(..n);
        self.bump_received(ctx, n);
        true
      }
      Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EINTR) => true,
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_WRITE_FAILED, e.desc());
        false
      }
    }
  }

  fn handle_answer(&mut self, ctx: &mut TaskCtx, answer: u32) -> bool {
    if !ctx.questioning {
      warn!("upload {}: unexpected answer", ctx.task_id());
      return false;
    }
    ctx.questioning = false;
    debug!("upload {}: question answered: {answer}", ctx.task_id());

    match answer {
      proto::TASK_OVERWRITE | proto::TASK_RENAME => {
        self.config = answer;
        self.open_file(ctx)
      }
      _ => {
        ctx.report_error(proto::TASK_ERROR_CANCELED, "canceled");
        false
      }
    }
  }
}

impl TaskVariant for FileUpload {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    self.open_file(ctx)
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        debug!("upload {}: canceled (code {reason})", ctx.task_id());
        false
      }
      TaskWork::Input(data) => self.handle_data(ctx, data),
      TaskWork::Answer(answer) => self.handle_answer(ctx, answer),
      _ => true,
    }
  }

  fn handle_fd(&mut self, ctx: &mut TaskCtx, _index: usize, _revents: PollFlags) -> bool {
    self.flush_pending(ctx)
  }

  fn handle_idle(&mut self, ctx: &mut TaskCtx) -> bool {
    if self.fifo {
      return true;
    }
    // The EOF marker may be stuck behind questioning with no descriptor.
    if self.fd.is_none() {
      return true;
    }
    if self.outdata.front().is_some_and(Vec::is_empty) {
      return self.flush_pending(ctx);
    }
    ctx.report_error(proto::TASK_ERROR_TIMED_OUT, "idle timeout exceeded");
    false
  }

  fn descriptors(&self, _ctx: &TaskCtx) -> Vec<(BorrowedFd<'_>, PollFlags)> {
    match (&self.fd, self.outdata.is_empty()) {
      (Some(fd), false) => vec![(fd.as_fd(), PollFlags::POLLOUT)],
      _ => Vec::new(),
    }
  }

  fn finish(&mut self, _ctx: &mut TaskCtx) {
    self.fd = None;
    if self.fifo {
      let _ = nix::unistd::unlink(self.file_name.as_str());
    } else if !self.succeeded {
      let _ = nix::unistd::unlink(self.file_name.as_str());
    }
  }
}

/// Creates `name.1`, `name.2`, ... until an unused name is found.
fn open_renamed(name: &str, mode: u32) -> anyhow::Result<(OwnedFd, String)> {
  for suffix in 1..1000 {
    let candidate = format!("{name}.{suffix}");
    match nix::fcntl::open(
      candidate.as_str(),
      OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
      Mode::from_bits_truncate(mode & 0o777),
    ) {
      Ok(fd) => return Ok((fd, candidate)),
      Err(nix::errno::Errno::EEXIST) => continue,
      Err(e) => return Err(e.into()),
    }
  }
  anyhow::bail!("no rename candidate available for {name}")
}

/// `TASK_FILE_UPLOAD` launch: chunk, mode, config, target name.
pub fn launch_file(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut crate::proto::wire::Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  let chunk_size = unm.parse_number() as usize;
  let mode = unm.parse_number();
  let config = unm.parse_number();
  let target = unm.parse_string();

  build(listener, client_id, task_id, chunk_size, mode, config, target, false)
}

/// `TASK_PIPE_UPLOAD` launch: chunk, mode, target name.
pub fn launch_pipe(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut crate::proto::wire::Unmarshaler<'_>,
) -> anyhow::Result<TaskLaunch> {
  let chunk_size = unm.parse_number() as usize;
  let mode = unm.parse_number();
  let target = unm.parse_string();

  build(listener, client_id, task_id, chunk_size, mode, proto::TASK_OVERWRITE, target, true)
}

#[allow(clippy::too_many_arguments)]
fn build(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  chunk_size: usize,
  mode: u32,
  config: u32,
  target: String,
  fifo: bool,
) -> anyhow::Result<TaskLaunch> {
  let handle = make_handle(task_id, client_id, target.clone(), !fifo, false)?;
  let mut ctx = TaskCtx::new(Arc::clone(listener), handle.clone(), chunk_size.max(1), 1);
  if fifo {
    ctx.timeout_ms = -1;
  }
  let variant = FileUpload {
    file_name: target,
    mode,
    config,
    fifo,
    fd: None,
    outdata: VecDeque::new(),
    received: 0,
    chunks: 0,
    succeeded: false,
  };
  let name = if fifo { "pipe-out" } else { "upload" };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, name)),
    duplicate_report,
  })
}
