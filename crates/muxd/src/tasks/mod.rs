//! Task subsystem.
//!
//! Every task is a thread owning its descriptors, driven by a poll loop over
//! an eventfd-backed work queue plus the variant's own descriptors. The
//! listener injects events through the queue; the task reports to its owning
//! client through 64-byte-headered `CLIENT_TASK_OUTPUT` frames.
//!
//! Variants share one record ([`TaskCtx`]) and differ only in their state
//! and dispatch functions — no inheritance, just a vtable.

pub mod download;
pub mod image;
pub mod misc;
pub mod mount;
pub mod port;
pub mod run;
pub mod upload;

use std::collections::{HashSet, VecDeque};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use log::{debug, error};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

use crate::id::InstanceId;
use crate::mux::listener::{ForwardResult, Listener, ListenerWork};
use crate::mux::reaper::WaitOutcome;
use crate::proto::wire::Marshaler;
use crate::proto::{self, TaskStatus};

/// Size of the task output preamble: command, length, destination client,
/// source server, task id, status.
pub const TASK_HEADER_SIZE: usize = 60;

/// Events injected into a task's work queue.
pub enum TaskWork {
  Close(u32),
  Input(Vec<u8>),
  Answer(u32),
  Pause,
  Resume,
  ProcessExited(WaitOutcome),
  /// Self-posted kick for single-shot tasks.
  Private,
}

/// Eventfd-backed work queue, pollable alongside the task's descriptors.
pub struct TaskQueue {
  items: Mutex<VecDeque<TaskWork>>,
  event: EventFd,
}

impl TaskQueue {
  pub fn new() -> anyhow::Result<Arc<Self>> {
    let event = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
    Ok(Arc::new(Self { items: Mutex::new(VecDeque::new()), event }))
  }

  pub fn send(&self, item: TaskWork) {
    self.items.lock().push_back(item);
    let _ = self.event.write(1);
  }

  /// Takes all pending items, clearing the event.
  #[must_use]
  pub fn drain(&self) -> Vec<TaskWork> {
    let _ = self.event.read();
    self.items.lock().drain(..).collect()
  }

  #[must_use]
  pub fn event_fd(&self) -> BorrowedFd<'_> {
    self.event.as_fd()
  }
}

/// The listener's handle to a running task.
#[derive(Clone)]
pub struct TaskHandle {
  pub task_id: InstanceId,
  pub client_id: InstanceId,
  pub target_name: String,
  pub exclusive: bool,
  pub throttlable: bool,
  pub queue: Arc<TaskQueue>,
  /// Hops currently pausing this task's output.
  pauses: Arc<Mutex<HashSet<InstanceId>>>,
}

impl TaskHandle {
  /// Records a pause from a hop; posts `Pause` on the 0 → 1 transition.
  pub fn pause(&self, hop: InstanceId) {
    let mut pauses = self.pauses.lock();
    let was_empty = pauses.is_empty();
    pauses.insert(hop);
    if was_empty {
      self.queue.send(TaskWork::Pause);
    }
  }

  /// Clears a hop's pause; posts `Resume` once no pauses remain.
  pub fn resume(&self, hop: InstanceId) {
    let mut pauses = self.pauses.lock();
    if pauses.remove(&hop) && pauses.is_empty() {
      self.queue.send(TaskWork::Resume);
    }
  }

  pub fn stop(&self, reason: u32) {
    self.queue.send(TaskWork::Close(reason));
  }
}

/// State common to every task variant.
pub struct TaskCtx {
  pub listener: Arc<Listener>,
  pub handle: TaskHandle,
  pub chunk_size: usize,
  pub window_size: u64,
  pub sent: u64,
  pub acked: u64,
  /// Paused because our own submit hit the watermark.
  pub throttled: bool,
  pub running: bool,
  pub questioning: bool,
  /// Idle timeout in milliseconds; 0 fires immediately, -1 never.
  pub timeout_ms: i64,
  header: [u8; TASK_HEADER_SIZE],
}

impl TaskCtx {
  #[must_use]
  pub fn new(listener: Arc<Listener>, handle: TaskHandle, chunk_size: usize, window_size: u64) -> Self {
    let mut header = [0u8; TASK_HEADER_SIZE];
    header[0..4].copy_from_slice(&proto::CLIENT_TASK_OUTPUT.to_le_bytes());
    header[8..24].copy_from_slice(handle.client_id.as_bytes());
    header[24..40].copy_from_slice(listener.id().as_bytes());
    header[40..56].copy_from_slice(handle.task_id.as_bytes());
    header[56..60].copy_from_slice(&(TaskStatus::Running as u32).to_le_bytes());
    Self {
      listener,
      handle,
      chunk_size,
      window_size,
      sent: 0,
      acked: 0,
      throttled: false,
      running: false,
      questioning: false,
      timeout_ms: 30_000,
      header,
    }
  }

  #[must_use]
  pub fn task_id(&self) -> InstanceId {
    self.handle.task_id
  }

  #[must_use]
  pub fn client_id(&self) -> InstanceId {
    self.handle.client_id
  }

  /// Whether the send window is exhausted (reads must pause until an ack).
  #[must_use]
  pub fn window_full(&self) -> bool {
    self.sent - self.acked >= self.window_size * self.chunk_size as u64
  }

  /// Builds a `Running` output frame around `payload` using the prebuilt
  /// header.
  #[must_use]
  pub fn output_frame(&self, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(TASK_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&self.header);
    frame.extend_from_slice(payload);
    let length = (frame.len() - 8) as u32;
    frame[4..8].copy_from_slice(&length.to_le_bytes());
    frame
  }

  fn report(&self, m: Marshaler) {
    let _ = self.listener.forward_to_client(&self.client_id(), m.finish());
  }

  fn status_frame(&self, status: TaskStatus) -> Marshaler {
    let mut m = Marshaler::new(proto::CLIENT_TASK_OUTPUT);
    m.add_id_pair(&self.client_id(), &self.listener.id());
    m.add_id(&self.task_id());
    m.add_number(status as u32);
    m
  }

  /// Sends a data frame to the owning client, pausing the task if the
  /// path throttles. Returns false when the caller must stop reading.
  pub fn throttled_output(&mut self, frame: Vec<u8>) -> bool {
    match self.listener.forward_to_client(&self.client_id(), frame) {
      ForwardResult::Accepted => true,
      ForwardResult::Throttled(_hop) => {
        debug!("task {}: throttled (local)", self.task_id());
        self.throttled = true;
        false
      }
      ForwardResult::Unknown => false,
    }
  }

  pub fn report_status(&self, status: TaskStatus) {
    self.report(self.status_frame(status));
  }

  pub fn report_starting_sized(&self, mode: u32, total: u64) {
    let mut m = self.status_frame(TaskStatus::Starting);
    m.add_number(mode);
    m.add_number64(total);
    self.report(m);
  }

  pub fn report_starting_name(&self, name: &str) {
    let mut m = self.status_frame(TaskStatus::Starting);
    m.add_string(name);
    self.report(m);
  }

  pub fn report_starting_pid(&self, pid: i32) {
    let mut m = self.status_frame(TaskStatus::Starting);
    m.add_number(pid as u32);
    self.report(m);
  }

  pub fn report_ack(&self, received: u64) {
    let mut m = self.status_frame(TaskStatus::Acking);
    m.add_number64(received);
    self.report(m);
  }

  pub fn report_finished(&self) {
    self.report_status(TaskStatus::Finished);
  }

  pub fn report_error(&self, errtype: u32, message: &str) {
    let mut m = self.status_frame(TaskStatus::Error);
    m.add_number(errtype);
    m.add_string(message);
    self.report(m);
  }

  pub fn report_question(&mut self, question: u32) {
    self.questioning = true;
    let mut m = Marshaler::new(proto::CLIENT_TASK_QUESTION);
    m.add_id_pair(&self.client_id(), &self.listener.id());
    m.add_id(&self.task_id());
    m.add_number(question);
    self.report(m);
  }
}

/// One task variant: state plus its dispatch functions.
pub trait TaskVariant: Send {
  /// Opens descriptors and reports `Starting`. Returning false skips the
  /// loop (the error has been reported).
  fn open(&mut self, ctx: &mut TaskCtx) -> bool;

  /// Handles one work item. Returning false ends the task.
  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool;

  /// Handles readiness on descriptor `index` (as returned by
  /// `descriptors`). Returning false ends the task.
  fn handle_fd(&mut self, ctx: &mut TaskCtx, index: usize, revents: PollFlags) -> bool;

  /// Runs on idle timeout. Returning false ends the task.
  fn handle_idle(&mut self, ctx: &mut TaskCtx) -> bool {
    let _ = ctx;
    true
  }

  /// Descriptors to poll this iteration, with their interest sets. An empty
  /// set parks the task on its work queue.
  fn descriptors(&self, ctx: &TaskCtx) -> Vec<(BorrowedFd<'_>, PollFlags)> {
    let _ = ctx;
    Vec::new()
  }

  /// Cleanup after the loop, before removal from the listener.
  fn finish(&mut self, ctx: &mut TaskCtx) {
    let _ = ctx;
  }
}

/// The error frame reported when a task target is already in use.
#[must_use]
pub fn duplicate_report_frame(
  listener: &Arc<Listener>,
  client_id: &InstanceId,
  task_id: &InstanceId,
) -> Vec<u8> {
  let mut m = Marshaler::new(proto::CLIENT_TASK_OUTPUT);
  m.add_id_pair(client_id, &listener.id());
  m.add_id(task_id);
  m.add_number(TaskStatus::Error as u32);
  m.add_number(proto::TASK_ERROR_DUPLICATE);
  m.add_string("task target already in use");
  m.finish()
}

/// Builds the handle and queue for a task definition.
pub fn make_handle(
  task_id: InstanceId,
  client_id: InstanceId,
  target_name: String,
  exclusive: bool,
  throttlable: bool,
) -> anyhow::Result<TaskHandle> {
  Ok(TaskHandle {
    task_id,
    client_id,
    target_name,
    exclusive,
    throttlable,
    queue: TaskQueue::new()?,
    pauses: Arc::new(Mutex::new(HashSet::new())),
  })
}

/// Runs a task to completion on the current thread.
pub fn run_task(mut variant: Box<dyn TaskVariant>, mut ctx: TaskCtx, name: &str) {
  let queue = Arc::clone(&ctx.handle.queue);
  let remove = ListenerWork::RemoveTask(ctx.task_id());

  if variant.open(&mut ctx) {
    'outer: loop {
      let mut ready: Vec<(usize, PollFlags)> = Vec::new();
      let mut queue_ready = false;
      let mut timed_out = false;

      {
        let fds = variant.descriptors(&ctx);
        let mut pollfds = Vec::with_capacity(fds.len() + 1);
        pollfds.push(PollFd::new(queue.event_fd(), PollFlags::POLLIN));
        for (fd, events) in &fds {
          pollfds.push(PollFd::new(*fd, *events));
        }

        let timeout = match ctx.timeout_ms {
          t if t < 0 => PollTimeout::NONE,
          t => PollTimeout::try_from(t.min(i64::from(u16::MAX)) as u16).unwrap_or(PollTimeout::NONE),
        };

        match poll(&mut pollfds, timeout) {
          Ok(0) => timed_out = true,
          Ok(_) => {
            if let Some(revents) = pollfds[0].revents()
              && revents.contains(PollFlags::POLLIN)
            {
              queue_ready = true;
            }
            for (i, pollfd) in pollfds.iter().enumerate().skip(1) {
              if let Some(revents) = pollfd.revents()
                && !revents.is_empty()
              {
                ready.push((i - 1, revents));
              }
            }
          }
          Err(nix::errno::Errno::EINTR) => continue,
          Err(e) => {
            error!("{name} {}: poll: {e}", ctx.task_id());
            break;
          }
        }
      }

      if queue_ready {
        for item in queue.drain() {
          if !variant.handle_work(&mut ctx, item) {
            break 'outer;
          }
        }
      }
      // One descriptor event per iteration: handlers may drop descriptors,
      // which would shift the index mapping for the rest of the batch.
      // poll is level triggered, so the others fire again immediately.
      if let Some((index, revents)) = ready.into_iter().next()
        && !variant.handle_fd(&mut ctx, index, revents)
      {
        break;
      }
      if timed_out && !variant.handle_idle(&mut ctx) {
        break;
      }
    }
  }

  variant.finish(&mut ctx);
  debug!("{name} {}: goodbye", ctx.task_id());
  ctx.listener.send_work(remove);
}

/// Spawns the task thread.
pub fn spawn_task(
  variant: Box<dyn TaskVariant>,
  ctx: TaskCtx,
  name: &'static str,
) -> std::thread::JoinHandle<()> {
  std::thread::Builder::new()
    .name(name.to_string())
    .spawn(move || run_task(variant, ctx, name))
    .expect("failed to spawn task thread")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn queue_drains_in_order() {
    let queue = TaskQueue::new().unwrap();
    queue.send(TaskWork::Pause);
    queue.send(TaskWork::Resume);
    let items = queue.drain();
    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], TaskWork::Pause));
    assert!(matches!(items[1], TaskWork::Resume));
    assert!(queue.drain().is_empty());
  }

  #[test]
  fn pause_and_resume_transition_once() {
    let handle = make_handle(
      InstanceId::generate(),
      InstanceId::generate(),
      String::new(),
      false,
      true,
    )
    .unwrap();

    let hop_a = InstanceId::generate();
    let hop_b = InstanceId::generate();
    handle.pause(hop_a);
    handle.pause(hop_b);
    let items = handle.queue.drain();
    assert_eq!(items.len(), 1, "only the first pause posts work");

    handle.resume(hop_a);
    assert!(handle.queue.drain().is_empty(), "resume waits for all hops");
    handle.resume(hop_b);
    assert!(matches!(handle.queue.drain().as_slice(), [TaskWork::Resume]));
  }
}
