//! Per-connection output scheduler.
//!
//! Arbitrary threads submit buffers; one scheduler thread delivers them in
//! order to the connection's descriptor. Two queues are kept: raw data bound
//! for the child pty and already-framed commands bound for the peer. Each is
//! FIFO and internally ordered; they are independent of each other.
//!
//! Backpressure: `submit_*` returns false once the buffered amount passes
//! the warning watermark. The scheduler is then throttled and emits exactly
//! one resume notification upstream after the next drain.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

/// Where drained buffers go. Implementations write to the descriptor and
/// must not call back into the scheduler.
pub trait OutputSink: Send {
  /// Writes raw input data (terminal keystrokes bound for the child).
  fn write_data(&mut self, buf: &[u8], stopping: &dyn Fn() -> bool) -> anyhow::Result<()>;
  /// Writes an already-framed command toward the peer.
  fn write_command(&mut self, buf: &[u8], stopping: &dyn Fn() -> bool) -> anyhow::Result<()>;
  /// Flushes buffered command bytes after a batch.
  fn flush(&mut self) -> anyhow::Result<()> {
    Ok(())
  }
}

/// Scheduler-to-owner notifications, invoked from the scheduler thread with
/// no scheduler lock held.
pub struct OutputEvents {
  /// Called once after a drain that followed a throttled submit.
  pub throttle_resumed: Box<dyn Fn() + Send>,
  /// Called after the data queue drains, so the owner can reset its rate
  /// limiter.
  pub input_sent: Box<dyn Fn() + Send>,
}

impl Default for OutputEvents {
  fn default() -> Self {
    Self { throttle_resumed: Box::new(|| {}), input_sent: Box::new(|| {}) }
  }
}

struct Inner {
  data: VecDeque<Vec<u8>>,
  commands: VecDeque<Vec<u8>>,
  buffered: usize,
  throttled: bool,
  stopping: bool,
}

pub struct OutputScheduler {
  inner: Mutex<Inner>,
  cond: Condvar,
  warn_threshold: usize,
}

impl OutputScheduler {
  #[must_use]
  pub fn new(warn_threshold: usize) -> Arc<Self> {
    Arc::new(Self {
      inner: Mutex::new(Inner {
        data: VecDeque::new(),
        commands: VecDeque::new(),
        buffered: 0,
        throttled: false,
        stopping: false,
      }),
      cond: Condvar::new(),
      warn_threshold,
    })
  }

  #[must_use]
  pub fn warn_threshold(&self) -> usize {
    self.warn_threshold
  }

  #[must_use]
  pub fn buffered_amount(&self) -> usize {
    self.inner.lock().buffered
  }

  #[must_use]
  pub fn is_stopping(&self) -> bool {
    self.inner.lock().stopping
  }

  fn submit(&self, buf: Vec<u8>, command: bool) -> bool {
    let mut inner = self.inner.lock();
    if inner.stopping {
      return false;
    }
    inner.buffered += buf.len();
    if command {
      inner.commands.push_back(buf);
    } else {
      inner.data.push_back(buf);
    }
    let ok = inner.buffered <= self.warn_threshold;
    if !ok {
      inner.throttled = true;
    }
    self.cond.notify_one();
    ok
  }

  /// Queues raw data for the descriptor. Returns false once throttled; the
  /// caller is responsible for propagating a throttle-pause upstream.
  pub fn submit_data(&self, buf: Vec<u8>) -> bool {
    self.submit(buf, false)
  }

  /// Queues one framed command. Same return contract as `submit_data`.
  pub fn submit_command(&self, buf: Vec<u8>) -> bool {
    self.submit(buf, true)
  }

  /// Marks the scheduler stopping; no further submit succeeds and the
  /// scheduler thread exits after its current batch.
  pub fn stop(&self) {
    let mut inner = self.inner.lock();
    inner.stopping = true;
    self.cond.notify_one();
  }

  /// Clears queues and flags for a relaunch. Must not be called while the
  /// scheduler thread is running.
  pub fn reset(&self) {
    let mut inner = self.inner.lock();
    inner.data.clear();
    inner.commands.clear();
    inner.buffered = 0;
    inner.throttled = false;
    inner.stopping = false;
  }

  /// Spawns the scheduler thread.
  pub fn start(
    self: &Arc<Self>,
    mut sink: Box<dyn OutputSink>,
    events: OutputEvents,
  ) -> std::thread::JoinHandle<()> {
    let this = Arc::clone(self);
    std::thread::Builder::new()
      .name("output".to_string())
      .spawn(move || {
        if let Err(e) = this.run(sink.as_mut(), &events) {
          error!("output: {e:#}");
          this.stop();
        }
      })
      .expect("failed to spawn output thread")
  }

  /// The scheduler loop. Swaps both queues out under the lock, then drains
  /// them with no lock held.
  fn run(self: &Arc<Self>, sink: &mut dyn OutputSink, events: &OutputEvents) -> anyhow::Result<()> {
    let mut data = VecDeque::new();
    let mut commands = VecDeque::new();

    loop {
      let was_throttled;
      {
        let mut inner = self.inner.lock();
        while !inner.stopping && inner.data.is_empty() && inner.commands.is_empty() {
          self.cond.wait(&mut inner);
        }
        if inner.stopping {
          return Ok(());
        }
        std::mem::swap(&mut inner.data, &mut data);
        std::mem::swap(&mut inner.commands, &mut commands);
        inner.buffered = 0;
        was_throttled = inner.throttled;
        inner.throttled = false;
      }

      if was_throttled {
        debug!("output: resuming after throttle");
        (events.throttle_resumed)();
      }

      let stopping = {
        let this = Arc::clone(self);
        move || this.inner.lock().stopping
      };

      if !data.is_empty() {
        while let Some(buf) = data.pop_front() {
          sink.write_data(&buf, &stopping)?;
        }
        (events.input_sent)();
      }
      if !commands.is_empty() {
        while let Some(buf) = commands.pop_front() {
          sink.write_command(&buf, &stopping)?;
        }
        sink.flush()?;
      }
    }
  }
}

/// Sink writing both streams to one descriptor (sockets, pipes).
pub struct FdSink {
  fd: std::os::fd::OwnedFd,
}

impl FdSink {
  #[must_use]
  pub fn new(fd: std::os::fd::OwnedFd) -> Self {
    Self { fd }
  }
}

impl OutputSink for FdSink {
  fn write_data(&mut self, buf: &[u8], stopping: &dyn Fn() -> bool) -> anyhow::Result<()> {
    crate::os::write_all(&self.fd, buf, stopping)
  }

  fn write_command(&mut self, buf: &[u8], stopping: &dyn Fn() -> bool) -> anyhow::Result<()> {
    crate::os::write_all(&self.fd, buf, stopping)
  }
}
