//! Child process reaper.
//!
//! One dedicated thread owns `waitpid` for the whole process. Workers
//! register pids with a delivery callback; statuses for unregistered pids
//! park in a bounded orphan map until someone claims them. The bound keeps a
//! pathological forker from growing the map without limit: past the cap,
//! statuses are silently dropped.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use nix::sys::wait::{WaitStatus, waitpid};
use parking_lot::{Condvar, Mutex};

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
  Exited(i32),
  Signaled(i32),
}

impl WaitOutcome {
  #[must_use]
  pub fn success(&self) -> bool {
    matches!(self, Self::Exited(0))
  }
}

/// Delivery target for a registered pid: typically a clone of the owning
/// worker's work-queue sender.
pub type ExitSink = Box<dyn Fn(WaitOutcome) + Send>;

enum Entry {
  /// Deliver to this owner on reap.
  Owned(ExitSink),
  /// Reap silently (owner abandoned the pid, or it was never wanted).
  Ignored,
}

struct Inner {
  registered: HashMap<i32, Entry>,
  orphans: HashMap<i32, WaitOutcome>,
  stopping: bool,
}

pub struct Reaper {
  inner: Mutex<Inner>,
  cond: Condvar,
  orphan_cap: usize,
}

impl Reaper {
  #[must_use]
  pub fn new(orphan_cap: usize) -> Arc<Self> {
    Arc::new(Self {
      inner: Mutex::new(Inner {
        registered: HashMap::new(),
        orphans: HashMap::new(),
        stopping: false,
      }),
      cond: Condvar::new(),
      orphan_cap,
    })
  }

  /// Registers a pid for delivery. If the pid was already reaped into the
  /// orphan map, the stored status is delivered immediately and nothing is
  /// registered.
  pub fn register_process(&self, pid: i32, sink: ExitSink) {
    let immediate = {
      let mut inner = self.inner.lock();
      match inner.orphans.remove(&pid) {
        Some(outcome) => Some((outcome, sink)),
        None => {
          inner.registered.insert(pid, Entry::Owned(sink));
          self.cond.notify_one();
          None
        }
      }
    };
    if let Some((outcome, sink)) = immediate {
      debug!("reaper: delivering pid {pid} (already received), {outcome:?}");
      sink(outcome);
    }
  }

  /// Registers a pid whose status nobody wants (monitor scripts). A match in
  /// the orphan map is simply discarded.
  pub fn ignore_process(&self, pid: i32) {
    let mut inner = self.inner.lock();
    if inner.orphans.remove(&pid).is_none() {
      inner.registered.insert(pid, Entry::Ignored);
      self.cond.notify_one();
    }
  }

  /// Clears the owner of a registered pid; its status is dropped on reap.
  pub fn abandon_process(&self, pid: i32) {
    let mut inner = self.inner.lock();
    if let Some(entry) = inner.registered.get_mut(&pid) {
      *entry = Entry::Ignored;
    }
  }

  pub fn stop(&self) {
    let mut inner = self.inner.lock();
    inner.stopping = true;
    self.cond.notify_one();
  }

  /// Starts the wait loop. The thread is detached: `waitpid` has no portable
  /// interruption, so shutdown only flags it and lets the process exit.
  pub fn start(self: &Arc<Self>) {
    let this = Arc::clone(self);
    std::thread::Builder::new()
      .name("reaper".to_string())
      .spawn(move || this.run())
      .expect("failed to spawn reaper thread");
  }

  fn run(&self) {
    loop {
      {
        let mut inner = self.inner.lock();
        while !inner.stopping && inner.registered.is_empty() {
          self.cond.wait(&mut inner);
        }
        if inner.stopping {
          break;
        }
      }

      let (pid, outcome) = match waitpid(None, None) {
        Ok(WaitStatus::Exited(pid, code)) => (pid.as_raw(), WaitOutcome::Exited(code)),
        Ok(WaitStatus::Signaled(pid, signal, _)) => {
          (pid.as_raw(), WaitOutcome::Signaled(signal as i32))
        }
        Ok(_) => continue,
        Err(nix::errno::Errno::ECHILD) => {
          // Nothing left to wait for; park until a registration arrives.
          let mut inner = self.inner.lock();
          if inner.stopping {
            break;
          }
          self.cond.wait(&mut inner);
          continue;
        }
        Err(nix::errno::Errno::EINTR) => continue,
        Err(e) => {
          error!("reaper: waitpid: {e}");
          break;
        }
      };

      let sink = {
        let mut inner = self.inner.lock();
        match inner.registered.remove(&pid) {
          Some(Entry::Owned(sink)) => Some(sink),
          Some(Entry::Ignored) => None,
          None => {
            if inner.orphans.len() < self.orphan_cap {
              inner.orphans.insert(pid, outcome);
            }
            None
          }
        }
      };

      if let Some(sink) = sink {
        debug!("reaper: delivering pid {pid}, {outcome:?}");
        sink(outcome);
      }
    }
    debug!("reaper: exiting");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;

  fn reap_directly(reaper: &Reaper, pid: i32, outcome: WaitOutcome) {
    // Exercises the bookkeeping without a real child.
    let sink = {
      let mut inner = reaper.inner.lock();
      match inner.registered.remove(&pid) {
        Some(Entry::Owned(sink)) => Some(sink),
        Some(Entry::Ignored) => None,
        None => {
          if inner.orphans.len() < reaper.orphan_cap {
            inner.orphans.insert(pid, outcome);
          }
          None
        }
      }
    };
    if let Some(sink) = sink {
      sink(outcome);
    }
  }

  #[test]
  fn registered_pid_is_delivered() {
    let reaper = Reaper::new(128);
    let (tx, rx) = mpsc::channel();
    reaper.register_process(42, Box::new(move |o| tx.send(o).unwrap()));
    reap_directly(&reaper, 42, WaitOutcome::Exited(0));
    assert_eq!(rx.try_recv().unwrap(), WaitOutcome::Exited(0));
  }

  #[test]
  fn abandoned_pid_is_dropped_silently() {
    let reaper = Reaper::new(128);
    let (tx, rx) = mpsc::channel::<WaitOutcome>();
    reaper.register_process(42, Box::new(move |o| tx.send(o).unwrap()));
    reaper.abandon_process(42);
    reap_directly(&reaper, 42, WaitOutcome::Exited(1));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn orphan_cap_bounds_the_map() {
    let reaper = Reaper::new(2);
    reap_directly(&reaper, 1, WaitOutcome::Exited(0));
    reap_directly(&reaper, 2, WaitOutcome::Exited(0));
    reap_directly(&reaper, 3, WaitOutcome::Exited(0));
    assert_eq!(reaper.inner.lock().orphans.len(), 2);
    assert!(!reaper.inner.lock().orphans.contains_key(&3));
  }

  #[test]
  fn late_registration_gets_parked_status_immediately() {
    let reaper = Reaper::new(128);
    reap_directly(&reaper, 99, WaitOutcome::Signaled(15));

    let (tx, rx) = mpsc::channel();
    reaper.register_process(99, Box::new(move |o| tx.send(o).unwrap()));
    assert_eq!(rx.try_recv().unwrap(), WaitOutcome::Signaled(15));
    // The pid was consumed from orphans and never registered.
    assert!(reaper.inner.lock().orphans.is_empty());
    assert!(!reaper.inner.lock().registered.contains_key(&99));
  }

  #[test]
  fn ignored_pid_consumes_orphan() {
    let reaper = Reaper::new(128);
    reap_directly(&reaper, 7, WaitOutcome::Signaled(9));
    reaper.ignore_process(7);
    assert!(reaper.inner.lock().orphans.is_empty());
    assert!(!reaper.inner.lock().registered.contains_key(&7));
  }
}
