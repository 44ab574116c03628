//! Attribute monitor.
//!
//! Runs the identity/attribute script chain, accumulating `KEY=VALUE` lines
//! into a pending map that is published to the listener atomically when the
//! chain completes, then keeps a persistent monitor child whose lines update
//! attributes live. A `Restart` work item kills whatever is running and
//! replays the chain. Client input is written to the monitor's stdin only
//! while no chain is running; delivery is best effort.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::config::Tunables;
use crate::mux::listener::ListenerWork;
use crate::mux::reaper::Reaper;
use crate::os;
use crate::os::fork;
use crate::proto::attrs::AttributeMap;

pub enum MonitorWork {
  Close,
  Restart,
  Input(Vec<u8>),
}

/// Script configuration: the chain runs once per (re)start, the monitor
/// command stays resident.
#[derive(Debug, Clone, Default)]
pub struct MonitorScripts {
  pub chain: Vec<Vec<String>>,
  pub monitor: Option<Vec<String>>,
}

struct Child {
  pid: i32,
  stdout: OwnedFd,
  stdin: OwnedFd,
}

pub struct Monitor {
  work_rx: Receiver<MonitorWork>,
  scripts: MonitorScripts,
  reaper: Arc<Reaper>,
  listener_tx: Sender<ListenerWork>,
  tunables: Arc<Tunables>,
  /// 0 while the persistent monitor runs; 1-based script index during a
  /// chain.
  state: usize,
  pending: AttributeMap,
  child: Option<Child>,
  accum: Vec<u8>,
}

impl Monitor {
  pub fn spawn(
    scripts: MonitorScripts,
    reaper: Arc<Reaper>,
    listener_tx: Sender<ListenerWork>,
    tunables: Arc<Tunables>,
  ) -> (Sender<MonitorWork>, std::thread::JoinHandle<()>) {
    let (work_tx, work_rx) = unbounded();
    let mut monitor = Self {
      work_rx,
      scripts,
      reaper,
      listener_tx,
      tunables,
      state: 0,
      pending: AttributeMap::new(),
      child: None,
      accum: Vec::new(),
    };
    let handle = std::thread::Builder::new()
      .name("monitor".to_string())
      .spawn(move || monitor.run())
      .expect("failed to spawn monitor thread");
    (work_tx, handle)
  }

  fn run(&mut self) {
    self.restart_chain();

    loop {
      while let Ok(item) = self.work_rx.try_recv() {
        match item {
          MonitorWork::Close => {
            self.kill_child("server shutdown");
            debug!("monitor: exiting");
            return;
          }
          MonitorWork::Restart => self.restart_chain(),
          MonitorWork::Input(data) => self.handle_input(&data),
        }
      }

      match &self.child {
        Some(child) => {
          let pollfd = PollFd::new(child.stdout.as_fd(), PollFlags::POLLIN);
          let timeout = PollTimeout::try_from(100u16).unwrap_or(PollTimeout::NONE);
          match poll(&mut [pollfd], timeout) {
            Ok(0) => {}
            Ok(_) => self.read_child(),
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
              error!("monitor: poll: {e}");
              self.finish_child();
            }
          }
        }
        None => {
          // Nothing running; just service the queue.
          match self.work_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(MonitorWork::Close) => return,
            Ok(MonitorWork::Restart) => self.restart_chain(),
            Ok(MonitorWork::Input(_)) | Err(_) => {}
          }
        }
      }
    }
  }

  /// Kills whatever is running and replays the script chain from the start.
  fn restart_chain(&mut self) {
    self.kill_child("reloading");
    self.pending.clear();
    self.accum.clear();
    self.state = 0;
    self.advance();
  }

  /// Starts the next chain script, or publishes and starts the persistent
  /// monitor when the chain is done.
  fn advance(&mut self) {
    loop {
      if self.state < self.scripts.chain.len() {
        let argv = self.scripts.chain[self.state].clone();
        self.state += 1;
        match fork::spawn_line_source(&argv) {
          Ok((pid, stdout, stdin)) => {
            debug!("monitor: started script {} (pid {pid})", self.state);
            self.reaper.ignore_process(pid);
            self.child = Some(Child { pid, stdout, stdin });
            return;
          }
          Err(e) => {
            warn!("monitor: script failed to start: {e:#}");
            continue;
          }
        }
      }

      // Chain complete: publish atomically, then start the monitor.
      if self.state > 0 || !self.pending.is_empty() {
        let map = std::mem::take(&mut self.pending);
        if !map.is_empty() {
          let _ = self.listener_tx.send(ListenerWork::MonitorAttributes(map));
        }
      }
      self.state = 0;
      self.start_monitor();
      return;
    }
  }

  fn start_monitor(&mut self) {
    let Some(argv) = self.scripts.monitor.clone() else {
      return;
    };
    match fork::spawn_line_source(&argv) {
      Ok((pid, stdout, stdin)) => {
        debug!("monitor: started monitor process (pid {pid})");
        self.reaper.ignore_process(pid);
        self.child = Some(Child { pid, stdout, stdin });
      }
      Err(e) => warn!("monitor: failed to start process: {e:#}"),
    }
  }

  fn kill_child(&mut self, why: &str) {
    if let Some(child) = self.child.take() {
      self.reaper.abandon_process(child.pid);
      self.reaper.ignore_process(child.pid);
      fork::kill_process(child.pid);
      debug!("monitor: sent SIGTERM to pid {} ({why})", child.pid);
    }
  }

  fn handle_input(&mut self, data: &[u8]) {
    if self.state != 0 {
      return;
    }
    if let Some(child) = &self.child {
      let mut line = data.to_vec();
      line.push(b'\n');
      // Reliable delivery of monitor input is not guaranteed.
      let _ = nix::unistd::write(child.stdin.as_fd(), &line);
    }
  }

  fn read_child(&mut self) {
    let Some(child) = &self.child else { return };
    let mut buf = vec![0u8; self.tunables.max_attribute_length / 2];
    match nix::unistd::read(child.stdout.as_fd(), &mut buf) {
      Ok(0) => {
        if !self.accum.is_empty() {
          self.accum.push(b'\n');
          self.parse_lines();
        }
        self.finish_child();
      }
      Ok(n) => {
        self.accum.extend_from_slice(&buf[..n]);
        self.parse_lines();
        if self.accum.len() >= self.tunables.max_attribute_length {
          error!("monitor: key-value size limit exceeded");
          self.accum.clear();
          self.finish_child();
        }
      }
      Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => {}
      Err(e) => {
        warn!("monitor: read error: {e}");
        self.finish_child();
      }
    }
  }

  /// Current child finished: advance the chain, or clear the monitor slot.
  fn finish_child(&mut self) {
    self.child = None;
    if self.state != 0 {
      self.advance();
    } else {
      debug!("monitor: monitor process finished");
    }
  }

  fn parse_lines(&mut self) {
    loop {
      // A NUL truncates the line.
      if let Some(nul) = self.accum.iter().position(|&b| b == 0) {
        let end = self.accum[nul..]
          .iter()
          .position(|&b| b == b'\n' || b == b'\r')
          .map(|i| nul + i);
        if let Some(end) = end {
          self.accum.drain(nul..end);
        } else {
          self.accum.truncate(nul);
        }
      }

      let Some(eol) = self.accum.iter().position(|&b| b == b'\n' || b == b'\r') else {
        return;
      };
      let line: Vec<u8> = self.accum.drain(..eol).collect();
      while self.accum.first().is_some_and(|&b| b == b'\n' || b == b'\r') {
        self.accum.remove(0);
      }

      let text = String::from_utf8_lossy(&line);
      if let Some((key, value)) = text.split_once('=') {
        if !key.is_empty() {
          self.add_spec(key.to_string(), value.to_string());
        }
      } else if !text.is_empty() {
        self.remove_spec(&text);
      }
    }
  }

  fn add_spec(&mut self, key: String, value: String) {
    if self.state != 0 {
      self.pending.insert(key, value);
    } else if !os::restricted_monitor_attribute(&key) {
      let _ = self.listener_tx.send(ListenerWork::MonitorSet(key, value));
    }
  }

  fn remove_spec(&mut self, key: &str) {
    if self.state == 0 && !os::restricted_monitor_attribute(key) {
      let _ = self.listener_tx.send(ListenerWork::MonitorRemove(key.to_string()));
    }
  }
}
