//! Terminal worker: one thread driving a PTY-backed session.
//!
//! Owns the child process, the emulator, and the scrollback buffers. Bytes
//! read from the pty feed the emulator inside the terminal state lock; the
//! resulting changes are replicated to every watch and the watches are
//! activated. Client keystrokes arrive through the output scheduler's data
//! queue, which writes to the pty and reports back so the rate limiter can
//! reset.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};

use crate::buffer::RegionId;
use crate::buffer::update;
use crate::config::Tunables;
use crate::emu::vt::VtEmulator;
use crate::emu::{
  EMU_HARD_SCROLL_LOCK, EMU_RATELIMITED, EMU_SOFT_SCROLL_LOCK, Emulator, EmulatorReport,
  RESET_CLEAR_SCREEN, RESET_CLEAR_SCROLLBACK, RESET_EMULATOR, TermBuffers, TermSize,
};
use crate::id::InstanceId;
use crate::mux::filemon::{Filemon, FilemonEvent, FilemonWork};
use crate::mux::listener::{Listener, ListenerWork, OwnershipChange, TermRegistration};
use crate::mux::output::{OutputEvents, OutputScheduler, OutputSink};
use crate::mux::reaper::WaitOutcome;
use crate::mux::status::TermStatusTracker;
use crate::mux::watch::Watch;
use crate::proto::attrs::{self, AttributeMap};
use crate::proto::wire::Marshaler;
use crate::proto::{self, ExitAction};

pub enum TermWork {
  Close(u32),
  PtyData(Vec<u8>),
  PtyEof,
  WatchAdded(Arc<Watch>),
  ProcessExited(WaitOutcome),
  Resize { cols: u16, rows: u16 },
  ResizeBuffer { bufid: u8, caporder: u8 },
  Reset(u32),
  Signal(u32),
  MouseMove { x: u32, y: u32 },
  CreateUserRegion { start_row: u64, start_col: u32, end_row: u64, end_col: u32, attributes: AttributeMap },
  RemoveRegion { bufid: u8, id: RegionId },
  UpdateEnviron(HashMap<String, String>),
  ChangeOwner(Arc<OwnershipChange>),
  ClearOwner(InstanceId),
  /// The scheduler drained queued input; resets the rate limiter.
  InputSent,
  ScrollLock { hard: bool, enabled: bool },
  SetAttribute { key: String, value: String },
  RemoveAttribute { key: String },
  FileEvent(FilemonEvent),
}

/// Shared terminal state, locked for every emulator transaction and for
/// read-side command handling on reader threads.
pub struct TermState {
  pub buffers: TermBuffers,
  pub emulator: Box<dyn Emulator>,
  pub attributes: AttributeMap,
  pub owner: Option<InstanceId>,
}

impl TermState {
  /// Attributes suitable for forwarding (private keys withheld).
  #[must_use]
  pub fn public_attributes(&self) -> AttributeMap {
    self
      .attributes
      .iter()
      .filter(|(key, _)| !attrs::is_private(key))
      .map(|(key, value)| (key.clone(), value.clone()))
      .collect()
  }

  #[must_use]
  pub fn attribute_u32(&self, key: &str, default: u32) -> u32 {
    self.attributes.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
  }
}

/// Sink wiring the scheduler's data queue to the pty writer. The writer is
/// swapped on relaunch, so it hides behind a shared slot.
struct PtySink {
  writer: Arc<Mutex<Option<Box<dyn std::io::Write + Send>>>>,
}

impl OutputSink for PtySink {
  fn write_data(&mut self, buf: &[u8], _stopping: &dyn Fn() -> bool) -> anyhow::Result<()> {
    let mut slot = self.writer.lock();
    if let Some(writer) = slot.as_mut() {
      writer.write_all(buf).context("write to pty")?;
      let _ = writer.flush();
    }
    Ok(())
  }

  fn write_command(&mut self, _buf: &[u8], _stopping: &dyn Fn() -> bool) -> anyhow::Result<()> {
    // Terminals carry no peer command stream.
    Ok(())
  }
}

/// Rate limiter stages: idle, active, limited.
const RATE_IDLE: u8 = 0;
const RATE_ACTIVE: u8 = 1;
const RATE_LIMITED: u8 = 2;

pub struct TermInstance {
  id: InstanceId,
  listener: Arc<Listener>,
  tunables: Arc<Tunables>,
  state: Arc<Mutex<TermState>>,
  watches: Vec<Arc<Watch>>,
  work_tx: Sender<TermWork>,
  work_rx: Receiver<TermWork>,
  output: Arc<OutputScheduler>,
  writer_slot: Arc<Mutex<Option<Box<dyn std::io::Write + Send>>>>,
  master: Option<Box<dyn MasterPty + Send>>,
  child: Option<Box<dyn portable_pty::Child + Send>>,
  pid: i32,
  status: TermStatusTracker,
  filemon_tx: Sender<FilemonWork>,
  filemon_join: Option<std::thread::JoinHandle<()>>,
  output_join: Option<std::thread::JoinHandle<()>>,
  // Rate limiter.
  rate_status: u8,
  rate_idle_time: Instant,
  rate_push_time: Instant,
  // Idle probe.
  timeout_ms: i64,
  launch_time: Instant,
  have_outcome: bool,
  have_closed: bool,
}

impl TermInstance {
  /// Builds and starts a terminal worker. The returned registration goes to
  /// the listener's work queue.
  pub fn spawn(
    listener: Arc<Listener>,
    id: InstanceId,
    owner: Option<InstanceId>,
    size: TermSize,
    owner_attributes: AttributeMap,
    environ: HashMap<String, String>,
    requested: AttributeMap,
  ) -> TermRegistration {
    let tunables = Arc::clone(&listener.tunables);
    let caporder = requested
      .get(attrs::ATTR_PROFILE_CAPORDER)
      .and_then(|v| v.parse().ok())
      .unwrap_or(tunables.default_caporder);

    let mut attributes = owner_attributes;
    for (key, value) in requested {
      attributes.entry(key).or_insert(value);
    }
    attributes.insert(attrs::ATTR_SESSION_ID.to_string(), id.to_string());
    attributes.insert(attrs::ATTR_SESSION_COLS.to_string(), size.cols.to_string());
    attributes.insert(attrs::ATTR_SESSION_ROWS.to_string(), size.rows.to_string());
    attributes.insert(attrs::ATTR_SESSION_ENCODING.to_string(), "UTF-8".to_string());

    let state = Arc::new(Mutex::new(TermState {
      buffers: TermBuffers::new(caporder, tunables.default_caporder.min(8)),
      emulator: Box::new(VtEmulator::new(size)),
      attributes,
      owner,
    }));

    let (work_tx, work_rx) = unbounded();
    let output = OutputScheduler::new(tunables.buffer_warn_threshold);
    let writer_slot: Arc<Mutex<Option<Box<dyn std::io::Write + Send>>>> = Arc::new(Mutex::new(None));

    let (filemon_tx, filemon_join) = Filemon::spawn(tunables.file_monitor_limit, work_tx.clone());

    let mut instance = Self {
      id,
      listener: Arc::clone(&listener),
      tunables,
      state: Arc::clone(&state),
      watches: Vec::new(),
      work_tx: work_tx.clone(),
      work_rx,
      output: Arc::clone(&output),
      writer_slot,
      master: None,
      child: None,
      pid: 0,
      status: TermStatusTracker::new(environ),
      filemon_tx,
      filemon_join: Some(filemon_join),
      output_join: None,
      rate_status: RATE_IDLE,
      rate_idle_time: Instant::now(),
      rate_push_time: Instant::now(),
      timeout_ms: 0,
      launch_time: Instant::now(),
      have_outcome: false,
      have_closed: false,
    };

    let join = std::thread::Builder::new()
      .name("term".to_string())
      .spawn(move || instance.run())
      .expect("failed to spawn term thread");

    TermRegistration { id, work: work_tx, output, state, join }
  }

  fn run(&mut self) {
    // The scheduler thread lives for the whole terminal; launches swap the
    // pty writer underneath it.
    let events = {
      let work_tx = self.work_tx.clone();
      let listener = Arc::clone(&self.listener);
      let id = self.id;
      OutputEvents {
        throttle_resumed: Box::new(move || {
          let mut m = Marshaler::new(proto::THROTTLE_RESUME);
          m.add_id(&id);
          let frame = m.finish();
          listener.resume_tasks(id);
          listener.forward_to_servers(&frame);
        }),
        input_sent: Box::new(move || {
          let _ = work_tx.send(TermWork::InputSent);
        }),
      }
    };
    self.output_join =
      Some(self.output.start(Box::new(PtySink { writer: Arc::clone(&self.writer_slot) }), events));

    self.launch();

    loop {
      let timeout = match self.timeout_ms {
        t if t < 0 => Duration::from_secs(3600),
        0 => Duration::from_millis(self.tunables.idle_initial_timeout_ms),
        t => Duration::from_millis(t as u64),
      };
      match self.work_rx.recv_timeout(timeout) {
        Ok(item) => {
          if !self.handle_work(item) {
            break;
          }
        }
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
          if !self.handle_idle() {
            break;
          }
        }
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
      }
    }

    self.teardown();
  }

  fn teardown(&mut self) {
    let _ = self.filemon_tx.send(FilemonWork::Close);
    if let Some(join) = self.filemon_join.take() {
      let _ = join.join();
    }

    self.output.stop();
    if let Some(join) = self.output_join.take() {
      let _ = join.join();
    }

    if self.pid != 0 {
      self.listener.reaper.abandon_process(self.pid);
    }

    debug!("term {}: goodbye", self.id);
    self.listener.send_work(ListenerWork::RemoveTerm(self.id));
  }

  /*
   * Launch and halt
   */

  fn launch(&mut self) {
    self.launch_time = Instant::now();
    self.timeout_ms = 0;
    self.status.start();

    let (argv, dir, extra_env, size) = {
      let state = self.state.lock();
      let argv = state
        .attributes
        .get(attrs::ATTR_PROFILE_COMMAND)
        .map(|block| crate::os::fork::parse_command_block(block))
        .filter(|argv| !argv.is_empty())
        .unwrap_or_else(|| {
          vec![self.status.environ().get("SHELL").cloned().unwrap_or_else(|| "/bin/sh".to_string())]
        });
      let dir = state.attributes.get(attrs::ATTR_PROFILE_STARTDIR).cloned().unwrap_or_default();
      let extra_env = state
        .attributes
        .get(attrs::ATTR_PROFILE_ENVIRON)
        .map(|block| crate::os::fork::parse_environ_block(block))
        .unwrap_or_default();
      (argv, dir, extra_env, state.emulator.size())
    };

    let pty_size =
      PtySize { rows: size.rows, cols: size.cols, pixel_width: 0, pixel_height: 0 };
    let pty_system = native_pty_system();
    let pair = match pty_system.openpty(pty_size) {
      Ok(pair) => pair,
      Err(e) => {
        warn!("term {}: failed to open pty: {e}", self.id);
        self.feed_banner(&format!("{e}\r\n"));
        return;
      }
    };

    let mut builder = CommandBuilder::new(&argv[0]);
    for arg in &argv[1..] {
      builder.arg(arg);
    }
    if !dir.is_empty() {
      builder.cwd(crate::os::relative_to_home(&dir));
    }
    for (key, value) in self.status.environ() {
      builder.env(key, value);
    }
    for (key, value) in &extra_env {
      builder.env(key, value);
    }
    builder.env("TERM", "xterm-256color");

    let child = match pair.slave.spawn_command(builder) {
      Ok(child) => child,
      Err(e) => {
        warn!("term {}: failed to start process: {e}", self.id);
        self.feed_banner(&format!("{e}\r\n"));
        return;
      }
    };
    drop(pair.slave);

    let master = pair.master;
    match master.take_writer() {
      Ok(writer) => *self.writer_slot.lock() = Some(writer),
      Err(e) => warn!("term {}: failed to take pty writer: {e}", self.id),
    }

    self.pid = child.process_id().map(|pid| pid as i32).unwrap_or(0);
    self.have_outcome = false;
    self.have_closed = false;

    if self.pid != 0 {
      let work_tx = self.work_tx.clone();
      self.listener.reaper.register_process(
        self.pid,
        Box::new(move |outcome| {
          let _ = work_tx.send(TermWork::ProcessExited(outcome));
        }),
      );
    }

    // Read pump bound to this launch's master; dies on its EOF.
    match master.try_clone_reader() {
      Ok(mut reader) => {
        let work_tx = self.work_tx.clone();
        let bufsize = self.tunables.read_buffer_size;
        std::thread::Builder::new()
          .name("term-read".to_string())
          .spawn(move || {
            let mut buf = vec![0u8; bufsize];
            loop {
              match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                  if work_tx.send(TermWork::PtyData(buf[..n].to_vec())).is_err() {
                    return;
                  }
                }
              }
            }
            let _ = work_tx.send(TermWork::PtyEof);
          })
          .expect("failed to spawn term read pump");
      }
      Err(e) => warn!("term {}: failed to clone pty reader: {e}", self.id),
    }

    self.master = Some(master);
    self.child = Some(child);

    debug!("term {}: started process (pid {})", self.id, self.pid);
    let changed = self.status.changed_map();
    self.push_status_attributes(changed);
  }

  fn halt(&mut self) {
    let outcome_msg = self.status.outcome_str().to_string();
    let exit_action = {
      let state = self.state.lock();
      ExitAction::from_u32(state.attribute_u32(attrs::ATTR_PROFILE_EXITACTION, 0))
    };

    self.writer_slot.lock().take();
    self.master = None;
    self.child = None;

    match exit_action {
      ExitAction::Restart | ExitAction::Clear => {
        let mut flags = RESET_EMULATOR;
        if exit_action == ExitAction::Clear {
          flags |= RESET_CLEAR_SCROLLBACK | RESET_CLEAR_SCREEN;
        }
        let banner = format!("{outcome_msg} - Restarting process\r\n");
        self.reset_with_banner(&banner, flags);
        self.launch();
      }
      ExitAction::Stop => {
        self.feed_banner(&format!("{outcome_msg}\r\nSession has finished\r\n"));
        let (auto_close, auto_close_time) = {
          let state = self.state.lock();
          (
            state.attribute_u32(attrs::ATTR_PROFILE_AUTOCLOSE, 0),
            u64::from(state.attribute_u32(
              "profile.autoclosetime",
              self.tunables.auto_close_time_ms as u32,
            )),
          )
        };
        let runtime = self.launch_time.elapsed().as_millis() as u64;
        if runtime >= auto_close_time && self.status.auto_close(auto_close) {
          let _ = self.work_tx.send(TermWork::Close(proto::STATUS_NORMAL));
        }
      }
    }
  }

  /*
   * Emulator transactions
   */

  fn feed_banner(&mut self, text: &str) {
    let text = text.to_string();
    self.apply_event(text.as_bytes(), false);
  }

  fn reset_with_banner(&mut self, text: &str, flags: u32) {
    self.rate_status = RATE_IDLE;
    let report = {
      let mut state = self.state.lock();
      let TermState { buffers, emulator, .. } = &mut *state;
      let report = emulator.term_reset(buffers, text.as_bytes(), flags);
      Self::rescan_links(buffers, &report);
      report
    };
    if report.any() {
      self.push_changes(true, &report);
    }
  }

  /// Feeds child output through the rate limiter and the emulator.
  fn apply_event(&mut self, bytes: &[u8], running: bool) {
    let mut activate = true;
    let mut flag_change = false;
    let now = Instant::now();

    match self.rate_status {
      RATE_LIMITED => {
        if now.duration_since(self.rate_push_time)
          >= Duration::from_millis(self.tunables.ratelimit_interval_ms)
        {
          self.rate_push_time = now;
        } else {
          activate = false;
        }
      }
      RATE_ACTIVE => {
        if running
          && now.duration_since(self.rate_idle_time)
            > Duration::from_millis(self.tunables.ratelimit_threshold_ms)
        {
          self.rate_status = RATE_LIMITED;
          self.rate_push_time = now;
          flag_change = true;
        }
      }
      _ => {
        if running {
          self.rate_status = RATE_ACTIVE;
          self.rate_idle_time = now;
        }
      }
    }

    let report = {
      let mut state = self.state.lock();
      let TermState { buffers, emulator, .. } = &mut *state;
      if flag_change {
        let _ = emulator.set_flag(EMU_RATELIMITED, true);
      }
      let mut report = emulator.term_event(buffers, bytes);
      report.flags_changed |= flag_change;
      Self::rescan_links(buffers, &report);
      report
    };

    if report.any() {
      self.push_changes(activate, &report);
    }
  }

  /// Link regions follow the rows that changed in this transaction.
  fn rescan_links(buffers: &mut TermBuffers, report: &EmulatorReport) {
    if let (Some(&first), Some(&last)) =
      (report.changed_rows.iter().min(), report.changed_rows.iter().max())
    {
      let _ = update::end_update(buffers.active_mut(), first, last);
    }
  }

  /// Replicates one report to every watch, activating when allowed.
  fn push_changes(&mut self, activate: bool, report: &EmulatorReport) {
    let bufid = { self.state.lock().buffers.active as u8 };
    for watch in &self.watches {
      watch.push_report(bufid, report);
      if activate {
        watch.activate();
      }
    }
  }

  fn push_status_attributes(&mut self, changed: AttributeMap) {
    if changed.is_empty() {
      return;
    }
    {
      let mut state = self.state.lock();
      for (key, value) in &changed {
        state.attributes.insert(key.clone(), value.clone());
        if key == attrs::ATTR_PROC_CWD {
          let _ = self.filemon_tx.send(FilemonWork::Monitor(value.clone()));
        }
      }
    }
    for watch in &self.watches {
      watch.push_attributes(&changed);
      watch.activate();
    }
  }

  fn reset_ratelimit(&mut self) {
    match self.rate_status {
      RATE_LIMITED => {
        let report = {
          let mut state = self.state.lock();
          let changed = state.emulator.set_flag(EMU_RATELIMITED, false);
          let mut report = EmulatorReport::default();
          report.flags_changed = changed;
          report
        };
        if report.any() {
          self.push_changes(true, &report);
        }
        self.rate_status = RATE_IDLE;
      }
      RATE_ACTIVE => self.rate_status = RATE_IDLE,
      _ => {}
    }
  }

  /*
   * Work handling
   */

  fn handle_work(&mut self, item: TermWork) -> bool {
    self.timeout_ms = 0;

    match item {
      TermWork::Close(reason) => return self.handle_close(reason),
      TermWork::PtyData(bytes) => self.apply_event(&bytes, true),
      TermWork::PtyEof => {
        self.writer_slot.lock().take();
        self.master = None;
        self.have_closed = true;
        if self.have_outcome {
          self.halt();
        }
      }
      TermWork::ProcessExited(outcome) => {
        self.status.set_outcome(self.pid, outcome);
        let changed = self.status.changed_map();
        self.push_status_attributes(changed);
        self.pid = 0;
        self.have_outcome = true;
        if self.have_closed {
          self.halt();
        }
      }
      TermWork::WatchAdded(watch) => {
        // Give the new subscriber the full current picture.
        let attributes = { self.state.lock().public_attributes() };
        watch.push_attributes(&attributes);
        if let Some(owner) = { self.state.lock().owner } {
          watch.push_ownership(owner);
        }
        watch.activate();
        self.watches.push(watch);
      }
      TermWork::Resize { cols, rows } => {
        if let Some(master) = &self.master {
          let _ = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
        }
        let report = {
          let mut state = self.state.lock();
          let TermState { buffers, emulator, .. } = &mut *state;
          emulator.term_resize(buffers, TermSize::new(cols, rows))
        };
        if report.any() {
          self.push_changes(true, &report);
        }
        let mut changed = AttributeMap::new();
        changed.insert(attrs::ATTR_SESSION_COLS.to_string(), cols.to_string());
        changed.insert(attrs::ATTR_SESSION_ROWS.to_string(), rows.to_string());
        self.push_status_attributes(changed);
      }
      TermWork::ResizeBuffer { bufid, caporder } => {
        {
          let mut state = self.state.lock();
          state.buffers.get_mut(bufid).change_capacity(caporder);
        }
        let mut report = EmulatorReport::default();
        report.regions_changed = true;
        self.push_changes(true, &report);
      }
      TermWork::Reset(flags) => self.reset_with_banner("", flags),
      TermWork::Signal(signal) => self.status.send_signal(self.pid, signal as i32),
      TermWork::MouseMove { x, y } => {
        let mut changed = AttributeMap::new();
        changed.insert("session.mouse".to_string(), format!("{x},{y}"));
        for watch in &self.watches {
          watch.push_attributes(&changed);
          watch.activate();
        }
      }
      TermWork::CreateUserRegion { start_row, start_col, end_row, end_col, attributes } => {
        let created = {
          let mut state = self.state.lock();
          state
            .buffers
            .get_mut(0)
            .regions_mut()
            .insert_user(start_row, start_col, end_row, end_col, attributes)
            .ok()
        };
        if let Some(id) = created {
          for watch in &self.watches {
            watch.push_region(0, id);
            watch.activate();
          }
        }
      }
      TermWork::RemoveRegion { bufid, id } => {
        let existed = {
          let mut state = self.state.lock();
          state.buffers.get_mut(bufid).regions_mut().remove(id).is_ok()
        };
        if existed {
          for watch in &self.watches {
            watch.push_region(bufid, id);
            watch.activate();
          }
        }
      }
      TermWork::UpdateEnviron(environ) => {
        if self.status.set_environ(environ) {
          let changed = self.status.changed_map();
          self.push_status_attributes(changed);
        }
      }
      TermWork::ChangeOwner(change) => {
        let applies = {
          let state = self.state.lock();
          match change.from {
            Some(from) => state.owner == Some(from) || state.owner.is_none(),
            None => state.owner.is_none(),
          }
        };
        if applies {
          {
            let mut state = self.state.lock();
            state.owner = Some(change.to);
            for (key, value) in &change.attributes {
              state.attributes.insert(key.clone(), value.clone());
            }
          }
          let _ = self.status.set_environ(change.environ.clone());
          self.push_status_attributes(change.attributes.clone());
          for watch in &self.watches {
            watch.push_ownership(change.to);
            watch.activate();
          }
        }
      }
      TermWork::ClearOwner(departed) => {
        let cleared = {
          let mut state = self.state.lock();
          if state.owner == Some(departed) {
            state.owner = None;
            true
          } else {
            false
          }
        };
        if cleared {
          let mut changed = AttributeMap::new();
          changed.insert(attrs::ATTR_OWNER_ID.to_string(), String::new());
          self.push_status_attributes(changed);
        }
      }
      TermWork::InputSent => self.reset_ratelimit(),
      TermWork::ScrollLock { hard, enabled } => {
        let flag = if hard { EMU_HARD_SCROLL_LOCK } else { EMU_SOFT_SCROLL_LOCK };
        let changed = {
          let mut state = self.state.lock();
          state.emulator.set_flag(flag, enabled)
        };
        if changed {
          let mut report = EmulatorReport::default();
          report.flags_changed = true;
          self.push_changes(true, &report);
        }
      }
      TermWork::SetAttribute { key, value } => {
        let changed = {
          let mut state = self.state.lock();
          let stale = state.attributes.get(&key).is_none_or(|old| *old != value);
          if stale {
            state.attributes.insert(key.clone(), value.clone());
          }
          stale
        };
        if changed && !attrs::is_private(&key) {
          let mut map = AttributeMap::new();
          map.insert(key, value);
          for watch in &self.watches {
            watch.push_attributes(&map);
            watch.activate();
          }
        }
      }
      TermWork::RemoveAttribute { key } => {
        let removed = {
          let mut state = self.state.lock();
          state.attributes.remove(&key).is_some()
        };
        if removed && !attrs::is_private(&key) {
          let mut map = AttributeMap::new();
          map.insert(key, String::new());
          for watch in &self.watches {
            watch.push_attributes(&map);
            watch.activate();
          }
        }
      }
      TermWork::FileEvent(event) => self.push_file_event(&event),
    }
    true
  }

  fn push_file_event(&mut self, event: &FilemonEvent) {
    let frame = match event {
      FilemonEvent::Directory { dir, entries, overflow } => {
        let mut m = Marshaler::new(proto::CLIENT_DIRECTORY_UPDATE);
        m.add_id(&InstanceId::nil());
        m.add_id(&self.id);
        m.add_string(dir);
        m.add_number(u32::from(*overflow));
        for (name, attrs_map) in entries {
          m.add_string(name);
          attrs::marshal_map(&mut m, attrs_map);
        }
        m.finish()
      }
      FilemonEvent::File { name, attrs: attrs_map } => {
        let mut m = Marshaler::new(proto::CLIENT_FILE_UPDATE);
        m.add_id(&InstanceId::nil());
        m.add_id(&self.id);
        m.add_number(0);
        m.add_string(name);
        attrs::marshal_map(&mut m, attrs_map);
        m.finish()
      }
      FilemonEvent::Removed { name } => {
        let mut m = Marshaler::new(proto::CLIENT_FILE_UPDATE);
        m.add_id(&InstanceId::nil());
        m.add_id(&self.id);
        m.add_number(1);
        m.add_string(name);
        m.finish()
      }
    };

    for watch in &self.watches {
      watch.push_frame(frame.clone());
      watch.activate();
    }
  }

  fn handle_idle(&mut self) -> bool {
    let fd_probe = self.master.as_ref().and_then(|m| m.as_raw_fd());
    let changed = match fd_probe {
      Some(fd) => {
        // The master fd stays owned by portable-pty; borrow for the probe.
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        self.status.update(Some(&borrowed as &dyn std::os::fd::AsFd), self.pid)
      }
      None => self.status.update(None, self.pid),
    };
    if changed {
      let map = self.status.changed_map();
      self.push_status_attributes(map);
    }

    let initial = self.tunables.idle_initial_timeout_ms as i64;
    let last = self.tunables.idle_last_timeout_ms as i64;
    match self.timeout_ms {
      0 => self.timeout_ms = initial,
      t if t >= last => self.timeout_ms = -1,
      t if t == initial => {
        self.reset_ratelimit();
        self.timeout_ms = t * 2;
      }
      t if t > 0 => self.timeout_ms = t * 2,
      _ => {}
    }
    true
  }

  /// Closing: stop the scheduler, release the watches, and leave the loop.
  fn handle_close(&mut self, reason: u32) -> bool {
    debug!("term {}: closing (reason {reason})", self.id);
    self.output.stop();
    for watch in self.watches.drain(..) {
      watch.push_close(reason);
      watch.activate();
      watch.release_from_target();
    }
    if let Some(child) = &mut self.child {
      let _ = child.kill();
    }
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn public_attributes_hide_private_keys() {
    let mut attributes = AttributeMap::new();
    attributes.insert("session.title".to_string(), "t".to_string());
    attributes.insert("_scratch".to_string(), "x".to_string());
    let state = TermState {
      buffers: TermBuffers::new(4, 4),
      emulator: Box::new(VtEmulator::new(TermSize::new(80, 24))),
      attributes,
      owner: None,
    };
    let public = state.public_attributes();
    assert!(public.contains_key("session.title"));
    assert!(!public.contains_key("_scratch"));
  }

  #[test]
  fn attribute_u32_parses_with_default() {
    let mut attributes = AttributeMap::new();
    attributes.insert("profile.exitaction".to_string(), "2".to_string());
    let state = TermState {
      buffers: TermBuffers::new(4, 4),
      emulator: Box::new(VtEmulator::new(TermSize::new(80, 24))),
      attributes,
      owner: None,
    };
    assert_eq!(state.attribute_u32("profile.exitaction", 0), 2);
    assert_eq!(state.attribute_u32("profile.missing", 7), 7);
  }
}
