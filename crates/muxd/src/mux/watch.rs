//! Watches: subscriptions bridging one watched entity and one reader.
//!
//! A watch is jointly held by its target (terminal, raw connection, or
//! proxy) and its reader. Workers replicate pending state into the watch
//! under the watch lock, then activate it; the reader drains the state and
//! builds client frames on its own thread. Neither holder destroys the watch
//! directly: each releases its half, and the listener retires the watch once
//! both halves are released.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::buffer::RegionId;
use crate::emu::EmulatorReport;
use crate::id::InstanceId;
use crate::proto::attrs::AttributeMap;

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// What a watch is attached to.
#[derive(Clone)]
pub enum WatchTarget {
  /// A local terminal; carries its shared state for row pulls.
  Term { id: InstanceId, state: Arc<Mutex<crate::mux::term::TermState>> },
  /// A remote server reachable through a peer.
  Server { id: InstanceId },
  /// A remote terminal reachable through a peer.
  Proxy { id: InstanceId },
}

impl WatchTarget {
  #[must_use]
  pub fn id(&self) -> InstanceId {
    match self {
      Self::Term { id, .. } | Self::Server { id } | Self::Proxy { id } => *id,
    }
  }
}

/// Replicated pending changes, drained by the reader.
#[derive(Default)]
pub struct WatchState {
  active: bool,
  pub closed: Option<u32>,
  pub changed_rows: BTreeSet<(u8, u64)>,
  pub changed_regions: BTreeSet<(u8, RegionId)>,
  pub attributes: AttributeMap,
  /// Pre-built frames (file monitor updates, task questions).
  pub frames: Vec<Vec<u8>>,
  pub bell_count: u32,
  pub buffer_switched: bool,
  pub size_changed: bool,
  pub cursor_changed: bool,
  pub flags_changed: bool,
  pub ownership: Option<InstanceId>,
}

impl WatchState {
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.closed.is_none()
      && self.changed_rows.is_empty()
      && self.changed_regions.is_empty()
      && self.attributes.is_empty()
      && self.frames.is_empty()
      && self.bell_count == 0
      && !self.buffer_switched
      && !self.size_changed
      && !self.cursor_changed
      && !self.flags_changed
      && self.ownership.is_none()
  }
}

struct ReleaseState {
  by_target: bool,
  by_reader: bool,
}

pub struct Watch {
  pub id: u64,
  pub target: WatchTarget,
  /// The reader's work queue, used for activation.
  activate_tx: Sender<crate::mux::reader::ReaderWork>,
  /// The listener's work queue, used for final retirement.
  listener_tx: Sender<crate::mux::listener::ListenerWork>,
  state: Mutex<WatchState>,
  release: Mutex<ReleaseState>,
}

impl Watch {
  #[must_use]
  pub fn new(
    target: WatchTarget,
    activate_tx: Sender<crate::mux::reader::ReaderWork>,
    listener_tx: Sender<crate::mux::listener::ListenerWork>,
  ) -> Arc<Self> {
    Arc::new(Self {
      id: NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed),
      target,
      activate_tx,
      listener_tx,
      state: Mutex::new(WatchState::default()),
      release: Mutex::new(ReleaseState { by_target: false, by_reader: false }),
    })
  }

  /// Runs `f` with the watch state locked. Callers replicate changes here.
  pub fn with_state<R>(&self, f: impl FnOnce(&mut WatchState) -> R) -> R {
    f(&mut self.state.lock())
  }

  /// Merges an emulator report for one buffer into the pending state.
  pub fn push_report(&self, bufid: u8, report: &EmulatorReport) {
    let mut state = self.state.lock();
    for &row in &report.changed_rows {
      state.changed_rows.insert((bufid, row));
    }
    for (key, value) in &report.changed_attributes {
      state.attributes.insert(key.clone(), value.clone());
    }
    state.bell_count += report.bell_count;
    state.buffer_switched |= report.buffer_switched;
    state.size_changed |= report.size_changed;
    state.cursor_changed |= report.cursor_changed;
    state.flags_changed |= report.flags_changed;
  }

  pub fn push_attributes(&self, changes: &AttributeMap) {
    let mut state = self.state.lock();
    for (key, value) in changes {
      state.attributes.insert(key.clone(), value.clone());
    }
  }

  pub fn push_frame(&self, frame: Vec<u8>) {
    self.state.lock().frames.push(frame);
  }

  pub fn push_region(&self, bufid: u8, region: RegionId) {
    self.state.lock().changed_regions.insert((bufid, region));
  }

  pub fn push_ownership(&self, owner: InstanceId) {
    self.state.lock().ownership = Some(owner);
  }

  pub fn push_close(&self, reason: u32) {
    self.state.lock().closed = Some(reason);
  }

  /// Wakes the reader if the watch has not been activated since its last
  /// drain. Call after replication, outside no other locks than the watch's.
  pub fn activate(self: &Arc<Self>) {
    let mut state = self.state.lock();
    if !state.active {
      state.active = true;
      drop(state);
      let _ = self
        .activate_tx
        .send(crate::mux::reader::ReaderWork::WatchActivated(self.id));
    }
  }

  /// Drains the pending state for frame building; re-arms activation.
  #[must_use]
  pub fn take_state(&self) -> WatchState {
    let mut state = self.state.lock();
    state.active = false;
    std::mem::take(&mut *state)
  }

  /// Releases the target's half. The listener retires the watch when both
  /// halves are gone.
  pub fn release_from_target(self: &Arc<Self>) {
    let done = {
      let mut release = self.release.lock();
      release.by_target = true;
      release.by_reader
    };
    if done {
      self.retire();
    }
  }

  /// Releases the reader's half.
  pub fn release_from_reader(self: &Arc<Self>) {
    let done = {
      let mut release = self.release.lock();
      release.by_reader = true;
      release.by_target
    };
    if done {
      self.retire();
    }
  }

  #[must_use]
  pub fn fully_released(&self) -> bool {
    let release = self.release.lock();
    release.by_target && release.by_reader
  }

  fn retire(self: &Arc<Self>) {
    let _ = self
      .listener_tx
      .send(crate::mux::listener::ListenerWork::WatchReleased(self.id));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crossbeam_channel::unbounded;

  fn test_watch() -> (
    Arc<Watch>,
    crossbeam_channel::Receiver<crate::mux::reader::ReaderWork>,
    crossbeam_channel::Receiver<crate::mux::listener::ListenerWork>,
  ) {
    let (reader_tx, reader_rx) = unbounded();
    let (listener_tx, listener_rx) = unbounded();
    let watch = Watch::new(
      WatchTarget::Server { id: InstanceId::generate() },
      reader_tx,
      listener_tx,
    );
    (watch, reader_rx, listener_rx)
  }

  #[test]
  fn activation_fires_once_until_drained() {
    let (watch, reader_rx, _listener_rx) = test_watch();

    watch.push_frame(vec![1]);
    watch.activate();
    watch.push_frame(vec![2]);
    watch.activate();
    assert_eq!(reader_rx.try_iter().count(), 1);

    let state = watch.take_state();
    assert_eq!(state.frames.len(), 2);

    watch.push_frame(vec![3]);
    watch.activate();
    assert_eq!(reader_rx.try_iter().count(), 1);
  }

  #[test]
  fn retirement_requires_both_holders() {
    let (watch, _reader_rx, listener_rx) = test_watch();

    watch.release_from_target();
    assert!(listener_rx.try_recv().is_err());
    assert!(!watch.fully_released());

    watch.release_from_reader();
    assert!(matches!(
      listener_rx.try_recv(),
      Ok(crate::mux::listener::ListenerWork::WatchReleased(id)) if id == watch.id
    ));
    assert!(watch.fully_released());
  }

  #[test]
  fn report_merge_accumulates() {
    let (watch, _reader_rx, _listener_rx) = test_watch();
    let mut report = EmulatorReport::default();
    report.changed_rows = vec![3, 4];
    report.bell_count = 1;

    watch.push_report(0, &report);
    watch.push_report(0, &report);

    let state = watch.take_state();
    assert_eq!(state.changed_rows.len(), 2);
    assert_eq!(state.bell_count, 2);
  }
}
