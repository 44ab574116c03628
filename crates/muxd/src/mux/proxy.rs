//! Handles to remote entities reached through a peer connection.
//!
//! A `ServerProxy` stands for a peer server; a `TermProxy` stands for a
//! terminal owned by a peer. Frames routed to either are submitted to the
//! owning connection's output scheduler; the connection is the hop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::id::InstanceId;
use crate::mux::output::OutputScheduler;
use crate::mux::watch::Watch;
use crate::proto::attrs::AttributeMap;

/// The connection a proxy forwards through.
#[derive(Clone)]
pub struct ConnLink {
  /// Id of the carrying connection; the hop identity for throttle signals.
  pub conn_id: InstanceId,
  pub output: Arc<OutputScheduler>,
}

pub struct ServerProxy {
  pub id: InstanceId,
  pub hops: u32,
  pub link: ConnLink,
  nterms: AtomicU32,
  attributes: Mutex<AttributeMap>,
  watches: Mutex<Vec<Arc<Watch>>>,
}

impl ServerProxy {
  #[must_use]
  pub fn new(id: InstanceId, hops: u32, link: ConnLink, attributes: AttributeMap) -> Arc<Self> {
    Arc::new(Self {
      id,
      hops,
      link,
      nterms: AtomicU32::new(0),
      attributes: Mutex::new(attributes),
      watches: Mutex::new(Vec::new()),
    })
  }

  pub fn add_watch(&self, watch: &Arc<Watch>) {
    self.watches.lock().push(Arc::clone(watch));
  }

  /// Replicates an attribute change to every watch and activates them.
  pub fn push_attributes(&self, changes: &AttributeMap) {
    let watches = self.watches.lock();
    for watch in watches.iter() {
      watch.push_attributes(changes);
      watch.activate();
    }
  }

  /// Tells every watch the proxy is gone and releases the target half.
  pub fn release_watches(&self, reason: u32) {
    let mut watches = self.watches.lock();
    for watch in watches.drain(..) {
      watch.push_close(reason);
      watch.activate();
      watch.release_from_target();
    }
  }

  pub fn add_term(&self) {
    self.nterms.fetch_add(1, Ordering::Relaxed);
  }

  pub fn remove_term(&self) {
    self.nterms.fetch_sub(1, Ordering::Relaxed);
  }

  #[must_use]
  pub fn term_count(&self) -> u32 {
    self.nterms.load(Ordering::Relaxed)
  }

  pub fn with_attributes<R>(&self, f: impl FnOnce(&mut AttributeMap) -> R) -> R {
    f(&mut self.attributes.lock())
  }
}

pub struct TermProxy {
  pub id: InstanceId,
  /// The peer server that announced this terminal.
  pub hop: InstanceId,
  pub link: ConnLink,
  attributes: Mutex<AttributeMap>,
  watches: Mutex<Vec<Arc<Watch>>>,
}

impl TermProxy {
  #[must_use]
  pub fn new(id: InstanceId, hop: InstanceId, link: ConnLink, attributes: AttributeMap) -> Arc<Self> {
    Arc::new(Self {
      id,
      hop,
      link,
      attributes: Mutex::new(attributes),
      watches: Mutex::new(Vec::new()),
    })
  }

  pub fn with_attributes<R>(&self, f: impl FnOnce(&mut AttributeMap) -> R) -> R {
    f(&mut self.attributes.lock())
  }

  pub fn add_watch(&self, watch: &Arc<Watch>) {
    self.watches.lock().push(Arc::clone(watch));
  }

  pub fn push_attributes(&self, changes: &AttributeMap) {
    let watches = self.watches.lock();
    for watch in watches.iter() {
      watch.push_attributes(changes);
      watch.activate();
    }
  }

  pub fn release_watches(&self, reason: u32) {
    let mut watches = self.watches.lock();
    for watch in watches.drain(..) {
      watch.push_close(reason);
      watch.activate();
      watch.release_from_target();
    }
  }
}
