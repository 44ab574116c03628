//! The listener: root registry and router.
//!
//! Single point of registration for clients, peer servers, proxies,
//! terminals, and tasks. Other threads mutate the registry under a short
//! lock; structural changes (thread starts, joins, watch creation) are
//! serialized through the listener's own work queue. The accept loop also
//! runs here: each accepted connection becomes a reader worker.

use std::collections::{HashMap, HashSet};
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::Tunables;
use crate::id::InstanceId;
use crate::mux::monitor::MonitorWork;
use crate::mux::output::OutputScheduler;
use crate::mux::proxy::{ServerProxy, TermProxy};
use crate::mux::reaper::Reaper;
use crate::mux::watch::{Watch, WatchTarget};
use crate::proto::attrs::{self, AttributeMap};
use crate::proto::wire::Marshaler;
use crate::proto::{self};
use crate::tasks::{TaskHandle, TaskWork};

/// Result of routing a frame to an endpoint's output scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardResult {
  Accepted,
  /// Accepted, but the scheduler is past its watermark; the id names the
  /// hop so the caller can emit a throttle-pause back toward the sender.
  Throttled(InstanceId),
  Unknown,
}

impl ForwardResult {
  #[must_use]
  pub fn accepted(&self) -> bool {
    !matches!(self, Self::Unknown)
  }
}

/// A client known to the registry.
pub struct ClientInfo {
  pub hops: u32,
  pub flags: u32,
  pub attributes: AttributeMap,
  /// Scheduler that reaches this client (a reader's writer, or a peer
  /// connection's scheduler for remote clients).
  pub writer: Arc<OutputScheduler>,
  /// Id of the connection carrying this client; the hop for throttles.
  pub via: InstanceId,
  pub environ: HashMap<String, String>,
  /// Saved announce frame, replayed to newly registered peers.
  pub announce: Vec<u8>,
}

/// Registration records delivered over the work queue.
pub struct TermRegistration {
  pub id: InstanceId,
  pub work: Sender<crate::mux::term::TermWork>,
  pub output: Arc<OutputScheduler>,
  pub state: Arc<Mutex<crate::mux::term::TermState>>,
  pub join: std::thread::JoinHandle<()>,
}

pub struct ConnRegistration {
  pub id: InstanceId,
  pub work: Sender<crate::mux::raw::ConnWork>,
  pub output: Arc<OutputScheduler>,
  pub join: std::thread::JoinHandle<()>,
}

pub struct ReaderRegistration {
  pub id: InstanceId,
  pub work: Sender<crate::mux::reader::ReaderWork>,
  pub join: std::thread::JoinHandle<()>,
}

/// Everything needed to transfer terminal ownership.
pub struct OwnershipChange {
  pub from: Option<InstanceId>,
  pub to: InstanceId,
  pub attributes: AttributeMap,
  pub environ: HashMap<String, String>,
}

/// A task ready to start, pending duplicate checks.
pub struct TaskLaunch {
  pub handle: TaskHandle,
  pub start: Box<dyn FnOnce() -> std::thread::JoinHandle<()> + Send>,
  /// Used to report a duplicate to the owner without starting the task.
  pub duplicate_report: Vec<u8>,
}

pub enum ListenerWork {
  AddTerm(TermRegistration),
  ConfirmTerm(InstanceId),
  RemoveTerm(InstanceId),
  AddConn(ConnRegistration),
  RemoveConn(InstanceId),
  AddReader(ReaderRegistration),
  ConfirmReader(InstanceId),
  RemoveReader(InstanceId),
  AddServer(Arc<ServerProxy>),
  RemoveServer(InstanceId, u32),
  AddProxy(Arc<TermProxy>),
  RemoveProxy(InstanceId, u32),
  WatchReleased(u64),
  ClearOwnership(InstanceId),
  ChangeOwnership(Box<OwnershipChange>),
  AddTask(Box<TaskLaunch>),
  RemoveTask(InstanceId),
  MonitorAttributes(AttributeMap),
  MonitorSet(String, String),
  MonitorRemove(String),
  Interrupt,
}

/// Link to a local terminal, for direct command handling by readers.
#[derive(Clone)]
pub struct TermLink {
  pub id: InstanceId,
  pub work: Sender<crate::mux::term::TermWork>,
  pub output: Arc<OutputScheduler>,
  pub state: Arc<Mutex<crate::mux::term::TermState>>,
}

struct Registry {
  attributes: AttributeMap,
  clients: HashMap<InstanceId, ClientInfo>,
  client_order: Vec<InstanceId>,
  owner: Option<InstanceId>,
  /// Peer server id -> link of the carrying connection.
  servers: HashMap<InstanceId, crate::mux::proxy::ConnLink>,
  /// Remote terminal id -> link of the carrying connection.
  proxies: HashMap<InstanceId, crate::mux::proxy::ConnLink>,
  /// Local terminals, for direct routing.
  terms: HashMap<InstanceId, TermLink>,
  tasks: HashMap<InstanceId, TaskHandle>,
  task_targets: HashSet<String>,
}

/// Thread-local bookkeeping owned by the listener loop.
#[derive(Default)]
struct LoopState {
  terms: HashMap<InstanceId, (TermRegistration, bool)>,
  conns: HashMap<InstanceId, ConnRegistration>,
  readers: HashMap<InstanceId, (ReaderRegistration, bool)>,
  server_map: HashMap<InstanceId, Arc<ServerProxy>>,
  proxy_map: HashMap<InstanceId, Arc<TermProxy>>,
  watches: HashMap<u64, Arc<Watch>>,
  task_joins: HashMap<InstanceId, std::thread::JoinHandle<()>>,
  interrupted: bool,
}

pub struct Listener {
  id: InstanceId,
  standalone: bool,
  pub tunables: Arc<Tunables>,
  pub reaper: Arc<Reaper>,
  registry: Mutex<Registry>,
  work_tx: Sender<ListenerWork>,
  work_rx: Receiver<ListenerWork>,
  monitor_tx: Mutex<Option<Sender<MonitorWork>>>,
}

impl Listener {
  #[must_use]
  pub fn new(
    id: InstanceId,
    standalone: bool,
    tunables: Arc<Tunables>,
    reaper: Arc<Reaper>,
  ) -> Arc<Self> {
    let (work_tx, work_rx) = unbounded();
    let mut attributes = AttributeMap::new();
    attributes.insert(attrs::ATTR_ID.to_string(), id.to_string());
    attributes.insert(attrs::ATTR_PID.to_string(), std::process::id().to_string());
    attributes
      .insert(attrs::ATTR_PRODUCT.to_string(), concat!("muxd ", env!("CARGO_PKG_VERSION")).to_string());

    Arc::new(Self {
      id,
      standalone,
      tunables,
      reaper,
      registry: Mutex::new(Registry {
        attributes,
        clients: HashMap::new(),
        client_order: Vec::new(),
        owner: None,
        servers: HashMap::new(),
        proxies: HashMap::new(),
        terms: HashMap::new(),
        tasks: HashMap::new(),
        task_targets: HashSet::new(),
      }),
      work_tx,
      work_rx,
      monitor_tx: Mutex::new(None),
    })
  }

  #[must_use]
  pub fn id(&self) -> InstanceId {
    self.id
  }

  #[must_use]
  pub fn work_sender(&self) -> Sender<ListenerWork> {
    self.work_tx.clone()
  }

  pub fn send_work(&self, item: ListenerWork) {
    let _ = self.work_tx.send(item);
  }

  pub fn set_monitor(&self, tx: Sender<MonitorWork>) {
    *self.monitor_tx.lock() = Some(tx);
  }

  pub fn monitor_input(&self, data: Vec<u8>) {
    if let Some(tx) = self.monitor_tx.lock().as_ref() {
      let _ = tx.send(MonitorWork::Input(data));
    }
  }

  pub fn monitor_restart(&self) {
    if let Some(tx) = self.monitor_tx.lock().as_ref() {
      let _ = tx.send(MonitorWork::Restart);
    }
  }

  /*
   * Registry: servers and proxies
   */

  /// Whether a peer id is free: not ours and not already registered.
  #[must_use]
  pub fn check_server(&self, id: &InstanceId) -> bool {
    if *id == self.id {
      return false;
    }
    let registry = self.registry.lock();
    !registry.servers.contains_key(id)
  }

  /// Registers a peer server. Replays every known client's announce frame
  /// to the new peer before it is published.
  pub fn register_server(&self, proxy: &Arc<ServerProxy>) -> bool {
    if proxy.id == self.id {
      return false;
    }
    let mut registry = self.registry.lock();
    if registry.servers.contains_key(&proxy.id) {
      debug!("listener: server {} already registered", proxy.id);
      return false;
    }
    registry.servers.insert(proxy.id, proxy.link.clone());

    let mut announced = 0usize;
    for info in registry.clients.values() {
      if !info.announce.is_empty() {
        let _ = proxy.link.output.submit_command(info.announce.clone());
        announced += 1;
      }
    }
    drop(registry);

    debug!("listener: server {} registered ({announced} clients announced)", proxy.id);
    self.send_work(ListenerWork::AddServer(Arc::clone(proxy)));
    true
  }

  pub fn unregister_server(&self, id: &InstanceId, reason: u32) {
    let mut registry = self.registry.lock();
    if registry.servers.remove(id).is_some() {
      drop(registry);
      debug!("listener: server {id} unregistered");
      self.send_work(ListenerWork::RemoveServer(*id, reason));
    }
  }

  pub fn register_proxy(&self, proxy: &Arc<TermProxy>) -> bool {
    let mut registry = self.registry.lock();
    if registry.proxies.contains_key(&proxy.id) {
      debug!("listener: proxy {} already registered", proxy.id);
      return false;
    }
    registry.proxies.insert(proxy.id, proxy.link.clone());
    drop(registry);
    self.send_work(ListenerWork::AddProxy(Arc::clone(proxy)));
    true
  }

  pub fn unregister_proxy(&self, id: &InstanceId, reason: u32) {
    let mut registry = self.registry.lock();
    if registry.proxies.remove(id).is_some() {
      drop(registry);
      self.send_work(ListenerWork::RemoveProxy(*id, reason));
    }
  }

  /*
   * Registry: terminals
   */

  pub fn register_term_link(&self, link: TermLink) {
    self.registry.lock().terms.insert(link.id, link);
  }

  pub fn unregister_term_link(&self, id: &InstanceId) {
    self.registry.lock().terms.remove(id);
  }

  #[must_use]
  pub fn term_link(&self, id: &InstanceId) -> Option<TermLink> {
    self.registry.lock().terms.get(id).cloned()
  }

  /*
   * Registry: clients
   */

  #[must_use]
  pub fn known_client(&self, id: &InstanceId) -> bool {
    self.registry.lock().clients.contains_key(id)
  }

  /// Registers a client. The ordered list keeps ascending hop counts; the
  /// insertion point is the first position with a larger stored hop count.
  pub fn register_client(&self, id: InstanceId, info: ClientInfo) -> bool {
    let mut registry = self.registry.lock();
    if registry.clients.contains_key(&id) {
      debug!("listener: client {id} already registered");
      return false;
    }

    let pos = registry
      .client_order
      .iter()
      .position(|other| registry.clients[other].hops > info.hops)
      .unwrap_or(registry.client_order.len());
    registry.client_order.insert(pos, id);

    let take_ownership = info.flags & proto::FLAG_TAKE_OWNERSHIP != 0;
    debug!("listener: client {id} registered ({} hops)", info.hops);

    let change = if take_ownership && registry.owner.is_none() {
      registry.owner = Some(id);
      let mut attributes = AttributeMap::new();
      attrs::project_owner_attributes(&id, &info.attributes, &mut attributes);
      Some(Box::new(OwnershipChange {
        from: None,
        to: id,
        attributes,
        environ: info.environ.clone(),
      }))
    } else {
      None
    };

    registry.clients.insert(id, info);
    drop(registry);

    if let Some(change) = change {
      self.send_work(ListenerWork::ChangeOwnership(change));
    }
    true
  }

  /// Removes a client, forwards its goodbye frame to every distinct peer,
  /// stops its tasks, and transfers or clears ownership.
  pub fn unregister_client(&self, id: &InstanceId, goodbye: Vec<u8>) {
    let mut registry = self.registry.lock();
    let Some(_info) = registry.clients.remove(id) else {
      return;
    };
    registry.client_order.retain(|other| other != id);

    let mut work = None;
    if registry.owner == Some(*id) {
      let next = registry
        .client_order
        .iter()
        .find(|other| {
          registry.clients[*other].flags & proto::FLAG_TAKE_OWNERSHIP != 0
        })
        .copied();
      registry.owner = next;
      work = Some(match next {
        Some(next_id) => {
          let info = &registry.clients[&next_id];
          let mut attributes = AttributeMap::new();
          attrs::project_owner_attributes(&next_id, &info.attributes, &mut attributes);
          ListenerWork::ChangeOwnership(Box::new(OwnershipChange {
            from: Some(*id),
            to: next_id,
            attributes,
            environ: info.environ.clone(),
          }))
        }
        None => ListenerWork::ClearOwnership(*id),
      });
    }

    // One copy per distinct peer scheduler.
    let mut sent: HashSet<*const OutputScheduler> = HashSet::new();
    for link in registry.servers.values() {
      if sent.insert(Arc::as_ptr(&link.output)) {
        let _ = link.output.submit_command(goodbye.clone());
      }
    }

    for task in registry.tasks.values() {
      if task.client_id == *id {
        task.stop(proto::STATUS_LOST_CONN);
      }
    }
    drop(registry);

    debug!("listener: client {id} unregistered");
    if let Some(work) = work {
      self.send_work(work);
    }
  }

  /// Owner attribute projection plus environ for a client, used when
  /// terminals are created on its behalf.
  #[must_use]
  pub fn owner_attributes(&self, id: &InstanceId) -> (AttributeMap, HashMap<String, String>) {
    let registry = self.registry.lock();
    let mut attributes = AttributeMap::new();
    match registry.clients.get(id) {
      Some(info) => {
        attrs::project_owner_attributes(id, &info.attributes, &mut attributes);
        (attributes, info.environ.clone())
      }
      None => {
        let text = id.to_string();
        attributes.insert(attrs::ATTR_OWNER_ID.to_string(), text.clone());
        attributes.insert(attrs::ATTR_SENDER_ID.to_string(), text);
        (attributes, HashMap::new())
      }
    }
  }

  /// Registered clients in hop order, for introspection.
  #[must_use]
  pub fn clients_snapshot(&self) -> Vec<(InstanceId, u32)> {
    let registry = self.registry.lock();
    registry
      .client_order
      .iter()
      .map(|id| (*id, registry.clients[id].hops))
      .collect()
  }

  /// Ids of the currently registered tasks.
  #[must_use]
  pub fn task_ids(&self) -> Vec<InstanceId> {
    self.registry.lock().tasks.keys().copied().collect()
  }

  /// NUL-delimited `key\0[value\0]` reply for a client attribute query.
  #[must_use]
  pub fn client_attribute(&self, id: &InstanceId, key: &str) -> Option<Vec<u8>> {
    let registry = self.registry.lock();
    let info = registry.clients.get(id)?;
    let mut reply = Vec::from(key.as_bytes());
    reply.push(0);
    if let Some(value) = info.attributes.get(key) {
      reply.extend_from_slice(value.as_bytes());
      reply.push(0);
    }
    Some(reply)
  }

  /*
   * Forwarding
   */

  #[must_use]
  pub fn forward_to_server(&self, id: &InstanceId, frame: Vec<u8>) -> ForwardResult {
    let registry = self.registry.lock();
    match registry.servers.get(id) {
      Some(link) => {
        let hop = link.conn_id;
        // Two locks held: registry, then the destination scheduler.
        if link.output.submit_command(frame) {
          ForwardResult::Accepted
        } else {
          ForwardResult::Throttled(hop)
        }
      }
      None => ForwardResult::Unknown,
    }
  }

  #[must_use]
  pub fn forward_to_term(&self, id: &InstanceId, frame: Vec<u8>) -> ForwardResult {
    let registry = self.registry.lock();
    match registry.proxies.get(id) {
      Some(link) => {
        let hop = link.conn_id;
        if link.output.submit_command(frame) {
          ForwardResult::Accepted
        } else {
          ForwardResult::Throttled(hop)
        }
      }
      None => ForwardResult::Unknown,
    }
  }

  #[must_use]
  pub fn forward_to_client(&self, id: &InstanceId, frame: Vec<u8>) -> ForwardResult {
    let registry = self.registry.lock();
    match registry.clients.get(id) {
      Some(info) => {
        let hop = info.via;
        if info.writer.submit_command(frame) {
          ForwardResult::Accepted
        } else {
          ForwardResult::Throttled(hop)
        }
      }
      None => ForwardResult::Unknown,
    }
  }

  /// Broadcasts to peers; each distinct scheduler receives exactly one copy.
  pub fn forward_to_servers(&self, frame: &[u8]) {
    let registry = self.registry.lock();
    let mut sent: HashSet<*const OutputScheduler> = HashSet::new();
    for link in registry.servers.values() {
      if sent.insert(Arc::as_ptr(&link.output)) {
        let _ = link.output.submit_command(frame.to_vec());
      }
    }
  }

  /// Broadcasts to clients with the same dedup guarantee.
  pub fn forward_to_clients(&self, frame: &[u8]) {
    let registry = self.registry.lock();
    let mut sent: HashSet<*const OutputScheduler> = HashSet::new();
    for info in registry.clients.values() {
      if sent.insert(Arc::as_ptr(&info.writer)) {
        let _ = info.writer.submit_command(frame.to_vec());
      }
    }
  }

  /*
   * Server attributes
   */

  #[must_use]
  pub fn get_attribute(&self, key: &str) -> Option<String> {
    self.registry.lock().attributes.get(key).cloned()
  }

  #[must_use]
  pub fn attributes_snapshot(&self) -> AttributeMap {
    self.registry.lock().attributes.clone()
  }

  /// Sets a server attribute, honoring the restriction policy for external
  /// writers, and pushes the change to clients and peers.
  pub fn set_attribute(&self, key: String, value: String, external: bool) {
    if external && crate::os::restricted_server_attribute(&key) {
      return;
    }
    {
      let mut registry = self.registry.lock();
      if registry.attributes.get(&key) == Some(&value) {
        return;
      }
      registry.attributes.insert(key.clone(), value.clone());
    }
    self.push_attribute(&key, Some(&value));
  }

  pub fn remove_attribute(&self, key: &str, external: bool) {
    if external && crate::os::restricted_server_attribute(key) {
      return;
    }
    {
      let mut registry = self.registry.lock();
      if registry.attributes.remove(key).is_none() {
        return;
      }
    }
    self.push_attribute(key, None);
  }

  /// Pushes one attribute change to every client (private keys stay home).
  fn push_attribute(&self, key: &str, value: Option<&str>) {
    if attrs::is_private(key) {
      return;
    }
    let clients: Vec<InstanceId> = self.registry.lock().clients.keys().copied().collect();
    for client in clients {
      let mut m = Marshaler::new(proto::CLIENT_ATTRIBUTE);
      m.add_id(&client);
      m.add_id(&self.id);
      m.add_string(key);
      if let Some(value) = value {
        m.add_string(value);
      }
      let _ = self.forward_to_client(&client, m.finish());
    }
  }

  /// Frames introducing this server and its terminals to a fresh peer.
  #[must_use]
  pub fn announce_frames(&self) -> Vec<Vec<u8>> {
    let registry = self.registry.lock();
    let mut frames = Vec::new();

    let mut m = Marshaler::new(proto::ANNOUNCE_SERVER);
    m.add_id(&self.id);
    m.add_number(1);
    m.add_number(registry.terms.len() as u32);
    attrs::marshal_map(&mut m, &registry.attributes);
    frames.push(m.finish());

    for link in registry.terms.values() {
      let attributes = link.state.lock().public_attributes();
      let mut m = Marshaler::new(proto::ANNOUNCE_TERM);
      m.add_id(&link.id);
      m.add_id(&self.id);
      attrs::marshal_map(&mut m, &attributes);
      frames.push(m.finish());
    }
    frames
  }

  /*
   * Tasks
   */

  pub fn input_task(&self, task_id: &InstanceId, data: Vec<u8>) {
    let registry = self.registry.lock();
    if let Some(task) = registry.tasks.get(task_id) {
      task.queue.send(TaskWork::Input(data));
    }
  }

  pub fn answer_task(&self, task_id: &InstanceId, answer: u32) {
    let registry = self.registry.lock();
    if let Some(task) = registry.tasks.get(task_id) {
      task.queue.send(TaskWork::Answer(answer));
    }
  }

  pub fn cancel_task(&self, task_id: &InstanceId) {
    let registry = self.registry.lock();
    if let Some(task) = registry.tasks.get(task_id) {
      task.stop(proto::STATUS_NORMAL);
    }
  }

  /// Pauses one task's output through the given hop.
  pub fn throttle_task(&self, task_id: &InstanceId, hop: InstanceId) {
    let registry = self.registry.lock();
    if let Some(task) = registry.tasks.get(task_id)
      && task.throttlable
    {
      task.pause(hop);
    }
  }

  /// Resumes every task paused through the given hop.
  pub fn resume_tasks(&self, hop: InstanceId) {
    let registry = self.registry.lock();
    for task in registry.tasks.values() {
      if task.throttlable {
        task.resume(hop);
      }
    }
  }

  /*
   * Listener thread
   */

  fn check_close(&self, state: &LoopState) -> bool {
    if state.interrupted {
      state.terms.is_empty()
        && state.conns.is_empty()
        && state.readers.is_empty()
        && state.task_joins.is_empty()
    } else {
      self.standalone && state.readers.is_empty()
    }
  }

  /// The main loop: accepts connections and serializes structural work.
  /// Returns when the close conditions hold.
  pub fn run(self: &Arc<Self>, socket: Option<UnixListener>) -> anyhow::Result<()> {
    if let Some(socket) = &socket {
      socket.set_nonblocking(true)?;
    }
    let mut state = LoopState::default();

    'outer: loop {
      match self.work_rx.recv_timeout(Duration::from_millis(50)) {
        Ok(item) => {
          if self.handle_work(&mut state, item) {
            break;
          }
          // Drain whatever else is queued before polling the socket.
          while let Ok(item) = self.work_rx.try_recv() {
            if self.handle_work(&mut state, item) {
              break 'outer;
            }
          }
        }
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
      }

      if let Some(socket) = &socket {
        self.try_accept(socket);
      }
    }

    info!("listener: exiting");
    Ok(())
  }

  fn try_accept(self: &Arc<Self>, socket: &UnixListener) {
    match socket.accept() {
      Ok((stream, _addr)) => {
        let environ = match crate::os::local_creds(&stream) {
          Ok(pid) => crate::os::process_environment(pid),
          Err(e) => {
            warn!("listener: {e:#}");
            HashMap::new()
          }
        };
        match crate::mux::reader::Reader::spawn(Arc::clone(self), stream, environ) {
          Ok(registration) => self.send_work(ListenerWork::AddReader(registration)),
          Err(e) => error!("listener: failed to start reader: {e:#}"),
        }
      }
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
      Err(e) => error!("listener: accept error: {e}"),
    }
  }

  /// Processes one work item. Returns true when the loop should exit.
  fn handle_work(self: &Arc<Self>, state: &mut LoopState, item: ListenerWork) -> bool {
    match item {
      ListenerWork::AddTerm(reg) => {
        debug!("listener: adding terminal {}", reg.id);
        let id = reg.id;
        self.register_term_link(TermLink {
          id,
          work: reg.work.clone(),
          output: Arc::clone(&reg.output),
          state: Arc::clone(&reg.state),
        });
        state.terms.insert(id, (reg, false));
        self.confirm_term(state, &id);
        self.announce_term(state, &id);
      }
      ListenerWork::ConfirmTerm(id) => self.confirm_term(state, &id),
      ListenerWork::RemoveTerm(id) => {
        debug!("listener: removing terminal {id}");
        self.unregister_term_link(&id);
        if let Some((reg, _)) = state.terms.remove(&id) {
          let _ = reg.join.join();
        }
        let mut m = Marshaler::new(proto::REMOVE_TERM);
        m.add_id(&id);
        m.add_number(proto::STATUS_NORMAL);
        self.forward_to_servers(&m.finish());
        let leaked = state
          .watches
          .values()
          .any(|watch| watch.target.id() == id && !watch.fully_released());
        if leaked {
          // Watches may only be released by their reader; the terminal's
          // shared state stays alive behind the remaining Arcs.
          error!("listener: a terminal stopped with watches still active! It has been leaked!");
        }
        return self.check_close(state);
      }
      ListenerWork::AddConn(reg) => {
        debug!("listener: adding connection {}", reg.id);
        state.conns.insert(reg.id, reg);
      }
      ListenerWork::RemoveConn(id) => {
        debug!("listener: removing connection {id}");
        if let Some(reg) = state.conns.remove(&id) {
          let _ = reg.join.join();
        }
        return self.check_close(state);
      }
      ListenerWork::AddReader(reg) => {
        debug!("listener: added a reader {}", reg.id);
        state.readers.insert(reg.id, (reg, false));
      }
      ListenerWork::ConfirmReader(id) => self.confirm_reader(state, &id),
      ListenerWork::RemoveReader(id) => {
        debug!("listener: removing reader {id}");
        if let Some((reg, _)) = state.readers.remove(&id) {
          let _ = reg.join.join();
        }
        return self.check_close(state);
      }
      ListenerWork::AddServer(proxy) => {
        debug!("listener: adding server {}", proxy.id);
        state.server_map.insert(proxy.id, Arc::clone(&proxy));
        let mut created = Vec::new();
        for (reg, confirmed) in state.readers.values() {
          if *confirmed {
            let watch = Watch::new(
              WatchTarget::Server { id: proxy.id },
              reg.work.clone(),
              self.work_tx.clone(),
            );
            proxy.add_watch(&watch);
            let _ = reg.work.send(crate::mux::reader::ReaderWork::AddWatch(watch.clone()));
            created.push(watch);
          }
        }
        for watch in created {
          state.watches.insert(watch.id, watch);
        }
      }
      ListenerWork::RemoveServer(id, reason) => {
        debug!("listener: removing server {id}");
        if let Some(proxy) = state.server_map.remove(&id) {
          proxy.release_watches(reason);
        }
      }
      ListenerWork::AddProxy(proxy) => {
        debug!("listener: adding proxy {}", proxy.id);
        if let Some(server) = state.server_map.get(&proxy.hop) {
          server.add_term();
        }
        state.proxy_map.insert(proxy.id, Arc::clone(&proxy));
        for (reg, confirmed) in state.readers.values() {
          if *confirmed {
            let watch =
              Watch::new(WatchTarget::Proxy { id: proxy.id }, reg.work.clone(), self.work_tx.clone());
            proxy.add_watch(&watch);
            let _ = reg.work.send(crate::mux::reader::ReaderWork::AddWatch(watch.clone()));
            state.watches.insert(watch.id, watch);
          }
        }
      }
      ListenerWork::RemoveProxy(id, reason) => {
        debug!("listener: removing proxy {id}");
        if let Some(proxy) = state.proxy_map.remove(&id) {
          if let Some(server) = state.server_map.get(&proxy.hop) {
            server.remove_term();
          }
          proxy.release_watches(reason);
        }
      }
      ListenerWork::WatchReleased(id) => {
        state.watches.remove(&id);
      }
      ListenerWork::ClearOwnership(id) => {
        for (reg, _) in state.terms.values() {
          let _ = reg.work.send(crate::mux::term::TermWork::ClearOwner(id));
        }
      }
      ListenerWork::ChangeOwnership(change) => {
        let change = Arc::new(*change);
        for (reg, _) in state.terms.values() {
          let _ = reg.work.send(crate::mux::term::TermWork::ChangeOwner(Arc::clone(&change)));
        }
      }
      ListenerWork::AddTask(launch) => {
        if state.interrupted {
          return false;
        }
        let ok = {
          let mut registry = self.registry.lock();
          let handle = &launch.handle;
          let mut ok = true;
          if handle.exclusive {
            if registry.task_targets.contains(&handle.target_name) {
              ok = false;
            } else {
              registry.task_targets.insert(handle.target_name.clone());
            }
          }
          if ok {
            if registry.tasks.contains_key(&handle.task_id) {
              ok = false;
            } else {
              registry.tasks.insert(handle.task_id, handle.clone());
            }
          }
          ok
        };
        if ok {
          let join = (launch.start)();
          state.task_joins.insert(launch.handle.task_id, join);
        } else {
          debug!("listener: duplicate task {}", launch.handle.task_id);
          let _ = self.forward_to_client(&launch.handle.client_id, launch.duplicate_report);
        }
      }
      ListenerWork::RemoveTask(id) => {
        {
          let mut registry = self.registry.lock();
          if let Some(task) = registry.tasks.remove(&id)
            && task.exclusive
          {
            registry.task_targets.remove(&task.target_name);
          }
        }
        if let Some(join) = state.task_joins.remove(&id) {
          let _ = join.join();
        }
        return self.check_close(state);
      }
      ListenerWork::MonitorAttributes(map) => {
        for (key, value) in map {
          if !crate::os::restricted_monitor_attribute(&key) {
            self.set_attribute(key, value, false);
          }
        }
      }
      ListenerWork::MonitorSet(key, value) => self.set_attribute(key, value, false),
      ListenerWork::MonitorRemove(key) => self.remove_attribute(&key, false),
      ListenerWork::Interrupt => {
        if !state.interrupted {
          debug!("listener: starting shutdown");
          state.interrupted = true;
          let registry = self.registry.lock();
          for task in registry.tasks.values() {
            task.stop(proto::STATUS_SERVER_SHUTDOWN);
          }
          drop(registry);
          for (reg, _) in state.readers.values() {
            let _ = reg
              .work
              .send(crate::mux::reader::ReaderWork::Close(proto::STATUS_SERVER_SHUTDOWN));
          }
          for (reg, _) in state.terms.values() {
            let _ = reg.work.send(crate::mux::term::TermWork::Close(proto::STATUS_SERVER_SHUTDOWN));
          }
          for reg in state.conns.values() {
            let _ = reg.work.send(crate::mux::raw::ConnWork::Close(proto::STATUS_SERVER_SHUTDOWN));
          }
        }
        return self.check_close(state);
      }
    }
    false
  }

  /// Tells the peers about a local terminal so they can build proxies.
  fn announce_term(self: &Arc<Self>, state: &LoopState, id: &InstanceId) {
    let Some((reg, _)) = state.terms.get(id) else {
      return;
    };
    let attributes = reg.state.lock().public_attributes();
    let mut m = Marshaler::new(proto::ANNOUNCE_TERM);
    m.add_id(id);
    m.add_id(&self.id);
    attrs::marshal_map(&mut m, &attributes);
    self.forward_to_servers(&m.finish());
  }

  /// Publishes a confirmed terminal to every confirmed reader.
  fn confirm_term(self: &Arc<Self>, state: &mut LoopState, id: &InstanceId) {
    let Some((reg, confirmed)) = state.terms.get_mut(id) else {
      return;
    };
    if *confirmed {
      return;
    }
    *confirmed = true;

    let term_state = Arc::clone(&reg.state);
    let work = reg.work.clone();
    let mut created = Vec::new();
    for (reader, reader_confirmed) in state.readers.values() {
      if !reader_confirmed {
        continue;
      }
      let watch = Watch::new(
        WatchTarget::Term { id: *id, state: Arc::clone(&term_state) },
        reader.work.clone(),
        self.work_tx.clone(),
      );
      let _ = work.send(crate::mux::term::TermWork::WatchAdded(watch.clone()));
      let _ = reader.work.send(crate::mux::reader::ReaderWork::AddWatch(watch.clone()));
      created.push(watch);
    }
    for watch in created {
      state.watches.insert(watch.id, watch);
    }
  }

  /// Gives a newly confirmed reader watches on everything visible.
  fn confirm_reader(self: &Arc<Self>, state: &mut LoopState, id: &InstanceId) {
    let Some((reader, confirmed)) = state.readers.get_mut(id) else {
      return;
    };
    if *confirmed {
      return;
    }
    *confirmed = true;
    let reader_work = reader.work.clone();

    let mut created = Vec::new();

    for (term_id, (reg, term_confirmed)) in &state.terms {
      if !term_confirmed {
        continue;
      }
      let watch = Watch::new(
        WatchTarget::Term { id: *term_id, state: Arc::clone(&reg.state) },
        reader_work.clone(),
        self.work_tx.clone(),
      );
      let _ = reg.work.send(crate::mux::term::TermWork::WatchAdded(watch.clone()));
      created.push(watch);
    }

    for proxy in state.server_map.values() {
      let watch = Watch::new(
        WatchTarget::Server { id: proxy.id },
        reader_work.clone(),
        self.work_tx.clone(),
      );
      proxy.add_watch(&watch);
      created.push(watch);
    }

    for proxy in state.proxy_map.values() {
      let watch =
        Watch::new(WatchTarget::Proxy { id: proxy.id }, reader_work.clone(), self.work_tx.clone());
      proxy.add_watch(&watch);
      created.push(watch);
    }

    for watch in created {
      let _ = reader_work.send(crate::mux::reader::ReaderWork::AddWatch(watch.clone()));
      state.watches.insert(watch.id, watch);
    }
    let _ = reader_work.send(crate::mux::reader::ReaderWork::PostConfirm);
  }

}
