//! Registry behavior: ordering, ownership transfer, broadcast dedup, and
//! duplicate task rejection.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use muxd::config::Tunables;
use muxd::emu::vt::VtEmulator;
use muxd::emu::{TermBuffers, TermSize};
use muxd::id::InstanceId;
use muxd::mux::listener::{ClientInfo, Listener, ListenerWork, TermRegistration};
use muxd::mux::output::OutputScheduler;
use muxd::mux::proxy::{ConnLink, ServerProxy};
use muxd::mux::reaper::Reaper;
use muxd::mux::term::{TermState, TermWork};
use muxd::proto;
use parking_lot::Mutex;

fn test_listener() -> Arc<Listener> {
  Listener::new(
    InstanceId::generate(),
    false,
    Arc::new(Tunables::default()),
    Reaper::new(128),
  )
}

fn client(hops: u32, flags: u32) -> (InstanceId, ClientInfo, Arc<OutputScheduler>) {
  let writer = OutputScheduler::new(1 << 20);
  let id = InstanceId::generate();
  let info = ClientInfo {
    hops,
    flags,
    attributes: Default::default(),
    writer: Arc::clone(&writer),
    via: InstanceId::generate(),
    environ: Default::default(),
    announce: Vec::new(),
  };
  (id, info, writer)
}

#[test]
fn client_order_respects_hop_counts() {
  let listener = test_listener();

  let (far, far_info, _w1) = client(5, 0);
  let (near, near_info, _w2) = client(0, 0);
  let (mid, mid_info, _w3) = client(2, 0);

  assert!(listener.register_client(far, far_info));
  assert!(listener.register_client(near, near_info));
  assert!(listener.register_client(mid, mid_info));

  let order = listener.clients_snapshot();
  let hops: Vec<u32> = order.iter().map(|(_, h)| *h).collect();
  assert_eq!(hops, vec![0, 2, 5]);

  // Each id appears exactly once.
  let ids: Vec<InstanceId> = order.iter().map(|(id, _)| *id).collect();
  assert!(ids.contains(&far) && ids.contains(&near) && ids.contains(&mid));
  assert_eq!(ids.len(), 3);

  // Duplicate registration is rejected.
  let (_, dup_info, _w4) = client(1, 0);
  assert!(!listener.register_client(near, dup_info));
}

#[test]
fn ownership_transfers_to_next_claimant() {
  let listener = test_listener();
  let run_listener = Arc::clone(&listener);
  let join = std::thread::spawn(move || run_listener.run(None));

  // A fake terminal whose work queue we observe directly.
  let term_id = InstanceId::generate();
  let (term_tx, term_rx) = unbounded();
  let state = Arc::new(Mutex::new(TermState {
    buffers: TermBuffers::new(6, 6),
    emulator: Box::new(VtEmulator::new(TermSize::new(80, 24))),
    attributes: Default::default(),
    owner: None,
  }));
  listener.send_work(ListenerWork::AddTerm(TermRegistration {
    id: term_id,
    work: term_tx,
    output: OutputScheduler::new(1 << 20),
    state,
    join: std::thread::spawn(|| {}),
  }));

  let (a, a_info, _wa) = client(0, proto::FLAG_TAKE_OWNERSHIP);
  let (b, b_info, _wb) = client(1, proto::FLAG_TAKE_OWNERSHIP);
  assert!(listener.register_client(a, a_info));
  assert!(listener.register_client(b, b_info));

  // A registered first with no previous owner: exactly one change to A.
  let change = term_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  match change {
    TermWork::ChangeOwner(change) => {
      assert_eq!(change.from, None);
      assert_eq!(change.to, a);
    }
    _ => panic!("expected an ownership change"),
  }

  // A departs; B inherits in one transition.
  let mut goodbye = muxd::proto::wire::Marshaler::new(proto::REMOVE_CLIENT);
  goodbye.add_id(&a);
  listener.unregister_client(&a, goodbye.finish());

  let change = term_rx.recv_timeout(Duration::from_secs(5)).unwrap();
  match change {
    TermWork::ChangeOwner(change) => {
      assert_eq!(change.from, Some(a));
      assert_eq!(change.to, b);
    }
    _ => panic!("expected an ownership change"),
  }

  let order = listener.clients_snapshot();
  assert_eq!(order.len(), 1);
  assert_eq!(order[0].0, b);

  // No further ownership traffic.
  assert!(term_rx.recv_timeout(Duration::from_millis(200)).is_err());

  // Wind down: emulate the terminal worker's close handling.
  listener.send_work(ListenerWork::Interrupt);
  loop {
    match term_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
      TermWork::Close(_) => {
        listener.send_work(ListenerWork::RemoveTerm(term_id));
        break;
      }
      _ => continue,
    }
  }
  join.join().unwrap().unwrap();
}

#[test]
fn ownership_clears_when_no_claimant_remains() {
  let listener = test_listener();
  let run_listener = Arc::clone(&listener);
  let join = std::thread::spawn(move || run_listener.run(None));

  let term_id = InstanceId::generate();
  let (term_tx, term_rx) = unbounded();
  let state = Arc::new(Mutex::new(TermState {
    buffers: TermBuffers::new(6, 6),
    emulator: Box::new(VtEmulator::new(TermSize::new(80, 24))),
    attributes: Default::default(),
    owner: None,
  }));
  listener.send_work(ListenerWork::AddTerm(TermRegistration {
    id: term_id,
    work: term_tx,
    output: OutputScheduler::new(1 << 20),
    state,
    join: std::thread::spawn(|| {}),
  }));

  let (a, a_info, _wa) = client(0, proto::FLAG_TAKE_OWNERSHIP);
  let (plain, plain_info, _wp) = client(0, 0);
  assert!(listener.register_client(a, a_info));
  assert!(listener.register_client(plain, plain_info));

  assert!(matches!(
    term_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    TermWork::ChangeOwner(_)
  ));

  listener.unregister_client(&a, Vec::new());
  assert!(matches!(
    term_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    TermWork::ClearOwner(id) if id == a
  ));

  listener.send_work(ListenerWork::Interrupt);
  loop {
    match term_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
      TermWork::Close(_) => {
        listener.send_work(ListenerWork::RemoveTerm(term_id));
        break;
      }
      _ => continue,
    }
  }
  join.join().unwrap().unwrap();
}

#[test]
fn peer_broadcast_sends_one_copy_per_scheduler() {
  let listener = test_listener();

  // Two peers that share one output scheduler (shared-writer simulation).
  let output = OutputScheduler::new(1 << 20);
  let conn_id = InstanceId::generate();
  let link = ConnLink { conn_id, output: Arc::clone(&output) };

  let p1 = ServerProxy::new(InstanceId::generate(), 1, link.clone(), Default::default());
  let p2 = ServerProxy::new(InstanceId::generate(), 1, link, Default::default());
  assert!(listener.register_server(&p1));
  assert!(listener.register_server(&p2));

  let frame = vec![0u8; 64];
  listener.forward_to_servers(&frame);
  assert_eq!(output.buffered_amount(), 64, "exactly one copy reached the shared scheduler");
}

#[test]
fn duplicate_exclusive_task_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let target = dir.path().to_str().unwrap().to_string();

  let listener = test_listener();
  let run_listener = Arc::clone(&listener);
  let join = std::thread::spawn(move || run_listener.run(None));

  let (client_id, info, writer) = client(0, 0);
  assert!(listener.register_client(client_id, info));

  let build = |task_id: InstanceId| {
    let mut m = muxd::proto::wire::Marshaler::new(0);
    m.add_string(&target);
    let body = m.finish()[muxd::proto::FRAME_HEADER_SIZE..].to_vec();
    let mut unm = muxd::proto::wire::Unmarshaler::new(&body);
    muxd::tasks::mount::launch(&listener, client_id, task_id, &mut unm, false).unwrap()
  };

  let first = InstanceId::generate();
  let second = InstanceId::generate();
  listener.send_work(ListenerWork::AddTask(Box::new(build(first))));
  listener.send_work(ListenerWork::AddTask(Box::new(build(second))));

  // Wait for the first to land, then give the second time to be processed.
  for _ in 0..100 {
    if listener.task_ids().contains(&first) {
      break;
    }
    std::thread::sleep(Duration::from_millis(20));
  }
  std::thread::sleep(Duration::from_millis(300));
  assert_eq!(listener.task_ids(), vec![first], "second task never enters the map");
  assert!(writer.buffered_amount() > 0, "client was told about the duplicate");

  listener.send_work(ListenerWork::Interrupt);
  join.join().unwrap().unwrap();
}
