//! End-to-end backpressure: a command task must stop reading once its ack
//! window fills, and resume on the ack.

use std::sync::Arc;
use std::time::Duration;

use muxd::config::Tunables;
use muxd::id::InstanceId;
use muxd::mux::listener::{ClientInfo, Listener};
use muxd::mux::output::OutputScheduler;
use muxd::mux::reaper::Reaper;
use muxd::proto::wire::Marshaler;
use muxd::proto::{self, TaskStatus, attrs};
use muxd::tasks::TaskWork;

fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
  for _ in 0..400 {
    if predicate() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(10));
  }
  false
}

#[test]
fn run_command_honors_the_ack_window() {
  let tunables = Arc::new(Tunables::default());
  let reaper = Reaper::new(128);
  reaper.start();
  let listener =
    Listener::new(InstanceId::generate(), false, Arc::clone(&tunables), Arc::clone(&reaper));

  // A client whose writer just accumulates frames for inspection.
  let client_id = InstanceId::generate();
  let writer = OutputScheduler::new(64 << 20);
  let info = ClientInfo {
    hops: 0,
    flags: 0,
    attributes: Default::default(),
    writer: Arc::clone(&writer),
    via: InstanceId::generate(),
    environ: Default::default(),
    announce: Vec::new(),
  };
  assert!(listener.register_client(client_id, info));

  // chunk 4096, window 1, child emits 8 KiB then exits.
  let task_id = InstanceId::generate();
  let mut m = Marshaler::new(0);
  m.add_number(4096);
  m.add_number(1);
  let mut params = attrs::AttributeMap::new();
  params.insert(
    attrs::ATTR_COMMAND_COMMAND.to_string(),
    "sh\u{1f}-c\u{1f}head -c 8192 /dev/zero".to_string(),
  );
  attrs::marshal_map(&mut m, &params);
  let body = m.finish()[proto::FRAME_HEADER_SIZE..].to_vec();
  let mut unm = muxd::proto::wire::Unmarshaler::new(&body);

  let launch = muxd::tasks::run::launch(&listener, client_id, task_id, &mut unm).unwrap();
  let handle = launch.handle.clone();
  let join = (launch.start)();

  // The task sends Starting plus exactly one 4096-byte chunk, then stalls.
  assert!(wait_until(|| writer.buffered_amount() >= 4096));
  std::thread::sleep(Duration::from_millis(300));
  let before_ack = writer.buffered_amount();
  assert!(before_ack < 2 * 4096, "window of one chunk caps unacked output at 4 KiB");

  // Ack the first chunk; the rest flows and the task finishes.
  let mut ack = Vec::new();
  ack.extend_from_slice(&(TaskStatus::Acking as u32).to_le_bytes());
  ack.extend_from_slice(&4096u64.to_le_bytes());
  handle.queue.send(TaskWork::Input(ack));

  assert!(wait_until(|| writer.buffered_amount() >= before_ack + 4096));
  join.join().unwrap();
  reaper.stop();
}
