//! Terminal worker lifecycle over real PTYs: child exit handling, the
//! restart/clear/stop exit actions, auto-close, signals, and the output
//! rate limiter.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use muxd::config::Tunables;
use muxd::emu::{EMU_RATELIMITED, Emulator as _, TermSize};
use muxd::id::InstanceId;
use muxd::mux::listener::{Listener, ListenerWork, TermRegistration};
use muxd::mux::reader::ReaderWork;
use muxd::mux::reaper::Reaper;
use muxd::mux::term::{TermInstance, TermState, TermWork};
use muxd::mux::watch::{Watch, WatchTarget};
use muxd::proto::{self, attrs};
use parking_lot::Mutex;

/// One reaper for the whole test binary: `waitpid(-1)` collects any child of
/// this process, so parallel tests must not each run their own wait loop.
fn shared_reaper() -> Arc<Reaper> {
  static REAPER: OnceLock<Arc<Reaper>> = OnceLock::new();
  Arc::clone(REAPER.get_or_init(|| {
    let reaper = Reaper::new(128);
    reaper.start();
    reaper
  }))
}

fn test_listener(tunables: Tunables) -> Arc<Listener> {
  Listener::new(InstanceId::generate(), false, Arc::new(tunables), shared_reaper())
}

/// Spawns a terminal running `script` under `sh -c` with the given profile
/// attributes merged in.
fn spawn_term(
  listener: &Arc<Listener>,
  script: &str,
  profile: &[(&str, &str)],
) -> TermRegistration {
  let mut requested = attrs::AttributeMap::new();
  requested.insert(
    attrs::ATTR_PROFILE_COMMAND.to_string(),
    format!("sh\u{1f}-c\u{1f}{script}"),
  );
  for (key, value) in profile {
    requested.insert((*key).to_string(), (*value).to_string());
  }
  TermInstance::spawn(
    Arc::clone(listener),
    InstanceId::generate(),
    None,
    TermSize::new(80, 24),
    attrs::AttributeMap::new(),
    HashMap::new(),
    requested,
  )
}

fn wait_for(mut predicate: impl FnMut() -> bool, secs: u64) -> bool {
  let deadline = Instant::now() + Duration::from_secs(secs);
  while Instant::now() < deadline {
    if predicate() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(20));
  }
  false
}

fn buffer_contains(state: &Mutex<TermState>, needle: &str) -> bool {
  let state = state.lock();
  let sb = state.buffers.get(0);
  (sb.origin()..sb.end()).any(|i| sb.row(i).is_some_and(|row| row.text.contains(needle)))
}

fn attribute(state: &Mutex<TermState>, key: &str) -> Option<String> {
  state.lock().attributes.get(key).cloned()
}

/// Waits until the primary buffer stops changing (child output quiesced).
fn wait_quiet(state: &Mutex<TermState>, secs: u64) -> bool {
  wait_for(
    || {
      let before = state.lock().buffers.get(0).region_state();
      std::thread::sleep(Duration::from_millis(300));
      state.lock().buffers.get(0).region_state() == before
    },
    secs,
  )
}

fn close_and_join(reg: TermRegistration) {
  let _ = reg.work.send(TermWork::Close(proto::STATUS_NORMAL));
  assert!(wait_for(|| reg.join.is_finished(), 10), "terminal thread did not exit");
  reg.join.join().unwrap();
}

#[test]
fn child_exit_reports_outcome_and_halts() {
  let listener = test_listener(Tunables::default());
  let reg = spawn_term(&listener, "echo hello-from-child", &[]);

  // Attach a watch; the worker pushes the full picture and activates it.
  let (reader_tx, reader_rx) = unbounded::<ReaderWork>();
  let (listener_tx, listener_rx) = unbounded::<ListenerWork>();
  let watch = Watch::new(
    WatchTarget::Term { id: reg.id, state: Arc::clone(&reg.state) },
    reader_tx,
    listener_tx,
  );
  reg.work.send(TermWork::WatchAdded(Arc::clone(&watch))).unwrap();

  assert!(
    wait_for(|| reader_rx.try_iter().any(|w| matches!(w, ReaderWork::WatchActivated(_))), 5),
    "watch never activated"
  );
  let initial = watch.take_state();
  assert!(initial.attributes.contains_key(attrs::ATTR_SESSION_ID));

  // The child's output lands in the scrollback.
  assert!(wait_for(|| buffer_contains(&reg.state, "hello-from-child"), 10));

  // Both exit events (read EOF and the reaped status) produce the halt
  // banner and the outcome attributes.
  assert!(wait_for(|| buffer_contains(&reg.state, "Session has finished"), 10));
  assert_eq!(attribute(&reg.state, attrs::ATTR_PROC_OUTCOME).as_deref(), Some("exited"));
  assert!(
    attribute(&reg.state, attrs::ATTR_PROC_OUTCOME_STR)
      .is_some_and(|s| s.contains("exited with status 0"))
  );

  // Closing releases the watch from the target side; releasing our half
  // retires it through the listener.
  let _ = reg.work.send(TermWork::Close(proto::STATUS_NORMAL));
  assert!(wait_for(|| watch.with_state(|s| s.closed.is_some()), 5));
  assert_eq!(watch.with_state(|s| s.closed), Some(proto::STATUS_NORMAL));
  watch.release_from_reader();
  assert!(matches!(
    listener_rx.recv_timeout(Duration::from_secs(5)),
    Ok(ListenerWork::WatchReleased(id)) if id == watch.id
  ));

  assert!(wait_for(|| reg.join.is_finished(), 10));
  reg.join.join().unwrap();
}

#[test]
fn restart_action_relaunches_the_child() {
  let listener = test_listener(Tunables::default());
  let reg = spawn_term(
    &listener,
    "sleep 0.2",
    &[(attrs::ATTR_PROFILE_EXITACTION, "1")],
  );

  // After the first exit the halt path prints the restart marker and forks
  // a fresh child instead of stopping.
  assert!(
    wait_for(|| buffer_contains(&reg.state, "Restarting process"), 15),
    "restart banner never appeared"
  );
  assert!(
    attribute(&reg.state, attrs::ATTR_PROC_OUTCOME_STR)
      .is_some_and(|s| s.contains("exited with status 0"))
  );
  assert!(!reg.join.is_finished(), "restart action must keep the worker alive");

  close_and_join(reg);
}

#[test]
fn clear_action_discards_scrollback_on_restart() {
  let dir = tempfile::tempdir().unwrap();
  let marker = dir.path().join("ran-once");
  let listener = test_listener(Tunables::default());

  // The child prints its marker only on the first run, so after a
  // clear-restart the text can only survive if the scrollback was kept.
  let reg = spawn_term(
    &listener,
    "test -f \"$ONCE\" || { echo FIRST_RUN_ONLY; touch \"$ONCE\"; }; sleep 0.3",
    &[
      (attrs::ATTR_PROFILE_EXITACTION, "2"),
      (
        attrs::ATTR_PROFILE_ENVIRON,
        &format!("ONCE={}", marker.display()),
      ),
    ],
  );

  assert!(wait_for(|| buffer_contains(&reg.state, "FIRST_RUN_ONLY"), 10));
  assert!(
    wait_for(
      || {
        buffer_contains(&reg.state, "Restarting process")
          && !buffer_contains(&reg.state, "FIRST_RUN_ONLY")
      },
      15,
    ),
    "clear action left the old scrollback in place"
  );

  close_and_join(reg);
}

#[test]
fn autoclose_closes_the_terminal_by_itself() {
  let listener = test_listener(Tunables::default());
  let reg = spawn_term(
    &listener,
    "true",
    &[
      (attrs::ATTR_PROFILE_EXITACTION, "0"),
      (attrs::ATTR_PROFILE_AUTOCLOSE, "1"),
      ("profile.autoclosetime", "0"),
    ],
  );

  // Stop action plus an always-autoclose profile: the worker posts Close to
  // itself once both exit events land.
  assert!(
    wait_for(|| reg.join.is_finished(), 15),
    "auto-close never ended the worker"
  );
  reg.join.join().unwrap();
}

#[test]
fn signal_kills_the_foreground_process() {
  let listener = test_listener(Tunables::default());
  let reg = spawn_term(&listener, "sleep 30", &[]);

  // Give the shell a moment to exec, then deliver SIGTERM.
  std::thread::sleep(Duration::from_millis(300));
  reg.work.send(TermWork::Signal(15)).unwrap();

  assert!(
    wait_for(
      || {
        attribute(&reg.state, attrs::ATTR_PROC_OUTCOME_STR)
          .is_some_and(|s| s.contains("killed by signal 15"))
      },
      10,
    ),
    "signaled outcome never reported"
  );
  assert_eq!(attribute(&reg.state, attrs::ATTR_PROC_OUTCOME).as_deref(), Some("signaled"));

  close_and_join(reg);
}

#[test]
fn rate_limiter_limits_then_resets_on_input() {
  // A short threshold and a huge interval so the limited state is easy to
  // enter and sticky once entered; idle probes pushed out of the way.
  let tunables = Tunables {
    ratelimit_threshold_ms: 50,
    ratelimit_interval_ms: 60_000,
    idle_initial_timeout_ms: 60_000,
    idle_last_timeout_ms: 120_000,
    ..Tunables::default()
  };
  let listener = test_listener(tunables);

  // Spam for well past the threshold, then go quiet.
  let reg = spawn_term(
    &listener,
    "i=0; while [ $i -lt 20000 ]; do echo spamspamspamspamspam; i=$((i+1)); done; sleep 30",
    &[],
  );

  // Idle -> Active -> Limited: continuous output sets the emulator flag.
  assert!(
    wait_for(|| reg.state.lock().emulator.flags() & EMU_RATELIMITED != 0, 20),
    "continuous output never entered the limited state"
  );

  // Once the burst is over, explicit input from the owner resets the
  // limiter to Idle and clears the flag.
  assert!(wait_quiet(&reg.state, 20), "spam never quiesced");
  reg.work.send(TermWork::InputSent).unwrap();
  assert!(
    wait_for(|| reg.state.lock().emulator.flags() & EMU_RATELIMITED == 0, 10),
    "input did not reset the rate limiter"
  );

  close_and_join(reg);
}
