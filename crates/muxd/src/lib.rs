//! muxd: a multiplexing terminal server.
//!
//! The server owns pseudo-terminal child processes, emulates terminal
//! behavior over their byte streams, and exposes the resulting sessions to
//! remote clients through a length-prefixed binary protocol. Multiple
//! servers peer with each other so frames about any terminal or client are
//! forwarded toward the server that owns it.

pub mod buffer;
pub mod config;
pub mod emu;
pub mod id;
pub mod mux;
pub mod os;
pub mod proto;
pub mod tasks;

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use crate::mux::listener::{Listener, ListenerWork};
use crate::mux::monitor::{Monitor, MonitorScripts, MonitorWork};
use crate::mux::reaper::Reaper;

/// How the server was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Flavor {
  /// Serve one client over inherited descriptor 0; exit when it leaves.
  Standalone,
  /// Socket-activated: the listening socket is inherited as descriptor 3.
  Activated,
  /// Bind the runtime-directory socket and keep running.
  Persistent,
}

/// muxd - multiplexing terminal server.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  /// Launch flavor.
  #[arg(long, value_enum, default_value_t = Flavor::Persistent)]
  pub flavor: Flavor,

  /// Listening socket path (persistent flavor only).
  #[arg(long)]
  pub socket: Option<PathBuf>,

  /// Peer server sockets to dial at startup.
  #[arg(long)]
  pub peer: Vec<PathBuf>,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signal: i32) {
  if signal == nix::libc::SIGHUP {
    RELOAD.store(true, Ordering::Relaxed);
  } else {
    INTERRUPTED.store(true, Ordering::Relaxed);
  }
}

fn install_signal_handlers() {
  use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
  let action =
    SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
  // SAFETY: the handler only stores to atomics, which is signal-safe.
  unsafe {
    let _ = sigaction(Signal::SIGINT, &action);
    let _ = sigaction(Signal::SIGTERM, &action);
    let _ = sigaction(Signal::SIGHUP, &action);
  }
}

/// Forwards the signal flags into the listener: interrupt starts shutdown,
/// reload replays the monitor's script chain.
fn spawn_signal_watch(listener: &Arc<Listener>) {
  let listener = Arc::clone(listener);
  std::thread::Builder::new()
    .name("signals".to_string())
    .spawn(move || {
      loop {
        if INTERRUPTED.swap(false, Ordering::Relaxed) {
          listener.send_work(ListenerWork::Interrupt);
        }
        if RELOAD.swap(false, Ordering::Relaxed) {
          listener.monitor_restart();
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
      }
    })
    .expect("failed to spawn signal thread");
}

pub fn run() -> Result<()> {
  env_logger::init();
  let cli = Cli::parse();
  run_with(cli)
}

pub fn run_with(cli: Cli) -> Result<()> {
  let tunables = Arc::new(config::load_tunables()?);
  let standalone = cli.flavor == Flavor::Standalone;

  let id = os::machine_identity(standalone);
  info!("starting muxd {} ({id})", env!("CARGO_PKG_VERSION"));

  let reaper = Reaper::new(tunables.orphan_cap);
  reaper.start();

  let listener = Listener::new(id, standalone, Arc::clone(&tunables), Arc::clone(&reaper));

  let scripts = MonitorScripts {
    chain: tunables.monitor_chain.clone(),
    monitor: tunables.monitor_command.clone(),
  };
  let (monitor_tx, monitor_join) =
    Monitor::spawn(scripts, Arc::clone(&reaper), listener.work_sender(), Arc::clone(&tunables));
  listener.set_monitor(monitor_tx.clone());

  install_signal_handlers();
  spawn_signal_watch(&listener);

  // Dial configured peers before serving.
  for path in &cli.peer {
    match mux::raw::RawInstance::connect(Arc::clone(&listener), path) {
      Ok(registration) => listener.send_work(ListenerWork::AddConn(registration)),
      Err(e) => warn!("failed to connect peer {}: {e:#}", path.display()),
    }
  }

  let socket = match cli.flavor {
    Flavor::Standalone => {
      // The launcher hands us one end of a socketpair as descriptor 0.
      // SAFETY: stdin is inherited and unused elsewhere in this process.
      let fd = unsafe { OwnedFd::from_raw_fd(0) };
      let stream = UnixStream::from(fd);
      let environ = std::env::vars().collect();
      let registration = mux::reader::Reader::spawn(Arc::clone(&listener), stream, environ)
        .context("failed to start initial reader")?;
      listener.send_work(ListenerWork::AddReader(registration));
      None
    }
    Flavor::Activated => {
      // systemd passes the bound socket as the first activation descriptor.
      // SAFETY: descriptor 3 is the inherited listening socket.
      let fd = unsafe { OwnedFd::from_raw_fd(3) };
      Some(UnixListener::from(fd))
    }
    Flavor::Persistent => {
      let path = cli.socket.clone().unwrap_or_else(config::compute_socket_path);
      if UnixStream::connect(&path).is_ok() {
        anyhow::bail!("server already running at {}", path.display());
      }
      let _ = std::fs::remove_file(&path);
      let socket = UnixListener::bind(&path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
      info!("listening at {}", path.display());
      Some(socket)
    }
  };

  let result = listener.run(socket);

  let _ = monitor_tx.send(MonitorWork::Close);
  let _ = monitor_join.join();
  reaper.stop();

  result
}
