//! Per-terminal directory watcher.
//!
//! Follows the foreground process's working directory: when the terminal
//! learns a new cwd it retargets the watch, scans the directory (bounded by
//! the configured entry limit), and thereafter translates inotify events
//! into per-file updates delivered to the owning terminal's work queue.

use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};

use crate::proto::attrs::AttributeMap;

pub enum FilemonWork {
  /// Watch a new directory (the terminal's cwd changed).
  Monitor(String),
  /// Change the entry limit.
  SetLimit(usize),
  Close,
}

/// Updates delivered back to the terminal.
#[derive(Debug, Clone)]
pub enum FilemonEvent {
  /// Full rescan of the watched directory.
  Directory { dir: String, entries: Vec<(String, AttributeMap)>, overflow: bool },
  /// One file changed.
  File { name: String, attrs: AttributeMap },
  /// One file disappeared.
  Removed { name: String },
}

pub struct Filemon {
  work_rx: Receiver<FilemonWork>,
  events_tx: Sender<crate::mux::term::TermWork>,
  inotify: Option<Inotify>,
  watch: Option<WatchDescriptor>,
  dir: PathBuf,
  limit: usize,
}

impl Filemon {
  pub fn spawn(
    limit: usize,
    events_tx: Sender<crate::mux::term::TermWork>,
  ) -> (Sender<FilemonWork>, std::thread::JoinHandle<()>) {
    let (work_tx, work_rx) = unbounded();
    let mut filemon = Self {
      work_rx,
      events_tx,
      inotify: None,
      watch: None,
      dir: PathBuf::new(),
      limit,
    };
    let handle = std::thread::Builder::new()
      .name("filemon".to_string())
      .spawn(move || filemon.run())
      .expect("failed to spawn filemon thread");
    (work_tx, handle)
  }

  fn run(&mut self) {
    self.inotify = match Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC) {
      Ok(inotify) => Some(inotify),
      Err(e) => {
        warn!("filemon: inotify unavailable: {e}");
        None
      }
    };

    loop {
      while let Ok(item) = self.work_rx.try_recv() {
        match item {
          FilemonWork::Close => {
            debug!("filemon: exiting");
            return;
          }
          FilemonWork::Monitor(dir) => self.retarget(&dir),
          FilemonWork::SetLimit(limit) => {
            self.limit = limit;
            let dir = self.dir.to_string_lossy().into_owned();
            if !dir.is_empty() {
              self.rescan(&dir);
            }
          }
        }
      }

      match &self.inotify {
        Some(inotify) => {
          let pollfd = PollFd::new(inotify.as_fd(), PollFlags::POLLIN);
          let timeout = PollTimeout::try_from(200u16).unwrap_or(PollTimeout::NONE);
          match poll(&mut [pollfd], timeout) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => {}
            Ok(_) => self.drain_events(),
            Err(e) => {
              warn!("filemon: poll: {e}");
              return;
            }
          }
        }
        None => {
          // No inotify; serve work items only.
          if let Ok(FilemonWork::Close) = self.work_rx.recv_timeout(Duration::from_millis(500)) {
            return;
          }
        }
      }
    }
  }

  fn retarget(&mut self, dir: &str) {
    if self.dir.as_os_str() == dir {
      return;
    }
    self.dir = PathBuf::from(dir);

    if let Some(inotify) = &self.inotify {
      if let Some(watch) = self.watch.take() {
        let _ = inotify.rm_watch(watch);
      }
      let mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO;
      match inotify.add_watch(&self.dir, mask) {
        Ok(watch) => self.watch = Some(watch),
        Err(e) => debug!("filemon: cannot watch {dir}: {e}"),
      }
    }

    self.rescan(dir);
  }

  fn rescan(&mut self, dir: &str) {
    let mut entries = Vec::new();
    let mut overflow = false;

    if let Ok(iter) = std::fs::read_dir(&self.dir) {
      for entry in iter.flatten() {
        if entries.len() >= self.limit {
          overflow = true;
          break;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((name, stat_attrs(&entry.path())));
      }
    }

    let _ = self.events_tx.send(crate::mux::term::TermWork::FileEvent(FilemonEvent::Directory {
      dir: dir.to_string(),
      entries,
      overflow,
    }));
  }

  fn drain_events(&mut self) {
    let Some(inotify) = &self.inotify else { return };
    let Ok(events) = inotify.read_events() else { return };

    for event in events {
      let Some(name) = event.name else { continue };
      let name = name.to_string_lossy().into_owned();

      let gone = event.mask.contains(AddWatchFlags::IN_DELETE)
        || event.mask.contains(AddWatchFlags::IN_MOVED_FROM);
      let update = if gone {
        FilemonEvent::Removed { name }
      } else {
        let path = self.dir.join(&name);
        FilemonEvent::File { name, attrs: stat_attrs(&path) }
      };
      let _ = self.events_tx.send(crate::mux::term::TermWork::FileEvent(update));
    }
  }
}

fn stat_attrs(path: &Path) -> AttributeMap {
  let mut attrs = AttributeMap::new();
  if let Ok(meta) = std::fs::symlink_metadata(path) {
    attrs.insert("file.size".to_string(), meta.size().to_string());
    attrs.insert("file.mode".to_string(), format!("{:o}", meta.mode()));
    attrs.insert("file.mtime".to_string(), meta.mtime().to_string());
    attrs.insert("file.uid".to_string(), meta.uid().to_string());
    attrs.insert("file.gid".to_string(), meta.gid().to_string());
    if meta.is_dir() {
      attrs.insert("file.dir".to_string(), "1".to_string());
    }
  }
  attrs
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mux::term::TermWork;

  fn recv_directory(
    rx: &Receiver<TermWork>,
  ) -> Option<(String, Vec<(String, AttributeMap)>, bool)> {
    for _ in 0..100 {
      match rx.recv_timeout(Duration::from_millis(100)) {
        Ok(TermWork::FileEvent(FilemonEvent::Directory { dir, entries, overflow })) => {
          return Some((dir, entries, overflow));
        }
        Ok(_) => continue,
        Err(_) => return None,
      }
    }
    None
  }

  #[test]
  fn monitor_scans_directory_and_reports_entries() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
    std::fs::write(tmp.path().join("b.txt"), b"world!").unwrap();

    let (events_tx, events_rx) = unbounded();
    let (work_tx, handle) = Filemon::spawn(100, events_tx);
    work_tx.send(FilemonWork::Monitor(tmp.path().to_string_lossy().into_owned())).unwrap();

    let (dir, mut entries, overflow) = recv_directory(&events_rx).expect("directory event");
    assert_eq!(dir, tmp.path().to_string_lossy());
    assert!(!overflow);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "a.txt");
    assert_eq!(entries[0].1.get("file.size").map(String::as_str), Some("5"));

    work_tx.send(FilemonWork::Close).unwrap();
    handle.join().unwrap();
  }

  #[test]
  fn entry_limit_reports_overflow() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..5 {
      std::fs::write(tmp.path().join(format!("f{i}")), b"x").unwrap();
    }

    let (events_tx, events_rx) = unbounded();
    let (work_tx, handle) = Filemon::spawn(2, events_tx);
    work_tx.send(FilemonWork::Monitor(tmp.path().to_string_lossy().into_owned())).unwrap();

    let (_, entries, overflow) = recv_directory(&events_rx).expect("directory event");
    assert_eq!(entries.len(), 2);
    assert!(overflow);

    work_tx.send(FilemonWork::Close).unwrap();
    handle.join().unwrap();
  }

  #[test]
  fn file_creation_emits_update() {
    let tmp = tempfile::tempdir().unwrap();
    let (events_tx, events_rx) = unbounded();
    let (work_tx, handle) = Filemon::spawn(100, events_tx);
    work_tx.send(FilemonWork::Monitor(tmp.path().to_string_lossy().into_owned())).unwrap();
    let _ = recv_directory(&events_rx);

    std::fs::write(tmp.path().join("new.txt"), b"fresh").unwrap();

    let mut saw_file = false;
    for _ in 0..100 {
      match events_rx.recv_timeout(Duration::from_millis(100)) {
        Ok(TermWork::FileEvent(FilemonEvent::File { name, .. })) if name == "new.txt" => {
          saw_file = true;
          break;
        }
        Ok(_) => continue,
        Err(_) => break,
      }
    }
    assert!(saw_file, "expected a file update for new.txt");

    work_tx.send(FilemonWork::Close).unwrap();
    handle.join().unwrap();
  }
}
