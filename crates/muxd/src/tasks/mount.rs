//! File mount: request/response access to a held-open file or directory.
//!
//! Requests queue up and are processed one per idle tick, which keeps the
//! task responsive to pause/resume between operations. File and directory
//! handles are reference counted per path; the empty path names the
//! originally opened target.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::poll::PollFlags;
use nix::sys::stat::Mode;

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::proto::wire::Unmarshaler;
use crate::proto::{self, MountOp};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

struct Request {
  id: u32,
  op: MountOp,
  name: String,
  data: Vec<u8>,
}

struct DirState {
  entries: Vec<(String, u32, u64)>,
  cursor: usize,
  refs: u32,
}

pub struct FileMount {
  target: String,
  ro: bool,
  root: Option<OwnedFd>,
  root_is_dir: bool,
  files: HashMap<String, (OwnedFd, u32)>,
  dirs: HashMap<String, DirState>,
  requests: VecDeque<Request>,
}

impl FileMount {
  fn reply(&self, ctx: &mut TaskCtx, req_id: u32, result: u32, body: &[u8]) {
    let mut payload = Vec::with_capacity(8 + body.len());
    payload.extend_from_slice(&req_id.to_le_bytes());
    payload.extend_from_slice(&result.to_le_bytes());
    payload.extend_from_slice(body);
    let frame = ctx.output_frame(&payload);
    if !ctx.throttled_output(frame) {
      ctx.timeout_ms = -1;
    }
  }

  fn result_of(errno: nix::errno::Errno) -> u32 {
    match errno {
      nix::errno::Errno::ENOENT => proto::MOUNT_EXIST,
      nix::errno::Errno::EISDIR | nix::errno::Errno::ENOTDIR => proto::MOUNT_FILETYPE,
      _ => proto::MOUNT_FAILURE,
    }
  }

  fn resolve(&self, name: &str) -> std::path::PathBuf {
    if name.is_empty() {
      std::path::PathBuf::from(&self.target)
    } else {
      std::path::Path::new(&self.target).join(name)
    }
  }

  /// A cached file handle for the path, if any.
  fn cached_fd(&self, name: &str) -> Option<&OwnedFd> {
    if name.is_empty() && !self.root_is_dir {
      return self.root.as_ref();
    }
    self.files.get(name).map(|(fd, _)| fd)
  }

  fn open_for_read(&self, name: &str) -> Result<OwnedFd, nix::errno::Errno> {
    nix::fcntl::open(
      &self.resolve(name),
      OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOCTTY,
      Mode::empty(),
    )
  }

  fn stat_body(stat: &nix::sys::stat::FileStat) -> Vec<u8> {
    let mut body = Vec::with_capacity(48);
    body.extend_from_slice(&(stat.st_mode as u32).to_le_bytes());
    body.extend_from_slice(&(stat.st_size.max(0) as u64).to_le_bytes());
    body.extend_from_slice(&(stat.st_atime.max(0) as u64).to_le_bytes());
    body.extend_from_slice(&(stat.st_atime_nsec.max(0) as u32).to_le_bytes());
    body.extend_from_slice(&(stat.st_mtime.max(0) as u64).to_le_bytes());
    body.extend_from_slice(&(stat.st_mtime_nsec.max(0) as u32).to_le_bytes());
    body.extend_from_slice(&(stat.st_ctime.max(0) as u64).to_le_bytes());
    body.extend_from_slice(&(stat.st_ctime_nsec.max(0) as u32).to_le_bytes());
    body
  }

  fn process(&mut self, ctx: &mut TaskCtx, req: Request) {
    match req.op {
      MountOp::Stat | MountOp::Lookup => {
        let result = match self.cached_fd(&req.name) {
          Some(fd) => nix::sys::stat::fstat(fd),
          None => nix::sys::stat::lstat(&self.resolve(&req.name)),
        };
        match result {
          Ok(stat) => self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &Self::stat_body(&stat)),
          Err(e) => self.reply(ctx, req.id, Self::result_of(e), &[]),
        }
      }
      MountOp::Read => {
        let mut unm = Unmarshaler::new(&req.data);
        let total = unm.parse_number64() as usize;
        let offset = unm.parse_number64();
        match self.read_range(&req.name, total, offset) {
          Ok(data) => self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &data),
          Err(e) => self.reply(ctx, req.id, Self::result_of(e), &[]),
        }
      }
      MountOp::Write | MountOp::Append => {
        if self.ro {
          self.reply(ctx, req.id, proto::MOUNT_FAILURE, &[]);
          return;
        }
        let mut unm = Unmarshaler::new(&req.data);
        let offset = if req.op == MountOp::Write { Some(unm.parse_number64()) } else { None };
        let data = unm.remaining_bytes().to_vec();
        match self.write_range(&req.name, offset, &data) {
          Ok(n) => self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &(n as u64).to_le_bytes()),
          Err(e) => self.reply(ctx, req.id, Self::result_of(e), &[]),
        }
      }
      MountOp::Chmod => {
        if self.ro {
          self.reply(ctx, req.id, proto::MOUNT_FAILURE, &[]);
          return;
        }
        let mut unm = Unmarshaler::new(&req.data);
        let mode = unm.parse_number() & 0o7777;
        use std::os::unix::fs::PermissionsExt;
        let result = std::fs::set_permissions(
          self.resolve(&req.name),
          std::fs::Permissions::from_mode(mode),
        );
        match result {
          Ok(()) => self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]),
          Err(e) => {
            let errno = e.raw_os_error().map(nix::errno::Errno::from_raw);
            self.reply(ctx, req.id, errno.map_or(proto::MOUNT_FAILURE, Self::result_of), &[]);
          }
        }
      }
      MountOp::Trunc => {
        if self.ro {
          self.reply(ctx, req.id, proto::MOUNT_FAILURE, &[]);
          return;
        }
        let mut unm = Unmarshaler::new(&req.data);
        let size = unm.parse_number64();
        let result = std::fs::OpenOptions::new()
          .write(true)
          .open(self.resolve(&req.name))
          .and_then(|file| file.set_len(size));
        match result {
          Ok(()) => self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]),
          Err(e) => {
            let errno = e.raw_os_error().map(nix::errno::Errno::from_raw);
            self.reply(ctx, req.id, errno.map_or(proto::MOUNT_FAILURE, Self::result_of), &[]);
          }
        }
      }
      MountOp::Touch => {
        if self.ro {
          self.reply(ctx, req.id, proto::MOUNT_FAILURE, &[]);
          return;
        }
        let path = self.resolve(&req.name);
        let result = std::fs::OpenOptions::new()
          .append(true)
          .open(&path)
          .and_then(|file| file.set_modified(std::time::SystemTime::now()));
        match result {
          Ok(()) => self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]),
          Err(e) => {
            let errno = e.raw_os_error().map(nix::errno::Errno::from_raw);
            self.reply(ctx, req.id, errno.map_or(proto::MOUNT_FAILURE, Self::result_of), &[]);
          }
        }
      }
      MountOp::Create => {
        if self.ro {
          self.reply(ctx, req.id, proto::MOUNT_FAILURE, &[]);
          return;
        }
        let mut unm = Unmarshaler::new(&req.data);
        let mode = Mode::from_bits_truncate(unm.parse_number());
        match nix::fcntl::open(
          &self.resolve(&req.name),
          OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC,
          mode,
        ) {
          Ok(fd) => {
            self.files.insert(req.name.clone(), (fd, 1));
            self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
          }
          Err(nix::errno::Errno::EEXIST) => self.reply(ctx, req.id, proto::MOUNT_EXIST, &[]),
          Err(e) => self.reply(ctx, req.id, Self::result_of(e), &[]),
        }
      }
      MountOp::Open => {
        if let Some((_, refs)) = self.files.get_mut(&req.name) {
          *refs += 1;
          self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
          return;
        }
        match self.open_for_read(&req.name) {
          Ok(fd) => {
            self.files.insert(req.name.clone(), (fd, 1));
            self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
          }
          Err(e) => self.reply(ctx, req.id, Self::result_of(e), &[]),
        }
      }
      MountOp::Close => {
        let drop_entry = match self.files.get_mut(&req.name) {
          Some((_, refs)) => {
            *refs = refs.saturating_sub(1);
            *refs == 0
          }
          None => false,
        };
        if drop_entry {
          self.files.remove(&req.name);
        }
        self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
      }
      MountOp::Opendir => {
        if let Some(state) = self.dirs.get_mut(&req.name) {
          state.refs += 1;
          state.cursor = 0;
          self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
          return;
        }
        match std::fs::read_dir(self.resolve(&req.name)) {
          Ok(iter) => {
            let mut entries = Vec::new();
            for entry in iter.flatten() {
              let name = entry.file_name().to_string_lossy().into_owned();
              let (mode, size) = entry
                .metadata()
                .map(|m| {
                  use std::os::unix::fs::MetadataExt;
                  (m.mode(), m.size())
                })
                .unwrap_or((0, 0));
              entries.push((name, mode, size));
            }
            self.dirs.insert(req.name.clone(), DirState { entries, cursor: 0, refs: 1 });
            self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
          }
          Err(e) => {
            let errno = e.raw_os_error().map(nix::errno::Errno::from_raw);
            self.reply(ctx, req.id, errno.map_or(proto::MOUNT_FAILURE, Self::result_of), &[]);
          }
        }
      }
      MountOp::Readdir => {
        let Some(state) = self.dirs.get_mut(&req.name) else {
          self.reply(ctx, req.id, proto::MOUNT_FAILURE, &[]);
          return;
        };
        let mut body = Vec::new();
        match state.entries.get(state.cursor) {
          Some((name, mode, size)) => {
            state.cursor += 1;
            body.extend_from_slice(&mode.to_le_bytes());
            body.extend_from_slice(&size.to_le_bytes());
            body.extend_from_slice(name.as_bytes());
            body.push(0);
          }
          None => {
            // End of directory: empty name.
            body.extend_from_slice(&0u32.to_le_bytes());
            body.extend_from_slice(&0u64.to_le_bytes());
            body.push(0);
          }
        }
        self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &body);
      }
      MountOp::Closedir => {
        let drop_entry = match self.dirs.get_mut(&req.name) {
          Some(state) => {
            state.refs = state.refs.saturating_sub(1);
            state.refs == 0
          }
          None => false,
        };
        if drop_entry {
          self.dirs.remove(&req.name);
        }
        self.reply(ctx, req.id, proto::MOUNT_SUCCESS, &[]);
      }
    }
  }

  fn read_range(&mut self, name: &str, total: usize, offset: u64) -> Result<Vec<u8>, nix::errno::Errno> {
    let owned;
    let fd = match self.cached_fd(name) {
      Some(fd) => fd,
      None => {
        owned = self.open_for_read(name)?;
        &owned
      }
    };

    let mut data = vec![0u8; total.min(1 << 20)];
    let mut filled = 0;
    while filled < data.len() {
      match nix::sys::uio::pread(fd, &mut data[filled..], (offset + filled as u64) as i64) {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(nix::errno::Errno::EINTR) => continue,
        Err(e) => return Err(e),
      }
    }
    data.truncate(filled);
    Ok(data)
  }

  fn write_range(
    &mut self,
    name: &str,
    offset: Option<u64>,
    data: &[u8],
  ) -> Result<usize, nix::errno::Errno> {
    let path = self.resolve(name);
    let flags = match offset {
      Some(_) => OFlag::O_WRONLY | OFlag::O_CLOEXEC,
      None => OFlag::O_WRONLY | OFlag::O_APPEND | OFlag::O_CLOEXEC,
    };
    let fd = nix::fcntl::open(&path, flags, Mode::empty())?;
    match offset {
      Some(offset) => {
        let mut written = 0;
        while written < data.len() {
          match nix::sys::uio::pwrite(&fd, &data[written..], (offset + written as u64) as i64) {
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e),
          }
        }
        Ok(written)
      }
      None => {
        let mut written = 0;
        while written < data.len() {
          match nix::unistd::write(fd.as_fd(), &data[written..]) {
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e),
          }
        }
        Ok(written)
      }
    }
  }
}

impl TaskVariant for FileMount {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    let stat = match nix::sys::stat::stat(self.target.as_str()) {
      Ok(stat) => stat,
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
        debug!("mount {}: failed to open '{}': {e}", ctx.task_id(), self.target);
        return false;
      }
    };
    let kind = nix::sys::stat::SFlag::from_bits_truncate(stat.st_mode)
      & nix::sys::stat::SFlag::S_IFMT;
    self.root_is_dir = kind == nix::sys::stat::SFlag::S_IFDIR;

    let flags = if self.root_is_dir {
      OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC
    } else if self.ro {
      OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_NOCTTY
    } else {
      OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_NOCTTY
    };
    match nix::fcntl::open(self.target.as_str(), flags, Mode::empty()) {
      Ok(fd) => self.root = Some(fd),
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_OPEN_FAILED, e.desc());
        return false;
      }
    }

    ctx.report_starting_sized(stat.st_mode as u32 & 0o7777, stat.st_size.max(0) as u64);
    ctx.timeout_ms = -1;
    debug!("mount {}: running ({})", ctx.task_id(), self.target);
    true
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        debug!("mount {}: canceled (code {reason})", ctx.task_id());
        false
      }
      TaskWork::Input(data) => {
        let mut unm = Unmarshaler::new(&data);
        let id = unm.parse_number();
        let op = unm.parse_number();
        let name = unm.parse_padded_string();
        let Some(op) = MountOp::from_u32(op) else {
          warn!("mount {}: bad opcode {op}", ctx.task_id());
          return true;
        };
        self.requests.push_back(Request { id, op, name, data: unm.remaining_bytes().to_vec() });
        if !ctx.throttled {
          ctx.timeout_ms = 0;
        }
        true
      }
      TaskWork::Pause => {
        ctx.throttled = true;
        ctx.timeout_ms = -1;
        debug!("mount {}: throttled (remote)", ctx.task_id());
        true
      }
      TaskWork::Resume => {
        ctx.throttled = false;
        ctx.timeout_ms = 0;
        debug!("mount {}: resumed", ctx.task_id());
        true
      }
      _ => true,
    }
  }

  fn handle_fd(&mut self, _ctx: &mut TaskCtx, _index: usize, _revents: PollFlags) -> bool {
    true
  }

  /// One request per idle tick.
  fn handle_idle(&mut self, ctx: &mut TaskCtx) -> bool {
    if ctx.throttled {
      ctx.timeout_ms = -1;
      return true;
    }
    if let Some(req) = self.requests.pop_front() {
      self.process(ctx, req);
    }
    if self.requests.is_empty() && ctx.timeout_ms == 0 {
      ctx.timeout_ms = -1;
    }
    true
  }
}

/// `TASK_MOUNT_RO` / `TASK_MOUNT_RW` launch: target name.
pub fn launch(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
  ro: bool,
) -> anyhow::Result<TaskLaunch> {
  let target = unm.parse_string();

  let handle = make_handle(task_id, client_id, target.clone(), !ro, true)?;
  let ctx = TaskCtx::new(Arc::clone(listener), handle.clone(), 4096, 4);
  let variant = FileMount {
    target,
    ro,
    root: None,
    root_is_dir: false,
    files: HashMap::new(),
    dirs: HashMap::new(),
    requests: VecDeque::new(),
  };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, "mount")),
    duplicate_report,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Tunables;
  use crate::mux::reaper::Reaper;

  fn harness(target: &str, ro: bool) -> (Arc<Listener>, TaskCtx, FileMount) {
    let listener = Listener::new(
      InstanceId::generate(),
      false,
      Arc::new(Tunables::default()),
      Reaper::new(128),
    );
    let client_id = InstanceId::generate();
    let writer = crate::mux::output::OutputScheduler::new(1 << 20);
    let info = crate::mux::listener::ClientInfo {
      hops: 0,
      flags: 0,
      attributes: Default::default(),
      writer,
      via: InstanceId::generate(),
      environ: Default::default(),
      announce: Vec::new(),
    };
    assert!(listener.register_client(client_id, info));

    let handle = make_handle(InstanceId::generate(), client_id, target.to_string(), !ro, true).unwrap();
    let ctx = TaskCtx::new(Arc::clone(&listener), handle, 4096, 4);
    let variant = FileMount {
      target: target.to_string(),
      ro,
      root: None,
      root_is_dir: false,
      files: HashMap::new(),
      dirs: HashMap::new(),
      requests: VecDeque::new(),
    };
    (listener, ctx, variant)
  }

  fn request(id: u32, op: MountOp, name: &str, extra: &[u8]) -> Vec<u8> {
    let mut m = crate::proto::wire::Marshaler::new(0);
    m.add_number(id);
    m.add_number(op as u32);
    m.add_padded_string(name);
    m.add_bytes(extra);
    m.finish()[crate::proto::FRAME_HEADER_SIZE..].to_vec()
  }

  #[test]
  fn requests_process_one_per_idle_tick() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a"), b"data").unwrap();
    let (_listener, mut ctx, mut variant) = harness(dir.path().to_str().unwrap(), true);

    assert!(variant.open(&mut ctx));
    assert!(variant.root_is_dir);

    variant.handle_work(&mut ctx, TaskWork::Input(request(1, MountOp::Stat, "a", &[])));
    variant.handle_work(&mut ctx, TaskWork::Input(request(2, MountOp::Stat, "a", &[])));
    assert_eq!(variant.requests.len(), 2);
    assert_eq!(ctx.timeout_ms, 0);

    assert!(variant.handle_idle(&mut ctx));
    assert_eq!(variant.requests.len(), 1);
    assert!(variant.handle_idle(&mut ctx));
    assert!(variant.requests.is_empty());
    assert_eq!(ctx.timeout_ms, -1, "queue drained, no more ticks needed");
  }

  #[test]
  fn read_returns_file_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"hello mount").unwrap();
    let (_listener, mut ctx, mut variant) = harness(dir.path().to_str().unwrap(), true);
    assert!(variant.open(&mut ctx));

    let data = variant.read_range("f", 64, 0).unwrap();
    assert_eq!(data, b"hello mount");
    let tail = variant.read_range("f", 64, 6).unwrap();
    assert_eq!(tail, b"mount");
  }

  #[test]
  fn readonly_mount_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let (_listener, mut ctx, mut variant) = harness(dir.path().to_str().unwrap(), true);
    assert!(variant.open(&mut ctx));

    let mut extra = Vec::new();
    extra.extend_from_slice(&0u64.to_le_bytes());
    extra.extend_from_slice(b"nope");
    let req = request(5, MountOp::Write, "f", &extra);
    variant.handle_work(&mut ctx, TaskWork::Input(req));
    assert!(variant.handle_idle(&mut ctx));
    assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"x");
  }

  #[test]
  fn handles_are_reference_counted() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let (_listener, mut ctx, mut variant) = harness(dir.path().to_str().unwrap(), true);
    assert!(variant.open(&mut ctx));

    for id in 0..2 {
      variant.handle_work(&mut ctx, TaskWork::Input(request(id, MountOp::Open, "f", &[])));
      assert!(variant.handle_idle(&mut ctx));
    }
    assert_eq!(variant.files.get("f").map(|(_, refs)| *refs), Some(2));

    variant.handle_work(&mut ctx, TaskWork::Input(request(3, MountOp::Close, "f", &[])));
    assert!(variant.handle_idle(&mut ctx));
    assert_eq!(variant.files.get("f").map(|(_, refs)| *refs), Some(1));

    variant.handle_work(&mut ctx, TaskWork::Input(request(4, MountOp::Close, "f", &[])));
    assert!(variant.handle_idle(&mut ctx));
    assert!(!variant.files.contains_key("f"));
  }

  #[test]
  fn readdir_walks_entries_then_ends() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one"), b"1").unwrap();
    std::fs::write(dir.path().join("two"), b"2").unwrap();
    let (_listener, mut ctx, mut variant) = harness(dir.path().to_str().unwrap(), true);
    assert!(variant.open(&mut ctx));

    variant.handle_work(&mut ctx, TaskWork::Input(request(1, MountOp::Opendir, "", &[])));
    assert!(variant.handle_idle(&mut ctx));
    assert_eq!(variant.dirs.get("").map(|d| d.entries.len()), Some(2));

    for id in 2..5 {
      variant.handle_work(&mut ctx, TaskWork::Input(request(id, MountOp::Readdir, "", &[])));
      assert!(variant.handle_idle(&mut ctx));
    }
    assert_eq!(variant.dirs.get("").map(|d| d.cursor), Some(2));
  }

  #[test]
  fn missing_target_fails_to_open() {
    let (_listener, mut ctx, mut variant) = harness("/definitely/not/here", true);
    assert!(!variant.open(&mut ctx));
  }
}
