//! Single-shot file operations: delete and rename.
//!
//! The task kicks itself with a Private work item, runs once, possibly asks
//! an overwrite/recurse question, and completes on the answer.

use std::sync::Arc;

use log::{debug, warn};

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::proto::wire::Unmarshaler;
use crate::proto::{self, TaskStatus};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

pub struct FileMisc {
  target: String,
  dest: String,
  config: u32,
  rename: bool,
}

impl FileMisc {
  fn run_remove(&mut self, ctx: &mut TaskCtx) -> bool {
    let path = std::path::Path::new(&self.target);
    let meta = match std::fs::symlink_metadata(path) {
      Ok(meta) => meta,
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_FILE_NOT_FOUND, &e.to_string());
        debug!("file-misc {}: failed to stat '{}': {e}", ctx.task_id(), self.target);
        return false;
      }
    };

    if meta.is_dir() && (self.config == proto::TASK_ASK || self.config == proto::TASK_ASK_RECURSE) {
      ctx.report_question(proto::QUESTION_RECURSE);
      debug!("file-misc {}: requesting recursive remove confirmation", ctx.task_id());
      return true;
    }
    if self.config == proto::TASK_ASK {
      ctx.report_question(proto::QUESTION_REMOVE);
      debug!("file-misc {}: requesting simple remove confirmation", ctx.task_id());
      return true;
    }

    let result = if meta.is_dir() {
      match std::fs::remove_dir(path) {
        Err(e)
          if e.raw_os_error() == Some(nix::errno::Errno::ENOTEMPTY as i32)
            && self.config == proto::TASK_OVERWRITE =>
        {
          // Non-empty directory with overwrite config: recursive delete.
          std::fs::remove_dir_all(path)
        }
        other => other,
      }
    } else {
      std::fs::remove_file(path)
    };

    match result {
      Ok(()) => {
        ctx.report_status(TaskStatus::Finished);
        debug!("file-misc {}: finished", ctx.task_id());
      }
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_REMOVE_FAILED, &e.to_string());
        debug!("file-misc {}: failed to remove '{}': {e}", ctx.task_id(), self.target);
      }
    }
    false
  }

  fn run_rename(&mut self, ctx: &mut TaskCtx) -> bool {
    if self.dest.is_empty() || !self.dest.starts_with('/') {
      ctx.report_error(proto::TASK_ERROR_INVALID_NAME, "invalid destination");
      debug!("file-misc {}: failed, invalid destination", ctx.task_id());
      return false;
    }

    // Overwrite scenarios.
    if std::path::Path::new(&self.dest).exists() {
      match self.config {
        proto::TASK_OVERWRITE => {}
        proto::TASK_ASK => {
          ctx.report_question(proto::QUESTION_OVERWRITE);
          debug!("file-misc {}: requesting overwrite confirmation", ctx.task_id());
          return true;
        }
        _ => {
          ctx.report_error(proto::TASK_ERROR_FILE_EXISTS, "target file exists");
          debug!("file-misc {}: failed, target file exists", ctx.task_id());
          return false;
        }
      }
    }

    match std::fs::rename(&self.target, &self.dest) {
      Ok(()) => {
        ctx.report_status(TaskStatus::Finished);
        debug!("file-misc {}: finished", ctx.task_id());
      }
      Err(e) => {
        ctx.report_error(proto::TASK_ERROR_RENAME_FAILED, &e.to_string());
        debug!(
          "file-misc {}: failed to rename '{}' to '{}': {e}",
          ctx.task_id(),
          self.target,
          self.dest
        );
      }
    }
    false
  }

  fn handle_answer(&mut self, ctx: &mut TaskCtx, answer: u32) -> bool {
    if !ctx.questioning {
      warn!("file-misc {}: unexpected answer", ctx.task_id());
      return false;
    }
    ctx.questioning = false;
    debug!("file-misc {}: question answered: {answer}", ctx.task_id());

    if answer == proto::TASK_OVERWRITE {
      self.config = proto::TASK_OVERWRITE;
      ctx.handle.queue.send(TaskWork::Private);
      true
    } else {
      ctx.report_error(proto::TASK_ERROR_CANCELED, "canceled");
      false
    }
  }
}

impl TaskVariant for FileMisc {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    ctx.handle.queue.send(TaskWork::Private);
    true
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        debug!("file-misc {}: canceled (code {reason})", ctx.task_id());
        false
      }
      // No data stream for misc tasks.
      TaskWork::Input(_) => false,
      TaskWork::Answer(answer) => self.handle_answer(ctx, answer),
      TaskWork::Private => {
        if self.rename {
          self.run_rename(ctx)
        } else {
          self.run_remove(ctx)
        }
      }
      _ => true,
    }
  }

  fn handle_fd(&mut self, _ctx: &mut TaskCtx, _index: usize, _revents: nix::poll::PollFlags) -> bool {
    true
  }

  fn handle_idle(&mut self, ctx: &mut TaskCtx) -> bool {
    ctx.report_error(proto::TASK_ERROR_TIMED_OUT, "idle timeout exceeded");
    false
  }
}

/// `TASK_FILE_DELETE` / `TASK_FILE_RENAME` launch: config, target, and for
/// renames the destination.
pub fn launch(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  unm: &mut Unmarshaler<'_>,
  rename: bool,
) -> anyhow::Result<TaskLaunch> {
  let config = unm.parse_number();
  let target = unm.parse_string();
  let dest = if rename { unm.parse_string() } else { String::new() };

  let handle = make_handle(task_id, client_id, target.clone(), true, false)?;
  let ctx = TaskCtx::new(Arc::clone(listener), handle.clone(), 1, 1);
  let variant = FileMisc { target, dest, config, rename };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, "file-misc")),
    duplicate_report,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Tunables;
  use crate::mux::reaper::Reaper;

  fn harness(target: &str, dest: &str, config: u32, rename: bool) -> (Arc<Listener>, TaskCtx, FileMisc) {
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

    let handle = make_handle(InstanceId::generate(), client_id, target.to_string(), true, false).unwrap();
    let ctx = TaskCtx::new(Arc::clone(&listener), handle, 1, 1);
    let variant =
      FileMisc { target: target.to_string(), dest: dest.to_string(), config, rename };
    (listener, ctx, variant)
  }

  #[test]
  fn plain_remove_deletes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("victim");
    std::fs::write(&path, b"x").unwrap();
    let (_l, mut ctx, mut variant) =
      harness(path.to_str().unwrap(), "", proto::TASK_OVERWRITE, false);

    assert!(!variant.run_remove(&mut ctx));
    assert!(!path.exists());
  }

  #[test]
  fn non_empty_directory_needs_overwrite_for_recursion() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("tree");
    std::fs::create_dir(&sub).unwrap();
    std::fs::write(sub.join("inner"), b"x").unwrap();

    let (_l, mut ctx, mut variant) =
      harness(sub.to_str().unwrap(), "", proto::TASK_OVERWRITE, false);
    assert!(!variant.run_remove(&mut ctx));
    assert!(!sub.exists(), "overwrite config recurses");
  }

  #[test]
  fn ask_config_raises_question_then_answer_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("tree");
    std::fs::create_dir(&sub).unwrap();

    let (_l, mut ctx, mut variant) = harness(sub.to_str().unwrap(), "", proto::TASK_ASK, false);
    assert!(variant.run_remove(&mut ctx));
    assert!(ctx.questioning);

    assert!(variant.handle_answer(&mut ctx, proto::TASK_OVERWRITE));
    // The answer re-kicks the run through a Private work item.
    let items = ctx.handle.queue.drain();
    assert!(matches!(items.as_slice(), [TaskWork::Private]));
    assert!(!variant.run_remove(&mut ctx));
    assert!(!sub.exists());
  }

  #[test]
  fn decline_answer_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keep");
    std::fs::write(&path, b"x").unwrap();

    let (_l, mut ctx, mut variant) = harness(path.to_str().unwrap(), "", proto::TASK_ASK, false);
    assert!(variant.run_remove(&mut ctx));
    assert!(!variant.handle_answer(&mut ctx, proto::TASK_FAIL));
    assert!(path.exists());
  }

  #[test]
  fn rename_moves_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let from = dir.path().join("from");
    let to = dir.path().join("to");
    std::fs::write(&from, b"content").unwrap();

    let (_l, mut ctx, mut variant) = harness(
      from.to_str().unwrap(),
      to.to_str().unwrap(),
      proto::TASK_OVERWRITE,
      true,
    );
    assert!(!variant.run_rename(&mut ctx));
    assert!(!from.exists());
    assert_eq!(std::fs::read(&to).unwrap(), b"content");
  }

  #[test]
  fn rename_rejects_relative_destination() {
    let (_l, mut ctx, mut variant) = harness("/tmp/x", "relative/dest", proto::TASK_OVERWRITE, true);
    assert!(!variant.run_rename(&mut ctx));
  }
}
