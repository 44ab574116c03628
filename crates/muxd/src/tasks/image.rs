//! Inline content (image) download.
//!
//! The content bytes already live in memory, captured by the terminal's
//! emulator, so there is no descriptor: chunks go out on idle ticks, gated
//! by the same ack window and throttle signals as file downloads.

use std::sync::Arc;

use log::debug;

use crate::id::InstanceId;
use crate::mux::listener::{Listener, TaskLaunch};
use crate::proto::wire::Unmarshaler;
use crate::proto::{self};
use crate::tasks::{TaskCtx, TaskVariant, TaskWork, make_handle};

pub struct ImageDownload {
  data: Option<Vec<u8>>,
  offset: usize,
}

impl ImageDownload {
  fn arm(&self, ctx: &mut TaskCtx) {
    ctx.timeout_ms = if ctx.running && !ctx.throttled { 0 } else { -1 };
  }

  fn send_chunk(&mut self, ctx: &mut TaskCtx) -> bool {
    if ctx.window_full() {
      ctx.running = false;
      self.arm(ctx);
      return true;
    }
    let Some(data) = &self.data else { return false };

    let end = (self.offset + ctx.chunk_size.max(1)).min(data.len());
    let chunk = &data[self.offset..end];
    let frame = ctx.output_frame(chunk);
    ctx.sent += chunk.len() as u64;
    let sent_len = chunk.len();
    self.offset = end;

    let _ = ctx.throttled_output(frame);
    if sent_len == 0 {
      debug!("get-image {}: finished", ctx.task_id());
      ctx.report_finished();
      return false;
    }
    self.arm(ctx);
    true
  }
}

impl TaskVariant for ImageDownload {
  fn open(&mut self, ctx: &mut TaskCtx) -> bool {
    match &self.data {
      Some(data) => {
        ctx.report_starting_sized(0, data.len() as u64);
        ctx.timeout_ms = -1;
        debug!("get-image {}: running ({} bytes)", ctx.task_id(), data.len());
        true
      }
      None => {
        ctx.report_error(proto::TASK_ERROR_NO_SUCH_IMAGE, "no such content");
        false
      }
    }
  }

  fn handle_work(&mut self, ctx: &mut TaskCtx, item: TaskWork) -> bool {
    match item {
      TaskWork::Close(reason) => {
        debug!("get-image {}: canceled (code {reason})", ctx.task_id());
        false
      }
      TaskWork::Input(data) => {
        let mut unm = Unmarshaler::new(&data);
        ctx.acked = unm.parse_number64();
        ctx.running = true;
        self.arm(ctx);
        true
      }
      TaskWork::Pause => {
        ctx.throttled = true;
        self.arm(ctx);
        debug!("get-image {}: throttled (remote)", ctx.task_id());
        true
      }
      TaskWork::Resume => {
        ctx.throttled = false;
        self.arm(ctx);
        debug!("get-image {}: resumed", ctx.task_id());
        true
      }
      _ => true,
    }
  }

  fn handle_fd(&mut self, _ctx: &mut TaskCtx, _index: usize, _revents: nix::poll::PollFlags) -> bool {
    true
  }

  fn handle_idle(&mut self, ctx: &mut TaskCtx) -> bool {
    if ctx.running && !ctx.throttled {
      return self.send_chunk(ctx);
    }
    true
  }
}

/// Launch for a content download resolved by the terminal.
pub fn launch(
  listener: &Arc<Listener>,
  client_id: InstanceId,
  task_id: InstanceId,
  content_id: u64,
  data: Option<Vec<u8>>,
  chunk_size: u32,
  window_size: u32,
) -> anyhow::Result<TaskLaunch> {
  let handle = make_handle(task_id, client_id, content_id.to_string(), false, true)?;
  let mut ctx = TaskCtx::new(
    Arc::clone(listener),
    handle.clone(),
    chunk_size.max(1) as usize,
    u64::from(window_size.max(1)),
  );
  ctx.timeout_ms = -1;
  let variant = ImageDownload { data, offset: 0 };

  let duplicate_report = super::duplicate_report_frame(listener, &client_id, &task_id);
  Ok(TaskLaunch {
    handle,
    start: Box::new(move || super::spawn_task(Box::new(variant), ctx, "get-image")),
    duplicate_report,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Tunables;
  use crate::mux::reaper::Reaper;

  fn harness(data: Option<Vec<u8>>, chunk: usize, window: u64) -> (Arc<Listener>, TaskCtx, ImageDownload) {
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

    let handle = make_handle(InstanceId::generate(), client_id, "1".into(), false, true).unwrap();
    let ctx = TaskCtx::new(Arc::clone(&listener), handle, chunk, window);
    let variant = ImageDownload { data, offset: 0 };
    (listener, ctx, variant)
  }

  #[test]
  fn missing_content_errors_out() {
    let (_l, mut ctx, mut variant) = harness(None, 4096, 4);
    assert!(!variant.open(&mut ctx));
  }

  #[test]
  fn chunks_respect_the_window() {
    let (_l, mut ctx, mut variant) = harness(Some(vec![9u8; 10_000]), 4096, 1);
    assert!(variant.open(&mut ctx));
    variant.handle_work(&mut ctx, TaskWork::Input(0u64.to_le_bytes().to_vec()));

    assert!(variant.send_chunk(&mut ctx));
    assert_eq!(ctx.sent, 4096);
    // Window is one chunk; the next attempt pauses instead of sending.
    assert!(variant.send_chunk(&mut ctx));
    assert_eq!(ctx.sent, 4096);
    assert!(!ctx.running);

    variant.handle_work(&mut ctx, TaskWork::Input(4096u64.to_le_bytes().to_vec()));
    assert!(variant.send_chunk(&mut ctx));
    assert_eq!(ctx.sent, 8192);
  }

  #[test]
  fn zero_length_tail_finishes() {
    let (_l, mut ctx, mut variant) = harness(Some(vec![1u8; 10]), 4096, 4);
    assert!(variant.open(&mut ctx));
    variant.handle_work(&mut ctx, TaskWork::Input(0u64.to_le_bytes().to_vec()));

    assert!(variant.send_chunk(&mut ctx));
    assert_eq!(ctx.sent, 10);
    assert!(!variant.send_chunk(&mut ctx), "empty chunk terminates with Finished");
  }
}
