//! Default emulator backed by a `vt100` parser.
//!
//! The parser maintains the virtual screen; after each transaction the
//! visible rows are synced into the active scrollback at their absolute
//! positions (history length + screen row). Styled cells become cell ranges
//! so downstream consumers see the same invariants as wire-pushed rows.

use crate::buffer::{CellRange, Row, Scrollback};
use crate::proto::attrs::ATTR_SESSION_TITLE;

use super::{
  Emulator, EmulatorReport, RESET_CLEAR_SCROLLBACK, TermBuffers, TermSize,
};

const CELL_BOLD: u32 = 1 << 0;
const CELL_ITALIC: u32 = 1 << 1;
const CELL_UNDERLINE: u32 = 1 << 2;
const CELL_INVERSE: u32 = 1 << 3;

fn encode_color(color: vt100::Color) -> u32 {
  match color {
    vt100::Color::Default => 0,
    vt100::Color::Idx(i) => 1 + u32::from(i),
    vt100::Color::Rgb(r, g, b) => {
      0x0100_0000 | (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
    }
  }
}

pub struct VtEmulator {
  parser: vt100::Parser,
  size: TermSize,
  flags: u32,
  /// Cached visible rows from the previous sync, for change detection.
  shadow: Vec<String>,
  shadow_base: u64,
  last_title: String,
  last_bells: usize,
  last_cursor: (u16, u16),
  last_alternate: bool,
}

impl VtEmulator {
  #[must_use]
  pub fn new(size: TermSize) -> Self {
    Self {
      parser: vt100::Parser::new(size.rows, size.cols, 100_000),
      size,
      flags: 0,
      shadow: Vec::new(),
      shadow_base: 0,
      last_title: String::new(),
      last_bells: 0,
      last_cursor: (0, 0),
      last_alternate: false,
    }
  }

  /// Rows scrolled off the top into parser history.
  fn history_len(&mut self) -> u64 {
    self.parser.screen_mut().set_scrollback(usize::MAX);
    let len = self.parser.screen().scrollback();
    self.parser.screen_mut().set_scrollback(0);
    len as u64
  }

  fn row_ranges(&self, row: u16) -> Vec<CellRange> {
    let screen = self.parser.screen();
    let mut ranges: Vec<CellRange> = Vec::new();
    let mut current: Option<CellRange> = None;

    for col in 0..self.size.cols {
      let Some(cell) = screen.cell(row, col) else { break };
      let mut flags = 0u32;
      if cell.bold() {
        flags |= CELL_BOLD;
      }
      if cell.italic() {
        flags |= CELL_ITALIC;
      }
      if cell.underline() {
        flags |= CELL_UNDERLINE;
      }
      if cell.inverse() {
        flags |= CELL_INVERSE;
      }
      let fg = encode_color(cell.fgcolor());
      let bg = encode_color(cell.bgcolor());

      if flags == 0 && fg == 0 && bg == 0 {
        if let Some(r) = current.take() {
          ranges.push(r);
        }
        continue;
      }

      let extends = current
        .as_ref()
        .is_some_and(|r| r.flags == flags && r.fg == fg && r.bg == bg && r.end + 1 == u32::from(col));
      if extends {
        current.as_mut().expect("checked above").end += 1;
      } else {
        if let Some(r) = current.take() {
          ranges.push(r);
        }
        current = Some(CellRange { start: col.into(), end: col.into(), flags, fg, bg, link: 0 });
      }
    }
    if let Some(r) = current {
      ranges.push(r);
    }
    ranges
  }

  /// Writes the visible screen into the active buffer, recording which
  /// absolute rows changed since the previous sync.
  fn sync_rows(&mut self, sb: &mut Scrollback, report: &mut EmulatorReport) {
    let base = self.history_len();
    let rows = usize::from(self.size.rows);

    let mut visible = Vec::with_capacity(rows);
    for text in self.parser.screen().rows(0, self.size.cols) {
      visible.push(text);
    }

    let logical_end = base + visible.len() as u64;
    if sb.end() < logical_end {
      sb.change_length(sb.size() + (logical_end - sb.end()));
    }

    for (i, text) in visible.iter().enumerate() {
      let index = base + i as u64;
      let unchanged = self.shadow_base == base
        && self.shadow.get(i).is_some_and(|prev| prev == text);
      if unchanged {
        continue;
      }
      let mut row = Row::new(text.clone());
      row.ranges = self.row_ranges(i as u16);
      if index >= sb.origin() && sb.set_row(index, row, false).is_ok() {
        report.changed_rows.push(index);
      }
    }

    self.shadow = visible;
    self.shadow_base = base;
  }

  fn sync_meta(&mut self, report: &mut EmulatorReport) {
    let screen = self.parser.screen();

    let title = screen.title().to_string();
    if title != self.last_title {
      self.last_title = title.clone();
      report.changed_attributes.insert(ATTR_SESSION_TITLE.to_string(), title);
    }

    let bells = screen.audible_bell_count();
    report.bell_count = bells.saturating_sub(self.last_bells) as u32;
    self.last_bells = bells;

    let cursor = screen.cursor_position();
    if cursor != self.last_cursor {
      self.last_cursor = cursor;
      report.cursor_changed = true;
    }

    let alternate = screen.alternate_screen();
    if alternate != self.last_alternate {
      self.last_alternate = alternate;
      report.buffer_switched = true;
    }
  }
}

impl Emulator for VtEmulator {
  fn term_event(&mut self, buffers: &mut TermBuffers, bytes: &[u8]) -> EmulatorReport {
    let mut report = EmulatorReport::default();
    self.parser.process(bytes);
    self.sync_meta(&mut report);
    if report.buffer_switched {
      buffers.active = usize::from(self.last_alternate);
      // The shadow belongs to the buffer we just left.
      self.shadow.clear();
    }
    self.sync_rows(buffers.active_mut(), &mut report);
    report
  }

  fn term_reset(&mut self, buffers: &mut TermBuffers, bytes: &[u8], flags: u32) -> EmulatorReport {
    let mut report = EmulatorReport::default();

    self.parser = vt100::Parser::new(self.size.rows, self.size.cols, 100_000);
    self.shadow.clear();
    self.shadow_base = 0;
    self.last_cursor = (0, 0);
    self.last_bells = 0;
    self.last_alternate = false;

    if flags & RESET_CLEAR_SCROLLBACK != 0 {
      let sb = buffers.active_mut();
      sb.change_length(0);
      sb.regions_mut().clear();
      report.regions_changed = true;
    }

    if !bytes.is_empty() {
      self.parser.process(bytes);
    }
    self.sync_meta(&mut report);
    self.sync_rows(buffers.active_mut(), &mut report);
    report
  }

  fn term_resize(&mut self, buffers: &mut TermBuffers, size: TermSize) -> EmulatorReport {
    let mut report = EmulatorReport::default();
    if size == self.size {
      return report;
    }
    self.size = size;
    self.parser.screen_mut().set_size(size.rows, size.cols);
    self.shadow.clear();
    report.size_changed = true;
    report
      .changed_attributes
      .insert(crate::proto::attrs::ATTR_SESSION_COLS.to_string(), size.cols.to_string());
    report
      .changed_attributes
      .insert(crate::proto::attrs::ATTR_SESSION_ROWS.to_string(), size.rows.to_string());
    self.sync_rows(buffers.active_mut(), &mut report);
    report
  }

  fn set_flag(&mut self, flag: u32, enabled: bool) -> bool {
    let next = if enabled { self.flags | flag } else { self.flags & !flag };
    let changed = next != self.flags;
    self.flags = next;
    changed
  }

  fn flags(&self) -> u32 {
    self.flags
  }

  fn size(&self) -> TermSize {
    self.size
  }

  fn snapshot(&self) -> Vec<u8> {
    self.parser.screen().contents_formatted()
  }

  fn content(&self, _id: u64) -> Option<Vec<u8>> {
    // Inline image capture is not implemented by this backend.
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn harness(rows: u16, cols: u16) -> (VtEmulator, TermBuffers) {
    (VtEmulator::new(TermSize::new(cols, rows)), TermBuffers::new(10, 6))
  }

  #[test]
  fn plain_output_lands_in_rows() {
    let (mut emu, mut buffers) = harness(4, 20);
    let report = emu.term_event(&mut buffers, b"hello\r\nworld\r\n");

    assert!(report.any());
    assert!(!report.changed_rows.is_empty());
    assert_eq!(buffers.active().row(0).unwrap().text, "hello");
    assert_eq!(buffers.active().row(1).unwrap().text, "world");
  }

  #[test]
  fn unchanged_rows_are_not_reported_twice() {
    let (mut emu, mut buffers) = harness(4, 20);
    emu.term_event(&mut buffers, b"hello\r\n");
    let report = emu.term_event(&mut buffers, b"");
    assert!(report.changed_rows.is_empty());
  }

  #[test]
  fn styled_cells_become_ordered_ranges() {
    let (mut emu, mut buffers) = harness(4, 20);
    emu.term_event(&mut buffers, b"\x1b[1mbold\x1b[0m then \x1b[31mred\x1b[0m\r\n");

    let row = buffers.active().row(0).unwrap();
    assert!(!row.ranges.is_empty());
    assert!(crate::buffer::ranges_are_ordered(&row.ranges));
    assert!(row.ranges[0].flags & CELL_BOLD != 0);
  }

  #[test]
  fn title_change_reports_attribute() {
    let (mut emu, mut buffers) = harness(4, 20);
    let report = emu.term_event(&mut buffers, b"\x1b]2;my title\x07");
    assert_eq!(
      report.changed_attributes.get(ATTR_SESSION_TITLE).map(String::as_str),
      Some("my title")
    );
  }

  #[test]
  fn bell_is_counted_once() {
    let (mut emu, mut buffers) = harness(4, 20);
    let report = emu.term_event(&mut buffers, b"\x07");
    assert_eq!(report.bell_count, 1);
    let report = emu.term_event(&mut buffers, b"quiet");
    assert_eq!(report.bell_count, 0);
  }

  #[test]
  fn alternate_screen_switches_active_buffer() {
    let (mut emu, mut buffers) = harness(4, 20);
    emu.term_event(&mut buffers, b"main\r\n");
    let report = emu.term_event(&mut buffers, b"\x1b[?1049halt screen");
    assert!(report.buffer_switched);
    assert_eq!(buffers.active, 1);

    let report = emu.term_event(&mut buffers, b"\x1b[?1049l");
    assert!(report.buffer_switched);
    assert_eq!(buffers.active, 0);
  }

  #[test]
  fn flags_report_change_once() {
    let (mut emu, _) = harness(4, 20);
    assert!(emu.set_flag(super::super::EMU_RATELIMITED, true));
    assert!(!emu.set_flag(super::super::EMU_RATELIMITED, true));
    assert!(emu.set_flag(super::super::EMU_RATELIMITED, false));
  }

  #[test]
  fn reset_clears_scrollback_when_asked() {
    let (mut emu, mut buffers) = harness(4, 20);
    emu.term_event(&mut buffers, b"one\r\ntwo\r\nthree\r\n");
    let report = emu.term_reset(&mut buffers, b"restarting\r\n", RESET_CLEAR_SCROLLBACK);
    assert!(report.regions_changed);
    assert_eq!(buffers.active().row(buffers.active().origin()).unwrap().text.trim_end(), "restarting");
  }
}
