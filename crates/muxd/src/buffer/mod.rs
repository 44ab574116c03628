//! Scrollback storage: a power-of-two ring of rows plus the region index.
//!
//! Rows are addressed by absolute index. `origin` is the absolute index of
//! the first retained row (everything below it has been discarded), `size`
//! is the number of rows currently present, and capacity is `1 << caporder`.

pub mod region;
pub mod update;

use std::collections::VecDeque;

use log::debug;

pub use region::{Region, RegionId, RegionKind, RegionStore};

/// Row content flags.
pub const ROW_CONTINUATION: u32 = 1 << 0;
pub const ROW_WRAPPED: u32 = 1 << 1;

/// One styled span of cells within a row.
///
/// Ranges in a row are ordered and non-overlapping:
/// `start <= end < next.start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
  pub start: u32,
  pub end: u32,
  pub flags: u32,
  pub fg: u32,
  pub bg: u32,
  pub link: u32,
}

/// One scrollback row: UTF-8 text plus its styled ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
  pub text: String,
  pub flags: u32,
  pub ranges: Vec<CellRange>,
  /// Cleared when the client must refetch (capacity changes).
  pub downloaded: bool,
}

impl Row {
  #[must_use]
  pub fn new(text: String) -> Self {
    Self { text, ..Self::default() }
  }
}

/// Validates the range invariant for an incoming row.
#[must_use]
pub fn ranges_are_ordered(ranges: &[CellRange]) -> bool {
  let mut prev_end: Option<u32> = None;
  for r in ranges {
    if r.start > r.end {
      return false;
    }
    if let Some(end) = prev_end
      && r.start <= end
    {
      return false;
    }
    prev_end = Some(r.end);
  }
  true
}

/// Errors from row installation.
#[derive(Debug, PartialEq, Eq)]
pub enum RowError {
  BadUtf8,
  BadRanges,
  OutOfWindow,
}

/// The scrollback ring for one buffer (primary or alternate).
pub struct Scrollback {
  caporder: u8,
  rows: VecDeque<Row>,
  origin: u64,
  /// Monotonic counter bumped on every modification; dependent caches
  /// compare their stored value against this.
  region_state: u64,
  selection: Option<(u64, u64)>,
  regions: RegionStore,
}

impl Scrollback {
  #[must_use]
  pub fn new(caporder: u8) -> Self {
    Self {
      caporder,
      rows: VecDeque::new(),
      origin: 0,
      region_state: 0,
      selection: None,
      regions: RegionStore::new(),
    }
  }

  #[must_use]
  pub fn caporder(&self) -> u8 {
    self.caporder
  }

  #[must_use]
  pub fn capacity(&self) -> u64 {
    1u64 << self.caporder
  }

  /// Absolute index of the first retained row.
  #[must_use]
  pub fn origin(&self) -> u64 {
    self.origin
  }

  /// Number of rows present.
  #[must_use]
  pub fn size(&self) -> u64 {
    self.rows.len() as u64
  }

  /// Absolute index one past the last row.
  #[must_use]
  pub fn end(&self) -> u64 {
    self.origin + self.size()
  }

  #[must_use]
  pub fn region_state(&self) -> u64 {
    self.region_state
  }

  #[must_use]
  pub fn regions(&self) -> &RegionStore {
    &self.regions
  }

  #[must_use]
  pub fn regions_mut(&mut self) -> &mut RegionStore {
    self.region_state += 1;
    &mut self.regions
  }

  #[must_use]
  pub fn selection(&self) -> Option<(u64, u64)> {
    self.selection
  }

  pub fn set_selection(&mut self, start_row: u64, end_row: u64) {
    self.selection = Some((start_row.min(end_row), start_row.max(end_row)));
  }

  pub fn clear_selection(&mut self) {
    self.selection = None;
  }

  #[must_use]
  pub fn row(&self, index: u64) -> Option<&Row> {
    if index < self.origin {
      return None;
    }
    self.rows.get((index - self.origin) as usize)
  }

  /// Installs a row at an absolute index. Appending one past the end grows
  /// the buffer (evicting at the low end if at capacity). Rows arriving from
  /// the wire (`pushed`) are validated: UTF-8 text and strictly ordered
  /// ranges.
  pub fn set_row(&mut self, index: u64, row: Row, pushed: bool) -> Result<(), RowError> {
    if pushed {
      if std::str::from_utf8(row.text.as_bytes()).is_err() {
        return Err(RowError::BadUtf8);
      }
      if !ranges_are_ordered(&row.ranges) {
        return Err(RowError::BadRanges);
      }
    }
    debug_assert!(ranges_are_ordered(&row.ranges));

    if index < self.origin || index > self.end() {
      return Err(RowError::OutOfWindow);
    }

    if index == self.end() {
      self.change_length(self.size() + 1);
    } else if let Some((sel_start, sel_end)) = self.selection
      && index >= sel_start
      && index <= sel_end
    {
      // Overwriting a selected row invalidates the selection.
      self.selection = None;
    }

    let slot = (index - self.origin) as usize;
    self.rows[slot] = row;
    self.region_state += 1;
    Ok(())
  }

  /// Appends a row at the end of the buffer.
  pub fn push_row(&mut self, row: Row) {
    let index = self.end();
    // Only locally produced rows come through here; invariants hold.
    let _ = self.set_row(index, row, false);
  }

  /// Grows or shrinks the buffer to hold `n` rows. Growing past capacity
  /// slides `origin` forward, evicting rows at the low end and deleting any
  /// region that falls entirely below the new origin. Shrinking drops the
  /// selection if it refers past the new end.
  pub fn change_length(&mut self, n: u64) {
    let current = self.size();
    self.region_state += 1;

    if n >= current {
      let mut grow = n - current;
      if current + grow > self.capacity() {
        let evict = current + grow - self.capacity();
        let keep_evict = evict.min(current);
        for _ in 0..keep_evict {
          self.rows.pop_front();
        }
        self.origin += evict;
        grow -= evict - keep_evict;
        self.regions.delete_below(self.origin);
        if let Some((_, sel_end)) = self.selection
          && sel_end < self.origin
        {
          self.selection = None;
        }
        debug!("scrollback: evicted {evict} rows, origin now {}", self.origin);
      }
      for _ in 0..grow {
        self.rows.push_back(Row::default());
      }
    } else {
      for _ in 0..(current - n) {
        self.rows.pop_back();
      }
      let end = self.end();
      if let Some((sel_start, sel_end)) = self.selection
        && (sel_start >= end || sel_end >= end)
      {
        self.selection = None;
      }
    }
  }

  /// Changes the ring capacity. The retained rows are re-laid-out as if
  /// freshly written, all regions are discarded, and every row is marked
  /// not downloaded since the client must refetch. Applying the same
  /// caporder twice is identical to applying it once.
  pub fn change_capacity(&mut self, caporder: u8) {
    self.caporder = caporder;
    let capacity = self.capacity();

    while self.size() > capacity {
      self.rows.pop_front();
      self.origin += 1;
    }

    for row in &mut self.rows {
      row.downloaded = false;
    }
    self.regions.clear();
    self.selection = None;
    self.region_state += 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn text_row(s: &str) -> Row {
    Row::new(s.to_string())
  }

  #[test]
  fn append_grows_until_capacity_then_evicts() {
    let mut sb = Scrollback::new(4);
    for i in 0..20 {
      sb.push_row(text_row(&format!("row {i}")));
    }
    assert_eq!(sb.origin(), 4);
    assert_eq!(sb.size(), 16);
    assert_eq!(sb.end(), 20);
    assert!(sb.row(3).is_none());
    assert_eq!(sb.row(4).unwrap().text, "row 4");
    assert_eq!(sb.row(19).unwrap().text, "row 19");
  }

  #[test]
  fn eviction_deletes_regions_below_origin() {
    let mut sb = Scrollback::new(4);
    for i in 0..16 {
      sb.push_row(text_row(&format!("row {i}")));
    }
    let low = sb.regions_mut().insert(RegionKind::Output, 0, 0, 2, 0, Default::default()).unwrap();
    let high = sb.regions_mut().insert(RegionKind::Output, 10, 0, 12, 0, Default::default()).unwrap();

    for i in 16..20 {
      sb.push_row(text_row(&format!("row {i}")));
    }
    assert_eq!(sb.origin(), 4);
    assert!(sb.regions().get(low).is_none());
    assert!(sb.regions().get(high).is_some());
    assert!(sb.regions().check_consistency());
  }

  #[test]
  fn pushed_rows_are_validated() {
    let mut sb = Scrollback::new(4);
    sb.push_row(text_row("ok"));

    let mut bad = text_row("x");
    bad.ranges = vec![
      CellRange { start: 5, end: 9, flags: 0, fg: 0, bg: 0, link: 0 },
      CellRange { start: 9, end: 12, flags: 0, fg: 0, bg: 0, link: 0 },
    ];
    assert_eq!(sb.set_row(0, bad, true), Err(RowError::BadRanges));

    let mut reversed = text_row("x");
    reversed.ranges = vec![CellRange { start: 9, end: 5, flags: 0, fg: 0, bg: 0, link: 0 }];
    assert_eq!(sb.set_row(0, reversed, true), Err(RowError::BadRanges));
  }

  #[test]
  fn overwriting_selected_row_clears_selection() {
    let mut sb = Scrollback::new(4);
    for i in 0..8 {
      sb.push_row(text_row(&format!("row {i}")));
    }
    sb.set_selection(2, 4);
    sb.set_row(3, text_row("overwritten"), false).unwrap();
    assert_eq!(sb.selection(), None);

    sb.set_selection(2, 4);
    sb.set_row(6, text_row("elsewhere"), false).unwrap();
    assert_eq!(sb.selection(), Some((2, 4)));
  }

  #[test]
  fn shrink_drops_selection_past_end() {
    let mut sb = Scrollback::new(4);
    for i in 0..10 {
      sb.push_row(text_row(&format!("row {i}")));
    }
    sb.set_selection(8, 9);
    sb.change_length(5);
    assert_eq!(sb.selection(), None);
    assert_eq!(sb.size(), 5);
  }

  #[test]
  fn change_capacity_is_idempotent() {
    let mut sb = Scrollback::new(5);
    for i in 0..30 {
      sb.push_row(text_row(&format!("row {i}")));
    }
    let _ = sb.regions_mut().insert(RegionKind::Command, 10, 0, 12, 0, Default::default());

    sb.change_capacity(3);
    let origin = sb.origin();
    let size = sb.size();
    let rows: Vec<String> = (origin..sb.end()).map(|i| sb.row(i).unwrap().text.clone()).collect();
    assert!(sb.regions().check_consistency());
    assert_eq!(sb.regions().len(), 0);

    sb.change_capacity(3);
    assert_eq!(sb.origin(), origin);
    assert_eq!(sb.size(), size);
    let rows2: Vec<String> = (origin..sb.end()).map(|i| sb.row(i).unwrap().text.clone()).collect();
    assert_eq!(rows, rows2);
  }

  #[test]
  fn change_capacity_marks_rows_for_refetch() {
    let mut sb = Scrollback::new(4);
    sb.push_row(text_row("a"));
    {
      let origin = sb.origin();
      let mut row = sb.row(origin).unwrap().clone();
      row.downloaded = true;
      sb.set_row(origin, row, false).unwrap();
    }
    sb.change_capacity(4);
    assert!(!sb.row(sb.origin()).unwrap().downloaded);
  }

  #[test]
  fn region_state_bumps_on_modification() {
    let mut sb = Scrollback::new(4);
    let before = sb.region_state();
    sb.push_row(text_row("a"));
    assert!(sb.region_state() > before);
  }
}
