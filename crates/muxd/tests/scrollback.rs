//! Scrollback eviction and region index consistency, end to end through
//! the public buffer API.

use muxd::buffer::{RegionKind, Row, Scrollback};

#[test]
fn eviction_scenario_matches_contract() {
  // caporder 4: capacity 16. Push 20 rows.
  let mut sb = Scrollback::new(4);
  for i in 0..16 {
    sb.push_row(Row::new(format!("row {i}")));
  }
  let early = sb
    .regions_mut()
    .insert(RegionKind::Command, 0, 0, 3, 0, Default::default())
    .unwrap();
  let late = sb
    .regions_mut()
    .insert(RegionKind::Output, 12, 0, 15, 0, Default::default())
    .unwrap();

  for i in 16..20 {
    sb.push_row(Row::new(format!("row {i}")));
  }

  assert_eq!(sb.origin(), 4);
  assert_eq!(sb.size(), 16);

  // The region ending before row 4 is gone from all three indices.
  assert!(sb.regions().get(early).is_none());
  assert_eq!(sb.regions().first_at_or_after(0).unwrap().id, late);
  assert_eq!(sb.regions().containing_row(2).count(), 0);
  assert!(sb.regions().check_consistency());
}

#[test]
fn capacity_change_is_idempotent_and_resets_download_state() {
  let mut sb = Scrollback::new(6);
  for i in 0..40 {
    sb.push_row(Row::new(format!("line {i}")));
  }
  let _ = sb.regions_mut().insert(RegionKind::Prompt, 5, 0, 5, 10, Default::default());

  sb.change_capacity(4);
  let first = (sb.origin(), sb.size(), sb.region_state());
  assert_eq!(sb.size(), 16);
  assert!(sb.regions().is_empty(), "capacity change discards regions");

  sb.change_capacity(4);
  assert_eq!((sb.origin(), sb.size()), (first.0, first.1));
  assert!(sb.regions().check_consistency());
}

#[test]
fn row_ranges_keep_their_ordering_invariant() {
  let mut sb = Scrollback::new(4);
  let mut row = Row::new("styled".to_string());
  row.ranges = vec![
    muxd::buffer::CellRange { start: 0, end: 2, flags: 1, fg: 3, bg: 0, link: 0 },
    muxd::buffer::CellRange { start: 4, end: 5, flags: 0, fg: 0, bg: 2, link: 0 },
  ];
  sb.push_row(row);

  let stored = sb.row(0).unwrap();
  let mut prev_end = None;
  for range in &stored.ranges {
    assert!(range.start <= range.end);
    if let Some(prev) = prev_end {
      assert!(range.start > prev);
    }
    prev_end = Some(range.end);
  }
}
