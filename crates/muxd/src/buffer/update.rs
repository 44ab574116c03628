//! Post-update region maintenance.
//!
//! After a batch of row changes, `end_update` rescans the affected window for
//! text links (URLs in row text) and OSC-8 hyperlinks (cell ranges carrying a
//! link id), replacing the Link regions there. The window extends past the
//! changed rows across Continuation-flagged boundaries, bounded by
//! `MAX_CONTINUATION` on either side.

use std::sync::OnceLock;

use regex::Regex;

use super::{ROW_CONTINUATION, RegionKind, Scrollback};
use crate::proto::attrs::AttributeMap;

/// Maximum rows the update window extends across continuation boundaries.
pub const MAX_CONTINUATION: u64 = 4;

pub const ATTR_REGION_URI: &str = "region.uri";

fn url_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| {
    Regex::new(r#"(?:https?|ftp|file)://[^\s<>"']+"#).expect("static pattern")
  })
}

/// Extends `[start, end]` across continuation rows, clamped to the buffer.
fn extend_window(sb: &Scrollback, mut start: u64, mut end: u64) -> (u64, u64) {
  let mut remaining = MAX_CONTINUATION;
  while remaining > 0
    && start > sb.origin()
    && sb.row(start).is_some_and(|r| r.flags & ROW_CONTINUATION != 0)
  {
    start -= 1;
    remaining -= 1;
  }
  remaining = MAX_CONTINUATION;
  while remaining > 0
    && end + 1 < sb.end()
    && sb.row(end + 1).is_some_and(|r| r.flags & ROW_CONTINUATION != 0)
  {
    end += 1;
    remaining -= 1;
  }
  (start, end)
}

/// Recomputes link regions within the update window. Returns whether the
/// region set changed, so the caller can notify subscribers.
pub fn end_update(sb: &mut Scrollback, changed_start: u64, changed_end: u64) -> bool {
  if sb.size() == 0 || changed_start > changed_end {
    return false;
  }
  let start = changed_start.max(sb.origin());
  let end = changed_end.min(sb.end().saturating_sub(1));
  if start > end {
    return false;
  }
  let (start, end) = extend_window(sb, start, end);

  let before = sb.regions().len();
  let had_links = sb.regions().in_range(start, end).any(|r| r.kind == RegionKind::Link);
  sb.regions_mut().delete_kind_in(RegionKind::Link, start, end);

  let mut found = Vec::new();
  for index in start..=end {
    let Some(row) = sb.row(index) else { continue };

    // Text links in the row content.
    for m in url_pattern().find_iter(&row.text) {
      let start_col = row.text[..m.start()].chars().count() as u32;
      let end_col = row.text[..m.end()].chars().count() as u32;
      let mut attributes = AttributeMap::new();
      attributes.insert(ATTR_REGION_URI.to_string(), m.as_str().to_string());
      found.push((index, start_col, index, end_col, attributes));
    }

    // OSC-8 links carried as cell ranges.
    for range in row.ranges.iter().filter(|r| r.link != 0) {
      let mut attributes = AttributeMap::new();
      attributes.insert("region.link-id".to_string(), range.link.to_string());
      found.push((index, range.start, index, range.end, attributes));
    }
  }

  let created = !found.is_empty();
  for (start_row, start_col, end_row, end_col, attributes) in found {
    let _ = sb.regions_mut().insert(RegionKind::Link, start_row, start_col, end_row, end_col, attributes);
  }

  had_links || created || sb.regions().len() != before
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{CellRange, Row};

  fn push_text(sb: &mut Scrollback, text: &str) {
    sb.push_row(Row::new(text.to_string()));
  }

  #[test]
  fn urls_in_changed_rows_become_link_regions() {
    let mut sb = Scrollback::new(6);
    push_text(&mut sb, "see https://example.com/docs for details");
    push_text(&mut sb, "nothing here");

    assert!(end_update(&mut sb, 0, 1));
    let links: Vec<_> = sb.regions().in_range(0, 1).filter(|r| r.kind == RegionKind::Link).collect();
    assert_eq!(links.len(), 1);
    assert_eq!(
      links[0].attributes.get(ATTR_REGION_URI).map(String::as_str),
      Some("https://example.com/docs")
    );
    assert_eq!(links[0].start_col, 4);
  }

  #[test]
  fn rescan_replaces_stale_links() {
    let mut sb = Scrollback::new(6);
    push_text(&mut sb, "old http://old.example link");
    assert!(end_update(&mut sb, 0, 0));

    sb.set_row(0, Row::new("no links anymore".to_string()), false).unwrap();
    assert!(end_update(&mut sb, 0, 0));
    assert_eq!(sb.regions().in_range(0, 0).filter(|r| r.kind == RegionKind::Link).count(), 0);

    // A second pass with nothing to do reports no change.
    assert!(!end_update(&mut sb, 0, 0));
  }

  #[test]
  fn window_extends_across_continuation_rows() {
    let mut sb = Scrollback::new(6);
    push_text(&mut sb, "wrapped https://exam");
    let mut cont = Row::new("ple.com/tail and more".to_string());
    cont.flags = ROW_CONTINUATION;
    sb.push_row(cont);

    // Only row 1 changed, but the window reaches back to row 0.
    assert!(end_update(&mut sb, 1, 1));
    assert!(sb.regions().in_range(0, 0).any(|r| r.kind == RegionKind::Link));
  }

  #[test]
  fn osc8_ranges_become_link_regions() {
    let mut sb = Scrollback::new(6);
    let mut row = Row::new("click here".to_string());
    row.ranges = vec![CellRange { start: 6, end: 9, flags: 0, fg: 0, bg: 0, link: 7 }];
    sb.push_row(row);

    assert!(end_update(&mut sb, 0, 0));
    let link = sb
      .regions()
      .in_range(0, 0)
      .find(|r| r.kind == RegionKind::Link)
      .expect("link region");
    assert_eq!(link.attributes.get("region.link-id").map(String::as_str), Some("7"));
  }
}
