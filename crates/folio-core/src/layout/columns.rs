//! Column detection and reading-order reflow
//!
//! A page is two-column when enough runs sit clearly left of the page center
//! and enough sit clearly right of it. Such pages are reflowed: each column
//! is read top to bottom, and full-width elements (titles, figures spanning
//! the gutter) are emitted once the column content above them is consumed.

use std::cmp::Ordering;
use std::collections::VecDeque;

use super::{LayoutSettings, PageLayout, TextRun};

/// Vertical slack when deciding whether column content lies above a spanning run
const SPANNING_Y_TOLERANCE: f32 = 10.0;

/// Which part of a two-column page a run belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSlot {
    Left,
    Right,
    Spanning,
}

/// True if the page's runs split across both halves of the page
pub fn is_multi_column(runs: &[TextRun], page_width: f32, settings: &LayoutSettings) -> bool {
    if runs.len() < settings.column_min_runs || page_width <= 0.0 {
        return false;
    }
    let center = page_width / 2.0;
    let left = runs
        .iter()
        .filter(|r| r.bbox.center_x() < center - settings.column_margin)
        .count();
    let right = runs
        .iter()
        .filter(|r| r.bbox.center_x() > center + settings.column_margin)
        .count();

    let total = runs.len() as f32;
    left as f32 / total > settings.column_min_ratio && right as f32 / total > settings.column_min_ratio
}

/// Assign a run of a multi-column page to a slot
pub fn slot_for(run: &TextRun, page_width: f32, settings: &LayoutSettings) -> ColumnSlot {
    let center = page_width / 2.0;
    let bbox = &run.bbox;
    if bbox.width() > page_width * settings.spanning_width_ratio
        || (bbox.x0 < center - settings.column_margin && bbox.x1 > center + settings.column_margin)
    {
        ColumnSlot::Spanning
    } else if bbox.center_x() < center - settings.column_margin {
        ColumnSlot::Left
    } else if bbox.center_x() > center + settings.column_margin {
        ColumnSlot::Right
    } else if bbox.x0 < center {
        ColumnSlot::Left
    } else {
        ColumnSlot::Right
    }
}

fn top_to_bottom(a: &TextRun, b: &TextRun) -> Ordering {
    a.bbox
        .y0
        .partial_cmp(&b.bbox.y0)
        .unwrap_or(Ordering::Equal)
        .then(a.bbox.x0.partial_cmp(&b.bbox.x0).unwrap_or(Ordering::Equal))
}

/// Reorder a page's runs into reading order
pub fn reflow_page(page: &mut PageLayout, settings: &LayoutSettings) {
    if !is_multi_column(&page.runs, page.width, settings) {
        page.runs.sort_by(top_to_bottom);
        return;
    }

    let mut left = Vec::new();
    let mut right = Vec::new();
    let mut spanning = Vec::new();
    for run in page.runs.drain(..) {
        match slot_for(&run, page.width, settings) {
            ColumnSlot::Left => left.push(run),
            ColumnSlot::Right => right.push(run),
            ColumnSlot::Spanning => spanning.push(run),
        }
    }
    left.sort_by(top_to_bottom);
    right.sort_by(top_to_bottom);
    spanning.sort_by(top_to_bottom);

    let mut left: VecDeque<TextRun> = left.into();
    let mut right: VecDeque<TextRun> = right.into();
    let mut ordered = Vec::with_capacity(left.len() + right.len() + spanning.len());

    for span in spanning {
        let limit = span.bbox.y0 - SPANNING_Y_TOLERANCE;
        while left.front().is_some_and(|r| r.bbox.y0 < limit) {
            ordered.extend(left.pop_front());
        }
        while right.front().is_some_and(|r| r.bbox.y0 < limit) {
            ordered.extend(right.pop_front());
        }
        ordered.push(span);
    }
    ordered.extend(left);
    ordered.extend(right);

    page.runs = ordered;
}
