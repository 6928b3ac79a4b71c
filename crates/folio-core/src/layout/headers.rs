//! Running header and footer suppression
//!
//! Text in the top or bottom band of a page that repeats across a large share
//! of the document's pages is page furniture, not content. Band runs are
//! grouped into lines first so a header drawn as several runs still matches.
//! Digits are masked before comparison so "Page 3" and "Page 4" count as the
//! same footer.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::{LayoutSettings, PageLayout, MIN_RECURRING_TEXT_LEN};

/// Runs whose bottoms differ by at most this much share a band line
const BASELINE_TOLERANCE: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Header,
    Footer,
}

struct BandLine {
    key: String,
    runs: Vec<usize>,
}

fn band_of(y0: f32, y1: f32, height: f32, settings: &LayoutSettings) -> Option<Band> {
    if height <= 0.0 {
        return None;
    }
    if y0 / height < settings.header_band_ratio {
        Some(Band::Header)
    } else if y1 / height > settings.footer_band_ratio {
        Some(Band::Footer)
    } else {
        None
    }
}

/// Comparison key for band text: lowercase, whitespace collapsed, digits masked
pub fn normalize_band_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_digits = false;
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for ch in word.chars() {
            if ch.is_ascii_digit() {
                if !in_digits {
                    out.push('#');
                }
                in_digits = true;
            } else {
                in_digits = false;
                out.extend(ch.to_lowercase());
            }
        }
        in_digits = false;
    }
    out
}

fn band_lines(page: &PageLayout, settings: &LayoutSettings) -> Vec<BandLine> {
    let mut candidates: Vec<(usize, Band)> = page
        .runs
        .iter()
        .enumerate()
        .filter_map(|(i, r)| band_of(r.bbox.y0, r.bbox.y1, page.height, settings).map(|b| (i, b)))
        .collect();
    candidates.sort_by(|(a, _), (b, _)| {
        let (ra, rb) = (&page.runs[*a], &page.runs[*b]);
        ra.bbox
            .y1
            .partial_cmp(&rb.bbox.y1)
            .unwrap_or(Ordering::Equal)
            .then(ra.bbox.x0.partial_cmp(&rb.bbox.x0).unwrap_or(Ordering::Equal))
    });

    let mut groups: Vec<(Band, f32, Vec<usize>)> = Vec::new();
    for (idx, band) in candidates {
        let y1 = page.runs[idx].bbox.y1;
        match groups.last_mut() {
            Some((b, baseline, members)) if *b == band && (y1 - *baseline).abs() <= BASELINE_TOLERANCE => {
                members.push(idx);
            }
            _ => groups.push((band, y1, vec![idx])),
        }
    }

    groups
        .into_iter()
        .map(|(_, _, mut runs)| {
            runs.sort_by(|a, b| {
                page.runs[*a]
                    .bbox
                    .x0
                    .partial_cmp(&page.runs[*b].bbox.x0)
                    .unwrap_or(Ordering::Equal)
            });
            let text = runs
                .iter()
                .map(|i| page.runs[*i].text.trim())
                .collect::<Vec<_>>()
                .join(" ");
            BandLine {
                key: normalize_band_text(&text),
                runs,
            }
        })
        .collect()
}

/// Remove recurring band text from every page; returns the number of runs removed
pub fn strip_recurring(pages: &mut [PageLayout], settings: &LayoutSettings) -> usize {
    if pages.len() < 2 {
        return 0;
    }

    let lines: Vec<Vec<BandLine>> = pages.iter().map(|p| band_lines(p, settings)).collect();

    let mut page_counts: HashMap<&str, usize> = HashMap::new();
    for page_lines in &lines {
        let distinct: HashSet<&str> = page_lines
            .iter()
            .map(|l| l.key.as_str())
            .filter(|k| k.chars().count() > MIN_RECURRING_TEXT_LEN)
            .collect();
        for key in distinct {
            *page_counts.entry(key).or_default() += 1;
        }
    }

    let threshold = ((pages.len() as f32 * settings.recurrence_ratio).floor() as usize).max(2);
    let recurring: HashSet<String> = page_counts
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(key, _)| key.to_string())
        .collect();
    if recurring.is_empty() {
        return 0;
    }

    let mut removed = 0;
    for (page, page_lines) in pages.iter_mut().zip(lines) {
        let doomed: HashSet<usize> = page_lines
            .into_iter()
            .filter(|l| recurring.contains(&l.key))
            .flat_map(|l| l.runs)
            .collect();
        if doomed.is_empty() {
            continue;
        }
        removed += doomed.len();
        let mut i = 0;
        page.runs.retain(|_| {
            let keep = !doomed.contains(&i);
            i += 1;
            keep
        });
    }
    removed
}
