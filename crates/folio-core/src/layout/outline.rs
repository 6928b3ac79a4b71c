//! Document outline (bookmarks) reading
//!
//! Walks `/Root /Outlines` depth-first. Each item's destination is either an
//! explicit array whose first element is the target page, a `/GoTo` action
//! carrying such an array, or a name resolved through the catalog `/Dests`
//! dictionary. Items whose page cannot be resolved are skipped.

use std::collections::{HashMap, HashSet};

use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::debug;

use super::pdf::{decode_pdf_string, resolve};
use super::OutlineEntry;

/// Upper bound on visited outline items
const MAX_OUTLINE_ITEMS: usize = 10_000;

/// Deepest nesting followed
const MAX_OUTLINE_DEPTH: usize = 16;

struct OutlineWalker<'a> {
    doc: &'a Document,
    catalog: &'a Dictionary,
    page_numbers: HashMap<ObjectId, usize>,
    visited: HashSet<ObjectId>,
    entries: Vec<OutlineEntry>,
}

/// Read the outline as (level, title, one-based page) entries
pub fn read_outline(doc: &Document) -> Vec<OutlineEntry> {
    let Some(catalog) = doc
        .trailer
        .get(b"Root")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
    else {
        return Vec::new();
    };

    let Some(first) = catalog
        .get(b"Outlines")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
        .and_then(|d| d.get(b"First").ok())
        .and_then(|o| o.as_reference().ok())
    else {
        return Vec::new();
    };

    let page_numbers = doc
        .get_pages()
        .into_iter()
        .map(|(number, id)| (id, number as usize))
        .collect();

    let mut walker = OutlineWalker {
        doc,
        catalog,
        page_numbers,
        visited: HashSet::new(),
        entries: Vec::new(),
    };
    walker.walk(first, 1);

    if !walker.entries.is_empty() {
        debug!("Read {} outline entries", walker.entries.len());
    }
    walker.entries
}

impl OutlineWalker<'_> {
    fn walk(&mut self, first: ObjectId, level: usize) {
        if level > MAX_OUTLINE_DEPTH {
            return;
        }
        let mut next = Some(first);
        while let Some(id) = next {
            if self.visited.len() >= MAX_OUTLINE_ITEMS || !self.visited.insert(id) {
                return;
            }
            let Ok(item) = self.doc.get_dictionary(id) else {
                return;
            };

            let title = match item.get(b"Title").ok().map(|o| resolve(self.doc, o)) {
                Some(Object::String(bytes, _)) => decode_pdf_string(bytes).trim().to_string(),
                _ => String::new(),
            };
            if let Some(page) = self.destination_page(item) {
                if !title.is_empty() {
                    self.entries.push(OutlineEntry { level, title, page });
                }
            }

            if let Some(child) = item.get(b"First").ok().and_then(|o| o.as_reference().ok()) {
                self.walk(child, level + 1);
            }
            next = item.get(b"Next").ok().and_then(|o| o.as_reference().ok());
        }
    }

    fn destination_page(&self, item: &Dictionary) -> Option<usize> {
        if let Ok(dest) = item.get(b"Dest") {
            return self.resolve_destination(resolve(self.doc, dest));
        }
        let action = item
            .get(b"A")
            .ok()
            .map(|o| resolve(self.doc, o))
            .and_then(|o| o.as_dict().ok())?;
        let dest = action.get(b"D").ok()?;
        self.resolve_destination(resolve(self.doc, dest))
    }

    fn resolve_destination(&self, dest: &Object) -> Option<usize> {
        match dest {
            Object::Array(items) => match items.first()? {
                Object::Reference(page_id) => self.page_numbers.get(page_id).copied(),
                // Remote-style destinations carry a zero-based page index
                Object::Integer(index) => usize::try_from(*index).ok().map(|i| i + 1),
                _ => None,
            },
            Object::Name(name) | Object::String(name, _) => {
                let dests = self
                    .catalog
                    .get(b"Dests")
                    .ok()
                    .map(|o| resolve(self.doc, o))
                    .and_then(|o| o.as_dict().ok())?;
                let target = resolve(self.doc, dests.get(name).ok()?);
                match target {
                    Object::Dictionary(d) => {
                        self.resolve_destination(resolve(self.doc, d.get(b"D").ok()?))
                    }
                    Object::Array(_) => self.resolve_destination(target),
                    _ => None,
                }
            }
            Object::Dictionary(d) => self.resolve_destination(resolve(self.doc, d.get(b"D").ok()?)),
            _ => None,
        }
    }
}
