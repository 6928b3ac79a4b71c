//! Structured extraction of positioned text runs from PDF content streams
//!
//! Walks each page's content stream with a simplified text-rendering state
//! machine:
//!
//! | Operator        | Action                                   |
//! |-----------------|------------------------------------------|
//! | `q` / `Q`       | Push / pop graphics state (CTM)          |
//! | `cm`            | Concatenate the CTM                      |
//! | `BT`            | Begin text object, reset matrices        |
//! | `Tf`            | Set font and size                        |
//! | `Tm`            | Set text matrix                          |
//! | `Td` `TD` `T*`  | Move text position                       |
//! | `TL` `Tc` `Tw` `Tz` `Ts` | Leading, spacing, scaling, rise |
//! | `Tj` `TJ` `'` `"` | Show text                              |
//!
//! Glyph widths come from the font's `/Widths` array when present, otherwise
//! they are approximated from the font size.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::{debug, warn};

use super::cmap::{utf16_be, ToUnicodeMap};
use super::{
    outline, BBox, DocumentMetadata, ExtractedDocument, ExtractionSource, PageLayout, TextRun,
    DEFAULT_PAGE_HEIGHT, DEFAULT_PAGE_WIDTH, FLAG_BOLD, FLAG_ITALIC,
};

/// Average glyph advance as a fraction of the font size
const APPROX_CHAR_WIDTH_RATIO: f32 = 0.5;

/// Share of the font size above the baseline
const ASCENT_RATIO: f32 = 0.8;

/// Limit when walking `/Parent` chains for inherited attributes
const MAX_TREE_DEPTH: usize = 32;

/// 2x3 affine matrix [a, b, c, d, e, f]
type Matrix = [f32; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

fn multiply(m: &Matrix, n: &Matrix) -> Matrix {
    [
        m[0] * n[0] + m[1] * n[2],
        m[0] * n[1] + m[1] * n[3],
        m[2] * n[0] + m[3] * n[2],
        m[2] * n[1] + m[3] * n[3],
        m[4] * n[0] + m[5] * n[2] + n[4],
        m[4] * n[1] + m[5] * n[3] + n[5],
    ]
}

/// Font resource resolved from a page's `/Resources /Font` dictionary
#[derive(Debug, Clone, Default)]
struct PdfFont {
    base_font: String,
    /// Style flags translated to the run flag convention
    flags: u32,
    to_unicode: Option<ToUnicodeMap>,
    /// Type0 fonts use two-byte codes
    two_byte: bool,
    first_char: u32,
    /// Glyph advances in thousandths of text space
    widths: Vec<f32>,
}

impl PdfFont {
    fn decode(&self, bytes: &[u8]) -> String {
        if let Some(cmap) = &self.to_unicode {
            let decoded = cmap.decode(bytes);
            if !decoded.is_empty() {
                return decoded;
            }
        }
        if self.two_byte {
            return utf16_be(bytes);
        }
        decode_pdf_string(bytes)
    }

    /// Advance for a byte string in text-space units at size 1
    fn advance(&self, bytes: &[u8], char_count: usize) -> f32 {
        if self.widths.is_empty() || self.two_byte {
            return char_count as f32 * APPROX_CHAR_WIDTH_RATIO;
        }
        bytes
            .iter()
            .map(|b| {
                u32::from(*b)
                    .checked_sub(self.first_char)
                    .and_then(|i| self.widths.get(i as usize))
                    .map_or(APPROX_CHAR_WIDTH_RATIO, |w| w / 1000.0)
            })
            .sum()
    }
}

/// Text and graphics state tracked while walking a content stream
#[derive(Debug, Clone)]
struct TextState {
    font_key: Vec<u8>,
    font_size: f32,
    text_matrix: Matrix,
    line_matrix: Matrix,
    ctm: Matrix,
    horiz_scale: f32,
    char_spacing: f32,
    word_spacing: f32,
    text_rise: f32,
    leading: f32,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            font_key: Vec::new(),
            font_size: 0.0,
            text_matrix: IDENTITY,
            line_matrix: IDENTITY,
            ctm: IDENTITY,
            horiz_scale: 1.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            text_rise: 0.0,
            leading: 0.0,
        }
    }
}

impl TextState {
    /// Rendering matrix mapping text space to user space
    fn render_matrix(&self) -> Matrix {
        multiply(&self.text_matrix, &self.ctm)
    }

    fn position(&self) -> (f32, f32) {
        let m = self.render_matrix();
        (
            m[2] * self.text_rise + m[4],
            m[3] * self.text_rise + m[5],
        )
    }

    fn effective_font_size(&self) -> f32 {
        let m = self.render_matrix();
        (self.font_size * (m[2].powi(2) + m[3].powi(2)).sqrt()).abs()
    }

    /// Horizontal scale of the rendering matrix
    fn x_scale(&self) -> f32 {
        let m = self.render_matrix();
        (m[0].powi(2) + m[1].powi(2)).sqrt()
    }

    fn advance_x(&mut self, dx: f32) {
        self.text_matrix[4] += dx * self.text_matrix[0];
        self.text_matrix[5] += dx * self.text_matrix[1];
    }

    fn translate_line(&mut self, tx: f32, ty: f32) {
        let m = self.line_matrix;
        self.line_matrix[4] = m[0] * tx + m[2] * ty + m[4];
        self.line_matrix[5] = m[1] * tx + m[3] * ty + m[5];
        self.text_matrix = self.line_matrix;
    }
}

/// Page geometry in user space
#[derive(Debug, Clone, Copy)]
struct PageBox {
    x0: f32,
    y0: f32,
    width: f32,
    height: f32,
}

/// Load a document and extract runs, outline and metadata
pub fn extract_document(bytes: &[u8]) -> Result<ExtractedDocument> {
    let doc = Document::load_mem(bytes).context("Failed to parse PDF structure")?;
    let pages: BTreeMap<u32, ObjectId> = doc.get_pages();
    if pages.is_empty() {
        anyhow::bail!("PDF has no pages");
    }

    let mut layouts = Vec::with_capacity(pages.len());
    let mut skipped = Vec::new();
    for (index, (_, page_id)) in pages.iter().enumerate() {
        match extract_page(&doc, *page_id, index) {
            Ok(layout) => layouts.push(layout),
            Err(e) => {
                warn!("Skipping page {}: {e:#}", index + 1);
                skipped.push(index);
                let (width, height) = page_size(&doc, *page_id);
                layouts.push(PageLayout::new(index, width, height));
            }
        }
    }

    if skipped.len() == pages.len() {
        anyhow::bail!("Every page failed to decode");
    }

    debug!(
        "Structured extraction: {} pages, {} runs, {} skipped",
        layouts.len(),
        layouts.iter().map(|p| p.runs.len()).sum::<usize>(),
        skipped.len()
    );

    Ok(ExtractedDocument {
        pages: layouts,
        outline: outline::read_outline(&doc),
        metadata: read_metadata(&doc),
        source: ExtractionSource::Structured,
        skipped_pages: skipped,
    })
}

fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let b = page_box(doc, page_id);
    (b.width, b.height)
}

fn page_box(doc: &Document, page_id: ObjectId) -> PageBox {
    let numbers: Vec<f32> = inherited(doc, page_id, b"MediaBox")
        .and_then(|o| o.as_array().ok())
        .map(|arr| arr.iter().filter_map(|o| number(resolve(doc, o))).collect())
        .unwrap_or_default();

    if numbers.len() == 4 && numbers[2] > numbers[0] && numbers[3] > numbers[1] {
        PageBox {
            x0: numbers[0],
            y0: numbers[1],
            width: numbers[2] - numbers[0],
            height: numbers[3] - numbers[1],
        }
    } else {
        PageBox {
            x0: 0.0,
            y0: 0.0,
            width: DEFAULT_PAGE_WIDTH,
            height: DEFAULT_PAGE_HEIGHT,
        }
    }
}

fn extract_page(doc: &Document, page_id: ObjectId, index: usize) -> Result<PageLayout> {
    let bbox = page_box(doc, page_id);
    let fonts = page_fonts(doc, page_id);
    let raw = doc
        .get_page_content(page_id)
        .context("Failed to read page content")?;
    let content = Content::decode(&raw).context("Failed to decode content stream")?;

    let mut layout = PageLayout::new(index, bbox.width, bbox.height);
    let mut state = TextState::default();
    let mut stack: Vec<TextState> = Vec::new();

    for op in &content.operations {
        let operands = &op.operands;
        match op.operator.as_str() {
            "q" => stack.push(state.clone()),
            "Q" => {
                if let Some(saved) = stack.pop() {
                    state.ctm = saved.ctm;
                }
            }
            "cm" => {
                if let Some(m) = matrix_operand(operands) {
                    state.ctm = multiply(&m, &state.ctm);
                }
            }
            "BT" => {
                state.text_matrix = IDENTITY;
                state.line_matrix = IDENTITY;
            }
            "Tf" => {
                if let (Some(Object::Name(key)), Some(size)) =
                    (operands.first(), operands.get(1).and_then(number))
                {
                    state.font_key = key.clone();
                    state.font_size = size;
                }
            }
            "Tm" => {
                if let Some(m) = matrix_operand(operands) {
                    state.text_matrix = m;
                    state.line_matrix = m;
                }
            }
            "Td" => {
                if let (Some(tx), Some(ty)) = number_pair(operands) {
                    state.translate_line(tx, ty);
                }
            }
            "TD" => {
                if let (Some(tx), Some(ty)) = number_pair(operands) {
                    state.leading = -ty;
                    state.translate_line(tx, ty);
                }
            }
            "T*" => state.translate_line(0.0, -state.leading),
            "TL" => set_number(operands, &mut state.leading),
            "Tc" => set_number(operands, &mut state.char_spacing),
            "Tw" => set_number(operands, &mut state.word_spacing),
            "Ts" => set_number(operands, &mut state.text_rise),
            "Tz" => {
                if let Some(v) = operands.first().and_then(number) {
                    state.horiz_scale = v / 100.0;
                }
            }
            "Tj" => {
                if let Some(Object::String(bytes, _)) = operands.first() {
                    show(bytes, &fonts, &mut state, bbox, &mut layout);
                }
            }
            "'" => {
                state.translate_line(0.0, -state.leading);
                if let Some(Object::String(bytes, _)) = operands.first() {
                    show(bytes, &fonts, &mut state, bbox, &mut layout);
                }
            }
            "\"" => {
                if let (Some(aw), Some(ac), Some(Object::String(bytes, _))) = (
                    operands.first().and_then(number),
                    operands.get(1).and_then(number),
                    operands.get(2),
                ) {
                    state.word_spacing = aw;
                    state.char_spacing = ac;
                    state.translate_line(0.0, -state.leading);
                    show(bytes, &fonts, &mut state, bbox, &mut layout);
                }
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    show_array(items, &fonts, &mut state, bbox, &mut layout);
                }
            }
            _ => {}
        }
    }

    Ok(layout)
}

/// Render one string operand as a run and advance the text position
fn show(
    bytes: &[u8],
    fonts: &HashMap<Vec<u8>, PdfFont>,
    state: &mut TextState,
    page: PageBox,
    layout: &mut PageLayout,
) {
    let font = fonts.get(&state.font_key).cloned().unwrap_or_default();
    let text = font.decode(bytes);
    let start = state.position();
    let dx = advance(&font, bytes, &text, state);
    push_run(&text, start, dx * state.x_scale(), &font, state, page, layout);
    state.advance_x(dx);
}

/// Render a `TJ` array as one run, inserting spaces at word-sized gaps
fn show_array(
    items: &[Object],
    fonts: &HashMap<Vec<u8>, PdfFont>,
    state: &mut TextState,
    page: PageBox,
    layout: &mut PageLayout,
) {
    let font = fonts.get(&state.font_key).cloned().unwrap_or_default();
    let start = state.position();
    let mut text = String::new();
    let mut total_dx = 0.0;

    for item in items {
        match item {
            Object::String(bytes, _) => {
                let fragment = font.decode(bytes);
                let dx = advance(&font, bytes, &fragment, state);
                text.push_str(&fragment);
                state.advance_x(dx);
                total_dx += dx;
            }
            other => {
                if let Some(adj) = number(other) {
                    let dx = -adj / 1000.0 * state.font_size * state.horiz_scale;
                    let gap = state.font_size * APPROX_CHAR_WIDTH_RATIO * state.horiz_scale * 0.3;
                    if dx > gap && !text.is_empty() && !text.ends_with(' ') {
                        text.push(' ');
                    }
                    state.advance_x(dx);
                    total_dx += dx;
                }
            }
        }
    }

    push_run(&text, start, total_dx * state.x_scale(), &font, state, page, layout);
}

fn advance(font: &PdfFont, bytes: &[u8], text: &str, state: &TextState) -> f32 {
    let glyphs = font.advance(bytes, text.chars().count()) * state.font_size;
    let spacing = state.char_spacing * text.chars().count() as f32
        + state.word_spacing * text.chars().filter(|c| *c == ' ').count() as f32;
    (glyphs + spacing) * state.horiz_scale
}

fn push_run(
    text: &str,
    (x, y): (f32, f32),
    width: f32,
    font: &PdfFont,
    state: &TextState,
    page: PageBox,
    layout: &mut PageLayout,
) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return;
    }
    let size = state.effective_font_size();
    // Flip to a top-left origin relative to the media box
    let left = x - page.x0;
    let baseline = page.height - (y - page.y0);
    let bbox = BBox::new(
        left,
        baseline - size * ASCENT_RATIO,
        left + width.abs().max(size * APPROX_CHAR_WIDTH_RATIO),
        baseline + size * (1.0 - ASCENT_RATIO),
    );
    layout.runs.push(TextRun::new(
        trimmed,
        bbox,
        font.base_font.clone(),
        size,
        font.flags,
        layout.index,
        page.width,
        page.height,
    ));
}

/// Fonts available to a page, keyed by resource name
fn page_fonts(doc: &Document, page_id: ObjectId) -> HashMap<Vec<u8>, PdfFont> {
    let mut fonts = HashMap::new();
    let Some(resources) = inherited(doc, page_id, b"Resources").and_then(|o| o.as_dict().ok())
    else {
        return fonts;
    };
    let Some(font_dict) = resources
        .get(b"Font")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
    else {
        return fonts;
    };

    for (key, value) in font_dict.iter() {
        if let Ok(dict) = resolve(doc, value).as_dict() {
            fonts.insert(key.clone(), read_font(doc, dict));
        }
    }
    fonts
}

fn read_font(doc: &Document, dict: &Dictionary) -> PdfFont {
    let base_font = name_value(doc, dict, b"BaseFont").unwrap_or_default();
    let two_byte = name_value(doc, dict, b"Subtype").as_deref() == Some("Type0");

    let descriptor = if two_byte {
        dict.get(b"DescendantFonts")
            .ok()
            .map(|o| resolve(doc, o))
            .and_then(|o| o.as_array().ok())
            .and_then(|arr| arr.first())
            .map(|o| resolve(doc, o))
            .and_then(|o| o.as_dict().ok())
            .and_then(|d| d.get(b"FontDescriptor").ok())
    } else {
        dict.get(b"FontDescriptor").ok()
    };
    let descriptor_flags = descriptor
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
        .and_then(|d| d.get(b"Flags").ok())
        .and_then(|o| number(resolve(doc, o)))
        .map_or(0, |f| f as u32);

    let to_unicode = dict
        .get(b"ToUnicode")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_stream().ok())
        .map(|stream| {
            let data = stream
                .decompressed_content()
                .unwrap_or_else(|_| stream.content.clone());
            ToUnicodeMap::parse(&data)
        })
        .filter(|cmap| !cmap.is_empty());

    let first_char = dict
        .get(b"FirstChar")
        .ok()
        .and_then(|o| number(resolve(doc, o)))
        .map_or(0, |v| v as u32);
    let widths = dict
        .get(b"Widths")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_array().ok())
        .map(|arr| {
            arr.iter()
                .map(|o| number(resolve(doc, o)).unwrap_or(0.0))
                .collect()
        })
        .unwrap_or_default();

    PdfFont {
        base_font,
        flags: translate_descriptor_flags(descriptor_flags),
        to_unicode,
        two_byte,
        first_char,
        widths,
    }
}

/// Map FontDescriptor flags (PDF 32000 table 123) to run flags
fn translate_descriptor_flags(flags: u32) -> u32 {
    const FIXED_PITCH: u32 = 1;
    const SERIF: u32 = 1 << 1;
    const ITALIC: u32 = 1 << 6;
    const FORCE_BOLD: u32 = 1 << 18;

    let mut out = 0;
    if flags & ITALIC != 0 {
        out |= FLAG_ITALIC;
    }
    if flags & SERIF != 0 {
        out |= 1 << 2;
    }
    if flags & FIXED_PITCH != 0 {
        out |= 1 << 3;
    }
    if flags & FORCE_BOLD != 0 {
        out |= FLAG_BOLD;
    }
    out
}

fn read_metadata(doc: &Document) -> DocumentMetadata {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok());
    let Some(info) = info else {
        return DocumentMetadata::default();
    };
    let text = |key: &[u8]| match info.get(key).ok().map(|o| resolve(doc, o)) {
        Some(Object::String(bytes, _)) => {
            let s = decode_pdf_string(bytes).trim().to_string();
            (!s.is_empty()).then_some(s)
        }
        _ => None,
    };
    DocumentMetadata {
        title: text(b"Title"),
        author: text(b"Author"),
    }
}

/// Look up a page attribute, following `/Parent` for inheritable keys
pub(super) fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(resolve(doc, value));
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Follow one level of indirection
pub(super) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

fn name_value(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    match dict.get(key).ok().map(|o| resolve(doc, o)) {
        Some(Object::Name(name)) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

pub(super) fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn number_pair(operands: &[Object]) -> (Option<f32>, Option<f32>) {
    (
        operands.first().and_then(number),
        operands.get(1).and_then(number),
    )
}

fn set_number(operands: &[Object], target: &mut f32) {
    if let Some(v) = operands.first().and_then(number) {
        *target = v;
    }
}

fn matrix_operand(operands: &[Object]) -> Option<Matrix> {
    let values: Vec<f32> = operands.iter().take(6).filter_map(number).collect();
    (values.len() == 6).then(|| {
        [
            values[0], values[1], values[2], values[3], values[4], values[5],
        ]
    })
}

/// Decode a PDF text string: UTF-16BE with BOM, UTF-8, else Latin-1
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        return utf16_be(&bytes[2..]);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
