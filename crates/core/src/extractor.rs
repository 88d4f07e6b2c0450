use crate::error::IngestError;
use crate::models::{PageToken, PageTokens};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::HashMap;
use std::path::Path;

const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);
const FALLBACK_GLYPH_WIDTH: f32 = 500.0;
// `TJ` adjustments beyond this many thousandths of an em are treated as word gaps.
const WORD_GAP_THOUSANDTHS: f32 = 200.0;
const MAX_PARENT_DEPTH: usize = 32;

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageTokens>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageTokens>, IngestError> {
        let document = Document::load(path)?;
        let page_ids = document.get_pages();

        if page_ids.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf has no pages: {}",
                path.display()
            )));
        }

        let mut pages = Vec::with_capacity(page_ids.len());
        for (page_no, page_id) in page_ids {
            let (origin_x, origin_y, width, height) = page_box(&document, page_id)?;
            let fonts = page_fonts(&document, page_id);
            let data = document.get_page_content(page_id)?;
            let content = Content::decode(&data)?;

            let tokens = read_tokens(&content.operations, &fonts)
                .into_iter()
                .map(|token| PageToken {
                    x: token.x - origin_x,
                    y: token.y - origin_y,
                    ..token
                })
                .collect();

            pages.push(PageTokens {
                number: page_no,
                width,
                height,
                tokens,
            });
        }

        Ok(pages)
    }
}

pub fn extract_page_tokens(path: &Path) -> Result<Vec<PageTokens>, IngestError> {
    LopdfExtractor.extract_pages(path)
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> Result<&'a Object, IngestError> {
    match object {
        Object::Reference(id) => Ok(document.get_object(*id)?),
        other => Ok(other),
    }
}

fn number(object: &Object) -> Option<f32> {
    object.as_float().ok()
}

fn page_box(document: &Document, page_id: ObjectId) -> Result<(f32, f32, f32, f32), IngestError> {
    let mut dictionary: &Dictionary = document.get_object(page_id)?.as_dict()?;

    for _ in 0..MAX_PARENT_DEPTH {
        if let Ok(media_box) = dictionary.get(b"MediaBox") {
            let values = resolve(document, media_box)?
                .as_array()?
                .iter()
                .map(|item| resolve(document, item).ok().and_then(number))
                .collect::<Option<Vec<_>>>();

            if let Some([llx, lly, urx, ury]) = values.as_deref() {
                let width = (urx - llx).abs();
                let height = (ury - lly).abs();
                if width > 0.0 && height > 0.0 {
                    return Ok((llx.min(*urx), lly.min(*ury), width, height));
                }
            }
            break;
        }

        match dictionary.get(b"Parent") {
            Ok(parent) => dictionary = resolve(document, parent)?.as_dict()?,
            Err(_) => break,
        }
    }

    Ok((0.0, 0.0, DEFAULT_PAGE_SIZE.0, DEFAULT_PAGE_SIZE.1))
}

#[derive(Debug, Clone, PartialEq)]
struct FontWidths {
    first_char: u32,
    widths: Vec<f32>,
    missing_width: f32,
}

impl Default for FontWidths {
    fn default() -> Self {
        Self {
            first_char: 0,
            widths: Vec::new(),
            missing_width: FALLBACK_GLYPH_WIDTH,
        }
    }
}

impl FontWidths {
    fn from_font(document: &Document, font: &Dictionary) -> Self {
        let first_char = font
            .get_deref(b"FirstChar", document)
            .and_then(Object::as_i64)
            .ok()
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(0);

        let widths = font
            .get_deref(b"Widths", document)
            .and_then(Object::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        document
                            .dereference(item)
                            .ok()
                            .and_then(|(_, value)| number(value))
                            .unwrap_or(0.0)
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let missing_width = font
            .get_deref(b"FontDescriptor", document)
            .and_then(Object::as_dict)
            .and_then(|descriptor| descriptor.get_deref(b"MissingWidth", document))
            .ok()
            .and_then(number)
            .filter(|width| *width > 0.0)
            .unwrap_or(FALLBACK_GLYPH_WIDTH);

        Self {
            first_char,
            widths,
            missing_width,
        }
    }

    fn code_width(&self, code: u8) -> f32 {
        u32::from(code)
            .checked_sub(self.first_char)
            .and_then(|index| self.widths.get(index as usize))
            .copied()
            .unwrap_or(self.missing_width)
            / 1000.0
    }
}

type FontMap = HashMap<Vec<u8>, FontWidths>;

fn page_fonts(document: &Document, page_id: ObjectId) -> FontMap {
    document
        .get_page_fonts(page_id)
        .into_iter()
        .map(|(name, font)| (name, FontWidths::from_font(document, font)))
        .collect()
}

type Matrix = [f32; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

fn multiply(left: Matrix, right: Matrix) -> Matrix {
    let [a, b, c, d, e, f] = left;
    let [ra, rb, rc, rd, re, rf] = right;
    [
        a * ra + b * rc,
        a * rb + b * rd,
        c * ra + d * rc,
        c * rb + d * rd,
        e * ra + f * rc + re,
        e * rb + f * rd + rf,
    ]
}

fn matrix_operands(operands: &[Object]) -> Option<Matrix> {
    match operands.iter().map(number).collect::<Option<Vec<_>>>()?[..] {
        [a, b, c, d, e, f] => Some([a, b, c, d, e, f]),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct GraphicsState {
    ctm: Matrix,
    font: Vec<u8>,
    font_size: f32,
    leading: f32,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            ctm: IDENTITY,
            font: Vec::new(),
            font_size: 12.0,
            leading: 0.0,
        }
    }
}

#[derive(Debug)]
struct TextState {
    graphics: GraphicsState,
    saved: Vec<GraphicsState>,
    matrix: Matrix,
    line_matrix: Matrix,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            graphics: GraphicsState::default(),
            saved: Vec::new(),
            matrix: IDENTITY,
            line_matrix: IDENTITY,
        }
    }
}

impl TextState {
    fn save(&mut self) {
        self.saved.push(self.graphics.clone());
    }

    fn restore(&mut self) {
        if let Some(graphics) = self.saved.pop() {
            self.graphics = graphics;
        }
    }

    fn concat(&mut self, matrix: Matrix) {
        self.graphics.ctm = multiply(matrix, self.graphics.ctm);
    }

    fn begin_text(&mut self) {
        self.matrix = IDENTITY;
        self.line_matrix = IDENTITY;
    }

    fn set_matrix(&mut self, matrix: Matrix) {
        self.matrix = matrix;
        self.line_matrix = matrix;
    }

    fn move_line(&mut self, tx: f32, ty: f32) {
        let [a, b, c, d, e, f] = self.line_matrix;
        self.line_matrix = [a, b, c, d, e + tx * a + ty * c, f + tx * b + ty * d];
        self.matrix = self.line_matrix;
    }

    fn next_line(&mut self) {
        self.move_line(0.0, -self.graphics.leading);
    }

    fn advance(&mut self, text_space: f32) {
        let [a, b, c, d, e, f] = self.matrix;
        self.matrix = [a, b, c, d, e + text_space * a, f + text_space * b];
    }

    fn show(&mut self, text: String, advance: f32) -> PageToken {
        let [a, b, c, d, x, y] = multiply(self.matrix, self.graphics.ctm);
        let token = PageToken {
            text,
            x,
            y,
            width: advance * (a * a + b * b).sqrt(),
            height: self.graphics.font_size * (c * c + d * d).sqrt(),
        };
        self.advance(advance);
        token
    }

    fn string_advance(&self, bytes: &[u8], fonts: &FontMap) -> f32 {
        let em = if is_utf16(bytes) {
            decode_pdf_string(bytes).chars().count() as f32 * FALLBACK_GLYPH_WIDTH / 1000.0
        } else {
            match fonts.get(&self.graphics.font) {
                Some(font) => bytes.iter().map(|&code| font.code_width(code)).sum(),
                None => bytes.len() as f32 * FALLBACK_GLYPH_WIDTH / 1000.0,
            }
        };
        em * self.graphics.font_size
    }
}

fn read_tokens(operations: &[Operation], fonts: &FontMap) -> Vec<PageToken> {
    let mut state = TextState::default();
    let mut tokens = Vec::new();

    for operation in operations {
        let operands = &operation.operands;
        match operation.operator.as_str() {
            "q" => state.save(),
            "Q" => state.restore(),
            "cm" => {
                if let Some(matrix) = matrix_operands(operands) {
                    state.concat(matrix);
                }
            }
            "BT" => state.begin_text(),
            "Tf" => {
                if let Some(Ok(name)) = operands.first().map(Object::as_name) {
                    state.graphics.font = name.to_vec();
                }
                if let Some(size) = operands.get(1).and_then(number) {
                    state.graphics.font_size = size.abs();
                }
            }
            "TL" => {
                if let Some(leading) = operands.first().and_then(number) {
                    state.graphics.leading = leading;
                }
            }
            "Td" | "TD" => {
                if let (Some(tx), Some(ty)) = (
                    operands.first().and_then(number),
                    operands.get(1).and_then(number),
                ) {
                    if operation.operator == "TD" {
                        state.graphics.leading = -ty;
                    }
                    state.move_line(tx, ty);
                }
            }
            "Tm" => {
                if let Some(matrix) = matrix_operands(operands) {
                    state.set_matrix(matrix);
                }
            }
            "T*" => state.next_line(),
            "Tj" => tokens.extend(show_string(&mut state, operands.first(), fonts)),
            "'" => {
                state.next_line();
                tokens.extend(show_string(&mut state, operands.first(), fonts));
            }
            "\"" => {
                state.next_line();
                tokens.extend(show_string(&mut state, operands.get(2), fonts));
            }
            "TJ" => {
                if let Some(Object::Array(items)) = operands.first() {
                    tokens.extend(show_array(&mut state, items, fonts));
                }
            }
            _ => {}
        }
    }

    tokens
}

fn show_string(state: &mut TextState, operand: Option<&Object>, fonts: &FontMap) -> Option<PageToken> {
    let Some(Object::String(bytes, _)) = operand else {
        return None;
    };
    let text = decode_pdf_string(bytes);
    if text.is_empty() {
        return None;
    }
    let advance = state.string_advance(bytes, fonts);
    Some(state.show(text, advance))
}

fn show_array(state: &mut TextState, items: &[Object], fonts: &FontMap) -> Option<PageToken> {
    let mut text = String::new();
    let mut advance = 0f32;

    for item in items {
        match item {
            Object::String(bytes, _) => {
                advance += state.string_advance(bytes, fonts);
                text.push_str(&decode_pdf_string(bytes));
            }
            other => {
                if let Some(adjustment) = number(other) {
                    advance -= adjustment / 1000.0 * state.graphics.font_size;
                    if adjustment < -WORD_GAP_THOUSANDTHS && !text.is_empty() && !text.ends_with(' ') {
                        text.push(' ');
                    }
                }
            }
        }
    }

    if text.is_empty() {
        return None;
    }
    Some(state.show(text, advance.max(0.0)))
}

fn is_utf16(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFE, 0xFF])
}

pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if is_utf16(bytes) {
        let units = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&byte| byte as char).collect()
    }
}
