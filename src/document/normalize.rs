//! Normalization: repair arbitrary JSON into a valid [`StructuredDocument`].
//!
//! OCR backends and older editor sessions produce content that is *almost*
//! right: empty text runs, heading levels outside the editor's range, bare
//! text directly under the root, list children that are not list items.
//! The editor rejects or silently corrupts such trees, so every document is
//! passed through [`normalize_document`] before it is cached, rendered or
//! exported.
//!
//! ## Guarantees
//!
//! - Total: never panics and never errors; anything unusable becomes the
//!   canonical empty document (one empty paragraph).
//! - Every text run is non-empty; every container has a children list.
//! - Idempotent: serialising a normalized document and normalizing it again
//!   yields an equal document.
//!
//! ## Repair rules
//!
//! 1. A string input is parsed as JSON first; parse failure → empty document
//! 2. A non-object input → empty document
//! 3. A root whose type is not `doc`/`document` keeps only its `content` array
//! 4. Empty or non-string text runs are dropped
//! 5. Falsy, unknown or malformed marks are dropped; duplicates collapse
//! 6. Heading level is read from `attrs.level` or a misplaced top-level
//!    `level`, defaults to 2, and is clamped to 1–3
//! 7. Bare inline runs between blocks are gathered into a paragraph
//! 8. List children that are not list items are wrapped in one; table rows
//!    and cells are repaired the same way
//! 9. Unknown containers are unwrapped (children hoisted); unknown leaves go

use super::{
    Block, BlockAttrs, FontSizeAttrs, HeadingAttrs, Inline, ListAttrs, ListItem, Mark,
    StructuredDocument, TableCell, TableRow, TextAlign,
};
use serde_json::{Map, Value};
use tracing::debug;

const DEFAULT_HEADING_LEVEL: u8 = 2;

/// Normalize any JSON value into a valid document.
///
/// A JSON string value is treated as serialised document text.
pub fn normalize_document(input: &Value) -> StructuredDocument {
    match input {
        Value::Object(map) => normalize_root(map),
        Value::String(raw) => normalize_str(raw),
        _ => StructuredDocument::empty(),
    }
}

/// Normalize serialised document text.
pub fn normalize_str(raw: &str) -> StructuredDocument {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => normalize_root(&map),
        Ok(_) => StructuredDocument::empty(),
        Err(e) => {
            debug!("Document text is not JSON ({}), using empty document", e);
            StructuredDocument::empty()
        }
    }
}

fn normalize_root(map: &Map<String, Value>) -> StructuredDocument {
    let kind = node_type(map);
    if !matches!(kind, Some("doc") | Some("document")) {
        debug!("Wrapping non-document root {:?} in a document", kind);
    }
    let content = children(map).map(normalize_blocks).unwrap_or_default();
    StructuredDocument::new(content)
}

// ── Blocks ──────────────────────────────────────────────────────────────────

fn normalize_blocks(values: &[Value]) -> Vec<Block> {
    let mut out = Vec::with_capacity(values.len());
    let mut pending: Vec<Inline> = Vec::new();

    for value in values {
        let Some(map) = value.as_object() else {
            continue;
        };
        if is_inline(map) {
            pending.extend(normalize_inline(map));
            continue;
        }
        flush_paragraph(&mut pending, &mut out);
        normalize_block(map, &mut out);
    }
    flush_paragraph(&mut pending, &mut out);
    out
}

fn flush_paragraph(pending: &mut Vec<Inline>, out: &mut Vec<Block>) {
    if !pending.is_empty() {
        out.push(Block::Paragraph {
            attrs: BlockAttrs::default(),
            content: std::mem::take(pending),
        });
    }
}

fn normalize_block(map: &Map<String, Value>, out: &mut Vec<Block>) {
    match node_type(map) {
        Some("paragraph") => out.push(Block::Paragraph {
            attrs: BlockAttrs {
                text_align: text_align(map),
            },
            content: inline_children(map),
        }),
        Some("heading") => out.push(Block::Heading {
            attrs: HeadingAttrs {
                level: heading_level(map),
                text_align: text_align(map),
            },
            content: inline_children(map),
        }),
        Some("bulletList") => out.push(Block::BulletList {
            content: children(map).map(normalize_list_items).unwrap_or_default(),
        }),
        Some("orderedList") => out.push(Block::OrderedList {
            attrs: ListAttrs {
                start: attr(map, "start")
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok()),
            },
            content: children(map).map(normalize_list_items).unwrap_or_default(),
        }),
        Some("table") => out.push(Block::Table {
            content: children(map).map(normalize_rows).unwrap_or_default(),
        }),
        Some("pageBreak") => out.push(Block::PageBreak),
        other => match children(map) {
            Some(values) => {
                debug!("Unwrapping unknown container {:?}", other);
                out.extend(normalize_blocks(values));
            }
            None => debug!("Dropping unknown leaf node {:?}", other),
        },
    }
}

fn normalize_list_items(values: &[Value]) -> Vec<ListItem> {
    values
        .iter()
        .filter_map(|value| {
            let map = value.as_object()?;
            if node_type(map) == Some("listItem") {
                return Some(ListItem {
                    content: children(map).map(normalize_blocks).unwrap_or_default(),
                });
            }
            let content = normalize_blocks(std::slice::from_ref(value));
            (!content.is_empty()).then_some(ListItem { content })
        })
        .collect()
}

fn normalize_rows(values: &[Value]) -> Vec<TableRow> {
    values
        .iter()
        .filter_map(|value| {
            let map = value.as_object()?;
            if node_type(map) == Some("tableRow") {
                return Some(TableRow {
                    content: children(map).map(normalize_cells).unwrap_or_default(),
                });
            }
            let content = normalize_cells(std::slice::from_ref(value));
            (!content.is_empty()).then_some(TableRow { content })
        })
        .collect()
}

fn normalize_cells(values: &[Value]) -> Vec<TableCell> {
    values
        .iter()
        .filter_map(|value| {
            let map = value.as_object()?;
            let content = || children(map).map(normalize_blocks).unwrap_or_default();
            match node_type(map) {
                Some("tableCell") => Some(TableCell::TableCell { content: content() }),
                Some("tableHeader") | Some("tableHeaderCell") => {
                    Some(TableCell::TableHeader { content: content() })
                }
                _ => {
                    let content = normalize_blocks(std::slice::from_ref(value));
                    (!content.is_empty()).then_some(TableCell::TableCell { content })
                }
            }
        })
        .collect()
}

// ── Inlines ─────────────────────────────────────────────────────────────────

fn is_inline(map: &Map<String, Value>) -> bool {
    matches!(node_type(map), Some("text") | Some("hardBreak"))
}

fn inline_children(map: &Map<String, Value>) -> Vec<Inline> {
    children(map).map(normalize_inlines).unwrap_or_default()
}

fn normalize_inlines(values: &[Value]) -> Vec<Inline> {
    values
        .iter()
        .filter_map(Value::as_object)
        .flat_map(normalize_inline)
        .collect()
}

/// One raw inline node → zero or more inlines (nested wrappers are flattened).
fn normalize_inline(map: &Map<String, Value>) -> Vec<Inline> {
    match node_type(map) {
        Some("text") => match map.get("text").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => vec![Inline::Text {
                text: text.to_string(),
                marks: normalize_marks(map.get("marks")),
            }],
            _ => Vec::new(),
        },
        Some("hardBreak") => vec![Inline::HardBreak],
        _ => inline_children(map),
    }
}

fn normalize_marks(raw: Option<&Value>) -> Vec<Mark> {
    let Some(values) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut marks: Vec<Mark> = Vec::with_capacity(values.len());
    for mark in values.iter().filter_map(normalize_mark) {
        if !marks.iter().any(|m| m.kind() == mark.kind()) {
            marks.push(mark);
        }
    }
    marks
}

fn normalize_mark(value: &Value) -> Option<Mark> {
    let (kind, map) = match value {
        Value::String(kind) => (kind.as_str(), None),
        Value::Object(map) => (node_type(map)?, Some(map)),
        _ => return None,
    };
    match kind {
        "bold" => Some(Mark::Bold),
        "italic" => Some(Mark::Italic),
        "underline" => Some(Mark::Underline),
        "strike" => Some(Mark::Strike),
        "fontSize" => {
            let map = map?;
            let size = attr(map, "size").or_else(|| map.get("size"))?;
            let size = match size {
                Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
                Value::Number(n) => format!("{}px", n),
                _ => return None,
            };
            Some(Mark::FontSize {
                attrs: FontSizeAttrs { size },
            })
        }
        _ => None,
    }
}

// ── Attribute helpers ───────────────────────────────────────────────────────

fn node_type(map: &Map<String, Value>) -> Option<&str> {
    map.get("type").and_then(Value::as_str)
}

fn children(map: &Map<String, Value>) -> Option<&[Value]> {
    map.get("content").and_then(Value::as_array).map(Vec::as_slice)
}

fn attr<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get("attrs")
        .and_then(Value::as_object)
        .and_then(|attrs| attrs.get(name))
}

fn text_align(map: &Map<String, Value>) -> Option<TextAlign> {
    attr(map, "textAlign")
        .and_then(Value::as_str)
        .and_then(TextAlign::parse)
}

fn heading_level(map: &Map<String, Value>) -> u8 {
    let raw = attr(map, "level").or_else(|| map.get("level"));
    let level = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match level {
        Some(l) if l.is_finite() => l.round().clamp(1.0, 3.0) as u8,
        _ => DEFAULT_HEADING_LEVEL,
    }
}
