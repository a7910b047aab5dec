//! Derived metadata: outline, word count, page count and plain text.

use super::visit::{walk_block, walk_document, Visitor};
use super::{Block, Inline, StructuredDocument};
use serde::Serialize;

const FALLBACK_LABEL: &str = "Heading";

/// One navigable outline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutlineEntry {
    pub id: String,
    pub label: String,
}

impl OutlineEntry {
    /// The synthetic entry standing for the whole document.
    pub fn whole_document() -> Self {
        Self {
            id: "doc".to_string(),
            label: "Document".to_string(),
        }
    }
}

/// Every heading in document order (depth-first, pre-order).
///
/// Never empty: a document with no headings yields [`OutlineEntry::whole_document`].
pub fn extract_outline(doc: &StructuredDocument) -> Vec<OutlineEntry> {
    struct Outline(Vec<OutlineEntry>);

    impl Visitor for Outline {
        fn visit_block(&mut self, block: &Block) {
            if let Block::Heading { content, .. } = block {
                let text = inline_text(content);
                let label = text.trim();
                self.0.push(OutlineEntry {
                    id: format!("h-{}", self.0.len() + 1),
                    label: if label.is_empty() {
                        FALLBACK_LABEL.to_string()
                    } else {
                        label.to_string()
                    },
                });
            }
            walk_block(self, block);
        }
    }

    let mut outline = Outline(Vec::new());
    walk_document(&mut outline, doc);
    if outline.0.is_empty() {
        vec![OutlineEntry::whole_document()]
    } else {
        outline.0
    }
}

/// Number of whitespace-separated words across all text runs.
///
/// Runs are joined with a space, so two adjacent runs never merge into one word.
pub fn count_words(doc: &StructuredDocument) -> usize {
    struct Runs(Vec<String>);

    impl Visitor for Runs {
        fn visit_inline(&mut self, inline: &Inline) {
            if let Inline::Text { text, .. } = inline {
                self.0.push(text.clone());
            }
        }
    }

    let mut runs = Runs(Vec::new());
    walk_document(&mut runs, doc);
    runs.0.join(" ").split_whitespace().count()
}

/// Number of pages the export will span: explicit page breaks plus one.
pub fn count_pages(doc: &StructuredDocument) -> usize {
    struct Breaks(usize);

    impl Visitor for Breaks {
        fn visit_block(&mut self, block: &Block) {
            if matches!(block, Block::PageBreak) {
                self.0 += 1;
            }
            walk_block(self, block);
        }
    }

    let mut breaks = Breaks(0);
    walk_document(&mut breaks, doc);
    breaks.0 + 1
}

/// Render the document as plain text, one line per paragraph or heading.
pub fn plain_text(doc: &StructuredDocument) -> String {
    struct Lines(Vec<String>);

    impl Visitor for Lines {
        fn visit_block(&mut self, block: &Block) {
            match block {
                Block::Heading { attrs, content } => {
                    let marker = "#".repeat(attrs.level as usize);
                    self.0.push(format!("{} {}", marker, inline_text(content)));
                }
                Block::Paragraph { content, .. } => self.0.push(inline_text(content)),
                Block::PageBreak => self.0.push("\u{000C}".to_string()),
                _ => walk_block(self, block),
            }
        }
    }

    let mut lines = Lines(Vec::new());
    walk_document(&mut lines, doc);
    lines.0.join("\n")
}

fn inline_text(content: &[Inline]) -> String {
    content
        .iter()
        .map(|inline| match inline {
            Inline::Text { text, .. } => text.as_str(),
            Inline::HardBreak => "\n",
        })
        .collect()
}
