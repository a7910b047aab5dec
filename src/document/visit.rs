//! Read-only traversal over a [`StructuredDocument`].
//!
//! Implement only the hooks you need; the default `walk_*` functions recurse
//! into children in document order.

use super::{Block, Inline, ListItem, StructuredDocument, TableRow};

pub trait Visitor {
    fn visit_block(&mut self, block: &Block) {
        walk_block(self, block);
    }

    fn visit_inline(&mut self, _inline: &Inline) {}
}

pub fn walk_document<V: Visitor + ?Sized>(visitor: &mut V, doc: &StructuredDocument) {
    for block in &doc.content {
        visitor.visit_block(block);
    }
}

pub fn walk_block<V: Visitor + ?Sized>(visitor: &mut V, block: &Block) {
    match block {
        Block::Paragraph { content, .. } | Block::Heading { content, .. } => {
            for inline in content {
                visitor.visit_inline(inline);
            }
        }
        Block::BulletList { content } | Block::OrderedList { content, .. } => {
            walk_items(visitor, content);
        }
        Block::Table { content } => walk_rows(visitor, content),
        Block::PageBreak => {}
    }
}

fn walk_items<V: Visitor + ?Sized>(visitor: &mut V, items: &[ListItem]) {
    for block in items.iter().flat_map(|item| &item.content) {
        visitor.visit_block(block);
    }
}

fn walk_rows<V: Visitor + ?Sized>(visitor: &mut V, rows: &[TableRow]) {
    for cell in rows.iter().flat_map(|row| &row.content) {
        for block in cell.content() {
            visitor.visit_block(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        blocks: usize,
        inlines: usize,
    }

    impl Visitor for Counter {
        fn visit_block(&mut self, block: &Block) {
            self.blocks += 1;
            walk_block(self, block);
        }

        fn visit_inline(&mut self, _inline: &Inline) {
            self.inlines += 1;
        }
    }

    #[test]
    fn walks_nested_blocks_in_order() {
        let doc = StructuredDocument::new(vec![
            Block::heading(1, "T"),
            Block::BulletList {
                content: vec![ListItem {
                    content: vec![Block::paragraph("a"), Block::paragraph("b")],
                }],
            },
            Block::PageBreak,
        ]);
        let mut counter = Counter::default();
        walk_document(&mut counter, &doc);
        assert_eq!(counter.blocks, 5);
        assert_eq!(counter.inlines, 3);
    }
}
