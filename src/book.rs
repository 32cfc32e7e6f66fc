//! Book document model consumed from the reader.
//!
//! The reader hands the engine an ordered sequence of sections, each
//! yielding a structured content tree, plus table-of-contents entries
//! and (possibly localized) title/author metadata. Parsing the book
//! format itself happens upstream; this module only models the shape
//! and extracts visible text from section trees.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A title or author value: either a plain string or a language map,
/// depending on how the book's metadata was authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedString {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl LocalizedString {
    /// The English value when present, otherwise the first entry,
    /// otherwise an empty string.
    pub fn preferred(&self) -> &str {
        match self {
            LocalizedString::Plain(s) => s,
            LocalizedString::Localized(map) => map
                .get("en")
                .or_else(|| map.values().next())
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

impl From<&str> for LocalizedString {
    fn from(s: &str) -> Self {
        LocalizedString::Plain(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub title: LocalizedString,
    pub author: LocalizedString,
}

/// One table-of-contents entry: the linear index of the section it
/// points at, and its display label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub section: usize,
    pub label: String,
}

/// A node in a section's structured content tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SectionNode {
    Element {
        tag: String,
        children: Vec<SectionNode>,
    },
    Text(String),
}

impl SectionNode {
    pub fn element(tag: &str, children: Vec<SectionNode>) -> Self {
        SectionNode::Element {
            tag: tag.to_string(),
            children,
        }
    }

    pub fn text(content: &str) -> Self {
        SectionNode::Text(content.to_string())
    }

    /// Concatenate visible text in document order: `script`/`style`
    /// subtrees are dropped, whitespace runs collapse to single
    /// spaces, and the result is trimmed.
    pub fn visible_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        collapse_whitespace(&out)
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            SectionNode::Text(t) => {
                out.push_str(t);
                out.push(' ');
            }
            SectionNode::Element { tag, children } => {
                if matches!(tag.as_str(), "script" | "style") {
                    return;
                }
                for child in children {
                    child.collect_text(out);
                }
            }
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_space = true;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Where a section's content comes from. A malformed section keeps
/// its parse error so the chunker can log and skip it without
/// aborting the book.
#[derive(Debug, Clone, PartialEq)]
pub enum SectionSource {
    Document(SectionNode),
    Malformed(String),
}

/// One linear section of a book.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub linear: bool,
    /// Character count reported by the reader.
    pub size: usize,
    pub source: SectionSource,
}

impl Section {
    pub fn from_node(node: SectionNode) -> Self {
        let size = node.visible_text().chars().count();
        Self {
            linear: true,
            size,
            source: SectionSource::Document(node),
        }
    }

    pub fn malformed(reason: &str) -> Self {
        Self {
            linear: true,
            size: 0,
            source: SectionSource::Malformed(reason.to_string()),
        }
    }

    /// Yield the structured content tree, or the parse failure for a
    /// malformed section.
    pub fn create_document(&self) -> Result<&SectionNode> {
        match &self.source {
            SectionSource::Document(node) => Ok(node),
            SectionSource::Malformed(reason) => {
                Err(Error::Book(format!("malformed section: {reason}")))
            }
        }
    }
}

/// The structured book handed to [`Indexer::index_book`](crate::indexer::Indexer::index_book).
#[derive(Debug, Clone, PartialEq)]
pub struct BookDocument {
    pub metadata: BookMetadata,
    pub toc: Vec<TocEntry>,
    pub sections: Vec<Section>,
}

/// Title for section `i`: the label of the last TOC entry whose
/// section index is `<= i`; `"Section {i+1}"` when no entry applies.
pub fn chapter_title_for(toc: &[TocEntry], section_index: usize) -> String {
    toc.iter()
        .rev()
        .find(|entry| entry.section <= section_index)
        .map(|entry| entry.label.clone())
        .unwrap_or_else(|| format!("Section {}", section_index + 1))
}
