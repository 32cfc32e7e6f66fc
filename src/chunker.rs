//! Windowed, page-anchored text chunker.
//!
//! Turns a book's linear sections into overlapping chunks suitable
//! for both dense and lexical indexing. Windows aim for
//! `target_chars` characters with `overlap_chars` of overlap between
//! consecutive windows; splits prefer sentence boundaries, fall back
//! to word boundaries, and never land mid-word.
//!
//! Every chunk is anchored to a derived page:
//! `page_number = (section_offset + chunk_start) / page_size_chars`,
//! where `section_offset` is the cumulative character offset of the
//! section from the start of the book. Page numbers are therefore
//! monotonic non-decreasing in `(section_index, position)` and
//! comparable across sections.
//!
//! Chunk ids are deterministic: re-chunking identical input yields an
//! identical id set.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::book::{chapter_title_for, BookDocument};
use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Deterministic chunk id: first 16 hex chars of
/// `SHA-256("{book_hash}:{section_index}:{ordinal}")`.
pub fn chunk_id(book_hash: &str, section_index: usize, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(book_hash.as_bytes());
    hasher.update(b":");
    hasher.update(section_index.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(ordinal.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Chunk every section of a book.
///
/// Sections that fail to yield a document are logged and skipped;
/// they never abort the run. Sections shorter than
/// `min_section_chars` after extraction are skipped but still advance
/// the cumulative offset, so page numbers account for their text.
pub fn chunk_book(book: &BookDocument, book_hash: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut cumulative_offset = 0usize;

    for (section_index, section) in book.sections.iter().enumerate() {
        let node = match section.create_document() {
            Ok(node) => node,
            Err(e) => {
                warn!(section = section_index, error = %e, "skipping malformed section");
                cumulative_offset += section.size;
                continue;
            }
        };

        let text = node.visible_text();
        let char_count = text.chars().count();

        if char_count < config.min_section_chars {
            debug!(
                section = section_index,
                chars = char_count,
                "skipping short section"
            );
            cumulative_offset += char_count;
            continue;
        }

        let chapter_title = chapter_title_for(&book.toc, section_index);
        chunks.extend(chunk_section(
            &text,
            book_hash,
            section_index,
            &chapter_title,
            cumulative_offset,
            config,
        ));

        cumulative_offset += char_count;
    }

    chunks
}

/// Window one section's extracted text into chunks.
pub fn chunk_section(
    text: &str,
    book_hash: &str,
    section_index: usize,
    chapter_title: &str,
    section_offset: usize,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut out = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let target = config.target_chars;
    let overlap = config.overlap_chars;

    let mut start = 0usize;
    let mut ordinal = 0usize;

    while start < len {
        let hard_end = (start + target).min(len);
        let end = if hard_end == len {
            len
        } else {
            pick_break(&chars, start, hard_end)
        };

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            let page_number = ((section_offset + start) / config.page_size_chars) as u32;
            out.push(Chunk {
                id: chunk_id(book_hash, section_index, ordinal),
                book_hash: book_hash.to_string(),
                section_index,
                chapter_title: chapter_title.to_string(),
                page_number,
                text: piece.to_string(),
                embedding: None,
            });
            ordinal += 1;
        }

        if end >= len {
            break;
        }

        start = next_window_start(&chars, start, end, overlap);
    }

    out
}

/// Choose the window end in `(start, hard_end]`: the last sentence
/// boundary in the window's back half, else the last word boundary,
/// else `hard_end` (a single run longer than the window has no legal
/// break).
fn pick_break(chars: &[char], start: usize, hard_end: usize) -> usize {
    let half = start + (hard_end - start) / 2;

    // Sentence boundary: terminator followed by whitespace.
    let mut i = hard_end - 1;
    while i > half {
        if is_sentence_end(chars[i - 1]) && chars[i].is_whitespace() {
            return i;
        }
        i -= 1;
    }

    // Word boundary anywhere in the window.
    let mut i = hard_end - 1;
    while i > start {
        if chars[i].is_whitespace() {
            return i;
        }
        i -= 1;
    }

    hard_end
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…')
}

/// Step back `overlap` characters from the previous end, then snap
/// forward to the start of the next word. Always advances past the
/// previous start.
fn next_window_start(chars: &[char], prev_start: usize, prev_end: usize, overlap: usize) -> usize {
    let mut next = prev_end.saturating_sub(overlap).max(prev_start + 1);
    while next < prev_end && !chars[next].is_whitespace() && !chars[next - 1].is_whitespace() {
        next += 1;
    }
    while next < chars.len() && chars[next].is_whitespace() {
        next += 1;
    }
    next.max(prev_start + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookMetadata, Section, SectionNode, TocEntry};

    fn section_with_text(text: &str) -> Section {
        Section::from_node(SectionNode::element(
            "body",
            vec![SectionNode::element("p", vec![SectionNode::text(text)])],
        ))
    }

    fn book(sections: Vec<Section>, toc: Vec<TocEntry>) -> BookDocument {
        BookDocument {
            metadata: BookMetadata {
                title: "Test Book".into(),
                author: "Tester".into(),
            },
            toc,
            sections,
        }
    }

    fn sentences(total_chars: usize) -> String {
        // "Sentence number 0000. " is 22 chars; build to the target.
        let mut out = String::new();
        let mut i = 0;
        while out.chars().count() < total_chars {
            out.push_str(&format!("Sentence number {i:04}. "));
            i += 1;
        }
        out.truncate(
            out.char_indices()
                .nth(total_chars)
                .map(|(b, _)| b)
                .unwrap_or(out.len()),
        );
        out
    }

    fn config(target: usize, overlap: usize, page_size: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_chars: target,
            overlap_chars: overlap,
            min_section_chars: 100,
            page_size_chars: page_size,
        }
    }

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(chunk_id("hash", 0, 0), chunk_id("hash", 0, 0));
        assert_ne!(chunk_id("hash", 0, 0), chunk_id("hash", 0, 1));
        assert_ne!(chunk_id("hash", 0, 0), chunk_id("hash", 1, 0));
        assert_ne!(chunk_id("hash", 0, 0), chunk_id("other", 0, 0));
        assert_eq!(chunk_id("hash", 3, 7).len(), 16);
    }

    #[test]
    fn rechunking_yields_identical_ids() {
        let book = book(vec![section_with_text(&sentences(2500))], vec![]);
        let cfg = config(800, 150, 1000);
        let first: Vec<String> = chunk_book(&book, "h1", &cfg)
            .into_iter()
            .map(|c| c.id)
            .collect();
        let second: Vec<String> = chunk_book(&book, "h1", &cfg)
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn windows_respect_target_and_overlap() {
        let text = sentences(3000);
        let book = book(vec![section_with_text(&text)], vec![]);
        let cfg = config(800, 150, 1000);
        let chunks = chunk_book(&book, "h1", &cfg);

        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(!c.text.is_empty());
            assert!(
                c.text.chars().count() <= 800,
                "chunk exceeds target: {} chars",
                c.text.chars().count()
            );
        }
        // Consecutive chunks share overlapping text.
        for pair in chunks.windows(2) {
            let tail: String = pair[0]
                .text
                .chars()
                .rev()
                .take(40)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            assert!(
                pair[1].text.contains(tail.trim()),
                "no overlap between consecutive chunks"
            );
        }
    }

    #[test]
    fn splits_land_on_word_boundaries() {
        let text = sentences(2000);
        let book = book(vec![section_with_text(&text)], vec![]);
        let chunks = chunk_book(&book, "h1", &config(700, 120, 1000));
        let words: std::collections::HashSet<&str> = text.split_whitespace().collect();
        for c in &chunks {
            let first = c.text.split_whitespace().next().unwrap();
            let last = c.text.split_whitespace().last().unwrap();
            assert!(words.contains(first), "split mid-word at start: {first:?}");
            assert!(words.contains(last), "split mid-word at end: {last:?}");
        }
    }

    #[test]
    fn short_sections_are_skipped() {
        let book = book(
            vec![
                section_with_text("Tiny."),
                section_with_text(&sentences(500)),
            ],
            vec![],
        );
        let chunks = chunk_book(&book, "h1", &config(800, 150, 1000));
        assert!(chunks.iter().all(|c| c.section_index == 1));
    }

    #[test]
    fn malformed_sections_are_skipped_not_fatal() {
        let book = book(
            vec![
                Section::malformed("bad xml"),
                section_with_text(&sentences(500)),
            ],
            vec![],
        );
        let chunks = chunk_book(&book, "h1", &config(800, 150, 1000));
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.section_index == 1));
    }

    #[test]
    fn page_numbers_are_monotonic_and_cross_sections() {
        let book = book(
            vec![
                section_with_text(&sentences(2000)),
                section_with_text(&sentences(1500)),
                section_with_text(&sentences(800)),
            ],
            vec![],
        );
        let chunks = chunk_book(&book, "h1", &config(600, 100, 500));

        let mut prev = 0u32;
        for c in &chunks {
            assert!(c.page_number >= prev, "page numbers must not decrease");
            prev = c.page_number;
        }
        // Later sections start past the pages of earlier ones.
        let last_page_s0 = chunks
            .iter()
            .filter(|c| c.section_index == 0)
            .map(|c| c.page_number)
            .max()
            .unwrap();
        let first_page_s1 = chunks
            .iter()
            .filter(|c| c.section_index == 1)
            .map(|c| c.page_number)
            .min()
            .unwrap();
        assert!(first_page_s1 >= last_page_s0);
    }

    #[test]
    fn chapter_titles_come_from_toc() {
        let book = book(
            vec![
                section_with_text(&sentences(300)),
                section_with_text(&sentences(300)),
                section_with_text(&sentences(300)),
            ],
            vec![
                TocEntry {
                    section: 0,
                    label: "Ch1".into(),
                },
                TocEntry {
                    section: 2,
                    label: "Ch2".into(),
                },
            ],
        );
        let chunks = chunk_book(&book, "h1", &config(800, 150, 500));
        for c in &chunks {
            let expected = if c.section_index < 2 { "Ch1" } else { "Ch2" };
            assert_eq!(c.chapter_title, expected);
        }
    }

    #[test]
    fn unbroken_run_still_terminates() {
        let text: String = "x".repeat(3000);
        let book = book(vec![section_with_text(&text)], vec![]);
        let chunks = chunk_book(&book, "h1", &config(700, 120, 1000));
        assert!(chunks.len() >= 4);
        let rebuilt: usize = chunks.iter().map(|c| c.text.chars().count()).sum();
        assert!(rebuilt >= 3000);
    }
}
