use crate::error::Result;
use crate::models::{Chunk, ChunkType};
use regex::Regex;

/// Per-type chunk normalizer. Pure, order-preserving, and idempotent:
/// cleaning already-cleaned chunks is a no-op.
pub struct Cleaner {
    separator_line: Regex,
    ordered_marker: Regex,
    bullet_marker: Regex,
    question_marker: Regex,
    answer_marker: Regex,
    arrow: Regex,
    quote_marker: Regex,
}

impl Cleaner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            separator_line: Regex::new(r"^[-*_]{3,}$")?,
            ordered_marker: Regex::new(r"^(\s*)(\d+)[.)]\s*")?,
            bullet_marker: Regex::new(r"^(\s*)[-*+]\s*")?,
            question_marker: Regex::new(r"^(?:Q|q|问)[:：]\s*")?,
            answer_marker: Regex::new(r"^(?:A|a|答)[:：]\s*")?,
            arrow: Regex::new(r"\s*(?:->|=>|→|⇒)\s*")?,
            quote_marker: Regex::new(r"^(>+)\s*")?,
        })
    }

    /// Cleans every chunk in order, dropping chunks that are empty once the
    /// rules have been applied.
    pub fn clean(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        chunks
            .into_iter()
            .filter_map(|mut chunk| {
                chunk.content = self.clean_text(&chunk.content, chunk.chunk_type);
                if chunk.content.is_empty() {
                    None
                } else {
                    Some(chunk)
                }
            })
            .collect()
    }

    pub fn clean_text(&self, text: &str, chunk_type: ChunkType) -> String {
        let text = normalize_typography(text);
        match chunk_type {
            ChunkType::Paragraph | ChunkType::Definition => self.clean_paragraph(&text),
            ChunkType::Code => clean_code(&text),
            ChunkType::Table => clean_table(&text),
            ChunkType::List => self.clean_list(&text),
            ChunkType::Qa => self.clean_qa(&text),
            ChunkType::Heading => clean_heading(&text),
            ChunkType::Blockquote => self.clean_blockquote(&text),
            ChunkType::Flow => self.clean_flow(&text),
        }
    }

    fn clean_paragraph(&self, text: &str) -> String {
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| !self.separator_line.is_match(line.trim()))
            .collect();

        // Blank lines delimit paragraphs; single newlines inside a paragraph
        // become spaces.
        let mut paragraphs = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for line in kept {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    paragraphs.push(current.join(" "));
                    current = Vec::new();
                }
            } else {
                current.push(line);
            }
        }
        if !current.is_empty() {
            paragraphs.push(current.join(" "));
        }

        paragraphs
            .iter()
            .map(|paragraph| compress_whitespace(paragraph))
            .filter(|paragraph| !paragraph.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn clean_list(&self, text: &str) -> String {
        let lines: Vec<String> = text
            .lines()
            .map(|line| {
                if line.trim().is_empty() {
                    return String::new();
                }
                if let Some(captures) = self.bullet_marker.captures(line) {
                    let indent = &captures[1];
                    let rest = compress_whitespace(&line[captures[0].len()..]);
                    return format!("{indent}- {rest}");
                }
                if let Some(captures) = self.ordered_marker.captures(line) {
                    let indent = &captures[1];
                    let number = &captures[2];
                    let rest = compress_whitespace(&line[captures[0].len()..]);
                    return format!("{indent}{number}. {rest}");
                }
                compress_whitespace(line)
            })
            .collect();

        cap_blank_runs(&lines).join("\n")
    }

    fn clean_qa(&self, text: &str) -> String {
        let lines: Vec<String> = text
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return String::new();
                }
                if let Some(found) = self.question_marker.find(trimmed) {
                    return format!("Q: {}", compress_whitespace(&trimmed[found.end()..]));
                }
                if let Some(found) = self.answer_marker.find(trimmed) {
                    return format!("A: {}", compress_whitespace(&trimmed[found.end()..]));
                }
                compress_whitespace(trimmed)
            })
            .collect();

        trim_blank_edges(&cap_blank_runs(&lines)).join("\n")
    }

    fn clean_flow(&self, text: &str) -> String {
        let normalized = self.arrow.replace_all(text, " -> ");
        normalized
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn clean_blockquote(&self, text: &str) -> String {
        text.lines()
            .map(|line| {
                let trimmed = line.trim();
                if let Some(captures) = self.quote_marker.captures(trimmed) {
                    let markers = &captures[1];
                    let rest = trimmed[captures[0].len()..].trim();
                    if rest.is_empty() {
                        markers.to_string()
                    } else {
                        format!("{markers} {rest}")
                    }
                } else {
                    trimmed.to_string()
                }
            })
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared first pass: strip invisible characters and flatten typographic
/// punctuation to plain ASCII equivalents.
pub fn normalize_typography(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}' | '\u{feff}' => {}
            '\u{2018}' | '\u{2019}' => output.push('\''),
            '\u{201c}' | '\u{201d}' => output.push('"'),
            '\u{2013}' | '\u{2014}' => output.push('-'),
            '\u{2026}' => output.push_str("..."),
            '\u{a0}' => output.push(' '),
            '\n' | '\t' => output.push(character),
            c if c.is_control() => {}
            c => output.push(c),
        }
    }
    output
}

fn clean_code(text: &str) -> String {
    // Indentation and line breaks are significant; only trailing whitespace
    // and excess blank lines go.
    let lines: Vec<String> = text.lines().map(|line| line.trim_end().to_string()).collect();
    trim_blank_edges(&cap_blank_runs(&lines)).join("\n")
}

fn clean_table(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let trimmed = line.trim();
            let cells: Vec<String> = trimmed
                .trim_matches('|')
                .split('|')
                .map(|cell| compress_whitespace(cell))
                .collect();
            cells.join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_heading(text: &str) -> String {
    let compressed = compress_whitespace(text);
    if compressed.ends_with('?') {
        return compressed;
    }
    compressed.trim_end_matches([':', '：', ' ']).to_string()
}

fn compress_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cap_blank_runs(lines: &[String]) -> Vec<String> {
    let mut output = Vec::with_capacity(lines.len());
    let mut previous_blank = false;
    for line in lines {
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        output.push(if blank { String::new() } else { line.clone() });
        previous_blank = blank;
    }
    output
}

fn trim_blank_edges(lines: &[String]) -> Vec<String> {
    let start = lines
        .iter()
        .position(|line| !line.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map(|index| index + 1)
        .unwrap_or(start);
    lines[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn chunk(content: &str, chunk_type: ChunkType) -> Chunk {
        Chunk {
            content: content.to_string(),
            chunk_type,
            metadata: ChunkMetadata::default(),
        }
    }

    fn cleaner() -> Cleaner {
        Cleaner::new().expect("cleaner patterns compile")
    }

    #[test]
    fn paragraph_collapses_single_newlines() {
        let cleaned = cleaner().clean_text(
            "first line\nsecond  line\n\n---\n\nnext   paragraph",
            ChunkType::Paragraph,
        );
        assert_eq!(cleaned, "first line second line\n\nnext paragraph");
    }

    #[test]
    fn typography_is_flattened() {
        let cleaned = cleaner().clean_text(
            "\u{feff}\u{201c}smart\u{201d} \u{2014} dashes\u{2026}\u{a0}done",
            ChunkType::Paragraph,
        );
        assert_eq!(cleaned, "\"smart\" - dashes... done");
    }

    #[test]
    fn code_preserves_indentation() {
        let input = "fn main() {   \n    let x = 1;\n\n\n    println!(\"{x}\");\n}";
        let cleaned = cleaner().clean_text(input, ChunkType::Code);
        assert_eq!(
            cleaned,
            "fn main() {\n    let x = 1;\n\n    println!(\"{x}\");\n}"
        );
    }

    #[test]
    fn table_rows_are_normalized() {
        let cleaned = cleaner().clean_text("| name  |  size |\n\n|a|2|", ChunkType::Table);
        assert_eq!(cleaned, "name | size\na | 2");
    }

    #[test]
    fn list_markers_are_normalized() {
        let cleaned = cleaner().clean_text("* first\n+ second   item\n3) third", ChunkType::List);
        assert_eq!(cleaned, "- first\n- second item\n3. third");
    }

    #[test]
    fn qa_markers_are_normalized() {
        let cleaned = cleaner().clean_text("问: 什么是索引?\n答:   倒排结构", ChunkType::Qa);
        assert_eq!(cleaned, "Q: 什么是索引?\nA: 倒排结构");
    }

    #[test]
    fn flow_arrows_become_canonical() {
        let cleaned = cleaner().clean_text("parse=>clean → index   ->store", ChunkType::Flow);
        assert_eq!(cleaned, "parse -> clean -> index -> store");
    }

    #[test]
    fn heading_trailing_colon_is_stripped() {
        let c = cleaner();
        assert_eq!(c.clean_text("## Setup  steps: ", ChunkType::Heading), "## Setup steps");
        assert_eq!(c.clean_text("What is RAG?", ChunkType::Heading), "What is RAG?");
    }

    #[test]
    fn blockquote_marker_spacing_is_normalized() {
        let cleaned = cleaner().clean_text(">quoted   \n>>  nested", ChunkType::Blockquote);
        assert_eq!(cleaned, "> quoted\n>> nested");
    }

    #[test]
    fn clean_is_idempotent_for_every_type() {
        let c = cleaner();
        let samples = vec![
            chunk("one\ntwo\n\n\nthree  four\n---\n", ChunkType::Paragraph),
            chunk("term\ndefinition body", ChunkType::Definition),
            chunk("  indented()  \n\n\n  more()", ChunkType::Code),
            chunk("|a |b|\n|1| 2 |", ChunkType::Table),
            chunk("* one\n2) two\n\n\n+ three", ChunkType::List),
            chunk("q: why?\nA:because", ChunkType::Qa),
            chunk("## Heading :", ChunkType::Heading),
            chunk(">  quote\n>>deep", ChunkType::Blockquote),
            chunk("a => b → c", ChunkType::Flow),
        ];

        let once = c.clean(samples.clone());
        let twice = c.clean(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let c = cleaner();
        let cleaned = c.clean(vec![
            chunk("---\n\n", ChunkType::Paragraph),
            chunk("kept", ChunkType::Paragraph),
        ]);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].content, "kept");
    }
}
