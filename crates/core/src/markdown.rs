use crate::error::{EngineError, Result};
use crate::models::{Chunk, ChunkMetadata, ChunkType};
use crate::splitter::{hard_window, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use regex::Regex;

/// Adjacent chunks smaller than this are merged during the merge pass.
pub const MERGE_THRESHOLD: usize = 256;

/// Markup-aware splitter. Fenced code blocks and tables are atomic and may
/// exceed `chunk_size`; everything else breaks at heading boundaries first,
/// then gets merged or re-split toward the target size. Each chunk carries a
/// context prefix (document title plus heading path) so it stays
/// self-describing when retrieved alone.
pub struct MarkdownSplitter {
    chunk_size: usize,
    comment: Regex,
    empty_link: Regex,
    horizontal_rule: Regex,
    heading: Regex,
    list_item: Regex,
    question: Regex,
    definition: Regex,
    arrow_line: Regex,
}

struct Block {
    content: String,
    chunk_type: ChunkType,
    header_path: Vec<String>,
}

impl Block {
    fn atomic(&self) -> bool {
        matches!(self.chunk_type, ChunkType::Code | ChunkType::Table)
    }
}

impl MarkdownSplitter {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(EngineError::Validation(format!(
                "chunk_size must be within [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}], got {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            comment: Regex::new(r"(?s)<!--.*?-->")?,
            empty_link: Regex::new(r"!?\[[^\]]*\]\(\s*\)")?,
            horizontal_rule: Regex::new(r"^\s*([-*_]\s*){3,}$")?,
            heading: Regex::new(r"^(#{1,6})\s+(.*)$")?,
            list_item: Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+")?,
            question: Regex::new(r"^(?:Q|q|问)[:：]")?,
            definition: Regex::new(r"^[^\s:：][^:：\n]{0,47}[:：]\s+\S")?,
            arrow_line: Regex::new(r"(?:->|=>|→|⇒)")?,
        })
    }

    pub fn split(&self, title: &str, text: &str) -> Vec<Chunk> {
        let stripped = self.strip_noise(text);
        let blocks = self.parse_blocks(&stripped);
        let merged = self.merge_small(blocks);
        let sized = self.split_oversized(merged);

        sized
            .into_iter()
            .map(|block| {
                let prefix = context_prefix(title, &block.header_path);
                let header_path = if block.header_path.is_empty() {
                    None
                } else {
                    Some(block.header_path.join(" > "))
                };
                Chunk {
                    content: if prefix.is_empty() {
                        block.content
                    } else {
                        format!("{prefix}\n\n{}", block.content)
                    },
                    chunk_type: block.chunk_type,
                    metadata: ChunkMetadata {
                        header_path,
                        ..ChunkMetadata::default()
                    },
                }
            })
            .collect()
    }

    fn strip_noise(&self, text: &str) -> String {
        let without_comments = self.comment.replace_all(text, "");
        let without_links = self.empty_link.replace_all(&without_comments, "");
        without_links
            .lines()
            .filter(|line| !self.horizontal_rule.is_match(line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn parse_blocks(&self, text: &str) -> Vec<Block> {
        let lines: Vec<&str> = text.lines().collect();
        let mut blocks = Vec::new();
        let mut heading_stack: Vec<(u8, String)> = Vec::new();
        let mut index = 0;

        while index < lines.len() {
            let line = lines[index];
            let trimmed = line.trim();

            if trimmed.is_empty() {
                index += 1;
                continue;
            }

            // Fenced code: consumed whole, up to the closing fence or EOF.
            if let Some(fence) = fence_marker(trimmed) {
                let start = index;
                index += 1;
                while index < lines.len() && fence_marker(lines[index].trim()) != Some(fence) {
                    index += 1;
                }
                let end = (index + 1).min(lines.len());
                blocks.push(Block {
                    content: lines[start..end].join("\n"),
                    chunk_type: ChunkType::Code,
                    header_path: current_path(&heading_stack),
                });
                index = end;
                continue;
            }

            if let Some(captures) = self.heading.captures(trimmed) {
                let level = captures[1].len() as u8;
                let heading_text = captures[2].trim().to_string();
                while heading_stack
                    .last()
                    .is_some_and(|(existing, _)| *existing >= level)
                {
                    heading_stack.pop();
                }
                if level <= 3 {
                    heading_stack.push((level, heading_text));
                }
                blocks.push(Block {
                    content: trimmed.to_string(),
                    chunk_type: ChunkType::Heading,
                    header_path: current_path(&heading_stack),
                });
                index += 1;
                continue;
            }

            // Table: consecutive pipe rows, kept as one block.
            if trimmed.contains('|') && is_table_start(&lines, index) {
                let start = index;
                while index < lines.len() && lines[index].trim().contains('|') {
                    index += 1;
                }
                blocks.push(Block {
                    content: lines[start..index].join("\n"),
                    chunk_type: ChunkType::Table,
                    header_path: current_path(&heading_stack),
                });
                continue;
            }

            if trimmed.starts_with('>') {
                let start = index;
                while index < lines.len() && lines[index].trim().starts_with('>') {
                    index += 1;
                }
                blocks.push(Block {
                    content: lines[start..index].join("\n"),
                    chunk_type: ChunkType::Blockquote,
                    header_path: current_path(&heading_stack),
                });
                continue;
            }

            if self.list_item.is_match(line) {
                let start = index;
                while index < lines.len()
                    && (self.list_item.is_match(lines[index])
                        || (!lines[index].trim().is_empty()
                            && lines[index].starts_with("  ")))
                {
                    index += 1;
                }
                blocks.push(Block {
                    content: lines[start..index].join("\n"),
                    chunk_type: ChunkType::List,
                    header_path: current_path(&heading_stack),
                });
                continue;
            }

            // Plain text paragraph up to the next blank line or structure.
            let start = index;
            while index < lines.len() {
                let candidate = lines[index].trim();
                if candidate.is_empty()
                    || fence_marker(candidate).is_some()
                    || self.heading.is_match(candidate)
                    || candidate.starts_with('>')
                    || self.list_item.is_match(lines[index])
                    || (candidate.contains('|') && is_table_start(&lines, index))
                {
                    break;
                }
                index += 1;
            }
            let content = lines[start..index].join("\n");
            blocks.push(Block {
                chunk_type: self.classify_paragraph(&content),
                content,
                header_path: current_path(&heading_stack),
            });
        }

        blocks
    }

    fn classify_paragraph(&self, content: &str) -> ChunkType {
        let first_line = content.lines().next().unwrap_or_default().trim();
        if self.question.is_match(first_line) {
            return ChunkType::Qa;
        }
        if content.lines().count() <= 2 && self.arrow_line.is_match(content) {
            return ChunkType::Flow;
        }
        if content.lines().count() <= 2 && self.definition.is_match(first_line) {
            return ChunkType::Definition;
        }
        ChunkType::Paragraph
    }

    fn merge_small(&self, blocks: Vec<Block>) -> Vec<Block> {
        let mut merged: Vec<Block> = Vec::with_capacity(blocks.len());
        for block in blocks {
            let mergeable = match merged.last() {
                Some(previous) => {
                    !previous.atomic()
                        && !block.atomic()
                        && previous.header_path == block.header_path
                        && previous.content.chars().count() < MERGE_THRESHOLD
                        && previous.content.chars().count() + block.content.chars().count()
                            <= self.chunk_size
                        // A heading adopts whatever follows it; other types
                        // only merge with their own kind.
                        && (previous.chunk_type == block.chunk_type
                            || previous.chunk_type == ChunkType::Heading)
                }
                None => false,
            };

            if mergeable {
                let previous = merged.last_mut().expect("checked above");
                previous.content.push_str("\n\n");
                previous.content.push_str(&block.content);
                previous.chunk_type = block.chunk_type;
            } else {
                merged.push(block);
            }
        }
        merged
    }

    fn split_oversized(&self, blocks: Vec<Block>) -> Vec<Block> {
        let mut output = Vec::with_capacity(blocks.len());
        for block in blocks {
            if block.atomic() || block.content.chars().count() <= self.chunk_size {
                output.push(block);
                continue;
            }

            for piece in hard_window(&block.content, self.chunk_size, 0) {
                output.push(Block {
                    content: piece,
                    chunk_type: block.chunk_type,
                    header_path: block.header_path.clone(),
                });
            }
        }
        output
    }
}

fn fence_marker(line: &str) -> Option<char> {
    if line.starts_with("```") {
        Some('`')
    } else if line.starts_with("~~~") {
        Some('~')
    } else {
        None
    }
}

fn is_table_start(lines: &[&str], index: usize) -> bool {
    let current = lines[index].trim();
    if !current.contains('|') {
        return false;
    }
    let next_is_divider = lines
        .get(index + 1)
        .map(|line| {
            let trimmed = line.trim();
            trimmed.contains('-')
                && trimmed
                    .chars()
                    .all(|character| matches!(character, '|' | '-' | ':' | ' '))
                && !trimmed.is_empty()
        })
        .unwrap_or(false);
    let current_is_divider = current.contains('-')
        && current
            .chars()
            .all(|character| matches!(character, '|' | '-' | ':' | ' '));
    next_is_divider || current_is_divider
}

fn current_path(stack: &[(u8, String)]) -> Vec<String> {
    stack.iter().map(|(_, text)| text.clone()).collect()
}

fn context_prefix(title: &str, path: &[String]) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(path.len() + 1);
    if !title.trim().is_empty() {
        parts.push(title.trim());
    }
    for segment in path {
        parts.push(segment);
    }
    parts.join(" > ")
}
