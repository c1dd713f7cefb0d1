use crate::embeddings::{cosine_similarity, EmbeddingProvider};
use crate::error::{EngineError, Result};

pub const MIN_CHUNK_SIZE: usize = 128;
pub const MAX_CHUNK_SIZE: usize = 8_192;
pub const MAX_CHUNK_OVERLAP: usize = 2_048;

/// Fixed-window splitter that prefers breaking at a separator and carries an
/// overlap tail into the next chunk.
#[derive(Debug, Clone)]
pub struct SentenceSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separator: String,
}

impl SentenceSplitter {
    /// `chunk_overlap >= chunk_size` is a construction-time error, as are
    /// out-of-range sizes.
    pub fn new(chunk_size: usize, chunk_overlap: usize, separator: impl Into<String>) -> Result<Self> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(EngineError::Validation(format!(
                "chunk_size must be within [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}], got {chunk_size}"
            )));
        }
        if chunk_overlap > MAX_CHUNK_OVERLAP {
            return Err(EngineError::Validation(format!(
                "chunk_overlap must be at most {MAX_CHUNK_OVERLAP}, got {chunk_overlap}"
            )));
        }
        if chunk_overlap >= chunk_size {
            return Err(EngineError::Validation(format!(
                "chunk_overlap {chunk_overlap} must be smaller than chunk_size {chunk_size}"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separator: separator.into(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let segments: Vec<&str> = text
            .split(self.separator.as_str())
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect();

        let mut chunks = Vec::new();
        let mut current = String::new();

        for segment in segments {
            if !current.is_empty()
                && current.chars().count() + segment.chars().count() + self.separator.len()
                    > self.chunk_size
            {
                let tail = overlap_tail(&current, self.chunk_overlap);
                chunks.push(std::mem::take(&mut current));
                current = tail;
            }

            if !current.is_empty() {
                current.push_str(&self.separator);
            }
            current.push_str(segment);
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        // Segments longer than the window are cut by character position.
        chunks
            .into_iter()
            .flat_map(|chunk| hard_window(&chunk, self.chunk_size, self.chunk_overlap))
            .collect()
    }
}

/// Groups sentences into chunks at embedding-distance breakpoints: where the
/// distance between neighboring sentence groups exceeds the configured
/// percentile, a new chunk starts.
#[derive(Debug, Clone, Copy)]
pub struct SemanticSplitter {
    buffer_size: usize,
    breakpoint_percentile: u8,
}

impl SemanticSplitter {
    pub fn new(buffer_size: usize, breakpoint_percentile: u8) -> Result<Self> {
        if !(1..=10).contains(&buffer_size) {
            return Err(EngineError::Validation(format!(
                "buffer_size must be within [1, 10], got {buffer_size}"
            )));
        }
        if !(50..=100).contains(&breakpoint_percentile) {
            return Err(EngineError::Validation(format!(
                "breakpoint_percentile must be within [50, 100], got {breakpoint_percentile}"
            )));
        }
        Ok(Self {
            buffer_size,
            breakpoint_percentile,
        })
    }

    pub async fn split(&self, text: &str, embedder: &dyn EmbeddingProvider) -> Result<Vec<String>> {
        let sentences = split_sentences(text);
        if sentences.len() <= 1 {
            let trimmed = text.trim();
            return Ok(if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            });
        }

        // Each sentence is embedded together with its neighbors so a single
        // short sentence does not dominate the distance signal.
        let grouped: Vec<String> = (0..sentences.len())
            .map(|index| {
                let start = index.saturating_sub(self.buffer_size);
                let end = (index + self.buffer_size + 1).min(sentences.len());
                sentences[start..end].join(" ")
            })
            .collect();

        let embeddings = embedder.embed(&grouped).await?;
        if embeddings.len() != sentences.len() {
            return Err(EngineError::Embedding(format!(
                "expected {} embeddings, received {}",
                sentences.len(),
                embeddings.len()
            )));
        }

        let distances: Vec<f32> = embeddings
            .windows(2)
            .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]))
            .collect();
        let threshold = percentile(&distances, self.breakpoint_percentile);

        let mut chunks = Vec::new();
        let mut current: Vec<&str> = vec![&sentences[0]];
        for (index, distance) in distances.iter().enumerate() {
            if *distance > threshold {
                chunks.push(current.join(" "));
                current = Vec::new();
            }
            current.push(&sentences[index + 1]);
        }
        if !current.is_empty() {
            chunks.push(current.join(" "));
        }

        Ok(chunks)
    }
}

pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for character in text.chars() {
        if character == '\n' {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }
        current.push(character);
        if matches!(character, '.' | '!' | '?' | '。' | '！' | '？') {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }

    sentences
}

pub(crate) fn overlap_tail(text: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(overlap);
    chars[start..].iter().collect()
}

pub(crate) fn hard_window(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += chunk_size.saturating_sub(overlap).max(1);
    }
    pieces
}

fn percentile(values: &[f32], percentile: u8) -> f32 {
    if values.is_empty() {
        return f32::MAX;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|left, right| left.total_cmp(right));
    let position = ((sorted.len() - 1) as f64 * f64::from(percentile) / 100.0).round() as usize;
    sorted[position]
}
