use crate::error::{EngineError, Result};
use crate::markdown::MarkdownSplitter;
use crate::models::{Chunk, ChunkType};
use crate::splitter::SentenceSplitter;
use chrono::{DateTime, Utc};
use lopdf::Document as PdfDocument;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

const GENERIC_EXTENSIONS: [&str; 6] = ["txt", "md", "markdown", "csv", "json", "pdf"];
const OFFICE_EXTENSIONS: [&str; 4] = ["doc", "docx", "ppt", "pptx"];

#[derive(Debug, Clone)]
pub struct SplitterOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separator: String,
}

impl Default for SplitterOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_024,
            chunk_overlap: 128,
            separator: "\n\n".to_string(),
        }
    }
}

/// A source document: either a file on disk or raw bytes with the original
/// file name, as delivered by the upload path.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Path(PathBuf),
    Binary { bytes: Vec<u8>, file_name: String },
}

impl DocumentSource {
    pub fn file_name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            Self::Binary { file_name, .. } => file_name.clone(),
        }
    }

    pub fn extension(&self) -> String {
        let name = self.file_name();
        Path::new(&name)
            .extension()
            .map(|extension| extension.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    fn title(&self) -> String {
        let name = self.file_name();
        Path::new(&name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or(name)
    }
}

pub fn is_supported_extension(extension: &str) -> bool {
    let lowered = extension.to_lowercase();
    GENERIC_EXTENSIONS.contains(&lowered.as_str()) || OFFICE_EXTENSIONS.contains(&lowered.as_str())
}

/// Recursively lists indexable files under a folder, sorted for determinism.
pub fn discover_supported_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(folder).into_iter().filter_map(|item| item.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let supported = entry
            .path()
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(is_supported_extension);
        if supported {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort_unstable();
    files
}

pub struct ProcessedDocument {
    pub chunks: Vec<Chunk>,
    /// Raw scalar fields from the loader; sanitized by the indexer before
    /// anything reaches a backend.
    pub metadata: Map<String, Value>,
}

/// Extension-keyed document pipeline. Markup input goes through the smart
/// splitter; plain formats through the fixed-window splitter; office binaries
/// through an external markdown conversion first.
pub struct Pipeline {
    markdown: MarkdownSplitter,
    sentence: SentenceSplitter,
}

impl Pipeline {
    pub fn new(options: &SplitterOptions) -> Result<Self> {
        Ok(Self {
            markdown: MarkdownSplitter::new(options.chunk_size)?,
            sentence: SentenceSplitter::new(
                options.chunk_size,
                options.chunk_overlap,
                options.separator.clone(),
            )?,
        })
    }

    pub async fn process(&self, source: &DocumentSource) -> Result<ProcessedDocument> {
        let extension = source.extension();
        let mut metadata = base_metadata(source).await;

        let chunks = match extension.as_str() {
            "md" | "markdown" => {
                let text = read_text(source).await?;
                self.markdown.split(&source.title(), &text)
            }
            "txt" | "csv" | "json" => {
                let text = read_text(source).await?;
                self.split_plain(&text, None)
            }
            "pdf" => self.split_pdf(source).await?,
            ext if OFFICE_EXTENSIONS.contains(&ext) => {
                let converted = convert_office_to_markdown(source).await?;
                metadata.insert("file_type".to_string(), json!(extension));
                self.markdown.split(&source.title(), &converted)
            }
            other => {
                return Err(EngineError::Validation(format!(
                    "unsupported file type: {other:?}"
                )))
            }
        };

        Ok(ProcessedDocument { chunks, metadata })
    }

    fn split_plain(&self, text: &str, page_number: Option<u32>) -> Vec<Chunk> {
        self.sentence
            .split(text)
            .into_iter()
            .map(|content| {
                let mut chunk = Chunk::new(content, ChunkType::Paragraph);
                if let Some(page) = page_number {
                    chunk
                        .metadata
                        .extra
                        .insert("page_number".to_string(), page.to_string());
                }
                chunk
            })
            .collect()
    }

    async fn split_pdf(&self, source: &DocumentSource) -> Result<Vec<Chunk>> {
        let document = match source {
            DocumentSource::Path(path) => PdfDocument::load(path)
                .map_err(|error| EngineError::Conversion(format!("pdf parse error: {error}")))?,
            DocumentSource::Binary { bytes, .. } => PdfDocument::load_mem(bytes)
                .map_err(|error| EngineError::Conversion(format!("pdf parse error: {error}")))?,
        };

        let mut chunks = Vec::new();
        for (page_number, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_number])
                .map_err(|error| EngineError::Conversion(format!("pdf text error: {error}")))?;
            if text.trim().is_empty() {
                continue;
            }
            chunks.extend(self.split_plain(&text, Some(page_number)));
        }

        if chunks.is_empty() {
            return Err(EngineError::Conversion(format!(
                "pdf had no readable text: {}",
                source.file_name()
            )));
        }
        Ok(chunks)
    }
}

async fn read_text(source: &DocumentSource) -> Result<String> {
    match source {
        DocumentSource::Path(path) => Ok(tokio::fs::read_to_string(path).await?),
        DocumentSource::Binary { bytes, .. } => Ok(String::from_utf8_lossy(bytes).to_string()),
    }
}

async fn base_metadata(source: &DocumentSource) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("file_name".to_string(), json!(source.file_name()));
    metadata.insert("file_type".to_string(), json!(source.extension()));

    match source {
        DocumentSource::Path(path) => {
            metadata.insert("file_path".to_string(), json!(path.to_string_lossy()));
            if let Ok(fs_metadata) = tokio::fs::metadata(path).await {
                metadata.insert("file_size".to_string(), json!(fs_metadata.len()));
                if let Ok(created) = fs_metadata.created() {
                    let stamp: DateTime<Utc> = created.into();
                    metadata.insert("creation_date".to_string(), json!(stamp.to_rfc3339()));
                }
                if let Ok(modified) = fs_metadata.modified() {
                    let stamp: DateTime<Utc> = modified.into();
                    metadata.insert("last_modified_date".to_string(), json!(stamp.to_rfc3339()));
                }
            }
        }
        DocumentSource::Binary { bytes, .. } => {
            metadata.insert("file_size".to_string(), json!(bytes.len()));
        }
    }
    metadata
}

/// Temp file that is removed on every exit path. Cleanup failures are logged
/// and never raised.
struct ScopedTempFile {
    path: PathBuf,
}

impl ScopedTempFile {
    async fn write(file_name: &str, bytes: &[u8]) -> Result<Self> {
        let safe_name: String = file_name
            .chars()
            .map(|character| {
                if character.is_alphanumeric() || character == '.' {
                    character
                } else {
                    '_'
                }
            })
            .collect();
        let path = std::env::temp_dir().join(format!("kbidx-{}-{safe_name}", Uuid::new_v4()));
        tokio::fs::write(&path, bytes).await?;
        Ok(Self { path })
    }
}

impl Drop for ScopedTempFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %error, "failed to remove conversion temp file");
        }
    }
}

/// Converts a legacy office binary to markdown via pandoc. A missing tool
/// triggers exactly one provisioning attempt before the call fails with a
/// conversion error; conversion is never retried internally.
async fn convert_office_to_markdown(source: &DocumentSource) -> Result<String> {
    let temp;
    let path: &Path = match source {
        DocumentSource::Path(path) => path,
        DocumentSource::Binary { bytes, file_name } => {
            temp = ScopedTempFile::write(file_name, bytes).await?;
            &temp.path
        }
    };

    match run_pandoc(path).await? {
        Some(markdown) => Ok(markdown),
        None => {
            warn!("pandoc not found, attempting one-time provisioning");
            provision_pandoc().await;
            match run_pandoc(path).await? {
                Some(markdown) => Ok(markdown),
                None => Err(EngineError::Conversion(
                    "conversion tool 'pandoc' is not available".to_string(),
                )),
            }
        }
    }
}

/// `Ok(None)` means the tool binary itself is missing.
async fn run_pandoc(path: &Path) -> Result<Option<String>> {
    let result = Command::new("pandoc")
        .arg(path)
        .args(["--to", "gfm", "--wrap", "none"])
        .output()
        .await;

    match result {
        Ok(Output { status, stdout, stderr }) => {
            if status.success() {
                Ok(Some(String::from_utf8_lossy(&stdout).to_string()))
            } else {
                Err(EngineError::Conversion(format!(
                    "pandoc exited with {status}: {}",
                    String::from_utf8_lossy(&stderr).trim()
                )))
            }
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(EngineError::Conversion(format!(
            "failed to launch pandoc: {error}"
        ))),
    }
}

async fn provision_pandoc() {
    let result = Command::new("apt-get")
        .args(["install", "-y", "pandoc"])
        .output()
        .await;
    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(status = %output.status, "pandoc provisioning failed"),
        Err(error) => warn!(%error, "pandoc provisioning could not start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn supported_extensions_cover_both_pipelines() {
        assert!(is_supported_extension("md"));
        assert!(is_supported_extension("PDF"));
        assert!(is_supported_extension("docx"));
        assert!(!is_supported_extension("exe"));
    }

    #[test]
    fn discovery_is_recursive_and_sorted() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::File::create(dir.path().join("b.txt"))
            .and_then(|mut file| file.write_all(b"beta"))
            .unwrap();
        std::fs::File::create(nested.join("a.md"))
            .and_then(|mut file| file.write_all(b"alpha"))
            .unwrap();
        std::fs::File::create(dir.path().join("skip.bin"))
            .and_then(|mut file| file.write_all(b"binary"))
            .unwrap();

        let files = discover_supported_files(dir.path());
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn unsupported_extension_is_a_validation_error() {
        let pipeline = Pipeline::new(&SplitterOptions::default()).unwrap();
        let source = DocumentSource::Binary {
            bytes: b"whatever".to_vec(),
            file_name: "payload.exe".to_string(),
        };
        let result = pipeline.process(&source).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn text_and_csv_yield_comparable_paragraph_chunks() {
        let pipeline = Pipeline::new(&SplitterOptions::default()).unwrap();
        let prose = "The indexing engine cleans text.\n\nThen it writes chunks to a backend.";

        let txt = pipeline
            .process(&DocumentSource::Binary {
                bytes: prose.as_bytes().to_vec(),
                file_name: "notes.txt".to_string(),
            })
            .await
            .unwrap();
        let csv = pipeline
            .process(&DocumentSource::Binary {
                bytes: prose.as_bytes().to_vec(),
                file_name: "notes.csv".to_string(),
            })
            .await
            .unwrap();

        let txt_contents: Vec<_> = txt.chunks.iter().map(|chunk| &chunk.content).collect();
        let csv_contents: Vec<_> = csv.chunks.iter().map(|chunk| &chunk.content).collect();
        assert_eq!(txt_contents, csv_contents);
        assert!(txt
            .chunks
            .iter()
            .all(|chunk| chunk.chunk_type == ChunkType::Paragraph));
    }

    #[tokio::test]
    async fn markdown_goes_through_the_smart_splitter() {
        let pipeline = Pipeline::new(&SplitterOptions::default()).unwrap();
        let document = "# Ops\n\n```sh\necho hello\n```\n";
        let processed = pipeline
            .process(&DocumentSource::Binary {
                bytes: document.as_bytes().to_vec(),
                file_name: "runbook.md".to_string(),
            })
            .await
            .unwrap();

        assert!(processed
            .chunks
            .iter()
            .any(|chunk| chunk.chunk_type == ChunkType::Code));
    }

    #[tokio::test]
    async fn loader_metadata_contains_scalar_file_fields() {
        let pipeline = Pipeline::new(&SplitterOptions::default()).unwrap();
        let processed = pipeline
            .process(&DocumentSource::Binary {
                bytes: b"plain body".to_vec(),
                file_name: "a.txt".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(processed.metadata.get("file_name"), Some(&json!("a.txt")));
        assert_eq!(processed.metadata.get("file_type"), Some(&json!("txt")));
        assert_eq!(processed.metadata.get("file_size"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn scoped_temp_file_is_removed_on_drop() {
        let path = {
            let temp = ScopedTempFile::write("sample.docx", b"bytes").await.unwrap();
            temp.path.clone()
        };
        assert!(!path.exists());
    }
}
