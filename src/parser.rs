//! File type detection and text extraction.
//!
//! Maps file extensions to a [`FileType`] and extracts plain text: PDFs go
//! through `pdf-extract` (with `lopdf` supplying the page count), everything
//! else is read as UTF-8. PDF extraction is CPU-bound and runs on the
//! blocking pool.

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::models::FileType;

/// Extensions the pipeline accepts. Anything else is skipped by the watcher
/// and rejected by explicit ingestion.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "md", "markdown", "json", "yaml", "yml", "xml", "html", "css", "scss", "ts",
    "tsx", "js", "jsx", "py", "java", "cpp", "c", "h", "hpp", "go", "rs",
];

const CODE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "py", "java", "cpp", "c", "h", "hpp", "go", "rs",
];

/// Extracted text plus format-specific metadata.
#[derive(Debug)]
pub struct ParsedDocument {
    pub text: String,
    pub page_count: Option<usize>,
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Classify a path by extension. Unknown extensions fall back to plain text.
pub fn detect_file_type(path: &Path) -> FileType {
    match extension_of(path).as_deref() {
        Some("pdf") => FileType::Pdf,
        Some("md") | Some("markdown") => FileType::Markdown,
        Some(ext) if CODE_EXTENSIONS.contains(&ext) => FileType::Code,
        _ => FileType::Text,
    }
}

/// True for a `.`-prefixed file or directory name.
pub fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(true)
}

/// Whether the watcher and directory scans should pick this file up.
/// Dotfiles and unsupported extensions are skipped. Hidden directories are
/// pruned by the walk and watch layers relative to their root, since the
/// absolute path may legitimately pass through hidden ancestors.
pub fn is_supported_file(path: &Path) -> bool {
    let hidden = path.file_name().map(is_hidden_name).unwrap_or(true);
    if hidden {
        return false;
    }
    match extension_of(path) {
        Some(ext) => SUPPORTED_EXTENSIONS.contains(&ext.as_str()),
        None => false,
    }
}

/// Extract text from a file according to its detected type.
pub async fn parse_file(path: &Path) -> Result<ParsedDocument> {
    match detect_file_type(path) {
        FileType::Pdf => parse_pdf(path).await,
        _ => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| Error::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(ParsedDocument {
                text,
                page_count: None,
            })
        }
    }
}

async fn parse_pdf(path: &Path) -> Result<ParsedDocument> {
    let path_buf = path.to_path_buf();

    let result = tokio::task::spawn_blocking(move || -> Result<ParsedDocument> {
        let text = pdf_extract::extract_text(&path_buf).map_err(|e| Error::Parse {
            path: path_buf.display().to_string(),
            reason: format!("pdf extraction failed: {}", e),
        })?;

        // Page count is advisory metadata; a count failure does not fail
        // the extraction.
        let page_count = match lopdf::Document::load(&path_buf) {
            Ok(doc) => Some(doc.get_pages().len()),
            Err(e) => {
                debug!(path = %path_buf.display(), error = %e, "could not read pdf page count");
                None
            }
        };

        Ok(ParsedDocument { text, page_count })
    })
    .await
    .map_err(|e| Error::Parse {
        path: path.display().to_string(),
        reason: format!("pdf extraction task failed: {}", e),
    })??;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn detects_types_by_extension() {
        assert_eq!(detect_file_type(Path::new("report.PDF")), FileType::Pdf);
        assert_eq!(detect_file_type(Path::new("notes.md")), FileType::Markdown);
        assert_eq!(detect_file_type(Path::new("main.rs")), FileType::Code);
        assert_eq!(detect_file_type(Path::new("app.tsx")), FileType::Code);
        assert_eq!(detect_file_type(Path::new("data.json")), FileType::Text);
        assert_eq!(detect_file_type(Path::new("mystery.zzz")), FileType::Text);
    }

    #[test]
    fn skips_dotfiles_and_unknown_extensions() {
        assert!(is_supported_file(Path::new("src/main.rs")));
        assert!(is_supported_file(Path::new("README.md")));
        assert!(!is_supported_file(Path::new(".env")));
        assert!(!is_supported_file(Path::new("dir/.hidden.txt")));
        assert!(!is_supported_file(Path::new("archive.zip")));
        assert!(!is_supported_file(Path::new("Makefile")));
    }

    #[tokio::test]
    async fn parses_plain_text() {
        let tmp = tempfile::tempdir().unwrap();
        let path: PathBuf = tmp.path().join("notes.txt");
        std::fs::write(&path, "hello world").unwrap();

        let parsed = parse_file(&path).await.unwrap();
        assert_eq!(parsed.text, "hello world");
        assert_eq!(parsed.page_count, None);
    }

    #[tokio::test]
    async fn missing_file_is_parse_error() {
        let err = parse_file(Path::new("/nonexistent/file.txt")).await.unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
