//! Document loading for ingestion.
//!
//! This module provides functionality to:
//! - Collect text files from a directory, optionally recursively
//! - Filter files by extension and exclude patterns
//! - Read each file into a [`SourceDocument`] with normalized metadata

use super::types::SourceDocument;
use crate::config::LoaderConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors that can occur while loading documents.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported file type '{extension}' for {path}. Supported types: {supported}")]
    Unsupported {
        path: PathBuf,
        extension: String,
        supported: String,
    },

    #[error("File is empty: {0}")]
    Empty(PathBuf),

    /// An I/O error occurred while reading files or directories.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Kind of document, recorded as `document_type` metadata.
fn document_type(extension: &str) -> &'static str {
    match extension {
        "md" | "markdown" => "markdown",
        _ => "text",
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Reads one file into a document whose `source_id` is `source_id`.
///
/// Fails for unsupported extensions, unreadable or non-UTF-8 files, and
/// files containing only whitespace.
pub async fn load_file(path: &Path, source_id: String, config: &LoaderConfig) -> Result<SourceDocument> {
    let extension = extension_of(path);
    if !is_indexable(path, &config.extensions) {
        return Err(LoaderError::Unsupported {
            path: path.to_path_buf(),
            extension: if extension.is_empty() { "(none)".to_string() } else { format!(".{extension}") },
            supported: config.extensions.join(", "),
        });
    }

    let io_err = |source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    };
    let text = fs::read_to_string(path).await.map_err(io_err)?;
    if text.trim().is_empty() {
        return Err(LoaderError::Empty(path.to_path_buf()));
    }
    let file_size = fs::metadata(path).await.map_err(io_err)?.len();

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source_id.clone());
    let full_path = fs::canonicalize(path).await.unwrap_or_else(|_| path.to_path_buf());

    Ok(SourceDocument::new(source_id, text)
        .with_metadata("source", file_name)
        .with_metadata("file_path", full_path.to_string_lossy().to_string())
        .with_metadata("file_size", file_size as i64)
        .with_metadata("document_type", document_type(&extension))
        .with_metadata("encoding", "utf-8"))
}

/// Collects every loadable file under `dir`, sorted by path.
///
/// Files are filtered based on:
/// - **Extensions**: only files with an extension listed in `config.extensions`.
/// - **Exclude patterns**: any path component containing one of
///   `config.exclude_patterns` is skipped (e.g. "node_modules", ".git").
///
/// Subdirectories are walked only when `recursive` is set.
pub async fn collect_files(dir: &Path, config: &LoaderConfig, recursive: bool) -> Result<Vec<PathBuf>> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Err(LoaderError::NotFound(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    collect_files_recursive(dir, dir, &mut files, config, recursive).await?;
    files.sort();
    Ok(files)
}

fn collect_files_recursive<'a>(
    root: &'a Path,
    dir: &'a Path,
    files: &'a mut Vec<PathBuf>,
    config: &'a LoaderConfig,
    recursive: bool,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let io_err = |source| LoaderError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(dir).await.map_err(io_err)?;

        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(&path);

            if should_exclude(relative, &config.exclude_patterns) {
                continue;
            }

            let file_type = entry.file_type().await.map_err(io_err)?;
            if file_type.is_dir() {
                if recursive {
                    collect_files_recursive(root, &path, files, config, recursive).await?;
                }
            } else if is_indexable(&path, &config.extensions) {
                files.push(path);
            }
        }

        Ok(())
    })
}

/// Source id for a file found under `root`: its path relative to `root`,
/// with `/` separators on every platform.
pub fn source_id_for(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Checks if a file should be loaded based on its extension (case-insensitive).
fn is_indexable(path: &Path, extensions: &[String]) -> bool {
    let ext = extension_of(path);
    !ext.is_empty() && extensions.iter().any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
}

/// Checks if a path should be excluded based on exclude patterns.
///
/// A path is excluded if any component of its path matches an exclude pattern.
fn should_exclude(path: &Path, patterns: &[String]) -> bool {
    path.components().any(|component| {
        if let Some(name) = component.as_os_str().to_str() {
            patterns.iter().any(|pattern| name.contains(pattern.as_str()))
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::MetadataValue;

    fn write(dir: &Path, relative: &str, content: &str) -> PathBuf {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_is_indexable() {
        let extensions = vec!["txt".to_string(), ".md".to_string()];

        assert!(is_indexable(Path::new("notes.txt"), &extensions));
        assert!(is_indexable(Path::new("README.MD"), &extensions));
        assert!(!is_indexable(Path::new("report.pdf"), &extensions));
        assert!(!is_indexable(Path::new("Makefile"), &extensions));
    }

    #[test]
    fn test_should_exclude() {
        let patterns = vec!["node_modules".to_string(), ".git".to_string(), "target".to_string()];

        assert!(should_exclude(Path::new("src/node_modules/file.md"), &patterns));
        assert!(should_exclude(Path::new(".git/config"), &patterns));
        assert!(!should_exclude(Path::new("docs/guide.md"), &patterns));
    }

    #[test]
    fn test_source_id_is_relative() {
        let root = Path::new("/data/corpus");
        assert_eq!(source_id_for(root, Path::new("/data/corpus/guides/setup.md")), "guides/setup.md");
    }

    #[tokio::test]
    async fn test_load_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "guide.md", "# Guide\n\nHello.");

        let doc = load_file(&path, "guide.md".into(), &LoaderConfig::default()).await.unwrap();
        assert_eq!(doc.source_id, "guide.md");
        assert_eq!(doc.text, "# Guide\n\nHello.");
        assert_eq!(doc.metadata["document_type"], MetadataValue::from("markdown"));
        assert_eq!(doc.metadata["source"], MetadataValue::from("guide.md"));
        assert_eq!(doc.metadata["file_size"], MetadataValue::Integer(15));
    }

    #[tokio::test]
    async fn test_load_file_rejects_empty_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write(dir.path(), "empty.txt", "  \n ");
        let pdf = write(dir.path(), "report.pdf", "%PDF-1.7");

        let config = LoaderConfig::default();
        assert!(matches!(
            load_file(&empty, "empty.txt".into(), &config).await,
            Err(LoaderError::Empty(_))
        ));
        assert!(matches!(
            load_file(&pdf, "report.pdf".into(), &config).await,
            Err(LoaderError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_collect_files_respects_recursion_and_excludes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "b.md", "b");
        write(dir.path(), "skip.rs", "fn main() {}");
        write(dir.path(), "nested/c.markdown", "c");
        write(dir.path(), "node_modules/d.md", "d");

        let config = LoaderConfig::default();
        let flat = collect_files(dir.path(), &config, false).await.unwrap();
        let names: Vec<String> = flat.iter().map(|p| source_id_for(dir.path(), p)).collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);

        let deep = collect_files(dir.path(), &config, true).await.unwrap();
        let names: Vec<String> = deep.iter().map(|p| source_id_for(dir.path(), p)).collect();
        assert_eq!(names, vec!["a.txt", "b.md", "nested/c.markdown"]);
    }

    #[tokio::test]
    async fn test_collect_files_missing_dir() {
        let err = collect_files(Path::new("/definitely/not/here"), &LoaderConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(_)));
    }
}
