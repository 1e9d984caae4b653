//! Context builder: turns the note, folder or library the user is looking at
//! into a bounded block of text for the system message.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::future::join_all;
use shared::settings::BackendKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::prompts::system_prompt;

/// Maximum number of files that get a content preview.
pub const PREVIEW_FILE_CAP: usize = 15;
/// Maximum characters per preview, including the trailing "...".
pub const PREVIEW_CHAR_CAP: usize = 80;
/// Maximum number of file names listed for a folder or the whole library.
pub const LISTED_FILE_CAP: usize = 200;

const ELLIPSIS: &str = "...";

/// A non-directory entry of the note library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFile {
    pub name: String,
    pub path: PathBuf,
}

impl NoteFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { name, path }
    }
}

/// Read access to the note library.
#[async_trait]
pub trait NoteSource: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<String>;

    /// Non-directory children of `folder`, sorted by name.
    async fn list_children(&self, folder: &Path) -> Result<Vec<NoteFile>>;

    /// Every file under the library root, sorted by path.
    async fn list_all(&self) -> Result<Vec<NoteFile>>;
}

/// [`NoteSource`] over a directory on disk. Hidden entries are skipped.
pub struct FsNoteSource {
    root: PathBuf,
}

impl FsNoteSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

#[async_trait]
impl NoteSource for FsNoteSource {
    async fn read_file(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    async fn list_children(&self, folder: &Path) -> Result<Vec<NoteFile>> {
        let mut entries = tokio::fs::read_dir(folder)
            .await
            .with_context(|| format!("listing {}", folder.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file = NoteFile::new(entry.path());
            if is_hidden(&file.name) || entry.file_type().await?.is_dir() {
                continue;
            }
            files.push(file);
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn list_all(&self) -> Result<Vec<NoteFile>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut files: Vec<NoteFile> = WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !is_hidden(&e.file_name().to_string_lossy()))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| NoteFile::new(e.into_path()))
                .collect();
            files.sort_by(|a, b| a.path.cmp(&b.path));
            files
        })
        .await
        .context("library scan task failed")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePreview {
    pub name: String,
    pub preview: String,
}

/// The most recently built context block. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContextSnapshot {
    #[default]
    Empty,
    File {
        path: PathBuf,
        name: String,
        content: String,
    },
    /// A folder, or the whole library when `name` is `None`.
    Folder {
        name: Option<String>,
        files: Vec<String>,
        previews: Vec<FilePreview>,
    },
}

impl ContextSnapshot {
    pub fn file(path: impl Into<PathBuf>, name: impl Into<String>, content: impl Into<String>) -> Self {
        ContextSnapshot::File {
            path: path.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    /// Build a folder (or library) snapshot, reading previews for the first
    /// [`PREVIEW_FILE_CAP`] files. Unreadable files are left without a preview.
    pub async fn folder(source: &dyn NoteSource, name: Option<String>, files: &[NoteFile]) -> Self {
        let previews = build_previews(source, files).await;
        ContextSnapshot::Folder {
            name,
            files: files.iter().map(|f| f.name.clone()).collect(),
            previews,
        }
    }

    pub fn render(&self) -> String {
        match self {
            ContextSnapshot::Empty => String::new(),
            ContextSnapshot::File { name, content, .. } => {
                let body = if content.trim().is_empty() {
                    "(empty)"
                } else {
                    content.as_str()
                };
                format!("## Current note: {}\n\n{}", name, body)
            }
            ContextSnapshot::Folder {
                name,
                files,
                previews,
            } => {
                let mut out = match name {
                    Some(name) => format!("## Current folder: {}\n", name),
                    None => "## Note library\n".to_string(),
                };
                out.push_str(&format!("\nFiles ({}):\n", files.len()));
                for file in files.iter().take(LISTED_FILE_CAP) {
                    out.push_str(&format!("- {}\n", file));
                }
                if files.len() > LISTED_FILE_CAP {
                    out.push_str(&format!("- ... and {} more\n", files.len() - LISTED_FILE_CAP));
                }
                if !previews.is_empty() {
                    out.push_str("\nPreviews:\n");
                    for p in previews {
                        out.push_str(&format!("- {}: {}\n", p.name, p.preview));
                    }
                }
                out.trim_end().to_string()
            }
        }
    }
}

/// The system message for `kind`: the tiered prompt followed by the rendered
/// snapshot.
pub fn compose_system_message(kind: BackendKind, snapshot: &ContextSnapshot) -> String {
    let prompt = system_prompt(kind);
    let context = snapshot.render();
    if context.is_empty() {
        prompt
    } else {
        format!("{}\n\n{}", prompt, context)
    }
}

/// A short, single-line preview of a note's body. Heading and blank lines
/// are dropped before truncating. Returns `None` when nothing is left.
pub fn make_preview(content: &str) -> Option<String> {
    let body = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");
    if body.is_empty() {
        return None;
    }
    if body.chars().count() <= PREVIEW_CHAR_CAP {
        return Some(body);
    }
    let keep = PREVIEW_CHAR_CAP - ELLIPSIS.len();
    let mut preview: String = body.chars().take(keep).collect();
    preview.push_str(ELLIPSIS);
    Some(preview)
}

pub async fn build_previews(source: &dyn NoteSource, files: &[NoteFile]) -> Vec<FilePreview> {
    let reads = files
        .iter()
        .take(PREVIEW_FILE_CAP)
        .map(|file| async move {
            match source.read_file(&file.path).await {
                Ok(content) => make_preview(&content).map(|preview| FilePreview {
                    name: file.name.clone(),
                    preview,
                }),
                Err(e) => {
                    debug!(file = %file.path.display(), error = %e, "skipping preview");
                    None
                }
            }
        });
    join_all(reads).await.into_iter().flatten().collect()
}
