//! Keyed storage of conversation transcripts.

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use shared::message::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::settings_store::project_dirs;

/// Persist and retrieve ordered message lists by an opaque key.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Messages stored under `key`; empty when nothing was stored yet.
    async fn load(&self, key: &str) -> Result<Vec<Message>, StoreError>;

    /// Replace the transcript stored under `key`.
    async fn save(&self, key: &str, messages: &[Message]) -> Result<(), StoreError>;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TranscriptFile {
    key: String,
    messages: Vec<Message>,
}

/// One JSON file per key, named by a hash of the key so arbitrary paths map
/// to safe file names.
pub struct JsonTranscriptStore {
    dir: PathBuf,
}

impl JsonTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open_default() -> Result<Self, StoreError> {
        let dirs = project_dirs().ok_or_else(|| {
            StoreError::Initialization("Could not determine data directory".to_string())
        })?;
        Ok(Self::new(dirs.data_dir().join("transcripts")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl TranscriptStore for JsonTranscriptStore {
    async fn load(&self, key: &str) -> Result<Vec<Message>, StoreError> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: TranscriptFile = serde_json::from_str(&content)?;
        Ok(file.messages)
    }

    async fn save(&self, key: &str, messages: &[Message]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(&TranscriptFile {
            key: key.to_string(),
            messages: messages.to_vec(),
        })?;

        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

/// Transcripts held in memory only.
#[derive(Default)]
pub struct InMemoryTranscriptStore {
    transcripts: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn load(&self, key: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.transcripts.read().get(key).cloned().unwrap_or_default())
    }

    async fn save(&self, key: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.transcripts
            .write()
            .insert(key.to_string(), messages.to_vec());
        Ok(())
    }
}
