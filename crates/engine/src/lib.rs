//! Chat engine for Quill Notes: picks a text-generation backend, keeps it
//! available, and runs streaming conversations about the open note.

pub mod context;
pub mod controller;
pub mod detector;
pub mod error;
pub mod prompts;
pub mod registry;
pub mod settings_store;
pub mod transcript;

pub use context::{ContextSnapshot, FsNoteSource, NoteFile, NoteSource};
pub use controller::ChatController;
pub use detector::{AvailabilityDetector, HEARTBEAT_INTERVAL};
pub use error::{EngineError, Result, StoreError};
pub use registry::{BackendDescriptor, EngineRegistry, RemoteStatus};
pub use settings_store::{JsonSettingsStore, MemorySettingsStore, SettingsStore};
pub use transcript::{InMemoryTranscriptStore, JsonTranscriptStore, TranscriptStore};
