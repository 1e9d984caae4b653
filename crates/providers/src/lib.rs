//! Text-generation backends.
//!
//! Every backend speaks the same [`ChatBackend`] contract: a streaming chat
//! call that yields tokens in generation order, terminated by exactly one
//! `Done` or `Error`, plus a cancel handle that stops the underlying work.

pub mod backend;
pub mod ollama;
pub mod openai;
pub mod sse;
pub mod worker;

pub use backend::{CancelHandle, ChatBackend, ChatStream, StreamSink};
pub use ollama::{ModelDescriptor, OllamaClient};
pub use openai::OpenAIClient;
pub use worker::{InferenceEngine, LoadUpdate, WorkerErrorKind, WorkerFailure, WorkerRuntime};
