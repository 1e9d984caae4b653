//! In-process model runtime hosted on a dedicated thread.
//!
//! The runtime is an actor: the async side only talks to it through
//! [`WorkerRequest`]s, and every request that produces output carries its own
//! reply channel of [`WorkerEvent`]s. A heavy load or generate step therefore
//! never blocks the async executor, and no model state is shared with callers.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared::agent_api::ChatMessage;
use shared::events::{LoadProgress, LoadStage};
use shared::settings::BackendKind;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

use crate::backend::{CancelHandle, ChatBackend, ChatStream};

pub enum WorkerRequest {
    Init {
        model_id: String,
        events: UnboundedSender<WorkerEvent>,
    },
    Chat {
        id: u64,
        messages: Vec<ChatMessage>,
        events: UnboundedSender<WorkerEvent>,
    },
    /// Stop chat `id`. Its reply channel is closed without a terminal event.
    Abort(u64),
    Unload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress(LoadProgress),
    Ready,
    Token(String),
    Complete,
    Error { kind: WorkerErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// No hardware acceleration; retrying will not help
    CapabilityMissing,
    LoadFailed,
    /// Chat requested before a model finished loading
    NotReady,
    Generation,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WorkerFailure {
    pub kind: WorkerErrorKind,
    pub message: String,
}

/// Progress report from an engine while it loads weights.
#[derive(Debug, Clone)]
pub struct LoadUpdate {
    /// 0.0..=1.0
    pub fraction: f32,
    pub text: String,
}

/// The model implementation driven by the worker thread.
pub trait InferenceEngine: Send + 'static {
    fn has_acceleration(&self) -> bool {
        has_gpu_acceleration()
    }

    fn load(&mut self, model_id: &str, progress: &mut dyn FnMut(LoadUpdate)) -> Result<()>;

    /// Generate a reply, calling `on_token` for every piece of text in order.
    /// Generation must stop as soon as `on_token` returns `Break`.
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()>;

    fn unload(&mut self) {}
}

/// Detect GPU acceleration: Apple Silicon, NVIDIA (CUDA) or AMD (ROCm).
pub fn has_gpu_acceleration() -> bool {
    if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        return true;
    }

    if cfg!(target_os = "linux") || cfg!(target_os = "windows") {
        let nvidia_cmd = if cfg!(windows) { "nvidia-smi.exe" } else { "nvidia-smi" };
        if probe_command(nvidia_cmd) {
            return true;
        }
        if !cfg!(windows) && probe_command("rocminfo") {
            return true;
        }
    }

    false
}

fn probe_command(program: &str) -> bool {
    Command::new(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Engines describe their progress in free text; anything about fetching
/// weights counts as downloading.
fn stage_for(text: &str) -> LoadStage {
    let lower = text.to_lowercase();
    if lower.contains("fetch") || lower.contains("download") {
        LoadStage::Downloading
    } else {
        LoadStage::Loading
    }
}

struct Worker<E: InferenceEngine> {
    engine: E,
    requests: Receiver<WorkerRequest>,
    backlog: VecDeque<WorkerRequest>,
    loaded: bool,
}

impl<E: InferenceEngine> Worker<E> {
    fn run(mut self) {
        loop {
            let request = match self.backlog.pop_front() {
                Some(request) => request,
                None => match self.requests.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                },
            };
            match request {
                WorkerRequest::Init { model_id, events } => self.init(&model_id, events),
                WorkerRequest::Chat {
                    id,
                    messages,
                    events,
                } => self.chat(id, &messages, events),
                // the chat it targets already finished
                WorkerRequest::Abort(_) => {}
                WorkerRequest::Unload => self.unload(),
            }
        }
        self.unload();
        debug!("worker thread exiting");
    }

    fn init(&mut self, model_id: &str, events: UnboundedSender<WorkerEvent>) {
        if !self.engine.has_acceleration() {
            let _ = events.send(WorkerEvent::Error {
                kind: WorkerErrorKind::CapabilityMissing,
                message: "GPU acceleration is not available on this device".to_string(),
            });
            return;
        }
        self.unload();

        info!(model = model_id, "loading worker model");
        let _ = events.send(WorkerEvent::Progress(LoadProgress::new(LoadStage::Init, 0)));
        let result = self.engine.load(model_id, &mut |update: LoadUpdate| {
            let progress = LoadProgress::from_fraction(stage_for(&update.text), update.fraction);
            let _ = events.send(WorkerEvent::Progress(progress));
        });
        match result {
            Ok(()) => {
                self.loaded = true;
                let _ = events.send(WorkerEvent::Ready);
            }
            Err(e) => {
                warn!(error = %e, model = model_id, "worker model failed to load");
                let _ = events.send(WorkerEvent::Error {
                    kind: WorkerErrorKind::LoadFailed,
                    message: e.to_string(),
                });
            }
        }
    }

    fn chat(&mut self, id: u64, messages: &[ChatMessage], events: UnboundedSender<WorkerEvent>) {
        if !self.loaded {
            let _ = events.send(WorkerEvent::Error {
                kind: WorkerErrorKind::NotReady,
                message: "Model is not loaded".to_string(),
            });
            return;
        }

        let requests = &self.requests;
        let backlog = &mut self.backlog;
        let mut stopped = false;
        let result = self.engine.generate(messages, &mut |token: &str| {
            // Requests arriving mid-generation are only inspected for an abort;
            // everything else waits its turn.
            loop {
                match requests.try_recv() {
                    Ok(WorkerRequest::Abort(target)) if target == id => {
                        stopped = true;
                        return ControlFlow::Break(());
                    }
                    Ok(WorkerRequest::Abort(target)) => {
                        // drops the queued chat's reply channel
                        backlog.retain(|r| {
                            !matches!(r, WorkerRequest::Chat { id: queued, .. } if *queued == target)
                        });
                    }
                    Ok(other) => backlog.push_back(other),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            if events.send(WorkerEvent::Token(token.to_string())).is_err() {
                stopped = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        if stopped {
            debug!("worker generation aborted");
            return;
        }
        let _ = match result {
            Ok(()) => events.send(WorkerEvent::Complete),
            Err(e) => events.send(WorkerEvent::Error {
                kind: WorkerErrorKind::Generation,
                message: e.to_string(),
            }),
        };
    }

    fn unload(&mut self) {
        if self.loaded {
            self.engine.unload();
        }
        self.loaded = false;
    }
}

/// Async handle to the worker thread.
pub struct WorkerRuntime {
    tx: Sender<WorkerRequest>,
    next_chat: AtomicU64,
    /// Follows the worker's `Ready` replies; never shared with the thread
    ready: AtomicBool,
    model: RwLock<String>,
}

impl WorkerRuntime {
    pub fn spawn<E: InferenceEngine>(engine: E) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            engine,
            requests: rx,
            backlog: VecDeque::new(),
            loaded: false,
        };
        thread::Builder::new()
            .name("llm-worker".to_string())
            .spawn(move || worker.run())?;
        Ok(Self {
            tx,
            next_chat: AtomicU64::new(1),
            ready: AtomicBool::new(false),
            model: RwLock::new(String::new()),
        })
    }

    /// Load `model_id`, reporting progress until the worker answers with
    /// ready or an error. A failed load can be retried with another call.
    pub async fn initialize(
        &self,
        model_id: &str,
        mut on_progress: impl FnMut(LoadProgress) + Send,
    ) -> std::result::Result<(), WorkerFailure> {
        // an init always drops the previous model first
        self.ready.store(false, Ordering::SeqCst);
        let (events, mut rx) = unbounded_channel();
        self.send(WorkerRequest::Init {
            model_id: model_id.to_string(),
            events,
        })
        .map_err(|e| WorkerFailure {
            kind: WorkerErrorKind::LoadFailed,
            message: e.to_string(),
        })?;

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Progress(progress) => on_progress(progress),
                WorkerEvent::Ready => {
                    *self.model.write() = model_id.to_string();
                    self.ready.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                WorkerEvent::Error { kind, message } => {
                    return Err(WorkerFailure { kind, message });
                }
                WorkerEvent::Token(_) | WorkerEvent::Complete => {}
            }
        }
        Err(WorkerFailure {
            kind: WorkerErrorKind::LoadFailed,
            message: "worker stopped while loading".to_string(),
        })
    }

    /// Free the loaded model. The runtime accepts a new `initialize` afterwards.
    pub fn unload(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.tx.send(WorkerRequest::Unload);
    }

    fn send(&self, request: WorkerRequest) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| anyhow!("worker thread is not running"))
    }
}

#[async_trait]
impl ChatBackend for WorkerRuntime {
    fn kind(&self) -> BackendKind {
        BackendKind::WorkerModel
    }

    fn model_name(&self) -> String {
        self.model.read().clone()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<ChatStream> {
        let id = self.next_chat.fetch_add(1, Ordering::SeqCst);
        let (events, mut rx) = unbounded_channel();
        self.send(WorkerRequest::Chat {
            id,
            messages,
            events,
        })?;

        let abort_tx = self.tx.clone();
        let (sink, stream) = ChatStream::channel(CancelHandle::new(move || {
            let _ = abort_tx.send(WorkerRequest::Abort(id));
        }));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    WorkerEvent::Token(text) => {
                        if !sink.token(text) {
                            return;
                        }
                    }
                    WorkerEvent::Complete => {
                        sink.done();
                        return;
                    }
                    WorkerEvent::Error { message, .. } => {
                        sink.error(message);
                        return;
                    }
                    WorkerEvent::Progress(_) | WorkerEvent::Ready => {}
                }
            }
            // reply channel closed by an abort: end without a terminal chunk
        });
        Ok(stream)
    }

    async fn test_connection(&self) -> bool {
        self.is_ready()
    }
}
