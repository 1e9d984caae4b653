//! Chat controller: the state machine the UI drives.
//!
//! `detecting -> loading -> ready <-> generating`, with `error` reachable
//! from detecting, loading and generating, and left only through a retry.
//! One generation runs at a time; its messages are committed to the
//! transcript store when it completes, fails or is aborted, under the key
//! that was active when it started.

use futures::StreamExt;
use parking_lot::Mutex;
use providers::{CancelHandle, ChatBackend, WorkerErrorKind};
use shared::agent_api::{ChatMessage, StreamChunk};
use shared::events::{AvailabilityChange, ControllerEvent, EngineStatus, LoadProgress, ProbeReason};
use shared::message::{ConversationKey, Message, Role};
use shared::settings::BackendKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{compose_system_message, ContextSnapshot, NoteFile, NoteSource};
use crate::detector::AvailabilityDetector;
use crate::error::{EngineError, Result};
use crate::prompts::MARKDOWN_HINT;
use crate::registry::EngineRegistry;
use crate::transcript::TranscriptStore;

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed(String),
    /// Stopped by the controller; never reported as an error
    Aborted,
}

struct Inflight {
    id: u64,
    key: Option<ConversationKey>,
    user: Message,
    /// Created on the first token
    assistant: Option<Message>,
    cancel: Option<CancelHandle>,
}

/// A finished message pair waiting to be written.
struct Commit {
    key: ConversationKey,
    messages: Vec<Message>,
}

struct ControllerState {
    status: EngineStatus,
    progress: Option<LoadProgress>,
    error_message: Option<String>,
    /// The error in `error_message` may clear up with a retry
    error_retryable: bool,
    /// A heartbeat asked for fail-over while the controller was busy
    pending_failover: bool,
    active_key: Option<ConversationKey>,
    /// Committed and injected messages of the active key
    history: Vec<Message>,
    /// `history` has messages the store has not seen yet
    dirty: bool,
    inflight: Option<Inflight>,
    snapshot: ContextSnapshot,
    /// Context built while generating, applied once the generation ends
    pending_snapshot: Option<ContextSnapshot>,
}

pub struct ChatController {
    registry: Arc<EngineRegistry>,
    detector: Arc<AvailabilityDetector>,
    transcripts: Arc<dyn TranscriptStore>,
    notes: Arc<dyn NoteSource>,
    state: Mutex<ControllerState>,
    /// Serializes transcript loads and saves
    store_lock: tokio::sync::Mutex<()>,
    /// Serializes detection runs
    detect_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ControllerEvent>,
    next_generation: AtomicU64,
}

impl ChatController {
    pub fn new(
        registry: Arc<EngineRegistry>,
        detector: Arc<AvailabilityDetector>,
        transcripts: Arc<dyn TranscriptStore>,
        notes: Arc<dyn NoteSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            registry,
            detector,
            transcripts,
            notes,
            state: Mutex::new(ControllerState {
                status: EngineStatus::Detecting,
                progress: None,
                error_message: None,
                error_retryable: false,
                pending_failover: false,
                active_key: None,
                history: Vec::new(),
                dirty: false,
                inflight: None,
                snapshot: ContextSnapshot::Empty,
                pending_snapshot: None,
            }),
            store_lock: tokio::sync::Mutex::new(()),
            detect_lock: tokio::sync::Mutex::new(()),
            events,
            next_generation: AtomicU64::new(1),
        })
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        self.state.lock().status
    }

    /// Only set while loading.
    pub fn progress(&self) -> Option<LoadProgress> {
        self.state.lock().progress
    }

    pub fn error_message(&self) -> Option<String> {
        self.state.lock().error_message.clone()
    }

    /// Whether the current error is worth a retry. False outside `error`.
    pub fn error_is_retryable(&self) -> bool {
        let state = self.state.lock();
        state.status == EngineStatus::Error && state.error_retryable
    }

    pub fn active_key(&self) -> Option<ConversationKey> {
        self.state.lock().active_key.clone()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.state.lock().snapshot.clone()
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<AvailabilityDetector> {
        &self.detector
    }

    /// The transcript of the active key, including an in-flight pair that
    /// belongs to it.
    pub fn messages(&self) -> Vec<Message> {
        let state = self.state.lock();
        let mut out = state.history.clone();
        if let Some(inflight) = &state.inflight {
            if inflight.key == state.active_key {
                out.push(inflight.user.clone());
                out.extend(inflight.assistant.clone());
            }
        }
        out
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, state: &mut ControllerState, status: EngineStatus) {
        if state.status == status {
            return;
        }
        debug!(from = state.status.as_str(), to = status.as_str(), "status");
        state.status = status;
        if status != EngineStatus::Loading {
            state.progress = None;
        }
        if status != EngineStatus::Error {
            state.error_message = None;
        }
        self.emit(ControllerEvent::StatusChanged(status));
    }

    fn update_status(&self, status: EngineStatus) {
        let mut state = self.state.lock();
        self.set_status(&mut state, status);
    }

    fn fail(&self, error: &EngineError) {
        warn!(error = %error, "engine unusable");
        self.registry.report_error(Some(error.to_string()));
        let mut state = self.state.lock();
        self.set_status(&mut state, EngineStatus::Error);
        state.error_message = Some(error.to_string());
        state.error_retryable = error.is_retryable();
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start listening for availability changes and run the first detection.
    pub async fn start(self: &Arc<Self>) -> EngineStatus {
        self.spawn_availability_listener();
        self.detect(ProbeReason::Startup).await
    }

    fn spawn_availability_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.detector.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let change = match rx.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.on_availability_change(change).await;
            }
        })
    }

    /// Background fail-over: only heartbeat changes are acted on. A change
    /// arriving while busy is kept and applied once the controller is ready.
    async fn on_availability_change(self: &Arc<Self>, change: AvailabilityChange) {
        if change.reason != ProbeReason::Heartbeat || !self.needs_failover(change.available) {
            return;
        }
        {
            let mut state = self.state.lock();
            match state.status {
                EngineStatus::Ready => {}
                EngineStatus::Error => return,
                _ => {
                    debug!(available = change.available, "fail-over deferred");
                    state.pending_failover = true;
                    return;
                }
            }
        }
        self.detect(ProbeReason::Heartbeat).await;
    }

    /// The daemon dropped while active, or came back while preferred.
    fn needs_failover(&self, daemon_available: bool) -> bool {
        let active = self.registry.active_backend();
        if daemon_available {
            active != BackendKind::LocalDaemon
                && self.registry.preferred_backend() == BackendKind::LocalDaemon
                && self.registry.is_usable(BackendKind::LocalDaemon)
        } else {
            active == BackendKind::LocalDaemon
        }
    }

    /// Consume a deferred fail-over once ready. True when it still applies.
    fn take_due_failover(&self) -> bool {
        let due = {
            let mut state = self.state.lock();
            state.status == EngineStatus::Ready && std::mem::take(&mut state.pending_failover)
        };
        due && self.needs_failover(self.registry.daemon_available())
    }

    /// Re-run detection. While generating only the daemon probe runs, and the
    /// generation is left alone.
    pub async fn retry_detection(self: &Arc<Self>) -> EngineStatus {
        if self.status() == EngineStatus::Generating {
            self.detector.probe(ProbeReason::Manual).await;
            return EngineStatus::Generating;
        }
        self.detect(ProbeReason::Manual).await
    }

    /// Probe the daemon and activate the first usable backend, preferred one
    /// first. A fail-over requested while this ran is applied right after.
    async fn detect(self: &Arc<Self>, reason: ProbeReason) -> EngineStatus {
        let status = self.detect_once(reason).await;
        if self.take_due_failover() {
            return self.detect_once(ProbeReason::Heartbeat).await;
        }
        status
    }

    async fn detect_once(self: &Arc<Self>, reason: ProbeReason) -> EngineStatus {
        let _guard = self.detect_lock.lock().await;
        {
            let mut state = self.state.lock();
            if state.status == EngineStatus::Generating {
                if reason == ProbeReason::Heartbeat {
                    state.pending_failover = true;
                }
                return EngineStatus::Generating;
            }
            self.set_status(&mut state, EngineStatus::Detecting);
        }

        let daemon_up = self.detector.probe(reason).await;
        let previous = self.registry.active_backend();
        let preferred = self.registry.preferred_backend();

        let mut candidates = vec![preferred];
        for kind in [BackendKind::LocalDaemon, BackendKind::WorkerModel, BackendKind::RemoteApi] {
            if !candidates.contains(&kind) {
                candidates.push(kind);
            }
        }

        let mut last_error = None;
        for kind in candidates {
            match self.try_activate(kind).await {
                Ok(()) => {
                    self.registry.activate(kind);
                    self.registry.report_error(None);
                    if kind != previous {
                        self.emit(ControllerEvent::BackendChanged { kind, reason });
                    }
                    info!(backend = kind.as_str(), daemon_up, "engine ready");
                    self.update_status(EngineStatus::Ready);
                    return EngineStatus::Ready;
                }
                Err(e) => {
                    debug!(backend = kind.as_str(), error = %e, "backend not usable");
                    // a load failure is more useful to show than "not reachable"
                    let replace = last_error
                        .as_ref()
                        .map_or(true, |last| is_unreachable(last) && !is_unreachable(&e));
                    if replace {
                        last_error = Some(e);
                    }
                }
            }
        }

        let error = last_error.unwrap_or(EngineError::NoBackend);
        self.fail(&error);
        EngineStatus::Error
    }

    async fn try_activate(self: &Arc<Self>, kind: BackendKind) -> Result<()> {
        match kind {
            BackendKind::LocalDaemon => {
                if self.registry.is_usable(kind) {
                    Ok(())
                } else if self.registry.daemon_available() {
                    Err(EngineError::NoModelSelected {
                        backend: kind.display_name(),
                    })
                } else {
                    Err(EngineError::DetectionFailure {
                        message: "no response from the local daemon".to_string(),
                    })
                }
            }
            BackendKind::RemoteApi => {
                if self.registry.is_usable(kind) {
                    Ok(())
                } else {
                    Err(EngineError::NoBackend)
                }
            }
            BackendKind::WorkerModel => self.load_worker().await,
        }
    }

    async fn load_worker(self: &Arc<Self>) -> Result<()> {
        let worker = self.registry.worker().ok_or(EngineError::NoBackend)?;
        let model = self
            .registry
            .settings()
            .model_for(BackendKind::WorkerModel)
            .ok_or(EngineError::NoModelSelected {
                backend: BackendKind::WorkerModel.display_name(),
            })?;
        if worker.is_ready() && worker.model_name() == model {
            return Ok(());
        }

        self.update_status(EngineStatus::Loading);
        let result = worker
            .initialize(&model, |progress| {
                let mut state = self.state.lock();
                if state.status == EngineStatus::Loading {
                    state.progress = Some(progress);
                    self.emit(ControllerEvent::Progress(progress));
                }
            })
            .await;
        result.map_err(|failure| match failure.kind {
            WorkerErrorKind::CapabilityMissing => EngineError::CapabilityMissing {
                message: failure.message,
            },
            _ => EngineError::LoadFailure {
                message: failure.message,
            },
        })
    }

    /// Free model resources. A running generation is aborted first. The
    /// controller stays in `detecting` until [`retry_detection`](Self::retry_detection).
    pub async fn unload_model(self: &Arc<Self>) {
        loop {
            if self.status() == EngineStatus::Generating {
                let _ = self.abort_generation().await;
            }
            let _guard = self.detect_lock.lock().await;
            {
                let mut state = self.state.lock();
                // a new message slipped in after the abort
                if state.status == EngineStatus::Generating {
                    continue;
                }
                self.set_status(&mut state, EngineStatus::Detecting);
            }
            if let Some(worker) = self.registry.worker() {
                worker.unload();
            }
            info!("model unloaded");
            return;
        }
    }

    /// Persist a new preferred backend and bring it up.
    pub async fn switch_backend(self: &Arc<Self>, kind: BackendKind) -> Result<EngineStatus> {
        self.ensure_not_generating()?;
        self.registry.select_backend(kind);
        Ok(self.detect(ProbeReason::Manual).await)
    }

    /// Select a model for the active backend. The worker reloads; HTTP
    /// backends pick it up with the next request.
    pub async fn switch_model(self: &Arc<Self>, model_id: &str) -> Result<EngineStatus> {
        self.ensure_not_generating()?;
        self.registry.select_model(model_id);
        if self.registry.active_backend() == BackendKind::WorkerModel {
            return Ok(self.detect(ProbeReason::Manual).await);
        }
        Ok(self.status())
    }

    fn ensure_not_generating(&self) -> Result<()> {
        if self.status() == EngineStatus::Generating {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    // ── Generation ───────────────────────────────────────────────────

    /// Start a generation for `text`. Only valid while `ready`; a second call
    /// while generating is rejected with [`EngineError::Busy`].
    ///
    /// The returned task finishes once the reply has been committed.
    pub fn send_message(self: &Arc<Self>, text: &str) -> Result<JoinHandle<()>> {
        let text = text.trim();
        let mut state = self.state.lock();
        match state.status {
            EngineStatus::Ready => {}
            EngineStatus::Generating => return Err(EngineError::Busy),
            status => {
                return Err(EngineError::InvalidState {
                    operation: "send a message",
                    status,
                })
            }
        }
        if text.is_empty() {
            return Err(EngineError::InvalidState {
                operation: "send an empty message",
                status: state.status,
            });
        }
        let client = self.registry.active_client()?;

        let user = Message::new(Role::User, text);
        let mut request = Vec::with_capacity(state.history.len() + 2);
        request.push(ChatMessage::system(compose_system_message(
            client.kind(),
            &state.snapshot,
        )));
        request.extend(state.history.iter().map(Message::to_chat));
        request.push(user.to_chat());

        let id = self.next_generation.fetch_add(1, Ordering::SeqCst);
        state.inflight = Some(Inflight {
            id,
            key: state.active_key.clone(),
            user,
            assistant: None,
            cancel: None,
        });
        self.set_status(&mut state, EngineStatus::Generating);
        drop(state);

        debug!(id, backend = client.kind().as_str(), "generation started");
        Ok(tokio::spawn(self.clone().run_generation(id, client, request)))
    }

    async fn run_generation(
        self: Arc<Self>,
        id: u64,
        client: Arc<dyn ChatBackend>,
        request: Vec<ChatMessage>,
    ) {
        let mut stream = match client.stream_chat(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.finish(id, Outcome::Failed(e.to_string())).await;
                return;
            }
        };

        let registered = {
            let mut state = self.state.lock();
            match state.inflight.as_mut() {
                Some(inflight) if inflight.id == id => {
                    inflight.cancel = Some(stream.cancel_handle());
                    true
                }
                _ => false,
            }
        };
        if !registered {
            // aborted before the request was open
            stream.cancel();
            return;
        }

        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Token(text) => {
                    if !self.apply_token(id, &text) {
                        stream.cancel();
                        return;
                    }
                }
                StreamChunk::Done => {
                    self.finish(id, Outcome::Completed).await;
                    return;
                }
                StreamChunk::Error(message) => {
                    self.finish(id, Outcome::Failed(message)).await;
                    return;
                }
            }
        }
        // ended without a terminal chunk: cancelled at the backend
        self.finish(id, Outcome::Aborted).await;
    }

    /// Append a token to generation `id`. Returns false when that generation
    /// is no longer current; the token is dropped.
    fn apply_token(&self, id: u64, text: &str) -> bool {
        let mut state = self.state.lock();
        let Some(inflight) = state.inflight.as_mut().filter(|f| f.id == id) else {
            return false;
        };
        inflight
            .assistant
            .get_or_insert_with(Message::streaming_assistant)
            .append(text);
        let key = inflight
            .key
            .as_ref()
            .map(ConversationKey::storage_key)
            .unwrap_or_default();
        self.emit(ControllerEvent::Token {
            key,
            text: text.to_string(),
        });
        true
    }

    /// Stop the running generation, keep what was produced and return to
    /// `ready`.
    pub async fn abort_generation(self: &Arc<Self>) -> Result<()> {
        let (id, cancel) = {
            let state = self.state.lock();
            match (&state.inflight, state.status) {
                (Some(inflight), EngineStatus::Generating) => (inflight.id, inflight.cancel.clone()),
                (_, status) => {
                    return Err(EngineError::InvalidState {
                        operation: "abort",
                        status,
                    })
                }
            }
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        info!(id, "generation aborted");
        self.finish(id, Outcome::Aborted).await;
        Ok(())
    }

    async fn finish(self: &Arc<Self>, id: u64, outcome: Outcome) {
        let Some(commit) = self.settle(id, outcome) else {
            return;
        };
        if let Some(commit) = commit {
            self.commit(commit).await;
        }
        if self.take_due_failover() {
            self.detect(ProbeReason::Heartbeat).await;
        }
    }

    /// Freeze generation `id` and return to `ready`. Returns `None` if it was
    /// already settled, `Some(None)` when there is no key to commit under.
    fn settle(&self, id: u64, outcome: Outcome) -> Option<Option<Commit>> {
        let mut state = self.state.lock();
        if state.inflight.as_ref().map(|f| f.id) != Some(id) {
            return None;
        }
        let inflight = state.inflight.take()?;

        let mut assistant = inflight.assistant.unwrap_or_else(Message::streaming_assistant);
        assistant.freeze();
        let pair = vec![inflight.user, assistant];

        match &outcome {
            Outcome::Completed => debug!(id, "generation complete"),
            Outcome::Aborted => {}
            Outcome::Failed(message) => {
                let error = EngineError::StreamFailure {
                    message: message.clone(),
                };
                warn!(id, error = %error, "generation failed");
                self.emit(ControllerEvent::Notice(error.to_string()));
            }
        }

        // without a key the pair lives in memory only
        if inflight.key == state.active_key {
            state.history.extend(pair.iter().cloned());
            state.dirty |= inflight.key.is_some();
        }
        if let Some(snapshot) = state.pending_snapshot.take() {
            state.snapshot = snapshot;
        }
        if state.status == EngineStatus::Generating {
            self.set_status(&mut state, EngineStatus::Ready);
        }

        Some(inflight.key.map(|key| Commit {
            key,
            messages: pair,
        }))
    }

    /// Write a settled pair under its own key, whether or not that key is
    /// still active.
    async fn commit(&self, commit: Commit) {
        let _guard = self.store_lock.lock().await;
        let storage_key = commit.key.storage_key();

        let active_history = {
            let mut state = self.state.lock();
            if state.active_key.as_ref() == Some(&commit.key) {
                state.dirty = false;
                Some(state.history.clone())
            } else {
                None
            }
        };
        let messages = match active_history {
            Some(history) => history,
            None => match self.transcripts.load(&storage_key).await {
                Ok(mut stored) => {
                    for message in commit.messages {
                        if !stored.iter().any(|m| m.id == message.id) {
                            stored.push(message);
                        }
                    }
                    stored
                }
                Err(e) => {
                    let error = EngineError::from(e);
                    warn!(key = %commit.key, error = %error, "not committing to unreadable transcript");
                    self.emit(ControllerEvent::Notice(error.to_string()));
                    return;
                }
            },
        };

        match self.transcripts.save(&storage_key, &messages).await {
            Ok(()) => self.emit(ControllerEvent::Committed { key: storage_key }),
            Err(e) => {
                let error = EngineError::from(e);
                warn!(key = %commit.key, error = %error, "commit failed");
                self.emit(ControllerEvent::Notice(error.to_string()));
            }
        }
    }

    // ── Transcripts ──────────────────────────────────────────────────

    /// Make `key` the active conversation and load its transcript. Unsaved
    /// messages of the previous key are flushed first. A generation running
    /// for the previous key keeps going and commits to that key.
    pub async fn load_chat_history(&self, key: ConversationKey) -> Vec<Message> {
        let _guard = self.store_lock.lock().await;
        self.switch_key(Some(key.clone())).await;

        let loaded = match self.transcripts.load(&key.storage_key()).await {
            Ok(messages) => messages,
            Err(e) => {
                let error = EngineError::from(e);
                warn!(key = %key, error = %error, "starting with an empty transcript");
                self.emit(ControllerEvent::Notice(error.to_string()));
                Vec::new()
            }
        };

        let mut state = self.state.lock();
        if state.active_key.as_ref() == Some(&key) {
            let mut merged = loaded;
            for message in &mut merged {
                message.freeze();
            }
            for message in state.history.drain(..) {
                if !merged.iter().any(|m| m.id == message.id) {
                    merged.push(message);
                }
            }
            state.history = merged;
        }
        drop(state);
        self.messages()
    }

    /// Flush the active key if needed and switch to `key` with an empty
    /// history. Caller holds `store_lock`.
    async fn switch_key(&self, key: Option<ConversationKey>) {
        let flush = {
            let mut state = self.state.lock();
            let flush = match (&state.active_key, state.dirty) {
                (Some(old), true) => Some((old.clone(), state.history.clone())),
                _ => None,
            };
            state.active_key = key;
            state.history.clear();
            state.dirty = false;
            flush
        };
        if let Some((old, history)) = flush {
            if let Err(e) = self.transcripts.save(&old.storage_key(), &history).await {
                let error = EngineError::from(e);
                warn!(key = %old, error = %error, "could not save transcript");
                self.emit(ControllerEvent::Notice(error.to_string()));
            }
        }
    }

    /// Append a message without calling a backend.
    pub fn inject_message(&self, role: Role, content: &str) {
        let mut state = self.state.lock();
        state.history.push(Message::new(role, content));
        state.dirty = true;
    }

    /// Empty the in-memory transcript of the active key. Stored messages are
    /// not touched.
    pub fn clear_messages(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.dirty = false;
    }

    /// Inject the markdown hint unless the active transcript already has
    /// messages. Returns whether it was injected.
    fn ensure_markdown_hint(&self) -> bool {
        let empty = {
            let state = self.state.lock();
            let inflight_here = state
                .inflight
                .as_ref()
                .is_some_and(|f| f.key.is_some() && f.key == state.active_key);
            state.history.is_empty() && !inflight_here
        };
        if empty {
            self.inject_message(Role::Assistant, MARKDOWN_HINT);
        }
        empty
    }

    // ── Context ──────────────────────────────────────────────────────

    /// Open a document. A new or empty document starts with a clean
    /// transcript; markdown documents get the hint when their transcript is
    /// empty.
    pub async fn open_file(&self, path: impl Into<PathBuf>, name: &str, content: &str, is_new: bool) {
        let path: PathBuf = path.into();
        let key = ConversationKey::file(&path);
        if is_new || content.trim().is_empty() {
            let _guard = self.store_lock.lock().await;
            self.switch_key(Some(key.clone())).await;
        } else {
            self.load_chat_history(key.clone()).await;
        }
        if key.is_markdown() && self.ensure_markdown_hint() {
            debug!(key = %key, "injected markdown hint");
        }
        self.set_snapshot(ContextSnapshot::file(path, name, content));
    }

    /// Open a folder; `files` are its non-directory children.
    pub async fn open_folder(&self, name: &str, files: &[NoteFile]) {
        self.load_chat_history(ConversationKey::folder(name)).await;
        let snapshot = ContextSnapshot::folder(self.notes.as_ref(), Some(name.to_string()), files).await;
        self.set_snapshot(snapshot);
    }

    /// Open the whole library; `files` are all its files.
    pub async fn open_root(&self, files: &[NoteFile]) {
        self.load_chat_history(ConversationKey::Root).await;
        let snapshot = ContextSnapshot::folder(self.notes.as_ref(), None, files).await;
        self.set_snapshot(snapshot);
    }

    /// Nothing is open: no key, no context.
    pub async fn close_target(&self) {
        let _guard = self.store_lock.lock().await;
        self.switch_key(None).await;
        self.set_snapshot(ContextSnapshot::Empty);
    }

    /// Live edit of the open document.
    pub fn update_file_content(&self, content: &str) {
        let snapshot = {
            let state = self.state.lock();
            let current = state.pending_snapshot.as_ref().unwrap_or(&state.snapshot);
            match current {
                ContextSnapshot::File { path, name, .. } => {
                    ContextSnapshot::file(path.clone(), name.clone(), content)
                }
                _ => return,
            }
        };
        self.set_snapshot(snapshot);
    }

    fn set_snapshot(&self, snapshot: ContextSnapshot) {
        let mut state = self.state.lock();
        if state.status == EngineStatus::Generating {
            state.pending_snapshot = Some(snapshot);
        } else {
            state.snapshot = snapshot;
            state.pending_snapshot = None;
        }
    }

    /// Refresh the daemon model list.
    pub async fn refresh_models(&self) -> Vec<providers::ModelDescriptor> {
        self.registry.refresh_daemon_status().await;
        self.registry.daemon_models()
    }
}

fn is_unreachable(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::DetectionFailure { .. } | EngineError::NoBackend
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FsNoteSource;
    use crate::settings_store::MemorySettingsStore;
    use crate::transcript::InMemoryTranscriptStore;
    use anyhow::anyhow;
    use providers::{InferenceEngine, LoadUpdate, WorkerRuntime};
    use shared::settings::EngineSettings;
    use std::ops::ControlFlow;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Engine whose replies are scripted: every `generate` call takes the
    /// next reply from the queue (or repeats the last one).
    struct ScriptedEngine {
        replies: Vec<Vec<&'static str>>,
        fail_with: Option<&'static str>,
        token_delay: Duration,
        accelerated: bool,
        generations: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    impl InferenceEngine for ScriptedEngine {
        fn has_acceleration(&self) -> bool {
            self.accelerated
        }

        fn load(&mut self, _model_id: &str, progress: &mut dyn FnMut(LoadUpdate)) -> anyhow::Result<()> {
            progress(LoadUpdate {
                fraction: 0.5,
                text: "Fetching param cache".into(),
            });
            Ok(())
        }

        fn generate(
            &mut self,
            messages: &[ChatMessage],
            on_token: &mut dyn FnMut(&str) -> ControlFlow<()>,
        ) -> anyhow::Result<()> {
            let n = self.generations.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(messages.to_vec());
            let reply = self
                .replies
                .get(n)
                .or(self.replies.last())
                .cloned()
                .unwrap_or_default();
            for token in reply {
                std::thread::sleep(self.token_delay);
                if on_token(token).is_break() {
                    return Ok(());
                }
            }
            match self.fail_with {
                Some(message) => Err(anyhow!(message)),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        controller: Arc<ChatController>,
        transcripts: Arc<InMemoryTranscriptStore>,
        generations: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    fn engine(replies: Vec<Vec<&'static str>>, token_delay: Duration) -> ScriptedEngine {
        ScriptedEngine {
            replies,
            fail_with: None,
            token_delay,
            accelerated: true,
            generations: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn harness(engine: ScriptedEngine) -> Harness {
        let mut settings = EngineSettings::default();
        settings.backend = BackendKind::WorkerModel;
        // nothing listens here, so the daemon is never available
        settings.daemon.port = 9;
        let (h, status) = build(settings, engine).await;
        assert_eq!(status, EngineStatus::Ready);
        h
    }

    async fn build(settings: EngineSettings, engine: ScriptedEngine) -> (Harness, EngineStatus) {
        let generations = engine.generations.clone();
        let requests = engine.requests.clone();
        let worker = Arc::new(WorkerRuntime::spawn(engine).unwrap());
        let registry = Arc::new(EngineRegistry::new(
            Arc::new(MemorySettingsStore::new(settings)),
            Some(worker),
        ));
        let detector = Arc::new(
            AvailabilityDetector::new(registry.clone()).with_timeout(Duration::from_millis(200)),
        );
        let transcripts = Arc::new(InMemoryTranscriptStore::new());
        let controller = ChatController::new(
            registry,
            detector,
            transcripts.clone(),
            Arc::new(FsNoteSource::new(".")),
        );
        let status = controller.start().await;
        (
            Harness {
                controller,
                transcripts,
                generations,
                requests,
            },
            status,
        )
    }

    fn daemon_settings(server: &MockServer) -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.backend = BackendKind::LocalDaemon;
        settings.daemon.host = server.address().ip().to_string();
        settings.daemon.port = server.address().port();
        settings
    }

    fn tags_body() -> serde_json::Value {
        serde_json::json!({"models": [{"name": "llama3.2:3b", "size": 2_000_000_000u64}]})
    }

    fn file_key(path: &str) -> ConversationKey {
        ConversationKey::file(path)
    }

    #[tokio::test]
    async fn test_committed_reply_is_token_concatenation() {
        let h = harness(engine(vec![vec!["The ", "plan ", "is ", "ready."]], Duration::ZERO)).await;
        h.controller.open_file("/notes/plan.txt", "plan.txt", "Ship v2", false).await;

        h.controller.send_message("status?").unwrap().await.unwrap();

        assert_eq!(h.controller.status(), EngineStatus::Ready);
        let stored = h.transcripts.load("/notes/plan.txt").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[0].content, "status?");
        assert_eq!(stored[1].content, "The plan is ready.");
        assert!(stored.iter().all(|m| !m.is_streaming));
        assert_eq!(h.controller.messages(), stored);
    }

    #[tokio::test]
    async fn test_request_carries_context_and_history() {
        let h = harness(engine(vec![vec!["ok"]], Duration::ZERO)).await;
        h.controller.open_file("/notes/plan.txt", "plan.txt", "Ship v2", false).await;
        h.controller.send_message("first").unwrap().await.unwrap();
        h.controller.update_file_content("Ship v3");
        h.controller.send_message("second").unwrap().await.unwrap();

        let requests = h.requests.lock();
        let last = requests.last().unwrap();
        assert_eq!(last[0].role, Role::System);
        assert!(last[0].content.contains("Ship v3"));
        let turns: Vec<&str> = last[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(turns, vec!["first", "ok", "second"]);
    }

    #[tokio::test]
    async fn test_abort_with_zero_tokens_commits_empty_reply() {
        let h = harness(engine(vec![vec!["late"; 20]], Duration::from_millis(100))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text", false).await;

        let task = h.controller.send_message("hello").unwrap();
        h.controller.abort_generation().await.unwrap();
        assert_eq!(h.controller.status(), EngineStatus::Ready);
        task.await.unwrap();

        let stored = h.transcripts.load("/notes/a.txt").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, Role::Assistant);
        assert_eq!(stored[1].content, "");
        assert!(!stored[1].is_streaming);

        // late tokens from the worker never reach the transcript
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.controller.messages()[1].content, "");
    }

    #[tokio::test]
    async fn test_abort_mid_stream_keeps_partial_reply() {
        let h = harness(engine(vec![vec!["a"; 50]], Duration::from_millis(20))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text", false).await;
        let mut events = h.controller.subscribe();

        let task = h.controller.send_message("go").unwrap();
        loop {
            if let Ok(ControllerEvent::Token { .. }) = events.recv().await {
                break;
            }
        }
        h.controller.abort_generation().await.unwrap();
        task.await.unwrap();

        let messages = h.controller.messages();
        let reply = &messages[1];
        assert!(!reply.is_streaming);
        assert!(!reply.content.is_empty());
        assert!(reply.content.len() < 50);
        assert!(reply.content.chars().all(|c| c == 'a'));
    }

    #[tokio::test]
    async fn test_abort_outside_generation_is_invalid() {
        let h = harness(engine(vec![vec!["x"]], Duration::ZERO)).await;
        assert!(matches!(
            h.controller.abort_generation().await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_send_while_generating_is_rejected() {
        let h = harness(engine(vec![vec!["slow"; 5]], Duration::from_millis(50))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text", false).await;

        let task = h.controller.send_message("one").unwrap();
        assert!(matches!(h.controller.send_message("two"), Err(EngineError::Busy)));
        assert!(matches!(
            h.controller.switch_backend(BackendKind::RemoteApi).await,
            Err(EngineError::Busy)
        ));
        task.await.unwrap();

        assert_eq!(h.generations.load(Ordering::SeqCst), 1);
        let stored = h.transcripts.load("/notes/a.txt").await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_key_switch_during_generation_commits_to_old_key() {
        let h = harness(engine(vec![vec!["for ", "a"]], Duration::from_millis(100))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text a", false).await;
        h.transcripts
            .save("/notes/b.txt", &[Message::new(Role::User, "earlier in b")])
            .await
            .unwrap();

        let task = h.controller.send_message("question for a").unwrap();
        let shown = h.controller.load_chat_history(file_key("/notes/b.txt")).await;
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].content, "earlier in b");
        task.await.unwrap();

        let a = h.transcripts.load("/notes/a.txt").await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].content, "for a");

        let b = h.controller.messages();
        assert_eq!(b.len(), 1);
        assert_eq!(h.transcripts.load("/notes/b.txt").await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_switching_back_shows_inflight_pair() {
        let h = harness(engine(vec![vec!["x"; 10]], Duration::from_millis(30))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text a", false).await;

        let task = h.controller.send_message("q").unwrap();
        h.controller.load_chat_history(file_key("/notes/b.txt")).await;
        let back = h.controller.load_chat_history(file_key("/notes/a.txt")).await;
        assert_eq!(back[0].content, "q");
        task.await.unwrap();

        let messages = h.controller.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "x".repeat(10));
        assert_eq!(h.transcripts.load("/notes/a.txt").await.unwrap(), messages);
    }

    #[tokio::test]
    async fn test_stream_failure_commits_partial_and_notifies() {
        let mut scripted = engine(vec![vec!["par", "tial"]], Duration::ZERO);
        scripted.fail_with = Some("device lost");
        let h = harness(scripted).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text", false).await;
        let mut events = h.controller.subscribe();

        h.controller.send_message("go").unwrap().await.unwrap();

        assert_eq!(h.controller.status(), EngineStatus::Ready);
        assert_eq!(h.controller.messages()[1].content, "partial");
        let mut notices = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ControllerEvent::Notice(n) = event {
                notices.push(n);
            }
        }
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("device lost"));
    }

    #[tokio::test]
    async fn test_new_markdown_file_gets_exactly_one_hint() {
        let h = harness(engine(vec![vec!["x"]], Duration::ZERO)).await;

        h.controller.open_file("/notes/new.md", "new.md", "", true).await;
        let messages = h.controller.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, MARKDOWN_HINT);

        h.controller.open_file("/notes/new.md", "new.md", "", false).await;
        assert_eq!(h.controller.messages().len(), 1);

        // leaving flushes the hint; coming back with content loads it once
        h.controller.open_file("/notes/other.txt", "other.txt", "x", false).await;
        h.controller.open_file("/notes/new.md", "new.md", "# Now with text", false).await;
        let hints = h
            .controller
            .messages()
            .iter()
            .filter(|m| m.content == MARKDOWN_HINT)
            .count();
        assert_eq!(hints, 1);
    }

    #[tokio::test]
    async fn test_non_markdown_files_get_no_hint() {
        let h = harness(engine(vec![vec!["x"]], Duration::ZERO)).await;
        h.controller.open_file("/notes/new.txt", "new.txt", "", true).await;
        assert!(h.controller.messages().is_empty());
    }

    #[tokio::test]
    async fn test_folder_and_root_use_synthetic_keys() {
        let h = harness(engine(vec![vec!["ok"]], Duration::ZERO)).await;

        h.controller.open_folder("Journal", &[]).await;
        h.controller.send_message("summarize").unwrap().await.unwrap();
        assert_eq!(h.transcripts.load("__folder__/Journal").await.unwrap().len(), 2);

        h.controller.open_root(&[]).await;
        assert_eq!(h.controller.active_key(), Some(ConversationKey::Root));
        assert!(h.controller.messages().is_empty());
        assert!(matches!(
            h.controller.snapshot(),
            ContextSnapshot::Folder { name: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_context_edits_while_generating_are_deferred() {
        let h = harness(engine(vec![vec!["a"; 5]], Duration::from_millis(30))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "v1", false).await;

        let task = h.controller.send_message("go").unwrap();
        h.controller.update_file_content("v2");
        assert_eq!(
            h.controller.snapshot(),
            ContextSnapshot::file("/notes/a.txt", "a.txt", "v1")
        );
        task.await.unwrap();
        assert_eq!(
            h.controller.snapshot(),
            ContextSnapshot::file("/notes/a.txt", "a.txt", "v2")
        );
    }

    #[tokio::test]
    async fn test_unload_aborts_then_retry_restores_ready() {
        let h = harness(engine(vec![vec!["a"; 50]], Duration::from_millis(20))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "text", false).await;

        let task = h.controller.send_message("go").unwrap();
        h.controller.unload_model().await;
        task.await.unwrap();
        assert_eq!(h.controller.status(), EngineStatus::Detecting);
        assert_eq!(h.transcripts.load("/notes/a.txt").await.unwrap().len(), 2);
        assert!(h.controller.send_message("again").is_err());

        assert_eq!(h.controller.retry_detection().await, EngineStatus::Ready);
        assert_eq!(h.controller.retry_detection().await, EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_no_backend_is_error_state() {
        let mut settings = EngineSettings::default();
        settings.daemon.port = 9;
        let registry = Arc::new(EngineRegistry::new(
            Arc::new(MemorySettingsStore::new(settings)),
            None,
        ));
        let detector = Arc::new(
            AvailabilityDetector::new(registry.clone()).with_timeout(Duration::from_millis(200)),
        );
        let controller = ChatController::new(
            registry.clone(),
            detector,
            Arc::new(InMemoryTranscriptStore::new()),
            Arc::new(FsNoteSource::new(".")),
        );

        assert_eq!(controller.start().await, EngineStatus::Error);
        assert!(controller.error_message().is_some());
        assert!(registry.last_error().is_some());
        assert!(matches!(
            controller.send_message("hi"),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_daemon_lost_during_generation_fails_over_after_it() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags_body()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(
                        "{\"message\":{\"role\":\"assistant\",\"content\":\"from daemon\"},\"done\":false}\n{\"done\":true}\n",
                    )
                    .set_delay(Duration::from_millis(600)),
            )
            .mount(&server)
            .await;

        let (h, status) = build(daemon_settings(&server), engine(vec![vec!["from worker"]], Duration::ZERO)).await;
        assert_eq!(status, EngineStatus::Ready);
        assert_eq!(h.controller.registry().active_backend(), BackendKind::LocalDaemon);
        h.controller.open_file("/notes/a.txt", "a.txt", "", false).await;

        let task = h.controller.send_message("hi").unwrap();
        // the tags mock is spent, so every heartbeat now sees the daemon down
        let heartbeat = h.controller.detector().spawn_heartbeat(Duration::from_millis(50));
        task.await.unwrap();
        heartbeat.abort();

        assert_eq!(h.controller.messages()[1].content, "from daemon");
        assert_eq!(h.controller.registry().active_backend(), BackendKind::WorkerModel);
        assert_eq!(h.controller.status(), EngineStatus::Ready);
    }

    #[tokio::test]
    async fn test_daemon_regained_while_ready_switches_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tags_body()))
            .mount(&server)
            .await;

        let (h, status) = build(daemon_settings(&server), engine(vec![vec!["ok"]], Duration::ZERO)).await;
        assert_eq!(status, EngineStatus::Ready);
        assert_eq!(h.controller.registry().active_backend(), BackendKind::WorkerModel);

        let mut rx = h.controller.subscribe();
        let heartbeat = h.controller.detector().spawn_heartbeat(Duration::from_millis(50));
        let changed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ControllerEvent::BackendChanged { kind, reason }) = rx.recv().await {
                    break (kind, reason);
                }
            }
        })
        .await
        .unwrap();
        heartbeat.abort();

        assert_eq!(changed, (BackendKind::LocalDaemon, ProbeReason::Heartbeat));
        assert_eq!(h.controller.registry().active_backend(), BackendKind::LocalDaemon);
    }

    #[tokio::test]
    async fn test_detection_during_generation_leaves_it_running() {
        let h = harness(engine(vec![vec!["a", "b", "c", "d", "e"]], Duration::from_millis(30))).await;
        h.controller.open_file("/notes/a.txt", "a.txt", "", false).await;
        let task = h.controller.send_message("go").unwrap();

        assert_eq!(h.controller.detect(ProbeReason::Heartbeat).await, EngineStatus::Generating);
        assert_eq!(h.controller.retry_detection().await, EngineStatus::Generating);
        assert_eq!(h.controller.status(), EngineStatus::Generating);
        assert!(matches!(h.controller.send_message("again"), Err(EngineError::Busy)));

        task.await.unwrap();
        assert_eq!(h.controller.status(), EngineStatus::Ready);
        assert_eq!(h.generations.load(Ordering::SeqCst), 1);
        let stored = h.transcripts.load("/notes/a.txt").await.unwrap();
        assert_eq!(stored[1].content, "abcde");
    }

    #[tokio::test]
    async fn test_turns_without_target_stay_in_context() {
        let h = harness(engine(vec![vec!["one"], vec!["two"]], Duration::ZERO)).await;

        h.controller.send_message("first").unwrap().await.unwrap();
        h.controller.send_message("second").unwrap().await.unwrap();

        let messages = h.controller.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3].content, "two");
        let last = h.requests.lock().last().cloned().unwrap();
        let turns: Vec<&str> = last
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(turns, ["first", "one", "second"]);
    }

    #[tokio::test]
    async fn test_missing_acceleration_is_not_retryable() {
        let mut scripted = engine(vec![vec!["ok"]], Duration::ZERO);
        scripted.accelerated = false;
        let mut settings = EngineSettings::default();
        settings.backend = BackendKind::WorkerModel;
        settings.daemon.port = 9;

        let (h, status) = build(settings, scripted).await;

        assert_eq!(status, EngineStatus::Error);
        assert!(h.controller.error_message().unwrap().contains("acceleration"));
        assert!(!h.controller.error_is_retryable());
    }
}
