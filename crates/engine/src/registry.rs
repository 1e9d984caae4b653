//! Engine registry: which backend and model are selected, what the daemon
//! offers, and the persisted connection config.

use parking_lot::RwLock;
use providers::ollama::REFRESH_TIMEOUT;
use providers::{ChatBackend, ModelDescriptor, OllamaClient, OpenAIClient, WorkerRuntime};
use serde::Serialize;
use shared::settings::{BackendKind, DaemonConfigPatch, EngineSettings, RemoteConfigPatch};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::settings_store::SettingsStore;

/// Outcome of the last remote connectivity test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Untested,
    Success,
    Error,
}

/// The backend currently in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub model_name: Option<String>,
    pub is_ready: bool,
}

struct RegistryState {
    settings: EngineSettings,
    /// Differs from `settings.backend` while failed over
    active: BackendKind,
    daemon_available: bool,
    daemon_models: Vec<ModelDescriptor>,
    remote_status: RemoteStatus,
    last_error: Option<String>,
}

impl RegistryState {
    fn daemon_usable(&self) -> bool {
        self.daemon_available && !self.daemon_models.is_empty() && self.settings.daemon_model.is_some()
    }
}

pub struct EngineRegistry {
    state: RwLock<RegistryState>,
    store: Arc<dyn SettingsStore>,
    worker: Option<Arc<WorkerRuntime>>,
    refresh_timeout: Duration,
}

impl EngineRegistry {
    pub fn new(store: Arc<dyn SettingsStore>, worker: Option<Arc<WorkerRuntime>>) -> Self {
        let settings = store.load().unwrap_or_else(|e| {
            warn!(error = %e, "could not load engine settings, using defaults");
            EngineSettings::default()
        });
        info!(backend = settings.backend.as_str(), "engine registry loaded");
        Self {
            state: RwLock::new(RegistryState {
                active: settings.backend,
                settings,
                daemon_available: false,
                daemon_models: Vec::new(),
                remote_status: RemoteStatus::Untested,
                last_error: None,
            }),
            store,
            worker,
            refresh_timeout: REFRESH_TIMEOUT,
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn settings(&self) -> EngineSettings {
        self.state.read().settings.clone()
    }

    /// The backend the user picked.
    pub fn preferred_backend(&self) -> BackendKind {
        self.state.read().settings.backend
    }

    /// The backend requests go to right now.
    pub fn active_backend(&self) -> BackendKind {
        self.state.read().active
    }

    pub fn current_model(&self) -> Option<String> {
        let state = self.state.read();
        state.settings.model_for(state.active)
    }

    pub fn descriptor(&self) -> BackendDescriptor {
        let state = self.state.read();
        let kind = state.active;
        let model_name = state.settings.model_for(kind);
        let is_ready = match kind {
            BackendKind::LocalDaemon => state.daemon_usable(),
            BackendKind::WorkerModel => self.worker.as_ref().is_some_and(|w| w.is_ready()),
            BackendKind::RemoteApi => state.settings.remote.has_credentials(),
        };
        BackendDescriptor {
            kind,
            model_name,
            is_ready,
        }
    }

    pub fn daemon_available(&self) -> bool {
        self.state.read().daemon_available
    }

    pub fn daemon_models(&self) -> Vec<ModelDescriptor> {
        self.state.read().daemon_models.clone()
    }

    pub fn remote_status(&self) -> RemoteStatus {
        self.state.read().remote_status
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn report_error(&self, error: Option<String>) {
        self.state.write().last_error = error;
    }

    pub fn worker(&self) -> Option<Arc<WorkerRuntime>> {
        self.worker.clone()
    }

    /// Persist `kind` as the preferred backend and make it active. The model
    /// last used with `kind` comes back with it.
    pub fn select_backend(&self, kind: BackendKind) -> Option<String> {
        let (settings, model) = {
            let mut state = self.state.write();
            state.settings.backend = kind;
            state.active = kind;
            (state.settings.clone(), state.settings.model_for(kind))
        };
        info!(backend = kind.as_str(), model = ?model, "backend selected");
        self.persist(&settings);
        model
    }

    /// Route requests to `kind` without changing the stored preference.
    pub fn activate(&self, kind: BackendKind) {
        let mut state = self.state.write();
        if state.active != kind {
            debug!(from = state.active.as_str(), to = kind.as_str(), "activating backend");
            state.active = kind;
        }
    }

    /// Remember `model_id` for the active backend.
    pub fn select_model(&self, model_id: &str) {
        let settings = {
            let mut state = self.state.write();
            let active = state.active;
            state.settings.remember_model(active, model_id);
            state.settings.clone()
        };
        self.persist(&settings);
    }

    pub async fn update_daemon_config(&self, patch: DaemonConfigPatch) -> bool {
        let settings = {
            let mut state = self.state.write();
            state.settings.daemon.apply(patch);
            state.settings.clone()
        };
        self.persist(&settings);
        self.refresh_daemon_status().await
    }

    /// Re-read the daemon's model list. Never fails: any error marks the
    /// daemon unreachable with no models.
    pub async fn refresh_daemon_status(&self) -> bool {
        self.probe_daemon(self.refresh_timeout).await
    }

    pub async fn probe_daemon(&self, timeout: Duration) -> bool {
        let config = self.state.read().settings.daemon.clone();
        let client = OllamaClient::new(&config, "");
        match client.list_models(timeout).await {
            Ok(models) => {
                let persist = {
                    let mut state = self.state.write();
                    state.daemon_available = true;
                    let remembered = state.settings.daemon_model.clone();
                    let installed = remembered
                        .as_deref()
                        .is_some_and(|m| models.iter().any(|d| d.name == m));
                    let changed = match models.first() {
                        Some(first) if !installed => {
                            info!(model = %first.name, "auto-selecting daemon model");
                            state.settings.daemon_model = Some(first.name.clone());
                            true
                        }
                        _ => false,
                    };
                    state.daemon_models = models;
                    changed.then(|| state.settings.clone())
                };
                if let Some(settings) = persist {
                    self.persist(&settings);
                }
                true
            }
            Err(e) => {
                warn!(url = %config.base_url(), error = %e, "local daemon not reachable");
                let mut state = self.state.write();
                state.daemon_available = false;
                state.daemon_models.clear();
                false
            }
        }
    }

    pub fn update_remote_config(&self, patch: RemoteConfigPatch) {
        let settings = {
            let mut state = self.state.write();
            state.settings.remote.apply(patch);
            state.remote_status = RemoteStatus::Untested;
            state.settings.clone()
        };
        self.persist(&settings);
    }

    /// One lightweight request with the current credentials. Only the status
    /// flag is updated.
    pub async fn test_remote_connection(&self) -> bool {
        let config = self.state.read().settings.remote.clone();
        let ok = OpenAIClient::from_config(&config).test_connection().await;
        self.state.write().remote_status = if ok {
            RemoteStatus::Success
        } else {
            RemoteStatus::Error
        };
        ok
    }

    /// A client for the active backend.
    pub fn active_client(&self) -> Result<Arc<dyn ChatBackend>> {
        let state = self.state.read();
        match state.active {
            BackendKind::LocalDaemon => {
                let model = state.settings.daemon_model.clone().ok_or(
                    EngineError::NoModelSelected {
                        backend: BackendKind::LocalDaemon.display_name(),
                    },
                )?;
                Ok(Arc::new(OllamaClient::new(&state.settings.daemon, model)))
            }
            BackendKind::WorkerModel => match &self.worker {
                Some(worker) => Ok(worker.clone() as Arc<dyn ChatBackend>),
                None => Err(EngineError::NoBackend),
            },
            BackendKind::RemoteApi => {
                if !state.settings.remote.has_credentials() {
                    return Err(EngineError::NoBackend);
                }
                Ok(Arc::new(OpenAIClient::from_config(&state.settings.remote)))
            }
        }
    }

    /// Whether `kind` could serve requests without loading anything.
    pub fn is_usable(&self, kind: BackendKind) -> bool {
        let state = self.state.read();
        match kind {
            BackendKind::LocalDaemon => state.daemon_usable(),
            BackendKind::WorkerModel => self.worker.is_some(),
            BackendKind::RemoteApi => state.settings.remote.has_credentials(),
        }
    }

    fn persist(&self, settings: &EngineSettings) {
        if let Err(e) = self.store.save(settings) {
            warn!(error = %e, "failed to persist engine settings");
            self.report_error(Some(format!("Settings not saved: {}", e)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings_store::MemorySettingsStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry_for(server: &MockServer) -> (EngineRegistry, Arc<MemorySettingsStore>) {
        let mut settings = EngineSettings::default();
        settings.daemon.host = server.address().ip().to_string();
        settings.daemon.port = server.address().port();
        let store = Arc::new(MemorySettingsStore::new(settings));
        let registry = EngineRegistry::new(store.clone(), None)
            .with_refresh_timeout(Duration::from_millis(200));
        (registry, store)
    }

    fn tags(names: &[&str]) -> ResponseTemplate {
        let models: Vec<serde_json::Value> = names
            .iter()
            .map(|n| serde_json::json!({"name": n, "size": 1_000_000_000u64}))
            .collect();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "models": models }))
    }

    #[tokio::test]
    async fn test_refresh_auto_selects_first_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(tags(&["llama3.2:3b", "qwen2.5:7b"]))
            .mount(&server)
            .await;
        let (registry, store) = registry_for(&server);

        assert!(registry.refresh_daemon_status().await);
        assert!(registry.daemon_available());
        assert_eq!(registry.daemon_models().len(), 2);
        assert_eq!(registry.current_model().as_deref(), Some("llama3.2:3b"));
        assert_eq!(
            store.load().unwrap().daemon_model.as_deref(),
            Some("llama3.2:3b")
        );
        assert!(registry.descriptor().is_ready);
    }

    #[tokio::test]
    async fn test_refresh_keeps_installed_remembered_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(tags(&["llama3.2:3b", "qwen2.5:7b"]))
            .mount(&server)
            .await;
        let (registry, _) = registry_for(&server);
        registry.select_model("qwen2.5:7b");

        registry.refresh_daemon_status().await;
        assert_eq!(registry.current_model().as_deref(), Some("qwen2.5:7b"));
    }

    #[tokio::test]
    async fn test_refresh_timeout_clears_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(tags(&["llama3.2:3b"]))
            .mount(&server)
            .await;
        let (registry, _) = registry_for(&server);
        assert!(registry.refresh_daemon_status().await);

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(tags(&["llama3.2:3b"]).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        assert!(!registry.refresh_daemon_status().await);
        assert!(!registry.daemon_available());
        assert!(registry.daemon_models().is_empty());
    }

    #[tokio::test]
    async fn test_non_2xx_marks_daemon_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (registry, _) = registry_for(&server);

        assert!(!registry.refresh_daemon_status().await);
        assert!(registry.daemon_models().is_empty());
    }

    #[tokio::test]
    async fn test_switching_backend_restores_its_model() {
        let store = Arc::new(MemorySettingsStore::default());
        let registry = EngineRegistry::new(store.clone(), None);

        registry.select_model("llama3.2:3b");
        registry.select_backend(BackendKind::RemoteApi);
        registry.select_model("gpt-4o");
        assert_eq!(registry.current_model().as_deref(), Some("gpt-4o"));

        let restored = registry.select_backend(BackendKind::LocalDaemon);
        assert_eq!(restored.as_deref(), Some("llama3.2:3b"));

        let reopened = EngineRegistry::new(store, None);
        assert_eq!(reopened.preferred_backend(), BackendKind::LocalDaemon);
        assert_eq!(reopened.settings().remote.model_name, "gpt-4o");
    }

    #[tokio::test]
    async fn test_failover_does_not_touch_preference() {
        let registry = EngineRegistry::new(Arc::new(MemorySettingsStore::default()), None);
        registry.activate(BackendKind::RemoteApi);
        assert_eq!(registry.active_backend(), BackendKind::RemoteApi);
        assert_eq!(registry.preferred_backend(), BackendKind::LocalDaemon);
    }

    #[tokio::test]
    async fn test_remote_status_tracks_tests_and_config_changes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;
        let registry = EngineRegistry::new(Arc::new(MemorySettingsStore::default()), None);
        assert_eq!(registry.remote_status(), RemoteStatus::Untested);

        registry.update_remote_config(RemoteConfigPatch {
            base_url: Some(server.uri()),
            api_key: Some("sk-test".into()),
            model_name: None,
        });
        assert!(registry.test_remote_connection().await);
        assert_eq!(registry.remote_status(), RemoteStatus::Success);

        registry.update_remote_config(RemoteConfigPatch {
            api_key: Some("sk-other".into()),
            ..Default::default()
        });
        assert_eq!(registry.remote_status(), RemoteStatus::Untested);
        assert_eq!(registry.active_backend(), BackendKind::LocalDaemon);
    }

    #[tokio::test]
    async fn test_active_client_requires_model_or_credentials() {
        let registry = EngineRegistry::new(Arc::new(MemorySettingsStore::default()), None);
        assert!(matches!(
            registry.active_client(),
            Err(EngineError::NoModelSelected { .. })
        ));

        registry.select_backend(BackendKind::WorkerModel);
        assert!(matches!(registry.active_client(), Err(EngineError::NoBackend)));

        registry.select_backend(BackendKind::RemoteApi);
        assert!(matches!(registry.active_client(), Err(EngineError::NoBackend)));
    }
}
