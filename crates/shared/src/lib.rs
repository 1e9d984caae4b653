pub mod events;
pub mod message;

pub mod settings {
    use serde::{Deserialize, Deserializer, Serialize};

    /// The three interchangeable text-generation backends.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
    #[serde(rename_all = "kebab-case")]
    pub enum BackendKind {
        /// Ollama-style daemon on localhost
        #[default]
        #[serde(alias = "ollama")]
        LocalDaemon,
        /// In-process model running on the worker thread
        #[serde(alias = "webllm")]
        WorkerModel,
        /// OpenAI-compatible cloud endpoint
        #[serde(alias = "openai")]
        RemoteApi,
    }

    impl BackendKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                BackendKind::LocalDaemon => "local-daemon",
                BackendKind::WorkerModel => "worker-model",
                BackendKind::RemoteApi => "remote-api",
            }
        }

        pub fn parse(s: &str) -> Option<Self> {
            match s.trim().to_lowercase().as_str() {
                "local-daemon" | "local" | "ollama" | "daemon" => Some(BackendKind::LocalDaemon),
                "worker-model" | "worker" | "webllm" | "builtin" => Some(BackendKind::WorkerModel),
                "remote-api" | "remote" | "openai" | "cloud" => Some(BackendKind::RemoteApi),
                _ => None,
            }
        }

        pub fn display_name(&self) -> &'static str {
            match self {
                BackendKind::LocalDaemon => "Local daemon (Ollama)",
                BackendKind::WorkerModel => "Built-in model",
                BackendKind::RemoteApi => "Cloud API",
            }
        }
    }

    /// Unknown or retired backend names fall back to the local daemon.
    fn lenient_backend<'de, D>(deserializer: D) -> Result<BackendKind, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(BackendKind::parse(&raw).unwrap_or_default())
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct DaemonConfig {
        pub host: String,
        pub port: u16,
    }

    impl Default for DaemonConfig {
        fn default() -> Self {
            Self {
                host: "127.0.0.1".into(),
                port: 11434,
            }
        }
    }

    impl DaemonConfig {
        pub fn base_url(&self) -> String {
            let host = self.host.trim().trim_end_matches('/');
            if host.starts_with("http://") || host.starts_with("https://") {
                format!("{}:{}", host, self.port)
            } else {
                format!("http://{}:{}", host, self.port)
            }
        }

        pub fn apply(&mut self, patch: DaemonConfigPatch) {
            if let Some(host) = patch.host {
                self.host = host;
            }
            if let Some(port) = patch.port {
                self.port = port;
            }
        }
    }

    /// Partial update for [`DaemonConfig`]; `None` fields are left untouched.
    #[derive(Debug, Clone, Default)]
    pub struct DaemonConfigPatch {
        pub host: Option<String>,
        pub port: Option<u16>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct RemoteConfig {
        pub base_url: String,
        pub api_key: String,
        pub model_name: String,
    }

    impl Default for RemoteConfig {
        fn default() -> Self {
            Self {
                base_url: "https://api.openai.com".into(),
                api_key: String::new(),
                model_name: "gpt-4o-mini".into(),
            }
        }
    }

    impl RemoteConfig {
        pub fn has_credentials(&self) -> bool {
            !self.api_key.trim().is_empty()
        }

        pub fn apply(&mut self, patch: RemoteConfigPatch) {
            if let Some(base_url) = patch.base_url {
                self.base_url = base_url;
            }
            if let Some(api_key) = patch.api_key {
                self.api_key = api_key;
            }
            if let Some(model_name) = patch.model_name {
                self.model_name = model_name;
            }
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct RemoteConfigPatch {
        pub base_url: Option<String>,
        pub api_key: Option<String>,
        pub model_name: Option<String>,
    }

    /// Everything the engine registry persists across restarts.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct EngineSettings {
        #[serde(deserialize_with = "lenient_backend")]
        pub backend: BackendKind,
        pub daemon: DaemonConfig,
        pub remote: RemoteConfig,
        /// Last model picked while the local daemon was active
        pub daemon_model: Option<String>,
        /// Last model loaded into the worker runtime
        pub worker_model: Option<String>,
    }

    pub const DEFAULT_WORKER_MODEL: &str = "Qwen2.5-0.5B-Instruct-q4f16_1-MLC";

    impl Default for EngineSettings {
        fn default() -> Self {
            Self {
                backend: BackendKind::LocalDaemon,
                daemon: DaemonConfig::default(),
                remote: RemoteConfig::default(),
                daemon_model: None,
                worker_model: None,
            }
        }
    }

    impl EngineSettings {
        /// The model remembered for `kind`, if any.
        pub fn model_for(&self, kind: BackendKind) -> Option<String> {
            match kind {
                BackendKind::LocalDaemon => self.daemon_model.clone(),
                BackendKind::WorkerModel => Some(
                    self.worker_model
                        .clone()
                        .unwrap_or_else(|| DEFAULT_WORKER_MODEL.to_string()),
                ),
                BackendKind::RemoteApi => Some(self.remote.model_name.clone()),
            }
        }

        pub fn remember_model(&mut self, kind: BackendKind, model: &str) {
            match kind {
                BackendKind::LocalDaemon => self.daemon_model = Some(model.to_string()),
                BackendKind::WorkerModel => self.worker_model = Some(model.to_string()),
                BackendKind::RemoteApi => self.remote.model_name = model.to_string(),
            }
        }
    }
}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    use crate::message::Role;

    /// A message as sent over the wire to a backend.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: Role,
        pub content: String,
    }

    impl ChatMessage {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: content.into(),
            }
        }

        pub fn system(content: impl Into<String>) -> Self {
            Self::new(Role::System, content)
        }

        pub fn user(content: impl Into<String>) -> Self {
            Self::new(Role::User, content)
        }
    }

    /// One item of a streaming chat response.
    ///
    /// A stream yields zero or more `Token`s followed by exactly one terminal
    /// item (`Done` or `Error`), after which it yields nothing.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StreamChunk {
        Token(String),
        Done,
        Error(String),
    }

    impl StreamChunk {
        pub fn is_terminal(&self) -> bool {
            !matches!(self, StreamChunk::Token(_))
        }
    }
}
