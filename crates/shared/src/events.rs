//! Status and event types observed by the UI.

use serde::{Deserialize, Serialize};

use crate::settings::BackendKind;

/// Lifecycle of the chat engine as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Probing for a usable backend
    Detecting,
    /// A backend is initialising (daemon handshake or worker model load)
    Loading,
    /// Idle and accepting input
    Ready,
    /// A chat request is in flight
    Generating,
    /// No backend is usable until a retry
    Error,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Detecting => "detecting",
            EngineStatus::Loading => "loading",
            EngineStatus::Ready => "ready",
            EngineStatus::Generating => "generating",
            EngineStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStage {
    Init,
    Downloading,
    Loading,
}

/// Model load progress; only meaningful while the status is `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub stage: LoadStage,
    /// 0..=100
    pub progress: u8,
}

impl LoadProgress {
    pub fn new(stage: LoadStage, progress: u8) -> Self {
        Self {
            stage,
            progress: progress.min(100),
        }
    }

    /// Build from a 0.0..=1.0 fraction as reported by inference engines.
    pub fn from_fraction(stage: LoadStage, fraction: f32) -> Self {
        let pct = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        Self::new(stage, pct)
    }
}

/// Why a daemon probe ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeReason {
    Startup,
    Heartbeat,
    Manual,
}

/// Emitted by the availability detector when daemon reachability flips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityChange {
    pub available: bool,
    pub reason: ProbeReason,
}

/// Events published by the chat controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StatusChanged(EngineStatus),
    Progress(LoadProgress),
    /// A token was appended to the streaming message of the active conversation
    Token { key: String, text: String },
    /// A finished message pair was written to the transcript store
    Committed { key: String },
    /// One-shot, non-blocking notice (stream failures, persistence trouble)
    Notice(String),
    BackendChanged {
        kind: BackendKind,
        reason: ProbeReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(LoadProgress::new(LoadStage::Loading, 250).progress, 100);
        assert_eq!(
            LoadProgress::from_fraction(LoadStage::Downloading, 0.426).progress,
            43
        );
        assert_eq!(LoadProgress::from_fraction(LoadStage::Init, -1.0).progress, 0);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&EngineStatus::Generating).unwrap();
        assert_eq!(json, "\"generating\"");
    }
}
