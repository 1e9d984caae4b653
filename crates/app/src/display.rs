//! Terminal rendering of controller events.

use engine::ChatController;
use shared::events::{ControllerEvent, EngineStatus, LoadStage};
use std::io::Write;
use tokio::sync::broadcast;

/// Turn a raw backend error into something a person can act on.
pub fn format_error_message(error: &str) -> String {
    let error_lower = error.to_lowercase();

    // API key issues
    if error_lower.contains("unauthorized")
        || error_lower.contains("401")
        || error_lower.contains("invalid api key")
    {
        return format!(
            "The cloud API rejected the credentials. Check the key with /remote.\n  ({})",
            error
        );
    }

    if error_lower.contains("rate limit")
        || error_lower.contains("429")
        || error_lower.contains("too many requests")
    {
        return format!(
            "The service is busy right now. Wait a moment and try again.\n  ({})",
            error
        );
    }

    if error_lower.contains("connection")
        || error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("dns")
    {
        return format!(
            "Could not reach the backend. Is it running? /retry checks again.\n  ({})",
            error
        );
    }

    if error_lower.contains("not found") && error_lower.contains("model") {
        return format!(
            "That model is not installed. /models lists what the daemon has.\n  ({})",
            error
        );
    }

    format!("Something went wrong: {}", error)
}

pub fn stage_label(stage: LoadStage) -> &'static str {
    match stage {
        LoadStage::Init => "starting",
        LoadStage::Downloading => "downloading",
        LoadStage::Loading => "loading",
    }
}

/// One-line summary for `/status`.
pub fn status_line(status: EngineStatus, controller: &ChatController) -> String {
    let descriptor = controller.registry().descriptor();
    let model = descriptor.model_name.unwrap_or_else(|| "no model".to_string());
    let mut line = format!(
        "[{}] {} / {}",
        status.as_str(),
        descriptor.kind.display_name(),
        model
    );
    if let Some(error) = controller.error_message() {
        line.push_str(&error_suffix(&error, controller.error_is_retryable()));
    }
    line
}

fn error_suffix(error: &str, retryable: bool) -> String {
    let hint = if retryable {
        "/retry to try again"
    } else {
        "/backend to pick another engine"
    };
    format!(" - {} ({})", format_error_message(error), hint)
}

/// Print controller events until the channel closes. Tokens go to stdout
/// as they arrive; everything else goes to stderr.
pub async fn print_events(mut rx: broadcast::Receiver<ControllerEvent>) {
    let mut streaming = false;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "display lagged behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ControllerEvent::Token { text, .. } => {
                if !streaming {
                    print!("assistant> ");
                    streaming = true;
                }
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            ControllerEvent::StatusChanged(status) => {
                if streaming && status != EngineStatus::Generating {
                    println!();
                    streaming = false;
                }
                eprintln!("  [{}]", status.as_str());
            }
            ControllerEvent::Progress(progress) => {
                eprintln!("  {} {}%", stage_label(progress.stage), progress.progress);
            }
            ControllerEvent::Notice(message) => {
                if streaming {
                    println!();
                    streaming = false;
                }
                eprintln!("  ! {}", format_error_message(&message));
            }
            ControllerEvent::BackendChanged { kind, .. } => {
                eprintln!("  using {}", kind.display_name());
            }
            ControllerEvent::Committed { .. } => {}
        }
    }
}
