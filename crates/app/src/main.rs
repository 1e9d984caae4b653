use anyhow::{Context, Result};
use engine::{
    AvailabilityDetector, ChatController, EngineRegistry, FsNoteSource, JsonSettingsStore,
    JsonTranscriptStore, NoteSource, HEARTBEAT_INTERVAL,
};
use shared::events::EngineStatus;
use shared::message::Message;
use shared::settings::{DaemonConfigPatch, RemoteConfigPatch};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;

use commands::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let notes_root = match std::env::var_os("NOTES_ROOT") {
        Some(root) => PathBuf::from(root),
        None => std::env::current_dir().context("could not read the working directory")?,
    };
    let settings = JsonSettingsStore::open_default()?;
    let transcripts = JsonTranscriptStore::open_default()?;
    info!(
        settings = %settings.path().display(),
        transcripts = %transcripts.dir().display(),
        notes = %notes_root.display(),
        "starting"
    );

    let notes = Arc::new(FsNoteSource::new(notes_root));
    // No in-process inference engine in the terminal host
    let registry = Arc::new(EngineRegistry::new(Arc::new(settings), None));
    let detector = Arc::new(AvailabilityDetector::new(registry.clone()));
    let controller = ChatController::new(
        registry.clone(),
        detector.clone(),
        Arc::new(transcripts),
        notes.clone(),
    );

    tokio::spawn(display::print_events(controller.subscribe()));
    let heartbeat = detector.spawn_heartbeat(HEARTBEAT_INTERVAL);

    let status = controller.start().await;
    eprintln!(
        "{}",
        display::status_line(status, &controller)
    );
    eprintln!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                eprintln!("  {}", usage);
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(e) = run(&controller, &notes, command).await {
            eprintln!("  ! {}", display::format_error_message(&e.to_string()));
        }
    }

    if controller.status() == EngineStatus::Generating {
        let _ = controller.abort_generation().await;
    }
    // flushes unsaved messages of the open note
    controller.close_target().await;
    heartbeat.abort();
    Ok(())
}

async fn run(controller: &Arc<ChatController>, notes: &FsNoteSource, command: Command) -> Result<()> {
    let registry = controller.registry();
    match command {
        Command::Say(text) => {
            // the reply streams in through the event printer
            controller.send_message(&text)?;
        }
        Command::File(raw) => {
            let path = resolve(notes.root(), &raw);
            let name = file_name(&path);
            match notes.read_file(&path).await {
                Ok(content) => controller.open_file(&path, &name, &content, false).await,
                Err(_) if !path.exists() => {
                    tokio::fs::write(&path, "")
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    controller.open_file(&path, &name, "", true).await;
                }
                Err(e) => return Err(e),
            }
            print_transcript(&controller.messages());
        }
        Command::Folder(raw) => {
            let path = resolve(notes.root(), &raw);
            let files = notes.list_children(&path).await?;
            controller.open_folder(&file_name(&path), &files).await;
            eprintln!("  {} files", files.len());
            print_transcript(&controller.messages());
        }
        Command::Root => {
            let files = notes.list_all().await?;
            controller.open_root(&files).await;
            eprintln!("  {} files in the library", files.len());
            print_transcript(&controller.messages());
        }
        Command::Close => controller.close_target().await,
        Command::Backend(kind) => {
            let status = controller.switch_backend(kind).await?;
            eprintln!(
                "{}",
                display::status_line(status, controller)
            );
        }
        Command::Model(name) => {
            controller.switch_model(&name).await?;
            eprintln!("  model: {}", name);
        }
        Command::Models => {
            let models = controller.refresh_models().await;
            if models.is_empty() {
                eprintln!("  No models found. Is the daemon running?");
            }
            let current = registry.current_model();
            for model in models {
                let marker = if current.as_deref() == Some(model.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {:<40} {}", marker, model.name, model.formatted_size);
            }
        }
        Command::Daemon { host, port } => {
            let reachable = registry
                .update_daemon_config(DaemonConfigPatch {
                    host: Some(host),
                    port,
                })
                .await;
            eprintln!(
                "  daemon {}",
                if reachable { "reachable" } else { "not reachable" }
            );
        }
        Command::Remote {
            base_url,
            api_key,
            model,
        } => {
            registry.update_remote_config(RemoteConfigPatch {
                base_url: Some(base_url),
                api_key: Some(api_key),
                model_name: model,
            });
            eprintln!("  cloud API configured; /test-remote to check it");
        }
        Command::TestRemote => {
            registry.test_remote_connection().await;
            eprintln!("  cloud API: {:?}", registry.remote_status());
        }
        Command::Abort => controller.abort_generation().await?,
        Command::Retry => {
            let status = controller.retry_detection().await;
            eprintln!(
                "{}",
                display::status_line(status, controller)
            );
        }
        Command::Unload => controller.unload_model().await,
        Command::Clear => controller.clear_messages(),
        Command::Status => {
            eprintln!(
                "{}",
                display::status_line(controller.status(), controller)
            );
            if let Some(progress) = controller.progress() {
                eprintln!("  {} {}%", display::stage_label(progress.stage), progress.progress);
            }
        }
        Command::Help => println!("{}", commands::HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn resolve(root: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        println!("{}> {}", message.role.as_str(), message.content);
    }
}
