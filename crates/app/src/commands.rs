//! Line commands understood by the terminal host.

use shared::settings::BackendKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text: send it to the active backend
    Say(String),
    File(String),
    Folder(String),
    Root,
    Close,
    Backend(BackendKind),
    Model(String),
    Models,
    Daemon { host: String, port: Option<u16> },
    Remote { base_url: String, api_key: String, model: Option<String> },
    TestRemote,
    Abort,
    Retry,
    Unload,
    Clear,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  /file <path>                   open a note (created if missing)
  /folder <path>                 open a folder of notes
  /root                          chat about the whole library
  /close                         close the open note or folder
  /backend <daemon|worker|remote> switch the preferred backend
  /model <name>                  select a model for the active backend
  /models                        list models installed in the daemon
  /daemon <host> [port]          point at another daemon
  /remote <url> <key> [model]    configure the cloud API
  /test-remote                   check the cloud API credentials
  /abort                         stop the reply being generated
  /retry                         re-run backend detection
  /unload                        free the loaded model
  /clear                         clear the visible conversation
  /status                        show engine status
  /quit                          exit
Anything else is sent as a message.";

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let words: Vec<&str> = args.split_whitespace().collect();

    let command = match name {
        "file" => Command::File(required(args, "/file <path>")?),
        "folder" => Command::Folder(required(args, "/folder <path>")?),
        "root" => Command::Root,
        "close" => Command::Close,
        "backend" => {
            let raw = required(args, "/backend <daemon|worker|remote>")?;
            let kind = BackendKind::parse(&raw).ok_or_else(|| format!("Unknown backend: {}", raw))?;
            Command::Backend(kind)
        }
        "model" => Command::Model(required(args, "/model <name>")?),
        "models" => Command::Models,
        "daemon" => match words.as_slice() {
            [host] => Command::Daemon {
                host: host.to_string(),
                port: None,
            },
            [host, port] => Command::Daemon {
                host: host.to_string(),
                port: Some(port.parse().map_err(|_| format!("Invalid port: {}", port))?),
            },
            _ => return Err("Usage: /daemon <host> [port]".to_string()),
        },
        "remote" => match words.as_slice() {
            [url, key] | [url, key, _] => Command::Remote {
                base_url: url.to_string(),
                api_key: key.to_string(),
                model: words.get(2).map(|m| m.to_string()),
            },
            _ => return Err("Usage: /remote <url> <key> [model]".to_string()),
        },
        "test-remote" => Command::TestRemote,
        "abort" | "stop" => Command::Abort,
        "retry" => Command::Retry,
        "unload" => Command::Unload,
        "clear" => Command::Clear,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("Unknown command: /{} (try /help)", other)),
    };
    Ok(Some(command))
}

fn required(args: &str, usage: &str) -> Result<String, String> {
    if args.is_empty() {
        Err(format!("Usage: {}", usage))
    } else {
        Ok(args.to_string())
    }
}
