//! System prompts, tiered by how much instruction each backend can follow.
//!
//! Small in-process models get a one-line prompt; the local daemon gets the
//! core rules; the remote API gets the full set.

use shared::settings::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTier {
    Lite,
    Standard,
    Full,
}

impl PromptTier {
    pub fn for_backend(kind: BackendKind) -> Self {
        match kind {
            BackendKind::WorkerModel => PromptTier::Lite,
            BackendKind::LocalDaemon => PromptTier::Standard,
            BackendKind::RemoteApi => PromptTier::Full,
        }
    }
}

const IDENTITY: &str =
    "You are the writing assistant inside Quill Notes, working with the user's own notes.";

const LITE_PROMPT: &str =
    "You are the Quill Notes writing assistant. Be brief. Prefer the note content given to you.";

const STANDARD_RULES: &str = r#"
## Ground rules
- Prefer the note content provided below over general knowledge
- Keep answers short and clear

## What you can do
- Find notes by name or content
- Polish, edit and continue a draft
- Summarize a note and pull out key points"#;

const FULL_RULES: &str = r#"
## Ground rules
- Prefer the note content and file previews provided below over general knowledge
- When notes relevant to the question are listed, name them
- Keep answers short and clear

## What you can do
- Find notes in the user's library by name or content
- Polish, edit and continue a draft
- Summarize a note and pull out key points
- Suggest structure, titles and next steps for a piece of writing

## Style
- Answer directly without restating the question
- Friendly, professional tone"#;

pub fn system_prompt(kind: BackendKind) -> String {
    match PromptTier::for_backend(kind) {
        PromptTier::Lite => LITE_PROMPT.to_string(),
        PromptTier::Standard => format!("{}\n{}", IDENTITY, STANDARD_RULES),
        PromptTier::Full => format!("{}\n{}", IDENTITY, FULL_RULES),
    }
}

/// Assistant message shown once in the transcript of a new or empty
/// markdown note.
pub const MARKDOWN_HINT: &str = r#"This note is empty. A quick Markdown refresher:

- `# Title`, `## Section` for headings
- `**bold**`, `*italic*`, `` `code` ``
- `- item` for bullet lists, `1. item` for numbered lists
- `[text](https://example.com)` for links
- `> quote` for quotations

Ask me to draft an outline, continue your text, or tidy up what you write."#;
