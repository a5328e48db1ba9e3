//! Prompt assembly for the agent.
//!
//! The agent runs with full access to the host, so every prompt opens with
//! a read-only policy and states whether the current message is allowed to
//! change anything. Execution is allowed only when the message contains one
//! of [`EXECUTION_KEYWORDS`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::history::ConversationHistory;

/// Words that grant execution when present anywhere in a message.
pub const EXECUTION_KEYWORDS: &[&str] = &[
    "выполни",
    "сделай",
    "запусти",
    "исправь",
    "создай",
    "удали",
    "restart",
    "перезапусти",
];

/// Prefix added to messages without execution intent.
pub const INFO_ONLY_MARKER: &str = "[ТОЛЬКО ИНФОРМАЦИЯ, НЕ ВЫПОЛНЯТЬ КОМАНДЫ]";

/// Prefix for requests generated from an uploaded file.
pub const FILE_READ_MARKER: &str = "[РАЗРЕШЕНО ЧИТАТЬ ФАЙЛЫ]";

/// Caption used when a file arrives without one.
pub const DEFAULT_FILE_CAPTION: &str = "проанализируй этот файл";

const ELLIPSIS: &str = "...";

/// Prompt shaping options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// How many past turns are included.
    pub max_context_messages: usize,
    /// Assistant turns longer than this are cut and end in `...`.
    pub assistant_excerpt_chars: usize,
    /// Name of the chat transport as shown to the agent.
    pub interface: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_context_messages: 10,
            assistant_excerpt_chars: 500,
            interface: "Telegram".to_string(),
        }
    }
}

/// Whether `message` explicitly asks for a state-changing action.
pub fn detect_execution_intent(message: &str) -> bool {
    let lowered = message.to_lowercase();
    EXECUTION_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

/// Build the full text written to the agent's stdin.
pub fn build_prompt(
    config: &PromptConfig,
    message: &str,
    history: &ConversationHistory,
    needs_execution: bool,
) -> String {
    let mut prompt = preamble(&config.interface, needs_execution);

    let context = render_context(config, history);
    if !context.is_empty() {
        prompt.push_str("Previous context:\n");
        prompt.push_str(&context.join("\n"));
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!("Current request (from {}): ", config.interface));
    if !needs_execution {
        prompt.push_str(INFO_ONLY_MARKER);
        prompt.push(' ');
    }
    prompt.push_str(message);
    prompt
}

fn preamble(interface: &str, needs_execution: bool) -> String {
    let mode = if needs_execution {
        "Execution allowed (user explicitly requested action)"
    } else {
        "Information only (no execution)"
    };

    format!(
        "IMPORTANT CONTEXT: You are being accessed through a {interface} bot.\n\
         The user is writing to you from their phone/computer via {interface}.\n\
         Responses will be shown in a {interface} chat, so keep them concise and well-formatted.\n\
         \n\
         CRITICAL RULES - YOU MUST FOLLOW:\n\
         1. DO NOT execute ANY system commands unless the message explicitly says \"выполни\", \"сделай\", \"запусти\" or \"restart\"\n\
         2. If user just mentions something or asks about status - ONLY provide information\n\
         3. NEVER run systemctl, apt, rm, or any modifying commands without explicit request\n\
         4. For messages like \"пока оставим так\", \"хм\", \"ладно\" - just acknowledge, don't do anything\n\
         5. Default mode is READ-ONLY - only analyze and inform\n\
         6. Example: \"swap используется\" = explain, don't fix. \"очисти swap\" = then execute\n\
         7. Remember: The user is communicating via {interface}, not directly in terminal\n\
         \n\
         CURRENT MODE: {mode}\n\
         INTERFACE: {interface} Bot\n\n"
    )
}

fn render_context(config: &PromptConfig, history: &ConversationHistory) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in history.recent(config.max_context_messages) {
        if !entry.user.is_empty() {
            lines.push(format!("User: {}", entry.user));
        }
        if !entry.assistant.is_empty() {
            lines.push(format!(
                "Assistant: {}",
                excerpt(&entry.assistant, config.assistant_excerpt_chars)
            ));
        }
    }
    lines
}

/// `text` cut to `limit` chars with `...` appended when it was longer.
pub(crate) fn excerpt(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Broad category of an uploaded file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Code,
    Text,
    Unknown,
}

impl FileKind {
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" => FileKind::Image,
            "py" | "js" | "ts" | "java" | "cpp" | "c" | "h" | "go" | "rs" | "rb" | "php" => {
                FileKind::Code
            }
            "txt" | "json" | "md" | "log" | "yaml" | "yml" | "toml" | "ini" | "cfg" | "sh"
            | "bash" => FileKind::Text,
            _ => FileKind::Unknown,
        }
    }

    /// Instruction that precedes the caption.
    pub fn hint(&self) -> &'static str {
        match self {
            FileKind::Image => "Посмотри изображение и",
            FileKind::Code => "Прочитай код и",
            FileKind::Text => "Прочитай файл и",
            FileKind::Unknown => "Проанализируй файл и",
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileKind::Image => write!(f, "image"),
            FileKind::Code => write!(f, "code"),
            FileKind::Text => write!(f, "text"),
            FileKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A request generated for an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub kind: FileKind,
    /// Message handed to the executor.
    pub message: String,
    /// Short form for history and command logs.
    pub label: String,
}

/// Turn an uploaded file into a request. A blank caption falls back to
/// [`DEFAULT_FILE_CAPTION`].
pub fn file_request(file_name: &str, path: &Path, caption: Option<&str>) -> FileRequest {
    let kind = FileKind::from_name(file_name);
    let caption = caption
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_FILE_CAPTION);

    FileRequest {
        kind,
        message: format!(
            "{FILE_READ_MARKER} {} {caption}. Файл: {}",
            kind.hint(),
            path.display()
        ),
        label: format!("[Файл: {file_name}] {caption}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_is_case_insensitive() {
        assert!(detect_execution_intent("Пожалуйста, ВЫПОЛНИ обновление"));
        assert!(detect_execution_intent("please RESTART nginx"));
        assert!(!detect_execution_intent("Привет"));
        assert!(!detect_execution_intent("swap используется"));
    }

    #[test]
    fn info_only_prompt_is_marked() {
        let prompt = build_prompt(
            &PromptConfig::default(),
            "Привет",
            &ConversationHistory::new(),
            false,
        );
        assert!(prompt.contains("CURRENT MODE: Information only (no execution)"));
        assert!(prompt.ends_with(&format!(
            "Current request (from Telegram): {INFO_ONLY_MARKER} Привет"
        )));
        assert!(!prompt.contains("Previous context:"));
    }

    #[test]
    fn execution_prompt_is_not_marked() {
        let prompt = build_prompt(
            &PromptConfig::default(),
            "перезапусти nginx",
            &ConversationHistory::new(),
            true,
        );
        assert!(prompt.contains("CURRENT MODE: Execution allowed"));
        assert!(!prompt.contains(INFO_ONLY_MARKER));
        assert!(prompt.ends_with("перезапусти nginx"));
    }

    #[test]
    fn context_window_and_truncation() {
        let config = PromptConfig {
            max_context_messages: 2,
            assistant_excerpt_chars: 5,
            ..PromptConfig::default()
        };
        let mut history = ConversationHistory::new();
        history.push("first", "dropped");
        history.push("second", "ответ длиннее пяти");
        history.push("third", "");

        let prompt = build_prompt(&config, "now", &history, false);
        assert!(!prompt.contains("first"));
        assert!(prompt.contains(
            "Previous context:\nUser: second\nAssistant: ответ ...\nUser: third\n\n"
        ));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn excerpt_counts_chars() {
        assert_eq!(excerpt("абв", 3), "абв");
        assert_eq!(excerpt("абвг", 3), "абв...");
    }

    #[test]
    fn file_kinds() {
        assert_eq!(FileKind::from_name("photo.JPG"), FileKind::Image);
        assert_eq!(FileKind::from_name("main.py"), FileKind::Code);
        assert_eq!(FileKind::from_name("notes.md"), FileKind::Text);
        assert_eq!(FileKind::from_name("archive.tar.gz"), FileKind::Unknown);
        assert_eq!(FileKind::from_name("Makefile"), FileKind::Unknown);
    }

    #[test]
    fn file_request_text() {
        let req = file_request("app.rs", Path::new("/srv/files/app.rs"), Some("  "));
        assert_eq!(
            req.message,
            "[РАЗРЕШЕНО ЧИТАТЬ ФАЙЛЫ] Прочитай код и проанализируй этот файл. Файл: /srv/files/app.rs"
        );
        assert_eq!(req.label, "[Файл: app.rs] проанализируй этот файл");

        let req = file_request("cat.png", Path::new("/tmp/cat.png"), Some("что тут?"));
        assert!(req.message.contains("Посмотри изображение и что тут?."));
    }
}
