//! User-facing chat messages built from execution results and session data.
//!
//! Everything here returns transport HTML (the same tag subset the
//! formatter produces).

use chrono::{DateTime, Utc};
use codebot_format::{escape_html, format_message, text_len};
use serde::{Deserialize, Serialize};

use crate::executor::{ExecutionResult, ExecutionStatus};
use crate::history::ConversationHistory;
use crate::prompt::excerpt;

const UNKNOWN_ERROR: &str = "Неизвестная ошибка";
const EMPTY_RESPONSE: &str = "✅ Готово (пустой ответ)";
const CANCELLED_NOTICE: &str = "🛑 Выполнение отменено";
const ERROR_PREFIX: &str = "❌ Ошибка:\n";

/// Turns shown by [`format_context`].
pub const CONTEXT_PREVIEW_TURNS: usize = 5;
const CONTEXT_PREVIEW_CHARS: usize = 100;
const HISTORY_COMMAND_CHARS: usize = 50;
const HISTORY_RESPONSE_CHARS: usize = 100;

pub fn format_error(error: &str) -> String {
    format!("{ERROR_PREFIX}<pre>{}</pre>", escape_html(error))
}

/// Chunks to send for `result`, each at most `max_length` chars.
pub fn render_result(result: &ExecutionResult, max_length: usize) -> Vec<String> {
    match result.status {
        ExecutionStatus::Success => {
            let output = result.output.as_deref().unwrap_or_default();
            if output.trim().is_empty() {
                vec![EMPTY_RESPONSE.to_string()]
            } else {
                format_message(output, max_length)
            }
        }
        ExecutionStatus::Timeout => vec![format!(
            "⏱️ Превышено время ожидания ({} сек)\n\
             Попробуйте более простой запрос или используйте /cancel для отмены.",
            result
                .timeout_secs
                .unwrap_or_else(|| result.elapsed().as_secs())
        )],
        ExecutionStatus::Cancelled => vec![CANCELLED_NOTICE.to_string()],
        ExecutionStatus::Error => {
            let error = result
                .error
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or(UNKNOWN_ERROR);
            vec![format_error(&fit_escaped(error, max_length))]
        }
    }
}

/// Longest prefix of `text` whose error message stays within `max_length`.
fn fit_escaped(text: &str, max_length: usize) -> String {
    let overhead = text_len(&format_error(""));
    let budget = max_length.saturating_sub(overhead);
    let mut take = text_len(text).min(budget);

    loop {
        let prefix: String = text.chars().take(take).collect();
        let size = text_len(&escape_html(&prefix));
        if size <= budget || take == 0 {
            return prefix;
        }
        take = take.saturating_sub((size - budget).max(1));
    }
}

/// The last few turns of a conversation, both sides shortened.
pub fn format_context(history: &ConversationHistory) -> String {
    if history.is_empty() {
        return "📝 Контекст пуст".to_string();
    }

    let mut parts = vec!["<b>Последние сообщения:</b>\n".to_string()];
    for entry in history.recent(CONTEXT_PREVIEW_TURNS) {
        parts.push(format!(
            "👤 {}",
            escape_html(&excerpt(&entry.user, CONTEXT_PREVIEW_CHARS))
        ));
        parts.push(format!(
            "🤖 {}\n",
            escape_html(&excerpt(&entry.assistant, CONTEXT_PREVIEW_CHARS))
        ));
    }
    parts.join("\n")
}

/// What a session store knows about one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub working_dir: String,
    pub active_project: Option<String>,
    pub message_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

pub fn format_status(summary: &SessionSummary, active: bool) -> String {
    let project = summary
        .active_project
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or("Не выбран");
    let execution = if active {
        "⚙️ Выполняется команда"
    } else {
        "💤 Нет активных команд"
    };

    format!(
        "📊 <b>Статус сессии</b>\n\n\
         📁 Рабочая директория: <code>{}</code>\n\
         🎯 Активный проект: {}\n\
         💬 Сообщений: {}\n\
         🕐 Создана: {}\n\
         🔄 Последняя активность: {}\n\
         {execution}",
        escape_html(&summary.working_dir),
        escape_html(project),
        summary.message_count,
        timestamp_or_unknown(summary.created_at),
        timestamp_or_unknown(summary.last_activity),
    )
}

fn timestamp_or_unknown(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%d.%m.%Y %H:%M").to_string())
        .unwrap_or_else(|| "Неизвестно".to_string())
}

/// One logged command, as a command log query returns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub response: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Command log view. `records` come newest first and are shown oldest first.
pub fn format_history(records: &[CommandRecord]) -> String {
    if records.is_empty() {
        return "📜 История команд пуста".to_string();
    }

    let mut parts = vec!["📜 <b>Последние команды:</b>\n".to_string()];
    for record in records.iter().rev() {
        let timestamp = record
            .created_at
            .map(|t| t.format("%d.%m %H:%M").to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let elapsed = record
            .elapsed_ms
            .filter(|ms| *ms > 0)
            .map(|ms| format!(" ({ms}ms)"))
            .unwrap_or_default();
        let response = record
            .response
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| excerpt(r, HISTORY_RESPONSE_CHARS))
            .unwrap_or_else(|| "Нет ответа".to_string());

        parts.push(format!(
            "🕐 {timestamp}{elapsed}\n👤 {}\n🤖 {}\n",
            escape_html(&excerpt(&record.command, HISTORY_COMMAND_CHARS)),
            escape_html(&response)
        ));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn error_is_escaped_in_pre() {
        assert_eq!(
            format_error("a < b & c"),
            "❌ Ошибка:\n<pre>a &lt; b &amp; c</pre>"
        );
    }

    #[test]
    fn long_error_fits_one_chunk() {
        let result = ExecutionResult::error("<&>".repeat(2000), Duration::ZERO);
        let chunks = render_result(&result, 4096);
        assert_eq!(chunks.len(), 1);
        assert!(text_len(&chunks[0]) <= 4096);
        assert!(chunks[0].ends_with("</pre>"));
    }

    #[test]
    fn statuses_render() {
        let d = Duration::from_millis(12_345);
        let ok = render_result(&ExecutionResult::success("**done**", d), 4096);
        assert_eq!(ok, vec!["<b>done</b>".to_string()]);

        let empty = render_result(&ExecutionResult::success("  \n", d), 4096);
        assert_eq!(empty, vec![EMPTY_RESPONSE.to_string()]);

        let timeout = render_result(&ExecutionResult::timeout(Duration::from_secs(10), d), 4096);
        assert!(timeout[0].starts_with("⏱️ Превышено время ожидания (10 сек)"));

        let cancelled = render_result(&ExecutionResult::cancelled(d), 4096);
        assert_eq!(cancelled, vec![CANCELLED_NOTICE.to_string()]);

        let blank_error = render_result(&ExecutionResult::error("", d), 4096);
        assert_eq!(blank_error, vec![format_error(UNKNOWN_ERROR)]);
    }

    #[test]
    fn timeout_notice_names_deadline_not_elapsed() {
        // Elapsed time includes the termination grace period.
        let result = ExecutionResult::timeout(Duration::from_secs(1), Duration::from_millis(6_100));
        let chunks = render_result(&result, 4096);
        assert!(chunks[0].starts_with("⏱️ Превышено время ожидания (1 сек)"));
    }

    #[test]
    fn context_preview() {
        assert_eq!(format_context(&ConversationHistory::new()), "📝 Контекст пуст");

        let mut history = ConversationHistory::new();
        for i in 0..7 {
            history.push(format!("q{i}"), "x".repeat(150));
        }
        let text = format_context(&history);
        assert!(!text.contains("q1"));
        assert!(text.contains("👤 q2"));
        assert!(text.contains(&format!("🤖 {}...", "x".repeat(100))));
    }

    #[test]
    fn status_block() {
        let summary = SessionSummary {
            working_dir: "/srv/<app>".to_string(),
            active_project: None,
            message_count: 3,
            created_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap()),
            last_activity: None,
        };
        let text = format_status(&summary, true);
        assert!(text.contains("<code>/srv/&lt;app&gt;</code>"));
        assert!(text.contains("🎯 Активный проект: Не выбран"));
        assert!(text.contains("🕐 Создана: 01.03.2026 09:30"));
        assert!(text.contains("🔄 Последняя активность: Неизвестно"));
        assert!(text.ends_with("⚙️ Выполняется команда"));
    }

    #[test]
    fn history_oldest_first() {
        assert_eq!(format_history(&[]), "📜 История команд пуста");

        let records = vec![
            CommandRecord {
                command: "newest".to_string(),
                response: None,
                elapsed_ms: Some(1200),
                created_at: Some(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()),
            },
            CommandRecord {
                command: "c".repeat(60),
                response: Some("r".repeat(120)),
                elapsed_ms: None,
                created_at: None,
            },
        ];
        let text = format_history(&records);
        let oldest = text.find(&format!("👤 {}...", "c".repeat(50))).unwrap();
        let newest = text.find("👤 newest").unwrap();
        assert!(oldest < newest);
        assert!(text.contains("🕐 N/A\n"));
        assert!(text.contains("🕐 02.03 10:00 (1200ms)"));
        assert!(text.contains("🤖 Нет ответа"));
        assert!(text.contains(&format!("🤖 {}...", "r".repeat(100))));
    }
}
