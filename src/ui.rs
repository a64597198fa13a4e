//! Terminal styling helpers shared by list, status, and log rendering code.

use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use crate::server::{now_epoch_secs, ServerState, Severity};

fn colors_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }

        if std::env::var("TERM")
            .map(|term| term.eq_ignore_ascii_case("dumb"))
            .unwrap_or(false)
        {
            return false;
        }

        io::stdout().is_terminal()
    })
}

fn paint(value: &str, code: &str) -> String {
    if colors_enabled() {
        format!("\x1b[{code}m{value}\x1b[0m")
    } else {
        value.to_string()
    }
}

/// Styles a general UI label.
pub fn label(value: &str) -> String {
    paint(value, "1;36")
}

pub fn table_header(value: &str) -> String {
    paint(value, "1;36")
}

pub fn table_border(value: &str) -> String {
    paint(value, "2;34")
}

/// Renders a coloured server-state value for terminal output.
pub fn state_value(state: ServerState) -> String {
    style_state_cell(&state.to_string(), state)
}

/// Applies state-specific colouring to a pre-padded table cell.
pub fn style_state_cell(padded: &str, state: ServerState) -> String {
    match state {
        ServerState::Running => paint(padded, "1;32"),
        ServerState::Starting | ServerState::Stopping => paint(padded, "1;33"),
        ServerState::Stopped => paint(padded, "2;37"),
        ServerState::Crashed => paint(padded, "1;31"),
    }
}

pub fn severity_value(severity: Severity) -> String {
    let value = severity.to_string();
    match severity {
        Severity::Info => paint(&value, "2;37"),
        Severity::Warning => paint(&value, "1;33"),
        Severity::Error => paint(&value, "1;31"),
    }
}

/// Formats the current uptime for a live server in a compact, human-readable
/// form.
pub fn format_process_uptime(state: ServerState, started_at: Option<u64>) -> String {
    if !matches!(state, ServerState::Running | ServerState::Stopping) {
        return "-".to_string();
    }

    let Some(started_at) = started_at else {
        return "-".to_string();
    };

    format_duration_compact(now_epoch_secs().saturating_sub(started_at))
}

pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / (1024.0 * 1024.0))
}

/// UTC `HH:MM:SS` for a millisecond timestamp.
pub fn format_clock(timestamp_ms: u64) -> String {
    let secs = timestamp_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}",
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

fn format_duration_compact(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let mins = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {secs}s")
    } else {
        format!("{secs}s")
    }
}
