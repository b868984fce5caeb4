//! Shared table and status formatting for CLI output.

use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use stepwise_types::approval::ApprovalStatus;
use stepwise_types::instance::{InstanceStatus, StepStatus};

/// A table with the CLI's standard preset and the given header.
pub fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    let mut cells: Vec<Cell> = header.iter().map(|h| Cell::new(h)).collect();
    if let Some(first) = cells.first_mut() {
        *first = Cell::new(header[0]).fg(Color::Cyan);
    }
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(cells);
    table
}

pub fn instance_status(status: InstanceStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        InstanceStatus::Running => cell.fg(Color::Blue),
        InstanceStatus::Completed => cell.fg(Color::Green),
        InstanceStatus::Failed => cell.fg(Color::Red),
        InstanceStatus::Cancelled => cell.fg(Color::DarkYellow),
    }
}

pub fn step_status(status: StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Pending => cell.fg(Color::Yellow),
        StepStatus::Running => cell.fg(Color::Blue),
        StepStatus::Completed => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
    }
}

pub fn approval_status(status: ApprovalStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        ApprovalStatus::Pending => cell.fg(Color::Yellow),
        ApprovalStatus::Approved => cell.fg(Color::Green),
        ApprovalStatus::Rejected => cell.fg(Color::Red),
        ApprovalStatus::Delegated => cell.fg(Color::Magenta),
    }
}

pub fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// First `max` characters, for table cells.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut short: String = text.chars().take(max.saturating_sub(1)).collect();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("ok", 10), "ok");
        assert_eq!(truncate("handler timed out", 8), "handler…");
    }

    #[test]
    fn missing_timestamp_is_a_dash() {
        assert_eq!(timestamp(None), "-");
    }
}
