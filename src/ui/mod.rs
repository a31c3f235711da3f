//! Coordinator dashboard
//!
//! A terminal view of the coordinator's tables: registered disks and their
//! allocation, storage groups with their admission flags and catalogs, and
//! the most recent commands handled.

pub mod terminal;

pub use terminal::Dashboard;

use crate::coordinator::{DiskState, Snapshot, StorageGroup};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::style::Color;

/// Events that can be triggered by user input
#[derive(Debug, Clone, PartialEq)]
pub enum UIEvent {
    Quit,
    ToggleHelp,
    /// User pressed an unrecognized key
    Unknown(KeyCode),
}

impl From<KeyEvent> for UIEvent {
    fn from(key_event: KeyEvent) -> Self {
        match key_event.code {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => UIEvent::Quit,
            KeyCode::Char('h') | KeyCode::Char('H') | KeyCode::F(1) => UIEvent::ToggleHelp,
            other => UIEvent::Unknown(other),
        }
    }
}

/// Color scheme for the UI
#[derive(Debug, Clone, Copy)]
pub struct ColorScheme {
    pub free: Color,
    pub allocated: Color,
    pub busy: Color,
    pub text: Color,
    pub highlight: Color,
    pub success: Color,
    pub error: Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            free: Color::Green,
            allocated: Color::Cyan,
            busy: Color::Yellow,
            text: Color::White,
            highlight: Color::Cyan,
            success: Color::Green,
            error: Color::Red,
        }
    }
}

/// Configuration for UI rendering
#[derive(Debug, Clone)]
pub struct UIConfig {
    pub colors: ColorScheme,
    /// Redraw interval in milliseconds
    pub update_interval_ms: u64,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            colors: ColorScheme::default(),
            update_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UIState {
    Running,
    Help,
    Shutdown,
}

pub const HELP_TEXT: &str = r#"
Striped Storage Coordinator

  Q, Esc    - Quit (stops the coordinator)
  H, F1     - Show/hide this help

Disks:    green FREE, cyan ALLOCATED to a group
Groups:   yellow while a copy, reads or a recovery is in progress
Activity: the latest commands and their outcome

Press H to return.
"#;

/// One styled line of a panel
pub type Row = (String, Color);

pub fn disk_rows(snapshot: &Snapshot, colors: &ColorScheme) -> Vec<Row> {
    snapshot
        .disks
        .iter()
        .map(|d| {
            let color = match d.state {
                DiskState::Free => colors.free,
                DiskState::Allocated(_) => colors.allocated,
            };
            (
                format!("{:<10} {}:{}/{}  {}", d.name, d.ip, d.mport, d.cport, d.state),
                color,
            )
        })
        .collect()
}

pub fn group_rows(snapshot: &Snapshot, colors: &ColorScheme) -> Vec<Row> {
    let mut rows = Vec::new();
    for group in &snapshot.groups {
        rows.push((group_header(group), group_color(group, colors)));
        for file in &group.files {
            rows.push((
                format!("    {} {} bytes ({})", file.name, file.size, file.owner),
                colors.text,
            ));
        }
    }
    rows
}

fn group_header(group: &StorageGroup) -> String {
    format!(
        "{} n={} B={} [{}] {}",
        group.name,
        group.members.len(),
        group.stripe_size,
        group.members.join(","),
        group.flags()
    )
}

fn group_color(group: &StorageGroup, colors: &ColorScheme) -> Color {
    if group.copy_in_flight() || group.active_reads() > 0 || group.recovering {
        colors.busy
    } else {
        colors.allocated
    }
}

pub fn history_rows(snapshot: &Snapshot, colors: &ColorScheme, limit: usize) -> Vec<Row> {
    snapshot
        .history
        .iter()
        .rev()
        .take(limit)
        .map(|a| {
            let color = if a.outcome.is_ok() {
                colors.success
            } else {
                colors.error
            };
            (a.format(), color)
        })
        .collect()
}

/// Utility functions for UI rendering
pub mod utils {
    use ratatui::layout::{Constraint, Direction, Layout, Rect};

    /// Create a centered rectangle with given width and height
    pub fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
        let popup_layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length((area.height.saturating_sub(height)) / 2),
                Constraint::Length(height),
                Constraint::Length((area.height.saturating_sub(height)) / 2),
            ])
            .split(area);

        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Length((area.width.saturating_sub(width)) / 2),
                Constraint::Length(width),
                Constraint::Length((area.width.saturating_sub(width)) / 2),
            ])
            .split(popup_layout[1])[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Registry;
    use crate::protocol::Command;
    use crate::Config;
    use crossterm::event::KeyModifiers;

    fn snapshot() -> Snapshot {
        let mut registry = Registry::new(&Config::default());
        for line in [
            "register-disk|D1|127.0.0.1|6000|6001",
            "register-disk|D2|127.0.0.1|6002|6003",
            "register-disk|D3|127.0.0.1|6004|6005",
            "register-disk|D4|127.0.0.1|6006|6007",
            "configure-dss|G|3|512",
            "copy|f|10|U1|G",
        ] {
            registry.apply(&line.parse::<Command>().unwrap()).unwrap();
        }
        registry.snapshot()
    }

    #[test]
    fn test_keys() {
        let key = |code| UIEvent::from(KeyEvent::new(code, KeyModifiers::NONE));
        assert_eq!(key(KeyCode::Char('q')), UIEvent::Quit);
        assert_eq!(key(KeyCode::Esc), UIEvent::Quit);
        assert_eq!(key(KeyCode::Char('h')), UIEvent::ToggleHelp);
        assert_eq!(key(KeyCode::Char('x')), UIEvent::Unknown(KeyCode::Char('x')));
    }

    #[test]
    fn test_disk_rows_show_allocation() {
        let colors = ColorScheme::default();
        let rows = disk_rows(&snapshot(), &colors);
        assert_eq!(rows.len(), 4);
        assert!(rows[0].0.contains("ALLOCATED(G)"));
        assert_eq!(rows[3].1, colors.free);
    }

    #[test]
    fn test_busy_group_is_highlighted() {
        let colors = ColorScheme::default();
        let rows = group_rows(&snapshot(), &colors);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].0.contains("copying f (10 bytes for U1)"));
        assert_eq!(rows[0].1, colors.busy);
    }

    #[test]
    fn test_history_newest_first() {
        let rows = history_rows(&snapshot(), &ColorScheme::default(), 2);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].0.contains("copy|f|10|U1|G"));
    }
}
