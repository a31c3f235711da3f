//! Terminal dashboard using ratatui
//!
//! Polls the coordinator for a snapshot on every redraw; the registry task
//! stays the only owner of the tables.

use crate::coordinator::{CoordinatorHandle, Snapshot};
use crate::ui::{disk_rows, group_rows, history_rows, Row, UIConfig, UIEvent, UIState, HELP_TEXT};
use crate::Result;
use crossterm::{
    event::{self, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io::{self, Stdout};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Live view of a running coordinator
pub struct Dashboard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    config: UIConfig,
    state: UIState,
    listen: SocketAddr,
    last_update: Instant,
}

impl Dashboard {
    pub fn new(listen: SocketAddr) -> Result<Self> {
        let backend = CrosstermBackend::new(io::stdout());
        let terminal = Terminal::new(backend)?;

        Ok(Self {
            terminal,
            config: UIConfig::default(),
            state: UIState::Running,
            listen,
            last_update: Instant::now(),
        })
    }

    /// Draw until the user quits
    pub async fn run(&mut self, handle: CoordinatorHandle) -> Result<()> {
        enable_raw_mode()?;
        execute!(self.terminal.backend_mut(), EnterAlternateScreen)?;

        let mut events = spawn_key_reader();
        let interval = Duration::from_millis(self.config.update_interval_ms);
        let mut first = true;

        while self.state != UIState::Shutdown {
            while let Ok(event) = events.try_recv() {
                match event {
                    UIEvent::Quit => self.state = UIState::Shutdown,
                    UIEvent::ToggleHelp => {
                        self.state = match self.state {
                            UIState::Help => UIState::Running,
                            _ => UIState::Help,
                        };
                        first = true;
                    }
                    UIEvent::Unknown(_) => {}
                }
            }
            if self.state == UIState::Shutdown {
                break;
            }

            if first || self.last_update.elapsed() >= interval {
                let snapshot = handle.snapshot().await?;
                self.draw(&snapshot)?;
                self.last_update = Instant::now();
                first = false;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.cleanup()
    }

    fn draw(&mut self, snapshot: &Snapshot) -> Result<()> {
        let state = self.state;
        let config = self.config.clone();
        let listen = self.listen;

        self.terminal.draw(|f| match state {
            UIState::Help => render_help(f, &config),
            _ => render_main(f, snapshot, &config, listen),
        })?;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Forward key presses from a blocking reader thread
fn spawn_key_reader() -> mpsc::UnboundedReceiver<UIEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || loop {
        if let Ok(true) = event::poll(Duration::from_millis(50)) {
            if let Ok(Event::Key(key)) = event::read() {
                if tx.send(UIEvent::from(key)).is_err() {
                    break;
                }
            }
        }
        if tx.is_closed() {
            break;
        }
    });
    rx
}

fn render_main(f: &mut Frame, snapshot: &Snapshot, config: &UIConfig, listen: SocketAddr) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(10),
            Constraint::Length(1),
        ])
        .split(f.size());

    let title = Paragraph::new(format!("Striped Storage Coordinator on {}", listen))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .style(Style::default().fg(config.colors.highlight)),
        )
        .alignment(Alignment::Center)
        .style(Style::default().add_modifier(Modifier::BOLD));
    f.render_widget(title, chunks[0]);

    let tables = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Ratio(2, 5), Constraint::Ratio(3, 5)])
        .split(chunks[1]);

    let disks_title = format!(
        "Disks ({} registered, {} free)",
        snapshot.disks.len(),
        snapshot.free_disks()
    );
    render_rows(f, tables[0], &disks_title, disk_rows(snapshot, &config.colors));

    let groups_title = format!("Storage Groups ({})", snapshot.groups.len());
    render_rows(f, tables[1], &groups_title, group_rows(snapshot, &config.colors));

    let limit = chunks[2].height.saturating_sub(2) as usize;
    render_rows(
        f,
        chunks[2],
        "Activity",
        history_rows(snapshot, &config.colors, limit),
    );

    let users: Vec<&str> = snapshot.users.iter().map(|u| u.name.as_str()).collect();
    let status = Paragraph::new(format!(
        "Users: {} | Press 'H' for help, 'Q' to quit",
        if users.is_empty() {
            "none".to_string()
        } else {
            users.join(", ")
        }
    ))
    .style(Style::default().fg(config.colors.text))
    .alignment(Alignment::Center);
    f.render_widget(status, chunks[3]);
}

fn render_rows(f: &mut Frame, area: Rect, title: &str, rows: Vec<Row>) {
    let items: Vec<ListItem> = rows
        .into_iter()
        .map(|(text, color)| ListItem::new(text).style(Style::default().fg(color)))
        .collect();
    let list = List::new(items).block(Block::default().title(title.to_string()).borders(Borders::ALL));
    f.render_widget(list, area);
}

fn render_help(f: &mut Frame, config: &UIConfig) {
    let area = f.size();
    f.render_widget(Clear, area);

    let popup_area = crate::ui::utils::centered_rect(60, 14, area);
    let block = Block::default()
        .title("Help")
        .borders(Borders::ALL)
        .style(Style::default().fg(config.colors.highlight));
    let paragraph = Paragraph::new(HELP_TEXT)
        .block(block)
        .wrap(Wrap { trim: true })
        .style(Style::default().fg(config.colors.text));
    f.render_widget(paragraph, popup_area);
}
