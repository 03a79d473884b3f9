use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph, Tabs, Wrap,
};

use crate::editor::{self, EditorTarget};
use crate::error::{Error, Result};
use crate::log_sanitize::LogBuffer;
use crate::matcher::ErrorRecord;
use crate::project::{BuildAction, Project};
use crate::session::{BuildSession, ChannelSink, Controller, SessionEvent};

const MAX_LOG_LINES: usize = 20_000;
const PAGE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PanelTab {
    Errors,
    Log,
}

#[derive(Debug, Clone)]
enum InputMode {
    Normal,
    Dialog { title: String, text: String },
    ConfirmQuit,
}

#[derive(Debug, Clone, Copy)]
struct LastRun {
    exit_code: i32,
    terminated: bool,
    errors: usize,
}

struct App {
    project_dir: PathBuf,
    controller: Controller,
    rx: mpsc::Receiver<SessionEvent>,

    session: Option<BuildSession>,
    // Events tagged with any other session id are stale and dropped.
    active: Option<u64>,
    running: bool,
    running_args: String,
    started_at: Option<Instant>,
    status: String,
    last_run: Option<LastRun>,

    tab: PanelTab,
    log: LogBuffer,
    // Lines scrolled up from the bottom; 0 follows new output.
    log_scroll: usize,
    log_unseen: bool,
    records: Vec<ErrorRecord>,
    error_list: ListState,

    input: InputMode,
}

impl App {
    fn new(project_dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            project_dir,
            controller: Controller::new(Arc::new(ChannelSink::new(tx))),
            rx,
            session: None,
            active: None,
            running: false,
            running_args: String::new(),
            started_at: None,
            status: String::new(),
            last_run: None,
            tab: PanelTab::Errors,
            log: LogBuffer::new(MAX_LOG_LINES),
            log_scroll: 0,
            log_unseen: false,
            records: Vec::new(),
            error_list: ListState::default(),
            input: InputMode::Normal,
        }
    }

    fn show_dialog(&mut self, title: &str, text: impl Into<String>) {
        self.input = InputMode::Dialog {
            title: title.to_string(),
            text: text.into(),
        };
    }

    fn start(&mut self, action: BuildAction) {
        // Build and clean stay disabled while a session runs.
        if self.running {
            return;
        }
        let started = Project::open(&self.project_dir).and_then(|project| {
            let args = project.args_for(&action).join(" ");
            let session = self.controller.run(&project, &action)?;
            Ok((args, session))
        });
        match started {
            Ok((args, session)) => {
                self.records.clear();
                self.error_list.select(None);
                self.log.clear();
                self.log_scroll = 0;
                self.log_unseen = false;
                self.running = true;
                self.running_args = args;
                self.started_at = Some(Instant::now());
                self.status = "Running...".into();
                self.active = Some(session.id());
                self.session = Some(session);
            }
            Err(e) => self.show_dialog("Build", e.to_string()),
        }
    }

    fn terminate(&mut self) {
        if !self.running {
            return;
        }
        if let Some(s) = self.session.as_ref() {
            s.terminate();
            self.status = "Terminating...".into();
        }
    }

    fn drain_session_events(&mut self) {
        let events: Vec<SessionEvent> = self.rx.try_iter().collect();
        for ev in events {
            if Some(ev.session()) != self.active {
                continue;
            }
            match ev {
                SessionEvent::Started { .. } => {}
                SessionEvent::Output { text, .. } => {
                    self.log.push(&text);
                    if self.tab != PanelTab::Log {
                        self.log_unseen = true;
                    }
                }
                SessionEvent::Note { text, .. } => self.log.push(&text),
                SessionEvent::Completed { outcome, .. } => {
                    self.running = false;
                    self.status.clear();
                    self.last_run = Some(LastRun {
                        exit_code: outcome.exit_code,
                        terminated: outcome.terminated,
                        errors: outcome.records.len(),
                    });
                    self.records = outcome.records.clone();
                    self.error_list
                        .select((!self.records.is_empty()).then_some(0));
                    if outcome.should_show_log() {
                        self.tab = PanelTab::Log;
                        self.log_scroll = 0;
                        self.log_unseen = false;
                    }
                }
                SessionEvent::StartFailed { error, .. } => {
                    self.running = false;
                    self.status.clear();
                    self.session = None;
                    self.active = None;
                    self.show_dialog("Build", format!("Internal error: {error}"));
                }
            }
        }
    }

    fn switch_tab(&mut self) {
        self.tab = match self.tab {
            PanelTab::Errors => PanelTab::Log,
            PanelTab::Log => PanelTab::Errors,
        };
        if self.tab == PanelTab::Log {
            self.log_unseen = false;
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.records.is_empty() {
            self.error_list.select(None);
            return;
        }
        let cur = self.error_list.selected().unwrap_or(0);
        let next = cur
            .saturating_add_signed(delta)
            .min(self.records.len() - 1);
        self.error_list.select(Some(next));
    }

    fn scroll_log(&mut self, delta: isize) {
        let max = self.log.len().saturating_sub(1);
        self.log_scroll = self.log_scroll.saturating_add_signed(delta).min(max);
    }

    fn open_selected(&mut self) {
        let Some(record) = self
            .error_list
            .selected()
            .and_then(|i| self.records.get(i))
            .cloned()
        else {
            return;
        };
        let project = match Project::open(&self.project_dir) {
            Ok(p) => p,
            Err(e) => {
                self.show_dialog("Open error", e.to_string());
                return;
            }
        };
        let target = EditorTarget::for_record(&project.dir, &record);
        if project.settings.editor.command.is_empty() {
            self.show_dialog(
                "Open error",
                format!(
                    "{}\n\nSet [editor].command in pybuild.toml to jump there.",
                    target.location()
                ),
            );
            return;
        }
        if let Err(e) = editor::open(&project.settings.editor.command, &target) {
            self.show_dialog("Open error", e.to_string());
        }
    }

    fn handle_key(&mut self, code: KeyCode, mods: KeyModifiers) -> Result<bool> {
        let quit_requested = matches!(code, KeyCode::Char('q'))
            || (mods.contains(KeyModifiers::CONTROL) && matches!(code, KeyCode::Char('c')));

        match self.input {
            InputMode::Dialog { .. } => {
                if matches!(code, KeyCode::Esc | KeyCode::Enter | KeyCode::Char('q')) {
                    self.input = InputMode::Normal;
                }
                return Ok(false);
            }
            InputMode::ConfirmQuit => {
                return Ok(match code {
                    KeyCode::Enter | KeyCode::Char('y') => {
                        self.terminate();
                        true
                    }
                    _ if quit_requested => {
                        self.terminate();
                        true
                    }
                    _ => {
                        self.input = InputMode::Normal;
                        false
                    }
                });
            }
            InputMode::Normal => {}
        }

        if quit_requested {
            if self.running {
                self.input = InputMode::ConfirmQuit;
                return Ok(false);
            }
            return Ok(true);
        }

        match code {
            KeyCode::Char('b') => self.start(BuildAction::BuildInPlace),
            KeyCode::Char('c') => self.start(BuildAction::CleanAll),
            KeyCode::Char('t') => self.terminate(),
            KeyCode::Tab | KeyCode::BackTab | KeyCode::Left | KeyCode::Right => self.switch_tab(),
            KeyCode::Char('j') | KeyCode::Down => match self.tab {
                PanelTab::Errors => self.move_selection(1),
                PanelTab::Log => self.scroll_log(-1),
            },
            KeyCode::Char('k') | KeyCode::Up => match self.tab {
                PanelTab::Errors => self.move_selection(-1),
                PanelTab::Log => self.scroll_log(1),
            },
            KeyCode::PageDown => match self.tab {
                PanelTab::Errors => self.move_selection(PAGE as isize),
                PanelTab::Log => self.scroll_log(-(PAGE as isize)),
            },
            KeyCode::PageUp => match self.tab {
                PanelTab::Errors => self.move_selection(-(PAGE as isize)),
                PanelTab::Log => self.scroll_log(PAGE as isize),
            },
            KeyCode::End | KeyCode::Char('G') => self.log_scroll = 0,
            KeyCode::Enter if self.tab == PanelTab::Errors => self.open_selected(),
            _ => {}
        }
        Ok(false)
    }

    fn draw(&self, f: &mut ratatui::Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(2),
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(2),
            ])
            .split(f.area());

        self.draw_header(f, chunks[0]);
        self.draw_tabs(f, chunks[1]);
        match self.tab {
            PanelTab::Errors => self.draw_errors(f, chunks[2]),
            PanelTab::Log => self.draw_log(f, chunks[2]),
        }
        self.draw_footer(f, chunks[3]);
        self.draw_modal(f);
    }

    fn draw_header(&self, f: &mut ratatui::Frame, area: Rect) {
        let now = chrono::Local::now().format("%H:%M:%S").to_string();
        let status = if self.running {
            let elapsed = self
                .started_at
                .map(|t| format_elapsed(t.elapsed()))
                .unwrap_or_default();
            Span::styled(
                format!("{} [{}] {elapsed}", self.status, self.running_args),
                Style::default().fg(Color::Yellow),
            )
        } else {
            match self.last_run {
                Some(run) if run.terminated => Span::styled(
                    format!("terminated (exit {})", run.exit_code),
                    Style::default().fg(Color::Magenta),
                ),
                Some(run) if run.exit_code == 0 => {
                    Span::styled("last build ok", Style::default().fg(Color::Green))
                }
                Some(run) => Span::styled(
                    format!("last build failed (exit {}, {} errors)", run.exit_code, run.errors),
                    Style::default().fg(Color::Red),
                ),
                None => Span::raw(""),
            }
        };
        let line = Line::from(vec![
            Span::styled("pybuild", Style::default().fg(Color::Cyan)),
            Span::raw("  "),
            Span::styled(
                self.project_dir.display().to_string(),
                Style::default().fg(Color::Gray),
            ),
            Span::raw("  "),
            status,
            Span::raw("  "),
            Span::styled(now, Style::default().fg(Color::DarkGray)),
        ]);
        let p = Paragraph::new(Text::from(line)).block(
            Block::default()
                .borders(Borders::BOTTOM)
                .border_type(BorderType::Plain),
        );
        f.render_widget(p, area);
    }

    fn draw_tabs(&self, f: &mut ratatui::Frame, area: Rect) {
        let log_style = if self.log_unseen {
            Style::default().fg(Color::Red)
        } else {
            Style::default()
        };
        let titles = vec![
            Line::from(format!("Errors ({})", self.records.len())),
            Line::from(Span::styled("Log", log_style)),
        ];
        let idx = match self.tab {
            PanelTab::Errors => 0,
            PanelTab::Log => 1,
        };
        let tabs = Tabs::new(titles)
            .select(idx)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_style(Style::default().fg(Color::Black).bg(Color::LightYellow));
        f.render_widget(tabs, area);
    }

    fn draw_errors(&self, f: &mut ratatui::Frame, area: Rect) {
        let items: Vec<ListItem> = self
            .records
            .iter()
            .map(|r| {
                let first_line = r.message.lines().next().unwrap_or_default();
                ListItem::new(Line::from(vec![
                    Span::styled(
                        format!("{}:{}:{} ", r.file, r.line, r.column),
                        Style::default().fg(Color::LightBlue),
                    ),
                    Span::raw(first_line.to_string()),
                ]))
            })
            .collect();

        let mut state = self.error_list.clone();
        let list = List::new(items)
            .block(
                Block::default()
                    .title("Errors [j/k select, Enter open]")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_symbol(">> ")
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::LightYellow)
                    .add_modifier(Modifier::BOLD),
            );
        f.render_stateful_widget(list, area, &mut state);
    }

    fn draw_log(&self, f: &mut ratatui::Frame, area: Rect) {
        let height = area.height.saturating_sub(2) as usize;
        let total = self.log.len();
        let end = total.saturating_sub(self.log_scroll);
        let start = end.saturating_sub(height);
        let lines: Vec<Line> = self
            .log
            .lines()
            .skip(start)
            .take(end - start)
            .map(|l| {
                let style = if l.starts_with("======== SUCCESS") {
                    Style::default().fg(Color::Green)
                } else if l.starts_with("======== FAILED") {
                    Style::default().fg(Color::Red)
                } else {
                    Style::default()
                };
                Line::from(Span::styled(l.to_string(), style))
            })
            .collect();
        let title = if self.log_scroll == 0 {
            "Log".to_string()
        } else {
            format!("Log (+{} lines below, End to follow)", self.log_scroll)
        };
        let p = Paragraph::new(lines).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
        f.render_widget(p, area);
    }

    fn draw_footer(&self, f: &mut ratatui::Frame, area: Rect) {
        let hint = if self.running {
            "[t] Terminate  [Tab] Errors/Log  [j/k PgUp/PgDn] Move  [q] Quit"
        } else {
            "[b] Build in place  [c] Clean  [Tab] Errors/Log  [j/k PgUp/PgDn] Move  [Enter] Open  [q] Quit"
        };
        let p = Paragraph::new(hint)
            .style(Style::default().fg(Color::Gray))
            .block(Block::default().borders(Borders::TOP));
        f.render_widget(p, area);
    }

    fn draw_modal(&self, f: &mut ratatui::Frame) {
        let (title, body) = match &self.input {
            InputMode::Normal => return,
            InputMode::Dialog { title, text } => {
                (title.as_str(), format!("{text}\n\n[Enter/Esc] Close"))
            }
            InputMode::ConfirmQuit => (
                "Quit",
                "A build is running. Terminate it and quit?\n\n[y/Enter] Yes  [n/Esc] No".into(),
            ),
        };
        let area = centered_rect(60, 30, f.area());
        f.render_widget(Clear, area);
        let p = Paragraph::new(body).wrap(Wrap { trim: false }).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_type(BorderType::Double)
                .border_style(Style::default().fg(Color::Yellow)),
        );
        f.render_widget(p, area);
    }
}

pub fn run_tui(project_dir: &Path) -> Result<()> {
    let mut stdout = io::stdout();
    enable_raw_mode().map_err(|e| Error::msg(e.to_string()))?;
    execute!(stdout, EnterAlternateScreen, Hide).map_err(|e| Error::msg(e.to_string()))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).map_err(|e| Error::msg(e.to_string()))?;
    terminal
        .clear()
        .map_err(|e| Error::msg(format!("tui clear failed: {e}")))?;

    let result = run_loop(&mut terminal, App::new(project_dir.to_path_buf()));

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen, Show).ok();

    if let Some(run) = result? {
        println!(
            "last build: exit {}{}, {} errors",
            run.exit_code,
            if run.terminated { " (terminated)" } else { "" },
            run.errors
        );
    }
    Ok(())
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    mut app: App,
) -> Result<Option<LastRun>> {
    let tick = Duration::from_millis(100);
    loop {
        app.drain_session_events();
        terminal
            .draw(|f| app.draw(f))
            .map_err(|e| Error::msg(format!("draw error: {e}")))?;

        // Poll so output keeps streaming in while no key is pressed.
        if event::poll(tick).map_err(|e| Error::msg(e.to_string()))? {
            if let Event::Key(k) = event::read().map_err(|e| Error::msg(e.to_string()))? {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if app.handle_key(k.code, k.modifiers)? {
                    break;
                }
            }
        }
    }
    Ok(app.last_run)
}

fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(rows[1])[1]
}
