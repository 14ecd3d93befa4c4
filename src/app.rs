use crate::report::AnalysisReport;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::io;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tab {
    Frontier,
    Allocation,
    Assets,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::Frontier, Tab::Allocation, Tab::Assets];

    pub fn title(self) -> &'static str {
        match self {
            Tab::Frontier => "Frontier",
            Tab::Allocation => "Allocation",
            Tab::Assets => "Assets",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Tab::Frontier => 0,
            Tab::Allocation => 1,
            Tab::Assets => 2,
        }
    }

    fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }

    fn previous(self) -> Self {
        Self::ALL[(self.index() + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

/// Read-only dashboard over a finished analysis.
pub struct App {
    pub should_quit: bool,
    pub tab: Tab,
    pub report: AnalysisReport,
}

impl App {
    pub fn new(report: AnalysisReport) -> Self {
        Self {
            should_quit: false,
            tab: Tab::Frontier,
            report,
        }
    }

    pub fn handle_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('l') => self.tab = self.tab.next(),
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('h') => self.tab = self.tab.previous(),
            KeyCode::Char('1') => self.tab = Tab::Frontier,
            KeyCode::Char('2') => self.tab = Tab::Allocation,
            KeyCode::Char('3') => self.tab = Tab::Assets,
            _ => {}
        }
    }

    pub fn run(&mut self, terminal: &mut crate::tui::Tui) -> io::Result<()> {
        while !self.should_quit {
            terminal.draw(|f| crate::ui::render(f, self))?;

            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key.code);
                    }
                }
            }
        }
        Ok(())
    }
}
