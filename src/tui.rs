use ratatui::DefaultTerminal;
use std::io;

pub type Tui = DefaultTerminal;

/// Enters the alternate screen in raw mode. A panic hook restores the terminal.
pub fn init() -> io::Result<Tui> {
    ratatui::try_init()
}

pub fn restore() -> io::Result<()> {
    ratatui::try_restore()
}
