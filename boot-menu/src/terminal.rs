// SPDX-License-Identifier: GPL-3.0-only

//! Line input with a countdown
//!
//! The read loop owns the deadline. Every keystroke pushes it out to the
//! subsequent timeout, so an unattended menu times out quickly while one with
//! a human in front of it stays up.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::warn;

/// Deadline for menu input.
#[derive(Debug, Clone)]
pub struct Countdown {
    subsequent: Duration,
    deadline: Instant,
}

impl Countdown {
    pub fn new(initial: Duration, subsequent: Duration) -> Self {
        Self {
            subsequent,
            deadline: Instant::now() + initial,
        }
    }

    /// Called for every key the user types.
    pub fn keystroke(&mut self) {
        self.deadline = Instant::now() + self.subsequent;
    }

    /// Time left, or `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
    }
}

pub trait MenuTerminal {
    fn write_str(&mut self, text: &str) -> io::Result<()>;

    /// Shows `prompt` and reads one line. `Ok(None)` means the countdown ran
    /// out before Enter was pressed.
    fn read_line(&mut self, prompt: &str, countdown: &mut Countdown) -> io::Result<Option<String>>;
}

/// Restores cooked mode when dropped.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!(error = %e, "could not restore terminal mode");
        }
    }
}

/// The controlling terminal, driven through crossterm in raw mode.
pub struct CrosstermTerminal<W: Write> {
    out: W,
}

impl CrosstermTerminal<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> CrosstermTerminal<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> MenuTerminal for CrosstermTerminal<W> {
    fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }

    fn read_line(&mut self, prompt: &str, countdown: &mut Countdown) -> io::Result<Option<String>> {
        let _raw = RawMode::enable()?;
        self.write_str(prompt)?;

        let mut line = String::new();
        loop {
            let Some(left) = countdown.remaining() else {
                self.write_str("\r\n")?;
                return Ok(None);
            };
            if !event::poll(left)? {
                continue;
            }
            let Event::Key(KeyEvent {
                code,
                modifiers,
                kind: KeyEventKind::Press,
                ..
            }) = event::read()?
            else {
                continue;
            };
            countdown.keystroke();

            match code {
                KeyCode::Enter => {
                    self.write_str("\r\n")?;
                    return Ok(Some(line));
                }
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                    self.write_str("^C\r\n")?;
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
                }
                KeyCode::Backspace => {
                    if line.pop().is_some() {
                        self.write_str("\x08 \x08")?;
                    }
                }
                KeyCode::Char(c) => {
                    line.push(c);
                    let mut buf = [0u8; 4];
                    self.write_str(c.encode_utf8(&mut buf))?;
                }
                _ => {}
            }
        }
    }
}
