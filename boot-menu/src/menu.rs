// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::entry::{Entry, extended_label};
use crate::terminal::{Countdown, MenuTerminal};

pub const INITIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const SUBSEQUENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuOptions {
    pub initial_timeout: Duration,
    /// Applies once anything has been typed.
    pub subsequent_timeout: Duration,
    pub allow_edit: bool,
}

impl Default for MenuOptions {
    fn default() -> Self {
        Self {
            initial_timeout: INITIAL_TIMEOUT,
            subsequent_timeout: SUBSEQUENT_TIMEOUT,
            allow_edit: false,
        }
    }
}

/// Reads one line, treating errors like a timeout.
fn read<T: MenuTerminal + ?Sized>(
    term: &mut T,
    prompt: &str,
    countdown: &mut Countdown,
) -> Option<String> {
    match term.read_line(prompt, countdown) {
        Ok(Some(line)) => Some(line.trim().to_string()),
        Ok(None) => {
            debug!("menu input timed out");
            None
        }
        Err(e) => {
            warn!(error = %e, "reading menu input failed");
            None
        }
    }
}

fn say<T: MenuTerminal + ?Sized>(term: &mut T, text: &str) {
    if let Err(e) = term.write_str(text) {
        warn!(error = %e, "writing to terminal failed");
    }
}

fn parse_index(choice: &str, len: usize) -> Option<usize> {
    match choice.parse::<usize>() {
        Ok(n) if (1..=len).contains(&n) => Some(n - 1),
        _ => None,
    }
}

/// Lets the user rewrite one entry's command line. `None` when input ended.
fn edit_entry<E: Entry, T: MenuTerminal + ?Sized>(
    term: &mut T,
    countdown: &mut Countdown,
    entries: &mut [E],
) -> Option<()> {
    let choice = read(term, "Select a boot option to edit: ", countdown)?;
    let Some(index) = parse_index(&choice, entries.len()) else {
        say(term, &format!("{choice:?} is not a valid entry number\r\n"));
        return Some(());
    };

    let mode = read(
        term,
        "Enter an option:\r\n  a, Append to the current kernel command line\r\n  o, Overwrite the kernel command line\r\n  r, Return to the main menu\r\n: ",
        countdown,
    )?;
    let append = match mode.as_str() {
        "a" => true,
        "o" => false,
        _ => return Some(()),
    };

    let cmdline = read(term, "Enter the kernel command line: ", countdown)?;
    let entry = &mut entries[index];
    if append {
        entry.edit(&mut |current: &str| {
            if current.is_empty() {
                cmdline.clone()
            } else {
                format!("{current} {cmdline}")
            }
        });
    } else {
        entry.edit(&mut |_: &str| cmdline.clone());
    }
    info!(entry = %entry.label(), append, "kernel command line edited");
    Some(())
}

/// Shows the menu until the user picks an entry. Returns `None` for a bare
/// Enter, a timeout or a terminal failure, all of which mean "boot the
/// default".
pub fn choose<E: Entry, T: MenuTerminal + ?Sized>(
    term: &mut T,
    options: &MenuOptions,
    entries: &mut [E],
) -> Option<usize> {
    let mut countdown = Countdown::new(options.initial_timeout, options.subsequent_timeout);
    loop {
        let mut menu = String::from("\r\nWelcome to the boot menu. Select a boot option to continue:\r\n\r\n");
        for (i, entry) in entries.iter().enumerate() {
            menu.push_str(&format!("  {:02}. {}\r\n", i + 1, entry.label()));
        }
        menu.push_str("\r\n");
        say(term, &menu);

        let prompt = if options.allow_edit {
            "Enter an option ('e' to edit a kernel command line, Enter for the default): "
        } else {
            "Enter an option (Enter for the default): "
        };
        let choice = read(term, prompt, &mut countdown)?;
        if choice.is_empty() {
            return None;
        }
        if options.allow_edit && choice == "e" {
            edit_entry(term, &mut countdown, entries)?;
            continue;
        }
        match parse_index(&choice, entries.len()) {
            Some(index) => return Some(index),
            None => say(term, &format!("{choice:?} is not a valid entry number\r\n")),
        }
    }
}

/// Loads the first default entry that loads cleanly, in declaration order.
pub fn load_default<E: Entry>(entries: &mut [E]) -> Option<usize> {
    for (index, entry) in entries.iter_mut().enumerate() {
        if !entry.is_default() {
            continue;
        }
        info!(entry = %extended_label(&*entry), "attempting to boot");
        match entry.load() {
            Ok(()) => return Some(index),
            Err(e) => warn!(entry = %entry.label(), error = %e, "default entry failed to load"),
        }
    }
    None
}

/// Runs the menu and loads the result. An explicit choice that fails to load
/// re-enters the menu; anything else falls back to [`load_default`]. The
/// returned entry is loaded but not executed, so the caller can clean up
/// first.
pub fn show_menu_and_load<E: Entry, T: MenuTerminal + ?Sized>(
    term: &mut T,
    options: &MenuOptions,
    entries: &mut [E],
) -> Option<usize> {
    while let Some(index) = choose(term, options, entries) {
        let entry = &mut entries[index];
        match entry.load() {
            Ok(()) => return Some(index),
            Err(e) => {
                warn!(entry = %entry.label(), error = %e, "chosen entry failed to load");
                say(term, &format!("Failed to load {}: {e}\r\n", entry.label()));
            }
        }
    }
    say(term, "\r\n");
    load_default(entries)
}
