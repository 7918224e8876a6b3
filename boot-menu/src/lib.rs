// SPDX-License-Identifier: GPL-3.0-only

//! Interactive boot menu
//!
//! Presents the ranked candidates plus a shell and a reboot action, counts
//! down towards the default and resolves to exactly one loaded entry. The
//! caller executes it after releasing everything it holds.

pub mod entry;
pub mod error;
pub mod menu;
pub mod terminal;

pub use entry::{Entry, ImageEntry, MenuEntry, extended_label};
pub use error::{MenuError, Result};
pub use menu::{MenuOptions, choose, load_default, show_menu_and_load};
pub use terminal::{Countdown, CrosstermTerminal, MenuTerminal};
