// SPDX-License-Identifier: GPL-3.0-only

//! Picking an entry and handing over to it
//!
//! Mounts are released on every path out of here. On success that happens
//! before the irrevocable execute, since nothing can clean up afterwards.

use boot_menu::{Entry, MenuOptions, MenuTerminal, extended_label, load_default, show_menu_and_load};
use boot_sys::MountPool;
use boot_sys::mount::MntFlags;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// How the entry to boot is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Interactive menu with countdown.
    Menu(MenuOptions),
    /// First default entry that loads.
    Default,
    /// A 0-based index into the ranked list or an entry label. Falls back to
    /// the default walk if it does not load.
    Preselect(String),
}

fn preselected<E: Entry>(entries: &[E], choice: &str) -> Option<usize> {
    if let Ok(index) = choice.parse::<usize>() {
        return (index < entries.len()).then_some(index);
    }
    entries.iter().position(|entry| entry.label() == choice)
}

/// Resolves `selection` to one loaded entry.
pub fn select<E: Entry>(
    entries: &mut [E],
    selection: &Selection,
    term: Option<&mut dyn MenuTerminal>,
) -> Option<usize> {
    match (selection, term) {
        (Selection::Menu(options), Some(term)) => show_menu_and_load(term, options, entries),
        (Selection::Menu(_), None) | (Selection::Default, _) => load_default(entries),
        (Selection::Preselect(choice), _) => {
            match preselected(entries, choice) {
                Some(index) => match entries[index].load() {
                    Ok(()) => return Some(index),
                    Err(e) => warn!(choice = %choice, error = %e, "preselected entry failed to load"),
                },
                None => warn!(choice = %choice, "no entry matches the preselection"),
            }
            load_default(entries)
        }
    }
}

/// Releases every mount in `pool`, logging failures. Releasing an empty
/// pool does nothing, so error paths may call this after [`boot`] did.
pub fn release(pool: &mut MountPool) {
    if let Err(e) = pool.unmount_all(MntFlags::MNT_DETACH) {
        error!(error = %e, "some mounts could not be released");
    }
}

/// Final step: unmount, flush logs, execute. Returns only if executing
/// failed or `dry_run` is set.
pub fn boot<E: Entry>(
    entry: &mut E,
    pool: &mut MountPool,
    log_guard: Option<WorkerGuard>,
    dry_run: bool,
) -> boot_menu::Result<()> {
    info!(entry = %extended_label(&*entry), dry_run, "booting");
    release(pool);
    if dry_run {
        info!("dry run: stopping before handover");
        return Ok(());
    }
    drop(log_guard);
    entry.exec()
}
