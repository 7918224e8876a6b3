// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::settings::LogSettings;

const LOG_FILE: &str = "boot-resolver.log";
const BOOT_CRATES: &[&str] = &["boot_resolver", "boot_sys", "boot_config", "boot_menu"];

/// Overrides the log directory from the settings file.
pub const LOG_DIR_ENV: &str = "BOOT_RESOLVER_LOG_DIR";

fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    let mut directives: Vec<String> = BOOT_CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect();
    directives.push("warn".to_string());
    directives.join(",")
}

fn log_dir(settings: &LogSettings) -> PathBuf {
    std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| settings.dir.clone())
}

/// Installs the global subscriber: stderr always, plus a log file when
/// enabled. The returned guard flushes the file; drop it before handing
/// over to another kernel.
pub fn init(settings: &LogSettings, verbose: bool) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    if !settings.to_file {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let dir = log_dir(settings);
    match fs::create_dir_all(&dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            eprintln!("boot-resolver: failed to create log directory {}: {e}", dir.display());
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_cover_every_boot_crate() {
        assert_eq!(
            default_directives(false),
            "boot_resolver=info,boot_sys=info,boot_config=info,boot_menu=info,warn"
        );
        assert!(default_directives(true).starts_with("boot_resolver=debug,"));
    }
}
