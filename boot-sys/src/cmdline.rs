// SPDX-License-Identifier: GPL-3.0-only

//! Kernel command-line rewriting before handover
//!
//! Parameters from the discovered config can be dropped, extra parameters
//! appended, and selected parameters carried over from the running kernel
//! (typically `console=` so the next kernel talks to the same serial port).

use std::fs;
use std::io;

/// Splits a command line into parameters, keeping double-quoted spans intact.
pub fn split_params(cmdline: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in cmdline.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                current.push(ch);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    params.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        params.push(current);
    }
    params
}

/// Kernel parameter names treat `-` and `_` as the same character.
fn canonical_key(param: &str) -> String {
    param
        .split_once('=')
        .map_or(param, |(key, _)| key)
        .replace('-', "_")
}

/// Remove, append, then reuse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateFilter {
    pub append: String,
    pub remove: Vec<String>,
    pub reuse: Vec<String>,
}

impl UpdateFilter {
    pub fn new(append: impl Into<String>, remove: Vec<String>, reuse: Vec<String>) -> Self {
        let clean = |list: Vec<String>| {
            list.into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            append: append.into().trim().to_string(),
            remove: clean(remove),
            reuse: clean(reuse),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.append.is_empty() && self.remove.is_empty() && self.reuse.is_empty()
    }

    /// Rewrites `cmdline`. `current` is the running kernel's command line,
    /// the source of reused parameters.
    pub fn update(&self, cmdline: &str, current: &str) -> String {
        let remove: Vec<String> = self.remove.iter().map(|key| canonical_key(key)).collect();
        let mut params: Vec<String> = split_params(cmdline)
            .into_iter()
            .filter(|param| !remove.contains(&canonical_key(param)))
            .collect();

        if !self.append.is_empty() {
            params.push(self.append.clone());
        }

        let current = split_params(current);
        for key in &self.reuse {
            let key = canonical_key(key);
            params.extend(
                current
                    .iter()
                    .filter(|param| canonical_key(param) == key)
                    .cloned(),
            );
        }
        params.join(" ")
    }

    /// [`UpdateFilter::update`] against `/proc/cmdline`.
    pub fn update_from_proc(&self, cmdline: &str) -> io::Result<String> {
        let current = if self.reuse.is_empty() {
            String::new()
        } else {
            fs::read_to_string("/proc/cmdline")?
        };
        Ok(self.update(cmdline, current.trim()))
    }
}
