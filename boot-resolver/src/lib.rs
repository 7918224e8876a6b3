// SPDX-License-Identifier: GPL-3.0-only

//! Boot resolver
//!
//! Finds every bootable system reachable from this machine, ranks the
//! candidates and hands over to one of them with kexec:
//!
//! 1. **Discovery**: local block devices ([`resolve`]) or a network lease
//!    ([`netboot`])
//! 2. **Selection**: the interactive menu, a preselection or the default walk
//! 3. **Handover**: release all mounts, then execute ([`handover`])
//!
//! The binary wires these together; the library exists so the pipeline can
//! be driven against fake devices in tests.

pub mod error;
pub mod handover;
pub mod logging;
pub mod netboot;
pub mod resolve;
pub mod settings;

pub use error::{ResolveError, Result};
pub use handover::Selection;
pub use resolve::{DeviceFilters, Resolver, find_devices};
pub use settings::Settings;
