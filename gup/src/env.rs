// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The gup ↔ gup environment protocol.
//!
//! A build script is free to re-enter gup; these variables tell the
//! nested invocation whose record it is contributing to, which
//! jobserver to cooperate with, and which targets are already being
//! built above it.

use std::path::{Path, PathBuf};

/// Absolute path of the target currently being built
pub const TARGET: &str = "GUP_TARGET";

/// Chain of in-flight targets, for cycle detection
pub const ANCESTORS: &str = "GUP_ANCESTORS";

/// Jobserver back-channel: `0` for serial, otherwise a fifo path
pub const JOBSERVER: &str = "GUP_JOBSERVER";

/// Identifies one top-level invocation across the whole process tree
pub const RUN_ID: &str = "GUP_RUNID";

/// Propagated unchanged so grand-children cooperate with make
pub const MAKEFLAGS: &str = "MAKEFLAGS";

/// Diagnostic switches used by test harnesses
pub const COLOR: &str = "GUP_COLOR";
pub const IN_TESTS: &str = "GUP_IN_TESTS";

const CHAIN_SEP: char = ':';

/// The target the invoking build script is producing, if any
pub fn parent_target() -> Option<PathBuf> {
    std::env::var_os(TARGET)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// True for a top-level invocation (not spawned by a build script)
pub fn is_root() -> bool {
    parent_target().is_none()
}

/// Every target currently being built between the top-level
/// invocation and us
pub fn ancestors() -> Vec<PathBuf> {
    std::env::var(ANCESTORS)
        .map(|chain| {
            chain
                .split(CHAIN_SEP)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Chain value for a child spawned to build `target`
pub fn child_ancestors(target: &Path) -> String {
    let mut chain = std::env::var(ANCESTORS).unwrap_or_default();
    if !chain.is_empty() {
        chain.push(CHAIN_SEP);
    }
    chain.push_str(&target.to_string_lossy());
    chain
}

/// Current run id, generating and exporting one when we are the
/// top-level invocation
pub fn ensure_run_id() -> String {
    if let Ok(id) = std::env::var(RUN_ID) {
        if !id.is_empty() {
            return id;
        }
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let id = format!("{}.{now}", std::process::id());
    std::env::set_var(RUN_ID, &id);
    id
}

pub fn run_id() -> Option<String> {
    std::env::var(RUN_ID).ok().filter(|id| !id.is_empty())
}

/// `GUP_COLOR` forces colored diagnostics on (`1`) or off (`0`)
pub fn color_override() -> Option<bool> {
    match std::env::var(COLOR).ok()?.as_str() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}
