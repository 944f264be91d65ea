// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Signal handling during a build.
//!
//! Build scripts share our process group, so a terminal interrupt
//! reaches every descendant directly. We only record the fact: the
//! driver lets outstanding children finish dying, drains the pool
//! and exits nonzero.

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};
use thiserror::Error;

pub use nix::sys::signal::Signal;

static RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn handler(signal: i32) {
    RECEIVED.store(signal, Ordering::SeqCst);
}

/// Record the provided signals until [`Guard`] is dropped
pub fn record(signals: impl IntoIterator<Item = Signal>) -> Result<Guard, Error> {
    Ok(Guard(
        signals
            .into_iter()
            .map(|signal| unsafe {
                let action = sigaction(
                    signal,
                    &SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty()),
                )
                .map_err(Error::Install)?;

                Ok(PrevHandler { signal, action })
            })
            .collect::<Result<_, Error>>()?,
    ))
}

/// The signal observed since [`record`], if any
pub fn received() -> Option<Signal> {
    match RECEIVED.load(Ordering::SeqCst) {
        0 => None,
        signal => Signal::try_from(signal).ok(),
    }
}

/// A guard which restores the previous signal
/// handlers when dropped
pub struct Guard(Vec<PrevHandler>);

impl Drop for Guard {
    fn drop(&mut self) {
        for PrevHandler { signal, action } in &self.0 {
            unsafe {
                let _ = sigaction(*signal, action);
            };
        }
    }
}

struct PrevHandler {
    signal: Signal,
    action: SigAction,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("install signal handler")]
    Install(#[source] nix::Error),
}
