// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Reentrant advisory file locking.
//!
//! POSIX advisory locks are released when *any* descriptor for the
//! file is closed in the process, and a second `flock` from the same
//! process on a fresh descriptor deadlocks against the first. Build
//! scripts recursively re-enter gup on targets whose state another
//! in-process task may hold, so the kernel lock is wrapped in a
//! process-wide table keyed by path: the `flock` is taken only on the
//! 0→1 reference transition and dropped only on the 1→0 transition.

use std::{
    collections::HashMap,
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use fs_err::{self as fs, File};
use log::debug;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Shared,
    Exclusive,
}

struct Held {
    // Keeps the descriptor (and with it the kernel lock) alive
    _file: File,
    count: usize,
}

static TABLE: OnceLock<Mutex<HashMap<PathBuf, Held>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<PathBuf, Held>> {
    TABLE.get_or_init(Default::default)
}

/// A held reference to the lock at `path`, released on drop
#[derive(Debug)]
pub struct Lock {
    path: PathBuf,
}

/// Acquire the lock file at `path`, blocking until the kernel grants
/// it. A process that already holds the lock in any mode re-enters
/// without touching the kernel; compatibility is only enforced
/// between processes.
pub fn acquire(path: impl Into<PathBuf>, mode: Mode) -> Result<Lock, Error> {
    let path = path.into();

    {
        let mut table = table().lock().expect("lock table");
        if let Some(held) = table.get_mut(&path) {
            held.count += 1;
            return Ok(Lock { path });
        }
    }

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    let (try_arg, wait_arg) = match mode {
        Mode::Shared => (FlockArg::LockSharedNonblock, FlockArg::LockShared),
        Mode::Exclusive => (FlockArg::LockExclusiveNonblock, FlockArg::LockExclusive),
    };

    match flock(file.as_raw_fd(), try_arg) {
        Ok(_) => {}
        Err(nix::errno::Errno::EWOULDBLOCK) => {
            debug!("waiting for lock on {}", path.display());
            flock(file.as_raw_fd(), wait_arg)?;
        }
        Err(e) => Err(e)?,
    }

    let mut table = table().lock().expect("lock table");
    if let Some(held) = table.get_mut(&path) {
        // Another thread acquired a shared lock on its own descriptor
        // while we did; fold into its entry and let our descriptor
        // close.
        held.count += 1;
    } else {
        table.insert(path.clone(), Held { _file: file, count: 1 });
    }

    Ok(Lock { path })
}

impl Drop for Lock {
    fn drop(&mut self) {
        let mut table = table().lock().expect("lock table");
        if let Some(held) = table.get_mut(&self.path) {
            held.count -= 1;
            if held.count == 0 {
                // Closing the descriptor releases the kernel lock
                table.remove(&self.path);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("obtaining file lock")]
    Flock(#[from] nix::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reentrant_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.lock");

        let outer = acquire(&path, Mode::Exclusive).unwrap();
        // A second acquisition (any mode) must not deadlock
        let inner = acquire(&path, Mode::Shared).unwrap();
        drop(inner);

        // Still held after the inner release
        {
            let table = table().lock().unwrap();
            assert_eq!(table.get(&path).map(|h| h.count), Some(1));
        }

        drop(outer);
        let table = table().lock().unwrap();
        assert!(!table.contains_key(&path));
    }
}
