// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The make-compatible jobserver.
//!
//! A global cap of N concurrent build scripts is enforced across the
//! whole process tree by a token pool holding N−1 bytes: every
//! process owns one implicit token by being alive, and reads a byte
//! from the pool for each further concurrent job. Three modes:
//!
//! - inherited: a surrounding `make -jN` advertised its pool in
//!   `MAKEFLAGS`; use it and do not advertise our own;
//! - owned: we were invoked with `-jN`; back the pool with a named
//!   fifo whose path travels in `GUP_JOBSERVER`;
//! - serial: `-j1`, signalled downward as `GUP_JOBSERVER=0`.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, Read, Write},
    mem::ManuallyDrop,
    os::fd::{FromRawFd, RawFd},
    path::{Path, PathBuf},
    process,
    sync::{Arc, Mutex},
};

use fs_err as fs;
use log::{debug, error};
use nix::{sys::stat::Mode, unistd::mkfifo};
use thiserror::Error;

use crate::env;

/// `GUP_JOBSERVER` value meaning "no token protocol"
pub const SERIAL: &str = "0";

enum Pool {
    Serial,
    /// A named fifo; both handles are opened read-write so neither
    /// open blocks waiting for a peer
    Fifo { reader: File, writer: File },
    /// Descriptors inherited from make. Never closed: the wrappers
    /// are `ManuallyDrop` so the fds survive us and our siblings.
    Fds {
        reader: ManuallyDrop<File>,
        writer: ManuallyDrop<File>,
    },
}

pub struct Jobserver {
    pool: Pool,
    /// The token this process holds simply by being alive
    implicit: Mutex<bool>,
    /// What children see in `GUP_JOBSERVER`; `None` removes it
    advertise: Option<OsString>,
    /// Fifo directory to clean up, set only for the owning process
    owned: Option<PathBuf>,
}

enum Auth {
    Fds(RawFd, RawFd),
    Fifo(PathBuf),
}

fn parse_makeflags(flags: &str) -> Option<Auth> {
    for word in flags.split_whitespace() {
        let Some(rest) = word
            .strip_prefix("--jobserver-auth=")
            .or_else(|| word.strip_prefix("--jobserver-fds="))
        else {
            continue;
        };
        if let Some(path) = rest.strip_prefix("fifo:") {
            return Some(Auth::Fifo(path.into()));
        }
        let (read, write) = rest.split_once(',')?;
        let (read, write) = (read.parse().ok()?, write.parse().ok()?);
        // make marks an unusable jobserver with negative fds
        if read < 0 || write < 0 {
            return None;
        }
        return Some(Auth::Fds(read, write));
    }
    None
}

fn open_rdwr(path: &Path) -> io::Result<File> {
    std::fs::OpenOptions::new().read(true).write(true).open(path)
}

impl Jobserver {
    /// Resolve the jobserver for this invocation. An inherited make
    /// pool wins over everything; a parent gup's pool wins over
    /// `-jN`; otherwise `jobs` decides between serial and owned.
    pub fn from_env(jobs: usize) -> Result<Self, Error> {
        if let Ok(flags) = std::env::var(env::MAKEFLAGS) {
            match parse_makeflags(&flags) {
                Some(Auth::Fds(read, write)) => {
                    debug!("cooperating with make jobserver on fds {read},{write}");
                    let (reader, writer) = unsafe {
                        (
                            ManuallyDrop::new(File::from_raw_fd(read)),
                            ManuallyDrop::new(File::from_raw_fd(write)),
                        )
                    };
                    return Ok(Self {
                        pool: Pool::Fds { reader, writer },
                        implicit: Mutex::new(true),
                        advertise: None,
                        owned: None,
                    });
                }
                Some(Auth::Fifo(path)) => {
                    debug!("cooperating with make jobserver at {}", path.display());
                    return Ok(Self {
                        pool: Pool::Fifo {
                            reader: open_rdwr(&path)?,
                            writer: open_rdwr(&path)?,
                        },
                        implicit: Mutex::new(true),
                        advertise: None,
                        owned: None,
                    });
                }
                None => {}
            }
        }

        if let Ok(value) = std::env::var(env::JOBSERVER) {
            if value == SERIAL {
                return Ok(Self::serial());
            }
            if !value.is_empty() {
                let path = PathBuf::from(&value);
                return Ok(Self {
                    pool: Pool::Fifo {
                        reader: open_rdwr(&path)?,
                        writer: open_rdwr(&path)?,
                    },
                    implicit: Mutex::new(true),
                    advertise: Some(value.into()),
                    owned: None,
                });
            }
        }

        match jobs {
            0 | 1 => Ok(Self::serial()),
            n => Self::owned(n),
        }
    }

    fn serial() -> Self {
        Self {
            pool: Pool::Serial,
            implicit: Mutex::new(true),
            advertise: Some(SERIAL.into()),
            owned: None,
        }
    }

    fn owned(capacity: usize) -> Result<Self, Error> {
        let dir = std::env::temp_dir().join(format!("gup-{}", process::id()));
        fs::create_dir_all(&dir)?;
        let path = dir.join("tokens");
        if path.exists() {
            fs::remove_file(&path)?;
        }
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(Error::Mkfifo)?;

        let reader = open_rdwr(&path)?;
        let writer = open_rdwr(&path)?;
        // The invoking process implicitly holds one of the N slots
        for _ in 1..capacity {
            (&writer).write_all(b"+")?;
        }

        debug!("jobserver of capacity {capacity} at {}", path.display());

        Ok(Self {
            pool: Pool::Fifo { reader, writer },
            implicit: Mutex::new(true),
            advertise: Some(path.into_os_string()),
            owned: Some(dir),
        })
    }

    /// True when jobs must run inline, one at a time
    pub fn is_serial(&self) -> bool {
        matches!(self.pool, Pool::Serial)
    }

    fn reader(&self) -> Option<&File> {
        match &self.pool {
            Pool::Serial => None,
            Pool::Fifo { reader, .. } => Some(reader),
            Pool::Fds { reader, .. } => Some(reader),
        }
    }

    fn writer(&self) -> Option<&File> {
        match &self.pool {
            Pool::Serial => None,
            Pool::Fifo { writer, .. } => Some(writer),
            Pool::Fds { writer, .. } => Some(writer),
        }
    }

    /// Acquire the right to run one job, blocking until the pool
    /// grants it. The returned token is released on drop, on every
    /// exit path.
    pub fn acquire(self: Arc<Self>) -> Result<Token, Error> {
        if self.is_serial() {
            return Ok(Token {
                server: self,
                kind: TokenKind::Serial,
            });
        }

        {
            let mut implicit = self.implicit.lock().expect("jobserver state");
            if *implicit {
                *implicit = false;
                drop(implicit);
                return Ok(Token {
                    server: self,
                    kind: TokenKind::Implicit,
                });
            }
        }

        let mut buf = [0u8; 1];
        {
            let mut reader = self.reader().expect("non-serial pool has a reader");
            reader.read_exact(&mut buf)?;
        }

        Ok(Token {
            server: self,
            kind: TokenKind::Pipe(buf[0]),
        })
    }

    /// Configure `cmd` so nested invocations cooperate with this
    /// pool. `MAKEFLAGS` propagates by plain inheritance.
    pub fn export(&self, cmd: &mut process::Command) {
        match &self.advertise {
            Some(value) => {
                cmd.env(env::JOBSERVER, value);
            }
            None => {
                cmd.env_remove(env::JOBSERVER);
            }
        }
    }
}

impl Drop for Jobserver {
    fn drop(&mut self) {
        if let Some(dir) = &self.owned {
            let _ = fs::remove_file(dir.join("tokens"));
            let _ = fs::remove_dir(dir);
        }
    }
}

enum TokenKind {
    Serial,
    Implicit,
    Pipe(u8),
}

/// The right to run one job
#[must_use = "dropping the token is what returns it to the pool"]
pub struct Token {
    server: Arc<Jobserver>,
    kind: TokenKind,
}

impl Drop for Token {
    fn drop(&mut self) {
        match self.kind {
            TokenKind::Serial => {}
            TokenKind::Implicit => {
                *self.server.implicit.lock().expect("jobserver state") = true;
            }
            TokenKind::Pipe(byte) => {
                if let Some(mut writer) = self.server.writer() {
                    if let Err(e) = writer.write_all(&[byte]) {
                        // A leaked token starves the whole build;
                        // nothing to do beyond making it loud
                        error!("failed to return jobserver token: {e}");
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("creating jobserver fifo")]
    Mkfifo(#[source] nix::Error),
}
