// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build executor.
//!
//! Drives a single resolved target: takes the build lock, decides
//! staleness, runs the script against a temporary output path and
//! installs the result atomically. Dependencies declared by the
//! running script arrive through nested gup invocations appending to
//! the in-progress record; the executor itself only contributes the
//! leading builder entry.

use std::{
    collections::{HashMap, HashSet},
    io::{self, BufRead, BufReader},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process,
    sync::{Condvar, Mutex, OnceLock},
    thread::{self, ThreadId},
};

use fs_err as fs;
use log::{debug, info};
use thiserror::Error;

use crate::{
    env,
    gupfile::{self, BuildScript},
    jobserver::Jobserver,
    signal::Signal,
    state::{self, Dependency, Dirtiness, TargetState},
    util,
};

/// Exit status of a child gup whose failure was already reported;
/// ancestors propagate it without re-logging. Stable across releases.
pub const SAFE_EXIT_CODE: i32 = 11;

/// Outcome of driving one target through the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Built {
    Fresh,
    UpToDate,
}

/// Resolve `target` (absolute, normalized) to a ready-to-run builder,
/// or `None` when no script is responsible for it
pub fn prepare_build(target: &Path) -> Result<Option<Builder>, Error> {
    Ok(gupfile::find_builder(target)?.map(|script| Builder {
        target: target.to_path_buf(),
        script,
    }))
}

pub struct Builder {
    target: PathBuf,
    script: BuildScript,
}

impl Builder {
    pub fn target(&self) -> &Path {
        &self.target
    }

    fn target_dir(&self) -> &Path {
        self.target.parent().unwrap_or(Path::new("/"))
    }

    /// Script path as stored in the record: relative to the target's
    /// directory, so trees stay relocatable
    fn script_rel(&self) -> PathBuf {
        util::relative_to(&self.script.script, self.target_dir())
    }

    fn temp_output(&self) -> PathBuf {
        let mut name = self.target.file_name().unwrap_or_default().to_os_string();
        name.push(".gup.tmp");
        self.target.with_file_name(name)
    }

    /// Build the target, or under `update` only when it is stale
    pub fn build(&self, update: bool, jobserver: &Jobserver) -> Result<Built, Error> {
        if env::ancestors().contains(&self.target) {
            return Err(Error::DependencyCycle(self.target.clone()));
        }
        let _flight = Flight::enter(&self.target)?;

        let state = TargetState::new(&self.target);
        let _lock = state.lock_exclusive()?;

        let script_rel = self.script_rel();
        if update && !self.stale(&state, &script_rel, jobserver)? {
            if env::is_root() {
                info!("{}: up to date", self.script.rel.display());
            } else {
                debug!("{}: up to date", self.target.display());
            }
            return Ok(Built::UpToDate);
        }

        state.begin(&Dependency::Builder {
            mtime: util::mtime(&self.script.script)?,
            path: script_rel,
        })?;

        let temp = self.temp_output();
        info!("building {}", self.script.rel.display());
        let status = self.run_script(&temp, jobserver)?;

        if status.success() {
            if temp.exists() {
                fs::rename(&temp, &self.target)?;
            }
            // An absent temp is fine: the script either declined to
            // regenerate an existing target, or the target is phony
            state.commit()?;
            return Ok(Built::Fresh);
        }

        if temp.exists() {
            fs::remove_file(&temp)?;
        }
        state.discard()?;

        match status.code() {
            Some(SAFE_EXIT_CODE) => Err(Error::Safe),
            Some(code) => Err(Error::TargetFailed {
                target: self.target.clone(),
                code,
            }),
            None => match status.signal().and_then(|s| Signal::try_from(s).ok()) {
                Some(signal) => Err(Error::Killed {
                    target: self.target.clone(),
                    signal,
                }),
                None => Err(Error::TargetFailed {
                    target: self.target.clone(),
                    code: -1,
                }),
            },
        }
    }

    /// Decide staleness, bringing built dependencies up to date first
    /// so their mtimes and checksums are meaningful
    fn stale(
        &self,
        state: &TargetState,
        script_rel: &Path,
        jobserver: &Jobserver,
    ) -> Result<bool, Error> {
        let mut updated: HashSet<PathBuf> = HashSet::new();
        loop {
            match state.dirtiness(script_rel)? {
                Dirtiness::Clean => return Ok(false),
                Dirtiness::Dirty => return Ok(true),
                Dirtiness::NeedsDeps(children) => {
                    // A child we already updated coming back means the
                    // question cannot settle; rebuild conservatively
                    if children.iter().any(|child| updated.contains(child)) {
                        return Ok(true);
                    }
                    for child in children {
                        if let Some(dep) = prepare_build(&child)? {
                            dep.build(true, jobserver)?;
                        }
                        updated.insert(child);
                    }
                }
            }
        }
    }

    fn run_script(&self, temp: &Path, jobserver: &Jobserver) -> Result<process::ExitStatus, Error> {
        let mut cmd = process::Command::new(&self.script.script);
        self.configure(&mut cmd, temp, jobserver);

        match cmd.spawn() {
            Ok(mut child) => Ok(child.wait()?),
            Err(e) if needs_interpreter(&e) => self.run_with_interpreter(temp, jobserver),
            Err(e) => Err(e.into()),
        }
    }

    /// Kernels only honour absolute interpreter paths; gup scripts
    /// habitually say `#!bash`, so parse the line ourselves
    fn run_with_interpreter(
        &self,
        temp: &Path,
        jobserver: &Jobserver,
    ) -> Result<process::ExitStatus, Error> {
        let mut first = String::new();
        BufReader::new(fs::File::open(&self.script.script)?).read_line(&mut first)?;

        let words: Vec<&str> = first
            .strip_prefix("#!")
            .map(|rest| rest.split_whitespace().collect())
            .unwrap_or_default();
        let (interpreter, args) = words.split_first().unwrap_or((&"sh", &[]));

        debug!("{}: running via {interpreter}", self.script.script.display());

        let mut cmd = process::Command::new(interpreter);
        cmd.args(args).arg(&self.script.script);
        self.configure(&mut cmd, temp, jobserver);

        Ok(cmd.spawn()?.wait()?)
    }

    fn configure(&self, cmd: &mut process::Command, temp: &Path, jobserver: &Jobserver) {
        cmd.arg(temp)
            .arg(&self.script.rel)
            .arg(self.target.file_name().unwrap_or_default())
            .current_dir(&self.script.basedir)
            .env(env::TARGET, &self.target)
            .env(env::ANCESTORS, env::child_ancestors(&self.target));
        jobserver.export(cmd);
    }
}

static IN_FLIGHT: OnceLock<(Mutex<HashMap<PathBuf, ThreadId>>, Condvar)> = OnceLock::new();

fn in_flight() -> &'static (Mutex<HashMap<PathBuf, ThreadId>>, Condvar) {
    IN_FLIGHT.get_or_init(Default::default)
}

/// Marks a target as being built by this thread. A second thread
/// asking for the same target waits for the first to finish and then
/// proceeds (usually to find it fresh); the same thread asking again
/// has recursed into its own dependency chain.
struct Flight {
    target: PathBuf,
}

impl Flight {
    fn enter(target: &Path) -> Result<Self, Error> {
        let (map, cond) = in_flight();
        let mut held = map.lock().expect("in-flight table");
        loop {
            match held.get(target) {
                None => {
                    held.insert(target.to_path_buf(), thread::current().id());
                    return Ok(Self {
                        target: target.to_path_buf(),
                    });
                }
                Some(owner) if *owner == thread::current().id() => {
                    return Err(Error::DependencyCycle(target.to_path_buf()));
                }
                Some(_) => {
                    held = cond.wait(held).expect("in-flight table");
                }
            }
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        let (map, cond) = in_flight();
        map.lock().expect("in-flight table").remove(&self.target);
        cond.notify_all();
    }
}

fn needs_interpreter(e: &io::Error) -> bool {
    use nix::libc::{EACCES, ENOENT, ENOEXEC};
    // ENOENT surfaces when the script exists but its hashbang
    // interpreter does not name an absolute path
    matches!(e.raw_os_error(), Some(ENOEXEC | EACCES | ENOENT))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("dependency cycle detected while building {}", .0.display())]
    DependencyCycle(PathBuf),
    #[error("{}: build failed with status {code}", .target.display())]
    TargetFailed { target: PathBuf, code: i32 },
    #[error("{}: build script killed by {signal}", .target.display())]
    Killed { target: PathBuf, signal: Signal },
    #[error("build failure reported by sub-gup")]
    Safe,
    #[error("resolving build script")]
    Resolve(#[from] gupfile::Error),
    #[error("target state")]
    State(#[from] state::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    /// User-visible build failures exit 2; everything else is
    /// internal and exits 1
    pub fn is_user(&self) -> bool {
        matches!(
            self,
            Self::DependencyCycle(_) | Self::TargetFailed { .. } | Self::Killed { .. } | Self::Safe
        )
    }
}
