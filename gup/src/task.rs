// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The task driver.
//!
//! Each requested target becomes a [`Task`]. Buildable tasks acquire
//! a jobserver token and run on their own thread; targets that turn
//! out to be plain source files are recorded as inputs of the parent
//! without building anything. A failure never cancels peers: every
//! submitted task runs to completion and one representative error
//! decides the exit status.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    thread,
};

use log::{debug, error, info};
use thiserror::Error;

use crate::{
    builder::{self, Builder},
    env,
    jobserver::{self, Jobserver},
    state::{self, Dependency, TargetState},
    util,
};

/// Options governing one driver run
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Build only when stale
    pub update: bool,
}

/// One requested target
struct Task {
    /// Absolute, normalized target path
    target: PathBuf,
    /// Target of the build script that invoked us, if any
    parent: Option<PathBuf>,
    update: bool,
}

impl Task {
    /// Resolve the build script, handling the not-buildable edges:
    /// under `--update` an existing source file is simply up to date
    fn prepare(&self) -> Result<Option<Builder>, Error> {
        let builder = builder::prepare_build(&self.target)?;
        if builder.is_some() {
            return Ok(builder);
        }
        if self.update && self.target.exists() {
            if env::is_root() {
                info!("{}: up to date", self.target.display());
            } else {
                debug!("{}: up to date", self.target.display());
            }
            return Ok(None);
        }
        Err(Error::Unbuildable(self.target.clone()))
    }

    /// Record this task's outcome as a FileDependency of the parent
    /// target's in-progress record
    fn record_in_parent(&self) -> Result<(), Error> {
        let Some(parent) = &self.parent else {
            return Ok(());
        };
        let parent_dir = parent.parent().unwrap_or(Path::new("/"));

        let checksum = TargetState::new(&self.target)
            .deps()?
            .and_then(|deps| deps.checksum().map(str::to_owned));

        TargetState::new(parent).add_dependency(&Dependency::File {
            path: util::relative_to(&self.target, parent_dir),
            mtime: util::mtime(&self.target)?,
            checksum,
        })?;
        Ok(())
    }
}

fn execute(task: &Task, builder: &Builder, jobserver: &Jobserver) -> Result<(), Error> {
    builder.build(task.update, jobserver)?;
    task.record_in_parent()
}

pub struct Runner {
    jobserver: Arc<Jobserver>,
}

impl Runner {
    pub fn new(jobserver: Arc<Jobserver>) -> Self {
        Self { jobserver }
    }

    /// Build every requested target. All submitted work drains
    /// before the first failure is reported.
    pub fn run(&self, targets: &[PathBuf], opts: Options) -> Result<(), Error> {
        let parent = env::parent_target();
        let (tx, rx) = mpsc::channel();
        let mut failed = None;
        let mut seen = HashSet::new();

        for path in targets {
            let target = util::absolutize(path)?;
            if !seen.insert(target.clone()) {
                debug!("{}: already requested", target.display());
                continue;
            }
            let task = Task {
                target,
                parent: parent.clone(),
                update: opts.update,
            };

            match task.prepare() {
                Ok(Some(builder)) => {
                    if self.jobserver.is_serial() {
                        report(&mut failed, execute(&task, &builder, &self.jobserver));
                        continue;
                    }

                    let token = match Arc::clone(&self.jobserver).acquire() {
                        Ok(token) => token,
                        Err(e) => {
                            report(&mut failed, Err(e.into()));
                            break;
                        }
                    };
                    let tx = tx.clone();
                    let jobserver = Arc::clone(&self.jobserver);
                    thread::spawn(move || {
                        let result = execute(&task, &builder, &jobserver);
                        drop(token);
                        let _ = tx.send(result);
                    });
                }
                Ok(None) => report(&mut failed, task.record_in_parent()),
                Err(e) => report(&mut failed, Err(e)),
            }
        }

        drop(tx);
        for result in rx {
            report(&mut failed, result);
        }

        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Log each failure once, at the boundary where the child's output
/// ended, keeping the first as the representative
fn report(slot: &mut Option<Error>, result: Result<(), Error>) {
    use std::fmt::Write as _;

    let Err(err) = result else { return };
    match &err {
        // The sub-gup has already told the user everything
        Error::Build(builder::Error::Safe) => debug!("{err}"),
        _ => {
            let mut message = err.to_string();
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                let _ = write!(message, ": {cause}");
                source = cause.source();
            }
            error!("{message}");
        }
    }
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Don't know how to build {}", .0.display())]
    Unbuildable(PathBuf),
    #[error(transparent)]
    Build(#[from] builder::Error),
    #[error("target state")]
    State(#[from] state::Error),
    #[error("jobserver")]
    Jobserver(#[from] jobserver::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_user(&self) -> bool {
        match self {
            Self::Unbuildable(_) => true,
            Self::Build(e) => e.is_user(),
            _ => false,
        }
    }
}
