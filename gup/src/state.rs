// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-target dependency records.
//!
//! Each target `T` keeps its state in `dirname(T)/.gup/`: the
//! published record `<name>.deps`, the in-progress record
//! `<name>.deps.tmp` appended while a build runs, and the build lock
//! `<name>.lock`. Records are line-oriented; a record without its
//! terminator is treated as absent, never as an error.

use std::{
    io::{self, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use fs_err::{self as fs, File, OpenOptions};
use log::debug;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

use crate::{
    env, gupfile,
    lock::{self, Lock, Mode},
    util::{self, Mtime},
};

/// Directory holding records, next to the targets it describes
pub const STATE_DIR: &str = ".gup";

const FORMAT_TAG: &str = "gup-deps/1";
const RUN_PREFIX: &str = "run ";
const TERMINATOR: &str = "done";
const ABSENT: &str = "-";

/// One entry of a dependency record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// The script that produced the target; always the first entry
    Builder {
        path: PathBuf,
        mtime: Option<Mtime>,
    },
    /// An input observed while the build ran
    File {
        path: PathBuf,
        mtime: Option<Mtime>,
        checksum: Option<String>,
    },
    /// The target asked to be rebuilt every run
    Always,
    /// The target observed the non-existence of a path
    NeverCreated { path: PathBuf },
    /// Checksum the target advertises to its consumers
    Checksum(String),
}

fn format_mtime(mtime: Option<Mtime>) -> String {
    mtime.map(|ms| ms.to_string()).unwrap_or_else(|| ABSENT.into())
}

fn parse_mtime(token: &str) -> Result<Option<Mtime>, Error> {
    if token == ABSENT {
        return Ok(None);
    }
    token
        .parse()
        .map(Some)
        .map_err(|_| Error::Malformed(token.into()))
}

impl Dependency {
    fn serialize(&self) -> String {
        match self {
            Self::Builder { path, mtime } => {
                format!("builder {} {}", format_mtime(*mtime), path.display())
            }
            Self::File { path, mtime, checksum } => format!(
                "file {} {} {}",
                format_mtime(*mtime),
                checksum.as_deref().unwrap_or(ABSENT),
                path.display()
            ),
            Self::Always => "always".into(),
            Self::NeverCreated { path } => format!("ifcreate {}", path.display()),
            Self::Checksum(sum) => format!("checksum {sum}"),
        }
    }

    fn parse(line: &str) -> Result<Self, Error> {
        let malformed = || Error::Malformed(line.into());
        let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));

        match kind {
            "builder" => {
                let (mtime, path) = rest.split_once(' ').ok_or_else(malformed)?;
                Ok(Self::Builder {
                    path: path.into(),
                    mtime: parse_mtime(mtime)?,
                })
            }
            "file" => {
                let (mtime, rest) = rest.split_once(' ').ok_or_else(malformed)?;
                let (checksum, path) = rest.split_once(' ').ok_or_else(malformed)?;
                Ok(Self::File {
                    path: path.into(),
                    mtime: parse_mtime(mtime)?,
                    checksum: (checksum != ABSENT).then(|| checksum.into()),
                })
            }
            "always" => Ok(Self::Always),
            "ifcreate" => Ok(Self::NeverCreated { path: rest.into() }),
            "checksum" => Ok(Self::Checksum(rest.into())),
            _ => Err(malformed()),
        }
    }
}

/// Verdict of the staleness predicate
#[derive(Debug, PartialEq, Eq)]
pub enum Dirtiness {
    Clean,
    Dirty,
    /// Built dependencies that must be brought up to date before the
    /// question can be answered
    NeedsDeps(Vec<PathBuf>),
}

/// A parsed, terminated record
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Deps {
    pub run_id: Option<String>,
    pub entries: Vec<Dependency>,
}

impl Deps {
    /// The checksum this target advertises, if its build declared one
    pub fn checksum(&self) -> Option<&str> {
        self.entries.iter().find_map(|entry| match entry {
            Dependency::Checksum(sum) => Some(sum.as_str()),
            _ => None,
        })
    }
}

/// Handle on the persistent state of one target
#[derive(Debug, Clone)]
pub struct TargetState {
    target: PathBuf,
}

impl TargetState {
    /// `target` must be an absolute, normalized path
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self { target: target.into() }
    }

    fn dir(&self) -> &Path {
        self.target.parent().unwrap_or(Path::new("/"))
    }

    fn state_file(&self, suffix: &str) -> PathBuf {
        let name = self.target.file_name().unwrap_or_default();
        let mut file = name.to_os_string();
        file.push(suffix);
        self.dir().join(STATE_DIR).join(file)
    }

    pub fn deps_path(&self) -> PathBuf {
        self.state_file(".deps")
    }

    fn staging_path(&self) -> PathBuf {
        self.state_file(".deps.tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.state_file(".lock")
    }

    /// Take the build lock; held for the full duration of a build
    pub fn lock_exclusive(&self) -> Result<Lock, Error> {
        util::ensure_dir_exists(&self.dir().join(STATE_DIR))?;
        Ok(lock::acquire(self.lock_path(), Mode::Exclusive)?)
    }

    /// The published record, or `None` when absent, unterminated or
    /// unreadable (all three simply mean "dirty")
    pub fn deps(&self) -> Result<Option<Deps>, Error> {
        if !self.deps_path().exists() {
            return Ok(None);
        }
        util::ensure_dir_exists(&self.dir().join(STATE_DIR))?;
        let _lock = lock::acquire(self.lock_path(), Mode::Shared)?;
        self.read_record()
    }

    fn read_record(&self) -> Result<Option<Deps>, Error> {
        let contents = match fs::read_to_string(self.deps_path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = contents.lines();
        if lines.next() != Some(FORMAT_TAG) {
            debug!("{}: unrecognised record format", self.deps_path().display());
            return Ok(None);
        }

        let mut deps = Deps::default();
        let mut terminated = false;
        for line in lines {
            if line == TERMINATOR {
                terminated = true;
                break;
            }
            if let Some(id) = line.strip_prefix(RUN_PREFIX) {
                deps.run_id = Some(id.into());
                continue;
            }
            match Dependency::parse(line) {
                Ok(entry) => deps.entries.push(entry),
                Err(_) => {
                    debug!("{}: malformed entry, treating as dirty", self.deps_path().display());
                    return Ok(None);
                }
            }
        }

        Ok(terminated.then_some(deps))
    }

    /// Start a fresh in-progress record. The caller holds the build
    /// lock; the first entry is always the builder.
    pub fn begin(&self, builder: &Dependency) -> Result<(), Error> {
        util::ensure_dir_exists(&self.dir().join(STATE_DIR))?;
        let mut file = File::create(self.staging_path())?;
        writeln!(file, "{FORMAT_TAG}")?;
        if let Some(id) = env::run_id() {
            writeln!(file, "{RUN_PREFIX}{id}")?;
        }
        writeln!(file, "{}", builder.serialize())?;
        Ok(())
    }

    /// Append one entry to the in-progress record.
    ///
    /// The caller may be a different process than the one holding the
    /// build lock (a nested gup recording into its parent), so
    /// appends serialize on a short flock of the record itself.
    pub fn add_dependency(&self, dep: &Dependency) -> Result<(), Error> {
        util::ensure_dir_exists(&self.dir().join(STATE_DIR))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.staging_path())?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(Error::Flock)?;
        writeln!(file, "{}", dep.serialize())?;
        file.flush()?;
        Ok(())
    }

    /// Atomically publish the in-progress record
    pub fn commit(&self) -> Result<(), Error> {
        let mut file = OpenOptions::new().append(true).open(self.staging_path())?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(Error::Flock)?;
        writeln!(file, "{TERMINATOR}")?;
        file.sync_all()?;
        drop(file);
        fs::rename(self.staging_path(), self.deps_path())?;
        Ok(())
    }

    /// Drop the in-progress record, leaving any published state intact
    pub fn discard(&self) -> Result<(), Error> {
        match fs::remove_file(self.staging_path()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The staleness predicate. `current_builder` is the resolved
    /// script path relative to the target's directory. Must be called
    /// under the build lock: a checksum match with a moved mtime
    /// rewrites the record in place.
    ///
    /// Comparing against a dependency that is itself a gup target is
    /// only meaningful once that dependency is current, so those are
    /// handed back as [`Dirtiness::NeedsDeps`] for the executor to
    /// bring up to date before asking again.
    pub fn dirtiness(&self, current_builder: &Path) -> Result<Dirtiness, Error> {
        let Some(mut deps) = self.deps()? else {
            return Ok(Dirtiness::Dirty);
        };

        let run_id = env::run_id();
        // Already brought up to date by this very invocation
        if deps.run_id.is_some() && deps.run_id == run_id {
            return Ok(Dirtiness::Clean);
        }

        let dir = self.dir().to_path_buf();
        let mut refreshed = false;
        let mut needs = vec![];

        for entry in deps.entries.iter_mut() {
            match entry {
                Dependency::Builder { path, mtime } => {
                    if path.as_path() != current_builder {
                        debug!("{}: script changed", self.target.display());
                        return Ok(Dirtiness::Dirty);
                    }
                    let now = util::mtime(&util::normalize(&dir.join(path.as_path())))?;
                    if now.is_none() || now != *mtime {
                        debug!("{}: script modified", self.target.display());
                        return Ok(Dirtiness::Dirty);
                    }
                }
                Dependency::File { path, mtime, checksum } => {
                    let abs = util::normalize(&dir.join(path.as_path()));
                    let dep_record = TargetState::new(&abs).deps()?;

                    if let Some(record) = &dep_record {
                        let stale_run = run_id.is_some() && record.run_id != run_id;
                        if stale_run && gupfile::find_builder(&abs).map_err(Error::Resolve)?.is_some() {
                            // A built target not yet current this run;
                            // defer judgement until it is
                            needs.push(abs);
                            continue;
                        }
                    }

                    let now = util::mtime(&abs)?;
                    if now == *mtime {
                        continue;
                    }
                    let advertised = dep_record.as_ref().and_then(|d| d.checksum());
                    match (checksum.as_deref(), advertised) {
                        (Some(recorded), Some(current)) if recorded == current => {
                            // Content unchanged upstream; remember the
                            // new mtime so the comparison stays cheap
                            *mtime = now;
                            refreshed = true;
                        }
                        _ => {
                            debug!("{}: {} changed", self.target.display(), abs.display());
                            return Ok(Dirtiness::Dirty);
                        }
                    }
                }
                Dependency::Always => {
                    debug!("{}: always rebuilt", self.target.display());
                    return Ok(Dirtiness::Dirty);
                }
                Dependency::NeverCreated { path } => {
                    if util::normalize(&dir.join(path.as_path())).exists() {
                        debug!("{}: {} was created", self.target.display(), path.display());
                        return Ok(Dirtiness::Dirty);
                    }
                }
                Dependency::Checksum(_) => {}
            }
        }

        if !needs.is_empty() {
            return Ok(Dirtiness::NeedsDeps(needs));
        }

        if refreshed {
            self.rewrite(&deps)?;
        }

        Ok(Dirtiness::Clean)
    }

    fn rewrite(&self, deps: &Deps) -> Result<(), Error> {
        let path = self.state_file(".deps.refresh");
        let mut file = File::create(&path)?;
        writeln!(file, "{FORMAT_TAG}")?;
        if let Some(id) = &deps.run_id {
            writeln!(file, "{RUN_PREFIX}{id}")?;
        }
        for entry in &deps.entries {
            writeln!(file, "{}", entry.serialize())?;
        }
        writeln!(file, "{TERMINATOR}")?;
        file.sync_all()?;
        drop(file);
        fs::rename(path, self.deps_path())?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("locking record")]
    Flock(#[source] nix::Error),
    #[error("malformed entry: {0}")]
    Malformed(String),
    #[error("resolving dependency script")]
    Resolve(#[source] gupfile::Error),
}
