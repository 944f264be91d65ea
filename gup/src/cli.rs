// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf, sync::Arc};

use clap::{Args, Parser};
use log::{error, warn, LevelFilter};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    builder, env,
    jobserver::{self, Jobserver},
    signal::{self, Signal},
    state::{self, Dependency, TargetState},
    task, util,
};

#[derive(Debug, Parser)]
#[command(name = "gup", about = "A recursive, user-extensible build tool", version)]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    /// Targets to build
    pub targets: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(short, long, help = "Rebuild targets only when they are stale")]
    pub update: bool,
    #[arg(
        long,
        help = "Declare a dependency on the non-existence of the named paths"
    )]
    pub ifcreate: bool,
    #[arg(long, help = "Mark the current target as always stale")]
    pub always: bool,
    #[arg(
        long,
        help = "Read stdin and record its digest as the current target's checksum"
    )]
    pub contents: bool,
    #[arg(
        short,
        long,
        default_value_t = 1,
        help = "Maximum number of concurrent build scripts"
    )]
    pub jobs: usize,
    #[arg(short, long, action = clap::ArgAction::Count, help = "Print more")]
    pub verbose: u8,
    #[arg(short, long, action = clap::ArgAction::Count, help = "Print less")]
    pub quiet: u8,
}

/// Process all CLI arguments, returning the exit code
pub fn run() -> i32 {
    match process() {
        Ok(()) => 0,
        Err(err) => {
            // Task failures were already reported at the point the
            // child's output ended
            if !matches!(err, Error::Task(_)) {
                log_chain(&err);
            }
            if env::is_root() {
                if err.is_user() {
                    2
                } else {
                    1
                }
            } else {
                // Tell the parent gup we already did the logging
                builder::SAFE_EXIT_CODE
            }
        }
    }
}

fn process() -> Result<(), Error> {
    let Command { global, targets } = Command::parse();
    init_logging(&global);

    if global.always {
        return always();
    }
    if global.contents {
        return contents();
    }
    if global.ifcreate {
        return ifcreate(&targets);
    }

    if targets.is_empty() {
        warn!("nothing to build");
        return Ok(());
    }

    env::ensure_run_id();
    let _signals = signal::record([Signal::SIGINT, Signal::SIGTERM])?;
    let jobserver = Arc::new(Jobserver::from_env(global.jobs)?);

    task::Runner::new(Arc::clone(&jobserver)).run(
        &targets,
        task::Options {
            update: global.update,
        },
    )?;

    if let Some(signal) = signal::received() {
        return Err(Error::Interrupted(signal));
    }
    Ok(())
}

/// `gup --always`: the invoking build script wants its target
/// rebuilt on every run
fn always() -> Result<(), Error> {
    let Some(parent) = env::parent_target() else {
        warn!("--always was used outside of a gup target");
        return Ok(());
    };
    TargetState::new(parent).add_dependency(&Dependency::Always)?;
    Ok(())
}

/// `gup --contents`: digest stdin and advertise it as the current
/// target's checksum
fn contents() -> Result<(), Error> {
    let mut hasher = Sha256::new();
    io::copy(&mut io::stdin().lock(), &mut hasher)?;
    let digest = hex::encode(hasher.finalize());

    let Some(parent) = env::parent_target() else {
        warn!("--contents was used outside of a gup target");
        return Ok(());
    };
    TargetState::new(parent).add_dependency(&Dependency::Checksum(digest))?;
    Ok(())
}

/// `gup --ifcreate`: rebuild the current target if any of the named
/// paths ever comes into existence
fn ifcreate(targets: &[PathBuf]) -> Result<(), Error> {
    let Some(parent) = env::parent_target() else {
        warn!("--ifcreate was used outside of a gup target");
        return Ok(());
    };
    let parent_dir = parent.parent().unwrap_or(std::path::Path::new("/"));

    for path in targets {
        let target = util::absolutize(path)?;
        if target.exists() {
            return Err(Error::IfcreateExists(target));
        }
        TargetState::new(&parent).add_dependency(&Dependency::NeverCreated {
            path: util::relative_to(&target, parent_dir),
        })?;
    }
    Ok(())
}

fn init_logging(global: &Global) {
    let level = if global.quiet > 0 {
        LevelFilter::Error
    } else {
        match global.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    match env::color_override() {
        Some(true) => {
            builder.write_style(env_logger::WriteStyle::Always);
        }
        Some(false) => {
            builder.write_style(env_logger::WriteStyle::Never);
        }
        None => {}
    }
    // The `#` prefix keeps our diagnostics separable from build
    // script output
    builder.format(|buf, record| {
        use std::io::Write as _;
        if record.level() >= log::Level::Debug {
            writeln!(buf, "# gup[{}]: {}", record.target(), record.args())
        } else {
            writeln!(buf, "# gup: {}", record.args())
        }
    });
    builder.init();
}

fn log_chain(err: &dyn std::error::Error) {
    use std::fmt::Write as _;
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    error!("{message}");
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Task(#[from] task::Error),
    #[error("jobserver")]
    Jobserver(#[from] jobserver::Error),
    #[error("signal handling")]
    Signal(#[from] signal::Error),
    #[error("target state")]
    State(#[from] state::Error),
    #[error("interrupted by {0}")]
    Interrupted(Signal),
    #[error("{}: already exists", .0.display())]
    IfcreateExists(PathBuf),
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    fn is_user(&self) -> bool {
        match self {
            Self::Task(e) => e.is_user(),
            Self::Interrupted(_) | Self::IfcreateExists(_) => true,
            _ => false,
        }
    }
}
