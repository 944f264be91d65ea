// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `Gupfile` parsing and build-script discovery.
//!
//! A `Gupfile` routes targets to shared scripts:
//!
//! ```text
//! default.gup:
//!     *.txt
//!     !source.txt
//! ```
//!
//! Discovery walks from the target's directory towards the root,
//! preferring direct `<name>.gup` scripts (including `gup/` shadow
//! trees) over `Gupfile` pattern matches, and nearer ancestors over
//! farther ones.

use std::{
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use fs_err as fs;
use log::warn;
use thiserror::Error;

use crate::util;

pub const GUPFILE: &str = "Gupfile";

/// Name of the shadow directory searched at every ancestor
pub const SCRIPT_DIR: &str = "gup";

/// Extension marking a build script
pub const SCRIPT_EXT: &str = ".gup";

struct Matcher {
    negate: bool,
    pattern: fnmatch::Pattern,
}

/// One script plus the patterns routing targets to it
pub struct Rule {
    pub script: String,
    patterns: Vec<Matcher>,
}

impl Rule {
    /// True iff some include pattern matches and no exclusion does
    pub fn matches(&self, path: &str) -> bool {
        let mut hit = false;
        for matcher in &self.patterns {
            if matcher.negate {
                if matcher.pattern.matches(path) {
                    return false;
                }
            } else if !hit && matcher.pattern.matches(path) {
                hit = true;
            }
        }
        hit
    }
}

/// A parsed `Gupfile`: rules in declaration order
pub struct Gupfile {
    pub rules: Vec<Rule>,
}

impl FromStr for Gupfile {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules: Vec<Rule> = vec![];

        for (index, raw) in s.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let indented = raw.starts_with(|c: char| c.is_whitespace());
            if indented {
                let rule = rules.last_mut().ok_or(ParseError::OrphanPattern { line })?;
                let (negate, glob) = match trimmed.strip_prefix('!') {
                    Some(rest) => (true, rest.trim()),
                    None => (false, trimmed),
                };
                rule.patterns.push(Matcher {
                    negate,
                    pattern: glob.parse()?,
                });
            } else {
                let script = trimmed
                    .strip_suffix(':')
                    .ok_or(ParseError::MissingColon { line })?;
                rules.push(Rule {
                    script: script.trim().to_owned(),
                    patterns: vec![],
                });
            }
        }

        Ok(Self { rules })
    }
}

/// A resolved build script for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildScript {
    /// Absolute path of the script
    pub script: PathBuf,
    /// Directory the script runs in; `$2` is expressed against it
    pub basedir: PathBuf,
    /// Target path relative to `basedir`
    pub rel: PathBuf,
}

fn is_file(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Locate the build script responsible for `target` (an absolute,
/// normalized path), or `None` when the target is unbuildable
pub fn find_builder(target: &Path) -> Result<Option<BuildScript>, Error> {
    let Some(dir) = target.parent() else {
        return Ok(None);
    };
    let Some(name) = target.file_name() else {
        return Ok(None);
    };

    // Direct script next to the target
    let mut script_name = name.to_os_string();
    script_name.push(SCRIPT_EXT);
    let direct = dir.join(&script_name);
    if is_file(&direct)? {
        return Ok(Some(BuildScript {
            script: direct,
            basedir: dir.to_path_buf(),
            rel: name.into(),
        }));
    }

    // Shadow trees: `A/gup/<relpath>.gup` for every ancestor A
    for ancestor in dir.ancestors() {
        let rel = util::relative_to(target, ancestor);
        let mut shadow_name = rel.clone().into_os_string();
        shadow_name.push(SCRIPT_EXT);
        let candidate = ancestor.join(SCRIPT_DIR).join(&shadow_name);
        if is_file(&candidate)? {
            return Ok(Some(BuildScript {
                script: candidate,
                basedir: ancestor.to_path_buf(),
                rel,
            }));
        }
    }

    // Gupfile patterns, nearest ancestor first
    for ancestor in dir.ancestors() {
        let rel = util::relative_to(target, ancestor);
        let rel_str = rel.to_string_lossy();

        for gupfile_dir in [ancestor.to_path_buf(), ancestor.join(SCRIPT_DIR)] {
            let gupfile = gupfile_dir.join(GUPFILE);
            if !is_file(&gupfile)? {
                continue;
            }

            let parsed: Gupfile = fs::read_to_string(&gupfile)?
                .parse()
                .map_err(|source| Error::Gupfile {
                    path: gupfile.clone(),
                    source,
                })?;

            for rule in &parsed.rules {
                if !rule.matches(&rel_str) {
                    continue;
                }
                let script = util::normalize(&gupfile_dir.join(&rule.script));
                // A script never builds itself
                if script == target {
                    continue;
                }
                if !is_file(&script)? {
                    warn!("{}: no such script {}", gupfile.display(), rule.script);
                    continue;
                }
                return Ok(Some(BuildScript {
                    script,
                    basedir: ancestor.to_path_buf(),
                    rel,
                }));
            }
        }
    }

    Ok(None)
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: pattern outside a script block")]
    OrphanPattern { line: usize },
    #[error("line {line}: expected `script:`")]
    MissingColon { line: usize },
    #[error(transparent)]
    Pattern(#[from] fnmatch::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("{}: {source}", .path.display())]
    Gupfile { path: PathBuf, source: ParseError },
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn parse_blocks_in_order() {
        let gupfile: Gupfile = "first.gup:\n\ta*\nsecond.gup:\n\t*\n".parse().unwrap();

        assert_eq!(gupfile.rules.len(), 2);
        assert!(gupfile.rules[0].matches("abc"));
        assert!(!gupfile.rules[0].matches("xyz"));
        assert!(gupfile.rules[1].matches("xyz"));
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let gupfile: Gupfile = "# routing\n\ndefault.gup:\n\t# not me\n\t*.txt\n".parse().unwrap();

        assert_eq!(gupfile.rules.len(), 1);
        assert!(gupfile.rules[0].matches("a.txt"));
    }

    #[test]
    fn exclusions_veto_includes() {
        let gupfile: Gupfile = "default.gup:\n\t*.txt\n\t!source.txt\n".parse().unwrap();

        assert!(gupfile.rules[0].matches("output.txt"));
        assert!(!gupfile.rules[0].matches("source.txt"));
    }

    #[test]
    fn orphan_pattern_is_an_error() {
        assert!(matches!(
            "\t*.txt\n".parse::<Gupfile>(),
            Err(ParseError::OrphanPattern { line: 1 })
        ));
    }

    #[test]
    fn direct_script_beats_gupfile() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "out.txt.gup", "#!/bin/sh\n");
        write(root, "default.gup", "#!/bin/sh\n");
        write(root, "Gupfile", "default.gup:\n\t*.txt\n");

        let found = find_builder(&root.join("out.txt")).unwrap().unwrap();
        assert_eq!(found.script, root.join("out.txt.gup"));
        assert_eq!(found.basedir, root);
        assert_eq!(found.rel, PathBuf::from("out.txt"));
    }

    #[test]
    fn nearer_shadow_tree_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "a/gup/b/c.gup", "#!/bin/sh\n");
        write(root, "gup/a/b/c.gup", "#!/bin/sh\n");

        let found = find_builder(&root.join("a/b/c")).unwrap().unwrap();
        assert_eq!(found.script, root.join("a/gup/b/c.gup"));
        assert_eq!(found.basedir, root.join("a"));
        assert_eq!(found.rel, PathBuf::from("b/c"));
    }

    #[test]
    fn gupfile_patterns_match_relative_to_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "a/default.gup", "#!/bin/sh\n");
        write(root, "a/Gupfile", "default.gup:\n\tb/*/d\n");

        let found = find_builder(&root.join("a/b/c/d")).unwrap().unwrap();
        assert_eq!(found.script, root.join("a/default.gup"));
        assert_eq!(found.basedir, root.join("a"));
        assert_eq!(found.rel, PathBuf::from("b/c/d"));

        assert_eq!(find_builder(&root.join("a/b/cd")).unwrap(), None);
    }

    #[test]
    fn earlier_rule_wins() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "first.gup", "#!/bin/sh\n");
        write(root, "second.gup", "#!/bin/sh\n");
        write(root, "Gupfile", "first.gup:\n\tout\nsecond.gup:\n\tout\n");

        let found = find_builder(&root.join("out")).unwrap().unwrap();
        assert_eq!(found.script, root.join("first.gup"));
    }

    #[test]
    fn unbuildable_without_rules() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_builder(&dir.path().join("lonely")).unwrap(), None);
    }

    #[test]
    fn rule_never_builds_its_own_script() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "default.gup", "#!/bin/sh\n");
        write(root, "Gupfile", "default.gup:\n\t*\n");

        assert_eq!(find_builder(&root.join("default.gup")).unwrap(), None);
    }
}
