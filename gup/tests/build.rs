// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios against the compiled binary, each in its own
//! scratch tree. Build scripts deliberately carry no executable bit
//! and use bare hashbangs; resolving those is part of the contract.

use std::{
    fs,
    path::PathBuf,
    process::{Command, Output},
    thread,
    time::Duration,
};

const SH: &str = "#!/bin/sh\nset -eu\n";

/// Give filesystem mtimes room to move between builds
fn tick() {
    thread::sleep(Duration::from_millis(25));
}

struct Tree {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Tree {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Self { _dir: dir, root }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap().trim().to_owned()
    }

    fn runs(&self, log: &str) -> usize {
        fs::read_to_string(self.path(log))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn gup(&self, args: &[&str]) -> Output {
        let exe = PathBuf::from(env!("CARGO_BIN_EXE_gup"));
        let bin_dir = exe.parent().unwrap().to_path_buf();
        let path_var = std::env::var("PATH").unwrap_or_default();

        let mut cmd = Command::new(&exe);
        // A deterministic first build: no inherited gup state
        for (key, _) in std::env::vars() {
            if key.starts_with("GUP_") {
                cmd.env_remove(key);
            }
        }
        cmd.args(args)
            .current_dir(&self.root)
            .env_remove("MAKEFLAGS")
            .env("PATH", format!("{}:{path_var}", bin_dir.display()))
            .env("GUP_IN_TESTS", "1")
            .output()
            .unwrap()
    }

    fn build(&self, args: &[&str]) {
        let out = self.gup(args);
        assert!(
            out.status.success(),
            "gup {args:?} failed:\n{}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn build_fails(&self, args: &[&str]) -> Output {
        let out = self.gup(args);
        assert!(!out.status.success(), "gup {args:?} unexpectedly succeeded");
        out
    }
}

fn echo_script(value: &str) -> String {
    format!("{SH}printf '%s' \"{value}\" > \"$1\"\n")
}

#[test]
fn builds_targets_matching_pattern() {
    let tree = Tree::new();
    tree.write("default.gup", &echo_script("$2"));
    tree.write("Gupfile", "default.gup:\n\toutput.txt\n\tfoo.txt\n");

    tree.build(&["output.txt"]);
    tree.build(&["foo.txt"]);
    assert_eq!(tree.read("output.txt"), "output.txt");
    assert_eq!(tree.read("foo.txt"), "foo.txt");

    let out = tree.build_fails(&["bar.txt"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(
        String::from_utf8_lossy(&out.stderr).contains("Don't know how to build"),
        "unexpected stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn exclusions_protect_sources() {
    let tree = Tree::new();
    tree.write("default.gup", &echo_script("generated"));
    tree.write("Gupfile", "default.gup:\n\t*.txt\n\t!source.txt\n");
    tree.write("source.txt", "Don't overwrite me!");

    tree.build(&["output.txt"]);
    assert_eq!(tree.read("output.txt"), "generated");

    tree.build_fails(&["source.txt"]);
    assert_eq!(tree.read("source.txt"), "Don't overwrite me!");
}

#[test]
fn nearer_gup_directory_wins() {
    let tree = Tree::new();
    tree.write("a/gup/b/c.gup", &echo_script("c"));
    // Shadowed by the nearer tree above
    tree.write("gup/a/b/c.gup", &echo_script("wrong c"));
    tree.write("gup/a/b/d.gup", &echo_script("d"));

    tree.build(&["a/b/c"]);
    tree.build(&["a/b/d"]);
    assert_eq!(tree.read("a/b/c"), "c");
    assert_eq!(tree.read("a/b/d"), "d");
}

#[test]
fn update_builds_at_most_once() {
    let tree = Tree::new();
    tree.write("out.gup", &format!("{SH}echo run >> out.log\nprintf done > \"$1\"\n"));

    tree.build(&["-u", "out"]);
    tree.build(&["-u", "out"]);

    assert_eq!(tree.read("out"), "done");
    assert_eq!(tree.runs("out.log"), 1);
}

#[test]
fn unconditional_build_always_reruns() {
    let tree = Tree::new();
    tree.write("out.gup", &format!("{SH}echo run >> out.log\nprintf done > \"$1\"\n"));

    tree.build(&["out"]);
    tree.build(&["out"]);

    assert_eq!(tree.runs("out.log"), 2);
}

#[test]
fn changed_script_invalidates_target() {
    let tree = Tree::new();
    tree.write("out.gup", &format!("{SH}echo run >> out.log\nprintf one > \"$1\"\n"));

    tree.build(&["-u", "out"]);
    assert_eq!(tree.read("out"), "one");

    tick();
    tree.write("out.gup", &format!("{SH}echo run >> out.log\nprintf two > \"$1\"\n"));
    tree.build(&["-u", "out"]);

    assert_eq!(tree.read("out"), "two");
    assert_eq!(tree.runs("out.log"), 2);
}

#[test]
fn touched_source_triggers_rebuild() {
    let tree = Tree::new();
    tree.write(
        "copy.gup",
        &format!("{SH}gup -u src.txt\necho run >> copy.log\ncat src.txt > \"$1\"\n"),
    );
    tree.write("src.txt", "v1");

    tree.build(&["-u", "copy"]);
    assert_eq!(tree.read("copy"), "v1");
    assert_eq!(tree.runs("copy.log"), 1);

    tick();
    tree.write("src.txt", "v2");
    tree.build(&["-u", "copy"]);
    assert_eq!(tree.read("copy"), "v2");
    assert_eq!(tree.runs("copy.log"), 2);

    tick();
    tree.build(&["-u", "copy"]);
    assert_eq!(tree.runs("copy.log"), 2);
}

#[test]
fn unchanged_checksum_skips_downstream() {
    let tree = Tree::new();
    tree.write(
        "upstream.gup",
        &format!(
            "{SH}gup -u src.txt\necho run >> upstream.log\nprintf fixed > \"$1\"\nprintf fixed | gup --contents\n"
        ),
    );
    tree.write(
        "down.gup",
        &format!("{SH}gup -u upstream\necho run >> down.log\ncat upstream > \"$1\"\n"),
    );
    tree.write("src.txt", "v1");

    tree.build(&["-u", "down"]);
    assert_eq!(tree.read("down"), "fixed");
    assert_eq!(tree.runs("upstream.log"), 1);
    assert_eq!(tree.runs("down.log"), 1);

    // An mtime-only relevant change: upstream reruns but produces
    // identical content, so downstream must not
    tick();
    tree.write("src.txt", "v2");
    tree.build(&["-u", "down"]);
    assert_eq!(tree.runs("upstream.log"), 2);
    assert_eq!(tree.runs("down.log"), 1);
}

#[test]
fn ifcreate_fires_when_path_appears() {
    let tree = Tree::new();
    tree.write(
        "out.gup",
        &format!(
            "{SH}if [ -f config ]; then gup -u config; else gup --ifcreate config; fi\necho run >> out.log\nprintf done > \"$1\"\n"
        ),
    );

    tree.build(&["-u", "out"]);
    tree.build(&["-u", "out"]);
    assert_eq!(tree.runs("out.log"), 1);

    tick();
    tree.write("config", "");
    tree.build(&["-u", "out"]);
    assert_eq!(tree.runs("out.log"), 2);
}

#[test]
fn parallel_steps_build_shared_counter_once() {
    let tree = Tree::new();
    tree.write(
        "build-step.gup",
        &format!("{SH}gup -u counter\nprintf ok > \"$1\"\n"),
    );
    tree.write("Gupfile", "build-step.gup:\n\tstep*\n");
    tree.write("counter", "1\n");
    tree.write(
        "counter.gup",
        &format!(
            "{SH}if [ -f counter.pid ]; then\n  echo 'counter job already running' >&2\n  exit 1\nfi\necho $$ > counter.pid\nsleep 1\nexpr \"$(cat \"$2\")\" + 1 > \"$1\"\ngup --always\nrm counter.pid\n"
        ),
    );

    tree.build(&["-j4", "-u", "step1", "step2", "step3", "step4"]);

    assert_eq!(tree.read("counter"), "2");
    for step in ["step1", "step2", "step3", "step4"] {
        assert_eq!(tree.read(step), "ok");
    }
}

#[test]
fn failure_does_not_cancel_peers() {
    let tree = Tree::new();
    tree.write("long.gup", &format!("{SH}sleep 1\n"));
    tree.write("fail.gup", &format!("{SH}exit 1\n"));
    tree.write("step1.gup", &echo_script("ok"));

    let out = tree.build_fails(&["-j3", "long", "fail", "step1"]);
    assert_eq!(out.status.code(), Some(2));
    assert_eq!(tree.read("step1"), "ok");
}

#[test]
fn serial_build_advertises_sentinel() {
    let tree = Tree::new();
    tree.write("step.gup", &format!("{SH}env > \"$2.env\"\nprintf ok > \"$1\"\n"));

    tree.build(&["step"]);

    let env = tree.read("step.env");
    assert!(env.lines().any(|l| l == "GUP_JOBSERVER=0"), "env:\n{env}");
    assert!(!env.lines().any(|l| l.starts_with("MAKEFLAGS=")), "env:\n{env}");
    assert!(
        env.lines().any(|l| l.starts_with("GUP_TARGET=") && l.ends_with("/step")),
        "env:\n{env}"
    );
}

#[test]
fn parallel_build_advertises_fifo() {
    let tree = Tree::new();
    tree.write("step.gup", &format!("{SH}env > \"$2.env\"\nprintf ok > \"$1\"\n"));

    tree.build(&["-j3", "step"]);

    let env = tree.read("step.env");
    let jobserver = env
        .lines()
        .find_map(|l| l.strip_prefix("GUP_JOBSERVER="))
        .expect("GUP_JOBSERVER advertised");
    assert_ne!(jobserver, "0");
    assert!(!env.lines().any(|l| l.starts_with("MAKEFLAGS=")), "env:\n{env}");
}

#[test]
fn nested_invocation_records_and_propagates_failure() {
    let tree = Tree::new();
    tree.write("broken.gup", &format!("{SH}exit 3\n"));
    tree.write("top.gup", &format!("{SH}gup -u broken\nprintf ok > \"$1\"\n"));

    let out = tree.build_fails(&["-u", "top"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(!tree.path("top").exists());
}
