// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

use fs_err as fs;

/// Modification time in milliseconds since the Unix epoch
pub type Mtime = i64;

/// Observe the mtime of `path`, `None` when it doesn't exist
pub fn mtime(path: &Path) -> io::Result<Option<Mtime>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            let modified = meta.modified()?;
            let ms = match modified.duration_since(UNIX_EPOCH) {
                Ok(since) => since.as_millis() as Mtime,
                // Pre-epoch mtimes happen on badly synced filesystems
                Err(e) => -(e.duration().as_millis() as Mtime),
            };
            Ok(Some(ms))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Resolve `path` against the working directory and collapse `.` and
/// `..` lexically. Symlinks are left alone so targets keep the names
/// the user gave them.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&joined))
}

pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Express `path` relative to `base`. Both must be absolute and
/// normalized.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let mut path_components = path.components().peekable();
    let mut base_components = base.components().peekable();

    while let (Some(a), Some(b)) = (path_components.peek(), base_components.peek()) {
        if a != b {
            break;
        }
        path_components.next();
        base_components.next();
    }

    let mut rel = PathBuf::new();
    for _ in base_components {
        rel.push("..");
    }
    rel.extend(path_components);

    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}
