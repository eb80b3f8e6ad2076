//! Host-backed virtual file system.
//!
//! Thin adapter from the [`VirtualFileSystem`] trait onto `std::fs`. Paths
//! are treated as UTF-8, posix-style strings; this backend is supported on
//! unix-family targets only.

use super::path;
use super::{FileInfo, FileKind, VirtualFileSystem};
use crate::constants::MODE_PERM_MASK;
use crate::error::{Error, Result};
use std::fs;
use std::io::Read;

/// [`VirtualFileSystem`] implementation over the process's real file
/// system.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFileSystem;

impl HostFileSystem {
    /// Creates a host file system handle.
    pub fn new() -> Self {
        Self
    }
}

fn map_io(p: &str, err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(p.to_string()),
        _ => Error::Io(err),
    }
}

fn info_from_metadata(meta: &fs::Metadata) -> FileInfo {
    let file_type = meta.file_type();
    let kind = if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & MODE_PERM_MASK
    };
    #[cfg(not(unix))]
    let mode = 0o755;
    FileInfo {
        kind,
        size: if kind == FileKind::File { meta.len() } else { 0 },
        mode,
    }
}

impl VirtualFileSystem for HostFileSystem {
    fn abs(&self, p: &str) -> Result<String> {
        if p.starts_with('/') {
            return Ok(path::clean(p));
        }
        let cwd = std::env::current_dir()?;
        Ok(path::join(&cwd.to_string_lossy(), p))
    }

    fn stat(&self, p: &str) -> Result<FileInfo> {
        let meta = fs::metadata(p).map_err(|e| map_io(p, e))?;
        Ok(info_from_metadata(&meta))
    }

    fn lstat(&self, p: &str) -> Result<FileInfo> {
        let meta = fs::symlink_metadata(p).map_err(|e| map_io(p, e))?;
        Ok(info_from_metadata(&meta))
    }

    fn open(&self, p: &str) -> Result<Box<dyn Read>> {
        let file = fs::File::open(p).map_err(|e| map_io(p, e))?;
        Ok(Box::new(file))
    }

    fn read_link(&self, p: &str) -> Result<String> {
        let target = fs::read_link(p).map_err(|e| map_io(p, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn read_dir(&self, p: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(p).map_err(|e| map_io(p, e))? {
            let entry = entry.map_err(|e| map_io(p, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        // The OS returns entries in arbitrary order; sort for a stable
        // tar layout.
        names.sort();
        Ok(names)
    }

    fn eval_symlinks(&self, p: &str) -> Result<String> {
        let resolved = fs::canonicalize(p).map_err(|e| map_io(p, e))?;
        Ok(resolved.to_string_lossy().into_owned())
    }

    fn mkdir(&self, p: &str, mode: u32) -> Result<()> {
        if mode & !MODE_PERM_MASK != 0 {
            return Err(Error::InvalidMode(mode));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .mode(mode)
                .create(p)
                .map_err(|e| map_io(p, e))
        }
        #[cfg(not(unix))]
        {
            fs::create_dir(p).map_err(|e| map_io(p, e))
        }
    }

    fn mkdir_all(&self, p: &str, mode: u32) -> Result<()> {
        if mode & !MODE_PERM_MASK != 0 {
            return Err(Error::InvalidMode(mode));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(mode)
                .create(p)
                .map_err(|e| map_io(p, e))
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(p).map_err(|e| map_io(p, e))
        }
    }
}
