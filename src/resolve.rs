//! Bind-mount host path resolution.
//!
//! A bind mount's host path must be canonical before it is materialized
//! into a build context: every existing prefix component is resolved
//! through symbolic links, and a missing leaf is created so that the
//! deployment sees the same (empty) directory a container engine would
//! create on the host.

use crate::constants::BIND_DIR_MODE;
use crate::error::{Error, Result};
use crate::vfs::{path, VirtualFileSystem};
use tracing::debug;

/// Resolves a bind-mount host path to a canonical absolute path.
///
/// Walks the path's components left to right, evaluating symbolic links
/// after each step. When a component does not exist, the remaining
/// components are treated as a literal tail: the missing directories are
/// created and the reconstructed path is returned. The returned path
/// therefore has every existing prefix component symlink-resolved without
/// requiring the leaf to pre-exist.
pub fn resolve_bind_volume_host_path(
    fs: &dyn VirtualFileSystem,
    name: &str,
) -> Result<String> {
    let abs = fs.abs(name)?;
    let vol = path::volume_name(&abs);
    let cleaned = path::clean(&abs[vol.len()..]);
    let parts: Vec<&str> = cleaned.split('/').collect();
    let mut result = vol.to_string();
    for i in 1..parts.len() {
        result = format!("{result}/{}", parts[i]);
        match fs.eval_symlinks(&result) {
            Ok(resolved) => result = resolved,
            Err(Error::NotFound(_)) => {
                if i + 1 < parts.len() {
                    result = format!("{result}/{}", parts[i + 1..].join("/"));
                }
                fs.mkdir_all(&result, BIND_DIR_MODE)?;
                debug!(path = %result, "created missing bind-mount directories");
                return Ok(result);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{FileSpec, InMemoryFileSystem};

    #[test]
    fn test_creates_missing_leaf_directories() {
        let fs = InMemoryFileSystem::new();
        let resolved = resolve_bind_volume_host_path(&fs, "/dir1/dir1_1").unwrap();
        assert_eq!(resolved, "/dir1/dir1_1");
        assert!(fs.stat("/dir1/dir1_1").unwrap().is_dir());
    }

    #[test]
    fn test_resolves_existing_symlink_prefix() {
        let fs = InMemoryFileSystem::new();
        fs.set("/real/sub", FileSpec::dir());
        fs.set("/alias", FileSpec::symlink("/real"));
        let resolved = resolve_bind_volume_host_path(&fs, "/alias/sub/leaf").unwrap();
        assert_eq!(resolved, "/real/sub/leaf");
        assert!(fs.stat("/real/sub/leaf").unwrap().is_dir());
    }

    #[test]
    fn test_abs_error_propagates() {
        let mut fs = InMemoryFileSystem::new();
        fs.abs_error = Some("no working directory".to_string());
        assert!(matches!(
            resolve_bind_volume_host_path(&fs, ""),
            Err(Error::Injected(_))
        ));
    }

    #[test]
    fn test_other_eval_errors_propagate() {
        let fs = InMemoryFileSystem::new();
        fs.set("/loop", FileSpec::symlink("loop2"));
        fs.set("/loop2", FileSpec::symlink("loop"));
        assert!(matches!(
            resolve_bind_volume_host_path(&fs, "/loop/x"),
            Err(Error::TooManyLinks(_))
        ));
    }
}
