//! Intercept installation: one link per command, named after the command and
//! pointing at the shim, in a directory the caller puts first on `PATH`.

use crate::{Result, ShimError};
use fs_err as fs;
use std::path::{Path, PathBuf};

/// Creates `dir/<command>` for each command, replacing whatever was there.
pub fn install(dir: &Path, commands: &[String], shim: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|source| ShimError::Install {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut installed = Vec::new();
    for command in commands {
        let target = dir.join(command);
        if target.symlink_metadata().is_ok() {
            fs::remove_file(&target).map_err(|source| ShimError::Install {
                path: target.clone(),
                source,
            })?;
        }
        link(shim, &target).map_err(|source| ShimError::Install {
            path: target.clone(),
            source,
        })?;
        tracing::info!(command = %command, path = %target.display(), "Installed intercept");
        installed.push(target);
    }
    Ok(installed)
}

#[cfg(unix)]
fn link(shim: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(shim, target)
}

// Symlinks need extra privileges on Windows; a copy behaves the same.
#[cfg(not(unix))]
fn link(shim: &Path, target: &Path) -> std::io::Result<()> {
    let target = target.with_extension("exe");
    fs::copy(shim, target).map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn links_point_at_the_shim_and_replace_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let shim = dir.path().join("capturemock-shim");
        std::fs::write(&shim, "").unwrap();
        let bin = dir.path().join("intercepts");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("ls"), "stale").unwrap();

        let installed =
            install(&bin, &["ls".to_string(), "date".to_string()], &shim).unwrap();

        assert_eq!(installed, vec![bin.join("ls"), bin.join("date")]);
        for path in installed {
            assert_eq!(std::fs::read_link(&path).unwrap(), shim);
        }
    }
}
