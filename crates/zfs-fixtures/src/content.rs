//! Payload replication into mounted filesystems.

use std::fs;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::schema::ContentMap;
use crate::{Error, Result};

/// Replace everything directly under `destination` with the payloads of `sources`.
///
/// Each payload identifier is resolved against `content_root` and copied to
/// `destination/<path>`; directories are copied recursively and symlinks are
/// recreated rather than followed. Payloads are only ever read. Running the
/// same replacement twice leaves the destination identical.
pub fn replace(sources: &ContentMap, destination: &Path, content_root: &Path) -> Result<()> {
    let entries = fs::read_dir(destination).map_err(|e| {
        Error::content(destination, format!("couldn't read directory content: {}", e))
    })?;
    for entry in entries {
        let path = entry.map_err(|e| Error::content(destination, e))?.path();
        remove_entry(&path).map_err(|e| Error::content(&path, format!("couldn't clean up: {}", e)))?;
    }

    for (relative, payload) in sources {
        let source = content_root.join(payload);
        let target = destination.join(relative);
        debug!("Copying payload {} to {}", source.display(), target.display());
        copy_tree(&source, &target).map_err(|e| {
            Error::content(&target, format!("couldn't copy {:?}: {}", payload, e))
        })?;
    }
    Ok(())
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file, symlink or directory tree, merging into an existing target directory.
fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let destination = if relative.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination)?;
            fs::set_permissions(&destination, entry.metadata().map_err(std::io::Error::other)?.permissions())?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&destination).is_ok() {
                fs::remove_file(&destination)?;
            }
            std::os::unix::fs::symlink(link, &destination)?;
        } else {
            fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
