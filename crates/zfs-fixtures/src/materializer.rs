//! Backing files for synthetic disks.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::schema::Device;
use crate::storage::VirtualDevice;
use crate::{Error, Result};

/// Size of the blocks the scrambler rewrites.
const SCRAMBLE_CHUNK: u64 = 1024 * 1024;
/// Number of blocks rewritten; the first one (pool labels L0/L1) is left alone.
const SCRAMBLE_CHUNKS: u64 = 100;

/// Files and directories created for one fixture device.
#[derive(Debug, Clone)]
pub struct MaterializedDevice {
    /// One backing file per device name, in document order.
    pub backing_files: Vec<PathBuf>,
    /// Directory the device is mounted under (pool altroot or ext4 mount point).
    pub mount_dir: PathBuf,
    /// Virtual device built from the backing files.
    pub vdev: VirtualDevice,
}

/// Path of the backing file for a device name.
pub fn backing_file_path(work_dir: &Path, name: &str) -> PathBuf {
    work_dir.join(format!("{}.disk", name))
}

/// Create the backing files and the mount directory of a device.
///
/// Files are created exclusively, so a name used twice in the same work
/// directory fails here instead of two pools sharing a leaf.
pub fn materialize(device: &Device, work_dir: &Path, size: u64) -> Result<MaterializedDevice> {
    let mut backing_files = Vec::with_capacity(device.names.len());
    for name in &device.names {
        let path = backing_file_path(work_dir, name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::device(&path, format!("couldn't create device file on disk: {}", e)))?;
        file.set_len(size)
            .map_err(|e| Error::device(&path, format!("couldn't initialize device size on disk: {}", e)))?;
        debug!("Created backing file {} ({} bytes)", path.display(), size);
        backing_files.push(path);
    }

    let first = device
        .names
        .first()
        .ok_or_else(|| Error::malformed("device without a name"))?;
    let mount_dir = work_dir.join(first);
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&mount_dir)
        .map_err(|e| Error::device(&mount_dir, format!("couldn't create directory for device: {}", e)))?;

    let vdev = VirtualDevice::from_leaves(backing_files.clone())
        .ok_or_else(|| Error::malformed("device without a name"))?;

    info!(
        "Materialized device {} with {} backing file(s)",
        first,
        backing_files.len()
    );
    Ok(MaterializedDevice {
        backing_files,
        mount_dir,
        vdev,
    })
}

/// Rewrite a backing file so the pool on it no longer imports.
///
/// Every chunk past the first is reversed and rotated by its index. The
/// rewrite is deterministic, so a corrupted pool fails the same way on every run.
pub fn scramble(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::device(path, format!("couldn't open device to scramble: {}", e)))?;
    let len = file.metadata()?.len();
    let mut buf = vec![0u8; SCRAMBLE_CHUNK as usize];

    for index in 1..SCRAMBLE_CHUNKS {
        let offset = index * SCRAMBLE_CHUNK;
        if offset >= len {
            break;
        }
        let size = SCRAMBLE_CHUNK.min(len - offset) as usize;
        let chunk = &mut buf[..size];
        read_chunk(&mut file, offset, chunk, path)?;
        chunk.reverse();
        chunk.rotate_left(index as usize % size);
        // A zeroed sparse region stays zeroed after a permutation; stamp it.
        for (i, byte) in chunk.iter_mut().enumerate().step_by(4096) {
            *byte ^= (index as u8).wrapping_add(i as u8) | 1;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(chunk)
            .map_err(|e| Error::device(path, format!("failed to write to file: {}", e)))?;
    }
    file.sync_all()?;
    info!("Scrambled backing file {}", path.display());
    Ok(())
}

fn read_chunk(file: &mut File, offset: u64, chunk: &mut [u8], path: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(chunk)
        .map_err(|e| Error::device(path, format!("failed to read file: {}", e)))
}
