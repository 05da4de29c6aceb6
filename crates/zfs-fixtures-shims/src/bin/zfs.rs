//! Shadows `zfs`, reading snapshot creation times from the fixture property
//! and reporting the current system root as mounted.

use zfs_fixtures::driver_env::ENV_CURRENT_ROOT_DATASET;
use zfs_fixtures_shims::zfs::{is_mount_listing, mark_root_mounted, rewrite_args, REAL_ZFS};
use zfs_fixtures_shims::{args, exit_with, forward, forward_filtered};

fn main() {
    let args = rewrite_args(&args());
    let root = std::env::var(ENV_CURRENT_ROOT_DATASET).unwrap_or_default();

    if !root.is_empty() && is_mount_listing(&args) {
        exit_with(forward_filtered(REAL_ZFS, &args, |line| mark_root_mounted(line, &root)))
    }
    exit_with(forward(REAL_ZFS, &args))
}
