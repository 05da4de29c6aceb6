//! Shadows `zpool` so pool imports find the fixture's backing files.

use zfs_fixtures::driver_env::ENV_POOL_DIR;
use zfs_fixtures_shims::zpool::{rewrite_args, REAL_ZPOOL};
use zfs_fixtures_shims::{args, exit_with, forward};

fn main() {
    let pool_dir = std::env::var(ENV_POOL_DIR).ok();
    let args = rewrite_args(&args(), pool_dir.as_deref());
    exit_with(forward(REAL_ZPOOL, &args))
}
