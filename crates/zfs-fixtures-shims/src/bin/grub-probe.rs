//! Shadows `grub-probe` with fixed answers for fixture devices.

use zfs_fixtures_shims::grub_probe::{decide, REAL_GRUB_PROBE};
use zfs_fixtures_shims::{args, execute, exit_with};

fn main() {
    exit_with(execute(REAL_GRUB_PROBE, decide(&args())))
}
