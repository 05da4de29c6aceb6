//! Shadows `date` so `date +%s` reports a fixed far-future instant.

use zfs_fixtures_shims::date::{decide, REAL_DATE};
use zfs_fixtures_shims::{args, execute, exit_with};

fn main() {
    exit_with(execute(REAL_DATE, decide(&args())))
}
