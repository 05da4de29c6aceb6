//! Shadows `mokutil`, reporting the secure boot state set by the test.

use zfs_fixtures_shims::mokutil::reply_from_env;

fn main() {
    std::process::exit(reply_from_env().emit())
}
