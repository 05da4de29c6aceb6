//! `zfs` shim.
//!
//! Snapshot creation times are read from the fixture's user property, and
//! the current system root dataset is reported as mounted.

use zfs_fixtures::config::{user_property, DEFAULT_PROPERTY_NAMESPACE};
use zfs_fixtures::snapshot::CREATION_PROPERTY;

pub const REAL_ZFS: &str = "/sbin/zfs";

/// Listing the generator issues to find mounted filesystems.
const MOUNT_LISTING: [&str; 5] = ["list", "-H", "-oname,mounted,mountpoint", "-t", "filesystem"];

/// Arguments to forward to the real program.
pub fn rewrite_args(args: &[String]) -> Vec<String> {
    let mut args = args.to_vec();
    if args.len() == 4 && args[..3] == ["get", "-H", "creation"] {
        args[2] = user_property(DEFAULT_PROPERTY_NAMESPACE, CREATION_PROPERTY);
    }
    args
}

/// Whether the output of this invocation needs the root dataset rewrite.
pub fn is_mount_listing(args: &[String]) -> bool {
    args == MOUNT_LISTING
}

/// Report `root` as mounted in one line of the mount listing.
pub fn mark_root_mounted(line: &str, root: &str) -> String {
    let is_root = line
        .strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('\t'));
    if root.is_empty() || !is_root {
        return line.to_string();
    }
    line.replacen("\tno\t", "\tyes\t", 1)
}
