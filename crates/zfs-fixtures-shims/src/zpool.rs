//! `zpool` shim: pool imports also search the fixture work directory.

pub const REAL_ZPOOL: &str = "/sbin/zpool";

const IMPORT_ALL: [&str; 6] = ["import", "-f", "-a", "-o", "cachefile=none", "-N"];

/// Arguments to forward, `pool_dir` being the configured search directory.
/// An unset directory means the working directory; a set one is passed as is, even when empty.
pub fn rewrite_args(args: &[String], pool_dir: Option<&str>) -> Vec<String> {
    let mut args = args.to_vec();
    if args.len() >= IMPORT_ALL.len() && args[..IMPORT_ALL.len()] == IMPORT_ALL {
        args.push("-d".to_string());
        args.push(pool_dir.unwrap_or(".").to_string());
    }
    args
}
