//! `date` shim: the current time is pinned to the far future.

use zfs_fixtures::FAR_FUTURE_EPOCH;

use crate::{Decision, Reply};

pub const REAL_DATE: &str = "/bin/date";

pub fn decide(args: &[String]) -> Decision {
    if args.len() == 1 && args[0] == "+%s" {
        return Decision::Reply(Reply::out(FAR_FUTURE_EPOCH.to_string()));
    }
    Decision::Forward(args.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn epoch_query_is_pinned() {
        assert_eq!(
            decide(&args(&["+%s"])),
            Decision::Reply(Reply::out("2000000000"))
        );
    }

    #[test]
    fn other_formats_are_forwarded() {
        assert_eq!(decide(&args(&["-R"])), Decision::Forward(args(&["-R"])));
        assert_eq!(
            decide(&args(&["+%s", "-u"])),
            Decision::Forward(args(&["+%s", "-u"]))
        );
        assert_eq!(decide(&[]), Decision::Forward(vec![]));
    }
}
