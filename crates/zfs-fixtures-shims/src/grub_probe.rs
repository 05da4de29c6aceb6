//! `grub-probe` shim: fixed answers for devices the fixtures fabricate.

use crate::{Decision, Reply};

pub const REAL_GRUB_PROBE: &str = "/usr/sbin/grub-probe";

const USAGE: &str = "No path or device is specified.
Usage: grub-probe [OPTION...] [OPTION]... [PATH|DEVICE]
Try 'grub-probe --help' or 'grub-probe --usage' for more information.";

pub fn decide(args: &[String]) -> Decision {
    if args.is_empty() {
        return Decision::Reply(Reply::fail(64, USAGE));
    }
    let first = args[0].as_str();

    if first == "--target=device" {
        return Decision::Forward(args.to_vec());
    }
    if first == "--device" && args.len() >= 3 {
        if let Some(target) = args[2].strip_prefix("--target=") {
            if let Some(answer) = device_answer(&args[1], target) {
                return Decision::Reply(Reply::out(answer));
            }
        }
    }
    match first {
        "--target=abstraction" => Decision::Reply(Reply::silent()),
        "--target=fs" => Decision::Reply(Reply::out("ext2")),
        _ => Decision::Reply(Reply::fail(
            2,
            format!("grub-probe called with unexpected arguments: {}", args.join(" ")),
        )),
    }
}

fn device_answer(device: &str, target: &str) -> Option<String> {
    let answer = match target {
        "abstraction" => format!("modfor_{}", device),
        "compatibility_hint" => "hd0,gpt2".to_string(),
        "fs" => "ext2".to_string(),
        "fs_uuid" => format!("UUID-{}", device),
        "partmap" => "gpt".to_string(),
        "hints_string" => "--hint-bios=hd0,gpt2 --hint-efi=hd0,gpt2".to_string(),
        _ => return None,
    };
    Some(answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn stdout(decision: Decision) -> String {
        match decision {
            Decision::Reply(reply) => reply.stdout,
            Decision::Forward(args) => panic!("forwarded {:?}", args),
        }
    }

    #[test]
    fn device_queries_have_fixed_answers() {
        let ask = |target: &str| stdout(decide(&args(&["--device", "/dev/sda2", target])));
        assert_eq!(ask("--target=abstraction"), "modfor_/dev/sda2\n");
        assert_eq!(ask("--target=compatibility_hint"), "hd0,gpt2\n");
        assert_eq!(ask("--target=fs"), "ext2\n");
        assert_eq!(ask("--target=fs_uuid"), "UUID-/dev/sda2\n");
        assert_eq!(ask("--target=partmap"), "gpt\n");
        assert_eq!(ask("--target=hints_string"), "--hint-bios=hd0,gpt2 --hint-efi=hd0,gpt2\n");
    }

    #[test]
    fn device_lookup_goes_to_the_real_program() {
        let lookup = args(&["--target=device", "/boot"]);
        assert_eq!(decide(&lookup), Decision::Forward(lookup.clone()));
    }

    #[test]
    fn path_queries() {
        assert_eq!(stdout(decide(&args(&["--target=abstraction", "/boot"]))), "");
        assert_eq!(stdout(decide(&args(&["--target=fs", "/boot"]))), "ext2\n");
    }

    #[test]
    fn missing_arguments_print_usage() {
        match decide(&[]) {
            Decision::Reply(reply) => {
                assert_eq!(reply.code, 64);
                assert!(reply.stdout.is_empty());
                assert_eq!(
                    reply.stderr,
                    "No path or device is specified.\n\
                     Usage: grub-probe [OPTION...] [OPTION]... [PATH|DEVICE]\n\
                     Try 'grub-probe --help' or 'grub-probe --usage' for more information.\n"
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unexpected_invocations_fail() {
        match decide(&args(&["--device", "/dev/sda2", "--target=drive"])) {
            Decision::Reply(reply) => {
                assert_eq!(reply.code, 2);
                assert_eq!(
                    reply.stderr,
                    "grub-probe called with unexpected arguments: --device /dev/sda2 --target=drive\n"
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
