use std::fs;

use tempfile::TempDir;
use zfs_fixtures::SecureBootState;
use zfs_fixtures_cli::{Cli, Commands, Parser};

const ROOT_FIXTURE: &str = r#"
devices:
  - names: [rpool]
    type: zfs
    zfs:
      pool_name: rpool
      datasets:
        - name: ROOT
          canmount: "off"
        - name: ROOT/ubuntu
          is_current_system_root: true
          mountpoint: /
          canmount: "on"
"#;

fn write_fixture(dir: &TempDir) -> String {
    let path = dir.path().join("fixture.yaml");
    fs::write(&path, ROOT_FIXTURE).unwrap();
    path.display().to_string()
}

#[test]
fn test_cli_parsing_check() {
    let cli = Cli::try_parse_from(["fixturectl", "check", "fixture.yaml"]).unwrap();
    assert!(matches!(cli.command, Commands::Check(_)));
    assert!(!cli.global.emulate);
    assert_eq!(cli.global.log_level, "info");
}

#[test]
fn test_cli_parsing_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "fixturectl",
        "provision",
        "fixture.yaml",
        "--work-dir",
        "/tmp/fx",
        "--run-id",
        "run-a",
        "--emulate",
        "--json",
        "--content-root",
        "/srv/payloads",
    ])
    .unwrap();

    assert!(cli.global.emulate);
    assert!(cli.global.json);
    assert_eq!(cli.global.content_root.as_deref(), Some(std::path::Path::new("/srv/payloads")));
    match cli.command {
        Commands::Provision(args) => {
            assert_eq!(args.run_id, "run-a");
            assert_eq!(args.work_dir, std::path::PathBuf::from("/tmp/fx"));
        }
        _ => panic!("expected provision"),
    }
}

#[test]
fn test_cli_parsing_run_with_command() {
    let cli = Cli::try_parse_from([
        "fixturectl",
        "run",
        "fixture.yaml",
        "--work-dir",
        "/tmp/fx",
        "--secure-boot",
        "efi-nosb",
        "--",
        "update-grub",
        "--verbose",
    ])
    .unwrap();

    match cli.command {
        Commands::Run(args) => {
            assert_eq!(args.secure_boot, Some(SecureBootState::EfiNoSecureBoot));
            assert_eq!(args.command, vec!["update-grub", "--verbose"]);
            assert_eq!(args.run_id, "");
        }
        _ => panic!("expected run"),
    }
}

#[test]
fn test_cli_parsing_rejects_unknown_secure_boot_state() {
    let result = Cli::try_parse_from([
        "fixturectl",
        "run",
        "fixture.yaml",
        "--work-dir",
        "/tmp/fx",
        "--secure-boot",
        "bios",
        "--",
        "true",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_cli_parsing_run_requires_a_command() {
    let result = Cli::try_parse_from(["fixturectl", "run", "fixture.yaml", "--work-dir", "/tmp/fx"]);
    assert!(result.is_err());
}

#[test]
fn test_check_reports_invalid_documents() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    fs::write(&path, "devices:\n  - names: [a]\n    type: floppy\n").unwrap();

    let cli = Cli::try_parse_from(["fixturectl", "check", path.to_str().unwrap()]).unwrap();
    let Commands::Check(args) = cli.command else {
        panic!("expected check");
    };
    let err = args.run(&cli.global).unwrap_err();
    assert!(format!("{:#}", err).contains("unknown device type"));
}

#[tokio::test]
async fn test_run_against_emulated_fixture_propagates_exit_code() {
    let dir = TempDir::new().unwrap();
    let fixture = write_fixture(&dir);
    let work_dir = dir.path().join("work");
    let work_dir = work_dir.to_str().unwrap();

    let cli = Cli::try_parse_from([
        "fixturectl",
        "--emulate",
        "run",
        &fixture,
        "--work-dir",
        work_dir,
        "--run-id",
        "cli",
        "--secure-boot",
        "legacy",
        "--",
        "sh",
        "-c",
        "test \"$TEST_MOCKZFS_CURRENT_ROOT_DATASET\" = cli-rpool/ROOT/ubuntu \
         && test \"$TEST_MOKUTIL_SECUREBOOT\" = legacy && exit 7",
    ])
    .unwrap();
    let Commands::Run(args) = cli.command else {
        panic!("expected run");
    };

    assert_eq!(args.run(&cli.global).await.unwrap(), 7);
}

#[tokio::test]
async fn test_provision_emulated_fixture() {
    let dir = TempDir::new().unwrap();
    let fixture = write_fixture(&dir);
    let work_dir = dir.path().join("work");

    let cli = Cli::try_parse_from([
        "fixturectl",
        "--emulate",
        "provision",
        &fixture,
        "--work-dir",
        work_dir.to_str().unwrap(),
    ])
    .unwrap();
    let Commands::Provision(args) = cli.command else {
        panic!("expected provision");
    };

    args.run(&cli.global).await.unwrap();
    assert!(work_dir.join("rpool.disk").exists());
}
