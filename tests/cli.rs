//! Command line behavior.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn fleet() -> Command {
    Command::cargo_bin("fleet").unwrap()
}

const STUB_CONFIG: &str = r#"
[fleet]
output_dir = "out"

[strategies.batching]
type = "fixed-size"
size = 2

[provider]
type = "stub"

[[provider.devices]]
serial = "stub-1"

[[provider.devices]]
serial = "stub-2"

[report]
progress = false
"#;

#[test]
fn test_init_then_validate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.toml");

    fleet()
        .args(["init", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));

    fleet()
        .arg("validate")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Provider: local (1 devices)"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(&path, "# mine").unwrap();

    fleet()
        .args(["init", "--path"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");
}

#[test]
fn test_validate_reports_bad_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(
        &path,
        "[strategies.batching]\ntype = \"fixed-size\"\nsize = 0\n\n[provider]\ntype = \"stub\"\n",
    )
    .unwrap();

    fleet()
        .arg("validate")
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("strategies.batching.size"));
}

#[test]
fn test_dry_run_with_stub_devices() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fleet.toml");
    let tests = dir.path().join("tests.txt");
    std::fs::write(&config, STUB_CONFIG).unwrap();
    std::fs::write(
        &tests,
        "com.example.LoginTest#valid\ncom.example.LoginTest#invalid\ncom.example.CartTest#add\n",
    )
    .unwrap();

    fleet()
        .current_dir(dir.path())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--tests")
        .arg(&tests)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("Passed:  3"));

    assert!(dir.path().join("out").is_dir());
}

#[test]
fn test_run_rejects_malformed_test_list() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("fleet.toml");
    let tests = dir.path().join("tests.txt");
    std::fs::write(&config, STUB_CONFIG).unwrap();
    std::fs::write(&tests, "LoginTest\n").unwrap();

    fleet()
        .current_dir(dir.path())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--tests")
        .arg(&tests)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid test name"));
}
