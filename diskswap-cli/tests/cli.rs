use assert_cmd::Command;
use predicates::prelude::*;

fn diskswap() -> Command {
    Command::new(env!("CARGO_BIN_EXE_diskswap"))
}

#[test]
fn help_lists_every_subcommand() {
    diskswap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("devices"))
        .stdout(predicate::str::contains("backups"))
        .stdout(predicate::str::contains("system"))
        .stdout(predicate::str::contains("cache"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn run_requires_a_device() {
    diskswap()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--device"));
}

#[test]
fn status_reports_when_no_job_exists() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("job.json");

    diskswap()
        .args(["status", "--state-file"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("No job."));
}

#[test]
fn dismiss_without_a_job_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("job.json");

    diskswap()
        .args(["dismiss", "--state-file"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("No job to dismiss."));
}
