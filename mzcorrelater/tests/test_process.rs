use std::{error::Error, fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

#[test]
fn test_file_missing() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzcorrelater")?;

    cmd.arg("not_real.json").arg("-o").arg("-");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("An IO error occurred"));
    Ok(())
}

#[test]
fn test_malformed_arguments() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzcorrelater")?;

    cmd.arg("not_real.json").args(["-u", "furlong"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'furlong'"));

    let mut cmd = Command::cargo_bin("mzcorrelater")?;

    cmd.arg("not_real.json").args(["-m", "-1"]);
    cmd.assert().failure();

    Ok(())
}

#[test]
fn test_invalid_parameters() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzcorrelater")?;

    cmd.arg("./tests/data/table.json").args(["--max-charge", "0"]);
    cmd.assert().failure().stderr(predicate::str::contains(
        "The maximum charge must be at least 1",
    ));
    Ok(())
}

#[test]
fn test_run() -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("mzcorrelater")?;
    cmd.env("RUST_LOG", "info");
    cmd.arg("./tests/data/table.json").args(["-o", "-", "-t", "2"]);
    let result = cmd.assert().success();
    result
        .stdout(predicate::str::contains("[M+Na]+"))
        .stdout(predicate::str::contains("[M-H2O+H]+"))
        .stderr(predicate::str::contains("Read 4 rows from 3 samples"))
        .stderr(predicate::str::contains("Groups: 1"))
        .stderr(predicate::str::contains("Ion Identity Networks: 1"));

    Ok(())
}

#[test]
fn test_run_stdin() -> Result<(), Box<dyn Error>> {
    let mut cmd = assert_cmd::Command::cargo_bin("mzcorrelater")?;
    cmd.arg("-")
        .write_stdin(fs::read("./tests/data/table.json")?)
        .args(["--annotate-by-rt", "--min-network-size", "3"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"cancelled\": false"))
        .stdout(predicate::str::contains("[M+Na]+"));
    Ok(())
}
