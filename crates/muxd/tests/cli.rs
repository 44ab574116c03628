//! Binary surface checks.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_names_the_flavors() {
  Command::cargo_bin("muxd")
    .unwrap()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("--flavor"))
    .stdout(predicate::str::contains("standalone"));
}

#[test]
fn bad_flavor_fails_with_nonzero_exit() {
  Command::cargo_bin("muxd")
    .unwrap()
    .args(["--flavor", "bogus"])
    .assert()
    .failure();
}
