use predicates::prelude::*;

mod common;

#[test]
fn test_settings_set_then_get() {
    let mut ctx = common::workshop();
    ctx.cmd
        .args(["settings", "set", "workshop.projectsDir", "/home/me/code"])
        .assert()
        .success();

    ctx.new_cmd()
        .args(["settings", "get", "workshop.projectsDir"])
        .assert()
        .success()
        .stdout("/home/me/code\n");

    let contents = std::fs::read_to_string(ctx.settings_file()).unwrap();
    assert!(contents.contains("projectsDir"));
}

#[test]
fn test_settings_delete() {
    let mut ctx = common::workshop();
    ctx.cmd
        .args(["settings", "set", "workshop.projectsDir", "/tmp"])
        .assert()
        .success();

    ctx.new_cmd()
        .args(["settings", "delete", "workshop.projectsDir"])
        .assert()
        .success();

    ctx.new_cmd()
        .args(["settings", "get", "workshop.projectsDir"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not set"));
}

#[test]
fn test_settings_get_missing_creates_file() {
    let mut ctx = common::workshop();
    ctx.cmd
        .args(["settings", "get", "nothing.here"])
        .assert()
        .failure();
    assert!(ctx.settings_file().is_file());
}
