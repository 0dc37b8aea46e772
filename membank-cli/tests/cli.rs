use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn cmd(data_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("membank-cli").unwrap();
    cmd.arg("--backend").arg("tabular").arg("--data-dir").arg(data_dir);
    cmd
}

#[test]
fn store_then_get_roundtrips() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    cmd(dir.path())
        .args(["store", "notes", "greeting", "hello there"])
        .assert()
        .success()
        .stdout(predicate::str::contains("greeting"));

    cmd(dir.path())
        .args(["get", "notes", "greeting"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello there"));

    Ok(())
}

#[test]
fn get_missing_key_prints_null() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    cmd(dir.path())
        .args(["get", "notes", "nonexistent"])
        .assert()
        .success()
        .stdout(predicate::str::contains("null"));

    Ok(())
}

#[test]
fn delete_reports_prior_existence() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    cmd(dir.path())
        .args(["store", "notes", "temp", "scratch"])
        .assert()
        .success();

    cmd(dir.path())
        .args(["delete", "notes", "temp"])
        .assert()
        .success()
        .stdout(predicate::str::contains("true"));

    cmd(dir.path())
        .args(["delete", "notes", "temp"])
        .assert()
        .success()
        .stdout(predicate::str::contains("false"));

    Ok(())
}

#[test]
fn query_filters_by_category() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    cmd(dir.path()).args(["store", "recipes", "soup", "simmer"]).assert().success();
    cmd(dir.path()).args(["store", "notes", "idea", "ship it"]).assert().success();

    cmd(dir.path())
        .args(["query", "--category", "recipes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("soup").and(predicate::str::contains("idea").not()));

    Ok(())
}

#[test]
fn export_then_import_roundtrips_into_a_fresh_store() -> Result<(), Box<dyn std::error::Error>> {
    let source = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let snapshot_file = source.path().join("snapshot.json");

    cmd(source.path()).args(["store", "notes", "a", "first"]).assert().success();
    cmd(source.path()).args(["store", "notes", "b", "second"]).assert().success();

    let output = cmd(source.path()).args(["export", "--format", "json"]).output()?;
    assert!(output.status.success());
    std::fs::write(&snapshot_file, output.stdout)?;

    cmd(dest.path())
        .arg("import")
        .arg(snapshot_file.to_str().unwrap())
        .assert()
        .success()
        .stdout(predicate::str::contains("imported"));

    cmd(dest.path())
        .args(["get", "notes", "a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("first"));

    Ok(())
}

#[test]
fn stats_runs_against_an_empty_store() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    cmd(dir.path()).arg("stats").assert().success();

    Ok(())
}
