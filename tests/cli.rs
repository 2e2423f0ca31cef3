//! CLI test cases.
//!
//! Most of these only touch the project record, so they run without any OCR
//! or translation engines installed. Tests which actually OCR a page need
//! Tesseract, and are ignored by default.

use std::{fs, path::Path, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Just enough of a PNG file for file type detection.
static PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("lumos").unwrap()
}

/// Create a new `Command` using `root` as the output directory.
fn cmd_in(root: &Path) -> Command {
    let mut cmd = cmd();
    cmd.env_remove("LUMOS_OUTPUT_DIR").arg("--root").arg(root);
    cmd
}

/// Write a fake scanned page into `dir`.
fn write_scan(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("scan.png");
    fs::write(&path, PNG_HEADER).unwrap();
    path
}

#[test]
fn test_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("LUMOS_OUTPUT_DIR"));
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_project_record() {
    cmd()
        .arg("schema")
        .arg("ProjectRecord")
        .assert()
        .success()
        .stdout(predicate::str::contains("properties"))
        .stdout(predicate::str::contains("total_pages"));
}

#[test]
fn test_schema_progress_event() {
    cmd()
        .arg("schema")
        .arg("ProgressEvent")
        .assert()
        .success()
        .stdout(predicate::str::contains("project_id"));
}

#[test]
fn test_new_then_status() {
    let dir = TempDir::new().unwrap();
    let scan = write_scan(dir.path());
    let root = dir.path().join("output");

    cmd_in(&root)
        .arg("new")
        .arg("My Book")
        .arg(&scan)
        .arg("--lang")
        .arg("por+eng")
        .arg("--translate-to")
        .arg("English")
        .assert()
        .success()
        .stdout(predicate::str::diff("My_Book\n"));
    assert!(root.join("My_Book").join("project.json").exists());

    cmd_in(&root)
        .arg("status")
        .arg("My_Book")
        .assert()
        .success()
        .stdout(predicate::str::contains("(1 pages)"))
        .stdout(predicate::str::contains("OCR: 0/1 done"))
        .stdout(predicate::str::contains("Translation to English"));

    cmd_in(&root)
        .arg("status")
        .arg("My_Book")
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r#""status":\s*"created""#).unwrap())
        .stdout(predicate::str::contains(r#""failed_pages": []"#));
}

#[test]
fn test_new_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    let scan = write_scan(dir.path());
    let root = dir.path().join("output");

    cmd_in(&root).arg("new").arg("book").arg(&scan).assert().success();
    cmd_in(&root)
        .arg("new")
        .arg("book")
        .arg(&scan)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_new_rejects_unsupported_files() {
    let dir = TempDir::new().unwrap();
    let notes = dir.path().join("notes.txt");
    fs::write(&notes, "not a scan").unwrap();

    cmd_in(&dir.path().join("output"))
        .arg("new")
        .arg("notes")
        .arg(&notes)
        .assert()
        .failure();
}

#[test]
fn test_status_of_missing_project() {
    let dir = TempDir::new().unwrap();
    cmd_in(dir.path())
        .arg("status")
        .arg("nope")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no project"));
}

#[test]
fn test_rebuild_and_cancel() {
    let dir = TempDir::new().unwrap();
    let scan = write_scan(dir.path());
    let root = dir.path().join("output");

    cmd_in(&root).arg("new").arg("book").arg(&scan).assert().success();
    cmd_in(&root)
        .arg("rebuild")
        .arg("book")
        .assert()
        .success()
        .stdout(predicate::str::contains("ocr.txt"));
    assert_eq!(
        fs::read_to_string(root.join("book").join("ocr.txt")).unwrap(),
        "[[page 1 unavailable]]"
    );

    cmd_in(&root).arg("cancel").arg("book").assert().success();
    cmd_in(&root)
        .arg("status")
        .arg("book")
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled"));
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_run_ocr_on_image() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("output");

    cmd_in(&root)
        .arg("new")
        .arg("sample")
        .arg("tests/fixtures/blank.png")
        .arg("--lang")
        .arg("eng")
        .arg("--run")
        .assert()
        .success();
    assert!(root.join("sample").join("ocr.txt").exists());

    cmd_in(&root)
        .arg("status")
        .arg("sample")
        .assert()
        .success()
        .stdout(predicate::str::contains("OCR: 1/1 done"));
}
