//! CLI integration tests
use predicates::prelude::*;
use tempfile::TempDir;

const BOOK_URL: &str = "data:;base64,PGgxPklubGluZSBCb29rPC9oMT48c3BhbiBjbGFzcz0iYXV0aG9yIj5Tb21lb25lPC9zcGFuPg==";
const TOC_URL: &str = "data:;base64,PHVsPjxsaT48YSBocmVmPSJodHRwczovL3guZXhhbXBsZS8xIj5PbmU8L2E+PC9saT48bGk+PGEgaHJlZj0iaHR0cHM6Ly94LmV4YW1wbGUvMiI+VHdvPC9hPjwvbGk+PC91bD4=";
const CHAPTER_URL: &str = "data:;base64,PGRpdiBpZD0iYyI+PHA+Rmlyc3QuPC9wPjxwPlNlY29uZC48L3A+PC9kaXY+";

const LOCAL_SOURCE: &str = r#"{
    "id": "local",
    "name": "Local",
    "bookInfo": { "name": "h1@text", "author": "span.author@text" },
    "toc": { "chapterList": "li", "chapterName": "a@text", "chapterUrl": "a@href" },
    "content": { "content": "div#c@html" }
}"#;

fn cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("quire")
}

fn sources_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("local.json"), LOCAL_SOURCE).unwrap();
    std::fs::write(dir.path().join("off.json"), r#"{"id": "off", "enabled": false}"#).unwrap();
    dir
}

fn sources_arg(dir: &TempDir) -> String {
    dir.path().to_str().unwrap().to_string()
}

#[test]
fn test_cli_info_text() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "info", "local", BOOK_URL])
        .assert()
        .success()
        .stdout(predicate::str::contains("Name: Inline Book"))
        .stdout(predicate::str::contains("Author: Someone"));
}

#[test]
fn test_cli_info_json() {
    let dir = sources_dir();
    let output = cmd().args(["--sources", &sources_arg(&dir), "-f", "json", "info", "local", BOOK_URL]).output().unwrap();

    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["name"], "Inline Book");
    assert_eq!(info["lastChapter"], "");
}

#[test]
fn test_cli_toc_json() {
    let dir = sources_dir();
    let output = cmd().args(["toc", "local", TOC_URL, "--sources", &sources_arg(&dir), "--format", "json"]).output().unwrap();

    assert!(output.status.success());
    let chapters: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(chapters.as_array().map(Vec::len), Some(2));
    assert_eq!(chapters[0]["title"], "One");
    assert_eq!(chapters[1]["url"], "https://x.example/2");
}

#[test]
fn test_cli_toc_text() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "toc", "local", TOC_URL])
        .assert()
        .success()
        .stdout(predicate::eq("One\thttps://x.example/1\nTwo\thttps://x.example/2\n"));
}

#[test]
fn test_cli_content_text() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "content", "local", CHAPTER_URL])
        .assert()
        .success()
        .stdout(predicate::eq("First.\n\nSecond.\n"));
}

#[test]
fn test_cli_output_file() {
    let dir = sources_dir();
    let output = dir.path().join("chapter.txt");

    cmd()
        .args(["--sources", &sources_arg(&dir), "-o", output.to_str().unwrap(), "content", "local", CHAPTER_URL])
        .assert()
        .success()
        .stderr(predicate::str::contains("Output written to"));

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "First.\n\nSecond.\n");
}

#[test]
fn test_cli_sources_list() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "sources"])
        .assert()
        .success()
        .stdout(predicate::str::contains("local"))
        .stdout(predicate::str::contains("off"));
}

#[test]
fn test_cli_unknown_source() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "info", "nope", BOOK_URL])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown source"));
}

#[test]
fn test_cli_disabled_source() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "content", "off", CHAPTER_URL])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disabled"));
}

#[test]
fn test_cli_relative_url_without_hosts() {
    let dir = sources_dir();
    cmd()
        .args(["--sources", &sources_arg(&dir), "info", "local", "/book/1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No host"));
}

#[test]
fn test_cli_invalid_format() {
    cmd().args(["-f", "xml", "sources"]).assert().failure();
}

#[test]
fn test_cli_missing_arguments() {
    cmd().arg("info").assert().failure();
}

#[test]
fn test_cli_verbose() {
    let dir = sources_dir();
    cmd()
        .args(["-v", "--sources", &sources_arg(&dir), "info", "local", BOOK_URL])
        .assert()
        .success()
        .stderr(predicate::str::contains("Quire"))
        .stderr(predicate::str::contains("Fetching from"));
}
