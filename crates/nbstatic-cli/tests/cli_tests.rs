//! Integration tests for the nbstatic CLI

use assert_cmd::Command;
use nbstatic_notebook::{write_notebook, Cell, Notebook};
use predicates::prelude::*;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn nbstatic(base: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_nbstatic"));
    cmd.current_dir(base)
        .arg("--base")
        .arg(base)
        .env("AUTH0_TOKEN", "test-token")
        .env_remove("RUST_LOG");
    cmd
}

fn write(base: &Path, relative: &str, notebook: &Notebook) -> PathBuf {
    let path = base.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    write_notebook(notebook, &path).unwrap();
    path
}

fn csharp_notebook() -> Notebook {
    let mut notebook = Notebook::from_cells(vec![Cell::code("Console.WriteLine(1);")]);
    notebook.metadata.insert(
        "kernelspec".to_string(),
        json!({"name": ".net-csharp", "display_name": ".NET (C#)"}),
    );
    notebook
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[test]
fn test_help_lists_commands() {
    Command::new(env!("CARGO_BIN_EXE_nbstatic"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("convert"))
        .stdout(predicate::str::contains("map"));
}

#[test]
fn test_html_conflicts_with_format() {
    let dir = TempDir::new().unwrap();
    nbstatic(dir.path())
        .args(["convert", "--html", "--format", "markdown"])
        .assert()
        .failure();
}

#[test]
fn test_convert_requires_auth_token() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "python/a.ipynb", &Notebook::from_cells(vec![]));

    nbstatic(dir.path())
        .env_remove("AUTH0_TOKEN")
        .args(["convert", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Environment variable AUTH0_TOKEN should be set",
        ));
    assert!(!dir.path().join("_generated_static").exists());
}

#[test]
fn test_map_does_not_require_auth_token() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "python/My Notebook [v2].ipynb",
        &Notebook::from_cells(vec![]),
    );

    nbstatic(dir.path())
        .env_remove("AUTH0_TOKEN")
        .args(["map", "--html", "python/My Notebook [v2].ipynb"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "_generated_html/python/my-notebook-v2.ipynb",
        ))
        .stdout(predicate::str::contains(
            "_generated_html/python/my-notebook-v2.html",
        ))
        .stdout(predicate::str::contains(
            "_generated_html/python/my-notebook-v2_files",
        ));
}

#[test]
fn test_map_execute_only_has_no_resources() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "python/Intro.ipynb", &Notebook::from_cells(vec![]));

    nbstatic(dir.path())
        .args(["map", "python/Intro.ipynb"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_generated_static/python/intro.ipynb"))
        .stdout(predicate::str::contains("resources:").not());
}

#[test]
fn test_map_outside_base_fails() {
    let base = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let notebook = write(elsewhere.path(), "a.ipynb", &Notebook::from_cells(vec![]));

    nbstatic(base.path())
        .arg("map")
        .arg(&notebook)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not under the project base"));
}

#[test]
fn test_batch_dry_run_lists_pending_notebooks() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "python/a.ipynb", &Notebook::from_cells(vec![]));
    write(dir.path(), "python/b.ipynb", &Notebook::from_cells(vec![]));
    let existing = dir.path().join("_generated_html/python/b.html");
    fs::create_dir_all(existing.parent().unwrap()).unwrap();
    fs::write(&existing, "<html></html>").unwrap();

    nbstatic(dir.path())
        .args(["convert", "--html", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("a.ipynb"))
        .stdout(predicate::str::contains("_generated_html/python/a.html"))
        .stdout(predicate::str::contains("b.ipynb").not())
        .stdout(predicate::str::contains("1 to convert, 1 already converted"));
    assert!(!dir.path().join("_generated_html/python/a.ipynb").exists());
}

#[test]
fn test_batch_skips_converted_notebooks() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "python/a.ipynb", &Notebook::from_cells(vec![]));
    let existing = dir.path().join("_generated_md/python/a.md");
    fs::create_dir_all(existing.parent().unwrap()).unwrap();
    fs::write(&existing, "# done\n").unwrap();

    nbstatic(dir.path())
        .args(["convert", "--format", "markdown"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 converted, 0 failed, 1 skipped"));
    assert_eq!(fs::read_to_string(&existing).unwrap(), "# done\n");
}

#[test]
fn test_batch_failure_does_not_fail_the_run() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "csharp/prices.ipynb", &csharp_notebook());

    nbstatic(dir.path())
        .args(["convert", "--html"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Failed"))
        .stdout(predicate::str::contains("No kernel configured for '.net-csharp'"))
        .stdout(predicate::str::contains("0 converted, 1 failed, 0 skipped"));
    assert!(!dir.path().join("_generated_html/csharp/prices.ipynb").exists());
    assert!(!dir.path().join("_generated_html/csharp/prices.html").exists());
}

#[test]
fn test_single_notebook_failure_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "csharp/prices.ipynb", &csharp_notebook());

    nbstatic(dir.path())
        .args(["convert", "--html", "csharp/prices.ipynb"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not convert"))
        .stderr(predicate::str::contains("No kernel configured for '.net-csharp'"));
}

#[test]
fn test_configured_roots_replace_defaults() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "python/a.ipynb", &Notebook::from_cells(vec![]));
    write(dir.path(), "research/b.ipynb", &Notebook::from_cells(vec![]));
    fs::write(
        dir.path().join(".nbstatic.toml"),
        "[[roots]]\npath = \"research\"\nconcurrency = 2\n",
    )
    .unwrap();

    nbstatic(dir.path())
        .args(["convert", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("b.ipynb"))
        .stdout(predicate::str::contains("a.ipynb").not())
        .stdout(predicate::str::contains("1 to convert, 0 already converted"));
}

#[test]
fn test_configured_required_env() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(".nbstatic.toml"),
        "required_env = [\"NBSTATIC_TEST_SECRET_UNSET\"]\n",
    )
    .unwrap();

    nbstatic(dir.path())
        .env_remove("NBSTATIC_TEST_SECRET_UNSET")
        .args(["convert", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NBSTATIC_TEST_SECRET_UNSET"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".nbstatic.toml"), "unknown_key = 1\n").unwrap();

    nbstatic(dir.path())
        .args(["convert", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_missing_explicit_config_is_reported() {
    let dir = TempDir::new().unwrap();

    nbstatic(dir.path())
        .args(["--config", "missing.toml", "convert", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_convert_python_notebook_to_html() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut notebook = Notebook::from_cells(vec![
        Cell::markdown("# Spread trading"),
        Cell::code("print('Bearer secret.token-value')"),
    ]);
    notebook.metadata.insert(
        "kernelspec".to_string(),
        json!({"name": "python3", "language": "python"}),
    );
    write(dir.path(), "python/Spread Trading.ipynb", &notebook);

    nbstatic(dir.path())
        .args(["convert", "--html", "python/Spread Trading.ipynb"])
        .assert()
        .success()
        .stdout(predicate::str::contains("spread-trading.html"));

    let output = dir.path().join("_generated_html/python/spread-trading.html");
    let html = fs::read_to_string(output).unwrap();
    assert!(html.contains("rel=\"stylesheet\""));
    assert!(!html.contains("<style type=\"text/css\">"));
    assert!(!html.contains("secret.token-value"));
    assert!(!dir
        .path()
        .join("_generated_html/python/spread-trading.ipynb")
        .exists());
}
