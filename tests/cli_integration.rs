//! Integration tests for the `patch-file` command line
//!
//! Runs the built binary against temp directories and checks output files
//! and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn patch_file(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_patch-file"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .unwrap()
}

fn setup_requirements() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("requirements.txt"),
        "a\ngradio_client==1.13.1\ndiffusers @ git+https://x\nb\npip==24.0\n",
    )
    .unwrap();
    dir
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help() {
    let output = patch_file(&["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--target"));
    assert!(stdout.contains("--force-kill"));
    assert!(stdout.contains("--max-attempts"));
}

#[test]
fn test_apply_then_unchanged() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let rule = r"gradio_client\=\=1\.13\.1=gradio_client>=1.13.1,<2.0";

    let first = patch_file(&["--target", path_arg(&target), "--rule", rule]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    assert!(String::from_utf8_lossy(&first.stdout).contains("Applied 1 substitution(s)"));
    let content = fs::read_to_string(&target).unwrap();
    assert!(content.contains("gradio_client>=1.13.1,<2.0\n"));
    assert!(dir.path().join("requirements.txt.bak").exists());

    let second = patch_file(&["--target", path_arg(&target), "--rule", rule]);
    assert!(second.status.success());
    assert!(String::from_utf8_lossy(&second.stdout).contains("Unchanged"));
    assert_eq!(fs::read_to_string(&target).unwrap(), content);
}

#[test]
fn test_literal_rule_and_json_output() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--literal-rule",
        r"gradio_client\=\=1.13.1=gradio_client>=1.13.1,<2.0",
        "--json",
    ]);

    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["status"], "applied");
    assert_eq!(report["substitutions"], 1);
    assert_eq!(report["publish"]["attempts"], 1);
}

#[test]
fn test_dry_run_does_not_write() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let before = fs::read_to_string(&target).unwrap();

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--rule",
        "b=c",
        "--dry-run",
        "--diff",
    ]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Would apply 1 substitution(s)"));
    assert!(stdout.contains("(dry run)"));
    assert!(stdout.contains("@@ "));
    assert!(stdout.contains("-b"));
    assert!(stdout.contains("+c"));
    assert_eq!(fs::read_to_string(&target).unwrap(), before);
    assert!(!dir.path().join("requirements.txt.bak").exists());
}

#[test]
fn test_missing_target_exit_code() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("missing.txt");

    let output = patch_file(&["--target", path_arg(&target), "--rule", "a=b"]);

    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
    assert!(!dir.path().join("missing.txt.bak").exists());
}

#[test]
fn test_no_rules_is_an_error() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");

    let output = patch_file(&["--target", path_arg(&target)]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no rules given"));
}

#[test]
fn test_invalid_rule_is_an_error() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");

    let output = patch_file(&["--target", path_arg(&target), "--rule", "(open=x"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid rule pattern"));
}

#[test]
fn test_filter_to_output() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let output_path = dir.path().join("requirements.filtered.txt");
    let before = fs::read_to_string(&target).unwrap();

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--output",
        path_arg(&output_path),
        "--exclude-prefix",
        "diffusers @",
        "--exclude-package",
        "pip,setuptools",
    ]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        fs::read_to_string(&output_path).unwrap(),
        "a\ngradio_client==1.13.1\nb\n"
    );
    assert_eq!(fs::read_to_string(&target).unwrap(), before);
}

#[test]
fn test_output_conflicts_with_rules() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let output_path = dir.path().join("out.txt");

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--output",
        path_arg(&output_path),
        "--rule",
        "a=b",
    ]);

    assert!(!output.status.success());
    assert!(!output_path.exists());
}

#[test]
fn test_rules_file() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let rules = dir.path().join("rules.toml");
    fs::write(
        &rules,
        r#"
[retry]
max_attempts = 2
sleep_seconds = 0

[[rules]]
id = "relax-gradio-client"
pattern = "gradio_client==1.13.1"
replacement = "gradio_client>=1.13.1,<2.0"
literal = true

[[rules]]
pattern = "pip==.*"
replacement = "pip"
"#,
    )
    .unwrap();

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--rules-file",
        path_arg(&rules),
    ]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        fs::read_to_string(&target).unwrap(),
        "a\ngradio_client>=1.13.1,<2.0\ndiffusers @ git+https://x\nb\npip\n"
    );
}

#[test]
fn test_invalid_rules_file() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let rules = dir.path().join("rules.toml");
    fs::write(&rules, "[retry]\nmax_attempts = 0\n").unwrap();

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--rules-file",
        path_arg(&rules),
    ]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid rules file"));
}

#[test]
fn test_zero_max_attempts_is_rejected() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--rule",
        "a=b",
        "--max-attempts",
        "0",
    ]);

    assert!(!output.status.success());
    assert_eq!(fs::read_to_string(&target).unwrap().lines().next(), Some("a"));
}

#[test]
fn test_mixed_rule_flags_apply_in_given_order() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("chain.txt");
    fs::write(&target, "one\n").unwrap();

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--literal-rule",
        "one=two",
        "--rule",
        "two=three",
    ]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read_to_string(&target).unwrap(), "three\n");
    assert_eq!(
        fs::read_to_string(dir.path().join("chain.txt.bak")).unwrap(),
        "one\n"
    );
}

#[test]
fn test_output_rejects_retry_flags() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let output_path = dir.path().join("out.txt");

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--output",
        path_arg(&output_path),
        "--exclude-prefix",
        "diffusers @",
        "--force-kill",
    ]);

    assert_eq!(output.status.code(), Some(2));
    assert!(!output_path.exists());
}

#[test]
fn test_filter_warns_about_ignored_rules_file_sections() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let output_path = dir.path().join("out.txt");
    let rules = dir.path().join("rules.toml");
    fs::write(
        &rules,
        r#"
[retry]
max_attempts = 2

[[rules]]
pattern = "a"
replacement = "z"

[filter]
exclude_prefixes = ["diffusers @"]
"#,
    )
    .unwrap();

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--rules-file",
        path_arg(&rules),
        "--output",
        path_arg(&output_path),
    ]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("[[rules]] from the rules file are ignored"));
    assert!(stderr.contains("[retry] from the rules file is ignored"));
    assert_eq!(
        fs::read_to_string(&output_path).unwrap(),
        "a\ngradio_client==1.13.1\nb\npip==24.0\n"
    );
}

#[test]
fn test_exclude_build_tools() {
    let dir = setup_requirements();
    let target = dir.path().join("requirements.txt");
    let output_path = dir.path().join("out.txt");

    let output = patch_file(&[
        "--target",
        path_arg(&target),
        "--output",
        path_arg(&output_path),
        "--exclude-build-tools",
    ]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        fs::read_to_string(&output_path).unwrap(),
        "a\ngradio_client==1.13.1\ndiffusers @ git+https://x\nb\n"
    );
}
