//! CLI Argument Parsing and Exit Status Tests
//!
//! These tests run the binary with a cleared environment so that deployment variables on the
//! test host never leak in. None of them reach the network: every invocation either stops at
//! argument parsing or fails configuration before any credential is resolved.

use assert_cmd::Command;
use predicates::prelude::*;

fn azreplica() -> Command {
    let mut cmd = Command::cargo_bin("azreplica").unwrap();
    cmd.env_clear();
    cmd
}

#[test]
fn test_help_runs() {
    azreplica()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--source-blob"))
        .stdout(predicate::str::contains("AZURE_SOURCE_CONNECTION_STRING_FILE_SHARE"));
}

#[test]
fn test_version_runs() {
    azreplica().arg("--version").assert().success();
}

#[test]
fn test_build_info_is_json() {
    azreplica()
        .arg("--build-info")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"semantic\""));
}

#[test]
fn test_nothing_configured_exits_fatal() {
    azreplica()
        .assert()
        .code(3)
        .stderr(predicate::str::contains("no storage kind is configured"));
}

#[test]
fn test_quiet_suppresses_fatal_error() {
    azreplica()
        .arg("--quiet")
        .assert()
        .code(3)
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_half_configured_kind_exits_fatal() {
    azreplica()
        .args(["--source-table", "src"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("no destination account configured"));
}

#[test]
fn test_wrong_service_endpoint_is_rejected() {
    azreplica()
        .args([
            "--source-blob",
            "https://src.queue.core.windows.net",
            "--destination-blob",
            "dst",
        ])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("queue endpoint"));
}

#[test]
fn test_connection_string_without_signature_is_rejected() {
    azreplica()
        .env(
            "AZURE_SOURCE_CONNECTION_STRING_FILE_SHARE",
            "AccountName=src;AccountKey=c2VjcmV0",
        )
        .env("DESTINATION_STORAGE_ACCOUNT_FILE", "dst")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("shared access signature"));
}

// ============================================================================
// Value formats
// ============================================================================

#[test]
fn test_overwrite_accepts_any_case() {
    for value in ["true", "True", "FALSE", "false"] {
        azreplica()
            .env("OVERWRITE_STORAGE_ACCOUNT_BLOB", value)
            .arg("--help")
            .assert()
            .success();
    }
}

#[test]
fn test_overwrite_rejects_other_words() {
    azreplica()
        .args(["--overwrite-table=yes", "--help"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_kinds_accept_comma_list() {
    azreplica()
        .args(["--kinds", "blob,queue,table,file-share", "--help"])
        .assert()
        .success();
}

#[test]
fn test_unknown_kind_is_rejected() {
    azreplica()
        .args(["--kinds", "disk"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disk"));
}

#[test]
fn test_progress_type_aliases() {
    for value in ["auto", "Auto", "progress-bar", "ProgressBar", "text-updates", "TextUpdates"] {
        azreplica()
            .args(["--progress-type", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_durations_and_sizes_are_human_readable() {
    azreplica()
        .args([
            "--call-timeout",
            "90s",
            "--initial-backoff",
            "250ms",
            "--queue-visibility-timeout",
            "5min",
            "--stream-copy-threshold",
            "64MiB",
            "--help",
        ])
        .assert()
        .success();
}
