//! External bulk-copy tool
//!
//! Blob payloads and large files are moved by `azcopy`. The orchestrator only decides what
//! to copy; it hands the tool a source URL, a destination URL and an explicit list of
//! relative paths, and reads back the transferred byte count and the final job status.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;

use crate::credential::BulkLogin;
use crate::error::TransferError;

#[derive(Clone, Debug)]
pub struct BulkJob {
    pub source: String,
    pub destination: String,
    pub overwrite: bool,
    /// Paths relative to `source`; empty copies everything below it.
    pub include: Vec<String>,
    pub login: BulkLogin,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub bytes_transferred: u64,
    pub exit_status: String,
    /// Paths of the job's include list the tool left alone because they existed.
    pub skipped: Vec<String>,
    /// Skips reported by the tool that could not be matched to a path.
    pub unnamed_skips: u64,
}

impl BulkOutcome {
    pub fn skipped_any(&self) -> bool {
        !self.skipped.is_empty() || self.unnamed_skips > 0
    }
}

#[async_trait]
pub trait BulkCopy: Send + Sync {
    async fn copy(&self, job: &BulkJob) -> Result<BulkOutcome, TransferError>;
}

/// Runs the `azcopy` executable.
pub struct AzCopy {
    program: PathBuf,
}

impl AzCopy {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, job: &BulkJob, list_of_files: Option<&std::path::Path>) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg("copy")
            .arg(&job.source)
            .arg(&job.destination)
            .arg("--recursive=true")
            .arg(format!("--overwrite={}", job.overwrite))
            .arg("--as-subdir=false")
            .arg("--s2s-preserve-properties=true")
            .arg("--output-type=text");
        if let Some(list) = list_of_files {
            command.arg("--list-of-files").arg(list);
        }
        match &job.login {
            BulkLogin::None => {}
            BulkLogin::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } => {
                command
                    .env("AZCOPY_AUTO_LOGIN_TYPE", "SPN")
                    .env("AZCOPY_TENANT_ID", tenant_id)
                    .env("AZCOPY_SPA_APPLICATION_ID", client_id)
                    .env("AZCOPY_SPA_CLIENT_SECRET", client_secret);
            }
            BulkLogin::ManagedIdentity { client_id } => {
                command.env("AZCOPY_AUTO_LOGIN_TYPE", "MSI");
                if let Some(client_id) = client_id {
                    command.env("AZCOPY_MSI_CLIENT_ID", client_id);
                }
            }
            BulkLogin::AzureCli => {
                command.env("AZCOPY_AUTO_LOGIN_TYPE", "AZCLI");
            }
        }
        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// Fields read from the tool's final job summary.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: Option<String>,
    pub bytes_transferred: Option<u64>,
    pub skipped: Option<u64>,
    pub final_status: Option<String>,
    pub last_error: Option<String>,
}

impl JobSummary {
    fn observe(&mut self, line: &str) {
        let line = line.trim();
        if let Some(job_id) = line
            .strip_prefix("Job ")
            .and_then(|rest| rest.strip_suffix(" has started"))
        {
            self.job_id = Some(job_id.to_string());
        } else if let Some(bytes) = line.strip_prefix("Total Number of Bytes Transferred:") {
            self.bytes_transferred = bytes.trim().parse().ok();
        } else if let Some(skipped) = line.strip_prefix("Number of File Transfers Skipped:") {
            self.skipped = skipped.trim().parse().ok();
        } else if let Some(status) = line.strip_prefix("Final Job Status:") {
            self.final_status = Some(status.trim().to_string());
        } else if line.contains("failed to perform copy command") || line.starts_with("RESPONSE ERROR") {
            self.last_error = Some(line.to_string());
        }
    }

    pub fn parse(output: &str) -> Self {
        let mut summary = Self::default();
        output.lines().for_each(|line| summary.observe(line));
        summary
    }
}

fn classify_failure(summary: &JobSummary, status: std::process::ExitStatus) -> TransferError {
    let reason = summary
        .last_error
        .clone()
        .or_else(|| summary.final_status.clone().map(|status| format!("job status {status}")))
        .unwrap_or_else(|| format!("azcopy exited with {status}"));
    let denied = ["AuthorizationPermissionMismatch", "AuthorizationFailure", "403"]
        .iter()
        .any(|marker| reason.contains(marker));
    if denied {
        TransferError::PermissionDenied(reason)
    } else if reason.contains("404") || reason.contains("NotFound") {
        TransferError::NotFound(reason)
    } else {
        TransferError::BulkCopy {
            reason,
            transient: true,
        }
    }
}

/// One line of `azcopy jobs show --output-type=json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobMessage {
    message_type: String,
    message_content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TransferList {
    #[serde(default)]
    details: Vec<TransferDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TransferDetail {
    src: String,
}

/// Paths of `job.include` whose transfers appear in a transfer listing.
fn listed_paths(job: &BulkJob, listing: &str) -> Vec<String> {
    let listed: HashSet<String> = listing
        .lines()
        .filter_map(|line| serde_json::from_str::<JobMessage>(line).ok())
        .filter(|message| message.message_type == "ListJobTransfers")
        .filter_map(|message| serde_json::from_str::<TransferList>(&message.message_content).ok())
        .flat_map(|list| list.details)
        .filter_map(|detail| url::Url::parse(&detail.src).ok())
        .map(|src| src.path().to_string())
        .collect();
    let Ok(base) = url::Url::parse(&job.source) else {
        return Vec::new();
    };
    job.include
        .iter()
        .filter(|path| {
            let mut url = base.clone();
            let Ok(mut segments) = url.path_segments_mut() else {
                return false;
            };
            segments.pop_if_empty().extend(path.split('/'));
            drop(segments);
            listed.contains(url.path())
        })
        .cloned()
        .collect()
}

impl AzCopy {
    /// Include-list paths the finished job `job_id` skipped.
    async fn skipped_transfers(&self, job: &BulkJob, job_id: &str) -> Vec<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(["jobs", "show", job_id, "--with-status=Skipped", "--output-type=json"])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                listed_paths(job, &String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                tracing::warn!("cannot list skipped transfers of job {job_id}: azcopy exited with {}", output.status);
                Vec::new()
            }
            Err(error) => {
                tracing::warn!("cannot list skipped transfers of job {job_id}: {error}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl BulkCopy for AzCopy {
    #[tracing::instrument(skip_all, fields(files = job.include.len()))]
    async fn copy(&self, job: &BulkJob) -> Result<BulkOutcome, TransferError> {
        let list = if job.include.is_empty() {
            None
        } else {
            let file = tempfile::NamedTempFile::new()
                .map_err(|err| TransferError::Other(format!("cannot create file list: {err}")))?;
            tokio::fs::write(file.path(), job.include.join("\n"))
                .await
                .map_err(|err| TransferError::Other(format!("cannot write file list: {err}")))?;
            Some(file)
        };
        let mut child = self
            .command(job, list.as_ref().map(tempfile::NamedTempFile::path))
            .spawn()
            .map_err(|err| TransferError::BulkCopy {
                reason: format!("cannot run {:?}: {err}", self.program),
                transient: false,
            })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let read_stdout = async {
            let mut summary = JobSummary::default();
            if let Some(stdout) = stdout {
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "azcopy", "{line}");
                    summary.observe(&line);
                }
            }
            summary
        };
        let read_stderr = async {
            if let Some(stderr) = stderr {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "azcopy", "{line}");
                }
            }
        };
        let (summary, ()) = tokio::join!(read_stdout, read_stderr);
        let status = child
            .wait()
            .await
            .map_err(|err| TransferError::BulkCopy {
                reason: format!("lost track of azcopy: {err}"),
                transient: true,
            })?;
        let completed = matches!(
            summary.final_status.as_deref(),
            Some("Completed") | Some("CompletedWithSkipped")
        );
        if status.success() && (completed || summary.final_status.is_none()) {
            let skipped_count = summary.skipped.unwrap_or(0);
            let skipped = match &summary.job_id {
                Some(job_id) if skipped_count > 0 && !job.include.is_empty() => {
                    self.skipped_transfers(job, job_id).await
                }
                _ => Vec::new(),
            };
            Ok(BulkOutcome {
                bytes_transferred: summary.bytes_transferred.unwrap_or(0),
                exit_status: summary
                    .final_status
                    .unwrap_or_else(|| "Completed".to_string()),
                unnamed_skips: skipped_count.saturating_sub(skipped.len() as u64),
                skipped,
            })
        } else {
            Err(classify_failure(&summary, status))
        }
    }
}
