use anyhow::Context;
use clap::Parser;
use enum_map::EnumMap;
use tokio_util::sync::CancellationToken;

use azreplica::config::KindSettings;
use azreplica::credential::AuthSettings;
use azreplica::orchestrator::OrchestratorSettings;
use azreplica::retry::RetryPolicy;
use azreplica::{FATAL_EXIT_CODE, Kind, Settings, Summary};

/// Accepts `true`/`false` in any case, the way deployment variables are usually written.
fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" | "" => Ok(false),
        other => Err(format!("expected true or false, got {other:?}")),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "azreplica",
    version,
    about = "Replicate Azure Storage blobs, queues, tables and file shares between accounts",
    long_about = "`azreplica` copies the contents of one storage account to another: blob containers, queues, tables and file shares.

Replication is additive: entries missing at the destination are copied, existing ones are skipped (or replaced with the per-kind overwrite flag) and nothing is ever deleted. Every option can also be given through its environment variable; flags take precedence.

Accounts may be given as a bare name (`acct`), a public endpoint (`https://acct.blob.core.windows.net`) or a private endpoint host (`acct.privatelink.blob.core.windows.net`).

EXIT STATUS:
    0  every action succeeded or was skipped
    1  some actions failed
    2  every action failed
    3  nothing ran (configuration or authentication error)

EXAMPLES:
    # Copy all containers and tables between two accounts
    azreplica --source-blob src --destination-blob dst --source-table src --destination-table dst

    # Copy one file share using shared access signatures
    azreplica --source-file-share-connection-string \"$SRC\" --destination-file-share-connection-string \"$DST\" --file-share-name docs"
)]
struct Args {
    // Identity
    /// Tenant of the service principal
    #[arg(long, env = "ARM_TENANT_ID", hide_env_values = true, help_heading = "Identity")]
    tenant_id: Option<String>,

    /// Client (application) id of the service principal
    #[arg(long, env = "ARM_CLIENT_ID", hide_env_values = true, help_heading = "Identity")]
    client_id: Option<String>,

    /// Client secret of the service principal
    #[arg(long, env = "ARM_CLIENT_SECRET", hide_env_values = true, help_heading = "Identity")]
    client_secret: Option<String>,

    /// Client id of a user-assigned managed identity (system-assigned when unset)
    #[arg(
        long,
        env = "AZURE_MANAGED_IDENTITY_CLIENT_ID",
        hide_env_values = true,
        help_heading = "Identity"
    )]
    managed_identity_client_id: Option<String>,

    // Blob
    /// Source account for blob containers
    #[arg(long, env = "AZURE_SOURCE_STORAGE_ACCOUNT_BLOB", value_name = "ACCOUNT", help_heading = "Blob")]
    source_blob: Option<String>,

    /// Destination account for blob containers
    #[arg(long, env = "AZURE_DESTINATION_STORAGE_ACCOUNT_BLOB", value_name = "ACCOUNT", help_heading = "Blob")]
    destination_blob: Option<String>,

    /// Replace blobs that already exist at the destination
    #[arg(
        long,
        env = "OVERWRITE_STORAGE_ACCOUNT_BLOB",
        value_parser = parse_flag,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_name = "BOOL",
        help_heading = "Blob"
    )]
    overwrite_blob: bool,

    /// Replicate only this container
    #[arg(long, env = "STORAGE_BLOB_NAME_SOURCE", value_name = "NAME", help_heading = "Blob")]
    blob_container: Option<String>,

    // Queue
    /// Source account for queues
    #[arg(long, env = "AZURE_SOURCE_STORAGE_ACCOUNT_QUEUE", value_name = "ACCOUNT", help_heading = "Queue")]
    source_queue: Option<String>,

    /// Destination account for queues
    #[arg(long, env = "AZURE_DESTINATION_STORAGE_ACCOUNT_QUEUE", value_name = "ACCOUNT", help_heading = "Queue")]
    destination_queue: Option<String>,

    /// Replicate only this queue
    #[arg(long, env = "STORAGE_QUEUE_NAME_SOURCE", value_name = "NAME", help_heading = "Queue")]
    queue_name: Option<String>,

    /// How long received messages stay invisible at the source
    #[arg(
        long,
        default_value = "10min",
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Queue"
    )]
    queue_visibility_timeout: std::time::Duration,

    // Table
    /// Source account for tables
    #[arg(long, env = "AZURE_SOURCE_STORAGE_ACCOUNT_TABLE", value_name = "ACCOUNT", help_heading = "Table")]
    source_table: Option<String>,

    /// Destination account for tables
    #[arg(long, env = "AZURE_DESTINATION_STORAGE_ACCOUNT_TABLE", value_name = "ACCOUNT", help_heading = "Table")]
    destination_table: Option<String>,

    /// Replace entities that already exist at the destination
    #[arg(
        long,
        env = "OVERWRITE_STORAGE_ACCOUNT_TABLE",
        value_parser = parse_flag,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_name = "BOOL",
        help_heading = "Table"
    )]
    overwrite_table: bool,

    /// Replicate only this table
    #[arg(long, env = "STORAGE_TABLE_NAME_SOURCE", value_name = "NAME", help_heading = "Table")]
    table_name: Option<String>,

    // File share
    /// Source account for file shares
    #[arg(long, env = "SOURCE_STORAGE_ACCOUNT_FILE", value_name = "ACCOUNT", help_heading = "File share")]
    source_file_share: Option<String>,

    /// Destination account for file shares
    #[arg(long, env = "DESTINATION_STORAGE_ACCOUNT_FILE", value_name = "ACCOUNT", help_heading = "File share")]
    destination_file_share: Option<String>,

    /// Source connection string with a shared access signature (takes precedence over the account)
    #[arg(
        long,
        env = "AZURE_SOURCE_CONNECTION_STRING_FILE_SHARE",
        hide_env_values = true,
        value_name = "CONNECTION_STRING",
        help_heading = "File share"
    )]
    source_file_share_connection_string: Option<String>,

    /// Destination connection string with a shared access signature
    #[arg(
        long,
        env = "AZURE_DEST_CONNECTION_STRING_FILE_SHARE",
        hide_env_values = true,
        value_name = "CONNECTION_STRING",
        help_heading = "File share"
    )]
    destination_file_share_connection_string: Option<String>,

    /// Replace files that already exist at the destination
    #[arg(
        long,
        env = "OVERWRITE_STORAGE_ACCOUNT_FILE",
        value_parser = parse_flag,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_name = "BOOL",
        help_heading = "File share"
    )]
    overwrite_file_share: bool,

    /// Replicate only this share
    #[arg(long, env = "STORAGE_FILE_SHARE_NAME_SOURCE", value_name = "NAME", help_heading = "File share")]
    file_share_name: Option<String>,

    /// Files up to this size are copied directly instead of through azcopy
    #[arg(long, default_value = "32MiB", value_name = "SIZE", help_heading = "File share")]
    stream_copy_threshold: bytesize::ByteSize,

    // Run
    /// Kinds to replicate, comma separated (default: every kind with an account configured)
    #[arg(
        long,
        env = "REPLICA_KINDS",
        value_delimiter = ',',
        value_name = "KINDS",
        help_heading = "Run"
    )]
    kinds: Vec<Kind>,

    /// Attempts per action, including the first one
    #[arg(long, env = "REPLICA_MAX_ATTEMPTS", default_value = "3", value_name = "N", help_heading = "Run")]
    max_attempts: u32,

    /// Delay before the first retry; doubles with every further retry
    #[arg(
        long,
        default_value = "500ms",
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Run"
    )]
    initial_backoff: std::time::Duration,

    /// Upper bound for the delay between retries
    #[arg(
        long,
        default_value = "30s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Run"
    )]
    max_backoff: std::time::Duration,

    /// Timeout of a single data-plane call
    #[arg(
        long,
        env = "REPLICA_CALL_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION",
        help_heading = "Run"
    )]
    call_timeout: std::time::Duration,

    /// Path of the azcopy executable
    #[arg(long, env = "AZCOPY_PATH", default_value = "azcopy", value_name = "PATH", help_heading = "Run")]
    azcopy: std::path::PathBuf,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for the progress bar and 10s for text updates. If specified, --progress flag is implied.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Write the final summary as JSON to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    summary_json: Option<std::path::PathBuf>,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: REPLICA_LOG_LEVEL or ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors or print the summary
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Log level used without -v, and for the log file
    #[arg(long, env = "REPLICA_LOG_LEVEL", value_name = "LEVEL", help_heading = "Progress & output")]
    log_level: Option<String>,

    /// Log level of the HTTP client stack
    #[arg(long, env = "AZURE_LOG_LEVEL", value_name = "LEVEL", help_heading = "Progress & output")]
    sdk_log_level: Option<String>,

    /// Also write an uncolored log to this file (truncated at start)
    #[arg(long, env = "REPLICA_LOG_FILE", value_name = "PATH", help_heading = "Progress & output")]
    log_file: Option<std::path::PathBuf>,

    /// Print build information as JSON and exit
    #[arg(long, help_heading = "Progress & output")]
    build_info: bool,

    // Performance & throttling
    /// Actions executing at the same time within one resource
    #[arg(long, default_value = "16", value_name = "N", help_heading = "Performance & throttling")]
    resource_workers: usize,

    /// Actions executing at the same time across the whole run (0 = no limit)
    #[arg(long, default_value = "64", value_name = "N", help_heading = "Performance & throttling")]
    max_in_flight: usize,

    /// Resources of one kind replicated at the same time
    #[arg(long, default_value = "4", value_name = "N", help_heading = "Performance & throttling")]
    max_parallel_resources: usize,

    /// Throttle data-plane requests per second, 0 means no throttle
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Performance & throttling")]
    requests_throttle: usize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Advanced settings")]
    max_blocking_threads: usize,
}

impl Args {
    fn settings(&self) -> Settings {
        let mut kinds: EnumMap<Kind, KindSettings> = EnumMap::default();
        kinds[Kind::Blob] = KindSettings {
            source: self.source_blob.clone(),
            destination: self.destination_blob.clone(),
            overwrite: self.overwrite_blob,
            resource_name: self.blob_container.clone(),
            ..Default::default()
        };
        kinds[Kind::Queue] = KindSettings {
            source: self.source_queue.clone(),
            destination: self.destination_queue.clone(),
            resource_name: self.queue_name.clone(),
            ..Default::default()
        };
        kinds[Kind::Table] = KindSettings {
            source: self.source_table.clone(),
            destination: self.destination_table.clone(),
            overwrite: self.overwrite_table,
            resource_name: self.table_name.clone(),
            ..Default::default()
        };
        kinds[Kind::FileShare] = KindSettings {
            source: self.source_file_share.clone(),
            destination: self.destination_file_share.clone(),
            source_connection_string: self.source_file_share_connection_string.clone(),
            destination_connection_string: self.destination_file_share_connection_string.clone(),
            overwrite: self.overwrite_file_share,
            resource_name: self.file_share_name.clone(),
        };
        Settings {
            auth: AuthSettings {
                tenant_id: self.tenant_id.clone(),
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
                managed_identity_client_id: self.managed_identity_client_id.clone(),
            },
            kinds,
            requested: self.kinds.clone(),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                initial_backoff: self.initial_backoff,
                max_backoff: self.max_backoff,
            },
            call_timeout: self.call_timeout,
            orchestrator: OrchestratorSettings {
                resource_workers: self.resource_workers,
                max_parallel_resources: self.max_parallel_resources,
            },
            stream_copy_threshold: self.stream_copy_threshold.as_u64(),
            queue_visibility_timeout: self.queue_visibility_timeout,
            azcopy: self.azcopy.clone(),
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<Summary> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, letting in-flight actions finish");
            interrupt.cancel();
        }
    });
    let summary = azreplica::replicate(&args.settings(), cancel)
        .await
        .context("replication did not start")?;
    if let Some(path) = &args.summary_json {
        let json = serde_json::to_string_pretty(&summary)?;
        if let Err(error) = tokio::fs::write(path, json).await {
            tracing::error!("failed to write the summary to {path:?}: {error}");
        }
    }
    Ok(summary)
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    if args.build_info {
        println!("{}", common::version::BuildInfo::current().to_json()?);
        return Ok(());
    }
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: !args.quiet,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_in_flight: args.max_in_flight,
        requests_throttle: args.requests_throttle,
    };
    let tracing = common::TracingConfig {
        log_level: args.log_level.clone(),
        sdk_log_level: args.sdk_log_level.clone(),
        log_file: args.log_file.clone(),
    };
    let summary = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        tracing,
        func,
    );
    match summary {
        Some(summary) => std::process::exit(summary.status().exit_code()),
        None => std::process::exit(FATAL_EXIT_CODE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_any_case() {
        assert_eq!(parse_flag("False"), Ok(false));
        assert_eq!(parse_flag("TRUE"), Ok(true));
        assert!(parse_flag("yes").is_err());
    }

    #[test]
    fn arguments_map_to_settings() {
        let args = Args::try_parse_from([
            "azreplica",
            "--source-blob",
            "src",
            "--destination-blob",
            "dst",
            "--overwrite-blob",
            "--overwrite-table=FALSE",
            "--kinds",
            "blob,file-share",
            "--stream-copy-threshold",
            "1MiB",
            "--max-backoff",
            "1m",
        ])
        .unwrap();
        let settings = args.settings();
        assert!(settings.kinds[Kind::Blob].overwrite);
        assert!(!settings.kinds[Kind::Table].overwrite);
        assert_eq!(settings.requested, [Kind::Blob, Kind::FileShare]);
        assert_eq!(settings.stream_copy_threshold, 1024 * 1024);
        assert_eq!(settings.retry.max_backoff, std::time::Duration::from_secs(60));
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
