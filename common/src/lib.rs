//! Shared runtime plumbing for the azreplica binary
//!
//! This crate owns everything that is not replication logic: building the tokio runtime,
//! installing the tracing subscriber, configuring the throttle, and drawing live progress.
//!
//! # Entry point
//!
//! [`run`] wraps an async closure with all of the above and returns its summary, or `None`
//! if the closure (or setup) failed. The error is printed to stderr unless `quiet` is set.
//!
//! # Logging
//!
//! Console verbosity is selected with `-v` flags. Without them the level comes from
//! `TracingConfig::log_level` (defaulting to errors only). The HTTP stack logs under its own
//! level so wire-level chatter can be enabled independently of application logs.

use std::sync::LazyLock;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod config;
pub mod progress;
pub mod version;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TracingConfig};

static PROGRESS: LazyLock<progress::Progress> = LazyLock::new(progress::Progress::new);

pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

/// Targets that belong to the HTTP client stack rather than to azreplica itself.
const SDK_TARGETS: &[&str] = &["reqwest", "hyper", "hyper_util", "rustls", "h2"];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(name = "auto", alias = "Auto")]
    Auto,
    #[value(name = "progress-bar", alias = "ProgressBar")]
    ProgressBar,
    #[value(name = "text-updates", alias = "TextUpdates")]
    TextUpdates,
}

impl ProgressType {
    fn resolve(self) -> Self {
        match self {
            ProgressType::Auto => {
                if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
                    ProgressType::ProgressBar
                } else {
                    ProgressType::TextUpdates
                }
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Refresh interval, e.g. "500ms" or "10s"; defaults depend on the progress type
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn delay(&self, resolved: ProgressType) -> anyhow::Result<std::time::Duration> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay {delay:?}: {err}")),
            None => Ok(match resolved {
                ProgressType::ProgressBar => std::time::Duration::from_millis(200),
                _ => std::time::Duration::from_secs(10),
            }),
        }
    }
}

/// Parses a log level name, accepting the spellings commonly used in deployment configs.
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => Some(LevelFilter::OFF),
        "error" | "critical" | "fatal" => Some(LevelFilter::ERROR),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "trace" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

fn app_level(output: &OutputConfig, config: &TracingConfig) -> anyhow::Result<LevelFilter> {
    if output.quiet {
        return Ok(LevelFilter::OFF);
    }
    Ok(match output.verbose {
        0 => match &config.log_level {
            Some(level) => parse_level(level)
                .ok_or_else(|| anyhow::anyhow!("unrecognized log level {level:?}"))?,
            None => LevelFilter::ERROR,
        },
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    })
}

fn sdk_level(output: &OutputConfig, config: &TracingConfig) -> anyhow::Result<LevelFilter> {
    if output.quiet {
        return Ok(LevelFilter::OFF);
    }
    match &config.sdk_log_level {
        Some(level) => {
            parse_level(level).ok_or_else(|| anyhow::anyhow!("unrecognized log level {level:?}"))
        }
        None => Ok(LevelFilter::WARN),
    }
}

fn filter_directives(app: LevelFilter, sdk: LevelFilter) -> String {
    let app = app.to_string().to_ascii_lowercase();
    let sdk = sdk.to_string().to_ascii_lowercase();
    let mut directives = vec![app];
    directives.extend(SDK_TARGETS.iter().map(|target| format!("{target}={sdk}")));
    directives.join(",")
}

fn init_tracing(output: &OutputConfig, config: &TracingConfig) -> anyhow::Result<()> {
    let directives = filter_directives(app_level(output, config)?, sdk_level(output, config)?);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::try_new(&directives)?);
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .map_err(|err| anyhow::anyhow!("cannot open log file {path:?}: {err}"))?;
            // the file always gets info-level logs so a failed run can be diagnosed afterwards
            let level = app_level(output, config)?.max(LevelFilter::INFO);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(tracing_subscriber::EnvFilter::try_new(filter_directives(
                        level,
                        sdk_level(output, config)?,
                    ))?),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

async fn show_progress(
    settings: ProgressSettings,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let progress_type = settings.progress_type.resolve();
    let delay = settings.delay(progress_type)?;
    let mut printer = progress::ProgressPrinter::new(get_progress());
    let bar = match progress_type {
        ProgressType::ProgressBar => {
            let bar = indicatif::ProgressBar::new_spinner();
            if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner} {elapsed} {msg}") {
                bar.set_style(style);
            }
            Some(bar)
        }
        _ => None,
    };
    let mut ticker = tokio::time::interval(delay);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let text = printer.print();
                match &bar {
                    Some(bar) => bar.set_message(text),
                    None => eprintln!("{text}"),
                }
            }
        }
    }
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(())
}

/// Runs `func` on a freshly built tokio runtime with logging, throttling and progress set up.
///
/// Returns the summary on success. On failure the error is printed (with its full context
/// chain) unless quiet mode is enabled, and `None` is returned.
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_tracing(&output, &tracing_config) {
        if !output.quiet {
            eprintln!("{error:#}");
        }
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to build the tokio runtime: {error}");
            return None;
        }
    };
    let start = std::time::Instant::now();
    let result = runtime.block_on(async move {
        throttle::set_max_in_flight(throttle_config.max_in_flight);
        if throttle_config.requests_throttle > 0 {
            let (tokens, interval) = throttle::replenish_schedule(throttle_config.requests_throttle);
            throttle::init_request_tokens(tokens);
            tokio::spawn(throttle::run_request_replenish_thread(tokens, interval));
        }
        let progress_task = progress.map(|settings| {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
            (stop_tx, tokio::spawn(show_progress(settings, stop_rx)))
        });
        let result = func().await;
        if let Some((stop_tx, task)) = progress_task {
            // the receiver is gone only if the printer already exited
            let _ = stop_tx.send(());
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::warn!("progress display failed: {error:#}"),
                Err(error) => tracing::warn!("progress display panicked: {error}"),
            }
        }
        result
    });
    match result {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
                let elapsed = std::time::Duration::from_millis(start.elapsed().as_millis() as u64);
                println!("walltime: {}", humantime::format_duration(elapsed));
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
