//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for data-plane load
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of actions executing at once across the process (0 = no limit)
    pub max_in_flight: usize,
    /// Data-plane requests per second (0 = no throttle)
    pub requests_throttle: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Log destinations and levels
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Level used when no -v flag is given, e.g. "info" or "WARNING"
    pub log_level: Option<String>,
    /// Level for the HTTP stack (reqwest, hyper, rustls)
    pub sdk_log_level: Option<String>,
    /// Additional uncolored log file, truncated at start
    pub log_file: Option<std::path::PathBuf>,
}
