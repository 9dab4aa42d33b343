use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct TlsCounter {
    // each worker thread bumps its own slot, readers fold over all of them
    count: thread_local::ThreadLocal<std::sync::atomic::AtomicU64>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        self.count
            .get_or(|| std::sync::atomic::AtomicU64::new(0))
            .fetch_add(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .map(|slot| slot.load(std::sync::atomic::Ordering::Relaxed))
            .sum()
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument(skip(self))]
    pub fn get(&self) -> Status {
        // finished is read first so a concurrent guard can't make pending negative
        let finished = self.finished.get();
        let mut status = Status {
            started: self.started.get(),
            finished,
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Live counters for a replication run.
///
/// These only feed the progress display; the authoritative numbers are in the run report.
pub struct Progress {
    pub actions: ProgressCounter,
    pub bytes_transferred: TlsCounter,
    pub resources_created: TlsCounter,
    pub entries_copied: TlsCounter,
    pub entries_skipped: TlsCounter,
    pub entries_failed: TlsCounter,
    pub retries: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            actions: Default::default(),
            bytes_transferred: Default::default(),
            resources_created: Default::default(),
            entries_copied: Default::default(),
            entries_skipped: Default::default(),
            entries_failed: Default::default(),
            retries: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_actions: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_actions: progress.actions.get().finished,
            last_bytes: progress.bytes_transferred.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let actions = self.progress.actions.get();
        let total_secs = self.progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_secs = (time_now - self.last_update)
            .as_secs_f64()
            .max(f64::EPSILON);
        let average_rate = actions.finished as f64 / total_secs;
        let current_rate = actions.finished.saturating_sub(self.last_actions) as f64 / curr_secs;
        let bytes = self.progress.bytes_transferred.get();
        let average_bytes_rate = bytes as f64 / total_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_secs;
        self.last_actions = actions.finished;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "-----------------------\n\
            ACTIONS:\n\
            pending: {:>10}\n\
            done:    {:>10}\n\
            average: {:>10.2} actions/s\n\
            current: {:>10.2} actions/s\n\
            -----------------------\n\
            TRANSFERRED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            -----------------------\n\
            resources created: {:>10}\n\
            entries copied:    {:>10}\n\
            entries skipped:   {:>10}\n\
            entries failed:    {:>10}\n\
            retries:           {:>10}",
            actions.started - actions.finished,
            actions.finished,
            average_rate,
            current_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.resources_created.get(),
            self.progress.entries_copied.get(),
            self.progress.entries_skipped.get(),
            self.progress.entries_failed.get(),
            self.progress.retries.get(),
        )
    }
}
