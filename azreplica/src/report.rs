//! Run-wide result aggregation
//!
//! Workers append results concurrently; each worker thread writes to its own shard so appends
//! never contend with each other. Aggregation happens once, in [`RunReport::finalize`], and is
//! order-independent.

use std::sync::Mutex;

use enum_map::EnumMap;
use serde::Serialize;

use crate::account::Kind;
use crate::model::{ActionResult, Outcome};

/// Exit code for errors that stop the run before any action executes.
pub const FATAL_EXIT_CODE: i32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::PartialFailure => 1,
            RunStatus::Failure => 2,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial failure",
            RunStatus::Failure => "failure",
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl Tally {
    pub fn total(&self) -> u64 {
        self.succeeded + self.skipped + self.failed
    }
}

impl std::ops::Add for Tally {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            succeeded: self.succeeded + other.succeeded,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }
}

/// A failed action with enough context to find it again.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FailureRecord {
    pub kind: Kind,
    pub resource: String,
    pub entry: Option<String>,
    pub reason: String,
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "{} {}/{}: {}", self.kind, self.resource, entry, self.reason),
            None => write!(f, "{} {}: {}", self.kind, self.resource, self.reason),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub counts: EnumMap<Kind, Tally>,
    pub bytes_transferred: u64,
    pub retries: u64,
    pub failures: Vec<FailureRecord>,
}

impl Summary {
    fn from_result(result: &ActionResult) -> Self {
        let mut summary = Summary {
            bytes_transferred: result.bytes,
            retries: u64::from(result.attempts.saturating_sub(1)),
            ..Default::default()
        };
        let tally = &mut summary.counts[result.kind];
        match &result.outcome {
            Outcome::Succeeded => tally.succeeded += 1,
            Outcome::SkippedExisting => tally.skipped += 1,
            Outcome::Failed(reason) => {
                tally.failed += 1;
                summary.failures.push(FailureRecord {
                    kind: result.kind,
                    resource: result.resource.clone(),
                    entry: result.entry.clone(),
                    reason: reason.clone(),
                });
            }
        }
        summary
    }

    pub fn total(&self) -> Tally {
        self.counts.values().fold(Tally::default(), |acc, tally| acc + *tally)
    }

    pub fn status(&self) -> RunStatus {
        let total = self.total();
        if total.failed == 0 {
            RunStatus::Success
        } else if total.succeeded + total.skipped > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Failure
        }
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        for (kind, tally) in other.counts {
            self.counts[kind] = self.counts[kind] + tally;
        }
        self.bytes_transferred += other.bytes_transferred;
        self.retries += other.retries;
        self.failures.extend(other.failures);
        // sorted so that the result does not depend on completion order
        self.failures.sort();
        self
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<12} {:>10} {:>10} {:>10}", "kind", "succeeded", "skipped", "failed")?;
        for (kind, tally) in &self.counts {
            if tally.total() == 0 {
                continue;
            }
            writeln!(
                f,
                "{:<12} {:>10} {:>10} {:>10}",
                kind.to_string(),
                tally.succeeded,
                tally.skipped,
                tally.failed
            )?;
        }
        let total = self.total();
        writeln!(
            f,
            "{:<12} {:>10} {:>10} {:>10}",
            "total", total.succeeded, total.skipped, total.failed
        )?;
        writeln!(f, "transferred: {}", bytesize::ByteSize(self.bytes_transferred))?;
        writeln!(f, "retries: {}", self.retries)?;
        if !self.failures.is_empty() {
            writeln!(f, "failures:")?;
            for failure in &self.failures {
                writeln!(f, "  {failure}")?;
            }
        }
        write!(f, "status: {}", self.status())
    }
}

/// Append-only collection of action results for one run.
#[derive(Default)]
pub struct RunReport {
    shards: thread_local::ThreadLocal<Mutex<Vec<ActionResult>>>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: ActionResult) {
        let progress = common::get_progress();
        match &result.outcome {
            Outcome::Succeeded if result.action == crate::model::ActionKind::Create => {}
            Outcome::Succeeded => progress.entries_copied.inc(),
            Outcome::SkippedExisting => progress.entries_skipped.inc(),
            Outcome::Failed(_) => progress.entries_failed.inc(),
        }
        progress.bytes_transferred.add(result.bytes);
        let shard = self.shards.get_or(|| Mutex::new(Vec::new()));
        shard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(result);
    }

    /// Consumes the report; nothing can be recorded afterwards.
    pub fn finalize(self) -> Summary {
        self.shards
            .into_iter()
            .flat_map(|shard| shard.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner))
            .map(|result| Summary::from_result(&result))
            .fold(Summary::default(), |acc, summary| acc + summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionKind;
    use proptest::prelude::*;

    fn result(kind: Kind, outcome: Outcome, attempts: u32) -> ActionResult {
        ActionResult {
            kind,
            action: ActionKind::Copy,
            resource: "r".into(),
            entry: Some(format!("{outcome:?}-{attempts}")),
            outcome,
            attempts,
            elapsed: std::time::Duration::ZERO,
            bytes: u64::from(attempts) * 10,
        }
    }

    fn arb_result() -> impl Strategy<Value = ActionResult> {
        let kind = prop_oneof![
            Just(Kind::Blob),
            Just(Kind::Queue),
            Just(Kind::Table),
            Just(Kind::FileShare)
        ];
        let outcome = prop_oneof![
            Just(Outcome::Succeeded),
            Just(Outcome::SkippedExisting),
            "[a-c]{1,2}".prop_map(Outcome::Failed),
        ];
        (kind, outcome, 1u32..4).prop_map(|(kind, outcome, attempts)| result(kind, outcome, attempts))
    }

    fn summarize(results: Vec<ActionResult>) -> Summary {
        let report = RunReport::new();
        results.into_iter().for_each(|r| report.record(r));
        report.finalize()
    }

    proptest! {
        #[test]
        fn aggregation_is_order_independent(
            (results, shuffled) in proptest::collection::vec(arb_result(), 0..40)
                .prop_flat_map(|results| {
                    let shuffled = Just(results.clone()).prop_shuffle();
                    (Just(results), shuffled)
                })
        ) {
            prop_assert_eq!(summarize(results), summarize(shuffled));
        }
    }

    #[test]
    fn concurrent_appends_are_all_kept() {
        let report = RunReport::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        report.record(result(Kind::Blob, Outcome::Succeeded, 1));
                    }
                });
            }
        });
        assert_eq!(report.finalize().counts[Kind::Blob].succeeded, 800);
    }

    #[test]
    fn status_rules() {
        assert_eq!(summarize(vec![]).status(), RunStatus::Success);
        assert_eq!(
            summarize(vec![result(Kind::Blob, Outcome::SkippedExisting, 1)]).status(),
            RunStatus::Success
        );
        let partial = summarize(vec![
            result(Kind::Blob, Outcome::Succeeded, 1),
            result(Kind::Queue, Outcome::Failed("network".into()), 3),
        ]);
        assert_eq!(partial.status(), RunStatus::PartialFailure);
        assert_eq!(partial.status().exit_code(), 1);
        let failed = summarize(vec![result(Kind::Table, Outcome::Failed("x".into()), 1)]);
        assert_eq!(failed.status(), RunStatus::Failure);
        assert_eq!(failed.status().exit_code(), 2);
    }

    #[test]
    fn table_lists_failures() {
        let summary = summarize(vec![
            result(Kind::Table, Outcome::Succeeded, 1),
            ActionResult {
                entry: Some("(eu, 1)".into()),
                resource: "orders".into(),
                ..result(Kind::Table, Outcome::Failed("parent resource missing".into()), 1)
            },
        ]);
        let text = summary.to_string();
        assert!(text.contains("table"), "{text}");
        assert!(text.contains("table orders/(eu, 1): parent resource missing"), "{text}");
        assert!(text.ends_with("status: partial failure"), "{text}");
        assert!(!text.contains("queue"), "{text}");
    }
}
