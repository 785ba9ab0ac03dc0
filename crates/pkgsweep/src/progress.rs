use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::failure::{FailureKind, FailureRecord};
use crate::filter::SkipReason;
use crate::package::PackageRef;

/// Lifecycle status of one package in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

/// Failure details persisted alongside a `failed` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressEntry {
    pub status: ItemStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    pub updated_at: u64,
}

impl ProgressEntry {
    /// Terminal entries are never reprocessed without `force`.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.status {
            ItemStatus::Succeeded => true,
            ItemStatus::Failed => self
                .failure
                .as_ref()
                .is_none_or(|f| !f.retryable || self.attempts >= max_attempts),
            ItemStatus::Pending | ItemStatus::Skipped => false,
        }
    }
}

/// Position in the catalog of the last recorded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cursor {
    pub page: u32,
    /// Zero-based index of the item within its page.
    pub index: usize,
}

/// Summary counters over the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Counters {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl Counters {
    pub fn total(&self) -> u64 {
        self.pending + self.succeeded + self.failed + self.skipped
    }
}

/// Outcome of one item, as handed to [`ProgressState::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded { output: PathBuf },
    Failed(FailureRecord),
    Skipped(SkipReason),
}

/// In-memory ledger: per-package status plus the catalog cursor.
///
/// Loaded once at startup and threaded through the driver, which is its only
/// writer. Persistence lives in the store crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    entries: BTreeMap<PackageRef, ProgressEntry>,
    cursor: Option<Cursor>,
    started_at: u64,
    updated_at: u64,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new(now_epoch_secs())
    }
}

impl ProgressState {
    pub fn new(started_at: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            cursor: None,
            started_at,
            updated_at: started_at,
        }
    }

    /// Rebuild a state from persisted parts.
    pub fn from_parts(
        entries: BTreeMap<PackageRef, ProgressEntry>,
        cursor: Option<Cursor>,
        started_at: u64,
        updated_at: u64,
    ) -> Self {
        Self {
            entries,
            cursor,
            started_at,
            updated_at,
        }
    }

    pub fn get(&self, package: &PackageRef) -> Option<&ProgressEntry> {
        self.entries.get(package)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PackageRef, &ProgressEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn attempts(&self, package: &PackageRef) -> u32 {
        self.entries.get(package).map_or(0, |e| e.attempts)
    }

    pub fn counters(&self) -> Counters {
        self.entries
            .values()
            .fold(Counters::default(), |mut acc, entry| {
                match entry.status {
                    ItemStatus::Pending => acc.pending += 1,
                    ItemStatus::Succeeded => acc.succeeded += 1,
                    ItemStatus::Failed => acc.failed += 1,
                    ItemStatus::Skipped => acc.skipped += 1,
                }
                acc
            })
    }

    /// Mark an item as in flight. Its previous attempt count is kept.
    pub fn mark_pending(&mut self, package: &PackageRef, now: u64) {
        let attempts = self.attempts(package);
        self.entries.insert(
            package.clone(),
            ProgressEntry {
                status: ItemStatus::Pending,
                attempts,
                failure: None,
                skip_reason: None,
                output: None,
                updated_at: now,
            },
        );
        self.updated_at = now;
    }

    /// Record the decided outcome of an item and advance the cursor to it.
    ///
    /// Replaces any earlier entry for the same package, so each package
    /// appears at most once.
    pub fn record(&mut self, package: &PackageRef, cursor: Cursor, outcome: &ItemOutcome, now: u64) {
        let previous_attempts = self.attempts(package);
        let entry = match outcome {
            ItemOutcome::Succeeded { output } => ProgressEntry {
                status: ItemStatus::Succeeded,
                attempts: previous_attempts + 1,
                failure: None,
                skip_reason: None,
                output: Some(output.clone()),
                updated_at: now,
            },
            ItemOutcome::Failed(record) => ProgressEntry {
                status: ItemStatus::Failed,
                attempts: record.attempt.max(previous_attempts + 1),
                failure: Some(FailureInfo {
                    kind: record.kind,
                    retryable: record.retryable,
                    message: record.message.clone(),
                }),
                skip_reason: None,
                output: None,
                updated_at: now,
            },
            ItemOutcome::Skipped(reason) => ProgressEntry {
                status: ItemStatus::Skipped,
                attempts: previous_attempts,
                failure: None,
                skip_reason: Some(reason.to_string()),
                output: None,
                updated_at: now,
            },
        };

        self.entries.insert(package.clone(), entry);
        self.cursor = Some(cursor);
        self.updated_at = now;
    }
}

/// Seconds since the Unix epoch.
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str) -> PackageRef {
        PackageRef::new(name, "1.0.0")
    }

    fn failure(name: &str, retryable: bool, attempt: u32) -> ItemOutcome {
        ItemOutcome::Failed(FailureRecord {
            package: pkg(name),
            kind: if retryable {
                FailureKind::DownloadError
            } else {
                FailureKind::AnalysisError
            },
            retryable,
            message: "boom".into(),
            attempt,
        })
    }

    #[test]
    fn record_replaces_and_advances_cursor() {
        let mut state = ProgressState::new(100);
        let a = pkg("a");

        state.mark_pending(&a, 101);
        assert_eq!(state.get(&a).unwrap().status, ItemStatus::Pending);

        state.record(&a, Cursor { page: 1, index: 0 }, &failure("a", true, 1), 102);
        state.record(
            &a,
            Cursor { page: 1, index: 0 },
            &ItemOutcome::Succeeded {
                output: "/out/a/1.0.0".into(),
            },
            103,
        );

        assert_eq!(state.len(), 1);
        let entry = state.get(&a).unwrap();
        assert_eq!(entry.status, ItemStatus::Succeeded);
        assert_eq!(entry.attempts, 2);
        assert_eq!(state.cursor(), Some(Cursor { page: 1, index: 0 }));
        assert_eq!(state.updated_at(), 103);
    }

    #[test]
    fn terminal_rules() {
        let mut state = ProgressState::new(0);
        state.record(&pkg("ok"), Cursor { page: 1, index: 0 }, &ItemOutcome::Succeeded { output: "/o".into() }, 1);
        state.record(&pkg("perm"), Cursor { page: 1, index: 1 }, &failure("perm", false, 1), 1);
        state.record(&pkg("retry"), Cursor { page: 1, index: 2 }, &failure("retry", true, 1), 1);
        state.record(&pkg("spent"), Cursor { page: 1, index: 3 }, &failure("spent", true, 3), 1);
        state.record(
            &pkg("skip"),
            Cursor { page: 1, index: 4 },
            &ItemOutcome::Skipped(SkipReason::Retired),
            1,
        );

        let terminal = |name: &str| state.get(&pkg(name)).unwrap().is_terminal(3);
        assert!(terminal("ok"));
        assert!(terminal("perm"));
        assert!(!terminal("retry"));
        assert!(terminal("spent"));
        assert!(!terminal("skip"));
    }

    #[test]
    fn counters_follow_entries() {
        let mut state = ProgressState::new(0);
        state.record(&pkg("a"), Cursor { page: 1, index: 0 }, &ItemOutcome::Succeeded { output: "/o".into() }, 1);
        state.record(&pkg("b"), Cursor { page: 1, index: 1 }, &failure("b", true, 1), 1);
        state.record(&pkg("c"), Cursor { page: 1, index: 2 }, &ItemOutcome::Skipped(SkipReason::Excluded), 1);
        state.mark_pending(&pkg("d"), 2);

        let counters = state.counters();
        assert_eq!(counters.succeeded, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.skipped, 1);
        assert_eq!(counters.pending, 1);
        assert_eq!(counters.total(), 4);
    }

    #[test]
    fn entry_rejects_unknown_fields() {
        let json = r#"{"status":"succeeded","attempts":1,"updated_at":5,"shell":"rm -rf"}"#;
        assert!(serde_json::from_str::<ProgressEntry>(json).is_err());

        let json = r#"{"status":"exploded","updated_at":5}"#;
        assert!(serde_json::from_str::<ProgressEntry>(json).is_err());
    }
}
