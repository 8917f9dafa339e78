use std::{
    collections::{BTreeSet, HashSet},
    fmt,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::naming::JobId;

/// One field whose stored value disagrees with the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    /// Table field (placeholder) name.
    pub field: String,
    /// Assignment key in the artifact, empty when the field is not bound to
    /// a key.
    pub key: String,
    /// Value the table implies.
    pub expected: String,
    /// Value found in the artifact; `None` when absent.
    pub found: Option<String>,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let found = self.found.as_deref().unwrap_or("<absent>");
        if self.key.is_empty() {
            write!(f, "{}: expected {}, found {}", self.field, self.expected, found)
        } else {
            write!(
                f,
                "{} ({}): expected {}, found {}",
                self.field, self.key, self.expected, found
            )
        }
    }
}

/// A matched identifier whose stored parameters disagree with its row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    /// Identifier.
    pub job_id: JobId,
    /// Every disagreeing field.
    pub fields: Vec<FieldMismatch>,
}

/// Result of reconciling table rows against one identifier-keyed set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Present on both sides and consistent.
    pub matched: Vec<JobId>,
    /// Row without a stored counterpart (`MissingInput` / `MissingRun`).
    pub missing: Vec<JobId>,
    /// Stored item without a row (`OrphanInput` / orphan run).
    pub orphaned: Vec<JobId>,
    /// Present on both sides but disagreeing (`ParameterMismatch`).
    pub mismatched: Vec<Mismatch>,
}

impl VerificationReport {
    /// Splits identifiers into missing, orphaned and the shared set. The
    /// shared set keeps table order; orphans are sorted.
    #[must_use]
    pub fn partition(expected: &[JobId], stored: &[JobId]) -> (Vec<JobId>, Self) {
        let stored_set: HashSet<&JobId> = stored.iter().collect();
        let expected_set: HashSet<&JobId> = expected.iter().collect();
        let mut shared = Vec::new();
        let mut report = Self::default();
        for id in expected {
            if stored_set.contains(id) {
                shared.push(id.clone());
            } else {
                report.missing.push(id.clone());
            }
        }
        report.orphaned = stored
            .iter()
            .filter(|id| !expected_set.contains(id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        (shared, report)
    }

    /// Records the comparison of one shared identifier.
    pub fn record(&mut self, job_id: JobId, fields: Vec<FieldMismatch>) {
        if fields.is_empty() {
            self.matched.push(job_id);
        } else {
            self.mismatched.push(Mismatch { job_id, fields });
        }
    }

    /// True when nothing is missing, orphaned or mismatched.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty() && self.mismatched.is_empty()
    }

    /// Count summary.
    #[must_use]
    pub fn counts(&self) -> ReconcileCounts {
        ReconcileCounts {
            matched: self.matched.len(),
            missing: self.missing.len(),
            orphaned: self.orphaned.len(),
            mismatched: self.mismatched.len(),
        }
    }
}

/// Counts printed at the end of a verification stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    /// Consistent identifiers.
    pub matched: usize,
    /// Rows without counterpart.
    pub missing: usize,
    /// Counterparts without row.
    pub orphaned: usize,
    /// Disagreeing identifiers.
    pub mismatched: usize,
}

impl fmt::Display for ReconcileCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matched={} missing={} orphaned={} mismatched={}",
            self.matched, self.missing, self.orphaned, self.mismatched
        )
    }
}

/// Completion state of a run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunStatus {
    /// Marker present and the log shows a normal termination.
    Completed,
    /// Directory exists without a terminal marker.
    Incomplete,
    /// Marker reports an error, or the record contradicts itself.
    Failed {
        /// Description.
        reason: String,
    },
}

impl RunStatus {
    /// Short label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Output reconciliation plus completion classification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputReport {
    /// Table ↔ run record reconciliation.
    pub reconciliation: VerificationReport,
    /// Classification of every identifier present on both sides, in table
    /// order.
    pub statuses: IndexMap<JobId, RunStatus>,
}

impl OutputReport {
    /// Identifiers classified completed, in table order.
    #[must_use]
    pub fn completed(&self) -> Vec<JobId> {
        self.with_status(|s| matches!(s, RunStatus::Completed))
    }

    /// Identifiers classified incomplete.
    #[must_use]
    pub fn incomplete(&self) -> Vec<JobId> {
        self.with_status(|s| matches!(s, RunStatus::Incomplete))
    }

    /// Identifiers classified failed.
    #[must_use]
    pub fn failed(&self) -> Vec<JobId> {
        self.with_status(|s| matches!(s, RunStatus::Failed { .. }))
    }

    fn with_status(&self, predicate: impl Fn(&RunStatus) -> bool) -> Vec<JobId> {
        self.statuses
            .iter()
            .filter(|(_, status)| predicate(status))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True when reconciliation is clean and every run completed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reconciliation.is_clean()
            && self
                .statuses
                .values()
                .all(|s| matches!(s, RunStatus::Completed))
    }

    /// Count summary.
    #[must_use]
    pub fn counts(&self) -> OutputCounts {
        OutputCounts {
            reconcile: self.reconciliation.counts(),
            completed: self.completed().len(),
            incomplete: self.incomplete().len(),
            failed: self.failed().len(),
        }
    }
}

/// Counts printed at the end of output verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCounts {
    /// Reconciliation counts.
    pub reconcile: ReconcileCounts,
    /// Completed runs.
    pub completed: usize,
    /// Interrupted runs.
    pub incomplete: usize,
    /// Failed runs.
    pub failed: usize,
}

impl fmt::Display for OutputCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed={} incomplete={} failed={}",
            self.reconcile, self.completed, self.incomplete, self.failed
        )
    }
}
