//! Snapshot confirmation
//!
//! The gate asks a [`UserConfirmation`] whether to persist a snapshot once a
//! fault has been diagnosed. Hosts attach whatever surface they have; the
//! core only ships the fixed policy used by headless processes and tests.

use crate::classify::DiagnosisReport;

/// Decides whether a diagnosed fault gets a snapshot
pub trait UserConfirmation: Send + Sync {
    /// Return `false` to skip the snapshot and keep only the diagnosis
    fn confirm(&self, report: &DiagnosisReport<'_>) -> bool;
}

/// Answers every fault the same way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPolicy(pub bool);

impl FixedPolicy {
    pub fn always() -> Self {
        Self(true)
    }

    pub fn never() -> Self {
        Self(false)
    }
}

impl Default for FixedPolicy {
    fn default() -> Self {
        Self::always()
    }
}

impl UserConfirmation for FixedPolicy {
    fn confirm(&self, report: &DiagnosisReport<'_>) -> bool {
        log::debug!(
            "Snapshot for {} {} by fixed policy",
            report.category,
            if self.0 { "accepted" } else { "declined" }
        );
        self.0
    }
}

impl<T: UserConfirmation + ?Sized> UserConfirmation for Box<T> {
    fn confirm(&self, report: &DiagnosisReport<'_>) -> bool {
        (**self).confirm(report)
    }
}
