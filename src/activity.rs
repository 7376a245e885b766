//! Activity reporting.
//!
//! Background work that is not a build task, such as pruning a cache, still
//! shows up in the build log as an activity with its own diagnostics.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::Hash32;

/// Opaque handle for an activity started on a reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityId(pub u64);

/// Describes an activity when it is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityInfo {
    pub rule_info: String,
    pub execution_description: String,
    pub signature: Hash32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Note => "note",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// A user facing message attached to an activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn note(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Note,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Sink for activities and their diagnostics.
///
/// Implementations must be callable from any thread, activities are started
/// from the pruner worker as well as from scan threads.
pub trait ActivityReporter: Send + Sync {
    fn start(&self, info: ActivityInfo) -> ActivityId;

    fn emit(&self, id: ActivityId, diagnostic: Diagnostic);

    fn end(&self, id: ActivityId, status: ActivityStatus);

    /// Runs `body` inside a started activity and ends it with the returned
    /// status.
    fn with_activity(
        &self,
        info: ActivityInfo,
        body: &mut dyn FnMut(ActivityId) -> ActivityStatus,
    ) -> ActivityStatus {
        let id = self.start(info);
        let status = body(id);
        self.end(id, status);
        status
    }
}

/// Forwards activities to `tracing` events.
#[derive(Debug, Default)]
pub struct TracingReporter {
    next: AtomicU64,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityReporter for TracingReporter {
    fn start(&self, info: ActivityInfo) -> ActivityId {
        let id = ActivityId(self.next.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            activity = id.0,
            rule = %info.rule_info,
            signature = %info.signature,
            "{}",
            info.execution_description
        );
        id
    }

    fn emit(&self, id: ActivityId, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Note => tracing::info!(activity = id.0, "{}", diagnostic.message),
            Severity::Warning => tracing::warn!(activity = id.0, "{}", diagnostic.message),
            Severity::Error => tracing::error!(activity = id.0, "{}", diagnostic.message),
        }
    }

    fn end(&self, id: ActivityId, status: ActivityStatus) {
        tracing::debug!(activity = id.0, ?status, "activity finished");
    }
}
