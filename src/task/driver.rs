use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// One job of a compiler driver plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverJob {
    /// Job type shown in rule infos, e.g. `Compile` or `EmitModule`.
    pub rule_info_type: String,
    pub command_line: Vec<String>,
    pub outputs: Vec<Utf8PathBuf>,
    pub display_inputs: Vec<Utf8PathBuf>,
    pub description: String,
}

/// Jobs planned by the driver for one target, by job key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverPlan {
    jobs: HashMap<String, DriverJob>,
}

impl DriverPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, key: impl Into<String>, job: DriverJob) -> Self {
        self.jobs.insert(key.into(), job);
        self
    }

    pub fn job(&self, key: &str) -> Option<&DriverJob> {
        self.jobs.get(key)
    }
}

/// Driver plans recorded during one build.
///
/// Target plans are keyed by the planning identifier. Explicit dependency
/// jobs are shared between all targets and keyed by job key alone.
#[derive(Debug, Default)]
pub struct DriverPlans {
    plans: RwLock<HashMap<String, Arc<DriverPlan>>>,
    explicit: RwLock<HashMap<String, DriverJob>>,
}

impl DriverPlans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_plan(&self, identifier: impl Into<String>, plan: DriverPlan) {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        plans.insert(identifier.into(), Arc::new(plan));
    }

    /// Records an explicit dependency job, the first job recorded for a key
    /// wins.
    pub fn record_explicit_job(&self, key: impl Into<String>, job: DriverJob) {
        let mut explicit = self.explicit.write().unwrap_or_else(PoisonError::into_inner);
        explicit.entry(key.into()).or_insert(job);
    }

    pub fn target_job(&self, identifier: &str, job_key: &str) -> Result<DriverJob, TaskError> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        plans
            .get(identifier)
            .and_then(|plan| plan.job(job_key))
            .cloned()
            .ok_or_else(|| TaskError::MissingDriverJob {
                plan: identifier.to_string(),
                job: job_key.to_string(),
            })
    }

    pub fn explicit_dependency_job(&self, job_key: &str) -> Result<DriverJob, TaskError> {
        let explicit = self.explicit.read().unwrap_or_else(PoisonError::into_inner);
        explicit
            .get(job_key)
            .cloned()
            .ok_or_else(|| TaskError::MissingExplicitDependencyJob(job_key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(description: &str) -> DriverJob {
        DriverJob {
            rule_info_type: "Compile".into(),
            command_line: vec!["swift-frontend".into()],
            outputs: vec!["/out/a.o".into()],
            display_inputs: vec!["/src/a.swift".into()],
            description: description.into(),
        }
    }

    #[test]
    fn test_lookup_target_job() {
        let plans = DriverPlans::new();
        plans.record_plan("App", DriverPlan::new().with_job("1", job("Compiling a.swift")));

        assert_eq!(plans.target_job("App", "1").unwrap().description, "Compiling a.swift");

        let error = plans.target_job("App", "2").unwrap_err();
        assert_eq!(error.to_string(), "Failed to lookup Swift driver job 2 in build plan App");
        assert!(plans.target_job("Lib", "1").is_err());
    }

    #[test]
    fn test_first_explicit_job_wins() {
        let plans = DriverPlans::new();
        plans.record_explicit_job("m", job("first"));
        plans.record_explicit_job("m", job("second"));

        assert_eq!(plans.explicit_dependency_job("m").unwrap().description, "first");
        assert!(matches!(
            plans.explicit_dependency_job("n"),
            Err(TaskError::MissingExplicitDependencyJob(_))
        ));
    }
}
