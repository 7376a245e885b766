//! Dynamic tasks.
//!
//! A dynamic task is known to the static build graph only by a serializable
//! [`DynamicTaskKey`]. Its command line is resolved when the scheduler is
//! about to run it, by the [`DynamicTaskSpec`] registered for its tool.

mod action;
mod driver;
mod spec;

use std::fmt::Display;
use std::str::FromStr;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::CasOptions;
use crate::core::{ConfiguredTarget, Hash32};
use crate::error::TaskError;
use crate::graph::ScanRequest;

pub use crate::core::CompilerFamily;

pub use self::action::{ActionOutcome, Invocation, TaskAction};
pub use self::driver::{DriverJob, DriverPlan, DriverPlans};
pub use self::spec::{DynamicTaskSpec, spec_for, spec_for_name};

/// Tools with a registered [`DynamicTaskSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolIdentifier {
    PrecompileModule,
    ClangCachingKeyMaterializer,
    SwiftCachingKeyMaterializer,
    CachingKeyQuery,
    CachingOutputMaterializer,
    SwiftDriverJob,
    SwiftDriverPlanning,
}

impl ToolIdentifier {
    pub const ALL: [ToolIdentifier; 7] = [
        Self::PrecompileModule,
        Self::ClangCachingKeyMaterializer,
        Self::SwiftCachingKeyMaterializer,
        Self::CachingKeyQuery,
        Self::CachingOutputMaterializer,
        Self::SwiftDriverJob,
        Self::SwiftDriverPlanning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrecompileModule => "precompile-module",
            Self::ClangCachingKeyMaterializer => "clang-caching-key-materializer",
            Self::SwiftCachingKeyMaterializer => "swift-caching-key-materializer",
            Self::CachingKeyQuery => "caching-key-query",
            Self::CachingOutputMaterializer => "caching-output-materializer",
            Self::SwiftDriverJob => "swift-driver-job",
            Self::SwiftDriverPlanning => "swift-driver-planning",
        }
    }
}

impl Display for ToolIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolIdentifier {
    type Err = TaskError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == name)
            .ok_or_else(|| TaskError::UnknownTool(name.to_string()))
    }
}

/// Compilation of a module discovered by a dependency scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecompileModuleKey {
    pub tool_path: Utf8PathBuf,
    /// Record of the module, written by the scan that discovered it.
    pub dependency_info_path: Utf8PathBuf,
    pub cas_options: Option<CasOptions>,
    pub verifying_module: Option<String>,
}

/// A compile cache key, queried in or fetched into the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKeyKey {
    pub family: CompilerFamily,
    pub tool_path: Utf8PathBuf,
    pub cas_options: CasOptions,
    pub cache_key: String,
}

/// A single cached object written out to the file system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputMaterializationKey {
    pub family: CompilerFamily,
    pub tool_path: Utf8PathBuf,
    pub cas_options: CasOptions,
    pub cas_id: String,
    pub output_path: Utf8PathBuf,
    /// Whether later tasks read the output. Outputs nobody waits for are
    /// materialized with low priority.
    pub needed_downstream: bool,
}

/// Which job of a driver plan a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverJobKind {
    /// A job compiling sources of a target.
    Target {
        identifier: String,
        variant: String,
        whole_module: bool,
    },
    /// A job building a module needed by the targets.
    ExplicitDependency,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverJobKey {
    pub kind: DriverJobKind,
    pub job_key: String,
    pub arch: String,
    pub cas_options: Option<CasOptions>,
}

/// Identity of one dynamic task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DynamicTaskKey {
    PrecompileModule(PrecompileModuleKey),
    CacheKeyMaterialization(CacheKeyKey),
    CacheKeyQuery(CacheKeyKey),
    OutputMaterialization(OutputMaterializationKey),
    DriverJob(DriverJobKey),
    DriverPlanning { identifier: String, scan: ScanRequest },
}

impl DynamicTaskKey {
    /// Stable digest of the key, used to deduplicate tasks across builds.
    pub fn signature(&self) -> Hash32 {
        Hash32::hash_labeled("DynamicTaskKey", self)
    }

    /// The tool whose spec handles this key.
    pub fn tool(&self) -> ToolIdentifier {
        match self {
            Self::PrecompileModule(_) => ToolIdentifier::PrecompileModule,
            Self::CacheKeyMaterialization(key) => match key.family {
                CompilerFamily::Clang => ToolIdentifier::ClangCachingKeyMaterializer,
                CompilerFamily::Swift => ToolIdentifier::SwiftCachingKeyMaterializer,
            },
            Self::CacheKeyQuery(_) => ToolIdentifier::CachingKeyQuery,
            Self::OutputMaterialization(_) => ToolIdentifier::CachingOutputMaterializer,
            Self::DriverJob(_) => ToolIdentifier::SwiftDriverJob,
            Self::DriverPlanning { .. } => ToolIdentifier::SwiftDriverPlanning,
        }
    }
}

/// A task emitted by the static build graph, resolved on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicTask {
    pub tool: ToolIdentifier,
    pub key: DynamicTaskKey,
    pub working_directory: Utf8PathBuf,
    pub environment: IndexMap<String, String>,
    pub target: Option<ConfiguredTarget>,
    pub show_environment: bool,
}

impl DynamicTask {
    pub fn new(key: DynamicTaskKey, working_directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            tool: key.tool(),
            key,
            working_directory: working_directory.into(),
            environment: IndexMap::new(),
            target: None,
            show_environment: false,
        }
    }

    pub fn with_environment<I, K, V>(mut self, environment: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = environment
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_target(mut self, target: ConfiguredTarget) -> Self {
        self.target = Some(target);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Other tasks are waiting on this one.
    Unblocking,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildCommand {
    Build,
    PrepareForIndexing,
}

/// A dynamic task resolved into something the scheduler can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableTask {
    pub rule_info: Vec<String>,
    /// Empty for tasks performed in-process by their [`TaskAction`].
    pub command_line: Vec<String>,
    pub environment: IndexMap<String, String>,
    pub working_directory: Utf8PathBuf,
    pub execution_description: String,
    pub priority: TaskPriority,
    pub target: Option<ConfiguredTarget>,
    pub show_environment: bool,
    pub expected_outputs: Vec<Utf8PathBuf>,
    pub serialized_diagnostics: Vec<Utf8PathBuf>,
    /// Inputs discovered by a dependency scan.
    pub dependency_paths: Vec<Utf8PathBuf>,
}

impl ExecutableTask {
    fn new(task: &DynamicTask, rule_info: Vec<String>, execution_description: String) -> Self {
        Self {
            rule_info,
            command_line: Vec::new(),
            environment: task.environment.clone(),
            working_directory: task.working_directory.clone(),
            execution_description,
            priority: TaskPriority::Normal,
            target: task.target.clone(),
            show_environment: task.show_environment,
            expected_outputs: Vec::new(),
            serialized_diagnostics: Vec::new(),
            dependency_paths: Vec::new(),
        }
    }
}
