#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod activity;
pub mod config;
pub mod context;
mod core;
pub mod error;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;
pub mod pruner;
#[cfg(feature = "tokio")]
pub mod runtime;
pub mod scanner;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::activity::{ActivityReporter, Diagnostic, TracingReporter};
pub use crate::config::{CacheSettings, CasOptions, SizeLimitingStrategy};
pub use crate::context::{CompletionToken, OperationContext, SessionConfig};
pub use crate::core::{ConfiguredTarget, Hash32};
pub use crate::error::*;
pub use crate::graph::{DependencyInfo, ModuleDependencyGraph, ScanRequest, ScanResult};
pub use crate::pruner::CompilationCachingDataPruner;
pub use crate::task::{DynamicTask, DynamicTaskKey, DynamicTaskSpec, ToolIdentifier, spec_for};
