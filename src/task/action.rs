use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::CasOptions;
use crate::context::OperationContext;
use crate::error::TaskError;
use crate::graph::{ScanRequest, ScanResult};
use crate::pruner::PruneKey;
use crate::scanner::{CachedCompilation, CasDatabases};

use super::{CacheKeyKey, CompilerFamily, OutputMaterializationKey, PrecompileModuleKey};

/// A process the scheduler has to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub arguments: Vec<String>,
    /// `None` runs the process in the working directory of its executable
    /// task.
    pub working_directory: Option<Utf8PathBuf>,
}

/// What the scheduler runs for a dynamic task. Holds only what is needed to
/// perform the task, so it can be persisted and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAction {
    PrecompileModule(PrecompileModuleKey),
    MaterializeCacheKey(CacheKeyKey),
    QueryCacheKey(CacheKeyKey),
    MaterializeOutput(OutputMaterializationKey),
    RunDriverJob(Invocation),
    PlanDriver { identifier: String, scan: ScanRequest },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The task has to run this process.
    Spawn(Invocation),
    CacheHit,
    CacheMiss,
    Materialized { outputs: usize },
    Planned(ScanResult),
}

impl TaskAction {
    pub fn perform(&self, context: &OperationContext) -> Result<ActionOutcome, TaskError> {
        match self {
            Self::PrecompileModule(key) => precompile_module(key, context),
            Self::MaterializeCacheKey(key) => {
                let cas = cas_for(context, key.family, &key.tool_path, &key.cas_options)?;
                let cached = cas.query_cache_key(&key.cache_key, true).map_err(TaskError::Cas)?;
                Ok(match cached {
                    Some(cached) => ActionOutcome::Materialized {
                        outputs: cached.outputs.len(),
                    },
                    None => ActionOutcome::CacheMiss,
                })
            }
            Self::QueryCacheKey(key) => {
                let cas = cas_for(context, key.family, &key.tool_path, &key.cas_options)?;
                let global = key.cas_options.has_remote_cache();
                let cached = cas.query_cache_key(&key.cache_key, global).map_err(TaskError::Cas)?;
                tracing::debug!(key = %key.cache_key, hit = cached.is_some(), "cache key query");
                Ok(match cached {
                    Some(_) => ActionOutcome::CacheHit,
                    None => ActionOutcome::CacheMiss,
                })
            }
            Self::MaterializeOutput(key) => {
                let cas = cas_for(context, key.family, &key.tool_path, &key.cas_options)?;
                if !cas
                    .materialize_output(&key.cas_id, &key.output_path)
                    .map_err(TaskError::Cas)?
                {
                    return Err(TaskError::Cas(anyhow::anyhow!(
                        "object {} is missing from '{}'",
                        key.cas_id,
                        key.cas_options.cas_path
                    )));
                }
                Ok(ActionOutcome::Materialized { outputs: 1 })
            }
            Self::RunDriverJob(invocation) => Ok(ActionOutcome::Spawn(invocation.clone())),
            Self::PlanDriver { identifier, scan } => {
                let span = tracing::debug_span!("plan", %identifier);
                let _enter = span.enter();
                Ok(ActionOutcome::Planned(context.graph().scan_dependencies(scan)?))
            }
        }
    }
}

/// Opens the cache of `tool` and schedules its pruning for this build.
fn cas_for(
    context: &OperationContext,
    family: CompilerFamily,
    tool: &Utf8Path,
    options: &CasOptions,
) -> Result<Arc<dyn CasDatabases>, TaskError> {
    let cas = context
        .graph()
        .cas_databases(tool, options)?
        .ok_or_else(|| TaskError::MissingCache {
            tool: tool.to_owned(),
        })?;

    context.pruner().prune_cas(
        cas.clone(),
        PruneKey::new(family, tool, options.clone()),
        context.reporter(),
    );
    Ok(cas)
}

fn precompile_module(
    key: &PrecompileModuleKey,
    context: &OperationContext,
) -> Result<ActionOutcome, TaskError> {
    let info = context.graph().query_dependencies(&key.dependency_info_path)?;
    let not_a_module = || TaskError::NotAModule {
        path: key.dependency_info_path.clone(),
    };
    let output_path = info.output_path().ok_or_else(not_a_module)?;
    let command = info.only_command().ok_or_else(not_a_module)?;

    if let (Some(cache_key), Some(options)) = (&command.cache_key, &key.cas_options) {
        let cas = cas_for(context, CompilerFamily::Clang, &key.tool_path, options)?;
        let cached = cas
            .query_cache_key(cache_key, options.has_remote_cache())
            .map_err(TaskError::Cas)?;

        if let Some(cached) = cached
            && materialize_module(cas.as_ref(), &cached, output_path)?
        {
            tracing::debug!(module = %output_path, "module restored from cache");
            return Ok(ActionOutcome::CacheHit);
        }
    }

    Ok(ActionOutcome::Spawn(Invocation {
        arguments: command.arguments.clone(),
        working_directory: Some(info.working_directory.clone()),
    }))
}

/// Writes the cached outputs of a module next to each other. Returns `false`
/// if an object is missing, the module then has to be compiled.
fn materialize_module(
    cas: &dyn CasDatabases,
    cached: &CachedCompilation,
    module_file: &Utf8Path,
) -> Result<bool, TaskError> {
    for output in &cached.outputs {
        let path = match output.name.as_str() {
            "main" => module_file.to_owned(),
            "dependencies" => module_file.with_extension("d"),
            "serialized-diagnostics" => module_file.with_extension("dia"),
            other => {
                tracing::trace!(kind = other, "skipping cached output");
                continue;
            }
        };

        if !cas
            .materialize_output(&output.cas_id, &path)
            .map_err(TaskError::Cas)?
        {
            return Ok(false);
        }
    }

    Ok(true)
}
