use camino::Utf8Path;

use crate::context::OperationContext;
use crate::error::TaskError;

use super::action::{Invocation, TaskAction};
use super::driver::DriverJob;
use super::{
    BuildCommand, DriverJobKind, DynamicTask, DynamicTaskKey, ExecutableTask, TaskPriority,
    ToolIdentifier,
};

/// Resolves dynamic tasks of one tool.
///
/// Handlers are only ever handed keys of their own tool. Any other key means
/// the task was routed or deserialized wrongly, and handlers panic.
pub trait DynamicTaskSpec: Sync {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError>;

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        context: &OperationContext,
    ) -> Result<TaskAction, TaskError>;

    fn should_start(&self, _task: &ExecutableTask, _command: BuildCommand) -> bool {
        true
    }
}

/// The handler of `tool`.
pub fn spec_for(tool: ToolIdentifier) -> &'static dyn DynamicTaskSpec {
    match tool {
        ToolIdentifier::PrecompileModule => &PrecompileModuleSpec,
        ToolIdentifier::ClangCachingKeyMaterializer
        | ToolIdentifier::SwiftCachingKeyMaterializer => &CacheKeyMaterializerSpec,
        ToolIdentifier::CachingKeyQuery => &CacheKeyQuerySpec,
        ToolIdentifier::CachingOutputMaterializer => &OutputMaterializerSpec,
        ToolIdentifier::SwiftDriverJob => &DriverJobSpec,
        ToolIdentifier::SwiftDriverPlanning => &DriverPlanningSpec,
    }
}

/// The handler of the tool named `name`, as referenced by a static graph.
pub fn spec_for_name(name: &str) -> Result<&'static dyn DynamicTaskSpec, TaskError> {
    Ok(spec_for(name.parse()?))
}

fn unexpected(key: &DynamicTaskKey) -> ! {
    unreachable!("unexpected dynamic task key {key:?}")
}

struct PrecompileModuleSpec;

impl DynamicTaskSpec for PrecompileModuleSpec {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError> {
        let DynamicTaskKey::PrecompileModule(key) = &task.key else {
            unexpected(&task.key)
        };

        let info = context.graph().query_dependencies(&key.dependency_info_path)?;
        let not_a_module = || TaskError::NotAModule {
            path: key.dependency_info_path.clone(),
        };
        let output_path = info.output_path().ok_or_else(not_a_module)?;
        let command = info.only_command().ok_or_else(not_a_module)?;
        let name = module_name(output_path);

        let mut executable = ExecutableTask::new(
            task,
            vec!["PrecompileModule".into(), output_path.to_string()],
            format!("Compile Clang module '{name}'"),
        );
        executable.command_line = command.arguments.clone();
        executable.working_directory = info.working_directory.clone();
        executable.priority = TaskPriority::Unblocking;
        executable.expected_outputs = vec![output_path.to_owned()];
        if info.uses_serialized_diagnostics {
            executable.serialized_diagnostics = vec![output_path.with_extension("dia")];
        }
        executable.dependency_paths = info.files.iter().cloned().collect();
        Ok(executable)
    }

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        _context: &OperationContext,
    ) -> Result<TaskAction, TaskError> {
        let DynamicTaskKey::PrecompileModule(key) = key else {
            unexpected(key)
        };
        Ok(TaskAction::PrecompileModule(key.clone()))
    }
}

/// Module name from a module file named `<name>-<hash>[-verify].pcm`.
fn module_name(output_path: &Utf8Path) -> &str {
    let stem = output_path.file_stem().unwrap_or_default();
    let stem = stem.strip_suffix("-verify").unwrap_or(stem);
    stem.rsplit_once('-').map_or(stem, |(name, _)| name)
}

struct CacheKeyMaterializerSpec;

impl DynamicTaskSpec for CacheKeyMaterializerSpec {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        _context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError> {
        let DynamicTaskKey::CacheKeyMaterialization(key) = &task.key else {
            unexpected(&task.key)
        };

        let family = key.family.as_str();
        let mut executable = ExecutableTask::new(
            task,
            vec![format!("{family}CachingMaterializeKey"), key.cache_key.clone()],
            format!("Materializing {family} cache key"),
        );
        executable.priority = TaskPriority::Unblocking;
        Ok(executable)
    }

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        _context: &OperationContext,
    ) -> Result<TaskAction, TaskError> {
        let DynamicTaskKey::CacheKeyMaterialization(key) = key else {
            unexpected(key)
        };
        Ok(TaskAction::MaterializeCacheKey(key.clone()))
    }
}

struct CacheKeyQuerySpec;

impl DynamicTaskSpec for CacheKeyQuerySpec {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        _context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError> {
        let DynamicTaskKey::CacheKeyQuery(key) = &task.key else {
            unexpected(&task.key)
        };

        let family = key.family.as_str();
        let mut executable = ExecutableTask::new(
            task,
            vec![format!("{family}CachingKeyQuery"), key.cache_key.clone()],
            format!("Querying {family} cache key"),
        );
        executable.priority = TaskPriority::Unblocking;
        Ok(executable)
    }

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        _context: &OperationContext,
    ) -> Result<TaskAction, TaskError> {
        let DynamicTaskKey::CacheKeyQuery(key) = key else {
            unexpected(key)
        };
        Ok(TaskAction::QueryCacheKey(key.clone()))
    }
}

struct OutputMaterializerSpec;

impl DynamicTaskSpec for OutputMaterializerSpec {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        _context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError> {
        let DynamicTaskKey::OutputMaterialization(key) = &task.key else {
            unexpected(&task.key)
        };

        let mut executable = ExecutableTask::new(
            task,
            vec!["CachingMaterializeOutput".into(), key.output_path.to_string()],
            format!("Materializing output {}", key.output_path),
        );
        executable.priority = if key.needed_downstream {
            TaskPriority::Normal
        } else {
            TaskPriority::Low
        };
        executable.expected_outputs = vec![key.output_path.clone()];
        Ok(executable)
    }

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        _context: &OperationContext,
    ) -> Result<TaskAction, TaskError> {
        let DynamicTaskKey::OutputMaterialization(key) = key else {
            unexpected(key)
        };
        Ok(TaskAction::MaterializeOutput(key.clone()))
    }
}

const DRIVER_JOB_PREFIX: [&str; 2] = ["builtin-swiftTaskExecution", "--"];
const PARSEABLE_OUTPUT_FLAG: &str = "-frontend-parseable-output";

struct DriverJobSpec;

impl DriverJobSpec {
    fn lookup(key: &DynamicTaskKey, context: &OperationContext) -> Result<DriverJob, TaskError> {
        let DynamicTaskKey::DriverJob(key) = key else {
            unexpected(key)
        };

        let plans = context.driver_plans();
        match &key.kind {
            DriverJobKind::Target { identifier, .. } => plans.target_job(identifier, &key.job_key),
            DriverJobKind::ExplicitDependency => plans.explicit_dependency_job(&key.job_key),
        }
    }
}

/// Jobs writing serialized diagnostics instead of parseable output.
fn supports_parseable_output(rule_info: &[String]) -> bool {
    rule_info.first().is_none_or(|kind| {
        !kind.starts_with("SwiftExplicitDependency")
            && !kind.starts_with("SwiftVerifyEmittedModuleInterface")
    })
}

fn driver_command_line(job: &DriverJob, rule_info: &[String]) -> Vec<String> {
    let parseable = supports_parseable_output(rule_info);
    DRIVER_JOB_PREFIX
        .iter()
        .map(ToString::to_string)
        .chain(
            job.command_line
                .iter()
                .filter(|arg| parseable || *arg != PARSEABLE_OUTPUT_FLAG)
                .cloned(),
        )
        .collect()
}

impl DynamicTaskSpec for DriverJobSpec {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError> {
        let DynamicTaskKey::DriverJob(key) = &task.key else {
            unexpected(&task.key)
        };
        let job = Self::lookup(&task.key, context)?;

        let (rule_info, target) = match &key.kind {
            DriverJobKind::Target { variant, .. } => {
                let mut rule_info = vec![
                    format!("Swift{}", job.rule_info_type),
                    variant.clone(),
                    key.arch.clone(),
                    job.description.clone(),
                ];
                rule_info.extend(job.display_inputs.iter().map(ToString::to_string));
                (rule_info, task.target.clone())
            }
            DriverJobKind::ExplicitDependency => {
                debug_assert!(
                    !job.outputs.is_empty(),
                    "explicit dependency jobs have a primary output"
                );
                let output = job
                    .outputs
                    .first()
                    .map_or_else(|| "<unknown>".to_string(), ToString::to_string);
                let rule_info = vec![
                    format!("SwiftExplicitDependency{}", job.rule_info_type),
                    key.arch.clone(),
                    output,
                ];
                (rule_info, None)
            }
        };

        let command_line = driver_command_line(&job, &rule_info);
        let serialized_diagnostics = if supports_parseable_output(&rule_info) {
            Vec::new()
        } else {
            job.outputs
                .iter()
                .filter(|output| output.extension() == Some("dia"))
                .cloned()
                .collect()
        };

        let mut executable = ExecutableTask::new(task, rule_info, job.description.clone());
        executable.command_line = command_line;
        executable.target = target;
        executable.expected_outputs = job.outputs;
        executable.serialized_diagnostics = serialized_diagnostics;
        Ok(executable)
    }

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        context: &OperationContext,
    ) -> Result<TaskAction, TaskError> {
        let job = Self::lookup(key, context)?;
        let DynamicTaskKey::DriverJob(driver_key) = key else {
            unexpected(key)
        };

        let rule_info = match driver_key.kind {
            DriverJobKind::Target { .. } => vec![format!("Swift{}", job.rule_info_type)],
            DriverJobKind::ExplicitDependency => {
                vec![format!("SwiftExplicitDependency{}", job.rule_info_type)]
            }
        };

        Ok(TaskAction::RunDriverJob(Invocation {
            arguments: driver_command_line(&job, &rule_info),
            working_directory: None,
        }))
    }
}

struct DriverPlanningSpec;

impl DynamicTaskSpec for DriverPlanningSpec {
    fn build_executable_task(
        &self,
        task: &DynamicTask,
        _context: &OperationContext,
    ) -> Result<ExecutableTask, TaskError> {
        let DynamicTaskKey::DriverPlanning { identifier, scan } = &task.key else {
            unexpected(&task.key)
        };

        let mut executable = ExecutableTask::new(
            task,
            vec!["SwiftDriverPlanning".into(), identifier.clone()],
            format!("Planning Swift module {identifier}"),
        );
        executable.priority = TaskPriority::Unblocking;
        executable.expected_outputs = vec![scan.scanning_output_path.clone()];
        Ok(executable)
    }

    fn build_task_action(
        &self,
        key: &DynamicTaskKey,
        _context: &OperationContext,
    ) -> Result<TaskAction, TaskError> {
        let DynamicTaskKey::DriverPlanning { identifier, scan } = key else {
            unexpected(key)
        };
        Ok(TaskAction::PlanDriver {
            identifier: identifier.clone(),
            scan: scan.clone(),
        })
    }
}
