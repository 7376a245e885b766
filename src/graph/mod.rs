//! Module dependency graph.
//!
//! Scans translation units with an external dependency scanner, assigns
//! output paths to the modules it discovers and persists one
//! [`DependencyInfo`] per module and per translation unit. Later dynamic tasks
//! read these records to build the modules and the translation unit itself.

mod handles;
mod info;
mod order;
mod report;
mod store;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::config::{CasOptions, WarningLevel};
use crate::core::ConfiguredTarget;
use crate::error::{HandleError, ReportError, ScanError, StoreError};
use crate::scanner::{
    CasDatabases, FileDependencies, ModuleDependency, OutputKind, ScanDelegate, ScannerLoader,
};

use self::handles::HandleCache;
use self::info::Transitive;
use self::store::DependencyInfoStore;

pub use self::info::{CompileCommand, DependencyInfo, DependencyKind};
pub use self::report::{load_records, write_precompiled_modules_report};
pub use self::store::read_record;

/// Targets defining each module, by module name.
pub type DefiningTargets = HashMap<String, IndexSet<ConfiguredTarget>>;

/// Everything needed to scan one translation unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanRequest {
    /// The tool providing the dependency scanner.
    pub tool_path: Utf8PathBuf,
    /// Where the record of the translation unit is written.
    pub scanning_output_path: Utf8PathBuf,
    /// The first element of `command_line` is a launcher wrapping the compiler.
    pub uses_compiler_launcher: bool,
    pub uses_serialized_diagnostics: bool,
    pub command_line: Vec<String>,
    pub working_directory: Utf8PathBuf,
    pub cas_options: Option<CasOptions>,
    /// Scan without caching if the tool doesn't support the requested cache.
    pub cache_fallback_if_not_available: bool,
    /// Name of the module being verified by this compilation, if any.
    pub verifying_module: Option<String>,
    /// Directory receiving the outputs of discovered modules.
    pub module_output_directory: Utf8PathBuf,
    pub report_required_target_dependencies: WarningLevel,
}

/// A module used by a scanned unit together with a target defining it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequiredDependency {
    pub target: ConfiguredTarget,
    pub module_name: String,
}

/// Outcome of a single scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Every file the unit and its modules depend on.
    pub dependency_paths: BTreeSet<Utf8PathBuf>,
    pub required_target_dependencies: BTreeSet<RequiredDependency>,
}

/// Collects and records file and module dependencies of translation units.
pub struct ModuleDependencyGraph {
    defining_targets: Arc<DefiningTargets>,
    handles: HandleCache,
    store: DependencyInfoStore,
    scans: InFlight,
}

impl ModuleDependencyGraph {
    pub fn new(loader: Arc<dyn ScannerLoader>, defining_targets: Arc<DefiningTargets>) -> Self {
        Self {
            defining_targets,
            handles: HandleCache::new(loader),
            store: DependencyInfoStore::new(),
            scans: InFlight::default(),
        }
    }

    /// Scans the file and module dependencies of one translation unit.
    ///
    /// Modules are registered in dependency order. A failure to register one
    /// module doesn't stop the others, all failures are returned together
    /// once the scanner is done.
    pub fn scan_dependencies(&self, request: &ScanRequest) -> Result<ScanResult, ScanError> {
        let _guard = self.scans.enter();
        let span = tracing::span!(Level::DEBUG, "scan", output = %request.scanning_output_path);
        let _enter = span.enter();

        let handle = self.handles.get_or_load(
            &request.tool_path,
            request.cas_options.as_ref(),
            request.cache_fallback_if_not_available,
        )?;

        let (launcher, compiler, arguments) =
            split_command_line(&request.command_line, request.uses_compiler_launcher)?;

        let scan_command: Vec<String> = std::iter::once(compiler)
            .chain(arguments)
            .cloned()
            .collect();

        let mut session = ScanSession::new(self, request, launcher, compiler);
        let file_deps = handle
            .scanner
            .scan_dependencies(&scan_command, &request.working_directory, &mut session)
            .map_err(|source| ScanError::Scanner {
                tool: request.tool_path.clone(),
                source,
            })?;

        if !session.errors.is_empty() {
            return Err(ScanError::Modules(session.errors));
        }

        session.register_unit(file_deps)?;

        tracing::debug!(
            files = session.result.dependency_paths.len(),
            modules = session.transitive.len(),
            "scan finished"
        );
        Ok(session.result)
    }

    /// Reads the record written at `path`.
    pub fn query_dependencies(&self, path: &Utf8Path) -> Result<DependencyInfo, StoreError> {
        self.store.read(path)
    }

    /// Cache databases of the scanner loaded for `tool` with `options`.
    pub fn cas_databases(
        &self,
        tool: &Utf8Path,
        options: &CasOptions,
    ) -> Result<Option<Arc<dyn CasDatabases>>, HandleError> {
        let handle = self.handles.get_or_load(tool, Some(options), false)?;
        Ok(handle.cas.clone())
    }

    /// Whether no record was written during this build.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Blocks until every scan in flight has finished.
    pub fn wait_for_completion(&self) {
        self.scans.wait();
        self.handles.wait_for_completion();
    }

    /// Writes a report of every module built in this build, see
    /// [`write_precompiled_modules_report`].
    pub fn generate_precompiled_modules_report(
        &self,
        directory: &Utf8Path,
    ) -> Result<String, ReportError> {
        let records = load_records(&self.store.recorded_paths())?;
        write_precompiled_modules_report(records, directory)
    }
}

fn split_command_line(
    command_line: &[String],
    uses_compiler_launcher: bool,
) -> Result<(Option<&String>, &String, &[String]), ScanError> {
    match (uses_compiler_launcher, command_line) {
        (true, [launcher, compiler, rest @ ..]) => Ok((Some(launcher), compiler, rest)),
        (false, [compiler, rest @ ..]) => Ok((None, compiler, rest)),
        _ => Err(ScanError::EmptyCommandLine),
    }
}

fn split_module_id(id: &str) -> Result<(&str, &str), ScanError> {
    id.split_once(':')
        .ok_or_else(|| ScanError::MalformedModuleId(id.to_string()))
}

/// Module outputs share a file stem, only the extension differs.
fn sibling(module_file: &Utf8Path, extension: &str) -> Utf8PathBuf {
    module_file.with_extension(extension)
}

/// State of a single scan, handed to the scanner as its delegate.
struct ScanSession<'a> {
    graph: &'a ModuleDependencyGraph,
    request: &'a ScanRequest,
    launcher: Option<&'a String>,
    compiler: &'a String,
    /// Module file path of every module looked up so far.
    outputs: HashMap<String, Utf8PathBuf>,
    /// Transitive sets of every module registered so far, by `name:hash`.
    transitive: IndexMap<String, Transitive>,
    errors: Vec<ScanError>,
    result: ScanResult,
}

impl<'a> ScanSession<'a> {
    fn new(
        graph: &'a ModuleDependencyGraph,
        request: &'a ScanRequest,
        launcher: Option<&'a String>,
        compiler: &'a String,
    ) -> Self {
        Self {
            graph,
            request,
            launcher,
            compiler,
            outputs: HashMap::new(),
            transitive: IndexMap::new(),
            errors: Vec::new(),
            result: ScanResult::default(),
        }
    }

    /// Identity of a module. A module under verification must not share
    /// outputs with other compilations of the same module, since its
    /// diagnostics are processed differently.
    fn module_key(&self, name: &str, context_hash: &str) -> String {
        let mut key = format!("{name}:{context_hash}");
        if let Some(verifying) = &self.request.verifying_module {
            let private = format!("{verifying}_Private");
            if name == verifying || name == private || name == "Test" {
                key.push_str(":verify");
            }
        }
        key
    }

    fn module_file(&mut self, name: &str, context_hash: &str) -> Utf8PathBuf {
        let key = self.module_key(name, context_hash);
        let directory = &self.request.module_output_directory;
        self.outputs
            .entry(key)
            .or_insert_with_key(|key| directory.join(format!("{}.pcm", key.replace(':', "-"))))
            .clone()
    }

    fn module_files(&mut self, ids: &[String]) -> Result<IndexSet<Utf8PathBuf>, ScanError> {
        ids.iter()
            .map(|id| {
                let (name, context_hash) = split_module_id(id)?;
                Ok(self.module_file(name, context_hash))
            })
            .collect()
    }

    fn transitive_of(&self, ids: &[String], mut own: Transitive) -> Result<Transitive, ScanError> {
        for id in ids {
            let dep = self
                .transitive
                .get(id)
                .ok_or_else(|| ScanError::UnknownModule(id.clone()))?;
            own.extend(dep);
        }
        Ok(own)
    }

    fn command_prefix(&self, executable: Option<&String>) -> Vec<String> {
        self.launcher
            .into_iter()
            .chain(Some(executable.unwrap_or(self.compiler)))
            .cloned()
            .collect()
    }

    fn register_module(&mut self, module: &ModuleDependency) -> Result<(), ScanError> {
        let module_file = self.module_file(&module.name, &module.context_hash);
        let record_path = sibling(&module_file, "scan");
        let modules = self.module_files(&module.module_deps)?;

        let mut own = Transitive::default();
        own.include_tree_ids.extend(module.include_tree_id.clone());
        own.cache_keys.extend(module.cache_key.clone());
        let transitive = self.transitive_of(&module.module_deps, own)?;
        self.transitive.insert(module.id(), transitive.clone());

        let files: IndexSet<Utf8PathBuf> = module.file_deps.iter().cloned().collect();
        self.result.dependency_paths.extend(files.iter().cloned());

        if self.request.report_required_target_dependencies != WarningLevel::No
            && let Some(targets) = self.graph.defining_targets.get(&module.name)
        {
            self.result
                .required_target_dependencies
                .extend(targets.iter().map(|target| RequiredDependency {
                    target: target.clone(),
                    module_name: module.name.clone(),
                }));
        }

        let mut arguments = self.command_prefix(None);
        arguments.extend(module.build_arguments.iter().cloned());

        // Cached builds don't depend on the working directory, and differing
        // directories must not prevent deduplication of the module build.
        let working_directory = if module.cache_key.is_some() || module.is_cwd_ignored {
            Utf8PathBuf::from("/")
        } else {
            self.request.working_directory.clone()
        };

        let uses_serialized_diagnostics = self.request.uses_serialized_diagnostics;
        self.graph.store.register_if_absent(&record_path, || DependencyInfo {
            kind: DependencyKind::Module {
                output_path: module_file,
            },
            files,
            include_tree_id: module.include_tree_id.clone(),
            modules,
            working_directory,
            commands: vec![CompileCommand {
                cache_key: module.cache_key.clone(),
                arguments,
            }],
            transitive_include_tree_ids: transitive.include_tree_ids,
            transitive_cache_keys: transitive.cache_keys,
            uses_serialized_diagnostics,
        })?;

        Ok(())
    }

    fn register_unit(&mut self, file_deps: FileDependencies) -> Result<(), ScanError> {
        let commands: Vec<CompileCommand> = file_deps
            .commands
            .iter()
            .map(|command| {
                let mut arguments = self.command_prefix(command.executable.as_ref());
                arguments.extend(command.build_arguments.iter().cloned());
                CompileCommand {
                    cache_key: command.cache_key.clone(),
                    arguments,
                }
            })
            .collect();

        let module_ids: Vec<String> = file_deps
            .commands
            .iter()
            .flat_map(|command| command.module_deps.iter().cloned())
            .collect();
        let modules = self.module_files(&module_ids)?;

        let mut own = Transitive::default();
        own.include_tree_ids.extend(file_deps.include_tree_id.clone());
        own.cache_keys.extend(
            commands
                .iter()
                .filter_map(|command| command.cache_key.clone()),
        );
        let transitive = self.transitive_of(&module_ids, own)?;

        let files: IndexSet<Utf8PathBuf> = file_deps
            .commands
            .iter()
            .flat_map(|command| command.file_deps.iter().cloned())
            .collect();
        self.result.dependency_paths.extend(files.iter().cloned());

        let working_directory = if commands.iter().all(|c| c.cache_key.is_some()) {
            Utf8PathBuf::from("/")
        } else {
            self.request.working_directory.clone()
        };

        let uses_serialized_diagnostics = self.request.uses_serialized_diagnostics;
        self.graph
            .store
            .register_if_absent(&self.request.scanning_output_path, || DependencyInfo {
                kind: DependencyKind::Command,
                files,
                include_tree_id: file_deps.include_tree_id,
                modules,
                working_directory,
                commands,
                transitive_include_tree_ids: transitive.include_tree_ids,
                transitive_cache_keys: transitive.cache_keys,
                uses_serialized_diagnostics,
            })?;

        Ok(())
    }
}

impl ScanDelegate for ScanSession<'_> {
    fn lookup_output(&mut self, name: &str, context_hash: &str, kind: OutputKind) -> String {
        let module_file = self.module_file(name, context_hash);
        match kind {
            OutputKind::ModuleFile => module_file.into_string(),
            // Make-style dependency targets are ignored, a constant avoids escaping.
            OutputKind::DependencyTarget => "moduledependenciestarget".to_string(),
            OutputKind::DependencyFile => sibling(&module_file, "d").into_string(),
            OutputKind::SerializedDiagnosticFile => sibling(&module_file, "dia").into_string(),
        }
    }

    fn modules_discovered(&mut self, modules: Vec<ModuleDependency>, topologically_sorted: bool) {
        for index in order::topological_order(&modules, topologically_sorted) {
            if let Err(error) = self.register_module(&modules[index]) {
                let module = modules[index].id();
                tracing::debug!(%module, %error, "module registration failed");
                self.errors.push(error);
            }
        }
    }
}

/// Counts scans in flight so a build can wait for all of them.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(self)
    }

    fn wait(&self) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let _count = self
            .idle
            .wait_while(count, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}
