//! Interfaces of the external dependency scanner and its cache databases.
//!
//! The scanner itself is a native library loaded per tool path. Everything in
//! this module describes what `kiln` needs from it, implementations live with
//! the embedder.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::config::CasOptions;

/// Which output of a module the scanner is asking a path for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    ModuleFile,
    DependencyFile,
    DependencyTarget,
    SerializedDiagnosticFile,
}

/// A module discovered while scanning a translation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDependency {
    pub name: String,
    pub context_hash: String,
    /// Direct dependencies as `name:context-hash` identifiers.
    pub module_deps: Vec<String>,
    pub file_deps: Vec<Utf8PathBuf>,
    /// Arguments to build this module, without the compiler itself.
    pub build_arguments: Vec<String>,
    pub cache_key: Option<String>,
    pub include_tree_id: Option<String>,
    /// The build of this module does not depend on the working directory.
    pub is_cwd_ignored: bool,
}

impl ModuleDependency {
    /// The `name:context-hash` identifier other modules refer to this one by.
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.context_hash)
    }
}

/// One compiler job a translation unit expands to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationUnitCommand {
    /// Executable of the job, the compiler when absent.
    pub executable: Option<String>,
    pub build_arguments: Vec<String>,
    pub cache_key: Option<String>,
    pub module_deps: Vec<String>,
    pub file_deps: Vec<Utf8PathBuf>,
}

/// Result of scanning a translation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDependencies {
    pub commands: Vec<TranslationUnitCommand>,
    pub include_tree_id: Option<String>,
}

/// Callbacks invoked by the scanner during a single scan.
pub trait ScanDelegate {
    /// Output path of the given kind for module `name` in `context_hash`.
    fn lookup_output(&mut self, name: &str, context_hash: &str, kind: OutputKind) -> String;

    /// Reports every module the translation unit depends on, transitively.
    fn modules_discovered(&mut self, modules: Vec<ModuleDependency>, topologically_sorted: bool);
}

pub trait Scanner: Send + Sync {
    fn scan_dependencies(
        &self,
        command_line: &[String],
        working_directory: &Utf8Path,
        delegate: &mut dyn ScanDelegate,
    ) -> anyhow::Result<FileDependencies>;
}

/// Outputs recorded in the cache for one compile cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCompilation {
    pub outputs: Vec<CachedOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedOutput {
    /// Kind of output, e.g. `main` or `dependencies`.
    pub name: String,
    pub cas_id: String,
}

/// An opened on-disk content-addressable store.
pub trait CasDatabases: Send + Sync {
    /// Current size on disk, `None` when the store can't tell.
    fn ondisk_size(&self) -> anyhow::Result<Option<u64>>;

    /// Sets the size limit in bytes, `0` means no limit.
    fn set_ondisk_size_limit(&self, limit: u64) -> anyhow::Result<()>;

    fn prune_ondisk_data(&self) -> anyhow::Result<()>;

    /// Looks up a compile cache key. A `global` query also consults the
    /// remote service and makes the result available locally.
    fn query_cache_key(&self, cache_key: &str, global: bool)
    -> anyhow::Result<Option<CachedCompilation>>;

    /// Writes the object `cas_id` to `destination`. Returns `false` when the
    /// object is not in the store.
    fn materialize_output(&self, cas_id: &str, destination: &Utf8Path) -> anyhow::Result<bool>;
}

/// CAS configuration passed to the scanner loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerCasConfig {
    /// Options used to open the cache databases.
    pub databases: CasOptions,
    /// Options handed to compiler invocations created by the scanner, when
    /// they differ from `databases`.
    pub invocations: Option<CasOptions>,
}

impl ScannerCasConfig {
    pub fn new(options: &CasOptions) -> Self {
        let invocations = (options.enable_integrated_cache_queries && options.has_remote_cache())
            .then(|| options.without_remote());

        Self {
            databases: options.clone(),
            invocations,
        }
    }
}

/// A scanner together with the cache databases it was created with.
pub struct LoadedScanner {
    pub scanner: Box<dyn Scanner>,
    pub cas: Option<Arc<dyn CasDatabases>>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("dependency scanner is not supported")]
    ScannerUnsupported,

    #[error("compilation caching is not supported")]
    CacheUnsupported,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Loads a scanner from a tool on disk.
pub trait ScannerLoader: Send + Sync {
    fn load(&self, tool: &Utf8Path, cas: Option<&ScannerCasConfig>)
    -> Result<LoadedScanner, LoadError>;
}
