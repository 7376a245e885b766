use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while resolving a scanner handle for a tool.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("scanner at '{tool}' does not have up-to-date dependency scanner")]
    ScannerUnsupported { tool: Utf8PathBuf },

    #[error("scanner at '{tool}' does not have up-to-date caching support")]
    CacheUnsupported { tool: Utf8PathBuf },

    #[error("could not load {tool}: {source}")]
    Load {
        tool: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by the on-disk dependency info store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("couldn't write dependency info at '{path}': {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't serialize dependency info for '{path}': {source}")]
    Encode {
        path: Utf8PathBuf,
        #[source]
        source: ciborium::ser::Error<std::io::Error>,
    },

    #[error(
        "failed to query serialized dependencies at '{path}' with timestamp {modified}; {source}"
    )]
    Decode {
        path: Utf8PathBuf,
        modified: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised while scanning a single translation unit.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("cannot scan an empty command line")]
    EmptyCommandLine,

    #[error("malformed module identifier '{0}', expected 'name:context-hash'")]
    MalformedModuleId(String),

    #[error("module '{0}' was referenced before it was reported by the scanner")]
    UnknownModule(String),

    #[error("dependency scan with '{tool}' failed: {source}")]
    Scanner {
        tool: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("error(s) when scanning dependencies:\n{}", render_all(.0))]
    Modules(Vec<ScanError>),
}

fn render_all(errors: &[ScanError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised while writing the precompiled modules report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("couldn't write report file '{path}': {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while materializing a dynamic task or performing its action.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Dynamic task with unknown spec {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("compilation caching is not available with '{tool}'")]
    MissingCache { tool: Utf8PathBuf },

    #[error("compilation cache operation failed: {0}")]
    Cas(#[source] anyhow::Error),

    #[error("dependency info at '{path}' does not describe a module")]
    NotAModule { path: Utf8PathBuf },

    #[error("Failed to lookup Swift driver job {job} in build plan {plan}")]
    MissingDriverJob { plan: String, job: String },

    #[error("Failed to lookup explicit modules Swift driver job {0}")]
    MissingExplicitDependencyJob(String),

    #[cfg(feature = "tokio")]
    #[error("blocking task was cancelled: {0}")]
    Join(#[source] tokio::task::JoinError),
}

/// Errors raised while resolving cache configuration from build settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {origin}: '{value}'")]
    InvalidSizeLimit { value: String, origin: String },

    #[error("invalid COMPILATION_CACHE_LIMIT_PERCENT: '{0}'")]
    InvalidPercentLimit(String),
}

/// Errors raised by a single prune action. These never fail a build, they
/// are only ever turned into diagnostics.
#[derive(Debug, Error)]
pub enum PruneError {
    #[error(transparent)]
    Cas(#[from] anyhow::Error),

    #[error("couldn't measure free disk space: {0}")]
    Io(#[from] std::io::Error),
}
