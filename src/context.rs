//! Per-build state shared by dynamic tasks.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::activity::{ActivityReporter, TracingReporter};
use crate::graph::{DefiningTargets, ModuleDependencyGraph};
use crate::pruner::CompilationCachingDataPruner;
use crate::scanner::ScannerLoader;
use crate::task::DriverPlans;

/// Uploads compilation results to a remote cache in the background.
pub trait CacheUploader: Send + Sync {
    /// Blocks until every upload started so far has finished.
    fn wait_for_completion(&self);
}

/// Uploader of builds without a remote cache.
#[derive(Debug, Default)]
pub struct NullUploader;

impl CacheUploader for NullUploader {
    fn wait_for_completion(&self) {}
}

type UploaderFactory = Arc<dyn Fn() -> Box<dyn CacheUploader> + Send + Sync>;

/// Configuration of a build session, kept across context resets.
#[derive(Clone)]
pub struct SessionConfig {
    defining_targets: Arc<DefiningTargets>,
    loader: Arc<dyn ScannerLoader>,
    uploader: UploaderFactory,
    reporter: Arc<dyn ActivityReporter>,
}

impl SessionConfig {
    pub fn new(loader: Arc<dyn ScannerLoader>) -> Self {
        Self {
            defining_targets: Arc::default(),
            loader,
            uploader: Arc::new(|| Box::new(NullUploader)),
            reporter: Arc::new(TracingReporter::new()),
        }
    }

    pub fn with_defining_targets(mut self, targets: DefiningTargets) -> Self {
        self.defining_targets = Arc::new(targets);
        self
    }

    /// Sets the factory creating a fresh uploader for every context.
    pub fn with_uploader<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn CacheUploader> + Send + Sync + 'static,
    {
        self.uploader = Arc::new(factory);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ActivityReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn defining_targets(&self) -> &DefiningTargets {
        &self.defining_targets
    }
}

impl Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("defining_targets", &self.defining_targets.len())
            .finish_non_exhaustive()
    }
}

/// Proof that a context has no work in flight.
///
/// Only [`OperationContext::wait_for_completion`] creates tokens and
/// [`OperationContext::reset`] consumes them.
#[derive(Debug)]
#[must_use = "a completion token is needed to reset the context"]
pub struct CompletionToken {
    context: u64,
}

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(0);

/// Owns the state of one build: the module dependency graph, the cache
/// uploader, the pruner and the recorded driver plans.
pub struct OperationContext {
    id: u64,
    session: SessionConfig,
    graph: ModuleDependencyGraph,
    uploader: Box<dyn CacheUploader>,
    pruner: CompilationCachingDataPruner,
    driver_plans: DriverPlans,
}

impl OperationContext {
    pub fn new(session: SessionConfig) -> Self {
        let id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, "new operation context");

        Self {
            id,
            graph: ModuleDependencyGraph::new(
                session.loader.clone(),
                session.defining_targets.clone(),
            ),
            uploader: (session.uploader)(),
            pruner: CompilationCachingDataPruner::new(),
            driver_plans: DriverPlans::new(),
            session,
        }
    }

    pub fn graph(&self) -> &ModuleDependencyGraph {
        &self.graph
    }

    pub fn pruner(&self) -> &CompilationCachingDataPruner {
        &self.pruner
    }

    pub fn uploader(&self) -> &dyn CacheUploader {
        self.uploader.as_ref()
    }

    pub fn driver_plans(&self) -> &DriverPlans {
        &self.driver_plans
    }

    pub fn reporter(&self) -> Arc<dyn ActivityReporter> {
        self.session.reporter.clone()
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Waits for scans, uploads and prune actions in flight.
    pub fn wait_for_completion(&self) -> CompletionToken {
        self.graph.wait_for_completion();
        self.uploader.wait_for_completion();
        self.pruner.wait_for_completion();

        CompletionToken { context: self.id }
    }

    /// Replaces every subsystem with a fresh one, keeping the session.
    ///
    /// # Panics
    ///
    /// If `token` was handed out by another context.
    pub fn reset(self, token: CompletionToken) -> Self {
        assert_eq!(
            token.context, self.id,
            "completion token belongs to another operation context"
        );

        let session = self.session.clone();
        drop(self);
        Self::new(session)
    }
}
