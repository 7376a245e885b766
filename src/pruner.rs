//! Background size management of compilation caches.
//!
//! Every cache database is pruned at most once per build. Pruning runs on a
//! single dedicated worker thread, concurrently with the rest of the build,
//! since nothing in the build depends on it.

use std::collections::HashSet;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::activity::{ActivityInfo, ActivityReporter, ActivityStatus, Diagnostic};
use crate::config::{CasOptions, SizeLimitingStrategy};
use crate::core::{CompilerFamily, Hash32};
use crate::error::PruneError;
use crate::scanner::CasDatabases;

/// Identifies a cache database pruned during a build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PruneKey {
    /// Compiler whose cache the database holds.
    pub family: CompilerFamily,
    /// The tool whose library opened the database.
    pub tool_path: Utf8PathBuf,
    pub cas_options: CasOptions,
}

impl PruneKey {
    pub fn new(
        family: CompilerFamily,
        tool_path: impl Into<Utf8PathBuf>,
        cas_options: CasOptions,
    ) -> Self {
        Self {
            family,
            tool_path: tool_path.into(),
            cas_options,
        }
    }

    /// `ClangCachingPruneData` or `SwiftCachingPruneData`.
    fn rule_name(&self) -> String {
        format!("{}CachingPruneData", self.family.as_str())
    }

    pub fn signature(&self) -> Hash32 {
        Hash32::hash_labeled(&self.rule_name(), &(&self.tool_path, &self.cas_options))
    }
}

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    pruned: HashSet<PruneKey>,
    pending: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    idle: Condvar,
}

impl Shared {
    fn finished(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending -= 1;
        if state.pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Marks a scheduled prune action as finished when dropped, even if the
/// action panicked.
struct Finished(Arc<Shared>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.finished();
    }
}

struct Worker {
    sender: Sender<Job>,
    thread: JoinHandle<()>,
}

/// Bounds the on-disk size of cache databases.
#[derive(Default)]
pub struct CompilationCachingDataPruner {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl CompilationCachingDataPruner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules pruning of `cas` according to the size limit in `key`.
    ///
    /// Does nothing if the cache directory is discarded after the build, or
    /// if the database identified by `key` was already scheduled during this
    /// build. Failures are reported as diagnostics on `reporter` and never
    /// fail the build.
    pub fn prune_cas(
        &self,
        cas: Arc<dyn CasDatabases>,
        key: PruneKey,
        reporter: Arc<dyn ActivityReporter>,
    ) {
        if key.cas_options.limiting_strategy == SizeLimitingStrategy::Discarded {
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.pruned.insert(key.clone()) {
                return;
            }
            state.pending += 1;
        }

        let finished = Finished(self.shared.clone());
        self.enqueue(Box::new(move || {
            let _finished = finished;
            run_prune_activity(cas.as_ref(), &key, reporter.as_ref());
        }));
    }

    fn enqueue(&self, job: Job) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);

        if worker.is_none() {
            let (sender, receiver) = channel::<Job>();
            let spawned = std::thread::Builder::new()
                .name("kiln-cas-pruner".into())
                .spawn(move || {
                    for job in receiver {
                        run(job);
                    }
                });

            match spawned {
                Ok(thread) => *worker = Some(Worker { sender, thread }),
                Err(error) => {
                    tracing::warn!(%error, "couldn't start the pruning thread, pruning inline");
                    drop(worker);
                    run(job);
                    return;
                }
            }
        }

        if let Some(Worker { sender, .. }) = worker.as_ref()
            && let Err(rejected) = sender.send(job)
        {
            // The worker only stops when the pruner is dropped.
            drop(worker);
            run(rejected.0);
        }
    }

    /// Blocks until every scheduled prune action has finished.
    pub fn wait_for_completion(&self) {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let _state = self
            .shared
            .idle
            .wait_while(state, |state| state.pending > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

impl Drop for CompilationCachingDataPruner {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let pending = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending;
            debug_assert_eq!(pending, 0, "pruner dropped with prune actions in flight");
        }

        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Worker { sender, thread }) = worker {
            drop(sender);
            let _ = thread.join();
        }
    }
}

/// Runs a job, keeping a panic from reaching the worker loop or the caller.
fn run(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("prune action panicked");
    }
}

fn run_prune_activity(cas: &dyn CasDatabases, key: &PruneKey, reporter: &dyn ActivityReporter) {
    let cas_path = &key.cas_options.cas_path;
    let tool_path = &key.tool_path;
    let span = tracing::span!(Level::DEBUG, "prune", cas = %cas_path);
    let _enter = span.enter();

    let info = ActivityInfo {
        rule_info: format!("{} {cas_path} {tool_path}", key.rule_name()),
        execution_description: format!(
            "{} caching pruning {cas_path} using {tool_path}",
            key.family.as_str()
        ),
        signature: key.signature(),
    };

    reporter.with_activity(info, &mut |activity| {
        let outcome = catch_unwind(AssertUnwindSafe(|| prune(cas, &key.cas_options)))
            .unwrap_or_else(|panic| Err((None, panicked(panic))));

        match outcome {
            Ok(note) => {
                if let Some(note) = note {
                    reporter.emit(activity, note);
                }
                ActivityStatus::Succeeded
            }
            Err((note, error)) => {
                if let Some(note) = note {
                    reporter.emit(activity, note);
                }
                tracing::debug!(%error, "pruning failed");
                reporter.emit(activity, Diagnostic::error(error.to_string()));
                ActivityStatus::Failed
            }
        }
    });
}

fn panicked(panic: Box<dyn std::any::Any + Send>) -> PruneError {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("pruning panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("pruning panicked: {s}")
    } else {
        String::from("pruning panicked with unknown payload")
    };

    PruneError::Cas(anyhow::anyhow!(message))
}

type PruneOutcome = Result<Option<Diagnostic>, (Option<Diagnostic>, PruneError)>;

/// Applies the size limit and prunes. The note about an oversized cache is
/// returned alongside the outcome, it is emitted even when pruning fails.
fn prune(cas: &dyn CasDatabases, options: &CasOptions) -> PruneOutcome {
    let db_size = cas
        .ondisk_size()
        .map_err(|e| (None, PruneError::from(e)))?;
    let limit = size_limit(options.limiting_strategy, db_size, || {
        available_space(&options.cas_path)
    })
    .map_err(|e| (None, PruneError::from(e)))?;

    let note = match (db_size, limit) {
        (Some(size), Some(limit)) if limit < size => Some(Diagnostic::note(format!(
            "cache size ({size}) larger than size limit ({limit})"
        ))),
        _ => None,
    };

    let applied = cas
        .set_ondisk_size_limit(limit.unwrap_or(0))
        .and_then(|()| cas.prune_ondisk_data());

    match applied {
        Ok(()) => Ok(note),
        Err(error) => Err((note, PruneError::from(error))),
    }
}

/// Computes the size limit for a database of `db_size` bytes.
///
/// * `MaxSizeBytes(n)` gives `n`
/// * `MaxPercentageOfAvailableSpace(p)` gives `(db_size + free) * p / 100`,
///   with `p` capped at 100 and no limit for `p <= 0`
/// * `Discarded` or an unknown database size gives no limit
///
/// `free_space` is only called when needed.
pub fn size_limit<F>(
    strategy: SizeLimitingStrategy,
    db_size: Option<u64>,
    free_space: F,
) -> io::Result<Option<u64>>
where
    F: FnOnce() -> io::Result<u64>,
{
    let Some(db_size) = db_size else {
        return Ok(None);
    };

    match strategy {
        SizeLimitingStrategy::Discarded => Ok(None),
        SizeLimitingStrategy::MaxSizeBytes(size) => Ok(size),
        SizeLimitingStrategy::MaxPercentageOfAvailableSpace(percent) => {
            if percent <= 0 {
                return Ok(None);
            }
            let percent = percent.min(100) as u128;
            let available = db_size as u128 + free_space()? as u128;
            Ok(Some((available * percent / 100) as u64))
        }
    }
}

/// Free space on the volume holding `path`, which may not exist yet.
fn available_space(path: &Utf8Path) -> io::Result<u64> {
    let existing = path
        .ancestors()
        .find(|ancestor| ancestor.exists())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such path {path}")))?;

    fs2::available_space(existing)
}
