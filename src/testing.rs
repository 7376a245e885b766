//! In-memory stand-ins for the scanner, its cache databases and the activity
//! reporter.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::activity::{ActivityId, ActivityInfo, ActivityReporter, ActivityStatus, Diagnostic};
use crate::scanner::{
    CachedCompilation, CasDatabases, FileDependencies, LoadError, LoadedScanner,
    ModuleDependency, OutputKind, ScanDelegate, Scanner, ScannerCasConfig, ScannerLoader,
};

pub(crate) fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

pub(crate) fn module(name: &str, context_hash: &str, deps: &[&str]) -> ModuleDependency {
    ModuleDependency {
        name: name.to_string(),
        context_hash: context_hash.to_string(),
        module_deps: deps.iter().map(|dep| dep.to_string()).collect(),
        file_deps: vec![Utf8PathBuf::from(format!("/src/{name}/module.modulemap"))],
        build_arguments: vec![
            "-cc1".into(),
            "-emit-module".into(),
            format!("-fmodule-name={name}"),
        ],
        ..Default::default()
    }
}

/// What the fake scanner reports for every scan.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScanScript {
    modules: Vec<ModuleDependency>,
    sorted: bool,
    file_deps: FileDependencies,
    failure: Option<&'static str>,
}

impl ScanScript {
    pub fn new(modules: Vec<ModuleDependency>, file_deps: FileDependencies) -> Self {
        Self {
            modules,
            file_deps,
            ..Default::default()
        }
    }

    /// Reports the modules as already in dependency order.
    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    pub fn failing(message: &'static str) -> Self {
        Self {
            failure: Some(message),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct ScanLog {
    commands: Mutex<Vec<Vec<String>>>,
    lookups: Mutex<Vec<String>>,
}

struct FakeScanner {
    script: ScanScript,
    log: Arc<ScanLog>,
}

impl Scanner for FakeScanner {
    fn scan_dependencies(
        &self,
        command_line: &[String],
        _working_directory: &Utf8Path,
        delegate: &mut dyn ScanDelegate,
    ) -> anyhow::Result<FileDependencies> {
        self.log.commands.lock().unwrap().push(command_line.to_vec());

        if let Some(message) = self.script.failure {
            anyhow::bail!(message);
        }

        for module in &self.script.modules {
            for kind in [
                OutputKind::ModuleFile,
                OutputKind::DependencyFile,
                OutputKind::SerializedDiagnosticFile,
                OutputKind::DependencyTarget,
                OutputKind::ModuleFile,
            ] {
                let output = delegate.lookup_output(&module.name, &module.context_hash, kind);
                self.log.lookups.lock().unwrap().push(output);
            }
        }

        delegate.modules_discovered(self.script.modules.clone(), self.script.sorted);
        Ok(self.script.file_deps.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum LoadResponse {
    ScannerUnsupported,
    CacheUnsupported,
    Fail(&'static str),
}

/// Loads fake scanners, answering with scripted failures first.
#[derive(Default)]
pub(crate) struct FakeLoader {
    responses: Mutex<VecDeque<LoadResponse>>,
    script: ScanScript,
    delay: Duration,
    loads: AtomicUsize,
    cas_requests: Mutex<Vec<bool>>,
    log: Arc<ScanLog>,
    cas: Arc<FakeCas>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond<I: IntoIterator<Item = LoadResponse>>(self, responses: I) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..self
        }
    }

    pub fn with_script(self, script: ScanScript) -> Self {
        Self { script, ..self }
    }

    pub fn with_delay_ms(self, millis: u64) -> Self {
        Self {
            delay: Duration::from_millis(millis),
            ..self
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Whether each load asked for cache databases.
    pub fn cas_requests(&self) -> Vec<bool> {
        self.cas_requests.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.log.lookups.lock().unwrap().clone()
    }

    pub fn scanned_commands(&self) -> Vec<Vec<String>> {
        self.log.commands.lock().unwrap().clone()
    }

    pub fn cas(&self) -> Arc<FakeCas> {
        self.cas.clone()
    }
}

impl ScannerLoader for FakeLoader {
    fn load(
        &self,
        _tool: &Utf8Path,
        cas: Option<&ScannerCasConfig>,
    ) -> Result<LoadedScanner, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.cas_requests.lock().unwrap().push(cas.is_some());
        thread::sleep(self.delay);

        match self.responses.lock().unwrap().pop_front() {
            Some(LoadResponse::ScannerUnsupported) => Err(LoadError::ScannerUnsupported),
            Some(LoadResponse::CacheUnsupported) => Err(LoadError::CacheUnsupported),
            Some(LoadResponse::Fail(message)) => Err(LoadError::Other(anyhow::anyhow!(message))),
            None => Ok(LoadedScanner {
                scanner: Box::new(FakeScanner {
                    script: self.script.clone(),
                    log: self.log.clone(),
                }),
                cas: cas.map(|_| self.cas.clone() as Arc<dyn CasDatabases>),
            }),
        }
    }
}

/// Cache databases kept in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeCas {
    pub size: Mutex<Option<u64>>,
    pub limits: Mutex<Vec<u64>>,
    pub prunes: AtomicUsize,
    pub fail_prune: AtomicBool,
    pub panic_on_size: AtomicBool,
    pub local: Mutex<HashMap<String, CachedCompilation>>,
    pub remote: Mutex<HashMap<String, CachedCompilation>>,
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeCas {
    pub fn with_size(size: Option<u64>) -> Self {
        Self {
            size: Mutex::new(size),
            ..Default::default()
        }
    }
}

impl CasDatabases for FakeCas {
    fn ondisk_size(&self) -> anyhow::Result<Option<u64>> {
        if self.panic_on_size.load(Ordering::SeqCst) {
            panic!("size query crashed");
        }
        Ok(*self.size.lock().unwrap())
    }

    fn set_ondisk_size_limit(&self, limit: u64) -> anyhow::Result<()> {
        self.limits.lock().unwrap().push(limit);
        Ok(())
    }

    fn prune_ondisk_data(&self) -> anyhow::Result<()> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        if self.fail_prune.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        Ok(())
    }

    fn query_cache_key(
        &self,
        cache_key: &str,
        global: bool,
    ) -> anyhow::Result<Option<CachedCompilation>> {
        let mut local = self.local.lock().unwrap();
        if let Some(hit) = local.get(cache_key) {
            return Ok(Some(hit.clone()));
        }

        if !global {
            return Ok(None);
        }

        let remote = self.remote.lock().unwrap().get(cache_key).cloned();
        if let Some(hit) = &remote {
            local.insert(cache_key.to_string(), hit.clone());
        }
        Ok(remote)
    }

    fn materialize_output(&self, cas_id: &str, destination: &Utf8Path) -> anyhow::Result<bool> {
        let objects = self.objects.lock().unwrap();
        let Some(bytes) = objects.get(cas_id) else {
            return Ok(false);
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, bytes)?;
        Ok(true)
    }
}

/// Remembers every activity and diagnostic it receives.
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    next: AtomicUsize,
    started: Mutex<Vec<ActivityInfo>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
    ended: Mutex<Vec<ActivityStatus>>,
}

impl RecordingReporter {
    pub fn started(&self) -> Vec<ActivityInfo> {
        self.started.lock().unwrap().clone()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }

    pub fn ended(&self) -> Vec<ActivityStatus> {
        self.ended.lock().unwrap().clone()
    }
}

impl ActivityReporter for RecordingReporter {
    fn start(&self, info: ActivityInfo) -> ActivityId {
        self.started.lock().unwrap().push(info);
        ActivityId(self.next.fetch_add(1, Ordering::SeqCst) as u64)
    }

    fn emit(&self, _id: ActivityId, diagnostic: Diagnostic) {
        self.diagnostics.lock().unwrap().push(diagnostic);
    }

    fn end(&self, _id: ActivityId, status: ActivityStatus) {
        self.ended.lock().unwrap().push(status);
    }
}
