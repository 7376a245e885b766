use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use crate::error::StoreError;
use crate::graph::info::DependencyInfo;

/// Per-path registration state, `true` once the record is on disk.
type Slot = Arc<Mutex<bool>>;

/// Write-once persistence of dependency records.
///
/// Which scan is the first to discover a module is unknown, so every scan
/// tries to register every module it sees. The outer table lock is only held
/// to find the slot of a path, the slot lock serializes writers of that path.
#[derive(Debug, Default)]
pub(crate) struct DependencyInfoStore {
    slots: Mutex<IndexMap<Utf8PathBuf, Slot>>,
}

impl DependencyInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &Utf8Path) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(path.to_owned()).or_default().clone()
    }

    /// Writes the record produced by `make` unless `path` was already written
    /// during this build. Returns whether this call performed the write.
    ///
    /// A failed write leaves the path unregistered, a later scan may retry.
    pub fn register_if_absent<F>(&self, path: &Utf8Path, make: F) -> Result<bool, StoreError>
    where
        F: FnOnce() -> DependencyInfo,
    {
        let slot = self.slot(path);
        let mut written = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *written {
            return Ok(false);
        }

        write_record(path, &make())?;
        *written = true;

        tracing::trace!(%path, "registered dependency info");
        Ok(true)
    }

    /// Reads a persisted record.
    pub fn read(&self, path: &Utf8Path) -> Result<DependencyInfo, StoreError> {
        read_record(path)
    }

    /// Whether no record was written during this build.
    pub fn is_empty(&self) -> bool {
        self.recorded_paths().is_empty()
    }

    /// Paths of every record written during this build, in the order they
    /// were first registered.
    pub fn recorded_paths(&self) -> Vec<Utf8PathBuf> {
        let slots: Vec<(Utf8PathBuf, Slot)> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .map(|(path, slot)| (path.clone(), slot.clone()))
                .collect()
        };

        slots
            .into_iter()
            .filter(|(_, slot)| *slot.lock().unwrap_or_else(PoisonError::into_inner))
            .map(|(path, _)| path)
            .collect()
    }
}

fn write_record(path: &Utf8Path, info: &DependencyInfo) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_owned(),
        source,
    };

    let bytes = info.encode().map_err(|source| StoreError::Encode {
        path: path.to_owned(),
        source,
    })?;

    // Records are not tracked as build outputs, so the directory may not exist.
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let file_name = path.file_name().unwrap_or("record");
    let path_temp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    fs::write(&path_temp, bytes).map_err(io_error)?;
    fs::rename(&path_temp, path).map_err(io_error)?;

    Ok(())
}

/// Reads and decodes a record, the error names the file's modification time.
pub fn read_record(path: &Utf8Path) -> Result<DependencyInfo, StoreError> {
    let decoded = fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| DependencyInfo::decode(&bytes).map_err(anyhow::Error::from));

    decoded.map_err(|source| StoreError::Decode {
        path: path.to_owned(),
        modified: modification_time(path).unwrap_or_else(|| "<unknown>".into()),
        source,
    })
}

fn modification_time(path: &Utf8Path) -> Option<String> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use indexmap::IndexSet;

    use super::*;
    use crate::graph::info::{CompileCommand, DependencyKind};

    fn record(argument: &str) -> DependencyInfo {
        DependencyInfo {
            kind: DependencyKind::Command,
            files: IndexSet::new(),
            include_tree_id: None,
            modules: IndexSet::new(),
            working_directory: "/work".into(),
            commands: vec![CompileCommand {
                cache_key: None,
                arguments: vec![argument.to_string()],
            }],
            transitive_include_tree_ids: IndexSet::new(),
            transitive_cache_keys: IndexSet::new(),
            uses_serialized_diagnostics: false,
        }
    }

    fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_second_registration_is_skipped() {
        let (_guard, dir) = temp_dir();
        let path = dir.join("nested/dir/A-1.scan");
        let store = DependencyInfoStore::new();

        assert!(store.register_if_absent(&path, || record("first")).unwrap());
        assert!(!store.register_if_absent(&path, || record("second")).unwrap());

        let info = store.read(&path).unwrap();
        assert_eq!(info.commands[0].arguments, ["first"]);
        assert_eq!(store.recorded_paths(), [path]);
    }

    #[test]
    fn test_racing_writers_write_once() {
        let (_guard, dir) = temp_dir();
        let path = dir.join("Shared-1.scan");
        let store = DependencyInfoStore::new();
        let made = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    store
                        .register_if_absent(&path, || {
                            made.fetch_add(1, Ordering::SeqCst);
                            record("racer")
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(made.load(Ordering::SeqCst), 1);
        assert_eq!(store.recorded_paths().len(), 1);
    }

    #[test]
    fn test_failed_write_can_be_retried() {
        let (_guard, dir) = temp_dir();
        let blocker = dir.join("blocker");
        fs::write(&blocker, b"file, not a directory").unwrap();

        let path = blocker.join("A-1.scan");
        let store = DependencyInfoStore::new();

        assert!(store.register_if_absent(&path, || record("a")).is_err());
        assert!(store.is_empty());

        fs::remove_file(&blocker).unwrap();
        assert!(store.register_if_absent(&path, || record("a")).unwrap());
        assert!(!store.is_empty());
    }

    #[test]
    fn test_unreadable_record_reports_timestamp() {
        let (_guard, dir) = temp_dir();
        let path = dir.join("broken.scan");
        fs::write(&path, b"\xff\xff").unwrap();

        let message = read_record(&path).unwrap_err().to_string();
        assert!(message.starts_with("failed to query serialized dependencies at"));
        assert!(!message.contains("<unknown>"));

        let missing = dir.join("missing.scan");
        let message = read_record(&missing).unwrap_err().to_string();
        assert!(message.contains("<unknown>"));
    }
}
