use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::CasOptions;
use crate::error::HandleError;
use crate::scanner::{CasDatabases, LoadError, Scanner, ScannerCasConfig, ScannerLoader};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandleKey {
    tool: Utf8PathBuf,
    cas: Option<CasOptions>,
}

/// A loaded scanner and the cache databases it was created with. Shared by
/// every scan addressing the same tool and cache options.
pub(crate) struct ScannerHandle {
    pub scanner: Box<dyn Scanner>,
    pub cas: Option<Arc<dyn CasDatabases>>,
}

/// Lazily loaded scanners, one per tool and cache options.
pub(crate) struct HandleCache {
    loader: Arc<dyn ScannerLoader>,
    handles: RwLock<HashMap<HandleKey, Arc<ScannerHandle>>>,
}

impl HandleCache {
    pub fn new(loader: Arc<dyn ScannerLoader>) -> Self {
        Self {
            loader,
            handles: RwLock::default(),
        }
    }

    /// Returns the handle for `tool` and `cas`, loading it on first use.
    ///
    /// Only a single caller loads a given handle. If the tool can't open the
    /// requested cache and `fallback` is set, the handle is created once more
    /// without caching and stored under the requested key.
    pub fn get_or_load(
        &self,
        tool: &Utf8Path,
        cas: Option<&CasOptions>,
        fallback: bool,
    ) -> Result<Arc<ScannerHandle>, HandleError> {
        let key = HandleKey {
            tool: tool.to_owned(),
            cas: cas.cloned(),
        };

        if let Some(handle) = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(handle.clone());
        }

        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have loaded it while we waited for the lock.
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }

        let handle = Arc::new(self.load(tool, cas, fallback)?);
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    fn load(
        &self,
        tool: &Utf8Path,
        cas: Option<&CasOptions>,
        fallback: bool,
    ) -> Result<ScannerHandle, HandleError> {
        let _span = tracing::debug_span!("load_scanner", %tool).entered();
        let mut config = cas.map(ScannerCasConfig::new);

        for _ in 0..2 {
            match self.loader.load(tool, config.as_ref()) {
                Ok(loaded) => {
                    tracing::debug!(cached = loaded.cas.is_some(), "scanner loaded");
                    return Ok(ScannerHandle {
                        scanner: loaded.scanner,
                        cas: loaded.cas,
                    });
                }
                Err(LoadError::ScannerUnsupported) => {
                    return Err(HandleError::ScannerUnsupported {
                        tool: tool.to_owned(),
                    });
                }
                Err(LoadError::CacheUnsupported) if fallback && config.is_some() => {
                    tracing::warn!("caching is not supported by {tool}, scanning without it");
                    config = None;
                }
                Err(LoadError::CacheUnsupported) => {
                    return Err(HandleError::CacheUnsupported {
                        tool: tool.to_owned(),
                    });
                }
                Err(LoadError::Other(source)) => {
                    return Err(HandleError::Load {
                        tool: tool.to_owned(),
                        source,
                    });
                }
            }
        }

        unreachable!("scanner load should retry at most once")
    }

    /// Blocks until no handle is being created.
    pub fn wait_for_completion(&self) {
        drop(self.handles.write().unwrap_or_else(PoisonError::into_inner));
    }
}
