//! Compilation cache configuration.
//!
//! The macro language that evaluates build settings lives outside of this
//! crate. What arrives here is [`CacheSettings`], the already-evaluated raw
//! values, which [`CasOptions::from_settings`] turns into the options every
//! other subsystem keys on.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How the on-disk size of a CAS is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeLimitingStrategy {
    /// Cache directory is removed after the build is finished.
    Discarded,
    /// The maximum size for the cache directory in bytes. `None` means no limit.
    MaxSizeBytes(Option<u64>),
    /// The maximum size for the cache directory, in terms of percentage of the
    /// available space on the disk. 100 means no limit, values above 100 are
    /// reduced to 100.
    MaxPercentageOfAvailableSpace(i64),
}

impl Default for SizeLimitingStrategy {
    fn default() -> Self {
        Self::MaxPercentageOfAvailableSpace(50)
    }
}

/// Options identifying and configuring one content-addressable store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasOptions {
    pub cas_path: Utf8PathBuf,
    pub plugin_path: Option<Utf8PathBuf>,
    pub remote_service_path: Option<Utf8PathBuf>,
    /// Compute cache keys in-process with remote awareness.
    pub enable_integrated_cache_queries: bool,
    pub enable_diagnostic_remarks: bool,
    pub enable_strict_cas_errors: bool,
    /// Key queries avoid blocking on, or being restricted by, execution lanes.
    pub enable_detached_key_queries: bool,
    pub limiting_strategy: SizeLimitingStrategy,
}

impl CasOptions {
    /// Options for a local on-disk CAS with default behaviour.
    pub fn new(cas_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cas_path: cas_path.into(),
            plugin_path: None,
            remote_service_path: None,
            enable_integrated_cache_queries: false,
            enable_diagnostic_remarks: false,
            enable_strict_cas_errors: false,
            enable_detached_key_queries: false,
            limiting_strategy: SizeLimitingStrategy::default(),
        }
    }

    pub fn with_plugin(mut self, plugin_path: impl Into<Utf8PathBuf>) -> Self {
        self.plugin_path = Some(plugin_path.into());
        self
    }

    pub fn with_remote_service(mut self, remote_service_path: impl Into<Utf8PathBuf>) -> Self {
        self.remote_service_path = Some(remote_service_path.into());
        self
    }

    pub fn with_integrated_cache_queries(mut self, enable: bool) -> Self {
        self.enable_integrated_cache_queries = enable;
        self
    }

    pub fn with_limiting_strategy(mut self, strategy: SizeLimitingStrategy) -> Self {
        self.limiting_strategy = strategy;
        self
    }

    pub fn has_remote_cache(&self) -> bool {
        self.remote_service_path.is_some()
    }

    /// The same store with the remote service removed. Used for invocations
    /// when cache keys are computed by an integrated, remote-aware query.
    pub fn without_remote(&self) -> Self {
        Self {
            remote_service_path: None,
            ..self.clone()
        }
    }

    /// Resolves the options of the store used for `purpose` from evaluated
    /// build settings.
    pub fn from_settings(
        settings: &CacheSettings,
        purpose: CasPurpose,
    ) -> Result<Self, ConfigError> {
        let (cas_path, plugin_path, remote_service_path) = if settings.enable_plugin {
            let remote = settings
                .remote_service_path
                .as_deref()
                .filter(|path| !path.as_str().is_empty())
                .filter(|_| settings.is_language_supported_for_remote(&purpose))
                .map(Utf8Path::to_path_buf);

            (
                settings.cas_path.join("plugin"),
                settings.plugin_path.clone(),
                remote,
            )
        } else {
            let dir = match purpose {
                CasPurpose::Compiler(_) => "builtin",
                CasPurpose::Generic => "generic",
            };
            (settings.cas_path.join(dir), None, None)
        };

        Ok(Self {
            cas_path,
            plugin_path,
            remote_service_path,
            enable_integrated_cache_queries: settings.enable_integrated_queries,
            enable_diagnostic_remarks: settings.enable_diagnostic_remarks,
            enable_strict_cas_errors: settings.enable_strict_cas_errors,
            enable_detached_key_queries: settings.enable_detached_key_queries,
            limiting_strategy: settings.limiting_strategy()?,
        })
    }
}

/// What a CAS is being configured for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasPurpose {
    Generic,
    /// A compiler for the named language dialect, e.g. `objective-c`.
    Compiler(String),
}

/// Evaluated build settings that control compilation caching.
#[derive(Debug, Clone, Default)]
pub struct CacheSettings {
    pub cas_path: Utf8PathBuf,
    pub enable_plugin: bool,
    pub plugin_path: Option<Utf8PathBuf>,
    pub remote_service_path: Option<Utf8PathBuf>,
    /// Languages allowed to use the remote service. Empty means all.
    pub remote_supported_languages: Vec<String>,
    pub enable_integrated_queries: bool,
    pub enable_diagnostic_remarks: bool,
    pub enable_strict_cas_errors: bool,
    pub enable_detached_key_queries: bool,
    pub keep_cas_directory: bool,
    /// `COMPILATION_CACHE_LIMIT_SIZE`
    pub limit_size: String,
    /// `COMPILATION_CACHE_LIMIT_PERCENT`
    pub limit_percent: String,
    /// Host-wide default size limit, used when neither limit setting is set.
    pub default_size_limit: Option<String>,
}

impl CacheSettings {
    pub fn new(cas_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cas_path: cas_path.into(),
            keep_cas_directory: true,
            ..Default::default()
        }
    }

    pub fn plugin(mut self, plugin_path: impl Into<Utf8PathBuf>) -> Self {
        self.enable_plugin = true;
        self.plugin_path = Some(plugin_path.into());
        self
    }

    pub fn remote_service(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.remote_service_path = Some(path.into());
        self
    }

    pub fn remote_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remote_supported_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn keep_cas_directory(mut self, keep: bool) -> Self {
        self.keep_cas_directory = keep;
        self
    }

    pub fn limit_size(mut self, value: impl Into<String>) -> Self {
        self.limit_size = value.into();
        self
    }

    pub fn limit_percent(mut self, value: impl Into<String>) -> Self {
        self.limit_percent = value.into();
        self
    }

    fn is_language_supported_for_remote(&self, purpose: &CasPurpose) -> bool {
        match purpose {
            CasPurpose::Compiler(language) => {
                self.remote_supported_languages.is_empty()
                    || self.remote_supported_languages.contains(language)
            }
            CasPurpose::Generic => true,
        }
    }

    fn limiting_strategy(&self) -> Result<SizeLimitingStrategy, ConfigError> {
        if !self.keep_cas_directory {
            return Ok(SizeLimitingStrategy::Discarded);
        }

        if !self.limit_size.is_empty() {
            return size_limit_strategy(&self.limit_size, "COMPILATION_CACHE_LIMIT_SIZE");
        }

        if !self.limit_percent.is_empty() {
            return self
                .limit_percent
                .parse::<i64>()
                .map(SizeLimitingStrategy::MaxPercentageOfAvailableSpace)
                .map_err(|_| ConfigError::InvalidPercentLimit(self.limit_percent.clone()));
        }

        if let Some(default) = &self.default_size_limit {
            return size_limit_strategy(default, "CompilationCachingDiskSizeLimit default");
        }

        Ok(SizeLimitingStrategy::default())
    }
}

fn size_limit_strategy(value: &str, origin: &str) -> Result<SizeLimitingStrategy, ConfigError> {
    match parse_size_limit(value) {
        Some(0) => Ok(SizeLimitingStrategy::MaxSizeBytes(None)),
        Some(size) => Ok(SizeLimitingStrategy::MaxSizeBytes(Some(size))),
        None => Err(ConfigError::InvalidSizeLimit {
            value: value.to_string(),
            origin: origin.to_string(),
        }),
    }
}

/// Parses a size limit.
///
/// * Just an integer: size in bytes, `0` means no limit
/// * Integer ending in `K`, `M`, `G` or `T`: size in kilo-, mega-, giga- or
///   terabytes (binary multiples)
///
/// Returns `None` if the string is invalid.
pub fn parse_size_limit(value: &str) -> Option<u64> {
    if let Ok(size) = value.parse::<u64>() {
        return Some(size);
    }

    let unit = value.chars().last()?;
    let size = value[..value.len() - unit.len_utf8()].parse::<u64>().ok()?;
    let shift = match unit {
        'K' => 10,
        'M' => 20,
        'G' => 30,
        'T' => 40,
        _ => return None,
    };

    size.checked_mul(1 << shift)
}

/// Whether required-but-undeclared target dependencies are reported, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WarningLevel {
    #[default]
    No,
    Yes,
    YesError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_limit() {
        assert_eq!(parse_size_limit("0"), Some(0));
        assert_eq!(parse_size_limit("1234"), Some(1234));
        assert_eq!(parse_size_limit("2K"), Some(2048));
        assert_eq!(parse_size_limit("3M"), Some(3 * 1024 * 1024));
        assert_eq!(parse_size_limit("1G"), Some(1 << 30));
        assert_eq!(parse_size_limit("1T"), Some(1 << 40));
        assert_eq!(parse_size_limit("12X"), None);
        assert_eq!(parse_size_limit("M"), None);
        assert_eq!(parse_size_limit(""), None);
    }

    #[test]
    fn test_builtin_and_generic_paths() {
        let settings = CacheSettings::new("/tmp/cas");

        let compiler =
            CasOptions::from_settings(&settings, CasPurpose::Compiler("c".into())).unwrap();
        assert_eq!(compiler.cas_path, "/tmp/cas/builtin");
        assert!(compiler.plugin_path.is_none());

        let generic = CasOptions::from_settings(&settings, CasPurpose::Generic).unwrap();
        assert_eq!(generic.cas_path, "/tmp/cas/generic");
        assert_eq!(generic.limiting_strategy, SizeLimitingStrategy::default());
    }

    #[test]
    fn test_remote_only_for_supported_languages() {
        let settings = CacheSettings::new("/tmp/cas")
            .plugin("/usr/lib/libcas.so")
            .remote_service("/tmp/remote.sock")
            .remote_languages(["objective-c"]);

        let objc =
            CasOptions::from_settings(&settings, CasPurpose::Compiler("objective-c".into()))
                .unwrap();
        assert_eq!(objc.cas_path, "/tmp/cas/plugin");
        assert!(objc.has_remote_cache());

        let c = CasOptions::from_settings(&settings, CasPurpose::Compiler("c".into())).unwrap();
        assert!(!c.has_remote_cache());
        assert_eq!(c.plugin_path.as_deref(), Some(Utf8Path::new("/usr/lib/libcas.so")));
    }

    #[test]
    fn test_limiting_strategy_precedence() {
        let discarded = CacheSettings::new("/cas").keep_cas_directory(false).limit_size("1G");
        assert_eq!(
            discarded.limiting_strategy(),
            Ok(SizeLimitingStrategy::Discarded)
        );

        let size = CacheSettings::new("/cas").limit_size("1K").limit_percent("10");
        assert_eq!(
            size.limiting_strategy(),
            Ok(SizeLimitingStrategy::MaxSizeBytes(Some(1024)))
        );

        let unlimited = CacheSettings::new("/cas").limit_size("0");
        assert_eq!(
            unlimited.limiting_strategy(),
            Ok(SizeLimitingStrategy::MaxSizeBytes(None))
        );

        let percent = CacheSettings::new("/cas").limit_percent("10");
        assert_eq!(
            percent.limiting_strategy(),
            Ok(SizeLimitingStrategy::MaxPercentageOfAvailableSpace(10))
        );
    }

    #[test]
    fn test_invalid_limits() {
        let size = CacheSettings::new("/cas").limit_size("lots");
        assert_eq!(
            size.limiting_strategy(),
            Err(ConfigError::InvalidSizeLimit {
                value: "lots".into(),
                origin: "COMPILATION_CACHE_LIMIT_SIZE".into(),
            })
        );

        let percent = CacheSettings::new("/cas").limit_percent("half");
        assert_eq!(
            percent.limiting_strategy(),
            Err(ConfigError::InvalidPercentLimit("half".into()))
        );
    }
}
