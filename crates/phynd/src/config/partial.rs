use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use toml::Spanned;

use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::MergeConflictLocation;
use super::diagnostics::MergeError;
use super::diagnostics::SourceInfo;
use super::diagnostics::Warning;
use super::LogLevel;
use crate::entity::UnitSystem;

/// One config file as written, before merging and validation.
#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub phyn: Option<PartialPhynConfig>,
    pub polling: Option<PartialPollingConfig>,
    pub retry: Option<PartialRetryConfig>,
    pub api: Option<PartialApiConfig>,
    pub push: Option<PartialPushConfig>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,

    /// Where each merged field was set, keyed by dotted path.
    #[serde(skip)]
    pub origins: HashMap<String, MergeConflictLocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialPhynConfig {
    pub username: Option<Spanned<String>>,
    pub password: Option<Spanned<String>>,
    pub client_id: Option<Spanned<String>>,
    pub api_key: Option<Spanned<String>>,
    pub base_url: Option<Spanned<String>>,
    pub auth_url: Option<Spanned<String>>,
    pub region: Option<Spanned<String>>,
    pub units: Option<Spanned<UnitSystem>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialPollingConfig {
    pub interval_secs: Option<Spanned<u64>>,
    pub timeout_secs: Option<Spanned<u64>>,
    pub stale_after_missed_polls: Option<Spanned<u32>>,
    pub firmware_every_polls: Option<Spanned<u64>>,
    pub discovery_every_polls: Option<Spanned<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialRetryConfig {
    pub max_retries: Option<Spanned<u32>>,
    pub initial_backoff_ms: Option<Spanned<u64>>,
    pub max_backoff_ms: Option<Spanned<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialApiConfig {
    pub enabled: Option<Spanned<bool>>,
    pub listen: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialPushConfig {
    pub enabled: Option<Spanned<bool>>,
    pub reconnect_secs: Option<Spanned<u64>>,
}

/// First-wins field merging with conflict collection.
#[derive(Default)]
struct Merger {
    diagnostics: Vec<Diagnostic>,
    origins: HashMap<String, MergeConflictLocation>,
}

impl Merger {
    fn field<T>(
        &mut self,
        path: String,
        target: &mut Option<Spanned<T>>,
        incoming: Option<Spanned<T>>,
        source: &SourceInfo,
    ) {
        let Some(value) = incoming else {
            return;
        };
        let location = MergeConflictLocation {
            file_path: source.file_path.clone(),
            span: value.span(),
            content: source.content.clone(),
        };

        if let Some(first) = self.origins.get(&path) {
            self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                message: format!("'{}' is defined in multiple config files", path),
                field_path: path,
                conflicts: vec![first.clone(), location],
            })));
        } else {
            *target = Some(value);
            self.origins.insert(path, location);
        }
    }
}

/// Merge every listed field of one section.
macro_rules! merge_section {
    ($merger:expr, $source:expr, $section:literal, $target:expr, $incoming:expr, [$($field:ident),* $(,)?]) => {
        if let Some(incoming) = $incoming {
            let target = $target.get_or_insert_with(Default::default);
            $(
                $merger.field(
                    concat!($section, ".", stringify!($field)).to_string(),
                    &mut target.$field,
                    incoming.$field,
                    $source,
                );
            )*
        }
    };
}

impl PartialConfig {
    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });

        Ok(config)
    }

    /// Load config files with import resolution.
    ///
    /// Returns every loaded file in order, imports before the file that
    /// imports them.
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut visited = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut visited, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    fn load_recursive(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical_path = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        if visited.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path,
                cycle: visited.iter().cloned().collect(),
            });
        }
        visited.insert(canonical_path.clone());

        let config = Self::from_file(path)?;

        for import in &config.imports {
            let import = PathBuf::from(import);
            // Relative imports resolve from the importing file's directory
            let resolved = if import.is_absolute() {
                import
            } else {
                path.parent().unwrap_or_else(|| Path::new(".")).join(import)
            };
            Self::load_recursive(&resolved, visited, configs)?;
        }

        configs.push(config);

        // Siblings may import the same file.
        visited.remove(&canonical_path);

        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.imports.is_empty()
            && self.logging.is_none()
            && self.phyn.is_none()
            && self.polling.is_none()
            && self.retry.is_none()
            && self.api.is_none()
            && self.push.is_none()
    }

    /// Merge multiple partial configs together
    ///
    /// Uses first-wins semantics: the first occurrence of a field is kept.
    /// Every conflict is collected rather than stopping at the first one.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger::default();

        for config in configs {
            let source = config.source.clone().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            if config.is_empty() {
                merger
                    .diagnostics
                    .push(Diagnostic::Warning(Warning::EmptyConfig {
                        file_path: source.file_path.clone(),
                    }));
            }
            result.imports.extend(config.imports);

            if let Some(logging) = config.logging {
                let target = result.logging.get_or_insert_with(Default::default);
                merger.field("logging.level".to_string(), &mut target.level, logging.level, &source);

                for (key, value) in logging.overrides.unwrap_or_default() {
                    let overrides = target.overrides.get_or_insert_with(HashMap::new);
                    let mut slot = overrides.remove(&key);
                    merger.field(format!("logging.overrides.{}", key), &mut slot, Some(value), &source);
                    if let Some(slot) = slot {
                        overrides.insert(key, slot);
                    }
                }
            }

            merge_section!(merger, &source, "phyn", result.phyn, config.phyn, [
                username, password, client_id, api_key, base_url, auth_url, region, units,
            ]);
            merge_section!(merger, &source, "polling", result.polling, config.polling, [
                interval_secs,
                timeout_secs,
                stale_after_missed_polls,
                firmware_every_polls,
                discovery_every_polls,
            ]);
            merge_section!(merger, &source, "retry", result.retry, config.retry, [
                max_retries, initial_backoff_ms, max_backoff_ms,
            ]);
            merge_section!(merger, &source, "api", result.api, config.api, [enabled, listen, port]);
            merge_section!(merger, &source, "push", result.push, config.push, [enabled, reconnect_secs]);
        }

        result.origins = merger.origins;
        (result, merger.diagnostics)
    }
}
