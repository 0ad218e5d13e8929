//! Benchmark configuration (`mergebench.toml`).
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Unknown keys are rejected with a line number.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default config file name, looked up in the current directory.
pub const CONFIG_FILE: &str = "mergebench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergebenchConfig {
    /// Repository discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Result cache and coordination settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Evaluation worker settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Merge tools to evaluate. Each `[[tools]]` entry is one tool
    /// configuration and contributes one cache key per candidate.
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

// ---------------------------------------------------------------------------
// DiscoveryConfig
// ---------------------------------------------------------------------------

/// Where clones and ledgers live.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Directory holding one clone per repository (default: `repos`).
    #[serde(default = "default_repos_dir")]
    pub repos_dir: PathBuf,

    /// Directory holding one candidate ledger per repository
    /// (default: `merges`).
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: PathBuf,

    /// Clone URL with `{owner}` and `{name}` placeholders.
    #[serde(default = "default_clone_url_template")]
    pub clone_url_template: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            repos_dir: default_repos_dir(),
            ledger_dir: default_ledger_dir(),
            clone_url_template: default_clone_url_template(),
        }
    }
}

fn default_repos_dir() -> PathBuf {
    PathBuf::from("repos")
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("merges")
}

fn default_clone_url_template() -> String {
    "https://github.com/{owner}/{name}.git".to_owned()
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Store location and lock policy.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Store root, usually a directory synchronised between machines
    /// (default: `cache`).
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,

    /// Age after which a lock or placeholder is presumed abandoned
    /// (default: 7200 seconds).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Lock acquisition attempts before a key is skipped for this pass.
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// First backoff delay between acquisition attempts.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl CacheConfig {
    /// The staleness threshold as a [`Duration`].
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            stale_after_secs: default_stale_after_secs(),
            acquire_attempts: default_acquire_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("cache")
}

const fn default_stale_after_secs() -> u64 {
    2 * 60 * 60
}

const fn default_acquire_attempts() -> u32 {
    5
}

const fn default_backoff_base_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    120_000
}

// ---------------------------------------------------------------------------
// EvaluationConfig
// ---------------------------------------------------------------------------

/// How a single work item is evaluated.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationConfig {
    /// Scratch directory for per-item working copies (default: `.workdir`).
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// Wall-clock limit for one merge tool invocation.
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,

    /// Wall-clock limit for one test attempt.
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// Test script, invoked as `<test_command> <workdir>`.
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Test attempts per merge; the first pass wins.
    #[serde(default = "default_test_attempts")]
    pub test_attempts: u32,
}

impl EvaluationConfig {
    /// The merge timeout as a [`Duration`].
    #[must_use]
    pub const fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    /// The per-attempt test timeout as a [`Duration`].
    #[must_use]
    pub const fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            merge_timeout_secs: default_merge_timeout_secs(),
            test_timeout_secs: default_test_timeout_secs(),
            test_command: default_test_command(),
            test_attempts: default_test_attempts(),
        }
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".workdir")
}

const fn default_merge_timeout_secs() -> u64 {
    15 * 60
}

const fn default_test_timeout_secs() -> u64 {
    45 * 60
}

fn default_test_command() -> String {
    "src/scripts/tester.sh".to_owned()
}

const fn default_test_attempts() -> u32 {
    5
}

// ---------------------------------------------------------------------------
// ToolConfig
// ---------------------------------------------------------------------------

/// One merge tool under evaluation.
///
/// ```toml
/// [[tools]]
/// name = "gitmerge-ort"
/// command = "src/scripts/merge_tools/gitmerge_ort.sh"
/// config = "ort"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Tool identifier, part of the cache key.
    pub name: String,

    /// Merge script, invoked as `<command> <workdir> <left> <right>`.
    pub command: String,

    /// Free-form configuration string, part of the cache key. Two entries
    /// with the same name and different configs are distinct tools.
    #[serde(default)]
    pub config: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl MergebenchConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found), parse
    /// errors, or an invalid tool list.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or duplicate
    /// `(name, config)` tool pairs.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, tool) in self.tools.iter().enumerate() {
            if tool.name.trim().is_empty() {
                return Err(ConfigError {
                    path: None,
                    message: format!("tools[{i}]: name must not be empty"),
                });
            }
            if self.tools[..i]
                .iter()
                .any(|t| t.name == tool.name && t.config == tool.config)
            {
                return Err(ConfigError {
                    path: None,
                    message: format!(
                        "tools[{i}]: duplicate tool '{}' with config '{}'",
                        tool.name, tool.config
                    ),
                });
            }
        }
        if self.evaluation.test_attempts == 0 {
            return Err(ConfigError {
                path: None,
                message: "evaluation.test_attempts must be at least 1".to_owned(),
            });
        }
        if self.cache.stale_after_secs == 0 {
            return Err(ConfigError {
                path: None,
                message: "cache.stale_after_secs must be at least 1".to_owned(),
            });
        }
        if self.cache.acquire_attempts == 0 {
            return Err(ConfigError {
                path: None,
                message: "cache.acquire_attempts must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
