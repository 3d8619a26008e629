use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::ReentrantMutex;
use thiserror::Error;

mod diagnostics;
mod logging;
mod validation;

pub use diagnostics::{ConfigDiagnostics, ConfigWarning};
pub use logging::{global_log_buffer, init_tracing, LogBuffer};

/// Top-level Tether configuration (`tether.toml`).
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// ```toml
/// [logging]
/// level = "tether=debug"
///
/// [debugger]
/// stop_timeout_ms = 10000
/// dispatch_thread_prefixes = ["AWT-EventQueue"]
///
/// [hot_swap]
/// redefinition_chunk_size = 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub debugger: DebuggerConfig,

    #[serde(default)]
    pub hot_swap: HotSwapConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Simple level (`info`, `debug`, ...) or a full `EnvFilter` directive
    /// string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr (in addition to the in-memory buffer).
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path. If the file cannot be opened, file
    /// logging is disabled while other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Number of log lines kept in memory.
    #[serde(default = "LoggingConfig::default_buffer_lines")]
    pub buffer_lines: usize,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn default_buffer_lines() -> usize {
        2_000
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    pub(crate) fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective `EnvFilter`: `level` merged with `RUST_LOG` when set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
            buffer_lines: Self::default_buffer_lines(),
        }
    }
}

/// Debugger session and debug process tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerConfig {
    /// Upper bound on waiting for a debug process to stop when its OS
    /// process terminates.
    #[serde(default = "DebuggerConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Delay between `is_suspended` polls while resolving the thread to show
    /// after a pause request.
    #[serde(default = "DebuggerConfig::default_suspend_poll_interval_ms")]
    pub suspend_poll_interval_ms: u64,

    #[serde(default = "DebuggerConfig::default_suspend_poll_max_attempts")]
    pub suspend_poll_max_attempts: u32,

    /// Debounce delay for thread list refresh notifications.
    #[serde(default = "DebuggerConfig::default_threads_refresh_delay_ms")]
    pub threads_refresh_delay_ms: u64,

    /// Let breakpoints hit while an evaluation is in progress take over the
    /// displayed context.
    #[serde(default)]
    pub breakpoints_during_evaluation: bool,

    /// Thread name prefixes preferred when a pause has no event thread.
    #[serde(default = "DebuggerConfig::default_dispatch_thread_prefixes")]
    pub dispatch_thread_prefixes: Vec<String>,
}

impl DebuggerConfig {
    fn default_stop_timeout_ms() -> u64 {
        10_000
    }

    fn default_suspend_poll_interval_ms() -> u64 {
        10
    }

    fn default_suspend_poll_max_attempts() -> u32 {
        500
    }

    fn default_threads_refresh_delay_ms() -> u64 {
        100
    }

    fn default_dispatch_thread_prefixes() -> Vec<String> {
        vec!["AWT-EventQueue".to_owned()]
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn suspend_poll_interval(&self) -> Duration {
        Duration::from_millis(self.suspend_poll_interval_ms)
    }

    pub fn threads_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.threads_refresh_delay_ms)
    }

    pub fn is_dispatch_thread(&self, thread_name: &str) -> bool {
        self.dispatch_thread_prefixes
            .iter()
            .any(|prefix| thread_name.starts_with(prefix.as_str()))
    }
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            suspend_poll_interval_ms: Self::default_suspend_poll_interval_ms(),
            suspend_poll_max_attempts: Self::default_suspend_poll_max_attempts(),
            threads_refresh_delay_ms: Self::default_threads_refresh_delay_ms(),
            breakpoints_during_evaluation: false,
            dispatch_thread_prefixes: Self::default_dispatch_thread_prefixes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotSwapConfig {
    /// Maximum number of classes sent in one redefinition request.
    #[serde(default = "HotSwapConfig::default_redefinition_chunk_size")]
    pub redefinition_chunk_size: usize,

    /// Disable all breakpoints of a debug process while its classes are
    /// redefined.
    #[serde(default = "HotSwapConfig::default_reload_with_breakpoints_disabled")]
    pub reload_with_breakpoints_disabled: bool,
}

impl HotSwapConfig {
    fn default_redefinition_chunk_size() -> usize {
        100
    }

    fn default_reload_with_breakpoints_disabled() -> bool {
        true
    }
}

impl Default for HotSwapConfig {
    fn default() -> Self {
        Self {
            redefinition_chunk_size: Self::default_redefinition_chunk_size(),
            reload_with_breakpoints_disabled: Self::default_reload_with_breakpoints_disabled(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a source snippet; keep just the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl TetherConfig {
    /// Load a config file from TOML. Invalid values are replaced by defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = read_config(path)?;
        let mut config: TetherConfig = toml::from_str(&text)?;
        config.normalize();
        Ok(config)
    }

    /// Load a config file from TOML and return diagnostics.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let text = read_config(path.as_ref())?;
        Self::load_from_str_with_diagnostics(&text)
    }

    /// Load a config from a TOML string and return diagnostics (unknown keys
    /// and invalid values, which are replaced by their defaults).
    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (mut config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<TetherConfig>(text)?;

        let diagnostics = ConfigDiagnostics {
            unknown_keys,
            warnings: config.validate(),
        };
        config.normalize();

        for key in &diagnostics.unknown_keys {
            tracing::warn!(target: "tether.config", key = %key, "unknown config key");
        }

        Ok((config, diagnostics))
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

pub const TETHER_CONFIG_ENV_VAR: &str = "TETHER_CONFIG_PATH";

static CONFIG_ENV_LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();

fn config_env_lock() -> &'static ReentrantMutex<()> {
    CONFIG_ENV_LOCK.get_or_init(|| ReentrantMutex::new(()))
}

/// Run `f` while holding the config environment lock.
///
/// Tests that temporarily set [`TETHER_CONFIG_ENV_VAR`] wrap the mutation
/// and the discovery call in this helper so concurrent discovery does not
/// observe the override.
pub fn with_config_env_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = config_env_lock().lock();
    f()
}

/// Discover the Tether configuration file for a workspace root.
///
/// Search order:
/// 1) `TETHER_CONFIG_PATH` (absolute or relative to `workspace_root`)
/// 2) `tether.toml` in `workspace_root`
/// 3) `.tether.toml` in `workspace_root`
/// 4) `.tether/config.toml` in `workspace_root`
pub fn discover_config_path(workspace_root: &Path) -> Option<PathBuf> {
    let _guard = config_env_lock().lock();
    if let Some(value) = std::env::var_os(TETHER_CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            workspace_root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }

    ["tether.toml", ".tether.toml", ".tether/config.toml"]
        .into_iter()
        .map(|name| workspace_root.join(name))
        .find(|path| path.is_file())
        .map(|path| path.canonicalize().unwrap_or(path))
}

/// Load the configuration for a workspace root, or the defaults (and `None`)
/// when no config file is present.
pub fn load_for_workspace(
    workspace_root: &Path,
) -> Result<(TetherConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(workspace_root) else {
        return Ok((TetherConfig::default(), None));
    };

    let config = TetherConfig::load_from_path(&path)?;
    Ok((config, Some(path)))
}
